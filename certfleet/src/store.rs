//! On-disk record of issued certificates.
//!
//! Layout under the store root, one directory per certificate:
//!
//! ```text
//! <root>/<name>/<name>.json   authoritative record
//! <root>/<name>/<name>.crt    chain, PEM
//! <root>/<name>/<name>.key    private key, PEM
//! ```
//!
//! Every file is replaced atomically and the JSON record is written last, so a
//! reader that goes through [`CertStore::load`] never sees a partial record.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use fs_err as fs;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info};
use x509_parser::prelude::Pem;

use crate::{cert_spec::CertificateSpec, error::StoreError};

/// A certificate previously issued for a [`CertificateSpec`].
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateRecord {
    pub name: String,
    pub sans: Vec<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub not_after: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub issued_at: OffsetDateTime,
    /// Certificate chain, PEM, leaf first.
    pub chain: String,
    /// Private key, PEM.
    pub private_key: String,
}

impl fmt::Debug for CertificateRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateRecord")
            .field("name", &self.name)
            .field("sans", &self.sans)
            .field("not_after", &self.not_after)
            .field("issued_at", &self.issued_at)
            .field("chain", &format_args!("<{} bytes>", self.chain.len()))
            .field("private_key", &"<redacted>")
            .finish()
    }
}

impl CertificateRecord {
    /// Build a record for a freshly issued chain, reading expiry from the leaf.
    pub fn from_issued(
        spec: &CertificateSpec,
        chain: String,
        private_key: String,
        issued_at: OffsetDateTime,
    ) -> Result<Self> {
        let not_after = chain_not_after(&chain)?;
        Ok(Self {
            name: spec.name().to_string(),
            sans: spec.sans().to_vec(),
            not_after,
            issued_at,
            chain,
            private_key,
        })
    }
}

/// What to do for a spec given its existing record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Skip,
    Issue,
    Renew,
}

/// Decide whether `spec` needs a certificate.
///
/// A changed SAN set always means a fresh issuance, even when the existing
/// certificate is far from expiry.
pub fn needs_action(
    spec: &CertificateSpec,
    existing: Option<&CertificateRecord>,
    renewal_window_days: u32,
    now: OffsetDateTime,
) -> Action {
    let Some(record) = existing else {
        return Action::Issue;
    };
    let issued_sans: BTreeSet<&str> = record.sans.iter().map(String::as_str).collect();
    if spec.san_set() != issued_sans {
        debug!(cert = %spec.name(), "SAN set changed since last issuance");
        return Action::Issue;
    }
    let remaining = record.not_after - now;
    debug!(cert = %spec.name(), "will expire in {remaining}");
    if remaining <= time::Duration::days(renewal_window_days.into()) {
        Action::Renew
    } else {
        Action::Skip
    }
}

/// Directory of [`CertificateRecord`]s keyed by certificate name.
#[derive(Debug, Clone)]
pub struct CertStore {
    root: PathBuf,
}

impl CertStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn record_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn record_path(&self, name: &str) -> PathBuf {
        self.record_dir(name).join(format!("{name}.json"))
    }

    pub fn cert_path(&self, name: &str) -> PathBuf {
        self.record_dir(name).join(format!("{name}.crt"))
    }

    pub fn key_path(&self, name: &str) -> PathBuf {
        self.record_dir(name).join(format!("{name}.key"))
    }

    /// Load every record in the store. A missing store is an empty one.
    pub fn load(&self) -> Result<BTreeMap<String, CertificateRecord>, StoreError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(err) => return Err(corrupt(&self.root, err)),
        };
        let mut records = BTreeMap::new();
        for entry in entries {
            let entry = entry.map_err(|err| corrupt(&self.root, err))?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if let Some(record) = self.load_one(name)? {
                records.insert(record.name.clone(), record);
            }
        }
        debug!(count = records.len(), root = %self.root.display(), "loaded certificate records");
        Ok(records)
    }

    /// Load the record for `name`, if one was ever saved.
    pub fn load_one(&self, name: &str) -> Result<Option<CertificateRecord>, StoreError> {
        let path = self.record_path(name);
        let content = match fs::read(&path) {
            Ok(content) => content,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(corrupt(&path, err)),
        };
        let record: CertificateRecord =
            serde_json::from_slice(&content).map_err(|err| corrupt(&path, err))?;
        if record.name != name {
            return Err(StoreError::Corrupt {
                path,
                reason: format!("record is for '{}'", record.name),
            });
        }
        Ok(Some(record))
    }

    /// Atomically replace the stored record for `record.name`.
    pub fn save(&self, record: &CertificateRecord) -> Result<(), StoreError> {
        self.save_inner(record)
            .map_err(|source| StoreError::Persist {
                name: record.name.clone(),
                source,
            })?;
        info!(cert = %record.name, not_after = %record.not_after, "stored certificate");
        Ok(())
    }

    fn save_inner(&self, record: &CertificateRecord) -> Result<()> {
        let name = &record.name;
        let dir = self.record_dir(name);
        fs::create_dir_all(&dir).context("failed to create certificate directory")?;
        restrict_permissions(&dir, 0o700)?;

        safe_write::safe_write(self.cert_path(name), &record.chain)
            .context("failed to write certificate chain")?;
        let key_path = self.key_path(name);
        safe_write::safe_write(&key_path, &record.private_key)
            .context("failed to write private key")?;
        restrict_permissions(&key_path, 0o600)?;

        let encoded = serde_json::to_vec_pretty(record).context("failed to encode record")?;
        safe_write::safe_write(self.record_path(name), encoded)
            .context("failed to write certificate record")?;
        restrict_permissions(&self.record_path(name), 0o600)?;
        Ok(())
    }
}

fn corrupt(path: &Path, reason: impl fmt::Display) -> StoreError {
    StoreError::Corrupt {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

pub(crate) fn read_pem(cert_pem: &str) -> Result<Pem> {
    Pem::iter_from_buffer(cert_pem.as_bytes())
        .next()
        .transpose()
        .context("Invalid pem")?
        .context("no certificate in pem")
}

/// Expiry of the leaf (first) certificate in a PEM chain.
pub fn chain_not_after(chain_pem: &str) -> Result<OffsetDateTime> {
    let pem = read_pem(chain_pem)?;
    let cert = pem.parse_x509().context("Invalid x509 certificate")?;
    Ok(cert.validity().not_after.to_datetime())
}
