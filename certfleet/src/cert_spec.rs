//! Desired certificate list and its validation.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::Path,
};

use anyhow::{bail, Context, Result};
use fs_err as fs;

use crate::{error::ValidationError, zone::normalize_hostname, ZoneSet};

/// Upper bound on SANs per certificate imposed by the CA.
pub const MAX_SANS: usize = 100;

/// Desired state as read from disk: certificate name to SAN list.
pub type DesiredState = BTreeMap<String, Vec<String>>;

/// A certificate the operator wants to exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateSpec {
    name: String,
    sans: Vec<String>,
}

impl CertificateSpec {
    /// SANs are lowercased, stripped of a trailing dot and de-duplicated,
    /// keeping the first occurrence of each.
    pub fn new<S: AsRef<str>>(name: impl Into<String>, sans: impl IntoIterator<Item = S>) -> Self {
        let mut seen = BTreeSet::new();
        let sans = sans
            .into_iter()
            .map(|san| normalize_hostname(san.as_ref()))
            .filter(|san| seen.insert(san.clone()))
            .collect();
        Self {
            name: name.into(),
            sans,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sans(&self) -> &[String] {
        &self.sans
    }

    /// The SANs as an unordered set, for comparison with issued records.
    pub fn san_set(&self) -> BTreeSet<&str> {
        self.sans.iter().map(String::as_str).collect()
    }
}

/// Turn a loaded desired state into specs keyed by name.
pub fn specs_from_desired(desired: DesiredState) -> BTreeMap<String, CertificateSpec> {
    desired
        .into_iter()
        .map(|(name, sans)| (name.clone(), CertificateSpec::new(name, sans)))
        .collect()
}

pub fn load_desired_state(path: impl AsRef<Path>) -> Result<DesiredState> {
    let content = fs::read_to_string(path.as_ref())?;
    let desired: DesiredState = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse {}", path.as_ref().display()))?;
    if desired.is_empty() {
        bail!("must provide at least one certificate to issue in cert configuration");
    }
    Ok(desired)
}

pub fn save_desired_state(path: impl AsRef<Path>, desired: &DesiredState) -> Result<()> {
    let content = serde_json::to_vec_pretty(desired)?;
    safe_write::safe_write(path.as_ref(), content)
        .with_context(|| format!("failed to write {}", path.as_ref().display()))?;
    Ok(())
}

/// `^[A-Za-z][A-Za-z0-9_-]*$`
pub fn is_valid_cert_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Check every spec and return all violations found.
///
/// An empty result means the whole list may be processed.
pub fn validate<P>(
    specs: &BTreeMap<String, CertificateSpec>,
    zones: &ZoneSet<P>,
) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    for spec in specs.values() {
        let name = spec.name();
        if !is_valid_cert_name(name) {
            errors.push(ValidationError::InvalidName { name: name.into() });
        }
        if spec.sans().is_empty() {
            errors.push(ValidationError::NoSans { name: name.into() });
        }
        if spec.sans().len() > MAX_SANS {
            errors.push(ValidationError::TooManySans {
                name: name.into(),
                count: spec.sans().len(),
                max: MAX_SANS,
            });
        }
        for san in spec.sans() {
            if let Err(source) = zones.resolve(san) {
                errors.push(ValidationError::Unresolvable {
                    name: name.into(),
                    source,
                });
            }
        }
    }
    errors
}
