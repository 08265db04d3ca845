use std::{collections::BTreeMap, io::ErrorKind, path::PathBuf, time::Duration};

use anyhow::{bail, ensure, Context, Result};
use fs_err as fs;
use tracing::{error, info};

use crate::{
    acme_client::{directory_url, AcmeApi, AcmeClient},
    cert_spec::{validate, CertificateSpec},
    coordinator::{plan, Coordinator, RunConfig, RunReport},
    dns01_client::{Dns01Api, Dns01Client},
    error::ValidationError,
    hook::HookDispatcher,
    issuer::IssuePolicy,
    retry::RetryPolicy,
    store::{Action, CertificateRecord},
    workdir::WorkDir,
    zone::ZoneSet,
};

#[allow(clippy::duplicated_attributes)]
#[derive(Clone, Debug, bon::Builder)]
#[builder(on(String, into))]
#[builder(on(PathBuf, into))]
pub struct CertFleetConfig {
    /// ACME directory URL, or one of the `staging` / `live` aliases.
    acme_url: String,
    email: String,
    agree_tos: bool,
    #[builder(default = true)]
    auto_create_account: bool,
    workdir: PathBuf,
    #[builder(default = 15)]
    renewal_window_days: u32,
    #[builder(default = Duration::from_secs(3600))]
    run_timeout: Duration,
    #[builder(default = 4)]
    concurrency: usize,
    #[builder(default)]
    retry: RetryPolicy,
    #[builder(default = IssuePolicy::default().poll)]
    poll: RetryPolicy,
    #[builder(default = true)]
    check_dns: bool,
    renewed_hook: Option<String>,
}

impl CertFleetConfig {
    pub async fn build_fleet(&self, zones: ZoneSet) -> Result<CertFleet> {
        CertFleet::build(self.clone(), zones).await
    }

    pub fn workdir(&self) -> WorkDir {
        WorkDir::new(&self.workdir)
    }

    /// What a run would do, without an ACME account or any network access.
    pub fn check<P>(
        &self,
        zones: &ZoneSet<P>,
        specs: &BTreeMap<String, CertificateSpec>,
    ) -> Result<Vec<(String, Action)>> {
        ensure_valid(specs, zones)?;
        let existing = self
            .workdir()
            .cert_store()
            .load()
            .context("failed to load certificate store")?;
        Ok(plan(specs, &existing, self.renewal_window_days))
    }

    fn check_preconditions(&self) -> Result<()> {
        ensure!(
            self.agree_tos,
            "the ACME server's terms of service must be agreed to (agree_tos)"
        );
        ensure!(
            !self.email.trim().is_empty(),
            "a registration email is required"
        );
        Ok(())
    }

    fn run_config(&self) -> RunConfig {
        RunConfig::builder()
            .renewal_window_days(self.renewal_window_days)
            .run_timeout(self.run_timeout)
            .concurrency(self.concurrency)
            .issue(
                IssuePolicy::builder()
                    .retry(self.retry)
                    .poll(self.poll)
                    .check_dns(self.check_dns)
                    .build(),
            )
            .build()
    }
}

/// Keeps a fleet of certificates in line with the desired state.
pub struct CertFleet<A = AcmeClient, P = Dns01Client> {
    coordinator: Coordinator<A, P>,
    workdir: WorkDir,
}

impl CertFleet {
    /// Build a new `CertFleet`, loading or creating the ACME account.
    pub async fn build(config: CertFleetConfig, zones: ZoneSet) -> Result<Self> {
        config.check_preconditions()?;
        let workdir = config.workdir();
        let credentials_file = workdir.account_credentials_path();
        let acme_client = match fs::read_to_string(&credentials_file) {
            Ok(credentials) => AcmeClient::load(&credentials)
                .await
                .context("failed to load ACME account")?,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                if !config.auto_create_account {
                    return Err(e).context("credentials file not found");
                }
                info!("creating new ACME account");
                let client = AcmeClient::new_account(&directory_url(&config.acme_url), &config.email)
                    .await
                    .context("failed to create new account")?;
                let credentials = client
                    .dump_credentials()
                    .context("failed to dump credentials")?;
                fs::create_dir_all(workdir.workdir())
                    .context("failed to create work directory")?;
                safe_write::safe_write(&credentials_file, credentials)
                    .context("failed to write credentials")?;
                info!("created new ACME account: {}", client.account_id());
                client
            }
            Err(e) => {
                return Err(e).context("failed to read credentials file");
            }
        };
        Self::new(acme_client, zones, config)
    }

    /// Get the ACME account ID.
    pub fn account_id(&self) -> &str {
        self.coordinator.acme().account_id()
    }
}

impl<A: AcmeApi, P: Dns01Api> CertFleet<A, P> {
    /// Assemble a fleet around an already constructed ACME client.
    pub fn new(acme: A, zones: ZoneSet<P>, config: CertFleetConfig) -> Result<Self> {
        config.check_preconditions()?;
        let workdir = config.workdir();
        let coordinator = Coordinator::new(
            acme,
            zones,
            workdir.cert_store(),
            HookDispatcher::new(config.renewed_hook.clone()),
            config.run_config(),
        );
        Ok(Self {
            coordinator,
            workdir,
        })
    }

    pub fn workdir(&self) -> &WorkDir {
        &self.workdir
    }

    pub fn zones(&self) -> &ZoneSet<P> {
        self.coordinator.zones()
    }

    /// Check the desired certificates against the configured zones.
    pub fn validate(&self, specs: &BTreeMap<String, CertificateSpec>) -> Vec<ValidationError> {
        validate(specs, self.zones())
    }

    /// Load the records of previously issued certificates.
    pub fn existing(&self) -> Result<BTreeMap<String, CertificateRecord>> {
        Ok(self.coordinator.store().load()?)
    }

    /// Bring every certificate in `specs` up to date once.
    ///
    /// Fails without touching the network when `specs` does not validate or
    /// the store cannot be read. Per-certificate failures are reported in
    /// the returned [`RunReport`] instead.
    pub async fn run(&self, specs: &BTreeMap<String, CertificateSpec>) -> Result<RunReport> {
        ensure_valid(specs, self.zones())?;
        let existing = self.existing().context("failed to load certificate store")?;
        Ok(self.coordinator.run(specs, &existing).await)
    }
}

/// Fail with every violation when `specs` does not validate against `zones`.
fn ensure_valid<P>(specs: &BTreeMap<String, CertificateSpec>, zones: &ZoneSet<P>) -> Result<()> {
    let errors = validate(specs, zones);
    if errors.is_empty() {
        return Ok(());
    }
    for err in &errors {
        error!(cert = %err.name(), "{err}");
    }
    let details = errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ");
    bail!("{} invalid certificate spec(s): {details}", errors.len())
}

#[cfg(test)]
mod tests;
