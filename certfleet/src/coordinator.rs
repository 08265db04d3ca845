//! Reconciles the desired certificates against the store, one certificate at
//! a time and independently of each other.

use std::{collections::BTreeMap, fmt, time::Duration};

use futures::stream::{self, StreamExt};
use time::OffsetDateTime;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::{
    acme_client::AcmeApi,
    cert_spec::CertificateSpec,
    dns01_client::Dns01Api,
    error::{HookError, OutcomeError},
    hook::HookDispatcher,
    issuer::{IssuePolicy, Issuer},
    store::{needs_action, Action, CertStore, CertificateRecord},
    zone::ZoneSet,
};

#[derive(Debug, Clone, bon::Builder)]
pub struct RunConfig {
    /// Renew certificates with this many days or fewer remaining.
    #[builder(default = 15)]
    pub renewal_window_days: u32,
    /// Deadline for the whole run. Issuances still in flight when it passes fail.
    #[builder(default = Duration::from_secs(3600))]
    pub run_timeout: Duration,
    /// Certificates processed at the same time.
    #[builder(default = 4)]
    pub concurrency: usize,
    #[builder(default)]
    pub issue: IssuePolicy,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeAction {
    Skipped,
    Issued,
    Renewed,
    Failed,
}

impl fmt::Display for OutcomeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Skipped => "skipped",
            Self::Issued => "issued",
            Self::Renewed => "renewed",
            Self::Failed => "failed",
        })
    }
}

/// Result of processing one certificate.
#[derive(Debug)]
pub struct RunOutcome {
    pub name: String,
    pub action: OutcomeAction,
    pub error: Option<OutcomeError>,
    /// Hook failure after a successful issuance.
    pub warning: Option<HookError>,
}

impl RunOutcome {
    fn done(name: &str, action: OutcomeAction) -> Self {
        Self {
            name: name.to_string(),
            action,
            error: None,
            warning: None,
        }
    }

    fn failed(name: &str, error: OutcomeError) -> Self {
        Self {
            name: name.to_string(),
            action: OutcomeAction::Failed,
            error: Some(error),
            warning: None,
        }
    }
}

/// Outcomes of one run, sorted by certificate name.
#[derive(Debug, Default)]
pub struct RunReport {
    outcomes: Vec<RunOutcome>,
}

impl RunReport {
    pub fn outcomes(&self) -> &[RunOutcome] {
        &self.outcomes
    }

    pub fn into_outcomes(self) -> Vec<RunOutcome> {
        self.outcomes
    }

    pub fn get(&self, name: &str) -> Option<&RunOutcome> {
        self.outcomes
            .binary_search_by(|outcome| outcome.name.as_str().cmp(name))
            .ok()
            .map(|index| &self.outcomes[index])
    }

    pub fn count(&self, action: OutcomeAction) -> usize {
        self.outcomes.iter().filter(|o| o.action == action).count()
    }

    pub fn has_failures(&self) -> bool {
        self.count(OutcomeAction::Failed) > 0
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} issued, {} renewed, {} skipped, {} failed",
            self.count(OutcomeAction::Issued),
            self.count(OutcomeAction::Renewed),
            self.count(OutcomeAction::Skipped),
            self.count(OutcomeAction::Failed),
        )
    }
}

/// What a run would do for each spec, without doing it.
pub fn plan(
    specs: &BTreeMap<String, CertificateSpec>,
    existing: &BTreeMap<String, CertificateRecord>,
    renewal_window_days: u32,
) -> Vec<(String, Action)> {
    let now = OffsetDateTime::now_utc();
    specs
        .values()
        .map(|spec| {
            let action = needs_action(spec, existing.get(spec.name()), renewal_window_days, now);
            (spec.name().to_string(), action)
        })
        .collect()
}

pub struct Coordinator<A, P> {
    acme: A,
    zones: ZoneSet<P>,
    store: CertStore,
    hook: HookDispatcher,
    config: RunConfig,
}

impl<A: AcmeApi, P: Dns01Api> Coordinator<A, P> {
    pub fn new(
        acme: A,
        zones: ZoneSet<P>,
        store: CertStore,
        hook: HookDispatcher,
        config: RunConfig,
    ) -> Self {
        Self {
            acme,
            zones,
            store,
            hook,
            config,
        }
    }

    pub fn acme(&self) -> &A {
        &self.acme
    }

    pub fn zones(&self) -> &ZoneSet<P> {
        &self.zones
    }

    pub fn store(&self) -> &CertStore {
        &self.store
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Process every spec and report one outcome per certificate.
    ///
    /// `specs` must already have passed [`validate`](crate::validate).
    pub async fn run(
        &self,
        specs: &BTreeMap<String, CertificateSpec>,
        existing: &BTreeMap<String, CertificateRecord>,
    ) -> RunReport {
        let deadline = Instant::now() + self.config.run_timeout;
        let now = OffsetDateTime::now_utc();
        let this = self;
        let mut outcomes = stream::iter(specs.values())
            .map(move |spec| async move {
                this.process(spec, existing.get(spec.name()), now, deadline)
                    .await
            })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect::<Vec<_>>()
            .await;
        outcomes.sort_by(|a, b| a.name.cmp(&b.name));
        let report = RunReport { outcomes };
        info!("certificate run finished: {report}");
        report
    }

    async fn process(
        &self,
        spec: &CertificateSpec,
        existing: Option<&CertificateRecord>,
        now: OffsetDateTime,
        deadline: Instant,
    ) -> RunOutcome {
        let name = spec.name();
        let done = match needs_action(spec, existing, self.config.renewal_window_days, now) {
            Action::Skip => {
                info!(cert = %name, "certificate is up to date");
                return RunOutcome::done(name, OutcomeAction::Skipped);
            }
            Action::Issue => OutcomeAction::Issued,
            Action::Renew => OutcomeAction::Renewed,
        };

        if Instant::now() >= deadline {
            warn!(cert = %name, "run deadline passed before issuance started");
            return RunOutcome::failed(name, OutcomeError::Timeout);
        }
        let issuer =
            Issuer::new(&self.acme, &self.zones, &self.config.issue).with_deadline(deadline);
        let record = match issuer.issue(spec).await {
            Ok(record) => record,
            Err(err) => {
                error!(cert = %name, "failed to obtain certificate: {err:?}");
                return RunOutcome::failed(name, err.into());
            }
        };

        if let Err(err) = self.store.save(&record) {
            error!(cert = %name, "failed to store certificate: {err:?}");
            return RunOutcome::failed(name, err.into());
        }
        info!(cert = %name, "certificate {done}, expires {}", record.not_after);

        let mut outcome = RunOutcome::done(name, done);
        if let Err(err) = self.hook.notify(name).await {
            warn!(cert = %name, "hook failed: {err}");
            outcome.warning = Some(err);
        }
        outcome
    }
}
