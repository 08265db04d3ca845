//! Drives one certificate through order, DNS-01 authorization, finalization
//! and download.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use hickory_resolver::{error::ResolveErrorKind, AsyncResolver};
use rcgen::{CertificateParams, DistinguishedName, KeyPair};
use time::OffsetDateTime;
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, error, info};

use crate::{
    acme_client::{AcmeApi, AuthorizationState, AuthorizationStatus, OrderStatus},
    cert_spec::CertificateSpec,
    dns01_client::Dns01Api,
    error::IssueError,
    retry::{with_retry, RetryPolicy},
    store::CertificateRecord,
    zone::{challenge_record_name, Zone, ZoneSet},
};

/// Retry and polling knobs for one issuance.
#[derive(Debug, Clone, bon::Builder)]
pub struct IssuePolicy {
    /// Budget for transient ACME failures (rate limits, network errors).
    #[builder(default)]
    pub retry: RetryPolicy,
    /// Budget for polling authorization, order and certificate status.
    #[builder(default = RetryPolicy::builder()
        .max_attempts(10)
        .initial_delay(Duration::from_secs(2))
        .build())]
    pub poll: RetryPolicy,
    /// Wait until challenge records are visible through the system resolver
    /// before asking the server to validate them.
    #[builder(default = true)]
    pub check_dns: bool,
}

impl Default for IssuePolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// A pending authorization with its challenge published.
struct Authorization<'z, P> {
    san: String,
    challenge_url: String,
    dns_value: String,
    record_name: String,
    zone: &'z Zone<P>,
}

struct PublishedRecord<'z, P> {
    zone: &'z Zone<P>,
    record_name: String,
    record_id: String,
}

pub struct Issuer<'a, A, P> {
    acme: &'a A,
    zones: &'a ZoneSet<P>,
    policy: &'a IssuePolicy,
    deadline: Option<Instant>,
}

impl<'a, A: AcmeApi, P: Dns01Api> Issuer<'a, A, P> {
    pub fn new(acme: &'a A, zones: &'a ZoneSet<P>, policy: &'a IssuePolicy) -> Self {
        Self {
            acme,
            zones,
            policy,
            deadline: None,
        }
    }

    /// Abandon the issuance with [`IssueError::Timeout`] once `deadline` passes.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Obtain a new certificate for `spec` with a freshly generated key.
    ///
    /// Challenge records published along the way are removed before
    /// returning, whatever the outcome, the deadline included.
    pub async fn issue(&self, spec: &CertificateSpec) -> Result<CertificateRecord, IssueError> {
        info!(cert = %spec.name(), "requesting certificate for {}", spec.sans().join(", "));
        let mut published = Vec::new();
        let inner = self.issue_inner(spec, &mut published);
        let result = match self.deadline {
            Some(deadline) => timeout_at(deadline, inner)
                .await
                .unwrap_or(Err(IssueError::Timeout)),
            None => inner.await,
        };
        for record in &published {
            debug!("removing dns record {}", record.record_name);
            if let Err(err) = record.zone.remove_challenge(&record.record_id).await {
                error!(
                    zone = %record.zone.domain(),
                    "failed to remove dns record {}: {err:?}",
                    record.record_name
                );
            }
        }
        result
    }

    async fn issue_inner(
        &self,
        spec: &CertificateSpec,
        published: &mut Vec<PublishedRecord<'a, P>>,
    ) -> Result<CertificateRecord, IssueError> {
        let acme = self.acme;
        let sans = spec.sans();
        let order = with_retry(&self.policy.retry, "create order", move || async move {
            acme.new_order(sans).await.map_err(IssueError::from)
        })
        .await?;

        let pending = self.authorize(&order, published).await?;
        if !pending.is_empty() {
            if self.policy.check_dns {
                let expected = pending
                    .iter()
                    .map(|authz| (authz.record_name.as_str(), authz.dns_value.as_str()))
                    .collect::<Vec<_>>();
                check_dns(&expected, &self.policy.poll)
                    .await
                    .map_err(IssueError::Propagation)?;
            }
            for authz in &pending {
                debug!(san = %authz.san, zone = %authz.zone.domain(), "setting challenge ready");
                let url = authz.challenge_url.as_str();
                let order = &order;
                with_retry(&self.policy.retry, "set challenge ready", move || async move {
                    acme.set_challenge_ready(order, url)
                        .await
                        .map_err(IssueError::from)
                })
                .await?;
            }
            self.wait_for_validation(&order).await?;
        }

        let key = KeyPair::generate().map_err(|err| IssueError::Certificate(err.into()))?;
        let csr = make_csr(&key, sans).map_err(IssueError::Certificate)?;
        self.finalize(&order, &csr).await?;
        let chain = self.download_certificate(&order).await?;
        CertificateRecord::from_issued(spec, chain, key.serialize_pem(), OffsetDateTime::now_utc())
            .map_err(IssueError::Certificate)
    }

    async fn fetch_authorizations(
        &self,
        order: &A::Order,
    ) -> Result<Vec<AuthorizationState>, IssueError> {
        let acme = self.acme;
        with_retry(&self.policy.retry, "get authorizations", move || async move {
            acme.authorizations(order).await.map_err(IssueError::from)
        })
        .await
    }

    /// Publish a challenge record for every pending authorization.
    async fn authorize(
        &self,
        order: &A::Order,
        published: &mut Vec<PublishedRecord<'a, P>>,
    ) -> Result<Vec<Authorization<'a, P>>, IssueError> {
        let zones: &'a ZoneSet<P> = self.zones;
        let mut pending = Vec::new();
        for authz in self.fetch_authorizations(order).await? {
            match authz.status {
                AuthorizationStatus::Pending => {}
                AuthorizationStatus::Valid => {
                    debug!(san = %authz.identifier, "authorization already valid");
                    continue;
                }
                AuthorizationStatus::Invalid => return Err(authorization_failed(authz)),
            }
            let Some(challenge) = authz.dns01 else {
                return Err(IssueError::Acme(format!(
                    "no dns-01 challenge offered for '{}'",
                    authz.identifier
                )));
            };
            let zone = zones.resolve(&authz.identifier)?;
            let record_name = challenge_record_name(&authz.identifier);
            debug!(san = %authz.identifier, zone = %zone.domain(), "publishing dns-01 challenge");
            let record_id = zone
                .publish_challenge(&record_name, &challenge.dns_value)
                .await
                .map_err(|source| IssueError::Provider {
                    zone: zone.domain().to_string(),
                    san: authz.identifier.clone(),
                    source,
                })?;
            published.push(PublishedRecord {
                zone,
                record_name: record_name.clone(),
                record_id,
            });
            pending.push(Authorization {
                san: authz.identifier,
                challenge_url: challenge.url,
                dns_value: challenge.dns_value,
                record_name,
                zone,
            });
        }
        Ok(pending)
    }

    /// Poll until every authorization is valid. An invalid one ends the wait.
    async fn wait_for_validation(&self, order: &A::Order) -> Result<(), IssueError> {
        let poll = &self.policy.poll;
        let mut attempt = 1;
        loop {
            let mut waiting_on = None;
            for authz in self.fetch_authorizations(order).await? {
                match authz.status {
                    AuthorizationStatus::Valid => {}
                    AuthorizationStatus::Pending => {
                        waiting_on.get_or_insert(authz.identifier);
                    }
                    AuthorizationStatus::Invalid => return Err(authorization_failed(authz)),
                }
            }
            let Some(san) = waiting_on else {
                return Ok(());
            };
            if attempt >= poll.max_attempts {
                return Err(IssueError::ValidationStalled {
                    san,
                    attempts: attempt,
                });
            }
            let delay = poll.delay_after(attempt);
            debug!(attempt, san = %san, "authorization pending, waiting {delay:?}");
            sleep(delay).await;
            attempt += 1;
        }
    }

    async fn finalize(&self, order: &A::Order, csr: &[u8]) -> Result<(), IssueError> {
        let acme = self.acme;
        let poll = &self.policy.poll;
        let mut finalized = false;
        let mut attempt = 1;
        loop {
            let status = with_retry(&self.policy.retry, "refresh order", move || async move {
                acme.order_status(order).await.map_err(IssueError::from)
            })
            .await?;
            match status {
                // To upload CSR
                OrderStatus::Ready if !finalized => {
                    debug!("order is ready, uploading CSR");
                    with_retry(&self.policy.retry, "finalize order", move || async move {
                        acme.finalize(order, csr).await.map_err(IssueError::from)
                    })
                    .await?;
                    finalized = true;
                    continue;
                }
                // Certificate is ready
                OrderStatus::Valid => return Ok(()),
                // Something went wrong
                OrderStatus::Invalid => return Err(IssueError::Acme("order is invalid".into())),
                OrderStatus::Pending | OrderStatus::Ready | OrderStatus::Processing => {}
            }
            if attempt >= poll.max_attempts {
                return Err(IssueError::Acme(format!(
                    "order still {status:?} after {attempt} polls"
                )));
            }
            let delay = poll.delay_after(attempt);
            debug!(attempt, "order is {status:?}, waiting {delay:?}");
            sleep(delay).await;
            attempt += 1;
        }
    }

    async fn download_certificate(&self, order: &A::Order) -> Result<String, IssueError> {
        let acme = self.acme;
        let poll = &self.policy.poll;
        let mut attempt = 1;
        loop {
            let chain = with_retry(&self.policy.retry, "get certificate", move || async move {
                acme.certificate(order).await.map_err(IssueError::from)
            })
            .await?;
            if let Some(chain) = chain {
                return Ok(chain);
            }
            if attempt >= poll.max_attempts {
                return Err(IssueError::Acme("failed to get certificate".into()));
            }
            sleep(poll.delay_after(attempt)).await;
            attempt += 1;
        }
    }
}

fn authorization_failed(authz: AuthorizationState) -> IssueError {
    IssueError::AuthorizationFailed {
        san: authz.identifier,
        detail: authz
            .error
            .unwrap_or_else(|| "authorization is invalid".into()),
    }
}

fn make_csr(key: &KeyPair, names: &[String]) -> Result<Vec<u8>> {
    let mut params =
        CertificateParams::new(names).context("failed to create certificate params")?;
    params.distinguished_name = DistinguishedName::new();
    let csr = params
        .serialize_request(key)
        .context("failed to serialize certificate request")?;
    Ok(csr.der().as_ref().to_vec())
}

/// Self check the TXT records through the system resolver.
async fn check_dns(expected: &[(&str, &str)], policy: &RetryPolicy) -> Result<()> {
    let mut unsettled = expected.to_vec();
    let mut attempt = 1;
    loop {
        sleep(policy.delay_after(attempt)).await;

        let dns_resolver =
            AsyncResolver::tokio_from_system_conf().context("failed to create dns resolver")?;

        let mut still_missing = Vec::new();
        for (name, value) in unsettled {
            let settled = match dns_resolver.txt_lookup(name).await {
                Ok(record) => record.iter().any(|txt| txt.to_string() == value),
                Err(err) => {
                    let ResolveErrorKind::NoRecordsFound { .. } = err.kind() else {
                        bail!("failed to lookup dns record {name}: {err}");
                    };
                    false
                }
            };
            if !settled {
                still_missing.push((name, value));
            }
        }
        let Some((name, _)) = still_missing.first() else {
            return Ok(());
        };
        if attempt >= policy.max_attempts {
            bail!("dns record {name} not found");
        }
        debug!(attempt, domain = name, "challenge not found, retrying");
        unsettled = still_missing;
        attempt += 1;
    }
}
