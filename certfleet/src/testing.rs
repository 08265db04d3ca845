//! In-memory ACME server and DNS provider for tests.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::{bail, Result};
use rcgen::{CertificateParams, KeyPair};
use time::OffsetDateTime;

use crate::{
    acme_client::{
        AcmeApi, AuthorizationState, AuthorizationStatus, Dns01Challenge, OrderStatus,
    },
    dns01_client::{Dns01Api, Record},
    error::AcmeError,
    issuer::IssuePolicy,
    retry::RetryPolicy,
};

pub fn fast_policy() -> IssuePolicy {
    let fast = RetryPolicy::builder()
        .max_attempts(3)
        .initial_delay(Duration::from_millis(1))
        .max_delay(Duration::from_millis(5))
        .build();
    IssuePolicy::builder()
        .retry(fast)
        .poll(fast)
        .check_dns(false)
        .build()
}

/// Self-signed PEM chain and key covering `sans`, expiring at `not_after`.
pub fn self_signed_chain(sans: &[String], not_after: OffsetDateTime) -> (String, String) {
    let key = KeyPair::generate().unwrap();
    let mut params = CertificateParams::new(sans.to_vec()).unwrap();
    params.not_before = OffsetDateTime::now_utc() - time::Duration::days(1);
    params.not_after = not_after;
    let cert = params.self_signed(&key).unwrap();
    (cert.pem(), key.serialize_pem())
}

#[derive(Default)]
struct DnsState {
    records: Mutex<Vec<Record>>,
    next_id: AtomicUsize,
    fail_publish: AtomicBool,
    fail_remove: AtomicBool,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    added: Mutex<Vec<Record>>,
}

/// Shared handle to an in-memory zone's records.
#[derive(Clone, Default)]
pub struct MemoryDns {
    state: Arc<DnsState>,
}

impl MemoryDns {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_publish(&self) {
        self.state.fail_publish.store(true, Ordering::SeqCst);
    }

    pub fn fail_remove(&self) {
        self.state.fail_remove.store(true, Ordering::SeqCst);
    }

    pub fn records(&self) -> Vec<Record> {
        self.state.records.lock().unwrap().clone()
    }

    /// Every record ever added, including removed ones.
    pub fn added(&self) -> Vec<Record> {
        self.state.added.lock().unwrap().clone()
    }

    pub fn has_txt(&self, name: &str, content: &str) -> bool {
        self.records()
            .iter()
            .any(|r| r.r#type == "TXT" && r.name == name && r.content == content)
    }

    pub fn insert_txt(&self, name: &str, content: &str) {
        let id = format!("seed-{}", self.state.next_id.fetch_add(1, Ordering::SeqCst));
        self.state.records.lock().unwrap().push(Record {
            id,
            name: name.into(),
            content: content.into(),
            r#type: "TXT".into(),
        });
    }

    pub fn max_in_flight(&self) -> usize {
        self.state.max_in_flight.load(Ordering::SeqCst)
    }

    async fn enter(&self) {
        let now = self.state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.max_in_flight.fetch_max(now, Ordering::SeqCst);
        // Give other tasks a chance to overlap if nothing serializes them.
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    fn leave(&self) {
        self.state.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Dns01Api for MemoryDns {
    async fn add_txt_record(&self, domain: &str, content: &str) -> Result<String> {
        self.enter().await;
        let result = if self.state.fail_publish.load(Ordering::SeqCst) {
            Err(anyhow::anyhow!("provider refused record"))
        } else {
            let id = format!("rec-{}", self.state.next_id.fetch_add(1, Ordering::SeqCst));
            let record = Record {
                id: id.clone(),
                name: domain.into(),
                content: content.into(),
                r#type: "TXT".into(),
            };
            self.state.added.lock().unwrap().push(record.clone());
            self.state.records.lock().unwrap().push(record);
            Ok(id)
        };
        self.leave();
        result
    }

    async fn remove_record(&self, record_id: &str) -> Result<()> {
        if self.state.fail_remove.load(Ordering::SeqCst) {
            bail!("provider refused delete");
        }
        self.state
            .records
            .lock()
            .unwrap()
            .retain(|r| r.id != record_id);
        Ok(())
    }

    async fn get_records(&self, domain: &str) -> Result<Vec<Record>> {
        Ok(self
            .records()
            .into_iter()
            .filter(|r| r.name == domain)
            .collect())
    }
}

/// How the fake server treats the challenge for one SAN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SanBehavior {
    /// Validates if the expected TXT record is published.
    Valid,
    /// Already valid when the order is created.
    PreAuthorized,
    /// Rejected with the given detail.
    Invalid(String),
    /// Never leaves `pending`.
    Stall,
    /// Stays `pending` for the given number of status checks after the
    /// challenge is ready, then validates like `Valid`.
    SlowValid(u32),
}

pub struct FakeOrder {
    id: u32,
    sans: Vec<String>,
    checks: AtomicU32,
    ready: Mutex<BTreeSet<String>>,
    finalized: AtomicBool,
}

/// In-memory ACME server checking challenge records against [`MemoryDns`].
#[derive(Default)]
pub struct FakeAcme {
    dns: Vec<MemoryDns>,
    behavior: BTreeMap<String, SanBehavior>,
    transient_failures: AtomicU32,
    orders: AtomicU32,
}

impl FakeAcme {
    pub fn new(dns: Vec<MemoryDns>) -> Self {
        Self {
            dns,
            ..Default::default()
        }
    }

    pub fn with_behavior(mut self, san: &str, behavior: SanBehavior) -> Self {
        self.behavior.insert(san.into(), behavior);
        self
    }

    /// Fail the next `count` order creations with a rate limit.
    pub fn with_rate_limits(self, count: u32) -> Self {
        self.transient_failures.store(count, Ordering::SeqCst);
        self
    }

    pub fn orders_created(&self) -> u32 {
        self.orders.load(Ordering::SeqCst)
    }

    fn behavior(&self, san: &str) -> SanBehavior {
        self.behavior.get(san).cloned().unwrap_or(SanBehavior::Valid)
    }

    fn identifier(san: &str) -> String {
        san.strip_prefix("*.").unwrap_or(san).to_string()
    }

    fn dns_value(order: &FakeOrder, san: &str) -> String {
        format!("token-{}-for-{san}", order.id)
    }

    fn published(&self, order: &FakeOrder, san: &str) -> bool {
        let name = format!("_acme-challenge.{}", Self::identifier(san));
        let value = Self::dns_value(order, san);
        self.dns.iter().any(|dns| dns.has_txt(&name, &value))
    }

    fn status(&self, order: &FakeOrder, san: &str) -> (AuthorizationStatus, Option<String>) {
        let ready = order.ready.lock().unwrap().contains(san);
        match self.behavior(san) {
            SanBehavior::PreAuthorized => (AuthorizationStatus::Valid, None),
            _ if !ready => (AuthorizationStatus::Pending, None),
            SanBehavior::SlowValid(checks)
                if order.checks.fetch_add(1, Ordering::SeqCst) + 1 < checks =>
            {
                (AuthorizationStatus::Pending, None)
            }
            SanBehavior::Valid | SanBehavior::SlowValid(_) if self.published(order, san) => {
                (AuthorizationStatus::Valid, None)
            }
            SanBehavior::Valid | SanBehavior::SlowValid(_) => (
                AuthorizationStatus::Invalid,
                Some("no TXT record found".into()),
            ),
            SanBehavior::Invalid(detail) => (AuthorizationStatus::Invalid, Some(detail)),
            SanBehavior::Stall => (AuthorizationStatus::Pending, None),
        }
    }
}

impl AcmeApi for FakeAcme {
    type Order = FakeOrder;

    async fn new_order(&self, sans: &[String]) -> Result<FakeOrder, AcmeError> {
        let remaining = self.transient_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(AcmeError::RateLimited("too many new orders".into()));
        }
        let id = self.orders.fetch_add(1, Ordering::SeqCst);
        Ok(FakeOrder {
            id,
            sans: sans.to_vec(),
            checks: AtomicU32::new(0),
            ready: Mutex::new(BTreeSet::new()),
            finalized: AtomicBool::new(false),
        })
    }

    async fn authorizations(
        &self,
        order: &FakeOrder,
    ) -> Result<Vec<AuthorizationState>, AcmeError> {
        Ok(order
            .sans
            .iter()
            .map(|san| {
                let (status, error) = self.status(order, san);
                AuthorizationState {
                    identifier: Self::identifier(san),
                    status,
                    dns01: Some(Dns01Challenge {
                        url: format!("https://acme.test/chall/{san}"),
                        dns_value: Self::dns_value(order, san),
                    }),
                    error,
                }
            })
            .collect())
    }

    async fn set_challenge_ready(
        &self,
        order: &FakeOrder,
        challenge_url: &str,
    ) -> Result<(), AcmeError> {
        let Some(san) = challenge_url.strip_prefix("https://acme.test/chall/") else {
            return Err(AcmeError::Rejected(format!("unknown challenge {challenge_url}")));
        };
        order.ready.lock().unwrap().insert(san.to_string());
        Ok(())
    }

    async fn finalize(&self, order: &FakeOrder, csr_der: &[u8]) -> Result<(), AcmeError> {
        if csr_der.is_empty() {
            return Err(AcmeError::Rejected("empty CSR".into()));
        }
        order.finalized.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn order_status(&self, order: &FakeOrder) -> Result<OrderStatus, AcmeError> {
        let statuses = order
            .sans
            .iter()
            .map(|san| self.status(order, san).0)
            .collect::<Vec<_>>();
        Ok(if statuses.contains(&AuthorizationStatus::Invalid) {
            OrderStatus::Invalid
        } else if statuses.contains(&AuthorizationStatus::Pending) {
            OrderStatus::Pending
        } else if order.finalized.load(Ordering::SeqCst) {
            OrderStatus::Valid
        } else {
            OrderStatus::Ready
        })
    }

    async fn certificate(&self, order: &FakeOrder) -> Result<Option<String>, AcmeError> {
        if !order.finalized.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let not_after = OffsetDateTime::now_utc() + time::Duration::days(90);
        let (chain, _) = self_signed_chain(&order.sans, not_after);
        Ok(Some(chain))
    }
}
