use tempfile::TempDir;

use super::*;
use crate::{
    cert_spec::specs_from_desired,
    coordinator::OutcomeAction,
    testing::{fast_policy, FakeAcme, MemoryDns},
    Zone,
};

fn config(workdir: &TempDir, agree_tos: bool) -> CertFleetConfig {
    let fast = fast_policy();
    CertFleetConfig::builder()
        .acme_url("staging")
        .email("ops@example.com")
        .agree_tos(agree_tos)
        .workdir(workdir.path())
        .retry(fast.retry)
        .poll(fast.poll)
        .check_dns(false)
        .build()
}

fn fleet(workdir: &TempDir, dns: &MemoryDns) -> CertFleet<FakeAcme, MemoryDns> {
    let zones = ZoneSet::new([Zone::new("example.com", dns.clone())]);
    CertFleet::new(
        FakeAcme::new(vec![dns.clone()]),
        zones,
        config(workdir, true),
    )
    .unwrap()
}

fn desired(entries: &[(&str, &[&str])]) -> BTreeMap<String, CertificateSpec> {
    specs_from_desired(
        entries
            .iter()
            .map(|(name, sans)| {
                (
                    name.to_string(),
                    sans.iter().map(|s| s.to_string()).collect(),
                )
            })
            .collect(),
    )
}

#[test]
fn terms_of_service_must_be_agreed() {
    let dir = TempDir::new().unwrap();
    let err = CertFleet::new(
        FakeAcme::new(vec![]),
        ZoneSet::<MemoryDns>::new([]),
        config(&dir, false),
    )
    .err()
    .unwrap();
    assert!(err.to_string().contains("terms of service"), "{err}");
}

#[tokio::test]
async fn account_is_not_created_without_email() {
    let dir = TempDir::new().unwrap();
    let config = CertFleetConfig::builder()
        .acme_url("staging")
        .email(" ")
        .agree_tos(true)
        .workdir(dir.path())
        .build();
    let err = CertFleet::build(config, ZoneSet::new([])).await.err().unwrap();
    assert!(err.to_string().contains("email"), "{err}");
    assert!(!dir.path().join("credentials.json").exists());
}

#[tokio::test]
async fn second_run_skips_issued_certificates() {
    let dir = TempDir::new().unwrap();
    let dns = MemoryDns::new();
    let fleet = fleet(&dir, &dns);
    let specs = desired(&[
        ("web", &["example.com", "www.example.com"]),
        ("api", &["api.example.com"]),
    ]);

    let first = fleet.run(&specs).await.unwrap();
    assert_eq!(first.count(OutcomeAction::Issued), 2);
    assert!(!first.has_failures());
    let stored = fleet.existing().unwrap();
    assert_eq!(stored["web"].sans, ["example.com", "www.example.com"]);
    assert!(dir.path().join("certs/api/api.json").exists());

    let second = fleet.run(&specs).await.unwrap();
    assert_eq!(second.count(OutcomeAction::Skipped), 2);
    assert_eq!(fleet.coordinator.acme().orders_created(), 2);
}

#[tokio::test]
async fn invalid_specs_abort_before_any_order() {
    let dir = TempDir::new().unwrap();
    let dns = MemoryDns::new();
    let fleet = fleet(&dir, &dns);
    let specs = desired(&[
        ("bad name!", &["a.example.com"]),
        ("elsewhere", &["www.example.org"]),
        ("fine", &["fine.example.com"]),
    ]);

    assert_eq!(fleet.validate(&specs).len(), 2);
    let err = fleet.run(&specs).await.err().unwrap();
    assert!(err.to_string().starts_with("2 invalid"), "{err}");
    assert_eq!(fleet.coordinator.acme().orders_created(), 0);
    assert!(fleet.existing().unwrap().is_empty());
}

#[tokio::test]
async fn check_reports_plan_without_ordering() {
    let dir = TempDir::new().unwrap();
    let dns = MemoryDns::new();
    let fleet = fleet(&dir, &dns);
    fleet
        .run(&desired(&[("web", &["www.example.com"])]))
        .await
        .unwrap();

    let specs = desired(&[
        ("web", &["www.example.com", "example.com"]),
        ("new", &["new.example.com"]),
    ]);
    let plan = config(&dir, true).check(fleet.zones(), &specs).unwrap();

    assert_eq!(
        plan,
        [
            ("new".to_string(), Action::Issue),
            ("web".to_string(), Action::Issue),
        ]
    );
    assert_eq!(fleet.coordinator.acme().orders_created(), 1);
}

#[test]
fn check_validates_without_an_account() {
    let dir = TempDir::new().unwrap();
    let zones = ZoneSet::new([Zone::new("example.com", MemoryDns::new())]);
    let specs = desired(&[("web", &["www.example.org"])]);

    let err = config(&dir, false).check(&zones, &specs).unwrap_err();

    assert!(err.to_string().starts_with("1 invalid"), "{err}");
    assert!(!dir.path().join("credentials.json").exists());
}
