//! Keeps a fleet of ACME certificates in line with a declared desired state.
//!
//! The desired state maps certificate names to the hostnames (SANs) each
//! certificate must cover. Every SAN belongs to a configured DNS zone whose
//! provider publishes DNS-01 challenge records for it.
//!
//! A run validates the desired state, compares it with the certificates
//! already on disk, and issues or renews only what is missing, changed or
//! about to expire. Certificates are processed independently: a failure is
//! reported for that certificate and the others carry on.
//!
//! # Usage
//!
//! ```rust,no_run
//! use certfleet::{load_desired_state, specs_from_desired, CertFleetConfig, Dns01Client, Zone, ZoneSet};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let zones = ZoneSet::new([Zone::new(
//!         "example.com",
//!         Dns01Client::new_cloudflare("your_zone_id".into(), "your_api_token".into()),
//!     )]);
//!     let fleet = CertFleetConfig::builder()
//!         .acme_url("staging")
//!         .email("ops@example.com")
//!         .agree_tos(true)
//!         .workdir("/var/lib/certfleet")
//!         .build()
//!         .build_fleet(zones)
//!         .await?;
//!
//!     let specs = specs_from_desired(load_desired_state("certs.json")?);
//!     let report = fleet.run(&specs).await?;
//!     println!("{report}");
//!     Ok(())
//! }
//! ```

pub use acme_client::{
    directory_url, AcmeApi, AcmeClient, AcmeOrder, AuthorizationState, AuthorizationStatus,
    Dns01Challenge, OrderStatus,
};
pub use bot::{CertFleet, CertFleetConfig};
pub use cert_spec::{
    is_valid_cert_name, load_desired_state, save_desired_state, specs_from_desired, validate,
    CertificateSpec, DesiredState, MAX_SANS,
};
pub use coordinator::{plan, Coordinator, OutcomeAction, RunConfig, RunOutcome, RunReport};
pub use dns01_client::{Dns01Api, Dns01Client, Record};
pub use error::{
    AcmeError, HookError, IssueError, OutcomeError, ResolveError, StoreError, ValidationError,
};
pub use hook::HookDispatcher;
pub use issuer::{IssuePolicy, Issuer};
pub use retry::RetryPolicy;
pub use store::{chain_not_after, needs_action, Action, CertStore, CertificateRecord};
pub use workdir::WorkDir;
pub use zone::{resolve, Zone, ZoneSet};

mod acme_client;
mod bot;
mod cert_spec;
mod coordinator;
mod dns01_client;
mod error;
mod hook;
mod issuer;
mod retry;
mod store;
mod workdir;
mod zone;

#[cfg(test)]
mod testing;
