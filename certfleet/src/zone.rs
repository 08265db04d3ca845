//! DNS zones and SAN-to-zone resolution.

use std::collections::BTreeSet;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tracing::debug;

use crate::{
    dns01_client::{Dns01Api, Dns01Client},
    error::ResolveError,
};

/// A DNS domain together with the provider able to publish records in it.
///
/// The provider is owned by the zone and only reachable through
/// [`Zone::publish_challenge`] / [`Zone::remove_challenge`], which hold the
/// zone lock for the duration of the provider calls. Certificates sharing a
/// zone therefore never talk to its provider concurrently.
#[derive(Debug)]
pub struct Zone<P = Dns01Client> {
    domain: String,
    provider: Mutex<ZoneProvider<P>>,
}

#[derive(Debug)]
struct ZoneProvider<P> {
    client: P,
    /// Ids of challenge records published and not yet removed.
    live: BTreeSet<String>,
}

impl<P> Zone<P> {
    pub fn new(domain: impl Into<String>, provider: P) -> Self {
        Self {
            domain: normalize_hostname(&domain.into()),
            provider: Mutex::new(ZoneProvider {
                client: provider,
                live: BTreeSet::new(),
            }),
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Whether `hostname` lies at or under this zone, on a label boundary.
    pub fn contains(&self, hostname: &str) -> bool {
        let hostname = normalize_hostname(hostname);
        let hostname = hostname.strip_prefix("*.").unwrap_or(&hostname);
        match hostname.strip_suffix(self.domain.as_str()) {
            Some("") => true,
            Some(prefix) => prefix.ends_with('.'),
            None => false,
        }
    }
}

impl<P: Dns01Api> Zone<P> {
    /// Publish a challenge TXT record and return the provider's id for it.
    ///
    /// Stale TXT records at `record_name` are removed first, except those
    /// published through this zone and still awaiting removal. Several
    /// challenges may share a name, the server accepts any of the values.
    pub async fn publish_challenge(&self, record_name: &str, value: &str) -> Result<String> {
        let mut provider = self.provider.lock().await;
        let existing = provider
            .client
            .get_records(record_name)
            .await
            .context("failed to list existing dns records")?;
        for record in existing {
            if record.r#type != "TXT" || provider.live.contains(&record.id) {
                continue;
            }
            debug!(zone = %self.domain, record_name, "removing stale record {}", record.id);
            provider
                .client
                .remove_record(&record.id)
                .await
                .context("failed to remove existing dns record")?;
        }
        debug!(zone = %self.domain, record_name, "creating challenge record");
        let id = provider
            .client
            .add_txt_record(record_name, value)
            .await
            .context("failed to create dns record")?;
        provider.live.insert(id.clone());
        Ok(id)
    }

    pub async fn remove_challenge(&self, record_id: &str) -> Result<()> {
        let mut provider = self.provider.lock().await;
        provider.live.remove(record_id);
        provider.client.remove_record(record_id).await
    }
}

/// The zones loaded for one run. Immutable once built.
#[derive(Debug)]
pub struct ZoneSet<P = Dns01Client> {
    zones: Vec<Zone<P>>,
}

impl<P> ZoneSet<P> {
    pub fn new(zones: impl IntoIterator<Item = Zone<P>>) -> Self {
        Self {
            zones: zones.into_iter().collect(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Zone<P>> {
        self.zones.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }

    /// Find the most specific zone responsible for `hostname`.
    pub fn resolve(&self, hostname: &str) -> Result<&Zone<P>, ResolveError> {
        resolve(hostname, &self.zones)
    }
}

impl<P> FromIterator<Zone<P>> for ZoneSet<P> {
    fn from_iter<I: IntoIterator<Item = Zone<P>>>(iter: I) -> Self {
        Self::new(iter)
    }
}

/// Longest label-aligned suffix match of `hostname` against `zones`.
pub fn resolve<'a, P>(hostname: &str, zones: &'a [Zone<P>]) -> Result<&'a Zone<P>, ResolveError> {
    zones
        .iter()
        .filter(|zone| zone.contains(hostname))
        .max_by_key(|zone| zone.domain.len())
        .ok_or_else(|| ResolveError::NoMatchingZone {
            hostname: hostname.to_string(),
        })
}

/// Lowercase and drop the root label dot.
pub(crate) fn normalize_hostname(hostname: &str) -> String {
    hostname.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// Name of the TXT record that proves control of `san`.
pub(crate) fn challenge_record_name(san: &str) -> String {
    let base = san.strip_prefix("*.").unwrap_or(san);
    format!("_acme-challenge.{base}")
}
