//! The ACME server as seen by the issuance state machine.
//!
//! [`AcmeApi`] is the narrow surface the orchestrator drives; [`AcmeClient`]
//! implements it on top of `instant-acme`.

use anyhow::{Context, Result};
use instant_acme::{
    Account, AccountCredentials, ChallengeType, Identifier, LetsEncrypt, NewAccount, NewOrder,
    Order,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::AcmeError;

const PROBLEM_RATE_LIMITED: &str = "urn:ietf:params:acme:error:rateLimited";
const PROBLEM_BAD_NONCE: &str = "urn:ietf:params:acme:error:badNonce";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizationStatus {
    Pending,
    Valid,
    /// Rejected, revoked, expired or deactivated. Never retried.
    Invalid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dns01Challenge {
    pub url: String,
    /// Value to publish in the `_acme-challenge` TXT record.
    pub dns_value: String,
}

/// Server-side view of one identifier's authorization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationState {
    /// Identifier as reported by the server; wildcards come back as their base name.
    pub identifier: String,
    pub status: AuthorizationStatus,
    pub dns01: Option<Dns01Challenge>,
    /// Server-provided reason when the challenge failed.
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    Pending,
    Ready,
    Processing,
    Valid,
    Invalid,
}

/// Order, authorization and finalization calls against an ACME server.
#[allow(async_fn_in_trait)]
pub trait AcmeApi {
    type Order;

    async fn new_order(&self, sans: &[String]) -> Result<Self::Order, AcmeError>;

    /// Fetch the current state of every authorization of `order`.
    async fn authorizations(
        &self,
        order: &Self::Order,
    ) -> Result<Vec<AuthorizationState>, AcmeError>;

    /// Ask the server to validate a challenge.
    async fn set_challenge_ready(
        &self,
        order: &Self::Order,
        challenge_url: &str,
    ) -> Result<(), AcmeError>;

    /// Submit the DER encoded CSR.
    async fn finalize(&self, order: &Self::Order, csr_der: &[u8]) -> Result<(), AcmeError>;

    async fn order_status(&self, order: &Self::Order) -> Result<OrderStatus, AcmeError>;

    /// The issued chain as PEM, once available.
    async fn certificate(&self, order: &Self::Order) -> Result<Option<String>, AcmeError>;
}

/// Resolve the `staging` / `live` aliases to Let's Encrypt directory URLs.
pub fn directory_url(server: &str) -> String {
    match server {
        "staging" => LetsEncrypt::Staging.url().to_string(),
        "live" | "production" => LetsEncrypt::Production.url().to_string(),
        url => url.to_string(),
    }
}

/// A AcmeClient instance.
pub struct AcmeClient {
    account: Account,
    credentials: Credentials,
}

#[derive(Serialize, Deserialize)]
struct Credentials {
    account_id: String,
    credentials: AccountCredentials,
}

/// An in-flight `instant-acme` order.
pub struct AcmeOrder {
    order: Mutex<Order>,
}

impl AcmeClient {
    pub async fn load(encoded_credentials: &str) -> Result<Self> {
        let credentials: Credentials = serde_json::from_str(encoded_credentials)?;
        let account = Account::from_credentials(credentials.credentials).await?;
        let credentials: Credentials = serde_json::from_str(encoded_credentials)?;
        Ok(Self {
            account,
            credentials,
        })
    }

    /// Create a new account, agreeing to the server's terms of service.
    pub async fn new_account(acme_url: &str, email: &str) -> Result<Self> {
        let contact = format!("mailto:{email}");
        let (account, credentials) = Account::create(
            &NewAccount {
                contact: &[contact.as_str()],
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            acme_url,
            None,
        )
        .await
        .context("failed to create new account")?;
        let credentials = Credentials {
            account_id: account.id().to_string(),
            credentials,
        };
        Ok(Self {
            account,
            credentials,
        })
    }

    /// Dump the account credentials to a JSON string.
    pub fn dump_credentials(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.credentials)?)
    }

    /// Read the account ID from the encoded credentials.
    pub fn account_id(&self) -> &str {
        &self.credentials.account_id
    }
}

impl AcmeApi for AcmeClient {
    type Order = AcmeOrder;

    async fn new_order(&self, sans: &[String]) -> Result<AcmeOrder, AcmeError> {
        debug!("creating new order for {}", sans.join(", "));
        let identifiers = sans
            .iter()
            .map(|name| Identifier::Dns(name.clone()))
            .collect::<Vec<_>>();
        let order = self
            .account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await
            .map_err(classify)?;
        Ok(AcmeOrder {
            order: Mutex::new(order),
        })
    }

    async fn authorizations(&self, order: &AcmeOrder) -> Result<Vec<AuthorizationState>, AcmeError> {
        let mut order = order.order.lock().await;
        let authorizations = order.authorizations().await.map_err(classify)?;
        let states = authorizations
            .iter()
            .map(|authz| {
                let Identifier::Dns(identifier) = &authz.identifier;
                let challenge = authz
                    .challenges
                    .iter()
                    .find(|c| c.r#type == ChallengeType::Dns01);
                let status = match authz.status {
                    instant_acme::AuthorizationStatus::Pending => AuthorizationStatus::Pending,
                    instant_acme::AuthorizationStatus::Valid => AuthorizationStatus::Valid,
                    _ => AuthorizationStatus::Invalid,
                };
                AuthorizationState {
                    identifier: identifier.clone(),
                    status,
                    dns01: challenge.map(|c| Dns01Challenge {
                        url: c.url.clone(),
                        dns_value: order.key_authorization(c).dns_value(),
                    }),
                    error: challenge
                        .and_then(|c| c.error.as_ref())
                        .and_then(|problem| problem.detail.clone()),
                }
            })
            .collect();
        Ok(states)
    }

    async fn set_challenge_ready(
        &self,
        order: &AcmeOrder,
        challenge_url: &str,
    ) -> Result<(), AcmeError> {
        let mut order = order.order.lock().await;
        order
            .set_challenge_ready(challenge_url)
            .await
            .map_err(classify)
    }

    async fn finalize(&self, order: &AcmeOrder, csr_der: &[u8]) -> Result<(), AcmeError> {
        let mut order = order.order.lock().await;
        order.finalize(csr_der).await.map_err(classify)
    }

    async fn order_status(&self, order: &AcmeOrder) -> Result<OrderStatus, AcmeError> {
        let mut order = order.order.lock().await;
        let state = order.refresh().await.map_err(classify)?;
        Ok(match state.status {
            instant_acme::OrderStatus::Pending => OrderStatus::Pending,
            instant_acme::OrderStatus::Ready => OrderStatus::Ready,
            instant_acme::OrderStatus::Processing => OrderStatus::Processing,
            instant_acme::OrderStatus::Valid => OrderStatus::Valid,
            instant_acme::OrderStatus::Invalid => OrderStatus::Invalid,
        })
    }

    async fn certificate(&self, order: &AcmeOrder) -> Result<Option<String>, AcmeError> {
        let mut order = order.order.lock().await;
        order.certificate().await.map_err(classify)
    }
}

/// Split `instant-acme` failures into transient and terminal ones.
fn classify(err: instant_acme::Error) -> AcmeError {
    match &err {
        instant_acme::Error::Api(problem) => {
            let transient = matches!(problem.r#type.as_deref(), Some(PROBLEM_BAD_NONCE))
                || problem.status.is_some_and(|status| status >= 500);
            if problem.r#type.as_deref() == Some(PROBLEM_RATE_LIMITED) {
                AcmeError::RateLimited(err.to_string())
            } else if transient {
                AcmeError::Network(err.to_string())
            } else {
                AcmeError::Rejected(err.to_string())
            }
        }
        _ => AcmeError::Network(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_aliases() {
        assert_eq!(directory_url("staging"), LetsEncrypt::Staging.url());
        assert_eq!(directory_url("live"), LetsEncrypt::Production.url());
        assert_eq!(
            directory_url("https://acme.example.test/directory"),
            "https://acme.example.test/directory"
        );
    }
}
