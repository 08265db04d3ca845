use std::{path::PathBuf, process::ExitStatus};

use thiserror::Error;

/// A hostname that no configured zone can prove control of.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("DNS config has no zone that matches SAN '{hostname}'")]
    NoMatchingZone { hostname: String },
}

/// A violation found in the desired certificate list.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error(
        "'{name}' is not a valid certificate name, only alphanumerics, '-' and '_' are allowed"
    )]
    InvalidName { name: String },
    #[error("certificate '{name}' needs at least one SAN")]
    NoSans { name: String },
    #[error("certificate '{name}' has too many SANs ({count}), max is {max}")]
    TooManySans {
        name: String,
        count: usize,
        max: usize,
    },
    #[error("certificate '{name}': {source}")]
    Unresolvable {
        name: String,
        #[source]
        source: ResolveError,
    },
}

impl ValidationError {
    /// Name of the certificate this violation belongs to.
    pub fn name(&self) -> &str {
        match self {
            Self::InvalidName { name }
            | Self::NoSans { name }
            | Self::TooManySans { name, .. }
            | Self::Unresolvable { name, .. } => name,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("corrupt certificate state at {}: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },
    #[error("failed to persist certificate '{name}'")]
    Persist {
        name: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Failure classification reported by the ACME client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AcmeError {
    #[error("rate limited by ACME server: {0}")]
    RateLimited(String),
    #[error("ACME network error: {0}")]
    Network(String),
    #[error("ACME server rejected the request: {0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum IssueError {
    #[error("authorization for '{san}' failed: {detail}")]
    AuthorizationFailed { san: String, detail: String },
    #[error("DNS provider for zone '{zone}' failed to publish challenge for '{san}'")]
    Provider {
        zone: String,
        san: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("ACME error: {0}")]
    Acme(String),
    #[error(transparent)]
    Resolution(#[from] ResolveError),
    #[error("challenge record did not propagate")]
    Propagation(#[source] anyhow::Error),
    #[error("authorization for '{san}' still pending after {attempts} polls")]
    ValidationStalled { san: String, attempts: u32 },
    #[error("bad certificate material")]
    Certificate(#[source] anyhow::Error),
    #[error("run deadline exceeded")]
    Timeout,
}

impl IssueError {
    /// Transient failures worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited(_) | Self::Network(_))
    }
}

impl From<AcmeError> for IssueError {
    fn from(err: AcmeError) -> Self {
        match err {
            AcmeError::RateLimited(detail) => Self::RateLimited(detail),
            AcmeError::Network(detail) => Self::Network(detail),
            AcmeError::Rejected(detail) => Self::Acme(detail),
        }
    }
}

/// Post-issuance hook problems. Reported, never fatal.
#[derive(Debug, Error)]
pub enum HookError {
    #[error("failed to spawn hook '{command}'")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("hook '{command}' exited with {status}")]
    Failed { command: String, status: ExitStatus },
}

/// Why a certificate ended up `failed` in the run report.
#[derive(Debug, Error)]
pub enum OutcomeError {
    #[error(transparent)]
    Issue(IssueError),
    #[error(transparent)]
    Persist(#[from] StoreError),
    #[error("run deadline exceeded")]
    Timeout,
}

impl From<IssueError> for OutcomeError {
    fn from(err: IssueError) -> Self {
        match err {
            IssueError::Timeout => Self::Timeout,
            err => Self::Issue(err),
        }
    }
}
