//! Provisioner error abstractions.

use std::time::Duration;

use thiserror::Error;

/// A result type where the error is a `ProvisionError`.
pub type ProvisionResult<T> = ::std::result::Result<T, ProvisionError>;

/// Error variants produced by the provisioning workflow.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// The given claim or volume is malformed.
    #[error("invalid spec: {0}")]
    InvalidSpec(String),
    /// A local filesystem operation failed.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    /// No placement response was observed within the configured bound.
    #[error("no placement response for volume {name} within {timeout:?}")]
    PlacementTimeout { name: String, timeout: Duration },
    /// A placement response failed correlation or parsing.
    #[error("placement protocol violation: {0}")]
    ProtocolMismatch(String),
    /// The target node does not exist in the node inventory.
    #[error("node {0} not found")]
    NodeNotFound(String),
    /// The node object kept changing underneath a read-modify-write.
    #[error("conflict updating node {0}, retries exhausted")]
    LedgerConflict(String),
    /// The operation was aborted because the process is shutting down.
    #[error("operation canceled")]
    Canceled,
    /// The volume belongs to a different provisioner instance.
    #[error("ignored: {0}")]
    Ignored(String),
    /// Any other orchestrator API failure.
    #[error("k8s api error: {0}")]
    Api(#[from] kube::Error),
}

impl ProvisionError {
    /// Wrap an IO error with a description of the failed operation.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io { context: context.into(), source }
    }

    /// An API call which did not complete in time.
    pub fn api_timeout(action: &str) -> Self {
        Self::io(format!("timeout while {}", action), std::io::ErrorKind::TimedOut.into())
    }

    /// Whether the caller may reasonably re-invoke the failed operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Io { .. } | Self::PlacementTimeout { .. } | Self::LedgerConflict(_) | Self::Api(_)
        )
    }

    /// A short, stable label for this error, used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidSpec(_) => "invalid_spec",
            Self::Io { .. } => "io",
            Self::PlacementTimeout { .. } => "placement_timeout",
            Self::ProtocolMismatch(_) => "protocol_mismatch",
            Self::NodeNotFound(_) => "node_not_found",
            Self::LedgerConflict(_) => "ledger_conflict",
            Self::Canceled => "canceled",
            Self::Ignored(_) => "ignored",
            Self::Api(_) => "api",
        }
    }
}
