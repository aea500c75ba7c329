//! Error taxonomy for the media service.
//!
//! Backend errors are classified exactly once, at the collaborator boundary
//! (`metadata_store::postgres`, `asset_store::s3`), into these closed enums.
//! Nothing downstream inspects error messages.

use crate::ids::{IdError, ImageId};
use std::fmt;
use thiserror::Error;

/// Failures of the metadata-store connection layer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Handshake with metadata store failed: {0}")]
    Handshake(String),

    #[error("Metadata store timed out: {0}")]
    Timeout(String),

    #[error("Authentication with metadata store failed: {0}")]
    AuthFailure(String),

    #[error("Metadata store refused the connection: {0}")]
    Unreachable(String),

    #[error("Metadata store host could not be resolved: {0}")]
    HostUnresolved(String),

    #[error("Metadata store topology lost: {0}")]
    TopologyLost(String),

    #[error("Invalid metadata store configuration: {0}")]
    Configuration(String),

    #[error("Metadata store operation failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<ConnectionError>,
    },

    #[error("Metadata store operation failed: {0}")]
    Operation(String),
}

impl ConnectionError {
    /// The live handle is known stale and must be rebuilt.
    pub fn is_topology_loss(&self) -> bool {
        matches!(self, ConnectionError::TopologyLost(_))
    }

    /// Transient negotiation failure during initial connection setup.
    pub fn is_handshake(&self) -> bool {
        matches!(self, ConnectionError::Handshake(_))
    }

    /// Errors that no amount of retrying will fix.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            ConnectionError::AuthFailure(_)
                | ConnectionError::HostUnresolved(_)
                | ConnectionError::Configuration(_)
        )
    }

    /// Operator-facing remediation hint for this kind of failure.
    pub fn hint(&self) -> &'static str {
        match self {
            ConnectionError::Handshake(_) => {
                "Check firewall/proxy rules and TLS settings, and make sure this host is allowed by the database's network access list"
            }
            ConnectionError::Timeout(_) => {
                "The server did not answer in time: check connectivity, the network access list, and whether the server is up"
            }
            ConnectionError::AuthFailure(_) => {
                "Check the username and password in the connection string"
            }
            ConnectionError::Unreachable(_) => {
                "Nothing is listening at that address: check that the server is running and the port in the connection string"
            }
            ConnectionError::HostUnresolved(_) => {
                "Check the host name in the connection string and DNS/internet connectivity"
            }
            ConnectionError::TopologyLost(_) => {
                "The connection dropped repeatedly; check server health and network stability"
            }
            ConnectionError::Configuration(_) => {
                "Set database.url (MEDIA__DATABASE__URL) to a complete connection string with real credentials"
            }
            ConnectionError::RetriesExhausted { last, .. } => last.hint(),
            ConnectionError::Operation(_) => "Inspect the metadata store logs for the failing statement",
        }
    }
}

/// Failures of the binary object store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AssetStoreError {
    #[error("Upload failed: {0}")]
    UploadFailed(String),

    #[error("Delete failed for '{handle}': {reason}")]
    DeleteFailed { handle: String, reason: String },

    #[error("Asset store is not configured: {0}")]
    NotConfigured(String),
}

/// Failures of the image metadata store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MetadataError {
    #[error("Image {0} not found")]
    NotFound(ImageId),

    #[error("Write conflict: {0}")]
    WriteConflict(String),

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

impl MetadataError {
    pub fn is_topology_loss(&self) -> bool {
        matches!(self, MetadataError::Connection(e) if e.is_topology_loss())
    }
}

/// Which backend a step of a composed operation touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    RemoteStore,
    MetadataStore,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::RemoteStore => f.write_str("remote store"),
            Side::MetadataStore => f.write_str("metadata store"),
        }
    }
}

/// Failures of the primary-image coordinator.
#[derive(Debug, Clone, Error)]
pub enum OrchestrationError {
    /// One backend committed and the other did not; the two stores disagree
    /// about `remote_handle` until someone reconciles them.
    #[error("{operation}: {succeeded} succeeded but {failed} failed for '{remote_handle}': {reason}")]
    PartialFailure {
        operation: &'static str,
        succeeded: Side,
        failed: Side,
        remote_handle: String,
        reason: String,
    },

    #[error(transparent)]
    Asset(#[from] AssetStoreError),

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl From<IdError> for OrchestrationError {
    fn from(err: IdError) -> Self {
        OrchestrationError::InvalidRequest(err.to_string())
    }
}

impl OrchestrationError {
    /// The stores are left inconsistent with each other.
    pub fn is_partial(&self) -> bool {
        matches!(self, OrchestrationError::PartialFailure { .. })
    }
}
