//! External collaborator contracts
//!
//! The engine consumes three collaborators it does not implement: the
//! pub/sub-style twin transport, the identity provider that yields the device
//! credential, and the blob upload service. Each is an abstract async trait;
//! the only implementation shipped here is [`mock::MockTransport`] for tests
//! and dry runs.

pub mod mock;

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::error::TwinResult;
use crate::telemetry::TelemetryMessage;
use crate::types::{TwinDocument, TwinVersion};

/// Device credential supplied by the identity provider
///
/// Opaque to the engine; handed to the transport when opening the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCredential {
    /// PEM-encoded certificate
    pub cert: String,
    /// PEM-encoded private key
    pub key: String,
}

/// Events emitted by the transport
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Connection established
    Connected,
    /// Connection lost, with the transport's reason if it gave one
    Disconnected {
        /// Error or close reason reported by the transport
        reason: Option<String>,
    },
    /// Cloud-to-device message payload
    Message(Value),
    /// Transport-level error that did not close the connection
    Error(String),
    /// The service changed desired properties
    DesiredPropertiesChanged {
        /// Desired-tree version after the change
        version: TwinVersion,
        /// Changed subtrees
        delta: Value,
    },
}

/// Handler for an invoked command; receives the request payload and returns
/// the response payload
pub type CommandHandler = Arc<dyn Fn(Value) -> TwinResult<Value> + Send + Sync>;

/// The pub/sub-style twin transport
///
/// One logical connection per device identity. The engine drives `open`/
/// `close` and consumes the event stream; twin reads and reported patches go
/// through `get_twin`/`update_reported`.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the connection using the given device credential
    async fn open(&self, credential: &DeviceCredential) -> TwinResult<()>;

    /// Close the connection
    async fn close(&self) -> TwinResult<()>;

    /// Fetch the full twin document
    async fn get_twin(&self) -> TwinResult<TwinDocument>;

    /// Submit a partial reported-properties patch
    async fn update_reported(&self, patch: Value) -> TwinResult<()>;

    /// Send an outbound telemetry message
    async fn send_message(&self, message: TelemetryMessage) -> TwinResult<()>;

    /// Register a command handler under a wire name
    ///
    /// Later registration for the same name replaces the earlier handler.
    fn on_command(&self, name: &str, handler: CommandHandler);

    /// Subscribe to transport events
    fn events(&self) -> broadcast::Receiver<TransportEvent>;
}

/// Supplier of the device credential (certificate enrollment is behind this)
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Obtain the credential to open the transport with
    async fn device_credential(&self) -> TwinResult<DeviceCredential>;
}

/// Identity provider backed by an already-issued credential
pub struct StaticIdentity {
    credential: DeviceCredential,
}

impl StaticIdentity {
    /// Wrap an existing certificate and key
    pub fn new(cert: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            credential: DeviceCredential {
                cert: cert.into(),
                key: key.into(),
            },
        }
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentity {
    async fn device_credential(&self) -> TwinResult<DeviceCredential> {
        Ok(self.credential.clone())
    }
}

/// Result of a blob upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOutcome {
    /// Status code reported by the upload service
    pub status: i64,
    /// Optional status description
    pub description: Option<String>,
}

/// Blob/file upload collaborator
#[async_trait]
pub trait BlobUpload: Send + Sync {
    /// Upload a named blob and return the service's outcome
    async fn upload(&self, name: &str, data: &[u8]) -> TwinResult<UploadOutcome>;
}
