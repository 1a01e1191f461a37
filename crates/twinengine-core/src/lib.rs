//! TwinEngine Core Library
//!
//! Device-side twin synchronization and component reconciliation.
//!
//! ## Overview
//!
//! A constrained device maintains a bidirectional, versioned state document
//! (the "twin") with a remote service. TwinEngine decomposes that document
//! into independently addressable components, reconciles writable-property
//! changes proposed by the service with acknowledgements produced locally,
//! and manages the connection lifecycle against an abstract Transport.
//!
//! Data flows one way per notification:
//! Transport → engine → handler dispatch → ack protocol → Transport (report).
//!
//! ## Core Principles
//!
//! - **Static declaration**: components declare their writable properties at
//!   registration; only declared properties are auto-acknowledged
//! - **Resilient handlers**: a failing user handler produces a failure
//!   acknowledgement, never a crash
//! - **Replay-last signals**: late lifecycle subscribers immediately see the
//!   most recent connected/disconnected/error/message emission
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use twinengine_core::{StaticIdentity, TwinEngine};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = TwinEngine::builder(transport, Arc::new(StaticIdentity::new(cert, key)))
//!         .build();
//!
//!     let thermostat = engine.register_component("thermostat", vec!["target".into()])?;
//!     engine.on_property_update("thermostat", "target", Arc::new(|value, version| {
//!         println!("target -> {value} (v{version})");
//!         Ok(None)
//!     }))?;
//!
//!     engine.connect().await?;
//!     thermostat.report_state(serde_json::json!({"firmware": "1.4.2"})).await?;
//!     Ok(())
//! }
//! ```

pub mod ack;
pub mod codec;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod handle;
pub mod registry;
pub mod signal;
pub mod telemetry;
pub mod transport;
pub mod types;

// Re-exports
pub use ack::{build_ack, is_ack, AckOverrides, WritablePropertyAck};
pub use codec::{normalize, strip_metadata};
pub use config::{EngineConfig, ReconnectPolicy};
pub use engine::{ConnectionState, TwinEngine, TwinEngineBuilder};
pub use error::{TwinError, TwinResult};
pub use handle::ComponentHandle;
pub use registry::{Component, ComponentHandler, ComponentRegistry, PropertyHandler};
pub use signal::{Signal, SignalReceiver};
pub use telemetry::TelemetryMessage;
pub use transport::{
    BlobUpload, CommandHandler, DeviceCredential, IdentityProvider, StaticIdentity, Transport,
    TransportEvent, UploadOutcome,
};
pub use types::{command_name, DesiredChange, TwinDocument, TwinVersion};
