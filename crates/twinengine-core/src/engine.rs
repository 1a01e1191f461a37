//! Main TwinEngine - the twin synchronization and reconciliation engine
//!
//! TwinEngine coordinates the Transport, the component registry, and the
//! acknowledgement protocol:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  TwinEngine                                                     │
//! │  ├── connect(): credential → bounded-retry open → event loop    │
//! │  ├── event loop: TransportEvent stream                          │
//! │  │   ├── DesiredPropertiesChanged → dispatch → report acks      │
//! │  │   ├── Disconnected → signal + background reconnect           │
//! │  │   └── Message / Error → replay-last signals                  │
//! │  └── ComponentHandle: per-component report/query/telemetry      │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! One logical connection per device identity. `connect` and `disconnect`
//! must be externally serialized; desired-property notifications are
//! processed one at a time as they arrive.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use twinengine_core::{EngineConfig, StaticIdentity, TwinEngine};
//!
//! let engine = TwinEngine::builder(transport, Arc::new(StaticIdentity::new(cert, key)))
//!     .config(EngineConfig::from_env()?)
//!     .build();
//!
//! let thermostat = engine.register_component("thermostat", vec!["target".into()])?;
//! engine.connect().await?;
//!
//! thermostat.report_state(serde_json::json!({"firmware": "1.4.2"})).await?;
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::dispatch::dispatch_desired_change;
use crate::error::{TwinError, TwinResult};
use crate::handle::ComponentHandle;
use crate::registry::{ComponentHandler, ComponentRegistry, PropertyHandler};
use crate::signal::{Signal, SignalReceiver};
use crate::telemetry::TelemetryMessage;
use crate::transport::{
    BlobUpload, CommandHandler, IdentityProvider, Transport, TransportEvent,
};
use crate::types::{command_name, DesiredChange, TwinDocument, TwinVersion};

/// Connection lifecycle state
///
/// Cyclic: `Disconnected → Connecting → Connected → Disconnected → …`, with
/// no terminal state while the engine lives. Past the first `connect`,
/// transitions are driven by transport events, not by user calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection
    Disconnected,
    /// A connect or reconnect attempt is in flight
    Connecting,
    /// Connection established
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected => write!(f, "Connected"),
        }
    }
}

/// Shared engine state, referenced by the engine, its component handles, and
/// the background tasks
pub(crate) struct EngineInner {
    pub(crate) config: EngineConfig,
    pub(crate) transport: Arc<dyn Transport>,
    identity: Arc<dyn IdentityProvider>,
    pub(crate) uploader: Option<Arc<dyn BlobUpload>>,
    pub(crate) registry: Mutex<ComponentRegistry>,
    state_tx: watch::Sender<ConnectionState>,
    connected: Signal<()>,
    disconnected: Signal<Option<String>>,
    errors: Signal<String>,
    messages: Signal<Value>,
    shutting_down: AtomicBool,
    event_task: Mutex<Option<JoinHandle<()>>>,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
}

impl EngineInner {
    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }

    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }
}

/// Builder for [`TwinEngine`]
pub struct TwinEngineBuilder {
    transport: Arc<dyn Transport>,
    identity: Arc<dyn IdentityProvider>,
    uploader: Option<Arc<dyn BlobUpload>>,
    config: EngineConfig,
}

impl TwinEngineBuilder {
    /// Set the engine configuration
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Attach a blob upload collaborator for `ComponentHandle::upload_file`
    pub fn blob_upload(mut self, uploader: Arc<dyn BlobUpload>) -> Self {
        self.uploader = Some(uploader);
        self
    }

    /// Build the engine
    pub fn build(self) -> TwinEngine {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        TwinEngine {
            inner: Arc::new(EngineInner {
                config: self.config,
                transport: self.transport,
                identity: self.identity,
                uploader: self.uploader,
                registry: Mutex::new(ComponentRegistry::new()),
                state_tx,
                connected: Signal::new(),
                disconnected: Signal::new(),
                errors: Signal::new(),
                messages: Signal::new(),
                shutting_down: AtomicBool::new(false),
                event_task: Mutex::new(None),
                reconnect_task: Mutex::new(None),
            }),
        }
    }
}

/// Device twin synchronization engine
pub struct TwinEngine {
    inner: Arc<EngineInner>,
}

impl TwinEngine {
    /// Start building an engine over a transport and identity provider
    pub fn builder(
        transport: Arc<dyn Transport>,
        identity: Arc<dyn IdentityProvider>,
    ) -> TwinEngineBuilder {
        TwinEngineBuilder {
            transport,
            identity,
            uploader: None,
            config: EngineConfig::default(),
        }
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Watch connection state changes
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Subscribe to the connected signal (replays the latest emission)
    pub fn subscribe_connected(&self) -> SignalReceiver<()> {
        self.inner.connected.subscribe()
    }

    /// Subscribe to the disconnected signal; the value is the transport's
    /// close reason if it gave one
    pub fn subscribe_disconnected(&self) -> SignalReceiver<Option<String>> {
        self.inner.disconnected.subscribe()
    }

    /// Subscribe to transport and reporting errors
    pub fn subscribe_errors(&self) -> SignalReceiver<String> {
        self.inner.errors.subscribe()
    }

    /// Subscribe to cloud-to-device message payloads
    pub fn subscribe_messages(&self) -> SignalReceiver<Value> {
        self.inner.messages.subscribe()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Component Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Register a component with its writable-property declaration
    ///
    /// Writable properties are the names eligible for automatic
    /// acknowledgement; everything else in the component's delta is visible
    /// to the component handler but never acknowledged.
    ///
    /// # Errors
    ///
    /// Returns `TwinError::DuplicateComponent` if the key is taken.
    pub fn register_component(
        &self,
        key: impl Into<String>,
        writable_properties: Vec<String>,
    ) -> TwinResult<ComponentHandle> {
        let key = key.into();
        self.inner
            .registry
            .lock()
            .register(key.clone(), writable_properties)?;
        info!(component = %key, "Component registered");
        Ok(ComponentHandle::new(self.inner.clone(), key))
    }

    /// Get a handle to an already-registered component
    pub fn component(&self, key: &str) -> Option<ComponentHandle> {
        let registry = self.inner.registry.lock();
        registry
            .contains(key)
            .then(|| ComponentHandle::new(self.inner.clone(), key.to_string()))
    }

    /// Attach a component-level change handler (replaces any existing one)
    pub fn on_component_update(&self, key: &str, handler: ComponentHandler) -> TwinResult<()> {
        self.inner.registry.lock().set_component_handler(key, handler)
    }

    /// Attach a property-level change handler (replaces any existing one for
    /// the same component/property pair)
    pub fn on_property_update(
        &self,
        key: &str,
        property: impl Into<String>,
        handler: PropertyHandler,
    ) -> TwinResult<()> {
        self.inner
            .registry
            .lock()
            .set_property_handler(key, property, handler)
    }

    /// Register a device-scoped command handler (bare command name)
    pub fn on_command(&self, name: &str, handler: CommandHandler) {
        self.inner
            .transport
            .on_command(&command_name(None, name), handler);
    }

    /// Send device-scoped telemetry
    ///
    /// The configured type header is folded into the message properties
    /// before the transport sees it.
    pub async fn send_telemetry(&self, message: TelemetryMessage) -> TwinResult<()> {
        self.inner
            .transport
            .send_message(message.materialize_headers(&self.inner.config.type_header))
            .await
    }

    /// Fetch the full twin document
    pub async fn get_twin(&self) -> TwinResult<TwinDocument> {
        self.inner.transport.get_twin().await
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Connection Lifecycle
    // ═══════════════════════════════════════════════════════════════════════

    /// Connect to the service
    ///
    /// Obtains the device credential, then opens the transport with a bounded
    /// retry (`EngineConfig::connect_attempts`, default 3). Each retry slot
    /// issues a fresh open attempt. On success the engine subscribes to
    /// transport events and starts processing desired-property changes;
    /// thereafter, involuntary disconnects trigger automatic reconnection
    /// governed by the configured [`ReconnectPolicy`](crate::ReconnectPolicy)
    /// without further caller action.
    ///
    /// # Errors
    ///
    /// Returns `TwinError::InvalidOperation` if already connected or
    /// connecting, or the last `TwinError::Transport` once attempts are
    /// exhausted. Not safe for concurrent calls; serialize externally.
    pub async fn connect(&self) -> TwinResult<()> {
        if self.inner.state() != ConnectionState::Disconnected {
            return Err(TwinError::InvalidOperation(format!(
                "connect called while {}",
                self.inner.state()
            )));
        }

        self.inner.shutting_down.store(false, Ordering::SeqCst);
        self.inner.set_state(ConnectionState::Connecting);
        info!("Connecting");

        // Subscribe before opening so the transport's own connected event is
        // not missed by the loop.
        let events = self.inner.transport.events();

        let credential = match self.inner.identity.device_credential().await {
            Ok(credential) => credential,
            Err(err) => {
                self.inner.set_state(ConnectionState::Disconnected);
                return Err(err);
            }
        };

        let mut last_err = None;
        for attempt in 1..=self.inner.config.connect_attempts {
            match self.inner.transport.open(&credential).await {
                Ok(()) => {
                    self.inner.set_state(ConnectionState::Connected);
                    info!(attempt, "Connected");

                    let task_inner = self.inner.clone();
                    let handle =
                        tokio::spawn(async move { Self::event_loop(task_inner, events).await });
                    *self.inner.event_task.lock() = Some(handle);
                    return Ok(());
                }
                Err(err) => {
                    warn!(attempt, %err, "Connect attempt failed");
                    last_err = Some(err);
                }
            }
        }

        self.inner.set_state(ConnectionState::Disconnected);
        Err(last_err
            .unwrap_or_else(|| TwinError::Transport("connect attempts exhausted".to_string())))
    }

    /// Disconnect and tear down background processing
    ///
    /// Stops the event loop and any in-flight reconnect attempt before
    /// closing the transport, so the close does not trigger a reconnect.
    pub async fn disconnect(&self) -> TwinResult<()> {
        info!("Disconnecting");
        self.inner.shutting_down.store(true, Ordering::SeqCst);

        if let Some(handle) = self.inner.reconnect_task.lock().take() {
            handle.abort();
        }
        if let Some(handle) = self.inner.event_task.lock().take() {
            handle.abort();
        }

        self.inner.transport.close().await?;
        self.inner.set_state(ConnectionState::Disconnected);
        self.inner.disconnected.emit(None);
        Ok(())
    }

    /// Background loop consuming the transport event stream
    async fn event_loop(
        inner: Arc<EngineInner>,
        mut events: tokio::sync::broadcast::Receiver<TransportEvent>,
    ) {
        debug!("Event loop started");
        loop {
            match events.recv().await {
                Ok(event) => Self::handle_event(&inner, event).await,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event loop lagged behind transport events");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    debug!("Transport event stream closed");
                    break;
                }
            }
        }
        debug!("Event loop ended");
    }

    async fn handle_event(inner: &Arc<EngineInner>, event: TransportEvent) {
        match event {
            TransportEvent::Connected => {
                inner.set_state(ConnectionState::Connected);
                inner.connected.emit(());
            }
            TransportEvent::Disconnected { reason } => {
                warn!(?reason, "Transport disconnected");
                inner.set_state(ConnectionState::Disconnected);
                inner.disconnected.emit(reason);
                Self::spawn_reconnect(inner);
            }
            TransportEvent::Error(err) => {
                warn!(%err, "Transport error");
                inner.errors.emit(err);
            }
            TransportEvent::Message(payload) => {
                debug!("Cloud-to-device message received");
                inner.messages.emit(payload);
            }
            TransportEvent::DesiredPropertiesChanged { version, delta } => {
                Self::process_desired_change(inner, version, delta).await;
            }
        }
    }

    /// Process one desired-property-change notification
    ///
    /// Dispatches handlers synchronously against a snapshot of the registry,
    /// then reports each resulting ack patch with its own `update_reported`
    /// call. The registry lock is released before any handler runs, so a
    /// handler may call back into the engine (query its handle, attach
    /// another handler) without stalling the event loop. No atomicity across
    /// properties; a failed report is logged and surfaced on the error
    /// signal, the remaining patches are still reported.
    async fn process_desired_change(inner: &Arc<EngineInner>, version: TwinVersion, delta: Value) {
        debug!(version, "Processing desired-property change");
        let change = DesiredChange { version, delta };

        let registry = inner.registry.lock().clone();
        let patches = dispatch_desired_change(&registry, &change);

        for patch in patches {
            if let Err(err) = inner.transport.update_reported(patch).await {
                warn!(version, %err, "Failed to report acknowledgement");
                inner.errors.emit(err.to_string());
            }
        }
    }

    /// Fire-and-forget reconnection after an involuntary disconnect
    ///
    /// Each attempt fetches a fresh credential and issues a fresh open call.
    /// The loop stops when the policy says so or the engine shuts down.
    fn spawn_reconnect(inner: &Arc<EngineInner>) {
        if inner.shutting_down.load(Ordering::SeqCst) {
            return;
        }

        // A disconnect arriving while a reconnect loop is live supersedes it;
        // two concurrent loops would race duplicate open calls.
        let mut slot = inner.reconnect_task.lock();
        if let Some(previous) = slot.take() {
            previous.abort();
        }

        let task_inner = inner.clone();
        let handle = tokio::spawn(async move {
            let mut attempt: u32 = 1;
            loop {
                let Some(delay) = task_inner.config.reconnect.next_delay(attempt) else {
                    warn!(attempt, "Reconnect policy exhausted, staying disconnected");
                    break;
                };
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if task_inner.shutting_down.load(Ordering::SeqCst) {
                    break;
                }

                task_inner.set_state(ConnectionState::Connecting);
                debug!(attempt, "Reconnect attempt");

                let opened = match task_inner.identity.device_credential().await {
                    Ok(credential) => task_inner.transport.open(&credential).await,
                    Err(err) => Err(err),
                };

                match opened {
                    Ok(()) => {
                        info!(attempt, "Reconnected");
                        task_inner.set_state(ConnectionState::Connected);
                        break;
                    }
                    Err(err) => {
                        warn!(attempt, %err, "Reconnect attempt failed");
                        task_inner.errors.emit(err.to_string());
                        task_inner.set_state(ConnectionState::Disconnected);
                        attempt += 1;
                    }
                }
            }
        });
        *slot = Some(handle);
    }
}
