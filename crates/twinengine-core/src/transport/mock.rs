//! In-memory mock transport
//!
//! A scriptable [`Transport`] for tests and dry runs: records every reported
//! patch and telemetry message, maintains a twin document that reported
//! patches are merged into, and lets the test inject transport events
//! (desired changes, disconnects) as if they came from the service.
//!
//! `open` failures can be scripted with [`MockTransport::fail_next_opens`] to
//! exercise the engine's connect retry path.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::{TwinError, TwinResult};
use crate::telemetry::TelemetryMessage;
use crate::transport::{CommandHandler, DeviceCredential, Transport, TransportEvent};
use crate::types::{DesiredChange, TwinDocument, TwinVersion};

const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Default)]
struct MockState {
    open: bool,
    twin: TwinDocument,
    reported_patches: Vec<Value>,
    sent_messages: Vec<TelemetryMessage>,
    open_attempts: u32,
    open_failures_remaining: u32,
    commands: HashMap<String, CommandHandler>,
    last_credential: Option<DeviceCredential>,
}

/// Scriptable in-memory transport
pub struct MockTransport {
    state: Mutex<MockState>,
    events_tx: broadcast::Sender<TransportEvent>,
}

impl MockTransport {
    /// Create a mock with an empty twin
    pub fn new() -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(MockState {
                twin: TwinDocument::new(),
                ..MockState::default()
            }),
            events_tx,
        }
    }

    /// Replace the twin document returned by `get_twin`
    pub fn set_twin(&self, twin: TwinDocument) {
        self.state.lock().twin = twin;
    }

    /// Replace the twin from a raw JSON payload as received off the wire
    ///
    /// # Errors
    ///
    /// Returns `TwinError::Protocol` if the payload is not a valid twin
    /// document.
    pub fn set_twin_json(&self, payload: Value) -> TwinResult<()> {
        self.state.lock().twin = TwinDocument::from_json(payload)?;
        Ok(())
    }

    /// Script the next `count` open calls to fail
    pub fn fail_next_opens(&self, count: u32) {
        self.state.lock().open_failures_remaining = count;
    }

    /// Number of open calls observed so far
    pub fn open_attempts(&self) -> u32 {
        self.state.lock().open_attempts
    }

    /// Whether the connection is currently open
    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    /// The credential passed to the most recent open call
    pub fn last_credential(&self) -> Option<DeviceCredential> {
        self.state.lock().last_credential.clone()
    }

    /// All reported patches submitted so far, in submission order
    pub fn reported_patches(&self) -> Vec<Value> {
        self.state.lock().reported_patches.clone()
    }

    /// All telemetry messages sent so far
    pub fn sent_messages(&self) -> Vec<TelemetryMessage> {
        self.state.lock().sent_messages.clone()
    }

    /// Inject a transport event as if it came from the service
    pub fn inject(&self, event: TransportEvent) {
        let _ = self.events_tx.send(event);
    }

    /// Inject a desired-property-change notification
    pub fn inject_desired_change(&self, version: TwinVersion, delta: Value) {
        self.inject(TransportEvent::DesiredPropertiesChanged { version, delta });
    }

    /// Inject a desired-property delta as received off the wire, reading the
    /// version from the delta's `$version` marker
    ///
    /// # Errors
    ///
    /// Returns `TwinError::Protocol` if the delta carries no version marker.
    pub fn inject_desired_delta(&self, delta: Value) -> TwinResult<()> {
        let change = DesiredChange::from_delta(delta).ok_or_else(|| {
            TwinError::Protocol("desired delta carries no $version marker".to_string())
        })?;
        self.inject(TransportEvent::DesiredPropertiesChanged {
            version: change.version,
            delta: change.delta,
        });
        Ok(())
    }

    /// Invoke a registered command handler by wire name
    pub fn invoke_command(&self, name: &str, payload: Value) -> TwinResult<Value> {
        let handler = self
            .state
            .lock()
            .commands
            .get(name)
            .cloned()
            .ok_or_else(|| TwinError::InvalidOperation(format!("no command handler: {name}")))?;
        handler(payload)
    }

    /// Wire names with registered command handlers
    pub fn command_names(&self) -> Vec<String> {
        self.state.lock().commands.keys().cloned().collect()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

/// Merge a reported patch into a tree with twin patch semantics:
/// null deletes the key, objects merge recursively, anything else replaces
fn merge_patch(target: &mut Value, patch: &Value) {
    let Some(patch_map) = patch.as_object() else {
        *target = patch.clone();
        return;
    };

    if !target.is_object() {
        *target = Value::Object(serde_json::Map::new());
    }
    let target_map = target.as_object_mut().expect("target coerced to object");

    for (key, value) in patch_map {
        if value.is_null() {
            target_map.remove(key);
        } else if value.is_object() {
            let slot = target_map
                .entry(key.clone())
                .or_insert(Value::Object(serde_json::Map::new()));
            merge_patch(slot, value);
        } else {
            target_map.insert(key.clone(), value.clone());
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self, credential: &DeviceCredential) -> TwinResult<()> {
        let mut state = self.state.lock();
        state.open_attempts += 1;
        state.last_credential = Some(credential.clone());

        if state.open_failures_remaining > 0 {
            state.open_failures_remaining -= 1;
            return Err(TwinError::Transport("scripted open failure".to_string()));
        }

        state.open = true;
        drop(state);
        let _ = self.events_tx.send(TransportEvent::Connected);
        Ok(())
    }

    async fn close(&self) -> TwinResult<()> {
        self.state.lock().open = false;
        Ok(())
    }

    async fn get_twin(&self) -> TwinResult<TwinDocument> {
        let state = self.state.lock();
        if !state.open {
            return Err(TwinError::Transport("not connected".to_string()));
        }
        Ok(state.twin.clone())
    }

    async fn update_reported(&self, patch: Value) -> TwinResult<()> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(TwinError::Transport("not connected".to_string()));
        }
        merge_patch(&mut state.twin.reported, &patch);
        state.reported_patches.push(patch);
        Ok(())
    }

    async fn send_message(&self, message: TelemetryMessage) -> TwinResult<()> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(TwinError::Transport("not connected".to_string()));
        }
        state.sent_messages.push(message);
        Ok(())
    }

    fn on_command(&self, name: &str, handler: CommandHandler) {
        self.state.lock().commands.insert(name.to_string(), handler);
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events_tx.subscribe()
    }
}
