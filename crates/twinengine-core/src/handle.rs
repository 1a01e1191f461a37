//! Per-component client handle
//!
//! A `ComponentHandle` is the component-facing surface of the engine: report
//! and query the component's twin subtree, send component-scoped telemetry,
//! register component-scoped commands, and upload files. Handles are cheap to
//! clone and share the engine they were created from.

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::debug;

use crate::codec::normalize;
use crate::engine::EngineInner;
use crate::error::{TwinError, TwinResult};
use crate::telemetry::TelemetryMessage;
use crate::transport::{CommandHandler, UploadOutcome};
use crate::types::{command_name, COMPONENT_MARKER_KEY, COMPONENT_MARKER_VALUE};

/// Handle to one registered component
#[derive(Clone)]
pub struct ComponentHandle {
    inner: Arc<EngineInner>,
    key: String,
}

impl std::fmt::Debug for ComponentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentHandle")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl ComponentHandle {
    pub(crate) fn new(inner: Arc<EngineInner>, key: String) -> Self {
        Self { inner, key }
    }

    /// The component key
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The component's declared writable properties
    pub fn writable_properties(&self) -> Vec<String> {
        let registry = self.inner.registry.lock();
        registry
            .lookup(&self.key)
            .map(|entry| entry.component().writable_properties.clone())
            .unwrap_or_default()
    }

    /// Report a partial state patch for this component
    ///
    /// The patch is wrapped under the component key and merged with the
    /// component marker before submission.
    ///
    /// # Errors
    ///
    /// Returns `TwinError::InvalidOperation` if the patch is not a JSON
    /// object; `TwinError::Transport` if the report call fails.
    pub async fn report_state(&self, patch: Value) -> TwinResult<()> {
        let Some(fields) = patch.as_object() else {
            return Err(TwinError::InvalidOperation(
                "component state patch must be a JSON object".to_string(),
            ));
        };

        let mut inner_map = Map::new();
        inner_map.insert(
            COMPONENT_MARKER_KEY.to_string(),
            Value::String(COMPONENT_MARKER_VALUE.to_string()),
        );
        for (key, value) in fields {
            inner_map.insert(key.clone(), value.clone());
        }

        let mut wrapped = Map::new();
        wrapped.insert(self.key.clone(), Value::Object(inner_map));

        debug!(component = %self.key, "Reporting state patch");
        self.inner
            .transport
            .update_reported(Value::Object(wrapped))
            .await
    }

    /// Report state computed from the current reported state
    ///
    /// Fetches the component's reported state fresh and passes it to `f` to
    /// compute the patch. The read-modify-write is not atomic against
    /// concurrent external reporters; callers needing that must serialize
    /// externally.
    pub async fn report_state_with<F>(&self, f: F) -> TwinResult<()>
    where
        F: FnOnce(Option<Value>) -> Value,
    {
        let current = self.get_reported_state().await?;
        self.report_state(f(current)).await
    }

    /// Clear the component's reported state entirely
    ///
    /// Reports `null` for the whole component key, which downstream
    /// interprets as full removal.
    pub async fn clear(&self) -> TwinResult<()> {
        debug!(component = %self.key, "Clearing reported state");
        let mut wrapped = Map::new();
        wrapped.insert(self.key.clone(), Value::Null);
        self.inner
            .transport
            .update_reported(Value::Object(wrapped))
            .await
    }

    /// The component's reported state, normalized for user consumption
    ///
    /// Fetches the whole twin, extracts this component's subtree, strips
    /// protocol metadata, and unwraps acknowledgement envelopes. `None` when
    /// the component key is absent.
    pub async fn get_reported_state(&self) -> TwinResult<Option<Value>> {
        let twin = self.inner.transport.get_twin().await?;
        Ok(extract_normalized(&twin.reported, &self.key))
    }

    /// The component's desired state, normalized for user consumption
    pub async fn get_desired_state(&self) -> TwinResult<Option<Value>> {
        let twin = self.inner.transport.get_twin().await?;
        Ok(extract_normalized(&twin.desired, &self.key))
    }

    /// Send telemetry scoped to this component
    ///
    /// The message carries the component-marker header in addition to any
    /// type header; both are folded into the message properties under the
    /// engine's configured header names before the transport sees them.
    pub async fn send_telemetry(&self, message: TelemetryMessage) -> TwinResult<()> {
        let message = message
            .for_component(self.key.clone())
            .materialize_headers(&self.inner.config.type_header);
        self.inner.transport.send_message(message).await
    }

    /// Register a component-scoped command handler
    ///
    /// The wire name is `"{componentKey}*{name}"`.
    pub fn on_command(&self, name: &str, handler: CommandHandler) {
        self.inner
            .transport
            .on_command(&command_name(Some(&self.key), name), handler);
    }

    /// Upload a named blob through the configured upload collaborator
    ///
    /// # Errors
    ///
    /// Returns `TwinError::Configuration` if no blob upload collaborator was
    /// attached to the engine.
    pub async fn upload_file(&self, name: &str, data: &[u8]) -> TwinResult<UploadOutcome> {
        let uploader = self.inner.uploader.as_ref().ok_or_else(|| {
            TwinError::Configuration("no blob upload collaborator configured".to_string())
        })?;
        uploader.upload(name, data).await
    }
}

/// Extract a component subtree from a twin side and normalize it; `None` when
/// the key is absent or null
fn extract_normalized(tree: &Value, key: &str) -> Option<Value> {
    match tree.get(key) {
        None | Some(Value::Null) => None,
        Some(subtree) => Some(normalize(subtree)),
    }
}
