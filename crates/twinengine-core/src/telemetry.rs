//! Outbound telemetry envelopes
//!
//! Telemetry is `{type, payload, properties}`: the payload travels as the
//! message body, the type as a routing header under a configurable header
//! name (default `x-message-type`), and component-scoped messages carry an
//! additional component-marker header so the service can route per component.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use ulid::Ulid;

use crate::types::COMPONENT_HEADER;

/// One outbound telemetry message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryMessage {
    /// Correlation id, generated at construction
    pub message_id: String,
    /// Message body
    pub payload: Value,
    /// Routing type, carried as a header
    pub message_type: Option<String>,
    /// Additional application properties, carried as headers
    pub properties: HashMap<String, String>,
    /// Component key for component-scoped telemetry
    pub component: Option<String>,
}

impl TelemetryMessage {
    /// Create a device-scoped telemetry message
    pub fn new(payload: Value) -> Self {
        Self {
            message_id: Ulid::new().to_string(),
            payload,
            message_type: None,
            properties: HashMap::new(),
            component: None,
        }
    }

    /// Set the routing type
    pub fn with_type(mut self, message_type: impl Into<String>) -> Self {
        self.message_type = Some(message_type.into());
        self
    }

    /// Add an application property
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Scope the message to a component
    pub fn for_component(mut self, component: impl Into<String>) -> Self {
        self.component = Some(component.into());
        self
    }

    /// Fold the routing headers into the application properties
    ///
    /// The engine calls this on the send path with its configured type header
    /// name, so the transport receives every header in `properties` and needs
    /// no knowledge of the engine configuration.
    pub fn materialize_headers(mut self, type_header: &str) -> Self {
        self.properties = self.headers(type_header);
        self
    }

    /// Materialize the routing headers for this message
    ///
    /// `type_header` is the configured header name for the message type
    /// ([`DEFAULT_TYPE_HEADER`](crate::types::DEFAULT_TYPE_HEADER) unless
    /// overridden in the engine config).
    pub fn headers(&self, type_header: &str) -> HashMap<String, String> {
        let mut headers = self.properties.clone();
        if let Some(message_type) = &self.message_type {
            headers.insert(type_header.to_string(), message_type.clone());
        }
        if let Some(component) = &self.component {
            headers.insert(COMPONENT_HEADER.to_string(), component.clone());
        }
        headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DEFAULT_TYPE_HEADER;
    use serde_json::json;

    #[test]
    fn test_message_ids_are_unique() {
        let a = TelemetryMessage::new(json!({}));
        let b = TelemetryMessage::new(json!({}));
        assert_ne!(a.message_id, b.message_id);
    }

    #[test]
    fn test_type_header_carries_message_type() {
        let msg = TelemetryMessage::new(json!({"t": 21.5})).with_type("environment");
        let headers = msg.headers(DEFAULT_TYPE_HEADER);
        assert_eq!(headers.get("x-message-type").map(String::as_str), Some("environment"));
        assert!(!headers.contains_key(COMPONENT_HEADER));
    }

    #[test]
    fn test_configurable_type_header_name() {
        let msg = TelemetryMessage::new(json!({})).with_type("boot");
        let headers = msg.headers("msg-kind");
        assert_eq!(headers.get("msg-kind").map(String::as_str), Some("boot"));
        assert!(!headers.contains_key(DEFAULT_TYPE_HEADER));
    }

    #[test]
    fn test_component_scoped_message_carries_marker_header() {
        let msg = TelemetryMessage::new(json!({"t": 21.5}))
            .with_type("environment")
            .for_component("thermostat");
        let headers = msg.headers(DEFAULT_TYPE_HEADER);
        assert_eq!(headers.get(COMPONENT_HEADER).map(String::as_str), Some("thermostat"));
    }

    #[test]
    fn test_materialize_headers_folds_into_properties() {
        let msg = TelemetryMessage::new(json!({}))
            .with_type("boot")
            .for_component("thermostat")
            .materialize_headers("msg-kind");
        assert_eq!(msg.properties.get("msg-kind").map(String::as_str), Some("boot"));
        assert_eq!(
            msg.properties.get(COMPONENT_HEADER).map(String::as_str),
            Some("thermostat")
        );
    }

    #[test]
    fn test_custom_properties_become_headers() {
        let msg = TelemetryMessage::new(json!({})).with_property("priority", "high");
        let headers = msg.headers(DEFAULT_TYPE_HEADER);
        assert_eq!(headers.get("priority").map(String::as_str), Some("high"));
    }
}
