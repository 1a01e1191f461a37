//! Handler dispatch for desired-property changes
//!
//! One notification from the service carries a versioned delta touching any
//! number of components and properties. Dispatch routes each piece to the
//! registered handlers and turns the outcomes into acknowledgement patches:
//!
//! ```text
//! delta ──strip──► (componentKey, componentDelta)*
//!                     │
//!                     ├── component handler(componentDelta, version)
//!                     │     errors logged, processing continues
//!                     │
//!                     └──strip──► (propertyKey, value)*
//!                                   │  (writable properties only)
//!                                   ├── property handler(value, version)
//!                                   └── build_ack ──► reported patch
//! ```
//!
//! Each ack patch is reported with its own call; there is no atomicity across
//! properties in one notification, and partial acknowledgement on partial
//! handler failure is expected.

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::ack::{build_ack, WritablePropertyAck};
use crate::codec::strip_metadata;
use crate::registry::ComponentRegistry;
use crate::types::{DesiredChange, COMPONENT_MARKER_KEY, COMPONENT_MARKER_VALUE};

/// Wrap an acknowledgement as a reported patch under its component key,
/// merged with the component marker
pub fn ack_patch(component_key: &str, property: &str, ack: &WritablePropertyAck) -> Value {
    let mut inner = Map::new();
    inner.insert(
        COMPONENT_MARKER_KEY.to_string(),
        Value::String(COMPONENT_MARKER_VALUE.to_string()),
    );
    inner.insert(property.to_string(), ack.to_value());

    let mut patch = Map::new();
    patch.insert(component_key.to_string(), Value::Object(inner));
    Value::Object(patch)
}

/// Process one desired-property-change notification against the registry
///
/// Deterministic and synchronous: invokes component handlers, then property
/// handlers for declared writable properties, and returns one reported patch
/// per acknowledged property. Properties not declared writable are observed
/// by component handlers but never acknowledged.
///
/// Handler error policy: component-handler errors are logged and processing
/// continues; property-handler errors become failure (400) acknowledgements.
/// The device never crashes due to a user handler's error.
pub fn dispatch_desired_change(registry: &ComponentRegistry, change: &DesiredChange) -> Vec<Value> {
    let mut patches = Vec::new();

    for (component_key, component_delta) in strip_metadata(&change.delta) {
        let Some(entry) = registry.lookup(&component_key) else {
            debug!(component = %component_key, "Delta for unregistered component, skipping");
            continue;
        };

        // Handlers never see protocol metadata (component marker, reserved
        // fields inside the component delta)
        let properties = strip_metadata(&component_delta);
        let clean_delta = Value::Object(properties.iter().cloned().collect::<Map<String, Value>>());

        if let Some(handler) = entry.component_handler() {
            if let Err(err) = handler(&clean_delta, change.version) {
                warn!(
                    component = %component_key,
                    version = change.version,
                    %err,
                    "Component handler failed"
                );
            }
        }

        for (property, value) in properties {
            if !entry.component().is_writable(&property) {
                debug!(
                    component = %component_key,
                    %property,
                    "Property not declared writable, no acknowledgement"
                );
                continue;
            }

            // Absence of a handler counts as success with no overrides
            let (overrides, success) = match entry.property_handler(&property) {
                Some(handler) => match handler(&value, change.version) {
                    Ok(overrides) => (overrides, true),
                    Err(err) => {
                        warn!(
                            component = %component_key,
                            %property,
                            version = change.version,
                            %err,
                            "Property handler failed, acknowledging with 400"
                        );
                        (None, false)
                    }
                },
                None => (None, true),
            };

            let ack = build_ack(&property, &value, change.version, overrides, success);
            patches.push(ack_patch(&component_key, &property, &ack));
        }
    }

    patches
}
