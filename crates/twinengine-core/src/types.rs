//! Core types for TwinEngine

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{TwinError, TwinResult};

/// Version number assigned by the service to the desired property tree.
///
/// Monotonically increasing; echoed back in every acknowledgement envelope
/// so the service can correlate acks with the change that triggered them.
pub type TwinVersion = i64;

/// Reserved key carrying the desired-property version in a twin tree
pub const VERSION_KEY: &str = "$version";

/// Reserved key marking a twin subtree as a component
pub const COMPONENT_MARKER_KEY: &str = "__t";

/// Value of the component marker key
pub const COMPONENT_MARKER_VALUE: &str = "c";

/// Prefix of reserved protocol fields in twin trees
pub const RESERVED_PREFIX: char = '$';

/// Default routing header carrying the telemetry message type
pub const DEFAULT_TYPE_HEADER: &str = "x-message-type";

/// Routing header carrying the component key for component-scoped telemetry
pub const COMPONENT_HEADER: &str = "x-component";

/// Separator between component key and command name in scoped command names
pub const COMMAND_SEPARATOR: char = '*';

/// The bidirectional, versioned property document synchronized with the service
///
/// `desired` holds service-proposed values (including the `$version` marker);
/// `reported` holds device-asserted values. Reported updates are submitted as
/// partial patches, never as a full tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TwinDocument {
    /// Service-proposed property tree, carries `$version`
    #[serde(default)]
    pub desired: Value,
    /// Device-asserted property tree
    #[serde(default)]
    pub reported: Value,
}

impl TwinDocument {
    /// Create an empty twin document with object trees on both sides
    pub fn new() -> Self {
        Self {
            desired: Value::Object(serde_json::Map::new()),
            reported: Value::Object(serde_json::Map::new()),
        }
    }

    /// Parse a raw twin payload as received from the transport
    ///
    /// # Errors
    ///
    /// Returns `TwinError::Protocol` if the payload is not an object or does
    /// not deserialize into the two property trees.
    pub fn from_json(value: Value) -> TwinResult<Self> {
        if !value.is_object() {
            return Err(TwinError::Protocol(
                "twin payload is not a JSON object".to_string(),
            ));
        }
        serde_json::from_value(value)
            .map_err(|err| TwinError::Protocol(format!("malformed twin payload: {err}")))
    }

    /// The version of the desired property tree, if present
    pub fn desired_version(&self) -> Option<TwinVersion> {
        self.desired.get(VERSION_KEY).and_then(Value::as_i64)
    }
}

/// A desired-property-change notification from the service
///
/// Carries the delta (only the changed subtrees) and the version of the
/// desired tree after the change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesiredChange {
    /// Desired tree version after this change
    pub version: TwinVersion,
    /// Changed subtrees, keyed by component key
    pub delta: Value,
}

impl DesiredChange {
    /// Build a notification from a raw delta, reading the version out of the
    /// tree's `$version` marker
    ///
    /// Returns `None` if the delta carries no version marker.
    pub fn from_delta(delta: Value) -> Option<Self> {
        let version = delta.get(VERSION_KEY).and_then(Value::as_i64)?;
        Some(Self { version, delta })
    }
}

/// Build the wire name for a component-scoped command
///
/// Component-scoped commands are named `"{componentKey}*{commandName}"`;
/// device-scoped commands use the bare name (pass `None`).
pub fn command_name(component: Option<&str>, name: &str) -> String {
    match component {
        Some(key) => format!("{}{}{}", key, COMMAND_SEPARATOR, name),
        None => name.to_string(),
    }
}
