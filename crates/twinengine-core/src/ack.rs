//! Writable-property acknowledgement envelopes
//!
//! When the service proposes a change to a writable property, the device
//! answers with a structured acknowledgement carrying the applied value, a
//! numeric status code, a human-readable description, and the desired-tree
//! version the ack responds to. An ack is distinguished from a plain value
//! structurally: it is a JSON object bearing all four fields at once.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::types::TwinVersion;

/// Status code reported when a writable-property update was applied
pub const ACK_CODE_SUCCESS: i64 = 200;

/// Status code reported when a writable-property update failed
pub const ACK_CODE_FAILURE: i64 = 400;

/// Acknowledgement envelope for a writable-property change
///
/// Produced by the engine in response to a desired-property change. A property
/// handler may customize the success envelope by returning [`AckOverrides`];
/// failure envelopes are never customizable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WritablePropertyAck {
    /// The value the device applied (or attempted to apply)
    pub value: Value,
    /// Numeric status code (200 success, 400 failure)
    #[serde(rename = "ackCode")]
    pub ack_code: i64,
    /// Human-readable status description
    #[serde(rename = "ackDescription")]
    pub ack_description: String,
    /// Desired-tree version under which the change was observed
    #[serde(rename = "ackVersion")]
    pub ack_version: TwinVersion,
}

impl WritablePropertyAck {
    /// Serialize the envelope to its wire JSON form
    pub fn to_value(&self) -> Value {
        json!({
            "value": self.value,
            "ackCode": self.ack_code,
            "ackDescription": self.ack_description,
            "ackVersion": self.ack_version,
        })
    }
}

/// Partial acknowledgement returned by a property handler to customize the
/// default success envelope
///
/// The `ackVersion` field is never overridable: it always echoes the version
/// under which the change was observed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AckOverrides {
    /// Replacement for the applied value
    pub value: Option<Value>,
    /// Replacement status code
    pub ack_code: Option<i64>,
    /// Replacement status description
    pub ack_description: Option<String>,
}

/// Check whether a value is an acknowledgement envelope
///
/// True iff the value is a JSON object bearing all four ack fields
/// simultaneously. Used to distinguish a raw property value from an ack when
/// normalizing reported state for user consumption.
pub fn is_ack(value: &Value) -> bool {
    match value.as_object() {
        Some(map) => {
            map.contains_key("value")
                && map.contains_key("ackCode")
                && map.contains_key("ackDescription")
                && map.contains_key("ackVersion")
        }
        None => false,
    }
}

/// Build the acknowledgement envelope for a writable-property change
///
/// On success the envelope reports code 200 and merges any handler-supplied
/// `overrides` over the defaults. On failure the envelope reports code 400 and
/// `overrides` are ignored entirely. In both cases `ack_version` is the
/// desired-tree version under which the change was observed.
pub fn build_ack(
    property: &str,
    value: &Value,
    version: TwinVersion,
    overrides: Option<AckOverrides>,
    success: bool,
) -> WritablePropertyAck {
    if !success {
        return WritablePropertyAck {
            value: value.clone(),
            ack_code: ACK_CODE_FAILURE,
            ack_description: format!("Updating ({}) state to ({}) failed", property, value),
            ack_version: version,
        };
    }

    let mut ack = WritablePropertyAck {
        value: value.clone(),
        ack_code: ACK_CODE_SUCCESS,
        ack_description: format!("Successfully updated ({}) to ({})", property, value),
        ack_version: version,
    };

    if let Some(overrides) = overrides {
        if let Some(v) = overrides.value {
            ack.value = v;
        }
        if let Some(code) = overrides.ack_code {
            ack.ack_code = code;
        }
        if let Some(desc) = overrides.ack_description {
            ack.ack_description = desc;
        }
    }

    ack
}
