//! Wire envelope exchanged over the transport

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::identity::EndpointId;

/// Periodic readiness announcement sent by the host before the guest is known to be alive
pub const BOOTSTRAP_MESSAGE_TYPE: &str = "guestlink-bootstrap";
/// Guest -> host: the guest endpoint exists and wants the initial state snapshot
pub const WEB_CLIENT_CREATED: &str = "guestlinkWebClientCreated";
/// Guest -> host: outcome of the guest's own initialization
pub const WEB_CLIENT_INITIALIZED: &str = "guestlinkWebClientInitialized";
/// Host -> guest: a named observable state changed
pub const STATE_CHANGED: &str = "guestlinkStateChanged";
/// Guest -> host: the guest would like its container resized
pub const RESIZE_WINDOW: &str = "guestlinkResizeWindow";

/// Request types that business handlers may never claim
pub const RESERVED_REQUEST_TYPES: &[&str] = &[
    BOOTSTRAP_MESSAGE_TYPE,
    WEB_CLIENT_CREATED,
    WEB_CLIENT_INITIALIZED,
    STATE_CHANGED,
    RESIZE_WINDOW,
];

/// Check whether a request type belongs to the bridge itself
pub fn is_reserved(request_type: &str) -> bool {
    RESERVED_REQUEST_TYPES.contains(&request_type)
}

/// Serializable form of a handler failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEnvelope {
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason_code: Option<i64>,
}

/// The unit exchanged over a transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub request_type: String,
    pub request_id: u64,
    pub sender_id: EndpointId,
    pub is_response: bool,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorEnvelope>,
}

impl Envelope {
    /// Create an outbound request
    pub fn request(
        request_type: impl Into<String>,
        request_id: u64,
        sender_id: EndpointId,
        payload: Value,
    ) -> Self {
        Self {
            request_type: request_type.into(),
            request_id,
            sender_id,
            is_response: false,
            payload,
            error: None,
        }
    }

    /// Create a request that must not be answered.
    ///
    /// Request id 0 is never allocated to a correlated request, so it marks
    /// notifications on the wire.
    pub fn notification(request_type: impl Into<String>, sender_id: EndpointId, payload: Value) -> Self {
        Self::request(request_type, 0, sender_id, payload)
    }

    /// Create a successful response to `request`.
    ///
    /// Responses echo the requester's identity so only the originating sender
    /// accepts them.
    pub fn response(request: &Envelope, payload: Value) -> Self {
        Self {
            request_type: request.request_type.clone(),
            request_id: request.request_id,
            sender_id: request.sender_id.clone(),
            is_response: true,
            payload,
            error: None,
        }
    }

    /// Create a failed response to `request`
    pub fn failure(request: &Envelope, error: ErrorEnvelope) -> Self {
        Self {
            request_type: request.request_type.clone(),
            request_id: request.request_id,
            sender_id: request.sender_id.clone(),
            is_response: true,
            payload: Value::Null,
            error: Some(error),
        }
    }

    /// Create the host's bootstrap announcement
    pub fn bootstrap(sender_id: EndpointId, payload: Value) -> Self {
        Self::notification(BOOTSTRAP_MESSAGE_TYPE, sender_id, payload)
    }

    /// Whether the receiver owes the sender a response
    pub fn expects_response(&self) -> bool {
        !self.is_response && self.request_id != 0
    }

    pub fn is_bootstrap(&self) -> bool {
        !self.is_response && self.request_type == BOOTSTRAP_MESSAGE_TYPE
    }

    /// Encode for byte-oriented transports
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Decode from byte-oriented transports
    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}

/// Response to the reserved created call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedResponse {
    /// Initial value of every named state, keyed by name
    pub initial_state: Map<String, Value>,
}

/// Guest's report on its own initialization
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializationReport {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<ErrorEnvelope>,
}

/// One named state change pushed from the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChange {
    pub name: String,
    pub value: Value,
}

/// Size requested for the guest's container, in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestSize {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResizeOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl ResizeOptions {
    /// Animation length in whole milliseconds, saturating at `u64::MAX`
    pub fn with_duration(duration: Option<Duration>) -> Self {
        Self {
            duration_ms: duration.map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
        }
    }
}

/// Payload of the reserved resize request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizeRequest {
    pub size: GuestSize,
    #[serde(default)]
    pub options: ResizeOptions,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_wire_format_is_camel_case() {
        let env = Envelope::request("echo", 7, EndpointId::from_raw("s1"), json!({"msg": "hi"}));
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "echo",
                "requestId": 7,
                "senderId": "s1",
                "isResponse": false,
                "payload": {"msg": "hi"},
            })
        );
    }

    #[test]
    fn test_failure_carries_error() {
        let req = Envelope::request("echo", 3, EndpointId::from_raw("s1"), Value::Null);
        let failed = Envelope::failure(
            &req,
            ErrorEnvelope {
                kind: "ErrorWithReason".to_string(),
                message: "scrollTo".to_string(),
                reason_code: Some(4),
            },
        );
        let value = serde_json::to_value(&failed).unwrap();
        assert_eq!(value["error"], json!({"kind": "ErrorWithReason", "message": "scrollTo", "reasonCode": 4}));
        assert_eq!(value["requestId"], json!(3));
        assert_eq!(value["isResponse"], json!(true));
    }

    #[test]
    fn test_missing_payload_defaults_to_null() {
        let env = Envelope::from_json(
            r#"{"type":"ping","requestId":1,"senderId":"x","isResponse":false}"#,
        )
        .unwrap();
        assert_eq!(env.payload, Value::Null);
        assert!(env.error.is_none());
    }

    #[test]
    fn test_reserved_types() {
        assert!(is_reserved(BOOTSTRAP_MESSAGE_TYPE));
        assert!(is_reserved(STATE_CHANGED));
        assert!(!is_reserved("echo"));
    }

    #[test]
    fn test_notifications_expect_no_response() {
        let sender = EndpointId::from_raw("s1");
        let notification = Envelope::notification("tick", sender.clone(), json!(1));
        assert_eq!(notification.request_id, 0);
        assert!(!notification.expects_response());

        let request = Envelope::request("echo", 5, sender, json!(1));
        assert!(request.expects_response());
        assert!(!Envelope::response(&request, json!(1)).expects_response());
        assert!(!Envelope::bootstrap(EndpointId::from_raw("host"), Value::Null).expects_response());
    }

    #[test]
    fn test_resize_duration_saturates() {
        assert_eq!(ResizeOptions::with_duration(None).duration_ms, None);
        assert_eq!(
            ResizeOptions::with_duration(Some(Duration::from_millis(250))).duration_ms,
            Some(250)
        );
        assert_eq!(ResizeOptions::with_duration(Some(Duration::MAX)).duration_ms, Some(u64::MAX));
    }

    #[test]
    fn test_bootstrap_envelope() {
        let env = Envelope::bootstrap(EndpointId::from_raw("host"), json!({"apiSource": "x"}));
        assert!(env.is_bootstrap());
        assert_eq!(env.request_id, 0);
    }

    #[test]
    fn test_resize_request_options_are_optional() {
        let request: ResizeRequest = serde_json::from_value(json!({
            "size": {"width": 400, "height": 300},
        }))
        .unwrap();
        assert_eq!(request.size, GuestSize { width: 400, height: 300 });
        assert_eq!(request.options.duration_ms, None);

        let timed: ResizeRequest = serde_json::from_value(json!({
            "size": {"width": 1, "height": 2},
            "options": {"durationMs": 150},
        }))
        .unwrap();
        assert_eq!(timed.options.duration_ms, Some(150));
    }

    #[test]
    fn test_initialization_report_wire_shape() {
        let ok = InitializationReport {
            success: true,
            exception: None,
        };
        assert_eq!(serde_json::to_value(&ok).unwrap(), json!({"success": true}));

        let failed: InitializationReport = serde_json::from_value(json!({
            "success": false,
            "exception": {"kind": "Error", "message": "no network"},
        }))
        .unwrap();
        assert_eq!(failed.exception.unwrap().message, "no network");
    }
}
