//! Outbound wire frames
//!
//! Defines the shapes written to the output stream: responses to requests and
//! unprompted events.

use serde::Serialize;
use serde_json::Value as Json;
use tokio::sync::mpsc;

/// Event name for console output forwarded from a session
pub const CONSOLE_EVENT: &str = "console.log";

/// Event name for a call into a remote function
pub const REMOTE_CALL_EVENT: &str = "pyfun";

/// Owner reported for remote calls that no session owns
pub const NO_OWNER: i64 = -1;

/// Item queued for the output writer
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// One serialized line, without the trailing newline
    Line(String),
    /// Flush what was queued before and stop writing
    Shutdown,
}

/// Sending half of the output queue
pub type Outbound = mpsc::UnboundedSender<Frame>;

/// Receiving half of the output queue
pub type OutboundReceiver = mpsc::UnboundedReceiver<Frame>;

/// Create the output queue
pub fn outbound_channel() -> (Outbound, OutboundReceiver) {
    mpsc::unbounded_channel()
}

/// Response status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Error,
}

/// Response frame - exactly one per answered request
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseFrame {
    /// Request ID, echoed verbatim
    pub id: Json,
    /// Always `"response"`
    #[serde(rename = "type")]
    pub kind: &'static str,
    /// Outcome of the request
    pub status: Status,
    /// Encoded result value
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Json>,
    /// Error message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Session handle, echoed from the request
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vm_id: Option<Json>,
    /// Module handle, echoed from the request
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module_id: Option<Json>,
    /// Marks `value` as tagged
    pub output_encode: bool,
}

impl ResponseFrame {
    /// Create a success response carrying an already encoded value
    pub fn success(id: Json, value: Option<Json>) -> Self {
        ResponseFrame {
            id,
            kind: "response",
            status: Status::Success,
            value,
            error: None,
            vm_id: None,
            module_id: None,
            output_encode: true,
        }
    }

    /// Create an error response
    pub fn error(id: Json, message: impl Into<String>) -> Self {
        ResponseFrame {
            id,
            kind: "response",
            status: Status::Error,
            value: None,
            error: Some(message.into()),
            vm_id: None,
            module_id: None,
            output_encode: true,
        }
    }

    /// Echo the routing fields of the request
    pub fn with_routing(mut self, vm_id: Option<Json>, module_id: Option<Json>) -> Self {
        self.vm_id = vm_id;
        self.module_id = module_id;
        self
    }
}

/// Event frame - written unprompted between responses
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventFrame {
    /// Always `"event"`
    #[serde(rename = "type")]
    pub kind: &'static str,
    /// Event name
    pub name: &'static str,
    /// Remote function tag, for remote calls
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<String>,
    /// Session the event belongs to
    pub vm_id: i64,
    /// Event payload
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Json>,
    /// Correlation ID, for remote calls
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cid: Option<u64>,
    /// Marks `value` as tagged
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub output_encode: bool,
}

impl EventFrame {
    /// Console output from a session; the text is sent untagged
    pub fn console(vm_id: u64, text: impl Into<String>) -> Self {
        EventFrame {
            kind: "event",
            name: CONSOLE_EVENT,
            ids: None,
            vm_id: i64::try_from(vm_id).unwrap_or(i64::MAX),
            value: Some(Json::String(text.into())),
            cid: None,
            output_encode: false,
        }
    }

    /// Request to run a remote function; `args` is the encoded argument array
    pub fn remote_call(ids: String, owner: i64, args: Json, cid: u64) -> Self {
        EventFrame {
            kind: "event",
            name: REMOTE_CALL_EVENT,
            ids: Some(ids),
            vm_id: owner,
            value: Some(args),
            cid: Some(cid),
            output_encode: true,
        }
    }
}
