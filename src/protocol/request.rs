//! Inbound requests
//!
//! A request line is a JSON object. Without `inputEncode` its fields are
//! plain JSON; with it, every field is tagged and goes through the codec.

use std::collections::BTreeMap;

use serde_json::{Map, Value as Json};
use tracing::debug;

use crate::bridge::{Bridge, CallId};
use crate::error::{Error, Result};
use crate::protocol::schema::NO_OWNER;
use crate::registry::Handle;
use crate::value::Value;

/// Action name of a reply to a remote call
pub const REPLY_ACTION: &str = "ret";

/// Parse one input line. Anything that is not a JSON object yields `None`.
pub fn parse_line(line: &str) -> Option<Map<String, Json>> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str::<Json>(line) {
        Ok(Json::Object(fields)) => Some(fields),
        Ok(other) => {
            debug!(kind = json_kind(&other), "Ignoring non-object line");
            None
        }
        Err(e) => {
            debug!(error = %e, "Ignoring malformed line");
            None
        }
    }
}

fn json_kind(json: &Json) -> &'static str {
    match json {
        Json::Null => "null",
        Json::Bool(_) => "boolean",
        Json::Number(_) => "number",
        Json::String(_) => "string",
        Json::Array(_) => "array",
        Json::Object(_) => "object",
    }
}

/// Routing fields copied verbatim from the raw message
#[derive(Debug, Clone, Default)]
pub struct Envelope {
    /// Request ID
    pub id: Json,
    /// Raw `vmId`
    pub vm_id: Option<Json>,
    /// Raw `moduleId`
    pub module_id: Option<Json>,
}

impl Envelope {
    /// Capture the routing fields of a raw message
    pub fn capture(fields: &Map<String, Json>) -> Self {
        Envelope {
            id: fields.get("id").cloned().unwrap_or(Json::Null),
            vm_id: fields.get("vmId").filter(|v| !v.is_null()).cloned(),
            module_id: fields.get("moduleId").filter(|v| !v.is_null()).cloned(),
        }
    }

    /// Owner for remote references decoded from this message
    pub fn owner(&self) -> i64 {
        self.vm_id
            .as_ref()
            .and_then(Json::as_i64)
            .unwrap_or(NO_OWNER)
    }
}

/// A decoded inbound request
#[derive(Debug, Default)]
pub struct Request {
    /// Action name
    pub action: String,
    /// Target session
    pub vm_id: Option<Handle>,
    /// Target module
    pub module_id: Option<Handle>,
    /// Session flavor for `create`
    pub flavor: Option<String>,
    /// Engine options for `create`
    pub options: Value,
    /// Source code
    pub code: Option<String>,
    /// Module file name
    pub filename: Option<String>,
    /// Global function name for `call` on a plain session
    pub function_name: Option<String>,
    /// Member name
    pub member: Option<String>,
    /// Value for `setMember`
    pub arg: Value,
    /// Call arguments
    pub args: Vec<Value>,
    /// Local function reference for `callJsFunc`
    pub ids: Value,
    /// Correlation id of a reply
    pub cid: Option<CallId>,
    /// Reply value
    pub value: Value,
    /// Reply error
    pub error: Option<String>,
}

impl Request {
    /// Build a request from a raw message, decoding through `bridge` as needed
    pub fn from_fields(fields: &Map<String, Json>, bridge: &Bridge) -> Result<Request> {
        let owner = Envelope::capture(fields).owner();
        let input_encode = fields.get("inputEncode").is_some_and(json_truthy);

        let mut live: BTreeMap<String, Value> = BTreeMap::new();
        for (key, raw) in fields {
            // The id is echoed verbatim and never interpreted
            if key == "id" || key == "inputEncode" {
                continue;
            }
            let value = if input_encode {
                bridge.decode(raw, owner)?
            } else {
                Value::from_plain_json(raw)
            };
            live.insert(key.clone(), value);
        }

        let action = match live.remove("action") {
            Some(Value::String(action)) => action,
            Some(Value::Undefined) | Some(Value::Null) | None => {
                return Err(Error::InvalidInput("message has no action".to_string()))
            }
            Some(other) => return Err(Error::UnknownAction(other.type_name().to_string())),
        };

        // Replies carry tagged values even when the rest of the message is plain
        if action == REPLY_ACTION && !input_encode {
            if let Some(raw) = fields.get("value") {
                live.insert("value".to_string(), bridge.decode(raw, owner)?);
            }
        }

        let mut take = |key: &str| live.remove(key).unwrap_or_default();

        Ok(Request {
            vm_id: handle_field("vmId", take("vmId"))?,
            module_id: handle_field("moduleId", take("moduleId"))?,
            flavor: string_field("type", take("type"))?,
            options: take("options"),
            code: string_field("code", take("code"))?,
            filename: string_field("filename", take("filename"))?,
            function_name: string_field("functionName", take("functionName"))?,
            member: string_field("member", take("member"))?,
            arg: take("arg"),
            args: args_field(take("args"))?,
            ids: take("ids"),
            cid: handle_field("cid", take("cid"))?,
            value: take("value"),
            error: error_field(take("error")),
            action,
        })
    }

    /// Session this request targets
    pub fn session(&self) -> Result<Handle> {
        self.vm_id
            .ok_or_else(|| Error::NotFound("undefined".to_string()))
    }

    /// Module this request targets
    pub fn module(&self) -> Result<Handle> {
        self.module_id
            .ok_or_else(|| Error::NotFound("undefined".to_string()))
    }

    /// Source code, required
    pub fn require_code(&self) -> Result<&str> {
        self.code
            .as_deref()
            .ok_or_else(|| Error::InvalidInput(format!("{} requires code", self.action)))
    }

    /// Member name, required
    pub fn require_member(&self) -> Result<&str> {
        self.member
            .as_deref()
            .ok_or_else(|| Error::InvalidInput(format!("{} requires a member", self.action)))
    }
}

fn json_truthy(json: &Json) -> bool {
    match json {
        Json::Null => false,
        Json::Bool(b) => *b,
        Json::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Json::String(s) => !s.is_empty(),
        Json::Array(_) | Json::Object(_) => true,
    }
}

fn is_absent(value: &Value) -> bool {
    matches!(value, Value::Undefined | Value::Null)
}

fn handle_field(name: &str, value: Value) -> Result<Option<u64>> {
    if is_absent(&value) {
        return Ok(None);
    }
    let handle = match &value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    handle
        .map(Some)
        .ok_or_else(|| Error::InvalidInput(format!("{} must be a non-negative integer", name)))
}

fn string_field(name: &str, value: Value) -> Result<Option<String>> {
    match value {
        Value::Undefined | Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s)),
        other => Err(Error::InvalidInput(format!(
            "{} must be a string, got {}",
            name,
            other.type_name()
        ))),
    }
}

fn args_field(value: Value) -> Result<Vec<Value>> {
    match value {
        Value::Undefined | Value::Null => Ok(Vec::new()),
        Value::Array(items) => Ok(items),
        other => Err(Error::InvalidInput(format!(
            "args must be an array, got {}",
            other.type_name()
        ))),
    }
}

fn error_field(value: Value) -> Option<String> {
    match value {
        Value::Undefined | Value::Null => None,
        Value::String(s) => Some(s),
        Value::Bool(false) => None,
        other => Some(format!("remote side raised a {}", other.type_name())),
    }
}
