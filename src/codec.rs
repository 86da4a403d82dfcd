//! Value codec - live values to and from the tagged wire form
//!
//! Wire strings carry their kind in a prefix:
//! - `str<s>`: the literal string `s`
//! - `jsfun<n>`: local callable `n` from the [`FunctionTable`]
//! - `pyfun<id>`: callable owned by the remote side
//!
//! Numbers, booleans and `null` pass through. `undefined` has no JSON form:
//! it is dropped from maps and written as `null` inside arrays. Any other
//! prefix is rejected rather than evaluated.

use serde_json::Value as Json;

use crate::error::{Error, Result};
use crate::intern::{FunctionId, FunctionTable};
use crate::value::{Function, Value};

/// Prefix of a literal string
pub const STRING_TAG: &str = "str";
/// Prefix of a forward reference to a local callable
pub const LOCAL_FUNCTION_TAG: &str = "jsfun";
/// Prefix of a forward reference to a remote callable
pub const REMOTE_FUNCTION_TAG: &str = "pyfun";

/// Default nesting limit for arrays and maps
pub const DEFAULT_MAX_DEPTH: usize = 128;

/// Tag a literal string
pub fn tag_string(s: &str) -> String {
    format!("{}{}", STRING_TAG, s)
}

/// Wire form of a remote forward reference
pub fn remote_tag(remote_id: &str) -> String {
    format!("{}{}", REMOTE_FUNCTION_TAG, remote_id)
}

/// Wire form of a local forward reference
pub fn local_tag(id: FunctionId) -> String {
    format!("{}{}", LOCAL_FUNCTION_TAG, id)
}

/// Parse the id out of a `jsfun<n>` tag, a numeric string, or a number
pub fn parse_local_ref(value: &Value) -> Result<FunctionId> {
    let parsed = match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s
            .strip_prefix(LOCAL_FUNCTION_TAG)
            .unwrap_or(s)
            .trim()
            .parse()
            .ok(),
        _ => None,
    };
    parsed.ok_or_else(|| {
        Error::InvalidInput(format!("not a local function reference: {}", value.type_name()))
    })
}

/// Encoder/decoder for the tagged wire form
#[derive(Debug, Clone, Copy)]
pub struct Codec {
    max_depth: usize,
}

impl Default for Codec {
    fn default() -> Self {
        Codec::new(DEFAULT_MAX_DEPTH)
    }
}

impl Codec {
    /// Create a codec with a nesting limit
    pub fn new(max_depth: usize) -> Self {
        Codec { max_depth }
    }

    /// Nesting limit for arrays and maps
    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Project a live value onto the wire. `None` means `undefined`.
    pub fn encode(&self, value: &Value, functions: &mut FunctionTable) -> Result<Option<Json>> {
        self.encode_at(value, functions, 0)
    }

    fn encode_at(
        &self,
        value: &Value,
        functions: &mut FunctionTable,
        depth: usize,
    ) -> Result<Option<Json>> {
        if depth > self.max_depth {
            return Err(Error::Encoding(format!(
                "value nesting exceeds {} levels",
                self.max_depth
            )));
        }

        let json = match value {
            Value::Undefined => return Ok(None),
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Number(n) => Json::Number(n.clone()),
            Value::String(s) => Json::String(tag_string(s)),
            Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.encode_at(item, functions, depth + 1)?.unwrap_or(Json::Null));
                }
                Json::Array(out)
            }
            Value::Object(map) => {
                let mut out = serde_json::Map::new();
                for (key, item) in map {
                    if let Some(json) = self.encode_at(item, functions, depth + 1)? {
                        out.insert(key.clone(), json);
                    }
                }
                Json::Object(out)
            }
            Value::Function(function) => match function.remote_ref() {
                Some(remote_id) => Json::String(remote_tag(remote_id)),
                None => Json::String(local_tag(functions.intern(function))),
            },
        };
        Ok(Some(json))
    }

    /// Rebuild a live value from the wire.
    ///
    /// `remote` builds the local stand-in for a `pyfun` reference.
    pub fn decode(
        &self,
        wire: &Json,
        functions: &FunctionTable,
        remote: &mut dyn FnMut(&str) -> Function,
    ) -> Result<Value> {
        self.decode_at(wire, functions, remote, 0)
    }

    fn decode_at(
        &self,
        wire: &Json,
        functions: &FunctionTable,
        remote: &mut dyn FnMut(&str) -> Function,
        depth: usize,
    ) -> Result<Value> {
        if depth > self.max_depth {
            return Err(Error::Encoding(format!(
                "value nesting exceeds {} levels",
                self.max_depth
            )));
        }

        match wire {
            Json::Null => Ok(Value::Null),
            Json::Bool(b) => Ok(Value::Bool(*b)),
            Json::Number(n) => Ok(Value::Number(n.clone())),
            Json::String(s) => decode_tagged(s, functions, remote),
            Json::Array(items) => items
                .iter()
                .map(|item| self.decode_at(item, functions, remote, depth + 1))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            Json::Object(map) => {
                let mut out = std::collections::BTreeMap::new();
                for (key, item) in map {
                    out.insert(key.clone(), self.decode_at(item, functions, remote, depth + 1)?);
                }
                Ok(Value::Object(out))
            }
        }
    }
}

fn decode_tagged(
    s: &str,
    functions: &FunctionTable,
    remote: &mut dyn FnMut(&str) -> Function,
) -> Result<Value> {
    if let Some(literal) = s.strip_prefix(STRING_TAG) {
        return Ok(Value::String(literal.to_string()));
    }

    if let Some(id) = s.strip_prefix(LOCAL_FUNCTION_TAG) {
        let id: FunctionId = id
            .parse()
            .map_err(|_| Error::Decode(format!("malformed local function reference: {}", s)))?;
        return functions
            .resolve(id)
            .map(Value::Function)
            .ok_or_else(|| Error::NotFound(s.to_string()));
    }

    if let Some(remote_id) = s.strip_prefix(REMOTE_FUNCTION_TAG) {
        return Ok(Value::Function(remote(remote_id)));
    }

    let preview: String = s.chars().take(32).collect();
    Err(Error::Decode(format!("unrecognized value tag in {:?}", preview)))
}
