//! Live value model
//!
//! Values on this side of the wire: a closed union of JSON-like data plus
//! callables. Callables are reference-counted and compared by identity, which
//! is what the intern table keys on.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use futures::future::{self, LocalBoxFuture};
use serde_json::Number;

use crate::error::Result;

/// Future produced by invoking a callable
pub type CallFuture = LocalBoxFuture<'static, Result<Value>>;

/// Something that can be invoked with live arguments.
///
/// Implementations perform their synchronous work inside `call` and only
/// defer what genuinely has to wait, so invocation order is preserved.
pub trait Callable: 'static {
    /// Invoke the callable
    fn call(&self, args: Vec<Value>) -> CallFuture;

    /// Invoke the callable, returning a ready value when the result is
    /// already known
    fn invoke(&self, args: Vec<Value>) -> Result<Outcome> {
        Ok(Outcome::Deferred(self.call(args)))
    }

    /// Remote id when this callable stands in for a function on the other side
    fn remote_ref(&self) -> Option<&str> {
        None
    }

    /// Downcast support for engine adapters that need to unwrap their own functions
    fn as_any(&self) -> &dyn Any;
}

/// Shared handle to a callable
#[derive(Clone)]
pub struct Function(Rc<dyn Callable>);

impl Function {
    /// Wrap a callable
    pub fn new<C: Callable>(callable: C) -> Self {
        Function(Rc::new(callable))
    }

    /// Wrap a synchronous host closure
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Result<Value> + 'static,
    {
        Function::new(HostFn(f))
    }

    /// Invoke the function
    pub fn call(&self, args: Vec<Value>) -> CallFuture {
        self.0.call(args)
    }

    /// Invoke the function; only results that must wait come back deferred
    pub fn invoke(&self, args: Vec<Value>) -> Result<Outcome> {
        self.0.invoke(args)
    }

    /// Remote id if this is a forward reference to a remote function
    pub fn remote_ref(&self) -> Option<&str> {
        self.0.remote_ref()
    }

    /// Whether this is a forward reference to a remote function
    pub fn is_remote(&self) -> bool {
        self.remote_ref().is_some()
    }

    /// Identity key; stable while any clone of this function is alive
    pub fn identity(&self) -> usize {
        Rc::as_ptr(&self.0) as *const () as usize
    }

    /// Whether two handles point at the same callable
    pub fn ptr_eq(&self, other: &Function) -> bool {
        self.identity() == other.identity()
    }

    /// Downcast to a concrete callable type
    pub fn downcast_ref<T: Callable>(&self) -> Option<&T> {
        self.0.as_any().downcast_ref::<T>()
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.remote_ref() {
            Some(remote) => write!(f, "Function(remote {})", remote),
            None => write!(f, "Function({:#x})", self.identity()),
        }
    }
}

struct HostFn<F>(F);

impl<F> Callable for HostFn<F>
where
    F: Fn(Vec<Value>) -> Result<Value> + 'static,
{
    fn call(&self, args: Vec<Value>) -> CallFuture {
        Box::pin(future::ready((self.0)(args)))
    }

    fn invoke(&self, args: Vec<Value>) -> Result<Outcome> {
        (self.0)(args).map(Outcome::Ready)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A live value
#[derive(Clone, Debug, Default)]
pub enum Value {
    /// Absent value; dropped from maps on the wire
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
    Function(Function),
}

impl Value {
    /// Convert untagged JSON (no type prefixes interpreted)
    pub fn from_plain_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => Value::Number(n.clone()),
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(items) => {
                Value::Array(items.iter().map(Value::from_plain_json).collect())
            }
            serde_json::Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from_plain_json(v)))
                    .collect(),
            ),
        }
    }

    /// Short name of the variant, for messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Function(_) => "function",
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Number(n) => n.as_u64(),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&Function> {
        match self {
            Value::Function(f) => Some(f),
            _ => None,
        }
    }

    /// JavaScript-style truthiness
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Undefined | Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
            Value::String(s) => !s.is_empty(),
            Value::Array(_) | Value::Object(_) | Value::Function(_) => true,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => match (a.as_i64(), b.as_i64()) {
                (Some(x), Some(y)) => x == y,
                _ => a.as_f64() == b.as_f64(),
            },
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a == b,
            (Value::Function(a), Value::Function(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n.into())
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Value::Number(n.into())
    }
}

impl From<f64> for Value {
    /// Non-finite numbers have no JSON form and become `null`
    fn from(n: f64) -> Self {
        Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<Function> for Value {
    fn from(f: Function) -> Self {
        Value::Function(f)
    }
}

/// Result of an action: available now, or after the engine or the remote side answers
pub enum Outcome {
    Ready(Value),
    Deferred(CallFuture),
}

impl Outcome {
    /// Wait for the value
    pub async fn resolve(self) -> Result<Value> {
        match self {
            Outcome::Ready(value) => Ok(value),
            Outcome::Deferred(future) => future.await,
        }
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self, Outcome::Deferred(_))
    }
}

impl From<Value> for Outcome {
    fn from(value: Value) -> Self {
        Outcome::Ready(value)
    }
}

impl fmt::Debug for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Ready(value) => f.debug_tuple("Ready").field(value).finish(),
            Outcome::Deferred(_) => f.write_str("Deferred(..)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_plain_json_keeps_strings_untagged() {
        let json = serde_json::json!({"a": ["strx", 1, true, null]});
        let value = Value::from_plain_json(&json);
        let Value::Object(map) = value else { panic!("expected object") };
        assert_eq!(
            map["a"],
            Value::Array(vec!["strx".into(), 1i64.into(), true.into(), Value::Null])
        );
    }

    #[test]
    fn test_function_identity() {
        let f = Function::from_fn(|_| Ok(Value::Null));
        let g = f.clone();
        let h = Function::from_fn(|_| Ok(Value::Null));
        assert!(f.ptr_eq(&g));
        assert!(!f.ptr_eq(&h));
        assert_eq!(Value::Function(f.clone()), Value::Function(g));
        assert_ne!(Value::Function(f), Value::Function(h));
    }

    #[test]
    fn test_number_equality_across_representations() {
        assert_eq!(Value::from(2i64), Value::from(2.0f64));
        assert_eq!(Value::from(f64::NAN), Value::Null);
    }

    #[test]
    fn test_truthiness() {
        assert!(!Value::Undefined.is_truthy());
        assert!(!Value::from(0i64).is_truthy());
        assert!(!Value::from("").is_truthy());
        assert!(Value::from(true).is_truthy());
        assert!(Value::Object(BTreeMap::new()).is_truthy());
    }

    #[tokio::test]
    async fn test_host_fn_call() {
        let add = Function::from_fn(|args| {
            let sum: i64 = args
                .iter()
                .map(|a| match a {
                    Value::Number(n) => n.as_i64().unwrap_or(0),
                    _ => 0,
                })
                .sum();
            Ok(Value::from(sum))
        });
        assert_eq!(add.call(vec![1i64.into(), 2i64.into()]).await.unwrap(), Value::from(3i64));
        assert!(!add.is_remote());
        match add.invoke(vec![4i64.into()]).unwrap() {
            Outcome::Ready(value) => assert_eq!(value, Value::from(4i64)),
            Outcome::Deferred(_) => panic!("host functions answer immediately"),
        }

        let failing = Function::from_fn(|_| Err(Error::Engine("nope".into())));
        assert!(failing.call(vec![]).await.is_err());
    }

    #[tokio::test]
    async fn test_outcome_resolve() {
        let ready = Outcome::from(Value::from("x"));
        assert!(!ready.is_deferred());
        assert_eq!(ready.resolve().await.unwrap(), Value::from("x"));

        let deferred = Outcome::Deferred(Box::pin(async { Ok(Value::from(5i64)) }));
        assert!(deferred.is_deferred());
        assert_eq!(deferred.resolve().await.unwrap(), Value::from(5i64));
    }
}
