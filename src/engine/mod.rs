//! Execution engine seam
//!
//! The bridge never runs code itself. A session owns one [`Engine`] built by
//! an [`EngineFactory`]; every entry into the engine is synchronous and
//! returns either a ready value or a deferred one.

#[cfg(test)]
pub(crate) mod fake;
#[cfg(feature = "quickjs")]
pub mod quickjs;

use std::collections::BTreeMap;
use std::rc::Rc;
use std::str::FromStr;
use std::time::Duration;

use tracing::debug;

use crate::error::{Error, Result};
use crate::value::{Outcome, Value};

#[cfg(feature = "quickjs")]
pub use quickjs::{QuickJsEngine, QuickJsFactory, QuickJsModule};

/// Kind of sandbox a `create` request asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flavor {
    /// Global evaluator (`VM`)
    Plain,
    /// Evaluator hosting CommonJS-style modules (`NodeVM`)
    ModuleHost,
}

impl FromStr for Flavor {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "VM" => Ok(Flavor::Plain),
            "NodeVM" => Ok(Flavor::ModuleHost),
            other => Err(Error::UnknownFlavor(other.to_string())),
        }
    }
}

/// What happens to console output inside the sandbox
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConsoleMode {
    /// Module hosts forward it as events, plain sessions log it
    #[default]
    Inherit,
    /// Forward as events
    Redirect,
    /// Discard
    Off,
}

impl FromStr for ConsoleMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "inherit" => Ok(ConsoleMode::Inherit),
            "redirect" => Ok(ConsoleMode::Redirect),
            "off" => Ok(ConsoleMode::Off),
            other => Err(Error::InvalidInput(format!(
                "console must be inherit, redirect or off, got {}",
                other
            ))),
        }
    }
}

/// Options taken from a `create` request
#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    /// Console handling
    pub console: ConsoleMode,
    /// Globals installed before any code runs
    pub sandbox: BTreeMap<String, Value>,
    /// Limit for one synchronous entry into the engine
    pub timeout: Option<Duration>,
}

impl EngineOptions {
    /// Read options from the live `options` field; absent means defaults
    pub fn from_value(options: &Value) -> Result<Self> {
        let fields = match options {
            Value::Undefined | Value::Null => return Ok(Self::default()),
            Value::Object(fields) => fields,
            other => {
                return Err(Error::InvalidInput(format!(
                    "options must be an object, got {}",
                    other.type_name()
                )))
            }
        };

        let mut parsed = Self::default();
        for (key, value) in fields {
            match (key.as_str(), value) {
                (_, Value::Undefined | Value::Null) => {}
                ("console", Value::String(mode)) => parsed.console = mode.parse()?,
                ("sandbox", Value::Object(globals)) => parsed.sandbox = globals.clone(),
                ("timeout", Value::Number(ms)) => {
                    parsed.timeout = ms
                        .as_f64()
                        .filter(|ms| ms.is_finite() && *ms > 0.0)
                        .map(|ms| Duration::from_secs_f64(ms / 1000.0));
                }
                ("console" | "sandbox" | "timeout", other) => {
                    return Err(Error::InvalidInput(format!(
                        "option {} has the wrong type: {}",
                        key,
                        other.type_name()
                    )))
                }
                (unknown, _) => debug!(option = unknown, "Ignoring unsupported engine option"),
            }
        }
        Ok(parsed)
    }
}

/// Something the engine reports outside of a request
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// One console call, arguments joined by spaces
    Console { text: String },
}

/// Receiver for engine events
pub type EventSink = Rc<dyn Fn(EngineEvent)>;

/// One sandbox instance
pub trait Engine: 'static {
    /// A module loaded into a module-hosting engine
    type Module: 'static;

    /// Evaluate code in the global scope
    fn run(&self, code: &str) -> Result<Outcome>;

    /// Call a global function by name
    fn call_function(&self, name: &str, args: Vec<Value>) -> Result<Outcome>;

    /// Run code as a module and keep it
    fn load_module(&self, code: &str, filename: Option<&str>) -> Result<Self::Module>;

    /// Current exports of a module
    fn module_value(&self, module: &Self::Module) -> Result<Value>;

    /// Call the module's exports as a function
    fn call_module(&self, module: &Self::Module, args: Vec<Value>) -> Result<Outcome>;

    /// Read one export
    fn get_member(&self, module: &Self::Module, member: &str) -> Result<Value>;

    /// Call one export with the exports object as receiver
    fn call_member(&self, module: &Self::Module, member: &str, args: Vec<Value>)
        -> Result<Outcome>;

    /// Replace one export
    fn set_member(&self, module: &Self::Module, member: &str, value: Value) -> Result<()>;
}

/// Builds engines for new sessions
pub trait EngineFactory {
    type Engine: Engine;

    /// Create an engine; `events` receives console output
    fn create(&self, flavor: Flavor, options: &EngineOptions, events: EventSink)
        -> Result<Self::Engine>;
}
