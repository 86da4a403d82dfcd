//! Scripted engine for session and dispatcher tests
//!
//! `run` understands a handful of commands:
//! - `<a>+<b>`: integer sum
//! - `throw <msg>`: engine error
//! - `log <text>`: console event
//! - `later <n>`: deferred integer
//! - anything else parsing as an integer evaluates to it
//!
//! Modules are written as `key=value;key=value` with integer or string values.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use super::{Engine, EngineEvent, EngineFactory, EngineOptions, EventSink, Flavor};
use crate::error::{Error, Result};
use crate::value::{Outcome, Value};

fn literal(text: &str) -> Value {
    let text = text.trim();
    match text.parse::<i64>() {
        Ok(n) => Value::from(n),
        Err(_) => Value::from(text),
    }
}

#[derive(Default)]
pub(crate) struct FakeFactory {
    pub created: RefCell<Vec<Flavor>>,
}

impl EngineFactory for FakeFactory {
    type Engine = FakeEngine;

    fn create(&self, flavor: Flavor, options: &EngineOptions, events: EventSink) -> Result<FakeEngine> {
        self.created.borrow_mut().push(flavor);
        Ok(FakeEngine {
            globals: RefCell::new(options.sandbox.clone()),
            events,
        })
    }
}

pub(crate) struct FakeEngine {
    globals: RefCell<BTreeMap<String, Value>>,
    events: EventSink,
}

pub(crate) struct FakeModule {
    exports: RefCell<BTreeMap<String, Value>>,
}

impl Engine for FakeEngine {
    type Module = FakeModule;

    fn run(&self, code: &str) -> Result<Outcome> {
        let code = code.trim();
        if let Some(message) = code.strip_prefix("throw ") {
            return Err(Error::Engine(message.to_string()));
        }
        if let Some(text) = code.strip_prefix("log ") {
            (self.events)(EngineEvent::Console { text: text.to_string() });
            return Ok(Outcome::Ready(Value::Undefined));
        }
        if let Some(value) = code.strip_prefix("later ") {
            let value = literal(value);
            return Ok(Outcome::Deferred(Box::pin(async move {
                tokio::task::yield_now().await;
                Ok(value)
            })));
        }
        if let Some((a, b)) = code.split_once('+') {
            let a: i64 = a.trim().parse().map_err(|_| Error::Engine("bad operand".into()))?;
            let b: i64 = b.trim().parse().map_err(|_| Error::Engine("bad operand".into()))?;
            return Ok(Outcome::Ready(Value::from(a + b)));
        }
        if let Some(value) = self.globals.borrow().get(code) {
            return Ok(Outcome::Ready(value.clone()));
        }
        match code.parse::<i64>() {
            Ok(n) => Ok(Outcome::Ready(Value::from(n))),
            Err(_) => Err(Error::Engine(format!("{} is not defined", code))),
        }
    }

    fn call_function(&self, name: &str, args: Vec<Value>) -> Result<Outcome> {
        let function = self
            .globals
            .borrow()
            .get(name)
            .and_then(Value::as_function)
            .cloned()
            .ok_or_else(|| Error::Engine(format!("{} is not a function", name)))?;
        Ok(Outcome::Deferred(function.call(args)))
    }

    fn load_module(&self, code: &str, _filename: Option<&str>) -> Result<FakeModule> {
        let mut exports = BTreeMap::new();
        for pair in code.split(';').filter(|pair| !pair.trim().is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| Error::Engine(format!("Unexpected token in {}", pair)))?;
            exports.insert(key.trim().to_string(), literal(value));
        }
        Ok(FakeModule {
            exports: RefCell::new(exports),
        })
    }

    fn module_value(&self, module: &FakeModule) -> Result<Value> {
        Ok(Value::Object(module.exports.borrow().clone()))
    }

    fn call_module(&self, _module: &FakeModule, args: Vec<Value>) -> Result<Outcome> {
        Ok(Outcome::Ready(Value::Array(args)))
    }

    fn get_member(&self, module: &FakeModule, member: &str) -> Result<Value> {
        Ok(module
            .exports
            .borrow()
            .get(member)
            .cloned()
            .unwrap_or_default())
    }

    fn call_member(&self, module: &FakeModule, member: &str, args: Vec<Value>) -> Result<Outcome> {
        let target = module.exports.borrow().get(member).cloned();
        match target {
            Some(Value::Function(function)) => Ok(Outcome::Deferred(function.call(args))),
            _ if member == "echo" => Ok(Outcome::Ready(Value::Array(args))),
            _ => Err(Error::Engine(format!("{} is not a function", member))),
        }
    }

    fn set_member(&self, module: &FakeModule, member: &str, value: Value) -> Result<()> {
        module.exports.borrow_mut().insert(member.to_string(), value);
        Ok(())
    }
}

/// Shared recorder for events emitted by fake engines
pub(crate) fn recording_sink() -> (EventSink, Rc<RefCell<Vec<EngineEvent>>>) {
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink: EventSink = {
        let seen = seen.clone();
        Rc::new(move |event| seen.borrow_mut().push(event))
    };
    (sink, seen)
}
