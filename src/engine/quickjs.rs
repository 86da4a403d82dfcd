//! QuickJS engine adapter
//!
//! Each engine owns its own runtime and context. Live values cross into JS
//! by conversion; functions cross by reference:
//! - a JS function leaving the engine becomes a [`Function`] that re-enters
//!   the engine when called, and the same JS function always maps to the
//!   same `Function`
//! - a host or remote function entering the engine becomes a JS function
//!   returning a promise, settled once the host call completes
//!
//! Promise settlement happens on `spawn_local` tasks, so engines must be
//! driven from inside a `tokio::task::LocalSet`.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::future;
use rquickjs::convert::Coerced;
use rquickjs::function::Rest;
use rquickjs::{
    Array, Context, Ctx, Exception, Function as JsFunction, Object, Persistent, Runtime,
    String as JsString, Type, Value as JsValue,
};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::{ConsoleMode, Engine, EngineEvent, EngineFactory, EngineOptions, EventSink, Flavor};
use crate::codec::DEFAULT_MAX_DEPTH;
use crate::error::{Error, Result};
use crate::value::{CallFuture, Callable, Function, Outcome, Value};

/// Support code evaluated once per engine
const HELPERS: &str = r#"(() => {
    const ids = new WeakMap();
    const callable = (f, name) => {
        if (typeof f !== 'function') {
            throw new TypeError(name + ' is not a function');
        }
        return f;
    };
    return {
        defer() {
            let resolve, reject;
            const promise = new Promise((ok, err) => { resolve = ok; reject = err; });
            return [promise, resolve, reject];
        },
        idOf(f) {
            const id = ids.get(f);
            return id === undefined ? -1 : id;
        },
        tag(f, id) {
            ids.set(f, id);
        },
        foreign(v) {
            const proto = Object.getPrototypeOf(v);
            if (proto === null || proto === Object.prototype) {
                return null;
            }
            const ctor = proto.constructor;
            return typeof ctor === 'function' && ctor.name ? ctor.name : 'object';
        },
        isThenable(v) {
            return v !== null && (typeof v === 'object' || typeof v === 'function')
                && typeof v.then === 'function';
        },
        observe(v, onOk, onErr) {
            Promise.resolve(v).then(onOk, onErr);
        },
        apply(f, self, args, name) {
            return Reflect.apply(callable(f, name), self, args);
        },
        invoke(target, member, args) {
            return Reflect.apply(callable(target[member], member), target, args);
        },
        get(target, member) {
            return target[member];
        },
        set(target, member, value) {
            target[member] = value;
        },
        load(code, filename) {
            const module = { exports: {} };
            const require = (name) => {
                throw new Error("Cannot find module '" + name + "'");
            };
            const body = new Function('exports', 'require', 'module', '__filename', '__dirname', code);
            body.call(module.exports, module.exports, require, module, filename, '/');
            return module;
        },
        error(message) {
            return new Error(message);
        },
    };
})()"#;

/// File name given to modules loaded without one
const DEFAULT_FILENAME: &str = "vm.js";

impl From<rquickjs::Error> for Error {
    fn from(err: rquickjs::Error) -> Self {
        Error::Engine(err.to_string())
    }
}

/// Turn a failed JS operation into a crate error, taking the pending exception
trait Caught<T> {
    fn caught(self, ctx: &Ctx<'_>) -> Result<T>;
}

impl<T> Caught<T> for rquickjs::Result<T> {
    fn caught(self, ctx: &Ctx<'_>) -> Result<T> {
        self.map_err(|err| match err {
            rquickjs::Error::Exception => Error::Engine(describe(&ctx.catch())),
            other => Error::Engine(other.to_string()),
        })
    }
}

/// Message of a thrown value
fn describe(thrown: &JsValue<'_>) -> String {
    if let Some(exception) = thrown.as_exception() {
        return exception
            .message()
            .unwrap_or_else(|| "Uncaught exception".to_string());
    }
    thrown
        .get::<Coerced<String>>()
        .map(|coerced| coerced.0)
        .unwrap_or_else(|_| "Uncaught exception".to_string())
}

fn throw(ctx: &Ctx<'_>, err: Error) -> rquickjs::Error {
    Exception::throw_message(ctx, &err.to_string())
}

fn destroyed() -> Error {
    Error::Engine("sandbox has been destroyed".to_string())
}

/// A JS function known to the engine, with its live counterpart
struct Entry {
    js: Persistent<JsFunction<'static>>,
    live: Function,
}

/// Resolvers of a promise handed to JS for a pending host call
struct Settlers {
    resolve: Persistent<JsFunction<'static>>,
    reject: Persistent<JsFunction<'static>>,
}

// Persistent handles are declared before the context and runtime so they are
// released first.
struct Inner {
    helpers: Persistent<Object<'static>>,
    // Only grows. Every JS function that ever left the engine stays here for
    // the life of the session, like interned functions in the bridge, so its
    // live counterpart keeps one identity.
    entries: RefCell<Vec<Entry>>,
    proxies: RefCell<HashMap<usize, usize>>,
    waiting: RefCell<HashMap<u64, Settlers>>,
    modules: RefCell<HashMap<u64, Persistent<Object<'static>>>>,
    next_key: Cell<u64>,
    entered: Cell<bool>,
    max_depth: usize,
    timeout: Option<Duration>,
    deadline: Arc<Mutex<Option<Instant>>>,
    context: Context,
    runtime: Runtime,
}

impl Inner {
    fn allocate_key(&self) -> u64 {
        let key = self.next_key.get();
        self.next_key.set(key + 1);
        key
    }

    fn set_deadline(&self, deadline: Option<Instant>) {
        if let Ok(mut slot) = self.deadline.lock() {
            *slot = deadline;
        }
    }

    fn deadline_passed(&self) -> bool {
        self.deadline
            .lock()
            .ok()
            .and_then(|slot| *slot)
            .is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Run `f` inside the context, then drain queued jobs
    fn enter<T>(&self, f: impl for<'js> FnOnce(&Ctx<'js>) -> Result<T>) -> Result<T> {
        if let Some(limit) = self.timeout {
            self.set_deadline(Some(Instant::now() + limit));
        }
        let outer = self.entered.replace(true);
        let result = self.context.with(|ctx| f(&ctx));
        self.drain_jobs();
        self.entered.set(outer);
        let expired = self.deadline_passed();
        self.set_deadline(None);

        match result {
            Err(Error::Engine(_)) if expired => Err(Error::Engine(format!(
                "Script execution timed out after {:?}",
                self.timeout.unwrap_or_default()
            ))),
            other => other,
        }
    }

    fn drain_jobs(&self) {
        loop {
            match self.runtime.execute_pending_job() {
                Ok(true) => {}
                Ok(false) => break,
                Err(_) => warn!("Unhandled exception in sandbox job"),
            }
        }
    }

    fn helper<'js>(&self, ctx: &Ctx<'js>, name: &str) -> Result<JsFunction<'js>> {
        let helpers = self.helpers.clone().restore(ctx).caught(ctx)?;
        helpers.get(name).caught(ctx)
    }

    fn depth_check(&self, depth: usize) -> Result<()> {
        if depth > self.max_depth {
            return Err(Error::Encoding(format!(
                "value nesting exceeds {} levels",
                self.max_depth
            )));
        }
        Ok(())
    }

    /// Convert a JS value into a live value
    fn to_live<'js>(self: &Rc<Self>, ctx: &Ctx<'js>, value: JsValue<'js>, depth: usize) -> Result<Value> {
        self.depth_check(depth)?;

        match value.type_of() {
            Type::Uninitialized | Type::Undefined => Ok(Value::Undefined),
            Type::Null => Ok(Value::Null),
            Type::Bool => Ok(Value::Bool(value.as_bool().unwrap_or(false))),
            Type::Int => Ok(Value::from(i64::from(value.as_int().unwrap_or(0)))),
            Type::Float => Ok(number(value.as_float().unwrap_or(f64::NAN))),
            Type::String => match value.as_string() {
                Some(s) => Ok(Value::String(s.to_string().caught(ctx)?)),
                None => Ok(Value::Undefined),
            },
            Type::Array => {
                let Some(array) = value.as_array() else {
                    return Ok(Value::Undefined);
                };
                let mut items = Vec::with_capacity(array.len());
                for index in 0..array.len() {
                    let item: JsValue<'js> = array.get(index).caught(ctx)?;
                    items.push(self.to_live(ctx, item, depth + 1)?);
                }
                Ok(Value::Array(items))
            }
            Type::Function | Type::Constructor => match value.into_function() {
                Some(function) => self.live_function(ctx, function).map(Value::Function),
                None => Ok(Value::Undefined),
            },
            Type::Exception => {
                let message = describe(&value);
                let mut fields = std::collections::BTreeMap::new();
                fields.insert("message".to_string(), Value::String(message));
                Ok(Value::Object(fields))
            }
            other => match value.as_object() {
                Some(object) => {
                    let kind: Option<String> = self
                        .helper(ctx, "foreign")?
                        .call((object.clone(),))
                        .caught(ctx)?;
                    if let Some(kind) = kind {
                        return Err(Error::Encoding(format!("cannot marshal a JS {}", kind)));
                    }
                    let mut fields = std::collections::BTreeMap::new();
                    for prop in object.props::<String, JsValue<'js>>() {
                        let (key, item) = prop.caught(ctx)?;
                        fields.insert(key, self.to_live(ctx, item, depth + 1)?);
                    }
                    Ok(Value::Object(fields))
                }
                None => Err(Error::Encoding(format!("cannot marshal a JS {:?}", other))),
            },
        }
    }

    /// Convert a live value into a JS value
    fn to_js<'js>(self: &Rc<Self>, ctx: &Ctx<'js>, value: &Value, depth: usize) -> Result<JsValue<'js>> {
        self.depth_check(depth)?;

        let js = match value {
            Value::Undefined => JsValue::new_undefined(ctx.clone()),
            Value::Null => JsValue::new_null(ctx.clone()),
            Value::Bool(b) => JsValue::new_bool(ctx.clone(), *b),
            Value::Number(n) => match n.as_i64().and_then(|i| i32::try_from(i).ok()) {
                Some(i) => JsValue::new_int(ctx.clone(), i),
                None => JsValue::new_float(ctx.clone(), n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => JsString::from_str(ctx.clone(), s).caught(ctx)?.into_value(),
            Value::Array(items) => {
                let array = Array::new(ctx.clone()).caught(ctx)?;
                for (index, item) in items.iter().enumerate() {
                    array.set(index, self.to_js(ctx, item, depth + 1)?).caught(ctx)?;
                }
                array.into_value()
            }
            Value::Object(fields) => {
                let object = Object::new(ctx.clone()).caught(ctx)?;
                for (key, item) in fields {
                    object.set(key.as_str(), self.to_js(ctx, item, depth + 1)?).caught(ctx)?;
                }
                object.into_value()
            }
            Value::Function(function) => self.js_function(ctx, function)?.into_value(),
        };
        Ok(js)
    }

    fn to_js_array<'js>(self: &Rc<Self>, ctx: &Ctx<'js>, args: &[Value]) -> Result<Array<'js>> {
        let array = Array::new(ctx.clone()).caught(ctx)?;
        for (index, arg) in args.iter().enumerate() {
            array.set(index, self.to_js(ctx, arg, 1)?).caught(ctx)?;
        }
        Ok(array)
    }

    /// Remember a JS function under the next entry index
    fn register<'js>(&self, ctx: &Ctx<'js>, js: JsFunction<'js>, live: Function) -> Result<usize> {
        let index = {
            let mut entries = self.entries.borrow_mut();
            entries.push(Entry {
                js: Persistent::save(ctx, js.clone()),
                live,
            });
            entries.len() - 1
        };
        self.helper(ctx, "tag")?
            .call::<_, ()>((js, index as f64))
            .caught(ctx)?;
        Ok(index)
    }

    /// Live counterpart of a JS function, created on first sight
    fn live_function<'js>(self: &Rc<Self>, ctx: &Ctx<'js>, js: JsFunction<'js>) -> Result<Function> {
        let id: f64 = self
            .helper(ctx, "idOf")?
            .call((js.clone(),))
            .caught(ctx)?;
        if id >= 0.0 {
            if let Some(entry) = self.entries.borrow().get(id as usize) {
                return Ok(entry.live.clone());
            }
        }

        let index = self.entries.borrow().len();
        let live = Function::new(ScriptFunction {
            engine: Rc::downgrade(self),
            index,
        });
        self.register(ctx, js, live.clone())?;
        Ok(live)
    }

    /// JS counterpart of a live function
    fn js_function<'js>(self: &Rc<Self>, ctx: &Ctx<'js>, function: &Function) -> Result<JsFunction<'js>> {
        let own_index = function
            .downcast_ref::<ScriptFunction>()
            .filter(|script| Weak::ptr_eq(&script.engine, &Rc::downgrade(self)))
            .map(|script| script.index);
        let known = own_index.or_else(|| self.proxies.borrow().get(&function.identity()).copied());

        if let Some(index) = known {
            let saved = self.entries.borrow().get(index).map(|entry| entry.js.clone());
            if let Some(saved) = saved {
                return saved.restore(ctx).caught(ctx);
            }
        }

        let proxy = self.make_proxy(ctx, function.clone()).caught(ctx)?;
        let index = self.register(ctx, proxy.clone(), function.clone())?;
        self.proxies.borrow_mut().insert(function.identity(), index);
        Ok(proxy)
    }

    fn make_proxy<'js>(self: &Rc<Self>, ctx: &Ctx<'js>, target: Function) -> rquickjs::Result<JsFunction<'js>> {
        let engine = Rc::downgrade(self);
        JsFunction::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, args: Rest<JsValue<'js>>| -> rquickjs::Result<JsValue<'js>> {
                let Some(inner) = engine.upgrade() else {
                    return Err(throw(&ctx, destroyed()));
                };
                inner
                    .proxy_call(&ctx, &target, args.0)
                    .map_err(|err| throw(&ctx, err))
            },
        )
    }

    /// Start a host call from JS and hand back a promise for its result
    fn proxy_call<'js>(
        self: &Rc<Self>,
        ctx: &Ctx<'js>,
        target: &Function,
        args: Vec<JsValue<'js>>,
    ) -> Result<JsValue<'js>> {
        let args = args
            .into_iter()
            .map(|arg| self.to_live(ctx, arg, 1))
            .collect::<Result<Vec<_>>>()?;
        let pending = target.call(args);

        let parts: Array<'js> = self.helper(ctx, "defer")?.call(()).caught(ctx)?;
        let promise: JsValue<'js> = parts.get(0).caught(ctx)?;
        let resolve: JsFunction<'js> = parts.get(1).caught(ctx)?;
        let reject: JsFunction<'js> = parts.get(2).caught(ctx)?;

        let key = self.allocate_key();
        self.waiting.borrow_mut().insert(
            key,
            Settlers {
                resolve: Persistent::save(ctx, resolve),
                reject: Persistent::save(ctx, reject),
            },
        );

        let engine = Rc::downgrade(self);
        tokio::task::spawn_local(async move {
            let result = pending.await;
            if let Some(inner) = engine.upgrade() {
                inner.settle(key, result);
            }
        });
        Ok(promise)
    }

    /// Settle the promise handed out for host call `key`
    fn settle(self: &Rc<Self>, key: u64, result: Result<Value>) {
        let Some(settlers) = self.waiting.borrow_mut().remove(&key) else {
            return;
        };
        let settled = self.enter(|ctx| {
            let converted = result.and_then(|value| self.to_js(ctx, &value, 0));
            match converted {
                Ok(value) => {
                    let resolve = settlers.resolve.restore(ctx).caught(ctx)?;
                    resolve.call::<_, ()>((value,)).caught(ctx)
                }
                Err(err) => {
                    let error: JsValue<'_> = self
                        .helper(ctx, "error")?
                        .call((err.to_string(),))
                        .caught(ctx)?;
                    let reject = settlers.reject.restore(ctx).caught(ctx)?;
                    reject.call::<_, ()>((error,)).caught(ctx)
                }
            }
        });
        if let Err(err) = settled {
            warn!(error = %err, "Failed to settle sandbox promise");
        }
    }

    /// Wrap a JS result, deferring thenables until they settle
    fn outcome<'js>(self: &Rc<Self>, ctx: &Ctx<'js>, value: JsValue<'js>) -> Result<Outcome> {
        let thenable: bool = self
            .helper(ctx, "isThenable")?
            .call((value.clone(),))
            .caught(ctx)?;
        if !thenable {
            return Ok(Outcome::Ready(self.to_live(ctx, value, 0)?));
        }

        let (sender, receiver) = oneshot::channel::<Result<Value>>();
        let sender = Rc::new(RefCell::new(Some(sender)));

        let on_ok = {
            let sender = sender.clone();
            let engine = Rc::downgrade(self);
            JsFunction::new(
                ctx.clone(),
                move |ctx: Ctx<'js>, value: JsValue<'js>| -> rquickjs::Result<()> {
                    let result = match engine.upgrade() {
                        Some(inner) => inner.to_live(&ctx, value, 0),
                        None => Err(destroyed()),
                    };
                    if let Some(sender) = sender.borrow_mut().take() {
                        let _ = sender.send(result);
                    }
                    Ok(())
                },
            )
            .caught(ctx)?
        };
        let on_err = JsFunction::new(
            ctx.clone(),
            move |reason: JsValue<'js>| -> rquickjs::Result<()> {
                if let Some(sender) = sender.borrow_mut().take() {
                    let _ = sender.send(Err(Error::Engine(describe(&reason))));
                }
                Ok(())
            },
        )
        .caught(ctx)?;

        self.helper(ctx, "observe")?
            .call::<_, ()>((value, on_ok, on_err))
            .caught(ctx)?;

        Ok(Outcome::Deferred(Box::pin(async move {
            receiver.await.unwrap_or_else(|_| {
                Err(Error::Engine(
                    "sandbox was destroyed before the promise settled".to_string(),
                ))
            })
        })))
    }

    fn install_console<'js>(
        &self,
        ctx: &Ctx<'js>,
        flavor: Flavor,
        mode: ConsoleMode,
        events: EventSink,
    ) -> Result<()> {
        let sink: Rc<dyn Fn(String)> = match (flavor, mode) {
            (_, ConsoleMode::Off) => Rc::new(|_: String| {}),
            (Flavor::Plain, ConsoleMode::Inherit) => {
                Rc::new(|text: String| info!(target: "sandbox_bridge::console", "{}", text))
            }
            _ => Rc::new(move |text: String| events(EngineEvent::Console { text })),
        };

        let console = Object::new(ctx.clone()).caught(ctx)?;
        for name in ["log", "info", "warn", "error", "debug"] {
            let sink = sink.clone();
            let method = JsFunction::new(ctx.clone(), move |args: Rest<Coerced<String>>| {
                let text = args
                    .0
                    .into_iter()
                    .map(|arg| arg.0)
                    .collect::<Vec<_>>()
                    .join(" ");
                sink(text);
            })
            .caught(ctx)?;
            console.set(name, method).caught(ctx)?;
        }
        ctx.globals().set("console", console).caught(ctx)
    }

    fn module_object<'js>(&self, ctx: &Ctx<'js>, module: &QuickJsModule) -> Result<Object<'js>> {
        let saved = self
            .modules
            .borrow()
            .get(&module.key)
            .cloned()
            .ok_or_else(|| Error::NotFound(module.key.to_string()))?;
        saved.restore(ctx).caught(ctx)
    }

    fn exports<'js>(&self, ctx: &Ctx<'js>, module: &QuickJsModule) -> Result<JsValue<'js>> {
        self.module_object(ctx, module)?.get("exports").caught(ctx)
    }
}

/// Integral floats come back as integers so `2.0` is written as `2`
fn number(f: f64) -> Value {
    const EXACT: f64 = 9_007_199_254_740_992.0;
    if f.fract() == 0.0 && f.abs() <= EXACT {
        Value::from(f as i64)
    } else {
        Value::from(f)
    }
}

/// Live handle to a function that lives inside an engine
struct ScriptFunction {
    engine: Weak<Inner>,
    index: usize,
}

impl ScriptFunction {
    fn run_entry(inner: &Rc<Inner>, index: usize, args: Vec<Value>) -> Result<Outcome> {
        inner.enter(|ctx| {
            let saved = inner
                .entries
                .borrow()
                .get(index)
                .map(|entry| entry.js.clone())
                .ok_or_else(|| Error::NotFound(index.to_string()))?;
            let function = saved.restore(ctx).caught(ctx)?;
            let args = inner.to_js_array(ctx, &args)?;
            let result: JsValue<'_> = inner
                .helper(ctx, "apply")?
                .call((function, JsValue::new_undefined(ctx.clone()), args, "function"))
                .caught(ctx)?;
            inner.outcome(ctx, result)
        })
    }
}

impl Callable for ScriptFunction {
    fn call(&self, args: Vec<Value>) -> CallFuture {
        match Callable::invoke(self, args) {
            Ok(outcome) => Box::pin(outcome.resolve()),
            Err(err) => Box::pin(future::ready(Err(err))),
        }
    }

    // Calls made while the engine is already entered run once that entry returns
    fn invoke(&self, args: Vec<Value>) -> Result<Outcome> {
        let inner = self.engine.upgrade().ok_or_else(destroyed)?;
        if !inner.entered.get() {
            return ScriptFunction::run_entry(&inner, self.index, args);
        }

        let engine = self.engine.clone();
        let index = self.index;
        Ok(Outcome::Deferred(Box::pin(async move {
            tokio::task::yield_now().await;
            let inner = engine.upgrade().ok_or_else(destroyed)?;
            ScriptFunction::run_entry(&inner, index, args)?.resolve().await
        })))
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// A module loaded into a [`QuickJsEngine`]; dropping it releases the module
pub struct QuickJsModule {
    key: u64,
    engine: Weak<Inner>,
}

impl Drop for QuickJsModule {
    fn drop(&mut self) {
        if let Some(inner) = self.engine.upgrade() {
            inner.modules.borrow_mut().remove(&self.key);
        }
    }
}

/// Sandbox backed by one QuickJS runtime
pub struct QuickJsEngine {
    inner: Rc<Inner>,
}

impl QuickJsEngine {
    /// Create an engine and install console and sandbox globals
    pub fn new(
        flavor: Flavor,
        options: &EngineOptions,
        events: EventSink,
        max_depth: usize,
    ) -> Result<Self> {
        let runtime = Runtime::new()?;
        let context = Context::full(&runtime)?;

        let deadline = Arc::new(Mutex::new(None::<Instant>));
        let watch = deadline.clone();
        runtime.set_interrupt_handler(Some(Box::new(move || {
            watch
                .lock()
                .ok()
                .and_then(|slot| *slot)
                .is_some_and(|deadline| Instant::now() >= deadline)
        })));

        let helpers = context.with(|ctx| -> Result<Persistent<Object<'static>>> {
            let helpers: Object<'_> = ctx.eval(HELPERS).caught(&ctx)?;
            Ok(Persistent::save(&ctx, helpers))
        })?;

        let inner = Rc::new(Inner {
            helpers,
            entries: RefCell::new(Vec::new()),
            proxies: RefCell::new(HashMap::new()),
            waiting: RefCell::new(HashMap::new()),
            modules: RefCell::new(HashMap::new()),
            next_key: Cell::new(1),
            entered: Cell::new(false),
            max_depth,
            timeout: options.timeout,
            deadline,
            context,
            runtime,
        });

        inner.enter(|ctx| {
            inner.install_console(ctx, flavor, options.console, events)?;
            let globals = ctx.globals();
            for (name, value) in &options.sandbox {
                let js = inner.to_js(ctx, value, 0)?;
                globals.set(name.as_str(), js).caught(ctx)?;
            }
            Ok(())
        })?;

        debug!(?flavor, globals = options.sandbox.len(), "QuickJS engine created");
        Ok(QuickJsEngine { inner })
    }

    fn owns(&self, module: &QuickJsModule) -> Result<()> {
        if Weak::ptr_eq(&module.engine, &Rc::downgrade(&self.inner)) {
            Ok(())
        } else {
            Err(Error::InvalidInput(
                "module belongs to another sandbox".to_string(),
            ))
        }
    }
}

impl Engine for QuickJsEngine {
    type Module = QuickJsModule;

    fn run(&self, code: &str) -> Result<Outcome> {
        let inner = &self.inner;
        inner.enter(|ctx| {
            let value: JsValue<'_> = ctx.eval(code).caught(ctx)?;
            inner.outcome(ctx, value)
        })
    }

    fn call_function(&self, name: &str, args: Vec<Value>) -> Result<Outcome> {
        let inner = &self.inner;
        inner.enter(|ctx| {
            let function: JsValue<'_> = ctx.eval(name).caught(ctx)?;
            let args = inner.to_js_array(ctx, &args)?;
            let result: JsValue<'_> = inner
                .helper(ctx, "apply")?
                .call((function, JsValue::new_undefined(ctx.clone()), args, name))
                .caught(ctx)?;
            inner.outcome(ctx, result)
        })
    }

    fn load_module(&self, code: &str, filename: Option<&str>) -> Result<QuickJsModule> {
        let inner = &self.inner;
        let key = inner.enter(|ctx| {
            let module: Object<'_> = inner
                .helper(ctx, "load")?
                .call((code, filename.unwrap_or(DEFAULT_FILENAME)))
                .caught(ctx)?;
            let key = inner.allocate_key();
            inner
                .modules
                .borrow_mut()
                .insert(key, Persistent::save(ctx, module));
            Ok(key)
        })?;
        Ok(QuickJsModule {
            key,
            engine: Rc::downgrade(inner),
        })
    }

    fn module_value(&self, module: &QuickJsModule) -> Result<Value> {
        self.owns(module)?;
        let inner = &self.inner;
        inner.enter(|ctx| {
            let exports = inner.exports(ctx, module)?;
            inner.to_live(ctx, exports, 0)
        })
    }

    fn call_module(&self, module: &QuickJsModule, args: Vec<Value>) -> Result<Outcome> {
        self.owns(module)?;
        let inner = &self.inner;
        inner.enter(|ctx| {
            let exports = inner.exports(ctx, module)?;
            let args = inner.to_js_array(ctx, &args)?;
            let result: JsValue<'_> = inner
                .helper(ctx, "apply")?
                .call((exports, JsValue::new_undefined(ctx.clone()), args, "module"))
                .caught(ctx)?;
            inner.outcome(ctx, result)
        })
    }

    fn get_member(&self, module: &QuickJsModule, member: &str) -> Result<Value> {
        self.owns(module)?;
        let inner = &self.inner;
        inner.enter(|ctx| {
            let exports = inner.exports(ctx, module)?;
            let value: JsValue<'_> = inner
                .helper(ctx, "get")?
                .call((exports, member))
                .caught(ctx)?;
            inner.to_live(ctx, value, 0)
        })
    }

    fn call_member(&self, module: &QuickJsModule, member: &str, args: Vec<Value>) -> Result<Outcome> {
        self.owns(module)?;
        let inner = &self.inner;
        inner.enter(|ctx| {
            let exports = inner.exports(ctx, module)?;
            let args = inner.to_js_array(ctx, &args)?;
            let result: JsValue<'_> = inner
                .helper(ctx, "invoke")?
                .call((exports, member, args))
                .caught(ctx)?;
            inner.outcome(ctx, result)
        })
    }

    fn set_member(&self, module: &QuickJsModule, member: &str, value: Value) -> Result<()> {
        self.owns(module)?;
        let inner = &self.inner;
        inner.enter(|ctx| {
            let exports = inner.exports(ctx, module)?;
            let value = inner.to_js(ctx, &value, 0)?;
            inner
                .helper(ctx, "set")?
                .call::<_, ()>((exports, member, value))
                .caught(ctx)
        })
    }
}

/// Builds [`QuickJsEngine`]s
#[derive(Debug, Clone)]
pub struct QuickJsFactory {
    max_depth: usize,
}

impl QuickJsFactory {
    /// Create a factory with a nesting limit for value conversion
    pub fn new(max_depth: usize) -> Self {
        QuickJsFactory { max_depth }
    }
}

impl Default for QuickJsFactory {
    fn default() -> Self {
        QuickJsFactory::new(DEFAULT_MAX_DEPTH)
    }
}

impl EngineFactory for QuickJsFactory {
    type Engine = QuickJsEngine;

    fn create(&self, flavor: Flavor, options: &EngineOptions, events: EventSink) -> Result<QuickJsEngine> {
        QuickJsEngine::new(flavor, options, events, self.max_depth)
    }
}
