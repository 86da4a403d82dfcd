//! Session dispatcher - single entry point for every input line
//!
//! Each line is parsed, decoded and routed to one of:
//! - a control action (`ping`, `close`, `create`, `destroy`)
//! - the pending remote call a `ret` reply answers
//! - the session named by `vmId`
//!
//! Ready results are answered before the next line is read. Deferred results
//! are awaited on a local task and answered when they settle, so they never
//! hold up later requests.
//!
//! After `close` only `ret` replies are still accepted, so that deferred
//! responses waiting on the peer can finish. [`Dispatcher::drained`] resolves
//! once none are left.

use std::cell::{Cell, RefCell};
use std::ops::ControlFlow;
use std::rc::Rc;

use serde_json::{Map, Value as Json};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::bridge::Bridge;
use crate::codec::STRING_TAG;
use crate::engine::{EngineEvent, EngineFactory, EngineOptions, EventSink, Flavor};
use crate::error::{Error, Result};
use crate::protocol::{parse_line, Envelope, EventFrame, Request, ResponseFrame, REPLY_ACTION};
use crate::registry::{Handle, HandleRegistry};
use crate::session::{Action, Session};
use crate::value::{Outcome, Value};

/// Actions handled by the dispatcher itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Ping,
    Close,
    Create,
    Destroy,
}

impl Control {
    fn from_name(name: &str) -> Option<Control> {
        match name {
            "ping" => Some(Control::Ping),
            "close" => Some(Control::Close),
            "create" => Some(Control::Create),
            "destroy" => Some(Control::Destroy),
            _ => None,
        }
    }
}

/// Deferred responses not yet written
#[derive(Default)]
struct InFlight {
    count: Cell<usize>,
    idle: Notify,
}

impl InFlight {
    fn start(&self) {
        self.count.set(self.count.get() + 1);
    }

    fn finish(&self) {
        let left = self.count.get().saturating_sub(1);
        self.count.set(left);
        if left == 0 {
            self.idle.notify_one();
        }
    }
}

/// Routes requests to sessions created from one engine factory
pub struct Dispatcher<F: EngineFactory> {
    factory: F,
    bridge: Bridge,
    sessions: RefCell<HandleRegistry<Rc<Session<F::Engine>>>>,
    in_flight: Rc<InFlight>,
    closing: Cell<bool>,
}

impl<F: EngineFactory> Dispatcher<F> {
    pub fn new(factory: F, bridge: Bridge) -> Self {
        Dispatcher {
            factory,
            bridge,
            sessions: RefCell::new(HandleRegistry::new()),
            in_flight: Rc::new(InFlight::default()),
            closing: Cell::new(false),
        }
    }

    /// Marshalling state shared with the sessions
    pub fn bridge(&self) -> &Bridge {
        &self.bridge
    }

    /// Number of live sessions
    pub fn session_count(&self) -> usize {
        self.sessions.borrow().len()
    }

    /// Number of deferred responses still being worked on
    pub fn in_flight(&self) -> usize {
        self.in_flight.count.get()
    }

    /// Whether `close` has been received
    pub fn is_closing(&self) -> bool {
        self.closing.get()
    }

    /// Resolves once no deferred response is left
    pub async fn drained(&self) {
        while self.in_flight() > 0 {
            self.in_flight.idle.notified().await;
        }
    }

    /// Handle one input line. Breaks after a `close` request; later lines
    /// may still carry `ret` replies and should be passed in until
    /// [`Dispatcher::drained`] resolves.
    ///
    /// Must be called from inside a `tokio::task::LocalSet`.
    pub fn dispatch(&self, line: &str) -> ControlFlow<()> {
        let Some(fields) = parse_line(line) else {
            return ControlFlow::Continue(());
        };
        let envelope = Envelope::capture(&fields);

        let request = match Request::from_fields(&fields, &self.bridge) {
            Ok(request) => request,
            Err(err) if is_reply(&fields) => {
                // A reply that cannot be decoded still settles its call
                match fields.get("cid").and_then(Json::as_u64) {
                    Some(cid) => {
                        self.bridge.resolve_reply(cid, Err(err));
                    }
                    None => warn!(error = %err, "Dropping undecodable reply"),
                }
                return ControlFlow::Continue(());
            }
            Err(err) => {
                finish(&self.bridge, envelope, Err(err));
                return ControlFlow::Continue(());
            }
        };

        if request.action == REPLY_ACTION {
            self.reply(request);
            return ControlFlow::Continue(());
        }
        if self.is_closing() {
            debug!(action = %request.action, "Rejecting request after close");
            finish(&self.bridge, envelope, Err(Error::InvalidInput("bridge is closing".to_string())));
            return ControlFlow::Continue(());
        }

        debug!(action = %request.action, vm = ?request.vm_id, "Dispatching request");
        let control = Control::from_name(&request.action);
        let result = self.route(control, request);
        self.respond(envelope, result);

        if control == Some(Control::Close) {
            info!(in_flight = self.in_flight(), "Close requested, shutting down");
            self.closing.set(true);
            return ControlFlow::Break(());
        }
        ControlFlow::Continue(())
    }

    fn route(&self, control: Option<Control>, request: Request) -> Result<Outcome> {
        match control {
            Some(Control::Ping) | Some(Control::Close) => Ok(Value::Undefined.into()),
            Some(Control::Create) => self.create(request),
            Some(Control::Destroy) => self.destroy(request),
            None => {
                let session = self.session(request.session()?)?;
                let action: Action = request.action.parse()?;
                session.perform(action, request, &self.bridge)
            }
        }
    }

    fn session(&self, handle: Handle) -> Result<Rc<Session<F::Engine>>> {
        self.sessions.borrow().get(handle).cloned()
    }

    fn create(&self, request: Request) -> Result<Outcome> {
        let flavor: Flavor = request.flavor.as_deref().unwrap_or("undefined").parse()?;
        let options = EngineOptions::from_value(&request.options)?;

        let handle = self.sessions.borrow_mut().try_add_with(|handle| {
            let events = event_sink(self.bridge.clone(), handle);
            Session::create(&self.factory, flavor, &options, request.code.as_deref(), events)
                .map(Rc::new)
        })?;

        info!(vm = handle, ?flavor, "Session created");
        Ok(Value::from(handle).into())
    }

    fn destroy(&self, request: Request) -> Result<Outcome> {
        let handle = request.session()?;
        let session = self.sessions.borrow_mut().remove(handle)?;
        drop(session);
        info!(vm = handle, "Session destroyed");
        Ok(Value::Undefined.into())
    }

    fn reply(&self, request: Request) {
        let Some(cid) = request.cid else {
            warn!("Reply without cid ignored");
            return;
        };
        let reply = match request.error {
            Some(message) => Err(Error::RemoteCall(message)),
            None => Ok(request.value),
        };
        self.bridge.resolve_reply(cid, reply);
    }

    fn respond(&self, envelope: Envelope, result: Result<Outcome>) {
        match result {
            Ok(Outcome::Ready(value)) => finish(&self.bridge, envelope, Ok(value)),
            Ok(Outcome::Deferred(pending)) => {
                let bridge = self.bridge.clone();
                let in_flight = self.in_flight.clone();
                in_flight.start();
                tokio::task::spawn_local(async move {
                    let result = pending.await;
                    finish(&bridge, envelope, result);
                    in_flight.finish();
                });
            }
            Err(err) => finish(&self.bridge, envelope, Err(err)),
        }
    }
}

fn is_reply(fields: &Map<String, Json>) -> bool {
    fields
        .get("action")
        .and_then(Json::as_str)
        .map(|action| action.strip_prefix(STRING_TAG).unwrap_or(action))
        == Some(REPLY_ACTION)
}

/// Forward engine events of session `handle` as event frames
fn event_sink(bridge: Bridge, handle: Handle) -> EventSink {
    Rc::new(move |event| match event {
        EngineEvent::Console { text } => {
            if let Err(err) = bridge.emit(&EventFrame::console(handle, text)) {
                error!(vm = handle, error = %err, "Failed to write console event");
            }
        }
    })
}

/// Encode the result and write the response
fn finish(bridge: &Bridge, envelope: Envelope, result: Result<Value>) {
    let frame = match result.and_then(|value| bridge.encode(&value)) {
        Ok(value) => ResponseFrame::success(envelope.id, value),
        Err(err) => {
            if err.is_client_error() {
                debug!(error = %err, "Request rejected");
            } else {
                warn!(error = %err, "Request failed");
            }
            ResponseFrame::error(envelope.id, err.to_string())
        }
    }
    .with_routing(envelope.vm_id, envelope.module_id);

    if let Err(err) = bridge.emit(&frame) {
        error!(error = %err, "Failed to write response");
    }
}
