//! Remote call bridge
//!
//! Owns the per-dispatcher marshalling state: the function intern table, the
//! pending remote calls, and the output queue. Calling a remote forward
//! reference emits a `pyfun` event with a fresh correlation id and parks a
//! oneshot sender until the matching `ret` line arrives.
//!
//! All state lives behind `Rc`/`RefCell` and is only touched from the single
//! dispatch thread. No borrow is held across a call into an engine.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::time::Duration;

use futures::future;
use serde::Serialize;
use serde_json::Value as Json;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::codec::{self, Codec};
use crate::config::BridgeConfig;
use crate::error::{Error, Result};
use crate::intern::{FunctionId, FunctionTable};
use crate::protocol::{EventFrame, Frame, Outbound};
use crate::value::{CallFuture, Callable, Function, Value};

/// Correlation id of a remote call
pub type CallId = u64;

type PendingReply = oneshot::Sender<Result<Value>>;

struct BridgeState {
    codec: Codec,
    functions: RefCell<FunctionTable>,
    pending: RefCell<HashMap<CallId, PendingReply>>,
    next_cid: Cell<CallId>,
    input_closed: Cell<bool>,
    outbound: Outbound,
    timeout: Option<Duration>,
}

/// Shared handle to the marshalling state of one dispatcher
#[derive(Clone)]
pub struct Bridge {
    state: Rc<BridgeState>,
}

impl Bridge {
    /// Create a bridge writing frames to `outbound`
    pub fn new(outbound: Outbound, config: &BridgeConfig) -> Self {
        Bridge {
            state: Rc::new(BridgeState {
                codec: Codec::new(config.max_depth),
                functions: RefCell::new(FunctionTable::new()),
                pending: RefCell::new(HashMap::new()),
                next_cid: Cell::new(0),
                input_closed: Cell::new(false),
                outbound,
                timeout: config.remote_call_timeout,
            }),
        }
    }

    /// Nesting limit shared by the codec and engine conversions
    pub fn max_depth(&self) -> usize {
        self.state.codec.max_depth()
    }

    /// Encode a live value; `None` means `undefined`
    pub fn encode(&self, value: &Value) -> Result<Option<Json>> {
        let mut functions = self.state.functions.borrow_mut();
        self.state.codec.encode(value, &mut functions)
    }

    /// Decode a wire value. Remote references become callables owned by `owner`.
    pub fn decode(&self, wire: &Json, owner: i64) -> Result<Value> {
        let bridge = Rc::downgrade(&self.state);
        let functions = self.state.functions.borrow();
        self.state.codec.decode(wire, &functions, &mut |remote_id| {
            Function::new(RemoteFunction {
                remote_id: remote_id.to_string(),
                owner,
                bridge: bridge.clone(),
            })
        })
    }

    /// Look up an interned local function
    pub fn resolve_local(&self, id: FunctionId) -> Result<Function> {
        self.state
            .functions
            .borrow()
            .resolve(id)
            .ok_or_else(|| Error::NotFound(codec::local_tag(id)))
    }

    /// Queue one frame for the writer
    pub fn emit<T: Serialize>(&self, frame: &T) -> Result<()> {
        self.state.emit(frame)
    }

    /// Ask the writer to stop once everything queued so far is written
    pub fn shutdown(&self) {
        if self.state.outbound.send(Frame::Shutdown).is_err() {
            debug!("Output already closed");
        }
    }

    /// No reply can arrive any more: fail every waiting remote call, and every
    /// later one without emitting its event.
    pub fn close_input(&self) {
        self.state.input_closed.set(true);
        let abandoned: Vec<_> = self.state.pending.borrow_mut().drain().collect();
        for (cid, sender) in abandoned {
            debug!(cid, "Failing remote call, input closed");
            let _ = sender.send(Err(Error::RemoteCall(format!(
                "call {} abandoned, input closed",
                cid
            ))));
        }
    }

    /// Call a function owned by the remote side.
    ///
    /// The event is emitted before this returns; the future only waits for
    /// the reply.
    pub fn invoke_remote(&self, remote_id: &str, owner: i64, args: Vec<Value>) -> CallFuture {
        self.state.invoke(remote_id, owner, args)
    }

    /// Settle the pending call `cid`. Returns false when nothing was waiting.
    pub fn resolve_reply(&self, cid: CallId, reply: Result<Value>) -> bool {
        let sender = self.state.pending.borrow_mut().remove(&cid);
        match sender {
            Some(sender) => {
                debug!(cid, ok = reply.is_ok(), "Remote call answered");
                if sender.send(reply).is_err() {
                    debug!(cid, "Caller stopped waiting for remote call");
                }
                true
            }
            None => {
                warn!(cid, "Reply for unknown remote call");
                false
            }
        }
    }

    /// Number of remote calls waiting for a reply
    pub fn pending_calls(&self) -> usize {
        self.state.pending.borrow().len()
    }

    /// Number of interned local functions
    pub fn interned_functions(&self) -> usize {
        self.state.functions.borrow().len()
    }
}

impl BridgeState {
    fn emit<T: Serialize>(&self, frame: &T) -> Result<()> {
        let line = serde_json::to_string(frame)?;
        if self.outbound.send(Frame::Line(line)).is_err() {
            debug!("Output closed, dropping frame");
        }
        Ok(())
    }

    fn invoke(self: &Rc<Self>, remote_id: &str, owner: i64, args: Vec<Value>) -> CallFuture {
        if self.input_closed.get() {
            return Box::pin(future::ready(Err(Error::RemoteCall(format!(
                "{} cannot reply, input closed",
                codec::remote_tag(remote_id)
            )))));
        }
        let payload = {
            let mut functions = self.functions.borrow_mut();
            self.codec.encode(&Value::Array(args), &mut functions)
        };
        let payload = match payload {
            Ok(payload) => payload.unwrap_or(Json::Null),
            Err(e) => return Box::pin(future::ready(Err(e))),
        };

        let cid = self.next_cid.get();
        self.next_cid.set(cid + 1);

        let event = EventFrame::remote_call(codec::remote_tag(remote_id), owner, payload, cid);
        if let Err(e) = self.emit(&event) {
            return Box::pin(future::ready(Err(e)));
        }

        let (sender, receiver) = oneshot::channel();
        self.pending.borrow_mut().insert(cid, sender);
        debug!(cid, remote = remote_id, owner, "Remote call emitted");

        let state = Rc::downgrade(self);
        let timeout = self.timeout;
        Box::pin(async move {
            let reply = match timeout {
                Some(limit) => match tokio::time::timeout(limit, receiver).await {
                    Ok(reply) => reply,
                    Err(_) => {
                        if let Some(state) = state.upgrade() {
                            state.pending.borrow_mut().remove(&cid);
                        }
                        warn!(cid, ?limit, "Remote call timed out");
                        return Err(Error::RemoteCall(format!(
                            "call {} timed out after {:?}",
                            cid, limit
                        )));
                    }
                },
                None => receiver.await,
            };
            reply.map_err(|_| Error::RemoteCall(format!("call {} was abandoned", cid)))?
        })
    }
}

/// Local stand-in for a function that lives on the remote side
pub struct RemoteFunction {
    remote_id: String,
    owner: i64,
    bridge: Weak<BridgeState>,
}

impl RemoteFunction {
    /// Session the call events are attributed to
    pub fn owner(&self) -> i64 {
        self.owner
    }
}

impl Callable for RemoteFunction {
    fn call(&self, args: Vec<Value>) -> CallFuture {
        match self.bridge.upgrade() {
            Some(state) => state.invoke(&self.remote_id, self.owner, args),
            None => Box::pin(future::ready(Err(Error::RemoteCall(
                "bridge has shut down".to_string(),
            )))),
        }
    }

    fn remote_ref(&self) -> Option<&str> {
        Some(&self.remote_id)
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
