//! Module-hosting session
//!
//! Every `run` loads a module and registers it under a handle local to this
//! session. Module operations look the handle up first and fail with
//! `NotFound` when it is not registered.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::debug;

use super::Action;
use crate::bridge::Bridge;
use crate::codec;
use crate::engine::Engine;
use crate::error::Result;
use crate::protocol::Request;
use crate::registry::{Handle, HandleRegistry};
use crate::value::{Outcome, Value};

/// Session hosting CommonJS-style modules
pub struct ModuleHostSession<E: Engine> {
    modules: RefCell<HandleRegistry<Rc<E::Module>>>,
    engine: E,
}

impl<E: Engine> ModuleHostSession<E> {
    pub fn new(engine: E) -> Self {
        ModuleHostSession {
            modules: RefCell::new(HandleRegistry::new()),
            engine,
        }
    }

    /// Number of loaded modules
    pub fn module_count(&self) -> usize {
        self.modules.borrow().len()
    }

    fn module(&self, handle: Handle) -> Result<Rc<E::Module>> {
        self.modules.borrow().get(handle).cloned()
    }

    pub fn perform(&self, action: Action, request: Request, bridge: &Bridge) -> Result<Outcome> {
        match action {
            Action::Run => {
                let module = self
                    .engine
                    .load_module(request.require_code()?, request.filename.as_deref())?;
                let handle = self.modules.borrow_mut().add(Rc::new(module));
                debug!(module = handle, "Module loaded");
                Ok(Value::from(handle).into())
            }
            Action::Get => {
                let module = self.module(request.module()?)?;
                Ok(self.engine.module_value(&module)?.into())
            }
            Action::Call => {
                let module = self.module(request.module()?)?;
                self.engine.call_module(&module, request.args)
            }
            Action::GetMember => {
                let module = self.module(request.module()?)?;
                let value = self.engine.get_member(&module, request.require_member()?)?;
                Ok(value.into())
            }
            Action::CallMember => {
                let module = self.module(request.module()?)?;
                let member = request.require_member()?.to_string();
                self.engine.call_member(&module, &member, request.args)
            }
            Action::SetMember => {
                let module = self.module(request.module()?)?;
                let member = request.require_member()?.to_string();
                self.engine.set_member(&module, &member, request.arg)?;
                Ok(Value::Undefined.into())
            }
            Action::DestroyModule => {
                let handle = request.module()?;
                self.modules.borrow_mut().remove(handle)?;
                debug!(module = handle, "Module destroyed");
                Ok(Value::Undefined.into())
            }
            Action::CallJsFunc => {
                let id = codec::parse_local_ref(&request.ids)?;
                let function = bridge.resolve_local(id)?;
                function.invoke(request.args)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use crate::engine::fake::{recording_sink, FakeEngine, FakeFactory};
    use crate::engine::{EngineFactory, EngineOptions, Flavor};
    use crate::error::Error;
    use crate::protocol::outbound_channel;
    use crate::value::Function;

    fn session() -> ModuleHostSession<FakeEngine> {
        let (sink, _) = recording_sink();
        let engine = FakeFactory::default()
            .create(Flavor::ModuleHost, &EngineOptions::default(), sink)
            .unwrap();
        ModuleHostSession::new(engine)
    }

    fn bridge() -> Bridge {
        let (tx, _rx) = outbound_channel();
        Bridge::new(tx, &BridgeConfig::default())
    }

    fn request(action: &str) -> Request {
        Request {
            action: action.to_string(),
            ..Request::default()
        }
    }

    fn ready(outcome: Outcome) -> Value {
        match outcome {
            Outcome::Ready(value) => value,
            Outcome::Deferred(_) => panic!("expected ready"),
        }
    }

    fn load(session: &ModuleHostSession<FakeEngine>, bridge: &Bridge, code: &str) -> Handle {
        let mut run = request("run");
        run.code = Some(code.to_string());
        ready(session.perform(Action::Run, run, bridge).unwrap())
            .as_u64()
            .unwrap()
    }

    #[test]
    fn test_run_registers_modules_from_one() {
        let session = session();
        let bridge = bridge();
        assert_eq!(load(&session, &bridge, "a=1"), 1);
        assert_eq!(load(&session, &bridge, "a=2"), 2);
        assert_eq!(session.module_count(), 2);
    }

    #[test]
    fn test_member_access() {
        let session = session();
        let bridge = bridge();
        let handle = load(&session, &bridge, "name=bar;count=3");

        let mut get = request("getMember");
        get.module_id = Some(handle);
        get.member = Some("name".into());
        assert_eq!(ready(session.perform(Action::GetMember, get, &bridge).unwrap()), Value::from("bar"));

        let mut set = request("setMember");
        set.module_id = Some(handle);
        set.member = Some("name".into());
        set.arg = Value::from("baz");
        session.perform(Action::SetMember, set, &bridge).unwrap();

        let mut whole = request("get");
        whole.module_id = Some(handle);
        let Value::Object(exports) = ready(session.perform(Action::Get, whole, &bridge).unwrap()) else {
            panic!("expected exports object");
        };
        assert_eq!(exports["name"], Value::from("baz"));
        assert_eq!(exports["count"], Value::from(3i64));
    }

    #[test]
    fn test_unknown_module_is_not_found() {
        let session = session();
        let bridge = bridge();
        let mut get = request("get");
        get.module_id = Some(9);
        let err = session.perform(Action::Get, get, &bridge).err().unwrap();
        assert_eq!(err.to_string(), "Index doesn't exist: 9");
    }

    #[test]
    fn test_destroy_module() {
        let session = session();
        let bridge = bridge();
        let handle = load(&session, &bridge, "a=1");

        let mut destroy = request("destroyModule");
        destroy.module_id = Some(handle);
        session.perform(Action::DestroyModule, destroy, &bridge).unwrap();
        assert_eq!(session.module_count(), 0);

        let mut again = request("destroyModule");
        again.module_id = Some(handle);
        assert!(matches!(
            session.perform(Action::DestroyModule, again, &bridge),
            Err(Error::NotFound(_))
        ));

        // Handles are not reused
        assert_eq!(load(&session, &bridge, "a=1"), 2);
    }

    #[tokio::test]
    async fn test_call_js_func_uses_interned_function() {
        let session = session();
        let bridge = bridge();
        let callback = Function::from_fn(|args| Ok(Value::from(args.len() as u64)));
        let encoded = bridge.encode(&Value::Function(callback)).unwrap().unwrap();
        assert_eq!(encoded, serde_json::json!("jsfun0"));

        let mut call = request("callJsFunc");
        call.ids = Value::from("jsfun0");
        call.args = vec![Value::Null, Value::Null];
        match session.perform(Action::CallJsFunc, call, &bridge).unwrap() {
            Outcome::Ready(value) => assert_eq!(value, Value::from(2u64)),
            Outcome::Deferred(_) => panic!("synchronous callbacks answer in order"),
        }

        let mut missing = request("callJsFunc");
        missing.ids = Value::from(5u64);
        assert!(matches!(
            session.perform(Action::CallJsFunc, missing, &bridge),
            Err(Error::NotFound(_))
        ));
    }
}
