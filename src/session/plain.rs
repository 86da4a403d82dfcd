//! Plain evaluator session

use tracing::debug;

use super::Action;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::protocol::Request;
use crate::value::Outcome;

/// Session evaluating code in one global scope
pub struct PlainSession<E: Engine> {
    engine: E,
}

impl<E: Engine> PlainSession<E> {
    /// Wrap an engine, running setup code first when given
    pub fn new(engine: E, code: Option<&str>) -> Result<Self> {
        if let Some(code) = code {
            let outcome = engine.run(code)?;
            if outcome.is_deferred() {
                debug!("Setup code returned a pending value; not waiting for it");
            }
        }
        Ok(PlainSession { engine })
    }

    pub fn perform(&self, action: Action, request: Request) -> Result<Outcome> {
        match action {
            Action::Run => self.engine.run(request.require_code()?),
            Action::Call => {
                let name = request.function_name.as_deref().ok_or_else(|| {
                    Error::InvalidInput("call requires a functionName".to_string())
                })?;
                self.engine.call_function(name, request.args)
            }
            Action::Get
            | Action::GetMember
            | Action::CallMember
            | Action::SetMember
            | Action::DestroyModule
            | Action::CallJsFunc => Err(Error::UnknownAction(action.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fake::{recording_sink, FakeFactory};
    use crate::engine::{EngineFactory, EngineOptions, Flavor};
    use crate::value::{Function, Value};

    fn session(options: &EngineOptions, code: Option<&str>) -> Result<PlainSession<crate::engine::fake::FakeEngine>> {
        let (sink, _) = recording_sink();
        let engine = FakeFactory::default().create(Flavor::Plain, options, sink)?;
        PlainSession::new(engine, code)
    }

    fn request(action: &str) -> Request {
        Request {
            action: action.to_string(),
            ..Request::default()
        }
    }

    #[test]
    fn test_run() {
        let session = session(&EngineOptions::default(), None).unwrap();
        let mut run = request("run");
        run.code = Some("1+1".into());
        match session.perform(Action::Run, run).unwrap() {
            Outcome::Ready(value) => assert_eq!(value, Value::from(2i64)),
            Outcome::Deferred(_) => panic!("expected ready"),
        }
        assert!(matches!(
            session.perform(Action::Run, request("run")),
            Err(Error::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_call_global_function() {
        let mut options = EngineOptions::default();
        options.sandbox.insert(
            "twice".into(),
            Value::Function(Function::from_fn(|args| {
                Ok(Value::Array([args.clone(), args].concat()))
            })),
        );
        let session = session(&options, None).unwrap();
        let mut call = request("call");
        call.function_name = Some("twice".into());
        call.args = vec![Value::from("x")];
        let value = session.perform(Action::Call, call).unwrap().resolve().await.unwrap();
        assert_eq!(value, Value::Array(vec!["x".into(), "x".into()]));
    }

    #[test]
    fn test_module_actions_are_unknown() {
        let session = session(&EngineOptions::default(), None).unwrap();
        let err = session.perform(Action::GetMember, request("getMember")).unwrap_err();
        assert_eq!(err.to_string(), "Unknown action: getMember");
    }

    #[test]
    fn test_setup_code_failure_fails_creation() {
        assert!(session(&EngineOptions::default(), Some("throw nope")).is_err());
        assert!(session(&EngineOptions::default(), Some("1+2")).is_ok());
    }
}
