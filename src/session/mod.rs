//! Sandbox sessions
//!
//! A session wraps one engine and exposes the actions a request may name.
//! Plain sessions answer `run` and `call`; module-hosting sessions keep a
//! registry of loaded modules and answer the full action set.

pub mod module_host;
pub mod plain;

use std::fmt;
use std::str::FromStr;

use crate::bridge::Bridge;
use crate::engine::{Engine, EngineFactory, EngineOptions, EventSink, Flavor};
use crate::error::{Error, Result};
use crate::protocol::Request;
use crate::value::Outcome;

pub use module_host::ModuleHostSession;
pub use plain::PlainSession;

/// Actions routed to a session by `vmId`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Run,
    Call,
    Get,
    GetMember,
    CallMember,
    SetMember,
    DestroyModule,
    CallJsFunc,
}

impl Action {
    /// Wire name of the action
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Run => "run",
            Action::Call => "call",
            Action::Get => "get",
            Action::GetMember => "getMember",
            Action::CallMember => "callMember",
            Action::SetMember => "setMember",
            Action::DestroyModule => "destroyModule",
            Action::CallJsFunc => "callJsFunc",
        }
    }
}

impl FromStr for Action {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "run" => Ok(Action::Run),
            "call" => Ok(Action::Call),
            "get" => Ok(Action::Get),
            "getMember" => Ok(Action::GetMember),
            "callMember" => Ok(Action::CallMember),
            "setMember" => Ok(Action::SetMember),
            "destroyModule" => Ok(Action::DestroyModule),
            "callJsFunc" => Ok(Action::CallJsFunc),
            other => Err(Error::UnknownAction(other.to_string())),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One created sandbox
pub enum Session<E: Engine> {
    Plain(PlainSession<E>),
    ModuleHost(ModuleHostSession<E>),
}

impl<E: Engine> Session<E> {
    /// Build a session of `flavor`. Plain sessions run `code` right away.
    pub fn create<F>(
        factory: &F,
        flavor: Flavor,
        options: &EngineOptions,
        code: Option<&str>,
        events: EventSink,
    ) -> Result<Self>
    where
        F: EngineFactory<Engine = E>,
    {
        let engine = factory.create(flavor, options, events)?;
        match flavor {
            Flavor::Plain => PlainSession::new(engine, code).map(Session::Plain),
            Flavor::ModuleHost => Ok(Session::ModuleHost(ModuleHostSession::new(engine))),
        }
    }

    /// Flavor this session was created with
    pub fn flavor(&self) -> Flavor {
        match self {
            Session::Plain(_) => Flavor::Plain,
            Session::ModuleHost(_) => Flavor::ModuleHost,
        }
    }

    /// Perform an action. Actions the flavor lacks fail with `UnknownAction`.
    pub fn perform(&self, action: Action, request: Request, bridge: &Bridge) -> Result<Outcome> {
        match self {
            Session::Plain(session) => session.perform(action, request),
            Session::ModuleHost(session) => session.perform(action, request, bridge),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_names_round_trip() {
        for action in [
            Action::Run,
            Action::Call,
            Action::Get,
            Action::GetMember,
            Action::CallMember,
            Action::SetMember,
            Action::DestroyModule,
            Action::CallJsFunc,
        ] {
            assert_eq!(action.as_str().parse::<Action>().unwrap(), action);
        }
    }

    #[test]
    fn test_unknown_action() {
        let err = "explode".parse::<Action>().unwrap_err();
        assert_eq!(err.to_string(), "Unknown action: explode");
        // Names are case sensitive
        assert!("Run".parse::<Action>().is_err());
    }
}
