//! Line protocol - one JSON object per line in both directions
//!
//! ## Message Types
//!
//! - `Request`: inbound action, answered by exactly one response
//! - `ret`: inbound reply to a remote call, never answered
//! - `ResponseFrame`: outbound answer to a request
//! - `EventFrame`: outbound console output or remote call, written unprompted

pub mod request;
pub mod schema;

pub use request::{parse_line, Envelope, Request, REPLY_ACTION};
pub use schema::{
    outbound_channel, EventFrame, Frame, Outbound, OutboundReceiver, ResponseFrame, Status,
    CONSOLE_EVENT, NO_OWNER, REMOTE_CALL_EVENT,
};
