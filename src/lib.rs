//! Conveyor - reliable-delivery messaging core
//!
//! The in-process backbone of a message-driven service: dispatches a root
//! command, event, or query through its handlers, cascades every message
//! the handlers publish, and guarantees outbound messages are handed off
//! to a transport exactly once per committed unit of work.

pub mod bus;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod message;
pub mod queue;
pub mod registry;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod transport;
pub mod uow;
pub mod utils;
