//! Management hub for the certfleet coordination server
//!
//! Hosts the WebSocket push channel instances attach to, binds connections
//! to instance identities, routes command results back to waiting callers
//! and runs the periodic item poller.

pub mod hub;
pub mod worker;

pub use hub::{HubError, ManagementHub};
pub use worker::{ManagementWorker, DEFAULT_POLL_INTERVAL};
