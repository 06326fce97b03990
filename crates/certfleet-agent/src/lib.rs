//! Instance-side agent for the certfleet management hub
//!
//! The agent dials out to the hub's push channel, identifies itself, and
//! answers the commands the hub sends down: identity, item inventory, item
//! CRUD, log tails and configuration tests. Connections that drop are retried
//! with exponential backoff.

pub mod client;
pub mod reconnect;
pub mod service;

pub use client::{AgentClient, AgentError};
pub use reconnect::{ReconnectConfig, ReconnectError, ReconnectManager};
pub use service::{InstanceService, LocalStoreService, ServiceError};
