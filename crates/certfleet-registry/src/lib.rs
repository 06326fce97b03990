//! Shared registry state for the certfleet coordination server
//!
//! Tracks push channel connections and their bound instance identities,
//! caches managed items per instance, and correlates dispatched commands
//! with the results instances send back.

pub mod command_waiters;
pub mod instance_registry;

pub use command_waiters::CommandWaiters;
pub use instance_registry::InstanceRegistry;
