//! Management Push Channel Protocol
//!
//! This crate defines the wire frames exchanged between the certfleet
//! coordination server and its managed instances, plus the shared
//! instance and managed-item models.

pub mod messages;
pub mod models;

pub use messages::{
    CommandArg, CommandRequest, CommandResult, CommandType, HubFrame, ProtoError, ARG_ITEM,
    ARG_ITEM_ID, ARG_MAX_LINES,
};
pub use models::{
    ActionStep, InstanceInfo, InstanceItems, ItemHealth, ManagedItem, StatusSummary,
};

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Path where the coordination server exposes the push channel
pub const HUB_PATH: &str = "/api/internal/managementhub";
