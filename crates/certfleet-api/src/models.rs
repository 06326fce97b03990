use certfleet_proto::{InstanceInfo, ManagedItem};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Connected instance list
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct InstanceList {
    /// Instances currently holding a push channel connection
    pub instances: Vec<InstanceInfo>,
    /// Total count
    pub total: usize,
}

/// Cached managed items for one instance
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ItemList {
    /// Instance the items belong to
    pub instance_id: String,
    /// Items as last reported by the instance
    pub items: Vec<ManagedItem>,
    /// Total count
    pub total: usize,
}

/// Outcome of a remote item delete
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DeleteItemResponse {
    /// Whether the instance confirmed the delete
    pub deleted: bool,
}

/// Tail of one managed item's log
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ItemLogResponse {
    /// Item the log belongs to
    pub item_id: String,
    /// Most recent lines, oldest first
    pub lines: Vec<String>,
}

/// Query parameters for log retrieval
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct LogQuery {
    /// Maximum number of lines to return (default 100, capped server-side)
    pub max_lines: Option<usize>,
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    /// Service status
    pub status: String,
    /// Service version
    pub version: String,
    /// Connected identified instances
    pub connected_instances: usize,
    /// Commands currently awaiting results
    pub pending_commands: usize,
}

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    /// Error message
    pub error: String,
    /// Error code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}
