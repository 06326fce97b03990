use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;
use tracing::{debug, info};

use certfleet_proto::{ActionStep, ManagedItem, StatusSummary};

use crate::facade::CommandError;
use crate::models::*;
use crate::AppState;

/// Default log lines when the query does not say
const DEFAULT_LOG_LINES: usize = 100;

fn command_error_response(error: CommandError) -> (StatusCode, Json<ErrorResponse>) {
    let (status, code) = match &error {
        CommandError::InstanceNotConnected(_) => {
            (StatusCode::NOT_FOUND, "INSTANCE_NOT_CONNECTED")
        }
        CommandError::NoResponse(_) => (StatusCode::GATEWAY_TIMEOUT, "INSTANCE_NO_RESPONSE"),
        CommandError::BadPayload(_) => (StatusCode::BAD_GATEWAY, "INSTANCE_BAD_PAYLOAD"),
        CommandError::ChannelClosed(_) => (StatusCode::BAD_GATEWAY, "PUSH_CHANNEL_CLOSED"),
    };
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            code: Some(code.to_string()),
        }),
    )
}

/// Health check endpoint
#[utoipa::path(
    get,
    path = "/api/v1/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse)
    ),
    tag = "system"
)]
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        connected_instances: state.api.connected_instances().len(),
        pending_commands: state.api.pending_commands(),
    })
}

/// List connected instances
#[utoipa::path(
    get,
    path = "/api/v1/instances",
    responses(
        (status = 200, description = "Connected instances", body = InstanceList)
    ),
    tag = "instances"
)]
pub async fn list_instances(State(state): State<Arc<AppState>>) -> Json<InstanceList> {
    debug!("Listing connected instances");

    let instances = state.api.connected_instances();
    let total = instances.len();

    Json(InstanceList { instances, total })
}

/// Fleet-wide managed certificate summary
#[utoipa::path(
    get,
    path = "/api/v1/summary",
    responses(
        (status = 200, description = "Aggregated health counters", body = StatusSummary)
    ),
    tag = "items"
)]
pub async fn get_summary(State(state): State<Arc<AppState>>) -> Json<StatusSummary> {
    Json(state.api.get_managed_certificate_summary())
}

/// Cached managed items for one instance
#[utoipa::path(
    get,
    path = "/api/v1/instances/{instance_id}/items",
    params(
        ("instance_id" = String, Path, description = "Instance ID")
    ),
    responses(
        (status = 200, description = "Cached managed items", body = ItemList),
        (status = 404, description = "Instance not connected", body = ErrorResponse)
    ),
    tag = "items"
)]
pub async fn list_instance_items(
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
) -> Result<Json<ItemList>, (StatusCode, Json<ErrorResponse>)> {
    debug!("Listing cached items for instance: {}", instance_id);

    if !state.api.is_connected(&instance_id) {
        return Err(command_error_response(CommandError::InstanceNotConnected(
            instance_id,
        )));
    }

    let items = state.api.cached_items(&instance_id);
    let total = items.len();

    Ok(Json(ItemList {
        instance_id,
        items,
        total,
    }))
}

/// Fetch one managed certificate live from its instance
#[utoipa::path(
    get,
    path = "/api/v1/instances/{instance_id}/items/{item_id}",
    params(
        ("instance_id" = String, Path, description = "Instance ID"),
        ("item_id" = String, Path, description = "Managed item ID")
    ),
    responses(
        (status = 200, description = "Managed certificate", body = ManagedItem),
        (status = 404, description = "Instance not connected", body = ErrorResponse),
        (status = 504, description = "Instance did not respond", body = ErrorResponse)
    ),
    tag = "items"
)]
pub async fn get_item(
    State(state): State<Arc<AppState>>,
    Path((instance_id, item_id)): Path<(String, String)>,
) -> Result<Json<ManagedItem>, (StatusCode, Json<ErrorResponse>)> {
    debug!("Fetching item {} from instance {}", item_id, instance_id);

    state
        .api
        .get_managed_certificate(&instance_id, &item_id)
        .await
        .map(Json)
        .map_err(command_error_response)
}

/// Store or update a managed certificate on an instance
#[utoipa::path(
    post,
    path = "/api/v1/instances/{instance_id}/items",
    params(
        ("instance_id" = String, Path, description = "Instance ID")
    ),
    request_body = ManagedItem,
    responses(
        (status = 200, description = "Stored managed certificate", body = ManagedItem),
        (status = 404, description = "Instance not connected", body = ErrorResponse),
        (status = 504, description = "Instance did not respond", body = ErrorResponse)
    ),
    tag = "items"
)]
pub async fn update_item(
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
    Json(item): Json<ManagedItem>,
) -> Result<Json<ManagedItem>, (StatusCode, Json<ErrorResponse>)> {
    info!("Updating item {} on instance {}", item.id, instance_id);

    state
        .api
        .update_managed_certificate(&instance_id, item)
        .await
        .map(Json)
        .map_err(command_error_response)
}

/// Delete a managed certificate from an instance
#[utoipa::path(
    delete,
    path = "/api/v1/instances/{instance_id}/items/{item_id}",
    params(
        ("instance_id" = String, Path, description = "Instance ID"),
        ("item_id" = String, Path, description = "Managed item ID")
    ),
    responses(
        (status = 200, description = "Delete outcome", body = DeleteItemResponse),
        (status = 404, description = "Instance not connected", body = ErrorResponse),
        (status = 504, description = "Instance did not respond", body = ErrorResponse)
    ),
    tag = "items"
)]
pub async fn delete_item(
    State(state): State<Arc<AppState>>,
    Path((instance_id, item_id)): Path<(String, String)>,
) -> Result<Json<DeleteItemResponse>, (StatusCode, Json<ErrorResponse>)> {
    info!("Deleting item {} on instance {}", item_id, instance_id);

    state
        .api
        .remove_managed_certificate(&instance_id, &item_id)
        .await
        .map(|deleted| Json(DeleteItemResponse { deleted }))
        .map_err(command_error_response)
}

/// Fetch the tail of one managed item's log
#[utoipa::path(
    get,
    path = "/api/v1/instances/{instance_id}/items/{item_id}/log",
    params(
        ("instance_id" = String, Path, description = "Instance ID"),
        ("item_id" = String, Path, description = "Managed item ID"),
        ("max_lines" = Option<usize>, Query, description = "Maximum lines to return (default: 100, max: 1000)")
    ),
    responses(
        (status = 200, description = "Log tail", body = ItemLogResponse),
        (status = 404, description = "Instance not connected", body = ErrorResponse),
        (status = 504, description = "Instance did not respond", body = ErrorResponse)
    ),
    tag = "items"
)]
pub async fn get_item_log(
    State(state): State<Arc<AppState>>,
    Path((instance_id, item_id)): Path<(String, String)>,
    Query(query): Query<LogQuery>,
) -> Result<Json<ItemLogResponse>, (StatusCode, Json<ErrorResponse>)> {
    let max_lines = query.max_lines.unwrap_or(DEFAULT_LOG_LINES);
    debug!(
        "Fetching log for item {} on instance {} (max {} lines)",
        item_id, instance_id, max_lines
    );

    state
        .api
        .get_item_log(&instance_id, &item_id, max_lines)
        .await
        .map(|lines| Json(ItemLogResponse { item_id, lines }))
        .map_err(command_error_response)
}

/// Dry-run the configuration checks for a managed certificate
#[utoipa::path(
    post,
    path = "/api/v1/instances/{instance_id}/items/test",
    params(
        ("instance_id" = String, Path, description = "Instance ID")
    ),
    request_body = ManagedItem,
    responses(
        (status = 200, description = "Test steps", body = Vec<ActionStep>),
        (status = 404, description = "Instance not connected", body = ErrorResponse),
        (status = 504, description = "Instance did not respond", body = ErrorResponse)
    ),
    tag = "items"
)]
pub async fn test_item(
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
    Json(item): Json<ManagedItem>,
) -> Result<Json<Vec<ActionStep>>, (StatusCode, Json<ErrorResponse>)> {
    info!("Testing item {} configuration on instance {}", item.id, instance_id);

    state
        .api
        .test_managed_certificate_configuration(&instance_id, item)
        .await
        .map(Json)
        .map_err(command_error_response)
}
