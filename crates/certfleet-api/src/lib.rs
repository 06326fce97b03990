pub mod facade;
pub mod handlers;
pub mod models;

use axum::{
    routing::{get, post},
    Router,
};
use std::{net::SocketAddr, sync::Arc};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use certfleet_hub::ManagementHub;

pub use facade::{CommandError, ManagementApi, DEFAULT_COMMAND_TIMEOUT};

/// Application state shared across handlers
pub struct AppState {
    pub api: ManagementApi,
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Certfleet API",
        version = "0.1.0",
        description = "REST API for coordinating certificate instances from a central hub",
        contact(
            name = "Certfleet Team",
            email = "team@certfleet.dev"
        )
    ),
    paths(
        handlers::health_check,
        handlers::list_instances,
        handlers::get_summary,
        handlers::list_instance_items,
        handlers::get_item,
        handlers::update_item,
        handlers::delete_item,
        handlers::get_item_log,
        handlers::test_item,
    ),
    components(
        schemas(
            certfleet_proto::InstanceInfo,
            certfleet_proto::ItemHealth,
            certfleet_proto::ManagedItem,
            certfleet_proto::ActionStep,
            certfleet_proto::StatusSummary,
            certfleet_proto::CommandType,
            models::InstanceList,
            models::ItemList,
            models::DeleteItemResponse,
            models::ItemLogResponse,
            models::HealthResponse,
            models::ErrorResponse,
        )
    ),
    tags(
        (name = "instances", description = "Connected instance endpoints"),
        (name = "items", description = "Managed certificate endpoints"),
        (name = "system", description = "System health and info endpoints")
    )
)]
struct ApiDoc;

/// API server configuration
pub struct ApiServerConfig {
    /// Address to bind the server
    pub bind_addr: SocketAddr,
    /// Enable CORS (for development)
    pub enable_cors: bool,
    /// Serve the management REST API and Swagger UI
    pub enable_management: bool,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8088".parse().unwrap(),
            enable_cors: true,
            enable_management: true,
        }
    }
}

/// API Server
///
/// Hosts the instance push channel plus, unless disabled, the management
/// REST API and Swagger UI on the same listener.
pub struct ApiServer {
    config: ApiServerConfig,
    state: Arc<AppState>,
    hub: ManagementHub,
}

impl ApiServer {
    /// Create a new API server
    pub fn new(config: ApiServerConfig, api: ManagementApi, hub: ManagementHub) -> Self {
        let state = Arc::new(AppState { api });

        Self { config, state, hub }
    }

    /// Build the router with all routes
    pub fn build_router(&self) -> Router {
        // The push channel is always served; instances must be able to
        // attach even when the management surface is disabled.
        let mut router = Router::new().merge(self.hub.router());

        if self.config.enable_management {
            let api_doc = ApiDoc::openapi();

            let management_router = Router::new()
                .route("/api/v1/health", get(handlers::health_check))
                .route("/api/v1/instances", get(handlers::list_instances))
                .route("/api/v1/summary", get(handlers::get_summary))
                .route(
                    "/api/v1/instances/{instance_id}/items",
                    get(handlers::list_instance_items).post(handlers::update_item),
                )
                .route(
                    "/api/v1/instances/{instance_id}/items/test",
                    post(handlers::test_item),
                )
                .route(
                    "/api/v1/instances/{instance_id}/items/{item_id}",
                    get(handlers::get_item).delete(handlers::delete_item),
                )
                .route(
                    "/api/v1/instances/{instance_id}/items/{item_id}/log",
                    get(handlers::get_item_log),
                )
                .with_state(self.state.clone());

            // SwaggerUi automatically creates a route for /api/openapi.json
            router = router
                .merge(SwaggerUi::new("/swagger-ui").url("/api/openapi.json", api_doc))
                .merge(management_router);
        }

        // Build middleware stack
        let mut router = router.layer(TraceLayer::new_for_http());

        if self.config.enable_cors {
            router = router.layer(CorsLayer::permissive());
        }

        router
    }

    /// Start the API server
    pub async fn start(self) -> Result<(), anyhow::Error> {
        let bind_addr = self.config.bind_addr;
        let management = self.config.enable_management;
        let router = self.build_router();

        info!("Starting API server on {}", bind_addr);
        if management {
            info!("OpenAPI spec: http://{}/api/openapi.json", bind_addr);
            info!("Swagger UI: http://{}/swagger-ui", bind_addr);
        }
        info!(
            "Instance push channel: ws://{}{}",
            bind_addr,
            certfleet_proto::HUB_PATH
        );

        let listener = tokio::net::TcpListener::bind(bind_addr).await?;

        axum::serve(listener, router)
            .await
            .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

        Ok(())
    }
}

/// Convenience function to create and start an API server
pub async fn run_api_server(
    bind_addr: SocketAddr,
    api: ManagementApi,
    hub: ManagementHub,
) -> Result<(), anyhow::Error> {
    let config = ApiServerConfig {
        bind_addr,
        ..Default::default()
    };

    let server = ApiServer::new(config, api, hub);
    server.start().await
}
