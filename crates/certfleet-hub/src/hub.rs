//! Push channel endpoint for instance connections

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use certfleet_proto::{
    CommandRequest, CommandResult, CommandType, HubFrame, InstanceInfo, InstanceItems, HUB_PATH,
};
use certfleet_registry::{CommandWaiters, InstanceRegistry};
use dashmap::DashMap;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Errors raised when dispatching commands over the push channel
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("instance {0} is not connected")]
    InstanceNotConnected(String),

    #[error("connection {0} is not attached")]
    ConnectionNotAttached(String),

    #[error("push channel send failed: {0}")]
    ChannelClosed(String),
}

/// Server half of the management push channel
///
/// Instances connect here over WebSocket. Each attach registers a pending
/// connection and asks the instance to identify itself; results flowing back
/// are correlated against the awaited-command table and routed to the item
/// cache or to a waiting caller.
#[derive(Clone)]
pub struct ManagementHub {
    registry: InstanceRegistry,
    waiters: CommandWaiters,
    /// Maps connection id -> outbound frame sender for that socket
    senders: Arc<DashMap<String, mpsc::Sender<HubFrame>>>,
}

impl ManagementHub {
    pub fn new(registry: InstanceRegistry, waiters: CommandWaiters) -> Self {
        Self {
            registry,
            waiters,
            senders: Arc::new(DashMap::new()),
        }
    }

    pub fn registry(&self) -> &InstanceRegistry {
        &self.registry
    }

    pub fn waiters(&self) -> &CommandWaiters {
        &self.waiters
    }

    /// Router exposing the push channel upgrade endpoint
    pub fn router(&self) -> Router {
        Router::new()
            .route(HUB_PATH, get(hub_upgrade))
            .with_state(self.clone())
    }

    /// Number of sockets currently attached
    pub fn attached_count(&self) -> usize {
        self.senders.len()
    }

    /// Dispatch a command to the instance's live connection
    ///
    /// Fails fast when no connection serves the instance; commands are never
    /// queued for offline instances.
    pub async fn dispatch(&self, instance_id: &str, request: CommandRequest) -> Result<(), HubError> {
        let connection_id = self
            .registry
            .connection_for_instance(instance_id)
            .ok_or_else(|| HubError::InstanceNotConnected(instance_id.to_string()))?;
        self.send_to_connection(&connection_id, request).await
    }

    /// Dispatch a command keyed by connection id
    ///
    /// Used for the attach-time identity request, before any instance id is
    /// bound. The request is recorded as awaited before the send; a failed
    /// send rolls that back so no orphan entry is left behind.
    pub async fn send_to_connection(
        &self,
        connection_id: &str,
        request: CommandRequest,
    ) -> Result<(), HubError> {
        let sender = self
            .senders
            .get(connection_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| HubError::ConnectionNotAttached(connection_id.to_string()))?;

        self.registry.add_awaited(&request);
        let command_id = request.command_id;
        debug!(
            connection_id = %connection_id,
            command_id = %command_id,
            command_type = %request.command_type,
            "Dispatching command"
        );

        if let Err(e) = sender.send(HubFrame::CommandRequest { request }).await {
            self.registry.take_awaited(&command_id);
            return Err(HubError::ChannelClosed(e.to_string()));
        }
        Ok(())
    }

    /// Remove registry mappings whose socket is gone
    ///
    /// Detach itself only logs; this reconciliation runs from the worker.
    /// The orphaned item cache is dropped when no other connection still
    /// serves the instance. Returns the number of mappings removed.
    pub fn sweep_stale(&self) -> usize {
        let mut swept = 0;
        for connection_id in self.registry.connection_ids() {
            if self.senders.contains_key(&connection_id) {
                continue;
            }
            if let Some(info) = self.registry.remove_connection(&connection_id) {
                swept += 1;
                info!(
                    connection_id = %connection_id,
                    instance_id = %info.instance_id,
                    "Swept stale connection mapping"
                );
                if info.is_identified()
                    && self
                        .registry
                        .connection_for_instance(&info.instance_id)
                        .is_none()
                {
                    self.registry.remove_instance_items(&info.instance_id);
                }
            }
        }
        swept
    }

    /// Drive one attached socket until it closes
    async fn handle_socket(self, socket: WebSocket) {
        let connection_id = format!("conn-{}", uuid::Uuid::new_v4());
        info!(connection_id = %connection_id, "Instance attached to management hub");

        let (ws_sink, ws_source) = socket.split();

        let (frame_tx, frame_rx) = mpsc::channel::<HubFrame>(64);
        self.senders.insert(connection_id.clone(), frame_tx);
        self.registry.register_pending(&connection_id);

        let writer_conn_id = connection_id.clone();
        tokio::spawn(async move {
            Self::writer_task(ws_sink, frame_rx, writer_conn_id).await;
        });

        // Ask the new connection who it is; identity binds when the result
        // comes back through the reader.
        if let Err(e) = self
            .send_to_connection(&connection_id, CommandRequest::get_instance_info())
            .await
        {
            warn!(
                connection_id = %connection_id,
                error = %e,
                "Failed to request instance identity"
            );
        }

        self.reader_loop(&connection_id, ws_source).await;

        // Detach: drop the outbound sender, which ends the writer task. The
        // registry mapping is left in place until the sweep reconciles it.
        self.senders.remove(&connection_id);
        info!(connection_id = %connection_id, "Instance detached from management hub");
    }

    /// Writer task - drains queued frames into the socket
    async fn writer_task(
        mut sink: SplitSink<WebSocket, Message>,
        mut rx: mpsc::Receiver<HubFrame>,
        conn_id: String,
    ) {
        while let Some(frame) = rx.recv().await {
            let text = match frame.to_text() {
                Ok(text) => text,
                Err(e) => {
                    error!("[{}] Frame encode error: {}", conn_id, e);
                    continue;
                }
            };
            if let Err(e) = sink.send(Message::Text(text.into())).await {
                error!("[{}] WebSocket send error: {}", conn_id, e);
                break;
            }
        }

        debug!("[{}] Hub writer task ended", conn_id);
        let _ = sink.close().await;
    }

    /// Reader loop - decodes frames and routes them
    async fn reader_loop(&self, connection_id: &str, mut source: SplitStream<WebSocket>) {
        while let Some(message) = source.next().await {
            match message {
                Ok(Message::Text(text)) => match HubFrame::from_text(text.as_str()) {
                    Ok(HubFrame::CommandResult { result }) => {
                        self.handle_command_result(connection_id, result);
                    }
                    Ok(HubFrame::InstanceMessage { message }) => {
                        info!(
                            connection_id = %connection_id,
                            message = %message,
                            "Instance message"
                        );
                    }
                    Ok(HubFrame::CommandRequest { request }) => {
                        warn!(
                            connection_id = %connection_id,
                            command_type = %request.command_type,
                            "Ignoring command request sent by instance"
                        );
                    }
                    Err(e) => {
                        warn!("[{}] Undecodable frame: {}", connection_id, e);
                    }
                },
                Ok(Message::Close(_)) => {
                    debug!("[{}] WebSocket close received", connection_id);
                    break;
                }
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                    // Pong is handled by axum at the protocol level
                }
                Ok(_) => {
                    // Binary frames are not part of this protocol
                }
                Err(e) => {
                    error!("[{}] WebSocket read error: {}", connection_id, e);
                    break;
                }
            }
        }
    }

    /// Route one command result from an instance
    ///
    /// Results are only accepted when their command id is in the awaited
    /// table; unmatched and duplicate results are dropped. Identity results
    /// bind the connection, item reports refresh the cache, and any waiting
    /// caller is resumed.
    pub fn handle_command_result(&self, connection_id: &str, result: CommandResult) {
        let Some(awaited) = self.registry.take_awaited(&result.command_id) else {
            debug!(
                connection_id = %connection_id,
                command_id = %result.command_id,
                "Dropping unmatched command result"
            );
            return;
        };

        if awaited.command_type == CommandType::GetInstanceInfo {
            match result.decode::<InstanceInfo>() {
                Ok(mut instance) => {
                    instance.last_reported = Some(chrono::Utc::now());
                    self.registry
                        .update_instance_connection(connection_id, instance);
                }
                Err(e) => {
                    warn!(
                        connection_id = %connection_id,
                        error = %e,
                        "Identity result had no usable payload"
                    );
                }
            }
            self.waiters.fulfill(result.command_id, result);
            return;
        }

        let Some(instance) = self
            .registry
            .instance_for_connection(connection_id)
            .filter(|i| i.is_identified())
        else {
            error!(
                connection_id = %connection_id,
                command_id = %result.command_id,
                command_type = %awaited.command_type,
                "Result from unidentified connection; dropping"
            );
            return;
        };

        if awaited.command_type == CommandType::GetInstanceItems {
            match result.decode::<InstanceItems>() {
                Ok(report) => {
                    if !report.instance_id.is_empty()
                        && report.instance_id != instance.instance_id
                    {
                        warn!(
                            connection_id = %connection_id,
                            bound = %instance.instance_id,
                            reported = %report.instance_id,
                            "Item report claims a different instance id; using the bound one"
                        );
                    }
                    self.registry
                        .update_instance_items(&instance.instance_id, report.items);
                }
                Err(e) => {
                    warn!(
                        instance_id = %instance.instance_id,
                        error = %e,
                        "Item report had no usable payload"
                    );
                }
            }
        }

        self.registry.touch_instance(&instance.instance_id);
        self.waiters.fulfill(result.command_id, result);
    }
}

/// Upgrade handler mounted at [`HUB_PATH`]
async fn hub_upgrade(State(hub): State<ManagementHub>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| hub.handle_socket(socket))
}
