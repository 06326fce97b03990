//! Push channel client
//!
//! Connects out to the management hub, answers the commands the hub pushes
//! down, and reconnects with backoff when the session drops.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use url::Url;

use certfleet_proto::{
    CommandRequest, CommandResult, CommandType, HubFrame, InstanceItems, HUB_PATH,
};

use crate::reconnect::{ReconnectConfig, ReconnectError, ReconnectManager};
use crate::service::{InstanceService, ServiceError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Log lines returned when the hub does not bound the request
const DEFAULT_LOG_LINES: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("invalid hub url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("push channel error: {0}")]
    Channel(#[from] tokio_tungstenite::tungstenite::Error),

    #[error(transparent)]
    Reconnect(#[from] ReconnectError),

    #[error("wire format error: {0}")]
    Proto(#[from] certfleet_proto::ProtoError),

    #[error("service error: {0}")]
    Service(#[from] ServiceError),
}

/// Client half of the management push channel
pub struct AgentClient {
    hub_url: Url,
    service: Arc<dyn InstanceService>,
    reconnect: ReconnectConfig,
}

impl AgentClient {
    pub fn new(hub_url: &str, service: Arc<dyn InstanceService>) -> Result<Self, AgentError> {
        Ok(Self {
            hub_url: normalize_hub_url(hub_url)?,
            service,
            reconnect: ReconnectConfig::default(),
        })
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn hub_url(&self) -> &Url {
        &self.hub_url
    }

    /// Run sessions forever, backing off between failures
    pub async fn run(&self) -> Result<(), AgentError> {
        let mut reconnect = ReconnectManager::new(self.reconnect.clone());

        loop {
            match self.run_session(&mut reconnect).await {
                Ok(()) => info!("Hub session closed"),
                Err(e) => warn!("Hub session failed: {}", e),
            }
            reconnect.wait().await?;
        }
    }

    /// One connected session: attach, serve commands until the socket closes
    async fn run_session(&self, reconnect: &mut ReconnectManager) -> Result<(), AgentError> {
        info!("Connecting to management hub: {}", self.hub_url);
        let (ws_stream, _response) = connect_async(self.hub_url.as_str()).await?;
        info!("Attached to management hub");
        reconnect.reset();

        let (ws_sink, ws_source) = ws_stream.split();
        let (frame_tx, frame_rx) = mpsc::channel::<HubFrame>(64);

        let writer = tokio::spawn(writer_task(ws_sink, frame_rx));
        self.reader_loop(ws_source, frame_tx).await;

        // All frame senders are gone once the reader and its handlers finish,
        // so the writer drains outstanding results and ends.
        let _ = writer.await;
        Ok(())
    }

    async fn reader_loop(&self, mut source: SplitStream<WsStream>, frame_tx: mpsc::Sender<HubFrame>) {
        while let Some(message) = source.next().await {
            match message {
                Ok(Message::Text(text)) => match HubFrame::from_text(&text) {
                    Ok(HubFrame::CommandRequest { request }) => {
                        debug!(
                            command_id = %request.command_id,
                            command_type = %request.command_type,
                            "Command received"
                        );
                        let service = self.service.clone();
                        let tx = frame_tx.clone();
                        tokio::spawn(async move {
                            handle_command(service, request, tx).await;
                        });
                    }
                    Ok(_) => {
                        warn!("Ignoring non-request frame from hub");
                    }
                    Err(e) => {
                        warn!("Undecodable frame from hub: {}", e);
                    }
                },
                Ok(Message::Close(_)) => {
                    debug!("WebSocket close received from hub");
                    break;
                }
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                    // Pong is handled by tungstenite
                }
                Ok(_) => {
                    // Binary frames are not part of this protocol
                }
                Err(e) => {
                    error!("WebSocket read error: {}", e);
                    break;
                }
            }
        }
    }
}

/// Answer one command; a failed command still gets a reply, just without a
/// payload, so the hub's bounded wait resolves instead of timing out.
async fn handle_command(
    service: Arc<dyn InstanceService>,
    request: CommandRequest,
    tx: mpsc::Sender<HubFrame>,
) {
    let command_id = request.command_id;
    let command_type = request.command_type;

    let result = match execute(service, request).await {
        Ok(result) => result,
        Err(e) => {
            warn!(
                command_id = %command_id,
                command_type = %command_type,
                error = %e,
                "Command failed; answering without payload"
            );
            CommandResult::empty(command_id)
        }
    };

    if tx.send(HubFrame::CommandResult { result }).await.is_err() {
        debug!(command_id = %command_id, "Session ended before the result could be sent");
    }
}

async fn execute(
    service: Arc<dyn InstanceService>,
    request: CommandRequest,
) -> Result<CommandResult, AgentError> {
    let command_id = request.command_id;

    let result = match request.command_type {
        CommandType::GetInstanceInfo => {
            CommandResult::ok(command_id, &service.instance_info().await)?
        }
        CommandType::GetInstanceItems => {
            let info = service.instance_info().await;
            let report = InstanceItems {
                instance_id: info.instance_id,
                items: service.managed_items().await,
            };
            CommandResult::ok(command_id, &report)?
        }
        CommandType::GetInstanceManagedItem => {
            CommandResult::ok(command_id, &service.managed_item(request.item_id()?).await?)?
        }
        CommandType::UpdateInstanceManagedItem => {
            CommandResult::ok(command_id, &service.update_managed_item(request.item()?).await?)?
        }
        CommandType::DeleteInstanceManagedItem => {
            CommandResult::ok(command_id, &service.delete_managed_item(request.item_id()?).await?)?
        }
        CommandType::GetInstanceManagedItemLog => {
            let item_id = request.item_id()?;
            let max_lines = request.max_lines().unwrap_or(DEFAULT_LOG_LINES);
            CommandResult::ok(command_id, &service.item_log(item_id, max_lines).await?)?
        }
        CommandType::TestInstanceManagedItem => {
            CommandResult::ok(command_id, &service.test_managed_item(request.item()?).await?)?
        }
    };

    Ok(result)
}

async fn writer_task(mut sink: SplitSink<WsStream, Message>, mut rx: mpsc::Receiver<HubFrame>) {
    while let Some(frame) = rx.recv().await {
        let text = match frame.to_text() {
            Ok(text) => text,
            Err(e) => {
                error!("Frame encode error: {}", e);
                continue;
            }
        };
        if let Err(e) = sink.send(Message::Text(text)).await {
            error!("WebSocket send error: {}", e);
            break;
        }
    }

    debug!("Agent writer task ended");
    let _ = sink.close().await;
}

/// Parse and normalize the hub URL: ws/wss only, default path filled in
fn normalize_hub_url(raw: &str) -> Result<Url, AgentError> {
    let mut url = Url::parse(raw).map_err(|e| AgentError::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;

    match url.scheme() {
        "ws" | "wss" => {}
        other => {
            return Err(AgentError::InvalidUrl {
                url: raw.to_string(),
                reason: format!("unsupported scheme '{}' (expected ws or wss)", other),
            });
        }
    }

    if url.path() == "/" || url.path().is_empty() {
        url.set_path(HUB_PATH);
    }

    Ok(url)
}
