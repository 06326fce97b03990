//! Integration tests for the management hub push channel
//!
//! These tests serve the hub router on a real listener and attach fake
//! instances with a plain websocket client, so the full attach, identify,
//! dispatch and detach lifecycle runs over the wire.

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::info;
use uuid::Uuid;

use certfleet_hub::{ManagementHub, ManagementWorker};
use certfleet_proto::{
    CommandRequest, CommandResult, CommandType, HubFrame, InstanceInfo, ManagedItem, HUB_PATH,
};
use certfleet_registry::{CommandWaiters, InstanceRegistry};

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Start a hub server on a random port
async fn start_hub() -> (ManagementHub, SocketAddr) {
    let hub = ManagementHub::new(InstanceRegistry::new(), CommandWaiters::new());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = hub.router();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    (hub, addr)
}

async fn connect(addr: SocketAddr) -> WsClient {
    let url = format!("ws://{}{}", addr, HUB_PATH);
    let (ws_stream, _) = tokio_tungstenite::connect_async(&url)
        .await
        .expect("Failed to attach to hub");
    ws_stream
}

/// Read frames until a command request arrives
async fn next_request(client: &mut WsClient) -> CommandRequest {
    timeout(Duration::from_secs(5), async {
        while let Some(Ok(message)) = client.next().await {
            if let Message::Text(text) = message {
                if let Ok(HubFrame::CommandRequest { request }) = HubFrame::from_text(&text) {
                    return request;
                }
            }
        }
        panic!("Push channel closed before a command request arrived");
    })
    .await
    .expect("Timeout waiting for a command request")
}

async fn send_result(client: &mut WsClient, result: CommandResult) {
    let frame = HubFrame::CommandResult { result };
    client
        .send(Message::Text(frame.to_text().unwrap()))
        .await
        .unwrap();
}

/// Attach a client and answer the identification request
async fn attach_identified(addr: SocketAddr, instance_id: &str) -> WsClient {
    let mut client = connect(addr).await;

    let request = next_request(&mut client).await;
    assert_eq!(request.command_type, CommandType::GetInstanceInfo);

    let info = InstanceInfo {
        instance_id: instance_id.to_string(),
        title: format!("{} title", instance_id),
        os: "linux".to_string(),
        client_version: "0.1.0".to_string(),
        last_reported: None,
    };
    send_result(&mut client, CommandResult::ok(request.command_id, &info).unwrap()).await;

    client
}

/// Poll until the registry reports the instance as identified
async fn wait_for_instance(hub: &ManagementHub, instance_id: &str) {
    let registry = hub.registry().clone();
    let instance_id = instance_id.to_string();
    timeout(Duration::from_secs(5), async move {
        loop {
            if registry.connection_for_instance(&instance_id).is_some() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("Timeout waiting for identification");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_attach_sends_identification_request() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();

    info!("🧪 TEST: attach triggers identification");

    let (hub, addr) = start_hub().await;
    let _client = attach_identified(addr, "site-a").await;

    wait_for_instance(&hub, "site-a").await;

    let instances = hub.registry().connected_instances();
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].instance_id, "site-a");
    // Identity binding stamps the report time even when the instance sent none
    assert!(instances[0].last_reported.is_some());

    info!("✅ TEST PASSED: instance identified after attach");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_reconnection_supersedes_previous_connection() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();

    info!("🧪 TEST: reconnection supersedes the stale mapping");

    let (hub, addr) = start_hub().await;

    let _first = attach_identified(addr, "site-a").await;
    wait_for_instance(&hub, "site-a").await;
    let first_conn = hub.registry().connection_for_instance("site-a").unwrap();

    // Same instance attaches again without the first socket closing
    let _second = attach_identified(addr, "site-a").await;
    timeout(Duration::from_secs(5), async {
        loop {
            let current = hub.registry().connection_for_instance("site-a");
            if current.as_deref() != Some(first_conn.as_str()) && current.is_some() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("Timeout waiting for supersede");

    // Only the new mapping survives; the instance is listed once
    assert_eq!(hub.registry().connection_count(), 1);
    assert_eq!(hub.registry().connected_instances().len(), 1);

    info!("✅ TEST PASSED: stale mapping evicted on reconnect");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_dispatch_resolves_matching_result_only() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();

    info!("🧪 TEST: results resolve by exact command id");

    let (hub, addr) = start_hub().await;
    let mut client = attach_identified(addr, "site-a").await;
    wait_for_instance(&hub, "site-a").await;

    let request = CommandRequest::get_managed_item("cert-1");
    let command_id = request.command_id;
    let mut rx = hub.waiters().register(command_id);

    hub.dispatch("site-a", request).await.unwrap();

    let seen = next_request(&mut client).await;
    assert_eq!(seen.command_id, command_id);

    // An unrelated result must be dropped without resolving the waiter
    send_result(&mut client, CommandResult::empty(Uuid::new_v4())).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err());
    assert_eq!(hub.registry().awaited_count(), 1);

    // The matching result resolves it
    let item = ManagedItem::new("web");
    send_result(&mut client, CommandResult::ok(command_id, &item).unwrap()).await;

    let resolved = timeout(Duration::from_secs(5), rx)
        .await
        .expect("Timeout waiting for result")
        .expect("Waiter dropped");
    assert_eq!(resolved.command_id, command_id);
    assert!(resolved.has_value());
    assert_eq!(hub.registry().awaited_count(), 0);

    // A duplicate of the same result is no longer awaited and is ignored
    send_result(&mut client, CommandResult::ok(command_id, &item).unwrap()).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(hub.registry().awaited_count(), 0);

    info!("✅ TEST PASSED: correlation is exact, duplicates dropped");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_results_from_unidentified_connection_are_dropped() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();

    info!("🧪 TEST: unidentified connections cannot route cache results");

    let (hub, addr) = start_hub().await;
    let mut client = connect(addr).await;

    // Swallow the identification request but never answer it
    let request = next_request(&mut client).await;
    assert_eq!(request.command_type, CommandType::GetInstanceInfo);

    // Craft an items result for a command the hub genuinely awaits
    let items_request = CommandRequest::get_instance_items();
    hub.registry().add_awaited(&items_request);

    let payload = certfleet_proto::InstanceItems {
        instance_id: "rogue".to_string(),
        items: vec![ManagedItem::new("sneaky")],
    };
    send_result(
        &mut client,
        CommandResult::ok(items_request.command_id, &payload).unwrap(),
    )
    .await;

    tokio::time::sleep(Duration::from_millis(200)).await;

    // The result was consumed from the awaited table but never cached
    assert_eq!(hub.registry().awaited_count(), 0);
    assert!(hub.registry().managed_items("rogue").is_empty());

    info!("✅ TEST PASSED: unidentified result dropped after logging");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_poll_cycle_caches_reported_items() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();

    info!("🧪 TEST: poll cycle fans out and caches reported items");

    let (hub, addr) = start_hub().await;
    let mut client = attach_identified(addr, "site-a").await;
    wait_for_instance(&hub, "site-a").await;

    let worker = ManagementWorker::new(hub.clone()).with_poll_interval(Duration::from_secs(60));
    let polled = worker.poll_cycle().await;
    assert_eq!(polled, 1);

    // Answer the fan-out request with a two item inventory
    let request = next_request(&mut client).await;
    assert_eq!(request.command_type, CommandType::GetInstanceItems);

    let payload = certfleet_proto::InstanceItems {
        instance_id: "site-a".to_string(),
        items: vec![ManagedItem::new("web"), ManagedItem::new("mail")],
    };
    send_result(
        &mut client,
        CommandResult::ok(request.command_id, &payload).unwrap(),
    )
    .await;

    timeout(Duration::from_secs(5), async {
        loop {
            if hub.registry().managed_items("site-a").len() == 2 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("Timeout waiting for cached items");

    info!("✅ TEST PASSED: fire-and-forget poll refreshed the cache");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_detach_keeps_mapping_until_sweep() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();

    info!("🧪 TEST: detach logs only; sweep reclaims the mapping");

    let (hub, addr) = start_hub().await;
    let client = attach_identified(addr, "site-a").await;
    wait_for_instance(&hub, "site-a").await;

    hub.registry()
        .update_instance_items("site-a", vec![ManagedItem::new("web")]);

    drop(client);
    timeout(Duration::from_secs(5), async {
        loop {
            if hub.attached_count() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("Timeout waiting for detach");

    // Detach does not evict; the registry still remembers the instance
    assert!(hub.registry().connection_for_instance("site-a").is_some());

    let swept = hub.sweep_stale();
    assert_eq!(swept, 1);
    assert!(hub.registry().connection_for_instance("site-a").is_none());
    assert!(hub.registry().managed_items("site-a").is_empty());

    info!("✅ TEST PASSED: sweep reclaimed the dead mapping and cache");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_instance_message_changes_no_state() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();

    info!("🧪 TEST: free-form instance messages are logged only");

    let (hub, addr) = start_hub().await;
    let mut client = attach_identified(addr, "site-a").await;
    wait_for_instance(&hub, "site-a").await;

    let frame = HubFrame::InstanceMessage {
        message: "renewal worker restarted".to_string(),
    };
    client
        .send(Message::Text(frame.to_text().unwrap()))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(hub.registry().connected_instances().len(), 1);
    assert_eq!(hub.waiters().waiting(), 0);
    assert_eq!(hub.registry().awaited_count(), 0);
    assert_eq!(hub.attached_count(), 1);

    info!("✅ TEST PASSED: message left registry and waiters untouched");
}
