//! Black-box exercise of the websocket front-end against a fake native
//! host, driven entirely through `libhostbridge`'s public API so it
//! doesn't depend on spawning the real binary or a real browser host.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use hostbridge_protocol::{CommandEnvelope, HostEnvelope, ReplyEnvelope, ServerEvent};
use libhostbridge::host::HostChannel;
use libhostbridge::session::SessionRegistry;
use libhostbridge::{framing, ws};
use tokio_tungstenite::tungstenite::Message as WsMessage;

async fn start_bridge() -> (std::net::SocketAddr, tokio::io::DuplexStream, tempfile::TempDir) {
    let (bridge_end, host_end) = tokio::io::duplex(1 << 16);
    let (bridge_read, bridge_write) = tokio::io::split(bridge_end);
    let host = HostChannel::from_io(bridge_read, bridge_write);

    let log_dir = tempfile::tempdir().expect("tempdir");
    let registry = SessionRegistry::new(Duration::from_secs(60), host.clone(), log_dir.path().to_path_buf());
    host.set_registry(&registry);

    let (addr, serving) = ws::bind_ephemeral(registry).await.expect("bind ephemeral port");
    tokio::spawn(serving);

    (addr, host_end, log_dir)
}

#[tokio::test]
async fn client_creates_session_and_receives_a_reply() {
    let (addr, mut host_end, _log_dir) = start_bridge().await;

    // Dispatch fails fast with NATIVE_HOST_ERROR until the host channel has
    // seen at least one inbound frame, so the fake host signals in first.
    framing::encode_to(&HostEnvelope::Ready { port: None, bridge_only: None }, &mut host_end).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let url = format!("ws://{addr}/");
    let (mut client, _resp) = tokio_tungstenite::connect_async(url).await.expect("client connects");

    let first = client.next().await.expect("a frame").expect("valid frame");
    let WsMessage::Text(text) = first else { panic!("expected text frame") };
    let event: ServerEvent = serde_json::from_str(&text).unwrap();
    assert!(matches!(event, ServerEvent::SessionCreated { .. }));

    let cmd = CommandEnvelope {
        action: "listTabs".to_string(),
        params: serde_json::json!({}),
        request_id: "r1".to_string(),
    };
    client.send(WsMessage::Text(serde_json::to_string(&cmd).unwrap())).await.unwrap();

    let inbound: HostEnvelope = framing::decode_from(&mut host_end).await.unwrap().expect("a command frame");
    let HostEnvelope::Command { session_id, command } = inbound else { panic!("expected command") };
    assert_eq!(command.request_id, "r1");

    let response = HostEnvelope::Response {
        session_id,
        request_id: "r1".to_string(),
        result: Some(serde_json::json!({"tabs": []})),
        error: None,
    };
    framing::encode_to(&response, &mut host_end).await.unwrap();

    let reply_frame = client.next().await.expect("a frame").expect("valid frame");
    let WsMessage::Text(text) = reply_frame else { panic!("expected text frame") };
    match serde_json::from_str::<ReplyEnvelope>(&text).unwrap() {
        ReplyEnvelope::Whole(whole) => {
            assert_eq!(whole.request_id, "r1");
            assert_eq!(whole.result, Some(serde_json::json!({"tabs": []})));
        }
        ReplyEnvelope::Chunk(_) => panic!("expected a whole reply"),
    }
}

#[tokio::test]
async fn malformed_frame_gets_an_error_event_without_closing() {
    let (addr, _host_end, _log_dir) = start_bridge().await;
    let url = format!("ws://{addr}/");
    let (mut client, _resp) = tokio_tungstenite::connect_async(url).await.expect("client connects");

    let _created = client.next().await.unwrap().unwrap();

    client.send(WsMessage::Text("not json".to_string())).await.unwrap();

    let frame = client.next().await.expect("a frame").expect("valid frame");
    let WsMessage::Text(text) = frame else { panic!("expected text frame") };
    let event: ServerEvent = serde_json::from_str(&text).unwrap();
    assert!(matches!(event, ServerEvent::Error { .. }));

    // the socket should still be usable after a per-frame error
    let cmd = CommandEnvelope {
        action: "noop".to_string(),
        params: serde_json::json!({}),
        request_id: "r2".to_string(),
    };
    client.send(WsMessage::Text(serde_json::to_string(&cmd).unwrap())).await.unwrap();
}
