use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use place_canvas::{CanvasError, CHUNK_SIZE};
use place_common::clock::now_ms;
use place_common::config::RelayConfig;
use place_common::ids::{new_connection_id, new_message_id};
use place_protocol::envelope::{decode_payload, new_envelope};
use place_protocol::{
    CanvasInfo, ClientPlaceTile, ClientRequestRegion, Envelope, ServerError, ServerHello,
    ServerNotice, ServerPlaceResult, ServerRegionUpdate, TilePlacement,
};

use crate::manager::{CanvasManager, Placement};
use crate::state::{ClientHandle, RelayState};

const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

pub struct RelayServer {
    config: RelayConfig,
    canvas: Arc<CanvasManager>,
    state: Arc<RwLock<RelayState>>,
}

impl RelayServer {
    pub fn new(config: RelayConfig, canvas: Arc<CanvasManager>) -> Self {
        Self {
            config,
            canvas,
            state: Arc::new(RwLock::new(RelayState::default())),
        }
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        info!(addr = %listener.local_addr()?, "relay listening");
        self.serve(listener).await
    }

    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            let conn_id = new_connection_id();
            info!(conn = %conn_id, %addr, "connection accepted");
            let canvas = Arc::clone(&self.canvas);
            let state = Arc::clone(&self.state);
            tokio::spawn(async move {
                if let Err(err) = handle_connection(stream, canvas, state, conn_id.clone()).await {
                    warn!(conn = %conn_id, error = %err, "connection error");
                }
            });
        }
    }
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    canvas: Arc<CanvasManager>,
    state: Arc<RwLock<RelayState>>,
    conn_id: String,
) -> anyhow::Result<()> {
    let ws_stream = accept_async(stream).await?;
    let (mut ws_write, mut ws_read) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_write.send(msg).await.is_err() {
                break;
            }
        }
    });

    if let Err(err) = greet(&canvas, &state, &conn_id, &tx).await {
        writer.abort();
        return Err(err);
    }

    let result = read_loop(&mut ws_read, &canvas, &state, &conn_id, &tx).await;

    let remaining = {
        let mut state_guard = state.write().await;
        state_guard.remove_client(&conn_id);
        state_guard.client_count()
    };
    info!(conn = %conn_id, remaining, "connection closed");
    writer.abort();
    result
}

async fn read_loop<S>(
    ws_read: &mut S,
    canvas: &Arc<CanvasManager>,
    state: &Arc<RwLock<RelayState>>,
    conn_id: &str,
    tx: &mpsc::UnboundedSender<Message>,
) -> anyhow::Result<()>
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(msg) = ws_read.next().await {
        let msg = msg?;
        if msg.is_close() {
            break;
        }
        if !msg.is_text() {
            continue;
        }
        let env: Envelope = match serde_json::from_str(msg.to_text()?) {
            Ok(env) => env,
            Err(err) => {
                debug!(conn = %conn_id, error = %err, "unparseable frame");
                send_error(tx, "bad_request", "malformed envelope")?;
                continue;
            }
        };

        let message_type = env.message_type.clone();
        match message_type.as_str() {
            "client.place_tile" => match decode_payload::<ClientPlaceTile>(env) {
                Ok(payload) => handle_place_tile(payload, conn_id, canvas, state, tx).await?,
                Err(err) => send_error(tx, "bad_request", &err.to_string())?,
            },
            "client.request_region" => match decode_payload::<ClientRequestRegion>(env) {
                Ok(payload) => handle_request_region(payload, conn_id, canvas, tx).await?,
                Err(err) => send_error(tx, "bad_request", &err.to_string())?,
            },
            "client.heartbeat" => {
                send_notice(tx, "pong")?;
            }
            other => {
                debug!(conn = %conn_id, message_type = other, "unknown message type");
                send_error(tx, "invalid_command", "unknown message type")?;
            }
        }
    }
    Ok(())
}

/// Queue the hello, then make the connection visible to broadcasts. Nothing is
/// registered when the hello cannot be queued.
async fn greet(
    canvas: &CanvasManager,
    state: &RwLock<RelayState>,
    conn_id: &str,
    tx: &mpsc::UnboundedSender<Message>,
) -> anyhow::Result<()> {
    send_envelope(tx, "server.hello", &hello(canvas, conn_id))?;
    state.write().await.add_client(ClientHandle {
        conn_id: conn_id.to_string(),
        tx: tx.clone(),
    });
    Ok(())
}

fn hello(canvas: &CanvasManager, conn_id: &str) -> ServerHello {
    let config = canvas.config();
    ServerHello {
        server_version: SERVER_VERSION.to_string(),
        client_id: conn_id.to_string(),
        canvas: CanvasInfo {
            width: config.width,
            height: config.height,
            chunk_size: CHUNK_SIZE,
            tile_size: config.tile_size,
            default_color: config.default_color.clone(),
            cooldown_ms: config.cooldown_ms,
        },
    }
}

async fn handle_place_tile(
    payload: ClientPlaceTile,
    conn_id: &str,
    canvas: &CanvasManager,
    state: &RwLock<RelayState>,
    tx: &mpsc::UnboundedSender<Message>,
) -> anyhow::Result<()> {
    match canvas
        .place_tile(conn_id, payload.x, payload.y, &payload.color)
        .await
    {
        Ok(placement) => {
            let data = tile_placement(placement);
            let result = ServerPlaceResult {
                success: true,
                data: Some(data.clone()),
                error: None,
                code: None,
                retry_after_ms: None,
            };
            send_envelope(tx, "server.place_result", &result)?;
            let update = encode_envelope("server.tile_update", &data)?;
            let delivered = state.read().await.broadcast(&update);
            debug!(conn = %conn_id, x = data.x, y = data.y, delivered, "tile update broadcast");
        }
        Err(err) => {
            log_canvas_error(conn_id, &err);
            let result = ServerPlaceResult {
                success: false,
                data: None,
                error: Some(err.client_message().to_string()),
                code: Some(err.code().to_string()),
                retry_after_ms: err.retry_after_ms(),
            };
            send_envelope(tx, "server.place_result", &result)?;
        }
    }
    Ok(())
}

async fn handle_request_region(
    payload: ClientRequestRegion,
    conn_id: &str,
    canvas: &CanvasManager,
    tx: &mpsc::UnboundedSender<Message>,
) -> anyhow::Result<()> {
    match canvas
        .get_region(payload.start_x, payload.start_y, payload.width, payload.height)
        .await
    {
        Ok(data) => {
            let update = ServerRegionUpdate {
                start_x: payload.start_x,
                start_y: payload.start_y,
                data,
            };
            send_envelope(tx, "server.region_update", &update)
        }
        Err(err) => {
            log_canvas_error(conn_id, &err);
            send_error(tx, err.code(), err.client_message())
        }
    }
}

fn tile_placement(placement: Placement) -> TilePlacement {
    TilePlacement {
        x: placement.x,
        y: placement.y,
        color: placement.color,
        chunk_x: placement.chunk.x,
        chunk_y: placement.chunk.y,
        local_x: placement.local.x,
        local_y: placement.local.y,
    }
}

fn log_canvas_error(conn_id: &str, err: &CanvasError) {
    match err {
        CanvasError::StoreUnavailable(_) => error!(conn = %conn_id, error = %err, "store failure"),
        _ => debug!(conn = %conn_id, error = %err, "request declined"),
    }
}

fn encode_envelope<T: serde::Serialize>(message_type: &str, payload: &T) -> anyhow::Result<String> {
    let env = new_envelope(message_type, &new_message_id(), now_ms(), payload)?;
    Ok(serde_json::to_string(&env)?)
}

fn send_envelope<T: serde::Serialize>(
    tx: &mpsc::UnboundedSender<Message>,
    message_type: &str,
    payload: &T,
) -> anyhow::Result<()> {
    let text = encode_envelope(message_type, payload)?;
    tx.send(Message::Text(text))?;
    Ok(())
}

fn send_error(tx: &mpsc::UnboundedSender<Message>, code: &str, message: &str) -> anyhow::Result<()> {
    let payload = ServerError {
        code: code.to_string(),
        message: message.to_string(),
    };
    send_envelope(tx, "server.error", &payload)
}

fn send_notice(tx: &mpsc::UnboundedSender<Message>, text: &str) -> anyhow::Result<()> {
    let payload = ServerNotice {
        text: text.to_string(),
    };
    send_envelope(tx, "server.notice", &payload)
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::time::Duration;

    use place_canvas::CanvasConfig;
    use place_common::config::StoreConfig;
    use place_store::{ChunkStore, MemoryStore};
    use tokio::net::TcpStream;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    use super::*;

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn start(store: MemoryStore) -> SocketAddr {
        let config = RelayConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            store: StoreConfig::Memory,
            canvas: CanvasConfig::default(),
        };
        let canvas = Arc::new(CanvasManager::new(config.canvas.clone(), Arc::new(store)));
        let listener = TcpListener::bind(&config.bind_addr).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = RelayServer::new(config, canvas);
        tokio::spawn(async move { server.serve(listener).await });
        addr
    }

    async fn connect(addr: SocketAddr) -> (Client, ServerHello) {
        let (mut ws, _) = connect_async(format!("ws://{addr}")).await.unwrap();
        let env = recv(&mut ws).await;
        assert_eq!(env.message_type, "server.hello");
        let hello = serde_json::from_value(env.payload).unwrap();
        (ws, hello)
    }

    async fn recv(ws: &mut Client) -> Envelope {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("timed out waiting for server")
                .expect("stream ended")
                .unwrap();
            if msg.is_text() {
                return serde_json::from_str(msg.to_text().unwrap()).unwrap();
            }
        }
    }

    async fn send<T: serde::Serialize>(ws: &mut Client, message_type: &str, payload: &T) {
        let env = new_envelope(message_type, "test", 0, payload).unwrap();
        ws.send(Message::Text(serde_json::to_string(&env).unwrap()))
            .await
            .unwrap();
    }

    fn place(x: i64, y: i64, color: &str) -> ClientPlaceTile {
        ClientPlaceTile {
            x,
            y,
            color: color.to_string(),
        }
    }

    #[tokio::test]
    async fn hello_describes_the_canvas() {
        let addr = start(MemoryStore::new()).await;
        let (_ws, hello) = connect(addr).await;
        assert!(hello.client_id.starts_with("c_"));
        assert_eq!(
            hello.canvas,
            CanvasInfo {
                width: 1000,
                height: 1000,
                chunk_size: 16,
                tile_size: 16,
                default_color: "#FFFFFF".into(),
                cooldown_ms: 1000,
            }
        );
    }

    #[tokio::test]
    async fn placement_is_acknowledged_and_broadcast_to_everyone() {
        let store = MemoryStore::new();
        let addr = start(store.clone()).await;
        let (mut alice, alice_hello) = connect(addr).await;
        let (mut bob, _) = connect(addr).await;

        send(&mut alice, "client.place_tile", &place(5, 5, "#123456")).await;

        let ack = recv(&mut alice).await;
        assert_eq!(ack.message_type, "server.place_result");
        let ack: ServerPlaceResult = serde_json::from_value(ack.payload).unwrap();
        assert!(ack.success);
        let expected = TilePlacement {
            x: 5,
            y: 5,
            color: "#123456".into(),
            chunk_x: 0,
            chunk_y: 0,
            local_x: 5,
            local_y: 5,
        };
        assert_eq!(ack.data, Some(expected.clone()));

        for ws in [&mut alice, &mut bob] {
            let update = recv(ws).await;
            assert_eq!(update.message_type, "server.tile_update");
            let update: TilePlacement = serde_json::from_value(update.payload).unwrap();
            assert_eq!(update, expected);
        }
        assert!(store
            .get_last_placed(&alice_hello.client_id)
            .unwrap()
            .is_some());

        send(
            &mut bob,
            "client.request_region",
            &ClientRequestRegion {
                start_x: 4,
                start_y: 4,
                width: 3,
                height: 2,
            },
        )
        .await;
        let region = recv(&mut bob).await;
        assert_eq!(region.message_type, "server.region_update");
        let region: ServerRegionUpdate = serde_json::from_value(region.payload).unwrap();
        assert_eq!((region.start_x, region.start_y), (4, 4));
        let white = Some("#FFFFFF".to_string());
        assert_eq!(region.data[0], vec![white.clone(); 3]);
        assert_eq!(
            region.data[1],
            vec![white.clone(), Some("#123456".into()), white]
        );
    }

    #[tokio::test]
    async fn declined_placements_report_reason() {
        let addr = start(MemoryStore::new()).await;
        let (mut ws, _) = connect(addr).await;

        send(&mut ws, "client.place_tile", &place(1000, 0, "#000000")).await;
        let result: ServerPlaceResult = serde_json::from_value(recv(&mut ws).await.payload).unwrap();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Coordinates out of bounds"));

        send(&mut ws, "client.place_tile", &place(1, 1, "#000000")).await;
        let ok: ServerPlaceResult = serde_json::from_value(recv(&mut ws).await.payload).unwrap();
        assert!(ok.success);
        assert_eq!(recv(&mut ws).await.message_type, "server.tile_update");

        send(&mut ws, "client.place_tile", &place(2, 2, "#000000")).await;
        let cooling: ServerPlaceResult =
            serde_json::from_value(recv(&mut ws).await.payload).unwrap();
        assert!(!cooling.success);
        assert_eq!(cooling.error.as_deref(), Some("Cooldown not expired"));
        assert_eq!(cooling.code.as_deref(), Some("cooldown_active"));
        let retry = cooling.retry_after_ms.unwrap();
        assert!(retry > 0 && retry <= 1000);
    }

    #[tokio::test]
    async fn store_outage_is_an_internal_error() {
        let store = MemoryStore::new();
        let addr = start(store.clone()).await;
        let (mut ws, _) = connect(addr).await;
        store.set_unavailable(true);

        send(&mut ws, "client.place_tile", &place(1, 1, "#000000")).await;
        let result: ServerPlaceResult = serde_json::from_value(recv(&mut ws).await.payload).unwrap();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Internal server error"));

        send(
            &mut ws,
            "client.request_region",
            &ClientRequestRegion {
                start_x: 0,
                start_y: 0,
                width: 2,
                height: 2,
            },
        )
        .await;
        let err = recv(&mut ws).await;
        assert_eq!(err.message_type, "server.error");
        let err: ServerError = serde_json::from_value(err.payload).unwrap();
        assert_eq!(err.code, "internal_error");
    }

    #[tokio::test]
    async fn bad_input_keeps_connection_open() {
        let addr = start(MemoryStore::new()).await;
        let (mut ws, _) = connect(addr).await;

        ws.send(Message::Text("{not json".into())).await.unwrap();
        let err: ServerError = serde_json::from_value(recv(&mut ws).await.payload).unwrap();
        assert_eq!(err.code, "bad_request");

        send(&mut ws, "client.place_tile", &serde_json::json!({ "x": "one" })).await;
        let err: ServerError = serde_json::from_value(recv(&mut ws).await.payload).unwrap();
        assert_eq!(err.code, "bad_request");

        send(&mut ws, "client.dance", &serde_json::json!({})).await;
        let err: ServerError = serde_json::from_value(recv(&mut ws).await.payload).unwrap();
        assert_eq!(err.code, "invalid_command");

        send(&mut ws, "client.heartbeat", &serde_json::json!({ "nonce": "n" })).await;
        let pong = recv(&mut ws).await;
        assert_eq!(pong.message_type, "server.notice");
        let pong: ServerNotice = serde_json::from_value(pong.payload).unwrap();
        assert_eq!(pong.text, "pong");
    }

    #[tokio::test]
    async fn closed_writer_is_never_registered() {
        let canvas = CanvasManager::new(CanvasConfig::default(), Arc::new(MemoryStore::new()));
        let state = RwLock::new(RelayState::default());

        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        assert!(greet(&canvas, &state, "gone", &tx).await.is_err());
        assert_eq!(state.read().await.client_count(), 0);

        let (tx, mut rx) = mpsc::unbounded_channel();
        greet(&canvas, &state, "live", &tx).await.unwrap();
        assert_eq!(state.read().await.client_count(), 1);
        let first = rx.try_recv().unwrap();
        let env: Envelope = serde_json::from_str(first.to_text().unwrap()).unwrap();
        assert_eq!(env.message_type, "server.hello");
    }
}
