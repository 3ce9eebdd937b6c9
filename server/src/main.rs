use axum::{
    extract::{
        ws::{Message as AxumWsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use uuid::Uuid;

mod error;
mod protocol;
mod registry;
mod relay;

use protocol::Message;
use registry::{ConnectionId, RoomRegistry};
use relay::Relay;

#[derive(Parser, Debug)]
#[command(author, version, about = "Rendezvous server for shared playback rooms")]
struct Args {
    /// Port to listen on
    #[arg(short, long, env = "PORT", default_value_t = 3005)]
    port: u16,

    /// Only relay sync traffic sent by the room's registered host
    #[arg(long, env = "SYNCROOM_HOST_ONLY_RELAY")]
    host_only_relay: bool,
}

#[derive(Clone)]
struct AppState {
    registry: RoomRegistry,
    relay: Relay,
}

impl AppState {
    fn new(host_only_relay: bool) -> Self {
        let registry = RoomRegistry::new();
        let relay = Relay::new(registry.clone(), host_only_relay);
        Self { registry, relay }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "syncroom_server=debug,info".into()),
        )
        .init();

    let args = Args::parse();
    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let app_state = AppState::new(args.host_only_relay);

    let app = Router::new()
        .route("/healthz", get(health_check))
        .route("/ws", get(ws_endpoint))
        .with_state(app_state);

    let listener = TcpListener::bind(addr).await?;
    tracing::info!(
        "SyncRoom server listening on {} (host-only relay: {})",
        addr,
        args.host_only_relay
    );
    axum::serve(listener, app).await?;
    Ok(())
}

async fn ws_endpoint(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn health_check() -> &'static str {
    "ok"
}

async fn handle_connection(socket: WebSocket, state: AppState) {
    let client_id = Uuid::new_v4();
    tracing::info!("New client connected: {}", client_id);

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let mut rx = state.relay.attach(client_id);

    // Spawn task to send messages to client
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(j) => j,
                Err(e) => {
                    tracing::error!("Failed to serialize message: {}", e);
                    continue;
                }
            };

            if let Err(e) = ws_sender.send(AxumWsMessage::Text(json)).await {
                tracing::error!("Failed to send message: {}", e);
                break;
            }
        }
    });

    // Handle incoming messages
    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(AxumWsMessage::Text(text)) => {
                if let Err(e) = handle_message(&text, client_id, &state) {
                    tracing::warn!("Error handling message from {}: {}", client_id, e);
                    state.relay.send_to(
                        client_id,
                        Message::Error {
                            message: e.to_string(),
                        },
                    );
                }
            }
            Ok(AxumWsMessage::Close(_)) => {
                tracing::info!("Client {} closing connection", client_id);
                break;
            }
            Err(e) => {
                tracing::error!("WebSocket error: {}", e);
                break;
            }
            _ => {}
        }
    }

    // Cleanup runs before the handler returns so no host entry outlives its socket
    disconnect(client_id, &state);
    send_task.abort();
}

fn handle_message(text: &str, client_id: ConnectionId, state: &AppState) -> anyhow::Result<()> {
    let msg: Message = serde_json::from_str(text)?;

    match msg {
        Message::JoinRoom(request) if request.is_host => {
            if let Some(displaced) = state.registry.register_host(&request.room_id, client_id) {
                state.relay.send_to(
                    displaced,
                    Message::HostDisplaced {
                        room_id: request.room_id,
                    },
                );
            }
        }

        Message::JoinRoom(request) => {
            if state
                .registry
                .enroll_joiner(&request.room_id, client_id)
                .is_err()
            {
                state.relay.send_to(client_id, Message::invalid_room());
            }
        }

        Message::Sync(_) | Message::NewLiveVideo(_) => {
            if let Some(room_id) = msg.relay_room().map(str::to_string) {
                if let Err(e) = state.relay.relay(client_id, &room_id, msg) {
                    tracing::warn!("Dropped message from {}: {}", client_id, e);
                }
            }
        }

        _ => {
            tracing::warn!("Unexpected message from client: {:?}", msg);
        }
    }

    Ok(())
}

fn disconnect(client_id: ConnectionId, state: &AppState) {
    state.relay.detach(client_id);
    let removed = state.registry.remove_connection(client_id);
    tracing::info!(
        "Client disconnected: {} (rooms closed: {:?}, open rooms: {}, connections: {})",
        client_id,
        removed,
        state.registry.room_count(),
        state.relay.connection_count()
    );
}
