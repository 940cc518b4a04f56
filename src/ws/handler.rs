//! WebSocket upgrade handler

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::app::AppState;
use crate::game::{Intent, IntentKind, PlayerId};
use crate::matchmaking::PlayerSession;
use crate::util::rate_limit::ConnectionRateLimiter;
use crate::util::time::unix_millis;
use crate::ws::protocol::{ClientMsg, ServerMsg};

/// WebSocket upgrade handler
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle the upgraded WebSocket connection
async fn handle_socket(socket: WebSocket, state: AppState) {
    let player_id: PlayerId = Uuid::new_v4().to_string();
    info!(player_id = %player_id, "New WebSocket connection");

    let (mut ws_sink, ws_stream) = socket.split();

    let welcome = ServerMsg::Welcome {
        player_id: player_id.clone(),
        server_time: unix_millis(),
    };
    if let Err(e) = send_msg(&mut ws_sink, &welcome).await {
        error!(player_id = %player_id, error = %e, "Failed to send welcome");
        return;
    }

    // Register with matchmaking to get channels
    let session = state.matchmaking.register_player(player_id.clone());

    run_session(session, ws_sink, ws_stream).await;

    let last_match = state.matchmaking.player_match(&player_id);

    // Cleanup on disconnect, also leaves the current room
    state.matchmaking.unregister_player(&player_id).await;

    info!(player_id = %player_id, match_id = ?last_match, "WebSocket connection closed");
}

/// Run the WebSocket session with read/write split
async fn run_session(
    session: PlayerSession,
    mut ws_sink: SplitSink<WebSocket, Message>,
    mut ws_stream: SplitStream<WebSocket>,
) {
    let PlayerSession {
        player_id,
        intent_tx,
        mut outbound_rx,
        direct_tx,
    } = session;
    let rate_limiter = ConnectionRateLimiter::new();

    // Spawn writer task: personal channel -> WebSocket
    let writer_player = player_id.clone();
    let writer_handle = tokio::spawn(async move {
        loop {
            match outbound_rx.recv().await {
                Ok(msg) => {
                    if let Err(e) = send_msg(&mut ws_sink, &msg).await {
                        debug!(player_id = %writer_player, error = %e, "WebSocket send failed");
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(
                        player_id = %writer_player,
                        lagged_count = n,
                        "Client lagged, skipping {} messages", n
                    );
                    // Continue - don't disconnect for lag
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!(player_id = %writer_player, "Outbound channel closed");
                    break;
                }
            }
        }
    });

    // Reader loop: WebSocket -> match loop
    while let Some(result) = ws_stream.next().await {
        match result {
            Ok(Message::Text(text)) => {
                if !rate_limiter.check_input() {
                    warn!(player_id = %player_id, "Rate limited input message");
                    continue;
                }

                match serde_json::from_str::<ClientMsg>(&text) {
                    Ok(client_msg) => {
                        if !forward(&player_id, client_msg, &intent_tx, &direct_tx).await {
                            debug!(player_id = %player_id, "Intent channel closed");
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(player_id = %player_id, error = %e, "Failed to parse client message");
                    }
                }
            }
            Ok(Message::Binary(_)) => {
                warn!(player_id = %player_id, "Received binary message, ignoring");
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) => {
                info!(player_id = %player_id, "Client initiated close");
                break;
            }
            Err(e) => {
                error!(player_id = %player_id, error = %e, "WebSocket error");
                break;
            }
        }
    }

    writer_handle.abort();
}

/// Answer pings here and queue everything else for the match.
/// Returns false once the intent channel is gone.
async fn forward(
    player_id: &str,
    msg: ClientMsg,
    intent_tx: &mpsc::Sender<Intent>,
    direct_tx: &broadcast::Sender<ServerMsg>,
) -> bool {
    if let ClientMsg::Ping { t } = msg {
        let _ = direct_tx.send(ServerMsg::Pong {
            t,
            server_time: unix_millis(),
        });
        return true;
    }

    let Some(kind) = IntentKind::from_client(msg) else {
        debug!(player_id = %player_id, "Dropped malformed intent");
        return true;
    };

    intent_tx
        .send(Intent {
            player_id: player_id.to_string(),
            kind,
            received_at: unix_millis(),
        })
        .await
        .is_ok()
}

/// Send a message over WebSocket
async fn send_msg(sink: &mut SplitSink<WebSocket, Message>, msg: &ServerMsg) -> Result<(), String> {
    let json = serde_json::to_string(msg).map_err(|e| e.to_string())?;
    sink.send(Message::Text(json))
        .await
        .map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ping_is_answered_at_the_edge() {
        let (intent_tx, mut intent_rx) = mpsc::channel(4);
        let (direct_tx, mut direct_rx) = broadcast::channel(4);

        assert!(forward("p", ClientMsg::Ping { t: 42 }, &intent_tx, &direct_tx).await);
        assert!(matches!(direct_rx.recv().await, Ok(ServerMsg::Pong { t: 42, .. })));
        assert!(intent_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn intents_are_tagged_with_player() {
        let (intent_tx, mut intent_rx) = mpsc::channel(4);
        let (direct_tx, _direct_rx) = broadcast::channel(4);

        assert!(forward("p", ClientMsg::Reload, &intent_tx, &direct_tx).await);
        let intent = tokio_test::assert_ok!(intent_rx.try_recv());
        assert_eq!(intent.player_id, "p");
        assert_eq!(intent.kind, IntentKind::Reload);

        // Non-finite aim never reaches the match
        assert!(forward("p", ClientMsg::Shoot { aim_angle: f32::INFINITY }, &intent_tx, &direct_tx).await);
        assert!(intent_rx.try_recv().is_err());

        drop(intent_rx);
        assert!(!forward("p", ClientMsg::Reload, &intent_tx, &direct_tx).await);
    }
}
