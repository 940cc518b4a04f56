//! Matchmaking service - manages queue, room creation and per-player routing

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::MatchConfig;
use crate::game::{GameMatch, Intent, IntentKind, MatchRegistry, PlayerId};
use crate::util::time::{unix_millis, RealClock};
use crate::ws::protocol::{Envelope, ServerMsg};

use super::queue::{MatchmakingQueue, QueuedPlayer};

/// How often the queue is checked for a full enough lobby
const MATCHMAKING_INTERVAL: Duration = Duration::from_millis(500);

/// Per-connection buffer; a slow client loses its oldest messages
const PLAYER_BUFFER: usize = 256;

/// A room a player was just placed into
struct MatchAssignment {
    match_id: Uuid,
    outbound_rx: broadcast::Receiver<Envelope>,
}

/// Player connection handle for routing messages
struct PlayerConnection {
    assign_tx: mpsc::UnboundedSender<MatchAssignment>,
}

/// Channels handed to a WebSocket connection
pub struct PlayerSession {
    pub player_id: PlayerId,
    /// Intents for whichever match the player is in
    pub intent_tx: mpsc::Sender<Intent>,
    /// Everything addressed to this player
    pub outbound_rx: broadcast::Receiver<ServerMsg>,
    /// Replies produced at the connection edge (pong)
    pub direct_tx: broadcast::Sender<ServerMsg>,
}

/// Matchmaking service
#[derive(Clone)]
pub struct MatchmakingService {
    config: MatchConfig,
    queue: Arc<Mutex<MatchmakingQueue>>,
    registry: Arc<MatchRegistry>,
    /// Connected players awaiting or in matches
    players: Arc<DashMap<PlayerId, PlayerConnection>>,
    /// Map of player -> current match
    player_matches: Arc<DashMap<PlayerId, Uuid>>,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl MatchmakingService {
    pub fn new(config: MatchConfig, registry: Arc<MatchRegistry>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            queue: Arc::new(Mutex::new(MatchmakingQueue::new(
                config.min_players,
                config.max_players,
            ))),
            config,
            registry,
            players: Arc::new(DashMap::new()),
            player_matches: Arc::new(DashMap::new()),
            shutdown_tx: Arc::new(shutdown_tx),
        }
    }

    /// Register a player connection and put it in the queue.
    /// Returns the channels the connection talks through.
    pub fn register_player(&self, player_id: PlayerId) -> PlayerSession {
        let (intent_tx, mut intent_rx) = mpsc::channel::<Intent>(64);
        let (outbound_tx, outbound_rx) = broadcast::channel::<ServerMsg>(PLAYER_BUFFER);
        let (assign_tx, mut assign_rx) = mpsc::unbounded_channel::<MatchAssignment>();

        self.players
            .insert(player_id.clone(), PlayerConnection { assign_tx });

        // Route intents to the player's current match
        let registry = self.registry.clone();
        let player_matches = self.player_matches.clone();
        let input_player = player_id.clone();
        tokio::spawn(async move {
            while let Some(intent) = intent_rx.recv().await {
                let Some(match_id) = player_matches.get(&input_player).map(|r| *r) else {
                    debug!(player_id = %input_player, "Intent before match assignment dropped");
                    continue;
                };
                let Some(handle) = registry.get(&match_id) else {
                    continue;
                };
                if handle.input_tx.send(intent).await.is_err() {
                    warn!(player_id = %input_player, match_id = %match_id, "Failed to send intent to match");
                }
            }
        });

        // Route room and direct messages from the current match to the player
        let personal_tx = outbound_tx.clone();
        let output_player = player_id.clone();
        tokio::spawn(async move {
            let mut current: Option<broadcast::Receiver<Envelope>> = None;
            loop {
                tokio::select! {
                    assignment = assign_rx.recv() => match assignment {
                        Some(MatchAssignment { match_id, outbound_rx }) => {
                            debug!(player_id = %output_player, match_id = %match_id, "Routing match output");
                            current = Some(outbound_rx);
                        }
                        // Connection unregistered
                        None => break,
                    },
                    received = recv_envelope(&mut current) => match received {
                        Ok(envelope) => {
                            if envelope.is_for(&output_player) {
                                let _ = personal_tx.send(envelope.msg);
                            }
                        }
                        Err(RecvError::Lagged(n)) => {
                            warn!(player_id = %output_player, lagged = n, "Match receiver lagged, oldest messages dropped");
                        }
                        Err(RecvError::Closed) => current = None,
                    },
                }
            }
        });

        self.queue.lock().enqueue(QueuedPlayer::new(player_id.clone()));
        info!(player_id = %player_id, "Player registered and queued");

        PlayerSession {
            player_id,
            intent_tx,
            outbound_rx,
            direct_tx: outbound_tx,
        }
    }

    /// Unregister a player (called when WebSocket disconnects).
    /// A player still in a room is removed from it.
    pub async fn unregister_player(&self, player_id: &str) {
        self.players.remove(player_id);
        self.queue.lock().dequeue(player_id);

        if let Some((_, match_id)) = self.player_matches.remove(player_id) {
            self.send_leave(player_id, match_id).await;
        }

        info!(player_id = %player_id, "Player unregistered from matchmaking");
    }

    async fn send_leave(&self, player_id: &str, match_id: Uuid) {
        let Some(handle) = self.registry.get(&match_id) else {
            return;
        };
        let leave = Intent {
            player_id: player_id.to_string(),
            kind: IntentKind::Leave,
            received_at: unix_millis(),
        };
        if handle.input_tx.send(leave).await.is_err() {
            debug!(player_id = %player_id, match_id = %match_id, "Match already closed, leave dropped");
        } else {
            debug!(player_id = %player_id, match_id = %match_id, "Leave sent to match");
        }
    }

    /// Create a room for the given players and start its loop
    async fn create_match(&self, players: Vec<QueuedPlayer>) {
        let match_id = Uuid::new_v4();
        let seed = rand::random::<u64>();

        let (game_match, handle) = GameMatch::new(
            match_id,
            seed,
            self.config.clone(),
            RealClock::shared(),
            self.shutdown_tx.subscribe(),
        );
        self.registry.insert(handle.clone());

        // Subscribe every player before any join so nobody misses their welcome
        let mut joining = Vec::with_capacity(players.len());
        for player in players {
            let Some(conn) = self.players.get(&player.player_id) else {
                continue;
            };
            let assignment = MatchAssignment {
                match_id,
                outbound_rx: handle.outbound_tx.subscribe(),
            };
            if conn.assign_tx.send(assignment).is_ok() {
                self.player_matches.insert(player.player_id.clone(), match_id);
                joining.push(player.player_id);
            }
        }

        info!(
            match_id = %match_id,
            player_count = joining.len(),
            "Created new match"
        );

        let service = self.clone();
        tokio::spawn(async move {
            game_match.run().await;
            service.close_match(match_id);
        });

        for player_id in joining {
            let join = Intent {
                player_id: player_id.clone(),
                kind: IntentKind::Join,
                received_at: unix_millis(),
            };
            if handle.input_tx.send(join).await.is_err() {
                error!(player_id = %player_id, match_id = %match_id, "Failed to send join to match");
                continue;
            }
            // Disconnected while the room was being set up
            if !self.players.contains_key(&player_id)
                && self.player_matches.remove(&player_id).is_some()
            {
                self.send_leave(&player_id, match_id).await;
            }
        }
    }

    /// Drop a finished room and requeue its still-connected players
    fn close_match(&self, match_id: Uuid) {
        self.registry.remove(&match_id);

        let members: Vec<PlayerId> = self
            .player_matches
            .iter()
            .filter(|entry| *entry.value() == match_id)
            .map(|entry| entry.key().clone())
            .collect();

        let mut queue = self.queue.lock();
        for player_id in members {
            self.player_matches.remove(&player_id);
            if self.players.contains_key(&player_id) && !*self.shutdown_tx.borrow() {
                queue.enqueue(QueuedPlayer::new(player_id));
            }
        }

        info!(match_id = %match_id, queue_size = queue.len(), "Match removed from registry");
    }

    /// Run the matchmaking service (periodic queue processing)
    pub async fn run(&self) {
        let mut interval = tokio::time::interval(MATCHMAKING_INTERVAL);
        let mut shutdown = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => {
                    info!("Matchmaking stopped");
                    break;
                }
            }

            let connected: HashSet<PlayerId> =
                self.players.iter().map(|entry| entry.key().clone()).collect();

            let formed = self.queue.lock().try_form_match(&connected);
            if let Some(players) = formed {
                let longest_wait = players.first().map(|p| p.wait_time()).unwrap_or_default();
                debug!(
                    players = players.len(),
                    longest_wait_ms = longest_wait.as_millis() as u64,
                    "Lobby formed"
                );
                self.create_match(players).await;
            }
        }
    }

    /// Stop matchmaking and every running match loop
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Get current queue size
    pub fn queue_size(&self) -> usize {
        self.queue.lock().len()
    }

    /// Get player's current match ID
    pub fn player_match(&self, player_id: &str) -> Option<Uuid> {
        self.player_matches.get(player_id).map(|r| *r)
    }
}

/// Next envelope from the current room, or never when not in one
async fn recv_envelope(
    current: &mut Option<broadcast::Receiver<Envelope>>,
) -> Result<Envelope, RecvError> {
    match current {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn next_joined(session: &mut PlayerSession) -> Uuid {
        loop {
            match session.outbound_rx.recv().await {
                Ok(ServerMsg::MatchJoined { match_id, player_id, .. }) => {
                    assert_eq!(player_id, session.player_id);
                    return match_id;
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => panic!("session closed"),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn queued_players_land_in_one_match() {
        let registry = Arc::new(MatchRegistry::new());
        let service = MatchmakingService::new(MatchConfig::test_mode(), registry.clone());

        let mut a = service.register_player("a".into());
        let mut b = service.register_player("b".into());
        assert_eq!(service.queue_size(), 2);

        let runner = {
            let service = service.clone();
            tokio::spawn(async move { service.run().await })
        };

        let match_a = next_joined(&mut a).await;
        let match_b = next_joined(&mut b).await;
        assert_eq!(match_a, match_b);
        assert_eq!(service.player_match("a"), Some(match_a));
        assert_eq!(service.queue_size(), 0);
        assert_eq!(registry.active_matches(), 1);

        service.shutdown();
        runner.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn lone_player_waits() {
        let registry = Arc::new(MatchRegistry::new());
        let service = MatchmakingService::new(MatchConfig::default(), registry.clone());
        let _a = service.register_player("a".into());

        let runner = {
            let service = service.clone();
            tokio::spawn(async move { service.run().await })
        };
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(registry.active_matches(), 0);
        assert_eq!(service.queue_size(), 1);

        service.unregister_player("a").await;
        assert_eq!(service.queue_size(), 0);
        service.shutdown();
        runner.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_removes_player_from_room() {
        let registry = Arc::new(MatchRegistry::new());
        let service = MatchmakingService::new(MatchConfig::test_mode(), registry.clone());

        let mut a = service.register_player("a".into());
        let mut b = service.register_player("b".into());
        let runner = {
            let service = service.clone();
            tokio::spawn(async move { service.run().await })
        };

        let match_id = next_joined(&mut a).await;
        next_joined(&mut b).await;
        let handle = registry.get(&match_id).expect("match registered");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(handle.player_count(), 2);

        drop(a);
        service.unregister_player("a").await;
        assert_eq!(service.player_match("a"), None);
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(handle.player_count(), 1);
        assert_eq!(registry.total_players(), 1);

        service.shutdown();
        runner.await.unwrap();
    }

}
