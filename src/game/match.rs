//! Match lifecycle and the per-room tick loop

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{MatchConfig, TiePolicy};
use crate::util::time::{tick_period, SharedClock};
use crate::ws::protocol::{Envelope, FinalScore, ServerMsg};

use super::simulation::Simulation;
use super::snapshot::WorldSnapshot;
use super::world::{PlayerState, World};
use super::{Intent, PlayerId};

/// A tick loop that panics this many times in a row is shut down
const MAX_CONSECUTIVE_PANICS: u32 = 5;

/// Match phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchPhase {
    /// Waiting for enough players
    #[default]
    Pending,
    /// Match in progress
    Active,
    /// Terminal
    Ended,
}

/// Why a match ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    KillTarget,
    TimeLimit,
}

#[derive(Debug, thiserror::Error)]
pub enum MatchError {
    #[error("match is full")]
    MatchFull,

    #[error("player {0} already joined")]
    AlreadyJoined(PlayerId),

    #[error("unknown player {0}")]
    UnknownPlayer(PlayerId),

    #[error("match has ended")]
    Ended,
}

/// Phase, timing and result of one match
#[derive(Debug, Clone)]
pub struct Match {
    phase: MatchPhase,
    kill_target: u32,
    time_limit: Duration,
    tie_policy: TiePolicy,
    started_at: Option<Duration>,
    ended_at: Option<Duration>,
    end_reason: Option<EndReason>,
    winners: Vec<PlayerId>,
    final_scores: Vec<FinalScore>,
}

impl Match {
    pub fn new(config: &MatchConfig) -> Self {
        Self {
            phase: MatchPhase::Pending,
            kill_target: config.kill_target,
            time_limit: config.time_limit,
            tie_policy: config.tie_policy,
            started_at: None,
            ended_at: None,
            end_reason: None,
            winners: Vec::new(),
            final_scores: Vec::new(),
        }
    }

    pub fn phase(&self) -> MatchPhase {
        self.phase
    }

    pub fn is_ended(&self) -> bool {
        self.phase == MatchPhase::Ended
    }

    pub fn ended_at(&self) -> Option<Duration> {
        self.ended_at
    }

    pub fn end_reason(&self) -> Option<EndReason> {
        self.end_reason
    }

    pub fn winners(&self) -> &[PlayerId] {
        &self.winners
    }

    pub fn final_scores(&self) -> &[FinalScore] {
        &self.final_scores
    }

    /// Pending -> Active. Returns false if the match was not pending.
    pub fn start(&mut self, now: Duration) -> bool {
        if self.phase != MatchPhase::Pending {
            return false;
        }
        self.phase = MatchPhase::Active;
        self.started_at = Some(now);
        true
    }

    /// Whole seconds left on the clock
    pub fn remaining_secs(&self, now: Duration) -> u64 {
        match (self.phase, self.started_at) {
            (MatchPhase::Active, Some(started)) => self
                .time_limit
                .saturating_sub(now.saturating_sub(started))
                .as_secs(),
            (MatchPhase::Ended, _) => 0,
            _ => self.time_limit.as_secs(),
        }
    }

    /// End the match if the kill target or time limit was reached.
    /// Returns the reason only on the call that ended it.
    pub fn check_end(&mut self, now: Duration, world: &World) -> Option<EndReason> {
        if self.phase != MatchPhase::Active {
            return None;
        }
        let reason = if world.players().any(|p| p.kills >= self.kill_target) {
            EndReason::KillTarget
        } else if self
            .started_at
            .is_some_and(|started| now.saturating_sub(started) >= self.time_limit)
        {
            EndReason::TimeLimit
        } else {
            return None;
        };
        self.end(reason, now, world).then_some(reason)
    }

    /// Force the match to end. No-op once ended.
    pub fn end(&mut self, reason: EndReason, now: Duration, world: &World) -> bool {
        if self.phase == MatchPhase::Ended {
            return false;
        }
        self.phase = MatchPhase::Ended;
        self.ended_at = Some(now);
        self.end_reason = Some(reason);
        self.winners = self.decide_winners(world);

        let mut scores: Vec<FinalScore> = world
            .players()
            .map(|p| FinalScore {
                player_id: p.id.clone(),
                kills: p.kills,
                deaths: p.deaths,
                xp: p.xp,
            })
            .collect();
        scores.sort_by(|a, b| b.kills.cmp(&a.kills).then_with(|| a.player_id.cmp(&b.player_id)));
        self.final_scores = scores;
        true
    }

    fn decide_winners(&self, world: &World) -> Vec<PlayerId> {
        let Some(top) = world.players().map(|p| p.kills).max() else {
            return Vec::new();
        };
        let tied: Vec<&PlayerState> = world.players().filter(|p| p.kills == top).collect();

        if self.tie_policy == TiePolicy::FirstToReach && tied.len() > 1 {
            let earliest = tied
                .iter()
                .map(|p| p.last_kill_tick)
                .collect::<Option<Vec<u64>>>()
                .and_then(|ticks| ticks.into_iter().min());
            if let Some(first) = earliest {
                return tied
                    .iter()
                    .filter(|p| p.last_kill_tick == Some(first))
                    .map(|p| p.id.clone())
                    .collect();
            }
        }

        tied.into_iter().map(|p| p.id.clone()).collect()
    }
}

/// Handle to a running match
#[derive(Clone)]
pub struct MatchHandle {
    pub id: Uuid,
    pub input_tx: mpsc::Sender<Intent>,
    pub outbound_tx: broadcast::Sender<Envelope>,
    pub player_count: Arc<AtomicUsize>,
}

impl MatchHandle {
    pub fn player_count(&self) -> usize {
        self.player_count.load(Ordering::Relaxed)
    }
}

/// Registry of all active matches
pub struct MatchRegistry {
    matches: DashMap<Uuid, MatchHandle>,
}

impl MatchRegistry {
    pub fn new() -> Self {
        Self {
            matches: DashMap::new(),
        }
    }

    pub fn get(&self, id: &Uuid) -> Option<MatchHandle> {
        self.matches.get(id).map(|m| m.value().clone())
    }

    pub fn insert(&self, handle: MatchHandle) {
        self.matches.insert(handle.id, handle);
    }

    pub fn remove(&self, id: &Uuid) -> Option<MatchHandle> {
        self.matches.remove(id).map(|(_, h)| h)
    }

    pub fn active_matches(&self) -> usize {
        self.matches.len()
    }

    pub fn total_players(&self) -> usize {
        self.matches
            .iter()
            .map(|m| m.value().player_count())
            .sum()
    }
}

impl Default for MatchRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The authoritative game match
pub struct GameMatch {
    sim: Simulation,
    input_rx: mpsc::Receiver<Intent>,
    outbound_tx: broadcast::Sender<Envelope>,
    snapshot_tx: watch::Sender<Arc<WorldSnapshot>>,
    player_count: Arc<AtomicUsize>,
    shutdown: watch::Receiver<bool>,
}

impl GameMatch {
    /// Create a new match
    pub fn new(
        id: Uuid,
        seed: u64,
        config: MatchConfig,
        clock: SharedClock,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, MatchHandle) {
        let (input_tx, input_rx) = mpsc::channel(256);
        let (outbound_tx, _) = broadcast::channel(256);
        let (snapshot_tx, _) = watch::channel(Arc::new(WorldSnapshot::default()));
        let player_count = Arc::new(AtomicUsize::new(0));

        let handle = MatchHandle {
            id,
            input_tx,
            outbound_tx: outbound_tx.clone(),
            player_count: player_count.clone(),
        };

        let game_match = Self {
            sim: Simulation::new(id, config, clock, seed),
            input_rx,
            outbound_tx,
            snapshot_tx,
            player_count,
            shutdown,
        };

        (game_match, handle)
    }

    /// Run the authoritative tick loop until the room closes
    pub async fn run(mut self) {
        let match_id = self.sim.id();
        let config = self.sim.config().clone();
        info!(match_id = %match_id, tick_rate = config.tick_rate, "Match loop started");

        let broadcaster = tokio::spawn(broadcast_loop(
            match_id,
            self.snapshot_tx.subscribe(),
            self.outbound_tx.clone(),
            config.broadcast_rate,
            config.timer_rate,
        ));

        let mut tick_interval = interval(tick_period(config.tick_rate));
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut guard = PanicGuard::default();
        let mut had_players = false;

        loop {
            tokio::select! {
                _ = tick_interval.tick() => {}
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        info!(match_id = %match_id, "Shutdown requested, stopping match");
                        break;
                    }
                    continue;
                }
            }

            let tick = self.sim.tick_count();
            match guard.run(match_id, tick, || self.step()) {
                Guarded::Completed(envelopes) => self.publish(envelopes),
                Guarded::Recovered => continue,
                Guarded::GaveUp => break,
            }

            had_players |= !self.sim.world().is_empty();
            if self.should_close(had_players, config.end_grace_period) {
                break;
            }
        }

        broadcaster.abort();
        info!(
            match_id = %match_id,
            ticks = self.sim.tick_count(),
            phase = ?self.sim.game_match().phase(),
            reason = ?self.sim.game_match().end_reason(),
            "Match loop finished"
        );
    }

    /// Drain queued intents, then advance one tick
    fn step(&mut self) -> Vec<Envelope> {
        while let Ok(intent) = self.input_rx.try_recv() {
            self.sim.apply_intent(intent);
        }
        self.sim.tick()
    }

    fn publish(&mut self, envelopes: Vec<Envelope>) {
        for envelope in envelopes {
            // No receivers means nobody is listening yet
            let _ = self.outbound_tx.send(envelope);
        }
        self.snapshot_tx.send_replace(Arc::new(self.sim.snapshot()));
        self.player_count
            .store(self.sim.world().len(), Ordering::Relaxed);
    }

    fn should_close(&self, had_players: bool, grace: Duration) -> bool {
        let empty = self.sim.world().is_empty();
        match self.sim.game_match().ended_at() {
            Some(ended_at) => {
                let closing = empty || self.sim.now() >= ended_at + grace;
                if closing {
                    debug!(match_id = %self.sim.id(), empty, "Ended match closing");
                }
                closing
            }
            None if had_players && empty => {
                warn!(match_id = %self.sim.id(), "All players left before the match ended");
                true
            }
            None => false,
        }
    }
}

/// Outcome of one guarded tick
#[derive(Debug, PartialEq)]
pub(crate) enum Guarded<T> {
    Completed(T),
    /// The tick panicked but the room keeps running
    Recovered,
    /// Too many panics in a row, the room should close
    GaveUp,
}

/// Counts consecutive panicking ticks so one bad tick doesn't take the room down
#[derive(Debug, Default)]
pub(crate) struct PanicGuard {
    consecutive: u32,
}

impl PanicGuard {
    pub(crate) fn run<T>(&mut self, match_id: Uuid, tick: u64, step: impl FnOnce() -> T) -> Guarded<T> {
        match catch_unwind(AssertUnwindSafe(step)) {
            Ok(value) => {
                self.consecutive = 0;
                Guarded::Completed(value)
            }
            Err(panic) => {
                self.consecutive += 1;
                error!(
                    match_id = %match_id,
                    tick,
                    consecutive_panics = self.consecutive,
                    panic = panic_message(panic.as_ref()),
                    "Tick panicked"
                );
                if self.consecutive >= MAX_CONSECUTIVE_PANICS {
                    error!(match_id = %match_id, "Too many consecutive panics, closing match");
                    Guarded::GaveUp
                } else {
                    Guarded::Recovered
                }
            }
        }
    }
}

/// Sends the latest snapshot at the broadcast rate and the match timer at the timer rate
async fn broadcast_loop(
    match_id: Uuid,
    snapshot_rx: watch::Receiver<Arc<WorldSnapshot>>,
    outbound_tx: broadcast::Sender<Envelope>,
    broadcast_rate: u32,
    timer_rate: u32,
) {
    debug!(match_id = %match_id, broadcast_rate, timer_rate, "Broadcast loop started");

    let mut snapshot_interval = interval(tick_period(broadcast_rate));
    snapshot_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut timer_interval = interval(tick_period(timer_rate));
    timer_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = snapshot_interval.tick() => {
                let snapshot = snapshot_rx.borrow().clone();
                let _ = outbound_tx.send(Envelope::room(ServerMsg::Snapshot((*snapshot).clone())));
            }
            _ = timer_interval.tick() => {
                let snapshot = snapshot_rx.borrow().clone();
                if snapshot.phase != MatchPhase::Ended {
                    let _ = outbound_tx.send(Envelope::room(ServerMsg::MatchTimer {
                        remaining_secs: snapshot.remaining_secs,
                    }));
                }
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        return msg;
    }
    if let Some(msg) = panic.downcast_ref::<String>() {
        return msg;
    }
    "unknown panic"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Tuning;
    use crate::game::physics::{Arena, Vec2};
    use crate::game::IntentKind;
    use crate::util::time::RealClock;
    use tokio::sync::broadcast::error::RecvError;

    fn world_with(kills: &[(&str, u32, Option<u64>)]) -> World {
        let mut world = World::new(Arena::new(1920.0, 1080.0), &Tuning::default(), 3);
        for (i, (id, k, tick)) in kills.iter().enumerate() {
            world.add_player_at(id.to_string(), Vec2::new(100.0 * (i + 1) as f32, 500.0), Duration::ZERO);
            let player = world.get_mut(id).unwrap();
            player.kills = *k;
            player.last_kill_tick = *tick;
        }
        world
    }

    fn active(config: &MatchConfig) -> Match {
        let mut m = Match::new(config);
        assert!(m.start(Duration::ZERO));
        m
    }

    #[test]
    fn pending_until_started() {
        let config = MatchConfig::default();
        let mut m = Match::new(&config);
        let world = world_with(&[("a", 50, Some(1))]);
        assert_eq!(m.check_end(Duration::from_secs(999), &world), None);
        assert_eq!(m.remaining_secs(Duration::from_secs(999)), 420);
        assert!(m.start(Duration::from_secs(5)));
        assert!(!m.start(Duration::from_secs(6)));
        assert_eq!(m.remaining_secs(Duration::from_millis(5_500)), 419);
    }

    #[test]
    fn ends_on_kill_target_before_time_limit() {
        let config = MatchConfig::test_mode();
        let mut m = active(&config);
        let world = world_with(&[("a", 2, Some(10)), ("b", 1, Some(4))]);
        assert_eq!(m.check_end(Duration::from_secs(30), &world), Some(EndReason::KillTarget));
        assert_eq!(m.phase(), MatchPhase::Ended);
        assert_eq!(m.winners(), ["a".to_string()]);
        assert_eq!(m.remaining_secs(Duration::from_secs(31)), 0);
    }

    #[test]
    fn ends_on_time_limit() {
        let config = MatchConfig::test_mode();
        let mut m = active(&config);
        let world = world_with(&[("a", 1, Some(10)), ("b", 0, None)]);
        assert_eq!(m.check_end(Duration::from_millis(9_999), &world), None);
        assert_eq!(m.check_end(Duration::from_secs(10), &world), Some(EndReason::TimeLimit));
        assert_eq!(m.ended_at(), Some(Duration::from_secs(10)));
    }

    #[test]
    fn end_is_idempotent() {
        let config = MatchConfig::test_mode();
        let mut m = active(&config);
        let world = world_with(&[("a", 2, Some(3))]);
        assert!(m.check_end(Duration::from_secs(1), &world).is_some());

        let later = world_with(&[("a", 2, Some(3)), ("b", 9, Some(8))]);
        assert_eq!(m.check_end(Duration::from_secs(20), &later), None);
        assert!(!m.end(EndReason::TimeLimit, Duration::from_secs(20), &later));
        assert_eq!(m.end_reason(), Some(EndReason::KillTarget));
        assert_eq!(m.winners(), ["a".to_string()]);
        assert_eq!(m.ended_at(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn share_victory_lists_all_tied() {
        let config = MatchConfig::test_mode();
        let mut m = active(&config);
        let world = world_with(&[("b", 2, Some(7)), ("a", 2, Some(7)), ("c", 0, None)]);
        m.check_end(Duration::from_secs(1), &world);
        assert_eq!(m.winners(), ["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn first_to_reach_breaks_ties_by_tick() {
        let config = MatchConfig {
            tie_policy: TiePolicy::FirstToReach,
            ..MatchConfig::test_mode()
        };
        let mut m = active(&config);
        let world = world_with(&[("a", 3, Some(12)), ("b", 3, Some(9))]);
        m.end(EndReason::TimeLimit, Duration::from_secs(10), &world);
        assert_eq!(m.winners(), ["b".to_string()]);

        // No kills at all: nobody reached anything first
        let mut m = active(&config);
        let world = world_with(&[("a", 0, None), ("b", 0, None)]);
        m.end(EndReason::TimeLimit, Duration::from_secs(10), &world);
        assert_eq!(m.winners().len(), 2);
    }

    #[test]
    fn final_scores_sorted_by_kills_then_id() {
        let config = MatchConfig::default();
        let mut m = active(&config);
        let world = world_with(&[("c", 1, Some(1)), ("a", 1, Some(2)), ("b", 4, Some(3))]);
        m.end(EndReason::TimeLimit, Duration::from_secs(1), &world);
        let order: Vec<_> = m.final_scores().iter().map(|s| s.player_id.as_str()).collect();
        assert_eq!(order, ["b", "a", "c"]);
    }

    #[test]
    fn registry_tracks_handles() {
        let registry = MatchRegistry::new();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let clock = Arc::new(crate::util::time::ManualClock::new());
        let (_game, handle) = GameMatch::new(Uuid::new_v4(), 1, MatchConfig::default(), clock, shutdown_rx);
        handle.player_count.store(3, Ordering::Relaxed);

        registry.insert(handle.clone());
        assert_eq!(registry.active_matches(), 1);
        assert_eq!(registry.total_players(), 3);
        assert!(registry.get(&handle.id).is_some());
        assert!(registry.remove(&handle.id).is_some());
        assert_eq!(registry.active_matches(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn loop_runs_to_time_limit_then_closes() {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (game, handle) = GameMatch::new(
            Uuid::new_v4(),
            7,
            MatchConfig::test_mode(),
            RealClock::shared(),
            shutdown_rx,
        );
        let mut rx = handle.outbound_tx.subscribe();
        let runner = tokio::spawn(game.run());

        for id in ["a", "b"] {
            handle
                .input_tx
                .send(Intent {
                    player_id: id.to_string(),
                    kind: IntentKind::Join,
                    received_at: 0,
                })
                .await
                .unwrap();
        }

        let mut saw_snapshot = false;
        let mut saw_timer = false;
        let reason = loop {
            match rx.recv().await {
                Ok(Envelope {
                    msg: ServerMsg::MatchEnded { reason, .. },
                    ..
                }) => break reason,
                Ok(Envelope {
                    msg: ServerMsg::Snapshot(_),
                    ..
                }) => saw_snapshot = true,
                Ok(Envelope {
                    msg: ServerMsg::MatchTimer { .. },
                    ..
                }) => saw_timer = true,
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => panic!("channel closed before match end"),
            }
        };

        assert_eq!(reason, EndReason::TimeLimit);
        assert!(saw_snapshot && saw_timer);
        runner.await.unwrap();
        assert_eq!(handle.player_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_pending_match() {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (game, _handle) = GameMatch::new(
            Uuid::new_v4(),
            7,
            MatchConfig::default(),
            RealClock::shared(),
            shutdown_rx,
        );
        let runner = tokio::spawn(game.run());
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown_tx.send(true).unwrap();
        runner.await.unwrap();
    }

    #[test]
    fn panicking_ticks_are_isolated() {
        let id = Uuid::new_v4();
        let mut guard = PanicGuard::default();

        assert_eq!(guard.run(id, 0, || -> u32 { panic!("bad tick") }), Guarded::Recovered);
        assert_eq!(guard.run(id, 1, || 7), Guarded::Completed(7));

        for tick in 0..MAX_CONSECUTIVE_PANICS - 1 {
            let outcome = guard.run(id, u64::from(tick), || -> u32 { panic!("bad tick") });
            assert_eq!(outcome, Guarded::Recovered);
        }
        let outcome = guard.run(id, 99, || -> u32 { panic!("{}", String::from("still bad")) });
        assert_eq!(outcome, Guarded::GaveUp);
    }
}
