//! Matchmaking queue implementation

use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

use crate::game::PlayerId;

/// Player in the matchmaking queue
#[derive(Debug, Clone)]
pub struct QueuedPlayer {
    pub player_id: PlayerId,
    pub queued_at: Instant,
}

impl QueuedPlayer {
    pub fn new(player_id: PlayerId) -> Self {
        Self {
            player_id,
            queued_at: Instant::now(),
        }
    }

    /// How long this player has been waiting
    pub fn wait_time(&self) -> Duration {
        self.queued_at.elapsed()
    }
}

/// The matchmaking queue
pub struct MatchmakingQueue {
    queue: VecDeque<QueuedPlayer>,
    /// Minimum players to start a match
    min_players: usize,
    /// Maximum players per match
    max_players: usize,
}

impl MatchmakingQueue {
    pub fn new(min_players: usize, max_players: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            min_players,
            max_players,
        }
    }

    /// Add a player to the queue
    pub fn enqueue(&mut self, player: QueuedPlayer) {
        // Remove if already in queue (rejoin)
        self.queue.retain(|p| p.player_id != player.player_id);
        self.queue.push_back(player);
    }

    /// Remove a player from the queue
    pub fn dequeue(&mut self, player_id: &str) -> Option<QueuedPlayer> {
        let pos = self.queue.iter().position(|p| p.player_id == player_id)?;
        self.queue.remove(pos)
    }

    /// Check if a player is in the queue
    pub fn contains(&self, player_id: &str) -> bool {
        self.queue.iter().any(|p| p.player_id == player_id)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Take up to `max_players` connected players in queue order once at
    /// least `min_players` of them are waiting. Stale entries are dropped.
    pub fn try_form_match(&mut self, connected: &HashSet<PlayerId>) -> Option<Vec<QueuedPlayer>> {
        self.queue.retain(|p| connected.contains(&p.player_id));
        if self.queue.len() < self.min_players {
            return None;
        }
        let count = self.queue.len().min(self.max_players);
        Some(self.queue.drain(..count).collect())
    }
}

impl Default for MatchmakingQueue {
    fn default() -> Self {
        Self::new(2, 8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected(ids: &[&str]) -> HashSet<PlayerId> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn rejoin_moves_to_back() {
        let mut queue = MatchmakingQueue::default();
        queue.enqueue(QueuedPlayer::new("a".into()));
        queue.enqueue(QueuedPlayer::new("b".into()));
        queue.enqueue(QueuedPlayer::new("a".into()));
        assert_eq!(queue.len(), 2);

        let formed = queue.try_form_match(&connected(&["a", "b"])).unwrap();
        let order: Vec<_> = formed.iter().map(|p| p.player_id.as_str()).collect();
        assert_eq!(order, ["b", "a"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn waits_for_minimum_connected_players() {
        let mut queue = MatchmakingQueue::new(2, 8);
        queue.enqueue(QueuedPlayer::new("a".into()));
        queue.enqueue(QueuedPlayer::new("gone".into()));

        assert!(queue.try_form_match(&connected(&["a"])).is_none());
        assert!(!queue.contains("gone"));
        assert!(queue.contains("a"));
    }

    #[test]
    fn caps_at_max_players() {
        let mut queue = MatchmakingQueue::new(2, 3);
        let ids = ["p1", "p2", "p3", "p4", "p5"];
        for id in ids {
            queue.enqueue(QueuedPlayer::new(id.into()));
        }
        let formed = queue.try_form_match(&connected(&ids)).unwrap();
        assert_eq!(formed.len(), 3);
        assert_eq!(queue.len(), 2);
        assert!(queue.dequeue("p4").is_some());
        assert!(queue.dequeue("p4").is_none());
    }
}
