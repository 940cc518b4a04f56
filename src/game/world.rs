//! Per-player state and the world roster

use std::collections::BTreeMap;
use std::time::Duration;

use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::Tuning;

use super::physics::{Arena, Hitbox, PhysicsSystem, Vec2};
use super::PlayerId;

pub const MAX_HEALTH: u32 = 100;

/// Latest movement intent for a player
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MoveInput {
    pub up: bool,
    pub down: bool,
    pub left: bool,
    pub right: bool,
    pub sprint: bool,
    pub aim_angle: f32,
    pub seq: u32,
}

/// An in-progress dodge roll
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RollState {
    /// Unit vector the roll travels along
    pub direction: Vec2,
    pub started_at: Duration,
}

/// Why a dodge roll was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollRejection {
    Dead,
    AlreadyRolling,
    Cooldown,
    NoPlayer,
}

/// Why a dodge roll stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollEnd {
    Completed,
    WallCollision,
}

/// Authoritative state of one combatant
#[derive(Debug, Clone)]
pub struct PlayerState {
    pub id: PlayerId,
    pub position: Vec2,
    pub velocity: Vec2,
    pub aim_angle: f32,
    pub health: u32,
    pub is_invulnerable: bool,
    pub invulnerable_until: Option<Duration>,
    pub death_time: Option<Duration>,
    pub kills: u32,
    pub deaths: u32,
    pub xp: u32,
    pub is_regenerating: bool,
    pub input: MoveInput,
    /// Tick on which the current kill total was reached
    pub last_kill_tick: Option<u64>,
    pub roll: Option<RollState>,
    last_roll_at: Option<Duration>,
    last_damage_time: Duration,
    regen_accumulator: f32,
}

impl PlayerState {
    pub fn new(id: PlayerId, position: Vec2, now: Duration) -> Self {
        Self {
            id,
            position,
            velocity: Vec2::ZERO,
            aim_angle: 0.0,
            health: MAX_HEALTH,
            is_invulnerable: false,
            invulnerable_until: None,
            death_time: None,
            kills: 0,
            deaths: 0,
            xp: 0,
            is_regenerating: false,
            input: MoveInput::default(),
            last_kill_tick: None,
            roll: None,
            last_roll_at: None,
            last_damage_time: now,
            regen_accumulator: 0.0,
        }
    }

    pub fn is_dead(&self) -> bool {
        self.death_time.is_some()
    }

    pub fn is_alive(&self) -> bool {
        !self.is_dead()
    }

    /// Subtract health, clamped at zero. Returns the damage actually applied.
    pub fn take_damage(&mut self, amount: u32, now: Duration) -> u32 {
        if self.is_dead() || self.is_invulnerable {
            return 0;
        }
        let applied = amount.min(self.health);
        self.health -= applied;
        self.last_damage_time = now;
        self.regen_accumulator = 0.0;
        self.is_regenerating = false;
        applied
    }

    pub fn mark_dead(&mut self, now: Duration) {
        self.health = 0;
        self.death_time = Some(now);
        self.velocity = Vec2::ZERO;
        self.is_regenerating = false;
        self.roll = None;
    }

    pub fn is_rolling(&self) -> bool {
        self.roll.is_some()
    }

    /// Inside the opening window of a roll, where hits pass through
    pub fn is_roll_invincible(&self, now: Duration, iframes: Duration) -> bool {
        self.roll
            .map(|roll| now.saturating_sub(roll.started_at) < iframes)
            .unwrap_or(false)
    }

    pub fn check_roll(&self, now: Duration, cooldown: Duration) -> Result<(), RollRejection> {
        if self.is_dead() {
            return Err(RollRejection::Dead);
        }
        if self.is_rolling() {
            return Err(RollRejection::AlreadyRolling);
        }
        match self.last_roll_at {
            Some(last) if now.saturating_sub(last) < cooldown => Err(RollRejection::Cooldown),
            _ => Ok(()),
        }
    }

    pub fn start_roll(&mut self, direction: Vec2, now: Duration) {
        self.roll = Some(RollState {
            direction,
            started_at: now,
        });
        self.last_roll_at = Some(now);
    }

    /// Stop rolling. Returns false if no roll was in progress.
    pub fn end_roll(&mut self) -> bool {
        self.roll.take().is_some()
    }

    pub fn can_respawn(&self, now: Duration, delay: Duration) -> bool {
        self.death_time
            .map(|died| now.saturating_sub(died) >= delay)
            .unwrap_or(false)
    }

    pub fn respawn(&mut self, position: Vec2, now: Duration, invulnerability: Duration) {
        self.position = position;
        self.velocity = Vec2::ZERO;
        self.health = MAX_HEALTH;
        self.death_time = None;
        self.roll = None;
        self.is_invulnerable = true;
        self.invulnerable_until = Some(now + invulnerability);
        self.last_damage_time = now;
        self.regen_accumulator = 0.0;
        self.is_regenerating = false;
    }

    /// Clear an expired invulnerability window. Returns true when it ended now.
    pub fn update_invulnerability(&mut self, now: Duration) -> bool {
        match self.invulnerable_until {
            Some(until) if self.is_invulnerable && now >= until => {
                self.is_invulnerable = false;
                self.invulnerable_until = None;
                true
            }
            _ => false,
        }
    }

    /// Regenerate whole health points. Returns the amount healed.
    pub fn apply_regeneration(&mut self, now: Duration, dt: f32, tuning: &Tuning) -> u32 {
        if self.is_dead() || self.health >= MAX_HEALTH {
            self.is_regenerating = false;
            self.regen_accumulator = 0.0;
            return 0;
        }
        if now.saturating_sub(self.last_damage_time) < tuning.regen_delay {
            self.is_regenerating = false;
            return 0;
        }

        self.is_regenerating = true;
        self.regen_accumulator += tuning.regen_rate * dt;
        let whole = self.regen_accumulator.floor();
        if whole < 1.0 {
            return 0;
        }
        self.regen_accumulator -= whole;
        let healed = (whole as u32).min(MAX_HEALTH - self.health);
        self.health += healed;
        if self.health >= MAX_HEALTH {
            self.is_regenerating = false;
            self.regen_accumulator = 0.0;
        }
        healed
    }
}

/// All players in one match, keyed by id in sorted order
#[derive(Debug)]
pub struct World {
    arena: Arena,
    hitbox: Hitbox,
    players: BTreeMap<PlayerId, PlayerState>,
    rng: ChaCha8Rng,
    spawn_margin: f32,
    spawn_candidates: usize,
}

impl World {
    pub fn new(arena: Arena, tuning: &Tuning, seed: u64) -> Self {
        Self {
            arena,
            hitbox: Hitbox::from_tuning(tuning),
            players: BTreeMap::new(),
            rng: ChaCha8Rng::seed_from_u64(seed),
            spawn_margin: tuning.spawn_margin,
            spawn_candidates: tuning.spawn_candidates.max(1),
        }
    }

    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    pub fn hitbox(&self) -> Hitbox {
        self.hitbox
    }

    /// Spawn a player at a balanced point. An existing id is left untouched.
    pub fn add_player(&mut self, id: PlayerId, now: Duration) -> &PlayerState {
        if !self.players.contains_key(&id) {
            let spawn = self.balanced_spawn_point(Some(id.as_str()));
            debug!(player_id = %id, x = spawn.x, y = spawn.y, "Player spawned");
            self.players
                .insert(id.clone(), PlayerState::new(id.clone(), spawn, now));
        }
        &self.players[&id]
    }

    /// Place a player at an exact position, used for scripted setups
    pub fn add_player_at(&mut self, id: PlayerId, position: Vec2, now: Duration) -> &PlayerState {
        let position = self.clamp_to_arena(position);
        self.players
            .entry(id.clone())
            .or_insert_with(|| PlayerState::new(id, position, now))
    }

    /// Remove a player. `None` signals an unknown id.
    pub fn remove_player(&mut self, id: &str) -> Option<PlayerState> {
        let removed = self.players.remove(id);
        if removed.is_none() {
            debug!(player_id = %id, "Remove for unknown player ignored");
        }
        removed
    }

    pub fn get(&self, id: &str) -> Option<&PlayerState> {
        self.players.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut PlayerState> {
        self.players.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.players.contains_key(id)
    }

    pub fn players(&self) -> impl Iterator<Item = &PlayerState> {
        self.players.values()
    }

    pub fn players_mut(&mut self) -> impl Iterator<Item = &mut PlayerState> {
        self.players.values_mut()
    }

    pub fn ids(&self) -> Vec<PlayerId> {
        self.players.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    /// Clamp so the player hitbox stays inside the arena
    pub fn clamp_to_arena(&self, position: Vec2) -> Vec2 {
        self.arena
            .clamp_box(position, self.hitbox.half_width, self.hitbox.half_height)
    }

    /// Best of N random candidates by distance to the nearest living opponent
    pub fn balanced_spawn_point(&mut self, exclude: Option<&str>) -> Vec2 {
        let opponents: Vec<Vec2> = self
            .players
            .values()
            .filter(|p| p.is_alive() && Some(p.id.as_str()) != exclude)
            .map(|p| p.position)
            .collect();

        if opponents.is_empty() {
            return self.arena.center();
        }

        let margin = self.spawn_margin;
        let mut best = self.arena.center();
        let mut best_distance = -1.0_f32;

        for _ in 0..self.spawn_candidates {
            let candidate = Vec2::new(
                self.rng.gen_range(margin..self.arena.width - margin),
                self.rng.gen_range(margin..self.arena.height - margin),
            );
            let nearest = opponents
                .iter()
                .map(|o| PhysicsSystem::distance(candidate, *o))
                .fold(f32::INFINITY, f32::min);
            if nearest > best_distance {
                best_distance = nearest;
                best = candidate;
            }
        }

        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn world() -> World {
        World::new(Arena::new(1920.0, 1080.0), &Tuning::default(), 7)
    }

    #[test]
    fn first_player_spawns_at_center() {
        let mut world = world();
        let p = world.add_player("a".into(), Duration::ZERO);
        assert_eq!(p.position, Vec2::new(960.0, 540.0));
        assert_eq!(p.health, MAX_HEALTH);
    }

    #[test]
    fn balanced_spawn_avoids_opponents() {
        let mut world = world();
        world.add_player("a".into(), Duration::ZERO);
        let second = world.add_player("b".into(), Duration::ZERO).position;

        assert!(second.x >= 100.0 && second.x <= 1820.0);
        assert!(second.y >= 100.0 && second.y <= 980.0);
        assert!(PhysicsSystem::distance(second, Vec2::new(960.0, 540.0)) > 100.0);
    }

    #[test]
    fn same_seed_gives_same_spawns() {
        let mut a = world();
        let mut b = world();
        for w in [&mut a, &mut b] {
            w.add_player("x".into(), Duration::ZERO);
            w.add_player("y".into(), Duration::ZERO);
        }
        assert_eq!(a.get("y").map(|p| p.position), b.get("y").map(|p| p.position));
    }

    #[test]
    fn unknown_ids_are_not_found() {
        let mut world = world();
        assert!(world.remove_player("ghost").is_none());
        assert!(world.get("ghost").is_none());
    }

    #[test]
    fn roll_cooldown_and_iframes() {
        let ms = Duration::from_millis;
        let cooldown = Duration::from_secs(3);
        let iframes = ms(200);
        let mut p = PlayerState::new("a".into(), Vec2::ZERO, Duration::ZERO);

        assert_eq!(p.check_roll(Duration::ZERO, cooldown), Ok(()));
        p.start_roll(Vec2::new(1.0, 0.0), Duration::ZERO);
        assert_eq!(p.check_roll(ms(10), cooldown), Err(RollRejection::AlreadyRolling));
        assert!(p.is_roll_invincible(ms(199), iframes));
        assert!(!p.is_roll_invincible(ms(200), iframes));

        assert!(p.end_roll());
        assert!(!p.end_roll());
        assert_eq!(p.check_roll(ms(2_999), cooldown), Err(RollRejection::Cooldown));
        assert_eq!(p.check_roll(ms(3_000), cooldown), Ok(()));

        p.start_roll(Vec2::new(0.0, 1.0), ms(3_000));
        p.mark_dead(ms(3_100));
        assert!(!p.is_rolling());
        assert_eq!(p.check_roll(ms(9_000), cooldown), Err(RollRejection::Dead));
    }

    #[test]
    fn damage_clamps_at_zero() {
        let mut p = PlayerState::new("a".into(), Vec2::ZERO, Duration::ZERO);
        assert_eq!(p.take_damage(60, Duration::ZERO), 60);
        assert_eq!(p.take_damage(60, Duration::ZERO), 40);
        assert_eq!(p.health, 0);
    }

    #[test]
    fn invulnerable_player_takes_no_damage() {
        let mut p = PlayerState::new("a".into(), Vec2::ZERO, Duration::ZERO);
        p.respawn(Vec2::ZERO, Duration::ZERO, Duration::from_secs(2));
        assert_eq!(p.take_damage(100, Duration::from_secs(1)), 0);
        assert_eq!(p.health, MAX_HEALTH);

        assert!(!p.update_invulnerability(Duration::from_millis(1999)));
        assert!(p.update_invulnerability(Duration::from_secs(2)));
        assert!(!p.is_invulnerable);
    }

    #[test]
    fn respawn_waits_for_delay() {
        let mut p = PlayerState::new("a".into(), Vec2::ZERO, Duration::ZERO);
        p.mark_dead(Duration::from_secs(10));
        assert!(p.is_dead());
        assert!(!p.can_respawn(Duration::from_millis(12_999), Duration::from_secs(3)));
        assert!(p.can_respawn(Duration::from_secs(13), Duration::from_secs(3)));
    }

    #[test]
    fn regeneration_waits_then_heals_whole_points() {
        let tuning = Tuning::default();
        let mut p = PlayerState::new("a".into(), Vec2::ZERO, Duration::ZERO);
        p.take_damage(50, Duration::ZERO);

        assert_eq!(p.apply_regeneration(Duration::from_secs(4), 1.0, &tuning), 0);
        assert!(!p.is_regenerating);

        // 10 hp/s over a 1/20 s step accumulates half a point
        assert_eq!(p.apply_regeneration(Duration::from_secs(5), 0.05, &tuning), 0);
        assert!(p.is_regenerating);
        assert_eq!(p.apply_regeneration(Duration::from_secs(5), 0.05, &tuning), 1);
        assert_eq!(p.health, 51);
    }

    #[test]
    fn regeneration_caps_at_max() {
        let tuning = Tuning::default();
        let mut p = PlayerState::new("a".into(), Vec2::ZERO, Duration::ZERO);
        p.take_damage(5, Duration::ZERO);
        let healed = p.apply_regeneration(Duration::from_secs(10), 10.0, &tuning);
        assert_eq!(healed, 5);
        assert_eq!(p.health, MAX_HEALTH);
        assert!(!p.is_regenerating);
    }
}
