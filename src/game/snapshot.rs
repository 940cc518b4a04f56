//! Immutable world snapshots for the broadcast loop

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::util::time::as_millis;

use super::combat::{WeaponKind, WeaponState};
use super::physics::Vec2;
use super::r#match::{Match, MatchPhase};
use super::world::World;
use super::PlayerId;

/// Player state in a snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerSnapshot {
    pub id: PlayerId,
    pub position: Vec2,
    pub velocity: Vec2,
    /// Aim in radians
    pub aim_angle: f32,
    /// Health (0-100)
    pub health: u32,
    pub is_invulnerable: bool,
    /// Logical time of death in ms, while dead
    pub death_time: Option<u64>,
    pub kills: u32,
    pub deaths: u32,
    pub xp: u32,
    pub is_regenerating: bool,
    pub is_rolling: bool,
    pub weapon: WeaponKind,
    pub ammo: u32,
    pub is_reloading: bool,
    /// Last processed input sequence
    pub last_input_seq: u32,
}

/// Copy of every player's state after one tick
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorldSnapshot {
    pub tick: u64,
    pub phase: MatchPhase,
    pub remaining_secs: u64,
    /// Ordered by player id
    pub players: Vec<PlayerSnapshot>,
}

/// Builds snapshots for network transmission
pub struct SnapshotBuilder;

impl SnapshotBuilder {
    pub fn build(
        tick: u64,
        world: &World,
        weapons: &BTreeMap<PlayerId, WeaponState>,
        game_match: &Match,
        now: Duration,
    ) -> WorldSnapshot {
        // World iterates in id order
        let players = world
            .players()
            .map(|p| {
                let weapon = weapons.get(&p.id).cloned().unwrap_or_default();
                PlayerSnapshot {
                    id: p.id.clone(),
                    position: p.position,
                    velocity: p.velocity,
                    aim_angle: p.aim_angle,
                    health: p.health,
                    is_invulnerable: p.is_invulnerable,
                    death_time: p.death_time.map(as_millis),
                    kills: p.kills,
                    deaths: p.deaths,
                    xp: p.xp,
                    is_regenerating: p.is_regenerating,
                    is_rolling: p.is_rolling(),
                    weapon: weapon.kind(),
                    ammo: weapon.ammo(),
                    is_reloading: weapon.is_reloading(),
                    last_input_seq: p.input.seq,
                }
            })
            .collect();

        WorldSnapshot {
            tick,
            phase: game_match.phase(),
            remaining_secs: game_match.remaining_secs(now),
            players,
        }
    }
}
