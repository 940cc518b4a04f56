//! WebSocket protocol message definitions
//! These are the wire types for client-server communication

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::game::combat::{ReloadRejection, ShootRejection, WeaponKind};
use crate::game::physics::Vec2;
use crate::game::pickup::{PickupRejection, WeaponCrate};
use crate::game::r#match::EndReason;
use crate::game::snapshot::WorldSnapshot;
use crate::game::world::{RollEnd, RollRejection};
use crate::game::PlayerId;

/// Messages sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMsg {
    /// Movement flags and aim for the current frame
    Input {
        /// Client frame counter, echoed back in snapshots
        #[serde(default)]
        seq: u32,
        #[serde(default)]
        up: bool,
        #[serde(default)]
        down: bool,
        #[serde(default)]
        left: bool,
        #[serde(default)]
        right: bool,
        #[serde(default)]
        sprint: bool,
        /// Aim direction in radians
        #[serde(default)]
        aim_angle: f32,
    },

    /// Fire (or swing) the held weapon
    Shoot {
        aim_angle: f32,
    },

    Reload,

    /// Roll along the held direction, or the aim when standing still
    DodgeRoll,

    /// Try to take the weapon from a crate
    PickupAttempt {
        crate_id: String,
    },

    /// Ping for latency measurement
    Ping {
        /// Client timestamp
        t: u64,
    },

    /// Leave current match
    LeaveMatch,
}

/// Messages sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMsg {
    /// Welcome message after connection
    Welcome {
        player_id: PlayerId,
        server_time: u64,
    },

    /// Confirmation of match join
    MatchJoined {
        match_id: Uuid,
        player_id: PlayerId,
        kill_target: u32,
        time_limit_secs: u64,
        arena_width: f32,
        arena_height: f32,
        /// All players in the match at join time
        players: Vec<PlayerId>,
        crates: Vec<WeaponCrate>,
    },

    /// Player joined the match
    PlayerJoined {
        player_id: PlayerId,
    },

    /// Player left the match
    PlayerLeft {
        player_id: PlayerId,
        reason: String,
    },

    /// Match went active
    MatchStarted {
        tick: u64,
    },

    /// World state (sent at the broadcast rate)
    Snapshot(WorldSnapshot),

    /// Discrete gameplay event from a tick
    Event {
        tick: u64,
        event: GameEvent,
    },

    /// Remaining match time (sent at the timer rate)
    MatchTimer {
        remaining_secs: u64,
    },

    /// Match has ended
    MatchEnded {
        reason: EndReason,
        winners: Vec<PlayerId>,
        final_scores: Vec<FinalScore>,
    },

    /// Shot refused, sent only to the shooter
    ShootFailed {
        reason: ShootRejection,
    },

    /// Reload refused, sent only to the requester
    ReloadFailed {
        reason: ReloadRejection,
    },

    /// Dodge roll refused, sent only to the requester
    RollFailed {
        reason: RollRejection,
    },

    /// Pickup refused, sent only to the requester
    PickupFailed {
        crate_id: String,
        reason: PickupRejection,
    },

    /// Error message
    Error {
        code: String,
        message: String,
    },

    /// Pong response
    Pong {
        /// Echo back client timestamp
        t: u64,
        server_time: u64,
    },
}

/// Gameplay events emitted by the simulation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum GameEvent {
    /// Ranged shot fired
    ProjectileSpawned {
        projectile_id: u64,
        owner_id: PlayerId,
        weapon: WeaponKind,
        position: Vec2,
        velocity: Vec2,
    },

    /// Melee swing, with everyone it connected with
    MeleeSwing {
        attacker_id: PlayerId,
        weapon: WeaponKind,
        aim_angle: f32,
        victim_ids: Vec<PlayerId>,
    },

    /// Damage applied to a player
    Damaged {
        attacker_id: PlayerId,
        victim_id: PlayerId,
        damage: u32,
        new_health: u32,
        projectile_id: Option<u64>,
    },

    /// Player died
    Death {
        victim_id: PlayerId,
        attacker_id: PlayerId,
    },

    /// Kill credited to the attacker
    KillCredit {
        killer_id: PlayerId,
        victim_id: PlayerId,
        killer_kills: u32,
        killer_xp: u32,
    },

    Respawn {
        player_id: PlayerId,
        position: Vec2,
        health: u32,
    },

    /// Ammo or reload state changed
    WeaponState {
        player_id: PlayerId,
        weapon: WeaponKind,
        current_ammo: u32,
        max_ammo: u32,
        is_reloading: bool,
        can_shoot: bool,
    },

    RollStarted {
        player_id: PlayerId,
        direction: Vec2,
    },

    RollEnded {
        player_id: PlayerId,
        reason: RollEnd,
    },

    PickupConfirmed {
        player_id: PlayerId,
        crate_id: String,
        weapon: WeaponKind,
        respawn_in_ms: u64,
    },

    CrateRespawned {
        crate_id: String,
        weapon: WeaponKind,
        position: Vec2,
    },
}

/// Per-player result at match end
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalScore {
    pub player_id: PlayerId,
    pub kills: u32,
    pub deaths: u32,
    pub xp: u32,
}

/// Who an outbound message is for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipient {
    Room,
    Player(PlayerId),
}

/// Outbound message on a match's broadcast channel
#[derive(Debug, Clone)]
pub struct Envelope {
    pub recipient: Recipient,
    pub msg: ServerMsg,
}

impl Envelope {
    pub fn room(msg: ServerMsg) -> Self {
        Self {
            recipient: Recipient::Room,
            msg,
        }
    }

    pub fn to(player_id: impl Into<PlayerId>, msg: ServerMsg) -> Self {
        Self {
            recipient: Recipient::Player(player_id.into()),
            msg,
        }
    }

    /// Whether the given connection should receive this message
    pub fn is_for(&self, player_id: &str) -> bool {
        match &self.recipient {
            Recipient::Room => true,
            Recipient::Player(id) => id == player_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_messages_are_tagged() {
        let msg: ClientMsg =
            serde_json::from_str(r#"{"type":"input","up":true,"aim_angle":1.5}"#).unwrap();
        match msg {
            ClientMsg::Input { up, down, aim_angle, seq, .. } => {
                assert!(up);
                assert!(!down);
                assert_eq!(aim_angle, 1.5);
                assert_eq!(seq, 0);
            }
            other => panic!("unexpected {other:?}"),
        }

        let pickup: ClientMsg =
            serde_json::from_str(r#"{"type":"pickup_attempt","crate_id":"crate_uzi_0"}"#).unwrap();
        assert!(matches!(pickup, ClientMsg::PickupAttempt { crate_id } if crate_id == "crate_uzi_0"));

        let roll: ClientMsg = serde_json::from_str(r#"{"type":"dodge_roll"}"#).unwrap();
        assert!(matches!(roll, ClientMsg::DodgeRoll));
    }

    #[test]
    fn rejection_reasons_serialize_snake_case() {
        let json = serde_json::to_value(ServerMsg::ShootFailed {
            reason: ShootRejection::Empty,
        })
        .unwrap();
        assert_eq!(json["type"], "shoot_failed");
        assert_eq!(json["reason"], "empty");
    }

    #[test]
    fn events_carry_event_type() {
        let json = serde_json::to_value(ServerMsg::Event {
            tick: 7,
            event: GameEvent::Death {
                victim_id: "b".into(),
                attacker_id: "a".into(),
            },
        })
        .unwrap();
        assert_eq!(json["type"], "event");
        assert_eq!(json["event"]["event_type"], "death");
    }

    #[test]
    fn envelope_filtering() {
        let room = Envelope::room(ServerMsg::MatchTimer { remaining_secs: 3 });
        let direct = Envelope::to("a", ServerMsg::ReloadFailed {
            reason: ReloadRejection::MagazineFull,
        });
        assert!(room.is_for("a") && room.is_for("b"));
        assert!(direct.is_for("a"));
        assert!(!direct.is_for("b"));
    }
}
