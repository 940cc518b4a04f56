//! Combat system - weapon table, firing/reload state machine, melee and damage

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::physics::{PhysicsSystem, Vec2};
use super::world::World;
use super::PlayerId;

/// Every weapon a player can hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeaponKind {
    #[default]
    Pistol,
    Bat,
    Katana,
    Uzi,
    Ak47,
    Shotgun,
}

impl WeaponKind {
    pub const ALL: [WeaponKind; 6] = [
        WeaponKind::Pistol,
        WeaponKind::Bat,
        WeaponKind::Katana,
        WeaponKind::Uzi,
        WeaponKind::Ak47,
        WeaponKind::Shotgun,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            WeaponKind::Pistol => "pistol",
            WeaponKind::Bat => "bat",
            WeaponKind::Katana => "katana",
            WeaponKind::Uzi => "uzi",
            WeaponKind::Ak47 => "ak47",
            WeaponKind::Shotgun => "shotgun",
        }
    }
}

impl fmt::Display for WeaponKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WeaponKind {
    type Err = WeaponError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        WeaponKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == lower)
            .ok_or_else(|| WeaponError::Unknown(s.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WeaponError {
    #[error("Unknown weapon type: {0}")]
    Unknown(String),
}

/// Static weapon stats
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Weapon {
    pub kind: WeaponKind,
    pub damage: u32,
    /// Shots (or swings) per second
    pub fire_rate: f32,
    /// Zero for melee weapons
    pub magazine_size: u32,
    pub reload_time: Duration,
    pub projectile_speed: f32,
    pub range: f32,
    /// Melee cone, or pellet spread for multi-pellet guns
    pub arc_degrees: f32,
    pub knockback: f32,
    /// Projectiles per shot; `damage` is split between them
    pub pellets: u32,
}

impl Weapon {
    pub fn for_kind(kind: WeaponKind) -> Self {
        match kind {
            WeaponKind::Pistol => Self {
                kind,
                damage: 25,
                fire_rate: 3.0,
                magazine_size: 15,
                reload_time: Duration::from_millis(1500),
                projectile_speed: 800.0,
                range: 800.0,
                arc_degrees: 0.0,
                knockback: 0.0,
                pellets: 1,
            },
            WeaponKind::Bat => Self {
                kind,
                damage: 25,
                fire_rate: 2.0,
                magazine_size: 0,
                reload_time: Duration::ZERO,
                projectile_speed: 0.0,
                range: 64.0,
                arc_degrees: 90.0,
                knockback: 40.0,
                pellets: 0,
            },
            WeaponKind::Katana => Self {
                kind,
                damage: 45,
                fire_rate: 1.25,
                magazine_size: 0,
                reload_time: Duration::ZERO,
                projectile_speed: 0.0,
                range: 80.0,
                arc_degrees: 90.0,
                knockback: 0.0,
                pellets: 0,
            },
            WeaponKind::Uzi => Self {
                kind,
                damage: 8,
                fire_rate: 10.0,
                magazine_size: 30,
                reload_time: Duration::from_millis(1500),
                projectile_speed: 800.0,
                range: 600.0,
                arc_degrees: 0.0,
                knockback: 0.0,
                pellets: 1,
            },
            WeaponKind::Ak47 => Self {
                kind,
                damage: 20,
                fire_rate: 6.0,
                magazine_size: 30,
                reload_time: Duration::from_millis(2000),
                projectile_speed: 800.0,
                range: 800.0,
                arc_degrees: 0.0,
                knockback: 0.0,
                pellets: 1,
            },
            WeaponKind::Shotgun => Self {
                kind,
                damage: 60,
                fire_rate: 1.0,
                magazine_size: 6,
                reload_time: Duration::from_millis(2500),
                projectile_speed: 800.0,
                range: 300.0,
                arc_degrees: 15.0,
                knockback: 0.0,
                pellets: 8,
            },
        }
    }

    pub fn is_melee(&self) -> bool {
        self.magazine_size == 0
    }

    /// Minimum time between two shots
    pub fn cooldown(&self) -> Duration {
        Duration::from_micros((1_000_000.0 / f64::from(self.fire_rate)).round() as u64)
    }
}

/// Why a shoot intent was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShootRejection {
    Empty,
    Cooldown,
    Reloading,
    Dead,
    /// Shooter is not in the match; logged, never sent
    NoPlayer,
}

/// Why a reload intent was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReloadRejection {
    AlreadyReloading,
    MagazineFull,
    Melee,
    NoPlayer,
}

/// A player's mutable hold on a weapon
#[derive(Debug, Clone)]
pub struct WeaponState {
    weapon: Weapon,
    current_ammo: u32,
    is_reloading: bool,
    last_shot_time: Option<Duration>,
    reload_start_time: Option<Duration>,
}

impl WeaponState {
    pub fn new(kind: WeaponKind) -> Self {
        let weapon = Weapon::for_kind(kind);
        Self {
            weapon,
            current_ammo: weapon.magazine_size,
            is_reloading: false,
            last_shot_time: None,
            reload_start_time: None,
        }
    }

    pub fn weapon(&self) -> &Weapon {
        &self.weapon
    }

    pub fn kind(&self) -> WeaponKind {
        self.weapon.kind
    }

    pub fn ammo(&self) -> u32 {
        self.current_ammo
    }

    pub fn is_reloading(&self) -> bool {
        self.is_reloading
    }

    /// Whether a shot at `now` would be accepted
    pub fn can_fire(&self, now: Duration) -> bool {
        self.check_fire(now).is_ok()
    }

    fn check_fire(&self, now: Duration) -> Result<(), ShootRejection> {
        if !self.weapon.is_melee() {
            if self.is_reloading {
                return Err(ShootRejection::Reloading);
            }
            if self.current_ammo == 0 {
                return Err(ShootRejection::Empty);
            }
        }
        match self.last_shot_time {
            Some(last) if now.saturating_sub(last) < self.weapon.cooldown() => {
                Err(ShootRejection::Cooldown)
            }
            _ => Ok(()),
        }
    }

    /// Attempt a shot. An empty ranged weapon starts reloading on its own.
    pub fn try_fire(&mut self, now: Duration) -> Result<(), ShootRejection> {
        match self.check_fire(now) {
            Ok(()) => {
                if !self.weapon.is_melee() {
                    self.current_ammo -= 1;
                }
                self.last_shot_time = Some(now);
                Ok(())
            }
            Err(ShootRejection::Empty) => {
                // Begin reloading; a melee or full weapon cannot reach this arm
                let _ = self.start_reload(now);
                Err(ShootRejection::Empty)
            }
            Err(reason) => Err(reason),
        }
    }

    pub fn start_reload(&mut self, now: Duration) -> Result<(), ReloadRejection> {
        if self.weapon.is_melee() {
            return Err(ReloadRejection::Melee);
        }
        if self.is_reloading {
            return Err(ReloadRejection::AlreadyReloading);
        }
        if self.current_ammo >= self.weapon.magazine_size {
            return Err(ReloadRejection::MagazineFull);
        }
        self.is_reloading = true;
        self.reload_start_time = Some(now);
        Ok(())
    }

    /// Finish a reload whose duration has elapsed. Returns true when it completed now.
    pub fn check_reload_complete(&mut self, now: Duration) -> bool {
        match self.reload_start_time {
            Some(started) if self.is_reloading && now.saturating_sub(started) >= self.weapon.reload_time => {
                self.current_ammo = self.weapon.magazine_size;
                self.is_reloading = false;
                self.reload_start_time = None;
                true
            }
            _ => false,
        }
    }

    /// Swap in a new weapon with a full magazine, cancelling any reload
    pub fn replace(&mut self, kind: WeaponKind) {
        *self = Self::new(kind);
    }

    #[cfg(test)]
    pub fn set_ammo(&mut self, ammo: u32) {
        self.current_ammo = ammo.min(self.weapon.magazine_size);
    }
}

impl Default for WeaponState {
    fn default() -> Self {
        Self::new(WeaponKind::default())
    }
}

/// Damage scaled by distance travelled: full to half range, then linear to zero
pub fn damage_falloff(base: u32, distance: f32, max_range: f32) -> u32 {
    if max_range <= 0.0 {
        return base;
    }
    let half = max_range / 2.0;
    if distance <= half {
        return base;
    }
    if distance >= max_range {
        return 0;
    }
    let factor = 1.0 - (distance - half) / half;
    (base as f32 * factor).round() as u32
}

/// Combat queries over world state
pub struct CombatSystem;

impl CombatSystem {
    /// Opponents a melee swing from `attacker_id` would connect with
    pub fn melee_targets(
        world: &World,
        attacker_id: &str,
        weapon: &Weapon,
        now: Duration,
        roll_iframes: Duration,
    ) -> Vec<PlayerId> {
        let Some(attacker) = world.get(attacker_id) else {
            return Vec::new();
        };
        world
            .players()
            .filter(|p| p.id != attacker.id && p.is_alive() && !p.is_invulnerable)
            .filter(|p| !p.is_roll_invincible(now, roll_iframes))
            .filter(|p| {
                PhysicsSystem::in_melee_arc(
                    attacker.position,
                    attacker.aim_angle,
                    p.position,
                    weapon.range,
                    weapon.arc_degrees,
                )
            })
            .map(|p| p.id.clone())
            .collect()
    }

    /// Projectile velocity for a shot along `aim_angle`
    pub fn projectile_velocity(weapon: &Weapon, aim_angle: f32) -> Vec2 {
        Vec2::from_angle(aim_angle) * weapon.projectile_speed
    }

    /// Aim angle and damage of every projectile in one shot.
    /// Pellets fan out evenly across `arc_degrees`; the weapon's damage is
    /// split between them with the remainder going to the first pellets.
    pub fn pellet_spread(weapon: &Weapon, aim_angle: f32) -> Vec<(f32, u32)> {
        let count = weapon.pellets.max(1);
        if count == 1 {
            return vec![(aim_angle, weapon.damage)];
        }
        let spread = weapon.arc_degrees.to_radians();
        let step = spread / (count - 1) as f32;
        let base = weapon.damage / count;
        let remainder = weapon.damage % count;
        (0..count)
            .map(|i| {
                let angle = aim_angle - spread / 2.0 + step * i as f32;
                let damage = base + u32::from(i < remainder);
                (angle, damage)
            })
            .collect()
    }
}
