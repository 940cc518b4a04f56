//! Weapon crates placed around the arena

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::combat::WeaponKind;
use super::physics::{Arena, Vec2};

/// A crate granting a weapon on pickup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeaponCrate {
    pub id: String,
    pub position: Vec2,
    pub weapon: WeaponKind,
    pub is_available: bool,
    #[serde(skip)]
    pub respawn_at: Option<Duration>,
}

/// Why a pickup intent was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PickupRejection {
    UnknownCrate,
    Unavailable,
    OutOfRange,
    Dead,
    NoPlayer,
}

/// Default layout as fractions of the arena size
const DEFAULT_LAYOUT: [(WeaponKind, f32, f32); 5] = [
    (WeaponKind::Uzi, 0.50, 0.20),
    (WeaponKind::Ak47, 0.25, 0.50),
    (WeaponKind::Shotgun, 0.75, 0.50),
    (WeaponKind::Katana, 0.50, 0.80),
    (WeaponKind::Bat, 0.15, 0.15),
];

/// Tracks crate availability and respawn timers
#[derive(Debug, Default)]
pub struct CrateManager {
    crates: BTreeMap<String, WeaponCrate>,
    respawn_delay: Duration,
}

impl CrateManager {
    pub fn new(respawn_delay: Duration) -> Self {
        Self {
            crates: BTreeMap::new(),
            respawn_delay,
        }
    }

    pub fn with_default_spawns(arena: &Arena, respawn_delay: Duration) -> Self {
        let mut manager = Self::new(respawn_delay);
        for (index, (weapon, fx, fy)) in DEFAULT_LAYOUT.into_iter().enumerate() {
            manager.insert(
                format!("crate_{}_{}", weapon, index),
                Vec2::new(arena.width * fx, arena.height * fy),
                weapon,
            );
        }
        manager
    }

    pub fn insert(&mut self, id: String, position: Vec2, weapon: WeaponKind) {
        self.crates.insert(
            id.clone(),
            WeaponCrate {
                id,
                position,
                weapon,
                is_available: true,
                respawn_at: None,
            },
        );
    }

    pub fn get(&self, id: &str) -> Option<&WeaponCrate> {
        self.crates.get(id)
    }

    pub fn all(&self) -> impl Iterator<Item = &WeaponCrate> {
        self.crates.values()
    }

    /// Mark a crate taken. Returns the crate as it now stands.
    pub fn take(&mut self, id: &str, now: Duration) -> Result<&WeaponCrate, PickupRejection> {
        let respawn_delay = self.respawn_delay;
        let crate_ = self.crates.get_mut(id).ok_or(PickupRejection::UnknownCrate)?;
        if !crate_.is_available {
            return Err(PickupRejection::Unavailable);
        }
        crate_.is_available = false;
        crate_.respawn_at = Some(now + respawn_delay);
        Ok(crate_)
    }

    /// Make due crates available again. Returns the ids that came back.
    pub fn update_respawns(&mut self, now: Duration) -> Vec<String> {
        let mut respawned = Vec::new();
        for crate_ in self.crates.values_mut() {
            if let Some(at) = crate_.respawn_at {
                if !crate_.is_available && now >= at {
                    crate_.is_available = true;
                    crate_.respawn_at = None;
                    debug!(crate_id = %crate_.id, "Weapon crate respawned");
                    respawned.push(crate_.id.clone());
                }
            }
        }
        respawned
    }

    pub fn len(&self) -> usize {
        self.crates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.crates.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> CrateManager {
        CrateManager::with_default_spawns(&Arena::new(1920.0, 1080.0), Duration::from_secs(30))
    }

    #[test]
    fn default_layout() {
        let m = manager();
        assert_eq!(m.len(), 5);
        let uzi = m.get("crate_uzi_0").expect("uzi crate");
        assert_eq!(uzi.position, Vec2::new(960.0, 216.0));
        assert_eq!(uzi.weapon, WeaponKind::Uzi);
        assert!(m.get("crate_bat_4").is_some());
        assert!(m.all().all(|c| c.is_available));
    }

    #[test]
    fn taken_crate_respawns_after_delay() {
        let mut m = manager();
        assert!(m.take("crate_ak47_1", Duration::from_secs(5)).is_ok());
        assert_eq!(
            m.take("crate_ak47_1", Duration::from_secs(6)).err(),
            Some(PickupRejection::Unavailable)
        );

        assert!(m.update_respawns(Duration::from_secs(34)).is_empty());
        assert_eq!(m.update_respawns(Duration::from_secs(35)), vec!["crate_ak47_1".to_string()]);
        assert!(m.get("crate_ak47_1").is_some_and(|c| c.is_available));
    }

    #[test]
    fn unknown_crate_is_rejected() {
        let mut m = manager();
        assert_eq!(
            m.take("crate_railgun_9", Duration::ZERO).err(),
            Some(PickupRejection::UnknownCrate)
        );
    }
}
