//! In-flight projectiles

use std::time::Duration;

use tracing::debug;

use super::combat::WeaponKind;
use super::physics::{Arena, PhysicsSystem, Vec2};
use super::PlayerId;

pub type ProjectileId = u64;

/// A fired ranged shot
#[derive(Debug, Clone)]
pub struct Projectile {
    pub id: ProjectileId,
    pub owner_id: PlayerId,
    pub weapon: WeaponKind,
    pub spawn_position: Vec2,
    pub position: Vec2,
    pub velocity: Vec2,
    pub damage: u32,
    pub max_range: f32,
    pub spawned_at: Duration,
}

impl Projectile {
    pub fn distance_travelled(&self) -> f32 {
        PhysicsSystem::distance(self.spawn_position, self.position)
    }
}

/// Owns every projectile in one match, kept in spawn order
#[derive(Debug)]
pub struct ProjectileManager {
    projectiles: Vec<Projectile>,
    next_id: ProjectileId,
    max_lifetime: Duration,
    arena: Arena,
}

/// Parameters for a new projectile
#[derive(Debug, Clone)]
pub struct ProjectileSpec {
    pub owner_id: PlayerId,
    pub weapon: WeaponKind,
    pub position: Vec2,
    pub velocity: Vec2,
    pub damage: u32,
    pub max_range: f32,
}

impl ProjectileManager {
    pub fn new(arena: Arena, max_lifetime: Duration) -> Self {
        Self {
            projectiles: Vec::new(),
            next_id: 1,
            max_lifetime,
            arena,
        }
    }

    pub fn spawn(&mut self, spec: ProjectileSpec, now: Duration) -> &Projectile {
        let id = self.next_id;
        self.next_id += 1;
        self.projectiles.push(Projectile {
            id,
            owner_id: spec.owner_id,
            weapon: spec.weapon,
            spawn_position: spec.position,
            position: spec.position,
            velocity: spec.velocity,
            damage: spec.damage,
            max_range: spec.max_range,
            spawned_at: now,
        });
        &self.projectiles[self.projectiles.len() - 1]
    }

    /// Advance every projectile and drop the ones past their lifetime, range
    /// or the arena edge. Returns the ids removed.
    pub fn update(&mut self, dt: f32, now: Duration) -> Vec<ProjectileId> {
        let max_lifetime = self.max_lifetime;
        let arena = self.arena;
        let mut expired = Vec::new();

        self.projectiles.retain_mut(|p| {
            p.position += p.velocity * dt;
            let alive = now.saturating_sub(p.spawned_at) < max_lifetime
                && PhysicsSystem::within_range(p.spawn_position, p.position, p.max_range)
                && arena.contains(p.position);
            if !alive {
                expired.push(p.id);
            }
            alive
        });

        expired
    }

    /// Remove by id. Returns false if it was already gone.
    pub fn remove(&mut self, id: ProjectileId) -> bool {
        match self.projectiles.iter().position(|p| p.id == id) {
            Some(index) => {
                self.projectiles.remove(index);
                true
            }
            None => {
                debug!(projectile_id = id, "Remove for unknown projectile ignored");
                false
            }
        }
    }

    pub fn get(&self, id: ProjectileId) -> Option<&Projectile> {
        self.projectiles.iter().find(|p| p.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Projectile> {
        self.projectiles.iter()
    }

    pub fn len(&self) -> usize {
        self.projectiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.projectiles.is_empty()
    }
}
