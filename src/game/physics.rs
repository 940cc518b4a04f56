//! Player movement, arena bounds and collision tests

use std::ops::{Add, AddAssign, Mul, Sub};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::Tuning;

use super::projectile::Projectile;
use super::world::{PlayerState, RollState};

/// 2D vector in arena pixels
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

impl Vec2 {
    pub const ZERO: Vec2 = Vec2 { x: 0.0, y: 0.0 };

    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Unit vector pointing along `angle` (radians, 0 = +x)
    pub fn from_angle(angle: f32) -> Self {
        Self::new(angle.cos(), angle.sin())
    }

    pub fn length(self) -> f32 {
        (self.x * self.x + self.y * self.y).sqrt()
    }

    /// Unit vector, or zero for a zero-length input
    pub fn normalized(self) -> Self {
        let len = self.length();
        if len == 0.0 {
            Self::ZERO
        } else {
            Self::new(self.x / len, self.y / len)
        }
    }

    pub fn is_zero(self) -> bool {
        self.x == 0.0 && self.y == 0.0
    }

    pub fn is_finite(self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

impl Add for Vec2 {
    type Output = Vec2;

    fn add(self, rhs: Vec2) -> Vec2 {
        Vec2::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl AddAssign for Vec2 {
    fn add_assign(&mut self, rhs: Vec2) {
        self.x += rhs.x;
        self.y += rhs.y;
    }
}

impl Sub for Vec2 {
    type Output = Vec2;

    fn sub(self, rhs: Vec2) -> Vec2 {
        Vec2::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl Mul<f32> for Vec2 {
    type Output = Vec2;

    fn mul(self, rhs: f32) -> Vec2 {
        Vec2::new(self.x * rhs, self.y * rhs)
    }
}

/// Rectangular arena with its origin at the top-left corner
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Arena {
    pub width: f32,
    pub height: f32,
}

impl Arena {
    pub fn new(width: f32, height: f32) -> Self {
        Self { width, height }
    }

    pub fn center(&self) -> Vec2 {
        Vec2::new(self.width / 2.0, self.height / 2.0)
    }

    pub fn contains(&self, p: Vec2) -> bool {
        p.x >= 0.0 && p.x <= self.width && p.y >= 0.0 && p.y <= self.height
    }

    /// Clamp the center of a box so the whole box stays inside the arena
    pub fn clamp_box(&self, p: Vec2, half_width: f32, half_height: f32) -> Vec2 {
        Vec2::new(
            p.x.max(half_width).min(self.width - half_width),
            p.y.max(half_height).min(self.height - half_height),
        )
    }
}

/// Player hitbox extents
#[derive(Debug, Clone, Copy)]
pub struct Hitbox {
    pub half_width: f32,
    pub half_height: f32,
}

impl Hitbox {
    pub fn from_tuning(tuning: &Tuning) -> Self {
        Self {
            half_width: tuning.hitbox_width / 2.0,
            half_height: tuning.hitbox_height / 2.0,
        }
    }
}

/// Stateless movement and collision helpers
pub struct PhysicsSystem;

impl PhysicsSystem {
    /// Euclidean distance
    pub fn distance(a: Vec2, b: Vec2) -> f32 {
        (b - a).length()
    }

    /// Strict axis-aligned box test, a point exactly on the edge misses
    pub fn aabb_hit(point: Vec2, center: Vec2, half_width: f32, half_height: f32) -> bool {
        (point.x - center.x).abs() < half_width && (point.y - center.y).abs() < half_height
    }

    /// Pickup reach test. An unavailable target is never in reach.
    pub fn proximity(a: Vec2, b: Vec2, radius: f32, available: bool) -> bool {
        available && Self::distance(a, b) <= radius
    }

    /// Whether a projectile is still within its weapon's reach
    pub fn within_range(spawn: Vec2, current: Vec2, max_range: f32) -> bool {
        Self::distance(spawn, current) <= max_range
    }

    /// Whether `projectile` may damage `target` this tick
    pub fn projectile_hit_valid(
        projectile: &Projectile,
        target: &PlayerState,
        hitbox: Hitbox,
        now: Duration,
        roll_iframes: Duration,
    ) -> bool {
        target.is_alive()
            && !target.is_invulnerable
            && !target.is_roll_invincible(now, roll_iframes)
            && projectile.owner_id != target.id
            && projectile.distance_travelled() <= projectile.max_range
            && Self::aabb_hit(
                projectile.position,
                target.position,
                hitbox.half_width,
                hitbox.half_height,
            )
    }

    /// Normalized direction from WASD-style flags (screen y grows downward)
    pub fn input_direction(up: bool, down: bool, left: bool, right: bool) -> Vec2 {
        let mut dir = Vec2::ZERO;
        if left {
            dir.x -= 1.0;
        }
        if right {
            dir.x += 1.0;
        }
        if up {
            dir.y -= 1.0;
        }
        if down {
            dir.y += 1.0;
        }
        dir.normalized()
    }

    /// Move `current` toward `target` by at most `accel * dt`, snapping when close
    pub fn accelerate_toward(current: Vec2, target: Vec2, accel: f32, dt: f32) -> Vec2 {
        let diff = target - current;
        let max_change = accel * dt;
        let dist = diff.length();
        if dist <= max_change {
            return target;
        }
        current + diff * (max_change / dist)
    }

    /// Advance one player's kinematics for one tick.
    /// Returns `(position, velocity)`.
    pub fn step_movement(
        position: Vec2,
        velocity: Vec2,
        direction: Vec2,
        sprint: bool,
        tuning: &Tuning,
        arena: &Arena,
        dt: f32,
    ) -> (Vec2, Vec2) {
        let speed = if sprint {
            tuning.sprint_speed
        } else {
            tuning.move_speed
        };
        let new_velocity = if direction.is_zero() {
            Self::accelerate_toward(velocity, Vec2::ZERO, tuning.deceleration, dt)
        } else {
            Self::accelerate_toward(velocity, direction * speed, tuning.acceleration, dt)
        };
        let new_velocity = Self::sanitize(new_velocity, "player velocity");

        let hitbox = Hitbox::from_tuning(tuning);
        let moved = arena.clamp_box(
            position + new_velocity * dt,
            hitbox.half_width,
            hitbox.half_height,
        );
        (Self::sanitize(moved, "player position"), new_velocity)
    }

    /// Advance a rolling player at the fixed roll speed.
    /// Returns `(position, velocity, hit_wall)`; a roll that hits the arena
    /// edge should end.
    pub fn step_roll(
        position: Vec2,
        roll: &RollState,
        tuning: &Tuning,
        arena: &Arena,
        dt: f32,
    ) -> (Vec2, Vec2, bool) {
        let velocity = Self::sanitize(roll.direction * tuning.roll_speed, "roll velocity");
        let hitbox = Hitbox::from_tuning(tuning);
        let target = position + velocity * dt;
        let moved = arena.clamp_box(target, hitbox.half_width, hitbox.half_height);
        let hit_wall = moved != target;
        (Self::sanitize(moved, "roll position"), velocity, hit_wall)
    }

    /// Unit roll direction: the held movement keys, or the aim when standing still
    pub fn roll_direction(up: bool, down: bool, left: bool, right: bool, aim_angle: f32) -> Vec2 {
        let dir = Self::input_direction(up, down, left, right);
        if dir.is_zero() {
            Vec2::from_angle(aim_angle)
        } else {
            dir
        }
    }

    /// Replace NaN/infinite components with zero
    pub fn sanitize(v: Vec2, context: &str) -> Vec2 {
        if v.is_finite() {
            return v;
        }
        let fixed = Vec2::new(
            if v.x.is_finite() { v.x } else { 0.0 },
            if v.y.is_finite() { v.y } else { 0.0 },
        );
        warn!(context, from = ?v, to = ?fixed, "Sanitized non-finite vector");
        fixed
    }

    /// Whether `target` lies within `range` of `origin` and inside the
    /// `arc_degrees` cone centered on `aim`
    pub fn in_melee_arc(origin: Vec2, aim: f32, target: Vec2, range: f32, arc_degrees: f32) -> bool {
        let offset = target - origin;
        let dist = offset.length();
        if dist > range {
            return false;
        }
        if dist == 0.0 {
            return true;
        }
        let bearing = offset.y.atan2(offset.x);
        let delta = Self::angle_between(bearing, aim);
        delta <= (arc_degrees / 2.0).to_radians()
    }

    /// Smallest absolute difference between two angles, in radians
    pub fn angle_between(a: f32, b: f32) -> f32 {
        let diff = (a - b).rem_euclid(std::f32::consts::TAU);
        diff.min(std::f32::consts::TAU - diff)
    }

    /// Push `target` `distance` px directly away from `origin`
    pub fn knockback(origin: Vec2, target: Vec2, distance: f32) -> Vec2 {
        let dir = (target - origin).normalized();
        target + dir * distance
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::FRAC_PI_2;

    use crate::game::combat::WeaponKind;

    const NOW: Duration = Duration::ZERO;
    const IFRAMES: Duration = Duration::from_millis(200);

    fn arena() -> Arena {
        Arena::new(1920.0, 1080.0)
    }

    fn projectile_at(owner: &str, position: Vec2) -> Projectile {
        Projectile {
            id: 1,
            owner_id: owner.into(),
            weapon: WeaponKind::Pistol,
            spawn_position: Vec2::new(100.0, 500.0),
            position,
            velocity: Vec2::new(800.0, 0.0),
            damage: 25,
            max_range: 800.0,
            spawned_at: Duration::ZERO,
        }
    }

    #[test]
    fn projectile_never_hits_its_owner() {
        let hitbox = Hitbox::from_tuning(&Tuning::default());
        let owner = PlayerState::new("a".into(), Vec2::new(100.0, 500.0), Duration::ZERO);
        let projectile = projectile_at("a", Vec2::new(100.0, 500.0));
        assert!(!PhysicsSystem::projectile_hit_valid(&projectile, &owner, hitbox, NOW, IFRAMES));

        let other = PlayerState::new("b".into(), Vec2::new(100.0, 500.0), Duration::ZERO);
        assert!(PhysicsSystem::projectile_hit_valid(&projectile, &other, hitbox, NOW, IFRAMES));
    }

    #[test]
    fn projectile_ignores_dead_and_invulnerable_targets() {
        let hitbox = Hitbox::from_tuning(&Tuning::default());
        let projectile = projectile_at("a", Vec2::new(300.0, 500.0));

        let mut dead = PlayerState::new("b".into(), Vec2::new(300.0, 500.0), Duration::ZERO);
        dead.mark_dead(Duration::ZERO);
        assert!(!PhysicsSystem::projectile_hit_valid(&projectile, &dead, hitbox, NOW, IFRAMES));

        let mut shielded = PlayerState::new("c".into(), Vec2::new(300.0, 500.0), Duration::ZERO);
        shielded.respawn(Vec2::new(300.0, 500.0), Duration::ZERO, Duration::from_secs(2));
        assert!(!PhysicsSystem::projectile_hit_valid(&projectile, &shielded, hitbox, NOW, IFRAMES));
    }

    #[test]
    fn projectile_past_range_is_invalid() {
        let hitbox = Hitbox::from_tuning(&Tuning::default());
        let projectile = projectile_at("a", Vec2::new(950.0, 500.0));
        let target = PlayerState::new("b".into(), Vec2::new(950.0, 500.0), Duration::ZERO);
        assert!(!PhysicsSystem::projectile_hit_valid(&projectile, &target, hitbox, NOW, IFRAMES));
    }

    #[test]
    fn aabb_edges_are_exclusive() {
        let center = Vec2::new(200.0, 500.0);
        assert!(PhysicsSystem::aabb_hit(Vec2::new(190.0, 470.0), center, 16.0, 32.0));
        assert!(!PhysicsSystem::aabb_hit(Vec2::new(216.0, 500.0), center, 16.0, 32.0));
        assert!(!PhysicsSystem::aabb_hit(Vec2::new(200.0, 532.0), center, 16.0, 32.0));
    }

    #[test]
    fn proximity_respects_availability() {
        let a = Vec2::new(0.0, 0.0);
        let b = Vec2::new(30.0, 0.0);
        assert!(PhysicsSystem::proximity(a, b, 32.0, true));
        assert!(!PhysicsSystem::proximity(a, b, 32.0, false));
        assert!(!PhysicsSystem::proximity(a, Vec2::new(33.0, 0.0), 32.0, true));
    }

    #[test]
    fn diagonal_input_is_normalized() {
        let dir = PhysicsSystem::input_direction(true, false, false, true);
        assert!((dir.length() - 1.0).abs() < 1e-6);
        assert!(dir.x > 0.0 && dir.y < 0.0);

        let none = PhysicsSystem::input_direction(true, true, true, true);
        assert!(none.is_zero());
    }

    #[test]
    fn acceleration_is_capped_per_step() {
        let v = PhysicsSystem::accelerate_toward(Vec2::ZERO, Vec2::new(200.0, 0.0), 50.0, 1.0);
        assert_eq!(v, Vec2::new(50.0, 0.0));

        let snapped =
            PhysicsSystem::accelerate_toward(Vec2::new(190.0, 0.0), Vec2::new(200.0, 0.0), 50.0, 1.0);
        assert_eq!(snapped, Vec2::new(200.0, 0.0));
    }

    #[test]
    fn movement_keeps_hitbox_inside_arena() {
        let tuning = Tuning::default();
        let (pos, _) = PhysicsSystem::step_movement(
            Vec2::new(5.0, 5.0),
            Vec2::new(-500.0, -500.0),
            Vec2::new(-1.0, 0.0),
            false,
            &tuning,
            &arena(),
            1.0,
        );
        assert_eq!(pos, Vec2::new(16.0, 32.0));
    }

    #[test]
    fn movement_sanitizes_nan() {
        let tuning = Tuning::default();
        let (pos, vel) = PhysicsSystem::step_movement(
            Vec2::new(100.0, 100.0),
            Vec2::new(f32::NAN, 0.0),
            Vec2::ZERO,
            false,
            &tuning,
            &arena(),
            1.0 / 60.0,
        );
        assert!(pos.is_finite());
        assert!(vel.is_finite());
    }

    #[test]
    fn sprint_raises_top_speed() {
        let tuning = Tuning::default();
        let right = Vec2::new(1.0, 0.0);
        let near_walk = Vec2::new(199.0, 0.0);
        let (_, walking) =
            PhysicsSystem::step_movement(Vec2::new(500.0, 500.0), near_walk, right, false, &tuning, &arena(), 1.0);
        let (_, sprinting) =
            PhysicsSystem::step_movement(Vec2::new(500.0, 500.0), near_walk, right, true, &tuning, &arena(), 1.0);
        assert_eq!(walking, Vec2::new(200.0, 0.0));
        assert_eq!(sprinting, Vec2::new(249.0, 0.0));
    }

    #[test]
    fn roll_moves_at_roll_speed_and_stops_at_walls() {
        let tuning = Tuning::default();
        let roll = RollState {
            direction: Vec2::new(1.0, 0.0),
            started_at: Duration::ZERO,
        };
        let (pos, vel, hit_wall) =
            PhysicsSystem::step_roll(Vec2::new(500.0, 500.0), &roll, &tuning, &arena(), 0.1);
        assert_eq!(vel, Vec2::new(250.0, 0.0));
        assert!((pos.x - 525.0).abs() < 1e-3);
        assert!(!hit_wall);

        let (pos, _, hit_wall) =
            PhysicsSystem::step_roll(Vec2::new(1900.0, 500.0), &roll, &tuning, &arena(), 0.1);
        assert_eq!(pos.x, 1904.0);
        assert!(hit_wall);
    }

    #[test]
    fn roll_direction_falls_back_to_aim() {
        let aimed = PhysicsSystem::roll_direction(false, false, false, false, FRAC_PI_2);
        assert!(aimed.x.abs() < 1e-6 && (aimed.y - 1.0).abs() < 1e-6);
        let keyed = PhysicsSystem::roll_direction(false, false, true, false, FRAC_PI_2);
        assert_eq!(keyed, Vec2::new(-1.0, 0.0));
    }

    #[test]
    fn rolling_target_dodges_early_projectiles() {
        let hitbox = Hitbox::from_tuning(&Tuning::default());
        let projectile = projectile_at("a", Vec2::new(300.0, 500.0));
        let mut target = PlayerState::new("b".into(), Vec2::new(300.0, 500.0), Duration::ZERO);
        target.start_roll(Vec2::new(0.0, 1.0), Duration::ZERO);

        assert!(!PhysicsSystem::projectile_hit_valid(&projectile, &target, hitbox, Duration::from_millis(150), IFRAMES));
        assert!(PhysicsSystem::projectile_hit_valid(&projectile, &target, hitbox, Duration::from_millis(250), IFRAMES));
    }

    #[test]
    fn melee_arc_checks_bearing_and_range() {
        let origin = Vec2::new(100.0, 100.0);
        // 90 degree cone facing +x
        assert!(PhysicsSystem::in_melee_arc(origin, 0.0, Vec2::new(150.0, 120.0), 64.0, 90.0));
        assert!(!PhysicsSystem::in_melee_arc(origin, 0.0, Vec2::new(100.0, 150.0), 64.0, 90.0));
        assert!(!PhysicsSystem::in_melee_arc(origin, 0.0, Vec2::new(200.0, 100.0), 64.0, 90.0));
        assert!(PhysicsSystem::in_melee_arc(origin, FRAC_PI_2, Vec2::new(100.0, 150.0), 64.0, 90.0));
    }

    #[test]
    fn angle_between_wraps() {
        let d = PhysicsSystem::angle_between(0.1, std::f32::consts::TAU - 0.1);
        assert!((d - 0.2).abs() < 1e-5);
    }

    #[test]
    fn knockback_pushes_away() {
        let pushed = PhysicsSystem::knockback(Vec2::new(0.0, 0.0), Vec2::new(10.0, 0.0), 40.0);
        assert_eq!(pushed, Vec2::new(50.0, 0.0));
    }
}
