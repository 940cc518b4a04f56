//! Authoritative simulation for one match
//!
//! [`Simulation`] is the only writer of player, weapon, projectile, crate and
//! match state. Intents are applied between ticks; [`Simulation::tick`] then
//! advances everything in a fixed order:
//!
//! 1. movement and dodge rolls
//! 2. projectile advance
//! 3. hit detection and kill credit
//! 4. reload completion
//! 5. respawns
//! 6. roll expiry
//! 7. invulnerability expiry
//! 8. health regeneration
//! 9. crate respawns
//!
//! followed by the match end check. Every step tolerates players that died or
//! left earlier in the same tick.

use std::collections::BTreeMap;
use std::mem;
use std::time::Duration;

use tracing::{debug, info};
use uuid::Uuid;

use crate::config::MatchConfig;
use crate::util::time::{as_millis, tick_delta, SharedClock};
use crate::ws::protocol::{Envelope, GameEvent, ServerMsg};

use super::combat::{
    damage_falloff, CombatSystem, ReloadRejection, ShootRejection, WeaponKind, WeaponState,
};
use super::physics::{Arena, PhysicsSystem, Vec2};
use super::pickup::{CrateManager, PickupRejection};
use super::projectile::{ProjectileId, ProjectileManager, ProjectileSpec};
use super::r#match::{Match, MatchError};
use super::snapshot::{SnapshotBuilder, WorldSnapshot};
use super::world::{MoveInput, PlayerState, RollEnd, RollRejection, World};
use super::{Intent, IntentKind, PlayerId};

pub struct Simulation {
    id: Uuid,
    config: MatchConfig,
    clock: SharedClock,
    tick: u64,
    dt: f32,
    world: World,
    weapons: BTreeMap<PlayerId, WeaponState>,
    projectiles: ProjectileManager,
    crates: CrateManager,
    game_match: Match,
    outbox: Vec<Envelope>,
}

impl Simulation {
    pub fn new(id: Uuid, config: MatchConfig, clock: SharedClock, seed: u64) -> Self {
        let arena = Arena::new(config.arena_width, config.arena_height);
        let tuning = &config.tuning;
        let crates = if config.pickups_enabled {
            CrateManager::with_default_spawns(&arena, tuning.crate_respawn)
        } else {
            CrateManager::new(tuning.crate_respawn)
        };

        Self {
            id,
            tick: 0,
            dt: tick_delta(config.tick_rate),
            world: World::new(arena, tuning, seed),
            weapons: BTreeMap::new(),
            projectiles: ProjectileManager::new(arena, tuning.projectile_lifetime),
            crates,
            game_match: Match::new(&config),
            outbox: Vec::new(),
            clock,
            config,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn now(&self) -> Duration {
        self.clock.now()
    }

    pub fn tick_count(&self) -> u64 {
        self.tick
    }

    pub fn config(&self) -> &MatchConfig {
        &self.config
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn weapon(&self, player_id: &str) -> Option<&WeaponState> {
        self.weapons.get(player_id)
    }

    pub fn projectiles(&self) -> &ProjectileManager {
        &self.projectiles
    }

    pub fn crates(&self) -> &CrateManager {
        &self.crates
    }

    pub fn game_match(&self) -> &Match {
        &self.game_match
    }

    /// Join at a balanced spawn point
    pub fn add_player(&mut self, id: PlayerId) -> Result<&PlayerState, MatchError> {
        self.admit(id, None)
    }

    /// Join at a fixed position
    pub fn add_player_at(&mut self, id: PlayerId, position: Vec2) -> Result<&PlayerState, MatchError> {
        self.admit(id, Some(position))
    }

    fn admit(&mut self, id: PlayerId, position: Option<Vec2>) -> Result<&PlayerState, MatchError> {
        if self.game_match.is_ended() {
            return Err(MatchError::Ended);
        }
        if self.world.contains(&id) {
            return Err(MatchError::AlreadyJoined(id));
        }
        if self.world.len() >= self.config.max_players {
            return Err(MatchError::MatchFull);
        }

        let now = self.now();
        match position {
            Some(pos) => self.world.add_player_at(id.clone(), pos, now),
            None => self.world.add_player(id.clone(), now),
        };
        self.weapons.insert(id.clone(), WeaponState::default());

        info!(
            match_id = %self.id,
            player_id = %id,
            player_count = self.world.len(),
            "Player joined match"
        );

        let joined = self.joined_message(&id);
        self.send_to(&id, joined);
        self.broadcast(ServerMsg::PlayerJoined {
            player_id: id.clone(),
        });
        self.emit_weapon_state(&id);

        if self.world.len() >= self.config.min_players && self.game_match.start(now) {
            info!(match_id = %self.id, tick = self.tick, "Match active");
            self.broadcast(ServerMsg::MatchStarted { tick: self.tick });
        }

        self.world
            .get(&id)
            .ok_or(MatchError::UnknownPlayer(id))
    }

    fn joined_message(&self, id: &str) -> ServerMsg {
        ServerMsg::MatchJoined {
            match_id: self.id,
            player_id: id.to_string(),
            kill_target: self.config.kill_target,
            time_limit_secs: self.config.time_limit.as_secs(),
            arena_width: self.config.arena_width,
            arena_height: self.config.arena_height,
            players: self.world.ids(),
            crates: self.crates.all().cloned().collect(),
        }
    }

    /// Remove a player and everything it owns. False for an unknown id.
    pub fn remove_player(&mut self, id: &str) -> bool {
        if self.world.remove_player(id).is_none() {
            return false;
        }
        self.weapons.remove(id);
        info!(match_id = %self.id, player_id = %id, "Player left match");
        self.broadcast(ServerMsg::PlayerLeft {
            player_id: id.to_string(),
            reason: "disconnected".to_string(),
        });
        true
    }

    /// Apply one queued intent. Once the match ended only leaving is applied
    /// and a late join is answered with an error.
    pub fn apply_intent(&mut self, intent: Intent) {
        let Intent {
            player_id, kind, ..
        } = intent;

        if self.game_match.is_ended() && !matches!(kind, IntentKind::Leave | IntentKind::Join) {
            debug!(match_id = %self.id, player_id = %player_id, "Intent after match end ignored");
            return;
        }

        match kind {
            IntentKind::Join => {
                if let Err(e) = self.add_player(player_id.clone()) {
                    debug!(match_id = %self.id, player_id = %player_id, error = %e, "Join refused");
                    let code = match e {
                        MatchError::MatchFull => "match_full",
                        MatchError::AlreadyJoined(_) => "already_joined",
                        MatchError::Ended => "match_ended",
                        MatchError::UnknownPlayer(_) => "unknown_player",
                    };
                    self.send_to(
                        &player_id,
                        ServerMsg::Error {
                            code: code.to_string(),
                            message: e.to_string(),
                        },
                    );
                }
            }
            IntentKind::Leave => {
                self.remove_player(&player_id);
            }
            IntentKind::Move(input) => self.set_input(&player_id, input),
            IntentKind::Shoot { aim_angle } => {
                let _ = self.shoot(&player_id, aim_angle);
            }
            IntentKind::Reload => {
                let _ = self.reload(&player_id);
            }
            IntentKind::DodgeRoll => {
                let _ = self.dodge_roll(&player_id);
            }
            IntentKind::Pickup { crate_id } => {
                let _ = self.pickup(&player_id, &crate_id);
            }
        }
    }

    fn set_input(&mut self, player_id: &str, input: MoveInput) {
        match self.world.get_mut(player_id) {
            // Out-of-order frames are dropped
            Some(player) if input.seq >= player.input.seq => {
                player.input = input;
                if player.is_alive() {
                    player.aim_angle = input.aim_angle;
                }
            }
            Some(_) => {}
            None => debug!(player_id = %player_id, "Input for unknown player ignored"),
        }
    }

    /// Fire or swing. Rejections are reported to the shooter.
    pub fn shoot(&mut self, player_id: &str, aim_angle: f32) -> Result<(), ShootRejection> {
        let result = self.try_shoot(player_id, aim_angle);
        match result {
            Err(ShootRejection::NoPlayer) => {
                debug!(player_id = %player_id, "Shoot from unknown player ignored");
            }
            Err(reason) => {
                debug!(player_id = %player_id, ?reason, "Shot rejected");
                self.send_to(player_id, ServerMsg::ShootFailed { reason });
                if reason == ShootRejection::Empty {
                    self.emit_weapon_state(player_id);
                }
            }
            Ok(()) => {}
        }
        result
    }

    fn try_shoot(&mut self, player_id: &str, aim_angle: f32) -> Result<(), ShootRejection> {
        let now = self.now();
        let player = self
            .world
            .get_mut(player_id)
            .ok_or(ShootRejection::NoPlayer)?;
        if player.is_dead() {
            return Err(ShootRejection::Dead);
        }
        player.aim_angle = aim_angle;
        let origin = player.position;

        let weapon_state = self
            .weapons
            .get_mut(player_id)
            .ok_or(ShootRejection::NoPlayer)?;
        weapon_state.try_fire(now)?;
        let weapon = *weapon_state.weapon();

        if weapon.is_melee() {
            self.resolve_melee(player_id, aim_angle, now);
        } else {
            for (angle, damage) in CombatSystem::pellet_spread(&weapon, aim_angle) {
                let projectile = self.projectiles.spawn(
                    ProjectileSpec {
                        owner_id: player_id.to_string(),
                        weapon: weapon.kind,
                        position: origin,
                        velocity: CombatSystem::projectile_velocity(&weapon, angle),
                        damage,
                        max_range: weapon.range,
                    },
                    now,
                );
                let event = GameEvent::ProjectileSpawned {
                    projectile_id: projectile.id,
                    owner_id: projectile.owner_id.clone(),
                    weapon: projectile.weapon,
                    position: projectile.position,
                    velocity: projectile.velocity,
                };
                self.emit(event);
            }
            self.emit_weapon_state(player_id);
        }
        Ok(())
    }

    fn resolve_melee(&mut self, attacker_id: &str, aim_angle: f32, now: Duration) {
        let Some(weapon) = self.weapons.get(attacker_id).map(|w| *w.weapon()) else {
            return;
        };
        let victims = CombatSystem::melee_targets(
            &self.world,
            attacker_id,
            &weapon,
            now,
            self.config.tuning.roll_iframes,
        );
        let origin = self.world.get(attacker_id).map(|p| p.position);

        self.emit(GameEvent::MeleeSwing {
            attacker_id: attacker_id.to_string(),
            weapon: weapon.kind,
            aim_angle,
            victim_ids: victims.clone(),
        });

        for victim_id in &victims {
            self.apply_damage(attacker_id, victim_id, weapon.damage, None, now);
            if weapon.knockback > 0.0 {
                if let Some(origin) = origin {
                    self.knock_back(origin, victim_id, weapon.knockback);
                }
            }
        }
    }

    fn knock_back(&mut self, origin: Vec2, victim_id: &str, distance: f32) {
        let Some(position) = self
            .world
            .get(victim_id)
            .filter(|p| p.is_alive())
            .map(|p| p.position)
        else {
            return;
        };
        let pushed = self
            .world
            .clamp_to_arena(PhysicsSystem::knockback(origin, position, distance));
        if let Some(victim) = self.world.get_mut(victim_id) {
            victim.position = pushed;
        }
    }

    /// Start a manual reload. Rejections are reported to the requester.
    pub fn reload(&mut self, player_id: &str) -> Result<(), ReloadRejection> {
        let now = self.now();
        let result = match self.weapons.get_mut(player_id) {
            Some(weapon) => weapon.start_reload(now),
            None => Err(ReloadRejection::NoPlayer),
        };
        match result {
            Ok(()) => self.emit_weapon_state(player_id),
            Err(ReloadRejection::NoPlayer) => {
                debug!(player_id = %player_id, "Reload from unknown player ignored");
            }
            Err(reason) => {
                debug!(player_id = %player_id, ?reason, "Reload rejected");
                self.send_to(player_id, ServerMsg::ReloadFailed { reason });
            }
        }
        result
    }

    /// Start a dodge roll along the held direction, or the aim when standing
    /// still. Rejections are reported to the requester.
    pub fn dodge_roll(&mut self, player_id: &str) -> Result<(), RollRejection> {
        let now = self.now();
        let cooldown = self.config.tuning.roll_cooldown;
        let result = match self.world.get_mut(player_id) {
            Some(player) => player.check_roll(now, cooldown).map(|()| {
                let input = player.input;
                let direction = PhysicsSystem::roll_direction(
                    input.up,
                    input.down,
                    input.left,
                    input.right,
                    player.aim_angle,
                );
                player.start_roll(direction, now);
                direction
            }),
            None => Err(RollRejection::NoPlayer),
        };

        match result {
            Ok(direction) => {
                debug!(match_id = %self.id, player_id = %player_id, "Dodge roll started");
                self.emit(GameEvent::RollStarted {
                    player_id: player_id.to_string(),
                    direction,
                });
                Ok(())
            }
            Err(RollRejection::NoPlayer) => {
                debug!(player_id = %player_id, "Roll from unknown player ignored");
                Err(RollRejection::NoPlayer)
            }
            Err(reason) => {
                debug!(player_id = %player_id, ?reason, "Roll rejected");
                self.send_to(player_id, ServerMsg::RollFailed { reason });
                Err(reason)
            }
        }
    }

    /// Take the weapon from a crate. Rejections are reported to the requester.
    pub fn pickup(&mut self, player_id: &str, crate_id: &str) -> Result<WeaponKind, PickupRejection> {
        let result = self.try_pickup(player_id, crate_id);
        match result {
            Ok(weapon) => {
                info!(match_id = %self.id, player_id = %player_id, crate_id, %weapon, "Weapon picked up");
                self.emit(GameEvent::PickupConfirmed {
                    player_id: player_id.to_string(),
                    crate_id: crate_id.to_string(),
                    weapon,
                    respawn_in_ms: as_millis(self.config.tuning.crate_respawn),
                });
                self.emit_weapon_state(player_id);
            }
            Err(PickupRejection::NoPlayer) => {
                debug!(player_id = %player_id, "Pickup from unknown player ignored");
            }
            Err(reason) => {
                debug!(player_id = %player_id, crate_id, ?reason, "Pickup rejected");
                self.send_to(
                    player_id,
                    ServerMsg::PickupFailed {
                        crate_id: crate_id.to_string(),
                        reason,
                    },
                );
            }
        }
        result
    }

    fn try_pickup(&mut self, player_id: &str, crate_id: &str) -> Result<WeaponKind, PickupRejection> {
        let now = self.now();
        let player = self.world.get(player_id).ok_or(PickupRejection::NoPlayer)?;
        let crate_ = self.crates.get(crate_id).ok_or(PickupRejection::UnknownCrate)?;
        if player.is_dead() {
            return Err(PickupRejection::Dead);
        }
        if !crate_.is_available {
            return Err(PickupRejection::Unavailable);
        }
        if !PhysicsSystem::proximity(
            player.position,
            crate_.position,
            self.config.tuning.pickup_radius,
            crate_.is_available,
        ) {
            return Err(PickupRejection::OutOfRange);
        }

        let weapon = self.crates.take(crate_id, now)?.weapon;
        self.weapons
            .entry(player_id.to_string())
            .or_default()
            .replace(weapon);
        Ok(weapon)
    }

    /// Apply damage and handle the resulting death exactly once
    pub(crate) fn apply_damage(
        &mut self,
        attacker_id: &str,
        victim_id: &str,
        amount: u32,
        projectile_id: Option<ProjectileId>,
        now: Duration,
    ) {
        let Some(victim) = self.world.get_mut(victim_id) else {
            debug!(player_id = %victim_id, "Damage for unknown player ignored");
            return;
        };
        let applied = victim.take_damage(amount, now);
        if applied == 0 {
            return;
        }
        let new_health = victim.health;
        let died = new_health == 0 && victim.is_alive();
        if died {
            victim.mark_dead(now);
            victim.deaths += 1;
        }

        self.emit(GameEvent::Damaged {
            attacker_id: attacker_id.to_string(),
            victim_id: victim_id.to_string(),
            damage: applied,
            new_health,
            projectile_id,
        });

        if died {
            self.handle_death(attacker_id, victim_id);
        }
    }

    fn handle_death(&mut self, attacker_id: &str, victim_id: &str) {
        self.weapons
            .insert(victim_id.to_string(), WeaponState::default());
        self.emit(GameEvent::Death {
            victim_id: victim_id.to_string(),
            attacker_id: attacker_id.to_string(),
        });

        let kill_xp = self.config.tuning.kill_xp;
        let tick = self.tick;
        let credit = match self.world.get_mut(attacker_id) {
            Some(killer) if killer.id != victim_id => {
                killer.kills += 1;
                killer.xp += kill_xp;
                killer.last_kill_tick = Some(tick);
                Some((killer.kills, killer.xp))
            }
            _ => None,
        };

        if let Some((killer_kills, killer_xp)) = credit {
            info!(
                match_id = %self.id,
                killer_id = %attacker_id,
                victim_id = %victim_id,
                kills = killer_kills,
                "Kill credited"
            );
            self.emit(GameEvent::KillCredit {
                killer_id: attacker_id.to_string(),
                victim_id: victim_id.to_string(),
                killer_kills,
                killer_xp,
            });
        }
        self.emit_weapon_state(victim_id);
    }

    /// Advance one fixed step. Returns every message produced since the last tick.
    pub fn tick(&mut self) -> Vec<Envelope> {
        if !self.game_match.is_ended() {
            let now = self.now();
            self.update_movement();
            self.projectiles.update(self.dt, now);
            self.detect_hits(now);
            self.complete_reloads(now);
            self.respawn_players(now);
            self.expire_rolls(now);
            self.expire_invulnerability(now);
            self.regenerate(now);
            self.respawn_crates(now);
            self.check_match_end(now);
        }
        self.tick += 1;
        mem::take(&mut self.outbox)
    }

    fn update_movement(&mut self) {
        let dt = self.dt;
        let tuning = &self.config.tuning;
        let arena = *self.world.arena();
        let mut stopped = Vec::new();
        for player in self.world.players_mut() {
            if player.is_dead() {
                continue;
            }
            if let Some(roll) = player.roll {
                let (position, velocity, hit_wall) =
                    PhysicsSystem::step_roll(player.position, &roll, tuning, &arena, dt);
                player.position = position;
                player.velocity = velocity;
                if hit_wall {
                    player.end_roll();
                    stopped.push(player.id.clone());
                }
                continue;
            }
            let input = player.input;
            let direction = PhysicsSystem::input_direction(input.up, input.down, input.left, input.right);
            let (position, velocity) = PhysicsSystem::step_movement(
                player.position,
                player.velocity,
                direction,
                input.sprint,
                tuning,
                &arena,
                dt,
            );
            player.position = position;
            player.velocity = velocity;
        }
        for player_id in stopped {
            self.emit(GameEvent::RollEnded {
                player_id,
                reason: RollEnd::WallCollision,
            });
        }
    }

    fn detect_hits(&mut self, now: Duration) {
        let hitbox = self.world.hitbox();
        let iframes = self.config.tuning.roll_iframes;
        let in_flight: Vec<_> = self.projectiles.iter().cloned().collect();

        for projectile in in_flight {
            let victim_id = self
                .world
                .players()
                .find(|p| PhysicsSystem::projectile_hit_valid(&projectile, p, hitbox, now, iframes))
                .map(|p| p.id.clone());
            let Some(victim_id) = victim_id else {
                continue;
            };
            // Removed before damage so it can never hit twice
            if !self.projectiles.remove(projectile.id) {
                continue;
            }
            let damage = if self.config.damage_falloff {
                damage_falloff(projectile.damage, projectile.distance_travelled(), projectile.max_range)
            } else {
                projectile.damage
            };
            self.apply_damage(&projectile.owner_id, &victim_id, damage, Some(projectile.id), now);
        }
    }

    fn complete_reloads(&mut self, now: Duration) {
        let reloaded: Vec<PlayerId> = self
            .weapons
            .iter_mut()
            .filter_map(|(id, weapon)| weapon.check_reload_complete(now).then(|| id.clone()))
            .collect();
        for id in reloaded {
            self.emit_weapon_state(&id);
        }
    }

    fn respawn_players(&mut self, now: Duration) {
        let delay = self.config.tuning.respawn_delay;
        let due: Vec<PlayerId> = self
            .world
            .players()
            .filter(|p| p.can_respawn(now, delay))
            .map(|p| p.id.clone())
            .collect();

        for id in due {
            let spawn = self.world.balanced_spawn_point(Some(id.as_str()));
            let invulnerability = self.config.tuning.invulnerability;
            let Some(player) = self.world.get_mut(&id) else {
                continue;
            };
            player.respawn(spawn, now, invulnerability);
            let health = player.health;
            self.weapons.insert(id.clone(), WeaponState::default());

            debug!(match_id = %self.id, player_id = %id, "Player respawned");
            self.emit(GameEvent::Respawn {
                player_id: id.clone(),
                position: spawn,
                health,
            });
            self.emit_weapon_state(&id);
        }
    }

    fn expire_rolls(&mut self, now: Duration) {
        let duration = self.config.tuning.roll_duration;
        let mut finished = Vec::new();
        for player in self.world.players_mut() {
            let due = player
                .roll
                .is_some_and(|roll| now.saturating_sub(roll.started_at) >= duration);
            if due && player.end_roll() {
                finished.push(player.id.clone());
            }
        }
        for player_id in finished {
            self.emit(GameEvent::RollEnded {
                player_id,
                reason: RollEnd::Completed,
            });
        }
    }

    fn expire_invulnerability(&mut self, now: Duration) {
        for player in self.world.players_mut() {
            player.update_invulnerability(now);
        }
    }

    fn regenerate(&mut self, now: Duration) {
        let dt = self.dt;
        let tuning = &self.config.tuning;
        for player in self.world.players_mut() {
            player.apply_regeneration(now, dt, tuning);
        }
    }

    fn respawn_crates(&mut self, now: Duration) {
        if !self.config.pickups_enabled {
            return;
        }
        for crate_id in self.crates.update_respawns(now) {
            if let Some(c) = self.crates.get(&crate_id) {
                let event = GameEvent::CrateRespawned {
                    crate_id: c.id.clone(),
                    weapon: c.weapon,
                    position: c.position,
                };
                self.emit(event);
            }
        }
    }

    fn check_match_end(&mut self, now: Duration) {
        if let Some(reason) = self.game_match.check_end(now, &self.world) {
            info!(
                match_id = %self.id,
                ?reason,
                winners = ?self.game_match.winners(),
                "Match ended"
            );
            self.broadcast(ServerMsg::MatchEnded {
                reason,
                winners: self.game_match.winners().to_vec(),
                final_scores: self.game_match.final_scores().to_vec(),
            });
        }
    }

    /// Immutable copy of the current state for broadcasting
    pub fn snapshot(&self) -> WorldSnapshot {
        SnapshotBuilder::build(
            self.tick,
            &self.world,
            &self.weapons,
            &self.game_match,
            self.now(),
        )
    }

    fn emit(&mut self, event: GameEvent) {
        self.outbox.push(Envelope::room(ServerMsg::Event {
            tick: self.tick,
            event,
        }));
    }

    fn emit_weapon_state(&mut self, player_id: &str) {
        let now = self.now();
        let Some(weapon) = self.weapons.get(player_id) else {
            return;
        };
        let event = GameEvent::WeaponState {
            player_id: player_id.to_string(),
            weapon: weapon.kind(),
            current_ammo: weapon.ammo(),
            max_ammo: weapon.weapon().magazine_size,
            is_reloading: weapon.is_reloading(),
            can_shoot: weapon.can_fire(now),
        };
        let msg = ServerMsg::Event {
            tick: self.tick,
            event,
        };
        self.send_to(player_id, msg);
    }

    fn broadcast(&mut self, msg: ServerMsg) {
        self.outbox.push(Envelope::room(msg));
    }

    fn send_to(&mut self, player_id: &str, msg: ServerMsg) {
        self.outbox.push(Envelope::to(player_id, msg));
    }

    #[cfg(test)]
    pub(crate) fn world_mut(&mut self) -> &mut World {
        &mut self.world
    }

    #[cfg(test)]
    pub(crate) fn weapon_mut(&mut self, player_id: &str) -> Option<&mut WeaponState> {
        self.weapons.get_mut(player_id)
    }
}
