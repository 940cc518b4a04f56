//! Configuration module - environment variable parsing and match tuning

use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    /// Server binding address
    pub server_addr: SocketAddr,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Allowed client origin for CORS (any origin when unset)
    pub client_origin: Option<String>,
    /// Short matches for local play-testing
    pub test_mode: bool,
    /// Rules every new match is created with
    pub match_config: MatchConfig,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Hosting platforms provide PORT, fall back to SERVER_ADDR or default
        let server_addr = if let Ok(port) = env::var("PORT") {
            format!("0.0.0.0:{}", port)
        } else {
            env::var("SERVER_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string())
        };

        let test_mode = parse_var::<bool>("TEST_MODE")?.unwrap_or(false);
        let mut match_config = if test_mode {
            MatchConfig::test_mode()
        } else {
            MatchConfig::default()
        };

        if let Some(kills) = parse_var("MATCH_KILL_TARGET")? {
            match_config.kill_target = kills;
        }
        if let Some(secs) = parse_var::<u64>("MATCH_TIME_LIMIT_SECS")? {
            match_config.time_limit = Duration::from_secs(secs);
        }
        if let Some(rate) = parse_var("TICK_RATE")? {
            match_config.tick_rate = rate;
        }
        if let Some(rate) = parse_var("BROADCAST_RATE")? {
            match_config.broadcast_rate = rate;
        }
        if let Some(min) = parse_var("MIN_PLAYERS")? {
            match_config.min_players = min;
        }
        if let Some(max) = parse_var("MAX_PLAYERS")? {
            match_config.max_players = max;
        }
        if let Some(policy) = parse_var("TIE_POLICY")? {
            match_config.tie_policy = policy;
        }
        if let Some(enabled) = parse_var("DAMAGE_FALLOFF")? {
            match_config.damage_falloff = enabled;
        }

        match_config.validate()?;

        Ok(Self {
            server_addr: server_addr
                .parse()
                .map_err(|_| ConfigError::InvalidAddress)?,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            client_origin: env::var("CLIENT_ORIGIN").ok().filter(|o| !o.is_empty()),
            test_mode,
            match_config,
        })
    }
}

fn parse_var<T: FromStr>(key: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
        Err(_) => Ok(None),
    }
}

/// How a match ending with several players tied on kills is resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TiePolicy {
    /// Every player tied on the top kill count wins
    #[default]
    ShareVictory,
    /// Only the tied player who reached the top count first wins
    FirstToReach,
}

impl FromStr for TiePolicy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "share_victory" | "share" => Ok(Self::ShareVictory),
            "first_to_reach" | "first" => Ok(Self::FirstToReach),
            _ => Err(()),
        }
    }
}

/// Per-match rules and rates
#[derive(Debug, Clone)]
pub struct MatchConfig {
    /// Kills needed to win
    pub kill_target: u32,
    /// Match length once active
    pub time_limit: Duration,
    pub arena_width: f32,
    pub arena_height: f32,
    /// Simulation ticks per second
    pub tick_rate: u32,
    /// World snapshots per second
    pub broadcast_rate: u32,
    /// Match timer messages per second
    pub timer_rate: u32,
    /// Players required before the match goes active
    pub min_players: usize,
    pub max_players: usize,
    pub pickups_enabled: bool,
    /// Scale projectile damage down past half range
    pub damage_falloff: bool,
    pub tie_policy: TiePolicy,
    /// How long an ended room stays open so clients receive final results
    pub end_grace_period: Duration,
    pub tuning: Tuning,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            kill_target: 20,
            time_limit: Duration::from_secs(420),
            arena_width: 1920.0,
            arena_height: 1080.0,
            tick_rate: 60,
            broadcast_rate: 20,
            timer_rate: 1,
            min_players: 2,
            max_players: 8,
            pickups_enabled: true,
            damage_falloff: false,
            tie_policy: TiePolicy::ShareVictory,
            end_grace_period: Duration::from_secs(10),
            tuning: Tuning::default(),
        }
    }
}

impl MatchConfig {
    /// Short matches used for local testing
    pub fn test_mode() -> Self {
        Self {
            kill_target: 2,
            time_limit: Duration::from_secs(10),
            ..Self::default()
        }
    }

    /// Reject combinations the simulation cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.kill_target == 0 {
            return Err(ConfigError::OutOfRange("MATCH_KILL_TARGET"));
        }
        if self.time_limit.is_zero() {
            return Err(ConfigError::OutOfRange("MATCH_TIME_LIMIT_SECS"));
        }
        if self.tick_rate == 0 || self.tick_rate > 240 {
            return Err(ConfigError::OutOfRange("TICK_RATE"));
        }
        if self.broadcast_rate == 0 || self.broadcast_rate > self.tick_rate {
            return Err(ConfigError::OutOfRange("BROADCAST_RATE"));
        }
        if self.min_players == 0 || self.min_players > self.max_players {
            return Err(ConfigError::OutOfRange("MIN_PLAYERS"));
        }
        if self.arena_width <= self.tuning.spawn_margin * 2.0
            || self.arena_height <= self.tuning.spawn_margin * 2.0
        {
            return Err(ConfigError::OutOfRange("arena size"));
        }
        if self.tuning.roll_iframes > self.tuning.roll_duration {
            return Err(ConfigError::OutOfRange("roll i-frames"));
        }
        Ok(())
    }
}

/// Gameplay constants shared by every match
#[derive(Debug, Clone)]
pub struct Tuning {
    pub respawn_delay: Duration,
    pub invulnerability: Duration,
    /// Time without damage before health regenerates
    pub regen_delay: Duration,
    /// Health per second while regenerating
    pub regen_rate: f32,
    pub pickup_radius: f32,
    pub crate_respawn: Duration,
    pub projectile_lifetime: Duration,
    /// Movement speeds are in px/s, acceleration and deceleration in px/s²
    pub move_speed: f32,
    pub sprint_speed: f32,
    pub acceleration: f32,
    pub deceleration: f32,
    /// Dodge roll speed in px/s
    pub roll_speed: f32,
    pub roll_duration: Duration,
    /// Measured from the start of the previous roll
    pub roll_cooldown: Duration,
    /// Opening part of a roll during which projectiles and swings pass through
    pub roll_iframes: Duration,
    pub hitbox_width: f32,
    pub hitbox_height: f32,
    pub spawn_margin: f32,
    pub spawn_candidates: usize,
    pub kill_xp: u32,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            respawn_delay: Duration::from_secs(3),
            invulnerability: Duration::from_secs(2),
            regen_delay: Duration::from_secs(5),
            regen_rate: 10.0,
            pickup_radius: 32.0,
            crate_respawn: Duration::from_secs(30),
            projectile_lifetime: Duration::from_secs(1),
            move_speed: 200.0,
            sprint_speed: 300.0,
            acceleration: 50.0,
            deceleration: 50.0,
            roll_speed: 250.0,
            roll_duration: Duration::from_millis(400),
            roll_cooldown: Duration::from_secs(3),
            roll_iframes: Duration::from_millis(200),
            hitbox_width: 32.0,
            hitbox_height: 64.0,
            spawn_margin: 100.0,
            spawn_candidates: 10,
            kill_xp: 100,
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid server address format")]
    InvalidAddress,

    #[error("Invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },

    #[error("Value out of range: {0}")]
    OutOfRange(&'static str),
}
