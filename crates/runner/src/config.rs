//! Runner configuration.
//!
//! Loaded from RON. Every field has a default, so a config file only needs to
//! name what it changes:
//!
//! ```text
//! (
//!     session_name: "Arena-2",
//!     movement: (speed: 7.5),
//!     despawn_policy: Retain,
//! )
//! ```

use std::path::Path;
use std::time::Duration;

use pilot_sim::MovementParams;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::{
    CONNECT_TIMEOUT_MS, DEFAULT_SESSION_NAME, DEFAULT_SPAWN_TAG, INPUT_LEAD_TICKS,
    MAX_FUTURE_TICKS, MAX_PEERS, TICK_RATE_HZ,
};

/// How the session is joined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GameMode {
    /// Create the session; fail if it already exists. The host also plays.
    Host,
    /// Join an existing session; fail if it does not exist.
    Client,
    /// Join the session if it exists, otherwise host it.
    AutoHostOrClient,
    /// Dedicated host: holds state authority but spawns no entity for itself.
    Server,
}

/// What the state authority does with an entity whose input authority left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DespawnPolicy {
    /// Remove the entity on every peer.
    Despawn,
    /// Keep the entity in the world with no input authority.
    Retain,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MovementConfig {
    pub speed: f64,
    pub rotation_speed: f64,
    pub arena_half_extent: Option<f64>,
}

impl Default for MovementConfig {
    fn default() -> Self {
        let params = MovementParams::default();
        Self {
            speed: params.speed,
            rotation_speed: params.rotation_speed,
            arena_half_extent: params.arena_half_extent,
        }
    }
}

impl From<&MovementConfig> for MovementParams {
    fn from(config: &MovementConfig) -> Self {
        Self {
            speed: config.speed,
            rotation_speed: config.rotation_speed,
            arena_half_extent: config.arena_half_extent,
        }
    }
}

/// Camera placement relative to the locally controlled entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub offset_position: [f64; 3],
    /// Euler angles in degrees.
    pub offset_rotation: [f64; 3],
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            offset_position: [0.0, 6.0, -7.0],
            offset_rotation: [30.0, 0.0, 0.0],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub session_name: String,
    pub mode: GameMode,
    pub tick_rate_hz: u32,
    pub input_lead_ticks: u64,
    pub max_future_ticks: u64,
    pub connect_timeout_ms: u64,
    /// Capacity of a hosted session, the host included.
    pub max_peers: usize,
    /// Sample the local [`InputSource`](crate::input::InputSource) each tick.
    pub provide_input: bool,
    /// Scene tag of the spawn point.
    pub spawn_tag: String,
    pub despawn_policy: DespawnPolicy,
    pub movement: MovementConfig,
    pub camera: CameraConfig,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            session_name: DEFAULT_SESSION_NAME.to_string(),
            mode: GameMode::AutoHostOrClient,
            tick_rate_hz: TICK_RATE_HZ,
            input_lead_ticks: INPUT_LEAD_TICKS,
            max_future_ticks: MAX_FUTURE_TICKS,
            connect_timeout_ms: CONNECT_TIMEOUT_MS,
            max_peers: MAX_PEERS,
            provide_input: true,
            spawn_tag: DEFAULT_SPAWN_TAG.to_string(),
            despawn_policy: DespawnPolicy::Despawn,
            movement: MovementConfig::default(),
            camera: CameraConfig::default(),
        }
    }
}

impl RunnerConfig {
    /// Parse and validate a RON document.
    pub fn from_ron_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = ron::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a RON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path.as_ref())?;
        Self::from_ron_str(&source)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session_name.trim().is_empty() {
            return Err(ConfigError::Invalid("session_name must not be empty"));
        }
        if self.tick_rate_hz == 0 {
            return Err(ConfigError::Invalid("tick_rate_hz must be positive"));
        }
        if self.max_peers == 0 {
            return Err(ConfigError::Invalid("max_peers must be positive"));
        }
        let movement = &self.movement;
        if !movement.speed.is_finite() || movement.speed < 0.0 {
            return Err(ConfigError::Invalid("movement.speed must be finite and >= 0"));
        }
        if !movement.rotation_speed.is_finite() || movement.rotation_speed < 0.0 {
            return Err(ConfigError::Invalid(
                "movement.rotation_speed must be finite and >= 0",
            ));
        }
        if let Some(extent) = movement.arena_half_extent
            && !(extent.is_finite() && extent > 0.0)
        {
            return Err(ConfigError::Invalid(
                "movement.arena_half_extent must be finite and > 0",
            ));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Wall-clock length of one simulation tick.
    pub fn tick_duration(&self) -> Duration {
        Duration::from_nanos(1_000_000_000 / u64::from(self.tick_rate_hz))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_defaults_match_constants() {
        let config = RunnerConfig::default();
        assert_eq!(config.session_name, "TestRoom");
        assert_eq!(config.mode, GameMode::AutoHostOrClient);
        assert_eq!(config.tick_rate_hz, 60);
        assert_eq!(config.spawn_tag, "Respawn");
        assert_eq!(config.movement.speed, 5.0);
        assert_eq!(config.movement.rotation_speed, 10.0);
        assert_eq!(config.despawn_policy, DespawnPolicy::Despawn);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_ron_keeps_defaults() {
        let config = RunnerConfig::from_ron_str(
            r#"(
                session_name: "Arena-2",
                mode: Host,
                movement: (speed: 7.5),
                despawn_policy: Retain,
            )"#,
        )
        .unwrap();

        assert_eq!(config.session_name, "Arena-2");
        assert_eq!(config.mode, GameMode::Host);
        assert_eq!(config.movement.speed, 7.5);
        assert_eq!(config.movement.rotation_speed, 10.0);
        assert_eq!(config.despawn_policy, DespawnPolicy::Retain);
        assert_eq!(config.tick_rate_hz, 60);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let result = RunnerConfig::from_ron_str("(tick_rate_hz: 0)");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));

        let result = RunnerConfig::from_ron_str(r#"(session_name: "  ")"#);
        assert!(matches!(result, Err(ConfigError::Invalid(_))));

        let result = RunnerConfig::from_ron_str("(movement: (arena_half_extent: Some(-1.0)))");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_malformed_ron_is_parse_error() {
        let result = RunnerConfig::from_ron_str("(session_name: ");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"(session_name: "FromDisk", max_peers: 4)"#).unwrap();

        let config = RunnerConfig::load(file.path()).unwrap();
        assert_eq!(config.session_name, "FromDisk");
        assert_eq!(config.max_peers, 4);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let result = RunnerConfig::load("/definitely/not/here.ron");
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }

    #[test]
    fn test_tick_duration() {
        let config = RunnerConfig {
            tick_rate_hz: 50,
            ..Default::default()
        };
        assert_eq!(config.tick_duration(), Duration::from_millis(20));
    }
}
