//! Simulation configuration.
//!
//! Loaded from JSON and validated before anything is spawned. Every option
//! has a documented default except the tower list, the caller list and the
//! mailbox bound, which must be given explicitly.

use crate::geometry::{Area, Position};
use crate::movement::{CallDuration, MovementModel};
use crate::signal::SignalModel;
use cellnet_env::{EntityId, MailboxConfig};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Errors that abort a simulation before `Start`.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("No towers configured")]
    NoTowers,

    #[error("No callers configured")]
    NoCallers,

    #[error("Duplicate entity id: {0}")]
    DuplicateId(EntityId),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

impl ConfigError {
    fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

fn default_seed() -> u64 {
    42
}

fn default_tick_interval_ms() -> u64 {
    2000
}

fn default_hysteresis_margin() -> f64 {
    1.0
}

fn default_base_power() -> f64 {
    100.0
}

fn default_capacity() -> usize {
    10
}

fn default_caller_id() -> EntityId {
    EntityId::from("caller")
}

fn default_count() -> usize {
    1
}

/// Top-level simulation configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimConfig {
    /// Master seed, per-entity RNGs are derived from it
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Universe tick period in milliseconds
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Stop ticking after this many ticks; `None` runs until shutdown
    #[serde(default)]
    pub max_ticks: Option<u64>,

    /// Power advantage a candidate needs over the current tower to trigger a handoff
    #[serde(default = "default_hysteresis_margin")]
    pub hysteresis_margin: f64,

    #[serde(default)]
    pub signal: SignalModel,

    /// Spawn area and movement bounds
    #[serde(default)]
    pub world: Area,

    /// Bound on each caller's tick queue
    pub mailbox: MailboxConfig,

    pub towers: Vec<TowerConfig>,

    pub callers: Vec<CallerGroup>,
}

/// One tower.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TowerConfig {
    pub id: EntityId,
    pub x: f64,
    pub y: f64,

    #[serde(default = "default_base_power")]
    pub base_power: f64,

    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

impl TowerConfig {
    pub fn new(id: impl Into<EntityId>, x: f64, y: f64) -> Self {
        Self {
            id: id.into(),
            x,
            y,
            base_power: default_base_power(),
            capacity: default_capacity(),
        }
    }

    pub fn with_base_power(mut self, base_power: f64) -> Self {
        self.base_power = base_power;
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn position(&self) -> Position {
        Position::new(self.x, self.y)
    }
}

/// A group of identically configured callers.
///
/// With `count > 1` the id is used as a prefix: `caller` becomes
/// `caller-1`, `caller-2`, ...
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallerGroup {
    #[serde(default = "default_caller_id")]
    pub id: EntityId,

    #[serde(default = "default_count")]
    pub count: usize,

    /// Start position; sampled uniformly from the world when absent
    #[serde(default)]
    pub position: Option<Position>,

    #[serde(default)]
    pub movement: MovementModel,

    #[serde(default)]
    pub call_duration: CallDuration,
}

impl CallerGroup {
    pub fn new(id: impl Into<EntityId>) -> Self {
        Self {
            id: id.into(),
            count: default_count(),
            position: None,
            movement: MovementModel::default(),
            call_duration: CallDuration::default(),
        }
    }

    pub fn at(mut self, x: f64, y: f64) -> Self {
        self.position = Some(Position::new(x, y));
        self
    }

    pub fn with_count(mut self, count: usize) -> Self {
        self.count = count;
        self
    }

    pub fn with_movement(mut self, movement: MovementModel) -> Self {
        self.movement = movement;
        self
    }

    pub fn with_call_duration(mut self, call_duration: CallDuration) -> Self {
        self.call_duration = call_duration;
        self
    }

    fn member_ids(&self) -> Vec<EntityId> {
        if self.count == 1 {
            vec![self.id.clone()]
        } else {
            (1..=self.count)
                .map(|n| EntityId::new(format!("{}-{}", self.id, n)))
                .collect()
        }
    }
}

/// A single caller after group expansion.
#[derive(Debug, Clone, PartialEq)]
pub struct CallerSpec {
    pub id: EntityId,
    pub position: Position,
    pub movement: MovementModel,
    pub call_duration: CallDuration,
}

impl SimConfig {
    /// Creates a configuration with defaults and no entities.
    pub fn new(mailbox: MailboxConfig) -> Self {
        Self {
            seed: default_seed(),
            tick_interval_ms: default_tick_interval_ms(),
            max_ticks: None,
            hysteresis_margin: default_hysteresis_margin(),
            signal: SignalModel::default(),
            world: Area::default(),
            mailbox,
            towers: Vec::new(),
            callers: Vec::new(),
        }
    }

    pub fn with_tower(mut self, tower: TowerConfig) -> Self {
        self.towers.push(tower);
        self
    }

    pub fn with_callers(mut self, group: CallerGroup) -> Self {
        self.callers.push(group);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_max_ticks(mut self, max_ticks: u64) -> Self {
        self.max_ticks = Some(max_ticks);
        self
    }

    pub fn with_tick_interval_ms(mut self, tick_interval_ms: u64) -> Self {
        self.tick_interval_ms = tick_interval_ms;
        self
    }

    /// Parses and validates a JSON configuration.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: SimConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&json)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Total number of callers after group expansion.
    pub fn caller_count(&self) -> usize {
        self.callers.iter().map(|group| group.count).sum()
    }

    /// Checks every rule a runnable configuration must satisfy.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.towers.is_empty() {
            return Err(ConfigError::NoTowers);
        }
        if self.caller_count() == 0 {
            return Err(ConfigError::NoCallers);
        }
        if self.tick_interval_ms == 0 {
            return Err(ConfigError::invalid("tick_interval_ms", "must be > 0"));
        }
        if !(self.hysteresis_margin.is_finite() && self.hysteresis_margin >= 0.0) {
            return Err(ConfigError::invalid("hysteresis_margin", "must be finite and >= 0"));
        }
        if !(self.signal.noise_floor.is_finite() && self.signal.noise_floor >= 0.0) {
            return Err(ConfigError::invalid("signal.noise_floor", "must be finite and >= 0"));
        }
        if !self.world.is_valid() {
            return Err(ConfigError::invalid("world", "must have positive extent"));
        }
        if self.mailbox.capacity == 0 {
            return Err(ConfigError::invalid("mailbox.capacity", "must be >= 1"));
        }

        let mut seen = BTreeSet::new();
        for tower in &self.towers {
            if !(tower.x.is_finite() && tower.y.is_finite()) {
                return Err(ConfigError::invalid(format!("towers.{}", tower.id), "position must be finite"));
            }
            if !(tower.base_power.is_finite() && tower.base_power > 0.0) {
                return Err(ConfigError::invalid(
                    format!("towers.{}.base_power", tower.id),
                    "must be > 0",
                ));
            }
            if !seen.insert(tower.id.clone()) {
                return Err(ConfigError::DuplicateId(tower.id.clone()));
            }
        }

        for group in &self.callers {
            if let Err(reason) = group.movement.validate() {
                return Err(ConfigError::invalid(format!("callers.{}.movement", group.id), reason));
            }
            if let Err(reason) = group.call_duration.validate() {
                return Err(ConfigError::invalid(
                    format!("callers.{}.call_duration", group.id),
                    reason,
                ));
            }
            if let Some(position) = group.position {
                if !(position.x.is_finite() && position.y.is_finite()) {
                    return Err(ConfigError::invalid(
                        format!("callers.{}.position", group.id),
                        "must be finite",
                    ));
                }
                if !self.world.contains(&position) {
                    return Err(ConfigError::invalid(
                        format!("callers.{}.position", group.id),
                        format!("({}, {}) lies outside world", position.x, position.y),
                    ));
                }
            }
            for id in group.member_ids() {
                if !seen.insert(id.clone()) {
                    return Err(ConfigError::DuplicateId(id));
                }
            }
        }

        Ok(())
    }

    /// Expands caller groups into individual callers, sampling missing start
    /// positions from the world. Configured positions are used as given.
    pub fn expand_callers<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<CallerSpec> {
        let mut specs = Vec::with_capacity(self.caller_count());
        for group in &self.callers {
            for id in group.member_ids() {
                let position = match group.position {
                    Some(position) => position,
                    None => self.world.sample(rng),
                };
                specs.push(CallerSpec {
                    id,
                    position,
                    movement: group.movement,
                    call_duration: group.call_duration,
                });
            }
        }
        specs
    }
}
