//! Built-in scenarios.

use cellnet_core::{CallDuration, CallerGroup, MovementModel, SimConfig, TowerConfig};
use cellnet_env::{MailboxConfig, OverflowPolicy};

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioId {
    /// A caller between two towers picks the stronger one
    NearestTower,

    /// A full tower turns a second caller away
    CapacityReject,

    /// A caller walks out of coverage mid-call
    CoverageDrop,

    /// A caller drives from one tower to the next
    Handoff,

    /// Random walkers in a city of towers
    City,
}

/// Call length long enough to outlast any built-in run.
const LONG_CALL: CallDuration = CallDuration::Fixed { ticks: 10_000 };

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::NearestTower,
            ScenarioId::CapacityReject,
            ScenarioId::CoverageDrop,
            ScenarioId::Handoff,
            ScenarioId::City,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::NearestTower => "nearest_tower",
            ScenarioId::CapacityReject => "capacity_reject",
            ScenarioId::CoverageDrop => "coverage_drop",
            ScenarioId::Handoff => "handoff",
            ScenarioId::City => "city",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::NearestTower => "Towers A(0,0) and B(10,0), caller at (1,0) connects to A",
            ScenarioId::CapacityReject => "Capacity-1 tower, two callers: one connected, the other logs FAIL",
            ScenarioId::CoverageDrop => "Caller moves away from its only tower until the call is DROPPED",
            ScenarioId::Handoff => "Caller drives from tower A to tower B and is handed off mid-call",
            ScenarioId::City => "40 random walkers, 6 towers of capacity 5, invariants only",
        }
    }

    /// Number of ticks the scenario runs unless overridden.
    pub fn default_ticks(&self) -> u64 {
        match self {
            ScenarioId::NearestTower => 5,
            ScenarioId::CapacityReject => 3,
            ScenarioId::CoverageDrop => 8,
            ScenarioId::Handoff => 8,
            ScenarioId::City => 60,
        }
    }

    /// Builds the scenario's configuration.
    pub fn config(&self, seed: u64) -> SimConfig {
        let config = SimConfig::new(MailboxConfig::new(8, OverflowPolicy::Block))
            .with_seed(seed)
            .with_max_ticks(self.default_ticks());

        match self {
            ScenarioId::NearestTower => config
                .with_tower(TowerConfig::new("A", 0.0, 0.0))
                .with_tower(TowerConfig::new("B", 10.0, 0.0))
                .with_callers(CallerGroup::new("caller-1").at(1.0, 0.0).with_call_duration(LONG_CALL)),

            ScenarioId::CapacityReject => config
                .with_tower(TowerConfig::new("A", 0.0, 0.0).with_capacity(1))
                .with_callers(
                    CallerGroup::new("caller")
                        .with_count(2)
                        .at(1.0, 0.0)
                        .with_call_duration(LONG_CALL),
                ),

            // Coverage ends just short of x = 100 for base power 100.
            ScenarioId::CoverageDrop => config
                .with_tower(TowerConfig::new("A", 0.0, 0.0))
                .with_callers(
                    CallerGroup::new("caller-1")
                        .at(0.0, 0.0)
                        .with_movement(MovementModel::Linear { vx: 20.0, vy: 0.0 })
                        .with_call_duration(LONG_CALL),
                ),

            ScenarioId::Handoff => config
                .with_tower(TowerConfig::new("A", 0.0, 0.0).with_base_power(10_000.0))
                .with_tower(TowerConfig::new("B", 100.0, 0.0).with_base_power(10_000.0))
                .with_callers(
                    CallerGroup::new("caller-1")
                        .at(20.0, 0.0)
                        .with_movement(MovementModel::Linear { vx: 10.0, vy: 0.0 })
                        .with_call_duration(LONG_CALL),
                ),

            ScenarioId::City => {
                let mut config = config;
                for (n, (x, y)) in [
                    (200.0, 250.0),
                    (500.0, 250.0),
                    (800.0, 250.0),
                    (200.0, 750.0),
                    (500.0, 750.0),
                    (800.0, 750.0),
                ]
                .into_iter()
                .enumerate()
                {
                    config = config.with_tower(
                        TowerConfig::new(format!("tower-{}", n + 1), x, y)
                            .with_base_power(50_000.0)
                            .with_capacity(5),
                    );
                }
                config.with_callers(
                    CallerGroup::new("walker")
                        .with_count(40)
                        .with_movement(MovementModel::RandomWalk { max_step: 25.0 })
                        .with_call_duration(CallDuration::Exponential { mean: 8.0 }),
                )
            }
        }
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "nearest_tower" | "nearesttower" | "nearest" => Ok(ScenarioId::NearestTower),
            "capacity_reject" | "capacityreject" | "capacity" => Ok(ScenarioId::CapacityReject),
            "coverage_drop" | "coveragedrop" | "drop" => Ok(ScenarioId::CoverageDrop),
            "handoff" => Ok(ScenarioId::Handoff),
            "city" => Ok(ScenarioId::City),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}
