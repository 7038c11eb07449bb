//! The signal model and tower selection.
//!
//! Attenuation follows an inverse-square falloff that stays finite at the
//! tower itself:
//!
//! ```text
//! power(d) = P_base / (1 + d²)
//! ```
//!
//! Powers below the configured noise floor are reported as exactly 0, which
//! is what "out of coverage" means throughout the simulation.

use cellnet_env::EntityId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Parameters of the attenuation model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SignalModel {
    /// Received power below this value is indistinguishable from no signal
    #[serde(default = "default_noise_floor")]
    pub noise_floor: f64,
}

fn default_noise_floor() -> f64 {
    0.01
}

impl Default for SignalModel {
    fn default() -> Self {
        Self {
            noise_floor: default_noise_floor(),
        }
    }
}

impl SignalModel {
    /// Received power at `distance` from a tower transmitting `base_power`.
    ///
    /// Monotonically non-increasing in distance, never negative.
    pub fn power(&self, base_power: f64, distance: f64) -> f64 {
        let power = base_power / (1.0 + distance * distance);
        if power.is_finite() && power >= self.noise_floor {
            power
        } else {
            0.0
        }
    }
}

/// One tower's answer to a signal survey, valid only for the tick that
/// produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalReading {
    pub tower_id: EntityId,
    pub distance: f64,
    pub power: f64,
}

impl SignalReading {
    pub fn new(tower_id: EntityId, distance: f64, power: f64) -> Self {
        Self {
            tower_id,
            distance,
            power,
        }
    }

    /// Returns true if the tower is audible at all.
    pub fn in_coverage(&self) -> bool {
        self.power > 0.0
    }
}

/// Preference order between two readings: higher power first, then the
/// lexicographically lowest tower id.
///
/// This is a total order, so any reduction over it is commutative and
/// associative and the selected tower cannot depend on arrival order.
pub fn compare_readings(a: &SignalReading, b: &SignalReading) -> Ordering {
    b.power
        .total_cmp(&a.power)
        .then_with(|| a.tower_id.cmp(&b.tower_id))
}

/// Selects the best tower from a complete set of readings.
///
/// Returns `None` only for an empty set. The result may be out of coverage
/// (power 0); callers decide what that means for them.
pub fn select_target<'a, I>(readings: I) -> Option<&'a SignalReading>
where
    I: IntoIterator<Item = &'a SignalReading>,
{
    readings
        .into_iter()
        .min_by(|a, b| compare_readings(a, b))
}
