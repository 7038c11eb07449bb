//! Caller movement and call-duration models.

use crate::geometry::{Area, Position};
use nalgebra::Vector2;
use rand::Rng;
use rand_distr::{Distribution, Exp};
use serde::{Deserialize, Serialize};
use std::f64::consts::TAU;

/// How a caller moves between ticks. Positions are clamped to the world.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MovementModel {
    /// Never moves
    #[default]
    Stationary,

    /// Constant velocity in world units per tick
    Linear { vx: f64, vy: f64 },

    /// Uniform heading, uniform step length in `[0, max_step]`
    RandomWalk { max_step: f64 },
}

impl MovementModel {
    /// Computes the position after one tick.
    pub fn step<R: Rng + ?Sized>(&self, from: Position, world: &Area, rng: &mut R) -> Position {
        let delta = match *self {
            MovementModel::Stationary => return from,
            MovementModel::Linear { vx, vy } => Vector2::new(vx, vy),
            MovementModel::RandomWalk { max_step } => {
                let heading = rng.gen_range(0.0..TAU);
                let length = if max_step > 0.0 {
                    rng.gen_range(0.0..=max_step)
                } else {
                    0.0
                };
                Vector2::new(heading.cos(), heading.sin()) * length
            }
        };
        world.clamp(from.offset(delta))
    }

    pub fn validate(&self) -> Result<(), String> {
        match *self {
            MovementModel::Stationary => Ok(()),
            MovementModel::Linear { vx, vy } if vx.is_finite() && vy.is_finite() => Ok(()),
            MovementModel::Linear { .. } => Err("velocity must be finite".to_string()),
            MovementModel::RandomWalk { max_step } if max_step.is_finite() && max_step >= 0.0 => Ok(()),
            MovementModel::RandomWalk { .. } => Err("max_step must be finite and >= 0".to_string()),
        }
    }
}

/// Distribution of scripted call lengths, in ticks.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CallDuration {
    Fixed { ticks: u64 },
    Uniform { min: u64, max: u64 },
    Exponential { mean: f64 },
}

impl Default for CallDuration {
    fn default() -> Self {
        CallDuration::Exponential { mean: 10.0 }
    }
}

impl CallDuration {
    /// Draws a call length. Always at least one tick.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> u64 {
        let ticks = match *self {
            CallDuration::Fixed { ticks } => ticks,
            CallDuration::Uniform { min, max } => rng.gen_range(min..=max.max(min)),
            CallDuration::Exponential { mean } => match Exp::new(1.0 / mean) {
                Ok(exp) => exp.sample(rng).ceil() as u64,
                Err(_) => 1,
            },
        };
        ticks.max(1)
    }

    pub fn validate(&self) -> Result<(), String> {
        match *self {
            CallDuration::Fixed { ticks: 0 } => Err("fixed duration must be >= 1 tick".to_string()),
            CallDuration::Uniform { min, max } if min > max => {
                Err(format!("uniform min {} exceeds max {}", min, max))
            }
            CallDuration::Exponential { mean } if !(mean.is_finite() && mean > 0.0) => {
                Err("exponential mean must be > 0".to_string())
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_stationary_never_moves() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let start = Position::new(5.0, 5.0);
        let next = MovementModel::Stationary.step(start, &Area::default(), &mut rng);
        assert_eq!(next, start);
    }

    #[test]
    fn test_linear_moves_and_clamps() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let world = Area::new(0.0, 0.0, 100.0, 100.0);
        let model = MovementModel::Linear { vx: 20.0, vy: 0.0 };

        let next = model.step(Position::new(10.0, 50.0), &world, &mut rng);
        assert_eq!(next, Position::new(30.0, 50.0));

        let edge = model.step(Position::new(95.0, 50.0), &world, &mut rng);
        assert_eq!(edge, Position::new(100.0, 50.0));
    }

    #[test]
    fn test_random_walk_bounded_step() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let model = MovementModel::RandomWalk { max_step: 5.0 };
        let mut position = Position::new(500.0, 500.0);
        for _ in 0..200 {
            let next = model.step(position, &Area::default(), &mut rng);
            assert!(position.distance_to(&next) <= 5.0 + 1e-9);
            position = next;
        }
    }

    #[test]
    fn test_random_walk_is_reproducible() {
        let model = MovementModel::RandomWalk { max_step: 10.0 };
        let walk = |seed| {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let mut p = Position::new(500.0, 500.0);
            for _ in 0..10 {
                p = model.step(p, &Area::default(), &mut rng);
            }
            p
        };
        assert_eq!(walk(9), walk(9));
    }

    #[test]
    fn test_call_duration_samples_at_least_one_tick() {
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        assert_eq!(CallDuration::Fixed { ticks: 4 }.sample(&mut rng), 4);
        for _ in 0..100 {
            let uniform = CallDuration::Uniform { min: 2, max: 5 }.sample(&mut rng);
            assert!((2..=5).contains(&uniform));
            assert!(CallDuration::Exponential { mean: 0.5 }.sample(&mut rng) >= 1);
        }
    }

    #[test]
    fn test_invalid_models_rejected() {
        assert!(CallDuration::Fixed { ticks: 0 }.validate().is_err());
        assert!(CallDuration::Uniform { min: 5, max: 2 }.validate().is_err());
        assert!(CallDuration::Exponential { mean: 0.0 }.validate().is_err());
        assert!(MovementModel::RandomWalk { max_step: -1.0 }.validate().is_err());
        assert!(MovementModel::Linear { vx: f64::NAN, vy: 0.0 }.validate().is_err());
        assert!(CallDuration::default().validate().is_ok());
    }

    #[test]
    fn test_models_deserialize_tagged() {
        let model: MovementModel = serde_json::from_str(r#"{"type":"linear","vx":1.5,"vy":-2.0}"#).unwrap();
        assert_eq!(model, MovementModel::Linear { vx: 1.5, vy: -2.0 });
        let duration: CallDuration = serde_json::from_str(r#"{"type":"fixed","ticks":3}"#).unwrap();
        assert_eq!(duration, CallDuration::Fixed { ticks: 3 });
    }
}
