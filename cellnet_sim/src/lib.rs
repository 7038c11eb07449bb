//! Cellnet Simulation Harness
//!
//! Runs the cellular network simulation under a virtual clock so that a
//! 2000 ms tick costs no wall-clock time:
//! - **Time**: `SimContext` advances only when the Universe's clock sleeps
//! - **Output**: CDRs land in memory for checking and can be mirrored to a
//!   JSON-lines file
//! - **Checks**: every run is verified against the occupancy, single-tower
//!   and CDR accounting invariants
//!
//! # Usage
//!
//! ```ignore
//! use cellnet_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let result = ScenarioRunner::new(42).run(ScenarioId::Handoff).await?;
//! assert!(result.passed);
//! ```

mod context;
mod exporter;
mod runner;
mod sinks;
pub mod scenarios;

pub use context::SimContext;
pub use exporter::SimExport;
pub use runner::{check_invariants, ScenarioMetrics, ScenarioResult, ScenarioRunner};
pub use sinks::{JsonLinesSink, MemorySink};
