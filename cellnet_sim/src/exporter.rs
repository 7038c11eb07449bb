//! JSON exporter for finished runs.
//!
//! Writes the emitted CDRs, the per-tower aggregates and the final report of
//! one run to a single JSON document.

use crate::runner::ScenarioResult;
use cellnet_core::{CdrRecord, SimulationReport, TowerStats};
use cellnet_env::EntityId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::Path;

/// Complete simulation export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimExport {
    /// Scenario name
    pub scenario: String,

    /// Seed used
    pub seed: u64,

    pub ticks: u64,

    pub passed: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,

    /// CDRs in emission order
    pub cdrs: Vec<CdrRecord>,

    /// `fails_ratio` per tower over the whole run
    pub tower_status: BTreeMap<EntityId, f64>,

    pub tower_stats: BTreeMap<EntityId, TowerStats>,

    pub report: SimulationReport,
}

impl SimExport {
    /// Builds an export from a finished run.
    pub fn from_result(result: &ScenarioResult) -> Self {
        let tower_stats = result.metrics.tower_stats.clone();
        let tower_status = tower_stats
            .iter()
            .map(|(id, stats)| (id.clone(), stats.fails_ratio()))
            .collect();

        Self {
            scenario: result.scenario.clone(),
            seed: result.seed,
            ticks: result.total_ticks,
            passed: result.passed,
            failure_reason: result.failure_reason.clone(),
            cdrs: result.cdrs.clone(),
            tower_status,
            tower_stats,
            report: result.report.clone(),
        }
    }

    /// Writes to a JSON file.
    pub fn write_to_file(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        let mut file = File::create(path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }

    /// Reads an export back.
    pub fn read_from_file(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }
}
