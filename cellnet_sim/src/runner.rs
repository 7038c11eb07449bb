//! Scenario runner - executes scenarios and checks the simulation invariants.

use crate::context::SimContext;
use crate::scenarios::ScenarioId;
use crate::sinks::MemorySink;

use cellnet_core::{
    CdrRecord, CdrState, EventBus, EventKind, Phase, SimConfig, SimError, SimulationReport, TowerStats, Universe,
};
use cellnet_env::{EntityId, RecordSink};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Results from running a scenario.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioResult {
    /// Scenario that was run (`custom` for configuration files)
    pub scenario: String,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Total ticks executed
    pub total_ticks: u64,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Metrics collected during run
    pub metrics: ScenarioMetrics,

    /// Emitted CDRs in emission order
    pub cdrs: Vec<CdrRecord>,

    pub report: SimulationReport,
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScenarioMetrics {
    pub calls_placed: u64,
    pub success: u64,
    pub fail: u64,
    pub dropped: u64,
    pub open_calls: u64,
    pub handoffs: u64,
    pub ticks_displaced: u64,

    /// Live events observed per kind
    pub events: BTreeMap<EventKind, u64>,

    /// Per-tower aggregate over every emitted CDR
    pub tower_stats: BTreeMap<EntityId, TowerStats>,
}

impl ScenarioMetrics {
    fn collect(report: &SimulationReport, cdrs: &[CdrRecord], events: BTreeMap<EventKind, u64>) -> Self {
        let count = |state: CdrState| cdrs.iter().filter(|c| c.state == state).count() as u64;
        Self {
            calls_placed: report.calls_placed(),
            success: count(CdrState::Success),
            fail: count(CdrState::Fail),
            dropped: count(CdrState::Dropped),
            open_calls: report.open_calls(),
            handoffs: report.handoffs(),
            ticks_displaced: report.ticks_displaced,
            events,
            tower_stats: TowerStats::from_records(cdrs),
        }
    }
}

/// Runs scenarios under the virtual clock.
pub struct ScenarioRunner {
    /// Configuration seed
    seed: u64,

    /// Overrides the scenario's tick count
    ticks: Option<u64>,

    /// External sink every run's CDRs are mirrored to
    cdr_output: Option<Arc<dyn RecordSink>>,
}

impl ScenarioRunner {
    /// Creates a new scenario runner.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            ticks: None,
            cdr_output: None,
        }
    }

    /// Sets the number of ticks every scenario runs for.
    pub fn with_ticks(mut self, ticks: u64) -> Self {
        self.ticks = Some(ticks);
        self
    }

    /// Mirrors every emitted CDR, in emission order, to `sink`.
    pub fn with_cdr_output(mut self, sink: Arc<dyn RecordSink>) -> Self {
        self.cdr_output = Some(sink);
        self
    }

    /// Runs a built-in scenario and returns the result.
    pub async fn run(&self, scenario: ScenarioId) -> Result<ScenarioResult, SimError> {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed);
        debug!("  {}", scenario.description());

        let mut config = scenario.config(self.seed);
        if let Some(ticks) = self.ticks {
            config.max_ticks = Some(ticks);
        }

        let mut result = self.run_config(scenario.name(), config).await?;
        if result.passed {
            if let Err(reason) = check_expectations(scenario, &result) {
                result.passed = false;
                result.failure_reason = Some(reason);
            }
        }
        Ok(result)
    }

    /// Runs an arbitrary configuration, checking only the invariants.
    pub async fn run_config(&self, name: &str, config: SimConfig) -> Result<ScenarioResult, SimError> {
        let ctx = SimContext::shared(config.seed);
        let sink = Arc::new(match &self.cdr_output {
            Some(output) => MemorySink::mirroring(Arc::clone(output)),
            None => MemorySink::new(),
        });
        let events = EventBus::new(4096);

        let mut subscription = events.subscribe(&[]);
        let counter = tokio::spawn(async move {
            let mut counts: BTreeMap<EventKind, u64> = BTreeMap::new();
            while let Some(event) = subscription.recv().await {
                *counts.entry(event.kind()).or_default() += 1;
            }
            counts
        });

        let seed = config.seed;
        let universe = Universe::new(ctx, config, Arc::clone(&sink))?.with_events(events);
        let report = universe.run().await?;
        let events = counter.await?;
        let cdrs = sink.cdrs()?;

        let violations = check_invariants(&report, &cdrs);
        for violation in &violations {
            warn!("  invariant violated: {}", violation);
        }

        let metrics = ScenarioMetrics::collect(&report, &cdrs, events);
        info!(
            "  {} ticks | {} calls | {} success, {} fail, {} dropped, {} open | {} handoffs",
            report.ticks,
            metrics.calls_placed,
            metrics.success,
            metrics.fail,
            metrics.dropped,
            metrics.open_calls,
            metrics.handoffs
        );

        Ok(ScenarioResult {
            scenario: name.to_string(),
            seed,
            passed: violations.is_empty(),
            total_ticks: report.ticks,
            failure_reason: if violations.is_empty() {
                None
            } else {
                Some(violations.join("; "))
            },
            metrics,
            cdrs,
            report,
        })
    }
}

/// Checks the properties every run must satisfy at shutdown.
pub fn check_invariants(report: &SimulationReport, cdrs: &[CdrRecord]) -> Vec<String> {
    let mut violations = Vec::new();

    let mut holder: BTreeMap<&EntityId, &EntityId> = BTreeMap::new();
    for tower in &report.towers {
        if tower.connected.len() > tower.capacity {
            violations.push(format!(
                "tower {} holds {} callers over capacity {}",
                tower.id,
                tower.connected.len(),
                tower.capacity
            ));
        }
        for caller in &tower.connected {
            if let Some(other) = holder.insert(caller, &tower.id) {
                violations.push(format!("caller {} connected to both {} and {}", caller, other, tower.id));
            }
        }
    }

    for caller in &report.callers {
        if !matches!(caller.phase, Phase::Idle | Phase::Connected) {
            violations.push(format!("caller {} did not settle ({})", caller.id, caller.phase));
        }
        let held_by = holder.get(&caller.id).copied();
        if held_by != caller.tower.as_ref() {
            violations.push(format!(
                "caller {} believes it is on {:?} but towers hold it on {:?}",
                caller.id, caller.tower, held_by
            ));
        }
    }

    for cdr in cdrs {
        if cdr.end_tick < cdr.start_tick {
            violations.push(format!("CDR of {} ends before it starts", cdr.caller_id));
        }
    }

    let finalized = cdrs.len() as u64;
    if finalized != report.cdrs_emitted {
        violations.push(format!(
            "sink holds {} CDRs but {} were emitted",
            finalized, report.cdrs_emitted
        ));
    }
    if finalized + report.open_calls() != report.calls_placed() {
        violations.push(format!(
            "{} calls placed but {} finalized and {} open",
            report.calls_placed(),
            finalized,
            report.open_calls()
        ));
    }
    if report.sink_errors > 0 {
        violations.push(format!("{} CDRs lost to sink errors", report.sink_errors));
    }

    violations
}

/// Scenario-specific outcomes on top of the invariants.
fn check_expectations(scenario: ScenarioId, result: &ScenarioResult) -> Result<(), String> {
    let report = &result.report;
    let tower_of = |caller: &str| report.caller(caller).and_then(|c| c.tower.as_ref()).map(|t| t.as_str());

    match scenario {
        ScenarioId::NearestTower => {
            if tower_of("caller-1") != Some("A") {
                return Err(format!("caller-1 ended on {:?}, expected A", tower_of("caller-1")));
            }
        }

        ScenarioId::CapacityReject => {
            let connected: BTreeSet<_> = report
                .tower("A")
                .map(|t| t.connected.iter().cloned().collect())
                .unwrap_or_default();
            if connected.len() != 1 {
                return Err(format!("tower A holds {} callers, expected 1", connected.len()));
            }
            let fails: Vec<_> = result.cdrs.iter().filter(|c| c.state == CdrState::Fail).collect();
            if fails.is_empty() {
                return Err("no FAIL CDR emitted".to_string());
            }
            if fails.iter().any(|c| connected.contains(&c.caller_id)) {
                return Err("connected caller has a FAIL CDR".to_string());
            }
        }

        ScenarioId::CoverageDrop => {
            let dropped: Vec<_> = result.cdrs.iter().filter(|c| c.state == CdrState::Dropped).collect();
            match dropped.as_slice() {
                [cdr] if cdr.start_tick == 1 && cdr.end_tick == 5 => {}
                other => return Err(format!("expected one DROPPED CDR for ticks 1..5, got {:?}", other)),
            }
            if tower_of("caller-1").is_some() {
                return Err("caller-1 still connected after leaving coverage".to_string());
            }
        }

        ScenarioId::Handoff => {
            if tower_of("caller-1") != Some("B") {
                return Err(format!("caller-1 ended on {:?}, expected B", tower_of("caller-1")));
            }
            if report.handoffs() == 0 {
                return Err("no handoff happened".to_string());
            }
            if report.tower("A").map_or(true, |t| !t.connected.is_empty()) {
                return Err("tower A still holds the caller".to_string());
            }
            let open = report.caller("caller-1").and_then(|c| c.open_cdr.as_ref());
            if open.map(|cdr| cdr.start_tick()) != Some(1) {
                return Err("handed-over CDR lost its start tick".to_string());
            }
        }

        ScenarioId::City => {
            if result.metrics.calls_placed == 0 {
                return Err("no calls placed".to_string());
            }
        }
    }

    Ok(())
}
