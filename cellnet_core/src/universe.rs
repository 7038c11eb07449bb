//! The Universe: builds the population, wires addresses and drives time.
//!
//! Lifecycle: `new` (validates the configuration) → `setup` (spawns every
//! entity and sends each one its `Setup`) → `start` (begins ticking) →
//! `wait` or `shutdown` (stops the clock, lets callers settle, joins all
//! tasks and returns a [`SimulationReport`]).

use crate::caller::{Caller, CallerSnapshot};
use crate::config::{ConfigError, SimConfig};
use crate::events::EventBus;
use crate::protocol::{Addr, Message};
use crate::runtime::{CallerActor, ClockActor, ClockSummary, LogActor, LogSummary, TowerActor};
use crate::tower::{Tower, TowerSnapshot};
use cellnet_env::{bounded_mailbox, mailbox, CellContext, EntityId, EnvError, RecordSink};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Identity of the Universe's own mailbox.
pub const UNIVERSE_ID: &str = "universe";

#[derive(Error, Debug)]
pub enum SimError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Environment error: {0}")]
    Env(#[from] EnvError),

    #[error("Universe is not set up")]
    NotSetUp,

    #[error("Universe already started")]
    AlreadyStarted,

    #[error("Task failed: {0}")]
    TaskFailed(String),
}

impl From<tokio::task::JoinError> for SimError {
    fn from(e: tokio::task::JoinError) -> Self {
        SimError::TaskFailed(e.to_string())
    }
}

/// Final state of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationReport {
    pub seed: u64,
    pub ticks: u64,
    pub towers: Vec<TowerSnapshot>,
    pub callers: Vec<CallerSnapshot>,
    pub cdrs_emitted: u64,
    pub sink_errors: u64,
    /// Ticks discarded from full caller lanes
    pub ticks_displaced: u64,
}

impl SimulationReport {
    pub fn tower(&self, id: &str) -> Option<&TowerSnapshot> {
        self.towers.iter().find(|t| t.id.as_str() == id)
    }

    pub fn caller(&self, id: &str) -> Option<&CallerSnapshot> {
        self.callers.iter().find(|c| c.id.as_str() == id)
    }

    pub fn calls_placed(&self) -> u64 {
        self.callers.iter().map(|c| c.calls_placed).sum()
    }

    pub fn handoffs(&self) -> u64 {
        self.callers.iter().map(|c| c.handoffs).sum()
    }

    /// Calls still in progress at shutdown.
    pub fn open_calls(&self) -> u64 {
        self.callers.iter().filter(|c| c.open_cdr.is_some()).count() as u64
    }
}

/// Handles owned while the simulation runs.
struct Running {
    /// Dropping this stops the clock
    control: Option<Addr>,
    towers: BTreeMap<EntityId, Addr>,
    callers: BTreeMap<EntityId, Addr>,
    clock: JoinHandle<ClockSummary>,
    log: JoinHandle<LogSummary>,
    tower_tasks: Vec<JoinHandle<TowerSnapshot>>,
    caller_tasks: Vec<JoinHandle<CallerSnapshot>>,
}

pub struct Universe<Ctx: CellContext, S: RecordSink> {
    ctx: Arc<Ctx>,
    config: SimConfig,
    sink: Arc<S>,
    events: EventBus,
    running: Option<Running>,
    started: bool,
}

impl<Ctx: CellContext, S: RecordSink> Universe<Ctx, S> {
    /// Creates a Universe. Fails before anything is spawned if the
    /// configuration is not runnable.
    pub fn new(ctx: Arc<Ctx>, config: SimConfig, sink: Arc<S>) -> Result<Self, SimError> {
        config.validate()?;
        Ok(Self {
            ctx,
            config,
            sink,
            events: EventBus::default(),
            running: None,
            started: false,
        })
    }

    /// Publishes live events on `events` instead of a private bus.
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// Instantiates every tower and caller and sends each its `Setup`.
    pub async fn setup(&mut self) -> Result<(), SimError> {
        if self.running.is_some() {
            return Err(SimError::AlreadyStarted);
        }

        let config = &self.config;
        let (universe, universe_inbox) = mailbox(EntityId::from(UNIVERSE_ID));
        let log = self.ctx.spawn(
            UNIVERSE_ID,
            LogActor::new(universe_inbox, Arc::clone(&self.sink), self.events.clone()).run(),
        );

        let mut towers = BTreeMap::new();
        let mut tower_tasks = Vec::with_capacity(config.towers.len());
        for tower_config in &config.towers {
            let (addr, inbox) = mailbox(tower_config.id.clone());
            let actor = TowerActor::new(
                Tower::new(tower_config, config.signal),
                inbox,
                addr.downgrade(),
                self.events.clone(),
            );
            tower_tasks.push(self.ctx.spawn(tower_config.id.as_str(), actor.run()));
            towers.insert(tower_config.id.clone(), addr);
        }

        let mut placement = stream_rng(config.seed, 0);
        let specs = config.expand_callers(&mut placement);

        let mut callers = BTreeMap::new();
        let mut lanes = Vec::with_capacity(specs.len());
        let mut caller_tasks = Vec::with_capacity(specs.len());
        for (index, spec) in specs.into_iter().enumerate() {
            let id = spec.id.clone();
            let (addr, inbox) = mailbox(id.clone());
            let (lane, clock_inbox) = bounded_mailbox(id.clone(), config.mailbox);
            let caller = Caller::new(
                spec,
                config.world,
                config.hysteresis_margin,
                stream_rng(config.seed, index as u64 + 1),
            );
            let actor = CallerActor::new(caller, inbox, clock_inbox, addr.clone(), self.events.clone());
            caller_tasks.push(self.ctx.spawn(id.as_str(), actor.run()));
            lanes.push(lane);
            callers.insert(id, addr);
        }

        let tower_addrs: Vec<Addr> = towers.values().cloned().collect();
        let caller_addrs: Vec<Addr> = callers.values().cloned().collect();
        for entity in tower_addrs.iter().chain(caller_addrs.iter()) {
            entity
                .send(Message::Setup {
                    universe: universe.clone(),
                    towers: tower_addrs.clone(),
                    users: caller_addrs.clone(),
                })
                .await?;
        }

        let (control, control_inbox) = mailbox(EntityId::from("clock"));
        let clock = self.ctx.spawn(
            "clock",
            ClockActor::new(
                Arc::clone(&self.ctx),
                control_inbox,
                lanes,
                config.tick_interval(),
                config.max_ticks,
            )
            .run(),
        );

        info!(
            "Universe set up: {} towers, {} callers, seed {}",
            towers.len(),
            callers.len(),
            config.seed
        );

        self.running = Some(Running {
            control: Some(control),
            towers,
            callers,
            clock,
            log,
            tower_tasks,
            caller_tasks,
        });
        Ok(())
    }

    /// Begins ticking.
    pub async fn start(&mut self) -> Result<(), SimError> {
        let running = self.running.as_ref().ok_or(SimError::NotSetUp)?;
        if self.started {
            return Err(SimError::AlreadyStarted);
        }
        let control = running.control.as_ref().ok_or(SimError::NotSetUp)?;
        control.send(Message::Start).await?;
        self.started = true;
        info!("Universe started");
        Ok(())
    }

    pub fn tower_ids(&self) -> Vec<EntityId> {
        self.running
            .as_ref()
            .map(|r| r.towers.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn caller_ids(&self) -> Vec<EntityId> {
        self.running
            .as_ref()
            .map(|r| r.callers.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Waits for the clock to reach `max_ticks`, then shuts down.
    ///
    /// Without `max_ticks` this only returns if the clock task fails.
    pub async fn wait(mut self) -> Result<SimulationReport, SimError> {
        if !self.started {
            return Err(SimError::NotSetUp);
        }
        let running = self.running.as_mut().ok_or(SimError::NotSetUp)?;
        let clock = (&mut running.clock).await?;
        self.finish(Some(clock)).await
    }

    /// Stops the clock, lets every caller settle and joins all tasks.
    pub async fn shutdown(self) -> Result<SimulationReport, SimError> {
        self.finish(None).await
    }

    /// Convenience: setup, start and wait.
    pub async fn run(mut self) -> Result<SimulationReport, SimError> {
        self.setup().await?;
        self.start().await?;
        self.wait().await
    }

    async fn finish(mut self, clock: Option<ClockSummary>) -> Result<SimulationReport, SimError> {
        let mut running = self.running.take().ok_or(SimError::NotSetUp)?;

        running.control.take();
        let clock = match clock {
            Some(summary) => summary,
            None => running.clock.await?,
        };

        // Registries go first so entity mailboxes can close once peers exit.
        drop(running.towers);
        drop(running.callers);

        let mut callers = Vec::with_capacity(running.caller_tasks.len());
        for task in running.caller_tasks {
            callers.push(task.await?);
        }
        let mut towers = Vec::with_capacity(running.tower_tasks.len());
        for task in running.tower_tasks {
            towers.push(task.await?);
        }
        let log = running.log.await?;
        let ticks_displaced: u64 = callers.iter().map(|c| c.ticks_displaced).sum();

        if let Err(e) = self.sink.flush().await {
            warn!("Failed to flush CDR sink: {}", e);
        }

        let report = SimulationReport {
            seed: self.config.seed,
            ticks: clock.ticks,
            towers,
            callers,
            cdrs_emitted: log.cdrs_emitted,
            sink_errors: log.sink_errors,
            ticks_displaced,
        };
        info!(
            "Universe shut down after {} ticks: {} CDRs emitted, {} calls open",
            report.ticks,
            report.cdrs_emitted,
            report.open_calls()
        );
        Ok(report)
    }
}

/// The master seed on its own ChaCha stream, one stream per entity.
///
/// Stream 0 places callers; caller `i` draws from stream `i + 1`, so adding a
/// caller does not perturb the others.
fn stream_rng(seed: u64, stream: u64) -> ChaCha8Rng {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    rng.set_stream(stream);
    rng
}
