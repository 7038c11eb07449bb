//! Actor runtime - binds the tower and caller state machines to mailboxes.
//!
//! Each entity runs as one task that owns its state and processes its
//! mailbox strictly in arrival order. The Universe side is split in two
//! tasks: the clock, which broadcasts ticks, and the log, which is the
//! Universe's own mailbox and the single writer to the CDR sink.
//!
//! # Architecture
//!
//! ```text
//!                 ┌──────────────┐   Tick (bounded lane)   ┌──────────────┐
//!   Start ──────▶ │ ClockActor   │ ──────────────────────▶ │ CallerActor  │
//!                 └──────────────┘                         │   (xN)       │
//!                                                          └──────┬───────┘
//!                  SignalReportRequest / Hello / Disconnect       │  ▲
//!                 ┌───────────────────────────────────────────────┘  │
//!                 ▼                                                  │
//!          ┌──────────────┐  SignalReport / Connect / Fail           │
//!          │ TowerActor   │ ─────────────────────────────────────────┘
//!          │   (xM)       │
//!          └──────┬───────┘
//!                 │ Log (finalized CDR)      Move / Log (FAIL)
//!                 ▼                                 │
//!          ┌──────────────┐ ◀───────────────────────┘
//!          │ LogActor     │ ──▶ RecordSink (topic "cdrs")
//!          └──────────────┘
//! ```

use crate::caller::{Caller, CallerAction, CallerSnapshot, Phase};
use crate::cdr::Cdr;
use crate::events::{EventBus, SimEvent};
use crate::geometry::Position;
use crate::protocol::{Addr, Message};
use crate::signal::SignalReading;
use crate::tower::{Admission, Tower, TowerSnapshot};
use cellnet_env::{CellContext, EntityId, EnvError, Mailbox, RecordSink, SinkRecord, WeakAddress};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Topic finalized CDRs are published on.
pub const CDR_TOPIC: &str = "cdrs";

/// Runs one tower.
pub struct TowerActor {
    tower: Tower,
    inbox: Mailbox<Message>,
    /// Weak so the tower's own handle never keeps its mailbox open
    me: WeakAddress<Message>,
    universe: Option<Addr>,
    events: EventBus,
}

impl TowerActor {
    pub fn new(tower: Tower, inbox: Mailbox<Message>, me: WeakAddress<Message>, events: EventBus) -> Self {
        Self {
            tower,
            inbox,
            me,
            universe: None,
            events,
        }
    }

    /// Processes messages until every address to this tower is gone.
    pub async fn run(mut self) -> TowerSnapshot {
        while let Some(message) = self.inbox.recv().await {
            self.handle(message).await;
        }
        debug!("Tower {} stopped with {} connected", self.tower.id(), self.tower.occupancy());
        self.tower.snapshot()
    }

    async fn handle(&mut self, message: Message) {
        match message {
            Message::Setup { universe, .. } => {
                // Towers never address peers; only the Universe is kept.
                self.universe = Some(universe);
            }

            Message::SignalReportRequest { source, x, y } => {
                let Some(me) = self.me.upgrade() else {
                    return;
                };
                let reading = self.tower.signal_at(Position::new(x, y));
                let reply = Message::SignalReport {
                    distance: reading.distance,
                    power: reading.power,
                    tower_id: reading.tower_id,
                    tower: me,
                };
                if let Err(e) = source.send(reply).await {
                    debug!("Tower {} could not answer survey: {}", self.tower.id(), e);
                }
            }

            Message::Hello { caller, cdr, reconnect } => {
                let caller_id = cdr.caller_id().clone();
                let reply = match self.tower.admit(&caller_id) {
                    Admission::Admitted => {
                        debug!(
                            "Tower {} admitted {} ({}/{}){}",
                            self.tower.id(),
                            caller_id,
                            self.tower.occupancy(),
                            self.tower.capacity(),
                            if reconnect { " on handoff" } else { "" }
                        );
                        self.events.publish(SimEvent::Connect {
                            caller_id,
                            tower_id: self.tower.id().clone(),
                            handoff: reconnect,
                        });
                        match self.me.upgrade() {
                            Some(me) => Message::Connect {
                                tower_id: self.tower.id().clone(),
                                tower: me,
                            },
                            None => return,
                        }
                    }
                    Admission::Rejected => {
                        debug!("Tower {} full, rejected {}", self.tower.id(), caller_id);
                        Message::Fail {
                            tower_id: self.tower.id().clone(),
                        }
                    }
                };
                if let Err(e) = caller.send(reply).await {
                    warn!("Tower {} could not reply to Hello: {}", self.tower.id(), e);
                }
            }

            Message::Disconnect { caller_id, cdr } => {
                if !self.tower.release(&caller_id) {
                    warn!("Tower {} got Disconnect from unknown caller {}", self.tower.id(), caller_id);
                }
                self.events.publish(SimEvent::Disconnect {
                    caller_id,
                    tower_id: self.tower.id().clone(),
                    state: cdr.state(),
                });
                if cdr.is_final() {
                    self.forward(cdr).await;
                }
            }

            other => warn!("Tower {} ignoring unexpected {}", self.tower.id(), other.kind()),
        }
    }

    async fn forward(&self, cdr: Cdr) {
        match &self.universe {
            Some(universe) => {
                if let Err(e) = universe.send(Message::Log { cdr }).await {
                    error!("Tower {} lost CDR: {}", self.tower.id(), e);
                }
            }
            None => error!("Tower {} has no Universe to log CDR {}", self.tower.id(), cdr.id()),
        }
    }
}

/// Which lane a caller's next message came from.
enum Lane {
    Protocol(Option<Message>),
    Clock(Option<Message>),
}

/// Runs one caller.
///
/// Protocol replies arrive on the unbounded inbox; ticks arrive on the
/// bounded clock lane. Ticks are only taken while the caller is settled, so
/// every survey and every `Hello` is resolved before the next tick starts.
pub struct CallerActor {
    caller: Caller,
    inbox: Mailbox<Message>,
    clock: Mailbox<Message>,
    me: Addr,
    universe: Option<Addr>,
    towers: BTreeMap<EntityId, Addr>,
    events: EventBus,
}

impl CallerActor {
    pub fn new(caller: Caller, inbox: Mailbox<Message>, clock: Mailbox<Message>, me: Addr, events: EventBus) -> Self {
        Self {
            caller,
            inbox,
            clock,
            me,
            universe: None,
            towers: BTreeMap::new(),
            events,
        }
    }

    /// Processes messages until the clock lane closes and the caller has no
    /// outstanding request.
    pub async fn run(mut self) -> CallerSnapshot {
        loop {
            let lane = if self.caller.is_settled() {
                tokio::select! {
                    biased;
                    message = self.inbox.recv() => Lane::Protocol(message),
                    tick = self.clock.recv() => Lane::Clock(tick),
                }
            } else {
                Lane::Protocol(self.inbox.recv().await)
            };

            match lane {
                Lane::Protocol(Some(message)) | Lane::Clock(Some(message)) => self.handle(message).await,
                Lane::Clock(None) => break,
                Lane::Protocol(None) => {
                    warn!("Caller {} inbox closed while {}", self.caller.id(), self.caller.state().phase());
                    break;
                }
            }
        }
        let mut snapshot = self.caller.snapshot();
        snapshot.ticks_displaced = self.clock.displaced();
        debug!(
            "Caller {} stopped at tick {} ({} ticks displaced)",
            snapshot.id, snapshot.last_tick, snapshot.ticks_displaced
        );
        snapshot
    }

    async fn handle(&mut self, message: Message) {
        let result = match message {
            Message::Setup { universe, towers, .. } => {
                self.universe = Some(universe);
                self.towers = towers.into_iter().map(|t| (t.id().clone(), t)).collect();
                self.caller.set_towers(self.towers.keys().cloned());
                Ok(Vec::new())
            }

            Message::Tick { tick } => self.caller.on_tick(tick),

            Message::SignalReport {
                distance,
                power,
                tower_id,
                tower,
            } => {
                self.towers.insert(tower_id.clone(), tower);
                self.events.publish(SimEvent::SignalReport {
                    caller_id: self.caller.id().clone(),
                    tower_id: tower_id.clone(),
                    distance,
                    power,
                });
                self.caller
                    .on_signal_report(SignalReading::new(tower_id, distance, power))
            }

            Message::Connect { tower_id, tower } => {
                if self.caller.state().phase() == Phase::AwaitingHandoff {
                    debug!("Caller {} handed off to {}", self.caller.id(), tower_id);
                }
                self.towers.insert(tower_id.clone(), tower);
                self.caller.on_connect(tower_id)
            }

            Message::Fail { tower_id } => self.caller.on_fail(tower_id),

            other => {
                warn!("Caller {} ignoring unexpected {}", self.caller.id(), other.kind());
                Ok(Vec::new())
            }
        };

        match result {
            Ok(actions) => {
                for action in actions {
                    self.execute(action).await;
                }
            }
            Err(e) => warn!("Caller {}: {}", self.caller.id(), e),
        }
    }

    async fn execute(&mut self, action: CallerAction) {
        let caller_id = self.caller.id().clone();
        let outcome = match action {
            CallerAction::Moved { position } => match &self.universe {
                Some(universe) => {
                    universe
                        .send(Message::Move {
                            caller_id,
                            x: position.x,
                            y: position.y,
                        })
                        .await
                }
                None => Ok(()),
            },

            CallerAction::RequestSignal { position } => {
                let mut outcome = Ok(());
                for tower in self.towers.values() {
                    let request = Message::SignalReportRequest {
                        source: self.me.clone(),
                        x: position.x,
                        y: position.y,
                    };
                    if let Err(e) = tower.send(request).await {
                        outcome = Err(e);
                    }
                }
                outcome
            }

            CallerAction::Hello { tower, cdr, reconnect } => {
                debug!(
                    "Caller {} sends Hello to {} ({})",
                    caller_id,
                    tower,
                    if reconnect { "handoff" } else { "new call" }
                );
                match self.towers.get(&tower) {
                    Some(address) => {
                        address
                            .send(Message::Hello {
                                caller: self.me.clone(),
                                cdr,
                                reconnect,
                            })
                            .await
                    }
                    None => Err(EnvError::closed(&tower)),
                }
            }

            CallerAction::Disconnect { tower, cdr } => {
                if let Some(state) = cdr.state() {
                    debug!("Caller {} ends call {} on {}: {}", caller_id, cdr.id(), tower, state);
                }
                match self.towers.get(&tower) {
                    Some(address) => address.send(Message::Disconnect { caller_id, cdr }).await,
                    None => Err(EnvError::closed(&tower)),
                }
            }

            CallerAction::Log { cdr } => {
                debug!("Caller {} call {} rejected by {}", caller_id, cdr.id(), cdr.tower_id());
                match &self.universe {
                    Some(universe) => universe.send(Message::Log { cdr }).await,
                    None => Err(EnvError::closed("universe")),
                }
            }
        };

        if let Err(e) = outcome {
            warn!("Caller {} could not deliver: {}", self.caller.id(), e);
        }
    }
}

/// What the log task saw over the run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogSummary {
    pub cdrs_emitted: u64,
    pub sink_errors: u64,
}

/// The Universe's mailbox: forwards finalized CDRs to the sink in arrival
/// order and position updates to the event bus.
pub struct LogActor<S: RecordSink> {
    inbox: Mailbox<Message>,
    sink: Arc<S>,
    events: EventBus,
    summary: LogSummary,
}

impl<S: RecordSink> LogActor<S> {
    pub fn new(inbox: Mailbox<Message>, sink: Arc<S>, events: EventBus) -> Self {
        Self {
            inbox,
            sink,
            events,
            summary: LogSummary::default(),
        }
    }

    pub async fn run(mut self) -> LogSummary {
        while let Some(message) = self.inbox.recv().await {
            match message {
                Message::Log { cdr } => self.emit(cdr).await,
                Message::Move { caller_id, x, y } => {
                    self.events.publish(SimEvent::Move { caller_id, x, y });
                }
                other => warn!("Universe ignoring unexpected {}", other.kind()),
            }
        }
        self.summary
    }

    async fn emit(&mut self, cdr: Cdr) {
        let Some(record) = cdr.to_record() else {
            warn!("Universe got open CDR {} in Log", cdr.id());
            return;
        };

        let payload = match record.to_json() {
            Ok(json) => json.into_bytes(),
            Err(e) => {
                error!("Failed to encode CDR {}: {}", cdr.id(), e);
                self.summary.sink_errors += 1;
                return;
            }
        };

        let sequence = self.summary.cdrs_emitted + self.summary.sink_errors;
        let sink_record = SinkRecord::new(CDR_TOPIC, record.tower_id.as_str(), payload, sequence);
        match self.sink.publish(sink_record).await {
            Ok(()) => {
                self.summary.cdrs_emitted += 1;
                self.events.publish(SimEvent::Cdr { record });
            }
            Err(e) => {
                error!("CDR sink rejected {}: {}", cdr.id(), e);
                self.summary.sink_errors += 1;
            }
        }
    }
}

/// What the clock task did over the run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClockSummary {
    pub ticks: u64,
    /// Virtual or wall time at which the clock stopped
    pub elapsed: Duration,
}

/// Broadcasts ticks to every caller's clock lane once `Start` arrives.
pub struct ClockActor<Ctx: CellContext> {
    ctx: Arc<Ctx>,
    control: Mailbox<Message>,
    lanes: Vec<Addr>,
    interval: Duration,
    max_ticks: Option<u64>,
}

impl<Ctx: CellContext> ClockActor<Ctx> {
    pub fn new(
        ctx: Arc<Ctx>,
        control: Mailbox<Message>,
        lanes: Vec<Addr>,
        interval: Duration,
        max_ticks: Option<u64>,
    ) -> Self {
        Self {
            ctx,
            control,
            lanes,
            interval,
            max_ticks,
        }
    }

    /// Ticks until `max_ticks` is reached or the control handle is dropped.
    pub async fn run(mut self) -> ClockSummary {
        loop {
            match self.control.recv().await {
                Some(Message::Start) => break,
                Some(other) => warn!("Clock ignoring {} before Start", other.kind()),
                None => return ClockSummary::default(),
            }
        }
        info!("Clock started: {} callers, interval {:?}", self.lanes.len(), self.interval);

        let mut tick = 0;
        loop {
            if self.max_ticks.map_or(false, |max| tick >= max) {
                break;
            }

            let stop = tokio::select! {
                biased;
                message = self.control.recv() => match message {
                    None => true,
                    Some(Message::Start) => {
                        debug!("Clock already running");
                        false
                    }
                    Some(other) => {
                        warn!("Clock ignoring {}", other.kind());
                        false
                    }
                },
                _ = self.ctx.sleep(self.interval) => {
                    tick += 1;
                    self.broadcast(tick).await;
                    false
                }
            };
            if stop {
                break;
            }
        }

        let elapsed = self.ctx.now();
        info!("Clock stopped after {} ticks at {:?}", tick, elapsed);
        ClockSummary { ticks: tick, elapsed }
    }

    async fn broadcast(&self, tick: u64) {
        // Fire-and-forget: a blocked lane only delays the clock.
        for lane in &self.lanes {
            if let Err(e) = lane.send(Message::Tick { tick }).await {
                debug!("Tick {} not delivered: {}", tick, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdr::{CdrId, CdrState};
    use crate::config::TowerConfig;
    use crate::signal::SignalModel;
    use async_trait::async_trait;
    use cellnet_env::{bounded_mailbox, mailbox, MailboxConfig, OverflowPolicy};
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct VecSink {
        records: Mutex<Vec<SinkRecord>>,
    }

    #[async_trait]
    impl RecordSink for VecSink {
        async fn publish(&self, record: SinkRecord) -> Result<(), EnvError> {
            self.records.lock().await.push(record);
            Ok(())
        }
    }

    fn unbounded(id: &str) -> (Addr, Mailbox<Message>) {
        mailbox(EntityId::from(id))
    }

    fn spawn_tower(capacity: usize, events: EventBus) -> (Addr, tokio::task::JoinHandle<TowerSnapshot>) {
        let tower = Tower::new(
            &TowerConfig::new("tower-a", 0.0, 0.0).with_capacity(capacity),
            SignalModel::default(),
        );
        let (addr, inbox) = unbounded("tower-a");
        let actor = TowerActor::new(tower, inbox, addr.downgrade(), events);
        (addr, tokio::spawn(actor.run()))
    }

    fn cdr(caller: &str, bits: u128) -> Cdr {
        Cdr::open(CdrId::from_bits(bits), EntityId::from(caller), EntityId::from("tower-a"), 1)
    }

    #[tokio::test]
    async fn test_tower_answers_survey_with_own_address() {
        let (tower, handle) = spawn_tower(1, EventBus::default());
        let (caller, mut caller_inbox) = unbounded("caller-1");

        tower
            .send(Message::SignalReportRequest {
                source: caller.clone(),
                x: 1.0,
                y: 0.0,
            })
            .await
            .unwrap();

        match caller_inbox.recv().await {
            Some(Message::SignalReport {
                power, tower_id, tower: reply_to, ..
            }) => {
                assert_eq!(power, 50.0);
                assert_eq!(tower_id.as_str(), "tower-a");
                assert_eq!(reply_to, tower);
            }
            other => panic!("unexpected {:?}", other),
        }

        drop(tower);
        let snapshot = handle.await.unwrap();
        assert!(snapshot.connected.is_empty());
    }

    #[tokio::test]
    async fn test_tower_admits_then_rejects_when_full() {
        let events = EventBus::default();
        let mut connects = events.subscribe(&[crate::events::EventKind::Connect]);
        let (tower, handle) = spawn_tower(1, events);
        let (x, mut x_inbox) = unbounded("caller-x");
        let (y, mut y_inbox) = unbounded("caller-y");

        tower
            .send(Message::Hello {
                caller: x.clone(),
                cdr: cdr("caller-x", 1),
                reconnect: false,
            })
            .await
            .unwrap();
        tower
            .send(Message::Hello {
                caller: y.clone(),
                cdr: cdr("caller-y", 2),
                reconnect: false,
            })
            .await
            .unwrap();

        assert!(matches!(x_inbox.recv().await, Some(Message::Connect { .. })));
        assert!(matches!(y_inbox.recv().await, Some(Message::Fail { .. })));
        assert!(matches!(connects.recv().await, Some(SimEvent::Connect { handoff: false, .. })));

        drop(tower);
        let snapshot = handle.await.unwrap();
        assert_eq!(snapshot.connected, vec![EntityId::from("caller-x")]);
        assert_eq!(snapshot.rejected, 1);
    }

    #[tokio::test]
    async fn test_tower_logs_only_final_cdrs() {
        let (tower, handle) = spawn_tower(2, EventBus::default());
        let (universe, mut universe_inbox) = unbounded("universe");
        let (caller, mut caller_inbox) = unbounded("caller-1");

        tower
            .send(Message::Setup {
                universe: universe.clone(),
                towers: Vec::new(),
                users: Vec::new(),
            })
            .await
            .unwrap();
        tower
            .send(Message::Hello {
                caller: caller.clone(),
                cdr: cdr("caller-1", 1),
                reconnect: false,
            })
            .await
            .unwrap();
        assert!(matches!(caller_inbox.recv().await, Some(Message::Connect { .. })));

        // Handoff release: record still open, nothing logged.
        tower
            .send(Message::Disconnect {
                caller_id: EntityId::from("caller-1"),
                cdr: cdr("caller-1", 1),
            })
            .await
            .unwrap();

        let mut finished = cdr("caller-1", 2);
        finished.finalize(CdrState::Success, 5).unwrap();
        tower
            .send(Message::Hello {
                caller: caller.clone(),
                cdr: cdr("caller-1", 2),
                reconnect: false,
            })
            .await
            .unwrap();
        assert!(matches!(caller_inbox.recv().await, Some(Message::Connect { .. })));
        tower
            .send(Message::Disconnect {
                caller_id: EntityId::from("caller-1"),
                cdr: finished.clone(),
            })
            .await
            .unwrap();

        drop(tower);
        let snapshot = handle.await.unwrap();
        assert!(snapshot.connected.is_empty());
        drop(universe);

        match universe_inbox.recv().await {
            Some(Message::Log { cdr }) => assert_eq!(cdr, finished),
            other => panic!("unexpected {:?}", other),
        }
        assert!(universe_inbox.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_log_actor_publishes_in_order() {
        let sink = Arc::new(VecSink::default());
        let events = EventBus::default();
        let mut cdr_events = events.subscribe(&[crate::events::EventKind::Cdr]);
        let (universe, inbox) = unbounded("universe");
        let handle = tokio::spawn(LogActor::new(inbox, Arc::clone(&sink), events).run());

        for (n, state) in [CdrState::Fail, CdrState::Success, CdrState::Dropped].into_iter().enumerate() {
            let mut record = cdr(&format!("caller-{}", n), n as u128);
            record.finalize(state, 4).unwrap();
            universe.send(Message::Log { cdr: record }).await.unwrap();
        }
        // Open records are never emitted.
        universe.send(Message::Log { cdr: cdr("caller-9", 9) }).await.unwrap();
        drop(universe);

        let summary = handle.await.unwrap();
        assert_eq!(summary.cdrs_emitted, 3);

        let records = sink.records.lock().await;
        let sequences: Vec<_> = records.iter().map(|r| r.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2]);
        assert!(records.iter().all(|r| r.topic == CDR_TOPIC && r.key == "tower-a"));
        let first = String::from_utf8(records[0].payload.clone()).unwrap();
        assert!(first.contains(r#""state":"FAIL""#));

        assert!(matches!(cdr_events.try_recv(), Some(SimEvent::Cdr { .. })));
    }

    #[tokio::test]
    async fn test_clock_waits_for_start_and_stops_at_max() {
        let ctx = Arc::new(cellnet_env::TokioContext::new());
        let (control, control_inbox) = unbounded("clock");
        let (lane, mut lane_inbox) =
            bounded_mailbox::<Message>(EntityId::from("caller-1"), MailboxConfig::new(8, OverflowPolicy::Block));

        let clock = ClockActor::new(ctx, control_inbox, vec![lane], Duration::from_millis(1), Some(3));
        let handle = tokio::spawn(clock.run());

        control.send(Message::Start).await.unwrap();
        let summary = handle.await.unwrap();
        assert_eq!(summary.ticks, 3);
        assert!(summary.elapsed >= Duration::from_millis(3));

        let mut ticks = Vec::new();
        while let Some(Message::Tick { tick }) = lane_inbox.recv().await {
            ticks.push(tick);
        }
        assert_eq!(ticks, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_clock_drop_oldest_counts_displaced() {
        let ctx = Arc::new(cellnet_env::TokioContext::new());
        let (control, control_inbox) = unbounded("clock");
        let (lane, mut lane_inbox) =
            bounded_mailbox::<Message>(EntityId::from("caller-1"), MailboxConfig::new(2, OverflowPolicy::DropOldest));

        let clock = ClockActor::new(ctx, control_inbox, vec![lane], Duration::from_millis(1), Some(5));
        let handle = tokio::spawn(clock.run());
        control.send(Message::Start).await.unwrap();
        let summary = handle.await.unwrap();
        assert_eq!(summary.ticks, 5);

        let mut ticks = Vec::new();
        while let Some(Message::Tick { tick }) = lane_inbox.recv().await {
            ticks.push(tick);
        }
        assert_eq!(ticks, vec![4, 5]);
        assert_eq!(lane_inbox.displaced(), 3);
    }

    #[tokio::test]
    async fn test_clock_without_start_exits_on_close() {
        let ctx = Arc::new(cellnet_env::TokioContext::new());
        let (control, control_inbox) = unbounded("clock");
        let clock = ClockActor::new(ctx, control_inbox, Vec::new(), Duration::from_millis(1), None);
        let handle = tokio::spawn(clock.run());
        drop(control);
        assert_eq!(handle.await.unwrap(), ClockSummary::default());
    }
}
