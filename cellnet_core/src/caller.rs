//! The caller's connection and handoff state machine.
//!
//! `Caller` never touches a mailbox. Each input (a tick, a signal report, a
//! tower's reply) returns the list of effects the runtime must carry out, so
//! the whole protocol can be driven step by step in tests.
//!
//! ```text
//!            Hello                 Connect
//!   Idle ───────────▶ AwaitingConnect ───────▶ Connected ◀──────┐
//!    ▲                   │ Fail (CDR FAIL)      │  │  ▲          │
//!    └───────────────────┘                      │  │  │ Fail     │ Connect
//!    ▲   call ends (SUCCESS) / no coverage      │  │  │          │ (old tower
//!    └──────────────────────────────────────────┘  ▼  │          │  released)
//!                                          AwaitingHandoff ──────┘
//! ```

use crate::cdr::{Cdr, CdrError, CdrId, CdrState};
use crate::config::CallerSpec;
use crate::geometry::{Area, Position};
use crate::movement::{CallDuration, MovementModel};
use crate::signal::{select_target, SignalReading};
use cellnet_env::EntityId;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Inputs the state machine refuses. None of these happen in a closed
/// world; the runtime logs them and carries on.
#[derive(Error, Debug)]
pub enum CallerError {
    #[error("{message} from {tower} not expected while {phase}")]
    Unexpected {
        message: &'static str,
        tower: EntityId,
        phase: Phase,
    },

    #[error("Tick {tick} arrived while the survey for tick {surveying} is outstanding")]
    SurveyInFlight { tick: u64, surveying: u64 },

    #[error(transparent)]
    Cdr(#[from] CdrError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    Idle,

    /// Initial `Hello` sent to `target`
    AwaitingConnect { target: EntityId, cdr: Cdr },

    Connected {
        tower: EntityId,
        cdr: Cdr,
        /// Tick at which the scripted call ends
        ends_at: u64,
    },

    /// Handoff `Hello` sent to `candidate`; still served by `tower`
    AwaitingHandoff {
        tower: EntityId,
        candidate: EntityId,
        cdr: Cdr,
        ends_at: u64,
    },
}

impl ConnectionState {
    pub fn phase(&self) -> Phase {
        match self {
            ConnectionState::Idle => Phase::Idle,
            ConnectionState::AwaitingConnect { .. } => Phase::AwaitingConnect,
            ConnectionState::Connected { .. } => Phase::Connected,
            ConnectionState::AwaitingHandoff { .. } => Phase::AwaitingHandoff,
        }
    }

    /// The tower currently holding a slot for this caller.
    pub fn current_tower(&self) -> Option<&EntityId> {
        match self {
            ConnectionState::Connected { tower, .. } | ConnectionState::AwaitingHandoff { tower, .. } => {
                Some(tower)
            }
            _ => None,
        }
    }

    pub fn open_cdr(&self) -> Option<&Cdr> {
        match self {
            ConnectionState::Idle => None,
            ConnectionState::AwaitingConnect { cdr, .. }
            | ConnectionState::Connected { cdr, .. }
            | ConnectionState::AwaitingHandoff { cdr, .. } => Some(cdr),
        }
    }
}

/// Data-less view of `ConnectionState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    AwaitingConnect,
    Connected,
    AwaitingHandoff,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Idle => write!(f, "Idle"),
            Phase::AwaitingConnect => write!(f, "AwaitingConnect"),
            Phase::Connected => write!(f, "Connected"),
            Phase::AwaitingHandoff => write!(f, "AwaitingHandoff"),
        }
    }
}

/// An effect requested by the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum CallerAction {
    /// Publish the new position
    Moved { position: Position },

    /// Send a `SignalReportRequest` to every registered tower
    RequestSignal { position: Position },

    Hello {
        tower: EntityId,
        cdr: Cdr,
        reconnect: bool,
    },

    Disconnect { tower: EntityId, cdr: Cdr },

    /// Hand a finalized CDR that no tower will report to the Universe
    Log { cdr: Cdr },
}

/// Reports collected for one tick.
#[derive(Debug, Clone)]
struct Survey {
    tick: u64,
    readings: BTreeMap<EntityId, SignalReading>,
}

#[derive(Debug, Clone)]
pub struct Caller {
    id: EntityId,
    position: Position,
    movement: MovementModel,
    call_duration: CallDuration,
    world: Area,
    hysteresis_margin: f64,
    towers: BTreeSet<EntityId>,
    state: ConnectionState,
    survey: Option<Survey>,
    last_tick: u64,
    rng: ChaCha8Rng,
    calls_placed: u64,
    handoffs: u64,
}

impl Caller {
    pub fn new(spec: CallerSpec, world: Area, hysteresis_margin: f64, rng: ChaCha8Rng) -> Self {
        Self {
            id: spec.id,
            position: spec.position,
            movement: spec.movement,
            call_duration: spec.call_duration,
            world,
            hysteresis_margin,
            towers: BTreeSet::new(),
            state: ConnectionState::Idle,
            survey: None,
            last_tick: 0,
            rng,
            calls_placed: 0,
            handoffs: 0,
        }
    }

    /// Registers the towers this caller surveys every tick.
    pub fn set_towers<I>(&mut self, towers: I)
    where
        I: IntoIterator<Item = EntityId>,
    {
        self.towers = towers.into_iter().collect();
    }

    pub fn id(&self) -> &EntityId {
        &self.id
    }

    pub fn position(&self) -> Position {
        self.position
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn is_surveying(&self) -> bool {
        self.survey.is_some()
    }

    /// True when no survey or `Hello` is outstanding.
    pub fn is_settled(&self) -> bool {
        self.survey.is_none() && matches!(self.state, ConnectionState::Idle | ConnectionState::Connected { .. })
    }

    /// Advances one tick: move, then survey every tower.
    pub fn on_tick(&mut self, tick: u64) -> Result<Vec<CallerAction>, CallerError> {
        if let Some(survey) = &self.survey {
            return Err(CallerError::SurveyInFlight {
                tick,
                surveying: survey.tick,
            });
        }

        self.last_tick = tick;
        self.position = self.movement.step(self.position, &self.world, &mut self.rng);

        let mut actions = vec![CallerAction::Moved {
            position: self.position,
        }];
        if !self.towers.is_empty() {
            self.survey = Some(Survey {
                tick,
                readings: BTreeMap::new(),
            });
            actions.push(CallerAction::RequestSignal {
                position: self.position,
            });
        }
        Ok(actions)
    }

    /// Records one tower's report. Once every registered tower has answered,
    /// the target is selected and the tick's decision is made.
    pub fn on_signal_report(&mut self, reading: SignalReading) -> Result<Vec<CallerAction>, CallerError> {
        let survey = match self.survey.as_mut() {
            Some(survey) if self.towers.contains(&reading.tower_id) && !survey.readings.contains_key(&reading.tower_id) => {
                survey
            }
            _ => {
                return Err(CallerError::Unexpected {
                    message: "SignalReport",
                    tower: reading.tower_id,
                    phase: self.state.phase(),
                })
            }
        };

        survey.readings.insert(reading.tower_id.clone(), reading);
        if survey.readings.len() < self.towers.len() {
            return Ok(Vec::new());
        }

        match self.survey.take() {
            Some(survey) => self.decide(survey),
            None => Ok(Vec::new()),
        }
    }

    fn decide(&mut self, survey: Survey) -> Result<Vec<CallerAction>, CallerError> {
        let tick = survey.tick;
        let target = match select_target(survey.readings.values()) {
            Some(target) => target.clone(),
            None => return Ok(Vec::new()),
        };

        let state = std::mem::replace(&mut self.state, ConnectionState::Idle);
        let (next, actions) = match state {
            ConnectionState::Idle if target.in_coverage() => {
                let cdr = Cdr::open(self.next_cdr_id(), self.id.clone(), target.tower_id.clone(), tick);
                self.calls_placed += 1;
                (
                    ConnectionState::AwaitingConnect {
                        target: target.tower_id.clone(),
                        cdr: cdr.clone(),
                    },
                    vec![CallerAction::Hello {
                        tower: target.tower_id,
                        cdr,
                        reconnect: false,
                    }],
                )
            }

            ConnectionState::Connected { tower, mut cdr, ends_at } => {
                let current_power = survey.readings.get(&tower).map_or(0.0, |r| r.power);

                if tick >= ends_at || !target.in_coverage() {
                    let outcome = if tick >= ends_at {
                        CdrState::Success
                    } else {
                        CdrState::Dropped
                    };
                    cdr.finalize(outcome, tick)?;
                    (ConnectionState::Idle, vec![CallerAction::Disconnect { tower, cdr }])
                } else if target.tower_id != tower && target.power > current_power + self.hysteresis_margin {
                    let candidate = target.tower_id;
                    let hello = CallerAction::Hello {
                        tower: candidate.clone(),
                        cdr: cdr.clone(),
                        reconnect: true,
                    };
                    (
                        ConnectionState::AwaitingHandoff {
                            tower,
                            candidate,
                            cdr,
                            ends_at,
                        },
                        vec![hello],
                    )
                } else {
                    (ConnectionState::Connected { tower, cdr, ends_at }, Vec::new())
                }
            }

            other => (other, Vec::new()),
        };

        self.state = next;
        Ok(actions)
    }

    /// Handles admission by `tower_id`.
    pub fn on_connect(&mut self, tower_id: EntityId) -> Result<Vec<CallerAction>, CallerError> {
        let state = std::mem::replace(&mut self.state, ConnectionState::Idle);
        match state {
            ConnectionState::AwaitingConnect { target, cdr } if target == tower_id => {
                let ends_at = self.last_tick.saturating_add(self.call_duration.sample(&mut self.rng));
                self.state = ConnectionState::Connected {
                    tower: target,
                    cdr,
                    ends_at,
                };
                Ok(Vec::new())
            }

            ConnectionState::AwaitingHandoff {
                tower,
                candidate,
                mut cdr,
                ends_at,
            } if candidate == tower_id => {
                // The old tower sees the record still open and only frees the slot.
                let release = CallerAction::Disconnect {
                    tower,
                    cdr: cdr.clone(),
                };
                cdr.hand_over(candidate.clone())?;
                self.handoffs += 1;
                self.state = ConnectionState::Connected {
                    tower: candidate,
                    cdr,
                    ends_at,
                };
                Ok(vec![release])
            }

            other => {
                let phase = other.phase();
                self.state = other;
                Err(CallerError::Unexpected {
                    message: "Connect",
                    tower: tower_id,
                    phase,
                })
            }
        }
    }

    /// Handles rejection by `tower_id`.
    pub fn on_fail(&mut self, tower_id: EntityId) -> Result<Vec<CallerAction>, CallerError> {
        let state = std::mem::replace(&mut self.state, ConnectionState::Idle);
        match state {
            ConnectionState::AwaitingConnect { target, mut cdr } if target == tower_id => {
                cdr.finalize(CdrState::Fail, self.last_tick)?;
                Ok(vec![CallerAction::Log { cdr }])
            }

            ConnectionState::AwaitingHandoff {
                tower,
                candidate,
                cdr,
                ends_at,
            } if candidate == tower_id => {
                self.state = ConnectionState::Connected { tower, cdr, ends_at };
                Ok(Vec::new())
            }

            other => {
                let phase = other.phase();
                self.state = other;
                Err(CallerError::Unexpected {
                    message: "Fail",
                    tower: tower_id,
                    phase,
                })
            }
        }
    }

    fn next_cdr_id(&mut self) -> CdrId {
        CdrId::from_bits(self.rng.gen::<u128>())
    }

    pub fn snapshot(&self) -> CallerSnapshot {
        CallerSnapshot {
            id: self.id.clone(),
            position: self.position,
            phase: self.state.phase(),
            tower: self.state.current_tower().cloned(),
            open_cdr: self.state.open_cdr().cloned(),
            calls_placed: self.calls_placed,
            handoffs: self.handoffs,
            last_tick: self.last_tick,
            ticks_displaced: 0,
        }
    }
}

/// Final state of a caller, reported at shutdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallerSnapshot {
    pub id: EntityId,
    pub position: Position,
    pub phase: Phase,
    pub tower: Option<EntityId>,
    pub open_cdr: Option<Cdr>,
    /// Connection attempts started, each opened one CDR
    pub calls_placed: u64,
    pub handoffs: u64,
    pub last_tick: u64,
    /// Ticks the clock lane discarded under `drop_oldest`; set by the runtime
    #[serde(default)]
    pub ticks_displaced: u64,
}
