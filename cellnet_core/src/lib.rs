//! Cellnet Core - Cellular Network Actor Simulation
//!
//! Towers, callers and a Universe exchange asynchronous messages:
//! 1. **Towers** answer signal surveys and admit callers up to a fixed capacity
//! 2. **Callers** move, survey every tower each tick, connect to the strongest
//!    and hand off when a better tower clears the hysteresis margin
//! 3. **The Universe** wires the population together, drives the clock and
//!    is the single writer of finalized call detail records (CDRs)
//!
//! The state machines (`tower`, `caller`) are pure; `runtime` binds them to
//! mailboxes from `cellnet_env`, and `universe` owns the lifecycle.

pub mod caller;
pub mod cdr;
pub mod config;
pub mod events;
pub mod geometry;
pub mod movement;
pub mod protocol;
pub mod runtime;
pub mod signal;
pub mod tower;
pub mod universe;

// Re-export key types for convenience
pub use caller::{Caller, CallerAction, CallerSnapshot, ConnectionState, Phase};
pub use cdr::{Cdr, CdrError, CdrId, CdrRecord, CdrState, TowerStats};
pub use config::{CallerGroup, ConfigError, SimConfig, TowerConfig};
pub use events::{EventBus, EventKind, EventSubscription, SimEvent};
pub use geometry::{Area, Position};
pub use movement::{CallDuration, MovementModel};
pub use protocol::{Addr, Message};
pub use runtime::CDR_TOPIC;
pub use signal::{select_target, SignalModel, SignalReading};
pub use tower::{Admission, Tower, TowerSnapshot};
pub use universe::{SimError, SimulationReport, Universe};
