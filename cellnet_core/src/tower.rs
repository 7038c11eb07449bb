//! Tower state: signal answers and admission control.
//!
//! The tower here is plain data plus decisions. The runtime owns one per
//! task and turns the decisions into replies.

use crate::config::TowerConfig;
use crate::geometry::Position;
use crate::signal::{SignalModel, SignalReading};
use cellnet_env::EntityId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Outcome of a `Hello`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    Rejected,
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted)
    }
}

#[derive(Debug, Clone)]
pub struct Tower {
    id: EntityId,
    position: Position,
    base_power: f64,
    capacity: usize,
    signal: SignalModel,
    connected: BTreeSet<EntityId>,
    admitted: u64,
    rejected: u64,
}

impl Tower {
    pub fn new(config: &TowerConfig, signal: SignalModel) -> Self {
        Self {
            id: config.id.clone(),
            position: config.position(),
            base_power: config.base_power,
            capacity: config.capacity,
            signal,
            connected: BTreeSet::new(),
            admitted: 0,
            rejected: 0,
        }
    }

    pub fn id(&self) -> &EntityId {
        &self.id
    }

    pub fn position(&self) -> Position {
        self.position
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn occupancy(&self) -> usize {
        self.connected.len()
    }

    pub fn is_connected(&self, caller_id: &EntityId) -> bool {
        self.connected.contains(caller_id)
    }

    /// Answers a survey from `(x, y)`. No side effects.
    pub fn signal_at(&self, at: Position) -> SignalReading {
        let distance = self.position.distance_to(&at);
        let power = self.signal.power(self.base_power, distance);
        SignalReading::new(self.id.clone(), distance, power)
    }

    /// Admits `caller_id` if a slot is free.
    ///
    /// A caller that is already connected is admitted again without taking a
    /// second slot.
    pub fn admit(&mut self, caller_id: &EntityId) -> Admission {
        if self.connected.contains(caller_id) {
            return Admission::Admitted;
        }
        if self.connected.len() < self.capacity {
            self.connected.insert(caller_id.clone());
            self.admitted += 1;
            Admission::Admitted
        } else {
            self.rejected += 1;
            Admission::Rejected
        }
    }

    /// Frees the caller's slot. Returns false if it held none.
    pub fn release(&mut self, caller_id: &EntityId) -> bool {
        self.connected.remove(caller_id)
    }

    pub fn snapshot(&self) -> TowerSnapshot {
        TowerSnapshot {
            id: self.id.clone(),
            position: self.position,
            capacity: self.capacity,
            connected: self.connected.iter().cloned().collect(),
            admitted: self.admitted,
            rejected: self.rejected,
        }
    }
}

/// Final state of a tower, reported at shutdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TowerSnapshot {
    pub id: EntityId,
    pub position: Position,
    pub capacity: usize,
    pub connected: Vec<EntityId>,
    /// Hellos that took a slot
    pub admitted: u64,
    /// Hellos answered with `Fail`
    pub rejected: u64,
}
