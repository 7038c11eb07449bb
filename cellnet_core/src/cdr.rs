//! Call detail records.
//!
//! A CDR is opened when a caller sends its first `Hello` for a call and is
//! finalized exactly once, into exactly one terminal state. Handoffs carry
//! the open record forward to the new tower; they never close it.

use cellnet_env::EntityId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

/// Unique identity of one connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CdrId(pub Uuid);

impl CdrId {
    /// Creates an id from 128 random bits supplied by the caller's RNG.
    pub fn from_bits(bits: u128) -> Self {
        Self(Uuid::from_u128(bits))
    }
}

impl std::fmt::Display for CdrId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // First 8 chars are plenty for logs
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Terminal state of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CdrState {
    /// The call ran for its scripted duration and was ended by the caller
    Success,
    /// The tower rejected the initial connection
    Fail,
    /// The caller moved out of all coverage mid-call
    Dropped,
}

impl std::fmt::Display for CdrState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CdrState::Success => f.write_str("SUCCESS"),
            CdrState::Fail => f.write_str("FAIL"),
            CdrState::Dropped => f.write_str("DROPPED"),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CdrError {
    #[error("CDR {0} is already finalized")]
    AlreadyFinalized(CdrId),
}

/// A call detail record, open or finalized.
///
/// Fields are private: once `finalize` succeeds nothing can change the
/// record again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cdr {
    id: CdrId,
    caller_id: EntityId,
    tower_id: EntityId,
    start_tick: u64,
    end_tick: Option<u64>,
    state: Option<CdrState>,
    handoffs: u32,
}

impl Cdr {
    /// Opens a record for a new connection attempt.
    pub fn open(id: CdrId, caller_id: EntityId, tower_id: EntityId, start_tick: u64) -> Self {
        Self {
            id,
            caller_id,
            tower_id,
            start_tick,
            end_tick: None,
            state: None,
            handoffs: 0,
        }
    }

    pub fn id(&self) -> CdrId {
        self.id
    }

    pub fn caller_id(&self) -> &EntityId {
        &self.caller_id
    }

    /// The tower currently (or finally) serving the call.
    pub fn tower_id(&self) -> &EntityId {
        &self.tower_id
    }

    pub fn start_tick(&self) -> u64 {
        self.start_tick
    }

    pub fn end_tick(&self) -> Option<u64> {
        self.end_tick
    }

    pub fn state(&self) -> Option<CdrState> {
        self.state
    }

    pub fn handoffs(&self) -> u32 {
        self.handoffs
    }

    pub fn is_final(&self) -> bool {
        self.state.is_some()
    }

    /// Moves an open record to the tower that accepted a handoff.
    pub fn hand_over(&mut self, tower_id: EntityId) -> Result<(), CdrError> {
        if self.is_final() {
            return Err(CdrError::AlreadyFinalized(self.id));
        }
        self.tower_id = tower_id;
        self.handoffs += 1;
        Ok(())
    }

    /// Closes the record. Fails if it was already closed.
    pub fn finalize(&mut self, state: CdrState, end_tick: u64) -> Result<(), CdrError> {
        if self.is_final() {
            return Err(CdrError::AlreadyFinalized(self.id));
        }
        self.state = Some(state);
        self.end_tick = Some(end_tick.max(self.start_tick));
        Ok(())
    }

    /// Projects a finalized record onto the output tuple.
    pub fn to_record(&self) -> Option<CdrRecord> {
        Some(CdrRecord {
            caller_id: self.caller_id.clone(),
            tower_id: self.tower_id.clone(),
            start_tick: self.start_tick,
            end_tick: self.end_tick?,
            state: self.state?,
        })
    }
}

/// The externally visible form of a finalized CDR.
///
/// Serialized as `{"callerId", "towerId", "startTick", "endTick", "state"}`,
/// the shape the downstream aggregator parses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CdrRecord {
    pub caller_id: EntityId,
    pub tower_id: EntityId,
    pub start_tick: u64,
    pub end_tick: u64,
    pub state: CdrState,
}

impl CdrRecord {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

// =============================================================================
// PER-TOWER STATUS
// =============================================================================

/// Per-tower outcome counts over a window of records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TowerStats {
    pub total: u64,
    pub success: u64,
    pub fail: u64,
    pub dropped: u64,
}

impl TowerStats {
    /// Groups records by tower id.
    pub fn from_records<'a, I>(records: I) -> BTreeMap<EntityId, TowerStats>
    where
        I: IntoIterator<Item = &'a CdrRecord>,
    {
        let mut stats: BTreeMap<EntityId, TowerStats> = BTreeMap::new();
        for record in records {
            stats.entry(record.tower_id.clone()).or_default().add(record.state);
        }
        stats
    }

    pub fn add(&mut self, state: CdrState) {
        self.total += 1;
        match state {
            CdrState::Success => self.success += 1,
            CdrState::Fail => self.fail += 1,
            CdrState::Dropped => self.dropped += 1,
        }
    }

    /// `count(state != FAIL) / count(total)`, the figure the downstream
    /// aggregator republishes as `fails`. Zero for an empty window.
    pub fn fails_ratio(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.total - self.fail) as f64 / self.total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_cdr() -> Cdr {
        Cdr::open(
            CdrId::from_bits(1),
            EntityId::from("caller-1"),
            EntityId::from("tower-a"),
            3,
        )
    }

    #[test]
    fn test_finalize_exactly_once() {
        let mut cdr = open_cdr();
        assert!(!cdr.is_final());
        assert!(cdr.to_record().is_none());

        cdr.finalize(CdrState::Success, 9).unwrap();
        assert_eq!(cdr.state(), Some(CdrState::Success));
        assert_eq!(cdr.end_tick(), Some(9));

        let second = cdr.finalize(CdrState::Dropped, 10);
        assert_eq!(second, Err(CdrError::AlreadyFinalized(cdr.id())));
        assert_eq!(cdr.state(), Some(CdrState::Success));
        assert_eq!(cdr.end_tick(), Some(9));
    }

    #[test]
    fn test_hand_over_keeps_record_open() {
        let mut cdr = open_cdr();
        cdr.hand_over(EntityId::from("tower-b")).unwrap();

        assert!(!cdr.is_final());
        assert_eq!(cdr.tower_id().as_str(), "tower-b");
        assert_eq!(cdr.handoffs(), 1);
        assert_eq!(cdr.start_tick(), 3);

        cdr.finalize(CdrState::Dropped, 5).unwrap();
        assert!(cdr.hand_over(EntityId::from("tower-c")).is_err());
    }

    #[test]
    fn test_record_json_shape() {
        let mut cdr = open_cdr();
        cdr.finalize(CdrState::Fail, 3).unwrap();
        let json = cdr.to_record().unwrap().to_json().unwrap();

        assert_eq!(
            json,
            r#"{"callerId":"caller-1","towerId":"tower-a","startTick":3,"endTick":3,"state":"FAIL"}"#
        );
        let parsed = CdrRecord::from_json(&json).unwrap();
        assert_eq!(parsed.state, CdrState::Fail);
    }

    #[test]
    fn test_tower_stats_ratio() {
        let records: Vec<CdrRecord> = [CdrState::Success, CdrState::Fail, CdrState::Dropped, CdrState::Fail]
            .iter()
            .map(|state| CdrRecord {
                caller_id: EntityId::from("caller-1"),
                tower_id: EntityId::from("tower-a"),
                start_tick: 1,
                end_tick: 2,
                state: *state,
            })
            .collect();

        let stats = TowerStats::from_records(&records);
        let tower = &stats[&EntityId::from("tower-a")];
        assert_eq!(tower.total, 4);
        assert_eq!(tower.fail, 2);
        assert!((tower.fails_ratio() - 0.5).abs() < 1e-12);
        assert_eq!(TowerStats::default().fails_ratio(), 0.0);
    }
}
