//! Common types for the environment abstraction.

use serde::{Deserialize, Serialize};

/// Identity of a simulated entity (tower, caller, or the universe).
///
/// Identities are plain strings so they survive serialization unchanged and
/// order lexicographically, which is what tower tie-breaking relies on.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    /// Creates an identity from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identity as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for EntityId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for EntityId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Envelope for records leaving the simulation through a [`RecordSink`].
///
/// This is a transport-layer wrapper: the payload is opaque bytes already
/// encoded by the producer, the topic and key are routing hints for the
/// downstream consumer.
///
/// [`RecordSink`]: crate::RecordSink
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkRecord {
    /// Destination topic (e.g. `cdrs`)
    pub topic: String,

    /// Partitioning key (e.g. the tower id)
    pub key: String,

    /// Encoded record bytes
    pub payload: Vec<u8>,

    /// Position of this record in emission order, starting at 0
    pub sequence: u64,
}

impl SinkRecord {
    /// Creates a new record.
    pub fn new(topic: impl Into<String>, key: impl Into<String>, payload: Vec<u8>, sequence: u64) -> Self {
        Self {
            topic: topic.into(),
            key: key.into(),
            payload,
            sequence,
        }
    }

    /// Returns the payload size in bytes.
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_id_ordering_is_lexicographic() {
        let a = EntityId::from("tower-a");
        let b = EntityId::from("tower-b");
        assert!(a < b);
        assert_eq!(a.to_string(), "tower-a");
    }

    #[test]
    fn test_sink_record_size() {
        let record = SinkRecord::new("cdrs", "tower-a", vec![1, 2, 3], 0);
        assert_eq!(record.size(), 3);
        assert_eq!(record.topic, "cdrs");
    }
}
