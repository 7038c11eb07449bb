//! Output boundary abstraction for records leaving the simulation.

use crate::error::EnvError;
use crate::types::SinkRecord;
use async_trait::async_trait;

/// Abstraction for the ordered external sink that receives finalized records.
///
/// # Implementations
///
/// - **Production**: a JSON-lines writer, or a bridge to a message broker
/// - **Simulation**: an in-memory collector used for assertions
///
/// # Ordering
///
/// Records are published by a single writer and must be delivered in the
/// order `publish` was called; `SinkRecord::sequence` makes the order
/// explicit for consumers that batch.
#[async_trait]
pub trait RecordSink: Send + Sync + 'static {
    /// Publishes one record.
    ///
    /// # Returns
    /// * `Ok(())` - Record accepted by the sink
    /// * `Err(EnvError::SinkError)` - The sink rejected or could not store it
    async fn publish(&self, record: SinkRecord) -> Result<(), EnvError>;

    /// Flushes any buffered records.
    async fn flush(&self) -> Result<(), EnvError> {
        Ok(())
    }
}
