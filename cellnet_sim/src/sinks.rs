//! Concrete CDR sinks.

use async_trait::async_trait;
use cellnet_core::CdrRecord;
use cellnet_env::{EnvError, RecordSink, SinkRecord};
use std::io::Write;
use std::sync::{Arc, Mutex};

/// Collects records in memory, optionally mirroring each one to an external
/// sink first.
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<SinkRecord>>,
    mirror: Option<Arc<dyn RecordSink>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A record is kept only once `mirror` has accepted it.
    pub fn mirroring(mirror: Arc<dyn RecordSink>) -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            mirror: Some(mirror),
        }
    }

    /// Snapshot of everything published so far.
    pub fn records(&self) -> Vec<SinkRecord> {
        self.records.lock().expect("sink poisoned").clone()
    }

    /// Decodes the collected payloads as CDRs, in publish order.
    pub fn cdrs(&self) -> Result<Vec<CdrRecord>, EnvError> {
        self.records()
            .iter()
            .map(|record| {
                let json = std::str::from_utf8(&record.payload).map_err(EnvError::serialization)?;
                CdrRecord::from_json(json).map_err(EnvError::serialization)
            })
            .collect()
    }
}

#[async_trait]
impl RecordSink for MemorySink {
    async fn publish(&self, record: SinkRecord) -> Result<(), EnvError> {
        if let Some(mirror) = &self.mirror {
            mirror.publish(record.clone()).await?;
        }
        self.records.lock().expect("sink poisoned").push(record);
        Ok(())
    }

    async fn flush(&self) -> Result<(), EnvError> {
        match &self.mirror {
            Some(mirror) => mirror.flush().await,
            None => Ok(()),
        }
    }
}

/// Writes one payload per line to any writer (a file, stdout, a buffer).
pub struct JsonLinesSink<W: Write + Send + 'static> {
    writer: Mutex<W>,
}

impl<W: Write + Send + 'static> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl<W: Write + Send + 'static> RecordSink for JsonLinesSink<W> {
    async fn publish(&self, record: SinkRecord) -> Result<(), EnvError> {
        let mut writer = self.writer.lock().map_err(|_| EnvError::sink("writer poisoned"))?;
        writer
            .write_all(&record.payload)
            .and_then(|_| writer.write_all(b"\n"))
            .map_err(|e| EnvError::sink(e.to_string()))
    }

    async fn flush(&self) -> Result<(), EnvError> {
        let mut writer = self.writer.lock().map_err(|_| EnvError::sink("writer poisoned"))?;
        writer.flush().map_err(|e| EnvError::sink(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cellnet_core::CdrState;

    fn record(sequence: u64, state: &str) -> SinkRecord {
        let payload = format!(
            r#"{{"callerId":"caller-1","towerId":"tower-a","startTick":1,"endTick":2,"state":"{}"}}"#,
            state
        );
        SinkRecord::new("cdrs", "tower-a", payload.into_bytes(), sequence)
    }

    #[tokio::test]
    async fn test_memory_sink_decodes_cdrs() {
        let sink = MemorySink::new();
        sink.publish(record(0, "DROPPED")).await.unwrap();

        let cdrs = sink.cdrs().unwrap();
        assert_eq!(cdrs.len(), 1);
        assert_eq!(cdrs[0].state, CdrState::Dropped);
    }

    struct RejectingSink;

    #[async_trait]
    impl RecordSink for RejectingSink {
        async fn publish(&self, _record: SinkRecord) -> Result<(), EnvError> {
            Err(EnvError::sink("broker unavailable"))
        }
    }

    #[tokio::test]
    async fn test_memory_sink_keeps_only_mirrored_records() {
        let lines = Arc::new(JsonLinesSink::new(Vec::new()));
        let sink = MemorySink::mirroring(Arc::clone(&lines) as Arc<dyn RecordSink>);
        sink.publish(record(0, "FAIL")).await.unwrap();
        sink.flush().await.unwrap();
        assert_eq!(sink.records().len(), 1);
        drop(sink);
        let text = String::from_utf8(Arc::try_unwrap(lines).ok().unwrap().into_inner()).unwrap();
        assert_eq!(text.lines().count(), 1);

        let sink = MemorySink::mirroring(Arc::new(RejectingSink));
        assert!(sink.publish(record(0, "FAIL")).await.is_err());
        assert!(sink.records().is_empty());
    }

    #[tokio::test]
    async fn test_json_lines_sink_writes_one_record_per_line() {
        let sink = JsonLinesSink::new(Vec::new());
        sink.publish(record(0, "FAIL")).await.unwrap();
        sink.publish(record(1, "SUCCESS")).await.unwrap();
        sink.flush().await.unwrap();

        let text = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].contains("SUCCESS"));
    }
}
