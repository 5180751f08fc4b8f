use crate::template::TemplateRecord;
use crate::traits::TemplateSink;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;

/// One serialized snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEnvelope {
    /// 1-based position of the snapshot in the output stream
    pub sequence: u64,
    pub taken_at: DateTime<Utc>,
    pub template_count: usize,
    pub templates: Vec<TemplateRecord>,
}

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    sequence: u64,
    taken_at: DateTime<Utc>,
    template_count: usize,
    templates: &'a [TemplateRecord],
}

/// Writes each snapshot as a single JSON line
pub struct JsonLinesSink<W: Write> {
    writer: W,
    snapshots_written: u64,
}

impl<W: Write> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            snapshots_written: 0,
        }
    }

    pub fn snapshots_written(&self) -> u64 {
        self.snapshots_written
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> TemplateSink for JsonLinesSink<W> {
    fn write_snapshot(&mut self, records: &[TemplateRecord]) -> Result<()> {
        let envelope = EnvelopeRef {
            sequence: self.snapshots_written + 1,
            taken_at: Utc::now(),
            template_count: records.len(),
            templates: records,
        };

        serde_json::to_writer(&mut self.writer, &envelope)
            .context("Failed to serialize template snapshot")?;
        self.writer
            .write_all(b"\n")
            .context("Failed to write template snapshot")?;

        self.snapshots_written += 1;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush().context("Failed to flush snapshot output")
    }

    fn name(&self) -> &str {
        "json-lines"
    }
}

/// Keeps every snapshot in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    snapshots: Vec<Vec<TemplateRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshots(&self) -> &[Vec<TemplateRecord>] {
        &self.snapshots
    }

    pub fn latest(&self) -> Option<&[TemplateRecord]> {
        self.snapshots.last().map(Vec::as_slice)
    }
}

impl TemplateSink for MemorySink {
    fn write_snapshot(&mut self, records: &[TemplateRecord]) -> Result<()> {
        self.snapshots.push(records.to_vec());
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}
