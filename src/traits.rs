//! Trait seams for the collaborators around the clustering core
//!
//! The core only produces `TemplateRecord` snapshots; where they end up
//! is decided by a sink.

use crate::template::TemplateRecord;
use anyhow::Result;

// ============================================================================
// Snapshot Sink Trait
// ============================================================================

/// Destination for template snapshots
///
/// Implementations can write to:
/// - JSON lines on any `io::Write`
/// - In-memory buffers for tests
pub trait TemplateSink: Send {
    /// Persist one complete snapshot
    fn write_snapshot(&mut self, records: &[TemplateRecord]) -> Result<()>;

    /// Push buffered output to its destination
    ///
    /// Default implementation does nothing
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    /// Get the name/identifier of this sink (for reporting)
    fn name(&self) -> &str;
}
