/// Log Clustering CLI
///
/// Reads log lines from a file (first argument) or stdin, discovers templates
/// and writes JSON-lines template snapshots to stdout. Logs go to stderr.
///
/// Configuration comes from LOG_CLUSTER_* environment variables (a `.env`
/// file is honored); LOG_CLUSTER_SNAPSHOT_EVERY emits an intermediate
/// snapshot every N lines.

use anyhow::{Context, Result};
use log_cluster::{
    decode_line, ClusterConfig, ClusterUpdateEvent, JsonLinesSink, LogClusterer, TemplateSink,
    UnmatchedPolicy,
};
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter};
use std::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Default)]
struct RunCounters {
    lines: u64,
    malformed: u64,
    blank: u64,
    new_templates: u64,
    widened: u64,
    repartitions: u64,
}

impl RunCounters {
    fn record(&mut self, event: &ClusterUpdateEvent) {
        match event {
            ClusterUpdateEvent::Skipped => self.blank += 1,
            ClusterUpdateEvent::NewTemplate { .. } => self.new_templates += 1,
            ClusterUpdateEvent::Widened { .. } => self.widened += 1,
            ClusterUpdateEvent::Repartitioned { .. } => self.repartitions += 1,
            ClusterUpdateEvent::Absorbed { .. } => {}
        }
    }
}

fn open_input() -> Result<Box<dyn BufRead>> {
    match std::env::args().nth(1) {
        Some(path) if path != "-" => {
            let file = File::open(&path).with_context(|| format!("Failed to open {}", path))?;
            info!("Reading log lines from {}", path);
            Ok(Box::new(BufReader::new(file)))
        }
        _ => {
            info!("Reading log lines from stdin");
            Ok(Box::new(BufReader::new(io::stdin())))
        }
    }
}

fn snapshot_every() -> Result<Option<u64>> {
    match std::env::var("LOG_CLUSTER_SNAPSHOT_EVERY") {
        Ok(value) => {
            let every: u64 = value
                .trim()
                .parse()
                .with_context(|| format!("Invalid LOG_CLUSTER_SNAPSHOT_EVERY: {:?}", value))?;
            Ok((every > 0).then_some(every))
        }
        Err(_) => Ok(None),
    }
}

/// Snapshot for output. Under seed-new routing, buckets are re-partitioned
/// first so the emitted templates match what a full re-partition would give.
fn write_snapshot<S: TemplateSink>(clusterer: &LogClusterer, sink: &mut S) -> Result<()> {
    if clusterer.config().unmatched_policy == UnmatchedPolicy::SeedNew {
        let summary = clusterer.consolidate();
        info!(
            "Consolidated {} -> {} templates before snapshot",
            summary.templates_before, summary.templates_after
        );
    }
    sink.write_snapshot(&clusterer.snapshot())?;
    sink.flush()?;
    Ok(())
}

/// Decode and ingest one chunk of raw lines
fn ingest_chunk(clusterer: &LogClusterer, raw: &[Vec<u8>], counters: &mut RunCounters) {
    let mut lines = Vec::with_capacity(raw.len());
    for (offset, bytes) in raw.iter().enumerate() {
        match decode_line(bytes) {
            Ok(line) => lines.push(line),
            Err(e) => {
                counters.malformed += 1;
                warn!(
                    "Skipping line {}: {}",
                    counters.lines + offset as u64 + 1,
                    e
                );
            }
        }
    }

    for event in clusterer.ingest_batch(&lines) {
        counters.record(&event);
    }
    counters.lines += raw.len() as u64;
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_target(false)
        .with_thread_ids(true)
        .init();

    let config = ClusterConfig::from_env().context("Invalid clustering configuration")?;
    config.log_config();
    let every = snapshot_every()?;
    if let Some(every) = every {
        info!("   Snapshot every: {} lines", every);
    }

    let chunk_size = match every {
        Some(every) => config.batch_size.min(every as usize),
        None => config.batch_size,
    };

    let clusterer = LogClusterer::with_config(config)?;
    let mut sink = JsonLinesSink::new(BufWriter::new(io::stdout()));
    let mut input = open_input()?;

    let start = Instant::now();
    let mut counters = RunCounters::default();
    let mut since_snapshot = 0u64;
    let mut chunk: Vec<Vec<u8>> = Vec::with_capacity(chunk_size);

    loop {
        let mut buf = Vec::new();
        let read = input
            .read_until(b'\n', &mut buf)
            .context("Failed to read input")?;
        if read > 0 {
            chunk.push(buf);
        }

        if chunk.len() >= chunk_size || (read == 0 && !chunk.is_empty()) {
            ingest_chunk(&clusterer, &chunk, &mut counters);
            since_snapshot += chunk.len() as u64;
            chunk.clear();

            if let Some(every) = every {
                if since_snapshot >= every {
                    write_snapshot(&clusterer, &mut sink)?;
                    since_snapshot = 0;
                }
            }
        }

        if read == 0 {
            break;
        }
    }

    write_snapshot(&clusterer, &mut sink)?;

    let stats = clusterer.stats();
    let elapsed = start.elapsed();
    info!("Clustering complete:");
    info!("   Lines read: {}", counters.lines);
    info!("   Malformed lines skipped: {}", counters.malformed);
    info!("   Blank lines skipped: {}", counters.blank);
    info!(
        "   Templates: {} across {} length buckets",
        stats.templates, stats.buckets
    );
    info!(
        "   New templates: {}, widened: {}, re-partitions: {}",
        counters.new_templates, counters.widened, counters.repartitions
    );
    info!(
        "   Snapshots written: {} ({})",
        sink.snapshots_written(),
        sink.name()
    );
    info!(
        "   Elapsed: {:.2?} ({:.0} lines/sec)",
        elapsed,
        counters.lines as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );

    Ok(())
}
