//! Length-sharded template clustering
//!
//! Each token count owns one `LengthBucket` behind its own mutex, so
//! absorption and re-partition are serialized per bucket while different
//! lengths proceed in parallel. The bucket map itself is only write-locked
//! when a new length appears.

use rayon::prelude::*;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::config::ClusterConfig;
use crate::error::{ClusterError, Result};
use crate::log_matcher::{
    ClusterUpdateEvent, IdAllocator, LengthBucket, MatchResult, RepartitionSummary,
};
use crate::partition::{Member, PartitionEngine};
use crate::template::{Slot, Template, TemplateId, TemplateRecord};
use crate::tokenizer::{decode_line, TokenSequence, Tokenizer};

type SharedBucket = Arc<Mutex<LengthBucket>>;

/// Outcome of an offline `partition_batch` run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    /// Lines partitioned
    pub lines: usize,
    /// Blank lines ignored
    pub skipped: usize,
    /// Buckets touched by the batch
    pub buckets: usize,
    pub templates_before: usize,
    pub templates_after: usize,
}

/// Totals across all buckets
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClustererStats {
    pub buckets: usize,
    pub templates: usize,
    pub lines: u64,
}

/// Probability of one variable value within its template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableProbability {
    pub position: usize,
    pub value: String,
    pub probability: f64,
}

/// How usual a line is given everything ingested so far.
///
/// Each variable probability is the marginal frequency of the value at its
/// own position within the template. Positions are treated as independent;
/// no joint distribution across positions is kept, so the product of these
/// probabilities only approximates the probability of the full combination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventProfile {
    /// Matching template, `None` for an unseen event
    pub template_id: Option<TemplateId>,
    /// Template count over total lines; `1 / (total + 1)` for an unseen event
    pub event_probability: f64,
    pub variable_probabilities: Vec<VariableProbability>,
}

/// Incremental template discovery over a stream of log lines.
///
/// ```
/// use log_cluster::LogClusterer;
///
/// let clusterer = LogClusterer::new();
/// for line in ["SSH user1 connect", "SSH user2 connect"] {
///     clusterer.ingest(line);
/// }
/// let snapshot = clusterer.snapshot();
/// assert_eq!(snapshot.len(), 1);
/// assert_eq!(snapshot[0].event(), "SSH * connect");
/// ```
pub struct LogClusterer {
    config: ClusterConfig,
    tokenizer: Tokenizer,
    engine: PartitionEngine,
    buckets: RwLock<FxHashMap<usize, SharedBucket>>,
    ids: IdAllocator,
}

impl LogClusterer {
    /// Clusterer with the default configuration
    pub fn new() -> Self {
        let config = ClusterConfig::default();
        Self {
            engine: PartitionEngine::new(&config),
            tokenizer: Tokenizer::whitespace(),
            config,
            buckets: RwLock::new(FxHashMap::default()),
            ids: IdAllocator::new(),
        }
    }

    pub fn with_config(config: ClusterConfig) -> Result<Self> {
        config.validate()?;
        let tokenizer = Tokenizer::new(&config.delimiter)?;
        let engine = PartitionEngine::new(&config);

        Ok(Self {
            config,
            tokenizer,
            engine,
            buckets: RwLock::new(FxHashMap::default()),
            ids: IdAllocator::new(),
        })
    }

    /// Resume from previously exported templates. Ids are preserved and new
    /// templates are numbered after the highest one seen.
    ///
    /// Records are rejected as malformed when an id is 0, `u64::MAX` or
    /// repeated, or when two templates of one length could match the same line.
    pub fn from_snapshot<I>(config: ClusterConfig, records: I) -> Result<Self>
    where
        I: IntoIterator<Item = TemplateRecord>,
    {
        let clusterer = Self::with_config(config)?;

        let mut seen: FxHashSet<TemplateId> = FxHashSet::default();
        let mut by_length: FxHashMap<usize, Vec<Template>> = FxHashMap::default();
        for record in records {
            if record.template_id == 0 || record.template_id == TemplateId::MAX {
                return Err(ClusterError::MalformedInput {
                    reason: format!("template id {} is reserved", record.template_id),
                });
            }
            if !seen.insert(record.template_id) {
                return Err(ClusterError::MalformedInput {
                    reason: format!("template id {} appears more than once", record.template_id),
                });
            }

            if record.slots.is_empty() || record.length != record.slots.len() {
                return Err(ClusterError::MalformedInput {
                    reason: format!(
                        "template {} declares length {} with {} slots",
                        record.template_id,
                        record.length,
                        record.slots.len()
                    ),
                });
            }

            let template = record.into_template();
            if !template.counts_conserved() {
                return Err(ClusterError::MalformedInput {
                    reason: format!(
                        "template {} has wildcard counts that do not total {}",
                        template.id(),
                        template.count()
                    ),
                });
            }

            clusterer.ids.reserve_through(template.id());
            by_length.entry(template.len()).or_default().push(template);
        }

        for templates in by_length.values() {
            for (i, first) in templates.iter().enumerate() {
                if let Some(second) = templates[i + 1..].iter().find(|t| first.overlaps(t)) {
                    return Err(ClusterError::MalformedInput {
                        reason: format!(
                            "templates {} and {} can match the same line",
                            first.id(),
                            second.id()
                        ),
                    });
                }
            }
        }

        {
            let mut buckets = clusterer.write_buckets();
            for (length, templates) in by_length {
                tracing::debug!(
                    "Restored {} templates for length {}",
                    templates.len(),
                    length
                );
                buckets.insert(
                    length,
                    Arc::new(Mutex::new(LengthBucket::with_templates(length, templates))),
                );
            }
        }

        Ok(clusterer)
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Tokenize and route one line
    pub fn ingest(&self, line: &str) -> ClusterUpdateEvent {
        let tokens = self.tokenizer.tokenize(line);
        if tokens.is_empty() {
            return ClusterUpdateEvent::Skipped;
        }

        let shared = self.bucket(tokens.len());
        let mut bucket = lock_bucket(&shared);
        bucket.route(&tokens, self.config.unmatched_policy, &self.engine, &self.ids)
    }

    /// Decode raw line bytes and ingest them. Undecodable bytes are rejected
    /// without touching any bucket.
    pub fn ingest_bytes(&self, bytes: &[u8]) -> Result<ClusterUpdateEvent> {
        let line = decode_line(bytes)?;
        Ok(self.ingest(line))
    }

    /// Ingest many lines, one rayon task per length bucket.
    ///
    /// Lines of the same length are routed in input order, so every bucket
    /// ends up exactly as if the lines had been ingested one by one. Events
    /// are returned in input order; ids of templates opened in different
    /// buckets may interleave differently from a sequential run.
    pub fn ingest_batch(&self, lines: &[&str]) -> Vec<ClusterUpdateEvent> {
        let mut groups: FxHashMap<usize, Vec<(usize, TokenSequence<'_>)>> = FxHashMap::default();
        for (index, line) in lines.iter().enumerate() {
            let tokens = self.tokenizer.tokenize(line);
            if !tokens.is_empty() {
                groups.entry(tokens.len()).or_default().push((index, tokens));
            }
        }

        let routed: Vec<(usize, ClusterUpdateEvent)> = groups
            .into_par_iter()
            .flat_map_iter(|(length, group)| {
                let shared = self.bucket(length);
                let mut bucket = lock_bucket(&shared);
                let events: Vec<(usize, ClusterUpdateEvent)> = group
                    .into_iter()
                    .map(|(index, tokens)| {
                        let event = bucket.route(
                            &tokens,
                            self.config.unmatched_policy,
                            &self.engine,
                            &self.ids,
                        );
                        (index, event)
                    })
                    .collect();
                events
            })
            .collect();

        let mut events = vec![ClusterUpdateEvent::Skipped; lines.len()];
        for (index, event) in routed {
            events[index] = event;
        }
        events
    }

    /// Offline mode: each touched bucket is re-partitioned once from its
    /// current templates plus every new line of that length.
    pub fn partition_batch(&self, lines: &[&str]) -> BatchSummary {
        let mut skipped = 0;
        let mut groups: FxHashMap<usize, Vec<Member<'_>>> = FxHashMap::default();
        for line in lines {
            let tokens = self.tokenizer.tokenize(line);
            if tokens.is_empty() {
                skipped += 1;
                continue;
            }
            groups
                .entry(tokens.len())
                .or_default()
                .push(Member::from_tokens(&tokens));
        }

        let buckets = groups.len();
        let (templates_before, templates_after) = groups
            .into_par_iter()
            .map(|(length, members)| {
                let shared = self.bucket(length);
                let mut bucket = lock_bucket(&shared);
                let summary = bucket.repartition(members, &self.engine, &self.ids);
                (summary.templates_before, summary.templates_after)
            })
            .reduce(|| (0, 0), |a, b| (a.0 + b.0, a.1 + b.1));

        let summary = BatchSummary {
            lines: lines.len() - skipped,
            skipped,
            buckets,
            templates_before,
            templates_after,
        };
        tracing::debug!(
            "Partitioned {} lines across {} buckets: {} -> {} templates",
            summary.lines,
            summary.buckets,
            summary.templates_before,
            summary.templates_after
        );
        summary
    }

    /// Re-partition every bucket from its aggregated counts
    pub fn consolidate(&self) -> RepartitionSummary {
        let (templates_before, templates_after) = self
            .shared_buckets()
            .par_iter()
            .map(|shared| {
                let summary = lock_bucket(shared).consolidate(&self.engine, &self.ids);
                (summary.templates_before, summary.templates_after)
            })
            .reduce(|| (0, 0), |a, b| (a.0 + b.0, a.1 + b.1));

        RepartitionSummary {
            templates_before,
            templates_after,
        }
    }

    /// Immutable view of every template in ascending id order.
    ///
    /// Each bucket is copied under its lock and exported after the lock is
    /// released, so ingestion into that bucket only waits for the copy.
    pub fn snapshot(&self) -> Vec<TemplateRecord> {
        let literal = self.engine.literal_threshold();
        let wildcard = self.engine.wildcard_threshold();

        let mut records: Vec<TemplateRecord> = Vec::new();
        for shared in self.shared_buckets() {
            let templates = lock_bucket(&shared).templates().to_vec();
            records.extend(templates.iter().map(|t| t.export(literal, wildcard)));
        }

        records.sort_by_key(|record| record.template_id);
        records
    }

    /// Find the template a line belongs to without changing any counts
    pub fn lookup(&self, line: &str) -> MatchResult {
        let tokens = self.tokenizer.tokenize(line);
        let Some(shared) = self.existing_bucket(tokens.len()) else {
            return MatchResult::unmatched();
        };

        let bucket = lock_bucket(&shared);
        match bucket.find(&tokens) {
            Some(template) => MatchResult {
                matched: true,
                template_id: Some(template.id()),
                event: Some(template.event()),
                variables: template
                    .extract_variables(&tokens)
                    .into_iter()
                    .map(str::to_string)
                    .collect(),
            },
            None => MatchResult::unmatched(),
        }
    }

    /// Event and variable probabilities for a line, read-only
    pub fn profile(&self, line: &str) -> EventProfile {
        let total = self.stats().lines;
        let unseen = EventProfile {
            template_id: None,
            event_probability: 1.0 / (total + 1) as f64,
            variable_probabilities: Vec::new(),
        };

        let tokens = self.tokenizer.tokenize(line);
        let Some(shared) = self.existing_bucket(tokens.len()) else {
            return unseen;
        };
        let bucket = lock_bucket(&shared);
        let Some(template) = bucket.find(&tokens) else {
            return unseen;
        };

        let variable_probabilities = template
            .slots()
            .iter()
            .zip(tokens.iter())
            .enumerate()
            .filter_map(|(position, (slot, token))| match slot {
                Slot::Wildcard(table) => Some(VariableProbability {
                    position,
                    value: (*token).to_string(),
                    probability: table.probability(token),
                }),
                Slot::Literal(_) => None,
            })
            .collect();

        EventProfile {
            template_id: Some(template.id()),
            // The bucket may have grown since `total` was read
            event_probability: template.count() as f64 / total.max(template.count()) as f64,
            variable_probabilities,
        }
    }

    pub fn stats(&self) -> ClustererStats {
        let mut stats = ClustererStats::default();
        for shared in self.shared_buckets() {
            let bucket = lock_bucket(&shared);
            stats.buckets += 1;
            stats.templates += bucket.templates().len();
            stats.lines += bucket.line_count();
        }
        stats
    }

    fn bucket(&self, length: usize) -> SharedBucket {
        if let Some(shared) = self.existing_bucket(length) {
            return shared;
        }

        let mut buckets = self.write_buckets();
        Arc::clone(
            buckets
                .entry(length)
                .or_insert_with(|| Arc::new(Mutex::new(LengthBucket::new(length)))),
        )
    }

    fn existing_bucket(&self, length: usize) -> Option<SharedBucket> {
        self.read_buckets().get(&length).cloned()
    }

    fn shared_buckets(&self) -> Vec<SharedBucket> {
        self.read_buckets().values().cloned().collect()
    }

    fn read_buckets(&self) -> RwLockReadGuard<'_, FxHashMap<usize, SharedBucket>> {
        self.buckets.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_buckets(&self) -> RwLockWriteGuard<'_, FxHashMap<usize, SharedBucket>> {
        self.buckets.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for LogClusterer {
    fn default() -> Self {
        Self::new()
    }
}

fn lock_bucket(bucket: &Mutex<LengthBucket>) -> MutexGuard<'_, LengthBucket> {
    bucket.lock().unwrap_or_else(PoisonError::into_inner)
}
