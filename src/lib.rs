// Core modules
pub mod entropy;
pub mod histogram;
pub mod log_matcher;
pub mod partition;
pub mod template;
pub mod tokenizer;

// Public entry point and ambient stack
pub mod clusterer;
pub mod config;
pub mod error;

// Snapshot sinks
pub mod implementations;
pub mod traits;

pub use clusterer::{BatchSummary, ClustererStats, EventProfile, LogClusterer, VariableProbability};
pub use config::{ClusterConfig, UnmatchedPolicy};
pub use error::{ClusterError, Result};
pub use implementations::{JsonLinesSink, MemorySink, SnapshotEnvelope};
pub use log_matcher::{ClusterUpdateEvent, MatchResult, RepartitionSummary};
pub use template::{SlotRecord, TemplateId, TemplateRecord};
pub use tokenizer::{decode_line, tokenize, DelimiterPolicy, Tokenizer};
pub use traits::TemplateSink;
