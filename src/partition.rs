//! Entropy-driven partition engine
//!
//! Works on one length bucket at a time. A cluster is split on the position
//! whose values are most homogeneous, one position per step, until no
//! remaining position is homogeneous enough. The recursion is an explicit
//! FIFO work list so depth never depends on the call stack.
//!
//! Members are weighted: a raw line is a member of weight 1 whose cells borrow
//! from the line, while an already-discovered template re-enters as a single
//! member whose weight is its line count and whose wildcard positions carry
//! their value tables. Re-partitioning a bucket therefore never needs the raw
//! lines back.
//!
//! A template with one wildcard is expanded into one member per value before
//! partitioning, which reproduces its lines exactly. With two or more
//! wildcards only per-position counts exist, so those positions cannot be
//! split on and stay wildcards.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::VecDeque;

use crate::config::ClusterConfig;
use crate::entropy::{normalized_entropy, position_entropy, shannon_entropy, PositionEntropy};
use crate::histogram::ValueHistogram;
use crate::template::{Slot, Template, TemplateId};

/// One position of a member
#[derive(Debug, Clone, PartialEq)]
pub enum Cell<'a> {
    /// Every line represented by the member has this value
    Value(Cow<'a, str>),
    /// Lines represented by the member vary here; only counts survive
    Wildcard(ValueHistogram),
}

impl<'a> Cell<'a> {
    pub fn value(&self) -> Option<&str> {
        match self {
            Cell::Value(value) => Some(value.as_ref()),
            Cell::Wildcard(_) => None,
        }
    }
}

/// A weighted group element: one line, or one previously discovered template
#[derive(Debug, Clone, PartialEq)]
pub struct Member<'a> {
    pub cells: Vec<Cell<'a>>,
    pub weight: u64,
}

impl<'a> Member<'a> {
    pub fn new(cells: Vec<Cell<'a>>, weight: u64) -> Self {
        Self { cells, weight }
    }

    pub fn from_values(values: Vec<Cow<'a, str>>, weight: u64) -> Self {
        Self::new(values.into_iter().map(Cell::Value).collect(), weight)
    }

    /// A single line; tokens stay borrowed
    pub fn from_tokens(tokens: &[&'a str]) -> Self {
        Self::new(
            tokens
                .iter()
                .map(|token| Cell::Value(Cow::Borrowed(*token)))
                .collect(),
            1,
        )
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    fn sole_wildcard(&self) -> Option<usize> {
        let mut wildcards = self
            .cells
            .iter()
            .enumerate()
            .filter(|(_, cell)| matches!(cell, Cell::Wildcard(_)));
        match (wildcards.next(), wildcards.next()) {
            (Some((position, _)), None) => Some(position),
            _ => None,
        }
    }

    /// Replace a single wildcard by one member per observed value, in value order.
    ///
    /// Members without wildcards, or with several, are returned unchanged.
    pub fn expand(self) -> Vec<Member<'a>> {
        let Some(position) = self.sole_wildcard() else {
            return vec![self];
        };

        let Member { mut cells, weight } = self;
        let table = match std::mem::replace(&mut cells[position], Cell::Value(Cow::Borrowed(""))) {
            Cell::Wildcard(table) if table.total() == weight => table,
            other => {
                cells[position] = other;
                return vec![Member::new(cells, weight)];
            }
        };

        let mut values: Vec<(String, u64)> = table.into_counts().collect();
        values.sort_unstable();
        values
            .into_iter()
            .map(|(value, count)| {
                let mut cells = cells.clone();
                cells[position] = Cell::Value(Cow::Owned(value));
                Member::new(cells, count)
            })
            .collect()
    }
}

/// Why a cluster stopped splitting
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum TerminalReason {
    /// Every position is constant, already split on, or blocked by a wildcard member
    Exhausted,
    /// The most homogeneous position sits between the literal and wildcard thresholds
    AmbiguousBand { position: usize, normalized: f64 },
    /// Even the most homogeneous position is above the wildcard threshold
    TooVariable { position: usize, normalized: f64 },
}

/// Outcome of evaluating one cluster
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SplitDecision {
    Split {
        position: usize,
        entropy: PositionEntropy,
    },
    Terminal(TerminalReason),
}

/// A node of the partition tree
#[derive(Debug, Clone)]
pub struct Cluster<'a> {
    pub members: Vec<Member<'a>>,
    /// Positions used as split keys from the root to this node, in order
    pub split_path: Vec<usize>,
    resolved: Vec<bool>,
    terminal: Option<TerminalReason>,
}

impl<'a> Cluster<'a> {
    /// Root cluster of a bucket: all members, no position examined yet
    pub fn root(members: Vec<Member<'a>>, length: usize) -> Self {
        debug_assert!(members.iter().all(|m| m.len() == length));
        Self {
            members,
            split_path: Vec::new(),
            resolved: vec![false; length],
            terminal: None,
        }
    }

    pub fn length(&self) -> usize {
        self.resolved.len()
    }

    /// Number of lines represented by the cluster
    pub fn weight(&self) -> u64 {
        self.members.iter().map(|m| m.weight).sum()
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal.is_some()
    }

    pub fn terminal_reason(&self) -> Option<TerminalReason> {
        self.terminal
    }

    /// Positions that may still be evaluated for a split
    pub fn unresolved_positions(&self) -> impl Iterator<Item = usize> + '_ {
        self.resolved
            .iter()
            .enumerate()
            .filter(|(_, resolved)| !**resolved)
            .map(|(position, _)| position)
    }

    /// Materialize the cluster as a template.
    ///
    /// A position becomes a literal when every member holds the same value
    /// there; otherwise it becomes a wildcard whose table accumulates each
    /// member's value (or value table) with the member's weight.
    pub fn into_template(self, id: TemplateId) -> Template {
        let length = self.length();
        let count = self.weight();

        let literal: Vec<bool> = (0..length)
            .map(|position| {
                let mut values = self.members.iter().map(|m| m.cells[position].value());
                match values.next() {
                    Some(Some(first)) => values.all(|value| value == Some(first)),
                    _ => false,
                }
            })
            .collect();

        let mut slots: Vec<Option<Slot>> = (0..length).map(|_| None).collect();
        for member in self.members {
            let weight = member.weight;
            for (position, cell) in member.cells.into_iter().enumerate() {
                let slot = &mut slots[position];
                match cell {
                    Cell::Value(value) if literal[position] => {
                        if slot.is_none() {
                            *slot = Some(Slot::Literal(value.into_owned()));
                        }
                    }
                    Cell::Value(value) => {
                        wildcard_table(slot).add_weighted(value, weight);
                    }
                    Cell::Wildcard(table) => {
                        wildcard_table(slot).merge(table);
                    }
                }
            }
        }

        let slots = slots
            .into_iter()
            .map(|slot| slot.unwrap_or_else(|| Slot::Wildcard(ValueHistogram::new())))
            .collect();

        Template::new(id, slots, count)
    }
}

fn wildcard_table(slot: &mut Option<Slot>) -> &mut ValueHistogram {
    if !matches!(slot, Some(Slot::Wildcard(_))) {
        *slot = Some(Slot::Wildcard(ValueHistogram::new()));
    }
    match slot {
        Some(Slot::Wildcard(table)) => table,
        _ => unreachable!("slot was just set to a wildcard"),
    }
}

/// Splits clusters by minimum positional entropy
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PartitionEngine {
    literal_threshold: f64,
    wildcard_threshold: f64,
}

impl PartitionEngine {
    pub fn new(config: &ClusterConfig) -> Self {
        Self::with_thresholds(
            config.literal_entropy_threshold,
            config.wildcard_entropy_threshold,
        )
    }

    pub fn with_thresholds(literal_threshold: f64, wildcard_threshold: f64) -> Self {
        Self {
            literal_threshold,
            wildcard_threshold: wildcard_threshold.max(literal_threshold),
        }
    }

    pub fn literal_threshold(&self) -> f64 {
        self.literal_threshold
    }

    pub fn wildcard_threshold(&self) -> f64 {
        self.wildcard_threshold
    }

    /// Whether a literal shared by `count` lines gives way to one conflicting
    /// line. This is the decision `decide` makes for that pair of values.
    pub fn coalesces(&self, count: u64) -> bool {
        let total = count.saturating_add(1);
        let entropy = shannon_entropy([count, 1], total);
        normalized_entropy(entropy, total) > self.literal_threshold
    }

    /// Pick the next split position for a cluster.
    ///
    /// Constant positions are frozen as literals on the way (they are marked
    /// resolved without being added to the split path). Ties between equally
    /// homogeneous positions go to the lowest index.
    pub fn decide(&self, cluster: &mut Cluster<'_>) -> SplitDecision {
        let mut best: Option<PositionEntropy> = None;

        for position in 0..cluster.length() {
            if cluster.resolved[position] {
                continue;
            }
            let Some(entropy) = position_entropy(&cluster.members, position) else {
                continue;
            };
            if entropy.is_constant() {
                cluster.resolved[position] = true;
                continue;
            }
            if best.map_or(true, |b| entropy.normalized < b.normalized) {
                best = Some(entropy);
            }
        }

        match best {
            None => SplitDecision::Terminal(TerminalReason::Exhausted),
            Some(entropy) if entropy.normalized <= self.literal_threshold => SplitDecision::Split {
                position: entropy.position,
                entropy,
            },
            Some(entropy) if entropy.normalized <= self.wildcard_threshold => {
                SplitDecision::Terminal(TerminalReason::AmbiguousBand {
                    position: entropy.position,
                    normalized: entropy.normalized,
                })
            }
            Some(entropy) => SplitDecision::Terminal(TerminalReason::TooVariable {
                position: entropy.position,
                normalized: entropy.normalized,
            }),
        }
    }

    /// Partition a cluster's members by their value at `position`.
    ///
    /// Children appear in first-seen value order, each inheriting the split
    /// path plus `position`. Members holding a wildcard there (never chosen by
    /// `decide`) are grouped into one extra child.
    pub fn split<'a>(&self, cluster: Cluster<'a>, position: usize) -> Vec<Cluster<'a>> {
        let (assignment, groups) = {
            let mut index: FxHashMap<Option<&str>, usize> = FxHashMap::default();
            let assignment: Vec<usize> = cluster
                .members
                .iter()
                .map(|member| {
                    let next = index.len();
                    *index.entry(member.cells[position].value()).or_insert(next)
                })
                .collect();
            (assignment, index.len())
        };

        let mut children: Vec<Vec<Member<'a>>> = (0..groups).map(|_| Vec::new()).collect();
        for (member, group) in cluster.members.into_iter().zip(assignment) {
            children[group].push(member);
        }

        let mut split_path = cluster.split_path;
        split_path.push(position);
        let mut resolved = cluster.resolved;
        resolved[position] = true;

        children
            .into_iter()
            .map(|members| Cluster {
                members,
                split_path: split_path.clone(),
                resolved: resolved.clone(),
                terminal: None,
            })
            .collect()
    }

    /// Run the work list to completion and return the terminal clusters
    pub fn partition<'a>(&self, members: Vec<Member<'a>>, length: usize) -> Vec<Cluster<'a>> {
        let members: Vec<Member<'a>> = members.into_iter().flat_map(Member::expand).collect();
        if members.is_empty() {
            return Vec::new();
        }

        let mut work = VecDeque::new();
        work.push_back(Cluster::root(members, length));
        let mut terminals = Vec::new();

        while let Some(mut cluster) = work.pop_front() {
            match self.decide(&mut cluster) {
                SplitDecision::Split { position, entropy } => {
                    tracing::trace!(
                        "Splitting cluster of {} lines on position {} (normalized entropy {:.3})",
                        cluster.weight(),
                        position,
                        entropy.normalized
                    );
                    work.extend(self.split(cluster, position));
                }
                SplitDecision::Terminal(reason) => {
                    tracing::trace!(
                        "Terminal cluster of {} lines after path {:?}: {:?}",
                        cluster.weight(),
                        cluster.split_path,
                        reason
                    );
                    cluster.terminal = Some(reason);
                    terminals.push(cluster);
                }
            }
        }

        terminals
    }
}
