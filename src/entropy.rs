use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::partition::{Cell, Member};

/// Entropy of the values observed at one position of a group
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionEntropy {
    pub position: usize,
    /// Shannon entropy in nats
    pub entropy: f64,
    /// Entropy scaled by ln(N), in [0, 1]
    pub normalized: f64,
    pub distinct: usize,
    pub total: u64,
}

impl PositionEntropy {
    /// All members agree on the value
    pub fn is_constant(&self) -> bool {
        self.distinct <= 1
    }

    pub fn entropy_bits(&self) -> f64 {
        nats_to_bits(self.entropy)
    }
}

/// Shannon entropy (nats) of a distribution given as raw counts
///
/// Zero counts contribute nothing; groups of size 0 or 1 have entropy 0.
pub fn shannon_entropy<I>(counts: I, total: u64) -> f64
where
    I: IntoIterator<Item = u64>,
{
    if total <= 1 {
        return 0.0;
    }

    let inv_total = 1.0 / total as f64;
    let entropy: f64 = counts
        .into_iter()
        .filter(|&n| n > 0)
        .map(|n| {
            let p = n as f64 * inv_total;
            -p * p.ln()
        })
        .sum();

    // Rounding can push a constant distribution a hair below zero
    entropy.max(0.0)
}

/// Scale an entropy by its maximum ln(N) so thresholds do not depend on group size
pub fn normalized_entropy(entropy: f64, total: u64) -> f64 {
    if total <= 1 {
        return 0.0;
    }
    (entropy / (total as f64).ln()).clamp(0.0, 1.0)
}

/// Convert from nats (base e) to bits (base 2)
pub fn nats_to_bits(entropy: f64) -> f64 {
    entropy / std::f64::consts::LN_2
}

fn summarize(position: usize, counts: FxHashMap<&str, u64>) -> PositionEntropy {
    // Fixed summation order keeps equal distributions bit-identical across positions
    let mut values: Vec<u64> = counts.into_values().collect();
    values.sort_unstable();

    let total: u64 = values.iter().sum();
    let distinct = values.len();
    let entropy = shannon_entropy(values, total);

    PositionEntropy {
        position,
        entropy,
        normalized: normalized_entropy(entropy, total),
        distinct,
        total,
    }
}

/// Entropy at `position` across a group of equal-length token sequences
///
/// Panics if a sequence is shorter than `position + 1`; groups are always
/// drawn from a single length bucket.
pub fn group_entropy<'t, S>(group: &[S], position: usize) -> PositionEntropy
where
    S: AsRef<[&'t str]>,
{
    let mut counts: FxHashMap<&'t str, u64> = FxHashMap::default();
    for sequence in group {
        *counts.entry(sequence.as_ref()[position]).or_insert(0) += 1;
    }
    summarize(position, counts)
}

/// Weighted entropy at `position` across partition members.
///
/// Returns `None` when any member carries a wildcard at that position: the
/// member only kept per-value counts there, so the position cannot be used
/// as a split key.
pub fn position_entropy(members: &[Member<'_>], position: usize) -> Option<PositionEntropy> {
    let mut counts: FxHashMap<&str, u64> = FxHashMap::default();
    for member in members {
        match &member.cells[position] {
            Cell::Value(value) => *counts.entry(value.as_ref()).or_insert(0) += member.weight,
            Cell::Wildcard(_) => return None,
        }
    }
    Some(summarize(position, counts))
}
