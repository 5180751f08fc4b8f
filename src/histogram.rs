use rustc_hash::FxHashMap;
use std::collections::BTreeMap;

/// Value-frequency table for one token position.
///
/// Besides the counts it keeps a running Σ n·ln(n) over all values so the
/// Shannon entropy of the table is available in O(1) after every update,
/// without rescanning the values.
#[derive(Debug, Clone, Default)]
pub struct ValueHistogram {
    counts: FxHashMap<String, u64>,
    total: u64,
    sum_n_ln_n: f64,
}

#[inline]
fn n_ln_n(n: u64) -> f64 {
    if n <= 1 {
        0.0
    } else {
        let n = n as f64;
        n * n.ln()
    }
}

impl ValueHistogram {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table from `(value, count)` pairs; zero counts are ignored
    pub fn from_counts<I, S>(counts: I) -> Self
    where
        I: IntoIterator<Item = (S, u64)>,
        S: AsRef<str> + Into<String>,
    {
        let mut hist = Self::new();
        for (value, count) in counts {
            hist.add_weighted(value, count);
        }
        hist
    }

    /// Record one occurrence of a value
    pub fn add(&mut self, value: &str) {
        self.add_weighted(value, 1);
    }

    /// Record `weight` occurrences of a value. The key is only allocated when the value is new.
    pub fn add_weighted<S>(&mut self, value: S, weight: u64)
    where
        S: AsRef<str> + Into<String>,
    {
        if weight == 0 {
            return;
        }

        let before = match self.counts.get_mut(value.as_ref()) {
            Some(count) => {
                let before = *count;
                *count += weight;
                before
            }
            None => {
                self.counts.insert(value.into(), weight);
                0
            }
        };

        self.sum_n_ln_n += n_ln_n(before + weight) - n_ln_n(before);
        self.total += weight;
    }

    /// Merge another table into this one, reusing its keys
    pub fn merge(&mut self, other: ValueHistogram) {
        if self.counts.is_empty() {
            *self = other;
            return;
        }
        for (value, count) in other.counts {
            self.add_weighted(value, count);
        }
    }

    pub fn get_count(&self, value: &str) -> u64 {
        self.counts.get(value).copied().unwrap_or(0)
    }

    /// Total number of recorded occurrences
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Number of distinct values
    pub fn distinct(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Relative frequency of a value, 0.0 when the table is empty
    pub fn probability(&self, value: &str) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.get_count(value) as f64 / self.total as f64
    }

    /// Shannon entropy in nats: ln(N) - Σ n·ln(n) / N
    pub fn entropy(&self) -> f64 {
        if self.total <= 1 || self.counts.len() <= 1 {
            return 0.0;
        }
        let total = self.total as f64;
        (total.ln() - self.sum_n_ln_n / total).max(0.0)
    }

    /// Entropy scaled by its upper bound ln(N), in [0, 1]
    pub fn normalized_entropy(&self) -> f64 {
        if self.total <= 1 || self.counts.len() <= 1 {
            return 0.0;
        }
        (self.entropy() / (self.total as f64).ln()).clamp(0.0, 1.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.counts.iter().map(|(value, &count)| (value.as_str(), count))
    }

    /// Consume the table into `(value, count)` pairs, unordered
    pub fn into_counts(self) -> impl Iterator<Item = (String, u64)> {
        self.counts.into_iter()
    }

    /// Deterministically ordered copy of the counts
    pub fn to_sorted_map(&self) -> BTreeMap<String, u64> {
        self.counts
            .iter()
            .map(|(value, &count)| (value.clone(), count))
            .collect()
    }
}

impl PartialEq for ValueHistogram {
    fn eq(&self, other: &Self) -> bool {
        self.total == other.total && self.counts == other.counts
    }
}
