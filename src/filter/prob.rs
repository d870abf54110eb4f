// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Conditional pass-rate statistics.

use super::{FilterId, INVALID_FILTER_ID};

/// Bucket count of the conditional pass-rate table. Must be a power of two.
pub const PROB_HASH_BUCKETS: usize = 64;

/// Observed execution statistic for one filter behind one ordered set of
/// predecessors.
#[derive(Debug)]
pub struct ProbEntry {
    cur: FilterId,
    prev: Vec<FilterId>,
    num_exec: u64,
    num_pass: u64,
}

impl ProbEntry {
    /// The filter this entry describes ([`INVALID_FILTER_ID`] for union
    /// entries).
    #[must_use]
    pub fn cur(&self) -> FilterId {
        self.cur
    }

    /// The sorted predecessor set.
    #[must_use]
    pub fn prev(&self) -> &[FilterId] {
        &self.prev
    }

    /// Times the filter executed behind exactly these predecessors.
    #[must_use]
    pub fn num_exec(&self) -> u64 {
        self.num_exec
    }

    /// Times it passed.
    #[must_use]
    pub fn num_pass(&self) -> u64 {
        self.num_pass
    }

    /// Observed conditional pass rate.
    #[must_use]
    pub fn pass_rate(&self) -> f64 {
        if self.num_exec == 0 {
            0.0
        } else {
            self.num_pass as f64 / self.num_exec as f64
        }
    }
}

/// Conditional pass-rate table keyed by `(filter, sorted predecessor set)`.
///
/// Entries are created lazily on first observation. Alongside each direct
/// entry, a *union* entry keyed `(INVALID_FILTER_ID, predecessors + filter)`
/// accumulates the statistic used when evaluating sub-permutations.
///
/// Lookup is a bucketed hash: xxh3 over the key tuple, masked to
/// [`PROB_HASH_BUCKETS`].
#[derive(Debug)]
pub struct ProbTable {
    buckets: Vec<Vec<ProbEntry>>,
}

impl Default for ProbTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProbTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        let mut buckets = Vec::with_capacity(PROB_HASH_BUCKETS);
        buckets.resize_with(PROB_HASH_BUCKETS, Vec::new);

        Self { buckets }
    }

    fn hash(cur: FilterId, sorted: &[FilterId]) -> usize {
        use xxhash_rust::xxh3::Xxh3;

        let mut hasher = Xxh3::new();
        hasher.update(&cur.raw().to_le_bytes());
        hasher.update(&(sorted.len() as u32).to_le_bytes());
        for id in sorted {
            hasher.update(&id.raw().to_le_bytes());
        }

        (hasher.digest() as usize) & (PROB_HASH_BUCKETS - 1)
    }

    /// Looks up the entry for `cur` behind the given predecessors
    /// (sorted internally, so caller ordering does not matter).
    #[must_use]
    pub fn lookup(&self, cur: FilterId, prev: &[FilterId]) -> Option<&ProbEntry> {
        let mut sorted = prev.to_vec();
        sorted.sort_unstable();

        self.lookup_sorted(cur, &sorted)
    }

    fn lookup_sorted(&self, cur: FilterId, sorted: &[FilterId]) -> Option<&ProbEntry> {
        self.buckets
            .get(Self::hash(cur, sorted))?
            .iter()
            .find(|e| e.cur == cur && e.prev == sorted)
    }

    fn bump(&mut self, cur: FilterId, sorted: &[FilterId], pass: bool) {
        let hash = Self::hash(cur, sorted);

        let Some(bucket) = self.buckets.get_mut(hash) else {
            return;
        };

        let entry = if let Some(idx) = bucket.iter().position(|e| e.cur == cur && e.prev == sorted)
        {
            bucket.get_mut(idx)
        } else {
            bucket.push(ProbEntry {
                cur,
                prev: sorted.to_vec(),
                num_exec: 0,
                num_pass: 0,
            });
            bucket.last_mut()
        };

        if let Some(entry) = entry {
            entry.num_exec += 1;
            if pass {
                entry.num_pass += 1;
            }
        }
    }

    /// Records one observation: `cur` executed behind `prev` and passed or
    /// dropped.
    ///
    /// Commutative in `prev` ordering; both the direct entry and the union
    /// entry are updated.
    pub fn update(&mut self, cur: FilterId, prev: &[FilterId], pass: bool) {
        let mut sorted = prev.to_vec();
        sorted.sort_unstable();

        self.bump(cur, &sorted, pass);

        // union statistic over prev + cur
        sorted.push(cur);
        sorted.sort_unstable();

        self.bump(INVALID_FILTER_ID, &sorted, pass);
    }

    /// Conditional pass rate of `cur` behind `prev`, if observed.
    #[must_use]
    pub fn pass_rate(&self, cur: FilterId, prev: &[FilterId]) -> Option<f64> {
        self.lookup(cur, prev)
            .filter(|e| e.num_exec > 0)
            .map(ProbEntry::pass_rate)
    }

    /// Number of entries across all buckets (union entries included).
    #[must_use]
    pub fn len(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }

    /// Whether no observation was recorded yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::ProbTable;
    use crate::filter::{FilterId, INVALID_FILTER_ID};
    use test_log::test;

    #[test]
    fn prob_creates_direct_and_union_entries() {
        let mut table = ProbTable::new();
        let f0 = FilterId::new(0);
        let f1 = FilterId::new(1);

        table.update(f1, &[f0], true);

        assert_eq!(2, table.len());

        let direct = table.lookup(f1, &[f0]).expect("should exist");
        assert_eq!(1, direct.num_exec());
        assert_eq!(1, direct.num_pass());

        let union = table.lookup(INVALID_FILTER_ID, &[f0, f1]).expect("should exist");
        assert_eq!(1, union.num_exec());
    }

    #[test]
    fn prob_update_is_commutative_in_prev_order() {
        let mut table = ProbTable::new();
        let (a, b, c) = (FilterId::new(3), FilterId::new(1), FilterId::new(7));

        table.update(c, &[a, b], true);
        table.update(c, &[b, a], false);

        // both observations land on the same entry
        let entry = table.lookup(c, &[b, a]).expect("should exist");
        assert_eq!(2, entry.num_exec());
        assert_eq!(1, entry.num_pass());

        // one direct + one union entry in total
        assert_eq!(2, table.len());
    }

    #[test]
    fn prob_pass_rate() {
        let mut table = ProbTable::new();
        let f0 = FilterId::new(0);

        assert!(table.pass_rate(f0, &[]).is_none());

        for i in 0..10 {
            table.update(f0, &[], i % 2 == 0);
        }

        let rate = table.pass_rate(f0, &[]).expect("should exist");
        assert!((rate - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn prob_distinct_predecessor_sets_are_distinct_entries() {
        let mut table = ProbTable::new();
        let f0 = FilterId::new(0);
        let f1 = FilterId::new(1);
        let f2 = FilterId::new(2);

        table.update(f2, &[f0], true);
        table.update(f2, &[f1], true);
        table.update(f2, &[f0, f1], true);

        assert_eq!(1, table.lookup(f2, &[f0]).expect("should exist").num_exec());
        assert_eq!(1, table.lookup(f2, &[f1]).expect("should exist").num_exec());
        assert_eq!(
            1,
            table.lookup(f2, &[f0, f1]).expect("should exist").num_exec()
        );
    }
}
