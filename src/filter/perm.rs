// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Filter orderings and the runtime permutation optimizer.

use super::{prob::ProbTable, FilterId, FilterInfo};
use crate::{Error, Result};

/// Floor of the cumulative pass probability during evaluation, so a highly
/// selective prefix does not zero out all downstream costs.
pub const SMALL_FRACTION: f64 = 0.00001;

/// Upper bound on candidate orderings examined per optimizer pass.
const MAX_PERM_NEIGHBORS: usize = 32;

/// Number of observations a filter needs before the given generation may be
/// evaluated against it.
#[must_use]
pub fn significant_number(generation: u32) -> u64 {
    u64::from(generation) * 8
}

/// A total ordering of the active filter set: a dense array of filter ids,
/// each appearing exactly once.
#[derive(Clone, Eq, PartialEq)]
pub struct Permutation(Vec<FilterId>);

impl Permutation {
    /// Creates the identity ordering over `n` filters.
    #[must_use]
    pub fn identity(n: usize) -> Self {
        Self((0..n).map(|i| FilterId::new(i as u16)).collect())
    }

    /// Creates an ordering from an explicit id list.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] unless every id in `0..len`
    /// appears exactly once.
    pub fn new(ids: Vec<FilterId>) -> Result<Self> {
        let mut sorted = ids.iter().map(|id| id.index()).collect::<Vec<_>>();
        sorted.sort_unstable();

        if sorted.iter().copied().ne(0..ids.len()) {
            return Err(Error::InvalidArgument("permutation is not a bijection"));
        }

        Ok(Self(ids))
    }

    /// The ordering as a slice.
    #[must_use]
    pub fn as_slice(&self) -> &[FilterId] {
        &self.0
    }

    /// Number of filters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the ordering is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// A copy with positions `i` and `j` exchanged.
    #[must_use]
    pub fn swapped(&self, i: usize, j: usize) -> Self {
        let mut ids = self.0.clone();
        ids.swap(i, j);
        Self(ids)
    }

    /// A copy with the element at `from` removed and reinserted at `to`.
    #[must_use]
    pub fn relocated(&self, from: usize, to: usize) -> Self {
        let mut ids = self.0.clone();

        if from < ids.len() && to < ids.len() {
            let id = ids.remove(from);
            ids.insert(to, id);
        }

        Self(ids)
    }
}

impl std::fmt::Debug for Permutation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[")?;
        for (i, id) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{id}")?;
        }
        write!(f, "]")
    }
}

/// Evaluates a candidate ordering against the statistics gathered so far.
///
/// The utility is the negated expected cumulative cost
///
/// ```text
/// U = - sum_i ( prod_{j<i} p_j ) * ( c_i / n_i )
/// ```
///
/// where `c_i` is the filter's cumulative execution time, `n_i` its call
/// count and `p_j` the conditional pass rate given the set of filters placed
/// before position `j`. Higher is better; the result is always finite and
/// non-positive.
///
/// Returns `None` ("not evaluable") if any filter in the ordering has fewer
/// than [`significant_number`] observations, or a required conditional entry
/// is missing.
#[must_use]
pub fn evaluate(
    filters: &[FilterInfo],
    prob: &ProbTable,
    perm: &Permutation,
    generation: u32,
) -> Option<f64> {
    let mut pass = 1.0f64;
    let mut total_cost = 0.0f64;

    for (pos, id) in perm.as_slice().iter().enumerate() {
        let info = filters.get(id.index())?;

        let n = info.called();
        if n == 0 || n < significant_number(generation) {
            return None;
        }

        let cost = info.time_ns() as f64;
        total_cost += pass * cost / n as f64;

        let prefix = perm.as_slice().get(..pos)?;
        let p = prob.pass_rate(*id, prefix)?;

        pass = (pass * p).max(SMALL_FRACTION);
    }

    Some(-total_cost)
}

/// One optimizer pass: enumerates a bounded set of neighbor orderings
/// (adjacent swaps, then single-element relocations) and returns the best
/// evaluable candidate that is *strictly* better than the current ordering.
///
/// Ties retain the current ordering for stability. The caller installs the
/// result at an object boundary.
#[must_use]
pub fn optimize_step(
    filters: &[FilterInfo],
    prob: &ProbTable,
    current: &Permutation,
    generation: u32,
) -> Option<Permutation> {
    if current.len() < 2 {
        return None;
    }

    let base = evaluate(filters, prob, current, generation)?;

    let mut best: Option<(f64, Permutation)> = None;
    let mut examined = 0;

    let mut consider = |candidate: Permutation| {
        if let Some(utility) = evaluate(filters, prob, &candidate, generation) {
            let beats_best = best.as_ref().is_none_or(|(u, _)| utility > *u);
            if utility > base && beats_best {
                best = Some((utility, candidate));
            }
        }
    };

    for i in 0..current.len() - 1 {
        if examined >= MAX_PERM_NEIGHBORS {
            break;
        }
        consider(current.swapped(i, i + 1));
        examined += 1;
    }

    'outer: for from in 0..current.len() {
        for to in 0..current.len() {
            if examined >= MAX_PERM_NEIGHBORS {
                break 'outer;
            }
            // adjacent relocations are the swaps already examined
            if from == to || from + 1 == to || to + 1 == from {
                continue;
            }
            consider(current.relocated(from, to));
            examined += 1;
        }
    }

    best.map(|(_, perm)| perm)
}
