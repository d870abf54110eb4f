// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Runs objects through the filter chain.

use super::{runner::FilterRunner, FilterData, FilterId};
use crate::{Error, Object, Result};
use std::sync::Arc;
use std::time::Instant;

/// Outcome of running one object through the filter chain.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Verdict {
    /// Every filter passed; the object is complete.
    Passed,

    /// This filter returned zero; the chain stopped there.
    Dropped(FilterId),
}

/// Runs objects through the current permutation of the filter chain.
///
/// Owned by the single filter-worker thread of a search; statistics flow
/// into the shared [`FilterData`] as each filter finishes, so the
/// permutation optimizer always sees a consistent prefix of history.
pub struct FilterExecutor {
    fdata: Arc<FilterData>,
    runners: Vec<Box<dyn FilterRunner>>,
}

impl FilterExecutor {
    /// Pairs the filter table with its runners (one per filter, in id
    /// order).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] on a table/runner count mismatch.
    pub fn new(fdata: Arc<FilterData>, runners: Vec<Box<dyn FilterRunner>>) -> Result<Self> {
        if runners.len() != fdata.num_filters() {
            return Err(Error::InvalidArgument("one runner per filter required"));
        }

        Ok(Self { fdata, runners })
    }

    /// The shared filter snapshot.
    #[must_use]
    pub fn fdata(&self) -> &Arc<FilterData> {
        &self.fdata
    }

    /// Evaluates the chain against one object, left to right in permutation
    /// order, stopping at the first drop.
    ///
    /// Per filter: execution time and call counters are recorded, then the
    /// conditional pass table is updated with the prefix of already-run
    /// filters.
    ///
    /// # Errors
    ///
    /// Propagates runner failures ([`Error::FilterProtocol`] aborts the
    /// owning search).
    pub fn eval_object(&mut self, obj: &mut Object) -> Result<Verdict> {
        let perm = self.fdata.current_perm();
        let mut prefix: Vec<FilterId> = Vec::with_capacity(perm.len());

        for &id in perm.as_slice() {
            let runner = self
                .runners
                .get_mut(id.index())
                .ok_or(Error::InvalidArgument("permutation references unknown filter"))?;

            let start = Instant::now();
            let verdict = runner.eval(obj)?;
            let elapsed_ns = start.elapsed().as_nanos() as u64;

            let pass = verdict != 0;

            if let Some(info) = self.fdata.filter(id) {
                info.record_eval(pass, elapsed_ns);
            }

            self.fdata.prob().update(id, &prefix, pass);

            if !pass {
                log::trace!("{id} dropped object after {}ns", elapsed_ns);
                return Ok(Verdict::Dropped(id));
            }

            prefix.push(id);
        }

        Ok(Verdict::Passed)
    }

    /// Lets the optimizer reconsider the ordering. Called between objects,
    /// never mid-chain.
    pub fn reorder(&self) -> bool {
        self.fdata.maybe_reorder()
    }

    /// Ends every filter conversation and reaps the children.
    ///
    /// # Errors
    ///
    /// Returns the last shutdown failure, after attempting all runners.
    pub fn shutdown(self) -> Result<()> {
        let mut failed = None;

        for runner in self.runners {
            if let Err(e) = runner.shutdown() {
                log::warn!("filter shutdown failed: {e}");
                failed = Some(e);
            }
        }

        match failed {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{FilterExecutor, Verdict};
    use crate::filter::runner::{FilterRunner, FnFilter};
    use crate::filter::{FilterData, FilterId, FilterSpec, INVALID_FILTER_ID};
    use crate::Object;
    use std::sync::Arc;
    use test_log::test;

    fn executor(names: &[&str], runners: Vec<Box<dyn FilterRunner>>) -> FilterExecutor {
        let specs = names
            .iter()
            .map(|n| FilterSpec::new(*n, "/bin/true").expect("should create"))
            .collect();
        let fdata = Arc::new(FilterData::new(specs).expect("should create"));
        FilterExecutor::new(fdata, runners).expect("should create")
    }

    #[test]
    fn exec_empty_chain_passes_everything() {
        let mut executor = executor(&[], vec![]);

        let mut obj = Object::from_bytes(b"x".to_vec());
        assert_eq!(
            Verdict::Passed,
            executor.eval_object(&mut obj).expect("should eval")
        );
    }

    #[test]
    fn exec_stops_at_first_drop() {
        let mut executor = executor(
            &["never", "boom"],
            vec![
                Box::new(FnFilter::new(|_: &mut Object| 0)),
                Box::new(FnFilter::new(|_: &mut Object| panic!("must not run"))),
            ],
        );

        let mut obj = Object::from_bytes(b"x".to_vec());
        assert_eq!(
            Verdict::Dropped(FilterId::new(0)),
            executor.eval_object(&mut obj).expect("should eval")
        );

        let fdata = executor.fdata();
        let never = fdata.filter(FilterId::new(0)).expect("should exist");
        assert_eq!(1, never.called());
        assert_eq!(1, never.dropped());

        let boom = fdata.filter(FilterId::new(1)).expect("should exist");
        assert_eq!(0, boom.called());
    }

    #[test]
    fn exec_updates_conditional_table() {
        let mut executor = executor(
            &["first", "second"],
            vec![
                Box::new(FnFilter::new(|obj: &mut Object| {
                    i64::from(obj.data().first().is_some_and(|b| b % 2 == 1))
                })),
                Box::new(FnFilter::new(|obj: &mut Object| {
                    i64::from(obj.data().first().is_some_and(|b| b % 4 == 1))
                })),
            ],
        );

        let mut passed_first = 0;
        for byte in 0u8..100 {
            let mut obj = Object::from_bytes(vec![byte]);
            executor.eval_object(&mut obj).expect("should eval");
            if byte % 2 == 1 {
                passed_first += 1;
            }
        }

        let fdata = executor.fdata();
        let prob = fdata.prob();

        let f0 = FilterId::new(0);
        let f1 = FilterId::new(1);

        let head = prob.lookup(f0, &[]).expect("should exist");
        assert_eq!(100, head.num_exec());
        assert_eq!(passed_first, head.num_pass());

        let cond = prob.lookup(f1, &[f0]).expect("should exist");
        assert_eq!(passed_first, cond.num_exec());
        assert!(cond.num_pass() <= cond.num_exec());

        // union entry over both filters
        assert!(prob.lookup(INVALID_FILTER_ID, &[f0, f1]).is_some());
    }

    #[test]
    fn exec_rejects_runner_mismatch() {
        let specs = vec![FilterSpec::new("only", "/bin/true").expect("should create")];
        let fdata = Arc::new(FilterData::new(specs).expect("should create"));

        assert!(FilterExecutor::new(fdata, vec![]).is_err());
    }
}
