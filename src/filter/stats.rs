// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Per-filter statistics reporting.

use super::{FilterData, MAX_FILTER_NAME};
use crate::{Error, Result};

/// One row of the per-filter statistics report shipped to the client.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FilterStats {
    /// Filter name, truncated to [`MAX_FILTER_NAME`]` - 1` bytes.
    pub name: String,

    /// Objects this filter was invoked on.
    pub objs_processed: u64,

    /// Objects this filter dropped.
    pub objs_dropped: u64,

    /// Average execution time per invocation in nanoseconds.
    pub avg_exec_time_ns: u64,
}

/// Resets every filter's counters. Called when a new search is started.
pub fn clear_stats(fdata: &FilterData) {
    for info in fdata.filters() {
        info.clear();
    }
}

/// Fills `out` with one [`FilterStats`] row per filter.
///
/// `max` is the caller's capacity; an average of 0 is reported for filters
/// that were never called.
///
/// # Errors
///
/// Returns [`Error::InvalidArgument`] if `max` is smaller than the number of
/// filters.
pub fn get_stats(fdata: &FilterData, max: usize, out: &mut Vec<FilterStats>) -> Result<()> {
    if max < fdata.num_filters() {
        return Err(Error::InvalidArgument("stats buffer too small"));
    }

    out.clear();

    for info in fdata.filters() {
        let called = info.called();

        let avg_exec_time_ns = if called == 0 {
            0
        } else {
            info.time_ns() / called
        };

        let mut name = info.spec().name().to_owned();
        if name.len() >= MAX_FILTER_NAME {
            let mut end = MAX_FILTER_NAME - 1;
            while !name.is_char_boundary(end) {
                end -= 1;
            }
            name.truncate(end);
        }

        out.push(FilterStats {
            name,
            objs_processed: called,
            objs_dropped: info.dropped(),
            avg_exec_time_ns,
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{clear_stats, get_stats};
    use crate::filter::{FilterData, FilterSpec};
    use test_log::test;

    fn fdata() -> FilterData {
        let specs = vec![
            FilterSpec::new("alpha", "/bin/true").expect("should create"),
            FilterSpec::new("beta", "/bin/true").expect("should create"),
        ];
        FilterData::new(specs).expect("should create")
    }

    #[test]
    fn stats_report_averages() {
        let fdata = fdata();

        let alpha = fdata.filter(crate::filter::FilterId::new(0)).expect("should exist");
        alpha.record_eval(true, 100);
        alpha.record_eval(false, 300);

        let mut out = vec![];
        get_stats(&fdata, 8, &mut out).expect("should fill");

        assert_eq!(2, out.len());

        let row = out.first().expect("should exist");
        assert_eq!("alpha", row.name);
        assert_eq!(2, row.objs_processed);
        assert_eq!(1, row.objs_dropped);
        assert_eq!(200, row.avg_exec_time_ns);

        // never-called filter reports zeroes
        let row = out.get(1).expect("should exist");
        assert_eq!("beta", row.name);
        assert_eq!(0, row.objs_processed);
        assert_eq!(0, row.avg_exec_time_ns);
    }

    #[test]
    fn stats_rejects_small_buffer() {
        let fdata = fdata();
        let mut out = vec![];

        assert!(get_stats(&fdata, 1, &mut out).is_err());
    }

    #[test]
    fn stats_clear_zeroes_counters() {
        let fdata = fdata();

        for info in fdata.filters() {
            info.record_eval(true, 50);
        }

        clear_stats(&fdata);

        let mut out = vec![];
        get_stats(&fdata, 2, &mut out).expect("should fill");

        assert!(out.iter().all(|row| row.objs_processed == 0));
    }
}
