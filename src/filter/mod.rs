// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Filter descriptors, statistics and the execution engine.
//!
//! A filter is user-supplied code that reads attributes, optionally writes
//! new attributes and returns an integer deciding drop/pass. Filters always
//! run in isolated child processes (see [`runner`]); the engine here owns
//! their identity, per-search statistics, the conditional pass-rate table
//! and the runtime permutation optimizer.

pub mod exec;
pub mod perm;
pub mod prob;
pub mod proto;
pub mod runner;
pub mod stats;

use crate::{Error, Result};
use perm::Permutation;
use prob::ProbTable;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

/// Maximum filter name length in bytes.
pub const MAX_FILTER_NAME: usize = 128;

/// Dense per-search filter identifier (index into the filter table).
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct FilterId(u16);

/// Sentinel id keying the union entries of the conditional pass table.
pub const INVALID_FILTER_ID: FilterId = FilterId(u16::MAX);

impl FilterId {
    /// Creates an id from a table index.
    #[must_use]
    pub fn new(idx: u16) -> Self {
        Self(idx)
    }

    /// The table index.
    #[must_use]
    pub fn index(self) -> usize {
        usize::from(self.0)
    }

    pub(crate) fn raw(self) -> u16 {
        self.0
    }
}

impl std::fmt::Display for FilterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "f{}", self.0)
    }
}

/// Static description of one filter in a search specification.
#[derive(Clone, Debug)]
pub struct FilterSpec {
    name: String,
    program: PathBuf,
    signature: Vec<u8>,
    args: Vec<String>,
    reads: Vec<String>,
    threshold: i64,
    blob: Vec<u8>,
}

impl FilterSpec {
    /// Creates a spec for a named filter backed by an executable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the name is empty or exceeds
    /// [`MAX_FILTER_NAME`].
    pub fn new(name: impl Into<String>, program: impl Into<PathBuf>) -> Result<Self> {
        let name = name.into();

        if name.is_empty() {
            return Err(Error::InvalidArgument("filter name is empty"));
        }
        if name.len() > MAX_FILTER_NAME {
            return Err(Error::InvalidArgument("filter name too long"));
        }

        Ok(Self {
            name,
            program: program.into(),
            signature: vec![],
            args: vec![],
            reads: vec![],
            threshold: 1,
            blob: vec![],
        })
    }

    /// Sets the ordered argument list.
    #[must_use]
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self.signature = Self::signature_of(&self.program, &self.args);
        self
    }

    /// Sets the names of attributes this filter reads.
    #[must_use]
    pub fn with_reads(mut self, reads: Vec<String>) -> Self {
        self.reads = reads;
        self
    }

    /// Sets the pass threshold shipped to the filter.
    #[must_use]
    pub fn with_threshold(mut self, threshold: i64) -> Self {
        self.threshold = threshold;
        self
    }

    /// Attaches the named binary blob argument (see `set_blob`).
    pub fn set_blob(&mut self, blob: Vec<u8>) {
        self.blob = blob;
    }

    /// The filter name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path of the filter executable.
    #[must_use]
    pub fn program(&self) -> &std::path::Path {
        &self.program
    }

    /// Content signature over the filter code path and arguments.
    #[must_use]
    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    /// The ordered argument list.
    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Names of attributes this filter reads.
    #[must_use]
    pub fn reads(&self) -> &[String] {
        &self.reads
    }

    /// The pass threshold.
    #[must_use]
    pub fn threshold(&self) -> i64 {
        self.threshold
    }

    /// The attached blob argument.
    #[must_use]
    pub fn blob(&self) -> &[u8] {
        &self.blob
    }

    fn signature_of(program: &std::path::Path, args: &[String]) -> Vec<u8> {
        use xxhash_rust::xxh3::Xxh3;

        let mut hasher = Xxh3::new();
        hasher.update(program.as_os_str().as_encoded_bytes());
        for arg in args {
            hasher.update(&[0]);
            hasher.update(arg.as_bytes());
        }

        hasher.digest128().to_be_bytes().to_vec()
    }
}

/// A filter plus its cumulative per-search counters.
///
/// Counters are written only by the single filter-worker thread; readers
/// (`get_stats` on the control path) accept monotone-stale values, so plain
/// relaxed atomics suffice.
#[derive(Debug)]
pub struct FilterInfo {
    id: FilterId,
    spec: FilterSpec,
    called: AtomicU64,
    dropped: AtomicU64,
    passed: AtomicU64,
    time_ns: AtomicU64,
}

impl FilterInfo {
    fn new(id: FilterId, spec: FilterSpec) -> Self {
        Self {
            id,
            spec,
            called: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            passed: AtomicU64::new(0),
            time_ns: AtomicU64::new(0),
        }
    }

    /// This filter's dense id.
    #[must_use]
    pub fn id(&self) -> FilterId {
        self.id
    }

    /// The static descriptor.
    #[must_use]
    pub fn spec(&self) -> &FilterSpec {
        &self.spec
    }

    /// Times the filter was invoked this search.
    #[must_use]
    pub fn called(&self) -> u64 {
        self.called.load(Ordering::Relaxed)
    }

    /// Objects this filter dropped.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Objects this filter passed.
    #[must_use]
    pub fn passed(&self) -> u64 {
        self.passed.load(Ordering::Relaxed)
    }

    /// Cumulative execution time in nanoseconds.
    #[must_use]
    pub fn time_ns(&self) -> u64 {
        self.time_ns.load(Ordering::Relaxed)
    }

    pub(crate) fn record_eval(&self, pass: bool, elapsed_ns: u64) {
        self.called.fetch_add(1, Ordering::Relaxed);
        self.time_ns.fetch_add(elapsed_ns, Ordering::Relaxed);

        if pass {
            self.passed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn clear(&self) {
        self.called.store(0, Ordering::Relaxed);
        self.dropped.store(0, Ordering::Relaxed);
        self.passed.store(0, Ordering::Relaxed);
        self.time_ns.store(0, Ordering::Relaxed);
    }
}

/// The per-search filter snapshot: descriptor table, conditional pass-rate
/// table and the live permutation.
///
/// A new `FilterData` is built and swapped in atomically at every search
/// start, so in-flight objects always observe a single consistent
/// permutation and zeroed statistics.
#[derive(Debug)]
pub struct FilterData {
    filters: Vec<FilterInfo>,
    prob: Mutex<ProbTable>,
    perm: Mutex<Permutation>,
    generation: AtomicU32,
}

impl FilterData {
    /// Builds the snapshot from the ordered filter specs of a search.
    ///
    /// The initial permutation is the submission order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if more than `u16::MAX - 1` filters
    /// are submitted.
    pub fn new(specs: Vec<FilterSpec>) -> Result<Self> {
        if specs.len() >= usize::from(u16::MAX) {
            return Err(Error::InvalidArgument("too many filters"));
        }

        let filters = specs
            .into_iter()
            .enumerate()
            .map(|(idx, spec)| FilterInfo::new(FilterId::new(idx as u16), spec))
            .collect::<Vec<_>>();

        let perm = Permutation::identity(filters.len());

        Ok(Self {
            filters,
            prob: Mutex::new(ProbTable::new()),
            perm: Mutex::new(perm),
            generation: AtomicU32::new(1),
        })
    }

    /// The filter table, in id order.
    #[must_use]
    pub fn filters(&self) -> &[FilterInfo] {
        &self.filters
    }

    /// Looks up one filter by id.
    #[must_use]
    pub fn filter(&self, id: FilterId) -> Option<&FilterInfo> {
        self.filters.get(id.index())
    }

    /// Number of filters.
    #[must_use]
    pub fn num_filters(&self) -> usize {
        self.filters.len()
    }

    /// The conditional pass-rate table.
    #[allow(clippy::expect_used)]
    pub fn prob(&self) -> std::sync::MutexGuard<'_, ProbTable> {
        self.prob.lock().expect("lock is poisoned")
    }

    /// Snapshot of the live permutation.
    #[allow(clippy::expect_used)]
    #[must_use]
    pub fn current_perm(&self) -> Permutation {
        self.perm.lock().expect("lock is poisoned").clone()
    }

    /// Replaces the live permutation.
    ///
    /// Only called at an object boundary, so the chain never observes a
    /// half-switched ordering.
    #[allow(clippy::expect_used)]
    pub fn install_perm(&self, perm: Permutation) {
        *self.perm.lock().expect("lock is poisoned") = perm;
    }

    /// The optimizer generation.
    #[must_use]
    pub fn generation(&self) -> u32 {
        self.generation.load(Ordering::Relaxed)
    }

    /// Bumps the generation; called once per optimizer consideration.
    pub fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::Relaxed);
    }

    /// Runs one optimizer pass and installs a strictly better permutation if
    /// one is found. Returns whether the ordering changed.
    pub fn maybe_reorder(&self) -> bool {
        let generation = self.generation();
        self.bump_generation();

        let current = self.current_perm();

        let better = {
            let prob = self.prob();
            perm::optimize_step(&self.filters, &prob, &current, generation)
        };

        if let Some(better) = better {
            log::debug!("adopting permutation {better:?} (generation {generation})");
            self.install_perm(better);
            true
        } else {
            false
        }
    }
}
