// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Per-connection search lifecycle.
//!
//! Every accepted connection owns one search state machine:
//!
//! ```text
//! Idle -> Configuring -> Running -> Draining -> Idle
//!   \________________________________________/
//!                     Closed (terminal)
//! ```
//!
//! Control requests arrive on a bounded control ring drained by the search
//! thread; the filter worker thread couples the inbound object ring to the
//! outbound result rings.

pub mod background;
pub mod split;

use crate::filter::exec::{FilterExecutor, Verdict};
use crate::filter::runner::{ChildFilter, FilterRunner};
use crate::filter::stats::{self, FilterStats};
use crate::filter::{FilterData, FilterSpec};
use crate::server::callbacks::{ConnFactory, ConnHandler, DeviceChar, HostStats};
use crate::server::conn::{
    ConnState, TxCounters, CSTATE_CLOSING, CSTATE_DRAINED, CSTATE_DRAINING, CSTATE_TX_ATTACHED,
};
use crate::store::group::{self, GroupId};
use crate::store::{load_obj, ObjectCache, ObjectStore};
use crate::{Error, Object, Result, Ring, StopSignal};
use split::SplitPolicy;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

/// The search state machine is executing objects.
pub const DEV_FLAG_RUNNING: u32 = 0x01;

/// The search ran to completion and was flushed.
pub const DEV_FLAG_COMPLETE: u32 = 0x02;

/// Slot count of the per-search control ring.
const CONTROL_RING_SIZE: usize = 64;

/// Objects evaluated between two optimizer considerations.
const OPT_INTERVAL: u32 = 16;

/// Worker nap when a ring poll comes up empty.
const POLL_SLEEP: Duration = Duration::from_micros(500);

/// How long a finished search waits for an attached tx consumer to ship the
/// result backlog before flushing it.
const TX_DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Identifies one client session across the control and data sockets.
pub type SessionId = u64;

/// Lifecycle phase of a search.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SearchPhase {
    /// Fresh connection, nothing configured.
    Idle,

    /// A spec, gid or blob arrived; not yet started.
    Configuring,

    /// Worker threads are moving objects.
    Running,

    /// No more input; in-flight objects finish, rings flush.
    Draining,

    /// Terminal.
    Closed,
}

/// A control request queued towards the search thread.
#[derive(Debug)]
pub enum ControlOp {
    /// Begin streaming execution.
    Start,

    /// Stop feeding and drain.
    Stop,

    /// Install the filter list of the next search.
    SetSpec(Vec<FilterSpec>),

    /// Attach a blob argument to the named filter.
    SetBlob {
        /// Target filter name.
        filter: String,
        /// Blob bytes.
        blob: Vec<u8>,
    },

    /// Add a group id.
    SetGid(GroupId),

    /// Forget all configured group ids.
    ClearGids,

    /// Pin the local/offload split ratio.
    SetOffload(u32),

    /// Tear everything down; terminal.
    Terminate,
}

/// Monotone per-search counters.
///
/// Written by the feeder and worker threads, read by the control path;
/// readers accept monotone-stale values.
#[derive(Debug, Default)]
pub struct SearchCounters {
    obj_total: AtomicU64,
    obj_processed: AtomicU64,
    obj_dropped: AtomicU64,
    obj_passed: AtomicU64,
    obj_skipped: AtomicU64,
    obj_bg_processed: AtomicU64,
    obj_bg_dropped: AtomicU64,
    obj_bg_passed: AtomicU64,
    network_stalls: AtomicU64,
    tx_full_stalls: AtomicU64,
    tx_idles: AtomicU64,
    pend_objs: AtomicU64,
}

macro_rules! counter_get {
    ($($(#[$meta:meta])* $name:ident),* $(,)?) => {
        $(
            $(#[$meta])*
            #[must_use]
            pub fn $name(&self) -> u64 {
                self.$name.load(Ordering::Relaxed)
            }
        )*
    };
}

impl SearchCounters {
    counter_get!(
        /// Objects the feeder attempted (loaded plus skipped).
        obj_total,
        /// Objects accounted for by the pipeline (equals passed + dropped +
        /// skipped + pending at quiescence).
        obj_processed,
        /// Objects dropped by a filter.
        obj_dropped,
        /// Objects that passed the chain (or were shipped upstream
        /// unevaluated by the split policy).
        obj_passed,
        /// Objects that could not be loaded.
        obj_skipped,
        /// Objects served from the background pre-warm cache.
        obj_bg_processed,
        /// Background drops (reserved).
        obj_bg_dropped,
        /// Background passes (reserved).
        obj_bg_passed,
        /// Data-socket writes that hit back-pressure.
        network_stalls,
        /// Output-ring enqueues that found the ring full.
        tx_full_stalls,
        /// Times the tx thread found nothing to send.
        tx_idles,
        /// Objects currently inside the pipeline.
        pend_objs,
    );

    fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    fn reset(&self) {
        for counter in [
            &self.obj_total,
            &self.obj_processed,
            &self.obj_dropped,
            &self.obj_passed,
            &self.obj_skipped,
            &self.obj_bg_processed,
            &self.obj_bg_dropped,
            &self.obj_bg_passed,
            &self.network_stalls,
            &self.tx_full_stalls,
            &self.tx_idles,
            &self.pend_objs,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    fn dec_pend(&self) {
        self.pend_objs.fetch_sub(1, Ordering::Relaxed);
    }
}

impl TxCounters for SearchShared {
    fn count_tx_idle(&self) {
        SearchCounters::add(&self.counters.tx_idles, 1);
    }

    fn count_network_stall(&self) {
        SearchCounters::add(&self.counters.network_stalls, 1);
    }
}

/// Statistics snapshot shipped to the client.
#[derive(Clone, Debug, Default)]
pub struct DevStats {
    /// Objects the feeder attempted.
    pub obj_total: u64,
    /// Objects accounted for by the pipeline.
    pub obj_processed: u64,
    /// Objects dropped by a filter.
    pub obj_dropped: u64,
    /// Objects that passed the chain.
    pub obj_passed: u64,
    /// Objects that could not be loaded.
    pub obj_skipped: u64,
    /// Objects served from the pre-warm cache.
    pub obj_bg_processed: u64,
    /// Background drops (reserved).
    pub obj_bg_dropped: u64,
    /// Background passes (reserved).
    pub obj_bg_passed: u64,
    /// Data-socket back-pressure events.
    pub network_stalls: u64,
    /// Full output-ring events.
    pub tx_full_stalls: u64,
    /// Idle tx polls.
    pub tx_idles: u64,
    /// Objects inside the pipeline right now.
    pub pend_objs: u64,
    /// State machine flags ([`DEV_FLAG_RUNNING`], [`DEV_FLAG_COMPLETE`]).
    pub flags: u32,
    /// Average local-computation ratio of this run.
    pub avg_int_ratio: u32,
    /// Smoothed local-computation ratio.
    pub smoothed_int_ratio: u32,
    /// Per-filter rows.
    pub filters: Vec<FilterStats>,
}

/// State shared between the connection dispatcher and the search thread.
pub struct SearchShared {
    session: SessionId,
    phase: Mutex<SearchPhase>,
    flags: AtomicU32,
    counters: SearchCounters,
    control: Ring<ControlOp>,
    fdata: Mutex<Option<Arc<FilterData>>>,
    split: Mutex<SplitPolicy>,
    kill: StopSignal,
    have_spec: AtomicBool,
    num_gids: AtomicUsize,
    start_failed: AtomicBool,
    start_acks: AtomicU64,
}

impl SearchShared {
    fn new(session: SessionId) -> Self {
        Self {
            session,
            phase: Mutex::new(SearchPhase::Idle),
            flags: AtomicU32::new(0),
            counters: SearchCounters::default(),
            control: Ring::new(CONTROL_RING_SIZE),
            fdata: Mutex::new(None),
            split: Mutex::new(SplitPolicy::default()),
            kill: StopSignal::default(),
            have_spec: AtomicBool::new(false),
            num_gids: AtomicUsize::new(0),
            start_failed: AtomicBool::new(false),
            start_acks: AtomicU64::new(0),
        }
    }

    /// The session this search belongs to.
    #[must_use]
    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Current lifecycle phase.
    #[allow(clippy::expect_used)]
    #[must_use]
    pub fn phase(&self) -> SearchPhase {
        *self.phase.lock().expect("lock is poisoned")
    }

    #[allow(clippy::expect_used)]
    fn set_phase(&self, phase: SearchPhase) {
        log::debug!("session {}: phase -> {phase:?}", self.session);
        *self.phase.lock().expect("lock is poisoned") = phase;
    }

    /// The per-search counters.
    #[must_use]
    pub fn counters(&self) -> &SearchCounters {
        &self.counters
    }

    /// State machine flags.
    #[must_use]
    pub fn flags(&self) -> u32 {
        self.flags.load(Ordering::Acquire)
    }

    fn set_flag(&self, bit: u32) {
        self.flags.fetch_or(bit, Ordering::Release);
    }

    fn clear_flag(&self, bit: u32) {
        self.flags.fetch_and(!bit, Ordering::Release);
    }

    /// Queues a control request towards the search thread.
    ///
    /// # Errors
    ///
    /// Returns [`Error::QueueFull`] if the control ring is full.
    pub fn push_op(&self, op: ControlOp) -> Result<()> {
        self.control.enq(op).map_err(|_| Error::QueueFull)
    }

    /// The filter snapshot of the current (or last) run.
    #[allow(clippy::expect_used)]
    #[must_use]
    pub fn fdata(&self) -> Option<Arc<FilterData>> {
        self.fdata.lock().expect("lock is poisoned").clone()
    }

    #[allow(clippy::expect_used)]
    fn set_fdata(&self, fdata: Arc<FilterData>) {
        *self.fdata.lock().expect("lock is poisoned") = Some(fdata);
    }

    #[allow(clippy::expect_used)]
    fn split(&self) -> MutexGuard<'_, SplitPolicy> {
        self.split.lock().expect("lock is poisoned")
    }

    /// Builds the statistics snapshot shipped to the client.
    #[must_use]
    pub fn stats(&self) -> DevStats {
        let mut filters = vec![];

        if let Some(fdata) = self.fdata() {
            // buffer is sized to fit, so this cannot fail
            let _ = stats::get_stats(&fdata, fdata.num_filters(), &mut filters);
        }

        let (avg_int_ratio, smoothed_int_ratio) = {
            let split = self.split();
            (split.avg_int_ratio(), split.smoothed_int_ratio())
        };

        let c = &self.counters;

        DevStats {
            obj_total: c.obj_total(),
            obj_processed: c.obj_processed(),
            obj_dropped: c.obj_dropped(),
            obj_passed: c.obj_passed(),
            obj_skipped: c.obj_skipped(),
            obj_bg_processed: c.obj_bg_processed(),
            obj_bg_dropped: c.obj_bg_dropped(),
            obj_bg_passed: c.obj_bg_passed(),
            network_stalls: c.network_stalls(),
            tx_full_stalls: c.tx_full_stalls(),
            tx_idles: c.tx_idles(),
            pend_objs: c.pend_objs(),
            flags: self.flags(),
            avg_int_ratio,
            smoothed_int_ratio,
            filters,
        }
    }
}

/// Builds one [`FilterRunner`] per filter at search start.
pub type RunnerFactory = Arc<dyn Fn(&FilterSpec) -> Result<Box<dyn FilterRunner>> + Send + Sync>;

/// The production factory: one isolated child process per filter.
#[must_use]
pub fn child_runner_factory() -> RunnerFactory {
    Arc::new(|spec: &FilterSpec| {
        Ok(Box::new(ChildFilter::spawn(spec)?) as Box<dyn FilterRunner>)
    })
}

/// Where the feeder pulls objects from: the group index files when present,
/// otherwise a full directory scan.
enum Feed {
    Scan(ObjectStore),
    Index {
        dir: PathBuf,
        names: std::vec::IntoIter<String>,
        cache: Option<Arc<ObjectCache>>,
        skipped: u64,
        cache_hits: u64,
    },
}

impl Feed {
    fn build(
        dir: &Path,
        gids: &[GroupId],
        cache: Option<Arc<ObjectCache>>,
    ) -> Result<Self> {
        let mut names = vec![];
        let mut have_index = false;

        for gid in gids {
            match group::read_index(&gid.idx_path(dir)) {
                Ok(entries) => {
                    have_index = true;
                    names.extend(
                        entries
                            .iter()
                            .map(|e| e.name().to_owned())
                            .filter(|n| !n.is_empty()),
                    );
                }
                Err(Error::NotFound) => {
                    log::debug!("no index for group {gid}, falling back to scan");
                }
                Err(e) => return Err(e),
            }
        }

        if have_index {
            Ok(Self::Index {
                dir: dir.to_path_buf(),
                names: names.into_iter(),
                cache,
                skipped: 0,
                cache_hits: 0,
            })
        } else {
            Ok(Self::Scan(ObjectStore::open_with_cache(dir, cache)?))
        }
    }

    fn next_obj(&mut self) -> Option<Object> {
        match self {
            Self::Scan(store) => match store.next_obj() {
                Ok(obj) => obj,
                Err(e) => {
                    log::warn!("object scan failed: {e}");
                    None
                }
            },
            Self::Index {
                dir,
                names,
                cache,
                skipped,
                cache_hits,
            } => {
                for name in names.by_ref() {
                    let path = dir.join(&name);

                    if let Some(cache) = cache {
                        if let Some(obj) = cache.get(&path) {
                            *cache_hits += 1;
                            return Some(obj);
                        }
                    }

                    match load_obj(&path) {
                        Ok(obj) => return Some(obj),
                        Err(e) => {
                            log::warn!("skipping {}: {e}", path.display());
                            *skipped += 1;
                        }
                    }
                }

                None
            }
        }
    }

    fn skipped(&self) -> u64 {
        match self {
            Self::Scan(store) => store.skipped(),
            Self::Index { skipped, .. } => *skipped,
        }
    }

    fn cache_hits(&self) -> u64 {
        match self {
            Self::Scan(store) => store.cache_hits(),
            Self::Index { cache_hits, .. } => *cache_hits,
        }
    }
}

/// The search thread's private state.
///
/// Owns the object feed and the worker thread handle; everything the
/// connection dispatcher needs lives in [`SearchShared`].
pub struct SearchState {
    shared: Arc<SearchShared>,
    conn: Arc<ConnState>,
    store_dir: PathBuf,
    cache: Option<Arc<ObjectCache>>,
    runner_factory: RunnerFactory,
    specs: Vec<FilterSpec>,
    gids: Vec<GroupId>,
    feed: Option<Feed>,
    carry: Option<Object>,
    worker: Option<JoinHandle<()>>,
    worker_stop: StopSignal,
    input_done: StopSignal,
    feeding_done: bool,
    last_skipped: u64,
    last_cache_hits: u64,
}

impl SearchState {
    fn new(
        shared: Arc<SearchShared>,
        conn: Arc<ConnState>,
        store_dir: PathBuf,
        cache: Option<Arc<ObjectCache>>,
        runner_factory: RunnerFactory,
    ) -> Self {
        Self {
            shared,
            conn,
            store_dir,
            cache,
            runner_factory,
            specs: vec![],
            gids: vec![],
            feed: None,
            carry: None,
            worker: None,
            worker_stop: StopSignal::default(),
            input_done: StopSignal::default(),
            feeding_done: true,
            last_skipped: 0,
            last_cache_hits: 0,
        }
    }

    /// The search thread main loop. Returns when the state machine reaches
    /// [`SearchPhase::Closed`].
    pub fn run(mut self) {
        loop {
            while let Some(op) = self.shared.control.deq() {
                if !self.handle_op(op) {
                    return;
                }
            }

            if self.shared.kill.is_stopped()
                || (self.conn.is_closing() && self.shared.phase() != SearchPhase::Closed)
            {
                self.teardown();
                return;
            }

            match self.shared.phase() {
                SearchPhase::Running => {
                    self.pump();
                    std::thread::sleep(POLL_SLEEP);
                }
                SearchPhase::Draining => self.drain_step(),
                SearchPhase::Closed => return,
                SearchPhase::Idle | SearchPhase::Configuring => {
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
        }
    }

    /// Applies one control request. Returns `false` when the thread must
    /// exit.
    fn handle_op(&mut self, op: ControlOp) -> bool {
        let phase = self.shared.phase();
        let configurable = matches!(phase, SearchPhase::Idle | SearchPhase::Configuring);

        match op {
            ControlOp::SetSpec(specs) => {
                if configurable {
                    log::debug!(
                        "session {}: spec with {} filters",
                        self.shared.session,
                        specs.len()
                    );
                    self.specs = specs;
                    self.shared.set_phase(SearchPhase::Configuring);
                } else {
                    log::warn!("set_spec ignored in phase {phase:?}");
                }
            }
            ControlOp::SetBlob { filter, blob } => {
                if let Some(spec) = self.specs.iter_mut().find(|s| s.name() == filter) {
                    spec.set_blob(blob);
                } else {
                    log::warn!("set_blob for unknown filter {filter:?}");
                }
            }
            ControlOp::SetGid(gid) => {
                if configurable {
                    self.gids.push(gid);
                    self.shared.set_phase(SearchPhase::Configuring);
                } else {
                    log::warn!("set_gid ignored in phase {phase:?}");
                }
            }
            ControlOp::ClearGids => {
                if configurable {
                    self.gids.clear();
                }
            }
            ControlOp::SetOffload(ratio) => {
                self.shared.split().set_ratio(ratio);
            }
            ControlOp::Start => {
                if let Err(e) = self.start() {
                    log::error!("session {}: start failed: {e}", self.shared.session);
                    self.shared.start_failed.store(true, Ordering::Release);
                }
                self.shared.start_acks.fetch_add(1, Ordering::AcqRel);
            }
            ControlOp::Stop => {
                if phase == SearchPhase::Running {
                    self.begin_drain();
                }
            }
            ControlOp::Terminate => {
                self.teardown();
                return false;
            }
        }

        true
    }

    /// Enters `Running`: fresh stats, filter children, worker thread.
    fn start(&mut self) -> Result<()> {
        if self.shared.phase() != SearchPhase::Configuring {
            return Err(Error::InvalidArgument("no search configured"));
        }
        if self.gids.is_empty() {
            return Err(Error::InvalidArgument("no group configured"));
        }

        let fdata = Arc::new(FilterData::new(self.specs.clone())?);
        stats::clear_stats(&fdata);

        let mut runners: Vec<Box<dyn FilterRunner>> = Vec::with_capacity(self.specs.len());

        for spec in &self.specs {
            match (self.runner_factory)(spec) {
                Ok(runner) => runners.push(runner),
                Err(e) => {
                    for runner in runners {
                        let _ = runner.shutdown();
                    }
                    return Err(e);
                }
            }
        }

        let executor = FilterExecutor::new(Arc::clone(&fdata), runners)?;

        self.feed = Some(Feed::build(
            &self.store_dir,
            &self.gids,
            self.cache.clone(),
        )?);

        self.shared.set_fdata(Arc::clone(&fdata));
        self.shared.counters.reset();
        self.shared.clear_flag(DEV_FLAG_COMPLETE);
        self.shared.set_flag(DEV_FLAG_RUNNING);

        self.conn.clear_flags(CSTATE_DRAINING | CSTATE_DRAINED);

        self.worker_stop = StopSignal::default();
        self.input_done = StopSignal::default();
        self.feeding_done = false;
        self.carry = None;
        self.last_skipped = 0;
        self.last_cache_hits = 0;

        let shared = Arc::clone(&self.shared);
        let conn = Arc::clone(&self.conn);
        let stop = self.worker_stop.clone();
        let input_done = self.input_done.clone();

        self.worker = Some(std::thread::spawn(move || {
            worker_loop(&shared, &conn, executor, &stop, &input_done);
        }));

        log::info!(
            "session {}: search started ({} filters, {} groups)",
            self.shared.session,
            self.specs.len(),
            self.gids.len()
        );

        self.shared.set_phase(SearchPhase::Running);

        Ok(())
    }

    /// Feeds a batch of objects into the inbound ring and folds feed-side
    /// counter deltas into the search counters.
    fn pump(&mut self) {
        let pend_max = u64::from(self.shared.split().pend_max());

        while !self.feeding_done
            && self.shared.counters.pend_objs() < pend_max
            && !self.conn.obj_ring().is_full()
        {
            let obj = if let Some(obj) = self.carry.take() {
                obj
            } else {
                let Some(feed) = self.feed.as_mut() else {
                    break;
                };

                let next = feed.next_obj();
                self.sync_feed_counters();

                match next {
                    Some(obj) => {
                        let c = &self.shared.counters;
                        SearchCounters::add(&c.obj_total, 1);
                        SearchCounters::add(&c.obj_processed, 1);
                        SearchCounters::add(&c.pend_objs, 1);
                        obj
                    }
                    None => {
                        self.feeding_done = true;
                        log::debug!("session {}: object feed exhausted", self.shared.session);
                        self.begin_drain();
                        break;
                    }
                }
            };

            if let Err(obj) = self.conn.obj_ring().enq(obj) {
                self.carry = Some(obj);
                break;
            }
        }

        let pend = self.shared.counters.pend_objs().min(u64::from(u32::MAX)) as u32;
        self.shared.split().update(pend);
    }

    fn sync_feed_counters(&mut self) {
        let Some(feed) = self.feed.as_ref() else {
            return;
        };

        let skipped = feed.skipped();
        if skipped > self.last_skipped {
            let delta = skipped - self.last_skipped;
            let c = &self.shared.counters;
            SearchCounters::add(&c.obj_skipped, delta);
            SearchCounters::add(&c.obj_processed, delta);
            SearchCounters::add(&c.obj_total, delta);
            self.last_skipped = skipped;
        }

        let hits = feed.cache_hits();
        if hits > self.last_cache_hits {
            SearchCounters::add(
                &self.shared.counters.obj_bg_processed,
                hits - self.last_cache_hits,
            );
            self.last_cache_hits = hits;
        }
    }

    /// Enters `Draining`: no more input, in-flight objects finish.
    fn begin_drain(&mut self) {
        self.feeding_done = true;
        self.input_done.stop();
        self.conn.set_flags(CSTATE_DRAINING);
        self.shared.set_phase(SearchPhase::Draining);
    }

    /// Completes the drain once the worker is done: let an attached tx
    /// consumer ship the backlog, flush leftovers, mark complete, return to
    /// `Idle`.
    fn drain_step(&mut self) {
        let worker_done = self.worker.as_ref().is_none_or(JoinHandle::is_finished);

        if !worker_done {
            std::thread::sleep(Duration::from_millis(1));
            return;
        }

        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }

        if self.conn.has_flags(CSTATE_TX_ATTACHED) {
            let deadline = std::time::Instant::now() + TX_DRAIN_GRACE;

            while self.conn.tx_backlog() > 0
                && !self.conn.is_closing()
                && std::time::Instant::now() < deadline
            {
                std::thread::sleep(Duration::from_millis(1));
            }
        }

        self.flush_rings();
        self.conn.set_flags(CSTATE_DRAINED);

        self.shared.clear_flag(DEV_FLAG_RUNNING);
        self.shared.set_flag(DEV_FLAG_COMPLETE);
        self.shared.set_phase(SearchPhase::Idle);

        log::info!(
            "session {}: search complete ({} passed / {} dropped / {} skipped)",
            self.shared.session,
            self.shared.counters.obj_passed(),
            self.shared.counters.obj_dropped(),
            self.shared.counters.obj_skipped()
        );
    }

    fn flush_rings(&mut self) {
        // leftover inbound objects exist only after a hard stop
        while self.conn.obj_ring().deq().is_some() {
            self.shared.counters.dec_pend();
        }

        if self.carry.take().is_some() {
            self.shared.counters.dec_pend();
        }

        self.conn.flush_objs(drop);
    }

    /// Terminal teardown: stop the worker, reap children, flush, close.
    fn teardown(&mut self) {
        if self.shared.phase() == SearchPhase::Closed {
            return;
        }

        log::info!("session {}: terminating", self.shared.session);

        self.worker_stop.stop();
        self.input_done.stop();
        self.conn.set_flags(CSTATE_CLOSING);

        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }

        self.flush_rings();
        self.shared.set_phase(SearchPhase::Closed);
    }
}

/// The filter worker: inbound ring, through the chain, out to the result
/// rings.
fn worker_loop(
    shared: &Arc<SearchShared>,
    conn: &Arc<ConnState>,
    mut executor: FilterExecutor,
    stop: &StopSignal,
    input_done: &StopSignal,
) {
    let mut local_seq = 0u64;
    let mut since_reorder = 0u32;

    loop {
        if stop.is_stopped() {
            break;
        }

        let Some(mut obj) = conn.obj_ring().deq() else {
            if input_done.is_stopped() {
                break;
            }
            std::thread::sleep(POLL_SLEEP);
            continue;
        };

        let local = shared.split().eval_locally(local_seq);
        local_seq += 1;

        let mut aborted = false;

        if local {
            match executor.eval_object(&mut obj) {
                Ok(Verdict::Passed) => {
                    SearchCounters::add(&shared.counters.obj_passed, 1);
                    push_with_retry(conn, obj, true, shared, stop);
                }
                Ok(Verdict::Dropped(_)) => {
                    SearchCounters::add(&shared.counters.obj_dropped, 1);
                }
                Err(e) => {
                    log::error!(
                        "session {}: filter failure, aborting search: {e}",
                        shared.session()
                    );
                    conn.set_flags(CSTATE_CLOSING);
                    aborted = true;
                }
            }
        } else {
            // split policy says this object is the host's problem
            SearchCounters::add(&shared.counters.obj_passed, 1);
            push_with_retry(conn, obj, false, shared, stop);
        }

        shared.counters.dec_pend();

        if aborted {
            break;
        }

        since_reorder += 1;
        if since_reorder >= OPT_INTERVAL {
            since_reorder = 0;
            executor.reorder();
        }
    }

    if let Err(e) = executor.shutdown() {
        log::warn!("session {}: filter shutdown: {e}", shared.session());
    }
}

/// Enqueues towards the client, retrying on a full ring (counted as a tx
/// stall). Gives up and drops the object if the connection is going away.
fn push_with_retry(
    conn: &ConnState,
    obj: Object,
    complete: bool,
    shared: &SearchShared,
    stop: &StopSignal,
) {
    let mut obj = obj;

    loop {
        match conn.send_obj(obj, complete) {
            Ok(()) => return,
            Err(back) => {
                obj = back;
                SearchCounters::add(&shared.counters.tx_full_stalls, 1);

                if stop.is_stopped() || conn.is_closing() {
                    return;
                }

                std::thread::sleep(Duration::from_millis(1));
            }
        }
    }
}

/// The connection-facing handle of a search: implements the transport
/// callback surface by queueing control requests to the search thread.
pub struct SearchConn {
    shared: Arc<SearchShared>,
    thread: Option<JoinHandle<()>>,
}

impl SearchConn {
    /// Allocates the search state for a fresh connection and spawns its
    /// search thread.
    #[must_use]
    pub fn spawn(
        session: SessionId,
        conn: Arc<ConnState>,
        store_dir: PathBuf,
        cache: Option<Arc<ObjectCache>>,
        runner_factory: RunnerFactory,
    ) -> Self {
        let shared = Arc::new(SearchShared::new(session));

        conn.set_tx_counters(Arc::clone(&shared) as Arc<dyn TxCounters>);

        let state = SearchState::new(
            Arc::clone(&shared),
            conn,
            store_dir,
            cache,
            runner_factory,
        );

        let thread = std::thread::spawn(move || state.run());

        Self {
            shared,
            thread: Some(thread),
        }
    }

    /// The shared search state (phase, counters, stats).
    #[must_use]
    pub fn shared(&self) -> &Arc<SearchShared> {
        &self.shared
    }

    /// Blocks until the current search was flushed out (test helper).
    #[doc(hidden)]
    pub fn wait_complete(&self) {
        loop {
            if self.shared.flags() & DEV_FLAG_COMPLETE != 0
                || self.shared.phase() == SearchPhase::Closed
            {
                return;
            }

            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

impl ConnHandler for SearchConn {
    fn start(&mut self) -> Result<()> {
        if !self.shared.have_spec.load(Ordering::Acquire) {
            return Err(Error::InvalidArgument("no spec configured"));
        }
        if self.shared.num_gids.load(Ordering::Acquire) == 0 {
            return Err(Error::InvalidArgument("no group configured"));
        }

        let acks_before = self.shared.start_acks.load(Ordering::Acquire);

        self.shared.start_failed.store(false, Ordering::Release);
        self.shared.push_op(ControlOp::Start)?;

        // startup failures (missing directory, unspawnable filter) abort the
        // start and are reported to the client, so wait for the verdict
        let deadline = std::time::Instant::now() + Duration::from_secs(10);

        while self.shared.start_acks.load(Ordering::Acquire) == acks_before
            && std::time::Instant::now() < deadline
        {
            std::thread::sleep(Duration::from_millis(1));
        }

        if self.shared.start_failed.load(Ordering::Acquire) {
            return Err(Error::InvalidArgument("search failed to start"));
        }

        Ok(())
    }

    fn stop(&mut self, host: &HostStats) -> Result<()> {
        log::debug!(
            "session {}: stop (host received {}, queued {})",
            self.shared.session,
            host.objs_received,
            host.objs_queued
        );
        self.shared.push_op(ControlOp::Stop)
    }

    fn set_spec(&mut self, specs: Vec<FilterSpec>) -> Result<()> {
        self.shared.have_spec.store(true, Ordering::Release);
        self.shared.push_op(ControlOp::SetSpec(specs))
    }

    fn set_obj(&mut self, sig: &[u8]) -> Result<()> {
        // filter code objects are resolved by signature on the local disk
        log::debug!(
            "session {}: filter object announced ({} sig bytes)",
            self.shared.session,
            sig.len()
        );
        Ok(())
    }

    fn set_list(&mut self) -> Result<()> {
        Ok(())
    }

    fn terminate(&mut self) -> Result<()> {
        self.shared.push_op(ControlOp::Terminate)
    }

    fn get_stats(&mut self) -> Result<DevStats> {
        Ok(self.shared.stats())
    }

    fn release_obj(&mut self, obj: Object) -> Result<()> {
        drop(obj);
        Ok(())
    }

    fn get_char(&mut self) -> Result<DeviceChar> {
        Ok(DeviceChar::default())
    }

    fn log_done(&mut self) -> Result<()> {
        Ok(())
    }

    fn set_log(&mut self, level: u32, src: u32) -> Result<()> {
        log::debug!("set_log level={level:#x} src={src:#x}");
        Ok(())
    }

    fn read_leaf(&mut self, _path: &str) -> Result<Vec<u8>> {
        Err(Error::NotFound)
    }

    fn write_leaf(&mut self, _path: &str, _data: &[u8]) -> Result<()> {
        Err(Error::NotFound)
    }

    fn list_nodes(&mut self, _path: &str) -> Result<Vec<String>> {
        Err(Error::NotFound)
    }

    fn list_leafs(&mut self, _path: &str) -> Result<Vec<String>> {
        Err(Error::NotFound)
    }

    fn set_gid(&mut self, gid: GroupId) -> Result<()> {
        self.shared.num_gids.fetch_add(1, Ordering::AcqRel);
        self.shared.push_op(ControlOp::SetGid(gid))
    }

    fn clear_gids(&mut self) -> Result<()> {
        self.shared.num_gids.store(0, Ordering::Release);
        self.shared.push_op(ControlOp::ClearGids)
    }

    fn set_blob(&mut self, filter: &str, blob: Vec<u8>) -> Result<()> {
        self.shared.push_op(ControlOp::SetBlob {
            filter: filter.to_owned(),
            blob,
        })
    }

    fn set_offload(&mut self, ratio: u32) -> Result<()> {
        self.shared.push_op(ControlOp::SetOffload(ratio))
    }

    fn disconnect(&mut self) -> Result<()> {
        self.shared.push_op(ControlOp::Terminate)
    }
}

impl Drop for SearchConn {
    fn drop(&mut self) {
        self.shared.kill.stop();

        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Allocates a [`SearchConn`] per accepted connection.
pub struct SearchFactory {
    store_dir: PathBuf,
    cache: Option<Arc<ObjectCache>>,
    runner_factory: RunnerFactory,
}

impl SearchFactory {
    /// Creates the factory for the given object directory, with filters
    /// running in child processes.
    #[must_use]
    pub fn new(store_dir: impl Into<PathBuf>) -> Self {
        Self {
            store_dir: store_dir.into(),
            cache: None,
            runner_factory: child_runner_factory(),
        }
    }

    /// Serves object loads through the given pre-warm cache.
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<ObjectCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Replaces the filter runner factory (test seam).
    #[must_use]
    pub fn with_runner_factory(mut self, factory: RunnerFactory) -> Self {
        self.runner_factory = factory;
        self
    }

    /// The object directory searches will scan.
    #[must_use]
    pub fn store_dir(&self) -> &Path {
        &self.store_dir
    }
}

impl ConnFactory for SearchFactory {
    fn new_conn(&self, conn: &Arc<ConnState>, session: SessionId) -> Result<Box<dyn ConnHandler>> {
        Ok(Box::new(SearchConn::spawn(
            session,
            Arc::clone(conn),
            self.store_dir.clone(),
            self.cache.clone(),
            Arc::clone(&self.runner_factory),
        )))
    }

    fn close_conn(&self, session: SessionId) {
        log::debug!("session {session}: connection closed");
    }
}
