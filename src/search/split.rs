// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Local/offload work split policy.

/// Queue depth below which the host is not given enough work.
pub const SPLIT_DEFAULT_BP_THRESH: u32 = 15;

/// Default local-computation percentage.
pub const SPLIT_DEFAULT_RATIO: u32 = 100;

/// Step the dynamic policy moves the ratio by.
pub const SPLIT_DEFAULT_AUTO_STEP: u32 = 5;

/// Pending-object depth below which the ratio decrements.
pub const SPLIT_DEFAULT_PEND_LOW: u32 = 200;

/// Multiplier applied to [`SPLIT_DEFAULT_PEND_HIGH`].
pub const SPLIT_DEFAULT_MULT: u32 = 20;

/// Base pending-object depth above which the ratio increments.
pub const SPLIT_DEFAULT_PEND_HIGH: u32 = 10;

/// Default cap on objects pending in the pipeline.
pub const SSTATE_DEFAULT_PEND_MAX: u32 = 30;

/// Window of the smoothed-ratio moving average.
const SPLIT_AVG_WINDOW: f64 = 16.0;

/// How the local/offloaded work split is chosen.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum SplitType {
    /// A fixed percentage of the work executes locally.
    #[default]
    Fixed,

    /// The percentage tracks observed queue depths.
    Dynamic,
}

/// Governs how much filter computation executes locally versus being
/// offloaded upstream (shipped as partial results).
///
/// `ratio` is the percentage of objects evaluated locally, 0 to 100.
#[derive(Clone, Debug)]
pub struct SplitPolicy {
    split_type: SplitType,
    ratio: u32,
    bp_thresh: u32,
    auto_step: u32,
    mult: u32,
    pend_max: u32,
    smoothed_ratio: f64,
    avg_ratio: f64,
    updates: u64,
}

impl Default for SplitPolicy {
    fn default() -> Self {
        Self {
            split_type: SplitType::default(),
            ratio: SPLIT_DEFAULT_RATIO,
            bp_thresh: SPLIT_DEFAULT_BP_THRESH,
            auto_step: SPLIT_DEFAULT_AUTO_STEP,
            mult: SPLIT_DEFAULT_MULT,
            pend_max: SSTATE_DEFAULT_PEND_MAX,
            smoothed_ratio: f64::from(SPLIT_DEFAULT_RATIO),
            avg_ratio: f64::from(SPLIT_DEFAULT_RATIO),
            updates: 0,
        }
    }
}

impl SplitPolicy {
    /// A fixed policy pinned at the given local percentage.
    #[must_use]
    pub fn fixed(ratio: u32) -> Self {
        Self {
            ratio: ratio.min(100),
            smoothed_ratio: f64::from(ratio.min(100)),
            avg_ratio: f64::from(ratio.min(100)),
            ..Self::default()
        }
    }

    /// A dynamic policy starting at the default ratio.
    #[must_use]
    pub fn dynamic() -> Self {
        Self {
            split_type: SplitType::Dynamic,
            ..Self::default()
        }
    }

    /// The policy kind.
    #[must_use]
    pub fn split_type(&self) -> SplitType {
        self.split_type
    }

    /// Current local-computation percentage.
    #[must_use]
    pub fn ratio(&self) -> u32 {
        self.ratio
    }

    /// Pins the ratio (e.g. from a client `set_offload` request).
    pub fn set_ratio(&mut self, ratio: u32) {
        self.ratio = ratio.min(100);
    }

    /// Cap on objects pending in the pipeline.
    #[must_use]
    pub fn pend_max(&self) -> u32 {
        self.pend_max
    }

    /// Queue depth under which the host should be fed more work.
    #[must_use]
    pub fn bp_thresh(&self) -> u32 {
        self.bp_thresh
    }

    /// Smoothed ratio rounded for reporting.
    #[must_use]
    pub fn smoothed_int_ratio(&self) -> u32 {
        self.smoothed_ratio.round() as u32
    }

    /// Running average ratio rounded for reporting.
    #[must_use]
    pub fn avg_int_ratio(&self) -> u32 {
        self.avg_ratio.round() as u32
    }

    /// Feeds one queue-depth observation into the policy.
    ///
    /// Under [`SplitType::Dynamic`], a deep pending queue raises the local
    /// share, a shallow one lowers it, clamped to `[0, 100]`.
    pub fn update(&mut self, pend_objs: u32) {
        if self.split_type == SplitType::Dynamic {
            let high = SPLIT_DEFAULT_PEND_HIGH * self.mult;

            if pend_objs > high {
                self.ratio = (self.ratio + self.auto_step).min(100);
            } else if pend_objs < SPLIT_DEFAULT_PEND_LOW {
                self.ratio = self.ratio.saturating_sub(self.auto_step);
            }
        }

        self.smoothed_ratio = ((SPLIT_AVG_WINDOW - 1.0) / SPLIT_AVG_WINDOW) * self.smoothed_ratio
            + f64::from(self.ratio) / SPLIT_AVG_WINDOW;

        self.updates += 1;
        self.avg_ratio += (f64::from(self.ratio) - self.avg_ratio) / self.updates as f64;
    }

    /// Whether the `n`-th object of the search should be evaluated locally.
    ///
    /// A plain modulo spread: `ratio` percent of any 100 consecutive objects
    /// run locally, the rest bypass the chain and ship as partial results.
    #[must_use]
    pub fn eval_locally(&self, obj_seq: u64) -> bool {
        (obj_seq % 100) < u64::from(self.ratio)
    }
}
