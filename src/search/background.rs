// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Idle-time cache pre-warming.

use crate::store::{ObjectCache, ObjectStore};
use crate::{Result, StopSignal};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Pause between background object loads, keeping the pass at a lower
/// priority than any live search.
const BG_THROTTLE: Duration = Duration::from_millis(2);

/// The background task: a low-priority pass over not-yet-scanned objects
/// that pre-warms the object cache.
///
/// Runs at most once at a time; the server decides *when* it may run
/// (idle-only by default) and observes completion through the thread handle.
pub struct BackgroundScan {
    dir: PathBuf,
    cache: Arc<ObjectCache>,
    stop: StopSignal,
}

impl BackgroundScan {
    /// Creates a scan over the given object directory.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, cache: Arc<ObjectCache>) -> Self {
        Self {
            dir: dir.into(),
            cache,
            stop: StopSignal::default(),
        }
    }

    /// Signal that cancels the scan at its next object boundary.
    #[must_use]
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Runs the pass to completion (or cancellation). Returns the number of
    /// objects warmed.
    ///
    /// # Errors
    ///
    /// Returns an error only if the directory cannot be opened; per-object
    /// failures are skipped like any other scan.
    pub fn run(self) -> Result<u64> {
        let mut store = ObjectStore::open(&self.dir)?;
        let mut warmed = 0u64;

        log::debug!("background scan of {} starting", self.dir.display());

        while let Some(obj) = store.next_obj()? {
            if self.stop.is_stopped() {
                log::debug!("background scan cancelled after {warmed} objects");
                return Ok(warmed);
            }

            let key = obj
                .attrs()
                .get("name")
                .and_then(|name| std::str::from_utf8(name).ok())
                .map(|name| self.dir.join(name));

            if let Some(key) = key {
                self.cache.insert(key, obj);
                warmed += 1;
            }

            std::thread::sleep(BG_THROTTLE);
        }

        log::debug!("background scan warmed {warmed} objects");

        Ok(warmed)
    }
}

#[cfg(test)]
mod tests {
    use super::BackgroundScan;
    use crate::store::{ObjectCache, ObjectStore};
    use std::sync::Arc;
    use test_log::test;

    #[test]
    fn background_warms_cache() {
        let folder = tempfile::tempdir().expect("should create tempdir");
        let dir = folder.path();

        for i in 0..3 {
            std::fs::write(dir.join(format!("obj-{i}")), vec![i]).expect("should write");
        }

        let cache = Arc::new(ObjectCache::new(16));
        let warmed = BackgroundScan::new(dir, Arc::clone(&cache))
            .run()
            .expect("should scan");

        assert_eq!(3, warmed);
        assert_eq!(3, cache.len());

        // a subsequent store pass is served from the cache
        let mut store =
            ObjectStore::open_with_cache(dir, Some(Arc::clone(&cache))).expect("should open");

        let mut seen = 0;
        while store.next_obj().expect("should iterate").is_some() {
            seen += 1;
        }

        assert_eq!(3, seen);
        assert_eq!(3, store.cache_hits());
    }

    #[test]
    fn background_stops_on_signal() {
        let folder = tempfile::tempdir().expect("should create tempdir");
        let dir = folder.path();

        for i in 0..8 {
            std::fs::write(dir.join(format!("obj-{i}")), vec![i]).expect("should write");
        }

        let cache = Arc::new(ObjectCache::new(16));
        let scan = BackgroundScan::new(dir, cache);

        scan.stop_signal().stop();

        let warmed = scan.run().expect("should scan");
        assert_eq!(0, warmed);
    }
}
