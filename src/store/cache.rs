// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::Object;
use quick_cache::{sync::Cache as QuickCache, UnitWeighter};
use std::path::{Path, PathBuf};

/// Caches loaded objects by path, so the background pre-warm pass can pay
/// the disk cost before a search asks for the object.
pub struct ObjectCache {
    inner: QuickCache<PathBuf, Object, UnitWeighter, rustc_hash::FxBuildHasher>,
}

impl ObjectCache {
    /// Creates a cache that holds up to `capacity` objects.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        use quick_cache::sync::DefaultLifecycle;

        #[allow(clippy::default_trait_access)]
        let quick_cache = QuickCache::with(
            1_000,
            capacity as u64,
            UnitWeighter,
            Default::default(),
            DefaultLifecycle::default(),
        );

        Self { inner: quick_cache }
    }

    /// Drops all cached objects.
    #[doc(hidden)]
    pub fn clear(&self) {
        self.inner.clear();
    }

    /// Number of cached objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Looks up a cached object by path.
    #[must_use]
    pub fn get(&self, path: &Path) -> Option<Object> {
        self.inner.get(path)
    }

    /// Inserts a freshly loaded object.
    pub fn insert(&self, path: PathBuf, obj: Object) {
        self.inner.insert(path, obj);
    }
}
