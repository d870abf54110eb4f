// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! On-disk object store.
//!
//! A store is a single filesystem directory of per-object files. A sidecar
//! file with the same name plus [`ATTR_EXT`] holds the binary attribute
//! table for that object; sidecars are never yielded as objects themselves.

mod cache;
pub mod group;

pub use cache::ObjectCache;

use crate::{attr::AttributeSet, AttrOrigin, Error, Object, Result};
use std::fs::ReadDir;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// File name extension marking attribute sidecar files.
pub const ATTR_EXT: &str = ".attr";

/// Maximum object file name length in bytes.
pub const MAX_FNAME: usize = 128;

/// Default object directory of the daemon.
pub const DEFAULT_OBJ_DIR: &str = "/opt/dir1";

fn sidecar_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(ATTR_EXT);
    PathBuf::from(os)
}

/// Loads a single object: the whole payload file plus its decoded sidecar
/// attribute table (empty if there is no sidecar).
///
/// # Errors
///
/// - [`Error::InvalidArgument`] if the file name is too long
/// - [`Error::LoadFailed`] if the payload or sidecar cannot be read or parsed
pub fn load_obj(path: &Path) -> Result<Object> {
    let name_len = path.file_name().map_or(0, |name| name.len());
    if name_len == 0 || name_len > MAX_FNAME {
        return Err(Error::InvalidArgument("bad object file name"));
    }

    let data = std::fs::read(path).map_err(|e| {
        log::warn!("failed to read object {}: {e}", path.display());
        Error::LoadFailed
    })?;

    let sidecar = sidecar_path(path);

    let mut attrs = if sidecar.is_file() {
        let blob = std::fs::read(&sidecar).map_err(|e| {
            log::warn!("failed to read sidecar {}: {e}", sidecar.display());
            Error::LoadFailed
        })?;

        AttributeSet::decode(&blob)?
    } else {
        AttributeSet::new()
    };

    // the object name rides along as a regular attribute
    if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
        attrs.set("name", name.as_bytes().to_vec(), AttrOrigin::Original)?;
    }

    Ok(Object::new(data, attrs))
}

/// Lazy, stateful, single-consumer iterator over the objects of a directory.
///
/// Read errors on individual entries are logged and the entry is skipped;
/// only opening the directory itself can fail hard.
pub struct ObjectStore {
    dir: PathBuf,
    entries: ReadDir,
    cache: Option<Arc<ObjectCache>>,
    skipped: u64,
    cache_hits: u64,
}

impl ObjectStore {
    /// Opens the object directory.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the directory does not exist.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        Self::open_with_cache(dir, None)
    }

    /// Opens the object directory, serving loads from `cache` when possible.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the directory does not exist.
    pub fn open_with_cache(
        dir: impl Into<PathBuf>,
        cache: Option<Arc<ObjectCache>>,
    ) -> Result<Self> {
        let dir = dir.into();

        let entries = std::fs::read_dir(&dir).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::NotFound
            } else {
                Error::Io(e)
            }
        })?;

        log::debug!("opened object store at {}", dir.display());

        Ok(Self {
            dir,
            entries,
            cache,
            skipped: 0,
            cache_hits: 0,
        })
    }

    /// The directory this store iterates.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Number of entries skipped because they could not be loaded.
    #[must_use]
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Number of objects served from the pre-warm cache.
    #[must_use]
    pub fn cache_hits(&self) -> u64 {
        self.cache_hits
    }

    /// Advances to the next object.
    ///
    /// Returns `Ok(None)` once the directory is exhausted. Entries that are
    /// not regular files, and attribute sidecars, are passed over silently;
    /// entries that fail to load are logged, counted in [`Self::skipped`] and
    /// passed over.
    ///
    /// # Errors
    ///
    /// Currently never fails after open; the signature leaves room for
    /// directory-level errors.
    pub fn next_obj(&mut self) -> Result<Option<Object>> {
        loop {
            let Some(entry) = self.entries.next() else {
                return Ok(None);
            };

            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    log::warn!("unreadable directory entry: {e}");
                    self.skipped += 1;
                    continue;
                }
            };

            let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
            if !is_file {
                continue;
            }

            let name = entry.file_name();
            if name.to_string_lossy().ends_with(ATTR_EXT) {
                continue;
            }

            let path = entry.path();

            if let Some(cache) = &self.cache {
                if let Some(obj) = cache.get(&path) {
                    self.cache_hits += 1;
                    return Ok(Some(obj));
                }
            }

            match load_obj(&path) {
                Ok(obj) => return Ok(Some(obj)),
                Err(e) => {
                    log::warn!("skipping {}: {e}", path.display());
                    self.skipped += 1;
                }
            }
        }
    }
}
