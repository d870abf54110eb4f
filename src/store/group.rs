// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Group ids and the on-disk group index.
//!
//! A group is a named set of objects. Its index file lives in the object
//! directory as `GIDIDX<gid:16-hex-uppercase>` and is a fixed-size array of
//! [`GID_IDX_ENT_SIZE`]-byte records, each holding a NUL-padded object file
//! name.

use crate::{Error, Result};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// Prefix of group index file names.
pub const GID_IDX: &str = "GIDIDX";

/// Size of one group index record in bytes.
pub const GID_IDX_ENT_SIZE: usize = 128;

/// A 64-bit group identifier.
///
/// The ASCII form is eight 2-hex-digit bytes separated by `:`
/// (e.g. `01:23:45:67:89:AB:CD:EF`), assembled big-endian.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct GroupId(u64);

impl GroupId {
    /// Wraps a raw 64-bit group id.
    #[must_use]
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw 64-bit value.
    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// The index file name for this group, `GIDIDX` plus 16 uppercase hex
    /// digits.
    #[must_use]
    pub fn idx_file_name(self) -> String {
        format!("{GID_IDX}{:016X}", self.0)
    }

    /// The index file path inside an object directory.
    #[must_use]
    pub fn idx_path(self, dir: &Path) -> PathBuf {
        dir.join(self.idx_file_name())
    }
}

impl std::str::FromStr for GroupId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut raw = 0u64;
        let mut parts = 0u32;

        for part in s.split(':') {
            if part.len() != 2 || !part.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(Error::BadGroupId);
            }

            let byte = u8::from_str_radix(part, 16).map_err(|_| Error::BadGroupId)?;
            raw = (raw << 8) | u64::from(byte);
            parts += 1;
        }

        if parts != 8 {
            return Err(Error::BadGroupId);
        }

        Ok(Self(raw))
    }
}

impl std::fmt::Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let bytes = self.0.to_be_bytes();
        let mut first = true;

        for byte in bytes {
            if !first {
                write!(f, ":")?;
            }
            write!(f, "{byte:02X}")?;
            first = false;
        }

        Ok(())
    }
}

/// One group index record: a NUL-padded object file name.
#[derive(Clone, Copy)]
pub struct GidIdxEnt {
    raw: [u8; GID_IDX_ENT_SIZE],
}

impl GidIdxEnt {
    /// Creates a record from an object file name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the name does not fit.
    pub fn new(name: &str) -> Result<Self> {
        if name.is_empty() || name.len() >= GID_IDX_ENT_SIZE {
            return Err(Error::InvalidArgument("bad index entry name"));
        }

        let mut raw = [0u8; GID_IDX_ENT_SIZE];
        if let Some(dst) = raw.get_mut(..name.len()) {
            dst.copy_from_slice(name.as_bytes());
        }

        Ok(Self { raw })
    }

    /// The stored object file name, NUL padding stripped.
    #[must_use]
    pub fn name(&self) -> &str {
        let end = self.raw.iter().position(|&b| b == 0).unwrap_or(self.raw.len());
        self.raw
            .get(..end)
            .and_then(|bytes| std::str::from_utf8(bytes).ok())
            .unwrap_or("")
    }
}

impl std::fmt::Debug for GidIdxEnt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "GidIdxEnt({})", self.name())
    }
}

/// Reads a group index file.
///
/// # Errors
///
/// Returns [`Error::NotFound`] if the file is missing and
/// [`Error::LoadFailed`] if its size is not a whole number of records.
pub fn read_index(path: &Path) -> Result<Vec<GidIdxEnt>> {
    let mut file = std::fs::File::open(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::NotFound
        } else {
            Error::Io(e)
        }
    })?;

    let len = file.metadata()?.len();
    if len % (GID_IDX_ENT_SIZE as u64) != 0 {
        return Err(Error::LoadFailed);
    }

    let mut entries = Vec::with_capacity((len / GID_IDX_ENT_SIZE as u64) as usize);
    let mut raw = [0u8; GID_IDX_ENT_SIZE];

    for _ in 0..(len / GID_IDX_ENT_SIZE as u64) {
        file.read_exact(&mut raw)?;
        entries.push(GidIdxEnt { raw });
    }

    Ok(entries)
}

/// Rewrites a group index file from a record slice.
///
/// # Errors
///
/// Returns an I/O error if the file cannot be written.
pub fn write_index(path: &Path, entries: &[GidIdxEnt]) -> Result<()> {
    let mut file = std::fs::File::create(path)?;

    for ent in entries {
        file.write_all(&ent.raw)?;
    }

    file.sync_all()?;

    Ok(())
}

/// Shuffles index records in place (uniform Fisher-Yates), de-biasing the
/// scan order of the group.
pub fn shuffle_index(entries: &mut [GidIdxEnt]) {
    use rand::seq::SliceRandom;

    entries.shuffle(&mut rand::rng());
}

#[cfg(test)]
mod tests {
    use super::{read_index, shuffle_index, write_index, GidIdxEnt, GroupId};
    use test_log::test;

    #[test]
    fn gid_parse_roundtrip() {
        let gid = "01:23:45:67:89:AB:CD:EF"
            .parse::<GroupId>()
            .expect("should parse");

        assert_eq!(0x0123_4567_89AB_CDEF, gid.as_u64());
        assert_eq!("GIDIDX0123456789ABCDEF", gid.idx_file_name());
        assert_eq!("01:23:45:67:89:AB:CD:EF", gid.to_string());
    }

    #[test]
    fn gid_parse_rejects_malformed() {
        for s in [
            "",
            "01",
            "01:23:45:67:89:AB:CD",          // 7 parts
            "01:23:45:67:89:AB:CD:EF:00",    // 9 parts
            "1:23:45:67:89:AB:CD:EF",        // short part
            "01:23:45:67:89:AB:CD:ZZ",       // non-hex
        ] {
            assert!(s.parse::<GroupId>().is_err(), "should reject {s:?}");
        }
    }

    #[test]
    fn index_roundtrip_and_shuffle() {
        let folder = tempfile::tempdir().expect("should create tempdir");
        let path = folder.path().join("GIDIDX0000000000000001");

        let names = (0..16).map(|i| format!("obj-{i:03}")).collect::<Vec<_>>();
        let entries = names
            .iter()
            .map(|n| GidIdxEnt::new(n).expect("should create"))
            .collect::<Vec<_>>();

        write_index(&path, &entries).expect("should write");

        let mut read_back = read_index(&path).expect("should read");
        assert_eq!(names.len(), read_back.len());

        shuffle_index(&mut read_back);

        let mut shuffled_names = read_back.iter().map(GidIdxEnt::name).collect::<Vec<_>>();
        shuffled_names.sort_unstable();

        let mut expected = names.iter().map(String::as_str).collect::<Vec<_>>();
        expected.sort_unstable();

        assert_eq!(expected, shuffled_names);
    }

    #[test]
    fn index_rejects_ragged_file() {
        let folder = tempfile::tempdir().expect("should create tempdir");
        let path = folder.path().join("GIDIDX0000000000000002");

        std::fs::write(&path, vec![0u8; super::GID_IDX_ENT_SIZE + 1]).expect("should write");

        assert!(read_index(&path).is_err());
    }
}
