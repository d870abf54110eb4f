// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{Error, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};
use std::sync::Arc;

/// Maximum attribute name length in bytes (including nothing; no terminator
/// is stored).
pub const MAX_ATTR_NAME: usize = 128;

/// Where an attribute value came from.
///
/// Attributes are the side channel by which filters communicate with each
/// other and with the client.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AttrOrigin {
    /// Loaded from the object's sidecar file
    Original,

    /// Written by a filter during chain execution
    FilterProduced,

    /// Present, but elided when the object is shipped to the client
    Omitted,
}

impl AttrOrigin {
    fn to_u8(self) -> u8 {
        match self {
            Self::Original => 0,
            Self::FilterProduced => 1,
            Self::Omitted => 2,
        }
    }

    fn from_u8(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(Self::Original),
            1 => Ok(Self::FilterProduced),
            2 => Ok(Self::Omitted),
            _ => Err(Error::LoadFailed),
        }
    }
}

/// A single named attribute.
#[derive(Clone, Debug)]
pub struct Attribute {
    name: String,
    value: Arc<[u8]>,
    origin: AttrOrigin,
}

impl Attribute {
    /// The attribute name (unique within its set).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The value blob.
    #[must_use]
    pub fn value(&self) -> &[u8] {
        &self.value
    }

    /// The origin tag.
    #[must_use]
    pub fn origin(&self) -> AttrOrigin {
        self.origin
    }
}

/// An ordered mapping from attribute name to value blob plus origin tag.
///
/// Insertion order is preserved; rewriting an existing name replaces the
/// value in place. Sets are small (a handful of entries per object), so
/// lookup is a linear scan.
#[derive(Clone, Debug, Default)]
pub struct AttributeSet {
    entries: Vec<Attribute>,
}

impl AttributeSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of attributes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Looks up a value by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|attr| attr.name == name)
            .map(|attr| &*attr.value)
    }

    /// Looks up the full entry by name.
    #[must_use]
    pub fn entry(&self, name: &str) -> Option<&Attribute> {
        self.entries.iter().find(|attr| attr.name == name)
    }

    /// Inserts or replaces an attribute, keeping its position on replace.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the name is empty or too long.
    pub fn set(&mut self, name: &str, value: impl Into<Arc<[u8]>>, origin: AttrOrigin) -> Result<()> {
        if name.is_empty() {
            return Err(Error::InvalidArgument("attribute name is empty"));
        }
        if name.len() > MAX_ATTR_NAME {
            return Err(Error::InvalidArgument("attribute name too long"));
        }

        let value = value.into();

        if let Some(attr) = self.entries.iter_mut().find(|attr| attr.name == name) {
            attr.value = value;
            attr.origin = origin;
        } else {
            self.entries.push(Attribute {
                name: name.to_owned(),
                value,
                origin,
            });
        }

        Ok(())
    }

    /// Marks an attribute as omitted-for-transmission.
    ///
    /// Returns whether the attribute existed.
    pub fn omit(&mut self, name: &str) -> bool {
        if let Some(attr) = self.entries.iter_mut().find(|attr| attr.name == name) {
            attr.origin = AttrOrigin::Omitted;
            true
        } else {
            false
        }
    }

    /// Iterates over all entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Attribute> {
        self.entries.iter()
    }

    /// Serializes the set in the sidecar format:
    /// `<name-len:u32><name><value-len:u32><value><origin:u8>` repeated,
    /// no terminator.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the writer fails.
    pub fn encode_into<W: Write>(&self, writer: &mut W) -> Result<()> {
        for attr in &self.entries {
            writer.write_u32::<LittleEndian>(attr.name.len() as u32)?;
            writer.write_all(attr.name.as_bytes())?;
            writer.write_u32::<LittleEndian>(attr.value.len() as u32)?;
            writer.write_all(&attr.value)?;
            writer.write_u8(attr.origin.to_u8())?;
        }
        Ok(())
    }

    /// Serializes into a fresh buffer, optionally eliding entries marked
    /// [`AttrOrigin::Omitted`] (the form used when shipping to the client).
    #[must_use]
    pub fn encode_to_vec(&self, elide_omitted: bool) -> Vec<u8> {
        let mut out = vec![];

        for attr in &self.entries {
            if elide_omitted && attr.origin == AttrOrigin::Omitted {
                continue;
            }

            // Vec write cannot fail
            let _ = out.write_u32::<LittleEndian>(attr.name.len() as u32);
            let _ = out.write_all(attr.name.as_bytes());
            let _ = out.write_u32::<LittleEndian>(attr.value.len() as u32);
            let _ = out.write_all(&attr.value);
            let _ = out.write_u8(attr.origin.to_u8());
        }

        out
    }

    /// Parses a sidecar blob. Total length must be consumed exactly.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LoadFailed`] on any framing violation.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(bytes);
        let len = bytes.len() as u64;
        let mut set = Self::new();

        while cursor.position() < len {
            let name_len = cursor.read_u32::<LittleEndian>().map_err(|_| Error::LoadFailed)? as usize;
            if name_len == 0 || name_len > MAX_ATTR_NAME {
                return Err(Error::LoadFailed);
            }

            let mut name = vec![0; name_len];
            cursor.read_exact(&mut name).map_err(|_| Error::LoadFailed)?;
            let name = String::from_utf8(name).map_err(|_| Error::LoadFailed)?;

            let value_len = cursor.read_u32::<LittleEndian>().map_err(|_| Error::LoadFailed)? as usize;
            if (len - cursor.position()) < value_len as u64 {
                return Err(Error::LoadFailed);
            }

            let mut value = vec![0; value_len];
            cursor.read_exact(&mut value).map_err(|_| Error::LoadFailed)?;

            let origin = AttrOrigin::from_u8(cursor.read_u8().map_err(|_| Error::LoadFailed)?)?;

            set.set(&name, value, origin)?;
        }

        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::{AttrOrigin, AttributeSet};
    use test_log::test;

    #[test]
    fn attr_set_replaces_in_place() {
        let mut set = AttributeSet::new();
        set.set("a", *b"1", AttrOrigin::Original).expect("should set");
        set.set("b", *b"2", AttrOrigin::Original).expect("should set");
        set.set("a", *b"3", AttrOrigin::FilterProduced)
            .expect("should set");

        assert_eq!(2, set.len());
        assert_eq!(Some(b"3".as_slice()), set.get("a"));

        let names = set.iter().map(super::Attribute::name).collect::<Vec<_>>();
        assert_eq!(vec!["a", "b"], names);
    }

    #[test]
    fn attr_codec_roundtrip() {
        let mut set = AttributeSet::new();
        set.set("name", *b"obj-1", AttrOrigin::Original)
            .expect("should set");
        set.set("score", 42u32.to_le_bytes(), AttrOrigin::FilterProduced)
            .expect("should set");

        let bytes = set.encode_to_vec(false);
        let decoded = AttributeSet::decode(&bytes).expect("should decode");

        assert_eq!(2, decoded.len());
        assert_eq!(Some(b"obj-1".as_slice()), decoded.get("name"));
        assert_eq!(
            AttrOrigin::FilterProduced,
            decoded.entry("score").expect("should exist").origin(),
        );
    }

    #[test]
    fn attr_codec_elides_omitted() {
        let mut set = AttributeSet::new();
        set.set("keep", *b"x", AttrOrigin::Original).expect("should set");
        set.set("internal", *b"y", AttrOrigin::Original)
            .expect("should set");
        assert!(set.omit("internal"));

        let bytes = set.encode_to_vec(true);
        let decoded = AttributeSet::decode(&bytes).expect("should decode");

        assert_eq!(1, decoded.len());
        assert!(decoded.get("internal").is_none());
    }

    #[test]
    fn attr_decode_rejects_truncated() {
        let mut set = AttributeSet::new();
        set.set("a", *b"value", AttrOrigin::Original).expect("should set");

        let mut bytes = set.encode_to_vec(false);
        bytes.truncate(bytes.len() - 2);

        assert!(AttributeSet::decode(&bytes).is_err());
    }

    #[test]
    fn attr_rejects_oversized_name() {
        let mut set = AttributeSet::new();
        let long = "x".repeat(super::MAX_ATTR_NAME + 1);
        assert!(set.set(&long, *b"v", AttrOrigin::Original).is_err());
    }
}
