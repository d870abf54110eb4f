// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::attr::AttributeSet;
use std::sync::Arc;

/// A unit of searchable content paired with a mutable attribute table.
///
/// The payload is immutable after load and cheap to clone; the attribute set
/// accumulates filter-produced entries while the object moves down the chain.
///
/// Ownership: created by the object store iterator, exclusively held by
/// whichever ring slot (or caller) holds it, and released by the transport
/// once shipped, or dropped explicitly.
#[derive(Clone, Debug)]
pub struct Object {
    data: Arc<[u8]>,
    attrs: AttributeSet,
}

impl Object {
    /// Creates an object from its raw payload and attribute set.
    #[must_use]
    pub fn new(data: impl Into<Arc<[u8]>>, attrs: AttributeSet) -> Self {
        Self {
            data: data.into(),
            attrs,
        }
    }

    /// Creates an object with an empty attribute set.
    #[must_use]
    pub fn from_bytes(data: impl Into<Arc<[u8]>>) -> Self {
        Self::new(data, AttributeSet::new())
    }

    /// The opaque byte payload.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Payload length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the payload is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The attribute table.
    #[must_use]
    pub fn attrs(&self) -> &AttributeSet {
        &self.attrs
    }

    /// Mutable access to the attribute table (used by filters).
    pub fn attrs_mut(&mut self) -> &mut AttributeSet {
        &mut self.attrs
    }
}
