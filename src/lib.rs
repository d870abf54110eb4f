// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Server-side worker of an interactive brute-force search platform.
//!
//! A remote client submits a search specification (an ordered bag of
//! user-supplied filters plus configuration) and a group of objects to scan.
//! The server reads every object from local storage, evaluates the filter
//! pipeline against each one and streams back those that pass.
//!
//! The interesting part is the search execution core:
//!
//! - objects are read off disk by a lazy directory iterator
//! - each object runs through a filter chain whose *ordering* is re-optimized
//!   at runtime from observed per-filter cost and selectivity
//! - results are shipped back over an asynchronous, rate-aware connection
//!
//! all coordinated by a small collection of OS threads and bounded,
//! mutex-protected ring queues.
//!
//! Filters are untrusted code and therefore always execute in isolated child
//! processes; the per-object invocation is an RPC over the child's stdio using
//! a simple length-tagged framing (see [`filter::proto`]).
//!
//! # Example
//!
//! ```
//! use adiskd::filter::exec::{FilterExecutor, Verdict};
//! use adiskd::filter::runner::{FnFilter, FilterRunner};
//! use adiskd::filter::{FilterData, FilterSpec};
//! use adiskd::Object;
//! use std::sync::Arc;
//!
//! // A spec with a single filter that keeps objects starting with `b'a'`
//! let spec = FilterSpec::new("starts-with-a", "/bin/true")?;
//! let fdata = Arc::new(FilterData::new(vec![spec])?);
//!
//! let runners: Vec<Box<dyn FilterRunner>> = vec![Box::new(FnFilter::new(
//!     |obj| i64::from(obj.data().first() == Some(&b'a')),
//! ))];
//!
//! let mut executor = FilterExecutor::new(fdata, runners)?;
//!
//! let mut obj = Object::from_bytes(b"abc".to_vec());
//! assert!(matches!(executor.eval_object(&mut obj)?, Verdict::Passed));
//! #
//! # Ok::<(), adiskd::Error>(())
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs, clippy::cargo)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::indexing_slicing)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::multiple_crate_versions)]
#![allow(clippy::option_if_let_else)]

mod attr;
mod error;

pub mod filter;

mod object;
mod ring;

pub mod search;
pub mod server;
pub mod store;

mod stop_signal;

#[doc(hidden)]
pub use stop_signal::StopSignal;

pub use {
    attr::{AttrOrigin, Attribute, AttributeSet, MAX_ATTR_NAME},
    error::{Error, Result},
    object::Object,
    ring::{Ring, MAX_ENQ_THREAD},
};
