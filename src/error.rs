// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

/// Represents errors that can occur in the search server
#[derive(Debug)]
pub enum Error {
    /// I/O error
    Io(std::io::Error),

    /// Bad caller input (name too long, malformed spec, ...)
    InvalidArgument(&'static str),

    /// Missing object directory or index file
    NotFound,

    /// An individual object could not be loaded from disk
    LoadFailed,

    /// A bounded queue was full (non-fatal, callers retry)
    QueueFull,

    /// A bounded queue was empty (non-fatal, callers retry)
    QueueEmpty,

    /// Framing violation from a filter child process
    ///
    /// The offending filter is quarantined and the owning search aborted.
    FilterProtocol(&'static str),

    /// Peer is gone; the connection enters its terminal state
    TransportClosed,

    /// Malformed group id string
    BadGroupId,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AdiskdError: {self:?}")
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

/// Search server result
pub type Result<T> = std::result::Result<T, Error>;
