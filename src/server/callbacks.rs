// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The callback surface between the transport and the search layer.

use super::conn::ConnState;
use crate::filter::FilterSpec;
use crate::search::{DevStats, SessionId};
use crate::store::group::GroupId;
use crate::{Object, Result};
use std::sync::Arc;

/// Client-side statistics reported with a `stop` request.
#[derive(Clone, Copy, Debug, Default)]
pub struct HostStats {
    /// Objects the host received over this search.
    pub objs_received: u64,

    /// Objects still queued at the host.
    pub objs_queued: u64,
}

/// Static device characteristics reported by `get_char`.
#[derive(Clone, Debug)]
pub struct DeviceChar {
    /// Instruction set architecture of this server.
    pub isa: String,

    /// Nominal processor speed in kHz.
    pub cpu_khz: u64,

    /// Free memory in kilobytes.
    pub free_mem_kb: u64,
}

impl Default for DeviceChar {
    fn default() -> Self {
        Self {
            isa: std::env::consts::ARCH.to_owned(),
            cpu_khz: 0,
            free_mem_kb: 0,
        }
    }
}

/// The per-connection callback surface the transport dispatches into.
///
/// One implementation is allocated per accepted connection (by a
/// [`ConnFactory`]); the listener owns it behind this trait and forwards
/// decoded client control records to it.
///
/// The dynamic-control quartet (`read_leaf`/`write_leaf`/`list_nodes`/
/// `list_leafs`) and the log controls stay in the dispatch table but may
/// answer "unsupported".
pub trait ConnHandler: Send {
    /// Begins streaming execution of the configured search.
    fn start(&mut self) -> Result<()>;

    /// Stops the running search; the host reports its own stats.
    fn stop(&mut self, host: &HostStats) -> Result<()>;

    /// Installs the ordered filter list of the next search.
    fn set_spec(&mut self, specs: Vec<FilterSpec>) -> Result<()>;

    /// Announces the filter code object with the given signature.
    fn set_obj(&mut self, sig: &[u8]) -> Result<()>;

    /// Announces an object list (legacy; accepted and ignored).
    fn set_list(&mut self) -> Result<()>;

    /// Tears the search down; terminal.
    fn terminate(&mut self) -> Result<()>;

    /// Snapshot of the per-search statistics.
    fn get_stats(&mut self) -> Result<DevStats>;

    /// Returns ownership of an unsent object to the search layer.
    fn release_obj(&mut self, obj: Object) -> Result<()>;

    /// Static device characteristics.
    fn get_char(&mut self) -> Result<DeviceChar>;

    /// The client finished consuming the log stream.
    fn log_done(&mut self) -> Result<()>;

    /// Adjusts log level and source mask.
    fn set_log(&mut self, level: u32, src: u32) -> Result<()>;

    /// Reads a dynamic-control leaf.
    fn read_leaf(&mut self, path: &str) -> Result<Vec<u8>>;

    /// Writes a dynamic-control leaf.
    fn write_leaf(&mut self, path: &str, data: &[u8]) -> Result<()>;

    /// Lists dynamic-control child nodes.
    fn list_nodes(&mut self, path: &str) -> Result<Vec<String>>;

    /// Lists dynamic-control leaves.
    fn list_leafs(&mut self, path: &str) -> Result<Vec<String>>;

    /// Adds a group id to the next search.
    fn set_gid(&mut self, gid: GroupId) -> Result<()>;

    /// Clears the configured group ids.
    fn clear_gids(&mut self) -> Result<()>;

    /// Attaches a binary blob argument to the named filter.
    fn set_blob(&mut self, filter: &str, blob: Vec<u8>) -> Result<()>;

    /// Pins the local/offload split ratio.
    fn set_offload(&mut self, ratio: u32) -> Result<()>;

    /// The peer went away; the connection is closing.
    fn disconnect(&mut self) -> Result<()>;
}

/// Allocates the application state of a freshly accepted connection.
pub trait ConnFactory: Send + Sync {
    /// Called once per accepted control connection.
    ///
    /// # Errors
    ///
    /// Failing refuses the connection.
    fn new_conn(&self, conn: &Arc<ConnState>, session: SessionId) -> Result<Box<dyn ConnHandler>>;

    /// Called when a connection reaches its terminal state.
    fn close_conn(&self, session: SessionId);
}
