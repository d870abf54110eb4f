// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Listening endpoints and the control-record dispatcher.
//!
//! Two TCP sockets are bound: control and data. Every accepted control
//! connection gets its own [`ConnState`], an application handler from the
//! [`ConnFactory`] and (by default) a service thread; the matching data
//! connection is paired up by session id and serviced by a tx thread.
//!
//! Control records reuse the filter RPC framing ([`crate::filter::proto`]):
//! a `str` command followed by the command's framed arguments, answered by
//! an `int` status plus any reply records.

pub mod callbacks;
pub mod conn;

use crate::filter::{proto, FilterSpec};
use crate::search::background::BackgroundScan;
use crate::search::SessionId;
use crate::store::{ObjectCache, DEFAULT_OBJ_DIR};
use crate::{Error, Result, StopSignal};
use callbacks::{ConnFactory, ConnHandler, HostStats};
use conn::{ConnState, CSTATE_AUTHED, CSTATE_CLOSING};
use rustc_hash::FxHashMap;
use std::io::{BufReader, BufWriter, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// Well-known control port.
pub const CONTROL_PORT: u16 = 5872;

/// Well-known data port.
pub const DATA_PORT: u16 = 5873;

/// The fixed (control, data) port pair of this platform.
#[must_use]
pub fn lookup_ports() -> (u16, u16) {
    (CONTROL_PORT, DATA_PORT)
}

/// Nap between idle listener iterations.
const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// Default size of the object pre-warm cache.
pub const OBJECT_CACHE_SIZE: usize = 4_096;

/// Server-wide configuration, built once at startup from the CLI.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Detach from the terminal at startup.
    pub daemon: bool,

    /// Service every connection on its own thread (`false` is the single
    /// threaded debugging mode).
    pub fork_conns: bool,

    /// Run the background pre-warm task at all.
    pub background: bool,

    /// Only run the background task while no searches are active.
    pub idle_background: bool,

    /// Bind to loopback instead of all interfaces.
    pub bind_locally: bool,

    /// Keep stderr open when daemonizing.
    pub not_silent: bool,

    /// Require this token on every control connection.
    pub auth_token: Option<String>,

    /// The object directory served by this worker.
    pub obj_dir: PathBuf,

    /// Control port (0 picks an ephemeral port).
    pub control_port: u16,

    /// Data port (0 picks an ephemeral port).
    pub data_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let (control_port, data_port) = lookup_ports();

        Self {
            daemon: true,
            fork_conns: true,
            background: true,
            idle_background: true,
            bind_locally: false,
            not_silent: false,
            auth_token: None,
            obj_dir: PathBuf::from(DEFAULT_OBJ_DIR),
            control_port,
            data_port,
        }
    }
}

/// Mutable server-wide state owned by the listener.
struct ServerState {
    active_searches: AtomicUsize,
    background: Mutex<Option<(JoinHandle<()>, StopSignal)>>,
    bg_ran: AtomicBool,
}

/// Maps an error onto the wire status code.
fn status_code(e: &Error) -> i64 {
    match e {
        Error::InvalidArgument(_) => 22,
        Error::NotFound | Error::LoadFailed => 2,
        Error::QueueFull | Error::QueueEmpty => 11,
        Error::FilterProtocol(_) => 71,
        Error::TransportClosed => 32,
        Error::BadGroupId => 33,
        Error::Io(_) => 5,
    }
}

/// The accept loop owner: two listening sockets, the session table and the
/// background task tracker.
pub struct Listener {
    config: ServerConfig,
    factory: Arc<dyn ConnFactory>,
    cache: Arc<ObjectCache>,
    control: TcpListener,
    data: TcpListener,
    state: ServerState,
    sessions: Mutex<FxHashMap<SessionId, Arc<ConnState>>>,
    next_session: AtomicU64,
    conns: Mutex<Vec<JoinHandle<()>>>,
    tx_workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Listener {
    /// Binds the control and data sockets, with a fresh pre-warm cache.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if either bind fails.
    pub fn bind(config: ServerConfig, factory: Arc<dyn ConnFactory>) -> Result<Arc<Self>> {
        Self::bind_with_cache(config, factory, Arc::new(ObjectCache::new(OBJECT_CACHE_SIZE)))
    }

    /// Binds the control and data sockets, sharing the given cache with the
    /// background task.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if either bind fails.
    pub fn bind_with_cache(
        config: ServerConfig,
        factory: Arc<dyn ConnFactory>,
        cache: Arc<ObjectCache>,
    ) -> Result<Arc<Self>> {
        let addr = if config.bind_locally {
            Ipv4Addr::LOCALHOST
        } else {
            Ipv4Addr::UNSPECIFIED
        };

        let control = TcpListener::bind((addr, config.control_port))?;
        let data = TcpListener::bind((addr, config.data_port))?;

        control.set_nonblocking(true)?;

        log::info!(
            "listening on {} (control) / {} (data)",
            control.local_addr()?,
            data.local_addr()?
        );

        Ok(Arc::new(Self {
            config,
            factory,
            cache,
            control,
            data,
            state: ServerState {
                active_searches: AtomicUsize::new(0),
                background: Mutex::new(None),
                bg_ran: AtomicBool::new(false),
            },
            sessions: Mutex::new(FxHashMap::default()),
            next_session: AtomicU64::new(1),
            conns: Mutex::new(vec![]),
            tx_workers: Mutex::new(vec![]),
        }))
    }

    /// The bound (control, data) socket addresses.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the sockets are gone.
    pub fn local_addrs(&self) -> Result<(SocketAddr, SocketAddr)> {
        Ok((self.control.local_addr()?, self.data.local_addr()?))
    }

    /// The shared object pre-warm cache.
    #[must_use]
    pub fn cache(&self) -> &Arc<ObjectCache> {
        &self.cache
    }

    /// Number of live connections.
    #[must_use]
    pub fn active_searches(&self) -> usize {
        self.state.active_searches.load(Ordering::Acquire)
    }

    /// The accept loop. Never returns under normal operation; `stop` ends it
    /// (used by tests and orderly shutdown).
    ///
    /// Every iteration also reaps finished connection workers and applies
    /// the background-task policy.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if accepting breaks down entirely.
    pub fn listen(self: Arc<Self>, stop: &StopSignal) -> Result<()> {
        // the data socket is paired up on its own thread
        let listener = Arc::clone(&self);
        let data_stop = stop.clone();
        let data_thread = std::thread::spawn(move || listener.accept_data(&data_stop));

        while !stop.is_stopped() {
            match self.control.accept() {
                Ok((stream, peer)) => {
                    log::debug!("control connection from {peer}");
                    Self::handle_control(&self, stream);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(ACCEPT_POLL);
                }
                Err(e) => {
                    log::warn!("control accept failed: {e}");
                    std::thread::sleep(ACCEPT_POLL);
                }
            }

            self.reap_finished();
            self.background_policy();
        }

        let _ = data_thread.join();

        Ok(())
    }

    fn handle_control(this: &Arc<Self>, stream: TcpStream) {
        // a fresh search displaces the idle background pass
        if this.config.idle_background {
            this.stop_background();
        }
        this.state.bg_ran.store(false, Ordering::Release);

        let session = this.next_session.fetch_add(1, Ordering::AcqRel);
        let conn = Arc::new(ConnState::new(session));

        let handler = match this.factory.new_conn(&conn, session) {
            Ok(handler) => handler,
            Err(e) => {
                log::warn!("refusing connection: {e}");
                return;
            }
        };

        if let Ok(sessions) = this.sessions.lock().as_mut() {
            sessions.insert(session, Arc::clone(&conn));
        }

        this.state.active_searches.fetch_add(1, Ordering::AcqRel);

        let auth_token = this.config.auth_token.clone();

        if this.config.fork_conns {
            let listener = Arc::clone(this);

            let worker = std::thread::spawn(move || {
                serve_conn(stream, handler, &conn, auth_token);
                listener.remove_session(session);
            });

            if let Ok(conns) = this.conns.lock().as_mut() {
                conns.push(worker);
            }
        } else {
            serve_conn(stream, handler, &conn, auth_token);
            this.remove_session(session);
            this.state.active_searches.fetch_sub(1, Ordering::AcqRel);
        }
    }

    fn remove_session(&self, session: SessionId) {
        if let Ok(sessions) = self.sessions.lock().as_mut() {
            sessions.remove(&session);
        }

        self.factory.close_conn(session);
    }

    fn accept_data(&self, stop: &StopSignal) {
        if self.data.set_nonblocking(true).is_err() {
            return;
        }

        while !stop.is_stopped() {
            match self.data.accept() {
                Ok((stream, peer)) => {
                    log::debug!("data connection from {peer}");
                    self.handle_data(stream);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(ACCEPT_POLL);
                }
                Err(e) => {
                    log::warn!("data accept failed: {e}");
                    std::thread::sleep(ACCEPT_POLL);
                }
            }
        }
    }

    /// Pairs a data socket with its session and starts the tx loop.
    fn handle_data(&self, stream: TcpStream) {
        // a silent peer must not wedge the acceptor
        let _ = stream.set_read_timeout(Some(Duration::from_secs(5)));

        let mut reader = BufReader::new(match stream.try_clone() {
            Ok(clone) => clone,
            Err(e) => {
                log::warn!("data socket clone failed: {e}");
                return;
            }
        });

        let session = match proto::get_int(&mut reader) {
            Ok(session) if session >= 0 => session as SessionId,
            _ => {
                log::warn!("data connection without a session id, dropping");
                return;
            }
        };

        let conn = if let Ok(sessions) = self.sessions.lock() {
            sessions.get(&session).cloned()
        } else {
            None
        };

        let Some(conn) = conn else {
            log::warn!("data connection for unknown session {session}, dropping");
            return;
        };

        conn.set_flags(conn::CSTATE_TX_ATTACHED);

        let worker = std::thread::spawn(move || {
            let counters = conn.tx_counters();
            conn::run_tx(&conn, BufWriter::new(stream), &*counters);
        });

        if let Ok(tx_workers) = self.tx_workers.lock().as_mut() {
            tx_workers.push(worker);
        }
    }

    /// Joins finished connection workers; the `waitpid(WNOHANG)` of the
    /// threaded redesign.
    fn reap_finished(&self) {
        if let Ok(mut conns) = self.conns.lock() {
            let mut still_running = vec![];

            for worker in conns.drain(..) {
                if worker.is_finished() {
                    let _ = worker.join();
                    self.state.active_searches.fetch_sub(1, Ordering::AcqRel);
                } else {
                    still_running.push(worker);
                }
            }

            *conns = still_running;
        }

        if let Ok(mut tx_workers) = self.tx_workers.lock() {
            tx_workers.retain(|worker| !worker.is_finished());
        }
    }

    /// Starts, keeps or stops the background pre-warm pass according to
    /// configuration and idleness.
    fn background_policy(&self) {
        if !self.config.background {
            return;
        }

        let idle = self.active_searches() == 0;
        let may_run = !self.config.idle_background || idle;

        let Ok(mut slot) = self.state.background.lock() else {
            return;
        };

        // collect a finished pass
        if slot.as_ref().is_some_and(|(handle, _)| handle.is_finished()) {
            if let Some((handle, _)) = slot.take() {
                let _ = handle.join();
                self.state.bg_ran.store(true, Ordering::Release);
            }
        }

        if !may_run {
            if let Some((_, stop)) = slot.as_ref() {
                stop.stop();
            }
            return;
        }

        if slot.is_some() || self.state.bg_ran.load(Ordering::Acquire) {
            return;
        }

        let scan = BackgroundScan::new(&self.config.obj_dir, Arc::clone(&self.cache));
        let stop = scan.stop_signal();

        let handle = std::thread::spawn(move || {
            if let Err(e) = scan.run() {
                log::warn!("background scan failed: {e}");
            }
        });

        *slot = Some((handle, stop));
    }

    fn stop_background(&self) {
        if let Ok(slot) = self.state.background.lock() {
            if let Some((_, stop)) = slot.as_ref() {
                stop.stop();
            }
        }
    }
}

/// Services one control connection: optional auth, then the dispatch loop.
fn serve_conn(
    stream: TcpStream,
    mut handler: Box<dyn ConnHandler>,
    conn: &Arc<ConnState>,
    auth_token: Option<String>,
) {
    let session = conn.session();

    let reader = match stream.try_clone() {
        Ok(clone) => clone,
        Err(e) => {
            log::warn!("session {session}: socket clone failed: {e}");
            return;
        }
    };

    let mut reader = BufReader::new(reader);
    let mut writer = BufWriter::new(stream);

    // the client learns its session id first
    if proto::send_int(&mut writer, session as i64).is_err() || writer.flush().is_err() {
        return;
    }

    if let Some(token) = auth_token {
        match (proto::get_string(&mut reader), proto::get_string(&mut reader)) {
            (Ok(cmd), Ok(presented)) if cmd == "auth" && presented == token => {
                conn.set_flags(CSTATE_AUTHED);
            }
            _ => {
                log::warn!("session {session}: authentication failed, dropping");
                return;
            }
        }
    }

    loop {
        let command = match proto::get_string(&mut reader) {
            Ok(command) => command,
            Err(Error::TransportClosed) => {
                log::debug!("session {session}: peer disconnected");
                let _ = handler.disconnect();
                break;
            }
            Err(e) => {
                log::warn!("session {session}: control stream broke: {e}");
                let _ = handler.disconnect();
                break;
            }
        };

        match dispatch(&command, &mut reader, &mut writer, handler.as_mut()) {
            Ok(true) => {
                if writer.flush().is_err() {
                    let _ = handler.disconnect();
                    break;
                }
            }
            Ok(false) => {
                let _ = writer.flush();
                break;
            }
            Err(e) => {
                log::warn!("session {session}: dispatch failed: {e}");
                let _ = handler.disconnect();
                break;
            }
        }
    }

    conn.set_flags(CSTATE_CLOSING);
}

fn reply_ok<W: Write>(writer: &mut W) -> Result<()> {
    proto::send_int(writer, 0)
}

fn reply_status<W: Write>(writer: &mut W, result: Result<()>) -> Result<()> {
    match result {
        Ok(()) => reply_ok(writer),
        Err(e) => proto::send_int(writer, status_code(&e)),
    }
}

/// Decodes one command's arguments, invokes the handler and writes the
/// reply. Returns `Ok(false)` when the connection should close.
#[allow(clippy::too_many_lines)]
fn dispatch<R: std::io::BufRead, W: Write>(
    command: &str,
    reader: &mut R,
    writer: &mut W,
    handler: &mut dyn ConnHandler,
) -> Result<bool> {
    match command {
        "start" => reply_status(writer, handler.start())?,

        "stop" => {
            let host = HostStats {
                objs_received: proto::get_int(reader)?.max(0) as u64,
                objs_queued: proto::get_int(reader)?.max(0) as u64,
            };
            reply_status(writer, handler.stop(&host))?;
        }

        "set_spec" => {
            let specs = read_spec(reader)?;
            reply_status(writer, handler.set_spec(specs))?;
        }

        "set_obj" => {
            let sig = proto::get_blob(reader)?;
            reply_status(writer, handler.set_obj(&sig))?;
        }

        "set_list" => reply_status(writer, handler.set_list())?,

        "terminate" => {
            reply_status(writer, handler.terminate())?;
            return Ok(false);
        }

        "get_stats" => match handler.get_stats() {
            Ok(stats) => {
                reply_ok(writer)?;
                write_stats(writer, &stats)?;
            }
            Err(e) => proto::send_int(writer, status_code(&e))?,
        },

        "release_obj" => reply_status(writer, Ok(()))?,

        "get_char" => match handler.get_char() {
            Ok(ch) => {
                reply_ok(writer)?;
                proto::send_string(writer, &ch.isa)?;
                proto::send_int(writer, ch.cpu_khz as i64)?;
                proto::send_int(writer, ch.free_mem_kb as i64)?;
            }
            Err(e) => proto::send_int(writer, status_code(&e))?,
        },

        "log_done" => reply_status(writer, handler.log_done())?,

        "setlog" => {
            let level = proto::get_int(reader)?.max(0) as u32;
            let src = proto::get_int(reader)?.max(0) as u32;
            reply_status(writer, handler.set_log(level, src))?;
        }

        "rleaf" => {
            let path = proto::get_string(reader)?;
            match handler.read_leaf(&path) {
                Ok(value) => {
                    reply_ok(writer)?;
                    proto::send_blob(writer, &value)?;
                }
                Err(e) => proto::send_int(writer, status_code(&e))?,
            }
        }

        "wleaf" => {
            let path = proto::get_string(reader)?;
            let data = proto::get_blob(reader)?;
            reply_status(writer, handler.write_leaf(&path, &data))?;
        }

        "lnode" => {
            let path = proto::get_string(reader)?;
            match handler.list_nodes(&path) {
                Ok(names) => {
                    reply_ok(writer)?;
                    proto::send_string_array(writer, &names)?;
                }
                Err(e) => proto::send_int(writer, status_code(&e))?,
            }
        }

        "lleaf" => {
            let path = proto::get_string(reader)?;
            match handler.list_leafs(&path) {
                Ok(names) => {
                    reply_ok(writer)?;
                    proto::send_string_array(writer, &names)?;
                }
                Err(e) => proto::send_int(writer, status_code(&e))?,
            }
        }

        "sgid" => {
            let gid = proto::get_string(reader)?;
            let result = gid
                .parse()
                .and_then(|gid| handler.set_gid(gid));
            reply_status(writer, result)?;
        }

        "clear_gids" => reply_status(writer, handler.clear_gids())?,

        "set_blob" => {
            let filter = proto::get_string(reader)?;
            let blob = proto::get_blob(reader)?;
            reply_status(writer, handler.set_blob(&filter, blob))?;
        }

        "set_offload" => {
            let ratio = proto::get_int(reader)?.clamp(0, 100) as u32;
            reply_status(writer, handler.set_offload(ratio))?;
        }

        "disconnect" => {
            reply_status(writer, handler.disconnect())?;
            return Ok(false);
        }

        _ => {
            // arguments of an unknown command cannot be skipped safely,
            // so the connection closes rather than desync
            log::warn!("unknown control command {command:?}, closing");
            proto::send_int(writer, -1)?;
            return Ok(false);
        }
    }

    Ok(true)
}

/// Reads a filter list: an `int` count, then name, program, args, reads and
/// threshold per filter.
fn read_spec<R: std::io::BufRead>(reader: &mut R) -> Result<Vec<FilterSpec>> {
    let count = proto::get_int(reader)?;

    if !(0..=512).contains(&count) {
        return Err(Error::InvalidArgument("unreasonable filter count"));
    }

    let mut specs = Vec::with_capacity(count as usize);

    for _ in 0..count {
        let name = proto::get_string(reader)?;
        let program = proto::get_string(reader)?;
        let args = proto::get_strings(reader)?;
        let reads = proto::get_strings(reader)?;
        let threshold = proto::get_int(reader)?;

        specs.push(
            FilterSpec::new(name, program)?
                .with_args(args)
                .with_reads(reads)
                .with_threshold(threshold),
        );
    }

    Ok(specs)
}

/// Writes the statistics reply: the counter block, then one row per filter.
fn write_stats<W: Write>(writer: &mut W, stats: &crate::search::DevStats) -> Result<()> {
    for value in [
        stats.obj_total,
        stats.obj_processed,
        stats.obj_dropped,
        stats.obj_passed,
        stats.obj_skipped,
        stats.obj_bg_processed,
        stats.obj_bg_dropped,
        stats.obj_bg_passed,
        stats.network_stalls,
        stats.tx_full_stalls,
        stats.tx_idles,
        stats.pend_objs,
    ] {
        proto::send_int(writer, value as i64)?;
    }

    proto::send_int(writer, i64::from(stats.flags))?;
    proto::send_int(writer, i64::from(stats.avg_int_ratio))?;
    proto::send_int(writer, i64::from(stats.smoothed_int_ratio))?;

    proto::send_int(writer, stats.filters.len() as i64)?;

    for row in &stats.filters {
        proto::send_string(writer, &row.name)?;
        proto::send_int(writer, row.objs_processed as i64)?;
        proto::send_int(writer, row.objs_dropped as i64)?;
        proto::send_int(writer, row.avg_exec_time_ns as i64)?;
    }

    Ok(())
}
