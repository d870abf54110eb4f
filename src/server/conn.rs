// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Per-connection transport state and the transmit loop.

use crate::search::SessionId;
use crate::{Object, Ring};
use byteorder::{LittleEndian, WriteBytesExt};
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Control connection authenticated.
pub const CSTATE_AUTHED: u32 = 0x01;

/// Object data is associated with this connection.
pub const CSTATE_OBJ_DATA: u32 = 0x02;

/// The owning search is draining; no new objects will be queued.
pub const CSTATE_DRAINING: u32 = 0x04;

/// The connection is going away.
pub const CSTATE_CLOSING: u32 = 0x08;

/// A data socket (tx consumer) is attached to this connection.
pub const CSTATE_TX_ATTACHED: u32 = 0x10;

/// Draining finished and the rings were flushed; the tx loop may exit.
pub const CSTATE_DRAINED: u32 = 0x20;

/// Slot count of the three per-connection object rings.
pub const OBJ_RING_SIZE: usize = 512;

/// A data-socket write slower than this counts as a network stall.
const NETWORK_STALL_THRESH: Duration = Duration::from_millis(10);

/// Per-connection transport state: the flags bitset and the three object
/// rings coupling the search pipeline to the client.
///
/// - `obj_ring`: objects read off disk, awaiting the filter worker
/// - `partial_ring`: objects shipped with filter-produced attributes but not
///   fully evaluated
/// - `complete_ring`: objects that passed the whole chain
///
/// The flags are guarded by their own mutex; each ring carries its own.
pub struct ConnState {
    session: SessionId,
    flags: Mutex<u32>,
    obj_ring: Ring<Object>,
    partial_ring: Ring<Object>,
    complete_ring: Ring<Object>,
    tx_counters: Mutex<Arc<dyn TxCounters>>,
}

impl ConnState {
    /// Creates the per-connection state with empty rings.
    #[must_use]
    pub fn new(session: SessionId) -> Self {
        Self {
            session,
            flags: Mutex::new(0),
            obj_ring: Ring::new(OBJ_RING_SIZE),
            partial_ring: Ring::new(OBJ_RING_SIZE),
            complete_ring: Ring::new(OBJ_RING_SIZE),
            tx_counters: Mutex::new(Arc::new(NullTxCounters)),
        }
    }

    /// Installs the stall/idle counter sink of the owning search.
    #[allow(clippy::expect_used)]
    pub fn set_tx_counters(&self, counters: Arc<dyn TxCounters>) {
        *self.tx_counters.lock().expect("lock is poisoned") = counters;
    }

    /// The stall/idle counter sink fed by the tx loop.
    #[allow(clippy::expect_used)]
    #[must_use]
    pub fn tx_counters(&self) -> Arc<dyn TxCounters> {
        Arc::clone(&self.tx_counters.lock().expect("lock is poisoned"))
    }

    /// The session id of this connection.
    #[must_use]
    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Sets flag bits.
    #[allow(clippy::expect_used)]
    pub fn set_flags(&self, bits: u32) {
        *self.flags.lock().expect("lock is poisoned") |= bits;
    }

    /// Clears flag bits.
    #[allow(clippy::expect_used)]
    pub fn clear_flags(&self, bits: u32) {
        *self.flags.lock().expect("lock is poisoned") &= !bits;
    }

    /// Whether all given flag bits are set.
    #[allow(clippy::expect_used)]
    #[must_use]
    pub fn has_flags(&self, bits: u32) -> bool {
        (*self.flags.lock().expect("lock is poisoned") & bits) == bits
    }

    /// Whether the connection is on its way out.
    #[must_use]
    pub fn is_closing(&self) -> bool {
        self.has_flags(CSTATE_CLOSING)
    }

    /// The inbound object ring (disk to filter worker).
    #[must_use]
    pub fn obj_ring(&self) -> &Ring<Object> {
        &self.obj_ring
    }

    /// The partial-result ring.
    #[must_use]
    pub fn partial_ring(&self) -> &Ring<Object> {
        &self.partial_ring
    }

    /// The complete-result ring.
    #[must_use]
    pub fn complete_ring(&self) -> &Ring<Object> {
        &self.complete_ring
    }

    /// Queues an object for transmission, complete or partial.
    ///
    /// # Errors
    ///
    /// Hands the object back if the target ring is full; the caller retries
    /// and counts the stall.
    pub fn send_obj(&self, obj: Object, complete: bool) -> std::result::Result<(), Object> {
        self.set_flags(CSTATE_OBJ_DATA);

        if complete {
            self.complete_ring.enq(obj)
        } else {
            self.partial_ring.enq(obj)
        }
    }

    /// Takes the next partial result, if any.
    #[must_use]
    pub fn get_partial(&self) -> Option<Object> {
        self.partial_ring.deq()
    }

    /// Dequeue rate of the partial ring (the client's consumption rate).
    #[must_use]
    pub fn drate(&self) -> f64 {
        self.partial_ring.deq_rate()
    }

    /// Drains every queued object from the complete and partial rings,
    /// handing each back to the release callback. Called on search
    /// termination.
    pub fn flush_objs(&self, mut release: impl FnMut(Object)) {
        while let Some(obj) = self.complete_ring.deq() {
            release(obj);
        }
        while let Some(obj) = self.partial_ring.deq() {
            release(obj);
        }
    }

    /// Total objects queued towards the client.
    #[must_use]
    pub fn tx_backlog(&self) -> usize {
        self.complete_ring.count() + self.partial_ring.count()
    }
}

/// Counters fed by the tx loop.
pub trait TxCounters: Send + Sync {
    /// The tx thread found both output rings empty.
    fn count_tx_idle(&self);

    /// A data-socket write stalled on back-pressure.
    fn count_network_stall(&self);
}

/// Sink used before a search installs its counters.
struct NullTxCounters;

impl TxCounters for NullTxCounters {
    fn count_tx_idle(&self) {}

    fn count_network_stall(&self) {}
}

/// Frames one object onto the data socket.
///
/// Wire form: `u8` complete flag, `u32` payload length, payload, `u32`
/// attribute-table length, attribute table (omitted entries elided).
///
/// # Errors
///
/// Returns an I/O error if the socket write fails.
pub fn write_obj_frame<W: Write>(writer: &mut W, obj: &Object, complete: bool) -> crate::Result<()> {
    let attrs = obj.attrs().encode_to_vec(true);

    writer.write_u8(u8::from(complete))?;
    writer.write_u32::<LittleEndian>(obj.data().len() as u32)?;
    writer.write_all(obj.data())?;
    writer.write_u32::<LittleEndian>(attrs.len() as u32)?;
    writer.write_all(&attrs)?;

    Ok(())
}

/// The transmit loop: drains the output rings (complete before partial) onto
/// the data socket until the connection drains out or the peer goes away.
///
/// Objects are released (dropped) once shipped.
pub fn run_tx<W: Write>(conn: &ConnState, mut writer: W, counters: &dyn TxCounters) {
    loop {
        if conn.is_closing() {
            log::debug!("session {}: tx loop closing", conn.session());
            return;
        }

        let (obj, complete) = if let Some(obj) = conn.complete_ring.deq() {
            (obj, true)
        } else if let Some(obj) = conn.partial_ring.deq() {
            (obj, false)
        } else {
            counters.count_tx_idle();

            // everything shipped and the search is over
            if conn.has_flags(CSTATE_DRAINED) {
                let _ = writer.flush();
                return;
            }

            std::thread::sleep(Duration::from_millis(1));
            continue;
        };

        let start = Instant::now();

        if let Err(e) = write_obj_frame(&mut writer, &obj, complete) {
            log::warn!("session {}: tx failed: {e}", conn.session());
            conn.set_flags(CSTATE_CLOSING);
            return;
        }

        if start.elapsed() >= NETWORK_STALL_THRESH {
            counters.count_network_stall();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ConnState, CSTATE_DRAINING, CSTATE_OBJ_DATA};
    use crate::Object;
    use test_log::test;

    #[test]
    fn conn_send_obj_routes_by_completeness() {
        let conn = ConnState::new(7);

        conn.send_obj(Object::from_bytes(b"done".to_vec()), true)
            .expect("should queue");
        conn.send_obj(Object::from_bytes(b"half".to_vec()), false)
            .expect("should queue");

        assert!(conn.has_flags(CSTATE_OBJ_DATA));
        assert_eq!(1, conn.complete_ring().count());

        let partial = conn.get_partial().expect("should dequeue");
        assert_eq!(b"half", partial.data());
    }

    #[test]
    fn conn_flush_hands_everything_back() {
        let conn = ConnState::new(7);

        for i in 0..4u8 {
            conn.send_obj(Object::from_bytes(vec![i]), i % 2 == 0)
                .expect("should queue");
        }

        let mut released = vec![];
        conn.flush_objs(|obj| released.push(obj));

        assert_eq!(4, released.len());
        assert_eq!(0, conn.tx_backlog());
    }

    #[test]
    fn conn_flag_bits() {
        let conn = ConnState::new(1);

        assert!(!conn.has_flags(CSTATE_DRAINING));
        conn.set_flags(CSTATE_DRAINING);
        assert!(conn.has_flags(CSTATE_DRAINING));
        conn.clear_flags(CSTATE_DRAINING);
        assert!(!conn.has_flags(CSTATE_DRAINING));
    }

    #[test]
    fn obj_frame_layout() {
        let mut obj = Object::from_bytes(b"pp".to_vec());
        obj.attrs_mut()
            .set("k", *b"v", crate::AttrOrigin::FilterProduced)
            .expect("should set");

        let mut frame = vec![];
        super::write_obj_frame(&mut frame, &obj, true).expect("should frame");

        // complete flag + payload length
        assert_eq!(Some(&1u8), frame.first());
        assert_eq!(
            Some(b"pp".as_slice()),
            frame.get(5..7),
        );
    }
}
