// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! DSM Transport Adapter
//!
//! The engine consumes a reliable, ordered, framed byte transport through
//! the `Transport` trait. Frames carry a `TxAdd` envelope (transaction id
//! plus response side-band) and an opaque payload; replies are matched to
//! requests by transaction id.
//!
//! # Design
//!
//! - **Two connection planes**: requests issued by fault handlers use the
//!   client-plane connection to a peer; requests forwarded by a server
//!   worker use a separate server-plane connection, so a forwarded
//!   transaction can never interleave with the worker's own client traffic
//! - **Lazy connect**: per-peer connections are created on first use,
//!   double-checked under a single `conn_init_lock`; connection setup may
//!   sleep and is therefore refused in restricted contexts

use core::sync::atomic::{AtomicU64, Ordering};

use alloc::vec::Vec;

use bitflags::bitflags;

use crate::protocol::TxAdd;
use crate::types::status::ERR_NOT_CONNECTED;
use crate::types::{NodeId, Result, DSM_MAX_INSTANCES};

/// Opaque connection handle issued by the transport; never zero
pub type ConnId = u64;

bitflags! {
    /// Flags for `Transport::send` / `Transport::receive`
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MsgFlags: u32 {
        /// Fail with a should-wait status instead of sleeping
        const DONTWAIT = 1 << 0;

        /// Poll without blocking; should-wait when nothing is queued
        const NONBLOCK = 1 << 1;
    }
}

/// Reliable framed transport between DSM instances
///
/// `receive` with a concrete `tx.txid` only completes with the matching
/// reply frame and fills the envelope side-band; with `TXID_ANY` it accepts
/// any incoming request frame.
pub trait Transport: Send + Sync {
    /// Open a connection to a peer; may sleep
    fn connect(&self, peer: NodeId) -> Result<ConnId>;

    /// Send one frame
    fn send(&self, conn: ConnId, buf: &[u8], flags: MsgFlags, tx: &TxAdd) -> Result<usize>;

    /// Receive one frame into `buf`, returning the payload length
    fn receive(&self, conn: ConnId, buf: &mut [u8], flags: MsgFlags, tx: &mut TxAdd)
        -> Result<usize>;
}

/// ============================================================================
/// Connection Table
/// ============================================================================

/// Lazily-populated per-peer connection handles, both planes
pub struct ConnTable {
    // Client plane occupies [0, DSM_MAX_INSTANCES), server (forwarding)
    // plane the upper half. 0 = not connected.
    socks: Vec<AtomicU64>,
    init_lock: spin::Mutex<()>,
}

impl ConnTable {
    /// Create an empty table
    pub fn new() -> Self {
        let mut socks = Vec::with_capacity(2 * DSM_MAX_INSTANCES);
        socks.resize_with(2 * DSM_MAX_INSTANCES, || AtomicU64::new(0));
        Self {
            socks,
            init_lock: spin::Mutex::new(()),
        }
    }

    fn index(dest: NodeId, from_server: bool) -> usize {
        dest as usize + if from_server { DSM_MAX_INSTANCES } else { 0 }
    }

    /// Look up an existing connection
    pub fn get(&self, dest: NodeId, from_server: bool) -> Option<ConnId> {
        match self.socks[Self::index(dest, from_server)].load(Ordering::Acquire) {
            0 => None,
            conn => Some(conn),
        }
    }

    /// Look up a connection, creating it on first use
    ///
    /// Creation sleeps in the transport, so a restricted-context caller with
    /// no preopened connection gets `ERR_NOT_CONNECTED` and must retry from
    /// a permissive context.
    pub fn get_or_connect(
        &self,
        transport: &dyn Transport,
        dest: NodeId,
        from_server: bool,
        restricted: bool,
    ) -> Result<ConnId> {
        if let Some(conn) = self.get(dest, from_server) {
            return Ok(conn);
        }
        if restricted {
            return Err(ERR_NOT_CONNECTED);
        }

        let _guard = self.init_lock.lock();
        if let Some(conn) = self.get(dest, from_server) {
            return Ok(conn);
        }
        let conn = transport.connect(dest)?;
        debug_assert_ne!(conn, 0);
        self.socks[Self::index(dest, from_server)].store(conn, Ordering::Release);
        Ok(conn)
    }

    /// Drop every cached handle (teardown)
    pub fn clear(&self) {
        for sock in &self.socks {
            sock.store(0, Ordering::Release);
        }
    }
}

impl Default for ConnTable {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicU64 as Counter;

    struct CountingTransport {
        next: Counter,
    }

    impl Transport for CountingTransport {
        fn connect(&self, _peer: NodeId) -> Result<ConnId> {
            Ok(self.next.fetch_add(1, Ordering::SeqCst))
        }

        fn send(&self, _c: ConnId, _b: &[u8], _f: MsgFlags, _t: &TxAdd) -> Result<usize> {
            Ok(0)
        }

        fn receive(
            &self,
            _c: ConnId,
            _b: &mut [u8],
            _f: MsgFlags,
            _t: &mut TxAdd,
        ) -> Result<usize> {
            Ok(0)
        }
    }

    #[test]
    fn test_lazy_connect_is_cached() {
        let table = ConnTable::new();
        let transport = CountingTransport {
            next: Counter::new(1),
        };

        let a = table.get_or_connect(&transport, 5, false, false).unwrap();
        let b = table.get_or_connect(&transport, 5, false, false).unwrap();
        assert_eq!(a, b);
        assert_eq!(table.get(5, false), Some(a));
    }

    #[test]
    fn test_planes_are_separate() {
        let table = ConnTable::new();
        let transport = CountingTransport {
            next: Counter::new(1),
        };

        let client = table.get_or_connect(&transport, 2, false, false).unwrap();
        let server = table.get_or_connect(&transport, 2, true, false).unwrap();
        assert_ne!(client, server);
    }

    #[test]
    fn test_restricted_context_refuses_connect() {
        let table = ConnTable::new();
        let transport = CountingTransport {
            next: Counter::new(1),
        };

        let err = table
            .get_or_connect(&transport, 9, false, true)
            .unwrap_err();
        assert_eq!(err, ERR_NOT_CONNECTED);

        // A preopened connection is usable even when restricted.
        let conn = table.get_or_connect(&transport, 9, false, false).unwrap();
        assert_eq!(
            table.get_or_connect(&transport, 9, false, true).unwrap(),
            conn
        );
    }
}
