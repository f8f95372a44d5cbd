// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! DSM Statistics
//!
//! Per-engine counters for fault and transaction activity. All operations
//! are atomic; a consistent-enough snapshot can be taken at any time.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::log_debug;
use crate::types::{Gfn, NodeId};

/// ============================================================================
/// Statistics
/// ============================================================================

/// Statistics snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Read faults resolved (slow path)
    pub read_faults: u64,

    /// Write faults resolved (slow path)
    pub write_faults: u64,

    /// Faults admitted by the fast path
    pub fast_path_hits: u64,

    /// Invalidations sent to copyset holders
    pub inv_sent: u64,

    /// Invalidation requests handled
    pub inv_handled: u64,

    /// Read requests served or forwarded
    pub read_served: u64,

    /// Write requests served or forwarded
    pub write_served: u64,

    /// Requests forwarded along the probable-owner chain
    pub forwards: u64,

    /// Faults that returned an error
    pub fault_errors: u64,
}

/// Per-engine counters
#[derive(Default)]
pub struct DsmStats {
    read_faults: AtomicU64,
    write_faults: AtomicU64,
    fast_path_hits: AtomicU64,
    inv_sent: AtomicU64,
    inv_handled: AtomicU64,
    read_served: AtomicU64,
    write_served: AtomicU64,
    forwards: AtomicU64,
    fault_errors: AtomicU64,
}

impl DsmStats {
    /// Create zeroed counters
    pub const fn new() -> Self {
        Self {
            read_faults: AtomicU64::new(0),
            write_faults: AtomicU64::new(0),
            fast_path_hits: AtomicU64::new(0),
            inv_sent: AtomicU64::new(0),
            inv_handled: AtomicU64::new(0),
            read_served: AtomicU64::new(0),
            write_served: AtomicU64::new(0),
            forwards: AtomicU64::new(0),
            fault_errors: AtomicU64::new(0),
        }
    }

    /// Record a resolved fault and emit the per-fault trace line
    pub fn pf_trace(&self, id: NodeId, gfn: Gfn, write: bool, fast: bool, resp_len: usize) {
        if fast {
            self.fast_path_hits.fetch_add(1, Ordering::Relaxed);
        } else if write {
            self.write_faults.fetch_add(1, Ordering::Relaxed);
        } else {
            self.read_faults.fetch_add(1, Ordering::Relaxed);
        }
        log_debug!(
            "node[{}] fault gfn[{}] write[{}] fast[{}] resp_len[{}]",
            id,
            gfn,
            write,
            fast,
            resp_len
        );
    }

    /// Record a failed fault
    pub fn fault_error(&self) {
        self.fault_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one invalidation sent
    pub fn inv_sent(&self) {
        self.inv_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an invalidation handled
    pub fn inv_handled(&self) {
        self.inv_handled.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a read request served
    pub fn read_served(&self) {
        self.read_served.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a write request served
    pub fn write_served(&self) {
        self.write_served.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a forwarded request
    pub fn forwarded(&self) {
        self.forwards.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a snapshot of all counters
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            read_faults: self.read_faults.load(Ordering::Relaxed),
            write_faults: self.write_faults.load(Ordering::Relaxed),
            fast_path_hits: self.fast_path_hits.load(Ordering::Relaxed),
            inv_sent: self.inv_sent.load(Ordering::Relaxed),
            inv_handled: self.inv_handled.load(Ordering::Relaxed),
            read_served: self.read_served.load(Ordering::Relaxed),
            write_served: self.write_served.load(Ordering::Relaxed),
            forwards: self.forwards.load(Ordering::Relaxed),
            fault_errors: self.fault_errors.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
