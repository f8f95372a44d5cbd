// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! DSM Engine Context
//!
//! One `Dsm` per participating instance: node identity, the memslot
//! registry, the connection table, and the shared resources used by the
//! fault resolver and the request server.
//!
//! # Usage
//!
//! ```ignore
//! let dsm = Dsm::new(DsmConfig::new(node_id, nr_nodes), transport, memory, platform);
//! dsm.register_memslot(0x0, 512, false, SlotFlags::empty());
//!
//! // vCPU fault path:
//! let access = dsm.page_fault(gfn, false, write)?;
//! // ... hypervisor installs access.mask() ...
//! drop(access);
//! ```

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use alloc::sync::Arc;

use crate::hypervisor::{GuestMemory, Platform};
use crate::log_info;
use crate::pool::{RespPool, DEFAULT_POOL_SIZE};
use crate::slots::{DsmMemslot, SlotFlags, SlotSet};
use crate::stats::DsmStats;
use crate::transport::{ConnTable, Transport};
use crate::types::status::ERR_NOT_FOUND;
use crate::types::{Gfn, NodeId, Result, TxId, Vfn, DSM_MAX_INSTANCES};
use crate::watchdog::{Watchdog, DEFAULT_TIMEOUT_MS};

/// ============================================================================
/// Jitter Knob
/// ============================================================================

/// Module-wide jitter toggle, runtime-mutable
///
/// Injecting up to ~10 µs before server handlers desynchronizes request
/// storms from many simultaneous requesters.
static ENABLE_JITTER: AtomicBool = AtomicBool::new(true);

/// Enable or disable micro-jitter injection
pub fn set_jitter_enabled(enabled: bool) {
    ENABLE_JITTER.store(enabled, Ordering::Relaxed);
}

/// Whether micro-jitter injection is enabled
pub fn jitter_enabled() -> bool {
    ENABLE_JITTER.load(Ordering::Relaxed)
}

/// Xorshift PRNG for jitter delays
fn prandom_u32() -> u32 {
    static SEED: AtomicU32 = AtomicU32::new(0x9E37_79B9);
    let mut x = SEED.load(Ordering::Relaxed);
    x ^= x << 13;
    x ^= x >> 17;
    x ^= x << 5;
    SEED.store(x, Ordering::Relaxed);
    x
}

/// ============================================================================
/// Configuration
/// ============================================================================

/// Engine configuration
#[derive(Debug, Clone, Copy)]
pub struct DsmConfig {
    /// This instance's node ID
    pub node_id: NodeId,

    /// Number of instances in the cluster
    pub nr_nodes: usize,

    /// Response pool capacity
    pub resp_pool_size: usize,
}

impl DsmConfig {
    /// Configuration with default resource sizing
    pub fn new(node_id: NodeId, nr_nodes: usize) -> Self {
        Self {
            node_id,
            nr_nodes,
            resp_pool_size: DEFAULT_POOL_SIZE,
        }
    }
}

/// ============================================================================
/// Engine
/// ============================================================================

/// Per-instance DSM coherence engine
pub struct Dsm {
    id: NodeId,
    nr_nodes: usize,
    stopped: AtomicBool,
    next_txid: AtomicU32,
    next_vfn: AtomicU64,

    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) memory: Arc<dyn GuestMemory>,
    pub(crate) platform: Arc<dyn Platform>,

    pub(crate) slots: SlotSet,
    pub(crate) conns: ConnTable,
    pub(crate) resp_pool: RespPool,
    pub(crate) stats: DsmStats,
    pub(crate) watchdog: Watchdog,
}

impl Dsm {
    /// Create an engine instance
    pub fn new(
        config: DsmConfig,
        transport: Arc<dyn Transport>,
        memory: Arc<dyn GuestMemory>,
        platform: Arc<dyn Platform>,
    ) -> Self {
        assert!(config.nr_nodes <= DSM_MAX_INSTANCES);
        assert!((config.node_id as usize) < config.nr_nodes);

        let watchdog = Watchdog::new(DEFAULT_TIMEOUT_MS, "dsm-fetch");
        watchdog.set_enabled(true);

        Self {
            id: config.node_id,
            nr_nodes: config.nr_nodes,
            stopped: AtomicBool::new(false),
            next_txid: AtomicU32::new(1),
            next_vfn: AtomicU64::new(0),
            transport,
            memory,
            platform,
            slots: SlotSet::new(),
            conns: ConnTable::new(),
            resp_pool: RespPool::new(config.resp_pool_size),
            stats: DsmStats::new(),
            watchdog,
        }
    }

    /// This instance's node ID
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Number of instances in the cluster
    pub fn nr_nodes(&self) -> usize {
        self.nr_nodes
    }

    /// Begin shutdown: faults and server workers bail out at the next
    /// request boundary
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    /// Whether shutdown has begun
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Counter snapshot
    pub fn stats(&self) -> crate::stats::StatsSnapshot {
        self.stats.snapshot()
    }

    // ------------------------------------------------------------------
    // Memslot lifecycle
    // ------------------------------------------------------------------

    /// Register a memslot and create its page records
    pub fn register_memslot(
        &self,
        base_gfn: Gfn,
        npages: u64,
        is_smm: bool,
        flags: SlotFlags,
    ) -> Arc<DsmMemslot> {
        let base_vfn = self.next_vfn.fetch_add(npages, Ordering::Relaxed) as Vfn;

        let slot = Arc::new(DsmMemslot::new(base_gfn, base_vfn, npages, is_smm, flags));
        self.slots.insert(Arc::clone(&slot));
        log_info!(
            "node[{}] registered memslot gfn[{}..{}] smm[{}]",
            self.id,
            base_gfn,
            base_gfn + npages,
            is_smm
        );
        slot
    }

    /// Remove a memslot; records die with the last in-flight reference
    pub fn unregister_memslot(&self, base_gfn: Gfn, is_smm: bool) -> Option<Arc<DsmMemslot>> {
        self.slots.remove(base_gfn, is_smm)
    }

    /// Find the memslot and per-page key for a frame
    pub(crate) fn slot_and_vfn(&self, gfn: Gfn, is_smm: bool) -> Result<(Arc<DsmMemslot>, Vfn)> {
        let slot = self.slots.lookup(gfn, is_smm).ok_or(ERR_NOT_FOUND)?;
        let vfn = slot.gfn_to_vfn(gfn);
        Ok((slot, vfn))
    }

    // ------------------------------------------------------------------
    // Pinning
    // ------------------------------------------------------------------

    /// Block remote INV/WRITE handling for a page
    pub fn pin_page(&self, gfn: Gfn, is_smm: bool) -> Result {
        let (slot, vfn) = self.slot_and_vfn(gfn, is_smm)?;
        slot.record(vfn).set_pinned(true);
        Ok(())
    }

    /// Re-allow remote INV/WRITE handling for a page
    pub fn unpin_page(&self, gfn: Gfn, is_smm: bool) -> Result {
        let (slot, vfn) = self.slot_and_vfn(gfn, is_smm)?;
        slot.record(vfn).set_pinned(false);
        Ok(())
    }

    /// Block remote READ handling for a page
    pub fn pin_page_read(&self, gfn: Gfn, is_smm: bool) -> Result {
        let (slot, vfn) = self.slot_and_vfn(gfn, is_smm)?;
        slot.record(vfn).set_pinned_read(true);
        Ok(())
    }

    /// Re-allow remote READ handling for a page
    pub fn unpin_page_read(&self, gfn: Gfn, is_smm: bool) -> Result {
        let (slot, vfn) = self.slot_and_vfn(gfn, is_smm)?;
        slot.record(vfn).set_pinned_read(false);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Shared helpers
    // ------------------------------------------------------------------

    /// Generate a transaction ID for a request to `dest`
    pub(crate) fn generate_txid(&self, _dest: NodeId) -> TxId {
        let ctr = self.next_txid.fetch_add(1, Ordering::Relaxed);
        ((self.id as u32) << 24) | (ctr & 0x00FF_FFFF)
    }

    /// Busy-delay up to ~10 µs to break up request storms
    pub(crate) fn inject_jitter(&self) {
        if !jitter_enabled() {
            return;
        }
        let delay = prandom_u32() % 10_000;
        self.platform.delay_ns(delay as u64);
    }
}

// ============================================================================
// Tests
// ============================================================================
