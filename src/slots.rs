// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! DSM Memslot Registry
//!
//! A memslot is a contiguous region of guest physical memory registered
//! with the hypervisor. The DSM engine keeps one `PageRecord` per frame of
//! every registered slot, keyed by `(gfn, is_smm)`: system-management mode
//! is a second, parallel guest address space.
//!
//! # Design
//!
//! - **Read-side guard**: lookups take the registry read lock and hand out
//!   `Arc` clones, so a slot stays alive for in-flight transactions after
//!   removal
//! - **vfn keys**: each slot is assigned a base vfn from a monotonically
//!   increasing allocator; `vfn = base_vfn + (gfn - base_gfn)` is the
//!   node-local per-page key

use alloc::sync::Arc;
use alloc::vec::Vec;

use bitflags::bitflags;
use spin::RwLock;

use crate::page::PageRecord;
use crate::types::{Gfn, Vfn};

bitflags! {
    /// Memslot flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SlotFlags: u32 {
        /// Slot is not part of distributed guest state
        const PRIVATE = 1 << 0;

        /// Slot is mid-reconfiguration; requests must retry
        const INVALID = 1 << 1;
    }
}

/// A registered region of guest physical memory with its page records
pub struct DsmMemslot {
    /// First guest frame covered by the slot
    pub base_gfn: Gfn,

    /// Node-local key of the first frame
    pub base_vfn: Vfn,

    /// Number of frames
    pub npages: u64,

    /// Whether the slot belongs to the SMM address space
    pub is_smm: bool,

    /// Slot flags
    flags: RwLock<SlotFlags>,

    records: Vec<PageRecord>,
}

impl DsmMemslot {
    /// Create a slot with fresh page records
    pub fn new(base_gfn: Gfn, base_vfn: Vfn, npages: u64, is_smm: bool, flags: SlotFlags) -> Self {
        let mut records = Vec::with_capacity(npages as usize);
        records.resize_with(npages as usize, PageRecord::new);
        Self {
            base_gfn,
            base_vfn,
            npages,
            is_smm,
            flags: RwLock::new(flags),
            records,
        }
    }

    /// Whether the slot covers `gfn`
    pub fn contains(&self, gfn: Gfn) -> bool {
        gfn >= self.base_gfn && gfn < self.base_gfn + self.npages
    }

    /// Node-local key for a covered frame
    pub fn gfn_to_vfn(&self, gfn: Gfn) -> Vfn {
        debug_assert!(self.contains(gfn));
        self.base_vfn + (gfn - self.base_gfn)
    }

    /// Guest frame for a node-local key
    pub fn vfn_to_gfn(&self, vfn: Vfn) -> Gfn {
        self.base_gfn + (vfn - self.base_vfn)
    }

    /// Page record for a covered frame
    pub fn record(&self, vfn: Vfn) -> &PageRecord {
        &self.records[(vfn - self.base_vfn) as usize]
    }

    /// Current slot flags
    pub fn flags(&self) -> SlotFlags {
        *self.flags.read()
    }

    /// Replace the slot flags
    pub fn set_flags(&self, flags: SlotFlags) {
        *self.flags.write() = flags;
    }

    /// Slot must not take part in DSM transactions right now
    pub fn unusable(&self) -> bool {
        self.flags()
            .intersects(SlotFlags::PRIVATE | SlotFlags::INVALID)
    }
}

/// ============================================================================
/// Slot Set
/// ============================================================================

/// Registry of memslots for both guest address spaces
pub struct SlotSet {
    // Index 0: normal address space, index 1: SMM
    spaces: [RwLock<Vec<Arc<DsmMemslot>>>; 2],
}

impl SlotSet {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            spaces: [RwLock::new(Vec::new()), RwLock::new(Vec::new())],
        }
    }

    fn space(&self, is_smm: bool) -> &RwLock<Vec<Arc<DsmMemslot>>> {
        &self.spaces[is_smm as usize]
    }

    /// Insert a slot
    pub fn insert(&self, slot: Arc<DsmMemslot>) {
        self.space(slot.is_smm).write().push(slot);
    }

    /// Remove the slot at `base_gfn`, returning it if present
    pub fn remove(&self, base_gfn: Gfn, is_smm: bool) -> Option<Arc<DsmMemslot>> {
        let mut slots = self.space(is_smm).write();
        let idx = slots.iter().position(|s| s.base_gfn == base_gfn)?;
        Some(slots.swap_remove(idx))
    }

    /// Find the slot covering `gfn`
    pub fn lookup(&self, gfn: Gfn, is_smm: bool) -> Option<Arc<DsmMemslot>> {
        self.space(is_smm)
            .read()
            .iter()
            .find(|s| s.contains(gfn))
            .cloned()
    }
}

impl Default for SlotSet {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================
