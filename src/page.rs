// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Per-Page DSM State Record
//!
//! One `PageRecord` exists per guest frame on every node. It carries the
//! coherence state machine inputs: the state flags, the page version, the
//! probable-owner hint, the copyset, and the two locks that order
//! transactions against the fast path.
//!
//! # Design
//!
//! - **Single-field mutators**: callers spell out every transition; there is
//!   no composite "transition" method
//! - **Atomic fields**: the invalidation handler mutates state without the
//!   transaction lock, so `state`/`version`/`prob_owner` are atomics
//! - **Lock discipline**: `lock` serializes non-INV transactions; `fast_path`
//!   serializes invalidation handling against lock-free fast-path faults

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use bitflags::bitflags;
use spin::MutexGuard;

use crate::copyset::Copyset;
use crate::diff::Twin;
use crate::sync::{FastPathLock, PageLock};
use crate::types::{NodeId, Version};

bitflags! {
    /// Per-page coherence state flags
    ///
    /// Legal combinations are `INVALID` (empty), `SHARED`, `OWNER | SHARED`
    /// and `OWNER | MODIFIED`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageState: u32 {
        /// Node holds a readable copy
        const SHARED = 1 << 0;

        /// Node holds the only, writable copy
        const MODIFIED = 1 << 1;

        /// Node is the current owner
        const OWNER = 1 << 2;
    }
}

impl PageState {
    /// The empty state: no access, no ownership
    pub const INVALID: PageState = PageState::empty();
}

bitflags! {
    /// Access-right mask returned to the hypervisor page-table layer
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessMask: u32 {
        /// Instruction fetch permitted
        const EXEC = 1 << 0;

        /// Write permitted
        const WRITE = 1 << 1;

        /// User-mode access permitted
        const USER = 1 << 2;

        /// Full access
        const ALL = Self::EXEC.bits() | Self::WRITE.bits() | Self::USER.bits();
    }
}

impl AccessMask {
    /// Mask installed for read access
    pub const READ_ONLY: AccessMask = AccessMask::EXEC.union(AccessMask::USER);
}

/// ============================================================================
/// Page Record
/// ============================================================================

/// Per-page DSM state on one node
pub struct PageRecord {
    /// Coherence state flags (`PageState` bits)
    state: AtomicU32,

    /// Page version; equal versions imply equal bytes cluster-wide
    version: AtomicU32,

    /// Node believed to be the current owner (possibly stale hint)
    prob_owner: AtomicU32,

    /// Nodes that may hold a readable copy; meaningful on the owner only
    copyset: spin::Mutex<Copyset>,

    /// Reference image for diff encoding on ownership transfer
    twin: spin::Mutex<Option<Twin>>,

    /// Per-page transaction lock
    pub lock: PageLock,

    /// Serializes invalidation handling against the fast path
    pub fast_path: FastPathLock,

    /// Blocks remote INV/WRITE handling while set
    pinned: AtomicBool,

    /// Blocks remote READ handling while set
    pinned_read: AtomicBool,
}

impl PageRecord {
    /// Create a fresh record: INVALID, version 0, probable owner node 0
    pub fn new() -> Self {
        Self {
            state: AtomicU32::new(PageState::INVALID.bits()),
            version: AtomicU32::new(0),
            prob_owner: AtomicU32::new(0),
            copyset: spin::Mutex::new(Copyset::new()),
            twin: spin::Mutex::new(None),
            lock: PageLock::new(),
            fast_path: FastPathLock::new(),
            pinned: AtomicBool::new(false),
            pinned_read: AtomicBool::new(false),
        }
    }

    // ------------------------------------------------------------------
    // State
    // ------------------------------------------------------------------

    /// Current state flags
    pub fn state(&self) -> PageState {
        PageState::from_bits_truncate(self.state.load(Ordering::Acquire))
    }

    /// Replace the state flags
    pub fn set_state(&self, state: PageState) {
        self.state.store(state.bits(), Ordering::Release);
    }

    /// Node is the current owner
    pub fn is_owner(&self) -> bool {
        self.state().contains(PageState::OWNER)
    }

    /// Node holds the only, writable copy
    pub fn is_modified(&self) -> bool {
        self.state().contains(PageState::MODIFIED)
    }

    /// Node holds any readable copy
    pub fn is_readable(&self) -> bool {
        self.state()
            .intersects(PageState::SHARED | PageState::MODIFIED)
    }

    /// Record has never taken part in a transaction
    ///
    /// Initial pages are implicitly owned by node 0, which holds their
    /// zero-filled image.
    pub fn is_initial(&self) -> bool {
        self.state() == PageState::INVALID && self.version() == 0 && self.prob_owner() == 0
    }

    // ------------------------------------------------------------------
    // Version
    // ------------------------------------------------------------------

    /// Current page version
    pub fn version(&self) -> Version {
        self.version.load(Ordering::Acquire)
    }

    /// Replace the page version
    pub fn set_version(&self, version: Version) {
        self.version.store(version, Ordering::Release);
    }

    /// Bump the page version by one
    pub fn incr_version(&self) {
        self.version.fetch_add(1, Ordering::AcqRel);
    }

    // ------------------------------------------------------------------
    // Probable owner
    // ------------------------------------------------------------------

    /// Node believed to be the current owner
    pub fn prob_owner(&self) -> NodeId {
        self.prob_owner.load(Ordering::Acquire) as NodeId
    }

    /// Replace the probable-owner hint
    pub fn set_prob_owner(&self, id: NodeId) {
        self.prob_owner.store(id as u32, Ordering::Release);
    }

    // ------------------------------------------------------------------
    // Copyset / twin
    // ------------------------------------------------------------------

    /// Access the copyset
    pub fn copyset(&self) -> MutexGuard<'_, Copyset> {
        self.copyset.lock()
    }

    /// Access the stored twin
    pub fn twin(&self) -> MutexGuard<'_, Option<Twin>> {
        self.twin.lock()
    }

    // ------------------------------------------------------------------
    // Pinning
    // ------------------------------------------------------------------

    /// Page is pinned against remote INV/WRITE handling
    pub fn is_pinned(&self) -> bool {
        self.pinned.load(Ordering::Acquire)
    }

    /// Set or clear the INV/WRITE pin
    pub fn set_pinned(&self, pinned: bool) {
        self.pinned.store(pinned, Ordering::Release);
    }

    /// Page is pinned against remote READ handling
    pub fn is_pinned_read(&self) -> bool {
        self.pinned_read.load(Ordering::Acquire)
    }

    /// Set or clear the READ pin
    pub fn set_pinned_read(&self, pinned: bool) {
        self.pinned_read.store(pinned, Ordering::Release);
    }
}

impl Default for PageRecord {
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

    #[test]
    fn test_fresh_record_is_initial() {
        let rec = PageRecord::new();
        assert!(rec.is_initial());
        assert!(!rec.is_owner());
        assert!(!rec.is_readable());
        assert_eq!(rec.state(), PageState::INVALID);
    }

    #[test]
    fn test_predicates_track_state() {
        let rec = PageRecord::new();

        rec.set_state(PageState::SHARED);
        assert!(rec.is_readable());
        assert!(!rec.is_owner());
        assert!(!rec.is_initial());

        rec.set_state(PageState::OWNER | PageState::MODIFIED);
        assert!(rec.is_owner());
        assert!(rec.is_modified());
        assert!(rec.is_readable());

        rec.set_state(PageState::INVALID);
        assert!(!rec.is_readable());
    }

    #[test]
    fn test_version_and_owner_break_initial() {
        let rec = PageRecord::new();
        rec.set_version(1);
        assert!(!rec.is_initial());

        rec.set_version(0);
        rec.set_prob_owner(3);
        assert!(!rec.is_initial());
        assert_eq!(rec.prob_owner(), 3);
    }

    #[test]
    fn test_access_masks() {
        assert_eq!(
            AccessMask::READ_ONLY,
            AccessMask::EXEC | AccessMask::USER
        );
        assert!(AccessMask::ALL.contains(AccessMask::WRITE));
    }
}
