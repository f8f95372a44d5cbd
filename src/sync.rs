// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! DSM Locking Primitives
//!
//! This module provides the two raw locks embedded in every page record.
//! Both expose explicit acquire/release instead of RAII guards because they
//! are held across function boundaries: the transaction lock is taken when a
//! fault enters the engine and released only after the hypervisor has
//! installed the mapping, and the fast-path lock is released by the same
//! caller.
//!
//! # Design
//!
//! - **PageLock**: plain spinlock serializing all non-INV transactions for
//!   one page, on both the client and server planes
//! - **FastPathLock**: reader/writer spinlock; readers are fast-path faults
//!   and invalidation senders at the owner, writers are invalidation
//!   handlers

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// ============================================================================
/// Page Transaction Lock
/// ============================================================================

/// Raw spinlock serializing per-page transactions
pub struct PageLock {
    locked: AtomicBool,
}

impl PageLock {
    /// Create a new unlocked page lock
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    /// Acquire the lock, spinning until it becomes available
    pub fn lock(&self) {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }
    }

    /// Try to acquire the lock without spinning
    pub fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Release the lock
    ///
    /// The caller must hold the lock.
    pub fn unlock(&self) {
        debug_assert!(self.locked.load(Ordering::Relaxed));
        self.locked.store(false, Ordering::Release);
    }

    /// Check whether the lock is currently held
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

/// ============================================================================
/// Fast-Path Lock
/// ============================================================================

/// Writer-held bit in the fast-path lock word
const WRITER: u32 = 1 << 31;

/// Reader/writer spinlock with explicit acquire/release
///
/// Shared holders are counted in the low bits; an exclusive holder sets the
/// writer bit. No fairness is attempted: invalidations are rare compared to
/// fast-path faults.
pub struct FastPathLock {
    state: AtomicU32,
}

impl FastPathLock {
    /// Create a new unlocked fast-path lock
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(0),
        }
    }

    /// Acquire the lock in shared mode
    pub fn lock_shared(&self) {
        loop {
            let state = self.state.load(Ordering::Relaxed);
            if state & WRITER == 0
                && self
                    .state
                    .compare_exchange_weak(state, state + 1, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                return;
            }
            core::hint::spin_loop();
        }
    }

    /// Release a shared hold
    pub fn unlock_shared(&self) {
        let prev = self.state.fetch_sub(1, Ordering::Release);
        debug_assert!(prev & !WRITER > 0);
    }

    /// Acquire the lock in exclusive mode
    pub fn lock_exclusive(&self) {
        while self
            .state
            .compare_exchange_weak(0, WRITER, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }
    }

    /// Release an exclusive hold
    pub fn unlock_exclusive(&self) {
        debug_assert_eq!(self.state.load(Ordering::Relaxed), WRITER);
        self.state.store(0, Ordering::Release);
    }
}

// ============================================================================
// Tests
// ============================================================================
