// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Hypervisor Interface
//!
//! The coherence engine does not touch guest memory, page tables, or the
//! scheduler directly; the embedding hypervisor supplies them through the
//! traits in this module.

use crate::page::PageState;
use crate::slots::DsmMemslot;
use crate::types::{Gfn, Result, Vfn};

/// Guest-memory and page-table services
pub trait GuestMemory: Send + Sync {
    /// Copy a guest page into `buf`
    fn read_page(&self, slot: &DsmMemslot, gfn: Gfn, buf: &mut [u8]) -> Result;

    /// Overwrite a guest page from `buf`
    fn write_page(&self, slot: &DsmMemslot, gfn: Gfn, buf: &[u8]) -> Result;

    /// Apply the access right matching a DSM state
    ///
    /// `PageState::INVALID` must zap any installed shadow entries for the
    /// page; `SHARED` caps rights at read access; `MODIFIED` permits full
    /// access.
    fn apply_access_right(&self, slot: &DsmMemslot, vfn: Vfn, level: PageState);
}

/// Scheduling and timing services
///
/// Fault handlers may run in contexts that must not sleep (interrupts
/// disabled, spinlock held). The engine asks before every potentially
/// sleeping operation and degrades to busy-waiting with relax hints and
/// watchdog pokes.
pub trait Platform: Send + Sync {
    /// Whether the current context forbids sleeping
    fn in_restricted_context(&self) -> bool {
        false
    }

    /// Yield the CPU cooperatively; only called outside restricted contexts
    fn yield_now(&self) {}

    /// Pipeline-relax hint for busy-wait loops
    fn cpu_relax(&self) {
        core::hint::spin_loop();
    }

    /// Busy-delay for roughly `ns` nanoseconds (jitter injection)
    fn delay_ns(&self, _ns: u64) {}

    /// Monotonic clock in nanoseconds
    fn now_ns(&self) -> u64 {
        0
    }

    /// Pet hard/soft lockup detectors during long busy-wait loops
    fn touch_watchdogs(&self) {}
}
