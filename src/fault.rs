// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! DSM Fault Resolver
//!
//! Client side of the coherence protocol: a vCPU trapped on a missing
//! access right and this module produces the access mask to install,
//! fetching the page or ownership from a remote node when the local state
//! does not already admit the access.
//!
//! # Locking
//!
//! The per-page transaction lock is taken on entry and held until the
//! returned `PageAccess` is dropped, after the hypervisor has installed the
//! mapping. Invalidation handling deliberately ignores that lock (only the
//! owner sends INV, and it already serializes its own transactions), so the
//! fast path double-checks state under the page's `fast_path_lock` and keeps
//! it held, shared, across the install window. Without that hold, an
//! invalidation arriving between fault resolution and installation would be
//! applied to an already-INVALID record and the stale mapping would survive.
//!
//! # Copyset and version rules
//!
//! Only the owner's copyset is meaningful; it is cleared on every ownership
//! transfer and reseeded with the new owner. Each node in a forwarding chain
//! clears only its own bit of the copyset it relays. A write fault sets the
//! local version to the responder's plus one; a read fault adopts the
//! responder's version unchanged.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::copyset::Copyset;
use crate::diff;
use crate::diff::Twin;
use crate::dsm::Dsm;
use crate::page::{AccessMask, PageRecord, PageState};
use crate::protocol::{DsmRequest, DsmResponse, ReqType, TxAdd, REQUEST_WIRE_SIZE};
use crate::slots::DsmMemslot;
use crate::transport::MsgFlags;
use crate::types::status::{ERR_NO_MEMORY, ERR_SHOULD_WAIT, ERR_STOP};
use crate::types::{Gfn, NodeId, Result, Vfn, PAGE_SIZE};
use crate::{log_debug, log_error, log_warn};

/// Spin count after which the receive loop logs a stuck-transaction warning
const RETRY_WARN_THRESHOLD: u32 = 100_000;

/// Sends between watchdog refreshes in the invalidation loop
const INV_WATCHDOG_STRIDE: u32 = 64;

/// Access token returned by a resolved fault
///
/// Holds the page's transaction lock (and, for fast-path faults, the shared
/// fast-path lock) until dropped. The hypervisor installs `mask()` first,
/// then drops the token.
pub struct PageAccess {
    slot: Arc<DsmMemslot>,
    vfn: Vfn,
    mask: AccessMask,
    fast: bool,
}

impl PageAccess {
    /// Access-right mask to install
    pub fn mask(&self) -> AccessMask {
        self.mask
    }

    /// Whether the fault was admitted by the fast path
    pub fn is_fast_path(&self) -> bool {
        self.fast
    }
}

impl Drop for PageAccess {
    fn drop(&mut self) {
        let record = self.slot.record(self.vfn);
        if self.fast {
            record.fast_path.unlock_shared();
        }
        record.lock.unlock();
    }
}

/// Allocate a zeroed single-page scratch buffer, fallibly
pub(crate) fn alloc_page_buf() -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    if buf.try_reserve_exact(PAGE_SIZE).is_err() {
        return Err(ERR_NO_MEMORY);
    }
    buf.resize(PAGE_SIZE, 0);
    Ok(buf)
}

impl Dsm {
    /// Resolve a vCPU page fault
    ///
    /// Returns the access token carrying the mask to install. Errors leave
    /// the page state untouched and release every lock taken.
    pub fn page_fault(&self, gfn: Gfn, is_smm: bool, write: bool) -> Result<PageAccess> {
        let (slot, vfn) = self.slot_and_vfn(gfn, is_smm)?;
        slot.record(vfn).lock.lock();

        match self.page_fault_locked(&slot, vfn, gfn, is_smm, write) {
            Ok((mask, fast, resp_len)) => {
                self.stats.pf_trace(self.id(), gfn, write, fast, resp_len);
                Ok(PageAccess {
                    slot,
                    vfn,
                    mask,
                    fast,
                })
            }
            Err(err) => {
                slot.record(vfn).lock.unlock();
                self.stats.fault_error();
                log_error!(
                    "node[{}] failed to handle page fault on gfn[{},{}], error {}",
                    self.id(),
                    gfn,
                    is_smm as u8,
                    err
                );
                Err(err)
            }
        }
    }

    /// Fault body; runs under the page's transaction lock
    fn page_fault_locked(
        &self,
        slot: &Arc<DsmMemslot>,
        vfn: Vfn,
        gfn: Gfn,
        is_smm: bool,
        write: bool,
    ) -> Result<(AccessMask, bool, usize)> {
        let record = slot.record(vfn);

        if self.fast_path(record, write) {
            let mask = if write {
                AccessMask::ALL
            } else {
                AccessMask::READ_ONLY
            };
            return Ok((mask, true, 0));
        }

        let mut page = alloc_page_buf()?;

        if write {
            let req = DsmRequest {
                req_type: ReqType::Write,
                requester: self.id(),
                msg_sender: self.id(),
                gfn,
                is_smm,
                version: record.version(),
            };
            let mut resp = DsmResponse::new();
            let resp_len;

            if record.is_owner() {
                assert_eq!(record.prob_owner(), self.id());

                self.invalidate(slot, vfn, gfn, is_smm, None)?;
                resp.version = record.version();
                resp_len = PAGE_SIZE;

                record.incr_version();
            } else {
                // Owner of all pages is node 0 on init.
                if record.is_initial() && self.id() == 0 {
                    record.set_prob_owner(self.id());
                    record.set_state(PageState::OWNER | PageState::MODIFIED);
                    record.copyset().add(self.id());
                    return Ok((AccessMask::ALL, false, 0));
                }

                // Ask the probable owner; stale hints are resolved by
                // forwarding on the server side.
                let owner = record.prob_owner();
                resp_len = self.fetch(owner, false, &req, &mut page, &mut resp)?;

                // The old owner's copyset (minus every hop's own bit) is
                // ours to invalidate, old owner included.
                self.invalidate(slot, vfn, gfn, is_smm, Some(&resp.inv_copyset))?;

                record.set_version(resp.version + 1);
            }

            {
                let mut cs = record.copyset();
                cs.clear_all();
                cs.add(self.id());
            }

            if !record.is_owner() {
                self.decode_into(slot, gfn, &mut page, resp_len)?;
                *record.twin() = Some(Twin::new(&page, resp.version));
                if resp_len > 0 {
                    self.memory.write_page(slot, gfn, &page)?;
                }
            }

            record.set_prob_owner(self.id());
            record.set_state(PageState::OWNER | PageState::MODIFIED);
            Ok((AccessMask::ALL, false, resp_len))
        } else {
            // An owner would have already been readable and taken the fast
            // path.
            assert!(!record.is_owner());

            if record.is_initial() && self.id() == 0 {
                record.set_prob_owner(self.id());
                record.set_state(PageState::OWNER | PageState::SHARED);
                record.copyset().add(self.id());
                return Ok((AccessMask::READ_ONLY, false, 0));
            }

            let req = DsmRequest {
                req_type: ReqType::Read,
                requester: self.id(),
                msg_sender: self.id(),
                gfn,
                is_smm,
                version: record.version(),
            };
            let mut resp = DsmResponse::new();
            let resp_len = self.fetch(record.prob_owner(), false, &req, &mut page, &mut resp)?;

            record.set_version(resp.version);
            {
                let mut cs = record.copyset();
                cs.copy_from(&resp.inv_copyset);
                cs.add(self.id());
            }

            self.decode_into(slot, gfn, &mut page, resp_len)?;
            self.memory.write_page(slot, gfn, &page)?;

            record.set_prob_owner(self.id());
            // The reader takes ownership: a later remote write must
            // synchronize through this node, which closes the window
            // between fault resolution and mapping installation.
            record.set_state(PageState::OWNER | PageState::SHARED);
            Ok((AccessMask::READ_ONLY, false, resp_len))
        }
    }

    /// Lock-free admission check with double-checked locking
    ///
    /// On a true return the fast-path lock is held shared; `PageAccess`
    /// releases it after the mapping is installed.
    fn fast_path(&self, record: &PageRecord, write: bool) -> bool {
        if write && record.is_modified() {
            record.fast_path.lock_shared();
            if record.is_modified() {
                return true;
            }
            record.fast_path.unlock_shared();
            return false;
        }
        if !write && record.is_readable() {
            record.fast_path.lock_shared();
            if record.is_readable() {
                return true;
            }
            record.fast_path.unlock_shared();
            return false;
        }
        false
    }

    /// Rebuild the transferred page image from a diff payload
    ///
    /// `page[..len]` holds the payload. A full-size payload is the raw page;
    /// anything shorter is applied over the current guest bytes, which are
    /// the canonical image of the version this node last held.
    fn decode_into(&self, slot: &Arc<DsmMemslot>, gfn: Gfn, page: &mut [u8], len: usize) -> Result {
        if len == PAGE_SIZE {
            return Ok(());
        }
        let mut base = alloc_page_buf()?;
        self.memory.read_page(slot, gfn, &mut base)?;
        diff::decode(&page[..len], &mut base)?;
        page.copy_from_slice(&base);
        Ok(())
    }

    /// Issue a request to `dest` and wait for its reply
    ///
    /// `from_server` selects the server-plane connection used by forwarding
    /// workers. In restricted contexts this never sleeps: it polls with
    /// relax hints and watchdog pokes, and refuses to open new connections.
    pub(crate) fn fetch(
        &self,
        dest: NodeId,
        from_server: bool,
        req: &DsmRequest,
        data: &mut [u8],
        resp: &mut DsmResponse,
    ) -> Result<usize> {
        if self.is_stopped() {
            return Err(ERR_STOP);
        }

        let restricted = self.platform.in_restricted_context();
        let (send_flags, recv_flags) = if restricted {
            (MsgFlags::DONTWAIT, MsgFlags::DONTWAIT)
        } else {
            (MsgFlags::empty(), MsgFlags::NONBLOCK)
        };

        let conn = self
            .conns
            .get_or_connect(&*self.transport, dest, from_server, restricted)?;

        let mut tx = TxAdd::new(self.generate_txid(dest));
        log_debug!(
            "node[{}] sent request[{:#x}] to node[{}] type[{}] gfn[{},{}]",
            self.id(),
            tx.txid,
            dest,
            req.req_type.desc(),
            req.gfn,
            req.is_smm as u8
        );

        let mut req_buf = [0u8; REQUEST_WIRE_SIZE];
        req.encode_to(&mut req_buf);

        loop {
            match self.transport.send(conn, &req_buf, send_flags, &tx) {
                Ok(_) => break,
                Err(err) if err == ERR_SHOULD_WAIT && restricted => {
                    self.platform.cpu_relax();
                    self.poke_watchdogs();
                }
                Err(err) if err == ERR_SHOULD_WAIT => self.platform.yield_now(),
                Err(err) => return Err(err),
            }
        }

        if req.req_type == ReqType::Invalidate {
            let mut ack = [0u8; 1];
            loop {
                match self.transport.receive(conn, &mut ack, recv_flags, &mut tx) {
                    Ok(len) => return Ok(len),
                    Err(err) if err == ERR_SHOULD_WAIT && restricted => {
                        self.platform.cpu_relax();
                        self.poke_watchdogs();
                    }
                    Err(err) if err == ERR_SHOULD_WAIT => self.platform.yield_now(),
                    Err(err) => return Err(err),
                }
            }
        }

        let mut retry_cnt: u32 = 0;
        let len = loop {
            match self
                .transport
                .receive(conn, data, MsgFlags::NONBLOCK, &mut tx)
            {
                Ok(len) => break len,
                Err(err) if err == ERR_SHOULD_WAIT => {
                    if restricted {
                        self.platform.cpu_relax();
                        self.poke_watchdogs();
                        continue;
                    }
                    retry_cnt += 1;
                    if retry_cnt > RETRY_WARN_THRESHOLD {
                        log_warn!(
                            "node[{}] waited on gfn[{}] response from node[{}] for too long",
                            self.id(),
                            req.gfn,
                            dest
                        );
                        retry_cnt = 0;
                    }
                    self.platform.yield_now();
                }
                Err(err) => return Err(err),
            }
        };

        resp.inv_copyset.copy_from(&tx.inv_copyset);
        resp.version = tx.version;
        Ok(len)
    }

    /// Invalidate every copyset holder of a page except this node
    ///
    /// Issued by the owner (or owner-to-be, with the copyset received from
    /// the old owner). Safe in contexts that cannot sleep: yields only when
    /// the platform permits it, else emits relax hints.
    pub(crate) fn invalidate(
        &self,
        slot: &Arc<DsmMemslot>,
        vfn: Vfn,
        gfn: Gfn,
        is_smm: bool,
        cpyset: Option<&Copyset>,
    ) -> Result {
        let record = slot.record(vfn);
        let copyset = match cpyset {
            Some(cs) => *cs,
            None => *record.copyset(),
        };
        let restricted = self.platform.in_restricted_context();
        let mut loop_cnt: u32 = 0;

        for holder in copyset.iter() {
            if holder == self.id() {
                continue;
            }
            assert!((holder as usize) < self.nr_nodes());

            let req = DsmRequest {
                req_type: ReqType::Invalidate,
                requester: self.id(),
                msg_sender: self.id(),
                gfn,
                is_smm,
                version: record.version(),
            };
            let mut ack = [0u8; 1];
            let mut resp = DsmResponse::new();
            self.fetch(holder, false, &req, &mut ack, &mut resp)?;
            self.stats.inv_sent();

            loop_cnt += 1;
            if loop_cnt % INV_WATCHDOG_STRIDE == 0 {
                self.poke_watchdogs();
                if restricted {
                    self.platform.cpu_relax();
                } else {
                    self.platform.yield_now();
                }
            }
        }
        Ok(())
    }

    /// Refresh the engine watchdog and the platform lockup detectors
    fn poke_watchdogs(&self) {
        self.watchdog.pet(self.platform.now_ns());
        self.platform.touch_watchdogs();
    }
}
