// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! DSM Request Server
//!
//! Server side of the coherence protocol: one long-lived worker per
//! incoming connection, dispatching invalidate/read/write requests against
//! the local page records.
//!
//! # Locking
//!
//! Read and write transactions take the per-page lock: the owner's lock is
//! the serialization point for every transaction on a page. Invalidations
//! do not: only the owner issues them, it already holds the serialization
//! right, and taking the page lock here would deadlock against a client
//! waiting on this very worker. The invalidate handler instead takes the
//! page's fast-path lock exclusively, which is exactly what the lock-free
//! client fast path checks against.
//!
//! Once a read or write transaction completes, this node has ceased to be
//! owner, so the dispatch tail clears the local copyset.

use core::sync::atomic::{AtomicBool, Ordering};

use alloc::sync::Arc;

use crate::diff;
use crate::dsm::Dsm;
use crate::fault::alloc_page_buf;
use crate::page::PageState;
use crate::protocol::{DsmRequest, ReqType, TxAdd, REQUEST_WIRE_SIZE, TXID_ANY};
use crate::slots::DsmMemslot;
use crate::transport::{ConnId, MsgFlags};
use crate::types::{Result, Vfn};
use crate::{log_debug, log_warn};

/// Per-worker stop signal
pub struct ServerCtl {
    stop: AtomicBool,
}

impl ServerCtl {
    /// Create a control block
    pub const fn new() -> Self {
        Self {
            stop: AtomicBool::new(false),
        }
    }

    /// Ask the worker to exit at the next request boundary
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Whether a stop has been requested
    pub fn should_stop(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}

impl Default for ServerCtl {
    fn default() -> Self {
        Self::new()
    }
}

impl Dsm {
    /// Serve one incoming connection until stop or transport error
    ///
    /// The host runs this on a dedicated thread per accepted connection.
    /// Returns `Ok(())` on a requested or engine-wide stop.
    pub fn serve_conn(&self, conn: ConnId, ctl: &ServerCtl) -> Result {
        let mut page = alloc_page_buf()?;
        let mut scratch = alloc_page_buf()?;

        loop {
            if ctl.should_stop() || self.is_stopped() {
                return Ok(());
            }

            let mut tx = TxAdd::new(TXID_ANY);
            let mut req_buf = [0u8; REQUEST_WIRE_SIZE];
            let len = match self.transport.receive(conn, &mut req_buf, MsgFlags::empty(), &mut tx)
            {
                Ok(len) => len,
                Err(err) => {
                    if ctl.should_stop() || self.is_stopped() {
                        return Ok(());
                    }
                    log_debug!("node[{}] exited server loop, error {}", self.id(), err);
                    return Err(err);
                }
            };
            assert_eq!(len, REQUEST_WIRE_SIZE);

            let req = DsmRequest::decode_from(&req_buf)?;
            assert_ne!(req.requester, self.id());

            self.dispatch_req(conn, &req, &mut tx, &mut page, &mut scratch)?;
        }
    }

    /// Look up the page and run one request to completion, retrying while
    /// the memslot is reconfiguring or the page is pinned
    fn dispatch_req(
        &self,
        conn: ConnId,
        req: &DsmRequest,
        tx: &mut TxAdd,
        page: &mut [u8],
        scratch: &mut [u8],
    ) -> Result {
        loop {
            let slot = match self.slots.lookup(req.gfn, req.is_smm) {
                Some(slot) if !slot.unusable() => slot,
                _ => {
                    log_warn!("node[{}] invalid gfn {}!", self.id(), req.gfn);
                    self.platform.yield_now();
                    continue;
                }
            };
            let vfn = slot.gfn_to_vfn(req.gfn);
            let record = slot.record(vfn);

            log_debug!(
                "node[{}] received request[{:#x}] from node[{}->{}] type[{}] gfn[{},{}] \
                 version {} myversion {}",
                self.id(),
                tx.txid,
                req.msg_sender,
                req.requester,
                req.req_type.desc(),
                req.gfn,
                req.is_smm as u8,
                req.version,
                record.version()
            );

            if req.req_type != ReqType::Invalidate {
                record.lock.lock();
            }

            let result = match req.req_type {
                ReqType::Invalidate => self.handle_invalidate_req(&slot, vfn, req, conn, tx),
                ReqType::Write => self.handle_write_req(&slot, vfn, req, conn, tx, page, scratch),
                ReqType::Read => self.handle_read_req(&slot, vfn, req, conn, tx, page, scratch),
            };

            let retry = match result {
                Ok(retry) => {
                    if req.req_type != ReqType::Invalidate {
                        if !retry {
                            // Completed transaction: this node is no longer
                            // owner.
                            record.copyset().clear_all();
                        }
                        record.lock.unlock();
                    }
                    retry
                }
                Err(err) => {
                    if req.req_type != ReqType::Invalidate {
                        record.lock.unlock();
                    }
                    return Err(err);
                }
            };

            if retry {
                self.platform.yield_now();
                continue;
            }
            return Ok(());
        }
    }

    /// Drop this node's readable copy
    ///
    /// Runs without the per-page lock; the exclusive fast-path hold keeps a
    /// concurrent local fast-path fault from installing a mapping around the
    /// zap.
    fn handle_invalidate_req(
        &self,
        slot: &Arc<DsmMemslot>,
        vfn: Vfn,
        req: &DsmRequest,
        conn: ConnId,
        tx: &mut TxAdd,
    ) -> Result<bool> {
        let record = slot.record(vfn);

        if record.is_pinned() && !self.is_stopped() {
            log_debug!(
                "node[{}] REQ_INV blocked by pinned gfn[{},{}], sleep then retry",
                self.id(),
                req.gfn,
                req.is_smm as u8
            );
            return Ok(true);
        }

        // The owner of a modified page never receives INV for it.
        assert!(!record.is_modified());

        record.fast_path.lock_exclusive();

        record.set_state(PageState::INVALID);
        self.memory.apply_access_right(slot, vfn, PageState::INVALID);
        record.set_prob_owner(req.msg_sender);
        record.copyset().clear_all();
        let sent = self.transport.send(conn, &[1u8], MsgFlags::empty(), tx);

        record.fast_path.unlock_exclusive();

        sent?;
        self.stats.inv_handled();
        Ok(false)
    }

    /// Transfer the page and exclusive ownership to `msg_sender`
    fn handle_write_req(
        &self,
        slot: &Arc<DsmMemslot>,
        vfn: Vfn,
        req: &DsmRequest,
        conn: ConnId,
        tx: &mut TxAdd,
        page: &mut [u8],
        scratch: &mut [u8],
    ) -> Result<bool> {
        let record = slot.record(vfn);
        let mut resp = self.resp_pool.alloc()?;

        self.inject_jitter();

        if record.is_pinned_read() && !self.is_stopped() {
            return Ok(true);
        }

        let is_owner = record.is_owner();
        let mut length = 0usize;

        if is_owner {
            assert_eq!(record.prob_owner(), self.id());

            record.set_state(PageState::INVALID);
            self.memory.apply_access_right(slot, vfn, PageState::INVALID);

            resp.inv_copyset.copy_from(&record.copyset());
            resp.version = record.version();
            resp.inv_copyset.clear(self.id());

            record.set_prob_owner(req.msg_sender);
            self.memory.read_page(slot, req.gfn, page)?;
        } else if record.is_initial() && self.id() == 0 {
            // Untouched zero page: the requester's bytes are already
            // correct, respond with an empty payload.
            resp.inv_copyset.clear_all();
            resp.version = record.version();
            self.memory.read_page(slot, req.gfn, page)?;
            record.set_prob_owner(req.msg_sender);
            record.set_state(PageState::INVALID);
        } else {
            let fwd = DsmRequest {
                req_type: ReqType::Write,
                requester: self.id(),
                msg_sender: req.msg_sender,
                gfn: req.gfn,
                is_smm: req.is_smm,
                version: req.version,
            };
            let owner = record.prob_owner();
            length = self.fetch(owner, true, &fwd, page, &mut resp)?;
            self.stats.forwarded();

            record.set_state(PageState::INVALID);
            self.memory.apply_access_right(slot, vfn, PageState::INVALID);
            record.set_prob_owner(req.msg_sender);
            resp.inv_copyset.clear(self.id());
        }

        if is_owner {
            let twin = record.twin();
            length = diff::encode(twin.as_ref(), req.version, page, scratch);
        }

        tx.inv_copyset.copy_from(&resp.inv_copyset);
        tx.version = resp.version;
        let payload: &[u8] = if is_owner {
            &scratch[..length]
        } else {
            &page[..length]
        };
        self.transport.send(conn, payload, MsgFlags::empty(), tx)?;

        self.stats.write_served();
        Ok(false)
    }

    /// Transfer a readable copy and ownership to `msg_sender`
    ///
    /// Ownership moves on reads too: a reader that stayed a plain SHARED
    /// copy could have a concurrent owner invalidation land between its
    /// fault resolution and its mapping installation, and the invalidation
    /// would be applied to an already-INVALID record. With the reader as
    /// owner, later writes in the cluster synchronize through it.
    fn handle_read_req(
        &self,
        slot: &Arc<DsmMemslot>,
        vfn: Vfn,
        req: &DsmRequest,
        conn: ConnId,
        tx: &mut TxAdd,
        page: &mut [u8],
        scratch: &mut [u8],
    ) -> Result<bool> {
        let record = slot.record(vfn);
        let mut resp = self.resp_pool.alloc()?;

        self.inject_jitter();
        resp.version = 0;

        if record.is_pinned_read() && !self.is_stopped() {
            return Ok(true);
        }

        let is_owner = record.is_owner();
        let mut length = 0usize;

        if is_owner {
            assert_eq!(record.prob_owner(), self.id());

            record.set_prob_owner(req.msg_sender);
            record.set_state(PageState::SHARED);
            self.memory.apply_access_right(slot, vfn, PageState::SHARED);

            self.memory.read_page(slot, req.gfn, page)?;

            resp.inv_copyset.copy_from(&record.copyset());
            // A readable owner is always a member of its own copyset.
            assert!(resp.inv_copyset.test(self.id()));
            resp.version = record.version();
        } else if record.is_initial() && self.id() == 0 {
            self.memory.read_page(slot, req.gfn, page)?;

            record.set_prob_owner(req.msg_sender);
            record.set_state(PageState::SHARED);
            record.copyset().add(self.id());

            resp.inv_copyset.copy_from(&record.copyset());
            resp.version = record.version();
        } else {
            let fwd = DsmRequest {
                req_type: ReqType::Read,
                requester: self.id(),
                msg_sender: req.msg_sender,
                gfn: req.gfn,
                is_smm: req.is_smm,
                version: req.version,
            };
            length = self.fetch(record.prob_owner(), true, &fwd, page, &mut resp)?;
            self.stats.forwarded();

            assert!(!(record.is_readable() && !resp.inv_copyset.test(self.id())));
            record.set_prob_owner(req.msg_sender);
        }

        if is_owner {
            let twin = record.twin();
            length = diff::encode(twin.as_ref(), req.version, page, scratch);
        }

        tx.inv_copyset.copy_from(&resp.inv_copyset);
        tx.version = resp.version;
        let payload: &[u8] = if is_owner {
            &scratch[..length]
        } else {
            &page[..length]
        };
        self.transport.send(conn, payload, MsgFlags::empty(), tx)?;

        self.stats.read_served();
        Ok(false)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_ctl() {
        let ctl = ServerCtl::new();
        assert!(!ctl.should_stop());
        ctl.request_stop();
        assert!(ctl.should_stop());
    }
}
