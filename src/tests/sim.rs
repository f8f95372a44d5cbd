// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Cluster Test Substrate
//!
//! Hosted stand-ins for the pieces the engine consumes from its
//! environment: an in-memory switch transport with per-connection frame
//! queues, per-node guest memory with a mapping table, and a platform with
//! a togglable restricted-context flag. One `Cluster` wires N complete
//! engine instances together, spawning one server thread per accepted
//! connection exactly like the kernel host does.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::dsm::{Dsm, DsmConfig};
use crate::hypervisor::{GuestMemory, Platform};
use crate::page::{AccessMask, PageRecord, PageState};
use crate::protocol::{TxAdd, TX_ADD_WIRE_SIZE, TXID_ANY};
use crate::server::ServerCtl;
use crate::slots::{DsmMemslot, SlotFlags};
use crate::transport::{ConnId, MsgFlags, Transport};
use crate::types::status::{ERR_PEER_CLOSED, ERR_SHOULD_WAIT, ERR_TIMED_OUT};
use crate::types::{Gfn, NodeId, Result, Vfn, PAGE_SIZE};

/// Blocking receive bail-out so a protocol hang fails instead of wedging
const RECV_DEADLINE: Duration = Duration::from_secs(30);

// ============================================================================
// Frame queues
// ============================================================================

struct Frame {
    txid: u32,
    env: [u8; TX_ADD_WIRE_SIZE],
    payload: Vec<u8>,
}

#[derive(Default)]
struct QueueInner {
    frames: VecDeque<Frame>,
    closed: bool,
}

#[derive(Default)]
struct Queue {
    inner: Mutex<QueueInner>,
    cond: Condvar,
}

impl Queue {
    fn push(&self, frame: Frame) -> Result<()> {
        let mut q = self.inner.lock().unwrap();
        if q.closed {
            return Err(ERR_PEER_CLOSED);
        }
        q.frames.push_back(frame);
        self.cond.notify_all();
        Ok(())
    }

    /// Pop the next frame, or the frame matching `txid` when one is given.
    /// Concurrent requesters can share one connection, so replies must be
    /// claimed by transaction id, not arrival order.
    fn pop(&self, txid: Option<u32>, block: bool) -> Result<Frame> {
        let mut q = self.inner.lock().unwrap();
        let deadline = Instant::now() + RECV_DEADLINE;
        loop {
            let pos = match txid {
                None => if q.frames.is_empty() { None } else { Some(0) },
                Some(txid) => q.frames.iter().position(|f| f.txid == txid),
            };
            if let Some(pos) = pos {
                return Ok(q.frames.remove(pos).unwrap());
            }
            if q.closed {
                return Err(ERR_PEER_CLOSED);
            }
            if !block {
                return Err(ERR_SHOULD_WAIT);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ERR_TIMED_OUT);
            }
            let (guard, _) = self.cond.wait_timeout(q, deadline - now).unwrap();
            q = guard;
        }
    }

    fn close(&self) {
        self.inner.lock().unwrap().closed = true;
        self.cond.notify_all();
    }
}

// ============================================================================
// Switch transport
// ============================================================================

struct Endpoint {
    rx: Arc<Queue>,
    tx: Arc<Queue>,
}

/// In-memory full-duplex switch connecting every node
pub struct Switch {
    endpoints: Mutex<HashMap<ConnId, Endpoint>>,
    acceptors: Mutex<HashMap<NodeId, mpsc::Sender<ConnId>>>,
    next_conn: AtomicU64,
}

impl Switch {
    pub fn new() -> Arc<Switch> {
        Arc::new(Switch {
            endpoints: Mutex::new(HashMap::new()),
            acceptors: Mutex::new(HashMap::new()),
            next_conn: AtomicU64::new(1),
        })
    }

    fn register_acceptor(&self, node: NodeId, chan: mpsc::Sender<ConnId>) {
        self.acceptors.lock().unwrap().insert(node, chan);
    }

    fn open(&self, peer: NodeId) -> Result<ConnId> {
        let fwd = Arc::new(Queue::default());
        let rev = Arc::new(Queue::default());

        let client = self.next_conn.fetch_add(1, Ordering::Relaxed);
        let server = self.next_conn.fetch_add(1, Ordering::Relaxed);

        let mut endpoints = self.endpoints.lock().unwrap();
        endpoints.insert(
            client,
            Endpoint {
                rx: Arc::clone(&rev),
                tx: Arc::clone(&fwd),
            },
        );
        endpoints.insert(
            server,
            Endpoint {
                rx: fwd,
                tx: rev,
            },
        );
        drop(endpoints);

        let acceptors = self.acceptors.lock().unwrap();
        let chan = acceptors.get(&peer).ok_or(ERR_PEER_CLOSED)?;
        chan.send(server).map_err(|_| ERR_PEER_CLOSED)?;
        Ok(client)
    }

    fn shutdown(&self) {
        for ep in self.endpoints.lock().unwrap().values() {
            ep.rx.close();
            ep.tx.close();
        }
        // Dropping the senders ends every acceptor loop.
        self.acceptors.lock().unwrap().clear();
    }
}

/// One node's view of the switch
pub struct SwitchPort {
    switch: Arc<Switch>,
}

impl Transport for SwitchPort {
    fn connect(&self, peer: NodeId) -> Result<ConnId> {
        self.switch.open(peer)
    }

    fn send(&self, conn: ConnId, buf: &[u8], _flags: MsgFlags, tx: &TxAdd) -> Result<usize> {
        let queue = {
            let endpoints = self.switch.endpoints.lock().unwrap();
            let ep = endpoints.get(&conn).ok_or(ERR_PEER_CLOSED)?;
            Arc::clone(&ep.tx)
        };
        let mut env = [0u8; TX_ADD_WIRE_SIZE];
        tx.encode_to(&mut env);
        queue.push(Frame {
            txid: tx.txid,
            env,
            payload: buf.to_vec(),
        })?;
        Ok(buf.len())
    }

    fn receive(
        &self,
        conn: ConnId,
        buf: &mut [u8],
        flags: MsgFlags,
        tx: &mut TxAdd,
    ) -> Result<usize> {
        let queue = {
            let endpoints = self.switch.endpoints.lock().unwrap();
            let ep = endpoints.get(&conn).ok_or(ERR_PEER_CLOSED)?;
            Arc::clone(&ep.rx)
        };
        let block = !flags.intersects(MsgFlags::DONTWAIT | MsgFlags::NONBLOCK);
        let filter = if tx.txid == TXID_ANY {
            None
        } else {
            Some(tx.txid)
        };
        let frame = queue.pop(filter, block)?;

        let env = TxAdd::decode_from(&frame.env).unwrap();
        *tx = env;

        assert!(frame.payload.len() <= buf.len());
        buf[..frame.payload.len()].copy_from_slice(&frame.payload);
        Ok(frame.payload.len())
    }
}

// ============================================================================
// Guest memory
// ============================================================================

/// Per-node guest memory plus an installed-mapping table
pub struct SimMemory {
    pages: Mutex<HashMap<(Gfn, bool), Vec<u8>>>,
    mappings: Mutex<HashMap<(Gfn, bool), AccessMask>>,
}

impl SimMemory {
    pub fn new() -> Arc<SimMemory> {
        Arc::new(SimMemory {
            pages: Mutex::new(HashMap::new()),
            mappings: Mutex::new(HashMap::new()),
        })
    }

    /// Install a mapping (the hypervisor's direct-map step after a fault)
    pub fn install(&self, gfn: Gfn, is_smm: bool, mask: AccessMask) {
        self.mappings.lock().unwrap().insert((gfn, is_smm), mask);
    }

    /// Currently installed mapping, if any
    pub fn mapping(&self, gfn: Gfn, is_smm: bool) -> Option<AccessMask> {
        self.mappings.lock().unwrap().get(&(gfn, is_smm)).copied()
    }

    /// Raw guest bytes for a page (zeros if never written)
    pub fn page_bytes(&self, gfn: Gfn, is_smm: bool) -> Vec<u8> {
        self.pages
            .lock()
            .unwrap()
            .get(&(gfn, is_smm))
            .cloned()
            .unwrap_or_else(|| vec![0u8; PAGE_SIZE])
    }

    /// Direct guest store (a vCPU writing through its mapping)
    pub fn poke(&self, gfn: Gfn, is_smm: bool, offset: usize, bytes: &[u8]) {
        let mut pages = self.pages.lock().unwrap();
        let page = pages
            .entry((gfn, is_smm))
            .or_insert_with(|| vec![0u8; PAGE_SIZE]);
        page[offset..offset + bytes.len()].copy_from_slice(bytes);
    }
}

impl GuestMemory for SimMemory {
    fn read_page(&self, slot: &DsmMemslot, gfn: Gfn, buf: &mut [u8]) -> Result {
        let pages = self.pages.lock().unwrap();
        match pages.get(&(gfn, slot.is_smm)) {
            Some(page) => buf.copy_from_slice(page),
            None => buf.fill(0),
        }
        Ok(())
    }

    fn write_page(&self, slot: &DsmMemslot, gfn: Gfn, buf: &[u8]) -> Result {
        self.pages
            .lock()
            .unwrap()
            .insert((gfn, slot.is_smm), buf.to_vec());
        Ok(())
    }

    fn apply_access_right(&self, slot: &DsmMemslot, vfn: Vfn, level: PageState) {
        let gfn = slot.vfn_to_gfn(vfn);
        let mut mappings = self.mappings.lock().unwrap();
        if level == PageState::INVALID {
            // Zap any installed shadow entries.
            mappings.remove(&(gfn, slot.is_smm));
        } else if let Some(mask) = mappings.get_mut(&(gfn, slot.is_smm)) {
            *mask = if level == PageState::SHARED {
                AccessMask::READ_ONLY
            } else {
                AccessMask::ALL
            };
        }
    }
}

// ============================================================================
// Platform
// ============================================================================

/// Hosted platform with a togglable restricted-context flag
pub struct SimPlatform {
    restricted: AtomicBool,
    start: Instant,
}

impl SimPlatform {
    pub fn new() -> Arc<SimPlatform> {
        Arc::new(SimPlatform {
            restricted: AtomicBool::new(false),
            start: Instant::now(),
        })
    }

    pub fn set_restricted(&self, restricted: bool) {
        self.restricted.store(restricted, Ordering::SeqCst);
    }
}

impl Platform for SimPlatform {
    fn in_restricted_context(&self) -> bool {
        self.restricted.load(Ordering::SeqCst)
    }

    fn yield_now(&self) {
        std::thread::yield_now();
    }

    fn delay_ns(&self, ns: u64) {
        std::thread::sleep(Duration::from_nanos(ns));
    }

    fn now_ns(&self) -> u64 {
        self.start.elapsed().as_nanos() as u64
    }
}

// ============================================================================
// Cluster
// ============================================================================

/// One engine instance with its substrate
pub struct Node {
    pub dsm: Arc<Dsm>,
    pub memory: Arc<SimMemory>,
    pub platform: Arc<SimPlatform>,
    ctl: Arc<ServerCtl>,
    workers: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Node {
    /// Resolve a fault and install the resulting mapping, like the
    /// hypervisor fault handler does
    pub fn fault(&self, gfn: Gfn, write: bool) -> Result<AccessMask> {
        self.fault_then(gfn, write, |_| {})
    }

    /// Resolve a fault, install the mapping, and run `f` (typically a guest
    /// store) before the transaction window closes
    pub fn fault_then(
        &self,
        gfn: Gfn,
        write: bool,
        f: impl FnOnce(&SimMemory),
    ) -> Result<AccessMask> {
        let access = self.dsm.page_fault(gfn, false, write)?;
        let mask = access.mask();
        self.memory.install(gfn, false, mask);
        f(&self.memory);
        Ok(mask)
    }

    /// The page record backing a frame
    pub fn record(&self, gfn: Gfn) -> (Arc<DsmMemslot>, Vfn) {
        self.dsm.slot_and_vfn(gfn, false).unwrap()
    }

    /// Run a closure against the page record
    pub fn with_record<R>(&self, gfn: Gfn, f: impl FnOnce(&PageRecord) -> R) -> R {
        let (slot, vfn) = self.record(gfn);
        f(slot.record(vfn))
    }
}

/// N engine instances wired through one switch
pub struct Cluster {
    pub nodes: Vec<Arc<Node>>,
    switch: Arc<Switch>,
    acceptors: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl Cluster {
    /// Build a cluster and register one shared memslot on every node
    pub fn new(nr_nodes: usize, base_gfn: Gfn, npages: u64) -> Cluster {
        let switch = Switch::new();
        let mut nodes = Vec::new();
        let mut acceptors = Vec::new();

        for id in 0..nr_nodes {
            let memory = SimMemory::new();
            let platform = SimPlatform::new();
            let transport = Arc::new(SwitchPort {
                switch: Arc::clone(&switch),
            });

            let dsm = Arc::new(Dsm::new(
                DsmConfig::new(id as NodeId, nr_nodes),
                transport,
                Arc::clone(&memory) as Arc<dyn GuestMemory>,
                Arc::clone(&platform) as Arc<dyn Platform>,
            ));
            dsm.register_memslot(base_gfn, npages, false, SlotFlags::empty());

            let ctl = Arc::new(ServerCtl::new());
            let workers = Arc::new(Mutex::new(Vec::new()));

            let (chan_tx, chan_rx) = mpsc::channel::<ConnId>();
            switch.register_acceptor(id as NodeId, chan_tx);

            let acceptor = {
                let dsm = Arc::clone(&dsm);
                let ctl = Arc::clone(&ctl);
                let workers = Arc::clone(&workers);
                std::thread::spawn(move || {
                    while let Ok(conn) = chan_rx.recv() {
                        let dsm = Arc::clone(&dsm);
                        let ctl = Arc::clone(&ctl);
                        let worker = std::thread::spawn(move || {
                            let _ = dsm.serve_conn(conn, &ctl);
                        });
                        workers.lock().unwrap().push(worker);
                    }
                })
            };
            acceptors.push(acceptor);

            nodes.push(Arc::new(Node {
                dsm,
                memory,
                platform,
                ctl,
                workers,
            }));
        }

        Cluster {
            nodes,
            switch,
            acceptors: Mutex::new(acceptors),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn node(&self, id: usize) -> &Arc<Node> {
        &self.nodes[id]
    }

    /// Stop every engine and join all worker threads
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        for node in &self.nodes {
            node.dsm.stop();
            node.ctl.request_stop();
        }
        self.switch.shutdown();
        for node in &self.nodes {
            for worker in node.workers.lock().unwrap().drain(..) {
                let _ = worker.join();
            }
        }
        for acceptor in self.acceptors.lock().unwrap().drain(..) {
            let _ = acceptor.join();
        }
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ============================================================================
// Seeding helpers
// ============================================================================

/// Plant identical SHARED copies on `readers` with `owner` as owner
///
/// Sets up the cluster exactly as if `owner` had served a read to every
/// other reader at `version`: states, hints, copyset, and identical guest
/// bytes everywhere.
pub fn seed_shared_page(
    cluster: &Cluster,
    gfn: Gfn,
    owner: NodeId,
    readers: &[NodeId],
    version: u32,
    fill: u8,
) {
    let bytes = vec![fill; PAGE_SIZE];
    for node in &cluster.nodes {
        node.memory.poke(gfn, false, 0, &bytes);
    }
    for &id in readers {
        let node = cluster.node(id as usize);
        node.with_record(gfn, |rec| {
            if id == owner {
                rec.set_state(PageState::OWNER | PageState::SHARED);
            } else {
                rec.set_state(PageState::SHARED);
            }
            rec.set_version(version);
            rec.set_prob_owner(owner);
            let mut cs = rec.copyset();
            cs.clear_all();
            if id == owner {
                for &reader in readers {
                    cs.add(reader);
                }
            }
        });
    }
    for (id, node) in cluster.nodes.iter().enumerate() {
        if !readers.contains(&(id as NodeId)) {
            node.with_record(gfn, |rec| {
                rec.set_prob_owner(owner);
                rec.set_version(version);
            });
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_switch_round_trip() {
        let switch = Switch::new();
        let (chan_tx, chan_rx) = mpsc::channel();
        switch.register_acceptor(1, chan_tx);

        let port = SwitchPort {
            switch: Arc::clone(&switch),
        };
        let client = port.connect(1).unwrap();
        let server = chan_rx.recv().unwrap();

        let tx = TxAdd::new(42);
        port.send(client, b"hello", MsgFlags::empty(), &tx).unwrap();

        let mut buf = [0u8; 16];
        let mut rx = TxAdd::new(TXID_ANY);
        let len = port.receive(server, &mut buf, MsgFlags::empty(), &mut rx).unwrap();
        assert_eq!(&buf[..len], b"hello");
        assert_eq!(rx.txid, 42);
    }

    #[test]
    fn test_nonblocking_receive_would_block() {
        let switch = Switch::new();
        let (chan_tx, chan_rx) = mpsc::channel();
        switch.register_acceptor(0, chan_tx);

        let port = SwitchPort {
            switch: Arc::clone(&switch),
        };
        let client = port.connect(0).unwrap();
        let _server = chan_rx.recv().unwrap();

        let mut buf = [0u8; 4];
        let mut rx = TxAdd::new(TXID_ANY);
        let err = port
            .receive(client, &mut buf, MsgFlags::NONBLOCK, &mut rx)
            .unwrap_err();
        assert_eq!(err, ERR_SHOULD_WAIT);
    }

    #[test]
    fn test_sim_memory_defaults_to_zero_page() {
        let memory = SimMemory::new();
        assert!(memory.page_bytes(5, false).iter().all(|b| *b == 0));

        memory.poke(5, false, 10, &[1, 2, 3]);
        let bytes = memory.page_bytes(5, false);
        assert_eq!(&bytes[10..13], &[1, 2, 3]);
    }
}
