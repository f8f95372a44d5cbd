// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Response Object Pool
//!
//! Server handlers may run while peers hold spinlocks waiting on them, so
//! their response objects come from a fixed pool populated at engine
//! creation instead of the general allocator. Exhaustion surfaces as an
//! out-of-memory status and the request is retried by the faulting vCPU.

use alloc::boxed::Box;
use alloc::vec::Vec;

use spin::Mutex;

use crate::protocol::DsmResponse;
use crate::types::status::ERR_NO_MEMORY;
use crate::types::Result;

/// Default number of pooled response objects
pub const DEFAULT_POOL_SIZE: usize = 128;

/// Fixed-capacity free list of response objects
#[derive(Debug)]
pub struct RespPool {
    free: Mutex<Vec<Box<DsmResponse>>>,
    capacity: usize,
}

impl RespPool {
    /// Create a pool with `capacity` preallocated objects
    pub fn new(capacity: usize) -> Self {
        let mut free = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            free.push(Box::new(DsmResponse::new()));
        }
        Self {
            free: Mutex::new(free),
            capacity,
        }
    }

    /// Take a zeroed response object from the pool
    pub fn alloc(&self) -> Result<PooledResp<'_>> {
        let mut resp = self.free.lock().pop().ok_or(ERR_NO_MEMORY)?;
        *resp = DsmResponse::new();
        Ok(PooledResp {
            pool: self,
            resp: Some(resp),
        })
    }

    /// Number of objects currently available
    pub fn available(&self) -> usize {
        self.free.lock().len()
    }

    /// Pool capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn put_back(&self, resp: Box<DsmResponse>) {
        self.free.lock().push(resp);
    }
}

/// RAII handle returning its response object to the pool on drop
#[derive(Debug)]
pub struct PooledResp<'a> {
    pool: &'a RespPool,
    resp: Option<Box<DsmResponse>>,
}

impl core::ops::Deref for PooledResp<'_> {
    type Target = DsmResponse;

    fn deref(&self) -> &DsmResponse {
        self.resp.as_ref().unwrap()
    }
}

impl core::ops::DerefMut for PooledResp<'_> {
    fn deref_mut(&mut self) -> &mut DsmResponse {
        self.resp.as_mut().unwrap()
    }
}

impl Drop for PooledResp<'_> {
    fn drop(&mut self) {
        if let Some(resp) = self.resp.take() {
            self.pool.put_back(resp);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
