// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Page Diff Codec
//!
//! Ownership transfers carry the page payload as a diff against a *twin*, a
//! reference image of the page stored when the node last fetched it. A node
//! requesting a page at version V still holds the byte image of version V in
//! its guest memory (invalidation zaps the mapping, not the bytes), so the
//! responder only needs to ship the bytes that changed since.
//!
//! # Wire format
//!
//! A payload of exactly `PAGE_SIZE` bytes is the raw page. Anything shorter
//! is a sequence of copy records, each `[offset: u16][len: u16][len bytes]`,
//! little-endian, applied over the receiver's current page image. An empty
//! payload means "your current bytes are already correct" (this also covers
//! the initial zero page).
//!
//! The encoder falls back to the raw page whenever the twin does not match
//! the requester's version or the diff would not be smaller than the page.

use alloc::boxed::Box;
use alloc::vec;

use crate::types::{Result, Status, Version, PAGE_SIZE};
use crate::types::status::ERR_INVALID_ARGS;

/// Size of a copy-record header on the wire
const RECORD_HEADER: usize = 4;

/// Reference image of a page at a known version
pub struct Twin {
    /// Version whose canonical bytes `data` holds
    pub version: Version,
    data: Box<[u8]>,
}

impl Twin {
    /// Store a twin from a page image
    pub fn new(page: &[u8], version: Version) -> Self {
        debug_assert_eq!(page.len(), PAGE_SIZE);
        Self {
            version,
            data: Box::from(page),
        }
    }

    /// Store a zero-filled twin (initial page image)
    pub fn zeroed(version: Version) -> Self {
        Self {
            version,
            data: vec![0u8; PAGE_SIZE].into_boxed_slice(),
        }
    }

    /// The reference bytes
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

/// Encode `page` for a requester whose current image is at `req_version`
///
/// Writes the payload into `out` and returns its length. Falls back to the
/// raw page when no usable twin is available.
pub fn encode(twin: Option<&Twin>, req_version: Version, page: &[u8], out: &mut [u8]) -> usize {
    debug_assert_eq!(page.len(), PAGE_SIZE);
    debug_assert!(out.len() >= PAGE_SIZE);

    let base = match twin {
        Some(t) if t.version == req_version => t.data(),
        _ => {
            out[..PAGE_SIZE].copy_from_slice(page);
            return PAGE_SIZE;
        }
    };

    let mut len = 0;
    let mut pos = 0;
    while pos < PAGE_SIZE {
        if page[pos] == base[pos] {
            pos += 1;
            continue;
        }
        let start = pos;
        while pos < PAGE_SIZE && page[pos] != base[pos] {
            pos += 1;
        }
        let run = pos - start;
        if len + RECORD_HEADER + run >= PAGE_SIZE {
            out[..PAGE_SIZE].copy_from_slice(page);
            return PAGE_SIZE;
        }
        out[len..len + 2].copy_from_slice(&(start as u16).to_le_bytes());
        out[len + 2..len + 4].copy_from_slice(&(run as u16).to_le_bytes());
        out[len + 4..len + 4 + run].copy_from_slice(&page[start..pos]);
        len += RECORD_HEADER + run;
    }
    len
}

/// Apply a diff payload over the receiver's current page image
///
/// `page` must hold the receiver's current bytes on entry; on return it
/// holds the transferred image. A `PAGE_SIZE` payload replaces the page
/// wholesale.
pub fn decode(payload: &[u8], page: &mut [u8]) -> Result {
    debug_assert_eq!(page.len(), PAGE_SIZE);

    if payload.len() == PAGE_SIZE {
        page.copy_from_slice(payload);
        return Ok(());
    }

    let mut pos = 0;
    while pos < payload.len() {
        if payload.len() - pos < RECORD_HEADER {
            return Err(malformed());
        }
        let offset = u16::from_le_bytes([payload[pos], payload[pos + 1]]) as usize;
        let run = u16::from_le_bytes([payload[pos + 2], payload[pos + 3]]) as usize;
        pos += RECORD_HEADER;
        if run == 0 || offset + run > PAGE_SIZE || payload.len() - pos < run {
            return Err(malformed());
        }
        page[offset..offset + run].copy_from_slice(&payload[pos..pos + run]);
        pos += run;
    }
    Ok(())
}

fn malformed() -> Status {
    ERR_INVALID_ARGS
}

// ============================================================================
// Tests
// ============================================================================
