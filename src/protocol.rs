// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! DSM Wire Protocol
//!
//! Peer-to-peer messages exchanged over the reliable transport. Each message
//! is a fixed-size envelope (`TxAdd`: transaction id plus the response
//! side-band) followed by a typed payload: a fixed-size `DsmRequest`, a
//! one-byte ACK (invalidations), or a diff-codec payload of up to one page
//! (read/write responses).
//!
//! All numeric fields are little-endian at fixed offsets.

use crate::copyset::{Copyset, COPYSET_BYTES};
use crate::types::status::ERR_INVALID_ARGS;
use crate::types::{Gfn, NodeId, Result, TxId, Version};

/// Wildcard transaction id: the server accepts any incoming request
pub const TXID_ANY: TxId = TxId::MAX;

/// Size of an encoded `DsmRequest`
pub const REQUEST_WIRE_SIZE: usize = 18;

/// Size of an encoded `TxAdd` envelope
pub const TX_ADD_WIRE_SIZE: usize = 8 + COPYSET_BYTES;

/// DSM transaction types
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReqType {
    /// Drop the readable copy held by the receiver
    Invalidate = 0,

    /// Transfer a readable copy and ownership to the requester
    Read = 1,

    /// Transfer the page and exclusive ownership to the requester
    Write = 2,
}

impl ReqType {
    /// Short name for log lines
    pub fn desc(self) -> &'static str {
        match self {
            ReqType::Invalidate => "INV",
            ReqType::Read => "READ",
            ReqType::Write => "WRITE",
        }
    }

    fn from_u8(raw: u8) -> Result<ReqType> {
        match raw {
            0 => Ok(ReqType::Invalidate),
            1 => Ok(ReqType::Read),
            2 => Ok(ReqType::Write),
            _ => Err(ERR_INVALID_ARGS),
        }
    }
}

/// A coherence request
///
/// `requester` is the node that will own the page once the transaction
/// completes; `msg_sender` is the node this hop actually received the frame
/// from (they differ on forwarded requests).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DsmRequest {
    pub req_type: ReqType,
    pub requester: NodeId,
    pub msg_sender: NodeId,
    pub gfn: Gfn,
    pub is_smm: bool,
    pub version: Version,
}

impl DsmRequest {
    /// Serialize into a fixed-width buffer
    pub fn encode_to(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= REQUEST_WIRE_SIZE);
        buf[0] = self.req_type as u8;
        buf[1..3].copy_from_slice(&self.requester.to_le_bytes());
        buf[3..5].copy_from_slice(&self.msg_sender.to_le_bytes());
        buf[5..13].copy_from_slice(&self.gfn.to_le_bytes());
        buf[13] = self.is_smm as u8;
        buf[14..18].copy_from_slice(&self.version.to_le_bytes());
    }

    /// Deserialize from a fixed-width buffer
    pub fn decode_from(buf: &[u8]) -> Result<DsmRequest> {
        if buf.len() < REQUEST_WIRE_SIZE {
            return Err(ERR_INVALID_ARGS);
        }
        Ok(DsmRequest {
            req_type: ReqType::from_u8(buf[0])?,
            requester: u16::from_le_bytes([buf[1], buf[2]]),
            msg_sender: u16::from_le_bytes([buf[3], buf[4]]),
            gfn: u64::from_le_bytes([
                buf[5], buf[6], buf[7], buf[8], buf[9], buf[10], buf[11], buf[12],
            ]),
            is_smm: buf[13] != 0,
            version: u32::from_le_bytes([buf[14], buf[15], buf[16], buf[17]]),
        })
    }
}

/// A coherence response
///
/// Carried as side-band on the response envelope rather than in the payload;
/// the payload is reserved for the page diff.
#[derive(Debug, Clone, Copy, Default)]
pub struct DsmResponse {
    /// Nodes the requester must invalidate (write transactions)
    pub inv_copyset: Copyset,

    /// Responder's page version
    pub version: Version,
}

impl DsmResponse {
    /// Create an empty response
    pub const fn new() -> Self {
        Self {
            inv_copyset: Copyset::new(),
            version: 0,
        }
    }
}

/// Transport envelope: transaction id plus response side-band
#[derive(Debug, Clone, Copy)]
pub struct TxAdd {
    pub txid: TxId,
    pub inv_copyset: Copyset,
    pub version: Version,
}

impl TxAdd {
    /// Create an envelope for a transaction
    pub const fn new(txid: TxId) -> Self {
        Self {
            txid,
            inv_copyset: Copyset::new(),
            version: 0,
        }
    }

    /// Serialize into a fixed-width buffer
    pub fn encode_to(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= TX_ADD_WIRE_SIZE);
        buf[0..4].copy_from_slice(&self.txid.to_le_bytes());
        self.inv_copyset.encode_to(&mut buf[4..4 + COPYSET_BYTES]);
        buf[4 + COPYSET_BYTES..8 + COPYSET_BYTES].copy_from_slice(&self.version.to_le_bytes());
    }

    /// Deserialize from a fixed-width buffer
    pub fn decode_from(buf: &[u8]) -> Result<TxAdd> {
        if buf.len() < TX_ADD_WIRE_SIZE {
            return Err(ERR_INVALID_ARGS);
        }
        Ok(TxAdd {
            txid: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            inv_copyset: Copyset::decode_from(&buf[4..4 + COPYSET_BYTES]),
            version: u32::from_le_bytes([
                buf[4 + COPYSET_BYTES],
                buf[5 + COPYSET_BYTES],
                buf[6 + COPYSET_BYTES],
                buf[7 + COPYSET_BYTES],
            ]),
        })
    }
}

impl Default for TxAdd {
    fn default() -> Self {
        Self::new(TXID_ANY)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_round_trip() {
        let req = DsmRequest {
            req_type: ReqType::Write,
            requester: 3,
            msg_sender: 7,
            gfn: 0x1234_5678_9ABC,
            is_smm: true,
            version: 41,
        };
        let mut buf = [0u8; REQUEST_WIRE_SIZE];
        req.encode_to(&mut buf);
        assert_eq!(DsmRequest::decode_from(&buf).unwrap(), req);
    }

    #[test]
    fn test_request_rejects_bad_type() {
        let mut buf = [0u8; REQUEST_WIRE_SIZE];
        buf[0] = 9;
        assert!(DsmRequest::decode_from(&buf).is_err());
    }

    #[test]
    fn test_request_rejects_short_buffer() {
        assert!(DsmRequest::decode_from(&[0u8; 5]).is_err());
    }

    #[test]
    fn test_tx_add_round_trip() {
        let mut tx = TxAdd::new(0xDEAD);
        tx.version = 12;
        tx.inv_copyset.add(0);
        tx.inv_copyset.add(100);

        let mut buf = [0u8; TX_ADD_WIRE_SIZE];
        tx.encode_to(&mut buf);
        let back = TxAdd::decode_from(&buf).unwrap();
        assert_eq!(back.txid, 0xDEAD);
        assert_eq!(back.version, 12);
        assert_eq!(back.inv_copyset, tx.inv_copyset);
    }

    #[test]
    fn test_req_type_desc() {
        assert_eq!(ReqType::Invalidate.desc(), "INV");
        assert_eq!(ReqType::Read.desc(), "READ");
        assert_eq!(ReqType::Write.desc(), "WRITE");
    }
}
