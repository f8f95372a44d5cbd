// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Common type aliases and status codes used throughout the DSM engine

/// Guest frame number: index of a page in a VM's physical address space
pub type Gfn = u64;

/// Host-side frame key: index into per-page DSM records
pub type Vfn = u64;

/// DSM instance (node) identifier
pub type NodeId = u16;

/// Page version number
pub type Version = u32;

/// Transaction identifier carried on the wire envelope
pub type TxId = u32;

/// Error code type (negative values indicate errors)
pub type Status = i32;

/// Result type for DSM operations
pub type Result<T = ()> = core::result::Result<T, Status>;

/// Compile-time cap on the number of DSM instances in a cluster
pub const DSM_MAX_INSTANCES: usize = 256;

/// Guest page size in bytes
pub const PAGE_SIZE: usize = 4096;

/// Common status codes
pub mod status {
    use super::Status;

    pub const OK: Status = 0;
    pub const ERR: Status = -1;
    pub const ERR_INVALID_ARGS: Status = -2;
    pub const ERR_BAD_HANDLE: Status = -3;
    pub const ERR_BAD_STATE: Status = -4;
    pub const ERR_NOT_SUPPORTED: Status = -5;
    pub const ERR_NO_MEMORY: Status = -6;
    pub const ERR_TIMED_OUT: Status = -7;
    pub const ERR_NOT_FOUND: Status = -8;
    pub const ERR_ALREADY_EXISTS: Status = -9;
    pub const ERR_ACCESS_DENIED: Status = -10;
    pub const ERR_IO: Status = -11;
    pub const ERR_INTERNAL: Status = -12;
    pub const ERR_NEXT: Status = -13;
    pub const ERR_STOP: Status = -14;
    pub const ERR_NO_RESOURCES: Status = -15;
    pub const ERR_NOT_ENOUGH_BUFFER: Status = -16;
    pub const ERR_OUT_OF_RANGE: Status = -17;

    /// DSM-specific codes
    pub const ERR_SHOULD_WAIT: Status = -18;
    pub const ERR_NOT_CONNECTED: Status = -19;
    pub const ERR_PEER_CLOSED: Status = -20;
}

/// Common error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    Ok = 0,
    Err = -1,
    InvalidArgs = -2,
    BadHandle = -3,
    BadState = -4,
    NotSupported = -5,
    NoMemory = -6,
    TimedOut = -7,
    NotFound = -8,
    AlreadyExists = -9,
    AccessDenied = -10,
    Io = -11,
    Internal = -12,
    Next = -13,
    Stopped = -14,
    NoResources = -15,
    NotEnoughBuffer = -16,
    OutOfRange = -17,
    ShouldWait = -18,
    NotConnected = -19,
    PeerClosed = -20,
}

impl Error {
    /// Convert error to status code
    pub fn to_status(self) -> Status {
        self as Status
    }

    /// Convert status code to error
    pub fn from_status(status: Status) -> Self {
        match status {
            0 => Error::Ok,
            -1 => Error::Err,
            -2 => Error::InvalidArgs,
            -3 => Error::BadHandle,
            -4 => Error::BadState,
            -5 => Error::NotSupported,
            -6 => Error::NoMemory,
            -7 => Error::TimedOut,
            -8 => Error::NotFound,
            -9 => Error::AlreadyExists,
            -10 => Error::AccessDenied,
            -11 => Error::Io,
            -12 => Error::Internal,
            -13 => Error::Next,
            -14 => Error::Stopped,
            -15 => Error::NoResources,
            -16 => Error::NotEnoughBuffer,
            -17 => Error::OutOfRange,
            -18 => Error::ShouldWait,
            -19 => Error::NotConnected,
            -20 => Error::PeerClosed,
            _ => Error::Internal,
        }
    }
}

impl From<Status> for Error {
    fn from(status: Status) -> Self {
        Self::from_status(status)
    }
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        err.to_status()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for code in [
            status::OK,
            status::ERR_NO_MEMORY,
            status::ERR_STOP,
            status::ERR_SHOULD_WAIT,
            status::ERR_NOT_CONNECTED,
            status::ERR_PEER_CLOSED,
        ] {
            assert_eq!(Error::from_status(code).to_status(), code);
        }
    }

    #[test]
    fn test_unknown_status_maps_to_internal() {
        assert_eq!(Error::from_status(-999), Error::Internal);
    }
}
