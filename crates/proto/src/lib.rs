//! keyspace-proto: the binary wire protocol.
//!
//! Every message on a TCP link is `[4-byte big-endian length][payload]`.
//! A request payload begins with a 1-byte [`OpType`]; a response payload
//! begins with a 1-byte [`StatusCode`] (except GOSSIP, whose reply is
//! itself a gossip message). Multi-byte integers are big-endian, strings
//! and byte strings are `[4-byte length][bytes]`, booleans one byte.

pub mod codec;
pub mod frame;
pub mod message;

pub use codec::{PayloadReader, PayloadWriter};
pub use frame::{read_frame, write_frame, MAX_FRAME_SIZE};
pub use message::{MemberStatus, Request, Response, ResponseKind};

use thiserror::Error;

/// Operation selector: the first byte of every request payload.
///
/// Wire numbers are fixed; gaps are reserved for operations this build
/// does not ship (cluster administration, key transfer).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpType {
    // Client operations
    Put = 1,
    Get = 2,
    Delete = 3,

    // Internal (inter-node) replication
    InternalPut = 10,
    InternalGet = 11,
    InternalDelete = 12,

    // Cluster introspection
    ClusterInfo = 22,

    // Gossip protocol
    Gossip = 40,
}

impl OpType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Put),
            2 => Some(Self::Get),
            3 => Some(Self::Delete),
            10 => Some(Self::InternalPut),
            11 => Some(Self::InternalGet),
            12 => Some(Self::InternalDelete),
            22 => Some(Self::ClusterInfo),
            40 => Some(Self::Gossip),
            _ => None,
        }
    }
}

/// Response status: the first byte of every response payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StatusCode {
    Ok = 0,
    NotFound = 1,
    Error = 2,
}

impl StatusCode {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Ok),
            1 => Some(Self::NotFound),
            2 => Some(Self::Error),
            _ => None,
        }
    }
}

/// Errors produced while framing or (de)serializing payloads.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame of {0} bytes exceeds the 64 MiB cap")]
    FrameTooLarge(u32),
    #[error("payload underflow: needed {needed} more byte(s)")]
    Underflow { needed: usize },
    #[error("string field is not valid UTF-8")]
    BadString,
    #[error("unknown opcode {0}")]
    UnknownOp(u8),
    #[error("unknown status code {0}")]
    UnknownStatus(u8),
    #[error("empty payload")]
    Empty,
}
