//! Typed request and response messages.
//!
//! The dispatch set is a closed enum: every frame decodes to exactly one
//! [`Request`] variant or fails. Responses are status-first; the caller
//! knows which [`ResponseKind`] its request elicits, mirroring how the
//! peer decodes them.

use crate::codec::{PayloadReader, PayloadWriter};
use crate::{OpType, StatusCode, WireError};
use bytes::Bytes;
use keyspace_common::{NodeInfo, VersionedValue};

/// A decoded request frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Put { key: String, value: Vec<u8> },
    Get { key: String },
    Delete { key: String },
    InternalPut { key: String, value: Vec<u8>, timestamp: u64, origin: String },
    InternalGet { key: String },
    InternalDelete { key: String, timestamp: u64 },
    ClusterInfo,
    Gossip { entries: Vec<NodeInfo> },
}

impl Request {
    pub fn encode(&self) -> Bytes {
        let mut w = PayloadWriter::new();
        match self {
            Request::Put { key, value } => {
                w.put_u8(OpType::Put as u8);
                w.put_str(key);
                w.put_bytes(value);
            }
            Request::Get { key } => {
                w.put_u8(OpType::Get as u8);
                w.put_str(key);
            }
            Request::Delete { key } => {
                w.put_u8(OpType::Delete as u8);
                w.put_str(key);
            }
            Request::InternalPut { key, value, timestamp, origin } => {
                w.put_u8(OpType::InternalPut as u8);
                w.put_str(key);
                w.put_bytes(value);
                w.put_u64(*timestamp);
                w.put_str(origin);
            }
            Request::InternalGet { key } => {
                w.put_u8(OpType::InternalGet as u8);
                w.put_str(key);
            }
            Request::InternalDelete { key, timestamp } => {
                w.put_u8(OpType::InternalDelete as u8);
                w.put_str(key);
                w.put_u64(*timestamp);
            }
            Request::ClusterInfo => {
                w.put_u8(OpType::ClusterInfo as u8);
            }
            Request::Gossip { entries } => {
                encode_gossip(&mut w, entries);
            }
        }
        w.freeze()
    }

    pub fn decode(payload: Bytes) -> Result<Self, WireError> {
        let mut r = PayloadReader::new(payload);
        let op_byte = r.get_u8().map_err(|_| WireError::Empty)?;
        let op = OpType::from_u8(op_byte).ok_or(WireError::UnknownOp(op_byte))?;

        let req = match op {
            OpType::Put => Request::Put {
                key: r.get_string()?,
                value: r.get_bytes()?,
            },
            OpType::Get => Request::Get { key: r.get_string()? },
            OpType::Delete => Request::Delete { key: r.get_string()? },
            OpType::InternalPut => Request::InternalPut {
                key: r.get_string()?,
                value: r.get_bytes()?,
                timestamp: r.get_u64()?,
                origin: r.get_string()?,
            },
            OpType::InternalGet => Request::InternalGet { key: r.get_string()? },
            OpType::InternalDelete => Request::InternalDelete {
                key: r.get_string()?,
                timestamp: r.get_u64()?,
            },
            OpType::ClusterInfo => Request::ClusterInfo,
            OpType::Gossip => Request::Gossip {
                entries: decode_gossip_entries(&mut r)?,
            },
        };
        Ok(req)
    }
}

/// One member row in a CLUSTER_INFO response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberStatus {
    pub node_id: String,
    pub host: String,
    pub port: u16,
    pub is_alive: bool,
}

/// What shape of response a given request expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    /// OK / NOT_FOUND / ERROR with no extra fields (PUT, DELETE, INTERNAL_*).
    Status,
    /// OK carries value, timestamp, origin (GET, INTERNAL_GET).
    Value,
    /// OK carries the member table and local store size.
    ClusterInfo,
    /// The reply is the peer's own gossip message.
    Gossip,
}

/// A decoded response frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ok,
    Value(VersionedValue),
    NotFound,
    Error(String),
    ClusterInfo { members: Vec<MemberStatus>, local_size: u64 },
    Gossip { entries: Vec<NodeInfo> },
}

impl Response {
    pub fn encode(&self) -> Bytes {
        let mut w = PayloadWriter::new();
        match self {
            Response::Ok => w.put_u8(StatusCode::Ok as u8),
            Response::Value(vv) => {
                w.put_u8(StatusCode::Ok as u8);
                w.put_bytes(&vv.value);
                w.put_u64(vv.timestamp);
                w.put_str(&vv.origin);
            }
            Response::NotFound => w.put_u8(StatusCode::NotFound as u8),
            Response::Error(msg) => {
                w.put_u8(StatusCode::Error as u8);
                w.put_str(msg);
            }
            Response::ClusterInfo { members, local_size } => {
                w.put_u8(StatusCode::Ok as u8);
                w.put_u32(members.len() as u32);
                for m in members {
                    w.put_str(&m.node_id);
                    w.put_str(&m.host);
                    w.put_u16(m.port);
                    w.put_bool(m.is_alive);
                }
                w.put_u64(*local_size);
            }
            // A gossip reply is itself a gossip message, opcode first.
            Response::Gossip { entries } => encode_gossip(&mut w, entries),
        }
        w.freeze()
    }

    pub fn decode(payload: Bytes, kind: ResponseKind) -> Result<Self, WireError> {
        let mut r = PayloadReader::new(payload);
        let first = r.get_u8().map_err(|_| WireError::Empty)?;

        if kind == ResponseKind::Gossip {
            if first != OpType::Gossip as u8 {
                return Err(WireError::UnknownOp(first));
            }
            return Ok(Response::Gossip {
                entries: decode_gossip_entries(&mut r)?,
            });
        }

        let status = StatusCode::from_u8(first).ok_or(WireError::UnknownStatus(first))?;
        let resp = match (status, kind) {
            (StatusCode::NotFound, _) => Response::NotFound,
            (StatusCode::Error, _) => Response::Error(r.get_string()?),
            (StatusCode::Ok, ResponseKind::Status) => Response::Ok,
            (StatusCode::Ok, ResponseKind::Value) => Response::Value(VersionedValue {
                value: r.get_bytes()?,
                timestamp: r.get_u64()?,
                origin: r.get_string()?,
            }),
            (StatusCode::Ok, ResponseKind::ClusterInfo) => {
                let count = r.get_u32()?;
                let mut members = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    members.push(MemberStatus {
                        node_id: r.get_string()?,
                        host: r.get_string()?,
                        port: r.get_u16()?,
                        is_alive: r.get_bool()?,
                    });
                }
                Response::ClusterInfo {
                    members,
                    local_size: r.get_u64()?,
                }
            }
            (StatusCode::Ok, ResponseKind::Gossip) => unreachable!("handled above"),
        };
        Ok(resp)
    }
}

fn encode_gossip(w: &mut PayloadWriter, entries: &[NodeInfo]) {
    w.put_u8(OpType::Gossip as u8);
    w.put_u32(entries.len() as u32);
    for e in entries {
        w.put_str(&e.node_id);
        w.put_str(&e.host);
        w.put_u16(e.port);
        w.put_u64(e.last_heartbeat);
        w.put_bool(e.is_alive);
    }
}

fn decode_gossip_entries(r: &mut PayloadReader) -> Result<Vec<NodeInfo>, WireError> {
    let count = r.get_u32()?;
    let mut entries = Vec::with_capacity(count.min(1024) as usize);
    for _ in 0..count {
        entries.push(NodeInfo {
            node_id: r.get_string()?,
            host: r.get_string()?,
            port: r.get_u16()?,
            last_heartbeat: r.get_u64()?,
            is_alive: r.get_bool()?,
        });
    }
    Ok(entries)
}
