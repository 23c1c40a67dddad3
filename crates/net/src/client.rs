//! A small blocking client for the admin CLI and test tooling.
//!
//! Holds one connection open; requests on it are answered in order.

use keyspace_common::VersionedValue;
use keyspace_proto::{MemberStatus, Request, Response, ResponseKind, WireError, MAX_FRAME_SIZE};
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol error: {0}")]
    Wire(#[from] WireError),
    #[error("server error: {0}")]
    Server(String),
    #[error("no such address: {0}")]
    BadAddress(String),
}

/// Blocking wire-protocol client.
#[derive(Debug)]
pub struct KvClient {
    stream: TcpStream,
}

impl KvClient {
    /// Connect to `host:port` with a connect timeout.
    pub fn connect(addr: &str, timeout: Duration) -> Result<Self, ClientError> {
        let resolved = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| ClientError::BadAddress(addr.to_string()))?;
        let stream = TcpStream::connect_timeout(&resolved, timeout)?;
        Ok(Self { stream })
    }

    pub fn put(&mut self, key: &str, value: &[u8]) -> Result<(), ClientError> {
        let request = Request::Put {
            key: key.to_string(),
            value: value.to_vec(),
        };
        match self.call(request, ResponseKind::Status)? {
            Response::Ok => Ok(()),
            Response::Error(msg) => Err(ClientError::Server(msg)),
            other => Err(ClientError::Server(format!("unexpected response: {other:?}"))),
        }
    }

    pub fn get(&mut self, key: &str) -> Result<Option<VersionedValue>, ClientError> {
        let request = Request::Get { key: key.to_string() };
        match self.call(request, ResponseKind::Value)? {
            Response::Value(vv) => Ok(Some(vv)),
            Response::NotFound => Ok(None),
            Response::Error(msg) => Err(ClientError::Server(msg)),
            other => Err(ClientError::Server(format!("unexpected response: {other:?}"))),
        }
    }

    pub fn delete(&mut self, key: &str) -> Result<(), ClientError> {
        let request = Request::Delete { key: key.to_string() };
        match self.call(request, ResponseKind::Status)? {
            Response::Ok => Ok(()),
            Response::Error(msg) => Err(ClientError::Server(msg)),
            other => Err(ClientError::Server(format!("unexpected response: {other:?}"))),
        }
    }

    /// Member table plus the remote node's local store size.
    pub fn cluster_info(&mut self) -> Result<(Vec<MemberStatus>, u64), ClientError> {
        match self.call(Request::ClusterInfo, ResponseKind::ClusterInfo)? {
            Response::ClusterInfo { members, local_size } => Ok((members, local_size)),
            Response::Error(msg) => Err(ClientError::Server(msg)),
            other => Err(ClientError::Server(format!("unexpected response: {other:?}"))),
        }
    }

    fn call(&mut self, request: Request, kind: ResponseKind) -> Result<Response, ClientError> {
        let payload = request.encode();
        self.stream
            .write_all(&(payload.len() as u32).to_be_bytes())?;
        self.stream.write_all(&payload)?;
        self.stream.flush()?;

        let mut len_buf = [0u8; 4];
        self.stream.read_exact(&mut len_buf)?;
        let len = u32::from_be_bytes(len_buf);
        if len > MAX_FRAME_SIZE {
            return Err(ClientError::Wire(WireError::FrameTooLarge(len)));
        }
        let mut frame = vec![0u8; len as usize];
        self.stream.read_exact(&mut frame)?;

        Ok(Response::decode(frame.into(), kind)?)
    }
}
