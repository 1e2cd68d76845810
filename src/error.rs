//! Error types for the store and dnstap ingest paths.

use hickory_proto::op::ResponseCode;
use std::io;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("store is closed")]
    Closed,

    #[error("store writer thread panicked")]
    WriterPanicked,
}

/// Faults that end a single dnstap connection.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("framing error: {0}")]
    Framing(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("frame of {size} bytes exceeds limit of {limit} bytes")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("no frame received for {0:?}")]
    IdleTimeout(Duration),
}

impl IngestError {
    pub fn framing(msg: impl Into<String>) -> Self {
        IngestError::Framing(msg.into())
    }

    pub fn handshake(msg: impl Into<String>) -> Self {
        IngestError::Handshake(msg.into())
    }
}

/// Reasons a well-framed dnstap record is dropped without closing the connection.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("protobuf decode failed: {0}")]
    Protobuf(#[from] prost::DecodeError),

    #[error("dns message decode failed: {0}")]
    Dns(#[from] hickory_proto::error::ProtoError),

    #[error("dnstap frame carries no message")]
    NoMessage,

    #[error("dnstap message type {0:?} is not a response")]
    NotResponse(Option<i32>),

    #[error("dnstap message has no response payload")]
    NoResponseMessage,

    #[error("dns message is a query")]
    Query,

    #[error("dns response code {0}")]
    ResponseCode(ResponseCode),

    #[error("dns message has no usable question")]
    NoQuestion,
}

#[derive(Debug, Error)]
#[error("invalid listen address '{0}': expected host:port or a unix socket path")]
pub struct ListenAddrError(pub String);
