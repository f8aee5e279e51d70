//! Crate-level error type.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use crate::proto::{CodecError, CryptoError, EnvelopeError};

#[derive(Debug, Error)]
pub enum Error {
    #[error("transport: {0}")]
    Transport(#[from] std::io::Error),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid checksum")]
    ChecksumMismatch,

    #[error("no installed keys could decrypt the message")]
    DecryptFailed,

    #[error("packet label mismatch: got {got:?}, want {want:?}")]
    LabelMismatch { got: String, want: String },

    #[error("message truncated")]
    Truncated,

    #[error("unknown message type {0}")]
    UnknownMessage(u8),

    #[error("ping for wrong node: got {got:?}, want {want:?}")]
    WrongNode { got: String, want: String },

    #[error("sequence number mismatch: got {got}, want {want}")]
    SequenceMismatch { got: u32, want: u32 },

    #[error("engine is shut down")]
    Shutdown,

    #[error("join failed: {}", format_join_attempts(.attempts))]
    JoinFailed { attempts: Vec<(SocketAddr, String)> },

    #[error(
        "incompatible protocol version: peer {peer} speaks [{peer_min}, {peer_max}], we are at {local}"
    )]
    VersionIncompatible {
        peer: String,
        peer_min: u8,
        peer_max: u8,
        local: u8,
    },

    #[error("protocol: {0}")]
    Protocol(String),
}

fn format_join_attempts(attempts: &[(SocketAddr, String)]) -> String {
    if attempts.is_empty() {
        return "no peers to contact".to_string();
    }
    attempts
        .iter()
        .map(|(addr, reason)| format!("{addr}: {reason}"))
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<CodecError> for Error {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Truncated => Error::Truncated,
            CodecError::UnknownType(tag) => Error::UnknownMessage(tag),
            other => Error::Protocol(other.to_string()),
        }
    }
}

impl From<EnvelopeError> for Error {
    fn from(err: EnvelopeError) -> Self {
        match err {
            EnvelopeError::Truncated => Error::Truncated,
            EnvelopeError::ChecksumMismatch { .. } => Error::ChecksumMismatch,
            other => Error::Protocol(other.to_string()),
        }
    }
}

impl From<CryptoError> for Error {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::Truncated => Error::Truncated,
            _ => Error::DecryptFailed,
        }
    }
}
