//! Push/pull anti-entropy: length-prefixed stream frames carrying either
//! a full member-list exchange or a single protocol message (stream
//! pings). Frames pass through the dispatcher's stream envelope stack,
//! so push/pull traffic honours the cluster label, encryption, and
//! compression settings.

use std::time::Duration;

use bytes::Bytes;

use crate::dispatch::Dispatcher;
use crate::error::Error;
use crate::proto::codec::{decode_push_pull, encode_push_pull};
use crate::proto::{Message, MessageType, PushNodeState, PushPullHeader, decode_message};
use crate::transport::Conn;

/// Length prefix bytes on every stream frame.
const FRAME_HEADER_LEN: usize = 4;

/// Upper bound on a single stream frame; larger remote states are
/// hostile or misconfigured.
pub const MAX_STREAM_FRAME: usize = 10 * 1024 * 1024;

/// One decoded inbound stream frame.
#[derive(Debug)]
pub enum StreamFrame {
    PushPull {
        header: PushPullHeader,
        states: Vec<PushNodeState>,
        user_state: Bytes,
    },
    Message(Message),
}

/// Write a sealed, length-prefixed frame.
fn write_frame(conn: &mut dyn Conn, payload: &[u8]) -> Result<(), Error> {
    let len = u32::try_from(payload.len())
        .map_err(|_| Error::Protocol(format!("stream frame too large: {}", payload.len())))?;
    conn.write_all(&len.to_be_bytes())?;
    conn.write_all(payload)?;
    conn.flush()?;
    Ok(())
}

/// Read one length-prefixed frame.
fn read_frame(conn: &mut dyn Conn) -> Result<Vec<u8>, Error> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    conn.read_exact(&mut header)?;
    let len = u32::from_be_bytes(header) as usize;
    if len == 0 || len > MAX_STREAM_FRAME {
        return Err(Error::Protocol(format!("invalid stream frame length {len}")));
    }
    let mut payload = vec![0u8; len];
    conn.read_exact(&mut payload)?;
    Ok(payload)
}

/// Send the local member list and user state.
pub fn write_push_pull(
    conn: &mut dyn Conn,
    dispatcher: &Dispatcher,
    states: &[PushNodeState],
    user_state: &[u8],
    join: bool,
    compress: bool,
) -> Result<(), Error> {
    let header = PushPullHeader {
        nodes: states.len() as u32,
        user_state_len: user_state.len() as u32,
        join,
    };
    let mut payload = encode_push_pull(&header, states)?;
    payload.extend_from_slice(user_state);
    let sealed = dispatcher
        .seal_stream(payload, compress)
        .map_err(dispatch_to_error)?;
    write_frame(conn, &sealed)
}

/// Send a single protocol message over a stream (stream pings and acks).
pub fn write_stream_message(
    conn: &mut dyn Conn,
    dispatcher: &Dispatcher,
    msg: &Message,
) -> Result<(), Error> {
    let encoded = crate::proto::encode_message(msg)?;
    let sealed = dispatcher
        .seal_stream(encoded, false)
        .map_err(dispatch_to_error)?;
    write_frame(conn, &sealed)
}

/// Read and decode the next inbound stream frame.
pub fn read_stream_frame(
    conn: &mut dyn Conn,
    dispatcher: &Dispatcher,
) -> Result<StreamFrame, Error> {
    let frame = read_frame(conn)?;
    let raw = dispatcher.open_stream(&frame).map_err(dispatch_to_error)?;
    let (&tag, body) = raw.split_first().ok_or(Error::Truncated)?;

    if tag == MessageType::PushPull.as_u8() {
        let (header, states, user_state) = decode_push_pull(body)?;
        return Ok(StreamFrame::PushPull {
            header,
            states,
            user_state,
        });
    }
    Ok(StreamFrame::Message(decode_message(&raw)?))
}

/// Read a frame and require a push/pull exchange.
pub fn read_push_pull(
    conn: &mut dyn Conn,
    dispatcher: &Dispatcher,
) -> Result<(PushPullHeader, Vec<PushNodeState>, Bytes), Error> {
    match read_stream_frame(conn, dispatcher)? {
        StreamFrame::PushPull {
            header,
            states,
            user_state,
        } => Ok((header, states, user_state)),
        StreamFrame::Message(Message::Err(resp)) => {
            Err(Error::Protocol(format!("remote error: {}", resp.error)))
        }
        StreamFrame::Message(msg) => Err(Error::Protocol(format!(
            "expected push/pull frame, got {:?}",
            msg.message_type()
        ))),
    }
}

/// Apply per-operation deadlines for a blocking exchange.
pub fn set_deadlines(conn: &dyn Conn, timeout: Duration) -> Result<(), Error> {
    conn.set_read_timeout(Some(timeout))?;
    conn.set_write_timeout(Some(timeout))?;
    Ok(())
}

fn dispatch_to_error(err: crate::dispatch::DispatchError) -> Error {
    use crate::dispatch::DispatchError;
    match err {
        DispatchError::Truncated => Error::Truncated,
        DispatchError::ChecksumMismatch => Error::ChecksumMismatch,
        DispatchError::LabelMismatch { got, want } => Error::LabelMismatch { got, want },
        DispatchError::NoKeyring | DispatchError::PlaintextRejected | DispatchError::Decrypt(_) => {
            Error::DecryptFailed
        }
        DispatchError::Codec(err) => err.into(),
        other => Error::Protocol(other.to_string()),
    }
}
