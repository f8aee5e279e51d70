//! Message body encoding: self-describing CBOR maps keyed by field name.
//!
//! Every body is a definite-length map of string keys. Decoders tolerate
//! unknown keys so that newer peers can extend bodies without breaking
//! older ones; missing required keys are an error.

use std::convert::Infallible;

use bytes::Bytes;
use minicbor::data::Type;
use minicbor::{Decoder, Encoder};
use thiserror::Error;

use super::{
    Ack, Alive, Dead, ErrorResp, IndirectPingReq, Message, MessageType, Nack, PeerState, Ping,
    PushNodeState, PushPullHeader, Suspect, VersionVector,
};

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("message truncated")]
    Truncated,
    #[error("unknown message type {0}")]
    UnknownType(u8),
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
    #[error("trailing bytes after message body")]
    TrailingBytes,
    #[error("cbor encode: {0}")]
    Encode(#[from] minicbor::encode::Error<Infallible>),
    #[error("cbor decode: {0}")]
    Decode(#[from] minicbor::decode::Error),
}

/// Encode a message as its one-byte tag followed by the CBOR body.
pub fn encode_message(msg: &Message) -> Result<Vec<u8>, CodecError> {
    let mut buf = vec![msg.message_type().as_u8()];
    if let Message::User(payload) = msg {
        buf.extend_from_slice(payload);
        return Ok(buf);
    }
    let mut enc = Encoder::new(&mut buf);
    match msg {
        Message::Ping(body) => encode_ping(&mut enc, body)?,
        Message::IndirectPing(body) => encode_indirect_ping(&mut enc, body)?,
        Message::Ack(body) => encode_ack(&mut enc, body)?,
        Message::Nack(body) => encode_nack(&mut enc, body)?,
        Message::Suspect(body) => {
            encode_state_claim(&mut enc, body.incarnation, &body.node, &body.from)?
        }
        Message::Alive(body) => encode_alive(&mut enc, body)?,
        Message::Dead(body) => {
            encode_state_claim(&mut enc, body.incarnation, &body.node, &body.from)?
        }
        Message::Err(body) => encode_error_resp(&mut enc, body)?,
        Message::User(_) => unreachable!("handled above"),
    }
    Ok(buf)
}

/// Decode a tag-prefixed message body. Envelope tags (compound, crc,
/// label, compress, encrypt) are not accepted here; the dispatcher peels
/// those before decoding.
pub fn decode_message(buf: &[u8]) -> Result<Message, CodecError> {
    let (&tag, body) = buf.split_first().ok_or(CodecError::Truncated)?;
    let message_type = MessageType::from_u8(tag).ok_or(CodecError::UnknownType(tag))?;

    if message_type == MessageType::User {
        return Ok(Message::User(Bytes::copy_from_slice(body)));
    }

    let mut dec = Decoder::new(body);
    let message = match message_type {
        MessageType::Ping => Message::Ping(decode_ping(&mut dec)?),
        MessageType::IndirectPing => Message::IndirectPing(decode_indirect_ping(&mut dec)?),
        MessageType::Ack => Message::Ack(decode_ack(&mut dec)?),
        MessageType::Nack => Message::Nack(decode_nack(&mut dec)?),
        MessageType::Suspect => {
            let (incarnation, node, from) = decode_state_claim(&mut dec)?;
            Message::Suspect(Suspect {
                incarnation,
                node,
                from,
            })
        }
        MessageType::Alive => Message::Alive(decode_alive(&mut dec)?),
        MessageType::Dead => {
            let (incarnation, node, from) = decode_state_claim(&mut dec)?;
            Message::Dead(Dead {
                incarnation,
                node,
                from,
            })
        }
        MessageType::Err => Message::Err(decode_error_resp(&mut dec)?),
        other => return Err(CodecError::UnknownType(other.as_u8())),
    };

    if dec.datatype().is_ok() {
        return Err(CodecError::TrailingBytes);
    }
    Ok(message)
}

fn encode_ping(enc: &mut Encoder<&mut Vec<u8>>, ping: &Ping) -> Result<(), CodecError> {
    let len: u64 = if ping.node.is_some() { 5 } else { 4 };
    enc.map(len)?;
    enc.str("SeqNo")?;
    enc.u32(ping.seq_no)?;
    if let Some(node) = &ping.node {
        enc.str("Node")?;
        enc.str(node)?;
    }
    enc.str("SourceAddr")?;
    enc.bytes(&ping.source_addr)?;
    enc.str("SourcePort")?;
    enc.u16(ping.source_port)?;
    enc.str("SourceNode")?;
    enc.str(&ping.source_node)?;
    Ok(())
}

fn decode_ping(dec: &mut Decoder) -> Result<Ping, CodecError> {
    let map_len = decode_map_len(dec)?;
    let mut seq_no = None;
    let mut node = None;
    let mut source_addr = None;
    let mut source_port = None;
    let mut source_node = None;

    for _ in 0..map_len {
        match dec.str()? {
            "SeqNo" => seq_no = Some(dec.u32()?),
            "Node" => node = Some(dec.str()?.to_string()),
            "SourceAddr" => source_addr = Some(Bytes::copy_from_slice(dec.bytes()?)),
            "SourcePort" => source_port = Some(dec.u16()?),
            "SourceNode" => source_node = Some(dec.str()?.to_string()),
            _ => dec.skip()?,
        }
    }

    Ok(Ping {
        seq_no: seq_no.ok_or(CodecError::MissingField("SeqNo"))?,
        node,
        source_addr: source_addr.unwrap_or_default(),
        source_port: source_port.unwrap_or_default(),
        source_node: source_node.unwrap_or_default(),
    })
}

fn encode_indirect_ping(
    enc: &mut Encoder<&mut Vec<u8>>,
    req: &IndirectPingReq,
) -> Result<(), CodecError> {
    enc.map(8)?;
    enc.str("SeqNo")?;
    enc.u32(req.seq_no)?;
    enc.str("Target")?;
    enc.bytes(&req.target)?;
    enc.str("Port")?;
    enc.u16(req.port)?;
    enc.str("Node")?;
    enc.str(&req.node)?;
    enc.str("Nack")?;
    enc.bool(req.nack)?;
    enc.str("SourceAddr")?;
    enc.bytes(&req.source_addr)?;
    enc.str("SourcePort")?;
    enc.u16(req.source_port)?;
    enc.str("SourceNode")?;
    enc.str(&req.source_node)?;
    Ok(())
}

fn decode_indirect_ping(dec: &mut Decoder) -> Result<IndirectPingReq, CodecError> {
    let map_len = decode_map_len(dec)?;
    let mut seq_no = None;
    let mut target = None;
    let mut port = None;
    let mut node = None;
    let mut nack = None;
    let mut source_addr = None;
    let mut source_port = None;
    let mut source_node = None;

    for _ in 0..map_len {
        match dec.str()? {
            "SeqNo" => seq_no = Some(dec.u32()?),
            "Target" => target = Some(Bytes::copy_from_slice(dec.bytes()?)),
            "Port" => port = Some(dec.u16()?),
            "Node" => node = Some(dec.str()?.to_string()),
            "Nack" => nack = Some(dec.bool()?),
            "SourceAddr" => source_addr = Some(Bytes::copy_from_slice(dec.bytes()?)),
            "SourcePort" => source_port = Some(dec.u16()?),
            "SourceNode" => source_node = Some(dec.str()?.to_string()),
            _ => dec.skip()?,
        }
    }

    Ok(IndirectPingReq {
        seq_no: seq_no.ok_or(CodecError::MissingField("SeqNo"))?,
        target: target.ok_or(CodecError::MissingField("Target"))?,
        port: port.ok_or(CodecError::MissingField("Port"))?,
        node: node.ok_or(CodecError::MissingField("Node"))?,
        nack: nack.unwrap_or(false),
        source_addr: source_addr.unwrap_or_default(),
        source_port: source_port.unwrap_or_default(),
        source_node: source_node.unwrap_or_default(),
    })
}

fn encode_ack(enc: &mut Encoder<&mut Vec<u8>>, ack: &Ack) -> Result<(), CodecError> {
    enc.map(2)?;
    enc.str("SeqNo")?;
    enc.u32(ack.seq_no)?;
    enc.str("Payload")?;
    enc.bytes(&ack.payload)?;
    Ok(())
}

fn decode_ack(dec: &mut Decoder) -> Result<Ack, CodecError> {
    let map_len = decode_map_len(dec)?;
    let mut seq_no = None;
    let mut payload = None;

    for _ in 0..map_len {
        match dec.str()? {
            "SeqNo" => seq_no = Some(dec.u32()?),
            "Payload" => payload = Some(Bytes::copy_from_slice(dec.bytes()?)),
            _ => dec.skip()?,
        }
    }

    Ok(Ack {
        seq_no: seq_no.ok_or(CodecError::MissingField("SeqNo"))?,
        payload: payload.unwrap_or_default(),
    })
}

fn encode_nack(enc: &mut Encoder<&mut Vec<u8>>, nack: &Nack) -> Result<(), CodecError> {
    enc.map(1)?;
    enc.str("SeqNo")?;
    enc.u32(nack.seq_no)?;
    Ok(())
}

fn decode_nack(dec: &mut Decoder) -> Result<Nack, CodecError> {
    let map_len = decode_map_len(dec)?;
    let mut seq_no = None;
    for _ in 0..map_len {
        match dec.str()? {
            "SeqNo" => seq_no = Some(dec.u32()?),
            _ => dec.skip()?,
        }
    }
    Ok(Nack {
        seq_no: seq_no.ok_or(CodecError::MissingField("SeqNo"))?,
    })
}

// Suspect and dead claims share a body shape.
fn encode_state_claim(
    enc: &mut Encoder<&mut Vec<u8>>,
    incarnation: u64,
    node: &str,
    from: &str,
) -> Result<(), CodecError> {
    enc.map(3)?;
    enc.str("Incarnation")?;
    enc.u64(incarnation)?;
    enc.str("Node")?;
    enc.str(node)?;
    enc.str("From")?;
    enc.str(from)?;
    Ok(())
}

fn decode_state_claim(dec: &mut Decoder) -> Result<(u64, String, String), CodecError> {
    let map_len = decode_map_len(dec)?;
    let mut incarnation = None;
    let mut node = None;
    let mut from = None;

    for _ in 0..map_len {
        match dec.str()? {
            "Incarnation" => incarnation = Some(dec.u64()?),
            "Node" => node = Some(dec.str()?.to_string()),
            "From" => from = Some(dec.str()?.to_string()),
            _ => dec.skip()?,
        }
    }

    Ok((
        incarnation.ok_or(CodecError::MissingField("Incarnation"))?,
        node.ok_or(CodecError::MissingField("Node"))?,
        from.ok_or(CodecError::MissingField("From"))?,
    ))
}

fn encode_alive(enc: &mut Encoder<&mut Vec<u8>>, alive: &Alive) -> Result<(), CodecError> {
    enc.map(6)?;
    enc.str("Incarnation")?;
    enc.u64(alive.incarnation)?;
    enc.str("Node")?;
    enc.str(&alive.node)?;
    enc.str("Addr")?;
    enc.bytes(&alive.addr)?;
    enc.str("Port")?;
    enc.u16(alive.port)?;
    enc.str("Meta")?;
    enc.bytes(&alive.meta)?;
    enc.str("Vsn")?;
    encode_vsn(enc, alive.vsn)?;
    Ok(())
}

fn decode_alive(dec: &mut Decoder) -> Result<Alive, CodecError> {
    let map_len = decode_map_len(dec)?;
    let mut incarnation = None;
    let mut node = None;
    let mut addr = None;
    let mut port = None;
    let mut meta = None;
    let mut vsn = None;

    for _ in 0..map_len {
        match dec.str()? {
            "Incarnation" => incarnation = Some(dec.u64()?),
            "Node" => node = Some(dec.str()?.to_string()),
            "Addr" => addr = Some(Bytes::copy_from_slice(dec.bytes()?)),
            "Port" => port = Some(dec.u16()?),
            "Meta" => meta = Some(Bytes::copy_from_slice(dec.bytes()?)),
            "Vsn" => vsn = Some(decode_vsn(dec)?),
            _ => dec.skip()?,
        }
    }

    Ok(Alive {
        incarnation: incarnation.ok_or(CodecError::MissingField("Incarnation"))?,
        node: node.ok_or(CodecError::MissingField("Node"))?,
        addr: addr.ok_or(CodecError::MissingField("Addr"))?,
        port: port.ok_or(CodecError::MissingField("Port"))?,
        meta: meta.unwrap_or_default(),
        vsn: vsn.ok_or(CodecError::MissingField("Vsn"))?,
    })
}

fn encode_error_resp(enc: &mut Encoder<&mut Vec<u8>>, resp: &ErrorResp) -> Result<(), CodecError> {
    enc.map(1)?;
    enc.str("Error")?;
    enc.str(&resp.error)?;
    Ok(())
}

fn decode_error_resp(dec: &mut Decoder) -> Result<ErrorResp, CodecError> {
    let map_len = decode_map_len(dec)?;
    let mut error = None;
    for _ in 0..map_len {
        match dec.str()? {
            "Error" => error = Some(dec.str()?.to_string()),
            _ => dec.skip()?,
        }
    }
    Ok(ErrorResp {
        error: error.ok_or(CodecError::MissingField("Error"))?,
    })
}

/// Encode the push/pull stream preamble: tag, header map, then the node
/// state records. The opaque user state is appended verbatim by the caller.
pub fn encode_push_pull(
    header: &PushPullHeader,
    states: &[PushNodeState],
) -> Result<Vec<u8>, CodecError> {
    let mut buf = vec![MessageType::PushPull.as_u8()];
    let mut enc = Encoder::new(&mut buf);
    encode_push_pull_header(&mut enc, header)?;
    for state in states {
        encode_push_node_state(&mut enc, state)?;
    }
    Ok(buf)
}

/// Decode a push/pull payload (without the leading tag byte): header, node
/// states, then `user_state_len` trailing bytes of opaque user state.
pub fn decode_push_pull(
    buf: &[u8],
) -> Result<(PushPullHeader, Vec<PushNodeState>, Bytes), CodecError> {
    let mut dec = Decoder::new(buf);
    let header = decode_push_pull_header(&mut dec)?;
    let mut states = Vec::with_capacity(header.nodes as usize);
    for _ in 0..header.nodes {
        states.push(decode_push_node_state(&mut dec)?);
    }
    let rest = &buf[dec.position()..];
    if rest.len() < header.user_state_len as usize {
        return Err(CodecError::Truncated);
    }
    let user_state = Bytes::copy_from_slice(&rest[..header.user_state_len as usize]);
    Ok((header, states, user_state))
}

fn encode_push_pull_header(
    enc: &mut Encoder<&mut Vec<u8>>,
    header: &PushPullHeader,
) -> Result<(), CodecError> {
    enc.map(3)?;
    enc.str("Nodes")?;
    enc.u32(header.nodes)?;
    enc.str("UserStateLen")?;
    enc.u32(header.user_state_len)?;
    enc.str("Join")?;
    enc.bool(header.join)?;
    Ok(())
}

fn decode_push_pull_header(dec: &mut Decoder) -> Result<PushPullHeader, CodecError> {
    let map_len = decode_map_len(dec)?;
    let mut nodes = None;
    let mut user_state_len = None;
    let mut join = None;

    for _ in 0..map_len {
        match dec.str()? {
            "Nodes" => nodes = Some(dec.u32()?),
            "UserStateLen" => user_state_len = Some(dec.u32()?),
            "Join" => join = Some(dec.bool()?),
            _ => dec.skip()?,
        }
    }

    Ok(PushPullHeader {
        nodes: nodes.ok_or(CodecError::MissingField("Nodes"))?,
        user_state_len: user_state_len.unwrap_or(0),
        join: join.unwrap_or(false),
    })
}

fn encode_push_node_state(
    enc: &mut Encoder<&mut Vec<u8>>,
    state: &PushNodeState,
) -> Result<(), CodecError> {
    enc.map(7)?;
    enc.str("Name")?;
    enc.str(&state.name)?;
    enc.str("Addr")?;
    enc.bytes(&state.addr)?;
    enc.str("Port")?;
    enc.u16(state.port)?;
    enc.str("Meta")?;
    enc.bytes(&state.meta)?;
    enc.str("Incarnation")?;
    enc.u64(state.incarnation)?;
    enc.str("State")?;
    enc.u8(state.state.as_u8())?;
    enc.str("Vsn")?;
    encode_vsn(enc, state.vsn)?;
    Ok(())
}

fn decode_push_node_state(dec: &mut Decoder) -> Result<PushNodeState, CodecError> {
    let map_len = decode_map_len(dec)?;
    let mut name = None;
    let mut addr = None;
    let mut port = None;
    let mut meta = None;
    let mut incarnation = None;
    let mut state = None;
    let mut vsn = None;

    for _ in 0..map_len {
        match dec.str()? {
            "Name" => name = Some(dec.str()?.to_string()),
            "Addr" => addr = Some(Bytes::copy_from_slice(dec.bytes()?)),
            "Port" => port = Some(dec.u16()?),
            "Meta" => meta = Some(Bytes::copy_from_slice(dec.bytes()?)),
            "Incarnation" => incarnation = Some(dec.u64()?),
            "State" => {
                let raw = dec.u8()?;
                state = Some(PeerState::from_u8(raw).ok_or(CodecError::InvalidField {
                    field: "State",
                    reason: format!("unknown peer state {raw}"),
                })?);
            }
            "Vsn" => vsn = Some(decode_vsn(dec)?),
            _ => dec.skip()?,
        }
    }

    Ok(PushNodeState {
        name: name.ok_or(CodecError::MissingField("Name"))?,
        addr: addr.ok_or(CodecError::MissingField("Addr"))?,
        port: port.ok_or(CodecError::MissingField("Port"))?,
        meta: meta.unwrap_or_default(),
        incarnation: incarnation.ok_or(CodecError::MissingField("Incarnation"))?,
        state: state.ok_or(CodecError::MissingField("State"))?,
        vsn: vsn.ok_or(CodecError::MissingField("Vsn"))?,
    })
}

fn encode_vsn(enc: &mut Encoder<&mut Vec<u8>>, vsn: VersionVector) -> Result<(), CodecError> {
    enc.array(6)?;
    for part in vsn {
        enc.u8(part)?;
    }
    Ok(())
}

fn decode_vsn(dec: &mut Decoder) -> Result<VersionVector, CodecError> {
    let len = dec.array()?.ok_or(CodecError::InvalidField {
        field: "Vsn",
        reason: "indefinite-length array".into(),
    })?;
    if len != 6 {
        return Err(CodecError::InvalidField {
            field: "Vsn",
            reason: format!("expected 6 entries, got {len}"),
        });
    }
    let mut vsn = [0u8; 6];
    for part in &mut vsn {
        *part = dec.u8()?;
    }
    Ok(vsn)
}

fn decode_map_len(dec: &mut Decoder) -> Result<u64, CodecError> {
    if dec.datatype()? != Type::Map {
        return Err(CodecError::InvalidField {
            field: "body",
            reason: "expected map".into(),
        });
    }
    dec.map()?.ok_or(CodecError::InvalidField {
        field: "body",
        reason: "indefinite-length map".into(),
    })
}
