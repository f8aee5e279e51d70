//! Packet envelopes: compound packing, CRC32 checksums, label prefixes.

use thiserror::Error;

use super::MessageType;

/// Maximum number of parts a compound envelope can carry (one-byte count).
pub const MAX_COMPOUND_PARTS: usize = 255;

/// Bytes of framing added per part inside a compound envelope.
pub const COMPOUND_PART_OVERHEAD: usize = 2;

/// Fixed bytes of a compound envelope before the per-part length table.
pub const COMPOUND_HEADER_OVERHEAD: usize = 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("message truncated")]
    Truncated,
    #[error("invalid checksum: expected {expected:#010x}, got {got:#010x}")]
    ChecksumMismatch { expected: u32, got: u32 },
    #[error("compound part too large: {0} bytes")]
    PartTooLarge(usize),
    #[error("too many compound parts: {0}")]
    TooManyParts(usize),
    #[error("label too long: {0} bytes")]
    LabelTooLong(usize),
    #[error("label is empty")]
    EmptyLabel,
}

/// Pack several tag-prefixed messages into one compound envelope:
/// tag, one-byte part count, per-part big-endian u16 lengths, parts.
pub fn pack_compound(parts: &[Vec<u8>]) -> Result<Vec<u8>, EnvelopeError> {
    if parts.len() > MAX_COMPOUND_PARTS {
        return Err(EnvelopeError::TooManyParts(parts.len()));
    }
    let body_len: usize = parts.iter().map(Vec::len).sum();
    let mut buf = Vec::with_capacity(
        COMPOUND_HEADER_OVERHEAD + parts.len() * COMPOUND_PART_OVERHEAD + body_len,
    );
    buf.push(MessageType::Compound.as_u8());
    buf.push(parts.len() as u8);
    for part in parts {
        let len = u16::try_from(part.len()).map_err(|_| EnvelopeError::PartTooLarge(part.len()))?;
        buf.extend_from_slice(&len.to_be_bytes());
    }
    for part in parts {
        buf.extend_from_slice(part);
    }
    Ok(buf)
}

/// Split a compound envelope (tag already verified and stripped by the
/// caller) into its parts. A short buffer is not fatal: the fully present
/// parts are returned together with the count of truncated ones.
pub fn unpack_compound(buf: &[u8]) -> Result<(Vec<&[u8]>, usize), EnvelopeError> {
    let (&count, rest) = buf.split_first().ok_or(EnvelopeError::Truncated)?;
    let count = count as usize;

    if rest.len() < count * COMPOUND_PART_OVERHEAD {
        return Err(EnvelopeError::Truncated);
    }
    let (length_table, mut body) = rest.split_at(count * COMPOUND_PART_OVERHEAD);

    let mut parts = Vec::with_capacity(count);
    let mut truncated = 0usize;
    for chunk in length_table.chunks_exact(COMPOUND_PART_OVERHEAD) {
        let len = u16::from_be_bytes([chunk[0], chunk[1]]) as usize;
        if body.len() < len {
            truncated = count - parts.len();
            break;
        }
        let (part, rest) = body.split_at(len);
        parts.push(part);
        body = rest;
    }
    Ok((parts, truncated))
}

/// Wrap a message in a checksum envelope: tag, 4-byte big-endian CRC32
/// (IEEE) of the inner message, then the inner message.
#[must_use]
pub fn wrap_crc(inner: &[u8]) -> Vec<u8> {
    let crc = crc32fast::hash(inner);
    let mut buf = Vec::with_capacity(5 + inner.len());
    buf.push(MessageType::HasCrc.as_u8());
    buf.extend_from_slice(&crc.to_be_bytes());
    buf.extend_from_slice(inner);
    buf
}

/// Verify a checksum envelope (tag already stripped) and return the inner
/// message.
pub fn check_crc(buf: &[u8]) -> Result<&[u8], EnvelopeError> {
    if buf.len() < 4 {
        return Err(EnvelopeError::Truncated);
    }
    let (header, inner) = buf.split_at(4);
    let expected = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    let got = crc32fast::hash(inner);
    if expected != got {
        return Err(EnvelopeError::ChecksumMismatch { expected, got });
    }
    Ok(inner)
}

/// Prefix a packet with a label envelope: tag, one-byte label length,
/// label bytes, then the packet.
pub fn prepend_label(label: &str, packet: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
    if label.is_empty() {
        return Err(EnvelopeError::EmptyLabel);
    }
    if label.len() > 255 {
        return Err(EnvelopeError::LabelTooLong(label.len()));
    }
    let mut buf = Vec::with_capacity(2 + label.len() + packet.len());
    buf.push(MessageType::Label.as_u8());
    buf.push(label.len() as u8);
    buf.extend_from_slice(label.as_bytes());
    buf.extend_from_slice(packet);
    Ok(buf)
}

/// Strip a leading label envelope if present. Returns the label (empty
/// when the packet is unlabelled) and the remaining packet.
pub fn split_label(packet: &[u8]) -> Result<(&[u8], &[u8]), EnvelopeError> {
    match packet.first() {
        Some(&tag) if tag == MessageType::Label.as_u8() => {
            let rest = &packet[1..];
            let (&len, rest) = rest.split_first().ok_or(EnvelopeError::Truncated)?;
            if len == 0 {
                return Err(EnvelopeError::EmptyLabel);
            }
            let len = len as usize;
            if rest.len() < len {
                return Err(EnvelopeError::Truncated);
            }
            let (label, packet) = rest.split_at(len);
            Ok((label, packet))
        }
        Some(_) => Ok((&[], packet)),
        None => Err(EnvelopeError::Truncated),
    }
}
