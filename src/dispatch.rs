//! Inbound packet demultiplexing: peel the envelope stack (label,
//! encryption, checksum, compression, compound) down to typed messages,
//! and seal outgoing packets with the mirrored stack.
//!
//! Every error here is contained at the dispatch boundary: the engine
//! logs it with the source address and drops the packet. A malformed
//! packet never terminates the engine.

use thiserror::Error;

use crate::config::Config;
use crate::proto::{
    CodecError, CompressError, CryptoError, EnvelopeError, Keyring, Message, MessageType,
    check_crc, compress_payload, decode_message, decompress_payload, pack_compound, prepend_label,
    split_label, unpack_compound, wrap_crc,
};

/// Envelope recursion bound; deeper nesting is hostile input.
const MAX_PEEL_DEPTH: usize = 8;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("message truncated")]
    Truncated,
    #[error("invalid checksum")]
    ChecksumMismatch,
    #[error("packet label mismatch: got {got:?}, want {want:?}")]
    LabelMismatch { got: String, want: String },
    #[error("encrypted packet received but no keyring is configured")]
    NoKeyring,
    #[error("plaintext packet rejected: encryption is required")]
    PlaintextRejected,
    #[error("{0}")]
    Decrypt(#[from] CryptoError),
    #[error("envelope nesting deeper than {MAX_PEEL_DEPTH}")]
    NestingTooDeep,
    #[error("{0}")]
    Codec(#[from] CodecError),
    #[error("{0}")]
    Compress(#[from] CompressError),
}

impl From<EnvelopeError> for DispatchError {
    fn from(err: EnvelopeError) -> Self {
        match err {
            EnvelopeError::ChecksumMismatch { .. } => DispatchError::ChecksumMismatch,
            _ => DispatchError::Truncated,
        }
    }
}

/// The result of peeling one packet.
#[derive(Debug, Default)]
pub struct Opened {
    pub messages: Vec<Message>,
    /// Compound parts lost to a short buffer.
    pub truncated_parts: usize,
    /// Per-part decode failures inside compound envelopes; the healthy
    /// parts are still delivered.
    pub part_errors: Vec<DispatchError>,
}

/// Packet-boundary policy: label matching, encryption, checksum and
/// compression peeling.
pub struct Dispatcher {
    label: String,
    skip_inbound_label_check: bool,
    keyring: Option<Keyring>,
}

impl Dispatcher {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            label: config.label.clone(),
            skip_inbound_label_check: config.skip_inbound_label_check,
            keyring: config.keyring.clone(),
        }
    }

    /// Peel an inbound packet down to its typed messages.
    pub fn open_packet(&self, packet: &[u8]) -> Result<Opened, DispatchError> {
        let (label, rest) = split_label(packet)?;
        self.check_label(label)?;

        let mut opened = Opened::default();
        match rest.first() {
            Some(&tag) if tag == MessageType::Encrypt.as_u8() => {
                let Some(keyring) = &self.keyring else {
                    return Err(DispatchError::NoKeyring);
                };
                let plain = keyring.open(&rest[1..], self.label.as_bytes())?;
                self.open_inner(&plain, 0, &mut opened)?;
            }
            Some(_) => {
                if self.keyring.is_some() {
                    return Err(DispatchError::PlaintextRejected);
                }
                self.open_inner(rest, 0, &mut opened)?;
            }
            None => return Err(DispatchError::Truncated),
        }
        Ok(opened)
    }

    fn open_inner(
        &self,
        buf: &[u8],
        depth: usize,
        opened: &mut Opened,
    ) -> Result<(), DispatchError> {
        if depth > MAX_PEEL_DEPTH {
            return Err(DispatchError::NestingTooDeep);
        }
        let (&tag, rest) = buf.split_first().ok_or(DispatchError::Truncated)?;

        if tag == MessageType::HasCrc.as_u8() {
            let inner = check_crc(rest)?;
            return self.open_inner(inner, depth + 1, opened);
        }
        if tag == MessageType::Compress.as_u8() {
            let plain = decompress_payload(rest)?;
            return self.open_inner(&plain, depth + 1, opened);
        }
        if tag == MessageType::Compound.as_u8() {
            let (parts, truncated) = unpack_compound(rest)?;
            opened.truncated_parts += truncated;
            for part in parts {
                if let Err(err) = self.open_inner(part, depth + 1, opened) {
                    opened.part_errors.push(err);
                }
            }
            return Ok(());
        }

        opened.messages.push(decode_message(buf)?);
        Ok(())
    }

    /// Seal an outgoing packet: optionally compress, checksum at protocol
    /// version 5+, encrypt when a keyring is installed, and prepend the
    /// cluster label.
    pub fn seal_packet(
        &self,
        payload: Vec<u8>,
        with_crc: bool,
        try_compress: bool,
    ) -> Result<Vec<u8>, DispatchError> {
        let mut packet = payload;
        if try_compress {
            let compressed = compress_payload(&packet)?;
            // Compression only pays for itself on redundant payloads.
            if compressed.len() < packet.len() {
                packet = compressed;
            }
        }
        if with_crc {
            packet = wrap_crc(&packet);
        }
        if let Some(keyring) = &self.keyring {
            let sealed = keyring.seal(&packet, self.label.as_bytes())?;
            let mut buf = Vec::with_capacity(1 + sealed.len());
            buf.push(MessageType::Encrypt.as_u8());
            buf.extend_from_slice(&sealed);
            packet = buf;
        }
        if !self.label.is_empty() {
            packet = prepend_label(&self.label, &packet)?;
        }
        Ok(packet)
    }

    /// Pack several encoded messages into one sealed packet.
    pub fn seal_compound(
        &self,
        parts: &[Vec<u8>],
        with_crc: bool,
        try_compress: bool,
    ) -> Result<Vec<u8>, DispatchError> {
        let payload = if parts.len() == 1 {
            parts[0].clone()
        } else {
            pack_compound(parts)?
        };
        self.seal_packet(payload, with_crc, try_compress)
    }

    /// Seal a stream frame payload: compression and encryption only, no
    /// checksum (stream transports are assumed reliable).
    pub fn seal_stream(
        &self,
        payload: Vec<u8>,
        try_compress: bool,
    ) -> Result<Vec<u8>, DispatchError> {
        self.seal_packet(payload, false, try_compress)
    }

    /// Open a stream frame down to its raw tag-prefixed payload. Stream
    /// payloads carry tags the packet path does not (push/pull), so the
    /// caller decodes the result itself.
    pub fn open_stream(&self, frame: &[u8]) -> Result<Vec<u8>, DispatchError> {
        let (label, rest) = split_label(frame)?;
        self.check_label(label)?;

        let mut buf = match rest.first() {
            Some(&tag) if tag == MessageType::Encrypt.as_u8() => {
                let Some(keyring) = &self.keyring else {
                    return Err(DispatchError::NoKeyring);
                };
                keyring.open(&rest[1..], self.label.as_bytes())?
            }
            Some(_) => {
                if self.keyring.is_some() {
                    return Err(DispatchError::PlaintextRejected);
                }
                rest.to_vec()
            }
            None => return Err(DispatchError::Truncated),
        };

        if buf.first() == Some(&MessageType::Compress.as_u8()) {
            buf = decompress_payload(&buf[1..])?;
        }
        Ok(buf)
    }

    /// Bytes of envelope overhead added around a gossip payload, used to
    /// size packet budgets.
    #[must_use]
    pub fn overhead(&self) -> usize {
        let mut overhead = 0;
        if !self.label.is_empty() {
            overhead += 2 + self.label.len();
        }
        if self.keyring.is_some() {
            overhead += 1 + crate::proto::crypto::NONCE_SIZE + crate::proto::crypto::TAG_SIZE;
        }
        // Checksum envelope.
        overhead += 5;
        overhead
    }

    fn check_label(&self, got: &[u8]) -> Result<(), DispatchError> {
        if self.skip_inbound_label_check {
            return Ok(());
        }
        if got == self.label.as_bytes() {
            return Ok(());
        }
        Err(DispatchError::LabelMismatch {
            got: String::from_utf8_lossy(got).into_owned(),
            want: self.label.clone(),
        })
    }
}
