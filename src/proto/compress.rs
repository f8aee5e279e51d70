//! Compression envelope: `{Algo, Buf}` body carrying LZW-compressed bytes.

use std::convert::Infallible;

use minicbor::data::Type;
use minicbor::{Decoder, Encoder};
use thiserror::Error;
use weezl::BitOrder;

use super::MessageType;

/// LZW code width. Part of the wire format.
const LZW_LIT_WIDTH: u8 = 8;

/// Algorithm identifiers. Only LZW is defined.
const ALGO_LZW: u8 = 0;

#[derive(Debug, Error)]
pub enum CompressError {
    #[error("message truncated")]
    Truncated,
    #[error("unknown compression algorithm {0}")]
    UnknownAlgorithm(u8),
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("lzw: {0}")]
    Lzw(#[from] weezl::LzwError),
    #[error("cbor encode: {0}")]
    Encode(#[from] minicbor::encode::Error<Infallible>),
    #[error("cbor decode: {0}")]
    Decode(#[from] minicbor::decode::Error),
}

/// Compress a payload into a full compression envelope (tag included).
pub fn compress_payload(payload: &[u8]) -> Result<Vec<u8>, CompressError> {
    let compressed = weezl::encode::Encoder::new(BitOrder::Lsb, LZW_LIT_WIDTH).encode(payload)?;

    let mut buf = vec![MessageType::Compress.as_u8()];
    let mut enc = Encoder::new(&mut buf);
    enc.map(2)?;
    enc.str("Algo")?;
    enc.u8(ALGO_LZW)?;
    enc.str("Buf")?;
    enc.bytes(&compressed)?;
    Ok(buf)
}

/// Decompress a compression envelope body (tag already stripped).
pub fn decompress_payload(buf: &[u8]) -> Result<Vec<u8>, CompressError> {
    let mut dec = Decoder::new(buf);
    if dec.datatype()? != Type::Map {
        return Err(CompressError::Truncated);
    }
    let map_len = dec.map()?.ok_or(CompressError::Truncated)?;

    let mut algo = None;
    let mut compressed: Option<Vec<u8>> = None;
    for _ in 0..map_len {
        match dec.str()? {
            "Algo" => algo = Some(dec.u8()?),
            "Buf" => compressed = Some(dec.bytes()?.to_vec()),
            _ => dec.skip()?,
        }
    }

    let algo = algo.ok_or(CompressError::MissingField("Algo"))?;
    if algo != ALGO_LZW {
        return Err(CompressError::UnknownAlgorithm(algo));
    }
    let compressed = compressed.ok_or(CompressError::MissingField("Buf"))?;

    let plain = weezl::decode::Decoder::new(BitOrder::Lsb, LZW_LIT_WIDTH).decode(&compressed)?;
    Ok(plain)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let payload = b"the same bytes repeated, the same bytes repeated, again and again";
        let envelope = compress_payload(payload).expect("compress");
        assert_eq!(envelope[0], MessageType::Compress.as_u8());
        let plain = decompress_payload(&envelope[1..]).expect("decompress");
        assert_eq!(plain, payload);
    }

    #[test]
    fn repetitive_input_shrinks() {
        let payload = vec![7u8; 4096];
        let envelope = compress_payload(&payload).expect("compress");
        assert!(envelope.len() < payload.len());
    }

    #[test]
    fn unknown_algorithm_is_rejected() {
        let mut buf = Vec::new();
        let mut enc = Encoder::new(&mut buf);
        enc.map(2).unwrap();
        enc.str("Algo").unwrap();
        enc.u8(9).unwrap();
        enc.str("Buf").unwrap();
        enc.bytes(&[]).unwrap();
        assert!(matches!(
            decompress_payload(&buf),
            Err(CompressError::UnknownAlgorithm(9))
        ));
    }

    #[test]
    fn missing_buf_is_rejected() {
        let mut buf = Vec::new();
        let mut enc = Encoder::new(&mut buf);
        enc.map(1).unwrap();
        enc.str("Algo").unwrap();
        enc.u8(0).unwrap();
        assert!(matches!(
            decompress_payload(&buf),
            Err(CompressError::MissingField("Buf"))
        ));
    }
}
