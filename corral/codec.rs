//! Length-prefixed envelope codec for the actor wire format.
//!
//! Wire format: 4-byte big-endian u32 length prefix + protobuf-encoded
//! [`Envelope`]. Grounded on `srpc::codec::PacketCodec`, with two
//! deliberate departures: big-endian framing (this runtime does not share
//! the teacher's wire compatibility goals, so the length prefix follows the
//! network byte-order convention instead) and `Envelope` in place of
//! `Packet`.

use bytes::{Buf, BufMut, BytesMut};
use prost::Message;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{Error, Result};
use crate::proto::Envelope;

/// Maximum message size (10MB).
pub const MAX_MESSAGE_SIZE: usize = 10_000_000;

/// Length of the size prefix in bytes.
const SIZE_PREFIX_LEN: usize = 4;

/// Codec for encoding and decoding envelopes with length-prefix framing.
#[derive(Debug, Default, Clone)]
pub struct EnvelopeCodec;

impl EnvelopeCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for EnvelopeCodec {
    type Item = Envelope;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.len() < SIZE_PREFIX_LEN {
            return Ok(None);
        }

        let mut size_bytes = [0u8; SIZE_PREFIX_LEN];
        size_bytes.copy_from_slice(&src[..SIZE_PREFIX_LEN]);
        let msg_size = u32::from_be_bytes(size_bytes) as usize;

        if msg_size == 0 {
            return Err(Error::FrameSizeZero);
        }
        if msg_size > MAX_MESSAGE_SIZE {
            return Err(Error::MessageTooLarge(msg_size, MAX_MESSAGE_SIZE));
        }

        let total_size = SIZE_PREFIX_LEN + msg_size;
        if src.len() < total_size {
            src.reserve(total_size - src.len());
            return Ok(None);
        }

        src.advance(SIZE_PREFIX_LEN);

        let envelope_bytes = src.split_to(msg_size);
        let envelope = Envelope::decode(&envelope_bytes[..])?;

        Ok(Some(envelope))
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = Error;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<()> {
        let msg_size = item.encoded_len();

        if msg_size > MAX_MESSAGE_SIZE {
            return Err(Error::MessageTooLarge(msg_size, MAX_MESSAGE_SIZE));
        }
        if msg_size == 0 {
            return Err(Error::FrameSizeZero);
        }

        dst.reserve(SIZE_PREFIX_LEN + msg_size);
        dst.put_u32(msg_size as u32);
        item.encode(dst)?;

        Ok(())
    }
}

/// Encode an envelope to bytes with length prefix.
pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>> {
    let msg_size = envelope.encoded_len();
    if msg_size > MAX_MESSAGE_SIZE {
        return Err(Error::MessageTooLarge(msg_size, MAX_MESSAGE_SIZE));
    }

    let mut buf = Vec::with_capacity(SIZE_PREFIX_LEN + msg_size);
    buf.extend_from_slice(&(msg_size as u32).to_be_bytes());
    envelope.encode(&mut buf)?;

    Ok(buf)
}

/// Decode an envelope from bytes (without length prefix).
pub fn decode_envelope(bytes: &[u8]) -> Result<Envelope> {
    Ok(Envelope::decode(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{envelope::Body, Handshake};

    fn sample() -> Envelope {
        Envelope {
            body: Some(Body::Handshake(Handshake {
                name: "worker".into(),
                instance_id: "abc".into(),
            })),
        }
    }

    #[test]
    fn test_codec_roundtrip() {
        let mut codec = EnvelopeCodec::new();
        let mut buf = BytesMut::new();

        let env = sample();
        codec.encode(env.clone(), &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn test_length_prefix_is_big_endian() {
        let env = sample();
        let bytes = encode_envelope(&env).unwrap();
        let prefix = u32::from_be_bytes(bytes[..4].try_into().unwrap());
        assert_eq!(prefix as usize, env.encoded_len());
    }

    #[test]
    fn test_codec_partial_read() {
        let mut codec = EnvelopeCodec::new();
        let mut buf = BytesMut::new();

        let env = sample();
        codec.encode(env.clone(), &mut buf).unwrap();

        let full_buf = buf.clone();
        buf.truncate(3);

        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&full_buf[3..]);

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn test_codec_message_too_large() {
        let mut codec = EnvelopeCodec::new();
        let mut buf = BytesMut::new();

        let env = Envelope {
            body: Some(Body::Handshake(Handshake {
                name: "x".repeat(MAX_MESSAGE_SIZE + 1),
                instance_id: String::new(),
            })),
        };

        let result = codec.encode(env, &mut buf);
        assert!(matches!(result, Err(Error::MessageTooLarge(_, _))));
    }

    #[test]
    fn test_zero_length_frame_rejected() {
        let mut codec = EnvelopeCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32(0);
        assert!(matches!(codec.decode(&mut buf), Err(Error::FrameSizeZero)));
    }
}
