//! Wire framing for the peer protocol: the one-shot 68-byte handshake
//! codec, and the `u32 length || [u8 type || payload]` frame codec used for
//! every message after it (spec.md §4.D, §6).
//!
//! `KeepAlive` is the zero-length frame; all framing here matches the
//! `tokio_util::codec::{Decoder, Encoder}` split the engine already uses
//! for the UDP tracker's datagram (de)serialization, just length-prefixed
//! and stream-oriented instead of single-datagram.

use bitvec::prelude::{BitVec, Msb0};
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::message::{Block, ExtensionBits, Handshake, Message, MessageId, PROTOCOL_STRING};
use crate::error::Error;
use crate::BlockInfo;

/// Length in bytes of the fixed handshake frame:
/// `1 (pstrlen) + 19 (pstr) + 8 (reserved) + 20 (info_hash) + 20 (peer_id)`.
const HANDSHAKE_LEN: usize = 1 + 19 + 8 + 20 + 20;

/// Decodes/encodes the one-shot handshake frame. A [`Framed`](tokio_util::codec::Framed)
/// is built with this codec, used exactly once, then swapped for
/// [`MessageCodec`] via `FramedParts`, reusing the underlying buffers (the
/// way the teacher's `PeerSession::start` switches codecs after the
/// handshake).
#[derive(Clone, Copy, Debug, Default)]
pub struct HandshakeCodec;

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Handshake>, Error> {
        if src.len() < HANDSHAKE_LEN {
            src.reserve(HANDSHAKE_LEN - src.len());
            return Ok(None);
        }

        let pstrlen = src[0] as usize;
        if pstrlen != PROTOCOL_STRING.len() {
            return Err(Error::ProtocolError(format!(
                "handshake protocol string length {} does not match expected {}",
                pstrlen,
                PROTOCOL_STRING.len()
            )));
        }

        let mut buf = src.split_to(HANDSHAKE_LEN);
        buf.advance(1); // pstrlen
        let pstr = buf.split_to(PROTOCOL_STRING.len());
        if &pstr[..] != PROTOCOL_STRING.as_bytes() {
            return Err(Error::ProtocolError(
                "handshake protocol string mismatch".into(),
            ));
        }

        let mut reserved = [0u8; 8];
        buf.copy_to_slice(&mut reserved);
        let extensions = ExtensionBits::from_reserved(&reserved);

        let mut info_hash = [0u8; 20];
        buf.copy_to_slice(&mut info_hash);
        let mut peer_id = [0u8; 20];
        buf.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake {
            extensions,
            info_hash,
            peer_id,
        }))
    }
}

impl Encoder<Handshake> for HandshakeCodec {
    type Error = Error;

    fn encode(&mut self, handshake: Handshake, dst: &mut BytesMut) -> Result<(), Error> {
        dst.reserve(HANDSHAKE_LEN);
        dst.put_u8(PROTOCOL_STRING.len() as u8);
        dst.put_slice(PROTOCOL_STRING.as_bytes());
        dst.put_slice(&handshake.extensions.to_reserved());
        dst.put_slice(&handshake.info_hash);
        dst.put_slice(&handshake.peer_id);
        Ok(())
    }
}

/// Decodes/encodes the `u32 length || [u8 type || payload]` frames that
/// make up the rest of the peer protocol after the handshake.
#[derive(Clone, Copy, Debug, Default)]
pub struct MessageCodec;

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, Error> {
        if src.len() < 4 {
            return Ok(None);
        }

        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len == 0 {
            // KeepAlive: consume just the length prefix
            src.advance(4);
            return Ok(Some(Message::KeepAlive));
        }

        if src.len() < 4 + len {
            src.reserve(4 + len - src.len());
            return Ok(None);
        }

        src.advance(4);
        let mut payload = src.split_to(len);
        let id_byte = payload.get_u8();
        let id = MessageId::from_u8(id_byte).ok_or_else(|| {
            Error::ProtocolError(format!("unrecognized message type {}", id_byte))
        })?;

        let message = match id {
            MessageId::Choke => Message::Choke,
            MessageId::Unchoke => Message::Unchoke,
            MessageId::Interested => Message::Interested,
            MessageId::NotInterested => Message::NotInterested,
            MessageId::Have => {
                require_len(&payload, 4, "have")?;
                Message::Have(payload.get_u32() as usize)
            }
            MessageId::Bitfield => {
                let bytes = payload.to_vec();
                Message::Bitfield(BitVec::<Msb0, u8>::from_vec(bytes))
            }
            MessageId::Request => {
                require_len(&payload, 12, "request")?;
                Message::Request(decode_block_info(&mut payload))
            }
            MessageId::Piece => {
                require_len_at_least(&payload, 8, "piece")?;
                let piece_index = payload.get_u32() as usize;
                let offset = payload.get_u32();
                let data = payload.to_vec();
                Message::Piece(Block {
                    info: BlockInfo {
                        piece_index,
                        offset,
                        len: data.len() as u32,
                    },
                    data,
                })
            }
            MessageId::Cancel => {
                require_len(&payload, 12, "cancel")?;
                Message::Cancel(decode_block_info(&mut payload))
            }
            MessageId::Port => {
                require_len(&payload, 2, "port")?;
                Message::Port(payload.get_u16())
            }
            MessageId::SuggestPiece => {
                require_len(&payload, 4, "suggest piece")?;
                Message::SuggestPiece(payload.get_u32() as usize)
            }
            MessageId::HaveAll => Message::HaveAll,
            MessageId::HaveNone => Message::HaveNone,
            MessageId::RejectRequest => {
                require_len(&payload, 12, "reject request")?;
                Message::RejectRequest(decode_block_info(&mut payload))
            }
            MessageId::AllowedFast => {
                require_len(&payload, 4, "allowed fast")?;
                Message::AllowedFast(payload.get_u32() as usize)
            }
        };

        Ok(Some(message))
    }
}

fn require_len(payload: &BytesMut, expected: usize, kind: &str) -> Result<(), Error> {
    if payload.len() != expected {
        return Err(Error::ProtocolError(format!(
            "{} message payload is {} bytes, expected {}",
            kind,
            payload.len(),
            expected
        )));
    }
    Ok(())
}

fn require_len_at_least(payload: &BytesMut, min: usize, kind: &str) -> Result<(), Error> {
    if payload.len() < min {
        return Err(Error::ProtocolError(format!(
            "{} message payload is {} bytes, expected at least {}",
            kind,
            payload.len(),
            min
        )));
    }
    Ok(())
}

fn decode_block_info(payload: &mut BytesMut) -> BlockInfo {
    let piece_index = payload.get_u32() as usize;
    let offset = payload.get_u32();
    let len = payload.get_u32();
    BlockInfo {
        piece_index,
        offset,
        len,
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = Error;

    fn encode(&mut self, message: Message, dst: &mut BytesMut) -> Result<(), Error> {
        match message {
            Message::KeepAlive => {
                dst.put_u32(0);
            }
            Message::Choke => put_frame(dst, MessageId::Choke, 0, |_| {}),
            Message::Unchoke => put_frame(dst, MessageId::Unchoke, 0, |_| {}),
            Message::Interested => put_frame(dst, MessageId::Interested, 0, |_| {}),
            Message::NotInterested => put_frame(dst, MessageId::NotInterested, 0, |_| {}),
            Message::Have(index) => {
                put_frame(dst, MessageId::Have, 4, |b| b.put_u32(index as u32))
            }
            Message::Bitfield(bf) => {
                let bytes = bf.into_vec();
                put_frame(dst, MessageId::Bitfield, bytes.len(), |b| {
                    b.put_slice(&bytes)
                })
            }
            Message::Request(info) => {
                put_frame(dst, MessageId::Request, 12, |b| put_block_info(b, &info))
            }
            Message::Piece(block) => {
                put_frame(dst, MessageId::Piece, 8 + block.data.len(), |b| {
                    b.put_u32(block.info.piece_index as u32);
                    b.put_u32(block.info.offset);
                    b.put_slice(&block.data);
                })
            }
            Message::Cancel(info) => {
                put_frame(dst, MessageId::Cancel, 12, |b| put_block_info(b, &info))
            }
            Message::Port(port) => put_frame(dst, MessageId::Port, 2, |b| b.put_u16(port)),
            Message::HaveAll => put_frame(dst, MessageId::HaveAll, 0, |_| {}),
            Message::HaveNone => put_frame(dst, MessageId::HaveNone, 0, |_| {}),
            Message::SuggestPiece(index) => {
                put_frame(dst, MessageId::SuggestPiece, 4, |b| b.put_u32(index as u32))
            }
            Message::RejectRequest(info) => {
                put_frame(dst, MessageId::RejectRequest, 12, |b| {
                    put_block_info(b, &info)
                })
            }
            Message::AllowedFast(index) => {
                put_frame(dst, MessageId::AllowedFast, 4, |b| b.put_u32(index as u32))
            }
        }
        Ok(())
    }
}

fn put_block_info(dst: &mut BytesMut, info: &BlockInfo) {
    dst.put_u32(info.piece_index as u32);
    dst.put_u32(info.offset);
    dst.put_u32(info.len);
}

/// Writes `4 (length) + 1 (type) + payload_len` bytes: the `u32` length
/// prefix (covering the type byte and payload), the type byte, then lets
/// `fill` append the payload.
fn put_frame(dst: &mut BytesMut, id: MessageId, payload_len: usize, fill: impl FnOnce(&mut BytesMut)) {
    dst.reserve(4 + 1 + payload_len);
    dst.put_u32((1 + payload_len) as u32);
    dst.put_u8(id as u8);
    fill(dst);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::message::PROTOCOL_STRING;

    #[test]
    fn handshake_round_trips() {
        let mut codec = HandshakeCodec;
        let handshake = Handshake::new(
            [7u8; 20],
            [9u8; 20],
            ExtensionBits {
                fast: true,
                dht: false,
                extended: false,
            },
        );
        let mut buf = BytesMut::new();
        codec.encode(handshake.clone(), &mut buf).unwrap();
        assert_eq!(buf.len(), HANDSHAKE_LEN);
        assert_eq!(buf[0] as usize, PROTOCOL_STRING.len());

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, handshake);
    }

    #[test]
    fn handshake_decode_waits_for_full_frame() {
        let mut codec = HandshakeCodec;
        let mut buf = BytesMut::new();
        buf.put_u8(19);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn keep_alive_round_trips_as_zero_length_frame() {
        let mut codec = MessageCodec;
        let mut buf = BytesMut::new();
        codec.encode(Message::KeepAlive, &mut buf).unwrap();
        assert_eq!(&buf[..], &0u32.to_be_bytes()[..]);
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, Message::KeepAlive);
    }

    #[test]
    fn request_message_round_trips() {
        let mut codec = MessageCodec;
        let info = BlockInfo {
            piece_index: 3,
            offset: 16384,
            len: 16384,
        };
        let mut buf = BytesMut::new();
        codec.encode(Message::Request(info), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, Message::Request(info));
    }

    #[test]
    fn piece_message_round_trips_with_payload() {
        let mut codec = MessageCodec;
        let block = Block {
            info: BlockInfo {
                piece_index: 1,
                offset: 0,
                len: 4,
            },
            data: vec![1, 2, 3, 4],
        };
        let mut buf = BytesMut::new();
        codec.encode(Message::Piece(block.clone()), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, Message::Piece(block));
    }

    #[test]
    fn decode_waits_for_full_message_body() {
        let mut codec = MessageCodec;
        let mut buf = BytesMut::new();
        buf.put_u32(5); // claims 5 bytes follow
        buf.put_u8(MessageId::Have as u8);
        // only 2 of the 4 needed payload bytes present
        buf.put_u16(0);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn rejects_unrecognized_message_type() {
        let mut codec = MessageCodec;
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(200);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn bitfield_round_trips_through_packed_bytes() {
        let mut codec = MessageCodec;
        let bits: BitVec<Msb0, u8> = BitVec::from_vec(vec![0b1010_0000]);
        let mut buf = BytesMut::new();
        codec
            .encode(Message::Bitfield(bits.clone()), &mut buf)
            .unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, Message::Bitfield(bits));
    }
}
