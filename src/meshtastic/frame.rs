//! Stream framing for the Meshtastic TCP/serial API.
//!
//! Each protobuf travels as:
//!
//!   `0x94 0xC3 <len_hi> <len_lo> <protobuf bytes>`
//!
//! [`StreamFramer`] can be fed arbitrary chunks and yields whole payloads when
//! available. Garbage between frames (boot logs, partial frames after a reset)
//! is skipped by realigning on the next `0x94 0xC3` pair.
use bytes::{Buf, BytesMut};
use prost::Message;

use crate::error::{LinkError, LinkResult};
use crate::protobuf::meshtastic_generated as proto;

pub const START1: u8 = 0x94;
pub const START2: u8 = 0xC3;
const HEADER_LEN: usize = 4;

/// Largest payload the firmware accepts in either direction.
pub const MAX_PAYLOAD: usize = 512;

pub struct StreamFramer {
    buf: BytesMut,
}

impl Default for StreamFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamFramer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(1024),
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes buffered but not yet returned as a frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Next complete payload, or None until more bytes arrive. A header with an
    /// impossible length drops one byte and realigns.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        loop {
            if self.buf.len() < 2 {
                return None;
            }
            if !(self.buf[0] == START1 && self.buf[1] == START2) {
                match self.buf.iter().skip(1).position(|&b| b == START1) {
                    Some(pos) => self.buf.advance(pos + 1),
                    None => {
                        // Keep nothing: no possible header start remains.
                        self.buf.clear();
                        return None;
                    }
                }
                continue;
            }
            if self.buf.len() < HEADER_LEN {
                return None;
            }
            let declared = ((self.buf[2] as usize) << 8) | (self.buf[3] as usize);
            if declared == 0 || declared > MAX_PAYLOAD {
                self.buf.advance(1);
                continue;
            }
            if self.buf.len() < HEADER_LEN + declared {
                return None;
            }
            self.buf.advance(HEADER_LEN);
            return Some(self.buf.split_to(declared).to_vec());
        }
    }
}

/// Encode a ToRadio with its stream header.
pub fn encode_frame(msg: &proto::ToRadio) -> LinkResult<Vec<u8>> {
    let len = msg.encoded_len();
    if len > MAX_PAYLOAD {
        return Err(LinkError::FrameTooLarge(len));
    }
    let mut out = Vec::with_capacity(HEADER_LEN + len);
    out.extend_from_slice(&[START1, START2, ((len >> 8) & 0xFF) as u8, (len & 0xFF) as u8]);
    msg.encode(&mut out)?;
    Ok(out)
}

pub fn want_config(config_id: u32) -> proto::ToRadio {
    proto::ToRadio {
        payload_variant: Some(proto::to_radio::PayloadVariant::WantConfigId(config_id)),
    }
}

pub fn heartbeat(nonce: u32) -> proto::ToRadio {
    proto::ToRadio {
        payload_variant: Some(proto::to_radio::PayloadVariant::Heartbeat(proto::Heartbeat {
            nonce,
        })),
    }
}

pub fn disconnect() -> proto::ToRadio {
    proto::ToRadio {
        payload_variant: Some(proto::to_radio::PayloadVariant::Disconnect(true)),
    }
}

/// Text packet addressed to `to` on channel slot `channel`. Direct packets ask
/// for an ACK so the firmware transmits them promptly.
pub fn text_packet(from: u32, to: u32, channel: u32, text: &str, id: u32) -> proto::ToRadio {
    let direct = to != super::BROADCAST_ADDR;
    let data = proto::Data {
        portnum: proto::PortNum::TextMessageApp as i32,
        payload: bytes::Bytes::copy_from_slice(text.as_bytes()),
        ..Default::default()
    };
    let packet = proto::MeshPacket {
        from,
        to,
        channel,
        id,
        hop_limit: 3,
        want_ack: direct,
        payload_variant: Some(proto::mesh_packet::PayloadVariant::Decoded(data)),
        ..Default::default()
    };
    proto::ToRadio {
        payload_variant: Some(proto::to_radio::PayloadVariant::Packet(packet)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(payload: &[u8]) -> Vec<u8> {
        let mut out = vec![START1, START2, (payload.len() >> 8) as u8, payload.len() as u8];
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn yields_frame_split_across_pushes() {
        let bytes = frame(b"hello");
        let mut framer = StreamFramer::new();
        framer.push(&bytes[..3]);
        assert!(framer.next_frame().is_none());
        framer.push(&bytes[3..]);
        assert_eq!(framer.next_frame().unwrap(), b"hello");
        assert!(framer.next_frame().is_none());
        assert_eq!(framer.pending(), 0);
    }

    #[test]
    fn skips_console_noise_between_frames() {
        let mut stream = b"INFO | boot ok\r\n".to_vec();
        stream.extend(frame(b"one"));
        stream.extend_from_slice(&[0x94, 0x00, 0x12]);
        stream.extend(frame(b"two"));
        let mut framer = StreamFramer::new();
        framer.push(&stream);
        assert_eq!(framer.next_frame().unwrap(), b"one");
        assert_eq!(framer.next_frame().unwrap(), b"two");
        assert!(framer.next_frame().is_none());
    }

    #[test]
    fn oversize_header_is_resynchronized() {
        let mut stream = vec![START1, START2, 0xFF, 0xFF];
        stream.extend(frame(b"ok"));
        let mut framer = StreamFramer::new();
        framer.push(&stream);
        assert_eq!(framer.next_frame().unwrap(), b"ok");
    }

    #[test]
    fn encoded_text_packet_decodes_back() {
        let msg = text_packet(0x10, 0x20, 2, "hi there", 7);
        let bytes = encode_frame(&msg).unwrap();
        assert_eq!(&bytes[..2], &[START1, START2]);
        let mut framer = StreamFramer::new();
        framer.push(&bytes);
        let payload = framer.next_frame().unwrap();
        let decoded = proto::ToRadio::decode(payload.as_slice()).unwrap();
        match decoded.payload_variant {
            Some(proto::to_radio::PayloadVariant::Packet(pkt)) => {
                assert_eq!(pkt.to, 0x20);
                assert_eq!(pkt.channel, 2);
                assert!(pkt.want_ack);
                match pkt.payload_variant {
                    Some(proto::mesh_packet::PayloadVariant::Decoded(data)) => {
                        assert_eq!(&data.payload[..], b"hi there");
                        assert_eq!(data.portnum, proto::PortNum::TextMessageApp as i32);
                    }
                    other => panic!("unexpected payload {:?}", other),
                }
            }
            other => panic!("unexpected variant {:?}", other),
        }
    }

    #[test]
    fn broadcast_packets_do_not_request_ack() {
        let msg = text_packet(1, crate::meshtastic::BROADCAST_ADDR, 0, "all", 9);
        match msg.payload_variant {
            Some(proto::to_radio::PayloadVariant::Packet(pkt)) => assert!(!pkt.want_ack),
            _ => panic!("expected packet"),
        }
    }

    #[test]
    fn rejects_oversize_payloads() {
        let text = "x".repeat(MAX_PAYLOAD + 10);
        let msg = text_packet(1, 2, 0, &text, 3);
        assert!(matches!(encode_frame(&msg), Err(LinkError::FrameTooLarge(_))));
    }
}
