// Copyright (c) Tetherline.
// Licensed under the MIT License.

//! Packet framing between the byte transport and the wire codec.
//!
//! The transport delivers arbitrary byte chunks; the codec decodes whole
//! packets. [`PacketFramer`] sits between the two: it accumulates bytes,
//! locates packet boundaries from the fixed header's remaining-length varint,
//! and hands complete frames to the codec.

use std::io::Cursor;

use bytes::BytesMut;
use mqtt::packet::VariablePacket;
use mqtt::{Decodable, Encodable};

use crate::error::{ClientError, ErrorKind};

/// The remaining-length varint is at most 4 bytes (2.2.3)
const MAX_REMAINING_LENGTH_BYTES: usize = 4;

/// Accumulates inbound bytes and yields complete MQTT packets.
pub(crate) struct PacketFramer {
    buf: BytesMut,
}

impl PacketFramer {
    pub(crate) fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(4096),
        }
    }

    /// Buffer for the transport to append raw bytes into.
    pub(crate) fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Decode the next complete packet out of the buffer, if one has fully
    /// arrived.
    ///
    /// # Errors
    /// [`ErrorKind::ProtocolViolation`] if the buffered bytes cannot be a
    /// well-formed packet.
    pub(crate) fn next_packet(&mut self) -> Result<Option<VariablePacket>, ClientError> {
        let Some(total) = self.packet_bounds()? else {
            return Ok(None);
        };
        let frame = self.buf.split_to(total);
        let mut cursor = Cursor::new(&frame[..]);
        match VariablePacket::decode(&mut cursor) {
            Ok(packet) => Ok(Some(packet)),
            Err(e) => Err(ClientError::with_source(ErrorKind::ProtocolViolation, e)),
        }
    }

    /// Total length of the packet at the head of the buffer, or `None` if it
    /// has not fully arrived yet.
    fn packet_bounds(&self) -> Result<Option<usize>, ClientError> {
        if self.buf.len() < 2 {
            return Ok(None);
        }
        let mut remaining: usize = 0;
        let mut shift = 0;
        for (i, byte) in self.buf[1..].iter().enumerate() {
            if i == MAX_REMAINING_LENGTH_BYTES {
                return Err(ClientError::new(ErrorKind::ProtocolViolation));
            }
            remaining |= usize::from(byte & 0x7f) << shift;
            shift += 7;
            if byte & 0x80 == 0 {
                let total = 1 + i + 1 + remaining;
                return Ok((self.buf.len() >= total).then_some(total));
            }
        }
        // Varint continuation bytes still in flight
        Ok(None)
    }
}

/// Encode a single packet into owned bytes.
pub(crate) fn encode_packet<P: Encodable>(packet: &P) -> Result<Vec<u8>, ClientError> {
    let mut buf = Vec::with_capacity(packet.encoded_length() as usize);
    packet
        .encode(&mut buf)
        .map_err(|e| ClientError::with_source(ErrorKind::ProtocolViolation, e))?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use mqtt::packet::publish::QoSWithPacketIdentifier;
    use mqtt::packet::{PingrespPacket, PublishPacket};
    use mqtt::TopicName;

    use super::*;

    fn sample_publish(payload_len: usize) -> PublishPacket {
        PublishPacket::new(
            TopicName::new("alpha/beta").unwrap(),
            QoSWithPacketIdentifier::Level1(7),
            vec![0xAB; payload_len],
        )
    }

    #[test]
    fn round_trips_a_packet_delivered_in_chunks() {
        let packet = sample_publish(300);
        let encoded = encode_packet(&packet).unwrap();

        let mut framer = PacketFramer::new();
        for chunk in encoded.chunks(7) {
            framer.buffer_mut().extend_from_slice(chunk);
        }
        match framer.next_packet().unwrap() {
            Some(VariablePacket::PublishPacket(decoded)) => {
                assert_eq!(decoded.topic_name(), "alpha/beta");
                assert_eq!(decoded.qos(), QoSWithPacketIdentifier::Level1(7));
                assert_eq!(decoded.payload(), packet.payload());
            }
            other => panic!("unexpected decode result: {other:?}"),
        }
        assert!(framer.next_packet().unwrap().is_none());
    }

    #[test]
    fn yields_nothing_until_the_frame_is_complete() {
        let encoded = encode_packet(&sample_publish(64)).unwrap();
        let mut framer = PacketFramer::new();

        framer.buffer_mut().extend_from_slice(&encoded[..5]);
        assert!(framer.next_packet().unwrap().is_none());

        framer.buffer_mut().extend_from_slice(&encoded[5..]);
        assert!(framer.next_packet().unwrap().is_some());
    }

    #[test]
    fn decodes_back_to_back_packets() {
        let mut framer = PacketFramer::new();
        let publish = encode_packet(&sample_publish(16)).unwrap();
        let pingresp = encode_packet(&PingrespPacket::new()).unwrap();
        framer.buffer_mut().extend_from_slice(&publish);
        framer.buffer_mut().extend_from_slice(&pingresp);

        assert!(matches!(
            framer.next_packet().unwrap(),
            Some(VariablePacket::PublishPacket(_))
        ));
        assert!(matches!(
            framer.next_packet().unwrap(),
            Some(VariablePacket::PingrespPacket(_))
        ));
        assert!(framer.next_packet().unwrap().is_none());
    }

    #[test]
    fn rejects_overlong_length_varint() {
        let mut framer = PacketFramer::new();
        framer
            .buffer_mut()
            .extend_from_slice(&[0x30, 0xFF, 0xFF, 0xFF, 0xFF, 0x7F]);
        let err = framer.next_packet().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolViolation);
    }
}
