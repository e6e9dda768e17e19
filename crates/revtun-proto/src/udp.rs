//! Datagram envelopes for UDP tunnels
//!
//! A UDP tunnel multiplexes every local peer over a single reliable byte
//! channel, so each datagram is wrapped with the address it came from:
//!
//! ```text
//! [family: u8 (4|6)][ip: 4|16 bytes][port: u16][length: u16][payload]
//! ```
//!
//! All integers are big endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Largest datagram carried through a tunnel
pub const MAX_DATAGRAM_SIZE: usize = 9012;

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("Unknown address family: {0}")]
    UnknownFamily(u8),

    #[error("Datagram too large: {0} bytes")]
    DatagramTooLarge(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One datagram and the peer it belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpEnvelope {
    pub source: SocketAddr,
    pub payload: Bytes,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct UdpEnvelopeCodec;

impl Encoder<UdpEnvelope> for UdpEnvelopeCodec {
    type Error = EnvelopeError;

    fn encode(&mut self, item: UdpEnvelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.payload.len() > MAX_DATAGRAM_SIZE {
            return Err(EnvelopeError::DatagramTooLarge(item.payload.len()));
        }

        match item.source.ip() {
            IpAddr::V4(ip) => {
                dst.reserve(1 + 4 + 4 + item.payload.len());
                dst.put_u8(4);
                dst.extend_from_slice(&ip.octets());
            }
            IpAddr::V6(ip) => {
                dst.reserve(1 + 16 + 4 + item.payload.len());
                dst.put_u8(6);
                dst.extend_from_slice(&ip.octets());
            }
        }
        dst.put_u16(item.source.port());
        dst.put_u16(item.payload.len() as u16);
        dst.extend_from_slice(&item.payload);
        Ok(())
    }
}

impl Decoder for UdpEnvelopeCodec {
    type Item = UdpEnvelope;
    type Error = EnvelopeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(&family) = src.first() else {
            return Ok(None);
        };

        let ip_len = match family {
            4 => 4,
            6 => 16,
            other => return Err(EnvelopeError::UnknownFamily(other)),
        };

        let header_len = 1 + ip_len + 2 + 2;
        if src.len() < header_len {
            return Ok(None);
        }

        let payload_len =
            u16::from_be_bytes([src[header_len - 2], src[header_len - 1]]) as usize;
        if payload_len > MAX_DATAGRAM_SIZE {
            return Err(EnvelopeError::DatagramTooLarge(payload_len));
        }
        if src.len() < header_len + payload_len {
            src.reserve(header_len + payload_len - src.len());
            return Ok(None);
        }

        src.advance(1);
        let ip = if ip_len == 4 {
            let mut octets = [0u8; 4];
            src.copy_to_slice(&mut octets);
            IpAddr::V4(Ipv4Addr::from(octets))
        } else {
            let mut octets = [0u8; 16];
            src.copy_to_slice(&mut octets);
            IpAddr::V6(Ipv6Addr::from(octets))
        };
        let port = src.get_u16();
        let _ = src.get_u16();
        let payload = src.split_to(payload_len).freeze();

        Ok(Some(UdpEnvelope {
            source: SocketAddr::new(ip, port),
            payload,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{SinkExt, StreamExt};
    use tokio_util::codec::{FramedRead, FramedWrite};

    #[test]
    fn test_decode_waits_for_full_envelope() {
        let mut codec = UdpEnvelopeCodec;
        let mut buf = BytesMut::new();
        codec
            .encode(
                UdpEnvelope {
                    source: "10.0.0.7:5353".parse().unwrap(),
                    payload: Bytes::from_static(b"query"),
                },
                &mut buf,
            )
            .unwrap();

        let mut partial = BytesMut::from(&buf[..6]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.source, "10.0.0.7:5353".parse().unwrap());
        assert_eq!(&decoded.payload[..], b"query");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_rejects_unknown_family() {
        let mut buf = BytesMut::from(&[9u8, 0, 0][..]);
        assert!(matches!(
            UdpEnvelopeCodec.decode(&mut buf),
            Err(EnvelopeError::UnknownFamily(9))
        ));
    }

    #[test]
    fn test_rejects_oversized_payload() {
        let envelope = UdpEnvelope {
            source: "127.0.0.1:1".parse().unwrap(),
            payload: Bytes::from(vec![0u8; MAX_DATAGRAM_SIZE + 1]),
        };
        assert!(matches!(
            UdpEnvelopeCodec.encode(envelope, &mut BytesMut::new()),
            Err(EnvelopeError::DatagramTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn test_framed_stream_preserves_datagram_boundaries() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut writer = FramedWrite::new(a, UdpEnvelopeCodec);
        let mut reader = FramedRead::new(b, UdpEnvelopeCodec);

        let v6: SocketAddr = "[::1]:9000".parse().unwrap();
        writer
            .send(UdpEnvelope {
                source: "127.0.0.1:4000".parse().unwrap(),
                payload: Bytes::from_static(b"one"),
            })
            .await
            .unwrap();
        writer
            .send(UdpEnvelope {
                source: v6,
                payload: Bytes::from_static(b""),
            })
            .await
            .unwrap();
        drop(writer);

        let first = reader.next().await.unwrap().unwrap();
        assert_eq!(&first.payload[..], b"one");
        let second = reader.next().await.unwrap().unwrap();
        assert_eq!(second.source, v6);
        assert!(second.payload.is_empty());
        assert!(reader.next().await.is_none());
    }
}
