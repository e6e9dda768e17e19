//! Length-prefixed framing for control messages
//!
//! Format: `[length: u32 big endian][payload: bincode serialized message]`

use crate::messages::ControlMessage;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Codec for [`ControlMessage`] frames
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl FrameCodec {
    /// Maximum frame size (1MB)
    pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

    pub fn encode(msg: &ControlMessage) -> Result<Bytes, CodecError> {
        let payload = bincode::serialize(msg)?;
        if payload.len() > Self::MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(payload.len()));
        }

        let mut buf = BytesMut::with_capacity(4 + payload.len());
        buf.put_u32(payload.len() as u32);
        buf.extend_from_slice(&payload);
        Ok(buf.freeze())
    }

    /// Returns `Ok(None)` until a full frame is buffered.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<ControlMessage>, CodecError> {
        if buf.len() < 4 {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&buf[..4]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > Self::MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(length));
        }
        if buf.len() < 4 + length {
            return Ok(None);
        }

        buf.advance(4);
        let msg_bytes = buf.split_to(length);
        Ok(Some(bincode::deserialize(&msg_bytes)?))
    }
}

impl Decoder for FrameCodec {
    type Item = ControlMessage;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        FrameCodec::decode(src)
    }
}

impl Encoder<ControlMessage> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, item: ControlMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(&FrameCodec::encode(&item)?);
        Ok(())
    }
}

/// Write one frame to a stream
pub async fn write_message<W>(writer: &mut W, msg: &ControlMessage) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = FrameCodec::encode(msg)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read exactly one frame from a stream.
///
/// Reads the header and body without over-reading, so the stream can carry
/// raw bytes after the frame. Returns `Ok(None)` on a clean end of stream.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<ControlMessage>, CodecError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let length = u32::from_be_bytes(header) as usize;
    if length > FrameCodec::MAX_MESSAGE_SIZE {
        return Err(CodecError::MessageTooLarge(length));
    }

    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).await?;
    Ok(Some(bincode::deserialize(&body)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{AgentHello, HelloResponse};
    use crate::ForwardingSpec;

    #[test]
    fn test_decode_incomplete() {
        let msg = ControlMessage::ChannelOpen {
            channel_type: "revtun".to_string(),
            payload: b"127.0.0.1:22".to_vec(),
        };
        let encoded = FrameCodec::encode(&msg).unwrap();

        let mut buf = BytesMut::from(&encoded[..4]);
        assert_eq!(FrameCodec::decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(&encoded[4..]);
        assert_eq!(FrameCodec::decode(&mut buf).unwrap(), Some(msg));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_rejects_oversized_header() {
        let mut buf = BytesMut::new();
        buf.put_u32((FrameCodec::MAX_MESSAGE_SIZE + 1) as u32);
        assert!(matches!(
            FrameCodec::decode(&mut buf),
            Err(CodecError::MessageTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn test_read_message_leaves_trailing_bytes() {
        let hello = ControlMessage::Hello(AgentHello {
            agent_id: "agent-1".to_string(),
            auth_id: "auth".to_string(),
            name: None,
            session_id: "s1".to_string(),
            version: "0.7.0".to_string(),
            tunnels: vec![ForwardingSpec::new("127.0.0.1", 22)],
        });

        let mut wire = FrameCodec::encode(&hello).unwrap().to_vec();
        wire.extend_from_slice(b"raw");

        let mut reader = &wire[..];
        let decoded = read_message(&mut reader).await.unwrap();
        assert_eq!(decoded, Some(hello));
        assert_eq!(reader, b"raw");
    }

    #[tokio::test]
    async fn test_read_message_clean_eof() {
        let mut reader: &[u8] = &[];
        assert!(read_message(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_write_then_read_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let msg = ControlMessage::HelloResult(HelloResponse::Rejected {
            code: 409,
            message: "already connected".to_string(),
        });
        write_message(&mut a, &msg).await.unwrap();
        assert_eq!(read_message(&mut b).await.unwrap(), Some(msg));
    }
}
