use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};

use crate::messages::{ControlMessage, PacketType};

/// Maximum payload size (the length field is a u16)
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

/// Type byte plus big-endian u16 length
pub const HEADER_LEN: usize = 3;

/// Errors that can occur during encoding/decoding
///
/// All of them are fatal for the stream that produced them: a framed stream
/// is never resynchronized.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Payload too large: {0} bytes (max {MAX_PAYLOAD_SIZE})")]
    PayloadTooLarge(usize),

    #[error("Stream closed in the middle of a frame")]
    ShortRead,

    #[error("Stream closed")]
    Closed,

    #[error("Unknown packet type: {0:#04x}")]
    UnknownType(u8),

    #[error("Unexpected message: expected {expected}, got {actual}")]
    UnexpectedMessage {
        expected: PacketType,
        actual: PacketType,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A raw frame as it appeared on the wire
///
/// The type byte is kept as-is so that unknown types reach the caller, which
/// decides whether to reject them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub packet_type: u8,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(packet_type: u8, payload: impl Into<Bytes>) -> Result<Self, CodecError> {
        let payload = payload.into();
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(CodecError::PayloadTooLarge(payload.len()));
        }
        Ok(Self {
            packet_type,
            payload,
        })
    }

    /// Known packet type, if any
    pub fn kind(&self) -> Option<PacketType> {
        PacketType::from_u8(self.packet_type)
    }

    fn write_to(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_LEN + self.payload.len());
        dst.put_u8(self.packet_type);
        dst.put_u16(self.payload.len() as u16);
        dst.put_slice(&self.payload);
    }
}

impl ControlMessage {
    /// Serialize the payload and wrap it in a frame
    pub fn to_frame(&self) -> Result<Frame, CodecError> {
        let payload = match self {
            Self::Login(m) => serde_json::to_vec(m)?,
            Self::Heartbeat(m) => serde_json::to_vec(m)?,
            Self::ProxyRequest(m) => serde_json::to_vec(m)?,
            Self::ProxyResponse(m) => serde_json::to_vec(m)?,
            Self::ProxyCancel(m) => serde_json::to_vec(m)?,
            Self::Exchange(m) => serde_json::to_vec(m)?,
            Self::UdpDatagram(m) => serde_json::to_vec(m)?,
        };
        Frame::new(self.packet_type().as_u8(), payload)
    }

    /// Parse a frame's payload according to its type byte
    pub fn from_frame(frame: &Frame) -> Result<Self, CodecError> {
        let kind = frame
            .kind()
            .ok_or(CodecError::UnknownType(frame.packet_type))?;
        let payload = &frame.payload[..];

        let msg = match kind {
            PacketType::Login => Self::Login(serde_json::from_slice(payload)?),
            PacketType::Heartbeat => Self::Heartbeat(serde_json::from_slice(payload)?),
            PacketType::ProxyRequest => Self::ProxyRequest(serde_json::from_slice(payload)?),
            PacketType::ProxyResponse => Self::ProxyResponse(serde_json::from_slice(payload)?),
            PacketType::ProxyCancel => Self::ProxyCancel(serde_json::from_slice(payload)?),
            PacketType::Exchange => Self::Exchange(serde_json::from_slice(payload)?),
            PacketType::UdpDatagram => Self::UdpDatagram(serde_json::from_slice(payload)?),
        };
        Ok(msg)
    }

    /// Encode into header + payload bytes, ready to be written
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        let frame = self.to_frame()?;
        let mut buf = BytesMut::with_capacity(HEADER_LEN + frame.payload.len());
        frame.write_to(&mut buf);
        Ok(buf.freeze())
    }
}

/// Read exactly one frame, consuming nothing beyond it.
///
/// This is what handshakes use: after the frame the stream may switch to
/// carrying raw relay bytes, so no read-ahead buffering is allowed.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame, CodecError> {
    let mut header = [0u8; HEADER_LEN];

    // EOF before the first byte is a clean close, anything later is a short read
    if reader.read(&mut header[..1]).await? == 0 {
        return Err(CodecError::Closed);
    }
    read_full(reader, &mut header[1..]).await?;

    let length = u16::from_be_bytes([header[1], header[2]]) as usize;
    let mut payload = BytesMut::zeroed(length);
    read_full(reader, &mut payload).await?;

    Ok(Frame {
        packet_type: header[0],
        payload: payload.freeze(),
    })
}

/// Read one frame and parse it into a message
pub async fn read_message<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<ControlMessage, CodecError> {
    let frame = read_frame(reader).await?;
    ControlMessage::from_frame(&frame)
}

/// Encode and write one message, then flush
pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &ControlMessage,
) -> Result<(), CodecError> {
    let bytes = msg.encode()?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_full<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> Result<(), CodecError> {
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(CodecError::ShortRead),
        Err(e) => Err(e.into()),
    }
}

/// Frame codec for streams that carry nothing but frames
#[derive(Debug, Default)]
pub struct FrameCodec;

impl FrameCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        // Peek at the length without consuming
        let length = u16::from_be_bytes([src[1], src[2]]) as usize;
        let total_len = HEADER_LEN + length;
        if src.len() < total_len {
            src.reserve(total_len - src.len());
            return Ok(None);
        }

        let packet_type = src[0];
        src.advance(HEADER_LEN);
        let payload = src.split_to(length).freeze();

        Ok(Some(Frame {
            packet_type,
            payload,
        }))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None if buf.is_empty() => Ok(None),
            None => Err(CodecError::ShortRead),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(CodecError::PayloadTooLarge(item.payload.len()));
        }
        item.write_to(dst);
        Ok(())
    }
}

/// Frame codec that also parses payloads into [`ControlMessage`]s
#[derive(Debug, Default)]
pub struct MessageCodec {
    frames: FrameCodec,
}

impl MessageCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for MessageCodec {
    type Item = ControlMessage;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.frames
            .decode(src)?
            .map(|frame| ControlMessage::from_frame(&frame))
            .transpose()
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.frames
            .decode_eof(buf)?
            .map(|frame| ControlMessage::from_frame(&frame))
            .transpose()
    }
}

impl Encoder<ControlMessage> for MessageCodec {
    type Error = CodecError;

    fn encode(&mut self, item: ControlMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let frame = item.to_frame()?;
        self.frames.encode(frame, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{
        Exchange, Heartbeat, Login, ProxyCancel, ProxyRequest, ProxyResponse, ProxyType,
        UdpDatagram,
    };

    fn sample_messages() -> Vec<ControlMessage> {
        vec![
            Login {
                token: "abc".to_string(),
                version: "0.1.0".to_string(),
                timestamp: 1_700_000_000,
            }
            .into(),
            Heartbeat {}.into(),
            ProxyRequest {
                remote_port: 9000,
                proxy_name: "web".to_string(),
                subdomain: "myapp".to_string(),
                proxy_type: ProxyType::Tcp,
            }
            .into(),
            ProxyResponse::success(Some("myapp.example.com".to_string())).into(),
            ProxyCancel {
                proxy_name: "web".to_string(),
                remote_port: 9000,
            }
            .into(),
            Exchange {
                conn_id: "ab12cd34".to_string(),
                proxy_type: ProxyType::Udp,
            }
            .into(),
            UdpDatagram {
                payload: vec![0, 1, 2, 255],
                addr: Some("10.0.0.1:5000".parse().unwrap()),
            }
            .into(),
        ]
    }

    #[tokio::test]
    async fn test_roundtrip_over_stream() {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);

        for msg in sample_messages() {
            write_message(&mut client, &msg).await.unwrap();
            let decoded = read_message(&mut server).await.unwrap();
            assert_eq!(decoded, msg);
        }
    }

    #[test]
    fn test_header_layout() {
        let bytes = ControlMessage::from(Heartbeat {}).encode().unwrap();
        assert_eq!(&bytes[..], &[0x02, 0x00, 0x02, b'{', b'}']);
    }

    #[test]
    fn test_payload_too_large() {
        let msg = ControlMessage::from(UdpDatagram {
            payload: vec![7u8; MAX_PAYLOAD_SIZE],
            addr: None,
        });
        assert!(matches!(msg.encode(), Err(CodecError::PayloadTooLarge(_))));
        assert!(matches!(
            Frame::new(0x02, vec![0u8; MAX_PAYLOAD_SIZE + 1]),
            Err(CodecError::PayloadTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn test_length_larger_than_available_is_short_read() {
        // Header promises 10 bytes, only 4 arrive before close
        let bytes: &[u8] = &[0x02, 0x00, 0x0a, b'{', b'}', b' ', b' '];
        let mut reader = bytes;
        assert!(matches!(
            read_frame(&mut reader).await,
            Err(CodecError::ShortRead)
        ));
    }

    #[tokio::test]
    async fn test_truncated_header_is_short_read() {
        let bytes: &[u8] = &[0x04, 0x00];
        let mut reader = bytes;
        assert!(matches!(
            read_frame(&mut reader).await,
            Err(CodecError::ShortRead)
        ));
    }

    #[tokio::test]
    async fn test_clean_eof_is_closed() {
        let mut reader: &[u8] = &[];
        assert!(matches!(read_frame(&mut reader).await, Err(CodecError::Closed)));
    }

    #[tokio::test]
    async fn test_read_frame_does_not_over_read() {
        let mut bytes = ControlMessage::from(Exchange {
            conn_id: "ab12cd34".to_string(),
            proxy_type: ProxyType::Tcp,
        })
        .encode()
        .unwrap()
        .to_vec();
        bytes.extend_from_slice(b"raw relay bytes");

        let mut reader = &bytes[..];
        let msg = read_message(&mut reader).await.unwrap();
        assert_eq!(msg.packet_type(), PacketType::Exchange);
        assert_eq!(reader, b"raw relay bytes");
    }

    #[tokio::test]
    async fn test_unknown_type_is_returned_as_frame() {
        let bytes: &[u8] = &[0x42, 0x00, 0x02, b'{', b'}'];
        let mut reader = bytes;
        let frame = read_frame(&mut reader).await.unwrap();
        assert_eq!(frame.packet_type, 0x42);
        assert_eq!(frame.kind(), None);
        assert!(matches!(
            ControlMessage::from_frame(&frame),
            Err(CodecError::UnknownType(0x42))
        ));
    }

    #[test]
    fn test_partial_frame() {
        let mut codec = MessageCodec::new();
        let msg = ControlMessage::from(ProxyCancel {
            proxy_name: String::new(),
            remote_port: 12345,
        });

        let mut buf = BytesMut::new();
        codec.encode(msg.clone(), &mut buf).unwrap();

        // Split the buffer in half
        let full_len = buf.len();
        let mut partial = buf.split_to(full_len / 2);

        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.unsplit(buf);

        let decoded = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(decoded, msg);
        assert!(partial.is_empty());
    }

    #[test]
    fn test_two_frames_in_one_buffer_decode_separately() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(Heartbeat {}.into(), &mut buf).unwrap();
        codec
            .encode(ProxyResponse::failed().into(), &mut buf)
            .unwrap();

        assert_eq!(
            codec.decode(&mut buf).unwrap().unwrap().packet_type(),
            PacketType::Heartbeat
        );
        assert_eq!(
            codec.decode(&mut buf).unwrap().unwrap().packet_type(),
            PacketType::ProxyResponse
        );
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_decode_eof_with_leftover_bytes() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&[0x02u8, 0x00, 0x05, b'{'][..]);
        assert!(matches!(
            codec.decode_eof(&mut buf),
            Err(CodecError::ShortRead)
        ));

        let mut empty = BytesMut::new();
        assert!(codec.decode_eof(&mut empty).unwrap().is_none());
    }

    #[test]
    fn test_mismatched_payload_is_json_error() {
        // ProxyRequest type byte with a payload that is not JSON
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::from(&[0x03u8, 0x00, 0x03, b'x', b'y', b'z'][..]);
        assert!(matches!(codec.decode(&mut buf), Err(CodecError::Json(_))));
    }
}
