//! Wire protocol: frame header, framing and message bodies.
//!
//! Every message is a fixed-layout header immediately followed by
//! `payload_length` raw bytes. All integers are big-endian.
//!
//! ```text
//! offset  size  field
//!      0     4  magic "SVCM"
//!      4     1  protocol version
//!      5     1  message kind
//!      6     2  header_length (total header bytes)
//!      8     4  payload_length
//!     12     8  call_id (0 for handshake frames)
//!     20     …  header bytes appended by newer versions (skipped)
//! ```
//!
//! Reading is incremental: the first 8 bytes carry `header_length`, the rest
//! of the header is read (unknown trailing bytes are discarded), then exactly
//! `payload_length` payload bytes.

use crate::config::ProtocolConfig;
use crate::{Result, ServiceError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

/// Kind of a frame, byte 5 of the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    HandshakeRequest = 1,
    HandshakeResponse = 2,
    Request = 3,
    Response = 4,
}

impl MessageKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(MessageKind::HandshakeRequest),
            2 => Some(MessageKind::HandshakeResponse),
            3 => Some(MessageKind::Request),
            4 => Some(MessageKind::Response),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKind::HandshakeRequest => write!(f, "HandshakeRequest"),
            MessageKind::HandshakeResponse => write!(f, "HandshakeResponse"),
            MessageKind::Request => write!(f, "Request"),
            MessageKind::Response => write!(f, "Response"),
        }
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u8,
    pub kind: MessageKind,
    pub header_length: u16,
    pub payload_length: u32,
    pub call_id: u64,
}

impl FrameHeader {
    pub fn new(version: u8, kind: MessageKind, payload_length: u32, call_id: u64) -> Self {
        Self {
            version,
            kind,
            header_length: ProtocolConfig::HEADER_LEN as u16,
            payload_length,
            call_id,
        }
    }

    /// Append the header to `buf`. A `header_length` beyond the known layout
    /// is zero-padded.
    pub fn encode(&self, buf: &mut BytesMut) {
        let header_length = (self.header_length as usize).max(ProtocolConfig::HEADER_LEN);
        buf.reserve(header_length);
        buf.put_slice(&ProtocolConfig::HEADER_MAGIC);
        buf.put_u8(self.version);
        buf.put_u8(self.kind.as_u8());
        buf.put_u16(header_length as u16);
        buf.put_u32(self.payload_length);
        buf.put_u64(self.call_id);
        buf.put_bytes(0, header_length - ProtocolConfig::HEADER_LEN);
    }

    /// Parse the first [`ProtocolConfig::HEADER_PREFIX_LEN`] bytes.
    ///
    /// Returns `(version, kind, header_length)`.
    pub fn decode_prefix(prefix: &[u8]) -> Result<(u8, MessageKind, u16)> {
        if prefix.len() < ProtocolConfig::HEADER_PREFIX_LEN {
            return Err(ServiceError::malformed(format!(
                "header prefix has {} bytes, need {}",
                prefix.len(),
                ProtocolConfig::HEADER_PREFIX_LEN
            )));
        }
        let mut buf = prefix;
        let mut magic = [0u8; 4];
        buf.copy_to_slice(&mut magic);
        if magic != ProtocolConfig::HEADER_MAGIC {
            return Err(ServiceError::malformed(format!(
                "bad header magic {:02x?}",
                magic
            )));
        }
        let version = buf.get_u8();
        let raw_kind = buf.get_u8();
        let kind = MessageKind::from_u8(raw_kind)
            .ok_or_else(|| ServiceError::malformed(format!("unknown message kind {}", raw_kind)))?;
        let header_length = buf.get_u16();
        if (header_length as usize) < ProtocolConfig::HEADER_LEN {
            return Err(ServiceError::malformed(format!(
                "header_length {} is shorter than the {} byte layout",
                header_length,
                ProtocolConfig::HEADER_LEN
            )));
        }
        Ok((version, kind, header_length))
    }

    /// Parse a complete header. Bytes past the known layout are ignored.
    pub fn decode(header: &[u8]) -> Result<Self> {
        let (version, kind, header_length) = Self::decode_prefix(header)?;
        if header.len() < header_length as usize {
            return Err(ServiceError::malformed(format!(
                "header has {} bytes, header_length says {}",
                header.len(),
                header_length
            )));
        }
        let mut rest = &header[ProtocolConfig::HEADER_PREFIX_LEN..];
        let payload_length = rest.get_u32();
        let call_id = rest.get_u64();
        Ok(Self {
            version,
            kind,
            header_length,
            payload_length,
            call_id,
        })
    }
}

/// A header plus its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(version: u8, kind: MessageKind, call_id: u64, payload: Bytes) -> Self {
        Self {
            header: FrameHeader::new(version, kind, payload.len() as u32, call_id),
            payload,
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.header.kind
    }

    pub fn call_id(&self) -> u64 {
        self.header.call_id
    }

    pub fn handshake_request(min_version: u8, max_version: u8) -> Self {
        let body = HandshakeRequest {
            min_version,
            max_version,
        };
        // The handshake is sent before a version is agreed; it carries the
        // lowest version the sender speaks.
        Self::new(min_version, MessageKind::HandshakeRequest, 0, body.encode())
    }

    pub fn handshake_response(version: u8, accepted_version: u8) -> Self {
        let body = HandshakeResponse { accepted_version };
        Self::new(version, MessageKind::HandshakeResponse, 0, body.encode())
    }

    pub fn request(version: u8, call_id: u64, body: &RequestBody) -> Self {
        Self::new(version, MessageKind::Request, call_id, body.encode())
    }

    pub fn response(version: u8, call_id: u64, body: &ResponseBody) -> Self {
        Self::new(version, MessageKind::Response, call_id, body.encode())
    }

    /// Encode header and payload into one contiguous buffer.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(ProtocolConfig::HEADER_LEN + self.payload.len());
        self.header.encode(&mut buf);
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}

fn check_payload_size(payload_length: usize, max_payload_size: usize) -> Result<()> {
    if payload_length > max_payload_size {
        return Err(ServiceError::malformed(format!(
            "payload size {} exceeds maximum {}",
            payload_length, max_payload_size
        )));
    }
    Ok(())
}

/// Check that a payload of `len` bytes fits in a frame and under `max`.
///
/// Used on the sending side so an oversized message fails on its own
/// instead of producing a frame the peer would treat as malformed.
pub fn check_outbound_size(len: usize, max_payload_size: usize) -> Result<()> {
    let limit = max_payload_size.min(u32::MAX as usize);
    if len > limit {
        return Err(ServiceError::InvalidRequest {
            message: format!("payload of {} bytes exceeds the limit of {}", len, limit),
        });
    }
    Ok(())
}

fn mid_frame_error(err: std::io::Error, what: &str) -> ServiceError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        ServiceError::disconnected(format!("peer closed the connection while sending {}", what))
    } else {
        err.into()
    }
}

/// A frame taken off a session's read loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Frame(Frame),
    /// The payload exceeded the reader's limit and was discarded unread.
    Oversized(FrameHeader),
}

async fn read_header<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<FrameHeader>> {
    let mut header_buf = vec![0u8; ProtocolConfig::HEADER_LEN];
    match reader
        .read_exact(&mut header_buf[..ProtocolConfig::HEADER_PREFIX_LEN])
        .await
    {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let (_, _, header_length) = FrameHeader::decode_prefix(&header_buf)?;
    let header_length = header_length as usize;
    if header_length > header_buf.len() {
        header_buf.resize(header_length, 0);
    }
    reader
        .read_exact(&mut header_buf[ProtocolConfig::HEADER_PREFIX_LEN..header_length])
        .await
        .map_err(|e| mid_frame_error(e, "a header"))?;

    FrameHeader::decode(&header_buf).map(Some)
}

async fn read_payload<R: AsyncRead + Unpin>(reader: &mut R, header: FrameHeader) -> Result<Frame> {
    let mut payload = BytesMut::zeroed(header.payload_length as usize);
    if !payload.is_empty() {
        reader
            .read_exact(&mut payload)
            .await
            .map_err(|e| mid_frame_error(e, "a payload"))?;
    }
    Ok(Frame {
        header,
        payload: payload.freeze(),
    })
}

/// Read one frame from an async reader.
///
/// Returns `None` on clean EOF (peer closed connection before a new frame).
/// A payload over `max_payload_size` is malformed.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_payload_size: usize,
) -> Result<Option<Frame>> {
    let Some(header) = read_header(reader).await? else {
        return Ok(None);
    };
    check_payload_size(header.payload_length as usize, max_payload_size)?;
    read_payload(reader, header).await.map(Some)
}

/// Like [`read_frame`], but an oversized payload is drained from the
/// stream and reported as [`Inbound::Oversized`], keeping the stream in
/// sync so the caller can fail just that call.
pub async fn read_inbound<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_payload_size: usize,
) -> Result<Option<Inbound>> {
    let Some(header) = read_header(reader).await? else {
        return Ok(None);
    };
    if check_payload_size(header.payload_length as usize, max_payload_size).is_ok() {
        return read_payload(reader, header).await.map(|f| Some(Inbound::Frame(f)));
    }

    let expected = u64::from(header.payload_length);
    let mut rest = (&mut *reader).take(expected);
    let drained = tokio::io::copy(&mut rest, &mut tokio::io::sink()).await?;
    if drained < expected {
        return Err(ServiceError::disconnected(
            "peer closed the connection while sending a payload",
        ));
    }
    Ok(Some(Inbound::Oversized(header)))
}

/// Write one frame to an async writer.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, frame: &Frame) -> Result<()> {
    let mut header = BytesMut::with_capacity(ProtocolConfig::HEADER_LEN);
    frame.header.encode(&mut header);
    writer.write_all(&header).await?;
    writer.write_all(&frame.payload).await?;
    writer.flush().await?;
    Ok(())
}

// ========================================
// Message bodies
// ========================================

/// Payload of a HandshakeRequest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeRequest {
    pub min_version: u8,
    pub max_version: u8,
}

impl HandshakeRequest {
    pub fn encode(&self) -> Bytes {
        Bytes::copy_from_slice(&[self.min_version, self.max_version])
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        match payload {
            [min_version, max_version, ..] => Ok(Self {
                min_version: *min_version,
                max_version: *max_version,
            }),
            _ => Err(ServiceError::malformed(format!(
                "handshake request payload has {} bytes, need 2",
                payload.len()
            ))),
        }
    }
}

/// Payload of a HandshakeResponse. Version 0 is the rejection marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeResponse {
    pub accepted_version: u8,
}

impl HandshakeResponse {
    pub fn rejected() -> Self {
        Self {
            accepted_version: ProtocolConfig::VERSION_REJECTED,
        }
    }

    pub fn is_rejected(&self) -> bool {
        self.accepted_version == ProtocolConfig::VERSION_REJECTED
    }

    pub fn encode(&self) -> Bytes {
        Bytes::copy_from_slice(&[self.accepted_version])
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        payload
            .first()
            .map(|v| Self {
                accepted_version: *v,
            })
            .ok_or_else(|| ServiceError::malformed("empty handshake response payload"))
    }
}

/// Pick the highest version both ranges contain.
pub fn negotiate_version(
    local_min: u8,
    local_max: u8,
    remote_min: u8,
    remote_max: u8,
) -> Option<u8> {
    let low = local_min.max(remote_min);
    let high = local_max.min(remote_max);
    (high >= low && high != ProtocolConfig::VERSION_REJECTED).then_some(high)
}

/// Payload of a Request: method name plus opaque request bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestBody {
    pub method: String,
    pub payload: Bytes,
}

impl RequestBody {
    pub fn new(method: impl Into<String>, payload: Bytes) -> Self {
        Self {
            method: method.into(),
            payload,
        }
    }

    /// Size of the encoded body.
    pub fn encoded_len(&self) -> usize {
        2 + self.method.len() + self.payload.len()
    }

    /// Check the body can be encoded and fits under `max_payload_size`.
    pub fn validate(&self, max_payload_size: usize) -> Result<()> {
        if self.method.len() > u16::MAX as usize {
            return Err(ServiceError::InvalidRequest {
                message: format!(
                    "method name of {} bytes exceeds the limit of {}",
                    self.method.len(),
                    u16::MAX
                ),
            });
        }
        check_outbound_size(self.encoded_len(), max_payload_size)
    }

    /// Encode the body. Callers run [`RequestBody::validate`] first; the
    /// method length field is only 16 bits wide.
    pub fn encode(&self) -> Bytes {
        debug_assert!(self.method.len() <= u16::MAX as usize);
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u16(self.method.len() as u16);
        buf.put_slice(self.method.as_bytes());
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.remaining() < 2 {
            return Err(ServiceError::malformed("request payload too short"));
        }
        let method_len = payload.get_u16() as usize;
        if payload.remaining() < method_len {
            return Err(ServiceError::malformed(format!(
                "request method name needs {} bytes, {} left",
                method_len,
                payload.remaining()
            )));
        }
        let method = String::from_utf8(payload.split_to(method_len).to_vec())
            .map_err(|_| ServiceError::malformed("request method name is not UTF-8"))?;
        Ok(Self { method, payload })
    }
}

/// Status byte of a Response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResponseStatus {
    Ok = 0,
    HandlerMissing = 1,
    HandlerFailed = 2,
    /// Refused before dispatch, e.g. a request over the receiver's size limit.
    Rejected = 3,
}

impl ResponseStatus {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ResponseStatus::Ok),
            1 => Some(ResponseStatus::HandlerMissing),
            2 => Some(ResponseStatus::HandlerFailed),
            3 => Some(ResponseStatus::Rejected),
            _ => None,
        }
    }
}

/// Payload of a Response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseBody {
    pub status: ResponseStatus,
    pub ret_state: i32,
    pub error: Option<String>,
    pub payload: Bytes,
}

impl ResponseBody {
    pub fn ok(ret_state: i32, payload: Bytes) -> Self {
        Self {
            status: ResponseStatus::Ok,
            ret_state,
            error: None,
            payload,
        }
    }

    pub fn handler_missing(method: &str) -> Self {
        Self {
            status: ResponseStatus::HandlerMissing,
            ret_state: 0,
            error: Some(format!("method {} not found", method)),
            payload: Bytes::new(),
        }
    }

    pub fn handler_failed(message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::HandlerFailed,
            ret_state: 0,
            error: Some(message.into()),
            payload: Bytes::new(),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Rejected,
            ret_state: 0,
            error: Some(message.into()),
            payload: Bytes::new(),
        }
    }

    pub fn encoded_len(&self) -> usize {
        9 + self.error.as_deref().map_or(0, str::len) + self.payload.len()
    }

    pub fn encode(&self) -> Bytes {
        let error = self.error.as_deref().unwrap_or_default();
        let mut buf = BytesMut::with_capacity(9 + error.len() + self.payload.len());
        buf.put_u8(self.status as u8);
        buf.put_i32(self.ret_state);
        buf.put_u32(error.len() as u32);
        buf.put_slice(error.as_bytes());
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.remaining() < 9 {
            return Err(ServiceError::malformed("response payload too short"));
        }
        let raw_status = payload.get_u8();
        let status = ResponseStatus::from_u8(raw_status).ok_or_else(|| {
            ServiceError::malformed(format!("unknown response status {}", raw_status))
        })?;
        let ret_state = payload.get_i32();
        let error_len = payload.get_u32() as usize;
        if payload.remaining() < error_len {
            return Err(ServiceError::malformed(format!(
                "response error text needs {} bytes, {} left",
                error_len,
                payload.remaining()
            )));
        }
        let error_bytes = payload.split_to(error_len);
        let error = if error_bytes.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&error_bytes).into_owned())
        };
        Ok(Self {
            status,
            ret_state,
            error,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: usize = ProtocolConfig::DEFAULT_MAX_PAYLOAD_SIZE;

    fn payload_of(len: usize) -> Bytes {
        (0..len).map(|i| (i % 251) as u8).collect::<Vec<_>>().into()
    }

    #[tokio::test]
    async fn test_frame_read_write_preserves_kind_and_payload() {
        // 0, 1, mid-size and larger than any socket buffer
        for len in [0usize, 1, 4096, 3 * 1024 * 1024] {
            let frame = Frame::new(1, MessageKind::Request, 7, payload_of(len));
            let mut buf = Vec::new();
            write_frame(&mut buf, &frame).await.unwrap();
            assert_eq!(buf.len(), ProtocolConfig::HEADER_LEN + len);

            let mut cursor = std::io::Cursor::new(buf);
            let read_back = read_frame(&mut cursor, MAX).await.unwrap().unwrap();
            assert_eq!(read_back.kind(), MessageKind::Request);
            assert_eq!(read_back.call_id(), 7);
            assert_eq!(read_back.payload, frame.payload);
        }
    }

    #[tokio::test]
    async fn test_frame_read_over_duplex_larger_than_pipe() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let frame = Frame::new(1, MessageKind::Response, 99, payload_of(256 * 1024));
        let expected = frame.clone();
        let writer = tokio::spawn(async move { write_frame(&mut a, &frame).await });
        let read_back = read_frame(&mut b, MAX).await.unwrap().unwrap();
        writer.await.unwrap().unwrap();
        assert_eq!(read_back, expected);
    }

    #[tokio::test]
    async fn test_frame_read_empty_stream_returns_none() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        assert!(read_frame(&mut cursor, MAX).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_frame_read_truncated_payload_is_disconnect() {
        let frame = Frame::new(1, MessageKind::Request, 1, payload_of(32));
        let mut bytes = frame.encode().to_vec();
        bytes.truncate(bytes.len() - 5);
        let mut cursor = std::io::Cursor::new(bytes);
        let err = read_frame(&mut cursor, MAX).await.unwrap_err();
        assert!(matches!(err, ServiceError::Disconnected { .. }));
    }

    #[tokio::test]
    async fn test_frame_read_oversized_returns_error() {
        let frame = Frame::new(1, MessageKind::Request, 1, payload_of(64));
        let mut cursor = std::io::Cursor::new(frame.encode().to_vec());
        let err = read_frame(&mut cursor, 16).await.unwrap_err();
        assert!(matches!(err, ServiceError::MalformedMessage { .. }));
    }

    #[tokio::test]
    async fn test_longer_header_is_skipped() {
        let mut frame = Frame::new(2, MessageKind::Response, 5, Bytes::from_static(b"abc"));
        frame.header.header_length = 32;
        let mut buf = Vec::new();
        write_frame(&mut buf, &frame).await.unwrap();
        assert_eq!(buf.len(), 32 + 3);

        let mut cursor = std::io::Cursor::new(buf);
        let read_back = read_frame(&mut cursor, MAX).await.unwrap().unwrap();
        assert_eq!(read_back.header.header_length, 32);
        assert_eq!(read_back.call_id(), 5);
        assert_eq!(&read_back.payload[..], b"abc");
    }

    #[test]
    fn test_bad_magic_and_kind_are_malformed() {
        let mut bytes = Frame::new(1, MessageKind::Request, 1, Bytes::new())
            .encode()
            .to_vec();
        bytes[0] = b'X';
        assert!(matches!(
            FrameHeader::decode(&bytes),
            Err(ServiceError::MalformedMessage { .. })
        ));

        let mut bytes = Frame::new(1, MessageKind::Request, 1, Bytes::new())
            .encode()
            .to_vec();
        bytes[5] = 9;
        assert!(FrameHeader::decode(&bytes).is_err());

        let mut bytes = Frame::new(1, MessageKind::Request, 1, Bytes::new())
            .encode()
            .to_vec();
        bytes[6..8].copy_from_slice(&10u16.to_be_bytes());
        assert!(FrameHeader::decode(&bytes).is_err());
    }

    #[tokio::test]
    async fn test_oversized_inbound_is_drained() {
        let big = Frame::new(1, MessageKind::Request, 1, payload_of(4096));
        let next = Frame::new(1, MessageKind::Request, 2, Bytes::from_static(b"next"));
        let mut stream = big.encode().to_vec();
        stream.extend_from_slice(&next.encode());

        let mut cursor = std::io::Cursor::new(stream);
        match read_inbound(&mut cursor, 1024).await.unwrap().unwrap() {
            Inbound::Oversized(header) => {
                assert_eq!(header.call_id, 1);
                assert_eq!(header.payload_length, 4096);
            }
            other => panic!("expected oversized frame, got {:?}", other),
        }
        assert_eq!(
            read_inbound(&mut cursor, 1024).await.unwrap().unwrap(),
            Inbound::Frame(next)
        );
        assert!(read_inbound(&mut cursor, 1024).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_inbound_cut_short_is_disconnect() {
        let mut bytes = Frame::new(1, MessageKind::Request, 1, payload_of(4096))
            .encode()
            .to_vec();
        bytes.truncate(ProtocolConfig::HEADER_LEN + 100);
        let mut cursor = std::io::Cursor::new(bytes);
        let err = read_inbound(&mut cursor, 1024).await.unwrap_err();
        assert!(matches!(err, ServiceError::Disconnected { .. }));
    }

    #[test]
    fn test_request_validate_limits() {
        let body = RequestBody::new("Echo", payload_of(100));
        assert_eq!(body.encoded_len(), body.encode().len());
        assert!(body.validate(MAX).is_ok());
        assert!(matches!(
            body.validate(50),
            Err(ServiceError::InvalidRequest { .. })
        ));

        let long_name = RequestBody::new("m".repeat(u16::MAX as usize + 1), Bytes::new());
        let err = long_name.validate(usize::MAX).unwrap_err();
        assert!(matches!(err, ServiceError::InvalidRequest { .. }));
        assert!(err.to_string().contains("method name"));

        let widest = RequestBody::new("m".repeat(u16::MAX as usize), Bytes::new());
        assert!(widest.validate(MAX).is_ok());
        let decoded = RequestBody::decode(widest.encode()).unwrap();
        assert_eq!(decoded.method.len(), u16::MAX as usize);
    }

    #[test]
    fn test_outbound_size_capped_at_frame_width() {
        assert!(check_outbound_size(u32::MAX as usize, usize::MAX).is_ok());
        assert!(check_outbound_size(u32::MAX as usize + 1, usize::MAX).is_err());
    }

    #[test]
    fn test_request_body_roundtrip() {
        let body = RequestBody::new("Echo", Bytes::from_static(b"Hello"));
        let decoded = RequestBody::decode(body.encode()).unwrap();
        assert_eq!(decoded, body);

        assert!(RequestBody::decode(Bytes::from_static(&[0, 9, b'a'])).is_err());
    }

    #[test]
    fn test_response_body_roundtrip() {
        let ok = ResponseBody::ok(3, Bytes::from_static(b"pong"));
        assert_eq!(ResponseBody::decode(ok.encode()).unwrap(), ok);

        let missing = ResponseBody::handler_missing("Nope");
        let decoded = ResponseBody::decode(missing.encode()).unwrap();
        assert_eq!(decoded.status, ResponseStatus::HandlerMissing);
        assert!(decoded.error.unwrap().contains("Nope"));

        let rejected = ResponseBody::rejected("too large");
        assert_eq!(rejected.encoded_len(), rejected.encode().len());
        let decoded = ResponseBody::decode(rejected.encode()).unwrap();
        assert_eq!(decoded.status, ResponseStatus::Rejected);

        assert!(ResponseBody::decode(Bytes::from_static(&[7, 0, 0, 0, 0, 0, 0, 0, 0])).is_err());
    }

    #[test]
    fn test_handshake_bodies() {
        let req = HandshakeRequest::decode(&HandshakeRequest {
            min_version: 1,
            max_version: 3,
        }
        .encode())
        .unwrap();
        assert_eq!((req.min_version, req.max_version), (1, 3));
        assert!(HandshakeRequest::decode(&[1]).is_err());

        assert!(HandshakeResponse::decode(&HandshakeResponse::rejected().encode())
            .unwrap()
            .is_rejected());
        assert!(HandshakeResponse::decode(&[]).is_err());
    }

    #[test]
    fn test_negotiate_version() {
        assert_eq!(negotiate_version(1, 1, 1, 1), Some(1));
        assert_eq!(negotiate_version(1, 3, 2, 5), Some(3));
        assert_eq!(negotiate_version(1, 2, 3, 4), None);
        assert_eq!(negotiate_version(0, 0, 0, 0), None);
    }
}
