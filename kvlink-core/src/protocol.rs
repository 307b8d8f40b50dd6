//! Wire protocol between engines and the rendezvous service.
//!
//! Frame layout (11 bytes of preamble):
//! ```text
//! [u16 BE: version][u8: kind][u32 BE: header_len][u32 BE: payload_len][header][payload]
//! ```
//! The header is a bincode-encoded [`Message`]; the payload carries raw
//! transfer data and is empty for control messages.

use std::io;

use bincode::{Decode, Encode};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::TransferError;
use crate::status;
use crate::types::{MemType, TransferOp};

pub const PROTOCOL_VERSION: u16 = 1;

/// Maximum header + payload size of one frame (128 MiB).
pub const MAX_FRAME_SIZE: u32 = 128 * 1024 * 1024;

const PREAMBLE_LEN: usize = 2 + 1 + 4 + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    Connect = 1,
    Disconnect = 2,
    Status = 3,
    Connected = 4,
    Heartbeat = 5,
    Transfer = 6,
    GetSegments = 7,
    Segments = 8,
    GetMetadata = 9,
    Metadata = 10,
    Store = 11,
    StoreReply = 12,
}

impl MessageKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        let kind = match value {
            1 => Self::Connect,
            2 => Self::Disconnect,
            3 => Self::Status,
            4 => Self::Connected,
            5 => Self::Heartbeat,
            6 => Self::Transfer,
            7 => Self::GetSegments,
            8 => Self::Segments,
            9 => Self::GetMetadata,
            10 => Self::Metadata,
            11 => Self::Store,
            12 => Self::StoreReply,
            _ => return None,
        };
        Some(kind)
    }
}

/// A registered region as advertised to peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct SegmentInfo {
    pub addr: u64,
    pub len: u64,
    pub mem_type: MemType,
}

/// Handshake body exchanged on connect, in both directions.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct ConnectInfo {
    /// Sender's listen string, or a unique id for client-only engines.
    pub channel_id: String,
    pub comm_res: String,
    pub timeout_ms: u64,
    pub segments: Vec<SegmentInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StatusInfo {
    pub code: u32,
    pub message: String,
}

impl StatusInfo {
    pub fn ok() -> Self {
        Self {
            code: status::SUCCESS,
            message: String::new(),
        }
    }

    pub fn from_error(err: &TransferError) -> Self {
        Self {
            code: err.status_code(),
            message: err.to_string(),
        }
    }

    pub fn into_result(self) -> Result<(), TransferError> {
        match TransferError::from_status(self.code, self.message) {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }
}

/// One remote byte range of a transfer batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct Span {
    pub addr: u64,
    pub len: u64,
}

/// A batch of remote ranges. WRITE frames carry the concatenated data as
/// payload; READ replies carry it on the `Status` frame.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct TransferRequest {
    pub op: TransferOp,
    pub spans: Vec<Span>,
}

impl TransferRequest {
    /// Sum of all span lengths; peer-supplied lengths may overflow `u64`.
    pub fn total_len(&self) -> Result<u64, TransferError> {
        self.spans
            .iter()
            .try_fold(0u64, |acc, s| acc.checked_add(s.len))
            .ok_or_else(|| {
                TransferError::InvalidArgument("transfer span lengths overflow u64".to_string())
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum StoreRequest {
    Set { key: String, value: Vec<u8> },
    /// Wait up to `wait_ms` for the key to appear; 0 returns immediately.
    Get { key: String, wait_ms: u64 },
    Add { key: String, delta: i64 },
    Delete { key: String },
    Barrier {
        name: String,
        world_size: u32,
        timeout_ms: u64,
    },
    List { prefix: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum StoreReply {
    Value(Option<Vec<u8>>),
    Counter(i64),
    Deleted(bool),
    Released,
    Keys(Vec<String>),
    Error(StatusInfo),
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum Message {
    Connect(ConnectInfo),
    Connected(ConnectInfo),
    Disconnect { channel_id: String },
    Status(StatusInfo),
    Heartbeat,
    Transfer(TransferRequest),
    GetSegments,
    Segments(Vec<SegmentInfo>),
    GetMetadata { key: String },
    Metadata { value: Option<Vec<u8>> },
    Store(StoreRequest),
    StoreReply(StoreReply),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Connect(_) => MessageKind::Connect,
            Message::Connected(_) => MessageKind::Connected,
            Message::Disconnect { .. } => MessageKind::Disconnect,
            Message::Status(_) => MessageKind::Status,
            Message::Heartbeat => MessageKind::Heartbeat,
            Message::Transfer(_) => MessageKind::Transfer,
            Message::GetSegments => MessageKind::GetSegments,
            Message::Segments(_) => MessageKind::Segments,
            Message::GetMetadata { .. } => MessageKind::GetMetadata,
            Message::Metadata { .. } => MessageKind::Metadata,
            Message::Store(_) => MessageKind::Store,
            Message::StoreReply(_) => MessageKind::StoreReply,
        }
    }
}

/// A decoded frame: control message plus optional data payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub message: Message,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(message: Message) -> Self {
        Self {
            message,
            payload: Bytes::new(),
        }
    }

    pub fn with_payload(message: Message, payload: Bytes) -> Self {
        Self { message, payload }
    }
}

impl From<Message> for Frame {
    fn from(message: Message) -> Self {
        Frame::new(message)
    }
}

fn invalid_data(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

fn validate_lengths(header_len: u32, payload_len: u32) -> io::Result<()> {
    let total = header_len
        .checked_add(payload_len)
        .ok_or_else(|| invalid_data("frame size overflow"))?;
    if total > MAX_FRAME_SIZE {
        return Err(invalid_data(format!(
            "frame size {total} exceeds maximum {MAX_FRAME_SIZE}"
        )));
    }
    Ok(())
}

/// Length-delimited codec for [`Frame`]s.
#[derive(Debug, Clone, Default)]
pub struct FrameCodec {
    state: DecodeState,
}

#[derive(Debug, Clone, Copy, Default)]
enum DecodeState {
    #[default]
    AwaitingPreamble,
    AwaitingBody {
        kind: MessageKind,
        header_len: u32,
        payload_len: u32,
    },
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state {
                DecodeState::AwaitingPreamble => {
                    if src.len() < PREAMBLE_LEN {
                        return Ok(None);
                    }

                    let version = u16::from_be_bytes([src[0], src[1]]);
                    if version != PROTOCOL_VERSION {
                        return Err(invalid_data(format!(
                            "unsupported protocol version {version} (expected {PROTOCOL_VERSION})"
                        )));
                    }
                    let kind = MessageKind::from_u8(src[2])
                        .ok_or_else(|| invalid_data(format!("invalid message kind {}", src[2])))?;
                    let header_len = u32::from_be_bytes([src[3], src[4], src[5], src[6]]);
                    let payload_len = u32::from_be_bytes([src[7], src[8], src[9], src[10]]);
                    validate_lengths(header_len, payload_len)?;

                    src.advance(PREAMBLE_LEN);
                    src.reserve((header_len + payload_len) as usize);
                    self.state = DecodeState::AwaitingBody {
                        kind,
                        header_len,
                        payload_len,
                    };
                }
                DecodeState::AwaitingBody {
                    kind,
                    header_len,
                    payload_len,
                } => {
                    if src.len() < (header_len + payload_len) as usize {
                        return Ok(None);
                    }

                    let header = src.split_to(header_len as usize);
                    let payload = src.split_to(payload_len as usize).freeze();
                    self.state = DecodeState::AwaitingPreamble;

                    // Length prefixes inside the header can never exceed the frame itself.
                    let config = bincode::config::standard()
                        .with_limit::<{ MAX_FRAME_SIZE as usize }>();
                    let (message, _): (Message, usize) =
                        bincode::decode_from_slice(&header[..], config)
                            .map_err(|e| invalid_data(format!("bad message header: {e}")))?;
                    if message.kind() != kind {
                        return Err(invalid_data(format!(
                            "message kind mismatch: preamble {:?}, header {:?}",
                            kind,
                            message.kind()
                        )));
                    }
                    return Ok(Some(Frame { message, payload }));
                }
            }
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let header = bincode::encode_to_vec(&frame.message, bincode::config::standard())
            .map_err(|e| invalid_data(format!("cannot encode message: {e}")))?;
        let header_len =
            u32::try_from(header.len()).map_err(|_| invalid_data("message header too large"))?;
        let payload_len = u32::try_from(frame.payload.len())
            .map_err(|_| invalid_data("frame payload too large"))?;
        validate_lengths(header_len, payload_len)?;

        dst.reserve(PREAMBLE_LEN + header.len() + frame.payload.len());
        dst.put_u16(PROTOCOL_VERSION);
        dst.put_u8(frame.message.kind() as u8);
        dst.put_u32(header_len);
        dst.put_u32(payload_len);
        dst.extend_from_slice(&header);
        dst.extend_from_slice(&frame.payload);
        Ok(())
    }
}
