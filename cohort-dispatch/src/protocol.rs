use std::mem;

use bytes::{BufMut, Bytes, BytesMut};

static HEADER_TERMINATOR: &[u8] = b"\r\n";

pub const KIND_SIZE: usize = 1;
pub const CORRELATION_ID_SIZE: usize = mem::size_of::<u64>();
pub const DATA_LEN_SIZE: usize = mem::size_of::<u32>();
pub const LEN_SIZE: usize = KIND_SIZE + CORRELATION_ID_SIZE + DATA_LEN_SIZE;
pub const HEADER_SIZE: usize = LEN_SIZE + 2;
pub const MESSAGE_KIND_REQUEST: u8 = 0;
pub const MESSAGE_KIND_REPLY_VALUE: u8 = 1;
pub const MESSAGE_KIND_REPLY_EXCEPTION: u8 = 2;
pub const MESSAGE_KIND_NO_SUCH_SERVICE: u8 = 3;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum FrameKind {
    /// An envelope to be executed by the receiver.
    Request,
    /// The marshalled output of a command.
    ReplyValue,
    /// The marshalled error of a command.
    ReplyException,
    /// The receiver has nothing registered which could handle the request.
    NoSuchService,
}

impl FrameKind {
    fn as_byte(self) -> u8 {
        match self {
            FrameKind::Request => MESSAGE_KIND_REQUEST,
            FrameKind::ReplyValue => MESSAGE_KIND_REPLY_VALUE,
            FrameKind::ReplyException => MESSAGE_KIND_REPLY_EXCEPTION,
            FrameKind::NoSuchService => MESSAGE_KIND_NO_SUCH_SERVICE,
        }
    }

    fn from_byte(kind: u8) -> Option<Self> {
        let kind = match kind {
            MESSAGE_KIND_REQUEST => FrameKind::Request,
            MESSAGE_KIND_REPLY_VALUE => FrameKind::ReplyValue,
            MESSAGE_KIND_REPLY_EXCEPTION => FrameKind::ReplyException,
            MESSAGE_KIND_NO_SUCH_SERVICE => FrameKind::NoSuchService,
            _ => return None,
        };

        Some(kind)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Frame {
    pub(crate) kind: FrameKind,
    pub(crate) correlation_id: u64,
    pub(crate) body: Bytes,
}

/// Parses a frame from a message payload.
///
/// Returns `None` if the payload does not match the frame layout.
pub(crate) fn parse_frame(buf: &Bytes) -> Option<Frame> {
    if buf.len() < HEADER_SIZE {
        return None;
    }

    let header = &buf[..HEADER_SIZE];
    if &header[LEN_SIZE..] != HEADER_TERMINATOR {
        return None;
    }

    let kind = FrameKind::from_byte(header[0])?;

    let id_bytes = &header[KIND_SIZE..KIND_SIZE + CORRELATION_ID_SIZE];
    let correlation_id = u64::from_le_bytes(id_bytes.try_into().ok()?);

    let data_size_bytes = &header[KIND_SIZE + CORRELATION_ID_SIZE..LEN_SIZE];
    let data_size = u32::from_le_bytes(data_size_bytes.try_into().ok()?) as usize;

    if buf.len() - HEADER_SIZE != data_size {
        return None;
    }

    Some(Frame {
        kind,
        correlation_id,
        body: buf.slice(HEADER_SIZE..),
    })
}

fn serialize_header(kind: FrameKind, correlation_id: u64, data_size: usize) -> [u8; HEADER_SIZE] {
    let mut header = [0; HEADER_SIZE];
    header[0] = kind.as_byte();
    header[KIND_SIZE..KIND_SIZE + CORRELATION_ID_SIZE]
        .copy_from_slice(&correlation_id.to_le_bytes());
    header[KIND_SIZE + CORRELATION_ID_SIZE..LEN_SIZE]
        .copy_from_slice(&(data_size as u32).to_le_bytes());
    header[LEN_SIZE..].copy_from_slice(HEADER_TERMINATOR);
    header
}

/// Serializes a frame into a single buffer.
pub(crate) fn encode_frame(kind: FrameKind, correlation_id: u64, body: &[u8]) -> Bytes {
    let header = serialize_header(kind, correlation_id, body.len());

    let mut buffer = BytesMut::with_capacity(HEADER_SIZE + body.len());
    buffer.put_slice(&header);
    buffer.put_slice(body);
    buffer.freeze()
}

#[inline]
/// The reply telling the sender of a request that nothing could handle it.
pub(crate) fn no_such_service(correlation_id: u64) -> Bytes {
    encode_frame(FrameKind::NoSuchService, correlation_id, &[])
}
