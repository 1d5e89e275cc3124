//! Core-action wire framing
//!
//! Layout of one encoded message:
//!
//! | offset | size | field |
//! |---|---|---|
//! | 0 | 1 | action |
//! | 1 | 1 | state |
//! | 2 | 8 | timestamp, nanoseconds, big-endian |
//! | 10 | 4 | content frame count, big-endian |
//! | 14 | .. | per frame: 4-byte big-endian length, then the bytes |
//!
//! The trailing frame count keeps the 10-byte header intact while making a
//! message self-delimiting on stream transports.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{
    error::CodecError,
    message::{Action, Message, State},
};

/// Size of the action/state/timestamp header.
pub const HEADER_LEN: usize = 10;

const COUNT_LEN: usize = 4;
const FRAME_LEN_PREFIX: usize = 4;

/// Default upper bound for a single encoded message.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Number of bytes [`encode`] will produce for `msg`.
pub fn encoded_len(msg: &Message) -> usize {
    HEADER_LEN
        + COUNT_LEN
        + msg
            .contents()
            .iter()
            .map(|frame| FRAME_LEN_PREFIX + frame.len())
            .sum::<usize>()
}

/// Write only the 10-byte header.
pub fn encode_header(msg: &Message, buf: &mut BytesMut) {
    buf.reserve(HEADER_LEN);
    buf.put_u8(msg.action().as_u8());
    buf.put_u8(msg.state().as_u8());
    buf.put_i64(msg.timestamp());
}

pub fn encode_into(msg: &Message, buf: &mut BytesMut) {
    buf.reserve(encoded_len(msg));
    encode_header(msg, buf);
    buf.put_u32(msg.contents().len() as u32);
    for frame in msg.contents() {
        buf.put_u32(frame.len() as u32);
        buf.put_slice(frame);
    }
}

pub fn encode(msg: &Message) -> Bytes {
    let mut buf = BytesMut::with_capacity(encoded_len(msg));
    encode_into(msg, &mut buf);
    buf.freeze()
}

fn require(needed: usize, available: usize) -> Result<(), CodecError> {
    if available < needed {
        Err(CodecError::Incomplete { needed, available })
    } else {
        Ok(())
    }
}

/// Decode one message from the front of `input`.
///
/// Returns the message and the number of bytes it occupied. On
/// [`CodecError::Incomplete`] nothing is consumed and the caller keeps the
/// buffer for the next read.
pub fn decode(input: &[u8]) -> Result<(Message, usize), CodecError> {
    decode_with(input, |start, end| Bytes::copy_from_slice(&input[start..end]))
}

/// Like [`decode`], but content frames share `input`'s allocation.
pub fn decode_bytes(input: &Bytes) -> Result<(Message, usize), CodecError> {
    decode_with(input, |start, end| input.slice(start..end))
}

fn decode_with<F>(input: &[u8], mut frame: F) -> Result<(Message, usize), CodecError>
where
    F: FnMut(usize, usize) -> Bytes,
{
    let available = input.len();
    require(HEADER_LEN + COUNT_LEN, available)?;

    let mut cursor = input;
    let action = Action::from_u8(cursor.get_u8());
    let state = State::from_u8(cursor.get_u8());
    let timestamp = cursor.get_i64();
    let count = cursor.get_u32() as usize;

    let mut offset = HEADER_LEN + COUNT_LEN;
    let mut msg = Message::with_time(action, state, timestamp);
    for _ in 0..count {
        require(offset + FRAME_LEN_PREFIX, available)?;
        let len = read_u32(input, offset);
        offset += FRAME_LEN_PREFIX;
        require(offset + len, available)?;
        msg.append_content(frame(offset, offset + len));
        offset += len;
    }
    Ok((msg, offset))
}

fn read_u32(input: &[u8], offset: usize) -> usize {
    let mut prefix = &input[offset..offset + 4];
    prefix.get_u32() as usize
}

/// Stream reassembly buffer.
///
/// TCP hands back arbitrary slices of the byte stream, so reads are appended
/// here and complete messages are split off the front; a partial tail stays
/// buffered for the next read. Only length prefixes are walked until a whole
/// message is buffered, and the walk resumes where the previous read left it.
#[derive(Debug)]
pub struct FrameBuffer {
    buf: BytesMut,
    max_frame_bytes: usize,
    scan: Option<Scan>,
}

/// Progress through the length prefixes of the message at the front.
#[derive(Debug, Clone, Copy)]
struct Scan {
    frames_left: usize,
    offset: usize,
}

impl FrameBuffer {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(4096),
            max_frame_bytes,
            scan: None,
        }
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Mutable access for `AsyncReadExt::read_buf`.
    pub fn buf_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    fn check_limit(&self, size: usize) -> Result<(), CodecError> {
        if size > self.max_frame_bytes {
            return Err(CodecError::FrameTooLarge {
                size,
                limit: self.max_frame_bytes,
            });
        }
        Ok(())
    }

    /// Total length of the message at the front once all of it is buffered.
    fn scan_front(&mut self) -> Result<Option<usize>, CodecError> {
        let available = self.buf.len();
        let mut scan = match self.scan {
            Some(scan) => scan,
            None => {
                self.check_limit(HEADER_LEN + COUNT_LEN)?;
                if available < HEADER_LEN + COUNT_LEN {
                    return Ok(None);
                }
                Scan {
                    frames_left: read_u32(&self.buf, HEADER_LEN),
                    offset: HEADER_LEN + COUNT_LEN,
                }
            }
        };
        while scan.frames_left > 0 {
            let body = scan.offset + FRAME_LEN_PREFIX;
            self.check_limit(body)?;
            if available < body {
                break;
            }
            let end = body + read_u32(&self.buf, scan.offset);
            self.check_limit(end)?;
            if available < end {
                break;
            }
            scan.offset = end;
            scan.frames_left -= 1;
        }
        self.scan = Some(scan);
        Ok((scan.frames_left == 0).then_some(scan.offset))
    }

    /// Next complete message together with its raw encoding, if one is
    /// buffered.
    pub fn next_frame(&mut self) -> Result<Option<(Message, Bytes)>, CodecError> {
        let Some(total) = self.scan_front()? else {
            return Ok(None);
        };
        self.scan = None;
        let raw = self.buf.split_to(total).freeze();
        let (msg, _) = decode_bytes(&raw)?;
        Ok(Some((msg, raw)))
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}
