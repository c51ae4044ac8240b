//! RFC6455 framing.
//!
//! The functions here are transport agnostic.  `send_frame` writes one frame into a
//! `Connection`, truncating the payload to the current send window, and `FrameParser`
//! reconstructs frames from arbitrarily split inbound data.
//!
//! For more info:
//!
//! * <https://developer.mozilla.org/en-US/docs/Web/API/WebSockets_API/Writing_WebSocket_servers>
//! * <https://www.rfc-editor.org/rfc/rfc6455#section-5.2>

use alloc::borrow::Cow;
use alloc::string::String;
use alloc::vec::Vec;
use core::ops::Deref;

use base64ct::{Base64, Encoding};
use sha1::{Digest, Sha1};
use thiserror::Error;

use crate::connection::Connection;

const SEC_WEBSOCKET_ACCEPT_MAGIC: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Largest encoded frame header: 2 bytes, 8 bytes extended length, 4 bytes mask.
pub const MAX_HEADER_LEN: usize = 14;

/// Headroom a frame needs: 2 byte header, 16 bit extended length, 4 byte mask and one payload
/// byte.
const MIN_FRAME_SPACE: usize = 9;

/// Largest payload written in a single outbound frame.
const MAX_SEND_FRAME: usize = u16::MAX as usize;

/// Compute the `Sec-WebSocket-Accept` header value for a `Sec-WebSocket-Key`.
///
/// ```
/// let accept = asyncweb::websocket::accept_key("dGhlIHNhbXBsZSBub25jZQ==");
/// assert_eq!(accept, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
/// ```
pub fn accept_key(key: &str) -> String {
    let mut key_hasher = Sha1::new();
    key_hasher.update(key.as_bytes());
    key_hasher.update(SEC_WEBSOCKET_ACCEPT_MAGIC.as_bytes());
    let key_hash = key_hasher.finalize();

    Base64::encode_string(&key_hash)
}

/// WebSocketError contains the errors raised while decoding frames.
#[derive(Debug, PartialEq, Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WebSocketError {
    /// More bytes are required before the frame header can be decoded.
    #[error("{0} more bytes needed to decode the frame header")]
    InsufficientData(usize),
    /// The peer violated the framing rules.  The connection should be closed.
    #[error("websocket protocol violation: {0}")]
    ProtocolViolation(&'static str),
}

/// Frame opcodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Opcode {
    #[allow(missing_docs)]
    Continuation = 0x0,
    #[allow(missing_docs)]
    Text = 0x1,
    #[allow(missing_docs)]
    Binary = 0x2,
    #[allow(missing_docs)]
    Close = 0x8,
    #[allow(missing_docs)]
    Ping = 0x9,
    #[allow(missing_docs)]
    Pong = 0xA,
}

impl Opcode {
    /// Decode the low nibble of the first header byte.  Reserved opcodes yield `None`.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x0 => Some(Self::Continuation),
            0x1 => Some(Self::Text),
            0x2 => Some(Self::Binary),
            0x8 => Some(Self::Close),
            0x9 => Some(Self::Ping),
            0xA => Some(Self::Pong),
            _ => None,
        }
    }

    /// Close, Ping and Pong.
    pub fn is_control(self) -> bool {
        (self as u8) & 0x8 != 0
    }
}

/// A decoded frame header.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FrameHeader {
    /// Final fragment of a message
    pub fin: bool,
    #[allow(missing_docs)]
    pub opcode: Opcode,
    /// Payload length
    pub len: u64,
    /// Masking key, present on client to server frames
    pub mask: Option<[u8; 4]>,
}

impl FrameHeader {
    /// Decode a header from the start of `value`, returning it and its encoded length.  When
    /// `value` is too short the error reports how many more bytes are needed.
    pub fn decode(value: &[u8]) -> Result<(Self, usize), WebSocketError> {
        let mut required_bytes = 2usize;

        if value.len() < required_bytes {
            return Err(WebSocketError::InsufficientData(
                required_bytes - value.len(),
            ));
        }

        if value[0] & 0b0111_0000 != 0 {
            return Err(WebSocketError::ProtocolViolation(
                "reserved bits set without a negotiated extension",
            ));
        }

        let fin: bool = (value[0] & 0x80) == 0x80;
        let opcode = Opcode::from_u8(value[0] & 0x0F)
            .ok_or(WebSocketError::ProtocolViolation("reserved opcode"))?;
        let masked: bool = (value[1] & 0x80) == 0x80;

        let mut len: u64 = (value[1] & 0x7F) as u64;
        let mut mask_offset = 2;
        if len == 126 {
            // 16 bit length field
            required_bytes += 2;
            if value.len() < required_bytes {
                return Err(WebSocketError::InsufficientData(
                    required_bytes - value.len(),
                ));
            }
            len = u16::from_be_bytes([value[2], value[3]]) as u64;
            mask_offset = 4;
        } else if len == 127 {
            // 64 bit length field
            required_bytes += 8;
            if value.len() < required_bytes {
                return Err(WebSocketError::InsufficientData(
                    required_bytes - value.len(),
                ));
            }
            let mut be = [0u8; 8];
            be.copy_from_slice(&value[2..10]);
            len = u64::from_be_bytes(be);
            if len & (1 << 63) != 0 {
                return Err(WebSocketError::ProtocolViolation(
                    "most significant bit of a 64 bit length must be zero",
                ));
            }
            mask_offset = 10;
        }

        if opcode.is_control() && (!fin || len > 125) {
            return Err(WebSocketError::ProtocolViolation(
                "control frames must be unfragmented and at most 125 bytes",
            ));
        }

        let mut mask: Option<[u8; 4]> = None;
        if masked {
            required_bytes += 4;
            if value.len() < required_bytes {
                return Err(WebSocketError::InsufficientData(
                    required_bytes - value.len(),
                ));
            }
            let mut key = [0u8; 4];
            key.copy_from_slice(&value[mask_offset..mask_offset + 4]);
            mask = Some(key);
        }

        Ok((
            FrameHeader {
                fin,
                opcode,
                len,
                mask,
            },
            required_bytes,
        ))
    }

    /// Encode into `dest`, returning the number of header bytes written.
    pub fn encode(&self, dest: &mut [u8; MAX_HEADER_LEN]) -> usize {
        // fin 1 MSB byte 1, opcode 4 LSB bits byte 1
        dest[0] = self.opcode as u8;
        if self.fin {
            dest[0] |= 0x80;
        }

        let mut offset = 2;
        if self.len <= 125 {
            dest[1] = self.len as u8;
        } else if self.len <= u16::MAX as u64 {
            // indicate 16 bit length with byte 2 7LSB bits = 126
            dest[1] = 126;
            dest[2..4].copy_from_slice(&(self.len as u16).to_be_bytes());
            offset = 4;
        } else {
            // indicate 64 bit length with byte 2 7LSB bits = 127
            dest[1] = 127;
            dest[2..10].copy_from_slice(&self.len.to_be_bytes());
            offset = 10;
        }

        if let Some(mask) = self.mask {
            dest[1] |= 0x80;
            dest[offset..offset + 4].copy_from_slice(&mask);
            offset += 4;
        }

        offset
    }
}

/// XOR `data` with `mask`, where `data` starts `offset` bytes into the frame payload.  Applying
/// the same mask twice restores the original bytes.
pub fn apply_mask(data: &mut [u8], mask: [u8; 4], offset: u64) {
    let shift = (offset % 4) as usize;
    for (i, b) in data.iter_mut().enumerate() {
        *b ^= mask[(shift + i) % 4];
    }
}

/// Payload bytes available for the next outbound frame.  Zero when the window cannot fit a
/// frame header plus at least one byte.
pub fn send_frame_window<C: Connection + ?Sized>(conn: &C) -> usize {
    if !conn.can_send() {
        return 0;
    }
    let space = conn.space();
    if space < MIN_FRAME_SPACE {
        return 0;
    }
    (space - (MIN_FRAME_SPACE - 1)).min(MAX_SEND_FRAME)
}

/// Write one frame.  The payload is truncated to what the window allows and masked into a copy
/// when `mask` is given.  Returns the number of payload bytes sent, `0` when nothing could be
/// sent; callers retry on the next ack or poll.
pub fn send_frame<C: Connection + ?Sized>(
    conn: &mut C,
    fin: bool,
    opcode: Opcode,
    mask: Option<[u8; 4]>,
    data: &[u8],
) -> usize {
    if !conn.can_send() {
        return 0;
    }

    let space = conn.space();
    let mask = if data.is_empty() { None } else { mask };
    let mask_len = if mask.is_some() { 4 } else { 0 };
    let head_len = |len: usize| 2 + mask_len + if len > 125 { 2 } else { 0 };

    let Some(short_max) = space.checked_sub(head_len(0)) else {
        return 0;
    };
    let len = if data.len() <= short_max.min(125) {
        data.len()
    } else if short_max <= 125 {
        short_max
    } else {
        data.len()
            .min(space - head_len(MAX_SEND_FRAME))
            .min(MAX_SEND_FRAME)
    };

    let header = FrameHeader {
        fin,
        opcode,
        len: len as u64,
        mask,
    };
    let mut buf = [0u8; MAX_HEADER_LEN];
    let encoded = header.encode(&mut buf);

    if conn.add(&buf[..encoded]) != encoded {
        return 0;
    }

    if len > 0 {
        let payload: Cow<'_, [u8]> = match mask {
            Some(mask) => {
                let mut masked = data[..len].to_vec();
                apply_mask(&mut masked, mask, 0);
                Cow::Owned(masked)
            }
            None => Cow::Borrowed(&data[..len]),
        };
        if conn.add(&payload) != len {
            return 0;
        }
    }

    if !conn.send() {
        return 0;
    }

    len
}

/// Metadata of the frame a piece of payload belongs to.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FrameInfo {
    /// Opcode of the message (Text or Binary) this frame belongs to
    pub message_opcode: Opcode,
    /// Fragment number within the message, 0 for the first frame
    pub num: u32,
    /// Whether this is the final fragment of the message
    pub fin: bool,
    /// Whether the payload was masked by the peer
    pub masked: bool,
    /// Opcode of this frame (Continuation for later fragments)
    pub opcode: Opcode,
    /// Payload length of this frame
    pub len: u64,
    /// Masking key
    pub mask: [u8; 4],
    /// Offset of the delivered piece within the frame payload
    pub index: u64,
}

impl FrameInfo {
    const fn empty() -> Self {
        Self {
            message_opcode: Opcode::Text,
            num: 0,
            fin: false,
            masked: false,
            opcode: Opcode::Continuation,
            len: 0,
            mask: [0; 4],
            index: 0,
        }
    }
}

/// Inbound frame reassembly with two states: awaiting a header, or inside a payload.
pub(crate) struct FrameParser {
    in_payload: bool,
    head: [u8; MAX_HEADER_LEN],
    head_len: usize,
    info: FrameInfo,
    control: Vec<u8>,
}

impl FrameParser {
    pub(crate) fn new() -> Self {
        Self {
            in_payload: false,
            head: [0; MAX_HEADER_LEN],
            head_len: 0,
            info: FrameInfo::empty(),
            control: Vec::new(),
        }
    }

    pub(crate) fn in_payload(&self) -> bool {
        self.in_payload
    }

    pub(crate) fn info(&self) -> FrameInfo {
        self.info
    }

    /// Accumulate header bytes from `data`.  Returns the bytes consumed and whether a complete
    /// header is now available.
    pub(crate) fn read_header(&mut self, data: &[u8]) -> Result<(usize, bool), WebSocketError> {
        let mut consumed = 0;
        loop {
            match FrameHeader::decode(&self.head[..self.head_len]) {
                Ok((header, _)) => {
                    self.begin(header);
                    return Ok((consumed, true));
                }
                Err(WebSocketError::InsufficientData(needed)) => {
                    let take = needed.min(data.len() - consumed);
                    if take == 0 {
                        return Ok((consumed, false));
                    }
                    self.head[self.head_len..self.head_len + take]
                        .copy_from_slice(&data[consumed..consumed + take]);
                    self.head_len += take;
                    consumed += take;
                }
                Err(e) => {
                    self.head_len = 0;
                    return Err(e);
                }
            }
        }
    }

    fn begin(&mut self, header: FrameHeader) {
        self.head_len = 0;
        self.in_payload = true;
        self.control.clear();

        if !header.opcode.is_control() {
            if header.opcode == Opcode::Continuation {
                self.info.num += 1;
            } else {
                self.info.message_opcode = header.opcode;
                self.info.num = 0;
            }
        }

        self.info.fin = header.fin;
        self.info.opcode = header.opcode;
        self.info.masked = header.mask.is_some();
        self.info.mask = header.mask.unwrap_or_default();
        self.info.len = header.len;
        self.info.index = 0;
    }

    /// Payload bytes still expected for the current frame.
    pub(crate) fn remaining(&self) -> u64 {
        self.info.len - self.info.index
    }

    /// Record `n` payload bytes as consumed.  Returns true when the frame is complete.
    pub(crate) fn advance(&mut self, n: usize) -> bool {
        self.info.index += n as u64;
        if self.info.index >= self.info.len {
            self.in_payload = false;
            return true;
        }
        false
    }

    pub(crate) fn buffer_control(&mut self, data: &[u8]) {
        self.control.extend_from_slice(data);
    }

    pub(crate) fn take_control(&mut self) -> Vec<u8> {
        core::mem::take(&mut self.control)
    }
}

/// A scoped in place unmasking of part of a frame payload.  The borrowed bytes are unmasked on
/// construction and masked again when the guard drops, so the caller's buffer is left exactly
/// as received.
pub(crate) struct Unmasked<'a> {
    data: &'a mut [u8],
    mask: Option<[u8; 4]>,
    offset: u64,
}

impl<'a> Unmasked<'a> {
    pub(crate) fn new(data: &'a mut [u8], info: &FrameInfo) -> Self {
        let mask = info.masked.then_some(info.mask);
        if let Some(mask) = mask {
            apply_mask(data, mask, info.index);
        }
        Self {
            data,
            mask,
            offset: info.index,
        }
    }
}

impl Deref for Unmasked<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.data
    }
}

impl Drop for Unmasked<'_> {
    fn drop(&mut self) {
        if let Some(mask) = self.mask {
            apply_mask(self.data, mask, self.offset);
        }
    }
}
