//! WebSocket frame codec
//!
//! Decodes inbound client frames incrementally and encodes outbound server frames.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
//! |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//! +-+-+-+-+-------+-+-------------+ - - - - - - - - - - - - - - - +
//! |     Extended payload length continued, if payload len == 127  |
//! + - - - - - - - - - - - - - - - +-------------------------------+
//! |                               |Masking-key, if MASK set to 1  |
//! +-------------------------------+-------------------------------+
//! | Masking-key (continued)       |          Payload Data         |
//! +-------------------------------- - - - - - - - - - - - - - - - +
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use std::io;
use tokio_util::codec::Decoder;

/// FIN bit in the first header byte
const FIN_BIT: u8 = 0b1000_0000;
/// Opcode bits in the first header byte
const OPCODE_BITS: u8 = 0b0000_1111;
/// MASK bit in the second header byte
const MASK_BIT: u8 = 0b1000_0000;
/// Length indicator bits in the second header byte
const LENGTH_BITS: u8 = 0b0111_1111;

/// Largest payload length that fits in the 7-bit indicator
pub const MAX_INLINE_LEN: usize = 125;
/// Indicator value announcing a 16-bit extended length
const LEN_16_MARKER: u8 = 126;
/// Indicator value announcing a 64-bit extended length
const LEN_64_MARKER: u8 = 127;

/// Default cap on inbound payload size (16 MiB)
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Errors that can occur while decoding frames
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Peer sent an unmasked frame")]
    UnmaskedFrame,

    #[error("Invalid opcode: {0:#x}")]
    InvalidOpcode(u8),

    #[error("Payload of {size} bytes exceeds limit of {max} bytes")]
    PayloadTooLarge { size: u64, max: usize },

    #[error("Impossible payload length indicator: {0}")]
    InvalidLengthIndicator(u8),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for frame operations
pub type FrameResult<T> = Result<T, FrameError>;

/// Frame opcode (4 bits)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Opcode {
    /// Parse an opcode from the low nibble of the first header byte
    pub fn from_u8(value: u8) -> FrameResult<Self> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            _ => Err(FrameError::InvalidOpcode(value)),
        }
    }

    /// Whether frames with this opcode carry message payload that gets relayed
    pub fn is_data(self) -> bool {
        matches!(self, Self::Text | Self::Binary)
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// A decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Final fragment flag
    pub fin: bool,
    /// Frame opcode
    pub opcode: Opcode,
    /// Whether the payload arrived masked
    pub masked: bool,
    /// Declared payload length
    pub payload_len: u64,
    /// Mask key, present only for masked frames
    pub mask: Option<[u8; 4]>,
    /// Payload bytes after unmasking
    pub payload: Bytes,
}

/// Way the payload length is carried in the header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LengthField {
    /// Length is the indicator itself
    Inline(u8),
    /// Length follows in this many big-endian bytes
    Extended(usize),
}

/// Classify the 7-bit length indicator.
///
/// Values above 127 cannot come out of a 7-bit field; they are reported as
/// an invariant violation rather than a protocol error.
fn length_field(indicator: u8) -> FrameResult<LengthField> {
    match indicator {
        0..=125 => Ok(LengthField::Inline(indicator)),
        LEN_16_MARKER => Ok(LengthField::Extended(2)),
        LEN_64_MARKER => Ok(LengthField::Extended(8)),
        _ => Err(FrameError::InvalidLengthIndicator(indicator)),
    }
}

/// Header fields carried through the decode states
#[derive(Debug, Clone, Copy)]
struct FrameHead {
    fin: bool,
    opcode: Opcode,
    masked: bool,
}

/// Decoder progress through the current frame
#[derive(Debug, Clone, Copy)]
enum DecodeState {
    Header,
    ExtendedLength {
        head: FrameHead,
        bytes_needed: usize,
    },
    MaskKey {
        head: FrameHead,
        payload_len: u64,
    },
    Payload {
        head: FrameHead,
        mask: Option<[u8; 4]>,
        payload_len: u64,
    },
}

/// Server-side frame codec
///
/// Decoding rejects unmasked frames and keeps its position across calls, so
/// frames split over arbitrary read boundaries are reassembled. Encoding always
/// emits a single unmasked text frame.
#[derive(Debug)]
pub struct FrameCodec {
    state: DecodeState,
    max_payload_size: usize,
}

impl FrameCodec {
    /// Create a codec with the default payload cap
    pub fn new() -> Self {
        Self::with_max_payload_size(DEFAULT_MAX_PAYLOAD_SIZE)
    }

    /// Create a codec that rejects payloads larger than `max_payload_size`
    pub fn with_max_payload_size(max_payload_size: usize) -> Self {
        Self {
            state: DecodeState::Header,
            max_payload_size,
        }
    }

    /// Pick the state that follows a fully known payload length
    fn after_length(&self, head: FrameHead, payload_len: u64) -> FrameResult<DecodeState> {
        if payload_len > self.max_payload_size as u64 {
            return Err(FrameError::PayloadTooLarge {
                size: payload_len,
                max: self.max_payload_size,
            });
        }

        if head.masked {
            Ok(DecodeState::MaskKey { head, payload_len })
        } else {
            Ok(DecodeState::Payload {
                head,
                mask: None,
                payload_len,
            })
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> FrameResult<Option<Frame>> {
        loop {
            match self.state {
                DecodeState::Header => {
                    if src.len() < 2 {
                        return Ok(None);
                    }

                    let first = src[0];
                    let second = src[1];

                    // Reserved bits 6-4 are ignored
                    let fin = first & FIN_BIT != 0;
                    let opcode = Opcode::from_u8(first & OPCODE_BITS)?;
                    let masked = second & MASK_BIT != 0;

                    // Client-to-server frames must be masked
                    if !masked {
                        return Err(FrameError::UnmaskedFrame);
                    }

                    src.advance(2);
                    let head = FrameHead {
                        fin,
                        opcode,
                        masked,
                    };

                    self.state = match length_field(second & LENGTH_BITS)? {
                        LengthField::Inline(len) => self.after_length(head, u64::from(len))?,
                        LengthField::Extended(bytes_needed) => {
                            DecodeState::ExtendedLength { head, bytes_needed }
                        }
                    };
                }
                DecodeState::ExtendedLength { head, bytes_needed } => {
                    if src.len() < bytes_needed {
                        return Ok(None);
                    }

                    let payload_len = if bytes_needed == 2 {
                        u64::from(src.get_u16())
                    } else {
                        src.get_u64()
                    };
                    self.state = self.after_length(head, payload_len)?;
                }
                DecodeState::MaskKey { head, payload_len } => {
                    if src.len() < 4 {
                        return Ok(None);
                    }

                    let mut mask = [0u8; 4];
                    src.copy_to_slice(&mut mask);
                    self.state = DecodeState::Payload {
                        head,
                        mask: Some(mask),
                        payload_len,
                    };
                }
                DecodeState::Payload {
                    head,
                    mask,
                    payload_len,
                } => {
                    // Bounded by max_payload_size in after_length
                    let len = payload_len as usize;
                    if src.len() < len {
                        src.reserve(len - src.len());
                        return Ok(None);
                    }

                    let mut payload = src.split_to(len);
                    if let Some(mask) = mask {
                        apply_mask(&mut payload, mask);
                    }

                    self.state = DecodeState::Header;
                    return Ok(Some(Frame {
                        fin: head.fin,
                        opcode: head.opcode,
                        masked: head.masked,
                        payload_len,
                        mask,
                        payload: payload.freeze(),
                    }));
                }
            }
        }
    }

    /// The stream ended; anything short of a frame boundary is a truncated frame
    fn decode_eof(&mut self, src: &mut BytesMut) -> FrameResult<Option<Frame>> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }

        if src.is_empty() && matches!(self.state, DecodeState::Header) {
            return Ok(None);
        }

        self.state = DecodeState::Header;
        Err(FrameError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "stream ended mid-frame",
        )))
    }
}

/// XOR `payload` with `mask`, in place. Applying it twice restores the input.
pub fn apply_mask(payload: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask[i % 4];
    }
}

/// Size of the length field, counting the indicator byte itself
fn length_field_len(payload_len: usize) -> usize {
    if payload_len <= MAX_INLINE_LEN {
        1
    } else if payload_len <= usize::from(u16::MAX) {
        3
    } else {
        9
    }
}

/// Total size of an unmasked frame carrying `payload_len` bytes
pub fn encoded_len(payload_len: usize) -> usize {
    1 + length_field_len(payload_len) + payload_len
}

/// Write a FIN text header with the given mask bit and payload length
fn put_header(dst: &mut BytesMut, mask_bit: u8, payload_len: usize) {
    dst.put_u8(FIN_BIT | Opcode::Text.as_u8());

    if payload_len <= MAX_INLINE_LEN {
        dst.put_u8(mask_bit | payload_len as u8);
    } else if payload_len <= usize::from(u16::MAX) {
        dst.put_u8(mask_bit | LEN_16_MARKER);
        dst.put_u16(payload_len as u16);
    } else {
        dst.put_u8(mask_bit | LEN_64_MARKER);
        dst.put_u64(payload_len as u64);
    }
}

/// Encode `payload` as a single unmasked text frame (server to client)
pub fn encode_frame(payload: &[u8]) -> Bytes {
    let mut dst = BytesMut::with_capacity(encoded_len(payload.len()));
    put_header(&mut dst, 0, payload.len());
    dst.extend_from_slice(payload);
    dst.freeze()
}

/// Encode `payload` as a single masked text frame, the way a client sends it
pub fn encode_client_frame(payload: &[u8], mask: [u8; 4]) -> Bytes {
    let mut dst = BytesMut::with_capacity(encoded_len(payload.len()) + 4);
    put_header(&mut dst, MASK_BIT, payload.len());
    dst.put_slice(&mask);

    let start = dst.len();
    dst.extend_from_slice(payload);
    apply_mask(&mut dst[start..], mask);
    dst.freeze()
}
