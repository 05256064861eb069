// Wire frame envelope
//
// Big-endian, per message on a TCP stream:
//
//   int16 size0
//   if size0 == -1:
//       int32 size
//   else:
//       size = size0        // 0 < size <= 32767
//   bytes payload[size]
//
// Any other non-positive size, or a size above the per-connection limit,
// is a fatal per-connection corrupt frame.

use bytes::{BufMut, BytesMut};

use crate::error::{MeshError, Result};

/// Largest payload expressible with the short header.
pub const SHORT_MAX: usize = 0x7fff;

/// Short-form sentinel announcing a following int32 size.
const LONG_SENTINEL: i16 = -1;

const SHORT_HEADER: usize = 2;
const LONG_HEADER: usize = 6;

/// Append one framed payload to `out`.
///
/// Rejects empty payloads and payloads above `max_message_size`; both are
/// unrepresentable on the wire.
pub fn encode_frame(payload: &[u8], max_message_size: usize, out: &mut BytesMut) -> Result<()> {
    if payload.is_empty() || payload.len() > max_message_size || payload.len() > i32::MAX as usize {
        return Err(MeshError::Serialization(format!(
            "unframeable payload size {} (limit {})",
            payload.len(),
            max_message_size
        )));
    }

    if payload.len() <= SHORT_MAX {
        out.reserve(SHORT_HEADER + payload.len());
        out.put_i16(payload.len() as i16);
    } else {
        out.reserve(LONG_HEADER + payload.len());
        out.put_i16(LONG_SENTINEL);
        out.put_i32(payload.len() as i32);
    }
    out.put_slice(payload);
    Ok(())
}

/// Decoder progress for the bytes accumulated so far.
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded {
    /// At least this many more bytes are needed.
    NeedMore(usize),
    /// A complete frame occupies `start..end` of the accumulated bytes.
    Frame { start: usize, end: usize },
}

#[derive(Debug)]
enum DecodeState {
    ReadSizeShort,
    ReadSizeInt,
    ReadBody { header: usize, size: usize },
}

/// Per-connection frame decoding state machine.
///
/// `decode` is fed the connection's accumulated bytes, starting at the
/// current frame boundary; after a frame is consumed the caller restarts
/// the accumulation and the decoder resets itself.
#[derive(Debug)]
pub struct FrameDecoder {
    state: DecodeState,
    peer: String,
    max_message_size: usize,
}

impl FrameDecoder {
    pub fn new(peer: String, max_message_size: usize) -> Self {
        Self {
            state: DecodeState::ReadSizeShort,
            peer,
            max_message_size,
        }
    }

    /// Advance over `buf`, the bytes accumulated since the last frame.
    ///
    /// A corrupt size poisons the connection; callers drop it.
    pub fn decode(&mut self, buf: &[u8]) -> Result<Decoded> {
        loop {
            match self.state {
                DecodeState::ReadSizeShort => {
                    if buf.len() < SHORT_HEADER {
                        return Ok(Decoded::NeedMore(SHORT_HEADER - buf.len()));
                    }
                    let ssize = i16::from_be_bytes([buf[0], buf[1]]);
                    if ssize == LONG_SENTINEL {
                        self.state = DecodeState::ReadSizeInt;
                    } else if ssize <= 0 {
                        return Err(self.corrupt(i64::from(ssize)));
                    } else {
                        self.state = self.body_state(SHORT_HEADER, ssize as i64)?;
                    }
                }
                DecodeState::ReadSizeInt => {
                    if buf.len() < LONG_HEADER {
                        return Ok(Decoded::NeedMore(LONG_HEADER - buf.len()));
                    }
                    let size = i32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]);
                    self.state = self.body_state(LONG_HEADER, i64::from(size))?;
                }
                DecodeState::ReadBody { header, size } => {
                    let end = header + size;
                    if buf.len() < end {
                        return Ok(Decoded::NeedMore(end - buf.len()));
                    }
                    self.state = DecodeState::ReadSizeShort;
                    return Ok(Decoded::Frame { start: header, end });
                }
            }
        }
    }

    fn body_state(&self, header: usize, size: i64) -> Result<DecodeState> {
        if size <= 0 || size > self.max_message_size as i64 {
            return Err(self.corrupt(size));
        }
        Ok(DecodeState::ReadBody {
            header,
            size: size as usize,
        })
    }

    fn corrupt(&self, size: i64) -> MeshError {
        MeshError::CorruptFrame {
            peer: self.peer.clone(),
            size,
        }
    }
}
