//! Serial frame codec: build, extract and validate wire frames.

use crate::crc16::crc16;
use thiserror::Error;

pub const PREAMBLE: u8 = 0xAA;

/// A decoded wire frame: command byte plus its payload, CRC already verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub cmd: u8,
    pub payload: Vec<u8>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("payload too large: {0} bytes (max 255)")]
    PayloadTooLarge(usize),
}

impl Frame {
    pub fn new(cmd: u8, payload: Vec<u8>) -> Result<Self, FrameError> {
        if payload.len() > u8::MAX as usize {
            return Err(FrameError::PayloadTooLarge(payload.len()));
        }
        Ok(Frame { cmd, payload })
    }

    /// Serializes this frame to the wire format, CRC included.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(3 + self.payload.len() + 2);
        buf.push(PREAMBLE);
        buf.push(self.cmd);
        buf.push(self.payload.len() as u8);
        buf.extend_from_slice(&self.payload);
        let crc = crc16(&buf);
        buf.push((crc & 0xFF) as u8);
        buf.push((crc >> 8) as u8);
        buf
    }
}

/// Outcome of scanning a receive buffer for one complete frame.
#[derive(Debug, PartialEq, Eq)]
pub enum ExtractResult {
    /// A complete, CRC-valid frame was found. `consumed` bytes (including
    /// any garbage preceding the preamble) should be dropped from the
    /// buffer.
    Complete { frame: Frame, consumed: usize },
    /// Not enough bytes buffered yet; the caller should read more and
    /// retry without consuming anything.
    NeedMoreData,
    /// A complete frame-shaped span was found but its CRC did not match.
    /// The caller discards the *entire* buffer rather than trying to
    /// resync mid-stream.
    CrcError,
}

/// Scans `buffer` for one complete, CRC-valid frame starting at the first
/// preamble byte.
pub fn extract_frame(buffer: &[u8]) -> ExtractResult {
    let Some(start) = buffer.iter().position(|&b| b == PREAMBLE) else {
        return ExtractResult::NeedMoreData;
    };

    let remaining = &buffer[start..];

    // Need PREAMBLE, CMD, PL before the length is known.
    if remaining.len() < 3 {
        return ExtractResult::NeedMoreData;
    }

    let payload_len = remaining[2] as usize;
    let total_len = 3 + payload_len + 2;

    if remaining.len() < total_len {
        return ExtractResult::NeedMoreData;
    }

    let frame_bytes = &remaining[..total_len];
    let expected_crc = u16::from_le_bytes([frame_bytes[total_len - 2], frame_bytes[total_len - 1]]);
    let computed_crc = crc16(&frame_bytes[..total_len - 2]);

    if expected_crc != computed_crc {
        return ExtractResult::CrcError;
    }

    let frame = Frame {
        cmd: frame_bytes[1],
        payload: frame_bytes[3..3 + payload_len].to_vec(),
    };

    ExtractResult::Complete {
        frame,
        consumed: start + total_len,
    }
}
