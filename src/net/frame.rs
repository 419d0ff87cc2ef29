//! Connection framing (length + crc32c).

use std::io::{Read, Write};

use crc32c::crc32c;
use thiserror::Error;

use crate::core::{ErrorCode, ErrorPayload};

pub const FRAME_HEADER_LEN: usize = 8;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame length invalid: {reason}")]
    LengthInvalid { reason: &'static str },
    #[error("frame too large: max {max_frame_bytes} got {got_bytes}")]
    TooLarge {
        max_frame_bytes: usize,
        got_bytes: usize,
    },
    #[error("frame crc mismatch: expected {expected} got {got}")]
    CrcMismatch { expected: u32, got: u32 },
}

impl FrameError {
    /// Wire payload describing this error, when it is the peer's fault.
    pub fn as_error_payload(&self) -> Option<ErrorPayload> {
        match self {
            FrameError::Io(_) => None,
            FrameError::LengthInvalid { reason } => Some(ErrorPayload::new(
                ErrorCode::MalformedPayload,
                format!("frame length invalid: {reason}"),
                false,
            )),
            FrameError::TooLarge {
                max_frame_bytes,
                got_bytes,
            } => Some(ErrorPayload::new(
                ErrorCode::MalformedPayload,
                format!("frame too large: max {max_frame_bytes} got {got_bytes}"),
                false,
            )),
            FrameError::CrcMismatch { .. } => Some(ErrorPayload::new(
                ErrorCode::MalformedPayload,
                "frame crc mismatch",
                false,
            )),
        }
    }
}

/// Reads `[len u32 le][crc32c u32 le][body]` frames off any byte stream.
pub struct FrameReader<R> {
    reader: R,
    max_frame_bytes: usize,
}

impl<R: Read> FrameReader<R> {
    pub fn new(reader: R, max_frame_bytes: usize) -> Self {
        Self {
            reader,
            max_frame_bytes,
        }
    }

    /// Next frame body, or `None` on a clean end of stream.
    pub fn read_next(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        let mut header = [0u8; FRAME_HEADER_LEN];
        if !self.fill(&mut header, true)? {
            return Ok(None);
        }

        let length = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        if length == 0 {
            return Err(FrameError::LengthInvalid {
                reason: "zero-length frame",
            });
        }
        if length > self.max_frame_bytes {
            return Err(FrameError::TooLarge {
                max_frame_bytes: self.max_frame_bytes,
                got_bytes: length,
            });
        }
        let expected = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

        let mut body = vec![0u8; length];
        self.fill(&mut body, false)?;

        let got = crc32c(&body);
        if got != expected {
            return Err(FrameError::CrcMismatch { expected, got });
        }
        Ok(Some(body))
    }

    /// Read exactly `buf.len()` bytes. EOF is only tolerated before the
    /// first byte of a frame header (`eof_ok`), where it returns `Ok(false)`.
    fn fill(&mut self, buf: &mut [u8], eof_ok: bool) -> Result<bool, FrameError> {
        let mut read = 0usize;
        while read < buf.len() {
            let n = self.reader.read(&mut buf[read..])?;
            if n == 0 {
                if read == 0 && eof_ok {
                    return Ok(false);
                }
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "stream truncated mid-frame",
                )
                .into());
            }
            read += n;
        }
        Ok(true)
    }
}

/// Writes framed payloads; returns bytes put on the wire.
pub struct FrameWriter<W> {
    writer: W,
    max_frame_bytes: usize,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(writer: W, max_frame_bytes: usize) -> Self {
        Self {
            writer,
            max_frame_bytes,
        }
    }

    pub fn write_frame(&mut self, payload: &[u8]) -> Result<usize, FrameError> {
        let frame = encode_frame(payload, self.max_frame_bytes)?;
        self.writer.write_all(&frame)?;
        self.writer.flush()?;
        Ok(frame.len())
    }
}

pub fn encode_frame(payload: &[u8], max_frame_bytes: usize) -> Result<Vec<u8>, FrameError> {
    if payload.is_empty() {
        return Err(FrameError::LengthInvalid {
            reason: "zero-length frame",
        });
    }
    if payload.len() > max_frame_bytes {
        return Err(FrameError::TooLarge {
            max_frame_bytes,
            got_bytes: payload.len(),
        });
    }
    let length = u32::try_from(payload.len()).map_err(|_| FrameError::LengthInvalid {
        reason: "frame length exceeds u32",
    })?;

    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.extend_from_slice(&length.to_le_bytes());
    buf.extend_from_slice(&crc32c(payload).to_le_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn frame_roundtrip_validates_crc() {
        let frame = encode_frame(b"hello", 1024).unwrap();
        let mut reader = FrameReader::new(Cursor::new(frame), 1024);
        assert_eq!(reader.read_next().unwrap().unwrap(), b"hello");
        assert!(reader.read_next().unwrap().is_none());
    }

    #[test]
    fn corrupted_body_fails_crc() {
        let mut frame = encode_frame(b"hello", 1024).unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        let mut reader = FrameReader::new(Cursor::new(frame), 1024);
        assert!(matches!(
            reader.read_next().unwrap_err(),
            FrameError::CrcMismatch { .. }
        ));
    }

    #[test]
    fn oversize_frame_is_rejected_on_both_sides() {
        let payload = vec![0u8; 10];
        assert!(matches!(
            encode_frame(&payload, 5).unwrap_err(),
            FrameError::TooLarge { .. }
        ));

        let frame = encode_frame(&payload, 1024).unwrap();
        let mut reader = FrameReader::new(Cursor::new(frame), 5);
        let err = reader.read_next().unwrap_err();
        assert!(matches!(err, FrameError::TooLarge { .. }));
        assert!(err.as_error_payload().is_some());
    }

    #[test]
    fn truncated_header_is_an_error_not_eof() {
        let frame = encode_frame(b"hello", 1024).unwrap();
        let mut reader = FrameReader::new(Cursor::new(frame[..4].to_vec()), 1024);
        assert!(matches!(
            reader.read_next().unwrap_err(),
            FrameError::Io(_)
        ));
    }

    #[test]
    fn empty_payload_is_rejected() {
        assert!(matches!(
            encode_frame(b"", 1024).unwrap_err(),
            FrameError::LengthInvalid { .. }
        ));
    }
}
