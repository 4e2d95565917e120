// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Length-prefix framing for the bus.
//!
//! ```text
//! +----------------+------+-----------------+
//! | Length (4B BE) | Kind | Body            |
//! +----------------+------+-----------------+
//! ```
//!
//! The length counts the kind byte plus the body. Kinds:
//!
//! | Kind      | Byte | Body                                  |
//! |-----------|------|---------------------------------------|
//! | `Message` | 0x01 | identifier, NUL, payload              |
//! | `Subscribe` | 0x02 | topic prefix                        |
//! | `Unsubscribe` | 0x03 | topic prefix                      |
//! | `Control` | 0x10 | JSON manager request or reply         |

use std::io::{self, Read, Write};

/// Frame header size (4 bytes for length).
pub const FRAME_HEADER_SIZE: usize = 4;

/// Default maximum frame size (16 MB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    Message = 0x01,
    Subscribe = 0x02,
    Unsubscribe = 0x03,
    Control = 0x10,
}

impl FrameKind {
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(FrameKind::Message),
            0x02 => Some(FrameKind::Subscribe),
            0x03 => Some(FrameKind::Unsubscribe),
            0x10 => Some(FrameKind::Control),
            _ => None,
        }
    }
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub body: Vec<u8>,
}

impl Frame {
    pub fn new(kind: FrameKind, body: Vec<u8>) -> Self {
        Self { kind, body }
    }

    pub fn encode(&self) -> Vec<u8> {
        FrameCodec::encode(self.kind, &self.body)
    }
}

/// Incremental frame decoder.
///
/// Keeps partial read state across calls so it can be driven by a
/// non-blocking socket that delivers frames in arbitrary pieces.
#[derive(Debug)]
pub struct FrameCodec {
    state: ReadState,
    buffer: Vec<u8>,
    /// Anti-OOM limit on the length field
    max_size: usize,
    frames_decoded: u64,
    frames_rejected: u64,
}

#[derive(Debug, Clone, Copy)]
enum ReadState {
    ReadingLength {
        bytes_read: usize,
    },
    ReadingBody {
        expected_len: usize,
        bytes_read: usize,
    },
}

impl Default for ReadState {
    fn default() -> Self {
        ReadState::ReadingLength { bytes_read: 0 }
    }
}

impl FrameCodec {
    pub fn new(max_size: usize) -> Self {
        Self {
            state: ReadState::default(),
            buffer: vec![0u8; FRAME_HEADER_SIZE],
            max_size,
            frames_decoded: 0,
            frames_rejected: 0,
        }
    }

    pub fn with_default_max() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }

    pub fn frames_rejected(&self) -> u64 {
        self.frames_rejected
    }

    /// Encodes `[len][kind][body]`.
    pub fn encode(kind: FrameKind, body: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + 1 + body.len());
        Self::encode_into(kind, body, &mut frame);
        frame
    }

    pub fn encode_into(kind: FrameKind, body: &[u8], buf: &mut Vec<u8>) {
        let len = (body.len() + 1) as u32;
        buf.extend_from_slice(&len.to_be_bytes());
        buf.push(kind as u8);
        buf.extend_from_slice(body);
    }

    /// Tries to decode one frame from `reader`.
    ///
    /// - `Ok(Some(frame))` - a complete frame was decoded
    /// - `Ok(None)` - need more data (WouldBlock)
    /// - `Err(e)` - I/O error, EOF (`UnexpectedEof`) or protocol error
    ///   (`InvalidData`)
    pub fn decode<R: Read + ?Sized>(&mut self, reader: &mut R) -> io::Result<Option<Frame>> {
        loop {
            match self.state {
                ReadState::ReadingLength { bytes_read } => {
                    match reader.read(&mut self.buffer[bytes_read..FRAME_HEADER_SIZE]) {
                        Ok(0) => {
                            let reason = if bytes_read == 0 {
                                "connection closed"
                            } else {
                                "incomplete frame header"
                            };
                            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, reason));
                        }
                        Ok(n) => {
                            let total = bytes_read + n;
                            if total < FRAME_HEADER_SIZE {
                                self.state = ReadState::ReadingLength { bytes_read: total };
                                continue;
                            }

                            let len = u32::from_be_bytes([
                                self.buffer[0],
                                self.buffer[1],
                                self.buffer[2],
                                self.buffer[3],
                            ]) as usize;

                            if len == 0 || len > self.max_size {
                                self.frames_rejected += 1;
                                self.state = ReadState::default();
                                return Err(io::Error::new(
                                    io::ErrorKind::InvalidData,
                                    format!("bad frame length {} (max {})", len, self.max_size),
                                ));
                            }

                            self.buffer.resize(len, 0);
                            self.state = ReadState::ReadingBody {
                                expected_len: len,
                                bytes_read: 0,
                            };
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            return Ok(None);
                        }
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e),
                    }
                }

                ReadState::ReadingBody {
                    expected_len,
                    bytes_read,
                } => match reader.read(&mut self.buffer[bytes_read..expected_len]) {
                    Ok(0) => {
                        return Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "incomplete frame body",
                        ));
                    }
                    Ok(n) => {
                        let total = bytes_read + n;
                        if total < expected_len {
                            self.state = ReadState::ReadingBody {
                                expected_len,
                                bytes_read: total,
                            };
                            continue;
                        }

                        let kind_byte = self.buffer[0];
                        let body = self.buffer[1..expected_len].to_vec();
                        self.buffer.resize(FRAME_HEADER_SIZE, 0);
                        self.state = ReadState::default();

                        let kind = FrameKind::from_u8(kind_byte).ok_or_else(|| {
                            self.frames_rejected += 1;
                            io::Error::new(
                                io::ErrorKind::InvalidData,
                                format!("unknown frame kind 0x{kind_byte:02x}"),
                            )
                        })?;
                        self.frames_decoded += 1;
                        return Ok(Some(Frame { kind, body }));
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return Ok(None);
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                },
            }
        }
    }

    pub fn is_partial(&self) -> bool {
        match self.state {
            ReadState::ReadingLength { bytes_read } => bytes_read > 0,
            ReadState::ReadingBody { .. } => true,
        }
    }
}

/// Writes one frame to a blocking stream.
pub fn write_frame<W: Write + ?Sized>(writer: &mut W, kind: FrameKind, body: &[u8]) -> io::Result<()> {
    writer.write_all(&FrameCodec::encode(kind, body))?;
    writer.flush()
}

/// Reads one frame from a blocking stream. A read timeout on the stream
/// surfaces as `TimedOut`.
pub fn read_frame<R: Read + ?Sized>(reader: &mut R, max_size: usize) -> io::Result<Frame> {
    let mut codec = FrameCodec::new(max_size);
    match codec.decode(reader) {
        Ok(Some(frame)) => Ok(frame),
        Ok(None) => Err(io::Error::new(io::ErrorKind::TimedOut, "timed out reading frame")),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Delivers at most `chunk` bytes per read, then WouldBlock once.
    struct Trickle {
        data: Vec<u8>,
        pos: usize,
        chunk: usize,
        blocked: bool,
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if !self.blocked {
                self.blocked = true;
                return Err(io::ErrorKind::WouldBlock.into());
            }
            self.blocked = false;
            let n = self.chunk.min(buf.len()).min(self.data.len() - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    #[test]
    fn test_encode_layout() {
        let frame = FrameCodec::encode(FrameKind::Subscribe, b"/nav/");
        assert_eq!(&frame[..4], &6u32.to_be_bytes());
        assert_eq!(frame[4], 0x02);
        assert_eq!(&frame[5..], b"/nav/");
    }

    #[test]
    fn test_decode_two_frames() {
        let mut wire = FrameCodec::encode(FrameKind::Message, b"/a/0/CSTR/1/1/\0hi");
        FrameCodec::encode_into(FrameKind::Control, b"{}", &mut wire);
        let mut cursor = Cursor::new(wire);
        let mut codec = FrameCodec::with_default_max();

        let first = codec.decode(&mut cursor).expect("io").expect("frame");
        assert_eq!(first.kind, FrameKind::Message);
        assert_eq!(first.body, b"/a/0/CSTR/1/1/\0hi");
        let second = codec.decode(&mut cursor).expect("io").expect("frame");
        assert_eq!(second, Frame::new(FrameKind::Control, b"{}".to_vec()));

        let eof = codec.decode(&mut cursor).unwrap_err();
        assert_eq!(eof.kind(), io::ErrorKind::UnexpectedEof);
        assert_eq!(codec.frames_decoded(), 2);
    }

    #[test]
    fn test_decode_partial_reads() {
        let mut reader = Trickle {
            data: FrameCodec::encode(FrameKind::Message, b"hello world"),
            pos: 0,
            chunk: 3,
            blocked: false,
        };
        let mut codec = FrameCodec::with_default_max();
        let mut frame = None;
        for _ in 0..64 {
            if let Some(f) = codec.decode(&mut reader).expect("io") {
                frame = Some(f);
                break;
            }
        }
        assert_eq!(frame.expect("complete").body, b"hello world");
    }

    #[test]
    fn test_rejects_oversize_and_unknown_kind() {
        let mut codec = FrameCodec::new(8);
        let mut big = Cursor::new(FrameCodec::encode(FrameKind::Message, &[0u8; 32]));
        let err = codec.decode(&mut big).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert_eq!(codec.frames_rejected(), 1);

        let mut codec = FrameCodec::with_default_max();
        let mut unknown = Cursor::new(vec![0, 0, 0, 1, 0x7f]);
        let err = codec.decode(&mut unknown).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
