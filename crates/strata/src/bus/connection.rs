// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Non-blocking framed connection shared by the router, the manager and the
//! portal I/O thread.

use super::frame::{Frame, FrameCodec};
use mio::net::TcpStream;
use std::collections::VecDeque;
use std::io::{self, Write};
use std::net::SocketAddr;

/// Outcome of queueing a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Queued {
    Accepted,
    /// Dropped because the send queue reached its high-water mark.
    Dropped,
}

pub(crate) struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    codec: FrameCodec,
    send_queue: VecDeque<Vec<u8>>,
    /// Bytes of the front frame already written.
    send_offset: usize,
    high_water_mark: usize,
}

impl Connection {
    pub(crate) fn new(
        stream: TcpStream,
        peer: SocketAddr,
        max_frame_size: usize,
        high_water_mark: usize,
    ) -> Self {
        let _ = stream.set_nodelay(true);
        Self {
            stream,
            peer,
            codec: FrameCodec::new(max_frame_size),
            send_queue: VecDeque::new(),
            send_offset: 0,
            high_water_mark,
        }
    }

    pub(crate) fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    pub(crate) fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Queues an encoded frame, honoring the high-water mark.
    pub(crate) fn queue(&mut self, encoded: Vec<u8>) -> Queued {
        if self.send_queue.len() >= self.high_water_mark {
            return Queued::Dropped;
        }
        self.send_queue.push_back(encoded);
        Queued::Accepted
    }

    /// Queues a frame regardless of the high-water mark (control traffic).
    pub(crate) fn queue_control(&mut self, encoded: Vec<u8>) {
        self.send_queue.push_back(encoded);
    }

    pub(crate) fn has_pending_writes(&self) -> bool {
        !self.send_queue.is_empty()
    }

    /// Writes queued frames until the socket would block.
    pub(crate) fn flush(&mut self) -> io::Result<()> {
        while let Some(front) = self.send_queue.front() {
            match self.stream.write(&front[self.send_offset..]) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
                }
                Ok(n) => {
                    self.send_offset += n;
                    if self.send_offset >= front.len() {
                        self.send_queue.pop_front();
                        self.send_offset = 0;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Reads every complete frame currently available.
    ///
    /// Peer close is reported as `UnexpectedEof` after the frames that
    /// preceded it have been returned through `frames`.
    pub(crate) fn read_frames(&mut self, frames: &mut Vec<Frame>) -> io::Result<()> {
        loop {
            match self.codec.decode(&mut self.stream) {
                Ok(Some(frame)) => frames.push(frame),
                Ok(None) => return Ok(()),
                Err(e) => {
                    if e.kind() == io::ErrorKind::UnexpectedEof && self.codec.is_partial() {
                        log::debug!("[bus] {} closed mid-frame", self.peer);
                    }
                    return Err(e);
                }
            }
        }
    }
}
