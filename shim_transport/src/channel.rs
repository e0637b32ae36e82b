// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use log::error;

use crate::link::Link;
use crate::Error;
use crate::Result;

/// Largest message a message link carries in one piece.
pub const DATA_MAX_SEND_SIZE: usize = 64 * 1024;

/// Largest frame accepted from the peer.
pub const MAX_FRAME_SIZE: u32 = 512 * 1024 * 1024;

const HEADER_SIZE: usize = 8;

fn frame_size(header: &[u8]) -> u32 {
    u32::from_le_bytes([header[4], header[5], header[6], header[7]])
}

/// Moves whole frames over a [`Link`].
pub struct Channel {
    link: Box<dyn Link>,
}

impl Channel {
    pub fn new(link: Box<dyn Link>) -> Channel {
        Channel { link }
    }

    /// Builds a channel over a connected byte-stream socket.
    pub fn from_stream<S>(stream: S) -> Channel
    where
        S: std::io::Read + std::io::Write + Send + 'static,
    {
        Channel::new(Box::new(crate::StreamLink::new(stream)))
    }

    /// Builds a channel over a message port.
    pub fn from_port<P: crate::MessagePort + 'static>(port: P) -> Channel {
        Channel::new(Box::new(crate::MessageLink::new(port)))
    }

    /// Two connected in-process channels.
    pub fn queue_pair() -> (Channel, Channel) {
        let (a, b) = crate::QueuePort::pair();
        (Channel::from_port(a), Channel::from_port(b))
    }

    /// Two connected channels over a Unix stream socket pair.
    #[cfg(unix)]
    pub fn stream_pair() -> Result<(Channel, Channel)> {
        let (a, b) = std::os::unix::net::UnixStream::pair().map_err(|e| Error::Connect {
            addr: "socketpair".to_string(),
            source: e,
        })?;
        Ok((Channel::from_stream(a), Channel::from_stream(b)))
    }

    pub fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.link.send(frame).map_err(|e| {
            error!("failed to send {} byte frame: {}", frame.len(), e);
            e
        })
    }

    /// Reads one complete frame.
    pub fn read_frame(&mut self) -> Result<Vec<u8>> {
        let frame = if self.link.is_message_oriented() {
            self.read_message_frame()
        } else {
            self.read_stream_frame()
        };
        if let Err(e) = &frame {
            if !matches!(e, Error::Disconnect) {
                error!("failed to receive frame: {}", e);
            }
        }
        frame
    }

    fn read_stream_frame(&mut self) -> Result<Vec<u8>> {
        let mut frame = vec![0; HEADER_SIZE];
        self.link.recv_exact(&mut frame)?;
        let size = frame_size(&frame);
        if (size as usize) < HEADER_SIZE || size > MAX_FRAME_SIZE {
            return Err(Error::InvalidFrameSize {
                size,
                chunk: HEADER_SIZE,
            });
        }
        frame.resize(size as usize, 0);
        self.link.recv_exact(&mut frame[HEADER_SIZE..])?;
        Ok(frame)
    }

    fn read_message_frame(&mut self) -> Result<Vec<u8>> {
        let mut frame = self.link.recv_message()?;
        let chunk = frame.len();
        if chunk < HEADER_SIZE {
            return Err(Error::InvalidFrameSize { size: 0, chunk });
        }
        let size = frame_size(&frame);
        if (size as usize) < chunk || size > MAX_FRAME_SIZE {
            return Err(Error::InvalidFrameSize { size, chunk });
        }
        frame.resize(size as usize, 0);
        self.link.recv_exact(&mut frame[chunk..])?;
        Ok(frame)
    }
}
