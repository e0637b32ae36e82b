// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::io::ErrorKind;
use std::io::Read;
use std::io::Write;

use crate::channel::DATA_MAX_SEND_SIZE;
use crate::Error;
use crate::Result;

/// A bidirectional, blocking connection to the peer.
pub trait Link: Send {
    /// Sends all of `bytes`.
    fn send(&mut self, bytes: &[u8]) -> Result<()>;

    /// Fills `buf` completely.
    fn recv_exact(&mut self, buf: &mut [u8]) -> Result<()>;

    /// Returns the next message. Only message links support this.
    fn recv_message(&mut self) -> Result<Vec<u8>> {
        Err(Error::Unsupported("message receive"))
    }

    /// True when the link preserves message boundaries.
    fn is_message_oriented(&self) -> bool {
        false
    }
}

fn map_recv_error(e: std::io::Error) -> Error {
    match e.kind() {
        ErrorKind::UnexpectedEof | ErrorKind::ConnectionReset => Error::Disconnect,
        _ => Error::Recv(e),
    }
}

fn map_send_error(e: std::io::Error) -> Error {
    match e.kind() {
        ErrorKind::BrokenPipe | ErrorKind::ConnectionReset => Error::Disconnect,
        _ => Error::Send(e),
    }
}

/// A link over a byte-stream socket.
pub struct StreamLink<S> {
    stream: S,
}

impl<S: Read + Write + Send> StreamLink<S> {
    pub fn new(stream: S) -> StreamLink<S> {
        StreamLink { stream }
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }
}

impl<S: Read + Write + Send> Link for StreamLink<S> {
    fn send(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream.write_all(bytes).map_err(map_send_error)?;
        self.stream.flush().map_err(map_send_error)
    }

    fn recv_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.stream.read_exact(buf).map_err(map_recv_error)
    }
}

/// A transport that moves discrete messages.
pub trait MessagePort: Send {
    fn send_message(&mut self, message: &[u8]) -> Result<()>;
    fn recv_message(&mut self) -> Result<Vec<u8>>;
}

/// Adapts a [`MessagePort`] to a [`Link`], splitting sends into chunks of at most
/// [`DATA_MAX_SEND_SIZE`] bytes.
pub struct MessageLink<P> {
    port: P,
    // Unconsumed tail of the last message.
    pending: Vec<u8>,
}

impl<P: MessagePort> MessageLink<P> {
    pub fn new(port: P) -> MessageLink<P> {
        MessageLink {
            port,
            pending: Vec::new(),
        }
    }
}

impl<P: MessagePort> Link for MessageLink<P> {
    fn send(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        for chunk in bytes.chunks(DATA_MAX_SEND_SIZE) {
            self.port.send_message(chunk)?;
        }
        Ok(())
    }

    fn recv_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            if self.pending.is_empty() {
                self.pending = self.port.recv_message()?;
                continue;
            }
            let n = self.pending.len().min(buf.len() - filled);
            buf[filled..filled + n].copy_from_slice(&self.pending[..n]);
            self.pending.drain(..n);
            filled += n;
        }
        Ok(())
    }

    fn recv_message(&mut self) -> Result<Vec<u8>> {
        if !self.pending.is_empty() {
            return Ok(std::mem::take(&mut self.pending));
        }
        self.port.recv_message()
    }

    fn is_message_oriented(&self) -> bool {
        true
    }
}
