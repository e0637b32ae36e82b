// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Message channel over connected Unix datagram sockets.

use std::os::unix::net::UnixDatagram;
use std::path::Path;
use std::path::PathBuf;

use crate::channel::DATA_MAX_SEND_SIZE;
use crate::link::MessagePort;
use crate::Error;
use crate::Result;

/// A datagram socket bound to a path and connected to the peer's path.
pub struct DatagramPort {
    sock: UnixDatagram,
    local: Option<PathBuf>,
    buf: Vec<u8>,
}

impl DatagramPort {
    /// Binds `local`, removing a stale socket file first.
    pub fn bind(local: &Path) -> Result<DatagramPort> {
        let _ = std::fs::remove_file(local);
        let sock = UnixDatagram::bind(local).map_err(|e| Error::Bind {
            addr: local.display().to_string(),
            source: e,
        })?;
        Ok(DatagramPort {
            sock,
            local: Some(local.to_owned()),
            buf: vec![0; DATA_MAX_SEND_SIZE],
        })
    }

    /// Two connected unnamed ports.
    pub fn pair() -> Result<(DatagramPort, DatagramPort)> {
        let (a, b) = UnixDatagram::pair().map_err(|e| Error::Connect {
            addr: "socketpair".to_string(),
            source: e,
        })?;
        let port = |sock| DatagramPort {
            sock,
            local: None,
            buf: vec![0; DATA_MAX_SEND_SIZE],
        };
        Ok((port(a), port(b)))
    }

    pub fn connect(&self, peer: &Path) -> std::io::Result<()> {
        self.sock.connect(peer)
    }
}

impl MessagePort for DatagramPort {
    fn send_message(&mut self, message: &[u8]) -> Result<()> {
        let sent = self.sock.send(message).map_err(Error::Send)?;
        if sent != message.len() {
            return Err(Error::Send(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                format!("sent {} of {} bytes", sent, message.len()),
            )));
        }
        Ok(())
    }

    fn recv_message(&mut self) -> Result<Vec<u8>> {
        let n = self.sock.recv(&mut self.buf).map_err(Error::Recv)?;
        if n == 0 {
            return Err(Error::Disconnect);
        }
        Ok(self.buf[..n].to_vec())
    }
}

impl Drop for DatagramPort {
    fn drop(&mut self) {
        if let Some(path) = &self.local {
            let _ = std::fs::remove_file(path);
        }
    }
}
