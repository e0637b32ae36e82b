// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Listeners accepting main channels on the target.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::net::TcpListener;
use std::net::ToSocketAddrs;

use log::info;

use crate::channel::Channel;
use crate::Error;
use crate::Result;

/// Listener for accepting connections.
pub trait Listener {
    /// Accepts an incoming connection. Returns `None` when no connection is pending on a
    /// nonblocking listener or the peer went away before it was accepted.
    fn accept(&mut self) -> Result<Option<Channel>>;

    /// Changes blocking status on the listener.
    fn set_nonblocking(&self, nonblocking: bool) -> Result<()>;
}

fn accept_with<S, F>(mut f: F) -> Result<Option<S>>
where
    F: FnMut() -> std::io::Result<S>,
{
    loop {
        match f() {
            Ok(stream) => return Ok(Some(stream)),
            Err(e) => match e.kind() {
                ErrorKind::WouldBlock => return Ok(None),
                ErrorKind::ConnectionAborted => return Ok(None),
                ErrorKind::Interrupted => continue,
                _ => return Err(Error::Accept(e)),
            },
        }
    }
}

/// TCP listener handing out stream channels.
pub struct TcpChannelListener {
    inner: TcpListener,
}

impl TcpChannelListener {
    pub fn bind<A: ToSocketAddrs + std::fmt::Display>(addr: A) -> Result<TcpChannelListener> {
        let inner = TcpListener::bind(&addr).map_err(|e| Error::Bind {
            addr: addr.to_string(),
            source: e,
        })?;
        Ok(TcpChannelListener { inner })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.inner.local_addr().map_err(Error::Accept)
    }
}

impl Listener for TcpChannelListener {
    fn accept(&mut self) -> Result<Option<Channel>> {
        let stream = accept_with(|| self.inner.accept().map(|(s, _)| s))?;
        Ok(stream.map(|s| {
            if let Ok(peer) = s.peer_addr() {
                info!("accepted connection from {}", peer);
            }
            // Frames are small and latency bound.
            let _ = s.set_nodelay(true);
            Channel::from_stream(s)
        }))
    }

    fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        self.inner
            .set_nonblocking(nonblocking)
            .map_err(Error::Accept)
    }
}

#[cfg(unix)]
mod unix {
    use std::os::unix::net::UnixListener;
    use std::path::Path;
    use std::path::PathBuf;

    use super::*;

    struct DropPath {
        path: PathBuf,
    }

    impl Drop for DropPath {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }

    /// Unix domain stream socket listener. The socket file is removed on drop.
    pub struct UnixChannelListener {
        inner: UnixListener,
        _drop_path: DropPath,
    }

    impl UnixChannelListener {
        pub fn bind<P: AsRef<Path>>(path: P, unlink: bool) -> Result<UnixChannelListener> {
            if unlink {
                let _ = std::fs::remove_file(&path);
            }
            let inner = UnixListener::bind(&path).map_err(|e| Error::Bind {
                addr: path.as_ref().display().to_string(),
                source: e,
            })?;
            Ok(UnixChannelListener {
                inner,
                _drop_path: DropPath {
                    path: path.as_ref().to_owned(),
                },
            })
        }
    }

    impl Listener for UnixChannelListener {
        fn accept(&mut self) -> Result<Option<Channel>> {
            let stream = accept_with(|| self.inner.accept().map(|(s, _)| s))?;
            Ok(stream.map(Channel::from_stream))
        }

        fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
            self.inner
                .set_nonblocking(nonblocking)
                .map_err(Error::Accept)
        }
    }
}

#[cfg(unix)]
pub use unix::UnixChannelListener;
