// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Numbered channels between one host and one target.
//!
//! Channel 0 is the main channel. Further channels are requested by the host, which picks the
//! ids and tells the target about them over the main channel; the host then connects while the
//! target accepts.

use std::collections::VecDeque;
use std::net::TcpListener;
use std::net::TcpStream;
use std::sync::atomic::AtomicU16;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::debug;
use parking_lot::Condvar;
use parking_lot::Mutex;

use crate::channel::Channel;
use crate::queue::QueuePort;
use crate::CommMode;
use crate::Error;
use crate::Result;

/// Number of connection attempts before giving up on a peer that is not listening yet.
pub const CONNECT_RETRIES: u32 = 100;
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(20);

/// Opens numbered channels to the peer.
pub trait Fabric: Send + Sync {
    fn mode(&self) -> CommMode;

    /// Reserves the next pair of channel ids, as `(tx, rx)`.
    fn next_channel_pair(&self) -> (u16, u16);

    /// Host side: connects channel `id`, retrying while the target is not ready.
    fn connect(&self, id: u16) -> Result<Channel>;

    /// Target side: waits for the host to connect channel `id`. `None` takes the oldest pending
    /// connection, which only transports without channel ids support.
    fn accept(&self, id: Option<u16>) -> Result<Channel>;
}

fn retry<T, F>(addr: &str, mut f: F) -> Result<T>
where
    F: FnMut() -> std::io::Result<T>,
{
    let mut attempt = 0;
    loop {
        match f() {
            Ok(v) => return Ok(v),
            Err(e) if attempt + 1 < CONNECT_RETRIES => {
                debug!("connect to {} failed ({}), retrying", addr, e);
                attempt += 1;
                thread::sleep(CONNECT_RETRY_DELAY);
            }
            Err(e) => {
                return Err(Error::Connect {
                    addr: addr.to_string(),
                    source: e,
                })
            }
        }
    }
}

/// Channel `id` is the TCP port `base_port + id`.
pub struct TcpFabric {
    host: String,
    base_port: u16,
    last_channel: AtomicU16,
}

impl TcpFabric {
    pub fn new(host: &str, base_port: u16) -> TcpFabric {
        TcpFabric {
            host: host.to_string(),
            base_port,
            last_channel: AtomicU16::new(0),
        }
    }

    fn addr(&self, id: u16) -> String {
        format!("{}:{}", self.host, self.base_port.wrapping_add(id))
    }
}

impl Fabric for TcpFabric {
    fn mode(&self) -> CommMode {
        CommMode::Tcp
    }

    fn next_channel_pair(&self) -> (u16, u16) {
        let tx = self.last_channel.fetch_add(2, Ordering::SeqCst) + 1;
        (tx, tx + 1)
    }

    fn connect(&self, id: u16) -> Result<Channel> {
        let addr = self.addr(id);
        let stream = retry(&addr, || TcpStream::connect(&addr))?;
        let _ = stream.set_nodelay(true);
        Ok(Channel::from_stream(stream))
    }

    fn accept(&self, id: Option<u16>) -> Result<Channel> {
        let id = id.ok_or(Error::Unsupported("accept without a channel id"))?;
        let addr = self.addr(id);
        let listener = TcpListener::bind(&addr).map_err(|e| Error::Bind {
            addr: addr.clone(),
            source: e,
        })?;
        let (stream, _) = listener.accept().map_err(Error::Accept)?;
        let _ = stream.set_nodelay(true);
        Ok(Channel::from_stream(stream))
    }
}

#[cfg(unix)]
mod xlink {
    use std::path::PathBuf;

    use super::*;
    use crate::datagram::DatagramPort;

    /// Channel `id` is a pair of datagram sockets `ch<id>-host.sock` and `ch<id>-target.sock`
    /// in a shared directory.
    pub struct XlinkFabric {
        dir: PathBuf,
        last_channel: AtomicU16,
    }

    impl XlinkFabric {
        pub fn new<P: Into<PathBuf>>(dir: P) -> XlinkFabric {
            XlinkFabric {
                dir: dir.into(),
                last_channel: AtomicU16::new(0),
            }
        }

        fn open(&self, id: u16, local: &str, peer: &str) -> Result<Channel> {
            let local = self.dir.join(format!("ch{}-{}.sock", id, local));
            let peer = self.dir.join(format!("ch{}-{}.sock", id, peer));
            let port = DatagramPort::bind(&local)?;
            retry(&peer.display().to_string(), || port.connect(&peer))?;
            Ok(Channel::from_port(port))
        }
    }

    impl Fabric for XlinkFabric {
        fn mode(&self) -> CommMode {
            CommMode::Xlink
        }

        fn next_channel_pair(&self) -> (u16, u16) {
            let tx = self.last_channel.fetch_add(2, Ordering::SeqCst) + 1;
            (tx, tx + 1)
        }

        fn connect(&self, id: u16) -> Result<Channel> {
            self.open(id, "host", "target")
        }

        fn accept(&self, id: Option<u16>) -> Result<Channel> {
            let id = id.ok_or(Error::Unsupported("accept without a channel id"))?;
            self.open(id, "target", "host")
        }
    }
}

#[cfg(unix)]
pub use xlink::XlinkFabric;

#[derive(Default)]
struct QueueState {
    pending: VecDeque<(u16, QueuePort)>,
}

/// In-process fabric. Cloning yields another handle to the same fabric.
#[derive(Clone, Default)]
pub struct QueueFabric {
    state: Arc<(Mutex<QueueState>, Condvar)>,
    last_channel: Arc<AtomicU16>,
}

impl QueueFabric {
    pub fn new() -> QueueFabric {
        QueueFabric::default()
    }
}

impl Fabric for QueueFabric {
    fn mode(&self) -> CommMode {
        CommMode::Unite
    }

    fn next_channel_pair(&self) -> (u16, u16) {
        let tx = self.last_channel.fetch_add(2, Ordering::SeqCst) + 1;
        (tx, tx + 1)
    }

    fn connect(&self, id: u16) -> Result<Channel> {
        let (host, target) = QueuePort::pair();
        let (lock, cvar) = &*self.state;
        lock.lock().pending.push_back((id, target));
        cvar.notify_all();
        Ok(Channel::from_port(host))
    }

    fn accept(&self, id: Option<u16>) -> Result<Channel> {
        let (lock, cvar) = &*self.state;
        let mut state = lock.lock();
        loop {
            let pos = match id {
                Some(id) => state.pending.iter().position(|(pending, _)| *pending == id),
                None => (!state.pending.is_empty()).then_some(0),
            };
            if let Some((_, port)) = pos.and_then(|pos| state.pending.remove(pos)) {
                return Ok(Channel::from_port(port));
            }
            cvar.wait(&mut state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ping(host: &mut Channel, id: u16) {
        let frame = [id as u8, 0, 0, 0, 8, 0, 0, 0];
        host.write_frame(&frame).unwrap();
    }

    #[test]
    fn queue_fabric_matches_ids() {
        let fabric = QueueFabric::new();
        let (tx, rx) = fabric.next_channel_pair();
        assert_eq!((tx, rx), (1, 2));
        assert_eq!(fabric.next_channel_pair(), (3, 4));

        let mut a = fabric.connect(7).unwrap();
        let mut b = fabric.connect(tx).unwrap();
        ping(&mut a, 7);
        ping(&mut b, tx);

        let mut target_b = fabric.accept(Some(tx)).unwrap();
        assert_eq!(target_b.read_frame().unwrap()[0], tx as u8);
        let mut target_a = fabric.accept(None).unwrap();
        assert_eq!(target_a.read_frame().unwrap()[0], 7);
    }

    #[test]
    fn tcp_fabric_waits_for_the_target() {
        // Pick a free base port; channel 1 lives one above it.
        let spare = TcpListener::bind("127.0.0.1:0").unwrap();
        let base = spare.local_addr().unwrap().port();
        drop(spare);
        let fabric = Arc::new(TcpFabric::new("127.0.0.1", base.wrapping_sub(1)));

        let target = {
            let fabric = fabric.clone();
            thread::spawn(move || {
                let mut ch = fabric.accept(Some(1)).unwrap();
                ch.read_frame().unwrap()
            })
        };
        let mut host = fabric.connect(1).unwrap();
        ping(&mut host, 1);
        assert_eq!(target.join().unwrap()[0], 1);
    }

    #[test]
    fn xlink_fabric_pairs_sockets() {
        let dir = tempfile::tempdir().unwrap();
        let fabric = Arc::new(XlinkFabric::new(dir.path()));
        let target = {
            let fabric = fabric.clone();
            thread::spawn(move || {
                let mut ch = fabric.accept(Some(3)).unwrap();
                ch.read_frame().unwrap()
            })
        };
        let mut host = fabric.connect(3).unwrap();
        ping(&mut host, 3);
        assert_eq!(target.join().unwrap()[0], 3);
    }
}
