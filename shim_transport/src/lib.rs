// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Transports carrying bypass frames between the host and the target.
//!
//! A [`Channel`] moves whole frames over a [`Link`]. Byte-stream links (TCP, Unix stream sockets)
//! are read header first; message links (Unix datagram sockets standing in for the PCIe fabric,
//! and an in-process queue) deliver the first chunk of a frame as one message and the remainder
//! in further messages.
//!
//! The main channel of a connection is obtained from a [`Listener`] on the target and a
//! connector on the host. Additional channels, used for dedicated frame allocator traffic, are
//! opened through a [`Fabric`] by channel id.

use std::fmt;
use std::io;
use std::str::FromStr;

use remain::sorted;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error as ThisError;

mod channel;
mod fabric;
mod link;
mod listener;
mod queue;

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod datagram;
        pub use datagram::DatagramPort;
        pub use fabric::XlinkFabric;
        pub use listener::UnixChannelListener;
    }
}

pub use channel::Channel;
pub use channel::DATA_MAX_SEND_SIZE;
pub use channel::MAX_FRAME_SIZE;
pub use fabric::Fabric;
pub use fabric::QueueFabric;
pub use fabric::TcpFabric;
pub use link::Link;
pub use link::MessageLink;
pub use link::MessagePort;
pub use link::StreamLink;
pub use listener::Listener;
pub use listener::TcpChannelListener;
pub use queue::QueuePort;

/// Errors of the transport layer.
#[sorted]
#[derive(Debug, ThisError)]
pub enum Error {
    /// Failed to accept an incoming connection.
    #[error("failed to accept connection: {0}")]
    Accept(io::Error),
    /// Failed to bind a listening socket.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    /// The peer did not become reachable.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
    /// The peer closed the connection.
    #[error("peer closed the connection")]
    Disconnect,
    /// A frame header announced an impossible size.
    #[error("invalid frame size {size} (first chunk {chunk} bytes)")]
    InvalidFrameSize { size: u32, chunk: usize },
    /// Receiving failed.
    #[error("failed to receive: {0}")]
    Recv(io::Error),
    /// Sending failed.
    #[error("failed to send: {0}")]
    Send(io::Error),
    /// The operation is not available on this transport.
    #[error("{0} is not supported by this transport")]
    Unsupported(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Physical transport selection.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommMode {
    /// Byte-stream socket.
    #[default]
    Tcp,
    /// Message channel of the PCIe fabric.
    Xlink,
    /// Shared-memory queue.
    Unite,
}

impl CommMode {
    /// True when frames are read header first from a byte stream.
    pub fn is_stream(self) -> bool {
        self == CommMode::Tcp
    }
}

impl fmt::Display for CommMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CommMode::Tcp => "tcp",
            CommMode::Xlink => "xlink",
            CommMode::Unite => "unite",
        })
    }
}

impl FromStr for CommMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(CommMode::Tcp),
            "xlink" => Ok(CommMode::Xlink),
            "unite" => Ok(CommMode::Unite),
            _ => Err(format!("unknown transport mode `{}`", s)),
        }
    }
}
