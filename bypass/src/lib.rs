// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Remoting of the codec API between an application-facing host and a codec target.
//!
//! The [`host::HostClient`] marshals each API call into a frame and hands it to a
//! [`dispatcher::Dispatcher`], which blocks until the target answers. The target side,
//! [`target::TargetServer`], decodes requests, runs them against a [`engine::CodecEngine`] and
//! replies. While a call is in flight the target may call back into the host to run the
//! application's [`engine::FrameAllocator`], either inline on the main channel or on a dedicated
//! sub-channel served by a host thread.

use std::fmt;
use std::str::FromStr;

use mfx_wire::Status;
use remain::sorted;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error as ThisError;

pub mod dispatcher;
pub mod echo_engine;
pub mod engine;
pub mod function_table;
pub mod host;
pub mod session;
pub mod surface_cache;
pub mod target;

pub use dispatcher::CallbackHandler;
pub use dispatcher::Dispatcher;
pub use dispatcher::Response;
pub use dispatcher::VaExecutor;
pub use echo_engine::EchoEngine;
pub use engine::CodecEngine;
pub use engine::CodecKind;
pub use engine::FrameAllocator;
pub use host::HostClient;
pub use target::TargetServer;

#[sorted]
#[derive(Debug, ThisError)]
pub enum Error {
    /// The thread serving a dedicated allocator channel could not be started.
    #[error("failed to start allocator listener: {0}")]
    SpawnListener(std::io::Error),
    /// The call completed with a codec status that ends it early.
    #[error("codec status {0}")]
    Status(Status),
    /// The channel to the peer failed.
    #[error("transport error: {0}")]
    Transport(#[from] shim_transport::Error),
    /// The peer asked for a callback nobody handles.
    #[error("no handler for callback request {0}")]
    UnsupportedCallback(u32),
    /// The function id is outside the table or has no handler.
    #[error("function {0} is not supported")]
    UnsupportedOperation(u32),
    /// A frame could not be encoded or decoded.
    #[error("malformed frame: {0}")]
    Wire(#[from] mfx_wire::Error),
}

impl Error {
    /// Status reported to the caller in place of this error.
    pub fn status(&self) -> Status {
        match self {
            Error::SpawnListener(_) => Status::ERR_UNKNOWN,
            Error::Status(s) => *s,
            Error::Transport(_) => Status::ERR_UNKNOWN,
            Error::UnsupportedCallback(_) => Status::ERR_UNKNOWN,
            Error::UnsupportedOperation(_) => Status::ERR_UNSUPPORTED,
            Error::Wire(e) => e.status(),
        }
    }
}

impl From<Status> for Error {
    fn from(s: Status) -> Self {
        Error::Status(s)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Where the target sends frame allocator callbacks.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallbackDelivery {
    /// On the main channel, interleaved with the reply to the call in flight.
    #[default]
    Inplace,
    /// On a sub-channel opened when the allocator is attached, served by a host thread.
    Dedicated,
}

impl fmt::Display for CallbackDelivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CallbackDelivery::Inplace => "inplace",
            CallbackDelivery::Dedicated => "dedicated",
        })
    }
}

impl FromStr for CallbackDelivery {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "inplace" => Ok(CallbackDelivery::Inplace),
            "dedicated" => Ok(CallbackDelivery::Dedicated),
            _ => Err(format!("unknown callback delivery '{}'", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_map_to_statuses() {
        assert_eq!(
            Error::UnsupportedOperation(1000).status(),
            Status::ERR_UNSUPPORTED
        );
        assert_eq!(Error::UnsupportedCallback(1107).status(), Status::ERR_UNKNOWN);
        assert_eq!(
            Error::Transport(shim_transport::Error::Disconnect).status(),
            Status::ERR_UNKNOWN
        );
        assert_eq!(
            Error::Wire(mfx_wire::Error::OutOfData { want: 8, left: 0 }).status(),
            Status::ERR_UNKNOWN
        );
        assert_eq!(
            Error::Wire(mfx_wire::Error::BitstreamTooLarge(u32::MAX)).status(),
            Status::ERR_MEMORY_ALLOC
        );
        assert_eq!(
            Error::from(Status::ERR_MORE_DATA).status(),
            Status::ERR_MORE_DATA
        );
    }

    #[test]
    fn callback_delivery_names() {
        assert_eq!(
            "dedicated".parse::<CallbackDelivery>().unwrap(),
            CallbackDelivery::Dedicated
        );
        assert_eq!(CallbackDelivery::Inplace.to_string(), "inplace");
        assert!("inline".parse::<CallbackDelivery>().is_err());
    }
}
