// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Wire format of the codec bypass protocol.
//!
//! Every request and response is a single frame made of an 8 byte [`PayloadHeader`] followed by
//! the call specific payload. The header carries either a function id (requests) or a status
//! (responses) and the total size of the frame, both little-endian.
//!
//! Payloads are sequences of fixed-layout records ([`types`]), presence markers, counted arrays
//! and self-describing extension buffers ([`ext_buffer`]). Structures that reference memory owned
//! by the peer (surfaces, bitstreams, memory ids) travel as opaque 64-bit handles which are never
//! interpreted as addresses.

use remain::sorted;
use thiserror::Error as ThisError;

pub mod bitstream;
pub mod caps;
pub mod ext_buffer;
pub mod function;
pub mod param;
pub mod payload;
pub mod status;
pub mod surface;
pub mod types;

pub use bitstream::Bitstream;
pub use bitstream::BitstreamCache;
pub use bitstream::SharedBitstream;
pub use caps::ImplDescription;
pub use ext_buffer::ExtBuffer;
pub use ext_buffer::ExtBufferList;
pub use ext_buffer::ExtBufferRegistry;
pub use ext_buffer::ExtVariable;
pub use function::CallbackId;
pub use function::FunctionId;
pub use payload::PayloadHeader;
pub use payload::PayloadReader;
pub use payload::PayloadWriter;
pub use status::DispatchMode;
pub use status::Status;
pub use status::WireStatus;
pub use surface::FrameSurface;
pub use surface::SharedSurface;

/// Errors raised while encoding or decoding a frame.
#[sorted]
#[derive(Debug, ThisError, PartialEq, Eq)]
pub enum Error {
    /// The bitstream region does not fit in its buffer.
    #[error("bitstream region {offset}+{length} exceeds max length {max}")]
    BitstreamOverrun { offset: u32, length: u32, max: u32 },
    /// The peer announced a bitstream larger than we accept.
    #[error("bitstream of {0} bytes is too large")]
    BitstreamTooLarge(u32),
    /// An extension buffer declares a size smaller than its own header.
    #[error("extension buffer {id:#x} declares invalid size {size}")]
    InvalidExtBufferSize { id: u32, size: u32 },
    /// The frame header is shorter than 8 bytes or disagrees with the received length.
    #[error("invalid frame: header says {declared} bytes, got {actual}")]
    InvalidFrame { declared: usize, actual: usize },
    /// A read went past the end of the frame.
    #[error("out of data: wanted {want} bytes, {left} left")]
    OutOfData { want: usize, left: usize },
    /// A seek or skip went past the end of the frame.
    #[error("seek to {pos} past end of frame ({len} bytes)")]
    SeekPastEnd { pos: usize, len: usize },
    /// A codec status to report verbatim.
    #[error("codec status {0}")]
    Status(Status),
    /// A capability list longer than its count field can carry.
    #[error("too many capability entries: {0}")]
    TooManyCapabilities(usize),
    /// More extension buffers than the count field can carry.
    #[error("too many extension buffers: {0}")]
    TooManyExtBuffers(usize),
}

impl Error {
    /// Returns the codec status reported to callers for this error.
    pub fn status(&self) -> Status {
        match self {
            Error::BitstreamOverrun { .. } => Status::ERR_UNDEFINED_BEHAVIOR,
            Error::BitstreamTooLarge(_) => Status::ERR_MEMORY_ALLOC,
            Error::Status(s) => *s,
            _ => Status::ERR_UNKNOWN,
        }
    }
}

impl From<Status> for Error {
    fn from(s: Status) -> Self {
        Error::Status(s)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
