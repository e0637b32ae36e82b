// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Codec status codes and their classification on the wire.

use std::fmt;

use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

use crate::function::CallbackId;
use crate::function::FIRST_FUNCTION;

/// Set on every reply to a callback request so it can't be taken for a new request.
pub const CB_RESULT_FLAG: u32 = 0x4000;

/// A codec status. Negative values are errors, positive values are warnings.
#[repr(transparent)]
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, Hash, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
pub struct Status(pub i32);

impl Status {
    pub const NONE: Status = Status(0);

    pub const ERR_UNKNOWN: Status = Status(-1);
    pub const ERR_NULL_PTR: Status = Status(-2);
    pub const ERR_UNSUPPORTED: Status = Status(-3);
    pub const ERR_MEMORY_ALLOC: Status = Status(-4);
    pub const ERR_NOT_ENOUGH_BUFFER: Status = Status(-5);
    pub const ERR_INVALID_HANDLE: Status = Status(-6);
    pub const ERR_LOCK_MEMORY: Status = Status(-7);
    pub const ERR_NOT_INITIALIZED: Status = Status(-8);
    pub const ERR_NOT_FOUND: Status = Status(-9);
    pub const ERR_MORE_DATA: Status = Status(-10);
    pub const ERR_MORE_SURFACE: Status = Status(-11);
    pub const ERR_ABORTED: Status = Status(-12);
    pub const ERR_DEVICE_LOST: Status = Status(-13);
    pub const ERR_INCOMPATIBLE_VIDEO_PARAM: Status = Status(-14);
    pub const ERR_INVALID_VIDEO_PARAM: Status = Status(-15);
    pub const ERR_UNDEFINED_BEHAVIOR: Status = Status(-16);
    pub const ERR_DEVICE_FAILED: Status = Status(-17);
    pub const ERR_MORE_BITSTREAM: Status = Status(-18);
    pub const ERR_GPU_HANG: Status = Status(-21);
    pub const ERR_REALLOC_SURFACE: Status = Status(-22);
    pub const ERR_NOT_IMPLEMENTED: Status = Status(-24);

    pub const WRN_IN_EXECUTION: Status = Status(1);
    pub const WRN_DEVICE_BUSY: Status = Status(2);
    pub const WRN_VIDEO_PARAM_CHANGED: Status = Status(3);
    pub const WRN_PARTIAL_ACCELERATION: Status = Status(4);
    pub const WRN_INCOMPATIBLE_VIDEO_PARAM: Status = Status(5);
    pub const WRN_VALUE_NOT_CHANGED: Status = Status(6);
    pub const WRN_OUT_OF_RANGE: Status = Status(7);
    pub const WRN_FILTER_SKIPPED: Status = Status(10);

    pub fn is_ok(self) -> bool {
        self == Status::NONE
    }

    pub fn is_error(self) -> bool {
        self.0 < 0
    }

    pub fn is_warning(self) -> bool {
        self.0 > 0
    }

    /// Raw 32-bit representation used in frame headers.
    pub fn to_raw(self) -> u32 {
        self.0 as u32
    }

    pub fn from_raw(raw: u32) -> Status {
        Status(raw as i32)
    }

    /// Normalizes a status returned by the codec engine before it is sent back to the host.
    pub fn masked(self) -> Status {
        if self.0 != 0 {
            Status(self.0 & Status::ERR_UNKNOWN.0)
        } else {
            self
        }
    }

    /// Converts to a `Result`, treating warnings as success.
    pub fn into_result(self) -> std::result::Result<Status, Status> {
        if self.is_error() {
            Err(self)
        } else {
            Ok(self)
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match *self {
            Status::NONE => "MFX_ERR_NONE",
            Status::ERR_UNKNOWN => "MFX_ERR_UNKNOWN",
            Status::ERR_NULL_PTR => "MFX_ERR_NULL_PTR",
            Status::ERR_UNSUPPORTED => "MFX_ERR_UNSUPPORTED",
            Status::ERR_MEMORY_ALLOC => "MFX_ERR_MEMORY_ALLOC",
            Status::ERR_NOT_ENOUGH_BUFFER => "MFX_ERR_NOT_ENOUGH_BUFFER",
            Status::ERR_INVALID_HANDLE => "MFX_ERR_INVALID_HANDLE",
            Status::ERR_LOCK_MEMORY => "MFX_ERR_LOCK_MEMORY",
            Status::ERR_NOT_INITIALIZED => "MFX_ERR_NOT_INITIALIZED",
            Status::ERR_NOT_FOUND => "MFX_ERR_NOT_FOUND",
            Status::ERR_MORE_DATA => "MFX_ERR_MORE_DATA",
            Status::ERR_MORE_SURFACE => "MFX_ERR_MORE_SURFACE",
            Status::ERR_ABORTED => "MFX_ERR_ABORTED",
            Status::ERR_DEVICE_LOST => "MFX_ERR_DEVICE_LOST",
            Status::ERR_INCOMPATIBLE_VIDEO_PARAM => "MFX_ERR_INCOMPATIBLE_VIDEO_PARAM",
            Status::ERR_INVALID_VIDEO_PARAM => "MFX_ERR_INVALID_VIDEO_PARAM",
            Status::ERR_UNDEFINED_BEHAVIOR => "MFX_ERR_UNDEFINED_BEHAVIOR",
            Status::ERR_DEVICE_FAILED => "MFX_ERR_DEVICE_FAILED",
            Status::ERR_MORE_BITSTREAM => "MFX_ERR_MORE_BITSTREAM",
            Status::ERR_GPU_HANG => "MFX_ERR_GPU_HANG",
            Status::ERR_REALLOC_SURFACE => "MFX_ERR_REALLOC_SURFACE",
            Status::ERR_NOT_IMPLEMENTED => "MFX_ERR_NOT_IMPLEMENTED",
            Status::WRN_IN_EXECUTION => "MFX_WRN_IN_EXECUTION",
            Status::WRN_DEVICE_BUSY => "MFX_WRN_DEVICE_BUSY",
            Status::WRN_VIDEO_PARAM_CHANGED => "MFX_WRN_VIDEO_PARAM_CHANGED",
            Status::WRN_PARTIAL_ACCELERATION => "MFX_WRN_PARTIAL_ACCELERATION",
            Status::WRN_INCOMPATIBLE_VIDEO_PARAM => "MFX_WRN_INCOMPATIBLE_VIDEO_PARAM",
            Status::WRN_VALUE_NOT_CHANGED => "MFX_WRN_VALUE_NOT_CHANGED",
            Status::WRN_OUT_OF_RANGE => "MFX_WRN_OUT_OF_RANGE",
            Status::WRN_FILTER_SKIPPED => "MFX_WRN_FILTER_SKIPPED",
            Status(other) => return write!(f, "{}", other),
        };
        f.write_str(name)
    }
}

/// Marks a status as the reply to a callback request.
pub fn set_cb_result(status: Status) -> u32 {
    status.to_raw() | CB_RESULT_FLAG
}

/// Strips the callback reply marker from a non-negative status.
pub fn cb_result(raw: u32) -> Status {
    let s = raw as i32;
    if s < 0 {
        Status(s)
    } else {
        Status((raw & !CB_RESULT_FLAG) as i32)
    }
}

/// How the leading word of a response is interpreted while a call is in flight.
///
/// `Proxy` is used between the application-facing host and the codec target: unflagged values in
/// the callback id window are frame allocator requests and everything else ends the call.
///
/// `HardwareTarget` is used when the codec runs next to a remote VA driver: the peer sends VA
/// function requests as unflagged values below the first function id and only a flagged reply ends
/// the call. Negative values end the call as errors in both modes.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum DispatchMode {
    #[default]
    Proxy,
    HardwareTarget,
}

impl DispatchMode {
    /// Status word for the final reply of a call served in this mode.
    pub fn final_status(self, status: Status) -> u32 {
        match self {
            DispatchMode::Proxy => status.to_raw(),
            DispatchMode::HardwareTarget => set_cb_result(status),
        }
    }
}

/// The leading word of a response, decoded once on receipt.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WireStatus {
    Success,
    Warning(Status),
    Error(Status),
    CallbackRequest(CallbackId),
    VaRequest(u32),
}

impl WireStatus {
    pub fn decode(raw: u32, mode: DispatchMode) -> WireStatus {
        if (raw as i32) < 0 {
            return WireStatus::Error(Status::from_raw(raw));
        }
        if raw & CB_RESULT_FLAG == 0 {
            if let Some(id) = CallbackId::from_raw(raw) {
                return WireStatus::CallbackRequest(id);
            }
            if mode == DispatchMode::HardwareTarget && raw < FIRST_FUNCTION {
                return WireStatus::VaRequest(raw);
            }
        }
        WireStatus::from_status(cb_result(raw))
    }

    pub fn from_status(status: Status) -> WireStatus {
        if status.is_error() {
            WireStatus::Error(status)
        } else if status.is_warning() {
            WireStatus::Warning(status)
        } else {
            WireStatus::Success
        }
    }

    /// Status of a terminal response. Pending requests report `ERR_UNKNOWN`.
    pub fn status(self) -> Status {
        match self {
            WireStatus::Success => Status::NONE,
            WireStatus::Warning(s) | WireStatus::Error(s) => s,
            WireStatus::CallbackRequest(_) | WireStatus::VaRequest(_) => Status::ERR_UNKNOWN,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(
            self,
            WireStatus::CallbackRequest(_) | WireStatus::VaRequest(_)
        )
    }
}
