// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Function and callback identifiers carried in request headers.

use enumn::N;

pub const FIRST_FUNCTION: u32 = 1000;
/// One past the last function id.
pub const LAST_FUNCTION: u32 = 1042;
pub const FIRST_CALLBACK: u32 = 1100;
/// One past the last callback id. Also sent to stop a dedicated allocator channel.
pub const LAST_CALLBACK: u32 = 1105;

/// Codec API entry points, in table order.
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, N)]
pub enum FunctionId {
    Init = 1000,
    Close,
    QueryImpl,
    QueryVersion,
    JoinSession,
    DisjoinSession,
    CloneSession,
    SetPriority,
    GetPriority,
    InitEx,
    Initialize,
    ReleaseImplDescription,
    QueryImplsDescription,
    MemoryGetSurfaceForVpp,
    MemoryGetSurfaceForEncode,
    MemoryGetSurfaceForDecode,
    DecodeQuery,
    DecodeHeader,
    DecodeQueryIoSurf,
    DecodeInit,
    DecodeReset,
    DecodeClose,
    DecodeGetVideoParam,
    DecodeGetDecodeStat,
    DecodeSetSkipMode,
    DecodeGetPayload,
    DecodeFrameAsync,
    EncodeQuery,
    EncodeQueryIoSurf,
    EncodeInit,
    EncodeReset,
    EncodeClose,
    EncodeGetVideoParam,
    EncodeGetEncodeStat,
    EncodeFrameAsync,
    SyncOperation,
    SetFrameAllocator,
    QueryPlatform,
    SetHandle,
    GetHandle,
    ProxyInit,
    ProxyTerm,
}

impl FunctionId {
    pub fn from_raw(raw: u32) -> Option<FunctionId> {
        FunctionId::n(raw)
    }

    /// Position in the dispatch table.
    pub fn index(self) -> usize {
        (self as u32 - FIRST_FUNCTION) as usize
    }
}

/// Frame allocator operations the target asks the host to run.
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, N)]
pub enum CallbackId {
    Alloc = 1100,
    Lock,
    Unlock,
    GetHdl,
    Free,
}

impl CallbackId {
    pub fn from_raw(raw: u32) -> Option<CallbackId> {
        CallbackId::n(raw)
    }

    pub fn index(self) -> usize {
        (self as u32 - FIRST_CALLBACK) as usize
    }
}
