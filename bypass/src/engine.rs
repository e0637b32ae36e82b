// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Interfaces of the components the shim connects: the codec engine on the target and the
//! application's frame allocator on the host.
//!
//! Operations whose outputs only matter on success return `Result<T, Status>`. Operations that
//! report a status together with outputs (warnings and "more data" style errors) take their
//! outputs by reference and return the status.

use std::sync::Arc;

use mfx_wire::bitstream::SharedBitstream;
use mfx_wire::param::AllocatedFrames;
use mfx_wire::param::EncodeCtrl;
use mfx_wire::param::Payload;
use mfx_wire::param::VideoParam;
use mfx_wire::types::DecodeStat;
use mfx_wire::types::EncodeStat;
use mfx_wire::types::FrameAllocRequest;
use mfx_wire::types::InitParam;
use mfx_wire::types::InitializationParam;
use mfx_wire::types::MemId;
use mfx_wire::types::PlatformInfo;
use mfx_wire::types::SessionHandle;
use mfx_wire::types::SyncPoint;
use mfx_wire::types::Version;
use mfx_wire::Bitstream;
use mfx_wire::FrameSurface;
use mfx_wire::ImplDescription;
use mfx_wire::SharedSurface;
use mfx_wire::Status;

/// Which codec component of a session a call addresses.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CodecKind {
    Decode,
    Encode,
}

/// Frame allocator. Supplied by the application on the host; the target hands the codec engine
/// a proxy that forwards to the host's allocator.
pub trait FrameAllocator: Send + Sync {
    fn alloc(&self, request: &FrameAllocRequest) -> Result<AllocatedFrames, Status>;

    /// Maps the frame `mid` into `surface.planes`.
    fn lock(&self, mid: MemId, surface: &mut FrameSurface) -> Status;

    /// Writes `surface.planes` back to the frame `mid` and unmaps it.
    fn unlock(&self, mid: MemId, surface: &mut FrameSurface) -> Status;

    /// VA surface id backing the frame `mid`.
    fn get_hdl(&self, mid: MemId) -> Result<u32, Status>;

    fn free(&self, frames: &AllocatedFrames) -> Status;
}

/// The codec implementation driven by the target.
pub trait CodecEngine: Send {
    fn init_ex(&mut self, par: &InitParam) -> Result<SessionHandle, Status>;
    fn initialize(&mut self, par: &InitializationParam) -> Result<SessionHandle, Status>;
    fn close(&mut self, session: SessionHandle) -> Status;

    fn query_impls_description(&mut self) -> Vec<ImplDescription>;
    fn release_impl_description(&mut self, handle: u64) -> Status;
    fn query_impl(&mut self, session: SessionHandle) -> Result<u32, Status>;
    fn query_version(&mut self, session: SessionHandle) -> Result<Version, Status>;
    fn query_platform(&mut self, session: SessionHandle) -> Result<PlatformInfo, Status>;

    fn join_session(&mut self, session: SessionHandle, child: SessionHandle) -> Status;
    fn disjoin_session(&mut self, session: SessionHandle) -> Status;
    fn clone_session(&mut self, session: SessionHandle) -> Result<SessionHandle, Status>;
    fn set_priority(&mut self, session: SessionHandle, priority: i32) -> Status;
    fn get_priority(&mut self, session: SessionHandle) -> Result<i32, Status>;

    fn set_frame_allocator(
        &mut self,
        session: SessionHandle,
        allocator: Option<Arc<dyn FrameAllocator>>,
    ) -> Status;
    fn set_handle(&mut self, session: SessionHandle, kind: i32, handle: u64) -> Status;
    fn get_handle(&mut self, session: SessionHandle, kind: i32) -> Result<u64, Status>;

    /// Checks `input` and writes the supported configuration to `out`.
    fn query(
        &mut self,
        kind: CodecKind,
        session: SessionHandle,
        input: Option<&VideoParam>,
        out: Option<&mut VideoParam>,
    ) -> Status;
    fn query_io_surf(
        &mut self,
        kind: CodecKind,
        session: SessionHandle,
        par: Option<&VideoParam>,
        request: &mut FrameAllocRequest,
    ) -> Status;
    fn init(&mut self, kind: CodecKind, session: SessionHandle, par: Option<&VideoParam>)
        -> Status;
    fn reset(
        &mut self,
        kind: CodecKind,
        session: SessionHandle,
        par: Option<&VideoParam>,
    ) -> Status;
    fn close_codec(&mut self, kind: CodecKind, session: SessionHandle) -> Status;
    fn get_video_param(
        &mut self,
        kind: CodecKind,
        session: SessionHandle,
        par: &mut VideoParam,
    ) -> Status;

    fn decode_header(
        &mut self,
        session: SessionHandle,
        bs: &mut Bitstream,
        par: &mut VideoParam,
    ) -> Status;
    fn decode_stat(&mut self, session: SessionHandle) -> Result<DecodeStat, Status>;
    fn set_skip_mode(&mut self, session: SessionHandle, mode: i32) -> Status;
    fn get_payload(&mut self, session: SessionHandle, ts: &mut u64, payload: &mut Payload)
        -> Status;
    /// Consumes `bs` into `work`. On output `out` is the surface that will hold the next decoded
    /// frame once `sync` completes.
    fn decode_frame_async(
        &mut self,
        session: SessionHandle,
        bs: Option<&mut Bitstream>,
        work: Option<&SharedSurface>,
        out: &mut Option<SharedSurface>,
        sync: &mut SyncPoint,
    ) -> Status;

    fn encode_stat(&mut self, session: SessionHandle) -> Result<EncodeStat, Status>;
    /// Encodes `surface` into `bs`, which is complete once `sync` completes.
    fn encode_frame_async(
        &mut self,
        session: SessionHandle,
        ctrl: Option<&EncodeCtrl>,
        surface: Option<&SharedSurface>,
        bs: &SharedBitstream,
        sync: &mut SyncPoint,
    ) -> Status;

    fn sync_operation(&mut self, session: SessionHandle, sync: SyncPoint, wait: u32) -> Status;
}
