// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Application-facing side of the bypass.
//!
//! [`HostClient`] exposes the codec API as methods. Every call is marshalled into one request on
//! the main channel and blocks until the target answers. Surfaces and bitstreams passed in are
//! registered in [`HostObjects`] so that replies can name them; lock count changes the target
//! reports are applied to the registered surfaces before a call returns.

mod callbacks;
mod listener;
mod objects;

use std::sync::Arc;

use log::debug;
use log::error;
use log::info;
use log::warn;
use mfx_wire::bitstream::read_bitstream;
use mfx_wire::bitstream::write_bitstream;
use mfx_wire::caps::read_impl_descriptions;
use mfx_wire::param::read_lock_deltas;
use mfx_wire::param::read_payload;
use mfx_wire::param::read_video_param;
use mfx_wire::param::write_encode_ctrl;
use mfx_wire::param::write_payload;
use mfx_wire::param::write_video_param;
use mfx_wire::param::EncodeCtrl;
use mfx_wire::param::Payload;
use mfx_wire::param::VideoParam;
use mfx_wire::surface::put_surface;
use mfx_wire::surface::read_surface_data;
use mfx_wire::types::codec;
use mfx_wire::types::BitstreamId;
use mfx_wire::types::DecodeStat;
use mfx_wire::types::EncodeStat;
use mfx_wire::types::FrameAllocRequest;
use mfx_wire::types::FrameInfo;
use mfx_wire::types::InitParam;
use mfx_wire::types::InitializationParam;
use mfx_wire::types::IoPattern;
use mfx_wire::types::PlatformInfo;
use mfx_wire::types::SessionHandle;
use mfx_wire::types::SurfaceId;
use mfx_wire::types::SyncDependentInfo;
use mfx_wire::types::SyncPoint;
use mfx_wire::types::Version;
use mfx_wire::types::PICSTRUCT_PROGRESSIVE;
use mfx_wire::Bitstream;
use mfx_wire::BitstreamCache;
use mfx_wire::DispatchMode;
use mfx_wire::ExtBufferRegistry;
use mfx_wire::FrameSurface;
use mfx_wire::FunctionId;
use mfx_wire::ImplDescription;
use mfx_wire::PayloadReader;
use mfx_wire::PayloadWriter;
use mfx_wire::SharedBitstream;
use mfx_wire::SharedSurface;
use mfx_wire::Status;
use parking_lot::Mutex;
use shim_transport::Channel;
use shim_transport::CommMode;
use shim_transport::Fabric;
use zerocopy::FromBytes;

pub use self::callbacks::HostCallbacks;
pub use self::listener::AllocatorListener;
pub use self::objects::HostObjects;
use crate::dispatcher::Dispatcher;
use crate::dispatcher::Response;
use crate::dispatcher::VaExecutor;
use crate::engine::CodecKind;
use crate::engine::FrameAllocator;
use crate::session::with_state;
use crate::session::SessionRegistry;
use crate::session::SessionState;
use crate::CallbackDelivery;
use crate::Error;
use crate::Result;

/// Outcome of an API call: the value on success, the codec status otherwise.
pub type CallResult<T> = std::result::Result<T, Status>;

/// Host view of a session.
#[derive(Default)]
pub struct HostSession {
    pub implementation: u32,
    pub allocator: Option<Arc<dyn FrameAllocator>>,
    pub listener: Option<AllocatorListener>,
    /// Parameters of the initialized decoder.
    pub decoder_param: Option<VideoParam>,
    pub encoder_io_pattern: IoPattern,
    pub bs_cache: BitstreamCache,
}

impl HostSession {
    fn decoder_io_pattern(&self) -> IoPattern {
        self.decoder_param
            .as_ref()
            .map_or(IoPattern::empty(), |p| p.io_pattern())
    }

    // Decoded planes are read back through the allocator when the decoder writes to system
    // memory, and for interlaced JPEG.
    fn decoder_needs_lock(&self) -> bool {
        let interlaced_jpeg = self.decoder_param.as_ref().map_or(false, |p| {
            p.header.mfx.codec_id == codec::JPEG
                && p.header.mfx.frame_info.pic_struct != PICSTRUCT_PROGRESSIVE
        });
        interlaced_jpeg
            || self
                .decoder_io_pattern()
                .contains(IoPattern::OUT_SYSTEM_MEMORY)
    }
}

fn pick(kind: CodecKind, decode: FunctionId, encode: FunctionId) -> FunctionId {
    match kind {
        CodecKind::Decode => decode,
        CodecKind::Encode => encode,
    }
}

fn status_of(result: Result<Status>) -> Status {
    result.unwrap_or_else(|e| e.status())
}

fn value_of<T>(result: Result<CallResult<T>>) -> CallResult<T> {
    result.unwrap_or_else(|e| Err(e.status()))
}

fn same_allocator(
    a: Option<&Arc<dyn FrameAllocator>>,
    b: Option<&Arc<dyn FrameAllocator>>,
) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const (),
        _ => false,
    }
}

// Runs `f` on `surface`, locking it through `allocator` around the call when one is given and
// the planes are not mapped yet.
fn with_mapped<R, F>(
    surface: &mut FrameSurface,
    allocator: Option<&dyn FrameAllocator>,
    f: F,
) -> Result<R>
where
    F: FnOnce(&mut FrameSurface) -> Result<R>,
{
    let allocator = allocator.filter(|_| !surface.is_mapped());
    let mid = surface.data.mem_id;
    if let Some(a) = allocator {
        let sts = a.lock(mid, surface);
        if sts != Status::NONE {
            return Err(Error::Status(sts));
        }
    }
    let result = f(surface);
    if let Some(a) = allocator {
        let sts = a.unlock(mid, surface);
        if sts != Status::NONE {
            warn!("unlock of {:#x} failed: {}", mid.0, sts);
        }
    }
    result
}

// Decode output fields that follow the sync dependency info.
fn read_output_fields(
    r: &mut PayloadReader,
    registry: &ExtBufferRegistry,
    surface: &mut FrameSurface,
) -> Result<()> {
    surface.info = r.read_typed::<FrameInfo>()?;
    registry.read_ext_buffers(r, &mut surface.ext_param)?;
    surface.data.time_stamp = r.read_typed()?;
    surface.data.frame_order = r.read_typed()?;
    surface.data.data_flag = r.read_typed()?;
    Ok(())
}

/// Client end of the bypass.
pub struct HostClient {
    dispatcher: Dispatcher,
    fabric: Option<Arc<dyn Fabric>>,
    sessions: Arc<SessionRegistry<HostSession>>,
    callbacks: Arc<HostCallbacks>,
    objects: Mutex<HostObjects>,
    registry: ExtBufferRegistry,
    delivery: CallbackDelivery,
    sync_chunk: Option<u32>,
}

impl HostClient {
    /// A client talking to a proxy target over `channel`.
    pub fn new(channel: Channel) -> HostClient {
        HostClient::build(channel, DispatchMode::Proxy, None)
    }

    /// A client talking to a hardware target, which may ask `va` to run driver calls while a
    /// request is in flight.
    pub fn hardware_target(channel: Channel, va: Arc<dyn VaExecutor>) -> HostClient {
        HostClient::build(channel, DispatchMode::HardwareTarget, Some(va))
    }

    fn build(channel: Channel, mode: DispatchMode, va: Option<Arc<dyn VaExecutor>>) -> HostClient {
        let sessions = Arc::new(SessionRegistry::new());
        let callbacks = Arc::new(HostCallbacks::new(sessions.clone()));
        let mut dispatcher = Dispatcher::new(channel, mode).with_callbacks(callbacks.clone());
        if let Some(va) = va {
            dispatcher = dispatcher.with_va_executor(va);
        }
        HostClient {
            dispatcher,
            fabric: None,
            sessions,
            callbacks,
            objects: Mutex::new(HostObjects::new()),
            registry: ExtBufferRegistry::default(),
            delivery: CallbackDelivery::default(),
            sync_chunk: None,
        }
    }

    /// Sets the fabric used to open dedicated allocator channels.
    pub fn with_fabric(mut self, fabric: Arc<dyn Fabric>) -> HostClient {
        self.fabric = Some(fabric);
        self
    }

    pub fn with_delivery(mut self, delivery: CallbackDelivery) -> HostClient {
        self.delivery = delivery;
        self
    }

    pub fn with_registry(mut self, registry: ExtBufferRegistry) -> HostClient {
        self.registry = registry;
        self
    }

    /// Splits sync waits longer than `ms` into calls of at most `ms`, repeated while the
    /// operation is still executing.
    pub fn with_sync_chunk(mut self, ms: u32) -> HostClient {
        self.sync_chunk = Some(ms.max(1));
        self
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn callbacks(&self) -> &HostCallbacks {
        &self.callbacks
    }

    /// Releases the wire id of a surface the application is done with.
    pub fn forget_surface(&self, surface: &SharedSurface) -> bool {
        self.objects.lock().forget_surface(surface)
    }

    pub fn forget_bitstream(&self, bitstream: &SharedBitstream) -> bool {
        self.objects.lock().forget_bitstream(bitstream)
    }

    fn call(&self, request: &PayloadWriter) -> Result<Response> {
        self.dispatcher.execute(request).map_err(|e| {
            error!("call {} failed: {}", request.id(), e);
            e
        })
    }

    // Issues a call whose only result is its status.
    fn simple(&self, request: &PayloadWriter) -> Status {
        status_of(self.call(request).map(|r| r.status))
    }

    fn state(&self, session: SessionHandle, missing: Status) -> Result<SessionState<HostSession>> {
        self.sessions.get(session).ok_or_else(|| {
            debug!("no host state for session {:#x}", session.0);
            Error::Status(missing)
        })
    }

    // Calls `function` on `session` and reads one record back if it succeeded.
    fn query_value<T: FromBytes>(
        &self,
        function: FunctionId,
        session: SessionHandle,
    ) -> Result<CallResult<T>> {
        let mut w = PayloadWriter::for_function(function);
        w.write_typed(&session);
        let mut r = self.call(&w)?;
        if r.status != Status::NONE {
            return Ok(Err(r.status));
        }
        Ok(Ok(r.args.read_typed()?))
    }

    // Statistics are sent even when the call reports a warning.
    fn query_stat<T: FromBytes>(
        &self,
        function: FunctionId,
        session: SessionHandle,
    ) -> Result<CallResult<T>> {
        let mut w = PayloadWriter::for_function(function);
        w.write_typed(&session);
        let mut r = self.call(&w)?;
        if r.status.is_error() || r.args.remaining() == 0 {
            return Ok(Err(r.status));
        }
        Ok(Ok(r.args.read_typed()?))
    }

    fn open_session(
        &self,
        request: &PayloadWriter,
        implementation: u32,
    ) -> Result<CallResult<SessionHandle>> {
        let mut r = self.call(request)?;
        if r.status != Status::NONE {
            return Ok(Err(r.status));
        }
        let handle: SessionHandle = r.args.read_typed()?;
        self.sessions.add(
            handle,
            HostSession {
                implementation,
                ..Default::default()
            },
        );
        info!("session {:#x} opened", handle.0);
        Ok(Ok(handle))
    }

    fn apply_lock_deltas(&self, r: &mut PayloadReader) -> Result<()> {
        if r.remaining() == 0 {
            return Ok(());
        }
        for delta in read_lock_deltas(r)? {
            let surface = self.objects.lock().surface(delta.surface);
            match surface {
                Some(surface) => {
                    let mut s = surface.lock();
                    s.data.locked = if delta.increment {
                        s.data.locked.wrapping_add(1)
                    } else {
                        s.data.locked.wrapping_sub(1)
                    };
                }
                None => warn!("lock change for unknown surface {:#x}", delta.surface.0),
            }
        }
        Ok(())
    }

    // Forwards the VA surface id of a device memory surface along with it.
    fn write_va_handle(
        &self,
        w: &mut PayloadWriter,
        surface: &FrameSurface,
        allocator: Option<&dyn FrameAllocator>,
        system_memory: bool,
    ) -> Result<()> {
        let mid = surface.data.mem_id;
        if self.delivery != CallbackDelivery::Inplace || system_memory || mid.is_null() {
            return Ok(());
        }
        if let Some(a) = allocator {
            let hdl = a.get_hdl(mid).map_err(Error::Status)?;
            w.write_typed(&hdl);
        }
        Ok(())
    }

    pub fn proxy_init(&self) -> Status {
        self.simple(&PayloadWriter::for_function(FunctionId::ProxyInit))
    }

    /// Asks the target to stop serving this connection.
    pub fn proxy_term(&self) -> Status {
        self.simple(&PayloadWriter::for_function(FunctionId::ProxyTerm))
    }

    pub fn init_ex(&self, par: &InitParam) -> CallResult<SessionHandle> {
        let mut w = PayloadWriter::for_function(FunctionId::InitEx);
        w.write_typed(par);
        value_of(self.open_session(&w, par.implementation))
    }

    pub fn initialize(&self, par: &InitializationParam) -> CallResult<SessionHandle> {
        let mut w = PayloadWriter::for_function(FunctionId::Initialize);
        w.write_typed(par);
        let handle = value_of(self.open_session(&w, 0))?;
        if let Ok(implementation) = self.query_impl(handle) {
            if let Some(state) = self.sessions.get(handle) {
                with_state(&state, |s| s.implementation = implementation);
            }
        }
        Ok(handle)
    }

    pub fn close(&self, session: SessionHandle) -> Status {
        let mut w = PayloadWriter::for_function(FunctionId::Close);
        w.write_typed(&session);
        let sts = self.simple(&w);
        if sts.is_error() {
            return sts;
        }
        if let Some(state) = self.sessions.remove(session) {
            // The target stopped the allocator channel before answering.
            let listener = with_state(&state, |s| s.listener.take());
            if let Some(listener) = listener {
                listener.join();
            }
        }
        info!("session {:#x} closed", session.0);
        sts
    }

    pub fn query_impls_description(&self, format: u32) -> CallResult<Vec<ImplDescription>> {
        value_of(self.query_impls_description_inner(format))
    }

    fn query_impls_description_inner(
        &self,
        format: u32,
    ) -> Result<CallResult<Vec<ImplDescription>>> {
        let mut w = PayloadWriter::for_function(FunctionId::QueryImplsDescription);
        w.write_typed(&format);
        let mut r = self.call(&w)?;
        if r.status != Status::NONE {
            return Ok(Err(r.status));
        }
        Ok(Ok(read_impl_descriptions(&mut r.args)?))
    }

    pub fn release_impl_description(&self, handle: u64) -> Status {
        let mut w = PayloadWriter::for_function(FunctionId::ReleaseImplDescription);
        w.write_typed(&handle);
        self.simple(&w)
    }

    pub fn query_impl(&self, session: SessionHandle) -> CallResult<u32> {
        value_of(self.query_value(FunctionId::QueryImpl, session))
    }

    pub fn query_version(&self, session: SessionHandle) -> CallResult<Version> {
        value_of(self.query_value(FunctionId::QueryVersion, session))
    }

    pub fn query_platform(&self, session: SessionHandle) -> CallResult<PlatformInfo> {
        value_of(self.query_value(FunctionId::QueryPlatform, session))
    }

    pub fn get_priority(&self, session: SessionHandle) -> CallResult<i32> {
        value_of(self.query_value(FunctionId::GetPriority, session))
    }

    pub fn set_priority(&self, session: SessionHandle, priority: i32) -> Status {
        let mut w = PayloadWriter::for_function(FunctionId::SetPriority);
        w.write_typed(&session);
        w.write_typed(&priority);
        self.simple(&w)
    }

    pub fn join_session(&self, session: SessionHandle, child: SessionHandle) -> Status {
        let mut w = PayloadWriter::for_function(FunctionId::JoinSession);
        w.write_typed(&session);
        w.write_typed(&child);
        self.simple(&w)
    }

    pub fn disjoin_session(&self, session: SessionHandle) -> Status {
        let mut w = PayloadWriter::for_function(FunctionId::DisjoinSession);
        w.write_typed(&session);
        self.simple(&w)
    }

    pub fn clone_session(&self, session: SessionHandle) -> CallResult<SessionHandle> {
        let implementation = self
            .sessions
            .get(session)
            .map_or(0, |s| with_state(&s, |s| s.implementation));
        let mut w = PayloadWriter::for_function(FunctionId::CloneSession);
        w.write_typed(&session);
        value_of(self.open_session(&w, implementation))
    }

    pub fn set_handle(&self, session: SessionHandle, kind: i32, handle: u64) -> Status {
        let mut w = PayloadWriter::for_function(FunctionId::SetHandle);
        w.write_typed(&session);
        w.write_typed(&kind);
        w.write_typed(&handle);
        self.simple(&w)
    }

    pub fn get_handle(&self, session: SessionHandle, kind: i32) -> CallResult<u64> {
        value_of(self.get_handle_inner(session, kind))
    }

    fn get_handle_inner(&self, session: SessionHandle, kind: i32) -> Result<CallResult<u64>> {
        let mut w = PayloadWriter::for_function(FunctionId::GetHandle);
        w.write_typed(&session);
        w.write_typed(&kind);
        let mut r = self.call(&w)?;
        if r.status != Status::NONE {
            return Ok(Err(r.status));
        }
        Ok(Ok(r.args.read_typed()?))
    }

    /// Checks `input` against what the codec supports, writing the corrected parameters to
    /// `out`. Without `input`, `out` receives the fields the codec can configure.
    pub fn query(
        &self,
        kind: CodecKind,
        session: SessionHandle,
        input: Option<&VideoParam>,
        out: &mut VideoParam,
    ) -> Status {
        status_of(self.query_inner(kind, session, input, out))
    }

    fn query_inner(
        &self,
        kind: CodecKind,
        session: SessionHandle,
        input: Option<&VideoParam>,
        out: &mut VideoParam,
    ) -> Result<Status> {
        let mut w = PayloadWriter::for_function(pick(
            kind,
            FunctionId::DecodeQuery,
            FunctionId::EncodeQuery,
        ));
        w.write_typed(&session);
        write_video_param(&mut w, &self.registry, input)?;
        write_video_param(&mut w, &self.registry, Some(out))?;
        let mut r = self.call(&w)?;
        if r.args.remaining() > 0 {
            let mut result = None;
            read_video_param(&mut r.args, &self.registry, &mut result)?;
            if let Some(result) = result {
                *out = result;
            }
        }
        Ok(r.status)
    }

    pub fn query_io_surf(
        &self,
        kind: CodecKind,
        session: SessionHandle,
        par: &VideoParam,
        request: &mut FrameAllocRequest,
    ) -> Status {
        status_of(self.query_io_surf_inner(kind, session, par, request))
    }

    fn query_io_surf_inner(
        &self,
        kind: CodecKind,
        session: SessionHandle,
        par: &VideoParam,
        request: &mut FrameAllocRequest,
    ) -> Result<Status> {
        let mut w = PayloadWriter::for_function(pick(
            kind,
            FunctionId::DecodeQueryIoSurf,
            FunctionId::EncodeQueryIoSurf,
        ));
        w.write_typed(&session);
        write_video_param(&mut w, &self.registry, Some(par))?;
        let mut r = self.call(&w)?;
        if r.args.remaining() > 0 {
            *request = r.args.read_typed()?;
        }
        Ok(r.status)
    }

    // What later calls need to know about a configured codec.
    fn remember_param(&self, kind: CodecKind, session: SessionHandle, par: Option<&VideoParam>) {
        if let Some(state) = self.sessions.get(session) {
            with_state(&state, |s| match kind {
                CodecKind::Decode => s.decoder_param = par.cloned(),
                CodecKind::Encode => {
                    s.encoder_io_pattern = par.map_or(IoPattern::empty(), |p| p.io_pattern())
                }
            });
        }
    }

    pub fn init(&self, kind: CodecKind, session: SessionHandle, par: &VideoParam) -> Status {
        let mut w = PayloadWriter::for_function(pick(
            kind,
            FunctionId::DecodeInit,
            FunctionId::EncodeInit,
        ));
        w.write_typed(&session);
        if let Err(e) = write_video_param(&mut w, &self.registry, Some(par)) {
            return e.status();
        }
        let sts = self.simple(&w);
        if sts == Status::NONE {
            self.remember_param(kind, session, Some(par));
        }
        sts
    }

    pub fn reset(&self, kind: CodecKind, session: SessionHandle, par: &VideoParam) -> Status {
        status_of(self.reset_inner(kind, session, par))
    }

    fn reset_inner(
        &self,
        kind: CodecKind,
        session: SessionHandle,
        par: &VideoParam,
    ) -> Result<Status> {
        let mut w = PayloadWriter::for_function(pick(
            kind,
            FunctionId::DecodeReset,
            FunctionId::EncodeReset,
        ));
        w.write_typed(&session);
        write_video_param(&mut w, &self.registry, Some(par))?;
        let mut r = self.call(&w)?;
        self.apply_lock_deltas(&mut r.args)?;
        if r.status == Status::NONE {
            self.remember_param(kind, session, Some(par));
        }
        Ok(r.status)
    }

    pub fn close_codec(&self, kind: CodecKind, session: SessionHandle) -> Status {
        status_of(self.close_codec_inner(kind, session))
    }

    fn close_codec_inner(&self, kind: CodecKind, session: SessionHandle) -> Result<Status> {
        let mut w = PayloadWriter::for_function(pick(
            kind,
            FunctionId::DecodeClose,
            FunctionId::EncodeClose,
        ));
        w.write_typed(&session);
        let mut r = self.call(&w)?;
        self.apply_lock_deltas(&mut r.args)?;
        if r.status == Status::NONE {
            self.remember_param(kind, session, None);
        }
        Ok(r.status)
    }

    pub fn get_video_param(
        &self,
        kind: CodecKind,
        session: SessionHandle,
        par: &mut VideoParam,
    ) -> Status {
        status_of(self.get_video_param_inner(kind, session, par))
    }

    fn get_video_param_inner(
        &self,
        kind: CodecKind,
        session: SessionHandle,
        par: &mut VideoParam,
    ) -> Result<Status> {
        let mut w = PayloadWriter::for_function(pick(
            kind,
            FunctionId::DecodeGetVideoParam,
            FunctionId::EncodeGetVideoParam,
        ));
        w.write_typed(&session);
        write_video_param(&mut w, &self.registry, Some(par))?;
        let mut r = self.call(&w)?;
        if r.args.remaining() > 0 {
            let mut result = None;
            read_video_param(&mut r.args, &self.registry, &mut result)?;
            if let Some(result) = result {
                *par = result;
            }
        }
        Ok(r.status)
    }

    /// Parses stream headers in `bs` into `par`, consuming the bytes the codec looked at.
    pub fn decode_header(
        &self,
        session: SessionHandle,
        bs: &mut Bitstream,
        par: &mut VideoParam,
    ) -> Status {
        status_of(self.decode_header_inner(session, bs, par))
    }

    fn decode_header_inner(
        &self,
        session: SessionHandle,
        bs: &mut Bitstream,
        par: &mut VideoParam,
    ) -> Result<Status> {
        let state = self.state(session, Status::ERR_UNDEFINED_BEHAVIOR)?;
        let mut w = PayloadWriter::for_function(FunctionId::DecodeHeader);
        w.write_typed(&session);
        with_state(&state, |s| {
            write_bitstream(
                &mut w,
                &self.registry,
                BitstreamId::NULL,
                Some(bs),
                Some(&mut s.bs_cache),
            )
        })?;
        write_video_param(&mut w, &self.registry, Some(par))?;

        let mut r = self.call(&w)?;
        if r.args.remaining() == 0 {
            return Ok(r.status);
        }
        bs.header.data_offset = r.args.read_typed()?;
        bs.header.data_length = r.args.read_typed()?;
        bs.header.pic_struct = r.args.read_typed()?;
        bs.header.frame_type = r.args.read_typed()?;
        let mut result = None;
        read_video_param(&mut r.args, &self.registry, &mut result)?;
        if let Some(result) = result {
            *par = result;
        }
        Ok(r.status)
    }

    pub fn decode_stat(&self, session: SessionHandle) -> CallResult<DecodeStat> {
        value_of(self.query_stat(FunctionId::DecodeGetDecodeStat, session))
    }

    pub fn encode_stat(&self, session: SessionHandle) -> CallResult<EncodeStat> {
        value_of(self.query_stat(FunctionId::EncodeGetEncodeStat, session))
    }

    pub fn set_skip_mode(&self, session: SessionHandle, mode: i32) -> Status {
        let mut w = PayloadWriter::for_function(FunctionId::DecodeSetSkipMode);
        w.write_typed(&session);
        w.write_typed(&mode);
        self.simple(&w)
    }

    /// Fetches the next user data payload into `payload`, whose buffer size bounds what the
    /// target may return.
    pub fn get_payload(
        &self,
        session: SessionHandle,
        ts: &mut u64,
        payload: &mut Payload,
    ) -> Status {
        status_of(self.get_payload_inner(session, ts, payload))
    }

    fn get_payload_inner(
        &self,
        session: SessionHandle,
        ts: &mut u64,
        payload: &mut Payload,
    ) -> Result<Status> {
        let mut w = PayloadWriter::for_function(FunctionId::DecodeGetPayload);
        w.write_typed(&session);
        write_payload(&mut w, Some(payload));
        let mut r = self.call(&w)?;
        if r.status != Status::NONE || r.args.remaining() == 0 {
            return Ok(r.status);
        }
        *ts = r.args.read_typed()?;
        let mut result = None;
        read_payload(&mut r.args, &mut result)?;
        if let Some(result) = result {
            *payload = result;
        }
        Ok(r.status)
    }

    /// Submits `bs` for decoding into `work`.
    ///
    /// On success `sync` identifies the pending operation and `out` is the surface that will hold
    /// the decoded frame once [`sync_operation`](Self::sync_operation) completes. The bitstream's
    /// offset and length are updated to reflect the bytes consumed.
    pub fn decode_frame_async(
        &self,
        session: SessionHandle,
        bs: Option<&mut Bitstream>,
        work: Option<&SharedSurface>,
        out: &mut Option<SharedSurface>,
        sync: &mut SyncPoint,
    ) -> Status {
        status_of(self.decode_frame_inner(session, bs, work, out, sync))
    }

    fn decode_frame_inner(
        &self,
        session: SessionHandle,
        bs: Option<&mut Bitstream>,
        work: Option<&SharedSurface>,
        out: &mut Option<SharedSurface>,
        sync: &mut SyncPoint,
    ) -> Result<Status> {
        let state = self.state(session, Status::ERR_UNKNOWN)?;
        let (allocator, needs_lock, system) = with_state(&state, |s| {
            (
                s.allocator.clone(),
                s.decoder_needs_lock(),
                s.decoder_io_pattern()
                    .contains(IoPattern::OUT_SYSTEM_MEMORY),
            )
        });

        let mut w = PayloadWriter::for_function(FunctionId::DecodeFrameAsync);
        w.write_typed(&session);
        with_state(&state, |s| {
            write_bitstream(
                &mut w,
                &self.registry,
                BitstreamId::NULL,
                bs.as_deref(),
                Some(&mut s.bs_cache),
            )
        })?;
        match work {
            Some(work) => {
                let id = self.objects.lock().surface_id(work);
                let mut surface = work.lock();
                if surface.info.crop_w == 0 {
                    surface.info.crop_w = surface.info.width;
                }
                if surface.info.crop_h == 0 {
                    surface.info.crop_h = surface.info.height;
                }
                let lock_with = allocator.as_deref().filter(|_| needs_lock);
                with_mapped(&mut surface, lock_with, |s| {
                    Ok(put_surface(&mut w, &self.registry, id, Some(s), false)?)
                })?;
                self.write_va_handle(&mut w, &surface, allocator.as_deref(), system)?;
            }
            None => put_surface(&mut w, &self.registry, SurfaceId::NULL, None, false)?,
        }

        let mut r = self.call(&w)?;
        *out = None;
        if r.args.remaining() == 0 {
            return Ok(r.status);
        }
        *sync = r.args.read_typed()?;
        self.apply_lock_deltas(&mut r.args)?;
        let sdi: SyncDependentInfo = r.args.read_typed()?;
        if let Some(bs) = bs {
            bs.header.data_offset = r.args.read_typed()?;
            bs.header.data_length = r.args.read_typed()?;
        }
        if work.is_some() {
            let shown = if sdi.surface.is_null() {
                None
            } else {
                self.objects.lock().surface(sdi.surface)
            };
            match &shown {
                Some(surface) => {
                    read_output_fields(&mut r.args, &self.registry, &mut surface.lock())?
                }
                None => {
                    read_output_fields(&mut r.args, &self.registry, &mut FrameSurface::default())?
                }
            }
            *out = shown;
        }
        Ok(r.status)
    }

    /// Submits `surface` for encoding into `bs`. The encoded data lands in `bs` when the
    /// returned sync point completes.
    pub fn encode_frame_async(
        &self,
        session: SessionHandle,
        ctrl: Option<&EncodeCtrl>,
        surface: Option<&SharedSurface>,
        bs: &SharedBitstream,
        sync: &mut SyncPoint,
    ) -> Status {
        status_of(self.encode_frame_inner(session, ctrl, surface, bs, sync))
    }

    fn encode_frame_inner(
        &self,
        session: SessionHandle,
        ctrl: Option<&EncodeCtrl>,
        surface: Option<&SharedSurface>,
        bs: &SharedBitstream,
        sync: &mut SyncPoint,
    ) -> Result<Status> {
        let state = self.state(session, Status::ERR_UNKNOWN)?;
        let (allocator, system) = with_state(&state, |s| {
            (
                s.allocator.clone(),
                s.encoder_io_pattern
                    .contains(IoPattern::IN_SYSTEM_MEMORY),
            )
        });

        let mut w = PayloadWriter::for_function(FunctionId::EncodeFrameAsync);
        w.write_typed(&session);
        write_encode_ctrl(&mut w, &self.registry, ctrl)?;
        match surface {
            Some(input) => {
                let id = self.objects.lock().surface_id(input);
                let mut input = input.lock();
                let lock_with = allocator.as_deref().filter(|_| system);
                with_mapped(&mut input, lock_with, |s| {
                    Ok(put_surface(&mut w, &self.registry, id, Some(s), true)?)
                })?;
                self.write_va_handle(&mut w, &input, allocator.as_deref(), system)?;
            }
            None => put_surface(&mut w, &self.registry, SurfaceId::NULL, None, false)?,
        }
        let bs_id = self.objects.lock().bitstream_id(bs);
        write_bitstream(&mut w, &self.registry, bs_id, Some(&*bs.lock()), None)?;

        let mut r = self.call(&w)?;
        if r.args.remaining() == 0 {
            return Ok(r.status);
        }
        *sync = r.args.read_typed()?;
        self.apply_lock_deltas(&mut r.args)?;
        Ok(r.status)
    }

    /// Waits up to `wait` milliseconds for the operation behind `sync` and copies its result
    /// into the application's surface or bitstream.
    pub fn sync_operation(&self, session: SessionHandle, sync: SyncPoint, wait: u32) -> Status {
        match self.sync_chunk {
            Some(chunk) if wait > chunk => {
                let mut left = wait;
                loop {
                    let step = left.min(chunk);
                    let sts = status_of(self.sync_once(session, sync, step));
                    left -= step;
                    if sts != Status::WRN_IN_EXECUTION || left == 0 {
                        return sts;
                    }
                }
            }
            _ => status_of(self.sync_once(session, sync, wait)),
        }
    }

    fn sync_once(&self, session: SessionHandle, sync: SyncPoint, wait: u32) -> Result<Status> {
        let state = self.state(session, Status::ERR_UNKNOWN)?;
        let (allocator, needs_lock) =
            with_state(&state, |s| (s.allocator.clone(), s.decoder_needs_lock()));

        let mut w = PayloadWriter::for_function(FunctionId::SyncOperation);
        w.write_typed(&session);
        w.write_typed(&sync);
        w.write_typed(&wait);
        let mut r = self.call(&w)?;
        if r.args.remaining() == 0 {
            return Ok(r.status);
        }

        let mut sts = r.status;
        if sts == Status::NONE {
            let sdi: SyncDependentInfo = r.args.read_typed()?;
            if !sdi.bitstream.is_null() {
                let _id: BitstreamId = r.args.read_typed()?;
                let bitstream = self
                    .objects
                    .lock()
                    .bitstream(sdi.bitstream)
                    .ok_or(Error::Status(Status::ERR_UNKNOWN))?;
                let mut bs = bitstream.lock();
                let mut slot = Some(std::mem::take(&mut *bs));
                let result = read_bitstream(&mut r.args, &self.registry, &mut slot, None);
                *bs = slot.unwrap_or_default();
                result?;
            } else {
                let surface = self
                    .objects
                    .lock()
                    .surface(sdi.surface)
                    .ok_or(Error::Status(Status::ERR_UNKNOWN))?;
                let mut surface = surface.lock();
                let lock_with = allocator.as_deref().filter(|_| needs_lock);
                with_mapped(&mut surface, lock_with, |s| {
                    Ok(read_surface_data(&mut r.args, s)?)
                })?;
            }
        } else if sts == Status::WRN_OUT_OF_RANGE {
            // Nothing was waiting on this sync point.
            sts = Status::NONE;
        }
        self.apply_lock_deltas(&mut r.args)?;
        Ok(sts)
    }

    /// Attaches `allocator` to `session`, or detaches the current one with `None`.
    ///
    /// With dedicated delivery the first attach opens a sub-channel and starts a thread serving
    /// the target's callbacks on it.
    pub fn set_frame_allocator(
        &self,
        session: SessionHandle,
        allocator: Option<Arc<dyn FrameAllocator>>,
    ) -> Status {
        status_of(self.set_frame_allocator_inner(session, allocator))
    }

    fn set_frame_allocator_inner(
        &self,
        session: SessionHandle,
        allocator: Option<Arc<dyn FrameAllocator>>,
    ) -> Result<Status> {
        let state = self.state(session, Status::ERR_UNKNOWN)?;
        let (unchanged, has_listener) = with_state(&state, |s| {
            (
                same_allocator(s.allocator.as_ref(), allocator.as_ref()),
                s.listener.is_some(),
            )
        });
        if unchanged {
            return Ok(Status::NONE);
        }

        let mut w = PayloadWriter::for_function(FunctionId::SetFrameAllocator);
        w.write_typed(&session);
        w.write_presence(allocator.is_some());
        let mut sub_channel = None;
        if allocator.is_some() && self.delivery == CallbackDelivery::Dedicated && !has_listener {
            let fabric = match &self.fabric {
                Some(f) => f.clone(),
                None => return Ok(Status::ERR_UNSUPPORTED),
            };
            let (tx, rx) = fabric.next_channel_pair();
            if fabric.mode() != CommMode::Unite {
                w.write_typed(&tx);
                w.write_typed(&rx);
            }
            sub_channel = Some((fabric, tx));
        }

        // Callbacks issued while the call is in flight must find the new allocator.
        let previous = with_state(&state, |s| {
            std::mem::replace(&mut s.allocator, allocator.clone())
        });
        let mut listener = None;
        let result = self.dispatcher.execute_with(&w, || {
            if let Some((fabric, tx)) = sub_channel {
                debug!("connecting allocator channel {}", tx);
                let channel = fabric.connect(tx)?;
                let started = AllocatorListener::start(session, channel, self.callbacks.clone())
                    .map_err(Error::SpawnListener)?;
                listener = Some(started);
            }
            Ok(())
        });
        let sts = match result {
            Ok(r) => r.status,
            Err(e) => {
                error!("set frame allocator on {:#x} failed: {}", session.0, e);
                e.status()
            }
        };

        if sts != Status::NONE {
            with_state(&state, |s| s.allocator = previous);
            return Ok(sts);
        }
        let stopped = with_state(&state, |s| match listener {
            Some(listener) => {
                s.listener = Some(listener);
                None
            }
            None if allocator.is_none() => s.listener.take(),
            None => None,
        });
        // Detaching made the target stop the channel before it answered.
        if let Some(listener) = stopped {
            listener.join();
        }
        Ok(sts)
    }
}

impl Drop for HostClient {
    fn drop(&mut self) {
        self.sessions.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use mfx_wire::param::write_lock_deltas;
    use mfx_wire::param::AllocatedFrames;
    use mfx_wire::param::LockDelta;
    use mfx_wire::types::MemId;
    use shim_transport::QueueFabric;

    use super::*;

    fn read(ch: &mut Channel) -> PayloadReader {
        PayloadReader::new(ch.read_frame().unwrap()).unwrap()
    }

    fn reply(ch: &mut Channel, status: Status, f: impl FnOnce(&mut PayloadWriter)) {
        let mut w = PayloadWriter::new(0);
        w.set_status(status);
        f(&mut w);
        ch.write_frame(w.as_bytes()).unwrap();
    }

    // Answers InitEx with `handle` and returns the target end.
    fn open(handle: u64) -> (HostClient, SessionHandle, thread::JoinHandle<Channel>) {
        let (host, mut target) = Channel::queue_pair();
        let peer = thread::spawn(move || {
            assert_eq!(read(&mut target).id(), FunctionId::InitEx as u32);
            reply(&mut target, Status::NONE, |w| w.write_typed(&SessionHandle(handle)));
            target
        });
        let client = HostClient::new(host);
        let session = client.init_ex(&InitParam::default()).unwrap();
        (client, session, peer)
    }

    #[test]
    fn out_of_range_sync_reads_as_success() {
        let (client, session, peer) = open(0x40);
        let mut target = peer.join().unwrap();
        let peer = thread::spawn(move || {
            let mut r = read(&mut target);
            assert_eq!(r.id(), FunctionId::SyncOperation as u32);
            assert_eq!(r.read_typed::<SessionHandle>().unwrap(), SessionHandle(0x40));
            reply(&mut target, Status::WRN_OUT_OF_RANGE, |w| write_lock_deltas(w, &[]));
        });
        assert_eq!(client.sync_operation(session, SyncPoint(9), 10), Status::NONE);
        peer.join().unwrap();
    }

    #[test]
    fn chunked_sync_stops_when_done() {
        let (client, session, peer) = open(0x41);
        let client = client.with_sync_chunk(100);
        let mut target = peer.join().unwrap();
        let peer = thread::spawn(move || {
            let mut waits = Vec::new();
            for sts in [Status::WRN_IN_EXECUTION, Status::WRN_OUT_OF_RANGE] {
                let mut r = read(&mut target);
                r.read_typed::<SessionHandle>().unwrap();
                r.read_typed::<SyncPoint>().unwrap();
                waits.push(r.read_typed::<u32>().unwrap());
                reply(&mut target, sts, |w| write_lock_deltas(w, &[]));
            }
            waits
        });
        assert_eq!(client.sync_operation(session, SyncPoint(1), 250), Status::NONE);
        assert_eq!(peer.join().unwrap(), vec![100, 100]);
    }

    #[test]
    fn lock_deltas_update_registered_surfaces() {
        let (client, session, peer) = open(0x42);
        let surface = FrameSurface::default().into_shared();
        let id = client.objects.lock().surface_id(&surface);
        let mut target = peer.join().unwrap();
        let peer = thread::spawn(move || {
            read(&mut target);
            reply(&mut target, Status::NONE, |w| {
                write_lock_deltas(
                    w,
                    &[
                        LockDelta {
                            surface: id,
                            increment: true,
                        },
                        LockDelta {
                            surface: SurfaceId(0x999),
                            increment: true,
                        },
                    ],
                )
            });
        });
        assert_eq!(client.close_codec(CodecKind::Decode, session), Status::NONE);
        assert_eq!(surface.lock().data.locked, 1);
        peer.join().unwrap();
    }

    struct NoFrames;

    impl FrameAllocator for NoFrames {
        fn alloc(&self, _request: &FrameAllocRequest) -> CallResult<AllocatedFrames> {
            Err(Status::ERR_MEMORY_ALLOC)
        }
        fn lock(&self, _mid: MemId, _surface: &mut FrameSurface) -> Status {
            Status::ERR_LOCK_MEMORY
        }
        fn unlock(&self, _mid: MemId, _surface: &mut FrameSurface) -> Status {
            Status::NONE
        }
        fn get_hdl(&self, _mid: MemId) -> CallResult<u32> {
            Err(Status::ERR_UNSUPPORTED)
        }
        fn free(&self, _frames: &AllocatedFrames) -> Status {
            Status::NONE
        }
    }

    #[test]
    fn dedicated_allocator_needs_a_fabric() {
        let (client, session, peer) = open(0x43);
        let client = client.with_delivery(CallbackDelivery::Dedicated);
        let _target = peer.join().unwrap();
        assert_eq!(
            client.set_frame_allocator(session, Some(Arc::new(NoFrames))),
            Status::ERR_UNSUPPORTED
        );
    }

    #[test]
    fn failed_attach_restores_previous_allocator() {
        let (client, session, peer) = open(0x44);
        let client = client.with_fabric(Arc::new(QueueFabric::new()));
        let mut target = peer.join().unwrap();
        let peer = thread::spawn(move || {
            read(&mut target);
            reply(&mut target, Status::ERR_UNSUPPORTED, |_| {});
        });
        assert_eq!(
            client.set_frame_allocator(session, Some(Arc::new(NoFrames))),
            Status::ERR_UNSUPPORTED
        );
        let state = client.sessions.get(session).unwrap();
        assert!(with_state(&state, |s| s.allocator.is_none()));
        peer.join().unwrap();
    }

    #[test]
    fn unknown_session_is_rejected_locally() {
        let (host, _target) = Channel::queue_pair();
        let client = HostClient::new(host);
        let mut sync = SyncPoint::NULL;
        let mut out = None;
        assert_eq!(
            client.decode_frame_async(SessionHandle(1), None, None, &mut out, &mut sync),
            Status::ERR_UNKNOWN
        );
        assert_eq!(
            client.decode_header(
                SessionHandle(1),
                &mut Bitstream::default(),
                &mut VideoParam::default()
            ),
            Status::ERR_UNDEFINED_BEHAVIOR
        );
    }
}
