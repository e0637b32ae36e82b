// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::sync::Arc;

use log::debug;
use log::info;
use mfx_wire::bitstream::read_bitstream;
use mfx_wire::bitstream::write_bitstream;
use mfx_wire::caps::write_impl_descriptions;
use mfx_wire::param::read_encode_ctrl;
use mfx_wire::param::read_payload;
use mfx_wire::param::read_video_param;
use mfx_wire::param::write_lock_deltas;
use mfx_wire::param::write_payload;
use mfx_wire::param::write_video_param;
use mfx_wire::param::VideoParam;
use mfx_wire::surface::get_surface;
use mfx_wire::surface::read_surface_descriptor;
use mfx_wire::surface::write_surface_data;
use mfx_wire::surface::SurfaceDescriptor;
use mfx_wire::surface::MAX_SURFACE_SIZE;
use mfx_wire::types::BitstreamId;
use mfx_wire::types::FrameAllocRequest;
use mfx_wire::types::InitParam;
use mfx_wire::types::InitializationParam;
use mfx_wire::types::IoPattern;
use mfx_wire::types::SessionHandle;
use mfx_wire::types::SurfaceId;
use mfx_wire::types::SyncDependentInfo;
use mfx_wire::types::SyncPoint;
use mfx_wire::types::HANDLE_VA_DISPLAY;
use mfx_wire::DispatchMode;
use mfx_wire::FunctionId;
use mfx_wire::PayloadReader;
use mfx_wire::PayloadWriter;
use mfx_wire::SharedSurface;
use mfx_wire::Status;
use shim_transport::CommMode;

use super::allocator::Route;
use super::Handler;
use super::SyncTag;
use super::TargetAllocator;
use super::TargetServer;
use super::TargetSession;
use crate::dispatcher::Dispatcher;
use crate::engine::CodecKind;
use crate::engine::FrameAllocator;
use crate::function_table::FunctionTable;
use crate::session::with_state;
use crate::session::SessionState;
use crate::CallbackDelivery;
use crate::Result;

pub(super) fn table() -> FunctionTable<Handler> {
    use FunctionId::*;
    FunctionTable::<Handler>::for_functions()
        .with_function(Close, close)
        .with_function(QueryImpl, query_impl)
        .with_function(QueryVersion, query_version)
        .with_function(JoinSession, join_session)
        .with_function(DisjoinSession, disjoin_session)
        .with_function(CloneSession, clone_session)
        .with_function(SetPriority, set_priority)
        .with_function(GetPriority, get_priority)
        .with_function(InitEx, init_ex)
        .with_function(Initialize, initialize)
        .with_function(ReleaseImplDescription, release_impl_description)
        .with_function(QueryImplsDescription, query_impls_description)
        .with_function(DecodeQuery, |t, a, r| query(t, a, r, CodecKind::Decode))
        .with_function(DecodeHeader, decode_header)
        .with_function(DecodeQueryIoSurf, |t, a, r| {
            query_io_surf(t, a, r, CodecKind::Decode)
        })
        .with_function(DecodeInit, |t, a, r| init(t, a, r, CodecKind::Decode))
        .with_function(DecodeReset, |t, a, r| reset(t, a, r, CodecKind::Decode))
        .with_function(DecodeClose, |t, a, r| close_codec(t, a, r, CodecKind::Decode))
        .with_function(DecodeGetVideoParam, |t, a, r| {
            get_video_param(t, a, r, CodecKind::Decode)
        })
        .with_function(DecodeGetDecodeStat, decode_stat)
        .with_function(DecodeSetSkipMode, set_skip_mode)
        .with_function(DecodeGetPayload, get_payload)
        .with_function(DecodeFrameAsync, decode_frame_async)
        .with_function(EncodeQuery, |t, a, r| query(t, a, r, CodecKind::Encode))
        .with_function(EncodeQueryIoSurf, |t, a, r| {
            query_io_surf(t, a, r, CodecKind::Encode)
        })
        .with_function(EncodeInit, |t, a, r| init(t, a, r, CodecKind::Encode))
        .with_function(EncodeReset, |t, a, r| reset(t, a, r, CodecKind::Encode))
        .with_function(EncodeClose, |t, a, r| close_codec(t, a, r, CodecKind::Encode))
        .with_function(EncodeGetVideoParam, |t, a, r| {
            get_video_param(t, a, r, CodecKind::Encode)
        })
        .with_function(EncodeGetEncodeStat, encode_stat)
        .with_function(EncodeFrameAsync, encode_frame_async)
        .with_function(SyncOperation, sync_operation)
        .with_function(SetFrameAllocator, set_frame_allocator)
        .with_function(QueryPlatform, query_platform)
        .with_function(SetHandle, set_handle)
        .with_function(GetHandle, get_handle)
        .with_function(ProxyInit, |_, _, _| Ok(Status::NONE))
        .with_function(ProxyTerm, |t, _, _| {
            info!("proxy terminated by the host");
            t.terminated = true;
            Ok(Status::NONE)
        })
}

fn read_session(
    t: &TargetServer,
    args: &mut PayloadReader,
) -> Result<(SessionHandle, Option<SessionState<TargetSession>>)> {
    let handle: SessionHandle = args.read_typed()?;
    Ok((handle, t.sessions.get(handle)))
}

fn add_session(t: &TargetServer, handle: SessionHandle, implementation: u32) {
    info!("session {:#x} opened", handle.0);
    t.sessions
        .add(handle, TargetSession::new(handle, implementation));
}

// The lock delta block is written even when the session is unknown, so the host can always
// parse the reply.
fn write_deltas(state: Option<&SessionState<TargetSession>>, reply: &mut PayloadWriter) -> Status {
    match state {
        Some(state) => {
            let deltas = with_state(state, |s| s.surfaces.lock_deltas());
            write_lock_deltas(reply, &deltas);
            Status::NONE
        }
        None => {
            write_lock_deltas(reply, &[]);
            Status::ERR_UNDEFINED_BEHAVIOR
        }
    }
}

fn init_ex(
    t: &mut TargetServer,
    args: &mut PayloadReader,
    reply: &mut PayloadWriter,
) -> Result<Status> {
    let par: InitParam = args.read_typed()?;
    Ok(match t.engine.init_ex(&par) {
        Ok(handle) => {
            reply.write_typed(&handle);
            add_session(t, handle, par.implementation);
            Status::NONE
        }
        Err(sts) => sts,
    })
}

fn initialize(
    t: &mut TargetServer,
    args: &mut PayloadReader,
    reply: &mut PayloadWriter,
) -> Result<Status> {
    let par: InitializationParam = args.read_typed()?;
    Ok(match t.engine.initialize(&par) {
        Ok(handle) => {
            reply.write_typed(&handle);
            let implementation = t.engine.query_impl(handle).unwrap_or(0);
            add_session(t, handle, implementation);
            Status::NONE
        }
        Err(sts) => sts,
    })
}

fn query_impls_description(
    t: &mut TargetServer,
    args: &mut PayloadReader,
    reply: &mut PayloadWriter,
) -> Result<Status> {
    let _format: u32 = args.read_typed()?;
    let descs = t.engine.query_impls_description();
    write_impl_descriptions(reply, &descs)?;
    Ok(Status::NONE)
}

fn release_impl_description(
    t: &mut TargetServer,
    args: &mut PayloadReader,
    _reply: &mut PayloadWriter,
) -> Result<Status> {
    let handle: u64 = args.read_typed()?;
    Ok(t.engine.release_impl_description(handle))
}

fn close(
    t: &mut TargetServer,
    args: &mut PayloadReader,
    _reply: &mut PayloadWriter,
) -> Result<Status> {
    let handle: SessionHandle = args.read_typed()?;
    let sts = t.engine.close(handle);
    if sts.is_error() {
        return Ok(sts);
    }
    if let Some(state) = t.sessions.remove(handle) {
        let (parent, allocator) = with_state(&state, |s| (s.parent, s.allocator.take()));
        if let Some(allocator) = allocator {
            allocator.close();
        }
        if let Some(parent) = parent.and_then(|p| t.sessions.get(p)) {
            with_state(&parent, |p| p.children.remove(&handle));
        }
    }
    info!("session {:#x} closed", handle.0);
    if t.sessions.is_empty() && t.hw_device.take().is_some() {
        debug!("last session closed, releasing the device");
    }
    Ok(sts)
}

fn query_impl(
    t: &mut TargetServer,
    args: &mut PayloadReader,
    reply: &mut PayloadWriter,
) -> Result<Status> {
    let handle: SessionHandle = args.read_typed()?;
    Ok(match t.engine.query_impl(handle) {
        Ok(v) => {
            reply.write_typed(&v);
            Status::NONE
        }
        Err(sts) => sts,
    })
}

fn query_version(
    t: &mut TargetServer,
    args: &mut PayloadReader,
    reply: &mut PayloadWriter,
) -> Result<Status> {
    let handle: SessionHandle = args.read_typed()?;
    Ok(match t.engine.query_version(handle) {
        Ok(v) => {
            reply.write_typed(&v);
            Status::NONE
        }
        Err(sts) => sts,
    })
}

fn query_platform(
    t: &mut TargetServer,
    args: &mut PayloadReader,
    reply: &mut PayloadWriter,
) -> Result<Status> {
    let handle: SessionHandle = args.read_typed()?;
    Ok(match t.engine.query_platform(handle) {
        Ok(v) => {
            reply.write_typed(&v);
            Status::NONE
        }
        Err(sts) => sts,
    })
}

fn get_priority(
    t: &mut TargetServer,
    args: &mut PayloadReader,
    reply: &mut PayloadWriter,
) -> Result<Status> {
    let handle: SessionHandle = args.read_typed()?;
    Ok(match t.engine.get_priority(handle) {
        Ok(v) => {
            reply.write_typed(&v);
            Status::NONE
        }
        Err(sts) => sts,
    })
}

fn set_priority(
    t: &mut TargetServer,
    args: &mut PayloadReader,
    _reply: &mut PayloadWriter,
) -> Result<Status> {
    let handle: SessionHandle = args.read_typed()?;
    let priority: i32 = args.read_typed()?;
    Ok(t.engine.set_priority(handle, priority))
}

fn join_session(
    t: &mut TargetServer,
    args: &mut PayloadReader,
    _reply: &mut PayloadWriter,
) -> Result<Status> {
    let handle: SessionHandle = args.read_typed()?;
    let child: SessionHandle = args.read_typed()?;
    let sts = t.engine.join_session(handle, child);
    if sts != Status::NONE {
        return Ok(sts);
    }
    match (t.sessions.get(handle), t.sessions.get(child)) {
        (Some(parent), Some(c)) => {
            with_state(&parent, |p| p.children.insert(child));
            with_state(&c, |c| c.parent = Some(handle));
            Ok(Status::NONE)
        }
        _ => Ok(Status::ERR_UNKNOWN),
    }
}

fn disjoin_session(
    t: &mut TargetServer,
    args: &mut PayloadReader,
    _reply: &mut PayloadWriter,
) -> Result<Status> {
    let handle: SessionHandle = args.read_typed()?;
    let state = match t.sessions.get(handle) {
        Some(s) => s,
        None => return Ok(Status::ERR_UNKNOWN),
    };
    let parent = match with_state(&state, |s| s.parent).and_then(|p| t.sessions.get(p)) {
        Some(p) => p,
        None => return Ok(Status::ERR_UNKNOWN),
    };
    let sts = t.engine.disjoin_session(handle);
    if sts == Status::NONE {
        with_state(&parent, |p| p.children.remove(&handle));
        with_state(&state, |s| s.parent = None);
    }
    Ok(sts)
}

fn clone_session(
    t: &mut TargetServer,
    args: &mut PayloadReader,
    reply: &mut PayloadWriter,
) -> Result<Status> {
    let (handle, state) = read_session(t, args)?;
    let state = match state {
        Some(s) => s,
        None => return Ok(Status::ERR_UNDEFINED_BEHAVIOR),
    };
    Ok(match t.engine.clone_session(handle) {
        Ok(child) => {
            reply.write_typed(&child);
            let implementation = with_state(&state, |s| s.implementation);
            add_session(t, child, implementation);
            Status::NONE
        }
        Err(sts) => sts,
    })
}

fn set_handle(
    t: &mut TargetServer,
    args: &mut PayloadReader,
    _reply: &mut PayloadWriter,
) -> Result<Status> {
    let (handle, state) = read_session(t, args)?;
    let kind: i32 = args.read_typed()?;
    let hdl: u64 = args.read_typed()?;
    let sts = t.engine.set_handle(handle, kind, hdl);
    if sts == Status::NONE && kind == HANDLE_VA_DISPLAY {
        if let Some(state) = state {
            with_state(&state, |s| s.display = Some(hdl));
        }
        t.hw_device.get_or_insert(hdl);
    }
    Ok(sts)
}

fn get_handle(
    t: &mut TargetServer,
    args: &mut PayloadReader,
    reply: &mut PayloadWriter,
) -> Result<Status> {
    let (handle, state) = read_session(t, args)?;
    let kind: i32 = args.read_typed()?;
    Ok(match t.engine.get_handle(handle, kind) {
        Ok(hdl) => {
            // The host gets back the handle it attached, not the target's.
            let display = state
                .filter(|_| kind == HANDLE_VA_DISPLAY)
                .and_then(|s| with_state(&s, |s| s.display));
            reply.write_typed(&display.unwrap_or(hdl));
            Status::NONE
        }
        Err(sts) => sts,
    })
}

fn query(
    t: &mut TargetServer,
    args: &mut PayloadReader,
    reply: &mut PayloadWriter,
    kind: CodecKind,
) -> Result<Status> {
    let handle: SessionHandle = args.read_typed()?;
    let mut input = None;
    read_video_param(args, &t.registry, &mut input)?;
    let mut out = None;
    read_video_param(args, &t.registry, &mut out)?;
    let sts = t
        .engine
        .query(kind, handle, input.as_ref(), out.as_mut());
    write_video_param(reply, &t.registry, out.as_ref())?;
    Ok(sts)
}

fn query_io_surf(
    t: &mut TargetServer,
    args: &mut PayloadReader,
    reply: &mut PayloadWriter,
    kind: CodecKind,
) -> Result<Status> {
    let (handle, state) = read_session(t, args)?;
    let mut par = None;
    read_video_param(args, &t.registry, &mut par)?;
    let mut request = FrameAllocRequest::default();
    let mut sts = t
        .engine
        .query_io_surf(kind, handle, par.as_ref(), &mut request);
    if sts == Status::NONE && state.is_none() {
        sts = Status::ERR_UNKNOWN;
    }
    reply.write_typed(&request);
    Ok(sts)
}

// Caches what later calls need to know about the codec's configuration.
fn remember_param(
    t: &mut TargetServer,
    state: &SessionState<TargetSession>,
    handle: SessionHandle,
    kind: CodecKind,
) {
    let mut par = VideoParam::default();
    if t.engine.get_video_param(kind, handle, &mut par) != Status::NONE {
        return;
    }
    with_state(state, |s| match kind {
        CodecKind::Decode => s.decoder_param = Some(par),
        CodecKind::Encode => s.encoder_io_pattern = par.io_pattern(),
    });
}

fn init(
    t: &mut TargetServer,
    args: &mut PayloadReader,
    _reply: &mut PayloadWriter,
    kind: CodecKind,
) -> Result<Status> {
    let (handle, state) = read_session(t, args)?;
    let mut par = None;
    read_video_param(args, &t.registry, &mut par)?;
    let state = match state {
        Some(s) => s,
        None => return Ok(Status::ERR_UNDEFINED_BEHAVIOR),
    };
    let sts = t.engine.init(kind, handle, par.as_ref());
    if sts == Status::NONE {
        remember_param(t, &state, handle, kind);
    }
    Ok(sts)
}

fn reset(
    t: &mut TargetServer,
    args: &mut PayloadReader,
    reply: &mut PayloadWriter,
    kind: CodecKind,
) -> Result<Status> {
    let (handle, state) = read_session(t, args)?;
    let mut par = None;
    read_video_param(args, &t.registry, &mut par)?;
    let sts = t.engine.reset(kind, handle, par.as_ref());
    if let (Status::NONE, Some(state)) = (sts, &state) {
        remember_param(t, state, handle, kind);
    }
    let deltas = write_deltas(state.as_ref(), reply);
    Ok(if sts.is_error() || deltas == Status::NONE {
        sts
    } else {
        deltas
    })
}

fn close_codec(
    t: &mut TargetServer,
    args: &mut PayloadReader,
    reply: &mut PayloadWriter,
    kind: CodecKind,
) -> Result<Status> {
    let (handle, state) = read_session(t, args)?;
    let sts = t.engine.close_codec(kind, handle);
    if let (Status::NONE, Some(state)) = (sts, &state) {
        with_state(state, |s| match kind {
            CodecKind::Decode => s.decoder_param = None,
            CodecKind::Encode => s.encoder_io_pattern = IoPattern::empty(),
        });
    }
    let deltas = write_deltas(state.as_ref(), reply);
    Ok(if sts.is_error() || deltas == Status::NONE {
        sts
    } else {
        deltas
    })
}

fn get_video_param(
    t: &mut TargetServer,
    args: &mut PayloadReader,
    reply: &mut PayloadWriter,
    kind: CodecKind,
) -> Result<Status> {
    let handle: SessionHandle = args.read_typed()?;
    let mut par = None;
    read_video_param(args, &t.registry, &mut par)?;
    let sts = match par.as_mut() {
        Some(par) => t.engine.get_video_param(kind, handle, par),
        None => Status::ERR_NULL_PTR,
    };
    write_video_param(reply, &t.registry, par.as_ref())?;
    Ok(sts)
}

fn decode_stat(
    t: &mut TargetServer,
    args: &mut PayloadReader,
    reply: &mut PayloadWriter,
) -> Result<Status> {
    let handle: SessionHandle = args.read_typed()?;
    let (stat, sts) = match t.engine.decode_stat(handle) {
        Ok(stat) => (stat, Status::NONE),
        Err(sts) => (Default::default(), sts),
    };
    reply.write_typed(&stat);
    Ok(sts)
}

fn encode_stat(
    t: &mut TargetServer,
    args: &mut PayloadReader,
    reply: &mut PayloadWriter,
) -> Result<Status> {
    let handle: SessionHandle = args.read_typed()?;
    let (stat, sts) = match t.engine.encode_stat(handle) {
        Ok(stat) => (stat, Status::NONE),
        Err(sts) => (Default::default(), sts),
    };
    reply.write_typed(&stat);
    Ok(sts)
}

fn set_skip_mode(
    t: &mut TargetServer,
    args: &mut PayloadReader,
    _reply: &mut PayloadWriter,
) -> Result<Status> {
    let handle: SessionHandle = args.read_typed()?;
    let mode: i32 = args.read_typed()?;
    Ok(t.engine.set_skip_mode(handle, mode))
}

fn get_payload(
    t: &mut TargetServer,
    args: &mut PayloadReader,
    reply: &mut PayloadWriter,
) -> Result<Status> {
    let handle: SessionHandle = args.read_typed()?;
    let mut payload = None;
    read_payload(args, &mut payload)?;
    let payload = match payload.as_mut() {
        Some(p) => p,
        None => return Ok(Status::ERR_NULL_PTR),
    };
    let mut ts = 0u64;
    let sts = t.engine.get_payload(handle, &mut ts, payload);
    if sts == Status::NONE {
        reply.write_typed(&ts);
        write_payload(reply, Some(payload));
    }
    Ok(sts)
}

fn decode_header(
    t: &mut TargetServer,
    args: &mut PayloadReader,
    reply: &mut PayloadWriter,
) -> Result<Status> {
    let (handle, state) = read_session(t, args)?;
    let state = match state {
        Some(s) => s,
        None => return Ok(Status::ERR_UNDEFINED_BEHAVIOR),
    };
    let mut bs = None;
    with_state(&state, |s| {
        read_bitstream(args, &t.registry, &mut bs, Some(&mut s.bs_cache))
    })?;
    let mut par = None;
    read_video_param(args, &t.registry, &mut par)?;

    let sts = match (bs.as_mut(), par.as_mut()) {
        (Some(bs), Some(par)) => t.engine.decode_header(handle, bs, par),
        _ => Status::ERR_NULL_PTR,
    };
    let header = bs.map(|bs| bs.header).unwrap_or_default();
    reply.write_typed(&header.data_offset);
    reply.write_typed(&header.data_length);
    reply.write_typed(&header.pic_struct);
    reply.write_typed(&header.frame_type);
    write_video_param(reply, &t.registry, par.as_ref())?;
    Ok(sts)
}

// Binds a surface sent by the host to its mirror and reads the rest of it.
fn bind_surface(
    t: &TargetServer,
    state: &SessionState<TargetSession>,
    args: &mut PayloadReader,
    read_contents: bool,
) -> Result<Option<(SurfaceDescriptor, SharedSurface)>> {
    let desc = match read_surface_descriptor(args)? {
        Some(desc) => desc,
        None => return Ok(None),
    };
    // Mirrored planes never outgrow what the request itself can fill.
    let limit = if read_contents {
        args.remaining()
    } else {
        MAX_SURFACE_SIZE
    };
    let surface = with_state(state, |s| s.surfaces.add_entry(&desc, limit))?;
    get_surface(args, &t.registry, &mut surface.lock(), read_contents)?;
    Ok(Some((desc, surface)))
}

// Reads the VA surface id the host forwards for device memory surfaces.
fn read_va_handle(
    t: &TargetServer,
    state: &SessionState<TargetSession>,
    desc: &SurfaceDescriptor,
    system_memory: bool,
    args: &mut PayloadReader,
) -> Result<()> {
    if t.delivery != CallbackDelivery::Inplace || system_memory || desc.data.mem_id.is_null() {
        return Ok(());
    }
    if let Some(allocator) = with_state(state, |s| s.allocator.clone()) {
        let hdl: u32 = args.read_typed()?;
        allocator.add_hdl(desc.data.mem_id, hdl);
    }
    Ok(())
}

fn decode_frame_async(
    t: &mut TargetServer,
    args: &mut PayloadReader,
    reply: &mut PayloadWriter,
) -> Result<Status> {
    let (handle, state) = read_session(t, args)?;
    let state = match state {
        Some(s) => s,
        None => return Ok(Status::ERR_UNKNOWN),
    };
    // Allocator callbacks issued by the engine re-enter the session on this thread.
    let _guard = state.lock();

    let mut bs = None;
    with_state(&state, |s| {
        read_bitstream(args, &t.registry, &mut bs, Some(&mut s.bs_cache))
    })?;
    let work = bind_surface(t, &state, args, false)?;
    if let Some((desc, _)) = &work {
        let system = with_state(&state, |s| s.decoder_io_pattern())
            .contains(IoPattern::OUT_SYSTEM_MEMORY);
        read_va_handle(t, &state, desc, system, args)?;
    }

    let mut out = None;
    let mut sync = SyncPoint::NULL;
    let sts = t
        .engine
        .decode_frame_async(
            handle,
            bs.as_mut(),
            work.as_ref().map(|(_, s)| s),
            &mut out,
            &mut sync,
        )
        .masked();

    reply.write_typed(&sync);
    with_state(&state, |s| -> Result<()> {
        write_lock_deltas(reply, &s.surfaces.lock_deltas());
        let out_host = out
            .as_ref()
            .and_then(|o| s.surfaces.find_host(o))
            .unwrap_or(SurfaceId::NULL);
        reply.write_typed(&SyncDependentInfo {
            surface: out_host,
            bitstream: BitstreamId::NULL,
        });
        if let Some(bs) = &bs {
            reply.write_typed(&bs.header.data_offset);
            reply.write_typed(&bs.header.data_length);
        }
        if let Some((_, work)) = &work {
            let shown = out.as_ref().unwrap_or(work).lock();
            reply.write_typed(&shown.info);
            t.registry.write_ext_buffers(reply, &shown.ext_param)?;
            reply.write_typed(&shown.data.time_stamp);
            reply.write_typed(&shown.data.frame_order);
            reply.write_typed(&shown.data.data_flag);
        }
        if !out_host.is_null() && !sts.is_error() && !sync.is_null() {
            s.syncs.insert(sync, SyncTag::Surface(out_host));
        }
        Ok(())
    })?;
    Ok(sts)
}

fn encode_frame_async(
    t: &mut TargetServer,
    args: &mut PayloadReader,
    reply: &mut PayloadWriter,
) -> Result<Status> {
    let (handle, state) = read_session(t, args)?;
    let state = match state {
        Some(s) => s,
        None => return Ok(Status::ERR_UNKNOWN),
    };
    let _guard = state.lock();

    let ctrl = read_encode_ctrl(args, &t.registry)?;
    let surface = bind_surface(t, &state, args, true)?;
    if let Some((desc, _)) = &surface {
        let system = with_state(&state, |s| s.encoder_io_pattern)
            .contains(IoPattern::IN_SYSTEM_MEMORY);
        read_va_handle(t, &state, desc, system, args)?;
    }
    let mut bs = None;
    let host_bs = read_bitstream(args, &t.registry, &mut bs, None)?;

    let mut sync = SyncPoint::NULL;
    let (sts, bitstream) = match bs {
        Some(bs) => {
            let bitstream = bs.into_shared();
            let sts = t
                .engine
                .encode_frame_async(
                    handle,
                    ctrl.as_ref(),
                    surface.as_ref().map(|(_, s)| s),
                    &bitstream,
                    &mut sync,
                )
                .masked();
            (sts, Some(bitstream))
        }
        None => (Status::ERR_NULL_PTR, None),
    };

    reply.write_typed(&sync);
    with_state(&state, |s| {
        write_lock_deltas(reply, &s.surfaces.lock_deltas());
        if let Some(bitstream) = bitstream {
            if !sts.is_error() && !sync.is_null() {
                s.syncs.insert(
                    sync,
                    SyncTag::Bitstream {
                        host: host_bs,
                        bitstream,
                    },
                );
            }
        }
    });
    Ok(sts)
}

fn sync_operation(
    t: &mut TargetServer,
    args: &mut PayloadReader,
    reply: &mut PayloadWriter,
) -> Result<Status> {
    let (handle, state) = read_session(t, args)?;
    let sync: SyncPoint = args.read_typed()?;
    let wait: u32 = args.read_typed()?;
    let state = match state {
        Some(s) => s,
        None => return Ok(Status::ERR_UNKNOWN),
    };
    let _guard = state.lock();

    let sts = t.engine.sync_operation(handle, sync, wait).masked();
    let registry = &t.registry;
    with_state(&state, |s| -> Result<Status> {
        let tag = match s.syncs.get(&sync) {
            Some(tag) => tag.clone(),
            None => {
                debug!("sync point {:#x} carries nothing", sync.0);
                write_lock_deltas(reply, &s.surfaces.lock_deltas());
                return Ok(Status::WRN_OUT_OF_RANGE);
            }
        };
        let mut sts = sts;
        if sts == Status::NONE {
            s.syncs.remove(&sync);
            match tag {
                SyncTag::Surface(host) => match s.surfaces.entry_mut(host) {
                    Some(entry) => {
                        reply.write_typed(&SyncDependentInfo {
                            surface: host,
                            bitstream: BitstreamId::NULL,
                        });
                        write_surface_data(reply, &entry.surface.lock())?;
                        entry.was_output = true;
                    }
                    None => sts = Status::ERR_UNKNOWN,
                },
                SyncTag::Bitstream { host, bitstream } => {
                    reply.write_typed(&SyncDependentInfo {
                        surface: SurfaceId::NULL,
                        bitstream: host,
                    });
                    reply.write_typed(&host);
                    write_bitstream(reply, registry, host, Some(&*bitstream.lock()), None)?;
                }
            }
        }
        write_lock_deltas(reply, &s.surfaces.lock_deltas());
        Ok(sts)
    })
}

fn set_frame_allocator(
    t: &mut TargetServer,
    args: &mut PayloadReader,
    _reply: &mut PayloadWriter,
) -> Result<Status> {
    let (handle, state) = read_session(t, args)?;
    let present = args.read_presence()? != 0;
    let state = match state {
        Some(s) => s,
        None => return Ok(Status::ERR_UNKNOWN),
    };

    let allocator = if present {
        match with_state(&state, |s| s.allocator.clone()) {
            Some(a) => Some(a),
            None => {
                let route = match t.delivery {
                    CallbackDelivery::Inplace => Route::Inplace(t.dispatcher.clone()),
                    CallbackDelivery::Dedicated => {
                        let fabric = match &t.fabric {
                            Some(f) => f.clone(),
                            None => return Ok(Status::ERR_UNSUPPORTED),
                        };
                        let channel_id = if fabric.mode() == CommMode::Unite {
                            None
                        } else {
                            let tx: u16 = args.read_typed()?;
                            let _rx: u16 = args.read_typed()?;
                            Some(tx)
                        };
                        debug!("accepting allocator channel {:?}", channel_id);
                        let channel = fabric.accept(channel_id)?;
                        Route::Dedicated(Dispatcher::new(channel, DispatchMode::Proxy))
                    }
                };
                let allocator = Arc::new(TargetAllocator::new(handle, route, &state));
                with_state(&state, |s| s.allocator = Some(allocator.clone()));
                Some(allocator)
            }
        }
    } else {
        None
    };

    let sts = t.engine.set_frame_allocator(
        handle,
        allocator.map(|a| a as Arc<dyn FrameAllocator>),
    );
    if !present && sts == Status::NONE {
        if let Some(previous) = with_state(&state, |s| s.allocator.take()) {
            previous.close();
        }
    }
    Ok(sts)
}
