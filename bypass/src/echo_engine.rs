// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A [`CodecEngine`] without a codec.
//!
//! Decoding copies the consumed bitstream bytes, repeated, into the planes of the output surface.
//! Encoding copies the planes of the input surface into the output bitstream. Both complete on
//! `sync_operation`. Surfaces without planes are reached through the session's frame allocator.

use std::collections::HashMap;
use std::sync::Arc;

use log::debug;
use log::info;
use mfx_wire::bitstream::SharedBitstream;
use mfx_wire::caps::CodecMemDesc;
use mfx_wire::caps::CodecProfile;
use mfx_wire::caps::DecoderCodec;
use mfx_wire::caps::DeviceDescription;
use mfx_wire::caps::EncoderCodec;
use mfx_wire::caps::Range32;
use mfx_wire::caps::SubDevice;
use mfx_wire::caps::VppFilter;
use mfx_wire::caps::VppFormat;
use mfx_wire::caps::VppMemDesc;
use mfx_wire::param::EncodeCtrl;
use mfx_wire::param::Payload;
use mfx_wire::param::VideoParam;
use mfx_wire::types::codec;
use mfx_wire::types::fourcc;
use mfx_wire::types::DecodeStat;
use mfx_wire::types::EncodeStat;
use mfx_wire::types::FrameAllocRequest;
use mfx_wire::types::ImplDescriptionHeader;
use mfx_wire::types::InitParam;
use mfx_wire::types::InitializationParam;
use mfx_wire::types::IoPattern;
use mfx_wire::types::MemType;
use mfx_wire::types::PlatformInfo;
use mfx_wire::types::SessionHandle;
use mfx_wire::types::SyncPoint;
use mfx_wire::types::Version;
use mfx_wire::types::PICSTRUCT_PROGRESSIVE;
use mfx_wire::Bitstream;
use mfx_wire::FrameSurface;
use mfx_wire::ImplDescription;
use mfx_wire::SharedSurface;
use mfx_wire::Status;

use crate::engine::CodecEngine;
use crate::engine::CodecKind;
use crate::engine::FrameAllocator;

/// API version reported by the echo engine.
pub const ECHO_VERSION: Version = Version { minor: 9, major: 2 };
/// Implementation flags reported for sessions created without any (software).
pub const ECHO_IMPL: u32 = 0x0001;

const HEADER_WIDTH: u16 = 64;
const HEADER_HEIGHT: u16 = 64;

// Resource type of plain system memory surfaces.
const SYSTEM_SURFACE: u32 = 1;

fn echo_description() -> ImplDescription {
    let mut impl_name = [0u8; 32];
    impl_name[..4].copy_from_slice(b"echo");
    let mut device_id = [0u8; 32];
    device_id[..4].copy_from_slice(b"echo");
    let size = Range32 {
        min: 16,
        max: 4096,
        step: 16,
    };
    let nv12 = CodecMemDesc {
        mem_handle_type: SYSTEM_SURFACE,
        width: size,
        height: size,
        color_formats: vec![fourcc::NV12],
    };
    let profiles = vec![CodecProfile {
        profile: 0,
        mem_desc: vec![nv12],
    }];
    ImplDescription {
        header: ImplDescriptionHeader {
            impl_type: ECHO_IMPL,
            api_version: ECHO_VERSION,
            impl_name,
            ..Default::default()
        },
        dev: DeviceDescription {
            device_id,
            media_adapter_type: 0,
            sub_devices: vec![SubDevice {
                index: 0,
                sub_device_id: device_id,
            }],
        },
        decoders: vec![DecoderCodec {
            codec_id: codec::AVC,
            max_codec_level: 51,
            profiles: profiles.clone(),
        }],
        encoders: vec![EncoderCodec {
            codec_id: codec::AVC,
            max_codec_level: 51,
            bi_directional_prediction: 0,
            profiles,
        }],
        filters: vec![VppFilter {
            filter_fourcc: fourcc::NV12,
            max_delay_in_frames: 0,
            mem_desc: vec![VppMemDesc {
                mem_handle_type: SYSTEM_SURFACE,
                width: size,
                height: size,
                formats: vec![VppFormat {
                    in_format: fourcc::NV12,
                    out_formats: vec![fourcc::NV12],
                }],
            }],
        }],
    }
}

enum Pending {
    Decode {
        surface: SharedSurface,
        data: Vec<u8>,
    },
    Encode {
        surface: SharedSurface,
        bitstream: SharedBitstream,
        frame_type: u16,
        data: Vec<u8>,
    },
}

#[derive(Default)]
struct EchoSession {
    implementation: u32,
    priority: i32,
    parent: Option<SessionHandle>,
    allocator: Option<Arc<dyn FrameAllocator>>,
    handles: HashMap<i32, u64>,
    decoder: Option<VideoParam>,
    encoder: Option<VideoParam>,
    skip_mode: i32,
    pending: HashMap<SyncPoint, Pending>,
    decode_stat: DecodeStat,
    encode_stat: EncodeStat,
}

impl EchoSession {
    fn codec(&mut self, kind: CodecKind) -> &mut Option<VideoParam> {
        match kind {
            CodecKind::Decode => &mut self.decoder,
            CodecKind::Encode => &mut self.encoder,
        }
    }
}

#[derive(Default)]
pub struct EchoEngine {
    sessions: HashMap<SessionHandle, EchoSession>,
    last_session: u64,
    last_sync: u64,
}

impl EchoEngine {
    pub fn new() -> EchoEngine {
        EchoEngine::default()
    }

    /// Number of open sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn open(&mut self, implementation: u32) -> SessionHandle {
        self.last_session += 1;
        let handle = SessionHandle(0x5e55_0000 + self.last_session);
        self.sessions.insert(
            handle,
            EchoSession {
                implementation,
                ..Default::default()
            },
        );
        info!("echo session {:#x} opened", handle.0);
        handle
    }

    fn session(&mut self, handle: SessionHandle) -> Result<&mut EchoSession, Status> {
        self.sessions
            .get_mut(&handle)
            .ok_or(Status::ERR_INVALID_HANDLE)
    }

    fn next_sync(&mut self) -> SyncPoint {
        self.last_sync += 1;
        SyncPoint(0x5c00_0000 + self.last_sync)
    }
}

// Runs `f` on the planes of `surface`, mapping it through `allocator` when it has none. The
// surface lock is not held while the allocator runs.
fn with_planes<F>(
    surface: &SharedSurface,
    allocator: Option<&Arc<dyn FrameAllocator>>,
    f: F,
) -> Status
where
    F: FnOnce(&mut FrameSurface),
{
    {
        let mut s = surface.lock();
        if s.is_mapped() {
            f(&mut s);
            return Status::NONE;
        }
    }
    let allocator = match allocator {
        Some(a) => a,
        None => return Status::ERR_LOCK_MEMORY,
    };
    let mut scratch = surface.lock().clone();
    let mid = scratch.data.mem_id;
    let sts = allocator.lock(mid, &mut scratch);
    if sts != Status::NONE {
        return sts;
    }
    if !scratch.is_mapped() {
        scratch.map_planes();
    }
    f(&mut scratch);
    let sts = allocator.unlock(mid, &mut scratch);
    let mut s = surface.lock();
    s.data.time_stamp = scratch.data.time_stamp;
    s.data.frame_order = scratch.data.frame_order;
    sts
}

impl CodecEngine for EchoEngine {
    fn init_ex(&mut self, par: &InitParam) -> Result<SessionHandle, Status> {
        let implementation = if par.implementation == 0 {
            ECHO_IMPL
        } else {
            par.implementation
        };
        Ok(self.open(implementation))
    }

    fn initialize(&mut self, _par: &InitializationParam) -> Result<SessionHandle, Status> {
        Ok(self.open(ECHO_IMPL))
    }

    fn close(&mut self, session: SessionHandle) -> Status {
        match self.sessions.remove(&session) {
            Some(_) => {
                info!("echo session {:#x} closed", session.0);
                Status::NONE
            }
            None => Status::ERR_INVALID_HANDLE,
        }
    }

    fn query_impls_description(&mut self) -> Vec<ImplDescription> {
        vec![echo_description()]
    }

    fn release_impl_description(&mut self, _handle: u64) -> Status {
        Status::NONE
    }

    fn query_impl(&mut self, session: SessionHandle) -> Result<u32, Status> {
        Ok(self.session(session)?.implementation)
    }

    fn query_version(&mut self, session: SessionHandle) -> Result<Version, Status> {
        self.session(session)?;
        Ok(ECHO_VERSION)
    }

    fn query_platform(&mut self, session: SessionHandle) -> Result<PlatformInfo, Status> {
        self.session(session)?;
        Ok(PlatformInfo {
            code_name: 1,
            device_id: 0xec40,
            ..Default::default()
        })
    }

    fn join_session(&mut self, session: SessionHandle, child: SessionHandle) -> Status {
        if session == child || !self.sessions.contains_key(&session) {
            return Status::ERR_INVALID_HANDLE;
        }
        match self.sessions.get_mut(&child) {
            Some(c) if c.parent.is_none() => {
                c.parent = Some(session);
                Status::NONE
            }
            Some(_) => Status::ERR_UNDEFINED_BEHAVIOR,
            None => Status::ERR_INVALID_HANDLE,
        }
    }

    fn disjoin_session(&mut self, session: SessionHandle) -> Status {
        match self.session(session) {
            Ok(s) => {
                if s.parent.take().is_some() {
                    Status::NONE
                } else {
                    Status::ERR_UNDEFINED_BEHAVIOR
                }
            }
            Err(e) => e,
        }
    }

    fn clone_session(&mut self, session: SessionHandle) -> Result<SessionHandle, Status> {
        let implementation = self.session(session)?.implementation;
        let child = self.open(implementation);
        if let Some(c) = self.sessions.get_mut(&child) {
            c.parent = Some(session);
        }
        Ok(child)
    }

    fn set_priority(&mut self, session: SessionHandle, priority: i32) -> Status {
        match self.session(session) {
            Ok(s) => {
                s.priority = priority;
                Status::NONE
            }
            Err(e) => e,
        }
    }

    fn get_priority(&mut self, session: SessionHandle) -> Result<i32, Status> {
        Ok(self.session(session)?.priority)
    }

    fn set_frame_allocator(
        &mut self,
        session: SessionHandle,
        allocator: Option<Arc<dyn FrameAllocator>>,
    ) -> Status {
        match self.session(session) {
            Ok(s) => {
                s.allocator = allocator;
                Status::NONE
            }
            Err(e) => e,
        }
    }

    fn set_handle(&mut self, session: SessionHandle, kind: i32, handle: u64) -> Status {
        match self.session(session) {
            Ok(s) => {
                s.handles.insert(kind, handle);
                Status::NONE
            }
            Err(e) => e,
        }
    }

    fn get_handle(&mut self, session: SessionHandle, kind: i32) -> Result<u64, Status> {
        self.session(session)?
            .handles
            .get(&kind)
            .copied()
            .ok_or(Status::ERR_NOT_FOUND)
    }

    fn query(
        &mut self,
        _kind: CodecKind,
        session: SessionHandle,
        input: Option<&VideoParam>,
        out: Option<&mut VideoParam>,
    ) -> Status {
        if let Err(e) = self.session(session) {
            return e;
        }
        let out = match out {
            Some(out) => out,
            None => return Status::ERR_NULL_PTR,
        };
        match input {
            Some(input) => *out = input.clone(),
            // Without input, report which fields are configurable.
            None => {
                *out = VideoParam::default();
                out.header.async_depth = 1;
                out.header.io_pattern = 1;
                out.header.mfx.codec_id = 1;
                out.header.mfx.frame_info.fourcc = 1;
                out.header.mfx.frame_info.width = 1;
                out.header.mfx.frame_info.height = 1;
            }
        }
        Status::NONE
    }

    fn query_io_surf(
        &mut self,
        kind: CodecKind,
        session: SessionHandle,
        par: Option<&VideoParam>,
        request: &mut FrameAllocRequest,
    ) -> Status {
        if let Err(e) = self.session(session) {
            return e;
        }
        let par = match par {
            Some(par) => par,
            None => return Status::ERR_NULL_PTR,
        };
        let io = par.io_pattern();
        let (memory, source) = match kind {
            CodecKind::Decode if io.contains(IoPattern::OUT_SYSTEM_MEMORY) => {
                (MemType::SYSTEM_MEMORY, MemType::FROM_DECODE)
            }
            CodecKind::Decode => (MemType::VIDEO_MEMORY_DECODER_TARGET, MemType::FROM_DECODE),
            CodecKind::Encode if io.contains(IoPattern::IN_SYSTEM_MEMORY) => {
                (MemType::SYSTEM_MEMORY, MemType::FROM_ENCODE)
            }
            CodecKind::Encode => (MemType::VIDEO_MEMORY_DECODER_TARGET, MemType::FROM_ENCODE),
        };
        let min = par.header.async_depth.max(1) + 1;
        *request = FrameAllocRequest {
            alloc_id: par.header.alloc_id,
            info: par.header.mfx.frame_info,
            mem_type: (memory | source | MemType::EXTERNAL_FRAME).bits(),
            num_frame_min: min,
            num_frame_suggested: min + 1,
            reserved: 0,
        };
        Status::NONE
    }

    fn init(
        &mut self,
        kind: CodecKind,
        session: SessionHandle,
        par: Option<&VideoParam>,
    ) -> Status {
        let s = match self.session(session) {
            Ok(s) => s,
            Err(e) => return e,
        };
        let par = match par {
            Some(par) => par,
            None => return Status::ERR_NULL_PTR,
        };
        let codec = s.codec(kind);
        if codec.is_some() {
            return Status::ERR_UNDEFINED_BEHAVIOR;
        }
        debug!("echo {:?} init on {:#x}", kind, session.0);
        *codec = Some(par.clone());
        Status::NONE
    }

    fn reset(
        &mut self,
        kind: CodecKind,
        session: SessionHandle,
        par: Option<&VideoParam>,
    ) -> Status {
        let s = match self.session(session) {
            Ok(s) => s,
            Err(e) => return e,
        };
        let par = match par {
            Some(par) => par,
            None => return Status::ERR_NULL_PTR,
        };
        match s.codec(kind) {
            Some(current) => {
                *current = par.clone();
                s.pending.clear();
                Status::NONE
            }
            None => Status::ERR_NOT_INITIALIZED,
        }
    }

    fn close_codec(&mut self, kind: CodecKind, session: SessionHandle) -> Status {
        let s = match self.session(session) {
            Ok(s) => s,
            Err(e) => return e,
        };
        if s.codec(kind).take().is_none() {
            return Status::ERR_NOT_INITIALIZED;
        }
        // Release what in-flight operations of this codec still hold.
        let pending: Vec<SyncPoint> = s
            .pending
            .iter()
            .filter(|(_, p)| match p {
                Pending::Decode { .. } => kind == CodecKind::Decode,
                Pending::Encode { .. } => kind == CodecKind::Encode,
            })
            .map(|(sync, _)| *sync)
            .collect();
        for sync in pending {
            if let Some(Pending::Decode { surface, .. } | Pending::Encode { surface, .. }) =
                s.pending.remove(&sync)
            {
                let mut surface = surface.lock();
                surface.data.locked = surface.data.locked.saturating_sub(1);
            }
        }
        Status::NONE
    }

    fn get_video_param(
        &mut self,
        kind: CodecKind,
        session: SessionHandle,
        par: &mut VideoParam,
    ) -> Status {
        let s = match self.session(session) {
            Ok(s) => s,
            Err(e) => return e,
        };
        match s.codec(kind) {
            Some(current) => {
                *par = current.clone();
                Status::NONE
            }
            None => Status::ERR_NOT_INITIALIZED,
        }
    }

    fn decode_header(
        &mut self,
        session: SessionHandle,
        bs: &mut Bitstream,
        par: &mut VideoParam,
    ) -> Status {
        if let Err(e) = self.session(session) {
            return e;
        }
        match bs.committed() {
            Ok(data) if data.is_empty() => return Status::ERR_MORE_DATA,
            Ok(_) => {}
            Err(e) => return e.status(),
        }
        let info = &mut par.header.mfx.frame_info;
        if info.fourcc == 0 {
            info.fourcc = fourcc::NV12;
        }
        if info.width == 0 || info.height == 0 {
            info.width = HEADER_WIDTH;
            info.height = HEADER_HEIGHT;
        }
        info.crop_x = 0;
        info.crop_y = 0;
        info.crop_w = info.width;
        info.crop_h = info.height;
        info.pic_struct = PICSTRUCT_PROGRESSIVE;
        bs.header.pic_struct = PICSTRUCT_PROGRESSIVE;
        Status::NONE
    }

    fn decode_stat(&mut self, session: SessionHandle) -> Result<DecodeStat, Status> {
        let s = self.session(session)?;
        if s.decoder.is_none() {
            return Err(Status::ERR_NOT_INITIALIZED);
        }
        Ok(s.decode_stat)
    }

    fn set_skip_mode(&mut self, session: SessionHandle, mode: i32) -> Status {
        match self.session(session) {
            Ok(s) if s.decoder.is_some() => {
                s.skip_mode = mode;
                Status::NONE
            }
            Ok(_) => Status::ERR_NOT_INITIALIZED,
            Err(e) => e,
        }
    }

    fn get_payload(
        &mut self,
        session: SessionHandle,
        ts: &mut u64,
        payload: &mut Payload,
    ) -> Status {
        match self.session(session) {
            Ok(s) if s.decoder.is_some() => {
                // No user data is ever present.
                *ts = 0;
                payload.info.num_bit = 0;
                Status::NONE
            }
            Ok(_) => Status::ERR_NOT_INITIALIZED,
            Err(e) => e,
        }
    }

    fn decode_frame_async(
        &mut self,
        session: SessionHandle,
        bs: Option<&mut Bitstream>,
        work: Option<&SharedSurface>,
        out: &mut Option<SharedSurface>,
        sync: &mut SyncPoint,
    ) -> Status {
        *out = None;
        *sync = SyncPoint::NULL;
        let next = self.next_sync();
        let s = match self.session(session) {
            Ok(s) => s,
            Err(e) => return e,
        };
        if s.decoder.is_none() {
            return Status::ERR_NOT_INITIALIZED;
        }
        // Nothing is buffered, so draining has nothing to return.
        let bs = match bs {
            Some(bs) => bs,
            None => return Status::ERR_MORE_DATA,
        };
        let work = match work {
            Some(work) => work,
            None => return Status::ERR_NULL_PTR,
        };
        let data = match bs.committed() {
            Ok(data) => data.to_vec(),
            Err(e) => return e.status(),
        };
        if data.is_empty() {
            return Status::ERR_MORE_DATA;
        }
        {
            let mut w = work.lock();
            if w.data.locked > 0 {
                return Status::ERR_MORE_SURFACE;
            }
            w.data.locked += 1;
            w.data.time_stamp = bs.header.time_stamp;
            w.data.frame_order = s.decode_stat.num_frame;
        }
        bs.header.data_offset += bs.header.data_length;
        bs.header.data_length = 0;
        s.decode_stat.num_frame += 1;

        s.pending.insert(
            next,
            Pending::Decode {
                surface: work.clone(),
                data,
            },
        );
        *out = Some(work.clone());
        *sync = next;
        Status::NONE
    }

    fn encode_stat(&mut self, session: SessionHandle) -> Result<EncodeStat, Status> {
        let s = self.session(session)?;
        if s.encoder.is_none() {
            return Err(Status::ERR_NOT_INITIALIZED);
        }
        Ok(s.encode_stat)
    }

    fn encode_frame_async(
        &mut self,
        session: SessionHandle,
        ctrl: Option<&EncodeCtrl>,
        surface: Option<&SharedSurface>,
        bs: &SharedBitstream,
        sync: &mut SyncPoint,
    ) -> Status {
        *sync = SyncPoint::NULL;
        let next = self.next_sync();
        let s = match self.session(session) {
            Ok(s) => s,
            Err(e) => return e,
        };
        if s.encoder.is_none() {
            return Status::ERR_NOT_INITIALIZED;
        }
        let surface = match surface {
            Some(surface) => surface,
            None => return Status::ERR_MORE_DATA,
        };
        let mut data = Vec::new();
        let sts = with_planes(surface, s.allocator.as_ref(), |f| {
            let size = f.frame_size();
            if let Some(planes) = &f.planes {
                data.extend_from_slice(&planes[..size.min(planes.len())]);
            }
        });
        if sts != Status::NONE {
            return sts;
        }
        surface.lock().data.locked += 1;
        s.encode_stat.num_frame += 1;
        s.pending.insert(
            next,
            Pending::Encode {
                surface: surface.clone(),
                bitstream: bs.clone(),
                frame_type: ctrl.map_or(0, |c| c.header.frame_type),
                data,
            },
        );
        *sync = next;
        Status::NONE
    }

    fn sync_operation(&mut self, session: SessionHandle, sync: SyncPoint, _wait: u32) -> Status {
        if sync.is_null() {
            return Status::ERR_NULL_PTR;
        }
        let s = match self.session(session) {
            Ok(s) => s,
            Err(e) => return e,
        };
        let pending = match s.pending.remove(&sync) {
            Some(p) => p,
            None => return Status::ERR_NOT_FOUND,
        };
        match pending {
            Pending::Decode { surface, data } => {
                let sts = with_planes(&surface, s.allocator.as_ref(), |f| {
                    if let Some(planes) = f.planes.as_mut() {
                        for (dst, src) in planes.iter_mut().zip(data.iter().cycle()) {
                            *dst = *src;
                        }
                    }
                });
                let mut surface = surface.lock();
                surface.data.locked = surface.data.locked.saturating_sub(1);
                sts
            }
            Pending::Encode {
                surface,
                bitstream,
                frame_type,
                data,
            } => {
                {
                    let mut surface = surface.lock();
                    surface.data.locked = surface.data.locked.saturating_sub(1);
                }
                let mut bs = bitstream.lock();
                let start = (bs.header.data_offset + bs.header.data_length) as usize;
                let end = start + data.len();
                if end > bs.header.max_length as usize {
                    return Status::ERR_NOT_ENOUGH_BUFFER;
                }
                let buf = bs.data.get_or_insert_with(Vec::new);
                if buf.len() < end {
                    buf.resize(end, 0);
                }
                buf[start..end].copy_from_slice(&data);
                bs.header.data_length += data.len() as u32;
                bs.header.frame_type = frame_type;
                s.encode_stat.num_bit += data.len() as u64 * 8;
                Status::NONE
            }
        }
    }
}
