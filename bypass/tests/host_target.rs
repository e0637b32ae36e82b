// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::collections::HashMap;
use std::net::TcpStream;
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;

use bypass::CallbackDelivery;
use bypass::CodecKind;
use bypass::Dispatcher;
use bypass::EchoEngine;
use bypass::FrameAllocator;
use bypass::HostClient;
use bypass::TargetServer;
use mfx_wire::param::AllocatedFrames;
use mfx_wire::param::VideoParam;
use mfx_wire::types::codec;
use mfx_wire::types::fourcc;
use mfx_wire::types::FrameAllocRequest;
use mfx_wire::types::FrameInfo;
use mfx_wire::types::InitParam;
use mfx_wire::types::IoPattern;
use mfx_wire::types::MemId;
use mfx_wire::types::MemType;
use mfx_wire::types::SessionHandle;
use mfx_wire::types::SyncPoint;
use mfx_wire::types::HANDLE_VA_DISPLAY;
use mfx_wire::Bitstream;
use mfx_wire::DispatchMode;
use mfx_wire::FrameSurface;
use mfx_wire::Status;
use parking_lot::Mutex;
use shim_transport::Channel;
use shim_transport::Listener;
use shim_transport::QueueFabric;
use shim_transport::TcpChannelListener;

const WIDTH: u16 = 16;
const HEIGHT: u16 = 8;
const FRAME_SIZE: usize = 16 * 8 * 3 / 2;

fn info() -> FrameInfo {
    FrameInfo {
        fourcc: fourcc::NV12,
        width: WIDTH,
        height: HEIGHT,
        ..Default::default()
    }
}

fn param(io: IoPattern) -> VideoParam {
    let mut par = VideoParam::default();
    par.header.io_pattern = io.bits();
    par.header.async_depth = 1;
    par.header.mfx.frame_info = info();
    par
}

fn spawn_target(server: TargetServer) -> JoinHandle<TargetServer> {
    thread::spawn(move || {
        let mut server = server;
        server.serve().unwrap();
        server
    })
}

fn start(delivery: CallbackDelivery) -> (HostClient, JoinHandle<TargetServer>) {
    let (host, target) = Channel::queue_pair();
    let fabric = QueueFabric::new();
    let server = TargetServer::new(
        Dispatcher::new(target, DispatchMode::Proxy),
        Box::new(EchoEngine::new()),
    )
    .with_fabric(Arc::new(fabric.clone()))
    .with_delivery(delivery);
    let client = HostClient::new(host)
        .with_fabric(Arc::new(fabric))
        .with_delivery(delivery);
    (client, spawn_target(server))
}

fn stop(client: HostClient, target: JoinHandle<TargetServer>) -> TargetServer {
    assert_eq!(client.proxy_term(), Status::NONE);
    target.join().unwrap()
}

#[test]
fn decode_to_system_memory() {
    let (client, target) = start(CallbackDelivery::Inplace);
    assert_eq!(client.proxy_init(), Status::NONE);
    let session = client.init_ex(&InitParam::default()).unwrap();
    let par = param(IoPattern::OUT_SYSTEM_MEMORY);
    assert_eq!(client.init(CodecKind::Decode, session, &par), Status::NONE);

    let surface = FrameSurface::mapped(info(), WIDTH as u32).into_shared();
    let mut bs = Bitstream::from_data((0..10).collect());
    let mut out = None;
    let mut sync = SyncPoint::NULL;
    let sts =
        client.decode_frame_async(session, Some(&mut bs), Some(&surface), &mut out, &mut sync);
    assert_eq!(sts, Status::NONE);
    assert!(!sync.is_null());
    assert!(Arc::ptr_eq(out.as_ref().unwrap(), &surface));
    assert_eq!(bs.header.data_offset, 10);
    assert_eq!(bs.header.data_length, 0);
    assert_eq!(surface.lock().data.locked, 1);
    // Missing crop sizes default to the frame size.
    assert_eq!(surface.lock().info.crop_w, WIDTH);

    assert_eq!(client.sync_operation(session, sync, 1000), Status::NONE);
    {
        let s = surface.lock();
        let planes = s.planes.as_ref().unwrap();
        assert_eq!(&planes[..3], &[0, 1, 2]);
        assert_eq!(planes[10], 0);
        assert_eq!(planes[FRAME_SIZE - 1], ((FRAME_SIZE - 1) % 10) as u8);
        assert_eq!(s.data.locked, 0);
    }
    // A completed sync point has nothing left to deliver.
    assert_eq!(client.sync_operation(session, sync, 0), Status::NONE);

    let stat = client.decode_stat(session).unwrap();
    assert_eq!(stat.num_frame, 1);
    assert_eq!(client.close_codec(CodecKind::Decode, session), Status::NONE);
    assert_eq!(client.close(session), Status::NONE);
    assert_eq!(client.session_count(), 0);
    let server = stop(client, target);
    assert_eq!(server.session_count(), 0);
}

#[test]
fn decode_needs_input() {
    let (client, target) = start(CallbackDelivery::Inplace);
    let session = client.init_ex(&InitParam::default()).unwrap();
    let par = param(IoPattern::OUT_SYSTEM_MEMORY);
    assert_eq!(client.init(CodecKind::Decode, session, &par), Status::NONE);

    let surface = FrameSurface::mapped(info(), WIDTH as u32).into_shared();
    let mut out = None;
    let mut sync = SyncPoint::NULL;
    let sts = client.decode_frame_async(session, None, Some(&surface), &mut out, &mut sync);
    assert_eq!(sts, Status::ERR_MORE_DATA);
    assert!(sync.is_null());
    assert!(out.is_none());
    stop(client, target);
}

#[test]
fn encode_from_system_memory() {
    let (client, target) = start(CallbackDelivery::Inplace);
    let session = client.init_ex(&InitParam::default()).unwrap();
    let par = param(IoPattern::IN_SYSTEM_MEMORY);
    assert_eq!(client.init(CodecKind::Encode, session, &par), Status::NONE);

    let mut request = FrameAllocRequest::default();
    assert_eq!(
        client.query_io_surf(CodecKind::Encode, session, &par, &mut request),
        Status::NONE
    );
    assert!(request.mem_type().contains(MemType::SYSTEM_MEMORY));
    assert_eq!(request.num_frame_min, 2);

    let mut frame = FrameSurface::mapped(info(), WIDTH as u32);
    if let Some(planes) = frame.planes.as_mut() {
        planes.fill(7);
    }
    let surface = frame.into_shared();
    let bs = Bitstream::with_capacity(1024).into_shared();
    let mut sync = SyncPoint::NULL;
    assert_eq!(
        client.encode_frame_async(session, None, Some(&surface), &bs, &mut sync),
        Status::NONE
    );
    assert_eq!(surface.lock().data.locked, 1);

    assert_eq!(client.sync_operation(session, sync, 1000), Status::NONE);
    assert_eq!(surface.lock().data.locked, 0);
    {
        let bs = bs.lock();
        assert_eq!(bs.header.data_length as usize, FRAME_SIZE);
        assert!(bs.committed().unwrap().iter().all(|b| *b == 7));
    }
    let stat = client.encode_stat(session).unwrap();
    assert_eq!(stat.num_frame, 1);

    assert_eq!(client.close(session), Status::NONE);
    stop(client, target);
}

// Application allocator backing video memory surfaces with host buffers.
#[derive(Default)]
struct AppAllocator {
    frames: Mutex<HashMap<MemId, Vec<u8>>>,
    calls: Mutex<Vec<&'static str>>,
}

impl FrameAllocator for AppAllocator {
    fn alloc(&self, request: &FrameAllocRequest) -> Result<AllocatedFrames, Status> {
        self.calls.lock().push("alloc");
        let mids = (1..=request.num_frame_suggested as u64).map(MemId).collect();
        Ok(AllocatedFrames::new(request.alloc_id, request.mem_type, mids))
    }

    fn lock(&self, _mid: MemId, surface: &mut FrameSurface) -> Status {
        self.calls.lock().push("lock");
        surface.map_planes();
        Status::NONE
    }

    fn unlock(&self, mid: MemId, surface: &mut FrameSurface) -> Status {
        self.calls.lock().push("unlock");
        if let Some(planes) = surface.planes.take() {
            self.frames.lock().insert(mid, planes);
        }
        Status::NONE
    }

    fn get_hdl(&self, mid: MemId) -> Result<u32, Status> {
        self.calls.lock().push("get_hdl");
        Ok(mid.0 as u32 + 0x100)
    }

    fn free(&self, _frames: &AllocatedFrames) -> Status {
        self.calls.lock().push("free");
        Status::NONE
    }
}

// Decodes into a video memory surface the target can only reach through the allocator.
fn decode_through_allocator(delivery: CallbackDelivery) -> Arc<AppAllocator> {
    let (client, target) = start(delivery);
    let session = client.init_ex(&InitParam::default()).unwrap();
    let allocator = Arc::new(AppAllocator::default());
    assert_eq!(
        client.set_frame_allocator(session, Some(allocator.clone())),
        Status::NONE
    );
    // Attaching the same allocator again is a no-op.
    assert_eq!(
        client.set_frame_allocator(session, Some(allocator.clone())),
        Status::NONE
    );
    let par = param(IoPattern::OUT_VIDEO_MEMORY);
    assert_eq!(client.init(CodecKind::Decode, session, &par), Status::NONE);

    let mut frame = FrameSurface::new(info(), WIDTH as u32);
    frame.data.mem_id = MemId(3);
    let surface = frame.into_shared();
    let mut bs = Bitstream::from_data(vec![0xa5, 0x5a]);
    let mut out = None;
    let mut sync = SyncPoint::NULL;
    assert_eq!(
        client.decode_frame_async(session, Some(&mut bs), Some(&surface), &mut out, &mut sync),
        Status::NONE
    );
    assert_eq!(client.sync_operation(session, sync, 1000), Status::NONE);
    assert!(!surface.lock().is_mapped());
    assert_eq!(client.callbacks().locked_frames(), 0);

    assert_eq!(client.close(session), Status::NONE);
    stop(client, target);
    allocator
}

#[test]
fn inplace_allocator_callbacks() {
    let allocator = decode_through_allocator(CallbackDelivery::Inplace);
    let frames = allocator.frames.lock();
    let planes = &frames[&MemId(3)];
    assert_eq!(planes.len(), FRAME_SIZE);
    assert_eq!(&planes[..4], &[0xa5, 0x5a, 0xa5, 0x5a]);
    // The VA surface id travels with the request.
    assert_eq!(allocator.calls.lock()[0], "get_hdl");
}

#[test]
fn dedicated_allocator_channel() {
    let allocator = decode_through_allocator(CallbackDelivery::Dedicated);
    let frames = allocator.frames.lock();
    assert_eq!(&frames[&MemId(3)][..2], &[0xa5, 0x5a]);
    assert_eq!(*allocator.calls.lock(), vec!["lock", "unlock"]);
}

#[test]
fn session_management() {
    let (client, target) = start(CallbackDelivery::Inplace);
    let descs = client.query_impls_description(0).unwrap();
    assert_eq!(descs.len(), 1);
    let echo = &descs[0];
    assert_eq!(echo.name(), "echo");
    assert_eq!(echo.dev.sub_devices.len(), 1);
    let dec = &echo.decoders[0];
    assert_eq!(dec.codec_id, codec::AVC);
    assert_eq!(dec.profiles[0].mem_desc[0].color_formats, vec![fourcc::NV12]);
    assert_eq!(echo.encoders[0].profiles[0].mem_desc[0].width.max, 4096);
    let vpp = &echo.filters[0].mem_desc[0].formats[0];
    assert_eq!((vpp.in_format, &vpp.out_formats[..]), (fourcc::NV12, &[fourcc::NV12][..]));

    let parent = client.init_ex(&InitParam::default()).unwrap();
    let version = client.query_version(parent).unwrap();
    assert_eq!((version.major, version.minor), (2, 9));
    assert_eq!(client.set_priority(parent, 1), Status::NONE);
    assert_eq!(client.get_priority(parent), Ok(1));

    let clone = client.clone_session(parent).unwrap();
    assert_ne!(clone, parent);
    let child = client.init_ex(&InitParam::default()).unwrap();
    assert_eq!(client.session_count(), 3);
    assert_eq!(client.join_session(parent, child), Status::NONE);
    assert_eq!(client.disjoin_session(child), Status::NONE);
    assert_eq!(client.disjoin_session(child), Status::ERR_UNKNOWN);

    assert_eq!(client.set_handle(parent, HANDLE_VA_DISPLAY, 0xd00d), Status::NONE);
    assert_eq!(client.get_handle(parent, HANDLE_VA_DISPLAY), Ok(0xd00d));

    for session in [child, clone, parent] {
        assert_eq!(client.close(session), Status::NONE);
    }
    assert_eq!(client.query_version(SessionHandle(0x77)).unwrap_err(), Status::ERR_INVALID_HANDLE);
    let server = stop(client, target);
    assert_eq!(server.hw_device(), None);
}

#[test]
fn tcp_main_channel() {
    let mut listener = TcpChannelListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let target = thread::spawn(move || {
        let channel = listener.accept().unwrap().unwrap();
        let mut server = TargetServer::new(
            Dispatcher::new(channel, DispatchMode::Proxy),
            Box::new(EchoEngine::new()),
        );
        server.serve().unwrap();
        server
    });

    let client = HostClient::new(Channel::from_stream(TcpStream::connect(addr).unwrap()));
    let session = client.init_ex(&InitParam::default()).unwrap();
    assert_eq!(client.query_impl(session), Ok(1));
    assert_eq!(client.close(session), Status::NONE);
    stop(client, target);
}
