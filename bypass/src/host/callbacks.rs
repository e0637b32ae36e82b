// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Runs allocator callbacks from the target against the application's allocator.

use std::collections::HashMap;
use std::sync::Arc;

use log::warn;
use mfx_wire::param::read_allocated_frames;
use mfx_wire::param::write_allocated_frames;
use mfx_wire::surface::read_surface_data;
use mfx_wire::surface::write_surface_data;
use mfx_wire::types::FrameAllocRequest;
use mfx_wire::types::FrameData;
use mfx_wire::types::FrameInfo;
use mfx_wire::types::MemId;
use mfx_wire::types::SessionHandle;
use mfx_wire::CallbackId;
use mfx_wire::FrameSurface;
use mfx_wire::PayloadReader;
use mfx_wire::PayloadWriter;
use mfx_wire::Status;
use parking_lot::Mutex;

use super::HostSession;
use crate::dispatcher::CallbackHandler;
use crate::engine::FrameAllocator;
use crate::function_table::FunctionTable;
use crate::session::with_state;
use crate::session::SessionRegistry;
use crate::Result;

type Callback = fn(
    &HostCallbacks,
    &dyn FrameAllocator,
    &mut PayloadReader,
    &mut PayloadWriter,
) -> Result<Status>;

pub struct HostCallbacks {
    sessions: Arc<SessionRegistry<HostSession>>,
    table: FunctionTable<Callback>,
    // Frames handed out by lock, kept until the matching unlock.
    locked: Mutex<HashMap<MemId, FrameSurface>>,
}

impl HostCallbacks {
    pub fn new(sessions: Arc<SessionRegistry<HostSession>>) -> HostCallbacks {
        HostCallbacks {
            sessions,
            table: FunctionTable::<Callback>::for_callbacks()
                .with_callback(CallbackId::Alloc, alloc)
                .with_callback(CallbackId::Lock, lock)
                .with_callback(CallbackId::Unlock, unlock)
                .with_callback(CallbackId::GetHdl, get_hdl)
                .with_callback(CallbackId::Free, free),
            locked: Mutex::new(HashMap::new()),
        }
    }

    /// Number of frames locked through callbacks and not yet unlocked.
    pub fn locked_frames(&self) -> usize {
        self.locked.lock().len()
    }

    fn allocator(&self, session: SessionHandle) -> Option<Arc<dyn FrameAllocator>> {
        let state = self.sessions.get(session)?;
        with_state(&state, |s| s.allocator.clone())
    }
}

impl CallbackHandler for HostCallbacks {
    fn execute_callback(
        &self,
        id: CallbackId,
        args: &mut PayloadReader,
        reply: &mut PayloadWriter,
    ) -> Status {
        let session: SessionHandle = match args.read_typed() {
            Ok(s) => s,
            Err(e) => {
                warn!("callback {:?} without a session: {}", id, e);
                return Status::ERR_UNKNOWN;
            }
        };
        let allocator = match self.allocator(session) {
            Some(a) => a,
            None => {
                warn!("callback {:?} for {:#x} has no allocator", id, session.0);
                return Status::ERR_UNKNOWN;
            }
        };
        let callback = match self.table.get(id as u32) {
            Some(cb) => cb,
            None => return Status::ERR_UNKNOWN,
        };
        callback(self, allocator.as_ref(), args, reply).unwrap_or_else(|e| {
            warn!("callback {:?} failed: {}", id, e);
            reply.clear();
            e.status()
        })
    }
}

fn alloc(
    _cb: &HostCallbacks,
    allocator: &dyn FrameAllocator,
    args: &mut PayloadReader,
    reply: &mut PayloadWriter,
) -> Result<Status> {
    let request: FrameAllocRequest = args.read_typed()?;
    Ok(match allocator.alloc(&request) {
        Ok(frames) => {
            write_allocated_frames(reply, &frames);
            Status::NONE
        }
        Err(sts) => sts,
    })
}

fn lock(
    cb: &HostCallbacks,
    allocator: &dyn FrameAllocator,
    args: &mut PayloadReader,
    reply: &mut PayloadWriter,
) -> Result<Status> {
    let mid: MemId = args.read_typed()?;
    let data: FrameData = args.read_typed()?;
    let info: FrameInfo = args.read_typed()?;
    let mut surface = FrameSurface {
        info,
        data: FrameData { mapped: 0, ..data },
        ..Default::default()
    };
    let sts = allocator.lock(mid, &mut surface);
    if sts != Status::NONE {
        return Ok(sts);
    }
    reply.write_typed(&surface.wire_data());
    write_surface_data(reply, &surface)?;
    cb.locked.lock().insert(mid, surface);
    Ok(Status::NONE)
}

fn unlock(
    cb: &HostCallbacks,
    allocator: &dyn FrameAllocator,
    args: &mut PayloadReader,
    _reply: &mut PayloadWriter,
) -> Result<Status> {
    let mid: MemId = args.read_typed()?;
    let info: FrameInfo = args.read_typed()?;
    let mut surface = cb.locked.lock().remove(&mid).unwrap_or_default();
    surface.info = info;
    if surface.is_mapped() && args.remaining() >= surface.frame_size() {
        read_surface_data(args, &mut surface)?;
    }
    Ok(allocator.unlock(mid, &mut surface))
}

fn get_hdl(
    _cb: &HostCallbacks,
    allocator: &dyn FrameAllocator,
    args: &mut PayloadReader,
    reply: &mut PayloadWriter,
) -> Result<Status> {
    let mid: MemId = args.read_typed()?;
    Ok(match allocator.get_hdl(mid) {
        Ok(hdl) => {
            reply.write_typed(&hdl);
            Status::NONE
        }
        Err(sts) => sts,
    })
}

fn free(
    _cb: &HostCallbacks,
    allocator: &dyn FrameAllocator,
    args: &mut PayloadReader,
    _reply: &mut PayloadWriter,
) -> Result<Status> {
    let frames = read_allocated_frames(args)?;
    Ok(allocator.free(&frames))
}

#[cfg(test)]
mod tests {
    use mfx_wire::param::AllocatedFrames;
    use mfx_wire::types::fourcc;

    use super::*;

    struct Planes;

    impl FrameAllocator for Planes {
        fn alloc(
            &self,
            request: &FrameAllocRequest,
        ) -> std::result::Result<AllocatedFrames, Status> {
            let mids = (1..=request.num_frame_suggested as u64).map(MemId).collect();
            Ok(AllocatedFrames::new(request.alloc_id, request.mem_type, mids))
        }

        fn lock(&self, mid: MemId, surface: &mut FrameSurface) -> Status {
            surface.data.set_pitch(surface.info.width as u32);
            surface.map_planes();
            if let Some(planes) = surface.planes.as_mut() {
                planes.fill(mid.0 as u8);
            }
            Status::NONE
        }

        fn unlock(&self, _mid: MemId, surface: &mut FrameSurface) -> Status {
            match surface.planes.as_ref().map(|p| p[0]) {
                Some(0xee) => Status::NONE,
                _ => Status::ERR_LOCK_MEMORY,
            }
        }

        fn get_hdl(&self, mid: MemId) -> std::result::Result<u32, Status> {
            Ok(mid.0 as u32 + 100)
        }

        fn free(&self, _frames: &AllocatedFrames) -> Status {
            Status::NONE
        }
    }

    fn callbacks() -> HostCallbacks {
        let sessions = Arc::new(SessionRegistry::new());
        let state = sessions.add(SessionHandle(1), HostSession::default());
        with_state(&state, |s| s.allocator = Some(Arc::new(Planes) as Arc<dyn FrameAllocator>));
        sessions.add(SessionHandle(2), HostSession::default());
        HostCallbacks::new(sessions)
    }

    fn request(session: u64) -> PayloadWriter {
        let mut w = PayloadWriter::new(0);
        w.write_typed(&SessionHandle(session));
        w
    }

    fn run(cb: &HostCallbacks, id: CallbackId, w: PayloadWriter) -> (Status, PayloadReader) {
        let mut args = PayloadReader::new(w.into_bytes()).unwrap();
        let mut reply = PayloadWriter::new(0);
        let sts = cb.execute_callback(id, &mut args, &mut reply);
        (sts, PayloadReader::new(reply.into_bytes()).unwrap())
    }

    #[test]
    fn lock_then_unlock_round_trips_planes() {
        let cb = callbacks();
        let info = FrameInfo {
            fourcc: fourcc::NV12,
            width: 4,
            height: 2,
            ..Default::default()
        };
        let mut w = request(1);
        w.write_typed(&MemId(7));
        w.write_typed(&FrameData::default());
        w.write_typed(&info);
        let (sts, mut r) = run(&cb, CallbackId::Lock, w);
        assert_eq!(sts, Status::NONE);
        let data: FrameData = r.read_typed().unwrap();
        assert_eq!(data.mapped, 1);
        assert_eq!(data.pitch(), 4);
        assert_eq!(r.read_vec(12).unwrap(), vec![7; 12]);
        assert_eq!(cb.locked_frames(), 1);

        let mut w = request(1);
        w.write_typed(&MemId(7));
        w.write_typed(&info);
        w.write(&[0xee; 12]);
        let (sts, _) = run(&cb, CallbackId::Unlock, w);
        assert_eq!(sts, Status::NONE);
        assert_eq!(cb.locked_frames(), 0);
    }

    #[test]
    fn alloc_and_get_hdl() {
        let cb = callbacks();
        let mut w = request(1);
        w.write_typed(&FrameAllocRequest {
            alloc_id: 9,
            num_frame_suggested: 3,
            ..Default::default()
        });
        let (sts, mut r) = run(&cb, CallbackId::Alloc, w);
        assert_eq!(sts, Status::NONE);
        let frames = read_allocated_frames(&mut r).unwrap();
        assert_eq!(frames.mids, vec![MemId(1), MemId(2), MemId(3)]);

        let mut w = request(1);
        w.write_typed(&MemId(2));
        let (sts, mut r) = run(&cb, CallbackId::GetHdl, w);
        assert_eq!(sts, Status::NONE);
        assert_eq!(r.read_typed::<u32>().unwrap(), 102);
    }

    #[test]
    fn missing_allocator_or_session() {
        let cb = callbacks();
        let mut w = request(2);
        w.write_typed(&MemId(1));
        assert_eq!(run(&cb, CallbackId::GetHdl, w).0, Status::ERR_UNKNOWN);
        let mut w = request(3);
        w.write_typed(&MemId(1));
        assert_eq!(run(&cb, CallbackId::GetHdl, w).0, Status::ERR_UNKNOWN);
    }
}
