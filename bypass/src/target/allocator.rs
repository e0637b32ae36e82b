// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Frame allocator proxy handed to the codec engine on the target.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::debug;
use log::warn;
use mfx_wire::function::LAST_CALLBACK;
use mfx_wire::param::read_allocated_frames;
use mfx_wire::param::write_allocated_frames;
use mfx_wire::param::AllocatedFrames;
use mfx_wire::surface::read_surface_data;
use mfx_wire::surface::write_surface_data;
use mfx_wire::types::FrameAllocRequest;
use mfx_wire::types::FrameData;
use mfx_wire::types::FrameInfo;
use mfx_wire::types::MemId;
use mfx_wire::types::SessionHandle;
use mfx_wire::CallbackId;
use mfx_wire::FrameSurface;
use mfx_wire::PayloadWriter;
use mfx_wire::Status;
use parking_lot::Mutex;

use crate::dispatcher::Dispatcher;
use crate::dispatcher::Response;
use crate::engine::FrameAllocator;
use crate::session::with_state;
use crate::session::SessionState;
use crate::session::WeakSessionState;
use crate::target::TargetSession;
use crate::Result;

/// Where callback requests go.
pub enum Route {
    /// Interleaved with the reply to the call in flight on the main channel.
    Inplace(Arc<Dispatcher>),
    /// On a sub-channel owned by this allocator.
    Dedicated(Dispatcher),
}

pub struct TargetAllocator {
    session: SessionHandle,
    route: Route,
    state: WeakSessionState<TargetSession>,
    /// VA surface ids forwarded by the host, by memory id.
    handles: Mutex<HashMap<MemId, u32>>,
    closed: AtomicBool,
}

impl TargetAllocator {
    pub fn new(
        session: SessionHandle,
        route: Route,
        state: &SessionState<TargetSession>,
    ) -> TargetAllocator {
        TargetAllocator {
            session,
            route,
            state: Arc::downgrade(state),
            handles: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Tells the host to stop serving this allocator's sub-channel. Later calls do nothing.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Route::Dedicated(d) = &self.route {
            debug!("stopping allocator channel of {:#x}", self.session.0);
            let mut stop = PayloadWriter::new(LAST_CALLBACK);
            stop.write_typed(&self.session);
            if let Err(e) = d.send(&stop) {
                warn!("failed to stop allocator channel: {}", e);
            }
        }
    }

    pub fn handle_count(&self) -> usize {
        self.handles.lock().len()
    }

    pub fn is_dedicated(&self) -> bool {
        matches!(self.route, Route::Dedicated(_))
    }

    /// Records the VA surface id the host reported for `mid`.
    pub fn add_hdl(&self, mid: MemId, hdl: u32) {
        self.handles.lock().insert(mid, hdl);
    }

    fn dispatcher(&self) -> &Dispatcher {
        match &self.route {
            Route::Inplace(d) => d,
            Route::Dedicated(d) => d,
        }
    }

    fn request(&self, id: CallbackId) -> PayloadWriter {
        let mut w = PayloadWriter::new(id as u32);
        w.write_typed(&self.session);
        w
    }

    fn call(&self, request: &PayloadWriter) -> Result<Response> {
        self.dispatcher().execute(request)
    }

    // Format the memory was allocated with: that of the mirror surface bound to it, if any.
    fn original_info(&self, mid: MemId) -> Option<FrameInfo> {
        let state = self.state.upgrade()?;
        let surface = with_state(&state, |s| s.surfaces.find_by_mem_id(mid))?;
        let info = surface.lock().info;
        Some(info)
    }

    fn lock_frame(&self, mid: MemId, surface: &mut FrameSurface) -> Result<Status> {
        let info = self.original_info(mid).unwrap_or(surface.info);
        let mut w = self.request(CallbackId::Lock);
        w.write_typed(&mid);
        w.write_typed(&surface.wire_data());
        w.write_typed(&info);
        let mut r = self.call(&w)?;
        if r.status != Status::NONE {
            return Ok(r.status);
        }
        let data: FrameData = r.args.read_typed()?;
        surface.info = info;
        surface.data = data;
        if data.mapped != 0 {
            surface.map_planes();
            read_surface_data(&mut r.args, surface)?;
        } else {
            surface.unmap_planes();
        }
        Ok(Status::NONE)
    }

    fn unlock_frame(&self, mid: MemId, surface: &mut FrameSurface) -> Result<Status> {
        let mut w = self.request(CallbackId::Unlock);
        w.write_typed(&mid);
        w.write_typed(&surface.info);
        write_surface_data(&mut w, surface)?;
        let r = self.call(&w)?;
        surface.unmap_planes();
        Ok(r.status)
    }
}

impl FrameAllocator for TargetAllocator {
    fn alloc(&self, request: &FrameAllocRequest) -> std::result::Result<AllocatedFrames, Status> {
        let mut w = self.request(CallbackId::Alloc);
        w.write_typed(request);
        let mut r = self.call(&w).map_err(|e| e.status())?;
        if r.status.is_error() {
            return Err(r.status);
        }
        read_allocated_frames(&mut r.args).map_err(|e| e.status())
    }

    fn lock(&self, mid: MemId, surface: &mut FrameSurface) -> Status {
        self.lock_frame(mid, surface).unwrap_or_else(|e| {
            warn!("lock of {:#x} failed: {}", mid.0, e);
            e.status()
        })
    }

    fn unlock(&self, mid: MemId, surface: &mut FrameSurface) -> Status {
        self.unlock_frame(mid, surface).unwrap_or_else(|e| {
            warn!("unlock of {:#x} failed: {}", mid.0, e);
            e.status()
        })
    }

    fn get_hdl(&self, mid: MemId) -> std::result::Result<u32, Status> {
        if !self.is_dedicated() {
            if let Some(hdl) = self.handles.lock().get(&mid) {
                return Ok(*hdl);
            }
        }
        let mut w = self.request(CallbackId::GetHdl);
        w.write_typed(&mid);
        let mut r = self.call(&w).map_err(|e| e.status())?;
        if r.status != Status::NONE {
            return Err(r.status);
        }
        r.args.read_typed::<u32>().map_err(|e| e.status())
    }

    fn free(&self, frames: &AllocatedFrames) -> Status {
        {
            let mut handles = self.handles.lock();
            for mid in &frames.mids {
                handles.remove(mid);
            }
        }
        let mut w = self.request(CallbackId::Free);
        write_allocated_frames(&mut w, frames);
        match self.call(&w) {
            Ok(r) => r.status,
            Err(e) => e.status(),
        }
    }
}

impl Drop for TargetAllocator {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use mfx_wire::status::set_cb_result;
    use mfx_wire::DispatchMode;
    use mfx_wire::PayloadReader;
    use shim_transport::Channel;

    use super::*;
    use crate::session::SessionRegistry;

    const SESSION: SessionHandle = SessionHandle(0x10);

    fn dedicated() -> (TargetAllocator, SessionState<TargetSession>, Channel) {
        let (host, target) = Channel::queue_pair();
        let registry = SessionRegistry::new();
        let state = registry.add(SESSION, TargetSession::new(SESSION, 0));
        let route = Route::Dedicated(Dispatcher::new(target, DispatchMode::Proxy));
        (TargetAllocator::new(SESSION, route, &state), state, host)
    }

    fn next_id(host: &mut Channel) -> u32 {
        PayloadReader::new(host.read_frame().unwrap()).unwrap().id()
    }

    #[test]
    fn free_forgets_handles() {
        let (allocator, _state, mut host) = dedicated();
        allocator.add_hdl(MemId(1), 11);
        allocator.add_hdl(MemId(2), 12);
        host.write_frame(PayloadWriter::new(set_cb_result(Status::NONE)).as_bytes())
            .unwrap();

        let frames = AllocatedFrames::new(1, 0, vec![MemId(1)]);
        assert_eq!(allocator.free(&frames), Status::NONE);
        assert_eq!(allocator.handle_count(), 1);
        assert_eq!(next_id(&mut host), CallbackId::Free as u32);
    }

    #[test]
    fn close_stops_channel_once() {
        let (allocator, _state, mut host) = dedicated();
        let allocator = Arc::new(allocator);
        let engine_ref = allocator.clone();

        allocator.close();
        assert_eq!(next_id(&mut host), LAST_CALLBACK);
        allocator.close();
        drop(allocator);
        drop(engine_ref);
        // The channel is gone and nothing else was sent on it.
        assert!(host.read_frame().is_err());
    }

    #[test]
    fn drop_stops_unclosed_channel() {
        let (allocator, _state, mut host) = dedicated();
        drop(allocator);
        assert_eq!(next_id(&mut host), LAST_CALLBACK);
        assert!(host.read_frame().is_err());
    }
}
