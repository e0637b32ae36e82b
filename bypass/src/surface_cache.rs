// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Target-side mirrors of host surfaces.
//!
//! Every host surface referenced by a decode or encode call is bound to a mirror surface owned by
//! the target. The codec engine locks and unlocks mirrors; changes of their lock counts are
//! reported back to the host after each call so the host's surfaces follow.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::debug;
use log::warn;
use mfx_wire::param::LockDelta;
use mfx_wire::surface::frame_size;
use mfx_wire::surface::SurfaceDescriptor;
use mfx_wire::types::MemId;
use mfx_wire::types::SurfaceId;
use mfx_wire::FrameSurface;
use mfx_wire::SharedSurface;
use mfx_wire::Status;

pub struct SurfaceEntry {
    pub host: SurfaceId,
    pub surface: SharedSurface,
    /// Not referenced by the engine; the next use snapshots the host's lock count.
    pub is_free: bool,
    pub was_output: bool,
    /// Lock count last reported to the host.
    pub prev_locked: u16,
    /// FourCC, width and height the plane storage was sized for.
    planes_format: Option<(u32, u16, u16)>,
    /// Plane storage kept while the host surface is unmapped.
    spare: Option<Vec<u8>>,
}

impl SurfaceEntry {
    fn new(host: SurfaceId) -> SurfaceEntry {
        SurfaceEntry {
            host,
            surface: FrameSurface::default().into_shared(),
            is_free: true,
            was_output: false,
            prev_locked: 0,
            planes_format: None,
            spare: None,
        }
    }

    fn reset(&mut self) {
        self.is_free = true;
        self.was_output = false;
        self.prev_locked = 0;
    }

    fn update_state(&mut self) {
        if self.prev_locked == 0 && self.surface.lock().data.locked == 0 {
            self.reset();
        }
    }
}

#[derive(Default)]
pub struct SurfaceCache {
    entries: BTreeMap<SurfaceId, SurfaceEntry>,
}

impl SurfaceCache {
    pub fn new() -> SurfaceCache {
        SurfaceCache::default()
    }

    /// Binds the host surface described by `desc` to its mirror, creating the mirror on first use.
    ///
    /// The mirror takes the host's format and frame attributes. Plane storage is allocated when
    /// the host surface is mapped and the mirror has none yet or had a different
    /// FourCC/width/height. An unmapped host surface unmaps the mirror but keeps its storage for
    /// the next mapped use. A mapped frame larger than `limit` bytes fails with
    /// `ERR_MEMORY_ALLOC` and leaves the cache untouched.
    pub fn add_entry(
        &mut self,
        desc: &SurfaceDescriptor,
        limit: usize,
    ) -> Result<SharedSurface, Status> {
        let size = frame_size(&desc.info, desc.data.pitch());
        if desc.is_mapped() && size > limit {
            warn!(
                "surface {:#x}: {} byte frame exceeds {} bytes",
                desc.id.0, size, limit
            );
            return Err(Status::ERR_MEMORY_ALLOC);
        }

        let entry = self
            .entries
            .entry(desc.id)
            .or_insert_with(|| SurfaceEntry::new(desc.id));
        let mut s = entry.surface.lock();

        s.info = desc.info;
        s.data.data_flag = desc.data.data_flag;
        s.data.mem_id = desc.data.mem_id;
        s.data.pitch_high = desc.data.pitch_high;
        s.data.pitch_low = desc.data.pitch_low;
        s.data.time_stamp = desc.data.time_stamp;
        s.data.frame_order = desc.data.frame_order;
        s.data.corrupted = desc.data.corrupted;

        if entry.is_free {
            s.data.locked = desc.data.locked;
            entry.prev_locked = s.data.locked;
            entry.is_free = false;
        }
        s.ext_param = None;

        if desc.is_mapped() {
            if s.planes.is_none() {
                s.planes = entry.spare.take();
            }
            let format = (desc.info.fourcc, desc.info.width, desc.info.height);
            if entry.planes_format == Some(format) {
                if let Some(planes) = s.planes.as_mut() {
                    planes.resize(size, 0);
                }
            }
            if s.planes.is_none() || entry.planes_format != Some(format) {
                debug!(
                    "surface {:#x}: allocating {}x{} planes",
                    desc.id.0, desc.info.width, desc.info.height
                );
                s.planes = Some(vec![0; size]);
                entry.planes_format = Some(format);
            }
            s.data.mapped = 1;
        } else {
            if let Some(planes) = s.planes.take() {
                entry.spare = Some(planes);
            }
            s.data.mapped = 0;
        }
        drop(s);
        Ok(entry.surface.clone())
    }

    pub fn entry(&self, host: SurfaceId) -> Option<&SurfaceEntry> {
        self.entries.get(&host)
    }

    pub fn entry_mut(&mut self, host: SurfaceId) -> Option<&mut SurfaceEntry> {
        self.entries.get_mut(&host)
    }

    pub fn find_target(&self, host: SurfaceId) -> Option<SharedSurface> {
        self.entries.get(&host).map(|e| e.surface.clone())
    }

    pub fn find_host(&self, target: &SharedSurface) -> Option<SurfaceId> {
        self.entries
            .values()
            .find(|e| Arc::ptr_eq(&e.surface, target))
            .map(|e| e.host)
    }

    pub fn find_by_mem_id(&self, mid: MemId) -> Option<SharedSurface> {
        self.entries
            .values()
            .find(|e| e.surface.lock().data.mem_id == mid)
            .map(|e| e.surface.clone())
    }

    /// Collects lock count changes since the last report, one record per changed surface.
    pub fn lock_deltas(&mut self) -> Vec<LockDelta> {
        let mut deltas = Vec::new();
        for entry in self.entries.values_mut() {
            entry.update_state();
            if entry.is_free {
                continue;
            }
            let locked = entry.surface.lock().data.locked;
            if locked == entry.prev_locked {
                continue;
            }
            let increment = entry.prev_locked < locked;
            entry.prev_locked = locked;
            entry.update_state();
            deltas.push(LockDelta {
                surface: entry.host,
                increment,
            });
        }
        deltas
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
