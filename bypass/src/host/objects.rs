// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Stable identities for application objects the target refers back to.

use std::collections::HashMap;
use std::sync::Arc;

use mfx_wire::types::BitstreamId;
use mfx_wire::types::SurfaceId;
use mfx_wire::SharedBitstream;
use mfx_wire::SharedSurface;

// Identity of the allocation behind an `Arc`. Registered objects are kept alive by the registry,
// so an address is never reused while it is mapped.
fn key<T>(obj: &Arc<T>) -> usize {
    Arc::as_ptr(obj) as *const () as usize
}

struct Table<Id, T> {
    by_id: HashMap<Id, Arc<T>>,
    by_key: HashMap<usize, Id>,
}

impl<Id, T> Default for Table<Id, T> {
    fn default() -> Self {
        Table {
            by_id: HashMap::new(),
            by_key: HashMap::new(),
        }
    }
}

impl<Id: Copy + Eq + std::hash::Hash, T> Table<Id, T> {
    fn id(&mut self, obj: &Arc<T>, next: impl FnOnce() -> Id) -> Id {
        if let Some(id) = self.by_key.get(&key(obj)) {
            return *id;
        }
        let id = next();
        self.by_key.insert(key(obj), id);
        self.by_id.insert(id, obj.clone());
        id
    }

    fn get(&self, id: Id) -> Option<Arc<T>> {
        self.by_id.get(&id).cloned()
    }

    fn remove(&mut self, obj: &Arc<T>) -> bool {
        match self.by_key.remove(&key(obj)) {
            Some(id) => self.by_id.remove(&id).is_some(),
            None => false,
        }
    }
}

/// Maps surfaces and bitstreams handed to the client to the ids sent on the wire.
#[derive(Default)]
pub struct HostObjects {
    surfaces: Table<SurfaceId, parking_lot::Mutex<mfx_wire::FrameSurface>>,
    bitstreams: Table<BitstreamId, parking_lot::Mutex<mfx_wire::Bitstream>>,
    last_id: u64,
}

impl HostObjects {
    pub fn new() -> HostObjects {
        HostObjects::default()
    }

    fn next_id(last: &mut u64) -> u64 {
        *last += 1;
        *last
    }

    /// Id of `surface`, assigned on first use.
    pub fn surface_id(&mut self, surface: &SharedSurface) -> SurfaceId {
        let last = &mut self.last_id;
        self.surfaces
            .id(surface, || SurfaceId(Self::next_id(last)))
    }

    pub fn surface(&self, id: SurfaceId) -> Option<SharedSurface> {
        self.surfaces.get(id)
    }

    /// Drops the id of a surface the application no longer uses.
    pub fn forget_surface(&mut self, surface: &SharedSurface) -> bool {
        self.surfaces.remove(surface)
    }

    pub fn bitstream_id(&mut self, bitstream: &SharedBitstream) -> BitstreamId {
        let last = &mut self.last_id;
        self.bitstreams
            .id(bitstream, || BitstreamId(Self::next_id(last)))
    }

    pub fn bitstream(&self, id: BitstreamId) -> Option<SharedBitstream> {
        self.bitstreams.get(id)
    }

    pub fn forget_bitstream(&mut self, bitstream: &SharedBitstream) -> bool {
        self.bitstreams.remove(bitstream)
    }
}
