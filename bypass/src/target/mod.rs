// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Target side: serves codec calls from the host against a [`CodecEngine`].
//!
//! Requests are read from the main channel one at a time. Each is dispatched through a flat
//! table to a handler that unmarshals the arguments, runs the engine and marshals the results
//! into the reply. A handler that fails to parse or marshal its frame replies with the status of
//! the error and no payload.

mod allocator;
mod handlers;

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;

use log::debug;
use log::info;
use log::warn;
use mfx_wire::param::VideoParam;
use mfx_wire::types::BitstreamId;
use mfx_wire::types::IoPattern;
use mfx_wire::types::SessionHandle;
use mfx_wire::types::SurfaceId;
use mfx_wire::types::SyncPoint;
use mfx_wire::BitstreamCache;
use mfx_wire::ExtBufferRegistry;
use mfx_wire::PayloadReader;
use mfx_wire::PayloadWriter;
use mfx_wire::SharedBitstream;
use mfx_wire::Status;
use shim_transport::Fabric;

pub use self::allocator::Route;
pub use self::allocator::TargetAllocator;
use crate::dispatcher::Dispatcher;
use crate::engine::CodecEngine;
use crate::function_table::FunctionTable;
use crate::session::with_state;
use crate::session::SessionRegistry;
use crate::session::SessionState;
use crate::surface_cache::SurfaceCache;
use crate::CallbackDelivery;
use crate::Error;
use crate::Result;

/// What a sync point completes.
#[derive(Clone)]
pub enum SyncTag {
    /// A decoded frame in the host surface.
    Surface(SurfaceId),
    /// Encoder output for the host bitstream.
    Bitstream {
        host: BitstreamId,
        bitstream: SharedBitstream,
    },
}

/// Target state of one session.
pub struct TargetSession {
    pub handle: SessionHandle,
    pub implementation: u32,
    pub parent: Option<SessionHandle>,
    pub children: BTreeSet<SessionHandle>,
    pub allocator: Option<Arc<TargetAllocator>>,
    pub decoder_param: Option<VideoParam>,
    pub encoder_io_pattern: IoPattern,
    pub bs_cache: BitstreamCache,
    pub surfaces: SurfaceCache,
    pub syncs: HashMap<SyncPoint, SyncTag>,
    /// Display handle the host attached with `SetHandle`.
    pub display: Option<u64>,
}

impl TargetSession {
    pub fn new(handle: SessionHandle, implementation: u32) -> TargetSession {
        TargetSession {
            handle,
            implementation,
            parent: None,
            children: BTreeSet::new(),
            allocator: None,
            decoder_param: None,
            encoder_io_pattern: IoPattern::empty(),
            bs_cache: BitstreamCache::new(),
            surfaces: SurfaceCache::new(),
            syncs: HashMap::new(),
            display: None,
        }
    }

    pub fn decoder_io_pattern(&self) -> IoPattern {
        self.decoder_param
            .as_ref()
            .map_or(IoPattern::empty(), |p| p.io_pattern())
    }
}

type Handler = fn(&mut TargetServer, &mut PayloadReader, &mut PayloadWriter) -> Result<Status>;

pub struct TargetServer {
    dispatcher: Arc<Dispatcher>,
    fabric: Option<Arc<dyn Fabric>>,
    engine: Box<dyn CodecEngine>,
    sessions: SessionRegistry<TargetSession>,
    registry: ExtBufferRegistry,
    delivery: CallbackDelivery,
    /// Display handle of the device the sessions run on, set by the first `SetHandle`.
    hw_device: Option<u64>,
    terminated: bool,
    table: FunctionTable<Handler>,
}

impl TargetServer {
    pub fn new(dispatcher: Dispatcher, engine: Box<dyn CodecEngine>) -> TargetServer {
        TargetServer {
            dispatcher: Arc::new(dispatcher),
            fabric: None,
            engine,
            sessions: SessionRegistry::new(),
            registry: ExtBufferRegistry::default(),
            delivery: CallbackDelivery::default(),
            hw_device: None,
            terminated: false,
            table: handlers::table(),
        }
    }

    /// Fabric on which dedicated allocator channels are accepted.
    pub fn with_fabric(mut self, fabric: Arc<dyn Fabric>) -> TargetServer {
        self.fabric = Some(fabric);
        self
    }

    pub fn with_delivery(mut self, delivery: CallbackDelivery) -> TargetServer {
        self.delivery = delivery;
        self
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn session(&self, handle: SessionHandle) -> Option<SessionState<TargetSession>> {
        self.sessions.get(handle)
    }

    pub fn hw_device(&self) -> Option<u64> {
        self.hw_device
    }

    /// Serves requests until the host disconnects or terminates the proxy.
    pub fn serve(&mut self) -> Result<()> {
        while !self.terminated {
            let mut request = match self.dispatcher.read_request() {
                Ok(r) => r,
                Err(Error::Transport(shim_transport::Error::Disconnect)) => {
                    info!("host disconnected");
                    break;
                }
                Err(e) => return Err(e),
            };
            let reply = self.handle_request(&mut request);
            self.dispatcher.send(&reply)?;
        }
        for state in self.sessions.drain() {
            if let Some(allocator) = with_state(&state, |s| s.allocator.take()) {
                allocator.close();
            }
        }
        Ok(())
    }

    /// Runs one request and builds its reply.
    pub fn handle_request(&mut self, request: &mut PayloadReader) -> PayloadWriter {
        let id = request.id();
        let mut reply = PayloadWriter::new(0);
        let status = match self.table.get(id) {
            Some(handler) => match handler(self, request, &mut reply) {
                Ok(status) => status,
                Err(e) => {
                    warn!("function {} failed: {}", id, e);
                    reply.clear();
                    e.status()
                }
            },
            None => {
                let e = Error::UnsupportedOperation(id);
                warn!("{}", e);
                e.status()
            }
        };
        debug!("function {}: {}", id, status);
        reply.set_id(self.dispatcher.mode().final_status(status));
        reply
    }
}
