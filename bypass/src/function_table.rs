// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Flat dispatch tables indexed by wire id.

use mfx_wire::function::FIRST_CALLBACK;
use mfx_wire::function::FIRST_FUNCTION;
use mfx_wire::function::LAST_CALLBACK;
use mfx_wire::function::LAST_FUNCTION;
use mfx_wire::CallbackId;
use mfx_wire::FunctionId;

/// Handlers for the dense id range `[first, last)`. Slots without a handler stay empty.
pub struct FunctionTable<H: Copy> {
    first: u32,
    handlers: Vec<Option<H>>,
}

impl<H: Copy> FunctionTable<H> {
    pub fn new(first: u32, last: u32) -> FunctionTable<H> {
        FunctionTable {
            first,
            handlers: vec![None; last.saturating_sub(first) as usize],
        }
    }

    /// A table covering every codec function.
    pub fn for_functions() -> FunctionTable<H> {
        FunctionTable::new(FIRST_FUNCTION, LAST_FUNCTION)
    }

    /// A table covering every allocator callback.
    pub fn for_callbacks() -> FunctionTable<H> {
        FunctionTable::new(FIRST_CALLBACK, LAST_CALLBACK)
    }

    pub fn with_function(mut self, id: FunctionId, handler: H) -> FunctionTable<H> {
        self.set(id as u32, handler);
        self
    }

    pub fn with_callback(mut self, id: CallbackId, handler: H) -> FunctionTable<H> {
        self.set(id as u32, handler);
        self
    }

    fn set(&mut self, id: u32, handler: H) {
        if let Some(slot) = id
            .checked_sub(self.first)
            .and_then(|i| self.handlers.get_mut(i as usize))
        {
            *slot = Some(handler);
        }
    }

    /// Looks up the handler for `id`. `None` for ids outside the table and for empty slots.
    pub fn get(&self, id: u32) -> Option<H> {
        let index = id.checked_sub(self.first)? as usize;
        self.handlers.get(index).copied().flatten()
    }

    /// Number of slots with a handler.
    pub fn handled(&self) -> usize {
        self.handlers.iter().filter(|h| h.is_some()).count()
    }
}
