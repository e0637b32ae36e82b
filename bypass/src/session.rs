// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-session state keyed by the opaque session handle.
//!
//! Each session is guarded by its own reentrant lock: allocator callbacks may run on another
//! thread while a call on the same session is in flight, and on the calling thread they nest
//! inside it. Borrows of the inner `RefCell` must not be held across calls that can re-enter.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Weak;

use mfx_wire::types::SessionHandle;
use parking_lot::Mutex;
use parking_lot::ReentrantMutex;

pub type SessionState<S> = Arc<ReentrantMutex<RefCell<S>>>;
pub type WeakSessionState<S> = Weak<ReentrantMutex<RefCell<S>>>;

/// Runs `f` with exclusive access to the session state.
pub fn with_state<S, R, F>(state: &SessionState<S>, f: F) -> R
where
    F: FnOnce(&mut S) -> R,
{
    let guard = state.lock();
    let mut s = guard.borrow_mut();
    f(&mut s)
}

pub struct SessionRegistry<S> {
    sessions: Mutex<HashMap<SessionHandle, SessionState<S>>>,
}

impl<S> Default for SessionRegistry<S> {
    fn default() -> Self {
        SessionRegistry {
            sessions: Mutex::new(HashMap::new()),
        }
    }
}

impl<S> SessionRegistry<S> {
    pub fn new() -> SessionRegistry<S> {
        SessionRegistry::default()
    }

    /// Registers `state` under `handle`, replacing any previous state.
    pub fn add(&self, handle: SessionHandle, state: S) -> SessionState<S> {
        let state = Arc::new(ReentrantMutex::new(RefCell::new(state)));
        self.sessions.lock().insert(handle, state.clone());
        state
    }

    pub fn get(&self, handle: SessionHandle) -> Option<SessionState<S>> {
        self.sessions.lock().get(&handle).cloned()
    }

    pub fn remove(&self, handle: SessionHandle) -> Option<SessionState<S>> {
        self.sessions.lock().remove(&handle)
    }

    pub fn contains(&self, handle: SessionHandle) -> bool {
        self.sessions.lock().contains_key(&handle)
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// Drops every session.
    pub fn clear(&self) {
        drop(self.drain());
    }

    /// Unregisters every session and hands their states to the caller.
    pub fn drain(&self) -> Vec<SessionState<S>> {
        // Take the map out first so session destructors run without the registry lock.
        let sessions = std::mem::take(&mut *self.sessions.lock());
        sessions.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_get_remove() {
        let registry = SessionRegistry::new();
        let h = SessionHandle(0x10);
        registry.add(h, 5u32);
        assert!(registry.contains(h));
        assert_eq!(registry.len(), 1);

        let state = registry.get(h).unwrap();
        with_state(&state, |v| *v += 1);
        assert_eq!(*registry.get(h).unwrap().lock().borrow(), 6);

        assert!(registry.remove(h).is_some());
        assert!(registry.get(h).is_none());
        assert!(registry.is_empty());
        // Handles outliving the registry entry stay usable.
        assert_eq!(with_state(&state, |v| *v), 6);
    }

    #[test]
    fn drain_empties_registry() {
        let registry = SessionRegistry::new();
        registry.add(SessionHandle(1), 1u32);
        registry.add(SessionHandle(2), 2u32);
        let mut values: Vec<u32> = registry.drain().iter().map(|s| with_state(s, |v| *v)).collect();
        values.sort();
        assert_eq!(values, vec![1, 2]);
        assert!(registry.is_empty());
    }

    #[test]
    fn lock_is_reentrant() {
        let registry = SessionRegistry::new();
        let state = registry.add(SessionHandle(1), Vec::<u32>::new());
        let outer = state.lock();
        with_state(&state, |v| v.push(1));
        drop(outer);
        assert_eq!(with_state(&state, |v| v.len()), 1);
    }
}
