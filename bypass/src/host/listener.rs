// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Host thread serving allocator callbacks sent on a dedicated sub-channel.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;

use log::debug;
use log::error;
use log::warn;
use mfx_wire::function::LAST_CALLBACK;
use mfx_wire::types::SessionHandle;
use mfx_wire::CallbackId;
use mfx_wire::PayloadReader;
use shim_transport::Channel;

use crate::dispatcher::callback_reply;
use crate::dispatcher::CallbackHandler;

/// Owns the thread answering callbacks for one session.
///
/// The thread exits when the target sends the stop frame, when the channel fails, or after the
/// next callback once a stop was requested.
pub struct AllocatorListener {
    session: SessionHandle,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl AllocatorListener {
    pub fn start(
        session: SessionHandle,
        channel: Channel,
        handler: Arc<dyn CallbackHandler>,
    ) -> std::io::Result<AllocatorListener> {
        let stop = Arc::new(AtomicBool::new(false));
        let worker = {
            let stop = stop.clone();
            thread::Builder::new()
                .name(format!("allocator {:#x}", session.0))
                .spawn(move || serve(channel, handler.as_ref(), &stop))?
        };
        debug!("allocator listener started for session {:#x}", session.0);
        Ok(AllocatorListener {
            session,
            stop,
            worker: Some(worker),
        })
    }

    pub fn is_finished(&self) -> bool {
        self.worker.as_ref().map_or(true, |w| w.is_finished())
    }

    /// Waits for the thread to exit. Only call once the target has sent, or is about to send,
    /// the stop frame.
    pub fn join(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("allocator listener for {:#x} panicked", self.session.0);
            }
        }
    }
}

impl Drop for AllocatorListener {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        match self.worker.take() {
            Some(worker) if worker.is_finished() => {
                let _ = worker.join();
            }
            // Still blocked on the channel; it exits on its own when the peer goes away.
            Some(_) => debug!("detaching allocator listener for {:#x}", self.session.0),
            None => {}
        }
    }
}

fn serve(mut channel: Channel, handler: &dyn CallbackHandler, stop: &AtomicBool) {
    loop {
        let frame = match channel.read_frame() {
            Ok(frame) => frame,
            Err(e) => {
                debug!("allocator channel closed: {}", e);
                return;
            }
        };
        let mut args = match PayloadReader::new(frame) {
            Ok(args) => args,
            Err(e) => {
                warn!("dropping malformed callback frame: {}", e);
                continue;
            }
        };
        if args.id() == LAST_CALLBACK {
            debug!("allocator channel stopped by the target");
            return;
        }
        let id = match CallbackId::from_raw(args.id()) {
            Some(id) => id,
            None => {
                warn!("ignoring frame {} on the allocator channel", args.id());
                continue;
            }
        };
        let reply = callback_reply(handler, id, &mut args);
        if let Err(e) = channel.write_frame(reply.as_bytes()) {
            error!("failed to answer callback {:?}: {}", id, e);
            return;
        }
        if stop.load(Ordering::SeqCst) {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use mfx_wire::status::cb_result;
    use mfx_wire::PayloadWriter;
    use mfx_wire::Status;

    use super::*;

    #[derive(Default)]
    struct Counter(AtomicUsize);

    impl CallbackHandler for Counter {
        fn execute_callback(
            &self,
            _id: CallbackId,
            _args: &mut PayloadReader,
            reply: &mut PayloadWriter,
        ) -> Status {
            let n = self.0.fetch_add(1, Ordering::SeqCst) as u32;
            reply.write_typed(&n);
            Status::NONE
        }
    }

    #[test]
    fn serves_until_stop_frame() {
        let (host, mut target) = Channel::queue_pair();
        let counter = Arc::new(Counter::default());
        let listener = AllocatorListener::start(SessionHandle(3), host, counter.clone()).unwrap();

        // Unknown ids get no answer.
        target.write_frame(PayloadWriter::new(1003).as_bytes()).unwrap();
        for expected in 0..2u32 {
            let request = PayloadWriter::new(CallbackId::GetHdl as u32);
            target.write_frame(request.as_bytes()).unwrap();
            let mut reply = PayloadReader::new(target.read_frame().unwrap()).unwrap();
            assert_eq!(cb_result(reply.id()), Status::NONE);
            assert_eq!(reply.read_typed::<u32>().unwrap(), expected);
        }

        target.write_frame(PayloadWriter::new(LAST_CALLBACK).as_bytes()).unwrap();
        listener.join();
        assert_eq!(counter.0.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn exits_when_channel_drops() {
        let (host, target) = Channel::queue_pair();
        let listener =
            AllocatorListener::start(SessionHandle(4), host, Arc::new(Counter::default())).unwrap();
        drop(target);
        listener.join();
    }
}
