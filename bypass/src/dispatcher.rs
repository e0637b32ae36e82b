// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Synchronous request/response over a [`Channel`], with callback re-entrancy.
//!
//! A call writes one request frame and then reads frames until one carries a terminal status.
//! Frames carrying a callback request are handed to the registered [`CallbackHandler`] and its
//! reply is written back before waiting resumes. The channel lock is reentrant and held for the
//! whole call, so a handler may issue nested calls on the same dispatcher from the same thread.

use std::cell::RefCell;
use std::sync::Arc;

use log::debug;
use mfx_wire::status::set_cb_result;
use mfx_wire::CallbackId;
use mfx_wire::DispatchMode;
use mfx_wire::PayloadReader;
use mfx_wire::PayloadWriter;
use mfx_wire::Status;
use mfx_wire::WireStatus;
use parking_lot::ReentrantMutex;
use parking_lot::ReentrantMutexGuard;
use shim_transport::Channel;

use crate::Error;
use crate::Result;

/// Runs allocator callbacks requested by the peer.
pub trait CallbackHandler: Send + Sync {
    /// Executes callback `id` with the arguments in `args`, writing its results to `reply`.
    /// The returned status becomes the status of the reply.
    fn execute_callback(
        &self,
        id: CallbackId,
        args: &mut PayloadReader,
        reply: &mut PayloadWriter,
    ) -> Status;
}

/// Executes VA driver requests sent by a hardware target.
pub trait VaExecutor: Send + Sync {
    /// Runs VA function `function` whose request frame is `request` and returns the complete
    /// reply frame.
    fn execute_va(&self, function: u32, request: &[u8]) -> Result<Vec<u8>>;
}

/// Builds the reply to a callback request. The status is flagged so the peer can't mistake it
/// for a new request.
pub fn callback_reply(
    handler: &dyn CallbackHandler,
    id: CallbackId,
    args: &mut PayloadReader,
) -> PayloadWriter {
    let mut reply = PayloadWriter::new(0);
    let status = handler.execute_callback(id, args, &mut reply);
    debug!("callback {:?}: {}", id, status);
    reply.set_id(set_cb_result(status));
    reply
}

/// Terminal response of a call.
#[derive(Debug)]
pub struct Response {
    pub status: Status,
    /// The response frame, positioned after its header.
    pub args: PayloadReader,
}

pub struct Dispatcher {
    channel: ReentrantMutex<RefCell<Channel>>,
    mode: DispatchMode,
    callbacks: Option<Arc<dyn CallbackHandler>>,
    va: Option<Arc<dyn VaExecutor>>,
}

impl Dispatcher {
    pub fn new(channel: Channel, mode: DispatchMode) -> Dispatcher {
        Dispatcher {
            channel: ReentrantMutex::new(RefCell::new(channel)),
            mode,
            callbacks: None,
            va: None,
        }
    }

    pub fn with_callbacks(mut self, handler: Arc<dyn CallbackHandler>) -> Dispatcher {
        self.callbacks = Some(handler);
        self
    }

    pub fn with_va_executor(mut self, executor: Arc<dyn VaExecutor>) -> Dispatcher {
        self.va = Some(executor);
        self
    }

    pub fn mode(&self) -> DispatchMode {
        self.mode
    }

    /// Sends `request` and waits for its terminal response, serving callbacks meanwhile.
    pub fn execute(&self, request: &PayloadWriter) -> Result<Response> {
        self.execute_with(request, || Ok(()))
    }

    /// Like [`execute`](Self::execute), running `after_send` once the request is out and before
    /// waiting for the response. The channel stays locked in between.
    pub fn execute_with<F>(&self, request: &PayloadWriter, after_send: F) -> Result<Response>
    where
        F: FnOnce() -> Result<()>,
    {
        let guard = self.channel.lock();
        debug!("request {} ({} bytes)", request.id(), request.len());
        guard.borrow_mut().write_frame(request.as_bytes())?;
        after_send()?;
        self.wait_response(&guard)
    }

    fn wait_response(&self, guard: &ReentrantMutexGuard<RefCell<Channel>>) -> Result<Response> {
        loop {
            let frame = guard.borrow_mut().read_frame()?;
            let mut args = PayloadReader::new(frame)?;
            match WireStatus::decode(args.id(), self.mode) {
                WireStatus::CallbackRequest(id) => {
                    let handler = self
                        .callbacks
                        .as_deref()
                        .ok_or(Error::UnsupportedCallback(id as u32))?;
                    let reply = callback_reply(handler, id, &mut args);
                    guard.borrow_mut().write_frame(reply.as_bytes())?;
                }
                WireStatus::VaRequest(function) => {
                    let va = self
                        .va
                        .as_deref()
                        .ok_or(Error::UnsupportedCallback(function))?;
                    let reply = va.execute_va(function, &args.into_bytes())?;
                    guard.borrow_mut().write_frame(&reply)?;
                }
                wire => {
                    return Ok(Response {
                        status: wire.status(),
                        args,
                    })
                }
            }
        }
    }

    /// Reads the next request on the serving side of the channel.
    pub fn read_request(&self) -> Result<PayloadReader> {
        let guard = self.channel.lock();
        let frame = guard.borrow_mut().read_frame()?;
        Ok(PayloadReader::new(frame)?)
    }

    /// Writes a frame that expects no response.
    pub fn send(&self, frame: &PayloadWriter) -> Result<()> {
        let guard = self.channel.lock();
        guard.borrow_mut().write_frame(frame.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::sync::Weak;
    use std::thread;

    use mfx_wire::status::CB_RESULT_FLAG;
    use parking_lot::Mutex;

    use super::*;

    fn read(ch: &mut Channel) -> PayloadReader {
        PayloadReader::new(ch.read_frame().unwrap()).unwrap()
    }

    #[derive(Default)]
    struct Counting {
        calls: AtomicUsize,
        nested: Mutex<Option<Weak<Dispatcher>>>,
    }

    impl CallbackHandler for Counting {
        fn execute_callback(
            &self,
            id: CallbackId,
            args: &mut PayloadReader,
            reply: &mut PayloadWriter,
        ) -> Status {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert_eq!(id, CallbackId::GetHdl);
            let mid: u64 = args.read_typed().unwrap();
            let nested = self.nested.lock().as_ref().and_then(Weak::upgrade);
            if let Some(d) = nested {
                let r = d.execute(&PayloadWriter::new(1003)).unwrap();
                assert_eq!(r.status, Status::NONE);
            }
            reply.write_typed(&(mid as u32 + 1));
            Status::NONE
        }
    }

    #[test]
    fn callback_runs_inside_the_call() {
        let (host, mut target) = Channel::queue_pair();
        let handler = Arc::new(Counting::default());
        let d = Dispatcher::new(host, DispatchMode::Proxy).with_callbacks(handler.clone());

        let peer = thread::spawn(move || {
            assert_eq!(read(&mut target).id(), 1026);
            let mut cb = PayloadWriter::new(CallbackId::GetHdl as u32);
            cb.write_typed(&41u64);
            target.write_frame(cb.as_bytes()).unwrap();

            let mut reply = read(&mut target);
            assert_eq!(reply.id(), CB_RESULT_FLAG);
            assert_eq!(reply.read_typed::<u32>().unwrap(), 42);

            let mut done = PayloadWriter::new(0);
            done.write_typed(&7u64);
            target.write_frame(done.as_bytes()).unwrap();
        });

        let mut r = d.execute(&PayloadWriter::new(1026)).unwrap();
        assert_eq!(r.status, Status::NONE);
        assert_eq!(r.args.read_typed::<u64>().unwrap(), 7);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        peer.join().unwrap();
    }

    #[test]
    fn nested_call_from_callback() {
        let (host, mut target) = Channel::queue_pair();
        let handler = Arc::new(Counting::default());
        let d = Arc::new(
            Dispatcher::new(host, DispatchMode::Proxy).with_callbacks(handler.clone()),
        );
        *handler.nested.lock() = Some(Arc::downgrade(&d));

        let peer = thread::spawn(move || {
            read(&mut target);
            let mut cb = PayloadWriter::new(CallbackId::GetHdl as u32);
            cb.write_typed(&1u64);
            target.write_frame(cb.as_bytes()).unwrap();
            // The handler's own request arrives before its reply.
            assert_eq!(read(&mut target).id(), 1003);
            target.write_frame(PayloadWriter::new(0).as_bytes()).unwrap();
            assert_eq!(read(&mut target).id(), CB_RESULT_FLAG);
            let mut last = PayloadWriter::new(0);
            last.set_status(Status::WRN_DEVICE_BUSY);
            target.write_frame(last.as_bytes()).unwrap();
        });

        let r = d.execute(&PayloadWriter::new(1035)).unwrap();
        assert_eq!(r.status, Status::WRN_DEVICE_BUSY);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        peer.join().unwrap();
    }

    #[test]
    fn unhandled_callback_fails_the_call() {
        let (host, mut target) = Channel::queue_pair();
        let d = Dispatcher::new(host, DispatchMode::Proxy);
        let peer = thread::spawn(move || {
            read(&mut target);
            target
                .write_frame(PayloadWriter::new(CallbackId::Alloc as u32).as_bytes())
                .unwrap();
        });
        let err = d.execute(&PayloadWriter::new(1019)).unwrap_err();
        assert!(matches!(err, Error::UnsupportedCallback(1100)));
        assert_eq!(err.status(), Status::ERR_UNKNOWN);
        peer.join().unwrap();
    }

    struct Va;

    impl VaExecutor for Va {
        fn execute_va(&self, function: u32, request: &[u8]) -> Result<Vec<u8>> {
            let mut reply = PayloadWriter::new(0);
            reply.write_typed(&function);
            reply.write_typed(&(request.len() as u32));
            Ok(reply.into_bytes())
        }
    }

    #[test]
    fn hardware_target_serves_va_requests() {
        let (host, mut target) = Channel::queue_pair();
        let d = Dispatcher::new(host, DispatchMode::HardwareTarget).with_va_executor(Arc::new(Va));
        let peer = thread::spawn(move || {
            read(&mut target);
            let mut va = PayloadWriter::new(12);
            va.write(&[0; 4]);
            target.write_frame(va.as_bytes()).unwrap();
            let mut reply = read(&mut target);
            assert_eq!(reply.read_typed::<u32>().unwrap(), 12);
            assert_eq!(reply.read_typed::<u32>().unwrap(), 12);
            let done = PayloadWriter::new(DispatchMode::HardwareTarget.final_status(Status::NONE));
            target.write_frame(done.as_bytes()).unwrap();
        });
        assert_eq!(d.execute(&PayloadWriter::new(1009)).unwrap().status, Status::NONE);
        peer.join().unwrap();
    }

    #[test]
    fn transport_failure_surfaces_as_unknown() {
        let (host, target) = Channel::queue_pair();
        drop(target);
        let d = Dispatcher::new(host, DispatchMode::Proxy);
        let err = d.execute(&PayloadWriter::new(1001)).unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        assert_eq!(err.status(), Status::ERR_UNKNOWN);
    }
}
