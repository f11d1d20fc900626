//! The worker thread and the cross-thread callback bridge.
//!
//! In threaded mode the event loop runs on a dedicated worker; backend
//! callbacks whose handler lives on another thread are converted into
//! typed messages. One byte per message lands in the notify pipe, whose
//! read end is the display fd handed to the compositor; draining it on the
//! client thread resolves each message's stamp against the registry and
//! runs the handler there. A second pipe (the waker) prods the worker's
//! poll for shutdown and for tasks posted to the loop thread.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::JoinHandle;

use std::os::fd::OwnedFd;

use crate::buffer::Surface;
use crate::debug::DebugFlags;
use crate::display::{self, Shared, Tid};
use crate::error::{Error, Result};
use crate::types::ConnStatus;

/// A backend callback crossing from the loop thread to its owner thread.
pub(crate) enum ThreadMessage {
    OutputCommit { output: u64, token: u64, sequence: u32, tv_sec: u64, tv_usec: u64 },
    OutputVblank { output: u64, token: u64, sequence: u32, tv_sec: u64, tv_usec: u64 },
    OutputStatus { output: u64, status: ConnStatus },
    PpDone { pp: u64, src: Surface, dst: Surface },
    CaptureDone { capture: u64, buffer: Surface },
    /// A ready-to-run engine callback whose owner is the client thread.
    Invoke(crate::display::Deferred),
}

impl ThreadMessage {
    fn kind(&self) -> &'static str {
        match self {
            ThreadMessage::OutputCommit { .. } => "output_commit",
            ThreadMessage::OutputVblank { .. } => "output_vblank",
            ThreadMessage::OutputStatus { .. } => "output_status",
            ThreadMessage::PpDone { .. } => "pp_done",
            ThreadMessage::CaptureDone { .. } => "capture_done",
            ThreadMessage::Invoke(_) => "invoke",
        }
    }
}

pub(crate) struct Bridge {
    pub threaded: bool,
    tx: mpsc::Sender<ThreadMessage>,
    rx: Mutex<mpsc::Receiver<ThreadMessage>>,
    /// Read end is the public display fd in threaded mode.
    pub notify_read: OwnedFd,
    notify_write: OwnedFd,
    /// Wakes the worker's poll; registered as a loop source.
    pub waker_read: OwnedFd,
    waker_write: OwnedFd,
    /// Thread that initialized the display; user handlers land here.
    pub display_tid: Tid,
    /// Thread running the loop. Equal to `display_tid` when unthreaded.
    pub loop_tid: AtomicI32,
    pub quit: AtomicBool,
    pub worker: Mutex<Option<JoinHandle<()>>>,
}

impl Bridge {
    pub fn new(threaded: bool) -> Result<Bridge> {
        let flags = rustix::pipe::PipeFlags::CLOEXEC | rustix::pipe::PipeFlags::NONBLOCK;
        let (notify_read, notify_write) = rustix::pipe::pipe_with(flags)?;
        let (waker_read, waker_write) = rustix::pipe::pipe_with(flags)?;
        let tid = display::current_tid();
        let (tx, rx) = mpsc::channel();

        Ok(Bridge {
            threaded,
            tx,
            rx: Mutex::new(rx),
            notify_read,
            notify_write,
            waker_read,
            waker_write,
            display_tid: tid,
            loop_tid: AtomicI32::new(tid),
            quit: AtomicBool::new(false),
            worker: Mutex::new(None),
        })
    }

    /// Whether `tid` counts as the display (client) thread for handler
    /// bucketing. Without a worker every thread shares the loop, so yes.
    pub fn is_display_thread(&self, tid: Tid) -> bool {
        !self.threaded || tid == self.display_tid
    }

    pub fn in_loop_thread(&self) -> bool {
        !self.threaded || display::current_tid() == self.loop_tid.load(Ordering::Relaxed)
    }

    /// Queue a message for the client thread and ring the notify pipe.
    pub fn send(&self, message: ThreadMessage, debug: bool) -> Result<()> {
        if debug {
            tracing::debug!(kind = message.kind(), "bridge message");
        }
        self.tx.send(message).map_err(|_| Error::OperationFailed)?;
        // A full pipe still wakes the reader; coalescing is fine.
        match rustix::io::write(&self.notify_write, &[1u8]) {
            Ok(_) | Err(rustix::io::Errno::AGAIN) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Prod the worker's poll.
    pub fn wake_worker(&self) {
        let _ = rustix::io::write(&self.waker_write, &[1u8]);
    }
}

/// Start the worker. Must run after `Shared` is fully constructed.
pub(crate) fn spawn_worker(shared: &Arc<Shared>) {
    let weak = Arc::downgrade(shared);
    let handle = std::thread::Builder::new()
        .name("tdm-loop".into())
        .spawn(move || {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            worker_main(shared);
        })
        .expect("spawning the display worker failed");
    *shared.bridge.worker.lock().unwrap() = Some(handle);
}

fn worker_main(shared: Arc<Shared>) {
    let bridge = &shared.bridge;
    bridge.loop_tid.store(display::current_tid(), Ordering::Relaxed);
    tracing::info!(
        display_tid = bridge.display_tid,
        loop_tid = display::current_tid(),
        "display worker running"
    );

    while !bridge.quit.load(Ordering::Relaxed) {
        let mut fds = [rustix::event::PollFd::new(
            &shared.loop_fd,
            rustix::event::PollFlags::IN,
        )];
        match rustix::event::poll(&mut fds, -1) {
            Ok(_) => {}
            Err(rustix::io::Errno::INTR) | Err(rustix::io::Errno::AGAIN) => continue,
            Err(e) => {
                tracing::error!(error = %e, "worker poll failed");
                break;
            }
        }
        if bridge.quit.load(Ordering::Relaxed) {
            break;
        }
        if let Err(e) = display::dispatch(&shared) {
            tracing::error!(error = ?e, "worker dispatch error");
        }
    }
    tracing::info!("display worker exiting");
}

/// Client-thread side: drain the notify pipe and process queued messages
/// under the lock, then run the callbacks that landed here.
pub(crate) fn drain(shared: &Arc<Shared>) -> Result<()> {
    let mut buf = [0u8; 64];
    loop {
        match rustix::io::read(&shared.bridge.notify_read, &mut buf) {
            Ok(0) => break,
            Ok(_) => continue,
            Err(rustix::io::Errno::AGAIN) => break,
            Err(rustix::io::Errno::INTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }

    let messages: Vec<ThreadMessage> = {
        let rx = shared.bridge.rx.lock().expect("bridge receiver poisoned");
        let mut messages = Vec::new();
        while let Ok(message) = rx.try_recv() {
            messages.push(message);
        }
        messages
    };

    if messages.is_empty() {
        return Ok(());
    }

    let deferred = {
        let mut st = shared.lock();
        let debug = st.debug.enabled(DebugFlags::THREAD);
        for message in messages {
            if debug {
                tracing::debug!(kind = message.kind(), "bridge deliver");
            }
            route_message(&mut st, shared, message);
        }
        st.take_deferred()
    };
    for callback in deferred {
        callback();
    }
    Ok(())
}

fn route_message(
    st: &mut crate::display::DisplayState,
    shared: &Arc<Shared>,
    message: ThreadMessage,
) {
    match message {
        ThreadMessage::OutputCommit { output, token, sequence, tv_sec, tv_usec } => {
            if st.output_index(output).is_none() {
                tracing::warn!(output, "commit message for dead output");
                return;
            }
            crate::output::on_commit_event(st, shared, token, sequence, tv_sec, tv_usec);
        }
        ThreadMessage::OutputVblank { output, token, sequence, tv_sec, tv_usec } => {
            if st.output_index(output).is_none() {
                tracing::warn!(output, "vblank message for dead output");
                return;
            }
            crate::output::on_vblank_event(st, shared, token, sequence, tv_sec, tv_usec);
        }
        ThreadMessage::OutputStatus { output, status } => {
            if st.output_index(output).is_none() {
                tracing::warn!(output, "status message for dead output");
                return;
            }
            crate::output::deliver_status_main(st, shared, output, status);
        }
        ThreadMessage::PpDone { pp, src, dst } => {
            if st.pp_index(pp).is_none() {
                tracing::warn!(pp, "done message for dead pp");
                return;
            }
            crate::pp::on_done_event(st, shared, pp, src, dst);
        }
        ThreadMessage::CaptureDone { capture, buffer } => {
            if st.capture_index(capture).is_none() {
                tracing::warn!(capture, "done message for dead capture");
                return;
            }
            crate::capture::on_done_event(st, shared, capture, buffer);
        }
        ThreadMessage::Invoke(func) => st.deferred.push(func),
    }
}

/// Stop and join the worker; idempotent.
pub(crate) fn shutdown_worker(shared: &Arc<Shared>) {
    shared.bridge.quit.store(true, Ordering::SeqCst);
    shared.bridge.wake_worker();
    let handle = shared.bridge.worker.lock().unwrap().take();
    if let Some(handle) = handle {
        if let Err(e) = handle.join() {
            tracing::error!(?e, "display worker panicked");
        }
    }
}
