//! The display core: context handle, object registry, init/deinit
//! lifecycle and the dispatch plumbing everything else hangs off.
//!
//! One mutex guards all frontend state; it is held across every backend
//! call and dropped before any user callback runs. Callbacks raised while
//! the lock is held are collected on a deferred list and invoked by the
//! unlocking wrapper, on the thread that owns them.

use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::backend::{Backend, BackendEvent, EventSink};
use crate::caps::{CaptureCaps, DisplayCapabilities, DisplayCaps, OutputCaps, PpCaps};
use crate::capture::CaptureData;
use crate::config::Config;
use crate::debug::{DebugFlags, DebugState};
use crate::error::{Error, Result};
use crate::event_loop::{EventLoop, Readiness, SourceId};
use crate::module::LoadedModule;
use crate::output::OutputData;
use crate::pp::PpData;
use crate::server::ServerState;
use crate::thread::Bridge;
use crate::types::{alloc_stamp, ConnStatus, ConnectorType};
use crate::vblank::VblankData;

pub(crate) type Tid = i32;

pub(crate) fn current_tid() -> Tid {
    rustix::thread::gettid().as_raw_nonzero().get()
}

/// A callback captured under the lock, to run once it is released.
pub(crate) type Deferred = Box<dyn FnOnce() + Send>;

/// Routing token for event-loop sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Token {
    /// The backend's event fd.
    Backend,
    /// The waker pipe: shutdown or loop-thread tasks pending.
    Waker,
    /// The wire server's listening socket.
    ServerListener,
    /// One connected wire client.
    ServerClient(u64),
    /// A software vblank timer; the payload is the vblank stamp.
    VblankTimer(u64),
}

/// Identity of the loaded backend module.
#[derive(Debug, Clone)]
pub struct ModuleIdentity {
    pub name: String,
    pub vendor: String,
    pub abi_version: u32,
}

impl Default for ModuleIdentity {
    fn default() -> Self {
        ModuleIdentity {
            name: "software".into(),
            vendor: "tdm".into(),
            abi_version: crate::backend::abi_version(
                crate::backend::ABI_MAJOR,
                crate::backend::ABI_MINOR,
            ),
        }
    }
}

/// All mutable frontend state, under the global lock.
pub(crate) struct DisplayState {
    pub config: Config,
    pub module: ModuleIdentity,
    pub backend: Option<Box<dyn Backend>>,
    pub caps: DisplayCaps,
    pub caps_pp: Option<PpCaps>,
    pub caps_capture: Option<CaptureCaps>,
    pub outputs: Vec<OutputData>,
    pub pps: Vec<PpData>,
    pub captures: Vec<CaptureData>,
    pub vblanks: Vec<VblankData>,
    pub event_loop: EventLoop<Token>,
    pub sink: EventSink,
    pub deferred: Vec<Deferred>,
    /// Tasks that must run on the loop thread (sub-list handler delivery).
    pub loop_tasks: Vec<Deferred>,
    pub debug: DebugState,
    pub server: Option<ServerState>,
    pub backend_source: Option<SourceId>,
    pub waker_source: Option<SourceId>,
    next_token: u64,
}

impl DisplayState {
    /// Allocate a request/handler token, unique per display.
    pub fn next_token(&mut self) -> u64 {
        self.next_token += 1;
        self.next_token
    }

    pub fn take_deferred(&mut self) -> Vec<Deferred> {
        std::mem::take(&mut self.deferred)
    }

    pub fn output_index(&self, stamp: u64) -> Option<usize> {
        self.outputs.iter().position(|o| o.stamp == stamp)
    }

    pub fn output(&self, stamp: u64) -> Result<&OutputData> {
        self.outputs
            .iter()
            .find(|o| o.stamp == stamp)
            .ok_or(Error::InvalidParameter)
    }

    pub fn output_mut(&mut self, stamp: u64) -> Result<&mut OutputData> {
        self.outputs
            .iter_mut()
            .find(|o| o.stamp == stamp)
            .ok_or(Error::InvalidParameter)
    }

    pub fn pp_index(&self, stamp: u64) -> Option<usize> {
        self.pps.iter().position(|p| p.stamp == stamp)
    }

    pub fn capture_index(&self, stamp: u64) -> Option<usize> {
        self.captures.iter().position(|c| c.stamp == stamp)
    }

    pub fn vblank_index(&self, stamp: u64) -> Option<usize> {
        self.vblanks.iter().position(|v| v.stamp == stamp)
    }

    pub fn backend_mut(&mut self) -> Result<&mut dyn Backend> {
        match self.backend.as_mut() {
            Some(backend) => Ok(backend.as_mut()),
            None => Err(Error::InvalidParameter),
        }
    }

    /// Whether the module ABI is at least `major.minor`.
    pub fn abi_at_least(&self, major: u32, minor: u32) -> bool {
        let version = self.module.abi_version;
        crate::backend::abi_major(version) > major
            || (crate::backend::abi_major(version) == major
                && crate::backend::abi_minor(version) >= minor)
    }
}

/// Shared core behind every handle.
pub(crate) struct Shared {
    // Field order matters: state (and the backend objects in it) must drop
    // before the module whose code they point into.
    pub state: Mutex<DisplayState>,
    pub bridge: Bridge,
    /// Dup of the event-loop fd, pollable without the lock.
    pub loop_fd: OwnedFd,
    pub mutex_timeout: Option<Duration>,
    pub init_count: AtomicUsize,
    pub module: Mutex<Option<LoadedModule>>,
}

impl Shared {
    /// Acquire the global lock, logging a stall when a timeout is
    /// configured and exceeded.
    pub fn lock(&self) -> MutexGuard<'_, DisplayState> {
        if let Some(timeout) = self.mutex_timeout {
            let start = Instant::now();
            loop {
                match self.state.try_lock() {
                    Ok(guard) => return guard,
                    Err(std::sync::TryLockError::WouldBlock) => {
                        if start.elapsed() >= timeout {
                            tracing::error!(
                                timeout_ms = timeout.as_millis() as u64,
                                "display lock held too long; blocking"
                            );
                            break;
                        }
                        std::thread::sleep(Duration::from_millis(1));
                    }
                    Err(std::sync::TryLockError::Poisoned(poisoned)) => {
                        return poisoned.into_inner();
                    }
                }
            }
        }
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run `f` under the lock, then invoke whatever callbacks it deferred.
    pub fn with_state<R>(self: &Arc<Self>, f: impl FnOnce(&mut DisplayState) -> R) -> R {
        let (result, deferred) = {
            let mut st = self.lock();
            let result = f(&mut st);
            (result, st.take_deferred())
        };
        for callback in deferred {
            callback();
        }
        result
    }

    /// Schedule a task on the loop thread and wake it.
    pub fn post_to_loop(&self, st: &mut DisplayState, task: Deferred) {
        st.loop_tasks.push(task);
        self.bridge.wake_worker();
    }
}

/// Sleep on the public fd, then dispatch. Shared by `Display` event entry
/// points and the synchronous vblank wait.
pub(crate) fn poll_once(shared: &Arc<Shared>, timeout_ms: i32) -> Result<bool> {
    let fd = if shared.bridge.threaded {
        shared.bridge.notify_read.as_fd()
    } else {
        shared.loop_fd.as_fd()
    };
    let mut fds = [rustix::event::PollFd::new(&fd, rustix::event::PollFlags::IN)];
    match rustix::event::poll(&mut fds, timeout_ms) {
        Ok(0) => return Ok(false),
        Ok(_) => {}
        Err(rustix::io::Errno::INTR) => return Ok(false),
        Err(e) => return Err(e.into()),
    }
    if shared.bridge.threaded {
        crate::thread::drain(shared)?;
    } else {
        dispatch(shared)?;
    }
    Ok(true)
}

/// One non-blocking dispatch pass on the loop thread.
pub(crate) fn dispatch(shared: &Arc<Shared>) -> Result<()> {
    let deferred = {
        let mut st = shared.lock();
        let ready = st.event_loop.poll_ready(0)?;
        for (token, readiness) in ready {
            route(&mut st, shared, token, readiness);
        }
        let mut deferred = st.take_deferred();
        deferred.extend(st.loop_tasks.drain(..));
        deferred
    };
    for callback in deferred {
        callback();
    }
    Ok(())
}

fn route(st: &mut DisplayState, shared: &Arc<Shared>, token: Token, readiness: Readiness) {
    match token {
        Token::Backend => {
            if st.debug.enabled(DebugFlags::THREAD) {
                tracing::debug!("backend fd event");
            }
            if let Some(backend) = st.backend.as_mut() {
                if let Err(e) = backend.handle_events() {
                    tracing::error!(error = ?e, "backend handle_events failed");
                }
            }
            drain_backend_events(st, shared);
        }
        Token::Waker => {
            let mut buf = [0u8; 64];
            while matches!(
                rustix::io::read(&shared.bridge.waker_read, &mut buf),
                Ok(n) if n > 0
            ) {}
        }
        Token::ServerListener => crate::server::accept(st, shared),
        Token::ServerClient(id) => crate::server::client_ready(st, shared, id, readiness),
        Token::VblankTimer(stamp) => crate::vblank::timer_expired(st, shared, stamp),
    }
}

/// Process everything the backend queued during `handle_events`.
pub(crate) fn drain_backend_events(st: &mut DisplayState, shared: &Arc<Shared>) {
    for event in st.sink.drain() {
        match event {
            BackendEvent::Vblank { token, sequence, tv_sec, tv_usec } => {
                crate::output::on_vblank_event(st, shared, token, sequence, tv_sec, tv_usec);
            }
            BackendEvent::Commit { token, sequence, tv_sec, tv_usec } => {
                crate::output::on_commit_event(st, shared, token, sequence, tv_sec, tv_usec);
            }
            BackendEvent::Status { token, status } => {
                crate::output::on_status_event(st, shared, token, status);
            }
            BackendEvent::PpDone { token, src, dst } => {
                crate::pp::on_done_event(st, shared, token, src, dst);
            }
            BackendEvent::CaptureDone { token, buffer } => {
                crate::capture::on_done_event(st, shared, token, buffer);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Lifecycle

static SINGLETON: Mutex<Option<Arc<Shared>>> = Mutex::new(None);

/// The display context handle.
///
/// Cloning composes with the init refcount: the backend stays up until the
/// last handle drops.
pub struct Display {
    pub(crate) shared: Arc<Shared>,
    singleton: bool,
}

impl Clone for Display {
    fn clone(&self) -> Self {
        self.shared.init_count.fetch_add(1, Ordering::SeqCst);
        Display { shared: self.shared.clone(), singleton: self.singleton }
    }
}

impl Drop for Display {
    fn drop(&mut self) {
        if self.singleton {
            // Hold the registry lock across the decrement so a concurrent
            // init cannot revive a display that is about to shut down.
            let mut global = SINGLETON.lock().unwrap();
            if self.shared.init_count.fetch_sub(1, Ordering::SeqCst) != 1 {
                return;
            }
            *global = None;
            drop(global);
            shutdown(&self.shared);
        } else {
            if self.shared.init_count.fetch_sub(1, Ordering::SeqCst) != 1 {
                return;
            }
            shutdown(&self.shared);
        }
    }
}

impl Display {
    /// Initialize the process-wide display, loading the backend module
    /// named by the environment. Nested inits return the same display.
    pub fn init() -> Result<Display> {
        let mut global = SINGLETON.lock().unwrap();
        if let Some(shared) = global.as_ref() {
            shared.init_count.fetch_add(1, Ordering::SeqCst);
            return Ok(Display { shared: shared.clone(), singleton: true });
        }

        let config = Config::load();
        let loaded = crate::module::load(&config)?;
        let descriptor = loaded.descriptor();
        let identity = ModuleIdentity {
            name: descriptor.name.to_string(),
            vendor: descriptor.vendor.to_string(),
            abi_version: descriptor.abi_version,
        };
        let context = crate::backend::InitContext { drm_master_fd: config.drm_master_fd };
        let backend = (descriptor.init)(&context).map_err(|e| {
            tracing::error!(module = %identity.name, error = ?e, "backend init failed");
            e
        })?;

        let shared = init_common(config, identity, backend, Some(loaded))?;
        *global = Some(shared.clone());
        Ok(Display { shared, singleton: true })
    }

    /// Initialize an independent display around an in-process backend.
    /// This is the path headless and test backends use; it bypasses module
    /// loading but not the ABI identity check.
    pub fn init_with_backend(
        identity: ModuleIdentity,
        backend: Box<dyn Backend>,
        config: Config,
    ) -> Result<Display> {
        crate::backend::check_abi(&identity.name, &identity.vendor, identity.abi_version)?;
        let shared = init_common(config, identity, backend, None)?;
        Ok(Display { shared, singleton: false })
    }

    /// The fd to poll for pending events. Readable means
    /// [`handle_events`](Self::handle_events) will have work.
    pub fn fd(&self) -> BorrowedFd<'_> {
        if self.shared.bridge.threaded {
            self.shared.bridge.notify_read.as_fd()
        } else {
            self.shared.loop_fd.as_fd()
        }
    }

    /// Block until events are pending, then dispatch them. User handlers
    /// registered from this thread run here.
    pub fn handle_events(&self) -> Result<()> {
        self.poll_events(-1).map(|_| ())
    }

    /// Like [`handle_events`](Self::handle_events) but bounded; returns
    /// whether anything was dispatched.
    pub fn poll_events(&self, timeout_ms: i32) -> Result<bool> {
        poll_once(&self.shared, timeout_ms)
    }

    /// Dispatch whatever is already queued without sleeping.
    pub fn dispatch_pending(&self) -> Result<()> {
        if self.shared.bridge.threaded {
            crate::thread::drain(&self.shared)
        } else {
            dispatch(&self.shared)
        }
    }

    /// Aggregate display capabilities.
    pub fn capabilities(&self) -> Result<DisplayCapabilities> {
        self.shared.with_state(|st| Ok(st.caps.capabilities))
    }

    /// Re-enumerate outputs and refresh every capability snapshot.
    pub fn update(&self) -> Result<()> {
        self.shared.with_state(|st| update_outputs(st))
    }

    pub fn output_count(&self) -> Result<usize> {
        self.shared.with_state(|st| Ok(st.outputs.len()))
    }

    /// Get the output at `index`; index 0 is the primary display.
    pub fn get_output(&self, index: usize) -> Result<crate::output::Output> {
        self.shared.with_state(|st| {
            let data = st.outputs.get(index).ok_or(Error::InvalidParameter)?;
            Ok(crate::output::Output::new(self.shared.clone(), data.stamp))
        })
    }

    pub fn outputs(&self) -> Result<Vec<crate::output::Output>> {
        self.shared.with_state(|st| {
            Ok(st
                .outputs
                .iter()
                .map(|o| crate::output::Output::new(self.shared.clone(), o.stamp))
                .collect())
        })
    }

    /// Path of the wire socket, when the server is up.
    pub fn socket_path(&self) -> Option<PathBuf> {
        self.shared.lock().server.as_ref().map(|s| s.socket_path.clone())
    }
}

fn shutdown(shared: &Arc<Shared>) {
    tracing::info!("display shutting down");
    crate::thread::shutdown_worker(shared);

    let deferred = {
        let mut st = shared.lock();
        crate::server::teardown(&mut st);

        // End outstanding engine waits and drop their callbacks.
        let stamps: Vec<u64> = st.vblanks.iter().map(|v| v.stamp).collect();
        for stamp in stamps {
            crate::vblank::destroy_internal(&mut st, stamp);
        }

        let pp_stamps: Vec<u64> = st.pps.iter().map(|p| p.stamp).collect();
        for stamp in pp_stamps {
            crate::pp::destroy_internal(&mut st, stamp);
        }
        let capture_stamps: Vec<u64> = st.captures.iter().map(|c| c.stamp).collect();
        for stamp in capture_stamps {
            crate::capture::destroy_internal(&mut st, stamp);
        }

        if let Some(source) = st.backend_source.take() {
            let _ = st.event_loop.remove_fd(source);
        }
        if let Some(source) = st.waker_source.take() {
            let _ = st.event_loop.remove_fd(source);
        }

        // Outputs (and their layer buffers) go before the backend.
        let mut deferred_outputs = Vec::new();
        for mut output in st.outputs.drain(..) {
            for layer in output.layers.iter_mut() {
                layer.release_buffers(&mut deferred_outputs);
            }
        }
        st.deferred.extend(deferred_outputs);

        st.backend = None;
        st.take_deferred()
    };
    for callback in deferred {
        callback();
    }

    // Unload the module only after every backend object is gone.
    let module = shared.module.lock().unwrap().take();
    drop(module);
    tracing::info!("display shut down");
}

fn init_common(
    config: Config,
    identity: ModuleIdentity,
    mut backend: Box<dyn Backend>,
    loaded: Option<LoadedModule>,
) -> Result<Arc<Shared>> {
    let debug = DebugState::from_config(&config);
    let mut event_loop: EventLoop<Token> = EventLoop::new()?;
    let loop_fd = rustix::io::fcntl_dupfd_cloexec(event_loop.fd(), 0)?;

    let bridge = Bridge::new(config.thread)?;
    let waker_source =
        event_loop.add_fd(bridge.waker_read.as_fd(), Readiness::READABLE, Token::Waker)?;

    let sink = EventSink::new();

    // Aggregate capabilities, then the optional engine capabilities; a
    // backend advertising a bit it cannot answer for is a bad module.
    let caps = backend.capabilities().map_err(|_| Error::BadModule)?;
    let caps_pp = if caps.capabilities.contains(DisplayCapabilities::PP) {
        Some(backend.pp_capabilities().map_err(|e| {
            tracing::error!(error = ?e, "pp capability bit set but query failed");
            Error::BadModule
        })?)
    } else {
        None
    };
    let caps_capture = if caps.capabilities.contains(DisplayCapabilities::CAPTURE) {
        Some(backend.capture_capabilities().map_err(|e| {
            tracing::error!(error = ?e, "capture capability bit set but query failed");
            Error::BadModule
        })?)
    } else {
        None
    };

    // Walk outputs and layers, building the capability cache in primary-
    // first order.
    let backend_outputs = backend.outputs().map_err(|_| Error::BadModule)?;
    let mut annotated = Vec::with_capacity(backend_outputs.len());
    for mut output in backend_outputs {
        let caps = output.capability().map_err(|_| Error::BadModule)?;
        annotated.push((output, caps));
    }
    let primary = primary_index(
        &annotated
            .iter()
            .map(|(_, caps)| (caps.connector_type, caps.status))
            .collect::<Vec<_>>(),
    );
    annotated.swap(0, primary);

    let mut outputs: Vec<OutputData> = Vec::with_capacity(annotated.len());
    for (pipe, (backend_output, caps)) in annotated.into_iter().enumerate() {
        let stamp = alloc_stamp(|s| outputs.iter().any(|o| o.stamp == s));
        outputs.push(OutputData::new(
            stamp,
            pipe as u32,
            backend_output,
            caps,
            &sink,
        )?);
    }

    let backend_fd = backend.fd();

    let mut st = DisplayState {
        config,
        module: identity,
        backend: Some(backend),
        caps,
        caps_pp,
        caps_capture,
        outputs,
        pps: Vec::new(),
        captures: Vec::new(),
        vblanks: Vec::new(),
        event_loop,
        sink,
        deferred: Vec::new(),
        loop_tasks: Vec::new(),
        debug,
        server: None,
        backend_source: None,
        waker_source: Some(waker_source),
        next_token: 0,
    };

    if let Some(fd) = backend_fd {
        // The backend owns this fd for its own lifetime.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        match st.event_loop.add_fd(borrowed, Readiness::READABLE, Token::Backend) {
            Ok(source) => {
                st.backend_source = Some(source);
                tracing::info!(fd, "backend event source created");
            }
            Err(e) => tracing::error!(fd, error = ?e, "backend fd source failed"),
        }
    } else {
        tracing::info!("backend offers no event fd");
    }

    if let Err(e) = crate::server::init(&mut st) {
        tracing::warn!(error = ?e, "wire server unavailable");
    }

    let mutex_timeout = st.config.mutex_timeout_ms.map(Duration::from_millis);
    let threaded = st.config.thread;

    let shared = Arc::new(Shared {
        state: Mutex::new(st),
        bridge,
        loop_fd,
        mutex_timeout,
        init_count: AtomicUsize::new(1),
        module: Mutex::new(loaded),
    });

    if threaded {
        crate::thread::spawn_worker(&shared);
    }

    tracing::info!(threaded, "display initialized");
    Ok(shared)
}

/// Refresh the capability cache against the backend's current output set.
/// Existing outputs keep their stamps and handlers; newly reported
/// connectors are appended. Order never changes after init.
fn update_outputs(st: &mut DisplayState) -> Result<()> {
    let backend = st.backend.as_mut().ok_or(Error::InvalidParameter)?;
    let fresh = backend.outputs().map_err(|e| {
        tracing::error!(error = ?e, "output enumeration failed");
        e
    })?;

    let sink = st.sink.clone();
    for (index, mut backend_output) in fresh.into_iter().enumerate() {
        let caps = backend_output.capability()?;
        match st.outputs.get_mut(index) {
            Some(existing) => {
                existing.refresh(backend_output, caps, &mut st.deferred)?;
                existing.rebind_status(&sink);
            }
            None => {
                let stamp = alloc_stamp(|s| st.outputs.iter().any(|o| o.stamp == s));
                let data =
                    OutputData::new(stamp, index as u32, backend_output, caps, &sink)?;
                st.outputs.push(data);
            }
        }
    }
    Ok(())
}

/// Which output becomes index 0.
///
/// Connected internal panels win (DSI, then LVDS), then external HDMI;
/// with nothing connected the HDMI ports lead since they are the only
/// thing that can appear later.
pub(crate) fn primary_index(outputs: &[(ConnectorType, ConnStatus)]) -> usize {
    if outputs.len() <= 1 {
        return 0;
    }

    let connected =
        |i: &usize| outputs[*i].1 != ConnStatus::Disconnected;
    let by_type = |wanted: ConnectorType, require_connected: bool| {
        outputs
            .iter()
            .position(|(ty, status)| {
                *ty == wanted && (!require_connected || *status != ConnStatus::Disconnected)
            })
    };

    let any_connected = (0..outputs.len()).any(|i| connected(&i));
    if any_connected {
        for ty in [
            ConnectorType::Dsi,
            ConnectorType::Lvds,
            ConnectorType::HdmiA,
            ConnectorType::HdmiB,
        ] {
            if let Some(index) = by_type(ty, true) {
                return index;
            }
        }
        (0..outputs.len()).find(connected).unwrap_or(0)
    } else {
        for ty in [
            ConnectorType::HdmiA,
            ConnectorType::HdmiB,
            ConnectorType::Dsi,
            ConnectorType::Lvds,
        ] {
            if let Some(index) = by_type(ty, false) {
                return index;
            }
        }
        0
    }
}

/// Decorate the backend's model string with the pipe index so wire
/// clients can tell identical panels apart.
pub(crate) fn decorate_model(caps: &mut OutputCaps, pipe: u32) {
    caps.model = format!("{}-{}", caps.model, pipe);
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnStatus::{Connected, Disconnected};
    use ConnectorType::{Dsi, HdmiA, HdmiB, Lvds, Unknown};

    #[test]
    fn single_output_is_primary() {
        assert_eq!(primary_index(&[(HdmiA, Disconnected)]), 0);
    }

    #[test]
    fn connected_internal_panel_wins() {
        let outputs = [(HdmiA, Connected), (Dsi, Connected), (Lvds, Connected)];
        assert_eq!(primary_index(&outputs), 1);
    }

    #[test]
    fn connected_lvds_beats_hdmi() {
        let outputs = [(HdmiA, Connected), (Lvds, Connected)];
        assert_eq!(primary_index(&outputs), 1);
    }

    #[test]
    fn first_connected_when_no_preferred_type() {
        let outputs = [(Unknown, Disconnected), (Unknown, Connected)];
        assert_eq!(primary_index(&outputs), 1);
    }

    #[test]
    fn hdmi_leads_when_nothing_connected() {
        let outputs = [(Dsi, Disconnected), (HdmiB, Disconnected), (HdmiA, Disconnected)];
        assert_eq!(primary_index(&outputs), 2);
    }

    #[test]
    fn unchanged_when_no_candidates() {
        let outputs = [(Unknown, Disconnected), (Unknown, Disconnected)];
        assert_eq!(primary_index(&outputs), 0);
    }
}
