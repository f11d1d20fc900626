//! Output operations: mode and property I/O, DPMS, vblank waits, commits
//! and connection-change delivery.

use std::sync::Arc;

use crate::backend::{EventSink, OutputBackend};
use crate::caps::OutputCaps;
use crate::display::{
    current_tid, decorate_model, Deferred, DisplayState, Shared, Tid,
};
use crate::debug::DebugFlags;
use crate::error::{Error, Result};
use crate::layer::LayerData;
use crate::thread::ThreadMessage;
use crate::types::{ConnStatus, Dpms, HandlerId, OutputMode, Prop, Value};

/// One-shot handler for a vblank wait: `(sequence, tv_sec, tv_usec)`.
pub type VblankHandler = Box<dyn FnOnce(u32, u64, u64) + Send>;

/// One-shot handler for a commit completion: `(sequence, tv_sec, tv_usec)`.
pub type CommitHandler = Box<dyn FnOnce(u32, u64, u64) + Send>;

/// What changed on an output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeEvent {
    Dpms(Dpms),
    Connection(ConnStatus),
}

/// Persistent change handler.
pub type ChangeHandler = Arc<dyn Fn(ChangeEvent) + Send + Sync>;

/// Where a completed backend vblank event is routed.
pub(crate) enum WaitTarget {
    /// A direct `Output::wait_vblank` caller.
    User(VblankHandler),
    /// A hardware wait issued by the vblank engine.
    Engine { vblank: u64, wait: u64 },
    /// The engine's timeline-seeding wait.
    EngineSeed { vblank: u64 },
}

pub(crate) struct OutputWait {
    pub token: u64,
    pub owner: Tid,
    pub target: WaitTarget,
}

pub(crate) struct CommitWait {
    pub token: u64,
    pub owner: Tid,
    pub func: Option<CommitHandler>,
}

pub(crate) struct ChangeEntry {
    pub id: HandlerId,
    pub owner: Tid,
    pub func: ChangeHandler,
}

/// Frontend state of one connector.
pub(crate) struct OutputData {
    pub stamp: u64,
    pub pipe: u32,
    pub backend: Box<dyn OutputBackend>,
    pub caps: OutputCaps,
    /// Cached power state; authoritative for the commit/wait gates.
    pub dpms: Dpms,
    pub layers: Vec<LayerData>,
    pub vblank_waits: Vec<OutputWait>,
    pub commit_waits: Vec<CommitWait>,
    /// Handlers owned by the display thread.
    pub change_main: Vec<ChangeEntry>,
    /// Handlers owned by other threads (the loop, typically).
    pub change_sub: Vec<ChangeEntry>,
    /// Whether the backend has a status entry point at all.
    pub status_supported: bool,
    vblank_cb_registered: bool,
    commit_cb_registered: bool,
}

impl OutputData {
    pub fn new(
        stamp: u64,
        pipe: u32,
        mut backend: Box<dyn OutputBackend>,
        mut caps: OutputCaps,
        sink: &EventSink,
    ) -> Result<OutputData> {
        decorate_model(&mut caps, pipe);

        let status_supported = match backend.set_status_handler(sink.clone(), stamp) {
            Ok(()) => true,
            Err(Error::NotImplemented) => false,
            Err(e) => return Err(e),
        };

        let mut layers = Vec::new();
        for mut layer_backend in backend.layers().map_err(|_| Error::BadModule)? {
            let layer_caps = layer_backend.capability().map_err(|_| Error::BadModule)?;
            layers.push(LayerData::new(layer_backend, layer_caps));
        }

        tracing::debug!(
            pipe,
            model = %caps.model,
            status = %caps.status,
            layers = layers.len(),
            "output cached"
        );

        Ok(OutputData {
            stamp,
            pipe,
            backend,
            caps,
            dpms: Dpms::Off,
            layers,
            vblank_waits: Vec::new(),
            commit_waits: Vec::new(),
            change_main: Vec::new(),
            change_sub: Vec::new(),
            status_supported,
            vblank_cb_registered: false,
            commit_cb_registered: false,
        })
    }

    /// Hot-plug refresh: new backend objects and capability snapshots,
    /// same stamp and handler lists.
    pub fn refresh(
        &mut self,
        mut backend: Box<dyn OutputBackend>,
        mut caps: OutputCaps,
        deferred: &mut Vec<Deferred>,
    ) -> Result<()> {
        decorate_model(&mut caps, self.pipe);

        let mut fresh = Vec::new();
        for mut layer_backend in backend.layers()? {
            let layer_caps = layer_backend.capability()?;
            fresh.push((layer_backend, layer_caps));
        }

        if fresh.len() == self.layers.len() {
            for (layer, (layer_backend, layer_caps)) in self.layers.iter_mut().zip(fresh) {
                layer.backend = layer_backend;
                layer.caps = layer_caps;
            }
        } else {
            for layer in self.layers.iter_mut() {
                layer.release_buffers(deferred);
            }
            self.layers = fresh
                .into_iter()
                .map(|(layer_backend, layer_caps)| LayerData::new(layer_backend, layer_caps))
                .collect();
        }

        self.backend = backend;
        self.caps = caps;
        Ok(())
    }

    /// Re-register the status sink after a backend swap.
    pub fn rebind_status(&mut self, sink: &EventSink) {
        self.status_supported = self
            .backend
            .set_status_handler(sink.clone(), self.stamp)
            .is_ok();
    }
}

/// Handle to one output. Resolves through the registry on every call, so
/// it stays safe across hot-unplug and display teardown.
#[derive(Clone)]
pub struct Output {
    shared: Arc<Shared>,
    stamp: u64,
}

impl Output {
    pub(crate) fn new(shared: Arc<Shared>, stamp: u64) -> Output {
        Output { shared, stamp }
    }

    pub(crate) fn stamp(&self) -> u64 {
        self.stamp
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    /// `(maker, model, name)` as reported by the backend, with the model
    /// decorated by the pipe index.
    pub fn model_info(&self) -> Result<(String, String, String)> {
        self.shared.with_state(|st| {
            let out = st.output(self.stamp)?;
            Ok((out.caps.maker.clone(), out.caps.model.clone(), out.caps.name.clone()))
        })
    }

    pub fn conn_status(&self) -> Result<ConnStatus> {
        self.shared.with_state(|st| Ok(st.output(self.stamp)?.caps.status))
    }

    pub fn connector_type(&self) -> Result<crate::types::ConnectorType> {
        self.shared.with_state(|st| Ok(st.output(self.stamp)?.caps.connector_type))
    }

    pub fn pipe(&self) -> Result<u32> {
        self.shared.with_state(|st| Ok(st.output(self.stamp)?.pipe))
    }

    pub fn subpixel(&self) -> Result<u32> {
        self.shared.with_state(|st| Ok(st.output(self.stamp)?.caps.subpixel))
    }

    pub fn physical_size(&self) -> Result<(u32, u32)> {
        self.shared.with_state(|st| {
            let out = st.output(self.stamp)?;
            Ok((out.caps.mm_width, out.caps.mm_height))
        })
    }

    pub fn available_modes(&self) -> Result<Vec<OutputMode>> {
        self.shared.with_state(|st| Ok(st.output(self.stamp)?.caps.modes.clone()))
    }

    pub fn available_properties(&self) -> Result<Vec<Prop>> {
        self.shared.with_state(|st| Ok(st.output(self.stamp)?.caps.props.clone()))
    }

    /// `(min_w, min_h, max_w, max_h, preferred_align)` of the acceptable
    /// framebuffer envelope.
    pub fn available_size(&self) -> Result<(i32, i32, i32, i32, i32)> {
        self.shared.with_state(|st| {
            let caps = &st.output(self.stamp)?.caps;
            Ok((caps.min_w, caps.min_h, caps.max_w, caps.max_h, caps.preferred_align))
        })
    }

    pub fn layer_count(&self) -> Result<usize> {
        self.shared.with_state(|st| Ok(st.output(self.stamp)?.layers.len()))
    }

    pub fn get_layer(&self, index: usize) -> Result<crate::layer::Layer> {
        self.shared.with_state(|st| {
            let out = st.output(self.stamp)?;
            if index >= out.layers.len() {
                return Err(Error::InvalidParameter);
            }
            Ok(crate::layer::Layer::new(self.shared.clone(), self.stamp, index))
        })
    }

    /// Set the current mode. The backend stays authoritative; nothing is
    /// cached on success.
    pub fn set_mode(&self, mode: &OutputMode) -> Result<()> {
        self.shared.with_state(|st| st.output_mut(self.stamp)?.backend.set_mode(mode))
    }

    pub fn mode(&self) -> Result<OutputMode> {
        self.shared.with_state(|st| st.output_mut(self.stamp)?.backend.mode())
    }

    pub fn set_property(&self, id: u32, value: Value) -> Result<()> {
        self.shared
            .with_state(|st| st.output_mut(self.stamp)?.backend.set_property(id, value))
    }

    pub fn property(&self, id: u32) -> Result<Value> {
        self.shared.with_state(|st| st.output_mut(self.stamp)?.backend.property(id))
    }

    /// Change the power state. Clamped; same-value sets are a no-op; on
    /// success the cached value updates and display-thread change handlers
    /// fire.
    pub fn set_dpms(&self, value: Dpms) -> Result<()> {
        let shared = self.shared.clone();
        self.shared.with_state(|st| set_dpms_internal(st, &shared, self.stamp, value))
    }

    pub fn dpms(&self) -> Result<Dpms> {
        self.shared.with_state(|st| {
            let out = st.output_mut(self.stamp)?;
            match out.backend.dpms() {
                Ok(value) => Ok(value),
                Err(Error::NotImplemented) => Ok(out.dpms),
                Err(e) => Err(e),
            }
        })
    }

    /// Ask for a vblank event `interval` periods from now. Rejected while
    /// the output is not powered on.
    pub fn wait_vblank(
        &self,
        interval: u32,
        sync: bool,
        func: impl FnOnce(u32, u64, u64) + Send + 'static,
    ) -> Result<()> {
        self.shared.with_state(|st| {
            let out = st.output(self.stamp)?;
            if out.dpms > Dpms::On {
                tracing::error!(pipe = out.pipe, dpms = %out.dpms, "wait_vblank while powered down");
                return Err(Error::BadRequest);
            }
            wait_vblank_internal(st, self.stamp, interval, sync, WaitTarget::User(Box::new(func)))
                .map(|_| ())
        })
    }

    /// Latch pending layer state. The handler fires once the hardware
    /// reports completion; buffers rotate to showing at that point.
    pub fn commit(
        &self,
        sync: bool,
        func: impl FnOnce(u32, u64, u64) + Send + 'static,
    ) -> Result<()> {
        self.shared.with_state(|st| {
            let out = st.output(self.stamp)?;
            if out.dpms > Dpms::On {
                tracing::error!(pipe = out.pipe, dpms = %out.dpms, "commit while powered down");
                return Err(Error::BadRequest);
            }
            commit_internal(st, self.stamp, sync, Some(Box::new(func)))
        })
    }

    /// Register for connection/DPMS changes. Recorded even when the
    /// backend cannot deliver hardware events, for forward compatibility.
    pub fn add_change_handler(
        &self,
        func: impl Fn(ChangeEvent) + Send + Sync + 'static,
    ) -> Result<HandlerId> {
        self.shared.with_state(|st| {
            let display_thread = {
                let bridge = &self.shared.bridge;
                bridge.is_display_thread(current_tid())
            };
            let out = st.output_mut(self.stamp)?;
            if !out.status_supported {
                tracing::warn!(pipe = out.pipe, "backend cannot report status changes");
            }
            let entry = ChangeEntry {
                id: HandlerId::next(),
                owner: current_tid(),
                func: Arc::new(func),
            };
            let id = entry.id;
            if display_thread {
                out.change_main.push(entry);
            } else {
                out.change_sub.push(entry);
            }
            Ok(id)
        })
    }

    pub fn remove_change_handler(&self, id: HandlerId) -> Result<()> {
        self.shared.with_state(|st| {
            let out = st.output_mut(self.stamp)?;
            out.change_main.retain(|entry| entry.id != id);
            out.change_sub.retain(|entry| entry.id != id);
            Ok(())
        })
    }
}

pub(crate) fn set_dpms_internal(
    st: &mut DisplayState,
    shared: &Arc<Shared>,
    stamp: u64,
    value: Dpms,
) -> Result<()> {
    {
        let out = st.output_mut(stamp)?;
        if out.dpms == value {
            return Ok(());
        }
        match out.backend.set_dpms(value) {
            Ok(()) => {
                out.dpms = value;
                tracing::info!(pipe = out.pipe, dpms = %value, "dpms changed");
            }
            Err(Error::NotImplemented) => {
                out.dpms = value;
                tracing::warn!(pipe = out.pipe, "backend has no dpms entry; caching only");
                return Ok(());
            }
            Err(e) => return Err(e),
        }
    }

    crate::vblank::on_output_change(st, shared, stamp, ChangeEvent::Dpms(value));
    fire_main(st, stamp, ChangeEvent::Dpms(value));
    fire_sub_via_loop(st, shared, stamp, ChangeEvent::Dpms(value));
    Ok(())
}

/// Issue a backend vblank wait and record where its completion goes.
pub(crate) fn wait_vblank_internal(
    st: &mut DisplayState,
    stamp: u64,
    interval: u32,
    sync: bool,
    target: WaitTarget,
) -> Result<u64> {
    if interval == 0 {
        return Err(Error::InvalidParameter);
    }
    let token = st.next_token();
    let sink = st.sink.clone();
    let out = st.output_mut(stamp)?;

    if !out.vblank_cb_registered {
        out.backend.set_vblank_handler(sink)?;
        out.vblank_cb_registered = true;
    }

    out.backend.wait_vblank(interval, sync, token)?;
    out.vblank_waits.push(OutputWait { token, owner: current_tid(), target });
    Ok(token)
}

/// Issue a backend commit. `func` may be absent (internal commits from the
/// buffer-queue path).
pub(crate) fn commit_internal(
    st: &mut DisplayState,
    stamp: u64,
    sync: bool,
    func: Option<CommitHandler>,
) -> Result<()> {
    let token = st.next_token();
    let sink = st.sink.clone();
    let mut advanced = Vec::new();
    {
        let out = st.output_mut(stamp)?;
        if !out.commit_cb_registered {
            out.backend.set_commit_handler(sink)?;
            out.commit_cb_registered = true;
        }

        out.backend.commit(sync, token)?;

        // The hardware accepted the state: pending buffers advance to
        // waiting until the completion rotates them to showing.
        for layer in out.layers.iter_mut() {
            layer.advance_pending(&mut advanced);
        }
        out.commit_waits.push(CommitWait { token, owner: current_tid(), func });
    }
    st.deferred.append(&mut advanced);
    Ok(())
}

fn find_vblank_wait(st: &DisplayState, token: u64) -> Option<(usize, usize)> {
    for (oi, out) in st.outputs.iter().enumerate() {
        if let Some(wi) = out.vblank_waits.iter().position(|w| w.token == token) {
            return Some((oi, wi));
        }
    }
    None
}

fn find_commit_wait(st: &DisplayState, token: u64) -> Option<(usize, usize)> {
    for (oi, out) in st.outputs.iter().enumerate() {
        if let Some(wi) = out.commit_waits.iter().position(|w| w.token == token) {
            return Some((oi, wi));
        }
    }
    None
}

/// A backend vblank completion, on whichever thread is dispatching.
pub(crate) fn on_vblank_event(
    st: &mut DisplayState,
    shared: &Arc<Shared>,
    token: u64,
    sequence: u32,
    tv_sec: u64,
    tv_usec: u64,
) {
    let Some((oi, wi)) = find_vblank_wait(st, token) else {
        tracing::debug!(token, "vblank completion for unknown wait");
        return;
    };
    let owner = st.outputs[oi].vblank_waits[wi].owner;
    if owner != current_tid() && shared.bridge.in_loop_thread() {
        let output = st.outputs[oi].stamp;
        let debug = st.debug.enabled(DebugFlags::THREAD);
        let _ = shared.bridge.send(
            ThreadMessage::OutputVblank { output, token, sequence, tv_sec, tv_usec },
            debug,
        );
        return;
    }

    let wait = st.outputs[oi].vblank_waits.remove(wi);
    match wait.target {
        WaitTarget::User(func) => {
            st.deferred.push(Box::new(move || func(sequence, tv_sec, tv_usec)));
        }
        WaitTarget::Engine { vblank, wait } => {
            crate::vblank::complete_hw(st, shared, vblank, wait, sequence, tv_sec, tv_usec);
        }
        WaitTarget::EngineSeed { vblank } => {
            crate::vblank::seed_done(st, shared, vblank, sequence, tv_sec, tv_usec);
        }
    }
}

/// A backend commit completion: rotate layer buffers and run the handler.
pub(crate) fn on_commit_event(
    st: &mut DisplayState,
    shared: &Arc<Shared>,
    token: u64,
    sequence: u32,
    tv_sec: u64,
    tv_usec: u64,
) {
    let Some((oi, wi)) = find_commit_wait(st, token) else {
        tracing::debug!(token, "commit completion for unknown wait");
        return;
    };
    let owner = st.outputs[oi].commit_waits[wi].owner;
    if owner != current_tid() && shared.bridge.in_loop_thread() {
        let output = st.outputs[oi].stamp;
        let debug = st.debug.enabled(DebugFlags::THREAD);
        let _ = shared.bridge.send(
            ThreadMessage::OutputCommit { output, token, sequence, tv_sec, tv_usec },
            debug,
        );
        return;
    }

    let wait = st.outputs[oi].commit_waits.remove(wi);
    let mut rotated = Vec::new();
    let buffer_debug = st.debug.enabled(DebugFlags::BUFFER);
    for layer in st.outputs[oi].layers.iter_mut() {
        layer.rotate_showing(&mut rotated, buffer_debug);
    }
    st.deferred.append(&mut rotated);

    if let Some(func) = wait.func {
        st.deferred.push(Box::new(move || func(sequence, tv_sec, tv_usec)));
    }
}

/// A backend connection-status event; always raised on the loop thread.
pub(crate) fn on_status_event(
    st: &mut DisplayState,
    shared: &Arc<Shared>,
    output_stamp: u64,
    status: ConnStatus,
) {
    let Ok(out) = st.output_mut(output_stamp) else {
        tracing::warn!(output_stamp, "status event for unknown output");
        return;
    };
    tracing::info!(pipe = out.pipe, status = %status, "output changed");
    out.caps.status = status;

    if status == ConnStatus::Disconnected {
        // Outstanding waits die silently; the change handler is the
        // compositor's signal.
        let dropped = out.vblank_waits.len();
        out.vblank_waits.clear();
        if dropped > 0 {
            tracing::debug!(pipe = out.pipe, dropped, "discarded hardware waits");
        }
    }

    crate::vblank::on_output_change(st, shared, output_stamp, ChangeEvent::Connection(status));

    // Sub-list handlers live on this thread and run first (the vblank
    // engine-adjacent hooks); the display thread gets its copy through
    // the bridge.
    fire_sub(st, output_stamp, ChangeEvent::Connection(status));
    if shared.bridge.threaded {
        let debug = st.debug.enabled(DebugFlags::THREAD);
        let _ = shared
            .bridge
            .send(ThreadMessage::OutputStatus { output: output_stamp, status }, debug);
    } else {
        deliver_status_main(st, shared, output_stamp, status);
    }
}

/// Bridge delivery of a status change onto the display thread.
pub(crate) fn deliver_status_main(
    st: &mut DisplayState,
    _shared: &Arc<Shared>,
    output_stamp: u64,
    status: ConnStatus,
) {
    fire_main(st, output_stamp, ChangeEvent::Connection(status));
}

fn fire_main(st: &mut DisplayState, stamp: u64, event: ChangeEvent) {
    let Ok(out) = st.output(stamp) else {
        return;
    };
    let handlers: Vec<ChangeHandler> = out.change_main.iter().map(|e| e.func.clone()).collect();
    for func in handlers {
        st.deferred.push(Box::new(move || func(event)));
    }
}

fn fire_sub(st: &mut DisplayState, stamp: u64, event: ChangeEvent) {
    let Ok(out) = st.output(stamp) else {
        return;
    };
    let handlers: Vec<ChangeHandler> = out.change_sub.iter().map(|e| e.func.clone()).collect();
    for func in handlers {
        st.deferred.push(Box::new(move || func(event)));
    }
}

fn fire_sub_via_loop(st: &mut DisplayState, shared: &Arc<Shared>, stamp: u64, event: ChangeEvent) {
    let Ok(out) = st.output(stamp) else {
        return;
    };
    let handlers: Vec<ChangeHandler> = out.change_sub.iter().map(|e| e.func.clone()).collect();
    for func in handlers {
        shared.post_to_loop(st, Box::new(move || func(event)));
    }
}
