//! Framebuffer capture: one-shot or periodic readback into client-owned
//! buffers, attached to a whole output or a single layer.

use std::sync::Arc;

use crate::backend::CaptureBackend;
use crate::buffer::Surface;
use crate::caps::{CaptureCapabilities, DisplayCapabilities};
use crate::debug::{DebugFlags, DumpFlags};
use crate::display::{current_tid, Display, DisplayState, Shared, Tid};
use crate::error::{Error, Result};
use crate::layer::Layer;
use crate::output::Output;
use crate::thread::ThreadMessage;
use crate::types::{CaptureInfo, Format};

/// Completion handler: the filled destination buffer.
pub type DoneHandler = Arc<dyn Fn(&Surface) + Send + Sync>;

pub(crate) struct CaptureData {
    pub stamp: u64,
    pub backend: Box<dyn CaptureBackend>,
    pub owner: Tid,
    pub attached: Vec<Surface>,
    pub done: Option<DoneHandler>,
}

/// Handle to one readback engine. Dropping it releases the attached
/// buffers.
pub struct Capture {
    shared: Arc<Shared>,
    stamp: u64,
}

impl Display {
    /// Capture feature bits, when the engine exists.
    pub fn capture_capabilities(&self) -> Result<CaptureCapabilities> {
        self.shared.with_state(|st| {
            let caps = st.caps_capture.as_ref().ok_or(Error::NoCapability)?;
            Ok(caps.capabilities)
        })
    }

    pub fn capture_available_formats(&self) -> Result<Vec<Format>> {
        self.shared.with_state(|st| {
            let caps = st.caps_capture.as_ref().ok_or(Error::NoCapability)?;
            Ok(caps.formats.clone())
        })
    }
}

fn register(
    st: &mut DisplayState,
    backend_result: Result<Box<dyn CaptureBackend>>,
) -> Result<u64> {
    let mut backend = backend_result?;
    let stamp = crate::types::alloc_stamp(|s| st.capture_index(s).is_some());
    backend.set_done_handler(st.sink.clone(), stamp)?;
    st.captures.push(CaptureData {
        stamp,
        backend,
        owner: current_tid(),
        attached: Vec::new(),
        done: None,
    });
    tracing::debug!(stamp, "capture created");
    Ok(stamp)
}

impl Output {
    /// Read back the composited scanout of this output.
    pub fn create_capture(&self) -> Result<Capture> {
        let shared = self.shared().clone();
        let stamp = shared.with_state(|st| {
            if !st.caps.capabilities.contains(DisplayCapabilities::CAPTURE) {
                tracing::error!("backend offers no capture engine");
                return Err(Error::NoCapability);
            }
            let backend_result = st.output_mut(self.stamp())?.backend.create_capture();
            register(st, backend_result)
        })?;
        Ok(Capture { shared, stamp })
    }
}

impl Layer {
    /// Read back a single plane.
    pub fn create_capture(&self) -> Result<Capture> {
        let shared = self.shared().clone();
        let output = self.output_stamp();
        let index = self.index();
        let stamp = shared.with_state(|st| {
            if !st.caps.capabilities.contains(DisplayCapabilities::CAPTURE) {
                tracing::error!("backend offers no capture engine");
                return Err(Error::NoCapability);
            }
            let oi = st.output_index(output).ok_or(Error::InvalidParameter)?;
            let layer = st.outputs[oi]
                .layers
                .get_mut(index)
                .ok_or(Error::InvalidParameter)?;
            let backend_result = layer.backend.create_capture();
            register(st, backend_result)
        })?;
        Ok(Capture { shared, stamp })
    }
}

impl Capture {
    fn capture_mut<'a>(st: &'a mut DisplayState, stamp: u64) -> Result<&'a mut CaptureData> {
        let index = st.capture_index(stamp).ok_or(Error::InvalidParameter)?;
        Ok(&mut st.captures[index])
    }

    pub fn set_info(&self, info: &CaptureInfo) -> Result<()> {
        self.shared.with_state(|st| {
            let capture = Self::capture_mut(st, self.stamp)?;
            capture.backend.set_info(info)
        })
    }

    /// Completion callback for filled buffers, delivered on this thread.
    pub fn set_done_handler(
        &self,
        func: impl Fn(&Surface) + Send + Sync + 'static,
    ) -> Result<()> {
        self.shared.with_state(|st| {
            let capture = Self::capture_mut(st, self.stamp)?;
            capture.owner = current_tid();
            capture.done = Some(Arc::new(func));
            Ok(())
        })
    }

    /// Enqueue a destination buffer; it stays referenced until reported
    /// done. Periodic captures rotate through whatever is attached.
    pub fn attach(&self, buffer: &Surface) -> Result<()> {
        self.shared.with_state(|st| {
            let capture = Self::capture_mut(st, self.stamp)?;
            capture.backend.attach(buffer)?;
            capture.attached.push(buffer.ref_backend());
            Ok(())
        })
    }

    /// Start the engine.
    pub fn commit(&self) -> Result<()> {
        self.shared.with_state(|st| {
            let capture = Self::capture_mut(st, self.stamp)?;
            capture.backend.commit()
        })
    }
}

impl Drop for Capture {
    fn drop(&mut self) {
        let shared = self.shared.clone();
        shared.with_state(|st| destroy_internal(st, self.stamp));
    }
}

/// Release attached buffers and drop the engine from the registry.
pub(crate) fn destroy_internal(st: &mut DisplayState, stamp: u64) {
    let Some(index) = st.capture_index(stamp) else {
        return;
    };
    let mut capture = st.captures.remove(index);
    let mut released = Vec::new();
    for buffer in capture.attached.drain(..) {
        buffer.unref_backend_deferred(&mut released);
    }
    st.deferred.append(&mut released);
}

/// The backend filled one destination buffer.
pub(crate) fn on_done_event(
    st: &mut DisplayState,
    shared: &Arc<Shared>,
    stamp: u64,
    buffer: Surface,
) {
    let Some(index) = st.capture_index(stamp) else {
        tracing::warn!(stamp, "done event for dead capture");
        return;
    };

    let owner = st.captures[index].owner;
    if owner != current_tid() && shared.bridge.in_loop_thread() {
        let debug = st.debug.enabled(DebugFlags::THREAD);
        let _ = shared
            .bridge
            .send(ThreadMessage::CaptureDone { capture: stamp, buffer }, debug);
        return;
    }

    if st.debug.dump_enabled(DumpFlags::CAPTURE) {
        crate::dump::dump_capture_buffer(&mut st.debug, stamp, &buffer);
    }
    if st.debug.enabled(DebugFlags::CAPTURE) {
        tracing::debug!(stamp, buffer = buffer.id(), "capture done");
    }

    let mut released = Vec::new();
    let done = {
        let capture = &mut st.captures[index];
        let Some(at) = capture.attached.iter().position(|b| *b == buffer) else {
            tracing::warn!(stamp, buffer = buffer.id(), "capture done for unattached buffer");
            return;
        };
        // Release exactly the surface the hardware reports; rotation is
        // the backend's business.
        let held = capture.attached.remove(at);
        held.unref_backend_deferred(&mut released);
        capture.done.clone()
    };
    st.deferred.append(&mut released);

    if let Some(func) = done {
        st.deferred.push(Box::new(move || func(&buffer)));
    }
}
