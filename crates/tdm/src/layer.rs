//! Layer operations: plane geometry, buffer submission and producer-queue
//! binding.
//!
//! Submitted buffers stage through three slots. `set_buffer` fills
//! `pending`; a successful commit advances it to `waiting`; the commit
//! completion rotates `waiting` into `showing` and releases whatever was
//! showing before. Each slot holds at most one buffer, so an overwritten
//! occupant is released immediately.

use std::sync::Arc;

use crate::backend::LayerBackend;
use crate::buffer::{Surface, SurfaceQueue};
use crate::caps::{LayerCapabilities, LayerCaps};
use crate::debug::{DebugFlags, DumpFlags};
use crate::display::{Deferred, DisplayState, Shared};
use crate::error::{Error, Result};
use crate::types::{Format, HandlerId, LayerInfo, Prop, Value};

pub(crate) struct QueueBinding {
    pub queue: SurfaceQueue,
    acquirable: HandlerId,
    destroy: HandlerId,
}

/// Frontend state of one hardware plane.
pub(crate) struct LayerData {
    pub backend: Box<dyn LayerBackend>,
    pub caps: LayerCaps,
    pub usable: bool,
    pub pending: Option<Surface>,
    pub waiting: Option<Surface>,
    pub showing: Option<Surface>,
    pub queue: Option<QueueBinding>,
}

impl LayerData {
    pub fn new(backend: Box<dyn LayerBackend>, caps: LayerCaps) -> LayerData {
        LayerData {
            backend,
            caps,
            usable: true,
            pending: None,
            waiting: None,
            showing: None,
            queue: None,
        }
    }

    /// Commit accepted: pending becomes waiting. A waiting buffer from a
    /// still-unfinished earlier commit is released.
    pub fn advance_pending(&mut self, deferred: &mut Vec<Deferred>) {
        if self.pending.is_none() {
            return;
        }
        if let Some(old) = self.waiting.take() {
            if let Some(binding) = &self.queue {
                binding.queue.release(old.clone());
            }
            old.unref_backend_deferred(deferred);
        }
        self.waiting = self.pending.take();
    }

    /// Commit completed: waiting becomes showing; the previous showing
    /// buffer goes back to its producer.
    pub fn rotate_showing(&mut self, deferred: &mut Vec<Deferred>, debug: bool) {
        if self.waiting.is_none() {
            return;
        }
        if let Some(old) = self.showing.take() {
            if let Some(binding) = &self.queue {
                binding.queue.release(old.clone());
            }
            old.unref_backend_deferred(deferred);
        }
        self.showing = self.waiting.take();
        if debug {
            tracing::debug!(
                showing = self.showing.as_ref().map(Surface::id),
                "layer buffer rotated"
            );
        }
    }

    /// Drop every staged buffer reference (unplug, rebuild, teardown).
    pub fn release_buffers(&mut self, deferred: &mut Vec<Deferred>) {
        for slot in [&mut self.pending, &mut self.waiting, &mut self.showing] {
            if let Some(buffer) = slot.take() {
                if let Some(binding) = &self.queue {
                    binding.queue.release(buffer.clone());
                }
                buffer.unref_backend_deferred(deferred);
            }
        }
        if let Some(binding) = self.queue.take() {
            binding.queue.remove_acquirable_handler(binding.acquirable);
            binding.queue.remove_destroy_handler(binding.destroy);
        }
    }
}

/// Handle to one hardware plane of an output.
#[derive(Clone)]
pub struct Layer {
    shared: Arc<Shared>,
    output: u64,
    index: usize,
}

impl Layer {
    pub(crate) fn new(shared: Arc<Shared>, output: u64, index: usize) -> Layer {
        Layer { shared, output, index }
    }

    pub(crate) fn output_stamp(&self) -> u64 {
        self.output
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    fn with_layer<R>(&self, f: impl FnOnce(&mut DisplayState, usize, usize) -> Result<R>) -> Result<R> {
        self.shared.with_state(|st| {
            let oi = st.output_index(self.output).ok_or(Error::InvalidParameter)?;
            if self.index >= st.outputs[oi].layers.len() {
                return Err(Error::InvalidParameter);
            }
            f(st, oi, self.index)
        })
    }

    pub fn capabilities(&self) -> Result<LayerCapabilities> {
        self.with_layer(|st, oi, li| Ok(st.outputs[oi].layers[li].caps.capabilities))
    }

    pub fn available_formats(&self) -> Result<Vec<Format>> {
        self.with_layer(|st, oi, li| Ok(st.outputs[oi].layers[li].caps.formats.clone()))
    }

    pub fn available_properties(&self) -> Result<Vec<Prop>> {
        self.with_layer(|st, oi, li| Ok(st.outputs[oi].layers[li].caps.props.clone()))
    }

    pub fn zpos(&self) -> Result<i32> {
        self.with_layer(|st, oi, li| Ok(st.outputs[oi].layers[li].caps.zpos))
    }

    pub fn set_property(&self, id: u32, value: Value) -> Result<()> {
        self.with_layer(|st, oi, li| st.outputs[oi].layers[li].backend.set_property(id, value))
    }

    pub fn property(&self, id: u32) -> Result<Value> {
        self.with_layer(|st, oi, li| st.outputs[oi].layers[li].backend.property(id))
    }

    /// Push scanout geometry to the backend. Nothing is cached here; a
    /// backend rejection is logged and surfaced unchanged.
    pub fn set_info(&self, info: &LayerInfo) -> Result<()> {
        self.with_layer(|st, oi, li| {
            let layer = &mut st.outputs[oi].layers[li];
            layer.usable = false;
            tracing::info!(
                src = ?info.src_pos,
                dst = ?info.dst_pos,
                format = %info.format,
                transform = ?info.transform,
                "layer info"
            );
            let result = layer.backend.set_info(info);
            if let Err(e) = &result {
                tracing::warn!(error = ?e, "backend rejected layer info");
            }
            result
        })
    }

    pub fn info(&self) -> Result<LayerInfo> {
        self.with_layer(|st, oi, li| st.outputs[oi].layers[li].backend.info())
    }

    /// Stage `buffer` for the next commit. Takes a backend reference that
    /// is dropped when the buffer stops showing (or is displaced).
    pub fn set_buffer(&self, buffer: &Surface) -> Result<()> {
        self.with_layer(|st, oi, li| {
            let pipe = st.outputs[oi].pipe;
            let zpos = st.outputs[oi].layers[li].caps.zpos;
            let buffer_debug = st.debug.enabled(DebugFlags::BUFFER);

            {
                let layer = &mut st.outputs[oi].layers[li];
                layer.usable = false;
                layer.backend.set_buffer(buffer)?;
            }

            if st.debug.dump_enabled(DumpFlags::LAYER) {
                crate::dump::dump_layer_buffer(&mut st.debug, pipe, zpos, buffer);
            }

            let mut released = Vec::new();
            let layer = &mut st.outputs[oi].layers[li];
            if let Some(old) = layer.pending.take() {
                old.unref_backend_deferred(&mut released);
            }
            layer.pending = Some(buffer.ref_backend());
            if buffer_debug {
                tracing::debug!(pipe, zpos, buffer = buffer.id(), "layer buffer staged");
            }
            st.deferred.append(&mut released);
            Ok(())
        })
    }

    /// Clear the plane and drop every staged reference; the layer becomes
    /// usable again.
    pub fn unset_buffer(&self) -> Result<()> {
        self.with_layer(|st, oi, li| {
            let mut released = Vec::new();
            let layer = &mut st.outputs[oi].layers[li];
            for slot in [&mut layer.pending, &mut layer.waiting, &mut layer.showing] {
                if let Some(buffer) = slot.take() {
                    if let Some(binding) = &layer.queue {
                        binding.queue.release(buffer.clone());
                    }
                    buffer.unref_backend_deferred(&mut released);
                }
            }
            layer.usable = true;
            let result = layer.backend.unset_buffer();
            st.deferred.append(&mut released);
            result
        })
    }

    pub fn is_usable(&self) -> Result<bool> {
        self.with_layer(|st, oi, li| Ok(st.outputs[oi].layers[li].usable))
    }

    /// The buffer currently on screen, if any.
    pub fn displaying_buffer(&self) -> Result<Option<Surface>> {
        self.with_layer(|st, oi, li| Ok(st.outputs[oi].layers[li].showing.clone()))
    }

    /// Bind a producer queue: each buffer the producer enqueues is
    /// acquired, staged and committed with no user handler.
    pub fn set_buffer_queue(&self, queue: &SurfaceQueue) -> Result<()> {
        let shared = Arc::downgrade(&self.shared);
        let output = self.output;
        let index = self.index;

        self.with_layer(|st, oi, li| {
            let layer = &mut st.outputs[oi].layers[li];
            layer.usable = false;

            if let Some(binding) = &layer.queue {
                if binding.queue.same_queue(queue) {
                    return Ok(());
                }
            }

            let mut released = Vec::new();
            if let Some(old) = layer.pending.take() {
                if let Some(binding) = &layer.queue {
                    binding.queue.release(old.clone());
                }
                old.unref_backend_deferred(&mut released);
            }
            if let Some(binding) = layer.queue.take() {
                binding.queue.remove_acquirable_handler(binding.acquirable);
                binding.queue.remove_destroy_handler(binding.destroy);
            }

            let weak = shared.clone();
            let acquirable = queue.add_acquirable_handler(move |_| {
                if let Some(shared) = weak.upgrade() {
                    on_queue_acquirable(&shared, output, index);
                }
            });
            let weak = shared.clone();
            let destroy = queue.add_destroy_handler(move |_| {
                if let Some(shared) = weak.upgrade() {
                    on_queue_destroyed(&shared, output, index);
                }
            });

            st.outputs[oi].layers[li].queue = Some(QueueBinding {
                queue: queue.clone(),
                acquirable,
                destroy,
            });
            st.deferred.append(&mut released);
            Ok(())
        })
    }

    /// Unbind the producer queue, returning in-flight buffers to it.
    pub fn unset_buffer_queue(&self) -> Result<()> {
        self.with_layer(|st, oi, li| {
            let mut released = Vec::new();
            let layer = &mut st.outputs[oi].layers[li];
            for slot in [&mut layer.pending, &mut layer.waiting, &mut layer.showing] {
                if let Some(buffer) = slot.take() {
                    if let Some(binding) = &layer.queue {
                        binding.queue.release(buffer.clone());
                    }
                    buffer.unref_backend_deferred(&mut released);
                }
            }
            if let Some(binding) = layer.queue.take() {
                binding.queue.remove_acquirable_handler(binding.acquirable);
                binding.queue.remove_destroy_handler(binding.destroy);
            }
            layer.usable = true;
            let result = layer.backend.unset_buffer();
            st.deferred.append(&mut released);
            result
        })
    }

    /// Position a video plane; its zpos space is disjoint from the
    /// graphic layers'.
    pub fn set_video_pos(&self, zpos: i32) -> Result<()> {
        self.with_layer(|st, oi, li| {
            let layer = &mut st.outputs[oi].layers[li];
            if !layer.caps.capabilities.contains(LayerCapabilities::VIDEO) {
                tracing::error!("set_video_pos on a non-video layer");
                return Err(Error::InvalidParameter);
            }
            layer.backend.set_video_pos(zpos)
        })
    }

    pub fn buffer_flags(&self) -> Result<u32> {
        self.with_layer(|st, oi, li| st.outputs[oi].layers[li].backend.buffer_flags())
    }
}

/// The producer rendered a new buffer: acquire it, stage it, commit.
fn on_queue_acquirable(shared: &Arc<Shared>, output: u64, index: usize) {
    shared.with_state(|st| {
        let Some(oi) = st.output_index(output) else {
            return;
        };
        let Some(layer) = st.outputs[oi].layers.get_mut(index) else {
            return;
        };
        let Some(binding) = &layer.queue else {
            return;
        };
        let Some(surface) = binding.queue.acquire() else {
            tracing::error!("queue signalled acquirable but had nothing");
            return;
        };

        if let Err(e) = layer.backend.set_buffer(&surface) {
            tracing::warn!(error = ?e, "backend rejected queued buffer");
            return;
        }

        let mut released = Vec::new();
        if let Some(old) = layer.pending.take() {
            if let Some(binding) = &layer.queue {
                binding.queue.release(old.clone());
            }
            old.unref_backend_deferred(&mut released);
        }
        layer.pending = Some(surface.ref_backend());
        st.deferred.append(&mut released);

        if let Err(e) = crate::output::commit_internal(st, output, false, None) {
            tracing::error!(error = ?e, "queued-buffer commit failed");
        }
    });
}

/// The producer tore its queue down: drop in-flight refs and unbind.
fn on_queue_destroyed(shared: &Arc<Shared>, output: u64, index: usize) {
    shared.with_state(|st| {
        let Some(oi) = st.output_index(output) else {
            return;
        };
        let Some(layer) = st.outputs[oi].layers.get_mut(index) else {
            return;
        };
        let mut released = Vec::new();
        for slot in [&mut layer.pending, &mut layer.waiting] {
            if let Some(buffer) = slot.take() {
                buffer.unref_backend_deferred(&mut released);
            }
        }
        layer.queue = None;
        st.deferred.append(&mut released);
    });
}
