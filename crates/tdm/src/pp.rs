//! The memory-to-memory post-processor pipeline.
//!
//! Attached (src, dst) pairs queue up until commit moves them in-flight;
//! the backend reports each pair done in order, at which point both
//! buffers are released and the done handler runs on its owner thread.

use std::sync::Arc;

use crate::backend::PpBackend;
use crate::buffer::Surface;
use crate::caps::{DisplayCapabilities, PpCapabilities, PpCaps};
use crate::debug::{DebugFlags, DumpFlags};
use crate::display::{current_tid, Display, DisplayState, Shared, Tid};
use crate::error::{Error, Result};
use crate::thread::ThreadMessage;
use crate::types::{Format, PpInfo};

/// Completion handler: `(src, dst)` of the finished pair.
pub type DoneHandler = Arc<dyn Fn(&Surface, &Surface) + Send + Sync>;

pub(crate) struct PpData {
    pub stamp: u64,
    pub backend: Box<dyn PpBackend>,
    pub owner: Tid,
    pub pending: Vec<(Surface, Surface)>,
    pub committed: Vec<(Surface, Surface)>,
    pub done: Option<DoneHandler>,
}

/// Handle to one post-processor. Dropping it releases every outstanding
/// buffer pair.
pub struct Pp {
    shared: Arc<Shared>,
    stamp: u64,
}

impl Display {
    /// Spin up a converter instance. Requires the PP capability bit.
    pub fn create_pp(&self) -> Result<Pp> {
        let shared = self.shared.clone();
        let stamp = shared.with_state(|st| {
            if !st.caps.capabilities.contains(DisplayCapabilities::PP) {
                tracing::error!("backend offers no pp engine");
                return Err(Error::NoCapability);
            }
            let stamp = crate::types::alloc_stamp(|s| st.pp_index(s).is_some());
            let sink = st.sink.clone();
            let mut backend = st.backend_mut()?.create_pp()?;
            backend.set_done_handler(sink, stamp)?;
            st.pps.push(PpData {
                stamp,
                backend,
                owner: current_tid(),
                pending: Vec::new(),
                committed: Vec::new(),
                done: None,
            });
            tracing::debug!(stamp, "pp created");
            Ok(stamp)
        })?;
        Ok(Pp { shared, stamp })
    }

    /// PP feature bits, when the engine exists.
    pub fn pp_capabilities(&self) -> Result<PpCapabilities> {
        self.shared.with_state(|st| {
            let caps = st.caps_pp.as_ref().ok_or(Error::NoCapability)?;
            Ok(caps.capabilities)
        })
    }

    pub fn pp_available_formats(&self) -> Result<Vec<Format>> {
        self.shared.with_state(|st| {
            let caps = st.caps_pp.as_ref().ok_or(Error::NoCapability)?;
            Ok(caps.formats.clone())
        })
    }

    /// `(min_w, min_h, max_w, max_h, preferred_align)` for PP surfaces.
    pub fn pp_available_size(&self) -> Result<(i32, i32, i32, i32, i32)> {
        self.shared.with_state(|st| {
            let caps: &PpCaps = st.caps_pp.as_ref().ok_or(Error::NoCapability)?;
            Ok((caps.min_w, caps.min_h, caps.max_w, caps.max_h, caps.preferred_align))
        })
    }
}

impl Pp {
    fn pp_mut<'a>(st: &'a mut DisplayState, stamp: u64) -> Result<&'a mut PpData> {
        let index = st.pp_index(stamp).ok_or(Error::InvalidParameter)?;
        Ok(&mut st.pps[index])
    }

    pub fn set_info(&self, info: &PpInfo) -> Result<()> {
        self.shared.with_state(|st| {
            let pp = Self::pp_mut(st, self.stamp)?;
            tracing::info!(
                stamp = pp.stamp,
                src = ?info.src.pos,
                dst = ?info.dst.pos,
                src_format = %info.src.format,
                dst_format = %info.dst.format,
                transform = ?info.transform,
                sync = info.sync,
                "pp info"
            );
            let result = pp.backend.set_info(info);
            if let Err(e) = &result {
                tracing::warn!(error = ?e, "backend rejected pp info");
            }
            result
        })
    }

    /// Completion callback for finished pairs, delivered on this thread.
    pub fn set_done_handler(
        &self,
        func: impl Fn(&Surface, &Surface) + Send + Sync + 'static,
    ) -> Result<()> {
        self.shared.with_state(|st| {
            let pp = Self::pp_mut(st, self.stamp)?;
            pp.owner = current_tid();
            pp.done = Some(Arc::new(func));
            Ok(())
        })
    }

    /// Queue a conversion pair. Both surfaces hold a backend reference
    /// until their done callback.
    pub fn attach(&self, src: &Surface, dst: &Surface) -> Result<()> {
        self.shared.with_state(|st| {
            let max_attach = st
                .caps_pp
                .as_ref()
                .map(|caps| caps.max_attach_count)
                .unwrap_or(0);
            let honor_limit = st.abi_at_least(1, 2) && max_attach > 0;

            {
                let pp = Self::pp_mut(st, self.stamp)?;
                if honor_limit && pp.pending.len() + pp.committed.len() >= max_attach as usize {
                    tracing::debug!(max_attach, "pp attach over budget");
                    return Err(Error::BadRequest);
                }
            }

            if st.debug.dump_enabled(DumpFlags::PP) {
                crate::dump::dump_pp_buffer(&mut st.debug, "src", src);
            }

            let pp = Self::pp_mut(st, self.stamp)?;
            pp.backend.attach(src, dst)?;
            pp.pending.push((src.ref_backend(), dst.ref_backend()));
            let pending = pp.pending.len();

            if st.debug.enabled(DebugFlags::PP) {
                tracing::debug!(
                    stamp = self.stamp,
                    pending,
                    src = src.id(),
                    dst = dst.id(),
                    "pp attached"
                );
            }
            Ok(())
        })
    }

    /// Push every pending pair to the hardware. On backend failure the
    /// pairs just moved are rolled back and released.
    pub fn commit(&self) -> Result<()> {
        self.shared.with_state(|st| {
            let mut released = Vec::new();
            let result = {
                let pp = Self::pp_mut(st, self.stamp)?;
                let moved = pp.pending.len();
                let drained: Vec<_> = pp.pending.drain(..).collect();
                pp.committed.extend(drained);

                let result = pp.backend.commit();
                if result.is_err() {
                    tracing::error!(stamp = pp.stamp, error = ?result, "pp commit failed");
                    let keep = pp.committed.len() - moved;
                    for (src, dst) in pp.committed.split_off(keep) {
                        src.unref_backend_deferred(&mut released);
                        dst.unref_backend_deferred(&mut released);
                    }
                }
                result
            };
            st.deferred.append(&mut released);
            result
        })
    }
}

impl Drop for Pp {
    fn drop(&mut self) {
        let shared = self.shared.clone();
        shared.with_state(|st| destroy_internal(st, self.stamp));
    }
}

/// Release everything a PP still holds and drop it from the registry.
pub(crate) fn destroy_internal(st: &mut DisplayState, stamp: u64) {
    let Some(index) = st.pp_index(stamp) else {
        return;
    };
    let mut pp = st.pps.remove(index);
    let outstanding = pp.pending.len() + pp.committed.len();
    if outstanding > 0 {
        tracing::warn!(stamp, outstanding, "pp destroyed with unfinished pairs");
    }
    let mut released = Vec::new();
    for (src, dst) in pp.pending.drain(..).chain(pp.committed.drain(..)) {
        src.unref_backend_deferred(&mut released);
        dst.unref_backend_deferred(&mut released);
    }
    st.deferred.append(&mut released);
    // The backend object drops here, after its buffers are accounted for.
}

/// A conversion finished; expected in FIFO order relative to commit.
pub(crate) fn on_done_event(
    st: &mut DisplayState,
    shared: &Arc<Shared>,
    stamp: u64,
    src: Surface,
    dst: Surface,
) {
    let Some(index) = st.pp_index(stamp) else {
        tracing::warn!(stamp, "done event for dead pp");
        return;
    };

    let owner = st.pps[index].owner;
    if owner != current_tid() && shared.bridge.in_loop_thread() {
        let debug = st.debug.enabled(DebugFlags::THREAD);
        let _ = shared.bridge.send(ThreadMessage::PpDone { pp: stamp, src, dst }, debug);
        return;
    }

    if st.debug.dump_enabled(DumpFlags::PP) {
        crate::dump::dump_pp_buffer(&mut st.debug, "dst", &dst);
    }
    if st.debug.enabled(DebugFlags::PP) || st.debug.enabled(DebugFlags::BUFFER) {
        tracing::debug!(stamp, src = src.id(), dst = dst.id(), "pp done");
    }

    let mut released = Vec::new();
    let done = {
        let pp = &mut st.pps[index];
        match pp.committed.first() {
            Some((head_src, head_dst)) if *head_src == src && *head_dst == dst => {}
            Some((head_src, head_dst)) => {
                tracing::warn!(
                    expected_src = head_src.id(),
                    expected_dst = head_dst.id(),
                    got_src = src.id(),
                    got_dst = dst.id(),
                    "pp completion out of order"
                );
            }
            None => {
                tracing::warn!(stamp, "pp completion with empty in-flight list");
            }
        }

        let Some(at) = pp
            .committed
            .iter()
            .position(|(s, d)| *s == src && *d == dst)
        else {
            return;
        };
        let (held_src, held_dst) = pp.committed.remove(at);
        held_src.unref_backend_deferred(&mut released);
        held_dst.unref_backend_deferred(&mut released);
        pp.done.clone()
    };
    st.deferred.append(&mut released);

    if let Some(func) = done {
        st.deferred.push(Box::new(move || func(&src, &dst)));
    }
}
