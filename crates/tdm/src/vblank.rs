//! The vblank engine: aligned periodic ticks per output.
//!
//! A handle subsamples the output's native refresh to a target fps, with a
//! per-client millisecond offset. When DPMS is on and the refresh divides
//! evenly by the fps, waits ride real hardware vblanks; otherwise a
//! software timer extrapolates the last known hardware tick, and with
//! fake mode enabled the timeline free-runs off the monotonic clock while
//! the panel is dark.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::display::{current_tid, Deferred, DisplayState, Shared, Tid, Token};
use crate::error::{Error, Result};
use crate::event_loop::SourceId;
use crate::output::{ChangeEvent, Output, WaitTarget};
use crate::thread::ThreadMessage;
use crate::types::{alloc_stamp, monotonic_us, Dpms};

/// One delivered tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VblankSample {
    pub sequence: u32,
    pub tv_sec: u64,
    pub tv_usec: u64,
}

/// Wait completion callback: the sample, or why the wait ended early.
pub type WaitHandler = Box<dyn FnOnce(std::result::Result<VblankSample, Error>) + Send>;

pub(crate) struct EngineWait {
    pub stamp: u64,
    pub interval: u32,
    pub target_seq: u32,
    pub target_us: u64,
    pub hw_interval: u32,
    pub owner: Tid,
    pub func: WaitHandler,
}

/// Engine state for one vblank handle.
pub(crate) struct VblankData {
    pub stamp: u64,
    pub output_stamp: u64,
    pub vrefresh: u32,
    pub fps: u32,
    pub offset_ms: i32,
    pub enable_fake: bool,
    pub sync: bool,
    pub dpms: Dpms,
    /// Re-derive the HW/SW decision before the next wait.
    pub recheck: bool,
    pub hw_enable: bool,
    pub hw_quotient: u32,
    /// Microseconds between delivered ticks at the target fps.
    pub vblank_gap: f64,
    /// Microseconds between hardware vblanks.
    pub hw_vblank_gap: f64,
    pub last_seq: u32,
    /// Time of the last delivered tick; 0 while the timeline is unknown.
    pub last_us: u64,
    pub hw_waits: Vec<EngineWait>,
    pub sw_waits: Vec<EngineWait>,
    /// Waits parked until the seeding hardware tick arrives.
    pub sw_pending: Vec<EngineWait>,
    pub sw_timer: Option<SourceId>,
}

/// Inputs of the per-wait target computation.
pub(crate) struct TargetInput {
    pub last_us: u64,
    pub last_seq: u32,
    pub vblank_gap: f64,
    pub hw_vblank_gap: f64,
    pub hw_quotient: u32,
    pub hw_enable: bool,
    pub req_us: u64,
    pub curr_us: u64,
    pub interval: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TargetResult {
    pub target_seq: u32,
    pub target_us: u64,
    pub hw_interval: u32,
}

/// Project the wait target onto the tick grid anchored at `last_us`.
pub(crate) fn calculate_target(p: &TargetInput) -> TargetResult {
    let mut skip = (p.req_us.saturating_sub(p.last_us) as f64 / p.vblank_gap) as u64;
    let prev = p.last_us + (skip as f64 * p.vblank_gap) as u64;

    if p.last_seq == 0 {
        skip = 0;
    }
    skip += p.interval as u64;

    let mut hw_interval = 0u32;
    let target_us;
    if p.hw_enable {
        let hw_skip = (p.curr_us.saturating_sub(prev) as f64 / p.hw_vblank_gap) as u64;
        let mut interval = p.interval as i64 * p.hw_quotient as i64 - hw_skip as i64;
        if interval < 1 {
            interval = 1;
        }
        hw_interval = interval as u32;
        target_us = prev + (interval as f64 * p.hw_vblank_gap) as u64;
    } else {
        let mut target = prev + (p.vblank_gap * p.interval as f64) as u64;
        while target < p.curr_us {
            target += p.vblank_gap as u64;
            skip += 1;
        }
        target_us = target;
    }

    TargetResult {
        target_seq: p.last_seq.wrapping_add(skip as u32),
        target_us,
        hw_interval,
    }
}

fn insert_by_target(list: &mut Vec<EngineWait>, wait: EngineWait) {
    let at = list
        .iter()
        .position(|w| w.target_us > wait.target_us)
        .unwrap_or(list.len());
    list.insert(at, wait);
}

fn insert_by_interval(list: &mut Vec<EngineWait>, wait: EngineWait) {
    let at = list
        .iter()
        .position(|w| w.interval > wait.interval)
        .unwrap_or(list.len());
    list.insert(at, wait);
}

/// Run `func` on its owner thread: locally when we are already there,
/// otherwise across the bridge.
fn deliver(st: &mut DisplayState, shared: &Arc<Shared>, owner: Tid, func: Deferred) {
    if owner == current_tid() || !shared.bridge.threaded {
        st.deferred.push(func);
    } else {
        let debug = st.debug.enabled(crate::debug::DebugFlags::THREAD);
        let _ = shared.bridge.send(ThreadMessage::Invoke(func), debug);
    }
}

/// A per-client tick source over one output.
///
/// Dropping the handle cancels outstanding waits with
/// [`Error::OperationFailed`].
pub struct Vblank {
    shared: Arc<Shared>,
    stamp: u64,
}

/// Register a new engine object over `output_stamp`. The output must have
/// a current mode.
pub(crate) fn create_internal(st: &mut DisplayState, output_stamp: u64) -> Result<u64> {
    let out = st.output_mut(output_stamp)?;
    let mode = out.backend.mode().map_err(|e| {
        tracing::error!(error = ?e, "vblank needs a current mode");
        Error::OperationFailed
    })?;
    if mode.vrefresh == 0 {
        return Err(Error::OperationFailed);
    }
    let dpms = match out.backend.dpms() {
        Ok(value) => value,
        Err(_) => out.dpms,
    };

    let stamp = alloc_stamp(|s| st.vblank_index(s).is_some());
    st.vblanks.push(VblankData {
        stamp,
        output_stamp,
        vrefresh: mode.vrefresh,
        fps: mode.vrefresh,
        offset_ms: 0,
        enable_fake: false,
        sync: false,
        dpms,
        recheck: true,
        hw_enable: false,
        hw_quotient: 1,
        vblank_gap: 0.0,
        hw_vblank_gap: 1_000_000f64 / mode.vrefresh as f64,
        last_seq: 0,
        last_us: 0,
        hw_waits: Vec::new(),
        sw_waits: Vec::new(),
        sw_pending: Vec::new(),
        sw_timer: None,
    });
    tracing::debug!(stamp, vrefresh = mode.vrefresh, dpms = %dpms, "vblank created");
    Ok(stamp)
}

impl Output {
    /// Create a vblank handle. The output must have a current mode.
    pub fn create_vblank(&self) -> Result<Vblank> {
        let shared = self.shared().clone();
        let output_stamp = self.stamp();
        let stamp = shared.with_state(|st| create_internal(st, output_stamp))?;
        Ok(Vblank { shared, stamp })
    }
}

impl Vblank {
    /// Target ticks per second; 1..= the output refresh. Changing it
    /// re-evaluates the HW/SW decision on the next wait.
    pub fn set_fps(&self, fps: u32) -> Result<()> {
        self.shared.with_state(|st| set_fps_internal(st, self.stamp, fps))
    }

    pub fn fps(&self) -> Result<u32> {
        self.shared.with_state(|st| Ok(vblank_mut(st, self.stamp)?.fps))
    }

    /// Shift the delivered timeline by `offset_ms` milliseconds.
    pub fn set_offset(&self, offset_ms: i32) -> Result<()> {
        self.shared.with_state(|st| set_offset_internal(st, self.stamp, offset_ms))
    }

    /// Keep ticking from the software clock while the output is off.
    pub fn set_enable_fake(&self, enable_fake: bool) -> Result<()> {
        self.shared
            .with_state(|st| set_enable_fake_internal(st, self.stamp, enable_fake))
    }

    /// Make `wait` block until its handler ran. Refused on the loop
    /// thread, which must keep dispatching.
    pub fn set_sync(&self, sync: bool) -> Result<()> {
        self.shared.with_state(|st| set_sync_internal(st, self.stamp, sync))
    }

    /// Request a tick `interval` periods after the previous one, stamping
    /// the request with the current time.
    pub fn wait(
        &self,
        interval: u32,
        func: impl FnOnce(std::result::Result<VblankSample, Error>) + Send + 'static,
    ) -> Result<()> {
        self.wait_at(monotonic_us(), interval, func)
    }

    /// Request a tick relative to a caller-provided request time in
    /// monotonic microseconds.
    pub fn wait_at(
        &self,
        req_us: u64,
        interval: u32,
        func: impl FnOnce(std::result::Result<VblankSample, Error>) + Send + 'static,
    ) -> Result<()> {
        let sync = self
            .shared
            .with_state(|st| Ok::<bool, Error>(vblank_mut(st, self.stamp)?.sync))?;
        if !sync {
            return self
                .shared
                .with_state(|st| wait_internal(st, &self.shared, self.stamp, req_us, interval, Box::new(func)));
        }

        if self.shared.bridge.threaded && self.shared.bridge.in_loop_thread() {
            // The loop thread cannot suspend in a nested dispatch.
            tracing::error!("synchronous vblank wait on the loop thread");
            return Err(Error::BadRequest);
        }

        let done = Arc::new(AtomicBool::new(false));
        let flag = done.clone();
        let wrapped: WaitHandler = Box::new(move |result| {
            func(result);
            flag.store(true, Ordering::SeqCst);
        });
        self.shared
            .with_state(|st| wait_internal(st, &self.shared, self.stamp, req_us, interval, wrapped))?;

        while !done.load(Ordering::SeqCst) {
            crate::display::poll_once(&self.shared, -1)?;
        }
        Ok(())
    }
}

impl Drop for Vblank {
    fn drop(&mut self) {
        let shared = self.shared.clone();
        let stamp = self.stamp;
        shared.with_state(|st| destroy_with_error(st, &shared, stamp));
    }
}

fn vblank_mut<'a>(st: &'a mut DisplayState, stamp: u64) -> Result<&'a mut VblankData> {
    let index = st.vblank_index(stamp).ok_or(Error::InvalidParameter)?;
    Ok(&mut st.vblanks[index])
}

/// Registry-side setters shared by the handle API and the wire server.
pub(crate) fn set_fps_internal(st: &mut DisplayState, stamp: u64, fps: u32) -> Result<()> {
    if fps == 0 {
        return Err(Error::InvalidParameter);
    }
    let vb = vblank_mut(st, stamp)?;
    if vb.fps != fps {
        vb.fps = fps;
        vb.recheck = true;
        tracing::debug!(stamp, fps, "vblank fps");
    }
    Ok(())
}

pub(crate) fn set_offset_internal(st: &mut DisplayState, stamp: u64, offset_ms: i32) -> Result<()> {
    let vb = vblank_mut(st, stamp)?;
    if vb.offset_ms != offset_ms {
        vb.offset_ms = offset_ms;
        vb.recheck = true;
        tracing::debug!(stamp, offset_ms, "vblank offset");
    }
    Ok(())
}

pub(crate) fn set_enable_fake_internal(
    st: &mut DisplayState,
    stamp: u64,
    enable_fake: bool,
) -> Result<()> {
    vblank_mut(st, stamp)?.enable_fake = enable_fake;
    Ok(())
}

pub(crate) fn set_sync_internal(st: &mut DisplayState, stamp: u64, sync: bool) -> Result<()> {
    vblank_mut(st, stamp)?.sync = sync;
    Ok(())
}

/// Core wait path; the caller routes sync semantics.
pub(crate) fn wait_internal(
    st: &mut DisplayState,
    shared: &Arc<Shared>,
    stamp: u64,
    req_us: u64,
    interval: u32,
    func: WaitHandler,
) -> Result<()> {
    let wait_stamp = st.next_token();
    let curr = monotonic_us();

    let (output_stamp, target, hw_enable) = {
        let vb = vblank_mut(st, stamp)?;
        if vb.dpms != Dpms::On && !vb.enable_fake {
            tracing::info!(stamp = vb.stamp, "wait refused, output powered down");
            return Err(Error::DpmsOff);
        }

        if vb.recheck {
            vb.recheck = false;
            vb.vblank_gap = 1_000_000f64 / vb.fps as f64;
            vb.hw_quotient = (vb.vrefresh / vb.fps).max(1);
            vb.hw_enable = vb.dpms == Dpms::On && vb.vrefresh % vb.fps == 0;
            tracing::info!(
                stamp = vb.stamp,
                fps = vb.fps,
                hw = vb.hw_enable,
                "vblank source decided"
            );
        }

        if !vb.hw_enable && vb.last_us == 0 {
            if vb.dpms == Dpms::On {
                // No timeline yet: park the wait and seed from hardware.
                let first = vb.sw_pending.is_empty();
                insert_by_interval(
                    &mut vb.sw_pending,
                    EngineWait {
                        stamp: wait_stamp,
                        interval,
                        target_seq: 0,
                        target_us: 0,
                        hw_interval: 0,
                        owner: current_tid(),
                        func,
                    },
                );
                let output_stamp = vb.output_stamp;
                let vblank_stamp = vb.stamp;
                if first {
                    let result = crate::output::wait_vblank_internal(
                        st,
                        output_stamp,
                        1,
                        false,
                        WaitTarget::EngineSeed { vblank: vblank_stamp },
                    );
                    if let Err(e) = result {
                        let vb = vblank_mut(st, stamp)?;
                        vb.sw_pending.retain(|w| w.stamp != wait_stamp);
                        return Err(e);
                    }
                }
                return Ok(());
            }
            // Panel dark with fake enabled: the timeline starts now.
            vb.last_us = curr;
        }

        let target = calculate_target(&TargetInput {
            last_us: vb.last_us,
            last_seq: vb.last_seq,
            vblank_gap: vb.vblank_gap,
            hw_vblank_gap: vb.hw_vblank_gap,
            hw_quotient: vb.hw_quotient,
            hw_enable: vb.hw_enable,
            req_us,
            curr_us: curr,
            interval,
        });

        let wait = EngineWait {
            stamp: wait_stamp,
            interval,
            target_seq: target.target_seq,
            target_us: target.target_us,
            hw_interval: target.hw_interval,
            owner: current_tid(),
            func,
        };
        if vb.hw_enable {
            insert_by_target(&mut vb.hw_waits, wait);
        } else {
            insert_by_target(&mut vb.sw_waits, wait);
        }
        (vb.output_stamp, target, vb.hw_enable)
    };

    if hw_enable {
        let result = crate::output::wait_vblank_internal(
            st,
            output_stamp,
            target.hw_interval,
            false,
            WaitTarget::Engine { vblank: stamp, wait: wait_stamp },
        );
        if let Err(e) = result {
            let vb = vblank_mut(st, stamp)?;
            vb.hw_waits.retain(|w| w.stamp != wait_stamp);
            return Err(e);
        }
    } else {
        sw_timer_update(st, stamp)?;
    }
    Ok(())
}

/// Re-arm the software timer for the earliest pending target.
fn sw_timer_update(st: &mut DisplayState, stamp: u64) -> Result<()> {
    let index = st.vblank_index(stamp).ok_or(Error::InvalidParameter)?;
    let Some(first) = st.vblanks[index].sw_waits.first() else {
        return Ok(());
    };
    let target = first.target_us;
    let curr = monotonic_us();
    let ms_delay = if target <= curr {
        1
    } else {
        ((target - curr) + 999) / 1_000
    }
    .max(1);

    if st.vblanks[index].sw_timer.is_none() {
        let source = st.event_loop.add_timer(Token::VblankTimer(stamp))?;
        st.vblanks[index].sw_timer = Some(source);
        tracing::info!(stamp, "software vblank timer armed");
    }
    let source = st.vblanks[index].sw_timer.expect("timer source just set");
    st.event_loop.update_timer(source, ms_delay)
}

/// The software timer fired: wake every wait sharing the earliest target.
pub(crate) fn timer_expired(st: &mut DisplayState, shared: &Arc<Shared>, stamp: u64) {
    let Some(index) = st.vblank_index(stamp) else {
        return;
    };

    let mut finished: Vec<EngineWait> = Vec::new();
    {
        let vb = &mut st.vblanks[index];
        let Some(first) = vb.sw_waits.first() else {
            return;
        };
        let first_target = first.target_us;
        vb.last_seq = first.target_seq;
        vb.last_us = first_target;
        while vb
            .sw_waits
            .first()
            .is_some_and(|w| w.target_us == first_target)
        {
            finished.push(vb.sw_waits.remove(0));
        }
    }

    for wait in finished {
        let sample = VblankSample {
            sequence: wait.target_seq,
            tv_sec: wait.target_us / 1_000_000,
            tv_usec: wait.target_us % 1_000_000,
        };
        let func = wait.func;
        deliver(st, shared, wait.owner, Box::new(move || func(Ok(sample))));
    }

    if let Err(e) = sw_timer_update(st, stamp) {
        tracing::error!(stamp, error = ?e, "software timer re-arm failed");
    }
}

/// A hardware wait issued by the engine completed.
pub(crate) fn complete_hw(
    st: &mut DisplayState,
    shared: &Arc<Shared>,
    vblank_stamp: u64,
    wait_stamp: u64,
    _sequence: u32,
    tv_sec: u64,
    tv_usec: u64,
) {
    let Some(index) = st.vblank_index(vblank_stamp) else {
        tracing::debug!(vblank_stamp, "hardware completion for a dead vblank");
        return;
    };
    let wait = {
        let vb = &mut st.vblanks[index];
        let Some(at) = vb.hw_waits.iter().position(|w| w.stamp == wait_stamp) else {
            tracing::debug!(wait_stamp, "hardware completion for a vanished wait");
            return;
        };
        let wait = vb.hw_waits.remove(at);
        vb.last_seq = wait.target_seq;
        vb.last_us = tv_sec * 1_000_000 + tv_usec;
        wait
    };

    let sample = VblankSample { sequence: wait.target_seq, tv_sec, tv_usec };
    let func = wait.func;
    deliver(st, shared, wait.owner, Box::new(move || func(Ok(sample))));
}

/// The seeding hardware tick arrived: anchor the timeline, complete the
/// shortest-interval waiters and restart the rest against real time.
pub(crate) fn seed_done(
    st: &mut DisplayState,
    shared: &Arc<Shared>,
    vblank_stamp: u64,
    _sequence: u32,
    tv_sec: u64,
    tv_usec: u64,
) {
    let Some(index) = st.vblank_index(vblank_stamp) else {
        return;
    };

    let (ready, requeue) = {
        let vb = &mut st.vblanks[index];
        let Some(first) = vb.sw_pending.first() else {
            return;
        };
        let min_interval = first.interval;

        let raw = (tv_sec * 1_000_000 + tv_usec) as i64;
        let anchor = (raw - vb.offset_ms as i64 * 1_000).max(0) as u64;
        vb.last_seq = min_interval;
        vb.last_us = anchor;

        let pending = std::mem::take(&mut vb.sw_pending);
        let mut ready = Vec::new();
        let mut requeue = Vec::new();
        for mut wait in pending {
            if wait.interval == min_interval {
                ready.push(wait);
            } else {
                wait.interval -= min_interval;
                requeue.push(wait);
            }
        }
        (ready, requeue)
    };

    let sequence = st.vblanks[index].last_seq;
    for wait in ready {
        let sample = VblankSample { sequence, tv_sec, tv_usec };
        let func = wait.func;
        deliver(st, shared, wait.owner, Box::new(move || func(Ok(sample))));
    }

    for wait in requeue {
        let interval = wait.interval;
        if let Err(e) = wait_requeue(st, shared, vblank_stamp, interval, wait) {
            tracing::error!(error = ?e, "re-queueing a seeded wait failed");
        }
    }
}

/// Put a parked wait back through the software path now that the timeline
/// is known.
fn wait_requeue(
    st: &mut DisplayState,
    _shared: &Arc<Shared>,
    stamp: u64,
    interval: u32,
    wait: EngineWait,
) -> Result<()> {
    let curr = monotonic_us();
    {
        let vb = vblank_mut(st, stamp)?;
        let target = calculate_target(&TargetInput {
            last_us: vb.last_us,
            last_seq: vb.last_seq,
            vblank_gap: vb.vblank_gap,
            hw_vblank_gap: vb.hw_vblank_gap,
            hw_quotient: vb.hw_quotient,
            hw_enable: false,
            req_us: curr,
            curr_us: curr,
            interval,
        });
        let requeued = EngineWait {
            target_seq: target.target_seq,
            target_us: target.target_us,
            hw_interval: 0,
            ..wait
        };
        insert_by_target(&mut vb.sw_waits, requeued);
    }
    sw_timer_update(st, stamp)
}

/// Output change hook: runs before any user change handler so waits are
/// reclassified (or failed) first.
pub(crate) fn on_output_change(
    st: &mut DisplayState,
    shared: &Arc<Shared>,
    output_stamp: u64,
    event: ChangeEvent,
) {
    let stamps: Vec<u64> = st
        .vblanks
        .iter()
        .filter(|vb| vb.output_stamp == output_stamp)
        .map(|vb| vb.stamp)
        .collect();

    for stamp in stamps {
        match event {
            ChangeEvent::Dpms(value) => {
                let (reclassify, fail): (Vec<EngineWait>, Vec<EngineWait>) = {
                    let Ok(vb) = vblank_mut(st, stamp) else { continue };
                    if vb.dpms == value {
                        continue;
                    }
                    tracing::info!(stamp, dpms = %value, "vblank saw dpms change");
                    vb.dpms = value;
                    vb.recheck = true;
                    if value == Dpms::On {
                        continue;
                    }
                    let drained = std::mem::take(&mut vb.hw_waits);
                    if vb.enable_fake {
                        (drained, Vec::new())
                    } else {
                        (Vec::new(), drained)
                    }
                };

                for wait in reclassify {
                    // Targets were already computed; just move the wait to
                    // the software list and keep ticking.
                    if let Ok(vb) = vblank_mut(st, stamp) {
                        insert_by_target(&mut vb.sw_waits, wait);
                    }
                }
                if let Err(e) = sw_timer_update(st, stamp) {
                    tracing::error!(stamp, error = ?e, "timer update after dpms change failed");
                }

                for wait in fail {
                    let func = wait.func;
                    deliver(st, shared, wait.owner, Box::new(move || func(Err(Error::DpmsOff))));
                }
            }
            ChangeEvent::Connection(status) => {
                if status == crate::types::ConnStatus::Disconnected {
                    if let Ok(vb) = vblank_mut(st, stamp) {
                        // The change handler tells the compositor; waits
                        // just vanish.
                        vb.hw_waits.clear();
                    }
                }
            }
        }
    }
}

/// Tear a vblank down, failing whatever is still in flight.
pub(crate) fn destroy_with_error(st: &mut DisplayState, shared: &Arc<Shared>, stamp: u64) {
    let Some(index) = st.vblank_index(stamp) else {
        return;
    };
    let mut vb = st.vblanks.remove(index);
    if let Some(source) = vb.sw_timer.take() {
        let _ = st.event_loop.remove_timer(source);
    }
    for wait in vb
        .hw_waits
        .drain(..)
        .chain(vb.sw_waits.drain(..))
        .chain(vb.sw_pending.drain(..))
    {
        let func = wait.func;
        deliver(st, shared, wait.owner, Box::new(move || func(Err(Error::OperationFailed))));
    }
    tracing::debug!(stamp, "vblank destroyed");
}

/// Registry-side teardown without callback delivery (display shutdown).
pub(crate) fn destroy_internal(st: &mut DisplayState, stamp: u64) {
    let Some(index) = st.vblank_index(stamp) else {
        return;
    };
    let mut vb = st.vblanks.remove(index);
    if let Some(source) = vb.sw_timer.take() {
        let _ = st.event_loop.remove_timer(source);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> TargetInput {
        TargetInput {
            last_us: 1_000_000,
            last_seq: 10,
            vblank_gap: 1_000_000.0 / 60.0,
            hw_vblank_gap: 1_000_000.0 / 60.0,
            hw_quotient: 1,
            hw_enable: true,
            req_us: 1_000_000,
            curr_us: 1_000_000,
            interval: 1,
        }
    }

    #[test]
    fn hw_target_one_interval_ahead() {
        let result = calculate_target(&base());
        assert_eq!(result.target_seq, 11);
        assert_eq!(result.hw_interval, 1);
        assert_eq!(result.target_us, 1_000_000 + 16_666);
    }

    #[test]
    fn hw_subsampling_uses_quotient() {
        let mut input = base();
        input.vblank_gap = 1_000_000.0 / 30.0;
        input.hw_quotient = 2;
        let result = calculate_target(&input);
        assert_eq!(result.hw_interval, 2);
        assert_eq!(result.target_us, 1_000_000 + 33_333);
    }

    #[test]
    fn hw_interval_never_below_one() {
        let mut input = base();
        // The caller is far behind the grid; elapsed hardware ticks eat
        // the whole interval.
        input.curr_us = 1_200_000;
        input.req_us = 1_000_000;
        let result = calculate_target(&input);
        assert_eq!(result.hw_interval, 1);
    }

    #[test]
    fn first_wait_starts_the_sequence() {
        let mut input = base();
        input.last_seq = 0;
        input.req_us = 1_500_000;
        let result = calculate_target(&input);
        // Elapsed periods are ignored before the first delivery.
        assert_eq!(result.target_seq, 1);
    }

    #[test]
    fn sw_target_skips_past_current_time() {
        let mut input = base();
        input.hw_enable = false;
        input.vblank_gap = 1_000_000.0 / 45.0;
        input.curr_us = 1_100_000;
        let result = calculate_target(&input);
        assert!(result.target_us >= input.curr_us);
        assert_eq!(result.hw_interval, 0);
        // Sequence accounts for the skipped periods.
        assert!(result.target_seq > 11);
    }

    #[test]
    fn sw_interval_spacing_matches_fps() {
        let mut input = base();
        input.hw_enable = false;
        input.vblank_gap = 1_000_000.0 / 30.0;
        input.req_us = input.last_us;
        input.curr_us = input.last_us;
        let one = calculate_target(&input);
        input.interval = 2;
        let two = calculate_target(&input);
        let gap = two.target_us - one.target_us;
        assert!((33_332..=33_334).contains(&gap), "gap {gap}");
    }
}
