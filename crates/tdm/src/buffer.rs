//! Surfaces and the buffer lifetime tracker.
//!
//! [`Surface`] is the narrow interface to the external allocator: a
//! reference-counted pixel buffer with a user-data slot. The tracker
//! record in that slot carries the backend refcount plus the release and
//! destroy handler lists that guarantee a producer gets its buffer back
//! exactly once after the hardware stops reading it.

use std::fmt;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::display::Deferred;
use crate::types::{Format, HandlerId};

/// Every live tracked surface, for the debug channel's buffer listing.
/// Dead entries are pruned lazily on alloc and on dump.
static LIVE: Mutex<Vec<Weak<SurfaceInner>>> = Mutex::new(Vec::new());

/// Release handler: the backend refcount dropped to zero, the producer may
/// reuse the buffer.
pub type ReleaseHandler = Arc<dyn Fn(&Surface) + Send + Sync>;

/// Destroy handler: the allocator is tearing the buffer down for good.
pub type DestroyHandler = Arc<dyn Fn() + Send + Sync>;

/// One plane of a surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Plane {
    pub stride: u32,
    pub offset: u32,
    pub size: u32,
}

#[derive(Default)]
struct TrackRecord {
    backend_refs: u32,
    release: Vec<(HandlerId, ReleaseHandler)>,
    destroy: Vec<(HandlerId, DestroyHandler)>,
}

struct SurfaceInner {
    id: u64,
    width: u32,
    height: u32,
    format: Format,
    planes: Vec<Plane>,
    data: Mutex<Vec<u8>>,
    record: Mutex<TrackRecord>,
}

impl Drop for SurfaceInner {
    fn drop(&mut self) {
        // The allocator destroy path: releases have drained by now unless
        // someone leaked a backend ref.
        let record = self.record.get_mut().expect("buffer record poisoned");
        if record.backend_refs > 0 {
            tracing::error!(
                surface = self.id,
                refs = record.backend_refs,
                "surface destroyed with live backend refs"
            );
        }
        for (_, handler) in record.destroy.drain(..) {
            handler();
        }
    }
}

/// A pixel buffer handle. Clones share the same storage; the last clone
/// dropping is the allocator destroy point.
#[derive(Clone)]
pub struct Surface {
    inner: Arc<SurfaceInner>,
}

impl Surface {
    /// Allocate a CPU-backed surface. Plane layout follows the format
    /// (packed RGB single plane, NV12 two planes, YUV420 three).
    pub fn alloc(width: u32, height: u32, format: Format) -> Surface {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);

        let planes = plane_layout(width, height, format);
        let total: u32 = planes.iter().map(|p| p.size).sum();

        let inner = Arc::new(SurfaceInner {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            width,
            height,
            format,
            planes,
            data: Mutex::new(vec![0; total as usize]),
            record: Mutex::new(TrackRecord::default()),
        });

        let mut live = LIVE.lock().expect("live buffer list poisoned");
        live.retain(|weak| weak.strong_count() > 0);
        live.push(Arc::downgrade(&inner));
        drop(live);

        Surface { inner }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn width(&self) -> u32 {
        self.inner.width
    }

    pub fn height(&self) -> u32 {
        self.inner.height
    }

    pub fn format(&self) -> Format {
        self.inner.format
    }

    pub fn planes(&self) -> &[Plane] {
        &self.inner.planes
    }

    /// Map the backing store for CPU access.
    pub fn map(&self) -> MutexGuard<'_, Vec<u8>> {
        self.inner.data.lock().expect("surface data poisoned")
    }

    /// Take a backend reference: the hardware (or an engine queue) is
    /// about to read this buffer. Returns the clone the caller should hold
    /// for the duration.
    pub fn ref_backend(&self) -> Surface {
        let mut record = self.record();
        record.backend_refs += 1;
        let refs_after = record.backend_refs;
        drop(record);
        tracing::trace!(surface = self.id(), refs = refs_after, "backend ref");
        self.clone()
    }

    /// Drop one backend reference. When the count reaches zero the release
    /// handlers run in registration order, each with a transient ref held
    /// across the call. Must not be called with the display lock held;
    /// frontend-internal paths use the deferred variant instead.
    pub fn unref_backend(self) {
        let mut deferred = Vec::new();
        self.unref_backend_deferred(&mut deferred);
        for callback in deferred {
            callback();
        }
    }

    /// Deferred-release variant used under the global lock: the release
    /// handlers are pushed onto `deferred` and run by the unlocking
    /// wrapper.
    pub(crate) fn unref_backend_deferred(self, deferred: &mut Vec<Deferred>) {
        let mut record = self.record();
        if record.backend_refs == 0 {
            tracing::error!(surface = self.id(), "backend unref underflow");
            return;
        }
        record.backend_refs -= 1;
        if record.backend_refs > 0 {
            return;
        }
        let handlers: Vec<ReleaseHandler> =
            record.release.iter().map(|(_, h)| h.clone()).collect();
        drop(record);

        tracing::trace!(surface = self.id(), "backend refs drained");
        deferred.push(Box::new(move || {
            for handler in handlers {
                let transient = self.clone();
                handler(&transient);
            }
            // `self` (the holder's allocator ref) drops here.
        }));
    }

    pub fn add_release_handler(
        &self,
        handler: impl Fn(&Surface) + Send + Sync + 'static,
    ) -> HandlerId {
        let id = HandlerId::next();
        self.record().release.push((id, Arc::new(handler)));
        id
    }

    pub fn remove_release_handler(&self, id: HandlerId) {
        self.record().release.retain(|(h, _)| *h != id);
    }

    pub fn add_destroy_handler(&self, handler: impl Fn() + Send + Sync + 'static) -> HandlerId {
        let id = HandlerId::next();
        self.record().destroy.push((id, Arc::new(handler)));
        id
    }

    pub fn remove_destroy_handler(&self, id: HandlerId) {
        self.record().destroy.retain(|(h, _)| *h != id);
    }

    /// Current backend refcount; diagnostic only.
    pub fn backend_refs(&self) -> u32 {
        self.record().backend_refs
    }

    fn record(&self) -> MutexGuard<'_, TrackRecord> {
        self.inner.record.lock().expect("buffer record poisoned")
    }
}

impl PartialEq for Surface {
    fn eq(&self, other: &Surface) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Surface {}

impl fmt::Debug for Surface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Surface")
            .field("id", &self.inner.id)
            .field("size", &format_args!("{}x{}", self.inner.width, self.inner.height))
            .field("format", &self.inner.format)
            .finish()
    }
}

/// Append one line per live tracked surface: id, geometry, format and the
/// current backend refcount. Feeds the wire debug channel.
pub(crate) fn dump_live(out: &mut String) {
    let mut live = LIVE.lock().expect("live buffer list poisoned");
    live.retain(|weak| weak.strong_count() > 0);

    if live.is_empty() {
        out.push_str("\t(none)\n");
        return;
    }
    for weak in live.iter() {
        let Some(inner) = weak.upgrade() else {
            continue;
        };
        let refs = inner.record.lock().expect("buffer record poisoned").backend_refs;
        let _ = writeln!(
            out,
            "\tbuffer {}: {}x{} {} backend_refs {}",
            inner.id, inner.width, inner.height, inner.format, refs
        );
    }
}

fn plane_layout(width: u32, height: u32, format: Format) -> Vec<Plane> {
    let stride = width * format.bpp();
    match format.plane_count() {
        2 => {
            // NV12-style: full-res luma plane plus interleaved half-res chroma.
            let luma = Plane { stride: width, offset: 0, size: width * height };
            let chroma = Plane {
                stride: width,
                offset: luma.size,
                size: width * height / 2,
            };
            vec![luma, chroma]
        }
        3 => {
            let luma = Plane { stride: width, offset: 0, size: width * height };
            let cb = Plane {
                stride: width / 2,
                offset: luma.size,
                size: width * height / 4,
            };
            let cr = Plane {
                stride: width / 2,
                offset: luma.size + cb.size,
                size: width * height / 4,
            };
            vec![luma, cb, cr]
        }
        _ => vec![Plane { stride, offset: 0, size: stride * height }],
    }
}

// ---------------------------------------------------------------------------
// Producer queue

type QueueCallback = Arc<dyn Fn(&SurfaceQueue) + Send + Sync>;

struct QueueInner {
    acquirable: Mutex<std::collections::VecDeque<Surface>>,
    acquirable_cbs: Mutex<Vec<(HandlerId, QueueCallback)>>,
    destroy_cbs: Mutex<Vec<(HandlerId, QueueCallback)>>,
    released: Mutex<Vec<Surface>>,
    dead: std::sync::atomic::AtomicBool,
}

/// A producer-owned queue of surfaces a layer can be bound to.
///
/// The producer enqueues rendered buffers; the display acquires them,
/// scans them out and releases them back once replaced.
#[derive(Clone)]
pub struct SurfaceQueue {
    inner: Arc<QueueInner>,
}

impl Default for SurfaceQueue {
    fn default() -> Self {
        SurfaceQueue::new()
    }
}

impl SurfaceQueue {
    pub fn new() -> SurfaceQueue {
        SurfaceQueue {
            inner: Arc::new(QueueInner {
                acquirable: Mutex::new(std::collections::VecDeque::new()),
                acquirable_cbs: Mutex::new(Vec::new()),
                destroy_cbs: Mutex::new(Vec::new()),
                released: Mutex::new(Vec::new()),
                dead: std::sync::atomic::AtomicBool::new(false),
            }),
        }
    }

    /// Producer side: hand a rendered buffer to the consumer. Fires the
    /// acquirable callbacks.
    pub fn enqueue(&self, surface: Surface) {
        if self.is_dead() {
            return;
        }
        self.inner.acquirable.lock().unwrap().push_back(surface);
        let cbs: Vec<QueueCallback> = self
            .inner
            .acquirable_cbs
            .lock()
            .unwrap()
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for cb in cbs {
            cb(self);
        }
    }

    /// Consumer side: take the oldest rendered buffer.
    pub fn acquire(&self) -> Option<Surface> {
        self.inner.acquirable.lock().unwrap().pop_front()
    }

    /// Consumer side: return a buffer to the producer's free pool.
    pub fn release(&self, surface: Surface) {
        if self.is_dead() {
            return;
        }
        self.inner.released.lock().unwrap().push(surface);
    }

    /// Producer side: reclaim released buffers.
    pub fn dequeue_released(&self) -> Vec<Surface> {
        std::mem::take(&mut self.inner.released.lock().unwrap())
    }

    pub fn add_acquirable_handler(
        &self,
        cb: impl Fn(&SurfaceQueue) + Send + Sync + 'static,
    ) -> HandlerId {
        let id = HandlerId::next();
        self.inner.acquirable_cbs.lock().unwrap().push((id, Arc::new(cb)));
        id
    }

    pub fn remove_acquirable_handler(&self, id: HandlerId) {
        self.inner.acquirable_cbs.lock().unwrap().retain(|(h, _)| *h != id);
    }

    pub fn add_destroy_handler(
        &self,
        cb: impl Fn(&SurfaceQueue) + Send + Sync + 'static,
    ) -> HandlerId {
        let id = HandlerId::next();
        self.inner.destroy_cbs.lock().unwrap().push((id, Arc::new(cb)));
        id
    }

    pub fn remove_destroy_handler(&self, id: HandlerId) {
        self.inner.destroy_cbs.lock().unwrap().retain(|(h, _)| *h != id);
    }

    /// Producer side: tear the queue down. Consumers holding clones see it
    /// dead; destroy callbacks fire once.
    pub fn destroy(&self) {
        if self.inner.dead.swap(true, std::sync::atomic::Ordering::SeqCst) {
            return;
        }
        let cbs: Vec<QueueCallback> = self
            .inner
            .destroy_cbs
            .lock()
            .unwrap()
            .drain(..)
            .map(|(_, cb)| cb)
            .collect();
        for cb in cbs {
            cb(self);
        }
        self.inner.acquirable.lock().unwrap().clear();
    }

    pub fn is_dead(&self) -> bool {
        self.inner.dead.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub(crate) fn same_queue(&self, other: &SurfaceQueue) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn release_fires_once_per_drained_cycle_in_order() {
        let surface = Surface::alloc(64, 64, Format::ARGB8888);
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = order.clone();
        surface.add_release_handler(move |_| o.lock().unwrap().push("first"));
        let o = order.clone();
        surface.add_release_handler(move |_| o.lock().unwrap().push("second"));

        let held = surface.ref_backend();
        let also_held = surface.ref_backend();

        let mut deferred = Vec::new();
        held.unref_backend_deferred(&mut deferred);
        assert!(deferred.is_empty(), "refs remain, nothing scheduled");

        also_held.unref_backend_deferred(&mut deferred);
        assert_eq!(deferred.len(), 1);
        for f in deferred.drain(..) {
            f();
        }
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn destroy_fires_after_last_clone() {
        let fired = Arc::new(AtomicUsize::new(0));
        let surface = Surface::alloc(16, 16, Format::XRGB8888);
        let f = fired.clone();
        surface.add_destroy_handler(move || {
            f.fetch_add(1, Ordering::SeqCst);
        });

        let clone = surface.clone();
        drop(surface);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        drop(clone);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn removed_handler_does_not_fire() {
        let surface = Surface::alloc(8, 8, Format::ARGB8888);
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let id = surface.add_release_handler(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        surface.remove_release_handler(id);

        let held = surface.ref_backend();
        let mut deferred = Vec::new();
        held.unref_backend_deferred(&mut deferred);
        for f in deferred {
            f();
        }
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn yuv_plane_layout() {
        let nv12 = Surface::alloc(64, 32, Format::NV12);
        assert_eq!(nv12.planes().len(), 2);
        assert_eq!(nv12.planes()[1].offset, 64 * 32);

        let yu12 = Surface::alloc(64, 32, Format::YUV420);
        assert_eq!(yu12.planes().len(), 3);
        assert_eq!(yu12.map().len(), 64 * 32 * 3 / 2);
    }

    #[test]
    fn live_listing_follows_surface_lifetime() {
        let surface = Surface::alloc(320, 240, Format::ARGB8888);
        let held = surface.ref_backend();
        let line = format!("buffer {}: 320x240 AR24 backend_refs 1", surface.id());

        let mut report = String::new();
        dump_live(&mut report);
        assert!(report.contains(&line), "missing from listing: {report}");

        let id = surface.id();
        let mut deferred = Vec::new();
        held.unref_backend_deferred(&mut deferred);
        for f in deferred {
            f();
        }
        drop(surface);

        let mut report = String::new();
        dump_live(&mut report);
        assert!(
            !report.contains(&format!("buffer {id}:")),
            "destroyed surface still listed: {report}"
        );
    }

    #[test]
    fn queue_flow() {
        let queue = SurfaceQueue::new();
        let notified = Arc::new(AtomicUsize::new(0));
        let n = notified.clone();
        queue.add_acquirable_handler(move |_| {
            n.fetch_add(1, Ordering::SeqCst);
        });

        queue.enqueue(Surface::alloc(4, 4, Format::ARGB8888));
        assert_eq!(notified.load(Ordering::SeqCst), 1);

        let got = queue.acquire().expect("queued surface");
        queue.release(got);
        assert_eq!(queue.dequeue_released().len(), 1);

        queue.destroy();
        assert!(queue.is_dead());
        queue.enqueue(Surface::alloc(4, 4, Format::ARGB8888));
        assert!(queue.acquire().is_none());
    }
}
