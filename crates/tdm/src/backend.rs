//! The backend ABI.
//!
//! A vendor module exports a single [`BackendModule`] descriptor under the
//! symbol `tdm_backend_module_data`. Its `init` entry produces the display
//! function table; per-object tables ([`OutputBackend`], [`LayerBackend`],
//! [`PpBackend`], [`CaptureBackend`]) hang off it. Optional entry points
//! are default methods answering [`Error::NotImplemented`]; entries without
//! a default are mandatory. Backend teardown is `Drop`.
//!
//! Hardware events flow the other way through an [`EventSink`] handed to
//! the backend by the handler-registration entries: the backend pushes
//! typed events while servicing `handle_events()`, and the frontend drains
//! them under the global lock.

use std::collections::VecDeque;
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex};

use crate::buffer::Surface;
use crate::caps::{CaptureCaps, DisplayCaps, LayerCaps, OutputCaps, PpCaps};
use crate::error::{Error, Result};
use crate::types::{CaptureInfo, ConnStatus, Dpms, LayerInfo, OutputMode, PpInfo, Value};

/// ABI major version of this frontend. A module built for a different
/// major does not load.
pub const ABI_MAJOR: u32 = 1;
/// ABI minor version of this frontend. Modules with a newer minor do not
/// load; older minors do.
pub const ABI_MINOR: u32 = 2;

/// The symbol a vendor module exports.
pub const MODULE_DATA_SYMBOL: &[u8] = b"tdm_backend_module_data";

/// Pack (major, minor) into the 32-bit ABI version field.
pub const fn abi_version(major: u32, minor: u32) -> u32 {
    (major << 16) | (minor & 0xffff)
}

pub const fn abi_major(version: u32) -> u32 {
    version >> 16
}

pub const fn abi_minor(version: u32) -> u32 {
    version & 0xffff
}

/// What the frontend hands a module at init time.
pub struct InitContext {
    /// Master DRM fd inherited from the session manager
    /// (`TDM_DRM_MASTER_FD`), when the platform provides one. The module
    /// borrows it; the frontend keeps ownership.
    pub drm_master_fd: Option<RawFd>,
}

/// Module init entry: build the backend and return its display table.
pub type ModuleInitFn = fn(&InitContext) -> Result<Box<dyn Backend>>;

/// The one exported descriptor of a backend module.
///
/// `name` and `vendor` must be non-empty; `abi_version` is checked against
/// the frontend before `init` runs.
pub struct BackendModule {
    pub name: &'static str,
    pub vendor: &'static str,
    pub abi_version: u32,
    pub init: ModuleInitFn,
}

/// An event produced by the backend.
///
/// `token` values echo the token the frontend passed with the triggering
/// request (`wait_vblank`, `commit`) or handler registration (status, PP
/// and capture done).
#[derive(Clone)]
pub enum BackendEvent {
    Vblank {
        token: u64,
        sequence: u32,
        tv_sec: u64,
        tv_usec: u64,
    },
    Commit {
        token: u64,
        sequence: u32,
        tv_sec: u64,
        tv_usec: u64,
    },
    Status {
        token: u64,
        status: ConnStatus,
    },
    PpDone {
        token: u64,
        src: Surface,
        dst: Surface,
    },
    CaptureDone {
        token: u64,
        buffer: Surface,
    },
}

/// Queue the backend pushes events into; drained by the frontend after
/// each `handle_events()` round, under the global lock.
#[derive(Clone, Default)]
pub struct EventSink {
    queue: Arc<Mutex<VecDeque<BackendEvent>>>,
}

impl EventSink {
    pub fn new() -> EventSink {
        EventSink::default()
    }

    pub fn push(&self, event: BackendEvent) {
        self.queue.lock().expect("event sink poisoned").push_back(event);
    }

    pub(crate) fn drain(&self) -> Vec<BackendEvent> {
        let mut queue = self.queue.lock().expect("event sink poisoned");
        queue.drain(..).collect()
    }
}

/// Display-level function table.
///
/// `capabilities` and `outputs` are the mandatory minimum. A backend that
/// sets the PP (capture) capability bit must also answer the corresponding
/// entries; the frontend verifies that at load time and rejects the module
/// otherwise.
pub trait Backend: Send {
    fn capabilities(&mut self) -> Result<DisplayCaps>;

    /// Enumerate connectors. Called once at init and again on explicit
    /// display updates.
    fn outputs(&mut self) -> Result<Vec<Box<dyn OutputBackend>>>;

    /// Event fd, if the hardware delivers events through one. The frontend
    /// watches it and calls `handle_events` when it becomes readable.
    fn fd(&self) -> Option<RawFd> {
        None
    }

    fn handle_events(&mut self) -> Result<()> {
        Err(Error::NotImplemented)
    }

    fn pp_capabilities(&mut self) -> Result<PpCaps> {
        Err(Error::NotImplemented)
    }

    fn create_pp(&mut self) -> Result<Box<dyn PpBackend>> {
        Err(Error::NotImplemented)
    }

    fn capture_capabilities(&mut self) -> Result<CaptureCaps> {
        Err(Error::NotImplemented)
    }
}

/// Per-connector function table.
pub trait OutputBackend: Send {
    fn capability(&mut self) -> Result<OutputCaps>;

    /// Enumerate the hardware planes of this connector.
    fn layers(&mut self) -> Result<Vec<Box<dyn LayerBackend>>>;

    fn set_property(&mut self, _id: u32, _value: Value) -> Result<()> {
        Err(Error::NotImplemented)
    }

    fn property(&mut self, _id: u32) -> Result<Value> {
        Err(Error::NotImplemented)
    }

    /// Request a vblank event `interval` periods from now; completion
    /// arrives as [`BackendEvent::Vblank`] carrying `token`.
    fn wait_vblank(&mut self, _interval: u32, _sync: bool, _token: u64) -> Result<()> {
        Err(Error::NotImplemented)
    }

    fn set_vblank_handler(&mut self, _sink: EventSink) -> Result<()> {
        Err(Error::NotImplemented)
    }

    /// Latch the pending plane state; completion arrives as
    /// [`BackendEvent::Commit`] carrying `token`.
    fn commit(&mut self, _sync: bool, _token: u64) -> Result<()> {
        Err(Error::NotImplemented)
    }

    fn set_commit_handler(&mut self, _sink: EventSink) -> Result<()> {
        Err(Error::NotImplemented)
    }

    /// Register for connection change events; they arrive as
    /// [`BackendEvent::Status`] carrying `token`.
    fn set_status_handler(&mut self, _sink: EventSink, _token: u64) -> Result<()> {
        Err(Error::NotImplemented)
    }

    fn set_dpms(&mut self, _dpms: Dpms) -> Result<()> {
        Err(Error::NotImplemented)
    }

    fn dpms(&mut self) -> Result<Dpms> {
        Err(Error::NotImplemented)
    }

    fn set_mode(&mut self, _mode: &OutputMode) -> Result<()> {
        Err(Error::NotImplemented)
    }

    fn mode(&mut self) -> Result<OutputMode> {
        Err(Error::NotImplemented)
    }

    fn create_capture(&mut self) -> Result<Box<dyn CaptureBackend>> {
        Err(Error::NotImplemented)
    }
}

/// Per-plane function table.
pub trait LayerBackend: Send {
    fn capability(&mut self) -> Result<LayerCaps>;

    fn set_property(&mut self, _id: u32, _value: Value) -> Result<()> {
        Err(Error::NotImplemented)
    }

    fn property(&mut self, _id: u32) -> Result<Value> {
        Err(Error::NotImplemented)
    }

    fn set_info(&mut self, _info: &LayerInfo) -> Result<()> {
        Err(Error::NotImplemented)
    }

    fn info(&mut self) -> Result<LayerInfo> {
        Err(Error::NotImplemented)
    }

    fn set_buffer(&mut self, _buffer: &Surface) -> Result<()> {
        Err(Error::NotImplemented)
    }

    fn unset_buffer(&mut self) -> Result<()> {
        Err(Error::NotImplemented)
    }

    /// Move a video plane in the zpos space outside the graphic range.
    fn set_video_pos(&mut self, _zpos: i32) -> Result<()> {
        Err(Error::NotImplemented)
    }

    fn buffer_flags(&mut self) -> Result<u32> {
        Err(Error::NotImplemented)
    }

    fn create_capture(&mut self) -> Result<Box<dyn CaptureBackend>> {
        Err(Error::NotImplemented)
    }
}

/// Memory-to-memory converter table. `commit` and `set_done_handler` are
/// mandatory; teardown is `Drop`.
pub trait PpBackend: Send {
    fn set_info(&mut self, _info: &PpInfo) -> Result<()> {
        Err(Error::NotImplemented)
    }

    fn attach(&mut self, _src: &Surface, _dst: &Surface) -> Result<()> {
        Err(Error::NotImplemented)
    }

    fn commit(&mut self) -> Result<()>;

    /// Completions arrive as [`BackendEvent::PpDone`] carrying `token`, in
    /// attach/commit order.
    fn set_done_handler(&mut self, sink: EventSink, token: u64) -> Result<()>;
}

/// Readback engine table. `commit` and `set_done_handler` are mandatory;
/// teardown is `Drop`.
pub trait CaptureBackend: Send {
    fn set_info(&mut self, _info: &CaptureInfo) -> Result<()> {
        Err(Error::NotImplemented)
    }

    fn attach(&mut self, _buffer: &Surface) -> Result<()> {
        Err(Error::NotImplemented)
    }

    fn commit(&mut self) -> Result<()>;

    /// Completions arrive as [`BackendEvent::CaptureDone`] carrying
    /// `token`, one per filled buffer.
    fn set_done_handler(&mut self, sink: EventSink, token: u64) -> Result<()>;
}

/// Validate a module descriptor against this frontend's ABI.
pub(crate) fn check_module(module: &BackendModule) -> Result<()> {
    check_abi(module.name, module.vendor, module.abi_version)
}

/// The ABI acceptance rules: non-empty identity, equal major, minor not
/// newer than the frontend's.
pub(crate) fn check_abi(name: &str, vendor: &str, version: u32) -> Result<()> {
    tracing::info!(frontend = %format!("{ABI_MAJOR}.{ABI_MINOR}"), "backend ABI");

    if name.is_empty() {
        tracing::error!("backend module has no name");
        return Err(Error::BadModule);
    }
    if vendor.is_empty() {
        tracing::error!(module = name, "backend module has no vendor");
        return Err(Error::BadModule);
    }

    let major = abi_major(version);
    let minor = abi_minor(version);

    tracing::info!(
        module = name,
        vendor = vendor,
        version = %format!("{major}.{minor}"),
        "backend module"
    );

    if major != ABI_MAJOR {
        tracing::error!(module = name, major, "ABI major version mismatch");
        return Err(Error::BadModule);
    }
    if minor > ABI_MINOR {
        tracing::error!(module = name, minor, "ABI minor version too new");
        return Err(Error::BadModule);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abi_packing_roundtrips() {
        let v = abi_version(1, 2);
        assert_eq!(abi_major(v), 1);
        assert_eq!(abi_minor(v), 2);
    }

    fn module(name: &'static str, vendor: &'static str, version: u32) -> BackendModule {
        BackendModule {
            name,
            vendor,
            abi_version: version,
            init: |_| Err(Error::NotImplemented),
        }
    }

    #[test]
    fn rejects_bad_descriptors() {
        let ok = abi_version(ABI_MAJOR, ABI_MINOR);
        assert_eq!(check_module(&module("", "acme", ok)), Err(Error::BadModule));
        assert_eq!(check_module(&module("drm", "", ok)), Err(Error::BadModule));
        assert_eq!(
            check_module(&module("drm", "acme", abi_version(ABI_MAJOR + 1, 0))),
            Err(Error::BadModule)
        );
        assert_eq!(
            check_module(&module("drm", "acme", abi_version(ABI_MAJOR, ABI_MINOR + 1))),
            Err(Error::BadModule)
        );
        assert_eq!(check_module(&module("drm", "acme", ok)), Ok(()));
    }
}
