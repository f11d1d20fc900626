//! Capability snapshots.
//!
//! The frontend queries the backend once at init (and again per output on
//! hot-plug updates) and serves every getter from these caches; the backend
//! is never re-entered for enumeration.

use bitflags::bitflags;

use crate::types::{ConnStatus, ConnectorType, Format, OutputMode, Prop};

bitflags! {
    /// Aggregate display features advertised by the backend.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct DisplayCapabilities: u32 {
        const PP = 1 << 0;
        const CAPTURE = 1 << 1;
    }
}

bitflags! {
    /// What a hardware composition plane can do.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct LayerCapabilities: u32 {
        const CURSOR = 1 << 0;
        const PRIMARY = 1 << 1;
        const OVERLAY = 1 << 2;
        const GRAPHIC = 1 << 4;
        const VIDEO = 1 << 5;
        const SCANOUT = 1 << 8;
        const RESERVED = 1 << 9;
        const NO_CROP = 1 << 10;
        const SCALE = 1 << 12;
        const TRANSFORM = 1 << 13;
    }
}

bitflags! {
    /// Post-processor features.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct PpCapabilities: u32 {
        const SYNC = 1 << 0;
        const ASYNC = 1 << 1;
        const SCALE = 1 << 4;
        const TRANSFORM = 1 << 5;
    }
}

bitflags! {
    /// Capture engine features.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct CaptureCapabilities: u32 {
        const ONESHOT = 1 << 0;
        const STREAM = 1 << 1;
        const SCALE = 1 << 4;
        const TRANSFORM = 1 << 5;
    }
}

/// Display-wide capabilities.
#[derive(Debug, Clone, Default)]
pub struct DisplayCaps {
    pub capabilities: DisplayCapabilities,
    /// Maximum usable layers across all outputs; -1 when the backend does
    /// not constrain it.
    pub max_layer_count: i32,
}

/// Everything the backend reports about one connector.
#[derive(Debug, Clone)]
pub struct OutputCaps {
    pub maker: String,
    pub model: String,
    pub name: String,
    pub status: ConnStatus,
    pub connector_type: ConnectorType,
    pub modes: Vec<OutputMode>,
    pub props: Vec<Prop>,
    pub mm_width: u32,
    pub mm_height: u32,
    pub subpixel: u32,
    pub min_w: i32,
    pub min_h: i32,
    pub max_w: i32,
    pub max_h: i32,
    pub preferred_align: i32,
}

impl Default for OutputCaps {
    fn default() -> Self {
        OutputCaps {
            maker: String::new(),
            model: String::new(),
            name: String::new(),
            status: ConnStatus::Disconnected,
            connector_type: ConnectorType::Unknown,
            modes: Vec::new(),
            props: Vec::new(),
            mm_width: 0,
            mm_height: 0,
            subpixel: 0,
            min_w: -1,
            min_h: -1,
            max_w: -1,
            max_h: -1,
            preferred_align: -1,
        }
    }
}

/// Per-layer capability snapshot.
#[derive(Debug, Clone, Default)]
pub struct LayerCaps {
    pub capabilities: LayerCapabilities,
    pub zpos: i32,
    pub formats: Vec<Format>,
    pub props: Vec<Prop>,
}

/// Post-processor limits.
#[derive(Debug, Clone, Default)]
pub struct PpCaps {
    pub capabilities: PpCapabilities,
    pub formats: Vec<Format>,
    pub min_w: i32,
    pub min_h: i32,
    pub max_w: i32,
    pub max_h: i32,
    pub preferred_align: i32,
    /// Upper bound on attached (src, dst) pairs; 0 means unlimited.
    pub max_attach_count: u32,
}

/// Capture engine limits.
#[derive(Debug, Clone, Default)]
pub struct CaptureCaps {
    pub capabilities: CaptureCapabilities,
    pub formats: Vec<Format>,
}
