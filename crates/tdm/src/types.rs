//! Common value types: pixel formats, modes, power states, geometry,
//! properties and the monotonic clock helpers used for stamps and vblank
//! timing.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A fourcc pixel format code (drm_fourcc numbering).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Format(pub u32);

impl Format {
    pub const ARGB8888: Format = Format::fourcc(b"AR24");
    pub const XRGB8888: Format = Format::fourcc(b"XR24");
    pub const RGB565: Format = Format::fourcc(b"RG16");
    pub const NV12: Format = Format::fourcc(b"NV12");
    pub const NV21: Format = Format::fourcc(b"NV21");
    pub const YUV420: Format = Format::fourcc(b"YU12");
    pub const YVU420: Format = Format::fourcc(b"YV12");

    pub const fn fourcc(code: &[u8; 4]) -> Format {
        Format(
            code[0] as u32
                | (code[1] as u32) << 8
                | (code[2] as u32) << 16
                | (code[3] as u32) << 24,
        )
    }

    /// 32-bit single-plane RGB formats get PNG dumps; everything else raw.
    pub fn is_rgb32(self) -> bool {
        self == Format::ARGB8888 || self == Format::XRGB8888
    }

    /// Number of planes a surface of this format carries.
    pub fn plane_count(self) -> usize {
        match self {
            Format::NV12 | Format::NV21 => 2,
            Format::YUV420 | Format::YVU420 => 3,
            _ => 1,
        }
    }

    /// Bytes per pixel of the first plane.
    pub fn bpp(self) -> u32 {
        match self {
            Format::ARGB8888 | Format::XRGB8888 => 4,
            Format::RGB565 => 2,
            _ => 1,
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for c in self.0.to_le_bytes() {
            let c = if c.is_ascii_graphic() { c as char } else { '?' };
            write!(f, "{c}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Format({self})")
    }
}

/// Connection state of an output connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnStatus {
    Disconnected = 0,
    Connected = 1,
    ModeSetted = 2,
}

impl fmt::Display for ConnStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnStatus::Disconnected => "disconnected",
            ConnStatus::Connected => "connected",
            ConnStatus::ModeSetted => "mode_setted",
        };
        f.write_str(s)
    }
}

/// Per-output power state. Values follow libdrm so backends can pass them
/// through untranslated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dpms {
    On = 0,
    Standby = 1,
    Suspend = 2,
    Off = 3,
}

impl Dpms {
    /// Clamp an arbitrary integer into the valid range.
    pub fn clamped(value: u32) -> Dpms {
        match value {
            0 => Dpms::On,
            1 => Dpms::Standby,
            2 => Dpms::Suspend,
            _ => Dpms::Off,
        }
    }
}

impl fmt::Display for Dpms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Dpms::On => "on",
            Dpms::Standby => "standby",
            Dpms::Suspend => "suspend",
            Dpms::Off => "off",
        };
        f.write_str(s)
    }
}

/// Physical connector kind (libdrm connector-type numbering).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorType {
    Unknown = 0,
    Vga = 1,
    DviI = 2,
    DviD = 3,
    DviA = 4,
    Composite = 5,
    SVideo = 6,
    Lvds = 7,
    Component = 8,
    NinePinDin = 9,
    DisplayPort = 10,
    HdmiA = 11,
    HdmiB = 12,
    Tv = 13,
    Edp = 14,
    Virtual = 15,
    Dsi = 16,
}

/// Geometric transform applied to a buffer on its way to the screen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transform {
    #[default]
    Normal = 0,
    Rot90 = 1,
    Rot180 = 2,
    Rot270 = 3,
    Flipped = 4,
    Flipped90 = 5,
    Flipped180 = 6,
    Flipped270 = 7,
}

/// A display mode as reported by the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputMode {
    pub clock: u32,
    pub hdisplay: u32,
    pub hsync_start: u32,
    pub hsync_end: u32,
    pub htotal: u32,
    pub hskew: u32,
    pub vdisplay: u32,
    pub vsync_start: u32,
    pub vsync_end: u32,
    pub vtotal: u32,
    pub vscan: u32,
    pub vrefresh: u32,
    pub flags: u32,
    pub mode_type: u32,
    pub name: String,
}

impl OutputMode {
    /// Convenience constructor for the common case.
    pub fn with_size(hdisplay: u32, vdisplay: u32, vrefresh: u32) -> OutputMode {
        OutputMode {
            hdisplay,
            vdisplay,
            vrefresh,
            name: format!("{hdisplay}x{vdisplay}"),
            ..OutputMode::default()
        }
    }
}

/// A property exposed by an output or a layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prop {
    pub id: u32,
    pub name: String,
}

/// A property value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Value {
    U32(u32),
    I32(i32),
    U64(u64),
    I64(i64),
}

impl Value {
    pub fn as_u32(self) -> u32 {
        match self {
            Value::U32(v) => v,
            Value::I32(v) => v as u32,
            Value::U64(v) => v as u32,
            Value::I64(v) => v as u32,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Size {
    pub h: u32,
    pub v: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub w: u32,
    pub h: u32,
}

/// Size/crop/format triple describing one side of a conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferConfig {
    pub size: Size,
    pub pos: Rect,
    pub format: Format,
}

/// Geometry and format a layer scans out with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerInfo {
    pub src_size: Size,
    pub src_pos: Rect,
    pub dst_pos: Rect,
    pub format: Format,
    pub transform: Transform,
}

/// Post-processor configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PpInfo {
    pub src: BufferConfig,
    pub dst: BufferConfig,
    pub transform: Transform,
    pub sync: bool,
    pub flags: u32,
}

/// Capture configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureInfo {
    pub dst: BufferConfig,
    pub transform: Transform,
    pub oneshot: bool,
    /// Done callbacks per second in stream mode; ignored for oneshot.
    pub frequency: u32,
}

/// Token returned when registering a handler; passes back to the matching
/// remove call. Unique for the life of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

impl HandlerId {
    pub fn next() -> HandlerId {
        use std::sync::atomic::{AtomicU64, Ordering};
        static NEXT: AtomicU64 = AtomicU64::new(1);
        HandlerId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Current monotonic time in microseconds.
pub fn monotonic_us() -> u64 {
    let ts = rustix::time::clock_gettime(rustix::time::ClockId::Monotonic);
    ts.tv_sec as u64 * 1_000_000 + ts.tv_nsec as u64 / 1_000
}

/// Current monotonic time in milliseconds; the seed for object stamps.
pub fn monotonic_ms() -> u64 {
    let ts = rustix::time::clock_gettime(rustix::time::ClockId::Monotonic);
    ts.tv_sec as u64 * 1_000 + ts.tv_nsec as u64 / 1_000_000
}

/// Allocate an object stamp: the millisecond clock, bumped past collisions
/// with live objects.
pub(crate) fn alloc_stamp(taken: impl Fn(u64) -> bool) -> u64 {
    let mut stamp = monotonic_ms().max(1);
    while taken(stamp) {
        stamp += 1;
    }
    stamp
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourcc_packing() {
        assert_eq!(Format::ARGB8888.0, u32::from_le_bytes(*b"AR24"));
        assert_eq!(format!("{}", Format::NV12), "NV12");
    }

    #[test]
    fn dpms_clamp() {
        assert_eq!(Dpms::clamped(0), Dpms::On);
        assert_eq!(Dpms::clamped(2), Dpms::Suspend);
        assert_eq!(Dpms::clamped(7), Dpms::Off);
    }

    #[test]
    fn stamps_skip_collisions() {
        let stamp = alloc_stamp(|s| s % 2 == 0);
        assert_eq!(stamp % 2, 1);
    }
}
