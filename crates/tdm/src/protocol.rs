//! Wire protocol between the display server and external clients.
//!
//! Newline-delimited JSON over a Unix socket. Clients mint object ids for
//! the outputs and vblanks they create; events echo those ids back.

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::types::{ConnStatus, Dpms};

/// Well-known socket file name under the runtime directory.
pub const SOCKET_NAME: &str = "tdm-socket";

/// Client → server messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Bind an output by name. "primary" and "default" alias the primary
    /// display; anything else matches the model string.
    CreateOutput { output_id: u32, name: String },
    DestroyOutput { output_id: u32 },
    CreateVblank { output_id: u32, vblank_id: u32 },
    DestroyVblank { vblank_id: u32 },
    SetFps { vblank_id: u32, fps: u32 },
    SetOffset { vblank_id: u32, offset_ms: i32 },
    SetEnableFake { vblank_id: u32, enable: bool },
    SetSync { vblank_id: u32, sync: bool },
    WaitVblank {
        vblank_id: u32,
        interval: u32,
        req_id: u32,
        req_sec: u64,
        req_usec: u64,
    },
    /// Opaque debug command line; answered with `DebugDone`.
    Debug { options: String },
}

/// Server → client messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Sent once on bind.
    OutputMode { output_id: u32, hdisplay: u32, vdisplay: u32, vrefresh: u32 },
    /// Sent on bind and on every change.
    OutputDpms { output_id: u32, value: Dpms },
    /// Sent on bind and on every change.
    OutputConnection { output_id: u32, status: ConnStatus },
    /// One per wait request.
    VblankDone {
        req_id: u32,
        sequence: u32,
        tv_sec: u64,
        tv_usec: u64,
        error: Option<Error>,
    },
    DebugDone { message: String },
    /// A request failed outright.
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_roundtrip() {
        let request = Request::WaitVblank {
            vblank_id: 3,
            interval: 1,
            req_id: 17,
            req_sec: 12,
            req_usec: 500_000,
        };
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"type\":\"wait_vblank\""));
        let back: Request = serde_json::from_str(&json).unwrap();
        assert!(matches!(back, Request::WaitVblank { req_id: 17, .. }));
    }

    #[test]
    fn event_roundtrip() {
        let event = Event::VblankDone {
            req_id: 9,
            sequence: 4,
            tv_sec: 1,
            tv_usec: 2,
            error: Some(Error::DpmsOff),
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert!(matches!(back, Event::VblankDone { error: Some(Error::DpmsOff), .. }));
    }
}
