//! Display manager frontend.
//!
//! Mediates between a display server and the display hardware: outputs
//! (connectors), layers (hardware composition planes), memory-to-memory
//! post-processing, framebuffer capture and aligned vblank timing, all
//! driven through a vendor backend module. A wire server lets external
//! processes observe outputs and subscribe to vblank ticks.
//!
//! The usual shape of a session:
//!
//! ```no_run
//! use tdm::Display;
//!
//! let display = Display::init()?;
//! let output = display.get_output(0)?;
//! output.set_dpms(tdm::Dpms::On)?;
//!
//! let layer = output.get_layer(0)?;
//! let buffer = tdm::Surface::alloc(1920, 1080, tdm::Format::ARGB8888);
//! layer.set_buffer(&buffer)?;
//! output.commit(false, |sequence, _sec, _usec| {
//!     tracing::info!(sequence, "on screen");
//! })?;
//! # Ok::<(), tdm::Error>(())
//! ```

pub mod backend;
pub mod buffer;
pub mod caps;
pub mod capture;
pub mod config;
pub mod debug;
pub mod error;
pub mod layer;
pub mod output;
pub mod pp;
pub mod protocol;
pub mod types;
pub mod vblank;

mod display;
mod dump;
mod event_loop;
mod module;
mod server;
mod thread;

pub use buffer::{Surface, SurfaceQueue};
pub use capture::Capture;
pub use display::{Display, ModuleIdentity};
pub use error::{Error, Result};
pub use layer::Layer;
pub use output::{ChangeEvent, Output};
pub use pp::Pp;
pub use types::{ConnStatus, ConnectorType, Dpms, Format, HandlerId, OutputMode, Transform};
pub use vblank::{Vblank, VblankSample};

use std::io::Write;
use std::sync::{Mutex, OnceLock};

use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{fmt, prelude::*, reload, EnvFilter, Registry};

enum LogRoute {
    Stdout,
    File(tracing_appender::rolling::RollingFileAppender),
}

static LOG_ROUTE: Mutex<Option<LogRoute>> = Mutex::new(None);
static FILTER_HANDLE: OnceLock<reload::Handle<EnvFilter, Registry>> = OnceLock::new();

struct RoutedWriter;

struct RoutedIo;

impl Write for RoutedIo {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut route = LOG_ROUTE.lock().unwrap();
        match route.as_mut() {
            Some(LogRoute::File(appender)) => appender.write(buf),
            _ => std::io::stdout().write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut route = LOG_ROUTE.lock().unwrap();
        match route.as_mut() {
            Some(LogRoute::File(appender)) => appender.flush(),
            _ => std::io::stdout().flush(),
        }
    }
}

impl<'a> MakeWriter<'a> for RoutedWriter {
    type Writer = RoutedIo;

    fn make_writer(&'a self) -> RoutedIo {
        RoutedIo
    }
}

/// Install the global tracing subscriber.
///
/// `TDM_DLOG` reroutes output to a log file under `/tmp`; the wire debug
/// channel can re-route and re-level at runtime.
pub fn setup_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter, handle) = reload::Layer::new(filter);
    let _ = FILTER_HANDLE.set(handle);

    if std::env::var_os("TDM_DLOG").is_some() {
        *LOG_ROUTE.lock().unwrap() =
            Some(LogRoute::File(tracing_appender::rolling::never("/tmp", "tdm.log")));
    }

    // Respect NO_COLOR environment variable for testing
    let use_ansi = std::env::var("NO_COLOR").is_err();

    let result = tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_ansi(use_ansi)
                .with_writer(RoutedWriter),
        )
        .try_init();
    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

/// Runtime log-level change from the debug channel: 0=error up to
/// 4=trace.
pub(crate) fn set_log_level(level: u8) {
    let directive = match level {
        0 => "error",
        1 => "warn",
        2 => "info",
        3 => "debug",
        _ => "trace",
    };
    if let Some(handle) = FILTER_HANDLE.get() {
        let _ = handle.reload(EnvFilter::new(directive));
    }
}

/// Runtime log re-routing from the debug channel: "console", "dlog", or a
/// file path.
pub(crate) fn reroute_log(path: &str) -> std::result::Result<(), String> {
    let mut route = LOG_ROUTE.lock().unwrap();
    match path {
        "console" => {
            *route = Some(LogRoute::Stdout);
            Ok(())
        }
        "dlog" => {
            *route = Some(LogRoute::File(tracing_appender::rolling::never("/tmp", "tdm.log")));
            Ok(())
        }
        other => {
            let path = std::path::Path::new(other);
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
            let file = path.file_name().ok_or_else(|| "not a file path".to_string())?;
            let appender = tracing_appender::rolling::never(
                dir.unwrap_or_else(|| std::path::Path::new(".")),
                file,
            );
            *route = Some(LogRoute::File(appender));
            Ok(())
        }
    }
}
