//! Canned display setups for the integration suites.

use tdm::config::Config;
use tdm::{Display, ModuleIdentity, OutputMode};

use crate::software::{software_backend_with, BackendOptions, OutputConfig, SoftwareControl};

/// A display over the software backend, plus everything the tests need to
/// poke it. The socket directory lives as long as the fixture.
pub struct TestDisplay {
    pub display: Display,
    pub control: SoftwareControl,
    socket_dir: tempfile::TempDir,
}

impl TestDisplay {
    /// Path of the wire socket for client tests.
    pub fn socket_path(&self) -> std::path::PathBuf {
        self.socket_dir
            .path()
            .join(tdm::protocol::SOCKET_NAME)
    }
}

/// Unthreaded display: the test drives the loop via `poll_events`.
pub fn init_display(outputs: Vec<OutputConfig>) -> TestDisplay {
    init_with(outputs, BackendOptions::default(), false)
}

/// Threaded display: the worker owns the loop, the test thread only sees
/// bridged callbacks.
pub fn init_display_threaded(outputs: Vec<OutputConfig>) -> TestDisplay {
    init_with(outputs, BackendOptions::default(), true)
}

pub fn init_with(
    outputs: Vec<OutputConfig>,
    options: BackendOptions,
    threaded: bool,
) -> TestDisplay {
    let socket_dir = tempfile::tempdir().expect("socket dir");
    let (backend, control) = software_backend_with(outputs, options);

    let config = Config {
        thread: threaded,
        socket_dir: Some(socket_dir.path().to_path_buf()),
        ..Config::default()
    };

    let display = Display::init_with_backend(ModuleIdentity::default(), backend, config)
        .expect("display init");

    TestDisplay { display, control, socket_dir }
}

/// Power the primary output up with its preferred mode and return it.
pub fn primary_on(fixture: &TestDisplay) -> tdm::Output {
    let output = fixture.display.get_output(0).expect("primary output");
    let mode = output.available_modes().expect("modes")[0].clone();
    output.set_mode(&mode).expect("set mode");
    output.set_dpms(tdm::Dpms::On).expect("dpms on");
    output
}

/// The standard single-connector setup.
pub fn one_output() -> Vec<OutputConfig> {
    vec![OutputConfig::default()]
}

/// A 1920x1080 mode at the given refresh.
pub fn mode(vrefresh: u32) -> OutputMode {
    OutputMode::with_size(1920, 1080, vrefresh)
}
