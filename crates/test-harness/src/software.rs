//! A software backend that behaves like display hardware.
//!
//! A timer thread plays the role of the CRTC: vblank requests and commits
//! complete on a fixed refresh grid, PP and capture jobs finish a couple
//! of milliseconds after commit, and a control handle injects hot-plug
//! events. Completions are pushed into the frontend's event sink and
//! announced through a wake pipe, exactly like a real event fd.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tdm::backend::{
    Backend, BackendEvent, CaptureBackend, EventSink, LayerBackend, OutputBackend, PpBackend,
};
use tdm::caps::{
    CaptureCapabilities, CaptureCaps, DisplayCapabilities, DisplayCaps, LayerCapabilities,
    LayerCaps, OutputCaps, PpCapabilities, PpCaps,
};
use tdm::types::monotonic_us;
use tdm::{ConnStatus, ConnectorType, Dpms, Error, Format, OutputMode};

use tdm::buffer::Surface;
use tdm::types::{CaptureInfo, LayerInfo, PpInfo, Value};

/// One virtual connector.
#[derive(Debug, Clone)]
pub struct OutputConfig {
    pub connector_type: ConnectorType,
    pub status: ConnStatus,
    pub width: u32,
    pub height: u32,
    pub vrefresh: u32,
    pub layers: usize,
    pub model: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        OutputConfig {
            connector_type: ConnectorType::HdmiA,
            status: ConnStatus::Connected,
            width: 1920,
            height: 1080,
            vrefresh: 60,
            layers: 2,
            model: "SW-Panel".into(),
        }
    }
}

/// Engine feature switches for a backend instance.
#[derive(Debug, Clone)]
pub struct BackendOptions {
    pub pp: bool,
    pub capture: bool,
    /// Reported PP attach budget; 0 means unlimited.
    pub max_attach_count: u32,
}

impl Default for BackendOptions {
    fn default() -> Self {
        BackendOptions { pp: true, capture: true, max_attach_count: 0 }
    }
}

struct HwOutput {
    config: OutputConfig,
    status: ConnStatus,
    dpms: Dpms,
    current_mode: Option<OutputMode>,
    vblank_sink: Option<EventSink>,
    commit_sink: Option<EventSink>,
    status_sink: Option<(EventSink, u64)>,
    commit_count: u32,
}

struct Scheduled {
    due_us: u64,
    sink: EventSink,
    event: BackendEvent,
}

struct Hw {
    outputs: Vec<HwOutput>,
    schedule: Vec<Scheduled>,
    wake_write: OwnedFd,
    shutdown: bool,
    base_us: u64,
    vblank_requests: u64,
    commit_requests: u64,
    pp_last_due: u64,
}

type HwPair = (Mutex<Hw>, Condvar);

impl Hw {
    fn period_us(&self, pipe: usize) -> f64 {
        1_000_000f64 / self.outputs[pipe].config.vrefresh as f64
    }

    fn push(&mut self, due_us: u64, sink: EventSink, event: BackendEvent) {
        self.schedule.push(Scheduled { due_us, sink, event });
    }
}

/// Test-side handle into the virtual hardware.
#[derive(Clone)]
pub struct SoftwareControl {
    hw: Arc<HwPair>,
}

impl SoftwareControl {
    /// Plug or unplug a connector; the frontend sees a status event.
    pub fn set_connected(&self, pipe: usize, connected: bool) {
        let (lock, condvar) = &*self.hw;
        let mut hw = lock.lock().unwrap();
        let status = if connected { ConnStatus::Connected } else { ConnStatus::Disconnected };
        let now = monotonic_us();
        let Some(out) = hw.outputs.get_mut(pipe) else {
            return;
        };
        out.status = status;
        let Some((sink, token)) = out.status_sink.clone() else {
            return;
        };
        hw.push(now, sink, BackendEvent::Status { token, status });
        condvar.notify_all();
    }

    /// How many hardware vblank waits the frontend issued.
    pub fn vblank_request_count(&self) -> u64 {
        self.hw.0.lock().unwrap().vblank_requests
    }

    /// How many commits reached the hardware.
    pub fn commit_request_count(&self) -> u64 {
        self.hw.0.lock().unwrap().commit_requests
    }
}

struct SoftwareBackend {
    hw: Arc<HwPair>,
    options: BackendOptions,
    wake_read: OwnedFd,
    timer: Option<JoinHandle<()>>,
}

/// Build a backend over the given connectors, with default engines.
pub fn software_backend(
    outputs: Vec<OutputConfig>,
) -> (Box<dyn Backend>, SoftwareControl) {
    software_backend_with(outputs, BackendOptions::default())
}

pub fn software_backend_with(
    outputs: Vec<OutputConfig>,
    options: BackendOptions,
) -> (Box<dyn Backend>, SoftwareControl) {
    let flags = rustix::pipe::PipeFlags::CLOEXEC | rustix::pipe::PipeFlags::NONBLOCK;
    let (wake_read, wake_write) = rustix::pipe::pipe_with(flags).expect("pipe");

    let hw = Arc::new((
        Mutex::new(Hw {
            outputs: outputs
                .into_iter()
                .map(|config| HwOutput {
                    status: config.status,
                    dpms: Dpms::Off,
                    current_mode: None,
                    vblank_sink: None,
                    commit_sink: None,
                    status_sink: None,
                    commit_count: 0,
                    config,
                })
                .collect(),
            schedule: Vec::new(),
            wake_write,
            shutdown: false,
            base_us: monotonic_us(),
            vblank_requests: 0,
            commit_requests: 0,
            pp_last_due: 0,
        }),
        Condvar::new(),
    ));

    let timer = spawn_timer(hw.clone());
    let control = SoftwareControl { hw: hw.clone() };
    let backend = SoftwareBackend { hw, options, wake_read, timer: Some(timer) };
    (Box::new(backend), control)
}

/// The virtual CRTC: sleeps until the earliest scheduled completion, then
/// pushes it into the frontend sink and rings the wake pipe.
fn spawn_timer(hw: Arc<HwPair>) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("software-crtc".into())
        .spawn(move || {
            let (lock, condvar) = &*hw;
            let mut hw = lock.lock().unwrap();
            loop {
                if hw.shutdown {
                    break;
                }

                let now = monotonic_us();
                let mut fired = false;
                let mut index = 0;
                while index < hw.schedule.len() {
                    if hw.schedule[index].due_us <= now {
                        let item = hw.schedule.remove(index);
                        item.sink.push(item.event);
                        fired = true;
                    } else {
                        index += 1;
                    }
                }
                if fired {
                    let _ = rustix::io::write(&hw.wake_write, &[1u8]);
                }

                let next = hw.schedule.iter().map(|s| s.due_us).min();
                hw = match next {
                    Some(due) => {
                        let wait = due.saturating_sub(monotonic_us()).max(200);
                        condvar
                            .wait_timeout(hw, Duration::from_micros(wait))
                            .unwrap()
                            .0
                    }
                    None => condvar.wait(hw).unwrap(),
                };
            }
        })
        .expect("spawning the software crtc failed")
}

impl Drop for SoftwareBackend {
    fn drop(&mut self) {
        {
            let (lock, condvar) = &*self.hw;
            lock.lock().unwrap().shutdown = true;
            condvar.notify_all();
        }
        if let Some(timer) = self.timer.take() {
            let _ = timer.join();
        }
    }
}

impl Backend for SoftwareBackend {
    fn capabilities(&mut self) -> Result<DisplayCaps, Error> {
        let mut capabilities = DisplayCapabilities::empty();
        if self.options.pp {
            capabilities |= DisplayCapabilities::PP;
        }
        if self.options.capture {
            capabilities |= DisplayCapabilities::CAPTURE;
        }
        Ok(DisplayCaps { capabilities, max_layer_count: -1 })
    }

    fn outputs(&mut self) -> Result<Vec<Box<dyn OutputBackend>>, Error> {
        let count = self.hw.0.lock().unwrap().outputs.len();
        Ok((0..count)
            .map(|index| Box::new(SoftwareOutput { hw: self.hw.clone(), index }) as _)
            .collect())
    }

    fn fd(&self) -> Option<RawFd> {
        Some(self.wake_read.as_raw_fd())
    }

    fn handle_events(&mut self) -> Result<(), Error> {
        // Events are already in the sink; just drain the wake bytes.
        let mut buf = [0u8; 64];
        loop {
            match rustix::io::read(&self.wake_read, &mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(rustix::io::Errno::AGAIN) => break,
                Err(rustix::io::Errno::INTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn pp_capabilities(&mut self) -> Result<PpCaps, Error> {
        if !self.options.pp {
            return Err(Error::NotImplemented);
        }
        Ok(PpCaps {
            capabilities: PpCapabilities::SYNC | PpCapabilities::ASYNC | PpCapabilities::SCALE,
            formats: vec![Format::ARGB8888, Format::XRGB8888, Format::NV12],
            min_w: 16,
            min_h: 16,
            max_w: 4096,
            max_h: 4096,
            preferred_align: 2,
            max_attach_count: self.options.max_attach_count,
        })
    }

    fn create_pp(&mut self) -> Result<Box<dyn PpBackend>, Error> {
        if !self.options.pp {
            return Err(Error::NotImplemented);
        }
        Ok(Box::new(SoftwarePp { hw: self.hw.clone(), pending: Vec::new(), handler: None }))
    }

    fn capture_capabilities(&mut self) -> Result<CaptureCaps, Error> {
        if !self.options.capture {
            return Err(Error::NotImplemented);
        }
        Ok(CaptureCaps {
            capabilities: CaptureCapabilities::ONESHOT | CaptureCapabilities::STREAM,
            formats: vec![Format::ARGB8888, Format::XRGB8888],
        })
    }
}

struct SoftwareOutput {
    hw: Arc<HwPair>,
    index: usize,
}

impl OutputBackend for SoftwareOutput {
    fn capability(&mut self) -> Result<OutputCaps, Error> {
        let hw = self.hw.0.lock().unwrap();
        let out = &hw.outputs[self.index];
        let mode = OutputMode::with_size(out.config.width, out.config.height, out.config.vrefresh);
        Ok(OutputCaps {
            maker: "tdm".into(),
            model: out.config.model.clone(),
            name: format!("{:?}-{}", out.config.connector_type, self.index),
            status: out.status,
            connector_type: out.config.connector_type,
            modes: vec![mode],
            props: Vec::new(),
            mm_width: 530,
            mm_height: 300,
            subpixel: 0,
            min_w: 0,
            min_h: 0,
            max_w: out.config.width as i32,
            max_h: out.config.height as i32,
            preferred_align: 1,
        })
    }

    fn layers(&mut self) -> Result<Vec<Box<dyn LayerBackend>>, Error> {
        let count = {
            let hw = self.hw.0.lock().unwrap();
            hw.outputs[self.index].config.layers
        };
        Ok((0..count)
            .map(|layer| {
                Box::new(SoftwareLayer {
                    hw: self.hw.clone(),
                    zpos: layer as i32,
                    info: None,
                }) as _
            })
            .collect())
    }

    fn wait_vblank(&mut self, interval: u32, _sync: bool, token: u64) -> Result<(), Error> {
        if interval == 0 {
            return Err(Error::InvalidParameter);
        }
        let (lock, condvar) = &*self.hw;
        let mut hw = lock.lock().unwrap();
        hw.vblank_requests += 1;

        let period = hw.period_us(self.index);
        let sink = hw.outputs[self.index]
            .vblank_sink
            .clone()
            .ok_or(Error::OperationFailed)?;

        let now = monotonic_us();
        let elapsed = ((now - hw.base_us) as f64 / period) as u64;
        let sequence = elapsed + interval as u64;
        let due = hw.base_us + (sequence as f64 * period) as u64;

        hw.push(
            due,
            sink,
            BackendEvent::Vblank {
                token,
                sequence: sequence as u32,
                tv_sec: due / 1_000_000,
                tv_usec: due % 1_000_000,
            },
        );
        condvar.notify_all();
        Ok(())
    }

    fn set_vblank_handler(&mut self, sink: EventSink) -> Result<(), Error> {
        self.hw.0.lock().unwrap().outputs[self.index].vblank_sink = Some(sink);
        Ok(())
    }

    fn commit(&mut self, _sync: bool, token: u64) -> Result<(), Error> {
        let (lock, condvar) = &*self.hw;
        let mut hw = lock.lock().unwrap();
        hw.commit_requests += 1;

        let period = hw.period_us(self.index);
        let sink = hw.outputs[self.index]
            .commit_sink
            .clone()
            .ok_or(Error::OperationFailed)?;

        // Latches at the next vblank edge.
        let now = monotonic_us();
        let elapsed = ((now - hw.base_us) as f64 / period) as u64;
        let due = hw.base_us + ((elapsed + 1) as f64 * period) as u64;

        hw.outputs[self.index].commit_count += 1;
        let sequence = hw.outputs[self.index].commit_count;

        hw.push(
            due,
            sink,
            BackendEvent::Commit {
                token,
                sequence,
                tv_sec: due / 1_000_000,
                tv_usec: due % 1_000_000,
            },
        );
        condvar.notify_all();
        Ok(())
    }

    fn set_commit_handler(&mut self, sink: EventSink) -> Result<(), Error> {
        self.hw.0.lock().unwrap().outputs[self.index].commit_sink = Some(sink);
        Ok(())
    }

    fn set_status_handler(&mut self, sink: EventSink, token: u64) -> Result<(), Error> {
        self.hw.0.lock().unwrap().outputs[self.index].status_sink = Some((sink, token));
        Ok(())
    }

    fn set_dpms(&mut self, dpms: Dpms) -> Result<(), Error> {
        self.hw.0.lock().unwrap().outputs[self.index].dpms = dpms;
        Ok(())
    }

    fn dpms(&mut self) -> Result<Dpms, Error> {
        Ok(self.hw.0.lock().unwrap().outputs[self.index].dpms)
    }

    fn set_mode(&mut self, mode: &OutputMode) -> Result<(), Error> {
        self.hw.0.lock().unwrap().outputs[self.index].current_mode = Some(mode.clone());
        Ok(())
    }

    fn mode(&mut self) -> Result<OutputMode, Error> {
        self.hw.0.lock().unwrap().outputs[self.index]
            .current_mode
            .clone()
            .ok_or(Error::OperationFailed)
    }

    fn create_capture(&mut self) -> Result<Box<dyn CaptureBackend>, Error> {
        Ok(Box::new(SoftwareCapture {
            hw: self.hw.clone(),
            attached: Vec::new(),
            info: None,
            handler: None,
        }))
    }
}

struct SoftwareLayer {
    hw: Arc<HwPair>,
    zpos: i32,
    info: Option<LayerInfo>,
}

impl LayerBackend for SoftwareLayer {
    fn capability(&mut self) -> Result<LayerCaps, Error> {
        let capabilities = if self.zpos == 0 {
            LayerCapabilities::PRIMARY | LayerCapabilities::GRAPHIC
        } else {
            LayerCapabilities::OVERLAY | LayerCapabilities::GRAPHIC | LayerCapabilities::SCALE
        };
        Ok(LayerCaps {
            capabilities,
            zpos: self.zpos,
            formats: vec![Format::ARGB8888, Format::XRGB8888],
            props: Vec::new(),
        })
    }

    fn set_info(&mut self, info: &LayerInfo) -> Result<(), Error> {
        self.info = Some(*info);
        Ok(())
    }

    fn info(&mut self) -> Result<LayerInfo, Error> {
        self.info.ok_or(Error::OperationFailed)
    }

    fn set_buffer(&mut self, _buffer: &Surface) -> Result<(), Error> {
        Ok(())
    }

    fn unset_buffer(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn set_property(&mut self, _id: u32, _value: Value) -> Result<(), Error> {
        Ok(())
    }

    fn buffer_flags(&mut self) -> Result<u32, Error> {
        Ok(0)
    }

    fn create_capture(&mut self) -> Result<Box<dyn CaptureBackend>, Error> {
        Ok(Box::new(SoftwareCapture {
            hw: self.hw.clone(),
            attached: Vec::new(),
            info: None,
            handler: None,
        }))
    }
}

struct SoftwarePp {
    hw: Arc<HwPair>,
    pending: Vec<(Surface, Surface)>,
    handler: Option<(EventSink, u64)>,
}

impl PpBackend for SoftwarePp {
    fn set_info(&mut self, _info: &PpInfo) -> Result<(), Error> {
        Ok(())
    }

    fn attach(&mut self, src: &Surface, dst: &Surface) -> Result<(), Error> {
        self.pending.push((src.clone(), dst.clone()));
        Ok(())
    }

    fn commit(&mut self) -> Result<(), Error> {
        let (sink, token) = self.handler.clone().ok_or(Error::OperationFailed)?;
        let (lock, condvar) = &*self.hw;
        let mut hw = lock.lock().unwrap();

        // Conversions finish in order, a couple of ms apart.
        for (src, dst) in self.pending.drain(..) {
            let due = hw.pp_last_due.max(monotonic_us()) + 2_000;
            hw.pp_last_due = due;
            hw.push(due, sink.clone(), BackendEvent::PpDone { token, src, dst });
        }
        condvar.notify_all();
        Ok(())
    }

    fn set_done_handler(&mut self, sink: EventSink, token: u64) -> Result<(), Error> {
        self.handler = Some((sink, token));
        Ok(())
    }
}

struct SoftwareCapture {
    hw: Arc<HwPair>,
    attached: Vec<Surface>,
    info: Option<CaptureInfo>,
    handler: Option<(EventSink, u64)>,
}

impl CaptureBackend for SoftwareCapture {
    fn set_info(&mut self, info: &CaptureInfo) -> Result<(), Error> {
        self.info = Some(*info);
        Ok(())
    }

    fn attach(&mut self, buffer: &Surface) -> Result<(), Error> {
        self.attached.push(buffer.clone());
        Ok(())
    }

    fn commit(&mut self) -> Result<(), Error> {
        let (sink, token) = self.handler.clone().ok_or(Error::OperationFailed)?;
        let oneshot = self.info.map(|i| i.oneshot).unwrap_or(true);
        let frequency = self.info.map(|i| i.frequency).unwrap_or(0).max(1);

        let (lock, condvar) = &*self.hw;
        let mut hw = lock.lock().unwrap();
        let now = monotonic_us();

        if oneshot {
            let Some(buffer) = self.attached.last().cloned() else {
                return Err(Error::BadRequest);
            };
            fill(&buffer);
            hw.push(now + 2_000, sink, BackendEvent::CaptureDone { token, buffer });
        } else {
            let gap = 1_000_000 / frequency as u64;
            for (i, buffer) in self.attached.iter().enumerate() {
                fill(buffer);
                hw.push(
                    now + (i as u64 + 1) * gap,
                    sink.clone(),
                    BackendEvent::CaptureDone { token, buffer: buffer.clone() },
                );
            }
        }
        condvar.notify_all();
        Ok(())
    }

    fn set_done_handler(&mut self, sink: EventSink, token: u64) -> Result<(), Error> {
        self.handler = Some((sink, token));
        Ok(())
    }
}

/// Pretend the engine wrote something.
fn fill(buffer: &Surface) {
    let mut data = buffer.map();
    for byte in data.iter_mut() {
        *byte = 0x80;
    }
}
