//! Client side of the display manager wire protocol.
//!
//! Connects to the `tdm-socket`, binds outputs by name and requests
//! vblank ticks. Events arrive on the socket; the owner polls
//! [`Client::fd`] and calls [`Client::handle_events`] to dispatch them,
//! exactly like the display fd on the server side.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tdm::protocol::{Event, Request, SOCKET_NAME};
use tdm::{ConnStatus, Dpms, Error, HandlerId};

/// Observable output change on the client side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputChange {
    Dpms(Dpms),
    Connection(ConnStatus),
}

/// A delivered vblank tick, or the error that ended the wait.
pub type WaitResult = std::result::Result<tdm::VblankSample, Error>;

type WaitHandler = Box<dyn FnOnce(WaitResult) + Send>;
type ChangeHandler = Arc<dyn Fn(OutputChange) + Send + Sync>;

#[derive(Default)]
struct OutputState {
    mode: Option<(u32, u32, u32)>,
    dpms: Option<Dpms>,
    status: Option<ConnStatus>,
    handlers: Vec<(HandlerId, ChangeHandler)>,
}

#[derive(Default)]
struct VblankState {
    sync: bool,
    waits: HashMap<u32, WaitHandler>,
}

struct Inner {
    stream: UnixStream,
    buf: Vec<u8>,
    next_output_id: u32,
    next_vblank_id: u32,
    next_req_id: u32,
    outputs: HashMap<u32, OutputState>,
    vblanks: HashMap<u32, VblankState>,
    debug_replies: Vec<String>,
}

impl Inner {
    fn send(&mut self, request: &Request) -> Result<(), Error> {
        let json = serde_json::to_string(request).map_err(|_| Error::OperationFailed)?;
        writeln!(self.stream, "{json}").map_err(|e| {
            tracing::warn!(error = %e, "wire request write failed");
            Error::OperationFailed
        })
    }
}

/// Connection to the display manager.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Mutex<Inner>>,
}

/// Callbacks collected during dispatch; run after the client lock drops.
enum Callback {
    Wait(WaitHandler, WaitResult),
    Change(ChangeHandler, OutputChange),
}

impl Client {
    /// Connect using `XDG_RUNTIME_DIR` to locate the socket.
    pub fn connect() -> Result<Client, Error> {
        let dir = std::env::var_os("XDG_RUNTIME_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/tmp"));
        Client::connect_to(&dir.join(SOCKET_NAME))
    }

    /// Connect to a socket at an explicit path.
    pub fn connect_to(path: &std::path::Path) -> Result<Client, Error> {
        let stream = UnixStream::connect(path).map_err(|e| {
            tracing::error!(path = %path.display(), error = %e, "connect failed");
            Error::OperationFailed
        })?;
        stream.set_nonblocking(true)?;
        tracing::debug!(path = %path.display(), "connected");
        Ok(Client {
            inner: Arc::new(Mutex::new(Inner {
                stream,
                buf: Vec::new(),
                next_output_id: 1,
                next_vblank_id: 1,
                next_req_id: 1,
                outputs: HashMap::new(),
                vblanks: HashMap::new(),
                debug_replies: Vec::new(),
            })),
        })
    }

    /// The socket fd; poll it for readability.
    pub fn fd(&self) -> ClientFd<'_> {
        ClientFd { client: self }
    }

    /// Block until events arrive, then dispatch them.
    pub fn handle_events(&self) -> Result<(), Error> {
        self.poll_events(-1).map(|_| ())
    }

    /// Bounded variant of [`handle_events`](Self::handle_events); returns
    /// whether anything was dispatched.
    pub fn poll_events(&self, timeout_ms: i32) -> Result<bool, Error> {
        {
            let inner = self.inner.lock().unwrap();
            let fd = inner.stream.as_fd();
            let mut fds = [rustix::event::PollFd::new(&fd, rustix::event::PollFlags::IN)];
            match rustix::event::poll(&mut fds, timeout_ms) {
                Ok(0) => return Ok(false),
                Ok(_) => {}
                Err(rustix::io::Errno::INTR) => return Ok(false),
                Err(e) => return Err(e.into()),
            }
        }
        self.dispatch_pending()?;
        Ok(true)
    }

    /// Read and dispatch whatever is already buffered on the socket.
    pub fn dispatch_pending(&self) -> Result<(), Error> {
        let callbacks = {
            let mut inner = self.inner.lock().unwrap();
            let events = read_events(&mut inner)?;
            let mut callbacks = Vec::new();
            for event in events {
                apply_event(&mut inner, event, &mut callbacks);
            }
            callbacks
        };
        for callback in callbacks {
            match callback {
                Callback::Wait(func, result) => func(result),
                Callback::Change(func, change) => func(change),
            }
        }
        Ok(())
    }

    /// Bind an output. "primary" and "default" alias index 0; other names
    /// match the model string of a connected output.
    pub fn get_output(&self, name: &str) -> Result<ClientOutput, Error> {
        let output_id = {
            let mut inner = self.inner.lock().unwrap();
            let output_id = inner.next_output_id;
            inner.next_output_id += 1;
            inner.outputs.insert(output_id, OutputState::default());
            inner.send(&Request::CreateOutput { output_id, name: name.to_string() })?;
            output_id
        };

        // The bind events carry the initial mode/dpms/connection state.
        let bound = |inner: &Inner| {
            inner
                .outputs
                .get(&output_id)
                .is_some_and(|o| o.mode.is_some() && o.dpms.is_some() && o.status.is_some())
        };
        self.roundtrip_until(|inner| bound(inner))?;

        Ok(ClientOutput { client: self.clone(), output_id })
    }

    /// Send a debug command line and wait for its reply text.
    pub fn debug(&self, options: &str) -> Result<String, Error> {
        self.inner
            .lock()
            .unwrap()
            .send(&Request::Debug { options: options.to_string() })?;
        self.roundtrip_until(|inner| !inner.debug_replies.is_empty())?;
        let mut inner = self.inner.lock().unwrap();
        Ok(inner.debug_replies.remove(0))
    }

    /// Dispatch until `done` holds; fails after ~5 s of silence.
    fn roundtrip_until(&self, done: impl Fn(&Inner) -> bool) -> Result<(), Error> {
        let mut budget = 5_000i32;
        loop {
            {
                let inner = self.inner.lock().unwrap();
                if done(&inner) {
                    return Ok(());
                }
            }
            if budget <= 0 {
                tracing::error!("wire roundtrip timed out");
                return Err(Error::OperationFailed);
            }
            if !self.poll_events(100)? {
                budget -= 100;
            }
        }
    }
}

/// Borrowable fd wrapper so callers can poll without touching the inner
/// lock layout.
pub struct ClientFd<'a> {
    client: &'a Client,
}

impl ClientFd<'_> {
    pub fn with<R>(&self, f: impl FnOnce(BorrowedFd<'_>) -> R) -> R {
        let inner = self.client.inner.lock().unwrap();
        f(inner.stream.as_fd())
    }
}

fn read_events(inner: &mut Inner) -> Result<Vec<Event>, Error> {
    let mut chunk = [0u8; 4096];
    loop {
        match inner.stream.read(&mut chunk) {
            Ok(0) => {
                tracing::warn!("server closed the socket");
                break;
            }
            Ok(n) => inner.buf.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::warn!(error = %e, "socket read failed");
                return Err(Error::OperationFailed);
            }
        }
    }

    let mut events = Vec::new();
    while let Some(at) = inner.buf.iter().position(|&b| b == b'\n') {
        let line: Vec<u8> = inner.buf.drain(..=at).collect();
        let line = String::from_utf8_lossy(&line[..line.len() - 1]).into_owned();
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Event>(&line) {
            Ok(event) => events.push(event),
            Err(e) => tracing::warn!(error = %e, line, "bad wire event"),
        }
    }
    Ok(events)
}

fn apply_event(inner: &mut Inner, event: Event, callbacks: &mut Vec<Callback>) {
    match event {
        Event::OutputMode { output_id, hdisplay, vdisplay, vrefresh } => {
            if let Some(output) = inner.outputs.get_mut(&output_id) {
                output.mode = Some((hdisplay, vdisplay, vrefresh));
            }
        }
        Event::OutputDpms { output_id, value } => {
            if let Some(output) = inner.outputs.get_mut(&output_id) {
                let first = output.dpms.is_none();
                output.dpms = Some(value);
                if !first {
                    for (_, handler) in &output.handlers {
                        callbacks.push(Callback::Change(handler.clone(), OutputChange::Dpms(value)));
                    }
                }
            }
        }
        Event::OutputConnection { output_id, status } => {
            if let Some(output) = inner.outputs.get_mut(&output_id) {
                let first = output.status.is_none();
                output.status = Some(status);
                if !first {
                    for (_, handler) in &output.handlers {
                        callbacks
                            .push(Callback::Change(handler.clone(), OutputChange::Connection(status)));
                    }
                }
            }
        }
        Event::VblankDone { req_id, sequence, tv_sec, tv_usec, error } => {
            let handler = inner
                .vblanks
                .values_mut()
                .find_map(|vblank| vblank.waits.remove(&req_id));
            match handler {
                Some(func) => {
                    let result = match error {
                        None => Ok(tdm::VblankSample { sequence, tv_sec, tv_usec }),
                        Some(e) => Err(e),
                    };
                    callbacks.push(Callback::Wait(func, result));
                }
                None => tracing::debug!(req_id, "done for an unknown wait"),
            }
        }
        Event::DebugDone { message } => inner.debug_replies.push(message),
        Event::Error { message } => tracing::warn!(message, "server error"),
    }
}

/// A bound output resource.
pub struct ClientOutput {
    client: Client,
    output_id: u32,
}

impl ClientOutput {
    /// `(hdisplay, vdisplay)` of the current mode.
    pub fn resolution(&self) -> Result<(u32, u32), Error> {
        let inner = self.client.inner.lock().unwrap();
        let output = inner.outputs.get(&self.output_id).ok_or(Error::InvalidParameter)?;
        let (h, v, _) = output.mode.ok_or(Error::OperationFailed)?;
        Ok((h, v))
    }

    pub fn refresh_rate(&self) -> Result<u32, Error> {
        let inner = self.client.inner.lock().unwrap();
        let output = inner.outputs.get(&self.output_id).ok_or(Error::InvalidParameter)?;
        let (_, _, vrefresh) = output.mode.ok_or(Error::OperationFailed)?;
        Ok(vrefresh)
    }

    pub fn conn_status(&self) -> Result<ConnStatus, Error> {
        let inner = self.client.inner.lock().unwrap();
        let output = inner.outputs.get(&self.output_id).ok_or(Error::InvalidParameter)?;
        output.status.ok_or(Error::OperationFailed)
    }

    pub fn dpms(&self) -> Result<Dpms, Error> {
        let inner = self.client.inner.lock().unwrap();
        let output = inner.outputs.get(&self.output_id).ok_or(Error::InvalidParameter)?;
        output.dpms.ok_or(Error::OperationFailed)
    }

    /// Watch for connection/DPMS changes streamed by the server.
    pub fn add_change_handler(
        &self,
        func: impl Fn(OutputChange) + Send + Sync + 'static,
    ) -> Result<HandlerId, Error> {
        let mut inner = self.client.inner.lock().unwrap();
        let output = inner
            .outputs
            .get_mut(&self.output_id)
            .ok_or(Error::InvalidParameter)?;
        let id = HandlerId::next();
        output.handlers.push((id, Arc::new(func)));
        Ok(id)
    }

    pub fn remove_change_handler(&self, id: HandlerId) {
        let mut inner = self.client.inner.lock().unwrap();
        if let Some(output) = inner.outputs.get_mut(&self.output_id) {
            output.handlers.retain(|(h, _)| *h != id);
        }
    }

    pub fn create_vblank(&self) -> Result<ClientVblank, Error> {
        let mut inner = self.client.inner.lock().unwrap();
        let vblank_id = inner.next_vblank_id;
        inner.next_vblank_id += 1;
        inner.vblanks.insert(vblank_id, VblankState::default());
        inner.send(&Request::CreateVblank { output_id: self.output_id, vblank_id })?;
        Ok(ClientVblank { client: self.client.clone(), vblank_id })
    }
}

impl Drop for ClientOutput {
    fn drop(&mut self) {
        let mut inner = self.client.inner.lock().unwrap();
        inner.outputs.remove(&self.output_id);
        let _ = inner.send(&Request::DestroyOutput { output_id: self.output_id });
    }
}

/// A vblank resource over a bound output.
pub struct ClientVblank {
    client: Client,
    vblank_id: u32,
}

impl ClientVblank {
    pub fn set_fps(&self, fps: u32) -> Result<(), Error> {
        let mut inner = self.client.inner.lock().unwrap();
        inner.send(&Request::SetFps { vblank_id: self.vblank_id, fps })
    }

    pub fn set_offset(&self, offset_ms: i32) -> Result<(), Error> {
        let mut inner = self.client.inner.lock().unwrap();
        inner.send(&Request::SetOffset { vblank_id: self.vblank_id, offset_ms })
    }

    pub fn set_enable_fake(&self, enable: bool) -> Result<(), Error> {
        let mut inner = self.client.inner.lock().unwrap();
        inner.send(&Request::SetEnableFake { vblank_id: self.vblank_id, enable })
    }

    /// Make waits block until their tick arrives.
    pub fn set_sync(&self, sync: bool) -> Result<(), Error> {
        let mut inner = self.client.inner.lock().unwrap();
        inner
            .vblanks
            .get_mut(&self.vblank_id)
            .ok_or(Error::InvalidParameter)?
            .sync = sync;
        inner.send(&Request::SetSync { vblank_id: self.vblank_id, sync })
    }

    /// Ask for a tick `interval` periods after the previous one. The
    /// handler fires from `handle_events` (or before this returns, in
    /// sync mode).
    pub fn wait(
        &self,
        interval: u32,
        func: impl FnOnce(WaitResult) + Send + 'static,
    ) -> Result<(), Error> {
        let (req_id, sync) = {
            let mut inner = self.client.inner.lock().unwrap();
            let req_id = inner.next_req_id;
            inner.next_req_id += 1;

            let now = tdm::types::monotonic_us();
            let request = Request::WaitVblank {
                vblank_id: self.vblank_id,
                interval,
                req_id,
                req_sec: now / 1_000_000,
                req_usec: now % 1_000_000,
            };
            let vblank = inner
                .vblanks
                .get_mut(&self.vblank_id)
                .ok_or(Error::InvalidParameter)?;
            vblank.waits.insert(req_id, Box::new(func));
            let sync = vblank.sync;
            inner.send(&request)?;
            (req_id, sync)
        };

        if sync {
            self.client.roundtrip_until(|inner| {
                inner
                    .vblanks
                    .get(&self.vblank_id)
                    .map_or(true, |vblank| !vblank.waits.contains_key(&req_id))
            })?;
        }
        Ok(())
    }
}

impl Drop for ClientVblank {
    fn drop(&mut self) {
        let mut inner = self.client.inner.lock().unwrap();
        inner.vblanks.remove(&self.vblank_id);
        let _ = inner.send(&Request::DestroyVblank { vblank_id: self.vblank_id });
    }
}
