//! The wire server: per-client output and vblank objects plus the debug
//! command channel, multiplexed on the display event loop.

use std::collections::HashMap;
use std::io::Write;
use std::os::fd::AsFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::Arc;

use crate::display::{current_tid, DisplayState, Shared, Token};
use crate::error::{Error, Result};
use crate::event_loop::{Readiness, SourceId};
use crate::output::{ChangeEntry, ChangeEvent};
use crate::protocol::{Event, Request, SOCKET_NAME};
use crate::types::{ConnStatus, HandlerId};

pub(crate) struct ServerState {
    pub socket_path: PathBuf,
    listener: UnixListener,
    listener_source: SourceId,
    clients: HashMap<u64, ClientState>,
    next_client: u64,
}

struct ClientState {
    stream: UnixStream,
    source: SourceId,
    buf: Vec<u8>,
    outputs: HashMap<u32, ServerOutput>,
    vblanks: HashMap<u32, ServerVblank>,
}

struct ServerOutput {
    output_stamp: u64,
    change_handler: HandlerId,
    vblank_ids: Vec<u32>,
}

struct ServerVblank {
    stamp: u64,
    output_id: u32,
}

/// Bind the socket and start listening on the loop.
pub(crate) fn init(st: &mut DisplayState) -> Result<()> {
    let dir = st.config.runtime_dir();
    let socket_path = dir.join(SOCKET_NAME);
    // A previous instance may have left the socket file behind.
    let _ = std::fs::remove_file(&socket_path);

    let listener = UnixListener::bind(&socket_path).map_err(|e| {
        tracing::warn!(path = %socket_path.display(), error = %e, "socket bind failed");
        Error::OperationFailed
    })?;
    listener.set_nonblocking(true)?;

    let listener_source =
        st.event_loop
            .add_fd(listener.as_fd(), Readiness::READABLE, Token::ServerListener)?;

    tracing::info!(path = %socket_path.display(), "wire server listening");
    st.server = Some(ServerState {
        socket_path,
        listener,
        listener_source,
        clients: HashMap::new(),
        next_client: 1,
    });
    Ok(())
}

/// Close every client and unlink the socket.
pub(crate) fn teardown(st: &mut DisplayState) {
    let Some(mut server) = st.server.take() else {
        return;
    };
    let ids: Vec<u64> = server.clients.keys().copied().collect();
    for id in ids {
        disconnect(st, &mut server, id);
    }
    let _ = st.event_loop.remove_fd(server.listener_source);
    let _ = std::fs::remove_file(&server.socket_path);
    tracing::info!("wire server stopped");
}

/// The listener is readable: accept whoever is queued.
pub(crate) fn accept(st: &mut DisplayState, _shared: &Arc<Shared>) {
    let Some(mut server) = st.server.take() else {
        return;
    };
    loop {
        match server.listener.accept() {
            Ok((stream, _)) => {
                if let Err(e) = stream.set_nonblocking(true) {
                    tracing::warn!(error = %e, "client socket setup failed");
                    continue;
                }
                let id = server.next_client;
                server.next_client += 1;
                match st.event_loop.add_fd(
                    stream.as_fd(),
                    Readiness::READABLE,
                    Token::ServerClient(id),
                ) {
                    Ok(source) => {
                        tracing::debug!(client = id, "wire client connected");
                        server.clients.insert(
                            id,
                            ClientState {
                                stream,
                                source,
                                buf: Vec::new(),
                                outputs: HashMap::new(),
                                vblanks: HashMap::new(),
                            },
                        );
                    }
                    Err(e) => tracing::warn!(error = ?e, "client source registration failed"),
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                break;
            }
        }
    }
    st.server = Some(server);
}

/// A client socket is readable (or gone).
pub(crate) fn client_ready(
    st: &mut DisplayState,
    shared: &Arc<Shared>,
    id: u64,
    readiness: Readiness,
) {
    let Some(mut server) = st.server.take() else {
        return;
    };

    let mut dead = readiness.contains(Readiness::HANGUP) || readiness.contains(Readiness::ERROR);
    let mut requests = Vec::new();

    if let Some(client) = server.clients.get_mut(&id) {
        if !dead {
            dead = read_requests(client, &mut requests);
        }
    } else {
        st.server = Some(server);
        return;
    }

    for request in requests {
        handle_request(st, shared, &mut server, id, request);
    }

    if dead {
        disconnect(st, &mut server, id);
    }
    st.server = Some(server);
}

/// Pull whatever is buffered on the socket; true when the peer is gone.
fn read_requests(client: &mut ClientState, requests: &mut Vec<Request>) -> bool {
    use std::io::Read;

    let mut chunk = [0u8; 4096];
    let dead = loop {
        match client.stream.read(&mut chunk) {
            Ok(0) => break true,
            Ok(n) => client.buf.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break false,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::debug!(error = %e, "client read failed");
                break true;
            }
        }
    };

    while let Some(at) = client.buf.iter().position(|&b| b == b'\n') {
        let line: Vec<u8> = client.buf.drain(..=at).collect();
        let line = String::from_utf8_lossy(&line[..line.len() - 1]).into_owned();
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Request>(&line) {
            Ok(request) => requests.push(request),
            Err(e) => {
                tracing::warn!(error = %e, "bad wire request");
                send_event(&client.stream, &Event::Error { message: format!("bad request: {e}") });
            }
        }
    }
    dead
}

fn send_event(stream: &UnixStream, event: &Event) {
    let Ok(json) = serde_json::to_string(event) else {
        return;
    };
    let mut stream = stream;
    if let Err(e) = writeln!(stream, "{json}") {
        tracing::debug!(error = %e, "wire event write failed");
    }
}

fn handle_request(
    st: &mut DisplayState,
    shared: &Arc<Shared>,
    server: &mut ServerState,
    id: u64,
    request: Request,
) {
    match request {
        Request::CreateOutput { output_id, name } => {
            create_output(st, shared, server, id, output_id, &name);
        }
        Request::DestroyOutput { output_id } => {
            let Some(client) = server.clients.get_mut(&id) else {
                return;
            };
            if let Some(bound) = client.outputs.remove(&output_id) {
                release_output(st, client, bound);
            }
        }
        Request::CreateVblank { output_id, vblank_id } => {
            let Some(client) = server.clients.get_mut(&id) else {
                return;
            };
            let Some(bound) = client.outputs.get_mut(&output_id) else {
                send_event(&client.stream, &Event::Error { message: "unknown output".into() });
                return;
            };
            match crate::vblank::create_internal(st, bound.output_stamp) {
                Ok(stamp) => {
                    bound.vblank_ids.push(vblank_id);
                    client.vblanks.insert(vblank_id, ServerVblank { stamp, output_id });
                }
                Err(e) => {
                    send_event(
                        &client.stream,
                        &Event::Error { message: format!("vblank create failed: {e}") },
                    );
                }
            }
        }
        Request::DestroyVblank { vblank_id } => {
            let Some(client) = server.clients.get_mut(&id) else {
                return;
            };
            if let Some(vblank) = client.vblanks.remove(&vblank_id) {
                if let Some(bound) = client.outputs.get_mut(&vblank.output_id) {
                    bound.vblank_ids.retain(|v| *v != vblank_id);
                }
                crate::vblank::destroy_internal(st, vblank.stamp);
            }
        }
        Request::SetFps { vblank_id, fps } => {
            with_vblank(st, server, id, vblank_id, |st, stamp| {
                crate::vblank::set_fps_internal(st, stamp, fps)
            });
        }
        Request::SetOffset { vblank_id, offset_ms } => {
            with_vblank(st, server, id, vblank_id, |st, stamp| {
                crate::vblank::set_offset_internal(st, stamp, offset_ms)
            });
        }
        Request::SetEnableFake { vblank_id, enable } => {
            with_vblank(st, server, id, vblank_id, |st, stamp| {
                crate::vblank::set_enable_fake_internal(st, stamp, enable)
            });
        }
        Request::SetSync { vblank_id, sync } => {
            with_vblank(st, server, id, vblank_id, |st, stamp| {
                crate::vblank::set_sync_internal(st, stamp, sync)
            });
        }
        Request::WaitVblank { vblank_id, interval, req_id, req_sec, req_usec } => {
            wait_vblank(st, shared, server, id, vblank_id, interval, req_id, req_sec, req_usec);
        }
        Request::Debug { options } => {
            let message = crate::debug::run_command(&mut st.debug, &options);
            if let Some(client) = server.clients.get(&id) {
                send_event(&client.stream, &Event::DebugDone { message });
            }
        }
    }
}

fn with_vblank(
    st: &mut DisplayState,
    server: &mut ServerState,
    id: u64,
    vblank_id: u32,
    f: impl FnOnce(&mut DisplayState, u64) -> Result<()>,
) {
    let Some(client) = server.clients.get(&id) else {
        return;
    };
    let Some(vblank) = client.vblanks.get(&vblank_id) else {
        send_event(&client.stream, &Event::Error { message: "unknown vblank".into() });
        return;
    };
    if let Err(e) = f(st, vblank.stamp) {
        send_event(&client.stream, &Event::Error { message: format!("{e}") });
    }
}

fn create_output(
    st: &mut DisplayState,
    shared: &Arc<Shared>,
    server: &mut ServerState,
    id: u64,
    output_id: u32,
    name: &str,
) {
    let Some(client) = server.clients.get_mut(&id) else {
        return;
    };

    let Some(output_stamp) = find_output(st, name) else {
        tracing::warn!(name, "no such output");
        send_event(
            &client.stream,
            &Event::Error { message: format!("there is no '{name}' output") },
        );
        return;
    };

    let (mode, dpms, status) = {
        let Ok(out) = st.output_mut(output_stamp) else {
            return;
        };
        let Ok(mode) = out.backend.mode() else {
            send_event(
                &client.stream,
                &Event::Error { message: format!("no mode for '{name}' output") },
            );
            return;
        };
        let dpms = out.backend.dpms().unwrap_or(out.dpms);
        (mode, dpms, out.caps.status)
    };

    // Stream changes to this client for as long as the resource lives.
    let stream = match client.stream.try_clone() {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!(error = %e, "stream clone failed");
            return;
        }
    };
    let entry = ChangeEntry {
        id: HandlerId::next(),
        owner: current_tid(),
        func: Arc::new(move |event| match event {
            ChangeEvent::Dpms(value) => {
                send_event(&stream, &Event::OutputDpms { output_id, value });
            }
            ChangeEvent::Connection(status) => {
                send_event(&stream, &Event::OutputConnection { output_id, status });
            }
        }),
    };
    let handler_id = entry.id;
    {
        let Ok(out) = st.output_mut(output_stamp) else {
            return;
        };
        if shared.bridge.is_display_thread(current_tid()) {
            out.change_main.push(entry);
        } else {
            out.change_sub.push(entry);
        }
    }

    client.outputs.insert(
        output_id,
        ServerOutput { output_stamp, change_handler: handler_id, vblank_ids: Vec::new() },
    );

    send_event(
        &client.stream,
        &Event::OutputMode {
            output_id,
            hdisplay: mode.hdisplay,
            vdisplay: mode.vdisplay,
            vrefresh: mode.vrefresh,
        },
    );
    send_event(&client.stream, &Event::OutputDpms { output_id, value: dpms });
    send_event(&client.stream, &Event::OutputConnection { output_id, status });
}

/// Resolve a client-supplied output name: the primary aliases, then a
/// connected output with a matching model.
fn find_output(st: &DisplayState, name: &str) -> Option<u64> {
    let lowered = name.to_ascii_lowercase();
    if lowered.starts_with("primary") || lowered.starts_with("default") {
        return st.outputs.first().map(|o| o.stamp);
    }
    st.outputs
        .iter()
        .find(|o| o.caps.status != ConnStatus::Disconnected && o.caps.model == name)
        .map(|o| o.stamp)
}

#[allow(clippy::too_many_arguments)]
fn wait_vblank(
    st: &mut DisplayState,
    shared: &Arc<Shared>,
    server: &mut ServerState,
    id: u64,
    vblank_id: u32,
    interval: u32,
    req_id: u32,
    req_sec: u64,
    req_usec: u64,
) {
    let Some(client) = server.clients.get(&id) else {
        return;
    };
    let Some(vblank) = client.vblanks.get(&vblank_id) else {
        send_event(&client.stream, &Event::Error { message: "unknown vblank".into() });
        return;
    };

    let stream = match client.stream.try_clone() {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!(error = %e, "stream clone failed");
            return;
        }
    };
    let reply_stream = match client.stream.try_clone() {
        Ok(stream) => stream,
        Err(_) => return,
    };

    let req_us = req_sec * 1_000_000 + req_usec;
    let result = crate::vblank::wait_internal(
        st,
        shared,
        vblank.stamp,
        req_us,
        interval,
        Box::new(move |result| {
            let event = match result {
                Ok(sample) => Event::VblankDone {
                    req_id,
                    sequence: sample.sequence,
                    tv_sec: sample.tv_sec,
                    tv_usec: sample.tv_usec,
                    error: None,
                },
                Err(e) => Event::VblankDone {
                    req_id,
                    sequence: 0,
                    tv_sec: 0,
                    tv_usec: 0,
                    error: Some(e),
                },
            };
            send_event(&stream, &event);
        }),
    );

    if let Err(e) = result {
        send_event(
            &reply_stream,
            &Event::VblankDone { req_id, sequence: 0, tv_sec: 0, tv_usec: 0, error: Some(e) },
        );
    }
}

fn release_output(st: &mut DisplayState, client: &mut ClientState, bound: ServerOutput) {
    // Vblank resources go first, cancelling their outstanding waits.
    for vblank_id in bound.vblank_ids {
        if let Some(vblank) = client.vblanks.remove(&vblank_id) {
            crate::vblank::destroy_internal(st, vblank.stamp);
        }
    }
    if let Ok(out) = st.output_mut(bound.output_stamp) {
        out.change_main.retain(|entry| entry.id != bound.change_handler);
        out.change_sub.retain(|entry| entry.id != bound.change_handler);
    }
}

fn disconnect(st: &mut DisplayState, server: &mut ServerState, id: u64) {
    let Some(mut client) = server.clients.remove(&id) else {
        return;
    };
    let _ = st.event_loop.remove_fd(client.source);
    let bound: Vec<ServerOutput> = client.outputs.drain().map(|(_, v)| v).collect();
    for output in bound {
        release_output(st, &mut client, output);
    }
    for (_, vblank) in client.vblanks.drain() {
        crate::vblank::destroy_internal(st, vblank.stamp);
    }
    tracing::debug!(client = id, "wire client disconnected");
}
