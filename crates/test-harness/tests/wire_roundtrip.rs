//! End-to-end over the wire: bind an output, stream events, request
//! vblanks, drive the debug channel.

use std::time::{Duration, Instant};

use test_harness::assertions::Counter;
use test_harness::fixtures::{init_display_threaded, one_output, primary_on};
use tdm::{ConnStatus, Dpms};
use tdm_client::Client;

fn drive_client(client: &Client, timeout: Duration, done: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while !done() {
        if Instant::now() >= deadline {
            return false;
        }
        if client.poll_events(50).is_err() {
            return false;
        }
    }
    true
}

#[test]
fn bind_primary_and_read_state() {
    let fixture = init_display_threaded(one_output());
    let _output = primary_on(&fixture);

    let client = Client::connect_to(&fixture.socket_path()).unwrap();
    let bound = client.get_output("primary").unwrap();

    assert_eq!(bound.resolution().unwrap(), (1920, 1080));
    assert_eq!(bound.refresh_rate().unwrap(), 60);
    assert_eq!(bound.dpms().unwrap(), Dpms::On);
    assert_eq!(bound.conn_status().unwrap(), ConnStatus::Connected);
}

#[test]
fn bind_by_model_and_alias() {
    let fixture = init_display_threaded(one_output());
    let _output = primary_on(&fixture);

    let client = Client::connect_to(&fixture.socket_path()).unwrap();
    // The model string is decorated with the pipe index.
    let by_model = client.get_output("SW-Panel-0").unwrap();
    assert_eq!(by_model.refresh_rate().unwrap(), 60);

    let by_alias = client.get_output("default").unwrap();
    assert_eq!(by_alias.resolution().unwrap(), (1920, 1080));
}

#[test]
fn vblank_waits_complete_over_the_wire() {
    let fixture = init_display_threaded(one_output());
    let _output = primary_on(&fixture);

    let client = Client::connect_to(&fixture.socket_path()).unwrap();
    let bound = client.get_output("primary").unwrap();
    let vblank = bound.create_vblank().unwrap();
    vblank.set_fps(30).unwrap();

    let ticks = Counter::new();
    for _ in 0..3 {
        let t = ticks.clone();
        vblank
            .wait(1, move |result| {
                assert!(result.is_ok(), "wait failed: {result:?}");
                t.bump();
            })
            .unwrap();
        let want = ticks.get() + 1;
        assert!(
            drive_client(&client, Duration::from_millis(500), ticks.at_least(want)),
            "tick never arrived"
        );
    }
    assert_eq!(ticks.get(), 3);
}

#[test]
fn sync_wait_blocks_on_the_client() {
    let fixture = init_display_threaded(one_output());
    let _output = primary_on(&fixture);

    let client = Client::connect_to(&fixture.socket_path()).unwrap();
    let bound = client.get_output("primary").unwrap();
    let vblank = bound.create_vblank().unwrap();
    vblank.set_sync(true).unwrap();

    let ticks = Counter::new();
    let t = ticks.clone();
    vblank.wait(1, move |_| t.bump()).unwrap();
    assert_eq!(ticks.get(), 1, "sync wait returned before its tick");
}

#[test]
fn dpms_changes_stream_to_bound_clients() {
    let fixture = init_display_threaded(one_output());
    let output = primary_on(&fixture);

    let client = Client::connect_to(&fixture.socket_path()).unwrap();
    let bound = client.get_output("primary").unwrap();

    let changes = Counter::new();
    let c = changes.clone();
    bound
        .add_change_handler(move |change| {
            if change == tdm_client::OutputChange::Dpms(Dpms::Off) {
                c.bump();
            }
        })
        .unwrap();

    output.set_dpms(Dpms::Off).unwrap();

    assert!(
        drive_client(&client, Duration::from_millis(500), changes.at_least(1)),
        "dpms change never reached the client"
    );
    assert_eq!(bound.dpms().unwrap(), Dpms::Off);
}

#[test]
fn debug_channel_answers() {
    let fixture = init_display_threaded(one_output());
    let _output = primary_on(&fixture);

    let client = Client::connect_to(&fixture.socket_path()).unwrap();

    let usage = client.debug("help").unwrap();
    assert!(usage.starts_with("usage:"), "unexpected reply: {usage}");

    let reply = client.debug("-dump layer").unwrap();
    assert!(reply.contains("LAYER"), "unexpected reply: {reply}");

    let reply = client.debug("-info").unwrap();
    assert!(reply.contains("dump"), "unexpected reply: {reply}");
    assert!(reply.contains("buffers:"), "no buffer listing: {reply}");
}
