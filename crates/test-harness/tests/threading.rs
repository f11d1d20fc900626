//! Threaded mode: handlers land on the thread that registered them, and
//! the synchronous wait drives the loop from the caller.

use std::sync::{Arc, Mutex};
use std::thread::ThreadId;
use std::time::Duration;

use test_harness::assertions::{drive_until, Counter};
use test_harness::fixtures::{init_display_threaded, one_output, primary_on};
use tdm::{Format, Surface};

#[test]
fn handlers_run_on_their_registration_thread() {
    let fixture = init_display_threaded(one_output());
    let output = primary_on(&fixture);
    let layer = output.get_layer(0).unwrap();

    let here = std::thread::current().id();
    let seen: Arc<Mutex<Vec<ThreadId>>> = Arc::new(Mutex::new(Vec::new()));

    // A commit completion...
    layer
        .set_buffer(&Surface::alloc(1920, 1080, Format::ARGB8888))
        .unwrap();
    let log = seen.clone();
    output
        .commit(false, move |_, _, _| {
            log.lock().unwrap().push(std::thread::current().id());
        })
        .unwrap();

    // ...and a vblank tick.
    let vblank = output.create_vblank().unwrap();
    let log = seen.clone();
    vblank
        .wait(1, move |_| {
            log.lock().unwrap().push(std::thread::current().id());
        })
        .unwrap();

    let log = seen.clone();
    assert!(
        drive_until(&fixture.display, Duration::from_millis(300), move || {
            log.lock().unwrap().len() >= 2
        }),
        "callbacks did not arrive"
    );

    for id in seen.lock().unwrap().iter() {
        assert_eq!(*id, here, "handler escaped to another thread");
    }
}

#[test]
fn nothing_is_dispatched_without_polling() {
    let fixture = init_display_threaded(one_output());
    let output = primary_on(&fixture);

    let ticks = Counter::new();
    let vblank = output.create_vblank().unwrap();
    let t = ticks.clone();
    vblank.wait(1, move |_| t.bump()).unwrap();

    // The hardware tick has long fired, but this thread never polled.
    std::thread::sleep(Duration::from_millis(60));
    assert_eq!(ticks.get(), 0);

    assert!(drive_until(&fixture.display, Duration::from_millis(100), ticks.at_least(1)));
}

#[test]
fn sync_wait_blocks_until_its_tick() {
    let fixture = init_display_threaded(one_output());
    let output = primary_on(&fixture);

    let vblank = output.create_vblank().unwrap();
    vblank.set_sync(true).unwrap();

    let ticks = Counter::new();
    let t = ticks.clone();
    let started = std::time::Instant::now();
    vblank
        .wait(1, move |result| {
            assert!(result.is_ok());
            t.bump();
        })
        .unwrap();

    // The handler already ran by the time wait returned, roughly one
    // refresh period in.
    assert_eq!(ticks.get(), 1);
    assert!(started.elapsed() < Duration::from_millis(200));
}

#[test]
fn display_fd_signals_pending_work() {
    let fixture = init_display_threaded(one_output());
    let output = primary_on(&fixture);

    let ticks = Counter::new();
    let vblank = output.create_vblank().unwrap();
    let t = ticks.clone();
    vblank.wait(1, move |_| t.bump()).unwrap();

    // poll_events observes readability once the bridge has queued the
    // completion, then dispatches it here.
    assert!(drive_until(&fixture.display, Duration::from_millis(200), ticks.at_least(1)));
    // And with nothing pending it times out quietly.
    assert!(!fixture.display.poll_events(20).unwrap());
}
