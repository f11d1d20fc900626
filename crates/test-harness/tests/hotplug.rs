//! Hot-unplug behavior: outstanding waits vanish, the change handler is
//! the only signal.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use test_harness::assertions::{drive_until, Counter};
use test_harness::fixtures::{init_display, one_output, primary_on};
use tdm::{ChangeEvent, ConnStatus};

#[test]
fn unplug_discards_outstanding_waits_silently() {
    let fixture = init_display(one_output());
    let output = primary_on(&fixture);

    let changes = Counter::new();
    let last_status = Arc::new(AtomicU32::new(u32::MAX));
    let (c, s) = (changes.clone(), last_status.clone());
    output
        .add_change_handler(move |event| {
            if let ChangeEvent::Connection(status) = event {
                s.store(status as u32, Ordering::SeqCst);
                c.bump();
            }
        })
        .unwrap();

    // Two hardware waits in flight.
    let ticks = Counter::new();
    let vblank = output.create_vblank().unwrap();
    for interval in [1, 2] {
        let t = ticks.clone();
        vblank
            .wait(interval, move |result| {
                if result.is_ok() {
                    t.bump();
                }
            })
            .unwrap();
    }
    assert_eq!(fixture.control.vblank_request_count(), 2);

    fixture.control.set_connected(0, false);

    assert!(
        drive_until(&fixture.display, Duration::from_millis(200), changes.at_least(1)),
        "connection change never delivered"
    );

    // Long enough for both scheduled hardware ticks to have fired.
    drive_until(&fixture.display, Duration::from_millis(80), || false);

    assert_eq!(changes.get(), 1, "exactly one connection change");
    assert_eq!(last_status.load(Ordering::SeqCst), ConnStatus::Disconnected as u32);
    assert_eq!(ticks.get(), 0, "discarded waits must not call back");
    assert_eq!(output.conn_status().unwrap(), ConnStatus::Disconnected);
}

#[test]
fn replug_is_reported() {
    let fixture = init_display(one_output());
    let output = primary_on(&fixture);

    let connected = Counter::new();
    let c = connected.clone();
    output
        .add_change_handler(move |event| {
            if event == ChangeEvent::Connection(ConnStatus::Connected) {
                c.bump();
            }
        })
        .unwrap();

    fixture.control.set_connected(0, false);
    drive_until(&fixture.display, Duration::from_millis(100), || false);
    fixture.control.set_connected(0, true);

    assert!(drive_until(
        &fixture.display,
        Duration::from_millis(200),
        connected.at_least(1)
    ));
    assert_eq!(output.conn_status().unwrap(), ConnStatus::Connected);
}
