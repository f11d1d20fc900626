//! Commit flow: submission, completion, DPMS gating and buffer rotation.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use test_harness::assertions::{drive_until, Counter};
use test_harness::fixtures::{init_display, one_output, primary_on};
use tdm::{Dpms, Format, Surface};

#[test]
fn single_layer_commit_shows_buffer() {
    let fixture = init_display(one_output());
    let output = primary_on(&fixture);
    let layer = output.get_layer(0).unwrap();

    let buffer = Surface::alloc(1920, 1080, Format::ARGB8888);
    layer.set_buffer(&buffer).unwrap();
    assert!(!layer.is_usable().unwrap());

    let done = Counter::new();
    let sequence = Arc::new(AtomicU32::new(0));
    let (c, s) = (done.clone(), sequence.clone());
    output
        .commit(false, move |seq, _sec, _usec| {
            s.store(seq, Ordering::SeqCst);
            c.bump();
        })
        .unwrap();

    assert!(
        drive_until(&fixture.display, Duration::from_millis(100), done.at_least(1)),
        "commit completion did not arrive"
    );
    assert_eq!(done.get(), 1);
    assert_eq!(sequence.load(Ordering::SeqCst), 1);
    assert_eq!(layer.displaying_buffer().unwrap(), Some(buffer));
}

#[test]
fn commit_rejected_while_powered_down() {
    let fixture = init_display(one_output());
    let output = primary_on(&fixture);
    let layer = output.get_layer(0).unwrap();
    layer
        .set_buffer(&Surface::alloc(1920, 1080, Format::ARGB8888))
        .unwrap();

    output.set_dpms(Dpms::Off).unwrap();

    let done = Counter::new();
    let c = done.clone();
    let result = output.commit(false, move |_, _, _| c.bump());
    assert_eq!(result, Err(tdm::Error::BadRequest));

    drive_until(&fixture.display, Duration::from_millis(60), || false);
    assert_eq!(done.get(), 0, "no handler may fire for a rejected commit");
}

#[test]
fn wait_vblank_rejected_while_powered_down() {
    let fixture = init_display(one_output());
    let output = primary_on(&fixture);
    output.set_dpms(Dpms::Off).unwrap();

    let result = output.wait_vblank(1, false, |_, _, _| {});
    assert_eq!(result, Err(tdm::Error::BadRequest));
}

#[test]
fn replaced_buffer_is_released_once() {
    let fixture = init_display(one_output());
    let output = primary_on(&fixture);
    let layer = output.get_layer(0).unwrap();

    let first = Surface::alloc(1920, 1080, Format::ARGB8888);
    let second = Surface::alloc(1920, 1080, Format::ARGB8888);

    let releases = Arc::new(Mutex::new(Vec::new()));
    for (name, buffer) in [("first", &first), ("second", &second)] {
        let log = releases.clone();
        buffer.add_release_handler(move |_| log.lock().unwrap().push(name));
    }

    let commits = Counter::new();

    layer.set_buffer(&first).unwrap();
    let c = commits.clone();
    output.commit(false, move |_, _, _| c.bump()).unwrap();
    assert!(drive_until(&fixture.display, Duration::from_millis(100), commits.at_least(1)));
    assert!(releases.lock().unwrap().is_empty(), "showing buffer must stay referenced");

    layer.set_buffer(&second).unwrap();
    let c = commits.clone();
    output.commit(false, move |_, _, _| c.bump()).unwrap();
    assert!(drive_until(&fixture.display, Duration::from_millis(100), commits.at_least(2)));

    // The first buffer left the screen exactly once.
    assert_eq!(*releases.lock().unwrap(), vec!["first"]);
    assert_eq!(first.backend_refs(), 0);
    assert_eq!(layer.displaying_buffer().unwrap(), Some(second.clone()));

    layer.unset_buffer().unwrap();
    assert_eq!(*releases.lock().unwrap(), vec!["first", "second"]);
    assert!(layer.is_usable().unwrap());
    assert_eq!(layer.displaying_buffer().unwrap(), None);
}

#[test]
fn committed_buffer_accounting_balances() {
    // Every submitted buffer ends up showing, displaced, or cleared; no
    // reference survives the teardown of its slot.
    let fixture = init_display(one_output());
    let output = primary_on(&fixture);
    let layer = output.get_layer(0).unwrap();

    let buffers: Vec<Surface> = (0..4)
        .map(|_| Surface::alloc(640, 480, Format::XRGB8888))
        .collect();
    let commits = Counter::new();

    for buffer in &buffers {
        layer.set_buffer(buffer).unwrap();
        let c = commits.clone();
        output.commit(false, move |_, _, _| c.bump()).unwrap();
        let want = commits.get() + 1;
        assert!(drive_until(
            &fixture.display,
            Duration::from_millis(100),
            commits.at_least(want)
        ));
    }

    layer.unset_buffer().unwrap();
    for buffer in &buffers {
        assert_eq!(buffer.backend_refs(), 0, "leaked ref on {buffer:?}");
    }
}
