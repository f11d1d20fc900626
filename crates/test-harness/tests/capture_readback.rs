//! Capture readback: one-shot and stream completion, buffer release.

use std::time::Duration;

use test_harness::assertions::{drive_until, Counter};
use test_harness::fixtures::{init_display, one_output, primary_on};
use tdm::types::{BufferConfig, CaptureInfo, Rect, Size, Transform};
use tdm::{Format, Surface};

fn capture_info(oneshot: bool, frequency: u32) -> CaptureInfo {
    CaptureInfo {
        dst: BufferConfig {
            size: Size { h: 1920, v: 1080 },
            pos: Rect { x: 0, y: 0, w: 1920, h: 1080 },
            format: Format::ARGB8888,
        },
        transform: Transform::Normal,
        oneshot,
        frequency,
    }
}

#[test]
fn oneshot_fills_the_latest_attached_buffer() {
    let fixture = init_display(one_output());
    let output = primary_on(&fixture);

    let capture = output.create_capture().unwrap();
    capture.set_info(&capture_info(true, 0)).unwrap();

    let done = Counter::new();
    let c = done.clone();
    capture.set_done_handler(move |_| c.bump()).unwrap();

    let released = Counter::new();
    let buffer = Surface::alloc(1920, 1080, Format::ARGB8888);
    let r = released.clone();
    buffer.add_release_handler(move |_| r.bump());

    capture.attach(&buffer).unwrap();
    capture.commit().unwrap();

    assert!(drive_until(&fixture.display, Duration::from_millis(200), done.at_least(1)));
    assert_eq!(done.get(), 1);
    assert_eq!(released.get(), 1);
    assert_eq!(buffer.backend_refs(), 0);
    // The engine actually wrote into the buffer.
    assert!(buffer.map().iter().all(|&b| b == 0x80));
}

#[test]
fn stream_rotates_through_attached_buffers() {
    let fixture = init_display(one_output());
    let output = primary_on(&fixture);

    let capture = output.create_capture().unwrap();
    capture.set_info(&capture_info(false, 120)).unwrap();

    let done = Counter::new();
    let c = done.clone();
    capture.set_done_handler(move |_| c.bump()).unwrap();

    let buffers: Vec<Surface> = (0..3)
        .map(|_| Surface::alloc(640, 480, Format::XRGB8888))
        .collect();
    for buffer in &buffers {
        capture.attach(buffer).unwrap();
    }
    capture.commit().unwrap();

    assert!(drive_until(&fixture.display, Duration::from_millis(500), done.at_least(3)));
    for buffer in &buffers {
        assert_eq!(buffer.backend_refs(), 0);
    }
}

#[test]
fn layer_capture_works_too() {
    let fixture = init_display(one_output());
    let output = primary_on(&fixture);
    let layer = output.get_layer(0).unwrap();

    let capture = layer.create_capture().unwrap();
    capture.set_info(&capture_info(true, 0)).unwrap();

    let done = Counter::new();
    let c = done.clone();
    capture.set_done_handler(move |_| c.bump()).unwrap();

    let buffer = Surface::alloc(1920, 1080, Format::ARGB8888);
    capture.attach(&buffer).unwrap();
    capture.commit().unwrap();

    assert!(drive_until(&fixture.display, Duration::from_millis(200), done.at_least(1)));
}

#[test]
fn destroy_releases_attached_buffers() {
    let fixture = init_display(one_output());
    let output = primary_on(&fixture);

    let capture = output.create_capture().unwrap();
    let released = Counter::new();
    let buffer = Surface::alloc(640, 480, Format::ARGB8888);
    let r = released.clone();
    buffer.add_release_handler(move |_| r.bump());

    capture.attach(&buffer).unwrap();
    drop(capture);

    assert_eq!(released.get(), 1);
    assert_eq!(buffer.backend_refs(), 0);
}
