//! Vblank engine timing: hardware subsampling, software fallback and fake
//! ticks while powered down.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use test_harness::assertions::{assert_strictly_increasing, drive_until};
use test_harness::fixtures::{init_display, one_output, primary_on};
use tdm::{Dpms, VblankSample};

fn collect_ticks(
    fixture: &test_harness::TestDisplay,
    vblank: &tdm::Vblank,
    count: usize,
) -> Vec<VblankSample> {
    let samples: Arc<Mutex<Vec<VblankSample>>> = Arc::new(Mutex::new(Vec::new()));
    for i in 0..count {
        let sink = samples.clone();
        vblank
            .wait(1, move |result| {
                if let Ok(sample) = result {
                    sink.lock().unwrap().push(sample);
                }
            })
            .unwrap();

        let want = i + 1;
        let sink = samples.clone();
        assert!(
            drive_until(&fixture.display, Duration::from_millis(500), move || {
                sink.lock().unwrap().len() >= want
            }),
            "tick {want} never arrived"
        );
    }
    Arc::try_unwrap(samples).unwrap().into_inner().unwrap()
}

fn deltas_us(samples: &[VblankSample]) -> Vec<u64> {
    samples
        .windows(2)
        .map(|pair| {
            let a = pair[0].tv_sec * 1_000_000 + pair[0].tv_usec;
            let b = pair[1].tv_sec * 1_000_000 + pair[1].tv_usec;
            b - a
        })
        .collect()
}

#[test]
fn dividing_fps_rides_hardware_ticks() {
    let fixture = init_display(one_output()); // 60 Hz
    let output = primary_on(&fixture);
    let vblank = output.create_vblank().unwrap();
    vblank.set_fps(30).unwrap();

    let samples = collect_ticks(&fixture, &vblank, 5);

    let sequences: Vec<u32> = samples.iter().map(|s| s.sequence).collect();
    assert_eq!(sequences, vec![1, 2, 3, 4, 5]);

    for delta in deltas_us(&samples) {
        assert!(
            (33_300..=33_370).contains(&delta),
            "30fps tick spacing off: {delta}us"
        );
    }
}

#[test]
fn non_dividing_fps_falls_back_to_software() {
    let fixture = init_display(one_output()); // 60 Hz
    let output = primary_on(&fixture);
    let vblank = output.create_vblank().unwrap();
    vblank.set_fps(45).unwrap();

    let samples = collect_ticks(&fixture, &vblank, 4);

    // Exactly one hardware wait: the one that seeded the timeline.
    assert_eq!(
        fixture.control.vblank_request_count(),
        1,
        "software path must not keep asking the hardware"
    );

    for delta in deltas_us(&samples) {
        assert!(
            (22_200..=22_250).contains(&delta),
            "45fps tick spacing off: {delta}us"
        );
    }
    assert_strictly_increasing(&samples.iter().map(|s| s.sequence).collect::<Vec<_>>());
}

#[test]
fn fake_ticks_keep_running_while_powered_down() {
    let fixture = init_display(one_output());
    let output = primary_on(&fixture);
    output.set_dpms(Dpms::Off).unwrap();

    let vblank = output.create_vblank().unwrap();
    vblank.set_enable_fake(true).unwrap();

    let samples = collect_ticks(&fixture, &vblank, 3);

    assert_eq!(
        fixture.control.vblank_request_count(),
        0,
        "fake ticks never touch the hardware"
    );
    for delta in deltas_us(&samples) {
        assert!(
            (16_600..=16_750).contains(&delta),
            "fake tick spacing off: {delta}us"
        );
    }
    assert_strictly_increasing(&samples.iter().map(|s| s.sequence).collect::<Vec<_>>());
}

#[test]
fn wait_without_fake_fails_fast_when_powered_down() {
    let fixture = init_display(one_output());
    let output = primary_on(&fixture);
    output.set_dpms(Dpms::Off).unwrap();

    let vblank = output.create_vblank().unwrap();
    let result = vblank.wait(1, |_| {});
    assert_eq!(result, Err(tdm::Error::DpmsOff));
}

#[test]
fn dpms_off_fails_outstanding_hardware_waits() {
    let fixture = init_display(one_output());
    let output = primary_on(&fixture);
    let vblank = output.create_vblank().unwrap();

    let errors: Arc<Mutex<Vec<tdm::Error>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = errors.clone();
    vblank
        .wait(1, move |result| {
            if let Err(e) = result {
                sink.lock().unwrap().push(e);
            }
        })
        .unwrap();

    output.set_dpms(Dpms::Off).unwrap();

    let sink = errors.clone();
    assert!(drive_until(&fixture.display, Duration::from_millis(100), move || {
        !sink.lock().unwrap().is_empty()
    }));
    assert_eq!(*errors.lock().unwrap(), vec![tdm::Error::DpmsOff]);
}

#[test]
fn fps_above_refresh_still_ticks() {
    // 90 on a 60 Hz panel cannot ride hardware; the software grid carries
    // it at the requested rate.
    let fixture = init_display(one_output());
    let output = primary_on(&fixture);
    let vblank = output.create_vblank().unwrap();
    vblank.set_fps(90).unwrap();

    let samples = collect_ticks(&fixture, &vblank, 3);
    for delta in deltas_us(&samples) {
        assert!((11_050..=11_170).contains(&delta), "90fps spacing off: {delta}us");
    }
}
