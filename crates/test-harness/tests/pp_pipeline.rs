//! PP pipeline: FIFO completion, attach budget and teardown release.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use test_harness::assertions::{drive_until, Counter};
use test_harness::fixtures::{init_display, init_with, one_output};
use test_harness::software::{software_backend_with, BackendOptions};
use tdm::types::{BufferConfig, PpInfo, Rect, Size, Transform};
use tdm::{Format, Surface};

fn pp_info() -> PpInfo {
    let config = |format| BufferConfig {
        size: Size { h: 640, v: 480 },
        pos: Rect { x: 0, y: 0, w: 640, h: 480 },
        format,
    };
    PpInfo {
        src: config(Format::ARGB8888),
        dst: config(Format::NV12),
        transform: Transform::Normal,
        sync: false,
        flags: 0,
    }
}

fn pair() -> (Surface, Surface) {
    (
        Surface::alloc(640, 480, Format::ARGB8888),
        Surface::alloc(640, 480, Format::NV12),
    )
}

#[test]
fn conversions_complete_in_attach_order() {
    let fixture = init_display(one_output());
    let pp = fixture.display.create_pp().unwrap();
    pp.set_info(&pp_info()).unwrap();

    let released: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
    let done = Counter::new();
    let c = done.clone();
    pp.set_done_handler(move |_src, _dst| c.bump()).unwrap();

    let pairs: Vec<(Surface, Surface)> = (0..3).map(|_| pair()).collect();
    let mut expected_order = Vec::new();
    for (src, dst) in &pairs {
        for buffer in [src, dst] {
            let log = released.clone();
            buffer.add_release_handler(move |b| log.lock().unwrap().push(b.id()));
        }
        expected_order.push(src.id());
        expected_order.push(dst.id());
        pp.attach(src, dst).unwrap();
    }

    pp.commit().unwrap();

    assert!(
        drive_until(&fixture.display, Duration::from_millis(300), done.at_least(3)),
        "pp completions missing"
    );
    assert_eq!(done.get(), 3);

    // Releases follow attach/commit order, src before dst per pair.
    assert_eq!(*released.lock().unwrap(), expected_order);
    for (src, dst) in &pairs {
        assert_eq!(src.backend_refs(), 0);
        assert_eq!(dst.backend_refs(), 0);
    }
}

#[test]
fn attach_budget_is_enforced_from_abi_1_2() {
    let options = BackendOptions { max_attach_count: 2, ..BackendOptions::default() };
    let fixture = init_with(one_output(), options, false);

    let pp = fixture.display.create_pp().unwrap();
    pp.set_info(&pp_info()).unwrap();

    let (src1, dst1) = pair();
    let (src2, dst2) = pair();
    let (src3, dst3) = pair();
    pp.attach(&src1, &dst1).unwrap();
    pp.attach(&src2, &dst2).unwrap();
    assert_eq!(pp.attach(&src3, &dst3), Err(tdm::Error::BadRequest));
}

#[test]
fn attach_budget_is_ignored_below_abi_1_2() {
    let socket_dir = tempfile::tempdir().unwrap();
    let options = BackendOptions { max_attach_count: 1, ..BackendOptions::default() };
    let (backend, _control) = software_backend_with(one_output(), options);

    let identity = tdm::ModuleIdentity {
        abi_version: tdm::backend::abi_version(1, 1),
        ..tdm::ModuleIdentity::default()
    };
    let config = tdm::config::Config {
        thread: false,
        socket_dir: Some(socket_dir.path().to_path_buf()),
        ..tdm::config::Config::default()
    };
    let display = tdm::Display::init_with_backend(identity, backend, config).unwrap();

    let pp = display.create_pp().unwrap();
    let (src1, dst1) = pair();
    let (src2, dst2) = pair();
    pp.attach(&src1, &dst1).unwrap();
    // A 1.1 module predates the budget field; it is not enforced.
    pp.attach(&src2, &dst2).unwrap();
}

#[test]
fn destroy_releases_outstanding_pairs() {
    let fixture = init_display(one_output());
    let pp = fixture.display.create_pp().unwrap();
    pp.set_info(&pp_info()).unwrap();

    let released = Counter::new();
    let (src, dst) = pair();
    for buffer in [&src, &dst] {
        let c = released.clone();
        buffer.add_release_handler(move |_| c.bump());
    }

    pp.attach(&src, &dst).unwrap();
    pp.commit().unwrap();
    drop(pp);

    assert_eq!(released.get(), 2, "destroy must release in-flight pairs");
    assert_eq!(src.backend_refs(), 0);
    assert_eq!(dst.backend_refs(), 0);
}

#[test]
fn missing_engine_reports_no_capability() {
    let options = BackendOptions { pp: false, ..BackendOptions::default() };
    let fixture = init_with(one_output(), options, false);
    assert!(matches!(
        fixture.display.create_pp().map(|_| ()),
        Err(tdm::Error::NoCapability)
    ));
    assert!(matches!(
        fixture.display.pp_capabilities(),
        Err(tdm::Error::NoCapability)
    ));
}
