//! Buffer tracker properties: release exactly once per drained cycle, in
//! registration order; destroy after releases.

use std::sync::{Arc, Mutex};

use proptest::prelude::*;
use tdm::{Format, Surface};

proptest! {
    #[test]
    fn releases_fire_once_per_drained_cycle(
        refs in 1usize..6,
        cycles in 1usize..4,
        handlers in 1usize..5,
    ) {
        let surface = Surface::alloc(64, 64, Format::ARGB8888);
        let log: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));

        for handler in 0..handlers {
            let log = log.clone();
            surface.add_release_handler(move |_| log.lock().unwrap().push(handler));
        }

        for _ in 0..cycles {
            let held: Vec<Surface> = (0..refs).map(|_| surface.ref_backend()).collect();
            prop_assert_eq!(surface.backend_refs(), refs as u32);
            for surface in held {
                surface.unref_backend();
            }
            prop_assert_eq!(surface.backend_refs(), 0);
        }

        // One full pass per cycle, handlers in registration order.
        let expected: Vec<usize> = (0..cycles).flat_map(|_| 0..handlers).collect();
        prop_assert_eq!(&*log.lock().unwrap(), &expected);
    }

    #[test]
    fn destroy_fires_once_after_releases(refs in 1usize..4) {
        let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let surface = Surface::alloc(16, 16, Format::XRGB8888);

        let log = order.clone();
        surface.add_release_handler(move |_| log.lock().unwrap().push("release"));
        let log = order.clone();
        surface.add_destroy_handler(move || log.lock().unwrap().push("destroy"));

        let held: Vec<Surface> = (0..refs).map(|_| surface.ref_backend()).collect();
        for surface in held {
            surface.unref_backend();
        }
        drop(surface);

        let order = order.lock().unwrap();
        prop_assert_eq!(order.last(), Some(&"destroy"));
        prop_assert_eq!(order.iter().filter(|s| **s == "destroy").count(), 1);
        prop_assert_eq!(order.iter().filter(|s| **s == "release").count(), 1);
    }
}

#[test]
fn transient_ref_keeps_the_surface_alive_during_release() {
    // The handler can clone the surface; the storage stays valid for the
    // duration of the call even if the producer dropped its handle.
    let escaped: Arc<Mutex<Option<Surface>>> = Arc::new(Mutex::new(None));
    let surface = Surface::alloc(32, 32, Format::ARGB8888);

    let stash = escaped.clone();
    surface.add_release_handler(move |s| {
        *stash.lock().unwrap() = Some(s.clone());
    });

    let held = surface.ref_backend();
    drop(surface);
    held.unref_backend();

    let kept = escaped.lock().unwrap().take().expect("handler ran");
    assert_eq!(kept.width(), 32);
}
