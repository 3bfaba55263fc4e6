//! Process-wide context bookkeeping.
//!
//! Kept to a single test: the library is a singleton and other test binaries run
//! in their own processes, so the live count seen here is exact.

use rtbridge_gpu::headless::ProgressMode;
use rtbridge_interop::Library;
use rtbridge_test::harness::shadow_trace;
use rtbridge_test::TestHarness;

#[test]
fn every_way_of_ending_a_context_updates_the_live_count() {
    let library = Library::get();
    let h = TestHarness::new(ProgressMode::Immediate);
    assert_eq!(library.live_contexts(), 0);

    let (dropped, _) = h.init_context(2).unwrap();
    let (destroyed, _) = h.init_context(2).unwrap();
    assert_eq!(library.live_contexts(), 2);

    let output = h.texture();
    let wait = h.fence();
    let signal = h.fence();
    let mut container = dropped.create_task_container();
    container.schedule_trace(shadow_trace(&output));
    dropped
        .invoke_gpu_task(container, Some(&wait), 0, Some(&signal), 1)
        .unwrap();

    drop(dropped);
    assert_eq!(library.live_contexts(), 1);
    assert_eq!(h.registry.open_count(), 0);

    library.destruct(destroyed).unwrap();
    assert_eq!(library.live_contexts(), 0);

    // A failed init never counts.
    assert!(h.init_context(0).is_err());
    assert_eq!(library.live_contexts(), 0);
}
