//! Context creation, resource release and teardown.

use std::sync::Arc;

use rtbridge_core::{Error, SdkVersion, TaskIndex};
use rtbridge_gpu::headless::ProgressMode;
use rtbridge_gpu::SharedHandleKind;
use rtbridge_interop::{ContextSettings, InteropConfig, Library};
use rtbridge_test::harness::shadow_trace;
use rtbridge_test::{RecordingEngine, TestContext, TestHarness};

fn init_with_version(h: &TestHarness, version: SdkVersion) -> rtbridge_core::Result<TestContext> {
    let settings = ContextSettings::builder(h.device.clone(), h.foreign.clone())
        .version(version)
        .build();
    let (engine, _probe) = RecordingEngine::new();
    Library::get().init(settings, engine)
}

fn submit(h: &TestHarness, ctx: &TestContext, value: u64) -> TaskIndex {
    let output = h.texture();
    let wait = h.fence();
    let signal = h.fence();
    let mut container = ctx.create_task_container();
    container.schedule_trace(shadow_trace(&output));
    ctx.invoke_gpu_task(container, Some(&wait), 0, Some(&signal), value)
        .unwrap()
}

#[test]
fn version_gate() {
    let h = TestHarness::new(ProgressMode::Immediate);
    let current = Library::VERSION;

    let major = SdkVersion::new(current.major + 1, 0, 0);
    assert!(matches!(
        init_with_version(&h, major),
        Err(Error::FailedToInitExecuteContext(_))
    ));

    let newer_minor = SdkVersion::new(current.major, current.minor + 1, 0);
    assert!(matches!(
        init_with_version(&h, newer_minor),
        Err(Error::FailedToInitExecuteContext(_))
    ));

    let older_minor = SdkVersion::new(current.major, current.minor - 1, 7);
    assert!(init_with_version(&h, older_minor).is_ok());

    let other_patch = SdkVersion::new(current.major, current.minor, current.patch + 1);
    assert!(init_with_version(&h, other_patch).is_ok());
}

#[test]
fn out_of_range_working_sets_rejected() {
    let h = TestHarness::new(ProgressMode::Immediate);
    assert!(matches!(h.init_context(0), Err(Error::InvalidParam(_))));
    assert!(matches!(h.init_context(10), Err(Error::InvalidParam(_))));

    let (ctx, _probe) = h.init_context(9).unwrap();
    assert_eq!(ctx.stats().working_sets, 9);
}

#[test]
fn contexts_get_distinct_ids() {
    let h = TestHarness::new(ProgressMode::Immediate);
    let (a, _) = h.init_context(2).unwrap();
    let (b, _) = h.init_context(2).unwrap();
    assert_ne!(a.id(), b.id());
    assert_eq!(a.task_index(), TaskIndex::FIRST);
    assert_eq!(b.task_index(), TaskIndex::FIRST);
}

#[test]
fn config_loaded_from_json() {
    let h = TestHarness::new(ProgressMode::Immediate);
    let config: InteropConfig =
        serde_json::from_str(r#"{ "supported_working_sets": 4 }"#).unwrap();
    let settings = ContextSettings::builder(h.device.clone(), h.foreign.clone())
        .config(config)
        .build();
    let (engine, _probe) = RecordingEngine::new();

    let ctx = Library::get().init(settings, engine).unwrap();
    assert_eq!(ctx.config().supported_working_sets, 4);
    assert_eq!(ctx.stats().working_sets, 4);
}

#[test]
fn destruct_waits_and_closes_every_handle() {
    let h = TestHarness::new(ProgressMode::Manual);
    let (ctx, probe) = h.init_context(3).unwrap();

    submit(&h, &ctx, 1);
    submit(&h, &ctx, 2);
    assert!(probe.completed().is_empty());
    assert!(h.registry.open_count() > 0);

    Library::get().destruct(ctx).unwrap();

    assert_eq!(probe.completed(), vec![TaskIndex(1), TaskIndex(2)]);
    assert_eq!(h.registry.open_count(), 0);
    assert_eq!(h.foreign.closes(), h.foreign.exports());
    assert_eq!(h.device.stats().native_alive(), 0);
}

#[test]
fn legacy_handles_are_never_closed() {
    let h = TestHarness::with_handle_kind(ProgressMode::Immediate, SharedHandleKind::Legacy);
    let (ctx, _probe) = h.init_context(2).unwrap();

    submit(&h, &ctx, 1);
    submit(&h, &ctx, 2);
    Library::get().destruct(ctx).unwrap();

    assert_eq!(h.foreign.exports(), 6);
    assert_eq!(h.foreign.closes(), 0);
    assert_eq!(h.registry.open_count(), 6);
    assert_eq!(h.device.stats().native_alive(), 0);
}

#[test]
fn release_immediately_refused_while_in_flight() {
    let h = TestHarness::new(ProgressMode::Manual);
    let (ctx, probe) = h.init_context(2).unwrap();

    submit(&h, &ctx, 1);
    assert!(matches!(
        ctx.release_device_resources_immediately(),
        Err(Error::InvalidParam(_))
    ));
    assert_eq!(probe.release_calls(), 0);
    assert!(!ctx.is_poisoned());

    h.device.pump();
    ctx.release_device_resources_immediately().unwrap();

    let stats = ctx.stats();
    assert_eq!(stats.in_flight, 0);
    assert_eq!(stats.texture_entries + stats.fence_entries, 0);
    assert_eq!(probe.release_calls(), 1);
    assert_eq!(h.registry.open_count(), 0);
}

#[test]
fn release_immediately_drops_abandoned_references() {
    let h = TestHarness::new(ProgressMode::Immediate);
    let (ctx, probe) = h.init_context(2).unwrap();
    let output = h.texture();
    let wait = h.fence();
    let signal = h.fence();

    probe.fail_next_build();
    let mut container = ctx.create_task_container();
    container.schedule_trace(shadow_trace(&output));
    assert!(ctx
        .invoke_gpu_task(container, Some(&wait), 0, Some(&signal), 1)
        .is_err());
    assert_eq!(ctx.stats().abandoned_submissions, 1);
    assert_eq!(ctx.stats().texture_entries, 1);

    ctx.release_device_resources_immediately().unwrap();

    let stats = ctx.stats();
    assert_eq!(stats.abandoned_submissions, 0);
    assert_eq!(stats.texture_entries, 0);
    assert_eq!(output.ref_count(), 1);
}

#[test]
fn flush_drops_abandoned_references() {
    let h = TestHarness::new(ProgressMode::Immediate);
    let (ctx, probe) = h.init_context(2).unwrap();
    let output = h.texture();
    let wait = h.fence();
    let signal = h.fence();

    probe.fail_next_build();
    let mut container = ctx.create_task_container();
    container.schedule_trace(shadow_trace(&output));
    assert!(ctx
        .invoke_gpu_task(container, Some(&wait), 0, Some(&signal), 1)
        .is_err());
    assert_eq!(ctx.stats().texture_entries, 1);
    assert_eq!(ctx.stats().completed_task_index, None);

    ctx.flush().unwrap();

    let stats = ctx.stats();
    assert_eq!(stats.abandoned_submissions, 0);
    assert_eq!(stats.texture_entries, 0);
    assert_eq!(stats.fence_entries, 0);
    assert_eq!(output.ref_count(), 1);
    assert_eq!(h.foreign.closes(), h.foreign.exports());
    assert!(!ctx.is_poisoned());
}

#[test]
fn deferred_objects_outlive_pending_work() {
    let h = TestHarness::new(ProgressMode::Manual);
    let (ctx, _probe) = h.init_context(2).unwrap();
    let scratch = Arc::new(vec![0_u8; 256]);

    submit(&h, &ctx, 1);
    ctx.defer_release(scratch.clone());
    assert_eq!(ctx.stats().deferred_pending, 1);
    assert_eq!(Arc::strong_count(&scratch), 2);

    h.device.pump();
    ctx.flush().unwrap();

    assert_eq!(ctx.stats().deferred_pending, 0);
    assert_eq!(Arc::strong_count(&scratch), 1);
}

#[test]
fn dropping_a_context_tears_it_down() {
    let h = TestHarness::new(ProgressMode::Immediate);
    let (ctx, _probe) = h.init_context(2).unwrap();
    submit(&h, &ctx, 1);
    let scratch = Arc::new(());
    ctx.defer_release(scratch.clone());

    drop(ctx);

    assert_eq!(Arc::strong_count(&scratch), 1);
    assert_eq!(h.registry.open_count(), 0);
}
