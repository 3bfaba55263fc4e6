//! `invoke_gpu_task` against the headless back end.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use glam::Mat4;
use rtbridge_core::{Error, TaskIndex};
use rtbridge_gpu::headless::{FailurePoint, ProgressMode, QueueEvent};
use rtbridge_interop::{
    CopyTextureTask, DenoiseTask, ForeignTask, GeometryBuildTask, GeometryDesc, TraceMode,
};
use rtbridge_test::harness::shadow_trace;
use rtbridge_test::TestHarness;

#[test]
fn submissions_get_consecutive_task_indices() {
    let h = TestHarness::new(ProgressMode::Immediate);
    let (ctx, probe) = h.init_context(2).unwrap();
    let output = h.texture();
    let wait = h.fence();
    let signal = h.fence();

    for value in 1..=3 {
        let mut container = ctx.create_task_container();
        container.schedule_trace(shadow_trace(&output));
        let index = ctx
            .invoke_gpu_task(container, Some(&wait), 0, Some(&signal), value)
            .unwrap();
        assert_eq!(index, TaskIndex(value));
        assert_eq!(signal.value(), value);
    }

    assert_eq!(ctx.task_index(), TaskIndex(4));
    assert_eq!(probe.built(), vec![TaskIndex(1), TaskIndex(2), TaskIndex(3)]);
    assert_eq!(probe.completed(), probe.built());
}

#[test]
fn one_batch_carries_wait_execute_then_both_signals() {
    let h = TestHarness::new(ProgressMode::Immediate);
    let (ctx, _probe) = h.init_context(2).unwrap();
    let output = h.texture();
    let wait = h.fence();
    let signal = h.fence();

    let mut container = ctx.create_task_container();
    container.schedule_trace(shadow_trace(&output));
    ctx.invoke_gpu_task(container, Some(&wait), 0, Some(&signal), 5)
        .unwrap();

    let queue = h.queue().unwrap();
    let batches = queue.batches();
    assert_eq!(batches.len(), 1);
    let events = &batches[0];
    assert_eq!(events.len(), 4);
    assert_eq!(&queue.events(), events);
    assert_eq!(
        events[0],
        QueueEvent::Wait {
            timeline: wait.timeline_id(),
            value: 0
        }
    );
    assert!(matches!(events[1], QueueEvent::Execute { commands: 2, .. }));
    assert!(matches!(events[2], QueueEvent::Signal { value: 1, timeline } if timeline != signal.timeline_id()));
    assert_eq!(
        events[3],
        QueueEvent::Signal {
            timeline: signal.timeline_id(),
            value: 5
        }
    );
}

#[test]
fn gpu_work_waits_for_foreign_fence() {
    let h = TestHarness::new(ProgressMode::Immediate);
    let (ctx, probe) = h.init_context(2).unwrap();
    let output = h.texture();
    let wait = h.fence();
    let signal = h.fence();

    let mut container = ctx.create_task_container();
    container.schedule_trace(shadow_trace(&output));
    ctx.invoke_gpu_task(container, Some(&wait), 1, Some(&signal), 1)
        .unwrap();

    assert_eq!(signal.value(), 0);
    assert_eq!(ctx.stats().completed_task_index, None);
    assert!(probe.completed().is_empty());

    wait.signal(1);
    ctx.flush().unwrap();

    assert_eq!(signal.value(), 1);
    assert_eq!(probe.completed(), vec![TaskIndex(1)]);
}

#[test]
fn submission_blocks_while_every_working_set_is_in_flight() {
    let h = TestHarness::new(ProgressMode::Manual);
    let (ctx, probe) = h.init_context(2).unwrap();
    let output = h.texture();
    let wait = h.fence();
    let signal = h.fence();

    let submit = |value: u64| {
        let mut container = ctx.create_task_container();
        container.schedule_trace(shadow_trace(&output));
        ctx.invoke_gpu_task(container, Some(&wait), 0, Some(&signal), value)
    };

    assert_eq!(submit(1).unwrap(), TaskIndex(1));
    assert_eq!(submit(2).unwrap(), TaskIndex(2));
    assert_eq!(ctx.stats().in_flight, 2);

    let pumped = Arc::new(AtomicBool::new(false));
    let gpu = {
        let device = h.device.clone();
        let pumped = pumped.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            pumped.store(true, Ordering::SeqCst);
            device.pump();
        })
    };

    assert_eq!(submit(3).unwrap(), TaskIndex(3));
    assert!(pumped.load(Ordering::SeqCst));
    gpu.join().unwrap();

    let stats = ctx.stats();
    assert_eq!(stats.peak_working_sets_in_use, 2);
    assert_eq!(stats.completed_task_index, Some(2));
    assert_eq!(probe.completed(), vec![TaskIndex(1), TaskIndex(2)]);

    // The shared output was converted once and is still pending on task 3.
    assert_eq!(stats.texture_entries, 1);
    assert_eq!(h.foreign.exports(), 3);

    h.device.pump();
    ctx.flush().unwrap();
    assert_eq!(ctx.stats().texture_entries, 0);
    assert_eq!(h.registry.open_count(), 0);
}

#[test]
fn missing_fence_is_rejected_and_container_dropped() {
    let h = TestHarness::new(ProgressMode::Immediate);
    let (ctx, probe) = h.init_context(2).unwrap();
    let output = h.texture();
    let signal = h.fence();

    let mut container = ctx.create_task_container();
    container.schedule_trace(shadow_trace(&output));
    assert_eq!(output.ref_count(), 2);

    let result = ctx.invoke_gpu_task(container, None, 0, Some(&signal), 1);
    assert!(matches!(result, Err(Error::InvalidParam(_))));
    assert_eq!(output.ref_count(), 1);
    assert_eq!(ctx.task_index(), TaskIndex::FIRST);
    assert!(probe.built().is_empty());
    assert!(!ctx.is_poisoned());
}

#[test]
fn unrecognized_task_fails_without_consuming_an_index() {
    let h = TestHarness::new(ProgressMode::Immediate);
    let (ctx, probe) = h.init_context(2).unwrap();
    let output = h.texture();
    let wait = h.fence();
    let signal = h.fence();

    let mut container = ctx.create_task_container();
    container
        .schedule_tasks([ForeignTask::Unrecognized { type_id: 77 }])
        .schedule_trace(shadow_trace(&output));

    let result = ctx.invoke_gpu_task(container, Some(&wait), 0, Some(&signal), 1);
    assert!(matches!(result, Err(Error::InvalidParam(_))));
    assert_eq!(output.ref_count(), 1);
    assert!(probe.built().is_empty());
    assert!(h.queue().unwrap().events().is_empty());

    let mut container = ctx.create_task_container();
    container.schedule_trace(shadow_trace(&output));
    let index = ctx
        .invoke_gpu_task(container, Some(&wait), 0, Some(&signal), 1)
        .unwrap();
    assert_eq!(index, TaskIndex::FIRST);
}

#[test]
fn failed_submission_references_are_dropped_next_time() {
    let h = TestHarness::new(ProgressMode::Immediate);
    let (ctx, _probe) = h.init_context(2).unwrap();
    let first = h.texture();
    let second = h.texture();
    let wait = h.fence();
    let signal = h.fence();

    let mut container = ctx.create_task_container();
    container
        .schedule_trace(shadow_trace(&first))
        .schedule_tasks([ForeignTask::Unrecognized { type_id: 1 }]);
    assert!(ctx
        .invoke_gpu_task(container, Some(&wait), 0, Some(&signal), 1)
        .is_err());

    let stats = ctx.stats();
    assert_eq!(stats.abandoned_submissions, 1);
    assert_eq!(stats.texture_entries, 1);

    let mut container = ctx.create_task_container();
    container.schedule_trace(shadow_trace(&second));
    ctx.invoke_gpu_task(container, Some(&wait), 0, Some(&signal), 1)
        .unwrap();

    let stats = ctx.stats();
    assert_eq!(stats.abandoned_submissions, 0);
    assert_eq!(stats.texture_entries, 0);
    assert_eq!(first.ref_count(), 1);
    assert_eq!(h.foreign.closes(), h.foreign.exports());
}

#[test]
fn engine_failure_leaves_context_usable() {
    let h = TestHarness::new(ProgressMode::Immediate);
    let (ctx, probe) = h.init_context(1).unwrap();
    let output = h.texture();
    let wait = h.fence();
    let signal = h.fence();

    probe.fail_next_build();
    let mut container = ctx.create_task_container();
    container.schedule_trace(shadow_trace(&output));
    let result = ctx.invoke_gpu_task(container, Some(&wait), 0, Some(&signal), 1);
    assert!(matches!(result, Err(Error::InternalError(_))));
    assert!(!ctx.is_poisoned());

    // The only working set was handed back.
    let mut container = ctx.create_task_container();
    container.schedule_trace(shadow_trace(&output));
    let index = ctx
        .invoke_gpu_task(container, Some(&wait), 0, Some(&signal), 1)
        .unwrap();
    assert_eq!(index, TaskIndex::FIRST);
    assert_eq!(probe.completed(), vec![TaskIndex::FIRST]);
}

#[test]
fn queue_failure_poisons_context() {
    let h = TestHarness::new(ProgressMode::Immediate);
    let (ctx, _probe) = h.init_context(2).unwrap();
    let output = h.texture();
    let wait = h.fence();
    let signal = h.fence();

    h.device.fail_next(FailurePoint::QueueSubmit);
    let mut container = ctx.create_task_container();
    container.schedule_trace(shadow_trace(&output));
    let result = ctx.invoke_gpu_task(container, Some(&wait), 0, Some(&signal), 1);
    assert!(matches!(result, Err(Error::InternalError(_))));
    assert!(ctx.is_poisoned());
    assert!(ctx.stats().poisoned);

    let mut container = ctx.create_task_container();
    container.schedule_trace(shadow_trace(&output));
    let result = ctx.invoke_gpu_task(container, Some(&wait), 0, Some(&signal), 1);
    assert!(matches!(result, Err(Error::InternalError(_))));
    assert!(matches!(
        ctx.release_device_resources_immediately(),
        Err(Error::InternalError(_))
    ));
}

#[test]
fn mixed_container_records_tasks_in_order() {
    let h = TestHarness::new(ProgressMode::Immediate);
    let (ctx, _probe) = h.init_context(2).unwrap();
    let geometry = ctx
        .register_geometry(GeometryDesc {
            label: "tree".to_string(),
            allow_update: false,
        })
        .unwrap();
    let vertices = h.foreign.create_buffer(36);
    let noisy = h.texture();
    let clean = h.texture();
    let resolved = h.texture();
    let wait = h.fence();
    let signal = h.fence();

    let mut container = ctx.create_task_container();
    container
        .schedule_geometry_build(GeometryBuildTask {
            geometry,
            vertex_buffer: Some(vertices),
            vertex_format: Default::default(),
            vertex_count: 3,
            vertex_stride: 12,
            vertex_offset: 0,
            index_buffer: None,
            index_format: Default::default(),
            index_count: 0,
            index_offset: 0,
            transform: Mat4::IDENTITY,
        })
        .schedule_trace(shadow_trace(&noisy))
        .schedule_denoise(DenoiseTask {
            mode: TraceMode::Shadow,
            input: Some(noisy.clone()),
            output: Some(clean.clone()),
            depth: None,
            normal: None,
            motion: None,
            view: Mat4::IDENTITY,
            projection: Mat4::IDENTITY,
            flags: Default::default(),
        })
        .schedule_copy(CopyTextureTask {
            source: Some(clean.clone()),
            destination: Some(resolved.clone()),
        });
    ctx.invoke_gpu_task(container, Some(&wait), 0, Some(&signal), 1)
        .unwrap();

    let commands = h.queue().unwrap().executed_commands();
    assert_eq!(commands.len(), 5);
    assert_eq!(commands[0], "task #1");
    assert_eq!(commands[1], "build_geometry tree vertices=3 indices=0");
    assert!(commands[2].starts_with("trace Shadow"));
    assert_eq!(commands[3], "denoise Shadow");
    assert_eq!(
        commands[4],
        format!("copy {} -> {}", clean.memory_id(), resolved.memory_id())
    );

    // One buffer and three textures, each exported once.
    assert_eq!(h.device.stats().buffers_opened, 1);
    assert_eq!(h.device.stats().textures_opened, 3);
}

#[test]
fn destroyed_geometry_cannot_be_built() {
    let h = TestHarness::new(ProgressMode::Immediate);
    let (ctx, _probe) = h.init_context(2).unwrap();
    let geometry = ctx.register_geometry(GeometryDesc::default()).unwrap();
    ctx.destroy_geometry(geometry).unwrap();
    assert!(matches!(
        ctx.destroy_geometry(geometry),
        Err(Error::InvalidParam(_))
    ));

    let wait = h.fence();
    let signal = h.fence();
    let mut container = ctx.create_task_container();
    container.schedule_geometry_build(GeometryBuildTask {
        geometry,
        vertex_buffer: Some(h.foreign.create_buffer(36)),
        vertex_format: Default::default(),
        vertex_count: 3,
        vertex_stride: 12,
        vertex_offset: 0,
        index_buffer: None,
        index_format: Default::default(),
        index_count: 0,
        index_offset: 0,
        transform: Mat4::IDENTITY,
    });
    let result = ctx.invoke_gpu_task(container, Some(&wait), 0, Some(&signal), 1);
    assert!(matches!(result, Err(Error::InvalidParam(_))));
    assert!(!ctx.is_poisoned());
}

#[test]
fn concurrent_submitters_share_one_index_sequence() {
    let h = TestHarness::new(ProgressMode::Immediate);
    let (ctx, probe) = h.init_context(3).unwrap();
    let output = h.texture();
    let wait = h.fence();

    let (ctx, output, wait, harness) = (&ctx, &output, &wait, &h);

    let mut indices: Vec<u64> = thread::scope(|scope| {
        let workers: Vec<_> = (0..4)
            .map(move |_| {
                scope.spawn(move || {
                    let signal = harness.fence();
                    (1..=5)
                        .map(|value| {
                            let mut container = ctx.create_task_container();
                            container.schedule_trace(shadow_trace(output));
                            ctx.invoke_gpu_task(container, Some(wait), 0, Some(&signal), value)
                                .unwrap()
                                .0
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        workers
            .into_iter()
            .flat_map(|w| w.join().unwrap())
            .collect()
    });

    indices.sort_unstable();
    assert_eq!(indices, (1..=20).collect::<Vec<_>>());
    ctx.flush().unwrap();
    assert_eq!(probe.completed().len(), 20);
}
