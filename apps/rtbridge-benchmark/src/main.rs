//! rtbridge frame-loop benchmark
//!
//! Drives an execute context over the headless back end the way a renderer
//! would: one geometry build, then a trace, denoise and copy every frame.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use glam::{Mat4, Vec3};
use rtbridge_core::ResourceKind;
use rtbridge_gpu::headless::ProgressMode;
use rtbridge_gpu::TextureFormat;
use rtbridge_interop::{
    CopyTextureTask, DenoiseFlags, DenoiseTask, GeometryBuildTask, GeometryDesc, Library,
    TraceFlags, TraceMode, TraceTask,
};
use rtbridge_test::{MockFence, MockForeignDevice, MockTexture, TestContext, TestHarness};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const WIDTH: u32 = 1920;
const HEIGHT: u32 = 1080;

struct Options {
    frames: u64,
    working_sets: u32,
    manual: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            frames: 1000,
            working_sets: 3,
            manual: false,
        }
    }
}

fn parse_args() -> anyhow::Result<Option<Options>> {
    let mut options = Options::default();
    let mut args = std::env::args().skip(1);

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => {
                print_help();
                return Ok(None);
            }
            "-n" | "--frames" => {
                let value = args.next().context("--frames needs a value")?;
                options.frames = value.parse().context("invalid frame count")?;
            }
            "-w" | "--working-sets" => {
                let value = args.next().context("--working-sets needs a value")?;
                options.working_sets = value.parse().context("invalid working set count")?;
            }
            "--manual" => options.manual = true,
            other => bail!("unknown argument '{other}'"),
        }
    }

    Ok(Some(options))
}

fn print_help() {
    eprintln!(
        "rtbridge frame-loop benchmark

USAGE:
    cargo run -p rtbridge-benchmark --release -- [OPTIONS]

OPTIONS:
    -n, --frames <N>        Frames to submit (default: 1000)
    -w, --working-sets <N>  Tasks allowed in flight, 1-9 (default: 3)
    --manual                Run the GPU timeline on its own thread instead of
                            completing work at submission
    -h, --help              Show this help"
    );
}

/// Frame resources owned by the foreign side.
struct FrameTargets {
    depth: MockTexture,
    normal: MockTexture,
    noisy: MockTexture,
    denoised: MockTexture,
    back_buffer: MockTexture,
}

impl FrameTargets {
    fn new(h: &TestHarness) -> Self {
        let target = |format| h.foreign.create_texture(WIDTH, HEIGHT, format);
        Self {
            depth: target(TextureFormat::R32Float),
            normal: target(TextureFormat::Rgba16Float),
            noisy: target(TextureFormat::Rgba16Float),
            denoised: target(TextureFormat::Rgba16Float),
            back_buffer: target(TextureFormat::Rgba8Unorm),
        }
    }
}

fn camera(frame: u64) -> (Mat4, Mat4) {
    let angle = frame as f32 * 0.01;
    let eye = Vec3::new(angle.cos() * 10.0, 4.0, angle.sin() * 10.0);
    let view = Mat4::look_at_rh(eye, Vec3::ZERO, Vec3::Y);
    let projection = Mat4::perspective_rh(60f32.to_radians(), WIDTH as f32 / HEIGHT as f32, 0.1, 500.0);
    (view, projection)
}

#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
fn submit_frame(
    ctx: &TestContext,
    targets: &FrameTargets,
    frame: u64,
    setup: Option<GeometryBuildTask<MockForeignDevice>>,
    wait: &MockFence,
    signal: &MockFence,
) -> anyhow::Result<()> {
    let (view, projection) = camera(frame);
    let mut container = ctx.create_task_container();

    if let Some(build) = setup {
        container.schedule_geometry_build(build);
    }
    container
        .schedule_trace(TraceTask {
            depth: Some(targets.depth.clone()),
            normal: Some(targets.normal.clone()),
            output: Some(targets.noisy.clone()),
            view,
            projection,
            light_direction: Vec3::new(0.3, 1.0, 0.2),
            flags: TraceFlags::REVERSED_DEPTH,
            ..TraceTask::new(TraceMode::Shadow)
        })
        .schedule_denoise(DenoiseTask {
            mode: TraceMode::Shadow,
            input: Some(targets.noisy.clone()),
            output: Some(targets.denoised.clone()),
            depth: Some(targets.depth.clone()),
            normal: Some(targets.normal.clone()),
            motion: None,
            view,
            projection,
            flags: if frame == 0 {
                DenoiseFlags::RESET_HISTORY | DenoiseFlags::REVERSED_DEPTH
            } else {
                DenoiseFlags::REVERSED_DEPTH
            },
        })
        .schedule_copy(CopyTextureTask {
            source: Some(targets.denoised.clone()),
            destination: Some(targets.back_buffer.clone()),
        });

    ctx.invoke_gpu_task(container, Some(wait), frame, Some(signal), frame + 1)
        .map_err(|e| {
            error!("Frame {} rejected with status {:?}", frame, e.status());
            e
        })
        .with_context(|| format!("frame {frame} submission failed"))?;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let Some(options) = parse_args()? else {
        return Ok(());
    };

    let mode = if options.manual {
        ProgressMode::Manual
    } else {
        ProgressMode::Immediate
    };
    let h = TestHarness::new(mode);
    let (ctx, probe) = h
        .init_context(options.working_sets)
        .context("failed to create execute context")?;

    info!(
        "rtbridge {} benchmark: {} frames, {} working sets, {:?} progress",
        Library::VERSION,
        options.frames,
        options.working_sets,
        mode
    );

    // Stands in for the GPU retiring work while the CPU records ahead.
    let stop = Arc::new(AtomicBool::new(false));
    let gpu = options.manual.then(|| {
        let device = h.device.clone();
        let stop = stop.clone();
        thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                device.pump_limit(1);
                thread::sleep(Duration::from_micros(200));
            }
        })
    });

    let geometry = ctx.register_geometry(GeometryDesc {
        label: "scene".to_string(),
        allow_update: true,
    })?;
    let vertices = h.foreign.create_buffer(36 * 1024);
    let indices = h.foreign.create_buffer(4 * 3 * 1024);
    let targets = FrameTargets::new(&h);

    // The host timeline: frame N waits for N and signals N + 1.
    let timeline = h.foreign.create_fence(0);

    let start = Instant::now();
    for frame in 0..options.frames {
        let setup = (frame == 0).then(|| GeometryBuildTask {
            geometry,
            vertex_buffer: Some(vertices.clone()),
            vertex_format: Default::default(),
            vertex_count: 3 * 1024,
            vertex_stride: 12,
            vertex_offset: 0,
            index_buffer: Some(indices.clone()),
            index_format: Default::default(),
            index_count: 3 * 1024,
            index_offset: 0,
            transform: Mat4::IDENTITY,
        });
        submit_frame(&ctx, &targets, frame, setup, &timeline, &timeline)?;
    }
    let recorded = start.elapsed();

    stop.store(true, Ordering::Relaxed);
    if let Some(gpu) = gpu {
        if gpu.join().is_err() {
            bail!("GPU timeline thread panicked");
        }
    }
    h.device.pump();
    ctx.flush()?;
    let total = start.elapsed();

    let stats = ctx.stats();
    info!(
        "Submitted {} frames in {:.2?} ({:.1} us/frame), drained after {:.2?}",
        options.frames,
        recorded,
        recorded.as_secs_f64() * 1e6 / options.frames.max(1) as f64,
        total
    );
    info!(
        "Completed {} tasks, peak {} of {} working sets in use, {} shared handles exported",
        probe.completed().len(),
        stats.peak_working_sets_in_use,
        stats.working_sets,
        h.foreign.exports()
    );
    for kind in ResourceKind::ALL {
        let cache = ctx.caches().stats(kind);
        info!(
            "{} cache: {} hits, {} misses, {} evictions",
            kind.name(),
            cache.hits,
            cache.misses,
            cache.evictions
        );
    }

    Library::get().destruct(ctx)?;
    info!("{} handles still open after teardown", h.registry.open_count());
    Ok(())
}
