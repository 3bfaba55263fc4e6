//! Test harness for the rtbridge interop SDK.
//!
//! Provides a mock foreign device, a recording ray-tracing engine and a harness
//! that wires them to the headless back end.

pub mod engine;
pub mod foreign;
pub mod harness;

pub use engine::{EngineProbe, RecordingEngine};
pub use foreign::{MockBuffer, MockFence, MockForeignDevice, MockTexture};
pub use harness::{init_tracing, TestContext, TestHarness};
