//! # tabula-coord
//!
//! The coordination layer. An orchestrator owns a [`WorkerPool`] of encoder threads,
//! hands each of them a view of the shared [`Registry`](tabula_core::Registry), and
//! either drives presentation cycles through a [`FrameCoordinator`] or measures
//! parallel encode throughput with a [`BenchHarness`].

pub mod barrier;
pub mod bench;
pub mod frame;
pub mod probe;
pub mod protocol;
pub mod stats;
pub mod worker;

pub use barrier::FrameState;
pub use bench::{split_dispatches, BenchHarness, BenchReport};
pub use frame::{CycleOutcome, FrameCoordinator, FrameStats, SkipReason};
pub use probe::{run_probe, run_probe_in, ProbeMode, ProbeOptions, ProbeReport};
pub use protocol::{Completion, Delivery, InitMessage, Signal, WorkerMessage};
pub use stats::{BenchRow, DurationSeries, TrialStatistics};
pub use worker::{PhaseCell, WorkerPhase, WorkerPool, WorkerState};
