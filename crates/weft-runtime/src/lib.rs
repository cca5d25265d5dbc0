#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **weft-runtime** – Leaf runtime services for the Weft control plane.
//!
//! Small, independently testable services the orchestration and server
//! layers build on:
//!
//! - [`ConcurrencyGovernor`] – bounded semaphore around all LLM calls.
//! - [`ProgressMultiplexer`] – per-session progress event fan-out.
//! - [`PatternEventBroadcaster`] – pattern lifecycle broadcast.
//! - [`MemoryPatternLibrary`] – hot-reloadable in-memory pattern library.
//! - [`ExecutionStore`] – in-memory workflow execution records.

pub mod executions;
pub mod governor;
pub mod patterns;
pub mod progress;

pub use executions::{ExecutionStore, DEFAULT_EXECUTION_RETENTION};
pub use governor::{ConcurrencyGovernor, LlmPermit, DEFAULT_LLM_CONCURRENCY};
pub use patterns::{validate_pattern, MemoryPatternLibrary};
pub use progress::{
    PatternEventBroadcaster, ProgressMultiplexer, PATTERN_EVENT_BUFFER, PROGRESS_STREAM_BUFFER,
};
