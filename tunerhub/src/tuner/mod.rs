//! Tuner scheduling.
//!
//! This module provides:
//! - [`TunerPool`]: the allocator of tuners to stream requests
//! - [`TunerLease`]: a caller's grant to one tuner's stream
//! - `Capture`: one spawned pipeline, its reader task and multiplexer

mod capture;
pub mod lease;
pub mod pool;

pub use lease::{CaptureId, SessionId, TunerLease, TunerUser};
pub use pool::{PoolStats, TunerPool, TunerPoolConfig, TunerState, TunerStatus};
