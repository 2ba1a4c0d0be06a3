//! tunerhub: tuner resource manager and stream pipeline.
//!
//! A fixed set of tuners, each backed by an external capture command, is
//! shared between concurrent stream requests. The [`tuner::TunerPool`]
//! decides which tuner serves a request, spawns the capture command and its
//! filter chain through [`pipeline`], and fans the output out to every
//! subscriber through [`stream`].

pub mod config;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod stream;
pub mod tuner;

pub use config::Config;
pub use error::{ConfigError, StreamError, TunerError};
pub use stream::{OverflowPolicy, Subscription};
pub use tuner::{TunerLease, TunerPool, TunerPoolConfig, TunerUser};
