//! Error types for tuner scheduling and streaming.

use std::io;
use std::process::ExitStatus;
use std::sync::Arc;

use thiserror::Error;

use tunerhub_core::{CatalogError, ChannelKey, TemplateError};

/// Per-request failures of the tuner subsystem.
///
/// None of these take the server down; they are reported to the caller of
/// `acquire` or to the subscribers of the failed capture.
#[derive(Error, Debug, Clone)]
pub enum TunerError {
    /// Unknown channel name.
    #[error("Channel not found: {0}")]
    NotFound(String),

    /// The channel catalog itself is unusable.
    #[error("Catalog error: {0}")]
    Catalog(CatalogError),

    /// Bad command substitution.
    #[error("Template error: {0}")]
    Template(#[from] TemplateError),

    /// The capture or a filter process could not be started.
    #[error("Failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: Arc<io::Error>,
    },

    /// A filter stage died or errored while streaming.
    #[error("Filter stage {stage} (`{command}`) failed: {reason}")]
    FilterFailure {
        stage: usize,
        command: String,
        reason: String,
    },

    /// The capture process exited with a failure status while streaming.
    #[error("Capture `{command}` exited: {status}")]
    CaptureExited { command: String, status: String },

    /// No eligible tuner is idle or already on the requested channel.
    #[error("No tuner available for {channel}")]
    Exhausted { channel: ChannelKey },

    /// Writing to a subscriber's sink failed.
    #[error("Stream I/O error: {0}")]
    StreamIo(Arc<io::Error>),

    /// The capture was torn down before it became ready.
    #[error("Capture aborted before start-up completed")]
    Aborted,
}

impl TunerError {
    pub(crate) fn spawn(command: impl Into<String>, source: io::Error) -> Self {
        TunerError::Spawn {
            command: command.into(),
            source: Arc::new(source),
        }
    }

    /// Whether the caller may sensibly try again, possibly elsewhere.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TunerError::Exhausted { .. } | TunerError::Spawn { .. } | TunerError::FilterFailure { .. }
        )
    }
}

impl From<CatalogError> for TunerError {
    fn from(err: CatalogError) -> Self {
        match err {
            CatalogError::NotFound(name) => TunerError::NotFound(name),
            other => TunerError::Catalog(other),
        }
    }
}

impl From<io::Error> for TunerError {
    fn from(err: io::Error) -> Self {
        TunerError::StreamIo(Arc::new(err))
    }
}

/// What a subscriber sees when its stream ends abnormally.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// The capture process or a filter stage died.
    #[error("Upstream failed: {0}")]
    Upstream(String),

    /// The subscriber fell too far behind and was disconnected.
    #[error("Subscriber overrun, {dropped} chunks dropped")]
    Overrun { dropped: u64 },
}

/// Why a pipeline stopped producing data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PipelineFailure {
    /// A filter process exited with a failure status or refused input.
    Filter {
        stage: usize,
        command: String,
        reason: String,
    },
    /// The capture process exited with a failure status.
    Capture { command: String, status: String },
}

impl PipelineFailure {
    pub(crate) fn filter_exit(stage: usize, command: &str, status: ExitStatus) -> Self {
        PipelineFailure::Filter {
            stage,
            command: command.to_string(),
            reason: format!("exited with {}", status),
        }
    }
}

impl From<PipelineFailure> for TunerError {
    fn from(failure: PipelineFailure) -> Self {
        match failure {
            PipelineFailure::Filter {
                stage,
                command,
                reason,
            } => TunerError::FilterFailure {
                stage,
                command,
                reason,
            },
            PipelineFailure::Capture { command, status } => {
                TunerError::CaptureExited { command, status }
            }
        }
    }
}

/// Configuration loading errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Invalid command template for {owner}: {source}")]
    Template {
        owner: String,
        #[source]
        source: TemplateError,
    },
}
