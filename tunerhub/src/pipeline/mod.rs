//! External process pipeline for one capture session.
//!
//! This module provides:
//! - [`ProcessHandle`]: lifecycle of one spawned external process
//! - [`FilterChain`]: ordered filter stages fed by the capture output
//! - [`Pipeline`]: a capture process plus its filter chain, owned together

pub mod filter;
pub mod process;

use std::io;
use std::time::Duration;

use log::{debug, info};
use tokio::io::AsyncRead;

use tunerhub_core::{render, FilterSpec, TemplateContext};

use crate::error::{PipelineFailure, TunerError};

pub use filter::FilterChain;
pub use process::ProcessHandle;

/// Boxed byte source handed between pipeline stages.
pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;

/// How long to wait for a process that just closed its output to report an
/// exit status.
const EXIT_PROBE: Duration = Duration::from_millis(200);

/// A capture process and the filter chain on top of it.
///
/// Teardown order is always filters last-to-first, then the capture.
pub struct Pipeline {
    label: String,
    capture: ProcessHandle,
    filters: FilterChain,
    output: Option<BoxReader>,
    stop_timeout: Duration,
}

impl Pipeline {
    /// Render and spawn the capture command, then build the filter chain.
    ///
    /// On any failure the processes started so far are stopped before the
    /// error is returned.
    pub async fn start(
        label: &str,
        command_template: &str,
        filters: &[FilterSpec],
        ctx: &TemplateContext<'_>,
        stop_timeout: Duration,
    ) -> Result<Self, TunerError> {
        let command = render(command_template, ctx)?;
        let mut capture = ProcessHandle::spawn(format!("{} capture", label), &command, false)?;

        let Some(stdout) = capture.take_stdout() else {
            capture.terminate(stop_timeout).await;
            return Err(TunerError::spawn(
                command,
                io::Error::new(io::ErrorKind::BrokenPipe, "capture stdout unavailable"),
            ));
        };

        let (filters, output) =
            match FilterChain::build(label, filters, ctx, Box::new(stdout), stop_timeout).await {
                Ok(built) => built,
                Err(e) => {
                    capture.terminate(stop_timeout).await;
                    return Err(e);
                }
            };

        info!("[{}] Pipeline started with {} filter(s)", label, filters.len());

        Ok(Self {
            label: label.to_string(),
            capture,
            filters,
            output: Some(output),
            stop_timeout,
        })
    }

    /// Downstream end of the pipeline. Can be taken once.
    pub fn take_output(&mut self) -> Option<BoxReader> {
        self.output.take()
    }

    pub fn capture_pid(&self) -> Option<u32> {
        self.capture.pid()
    }

    pub fn filter_pids(&self) -> Vec<Option<u32>> {
        self.filters.pids()
    }

    /// Explain why the output ended, if it ended because something failed.
    pub(crate) async fn diagnose(&mut self) -> Option<PipelineFailure> {
        if let Some(failure) = self.filters.diagnose(EXIT_PROBE).await {
            return Some(failure);
        }
        match self.capture.status_within(EXIT_PROBE).await {
            Some(status) if !status.success() => Some(PipelineFailure::Capture {
                command: self.capture.command().to_string(),
                status: status.to_string(),
            }),
            _ => None,
        }
    }

    /// Stop the filters (last first) and then the capture process.
    pub async fn teardown(&mut self) {
        self.output = None;
        self.filters.teardown(self.stop_timeout).await;
        self.capture.terminate(self.stop_timeout).await;
        debug!("[{}] Pipeline torn down", self.label);
    }
}
