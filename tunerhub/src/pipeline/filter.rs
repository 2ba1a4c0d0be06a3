//! Filter chain: ordered byte-stream stages between capture and consumers.

use std::io;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::task::JoinHandle;

use tunerhub_core::{render, FilterSpec, TemplateContext};

use crate::error::{PipelineFailure, TunerError};
use crate::pipeline::process::ProcessHandle;
use crate::pipeline::BoxReader;

/// One running filter process fed by the previous stage's output.
struct FilterStage {
    /// 1-based position in the configured chain.
    stage: usize,
    process: ProcessHandle,
    /// Copies the upstream bytes into this stage's stdin.
    pump: Option<JoinHandle<io::Result<u64>>>,
}

/// A built filter chain. Passthrough specs produce no stage at all.
pub struct FilterChain {
    stages: Vec<FilterStage>,
}

impl FilterChain {
    /// An empty chain; output equals input.
    pub fn empty() -> Self {
        Self { stages: Vec::new() }
    }

    /// Compose `specs` on top of `upstream` and return the chain together
    /// with its downstream end.
    ///
    /// If any stage fails to render or spawn, the stages started so far are
    /// torn down before the error is returned.
    pub async fn build(
        label: &str,
        specs: &[FilterSpec],
        ctx: &TemplateContext<'_>,
        mut upstream: BoxReader,
        stop_timeout: Duration,
    ) -> Result<(Self, BoxReader), TunerError> {
        let mut chain = Self::empty();

        for (index, spec) in specs.iter().enumerate() {
            let stage = index + 1;
            let Some(template) = spec.command() else {
                debug!("[{}] Filter {} is passthrough", label, stage);
                continue;
            };

            let command = match render(template, ctx) {
                Ok(command) => command,
                Err(e) => {
                    chain.teardown(stop_timeout).await;
                    return Err(e.into());
                }
            };

            let mut process = match ProcessHandle::spawn(format!("{} filter{}", label, stage), &command, true) {
                Ok(process) => process,
                Err(e) => {
                    chain.teardown(stop_timeout).await;
                    return Err(e);
                }
            };

            let (Some(mut stdin), Some(stdout)) = (process.take_stdin(), process.take_stdout()) else {
                process.terminate(stop_timeout).await;
                chain.teardown(stop_timeout).await;
                return Err(TunerError::spawn(
                    command,
                    io::Error::new(io::ErrorKind::BrokenPipe, "filter pipes unavailable"),
                ));
            };

            let pump_label = process.label().to_string();
            let pump = tokio::spawn(async move {
                let result = tokio::io::copy(&mut upstream, &mut stdin).await;
                match &result {
                    Ok(n) => debug!("[{}] Input finished after {} bytes", pump_label, n),
                    Err(e) => debug!("[{}] Input pump stopped: {}", pump_label, e),
                }
                result
            });

            info!("[{}] Filter {} started: `{}`", label, stage, command);
            chain.stages.push(FilterStage {
                stage,
                process,
                pump: Some(pump),
            });
            upstream = Box::new(stdout);
        }

        Ok((chain, upstream))
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Process ids of the running stages, first stage first.
    pub fn pids(&self) -> Vec<Option<u32>> {
        self.stages.iter().map(|s| s.process.pid()).collect()
    }

    /// Find the stage that broke the chain, if any.
    ///
    /// Scans from the last stage backwards: a failing stage takes down the
    /// stages upstream of it (broken pipe), so the most downstream failure
    /// is the cause.
    pub(crate) async fn diagnose(&mut self, wait: Duration) -> Option<PipelineFailure> {
        for stage in self.stages.iter_mut().rev() {
            if let Some(status) = stage.process.status_within(wait).await {
                if !status.success() {
                    return Some(PipelineFailure::filter_exit(
                        stage.stage,
                        stage.process.command(),
                        status,
                    ));
                }
            }
            let pump_done = stage.pump.as_ref().map_or(false, |p| p.is_finished());
            if let (true, Some(pump)) = (pump_done, stage.pump.take()) {
                if let Ok(Err(e)) = pump.await {
                    if e.kind() == io::ErrorKind::BrokenPipe {
                        return Some(PipelineFailure::Filter {
                            stage: stage.stage,
                            command: stage.process.command().to_string(),
                            reason: "stopped reading its input".to_string(),
                        });
                    }
                }
            }
        }
        None
    }

    /// Stop every stage, last stage first.
    pub async fn teardown(&mut self, stop_timeout: Duration) {
        while let Some(mut stage) = self.stages.pop() {
            stage.process.terminate(stop_timeout).await;
            if let Some(pump) = stage.pump.take() {
                pump.abort();
            }
            debug!("[{}] Filter {} stopped", stage.process.label(), stage.stage);
        }
    }
}

impl Drop for FilterChain {
    fn drop(&mut self) {
        if !self.stages.is_empty() {
            warn!("FilterChain dropped with {} live stages", self.stages.len());
            for stage in &self.stages {
                if let Some(pump) = &stage.pump {
                    pump.abort();
                }
            }
        }
    }
}
