//! One capture session: a running pipeline, its reader task and the
//! multiplexer it feeds.

use std::io;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::BytesMut;
use futures::StreamExt;
use log::{debug, error, info, trace, warn};
use tokio::sync::watch;
use tokio_util::codec::{BytesCodec, FramedRead};
use tokio_util::sync::CancellationToken;

use tunerhub_core::{Channel, FilterSpec, TemplateContext, TunerSpec};

use crate::error::TunerError;
use crate::pipeline::{BoxReader, Pipeline};
use crate::stream::{Multiplexer, StreamEnd};
use crate::tuner::lease::{CaptureId, TunerUser};
use crate::tuner::pool::{PoolInner, TunerPoolConfig};

/// Start-up progress, observed by callers joining a capture that is still
/// being spawned.
#[derive(Debug, Clone)]
enum Readiness {
    Starting,
    Ready,
    Failed(TunerError),
}

/// Why the reader stopped.
enum ReadEnd {
    Eof,
    Error(io::Error),
    Stalled(Duration),
}

pub(crate) struct Capture {
    id: CaptureId,
    tuner_index: usize,
    channel: Channel,
    label: String,
    mux: Arc<Multiplexer>,
    ready: watch::Sender<Readiness>,
    /// Held for the whole start-up, so a concurrent shutdown waits for the
    /// processes to exist before tearing them down.
    pipeline: tokio::sync::Mutex<Option<Pipeline>>,
    pids: Mutex<Vec<u32>>,
    cancel: CancellationToken,
    /// Cancelled once a shutdown has torn the pipeline down.
    stopped: CancellationToken,
}

impl Capture {
    pub(crate) fn new(
        id: CaptureId,
        tuner_index: usize,
        tuner_name: &str,
        channel: Channel,
        config: &TunerPoolConfig,
    ) -> Arc<Self> {
        let label = format!("{}{}", tuner_name, id);
        let (ready, _) = watch::channel(Readiness::Starting);
        Arc::new(Self {
            id,
            tuner_index,
            channel,
            mux: Arc::new(Multiplexer::new(
                label.clone(),
                config.subscriber_buffer,
                config.overflow,
            )),
            label,
            ready,
            pipeline: tokio::sync::Mutex::new(None),
            pids: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            stopped: CancellationToken::new(),
        })
    }

    pub(crate) fn id(&self) -> CaptureId {
        self.id
    }

    pub(crate) fn channel(&self) -> &Channel {
        &self.channel
    }

    pub(crate) fn mux(&self) -> &Arc<Multiplexer> {
        &self.mux
    }

    pub(crate) fn is_starting(&self) -> bool {
        matches!(*self.ready.borrow(), Readiness::Starting)
    }

    /// Shut down, or on its way there.
    pub(crate) fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Capture pid first, then the filter stages in order.
    pub(crate) fn pids(&self) -> Vec<u32> {
        self.pids.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Spawn the pipeline and the reader task.
    ///
    /// Whatever the outcome, callers blocked in [`Capture::wait_ready`] are
    /// woken with it.
    pub(crate) async fn start(
        self: &Arc<Self>,
        spec: &TunerSpec,
        filters: &[FilterSpec],
        user: &TunerUser,
        config: &TunerPoolConfig,
        pool: Weak<PoolInner>,
    ) -> Result<(), TunerError> {
        let result = self.start_pipeline(spec, filters, user, config, pool).await;
        match &result {
            Ok(()) => {
                info!("[Capture {}] Streaming {} for {}", self.label, self.channel, user);
                self.ready.send_replace(Readiness::Ready);
            }
            Err(e) => {
                warn!("[Capture {}] Start-up failed: {}", self.label, e);
                self.ready.send_replace(Readiness::Failed(e.clone()));
            }
        }
        result
    }

    async fn start_pipeline(
        self: &Arc<Self>,
        spec: &TunerSpec,
        filters: &[FilterSpec],
        user: &TunerUser,
        config: &TunerPoolConfig,
        pool: Weak<PoolInner>,
    ) -> Result<(), TunerError> {
        let mut guard = self.pipeline.lock().await;
        if self.is_closed() {
            return Err(TunerError::Aborted);
        }

        let ctx = TemplateContext::new(&self.channel)
            .with_tuner(&spec.name)
            .with_duration(user.duration);
        let mut pipeline =
            Pipeline::start(&self.label, &spec.command, filters, &ctx, config.stop_timeout).await?;

        if self.is_closed() {
            pipeline.teardown().await;
            return Err(TunerError::Aborted);
        }
        let Some(output) = pipeline.take_output() else {
            pipeline.teardown().await;
            return Err(TunerError::Aborted);
        };

        {
            let mut pids = self.pids.lock().unwrap_or_else(|e| e.into_inner());
            pids.extend(pipeline.capture_pid());
            pids.extend(pipeline.filter_pids().into_iter().flatten());
        }
        *guard = Some(pipeline);
        drop(guard);

        let capture = Arc::clone(self);
        let chunk_size = config.chunk_size;
        let stall = config.stall_timeout;
        tokio::spawn(async move {
            capture.read_loop(output, chunk_size, stall, pool).await;
        });
        Ok(())
    }

    /// Wait until the starter has finished. Every waiter sees the same
    /// start-up error.
    pub(crate) async fn wait_ready(&self) -> Result<(), TunerError> {
        let mut rx = self.ready.subscribe();
        let result = match rx.wait_for(|r| !matches!(r, Readiness::Starting)).await {
            Ok(state) => match &*state {
                Readiness::Failed(e) => Err(e.clone()),
                _ => Ok(()),
            },
            Err(_) => Err(TunerError::Aborted),
        };
        result
    }

    /// Pump the pipeline output into the multiplexer until it ends or the
    /// capture is cancelled.
    async fn read_loop(
        self: Arc<Self>,
        output: BoxReader,
        chunk_size: usize,
        stall: Option<Duration>,
        pool: Weak<PoolInner>,
    ) {
        debug!("[Capture {}] Reader started", self.label);
        let mut frames = FramedRead::with_capacity(output, BytesCodec::new(), chunk_size);
        let mut total = 0u64;

        let read_end = loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("[Capture {}] Reader cancelled after {} bytes", self.label, total);
                    return;
                }
                next = next_chunk(&mut frames, stall) => next,
            };
            match next {
                Ok(Some(Ok(chunk))) => {
                    total += chunk.len() as u64;
                    let receivers = self.mux.publish(chunk.freeze());
                    if receivers == 0 {
                        trace!("[Capture {}] No receivers for chunk", self.label);
                    }
                }
                Ok(Some(Err(e))) => break ReadEnd::Error(e),
                Ok(None) => break ReadEnd::Eof,
                Err(limit) => break ReadEnd::Stalled(limit),
            }
        };

        let end = self.explain(read_end).await;
        match &end {
            StreamEnd::Eos => info!("[Capture {}] Source exhausted after {} bytes", self.label, total),
            StreamEnd::Failed(reason) => error!("[Capture {}] Source failed: {}", self.label, reason),
        }

        match pool.upgrade() {
            Some(pool) => pool.source_ended(&self, end).await,
            None => self.shutdown(end).await,
        }
    }

    async fn explain(&self, read_end: ReadEnd) -> StreamEnd {
        let diagnosis = {
            let mut guard = self.pipeline.lock().await;
            match guard.as_mut() {
                Some(pipeline) => pipeline.diagnose().await,
                None => None,
            }
        };
        if let Some(failure) = diagnosis {
            return StreamEnd::Failed(TunerError::from(failure).to_string());
        }
        match read_end {
            ReadEnd::Eof => StreamEnd::Eos,
            ReadEnd::Error(e) => StreamEnd::Failed(format!("Read error: {}", e)),
            ReadEnd::Stalled(limit) => {
                StreamEnd::Failed(format!("No data for {} ms", limit.as_millis()))
            }
        }
    }

    /// Stop the reader, tear the pipeline down (filters last-first, then the
    /// capture process) and end the stream for every subscriber.
    ///
    /// Returns once the processes are gone, also when another caller got here
    /// first.
    pub(crate) async fn shutdown(&self, end: StreamEnd) {
        self.cancel.cancel();
        self.ready.send_if_modified(|state| {
            if matches!(state, Readiness::Starting) {
                *state = Readiness::Failed(TunerError::Aborted);
                true
            } else {
                false
            }
        });

        let mut guard = self.pipeline.lock().await;
        if let Some(mut pipeline) = guard.take() {
            debug!("[Capture {}] Tearing down", self.label);
            pipeline.teardown().await;
        }
        drop(guard);

        self.mux.finish(end);
        self.stopped.cancel();
    }

    /// Wait for a shutdown started elsewhere to finish.
    pub(crate) async fn stopped(&self) {
        self.stopped.cancelled().await
    }

    pub(crate) fn tuner_index(&self) -> usize {
        self.tuner_index
    }

    pub(crate) fn label(&self) -> &str {
        &self.label
    }
}

/// Next chunk, or `Err(limit)` when the source stayed silent for `limit`.
async fn next_chunk(
    frames: &mut FramedRead<BoxReader, BytesCodec>,
    stall: Option<Duration>,
) -> Result<Option<io::Result<BytesMut>>, Duration> {
    match stall {
        Some(limit) => tokio::time::timeout(limit, frames.next())
            .await
            .map_err(|_| limit),
        None => Ok(frames.next().await),
    }
}
