//! One subscriber's view of a multiplexed stream.

use std::sync::Arc;

use bytes::Bytes;
use futures::Stream;
use log::{debug, info, warn};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast;

use crate::error::{StreamError, TunerError};
use crate::stream::{Multiplexer, OverflowPolicy};
use crate::tuner::{SessionId, TunerLease};

/// An attached reader of a tuner's stream.
///
/// Owns the lease it was attached with; [`Subscription::detach`] gives it
/// back to the pool, and so does dropping the subscription.
pub struct Subscription {
    id: SessionId,
    rx: Option<broadcast::Receiver<Bytes>>,
    mux: Arc<Multiplexer>,
    lease: Option<TunerLease>,
    policy: OverflowPolicy,
    /// Chunks skipped because this subscriber lagged.
    dropped: u64,
    done: bool,
}

impl Subscription {
    pub(crate) fn new(
        lease: TunerLease,
        rx: Option<broadcast::Receiver<Bytes>>,
        policy: OverflowPolicy,
    ) -> Self {
        Self {
            id: lease.id(),
            mux: Arc::clone(lease.source()),
            rx,
            lease: Some(lease),
            policy,
            dropped: 0,
            done: false,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn lease(&self) -> Option<&TunerLease> {
        self.lease.as_ref()
    }

    /// Chunks this subscriber has lost to overflow so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Next chunk.
    ///
    /// `None` after a clean end of stream. An upstream failure or an overrun
    /// is reported once as `Some(Err(..))`, followed by `None`.
    pub async fn recv(&mut self) -> Option<Result<Bytes, StreamError>> {
        if self.done {
            return None;
        }
        let Some(rx) = self.rx.as_mut() else {
            self.done = true;
            return self.mux.end_error().map(Err);
        };

        loop {
            match rx.recv().await {
                Ok(chunk) => return Some(Ok(chunk)),
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    self.dropped += count;
                    match self.policy {
                        OverflowPolicy::DropOldest => {
                            warn!("[{}] Lagged, skipped {} chunks", self.id, count);
                        }
                        OverflowPolicy::Disconnect => {
                            warn!("[{}] Lagged by {} chunks, disconnecting", self.id, count);
                            self.done = true;
                            self.rx = None;
                            return Some(Err(StreamError::Overrun {
                                dropped: self.dropped,
                            }));
                        }
                    }
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("[{}] Stream closed", self.id);
                    self.done = true;
                    self.rx = None;
                    return self.mux.end_error().map(Err);
                }
            }
        }
    }

    /// Adapt into a `futures::Stream`. The lease is released when the stream
    /// is dropped.
    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes, StreamError>> + Send {
        futures::stream::unfold(self, |mut sub| async move {
            sub.recv().await.map(|item| (item, sub))
        })
    }

    /// Copy the stream into `sink` until it ends or a write fails, then
    /// detach.
    ///
    /// Returns the number of bytes written. A failed write is reported as
    /// [`TunerError::StreamIo`]; an upstream failure as `Ok` with whatever was
    /// written, after logging it, since the sink already saw the stream end.
    pub async fn pipe_to<W>(mut self, sink: &mut W) -> Result<u64, TunerError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut written = 0u64;
        let result = loop {
            match self.recv().await {
                Some(Ok(chunk)) => {
                    if let Err(e) = sink.write_all(&chunk).await {
                        info!("[{}] Sink closed after {} bytes: {}", self.id, written, e);
                        break Err(TunerError::from(e));
                    }
                    written += chunk.len() as u64;
                }
                Some(Err(e)) => {
                    warn!("[{}] Stream ended with error: {}", self.id, e);
                    break Ok(written);
                }
                None => break Ok(written),
            }
        };
        if result.is_ok() {
            if let Err(e) = sink.flush().await {
                self.detach().await;
                return Err(TunerError::from(e));
            }
        }
        self.detach().await;
        result
    }

    /// Unregister and release the lease.
    pub async fn detach(mut self) {
        self.rx = None;
        if let Some(lease) = self.lease.take() {
            lease.release().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::StreamEnd;
    use crate::tuner::TunerLease;

    fn attach(mux: &Arc<Multiplexer>) -> Subscription {
        mux.attach(TunerLease::detached(Arc::clone(mux)))
    }

    #[tokio::test]
    async fn test_fan_out_to_all_subscribers() {
        let mux = Arc::new(Multiplexer::new("test", 8, OverflowPolicy::DropOldest));
        let mut s1 = attach(&mux);
        let mut s2 = attach(&mux);
        assert_eq!(mux.receiver_count(), 2);

        assert_eq!(mux.publish(Bytes::from_static(b"hello")), 2);

        assert_eq!(s1.recv().await, Some(Ok(Bytes::from_static(b"hello"))));
        assert_eq!(s2.recv().await, Some(Ok(Bytes::from_static(b"hello"))));
    }

    #[tokio::test]
    async fn test_detached_subscriber_stops_receiving() {
        let mux = Arc::new(Multiplexer::new("test", 8, OverflowPolicy::DropOldest));
        let s1 = attach(&mux);
        let mut s2 = attach(&mux);

        s1.detach().await;
        assert_eq!(mux.receiver_count(), 1);

        mux.publish(Bytes::from_static(b"x"));
        assert_eq!(s2.recv().await, Some(Ok(Bytes::from_static(b"x"))));
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_oldest() {
        let mux = Arc::new(Multiplexer::new("test", 2, OverflowPolicy::DropOldest));
        let mut slow = attach(&mux);
        let mut fast = attach(&mux);

        for i in 0..5u8 {
            mux.publish(Bytes::from(vec![i]));
            assert_eq!(fast.recv().await, Some(Ok(Bytes::from(vec![i]))));
        }

        // Only the newest two chunks survive for the slow one.
        assert_eq!(slow.recv().await, Some(Ok(Bytes::from(vec![3]))));
        assert_eq!(slow.recv().await, Some(Ok(Bytes::from(vec![4]))));
        assert_eq!(slow.dropped(), 3);
    }

    #[tokio::test]
    async fn test_overflow_disconnect() {
        let mux = Arc::new(Multiplexer::new("test", 2, OverflowPolicy::Disconnect));
        let mut slow = attach(&mux);

        for i in 0..5u8 {
            mux.publish(Bytes::from(vec![i]));
        }

        assert_eq!(slow.recv().await, Some(Err(StreamError::Overrun { dropped: 3 })));
        assert_eq!(slow.recv().await, None);
    }

    #[tokio::test]
    async fn test_end_of_stream_after_drain() {
        let mux = Arc::new(Multiplexer::new("test", 8, OverflowPolicy::DropOldest));
        let mut sub = attach(&mux);

        mux.publish(Bytes::from_static(b"last"));
        mux.finish(StreamEnd::Eos);

        assert_eq!(sub.recv().await, Some(Ok(Bytes::from_static(b"last"))));
        assert_eq!(sub.recv().await, None);
        assert_eq!(sub.recv().await, None);
    }

    #[tokio::test]
    async fn test_upstream_failure_is_reported_once() {
        let mux = Arc::new(Multiplexer::new("test", 8, OverflowPolicy::DropOldest));
        let mut sub = attach(&mux);

        mux.finish(StreamEnd::Failed("filter died".into()));

        assert_eq!(
            sub.recv().await,
            Some(Err(StreamError::Upstream("filter died".into())))
        );
        assert_eq!(sub.recv().await, None);
    }

    #[tokio::test]
    async fn test_attach_after_finish() {
        let mux = Arc::new(Multiplexer::new("test", 8, OverflowPolicy::DropOldest));
        mux.finish(StreamEnd::Eos);

        let mut sub = attach(&mux);
        assert_eq!(sub.recv().await, None);
    }

    #[tokio::test]
    async fn test_pipe_to_writes_everything() {
        let mux = Arc::new(Multiplexer::new("test", 8, OverflowPolicy::DropOldest));
        let sub = attach(&mux);

        mux.publish(Bytes::from_static(b"ab"));
        mux.publish(Bytes::from_static(b"cd"));
        mux.finish(StreamEnd::Eos);

        let mut sink = Vec::new();
        assert_eq!(sub.pipe_to(&mut sink).await.unwrap(), 4);
        assert_eq!(sink, b"abcd");
    }

    #[tokio::test]
    async fn test_pipe_to_broken_sink() {
        let mux = Arc::new(Multiplexer::new("test", 8, OverflowPolicy::DropOldest));
        let sub = attach(&mux);

        let (client, server) = tokio::io::duplex(16);
        drop(server);
        let mut client = client;

        mux.publish(Bytes::from_static(b"data"));
        let result = sub.pipe_to(&mut client).await;
        assert!(matches!(result, Err(TunerError::StreamIo(_))));
        assert_eq!(mux.receiver_count(), 0);
    }

    #[tokio::test]
    async fn test_into_stream() {
        use futures::StreamExt;

        let mux = Arc::new(Multiplexer::new("test", 8, OverflowPolicy::DropOldest));
        let sub = attach(&mux);
        mux.publish(Bytes::from_static(b"a"));
        mux.publish(Bytes::from_static(b"b"));
        mux.finish(StreamEnd::Eos);

        let items: Vec<_> = sub.into_stream().collect().await;
        assert_eq!(
            items,
            vec![Ok(Bytes::from_static(b"a")), Ok(Bytes::from_static(b"b"))]
        );
    }
}
