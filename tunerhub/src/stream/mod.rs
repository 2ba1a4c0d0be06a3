//! Fan-out of one capture's byte stream to many subscribers.
//!
//! Each capture owns one [`Multiplexer`]. Subscribers read through a
//! `tokio::sync::broadcast` ring, so every subscriber has its own cursor and
//! its own bounded backlog (`subscriber_buffer` chunks). The capture reader
//! never waits for a subscriber: a subscriber that falls further behind than
//! its backlog loses the oldest chunks, or is disconnected, depending on the
//! [`OverflowPolicy`].

pub mod subscription;

use std::sync::{Mutex, OnceLock};

use bytes::Bytes;
use log::{debug, trace};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::StreamError;
use crate::tuner::TunerLease;

pub use subscription::Subscription;

/// What happens to a subscriber whose backlog overflows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Skip the oldest chunks and keep streaming.
    #[default]
    DropOldest,
    /// End the subscription with [`StreamError::Overrun`].
    Disconnect,
}

/// How a multiplexed stream ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEnd {
    /// Clean end: the source was exhausted or the capture was released.
    Eos,
    /// The capture process or a filter died.
    Failed(String),
}

/// Broadcast hub for one capture.
pub struct Multiplexer {
    label: String,
    tx: Mutex<Option<broadcast::Sender<Bytes>>>,
    end: OnceLock<StreamEnd>,
    policy: OverflowPolicy,
}

impl Multiplexer {
    pub fn new(label: impl Into<String>, capacity: usize, policy: OverflowPolicy) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            label: label.into(),
            tx: Mutex::new(Some(tx)),
            end: OnceLock::new(),
            policy,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Register a new reader for `lease`.
    ///
    /// Detaching (or dropping) the returned subscription releases the lease.
    pub fn attach(&self, lease: TunerLease) -> Subscription {
        let rx = self.receiver();
        debug!(
            "[{}] {} attached ({} receivers)",
            self.label,
            lease.id(),
            self.receiver_count()
        );
        Subscription::new(lease, rx, self.policy)
    }

    /// Hand one chunk to every subscriber. Returns how many received it.
    pub fn publish(&self, chunk: Bytes) -> usize {
        let guard = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(tx) => {
                let len = chunk.len();
                match tx.send(chunk) {
                    Ok(count) => {
                        trace!("[{}] Broadcast {} bytes to {} receivers", self.label, len, count);
                        count
                    }
                    Err(_) => 0,
                }
            }
            None => 0,
        }
    }

    /// Close the stream. Subscribers drain what they already have, then see
    /// `end`. Only the first call has an effect.
    pub fn finish(&self, end: StreamEnd) {
        if self.end.set(end.clone()).is_err() {
            return;
        }
        let tx = self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        drop(tx);
        debug!("[{}] Stream finished: {:?}", self.label, end);
    }

    pub fn is_finished(&self) -> bool {
        self.end.get().is_some()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map_or(0, |tx| tx.receiver_count())
    }

    /// The error subscribers should see once they drain the ring.
    pub(crate) fn end_error(&self) -> Option<StreamError> {
        match self.end.get() {
            Some(StreamEnd::Failed(reason)) => Some(StreamError::Upstream(reason.clone())),
            _ => None,
        }
    }

    fn receiver(&self) -> Option<broadcast::Receiver<Bytes>> {
        self.tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|tx| tx.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_without_receivers() {
        let mux = Multiplexer::new("test", 4, OverflowPolicy::DropOldest);
        assert_eq!(mux.publish(Bytes::from_static(b"x")), 0);
        assert_eq!(mux.receiver_count(), 0);
    }

    #[test]
    fn test_finish_is_sticky() {
        let mux = Multiplexer::new("test", 4, OverflowPolicy::DropOldest);
        mux.finish(StreamEnd::Failed("boom".into()));
        mux.finish(StreamEnd::Eos);

        assert!(mux.is_finished());
        assert_eq!(mux.end_error(), Some(StreamError::Upstream("boom".into())));
        assert_eq!(mux.publish(Bytes::from_static(b"x")), 0);
    }
}
