//! Leases handed out by the tuner pool.

use std::fmt;
use std::sync::{Arc, Weak};

use log::warn;
use serde::Serialize;

use tunerhub_core::Channel;

use crate::stream::{Multiplexer, Subscription};
use crate::tuner::pool::PoolInner;

/// Identifies one acquisition for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session#{}", self.0)
    }
}

/// Identifies one capture (one spawn of a tuner's pipeline).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CaptureId(pub u64);

impl fmt::Display for CaptureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Who is asking for a tuner, for logs and status output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TunerUser {
    /// Free-form description, e.g. a client address or a job name.
    pub info: String,
    /// Expected stream duration in seconds, if known.
    pub duration: Option<u64>,
}

impl TunerUser {
    pub fn new(info: impl Into<String>) -> Self {
        Self {
            info: info.into(),
            duration: None,
        }
    }

    pub fn with_duration(mut self, secs: u64) -> Self {
        self.duration = Some(secs);
        self
    }
}

impl fmt::Display for TunerUser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.info.is_empty() {
            f.write_str("anonymous")
        } else {
            f.write_str(&self.info)
        }
    }
}

/// Grant to read one tuner's current stream.
///
/// The lease refers to its tuner by index and capture id only; it owns none
/// of the tuner's processes. Releasing a lease whose capture has already been
/// torn down is a no-op. A lease dropped without [`TunerLease::release`] is
/// released on the current runtime.
pub struct TunerLease {
    id: SessionId,
    tuner_index: usize,
    tuner_name: String,
    capture: CaptureId,
    channel: Channel,
    user: TunerUser,
    source: Arc<Multiplexer>,
    pool: Weak<PoolInner>,
    released: bool,
}

impl TunerLease {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: SessionId,
        tuner_index: usize,
        tuner_name: String,
        capture: CaptureId,
        channel: Channel,
        user: TunerUser,
        source: Arc<Multiplexer>,
        pool: Weak<PoolInner>,
    ) -> Self {
        Self {
            id,
            tuner_index,
            tuner_name,
            capture,
            channel,
            user,
            source,
            pool,
            released: false,
        }
    }

    /// A lease bound to no pool; releasing it does nothing.
    #[cfg(test)]
    pub(crate) fn detached(source: Arc<Multiplexer>) -> Self {
        use tunerhub_core::ChannelType;

        Self::new(
            SessionId(0),
            0,
            "test".to_string(),
            CaptureId(0),
            Channel::new("test", ChannelType::Terrestrial, "0"),
            TunerUser::default(),
            source,
            Weak::new(),
        )
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn tuner_index(&self) -> usize {
        self.tuner_index
    }

    pub fn tuner_name(&self) -> &str {
        &self.tuner_name
    }

    pub fn capture_id(&self) -> CaptureId {
        self.capture
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn user(&self) -> &TunerUser {
        &self.user
    }

    pub(crate) fn source(&self) -> &Arc<Multiplexer> {
        &self.source
    }

    /// Start reading the stream.
    pub fn attach(self) -> Subscription {
        let source = Arc::clone(&self.source);
        source.attach(self)
    }

    /// Give the lease back to the pool.
    pub async fn release(mut self) {
        self.released = true;
        if let Some(pool) = self.pool.upgrade() {
            pool.release(self.tuner_index, self.capture, self.id).await;
        }
    }
}

impl Drop for TunerLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Some(pool) = self.pool.upgrade() else {
            return;
        };
        let (index, capture, id) = (self.tuner_index, self.capture, self.id);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { pool.release(index, capture, id).await });
            }
            Err(_) => warn!("[{}] Dropped outside a runtime, not released", id),
        }
    }
}

impl fmt::Debug for TunerLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunerLease")
            .field("id", &self.id)
            .field("tuner", &self.tuner_name)
            .field("capture", &self.capture)
            .field("channel", &self.channel.name)
            .finish()
    }
}
