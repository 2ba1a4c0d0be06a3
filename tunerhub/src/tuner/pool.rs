//! Tuner pool: allocation of a fixed set of tuners to stream requests.
//!
//! The whole tuner table sits behind one `tokio::sync::Mutex`. Every state
//! change (acquire, release, drain expiry, source end, shutdown) is decided
//! and committed under that lock, and every spawn or teardown runs after the
//! lock is dropped. A tuner whose capture is being torn down stays out of the
//! Idle set until its processes are gone. Captures are identified by a
//! [`CaptureId`]; a late release or drain timer that names a capture which is
//! no longer current is ignored.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use tunerhub_core::{Channel, ChannelCatalog, ChannelType, FilterSpec, TunerSpec};

use crate::error::TunerError;
use crate::stream::{OverflowPolicy, StreamEnd};
use crate::tuner::capture::Capture;
use crate::tuner::lease::{CaptureId, SessionId, TunerLease, TunerUser};

/// Runtime knobs of the pool.
#[derive(Debug, Clone)]
pub struct TunerPoolConfig {
    /// How long a tuner without subscribers keeps streaming before teardown.
    pub grace_period: Duration,
    /// Bound on the graceful stop of each process.
    pub stop_timeout: Duration,
    /// Silence from the source for this long ends the capture.
    pub stall_timeout: Option<Duration>,
    /// Read size from the pipeline output.
    pub chunk_size: usize,
    /// Per-subscriber backlog, in chunks.
    pub subscriber_buffer: usize,
    pub overflow: OverflowPolicy,
}

impl Default for TunerPoolConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::ZERO,
            stop_timeout: Duration::from_millis(3000),
            stall_timeout: Some(Duration::from_millis(10000)),
            chunk_size: 32 * 1024,
            subscriber_buffer: 1000,
            overflow: OverflowPolicy::DropOldest,
        }
    }
}

/// Externally visible state of one tuner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TunerState {
    Idle,
    /// Capture pipeline is being spawned.
    Starting,
    Active,
    /// No subscribers left, waiting out the grace period.
    Draining,
    /// The last capture is being torn down.
    Stopping,
}

/// Snapshot of one tuner, as returned by [`TunerPool::status`].
#[derive(Debug, Clone, Serialize)]
pub struct TunerStatus {
    pub index: usize,
    pub name: String,
    pub types: Vec<ChannelType>,
    pub state: TunerState,
    pub channel: Option<Channel>,
    pub subscribers: usize,
    pub capture: Option<CaptureId>,
    pub users: Vec<TunerUser>,
    /// Capture pid first, then filter stages.
    pub pids: Vec<u32>,
}

/// Lifetime counters of a pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub captures_spawned: u64,
    pub captures_torn_down: u64,
    pub spawn_failures: u64,
}

#[derive(Default)]
struct Counters {
    spawned: AtomicU64,
    torn_down: AtomicU64,
    spawn_failures: AtomicU64,
}

enum Slot {
    Idle,
    /// Out of service until this capture's teardown finishes.
    Stopping(Arc<Capture>),
    Busy {
        capture: Arc<Capture>,
        users: BTreeMap<SessionId, TunerUser>,
        drain: Option<JoinHandle<()>>,
    },
}

impl Slot {
    /// Empty the slot, cancelling a pending drain, and hand back the capture.
    fn vacate(&mut self) -> Option<Arc<Capture>> {
        match std::mem::replace(self, Slot::Idle) {
            Slot::Idle => None,
            Slot::Stopping(capture) => Some(capture),
            Slot::Busy { capture, drain, .. } => {
                if let Some(drain) = drain {
                    drain.abort();
                }
                Some(capture)
            }
        }
    }

    /// Take the capture out of service. The tuner stays unavailable until
    /// [`PoolInner::teardown`] hands it back.
    fn retire(&mut self) -> Option<Arc<Capture>> {
        let capture = self.vacate()?;
        *self = Slot::Stopping(Arc::clone(&capture));
        Some(capture)
    }

    fn current(&self) -> Option<CaptureId> {
        match self {
            Slot::Busy { capture, .. } => Some(capture.id()),
            Slot::Idle | Slot::Stopping(_) => None,
        }
    }
}

/// What `acquire` decided under the lock.
enum Plan {
    Join(Arc<Capture>),
    Start {
        capture: Arc<Capture>,
        /// Draining capture taken over; torn down before the new spawn.
        reclaimed: Option<Arc<Capture>>,
        /// Capture whose teardown is already under way.
        stopping: Option<Arc<Capture>>,
    },
}

pub(crate) struct PoolInner {
    tuners: Vec<TunerSpec>,
    filters: Vec<FilterSpec>,
    config: TunerPoolConfig,
    table: Mutex<Vec<Slot>>,
    next_capture: AtomicU64,
    next_session: AtomicU64,
    counters: Counters,
}

/// Handle to the shared tuner pool. Cheap to clone.
#[derive(Clone)]
pub struct TunerPool {
    inner: Arc<PoolInner>,
}

impl TunerPool {
    /// Create a pool with every tuner Idle. `filters` is the chain applied to
    /// every capture.
    pub fn new(tuners: Vec<TunerSpec>, filters: Vec<FilterSpec>, config: TunerPoolConfig) -> Self {
        let table = tuners.iter().map(|_| Slot::Idle).collect();
        info!(
            "[Pool] {} tuner(s), {} filter stage(s), grace period {} ms",
            tuners.len(),
            filters.iter().filter(|f| !f.is_passthrough()).count(),
            config.grace_period.as_millis()
        );
        Self {
            inner: Arc::new(PoolInner {
                tuners,
                filters,
                config,
                table: Mutex::new(table),
                next_capture: AtomicU64::new(1),
                next_session: AtomicU64::new(1),
                counters: Counters::default(),
            }),
        }
    }

    pub fn config(&self) -> &TunerPoolConfig {
        &self.inner.config
    }

    pub fn tuners(&self) -> &[TunerSpec] {
        &self.inner.tuners
    }

    /// Get a lease on a tuner streaming `channel`.
    ///
    /// Preference order: a tuner already on this channel (no spawn), the
    /// first Idle eligible tuner in configuration order, the first eligible
    /// tuner that is draining with no subscribers. Otherwise
    /// [`TunerError::Exhausted`]. Active subscribers are never preempted.
    pub async fn acquire(&self, channel: &Channel, user: TunerUser) -> Result<TunerLease, TunerError> {
        let inner = &self.inner;
        let session = SessionId(inner.next_session.fetch_add(1, Ordering::Relaxed));

        let (index, plan) = {
            let mut table = inner.table.lock().await;
            inner.plan(&mut table, channel, session, &user)?
        };
        let spec = &inner.tuners[index];

        // Start-up runs in its own task so that joiners are woken even if
        // this caller goes away.
        let (capture, starter) = match plan {
            Plan::Join(capture) => (capture, None),
            Plan::Start {
                capture,
                reclaimed,
                stopping,
            } => {
                let task = tokio::spawn(Arc::clone(inner).start_capture(
                    index,
                    Arc::clone(&capture),
                    reclaimed,
                    stopping,
                    user.clone(),
                ));
                (capture, Some(task))
            }
        };

        let lease = TunerLease::new(
            session,
            index,
            spec.name.clone(),
            capture.id(),
            channel.clone(),
            user,
            Arc::clone(capture.mux()),
            Arc::downgrade(inner),
        );

        let ready = match starter {
            Some(task) => task.await.unwrap_or_else(|_| Err(TunerError::Aborted)),
            None => capture.wait_ready().await,
        };
        if let Err(e) = ready {
            lease.release().await;
            return Err(e);
        }
        debug!("[Pool] {} on {} ({})", session, capture.label(), channel);
        Ok(lease)
    }

    /// Resolve `name` in `catalog` and acquire it.
    pub async fn acquire_by_name(
        &self,
        catalog: &ChannelCatalog,
        name: &str,
        user: TunerUser,
    ) -> Result<TunerLease, TunerError> {
        let channel = catalog.resolve(name)?;
        self.acquire(channel, user).await
    }

    /// Give a lease back. Same as [`TunerLease::release`].
    pub async fn release(&self, lease: TunerLease) {
        lease.release().await;
    }

    /// One entry per tuner, in configuration order.
    pub async fn status(&self) -> Vec<TunerStatus> {
        let table = self.inner.table.lock().await;
        self.inner
            .tuners
            .iter()
            .zip(table.iter())
            .enumerate()
            .map(|(index, (spec, slot))| {
                let mut status = TunerStatus {
                    index,
                    name: spec.name.clone(),
                    types: spec.types.clone(),
                    state: TunerState::Idle,
                    channel: None,
                    subscribers: 0,
                    capture: None,
                    users: Vec::new(),
                    pids: Vec::new(),
                };
                if let Slot::Stopping(capture) = slot {
                    status.state = TunerState::Stopping;
                    status.channel = Some(capture.channel().clone());
                    status.pids = capture.pids();
                }
                if let Slot::Busy { capture, users, .. } = slot {
                    status.state = if capture.is_starting() {
                        TunerState::Starting
                    } else if users.is_empty() {
                        TunerState::Draining
                    } else {
                        TunerState::Active
                    };
                    status.channel = Some(capture.channel().clone());
                    status.subscribers = users.len();
                    status.capture = Some(capture.id());
                    status.users = users.values().cloned().collect();
                    status.pids = capture.pids();
                }
                status
            })
            .collect()
    }

    pub fn stats(&self) -> PoolStats {
        let counters = &self.inner.counters;
        PoolStats {
            captures_spawned: counters.spawned.load(Ordering::Relaxed),
            captures_torn_down: counters.torn_down.load(Ordering::Relaxed),
            spawn_failures: counters.spawn_failures.load(Ordering::Relaxed),
        }
    }

    /// Tear down every capture and leave all tuners Idle. Outstanding leases
    /// become no-ops.
    pub async fn shutdown(&self) {
        let mut retired = Vec::new();
        let mut stopping = Vec::new();
        {
            let mut table = self.inner.table.lock().await;
            for slot in table.iter_mut() {
                if let Slot::Stopping(capture) = slot {
                    stopping.push(Arc::clone(capture));
                    continue;
                }
                retired.extend(slot.retire());
            }
        }
        info!("[Pool] Shutting down {} capture(s)", retired.len());
        for capture in &retired {
            self.inner.teardown(capture, StreamEnd::Eos).await;
        }
        for capture in &stopping {
            capture.stopped().await;
            self.inner.hand_back(capture).await;
        }
    }
}

impl PoolInner {
    /// Pick a tuner for `channel` and commit the choice. Runs under the table
    /// lock; never spawns.
    fn plan(
        &self,
        table: &mut [Slot],
        channel: &Channel,
        session: SessionId,
        user: &TunerUser,
    ) -> Result<(usize, Plan), TunerError> {
        let eligible: Vec<usize> = self
            .tuners
            .iter()
            .enumerate()
            .filter(|(_, spec)| spec.supports(channel.channel_type))
            .map(|(index, _)| index)
            .collect();

        // Already on this channel.
        for &index in &eligible {
            if let Slot::Busy {
                capture,
                users,
                drain,
            } = &mut table[index]
            {
                if capture.is_closed() || !capture.channel().same_stream(channel) {
                    continue;
                }
                if let Some(drain) = drain.take() {
                    drain.abort();
                    debug!("[Pool] Drain of {} cancelled", capture.label());
                }
                users.insert(session, user.clone());
                info!(
                    "[Pool] {} reuses {} for {} ({} subscribers)",
                    user,
                    self.tuners[index].name,
                    channel,
                    users.len()
                );
                return Ok((index, Plan::Join(Arc::clone(capture))));
            }
        }

        // First idle tuner, then one that is about to be, then a draining one.
        let idle = eligible
            .iter()
            .copied()
            .find(|&index| matches!(table[index], Slot::Idle));
        let stopping = || {
            eligible
                .iter()
                .copied()
                .find(|&index| matches!(table[index], Slot::Stopping(_)))
        };
        let draining = || {
            eligible.iter().copied().find(|&index| match &table[index] {
                Slot::Busy { capture, users, .. } => users.is_empty() && !capture.is_starting(),
                Slot::Idle | Slot::Stopping(_) => false,
            })
        };
        let Some(index) = idle.or_else(stopping).or_else(draining) else {
            warn!("[Pool] No tuner available for {} ({})", channel, user);
            return Err(TunerError::Exhausted {
                channel: channel.key(),
            });
        };

        let was_stopping = matches!(table[index], Slot::Stopping(_));
        let outgoing = table[index].vacate();
        let (reclaimed, stopping) = if was_stopping {
            (None, outgoing)
        } else {
            (outgoing, None)
        };
        let id = CaptureId(self.next_capture.fetch_add(1, Ordering::Relaxed));
        let spec = &self.tuners[index];
        let capture = Capture::new(id, index, &spec.name, channel.clone(), &self.config);
        table[index] = Slot::Busy {
            capture: Arc::clone(&capture),
            users: BTreeMap::from([(session, user.clone())]),
            drain: None,
        };
        info!("[Pool] {} takes {} for {} ({})", user, spec.name, channel, capture.label());

        Ok((
            index,
            Plan::Start {
                capture,
                reclaimed,
                stopping,
            },
        ))
    }

    async fn start_capture(
        self: Arc<Self>,
        index: usize,
        capture: Arc<Capture>,
        reclaimed: Option<Arc<Capture>>,
        stopping: Option<Arc<Capture>>,
        user: TunerUser,
    ) -> Result<(), TunerError> {
        let spec = &self.tuners[index];
        if let Some(old) = reclaimed {
            info!("[Pool] Reclaiming {} from {} for {}", spec.name, old.channel(), capture.channel());
            old.shutdown(StreamEnd::Eos).await;
            self.counters.torn_down.fetch_add(1, Ordering::Relaxed);
        }
        if let Some(old) = stopping {
            debug!("[Pool] {} waits for {} to stop", capture.label(), old.label());
            old.stopped().await;
        }

        let started = capture
            .start(spec, &self.filters, &user, &self.config, Arc::downgrade(&self))
            .await;
        match started {
            Ok(()) => {
                self.counters.spawned.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.counters.spawn_failures.fetch_add(1, Ordering::Relaxed);
                self.rollback(index, &capture).await;
                Err(e)
            }
        }
    }

    /// A start-up failed: put the tuner back to Idle if it still holds the
    /// failed capture.
    async fn rollback(&self, index: usize, capture: &Arc<Capture>) {
        let mut table = self.table.lock().await;
        if table[index].current() == Some(capture.id()) {
            table[index].vacate();
            debug!("[Pool] {} rolled back to Idle", self.tuners[index].name);
        }
    }

    /// Drop one subscriber. The last one out starts the grace timer, or tears
    /// the capture down right away when there is no grace period.
    pub(crate) async fn release(self: Arc<Self>, index: usize, capture: CaptureId, session: SessionId) {
        let mut table = self.table.lock().await;
        let Some(slot) = table.get_mut(index) else {
            return;
        };
        let Slot::Busy {
            capture: current,
            users,
            drain,
        } = &mut *slot
        else {
            debug!("[Pool] {} released after teardown", session);
            return;
        };
        if current.id() != capture {
            debug!("[Pool] {} released stale capture {}", session, capture);
            return;
        }
        if users.remove(&session).is_none() {
            return;
        }
        if !users.is_empty() {
            debug!("[Pool] {} left {} ({} remain)", session, current.label(), users.len());
            return;
        }

        let grace = self.config.grace_period;
        if grace.is_zero() {
            let retired = slot.retire();
            drop(table);
            if let Some(capture) = retired {
                info!("[Pool] {} has no subscribers, tearing down", capture.label());
                // Own task, so a cancelled caller cannot strand the tuner.
                let pool = Arc::clone(&self);
                let teardown =
                    tokio::spawn(async move { pool.teardown(&capture, StreamEnd::Eos).await });
                if teardown.await.is_err() {
                    warn!("[Pool] Teardown task failed for {}", session);
                }
            }
            return;
        }

        debug!("[Pool] {} draining for {} ms", current.label(), grace.as_millis());
        let pool = Arc::downgrade(&self);
        *drain = Some(tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(pool) = pool.upgrade() {
                pool.drain_expired(index, capture).await;
            }
        }));
    }

    async fn drain_expired(&self, index: usize, capture: CaptureId) {
        let retired = {
            let mut table = self.table.lock().await;
            let expired = matches!(
                &table[index],
                Slot::Busy { capture: current, users, .. }
                    if current.id() == capture && users.is_empty()
            );
            if expired {
                // The running timer is this task; detach it instead of aborting.
                if let Slot::Busy { drain, .. } = &mut table[index] {
                    drain.take();
                }
                table[index].retire()
            } else {
                None
            }
        };
        if let Some(capture) = retired {
            info!("[Pool] Grace period over, tearing down {}", capture.label());
            self.teardown(&capture, StreamEnd::Eos).await;
        }
    }

    /// The reader of `capture` stopped on its own: free the tuner and end
    /// the stream for its subscribers.
    pub(crate) async fn source_ended(&self, capture: &Arc<Capture>, end: StreamEnd) {
        let index = capture.tuner_index();
        let committed = {
            let mut table = self.table.lock().await;
            table[index].current() == Some(capture.id()) && table[index].retire().is_some()
        };
        if committed {
            self.teardown(capture, end).await;
            info!("[Pool] {} freed after source end", self.tuners[index].name);
        } else {
            capture.shutdown(end).await;
        }
    }

    /// Shut a retired capture down, then give its tuner back unless a new
    /// capture was already planned on it.
    async fn teardown(&self, capture: &Arc<Capture>, end: StreamEnd) {
        capture.shutdown(end).await;
        self.counters.torn_down.fetch_add(1, Ordering::Relaxed);
        self.hand_back(capture).await;
    }

    async fn hand_back(&self, capture: &Arc<Capture>) {
        let index = capture.tuner_index();
        let mut table = self.table.lock().await;
        if matches!(&table[index], Slot::Stopping(current) if current.id() == capture.id()) {
            table[index] = Slot::Idle;
            debug!("[Pool] {} is Idle", self.tuners[index].name);
        }
    }
}
