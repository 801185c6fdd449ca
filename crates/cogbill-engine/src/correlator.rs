//! Job Correlator.
//!
//! Bridges an outbound worker submission and the webhook that eventually
//! reports its result. Each job gets a `oneshot` channel in a sharded
//! [`DashMap`], so resolving one job never contends with unrelated ones.
//!
//! Per correlation ID the entry moves `Registered -> Resolved | TimedOut |
//! Cancelled`. Terminal entries stay behind as tombstones for a grace period
//! so duplicate webhook deliveries are recognised and discarded; a result
//! that arrives before anyone registered is cached for the same period.

use std::sync::Arc;
use std::time::Duration;

use cogbill_core::{CorrelationId, JobResult};
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Default lifetime of tombstones and cached early results.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(300);

/// Errors from registering a correlation ID.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CorrelatorError {
    /// Someone is already waiting on this ID.
    #[error("correlation ID already registered: {0}")]
    AlreadyRegistered(CorrelationId),

    /// The ID already reached a terminal state.
    #[error("correlation ID already finished: {0}")]
    AlreadyFinished(CorrelationId),
}

/// Why a wait ended without a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WaitError {
    /// No terminal event arrived in time.
    #[error("timed out waiting for job result")]
    TimedOut,

    /// The waiter's cancellation token fired.
    #[error("wait cancelled")]
    Cancelled,
}

/// Outcome of [`JobCorrelator::resolve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// A registered waiter received the result.
    Delivered,
    /// Nobody was registered yet; the result is cached for the grace period.
    Cached,
    /// The ID was already resolved, timed out or cancelled; ignored.
    Duplicate,
}

/// Observable state of a correlation entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// A waiter is registered.
    Registered,
    /// A result arrived before registration.
    Cached,
    /// The waiter was given its result.
    Resolved,
    /// The waiter gave up after its timeout.
    TimedOut,
    /// The waiter was cancelled or dropped.
    Cancelled,
}

#[derive(Debug)]
enum Entry {
    Registered(oneshot::Sender<JobResult>),
    Cached { result: JobResult, since: Instant },
    Finished { state: EntryState, since: Instant },
}

impl Entry {
    fn state(&self) -> EntryState {
        match self {
            Self::Registered(_) => EntryState::Registered,
            Self::Cached { .. } => EntryState::Cached,
            Self::Finished { state, .. } => *state,
        }
    }

    fn expired(&self, now: Instant, grace: Duration) -> bool {
        match self {
            Self::Registered(_) => false,
            Self::Cached { since, .. } | Self::Finished { since, .. } => {
                now.saturating_duration_since(*since) >= grace
            }
        }
    }
}

#[derive(Debug)]
struct Shared {
    entries: DashMap<CorrelationId, Entry>,
    grace: Duration,
}

impl Shared {
    /// Move a registered entry to `state`. Returns `false` if it had already
    /// left `Registered`.
    fn finish(&self, id: CorrelationId, state: EntryState) -> bool {
        match self.entries.get_mut(&id) {
            Some(mut entry) if matches!(*entry, Entry::Registered(_)) => {
                *entry = Entry::Finished {
                    state,
                    since: Instant::now(),
                };
                true
            }
            _ => false,
        }
    }
}

/// Registered interest in one job's result.
///
/// Dropping a waiter that has not received its result marks the entry
/// `Cancelled`; a later `resolve` is then a duplicate.
#[derive(Debug)]
pub struct Waiter {
    id: CorrelationId,
    rx: oneshot::Receiver<JobResult>,
    shared: Arc<Shared>,
}

impl Waiter {
    /// The correlation ID this waiter is registered under.
    #[must_use]
    pub fn id(&self) -> CorrelationId {
        self.id
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        if self.shared.finish(self.id, EntryState::Cancelled) {
            tracing::debug!(correlation_id = %self.id, "Waiter dropped before result");
        }
    }
}

/// Keyed registry of jobs awaiting a webhook.
///
/// Cheap to clone; clones share the same registry.
#[derive(Debug, Clone)]
pub struct JobCorrelator {
    shared: Arc<Shared>,
}

impl Default for JobCorrelator {
    fn default() -> Self {
        Self::new(DEFAULT_GRACE)
    }
}

impl JobCorrelator {
    /// Create a correlator keeping tombstones for `grace`.
    #[must_use]
    pub fn new(grace: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                entries: DashMap::new(),
                grace,
            }),
        }
    }

    /// Register interest in `id`.
    ///
    /// If a result for `id` was cached by an early [`resolve`](Self::resolve),
    /// the returned waiter completes immediately.
    ///
    /// # Errors
    ///
    /// - `CorrelatorError::AlreadyRegistered` if another waiter holds `id`.
    /// - `CorrelatorError::AlreadyFinished` if `id` reached a terminal state.
    pub fn register(&self, id: CorrelationId) -> Result<Waiter, CorrelatorError> {
        let (tx, rx) = oneshot::channel();

        match self.shared.entries.entry(id) {
            MapEntry::Vacant(vacant) => {
                vacant.insert(Entry::Registered(tx));
            }
            MapEntry::Occupied(mut occupied) => match occupied.get() {
                Entry::Registered(_) => return Err(CorrelatorError::AlreadyRegistered(id)),
                Entry::Finished { .. } => return Err(CorrelatorError::AlreadyFinished(id)),
                Entry::Cached { .. } => {
                    let cached = std::mem::replace(
                        occupied.get_mut(),
                        Entry::Finished {
                            state: EntryState::Resolved,
                            since: Instant::now(),
                        },
                    );
                    if let Entry::Cached { result, .. } = cached {
                        // The receiver is alive in this scope, so the send cannot fail.
                        let _ = tx.send(result);
                    }
                    tracing::debug!(correlation_id = %id, "Registered against cached result");
                }
            },
        }

        Ok(Waiter {
            id,
            rx,
            shared: Arc::clone(&self.shared),
        })
    }

    /// Wait for the waiter's result, the timeout, or `cancel`, whichever
    /// comes first.
    ///
    /// Suspends only the calling task. On timeout or cancellation the entry
    /// becomes a tombstone and any later `resolve` is discarded.
    ///
    /// # Errors
    ///
    /// - `WaitError::TimedOut` if `timeout` elapsed first.
    /// - `WaitError::Cancelled` if `cancel` fired first.
    pub async fn wait(
        &self,
        mut waiter: Waiter,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<JobResult, WaitError> {
        let id = waiter.id;

        let outcome = tokio::select! {
            biased;
            received = &mut waiter.rx => received.map_err(|_| WaitError::Cancelled),
            () = tokio::time::sleep(timeout) => Err(WaitError::TimedOut),
            () = cancel.cancelled() => Err(WaitError::Cancelled),
        };

        match outcome {
            Ok(result) => Ok(result),
            Err(err) => {
                let state = match err {
                    WaitError::TimedOut => EntryState::TimedOut,
                    WaitError::Cancelled => EntryState::Cancelled,
                };
                if self.shared.finish(id, state) {
                    tracing::debug!(
                        correlation_id = %id,
                        state = ?state,
                        "Wait ended without result"
                    );
                    return Err(err);
                }
                // Lost the race against `resolve`: the result is already in
                // the channel.
                waiter.rx.try_recv().map_err(|_| err)
            }
        }
    }

    /// [`register`](Self::register) then [`wait`](Self::wait).
    ///
    /// # Errors
    ///
    /// Returns the registration error, or the wait error wrapped in `Ok(Err)`.
    pub async fn await_result(
        &self,
        id: CorrelationId,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Result<JobResult, WaitError>, CorrelatorError> {
        let waiter = self.register(id)?;
        Ok(self.wait(waiter, timeout, cancel).await)
    }

    /// Deliver a terminal result for `id`.
    ///
    /// Safe to call from many tasks at once and more than once per ID: the
    /// first terminal resolution wins and every later one is a no-op.
    pub fn resolve(&self, id: CorrelationId, result: JobResult) -> Resolution {
        match self.shared.entries.entry(id) {
            MapEntry::Vacant(vacant) => {
                vacant.insert(Entry::Cached {
                    result,
                    since: Instant::now(),
                });
                tracing::debug!(correlation_id = %id, "Cached result with no waiter");
                Resolution::Cached
            }
            MapEntry::Occupied(mut occupied) => {
                if !matches!(occupied.get(), Entry::Registered(_)) {
                    tracing::debug!(
                        correlation_id = %id,
                        state = ?occupied.get().state(),
                        "Discarded duplicate result"
                    );
                    return Resolution::Duplicate;
                }

                let registered = std::mem::replace(
                    occupied.get_mut(),
                    Entry::Finished {
                        state: EntryState::Resolved,
                        since: Instant::now(),
                    },
                );
                if let Entry::Registered(tx) = registered {
                    if tx.send(result).is_err() {
                        tracing::debug!(correlation_id = %id, "Waiter went away during delivery");
                    }
                }
                Resolution::Delivered
            }
        }
    }

    /// Current state of `id`, if it is tracked.
    #[must_use]
    pub fn state(&self, id: CorrelationId) -> Option<EntryState> {
        self.shared.entries.get(&id).map(|entry| entry.state())
    }

    /// Remove tombstones and cached results older than the grace period.
    ///
    /// Returns the number of entries removed.
    pub fn purge_expired(&self, now: Instant) -> usize {
        let grace = self.shared.grace;
        let before = self.shared.entries.len();
        self.shared
            .entries
            .retain(|_, entry| !entry.expired(now, grace));
        before.saturating_sub(self.shared.entries.len())
    }

    /// Spawn a task calling [`purge_expired`](Self::purge_expired) every
    /// `interval` until `shutdown` fires.
    #[must_use]
    pub fn spawn_sweeper(&self, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let correlator = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let purged = correlator.purge_expired(Instant::now());
                        if purged > 0 {
                            tracing::debug!(purged, "Purged correlation tombstones");
                        }
                    }
                }
            }
        })
    }

    /// Number of tracked entries, tombstones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.entries.len()
    }

    /// Whether nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shared.entries.is_empty()
    }

    /// Grace period for tombstones.
    #[must_use]
    pub fn grace(&self) -> Duration {
        self.shared.grace
    }
}
