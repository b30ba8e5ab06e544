// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Bounded pooling of secure channels.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use futures::StreamExt as _;
use parking_lot::Mutex;
use tick::{Clock, PeriodicTimer};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::Level;

use crate::channel::{ChannelState, SecureChannel};
use crate::config::{ChannelConfig, PoolConfig};
use crate::error::{Error, LimitScope, Result};
use crate::identity::{IdentityProvider, WorkloadId};
use crate::transport::{Connector, Session};

/// A bounded set of [`SecureChannel`]s per target.
///
/// [`ConnectionPool::acquire`] hands out a [`PoolGuard`] that returns the channel to
/// the pool when dropped, on every exit path including cancellation. When neither an
/// idle channel nor capacity is available, acquisition fails right away with
/// [`Error::PoolExhausted`]; nothing is queued.
///
/// Two background workers, started with [`ConnectionPool::start`], close channels that
/// sat idle longer than `idle_timeout` and evict channels whose peer stopped answering
/// liveness probes.
///
/// # Thread safety
///
/// The bookkeeping lock is only held for map updates, never across I/O. Clones share
/// the same pool.
pub struct ConnectionPool<P, C: Connector> {
    inner: Arc<PoolInner<P, C>>,
}

struct PoolInner<P, C: Connector> {
    identity: Arc<P>,
    connector: Arc<C>,
    config: PoolConfig,
    channel_config: ChannelConfig,
    clock: Clock,
    state: Mutex<PoolState<P, C>>,
    workers: Mutex<Option<Workers>>,
}

struct PoolState<P, C: Connector> {
    targets: HashMap<WorkloadId, Vec<Pooled<P, C>>>,
    total: usize,
    closed: bool,
    next_id: u64,
    counters: Counters,
}

struct Pooled<P, C: Connector> {
    id: u64,
    channel: Arc<SecureChannel<P, C>>,
    last_used: Instant,
    in_use: bool,
    unhealthy: bool,
}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    acquisitions: u64,
    creations: u64,
    cleanups: u64,
    health_evictions: u64,
    exhaustion_rejections: u64,
}

#[derive(Debug)]
struct Workers {
    stop: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

#[derive(Debug, Clone, Copy)]
enum Maintenance {
    Cleanup,
    HealthCheck,
}

/// A snapshot of pool occupancy and cumulative counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct PoolStats {
    /// Connections currently tracked, in use or idle.
    pub total_connections: usize,
    /// Connections currently handed out.
    pub in_use: usize,
    /// Tracked connections per target.
    pub per_target: BTreeMap<WorkloadId, usize>,
    /// Successful acquisitions.
    pub acquisitions: u64,
    /// Channels created.
    pub creations: u64,
    /// Connections closed because they were idle for too long.
    pub cleanups: u64,
    /// Connections evicted because they failed a liveness probe.
    pub health_evictions: u64,
    /// Acquisitions rejected because a limit was reached.
    pub exhaustion_rejections: u64,
}

impl<P, C> ConnectionPool<P, C>
where
    P: IdentityProvider,
    C: Connector,
{
    /// Creates an empty pool. Channels are created from the `channel` template.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when either configuration is invalid.
    pub fn new(identity: Arc<P>, connector: Arc<C>, config: PoolConfig, channel: ChannelConfig, clock: Clock) -> Result<Self> {
        config.validate()?;
        channel.validate()?;

        Ok(Self {
            inner: Arc::new(PoolInner {
                identity,
                connector,
                config,
                channel_config: channel,
                clock,
                state: Mutex::new(PoolState {
                    targets: HashMap::new(),
                    total: 0,
                    closed: false,
                    next_id: 0,
                    counters: Counters::default(),
                }),
                workers: Mutex::new(None),
            }),
        })
    }

    /// The pool configuration.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// The template every new channel is created from.
    #[must_use]
    pub fn channel_config(&self) -> &ChannelConfig {
        &self.inner.channel_config
    }

    /// Validates `target` and acquires a channel to it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when `target` is not a valid workload identity, or
    /// any error of [`ConnectionPool::acquire`].
    pub async fn acquire_str(&self, target: &str) -> Result<PoolGuard<P, C>> {
        let target = WorkloadId::parse(target)?;
        self.acquire(&target).await
    }

    /// Hands out an idle channel to `target` or creates a new one.
    ///
    /// New channels are idle; their handshake runs on first use.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PoolExhausted`] naming the target and the limit that was hit, or
    /// [`Error::PoolClosed`] after [`ConnectionPool::close_all`].
    pub async fn acquire(&self, target: &WorkloadId) -> Result<PoolGuard<P, C>> {
        let inner = &self.inner;
        let now = inner.clock.instant();
        let mut unusable = Vec::new();

        let acquired = {
            let mut state = inner.state.lock();
            let PoolState {
                targets,
                total,
                closed,
                next_id,
                counters,
            } = &mut *state;

            if *closed {
                return Err(Error::PoolClosed);
            }

            let connections = targets.entry(target.clone()).or_default();

            connections.retain(|conn| {
                let keep = conn.in_use || conn.channel.is_usable();
                if !keep {
                    unusable.push(Arc::clone(&conn.channel));
                }
                keep
            });
            *total -= unusable.len();

            let acquired = if let Some(conn) = connections.iter_mut().find(|conn| !conn.in_use && !conn.unhealthy) {
                conn.in_use = true;
                conn.last_used = now;
                counters.acquisitions += 1;
                Ok((conn.id, Arc::clone(&conn.channel)))
            } else if connections.len() >= inner.config.max_connections_per_target {
                counters.exhaustion_rejections += 1;
                Err(Error::PoolExhausted {
                    target: target.to_string(),
                    limit: inner.config.max_connections_per_target,
                    scope: LimitScope::PerTarget,
                })
            } else if *total >= inner.config.max_total_connections {
                counters.exhaustion_rejections += 1;
                Err(Error::PoolExhausted {
                    target: target.to_string(),
                    limit: inner.config.max_total_connections,
                    scope: LimitScope::Total,
                })
            } else {
                SecureChannel::new(
                    Arc::clone(&inner.identity),
                    Arc::clone(&inner.connector),
                    target.clone(),
                    inner.channel_config.clone(),
                    inner.clock.clone(),
                )
                .map(|channel| {
                    let channel = Arc::new(channel);
                    let id = *next_id;
                    *next_id += 1;
                    *total += 1;
                    counters.creations += 1;
                    counters.acquisitions += 1;

                    connections.push(Pooled {
                        id,
                        channel: Arc::clone(&channel),
                        last_used: now,
                        in_use: true,
                        unhealthy: false,
                    });

                    (id, channel)
                })
            };

            if connections.is_empty() {
                targets.remove(target);
            }

            acquired
        };

        let guard = acquired.map(|(id, channel)| PoolGuard {
            pool: Arc::clone(&self.inner),
            target: target.clone(),
            id,
            channel,
            released: false,
        });

        if let Err(Error::PoolExhausted { limit, scope, .. }) = &guard {
            tracing::event!(
                name: "tether.pool.exhausted",
                Level::WARN,
                pool.target = %target,
                pool.limit = *limit,
                pool.scope = %scope,
            );
        }

        for channel in &unusable {
            log_eviction(channel.target(), "unusable");
            channel.close().await;
        }

        guard
    }

    /// Closes connections that have been idle longer than `idle_timeout`.
    ///
    /// Returns how many connections were closed.
    pub async fn cleanup_idle(&self) -> usize {
        let now = self.inner.clock.instant();
        let idle_timeout = self.inner.config.idle_timeout;

        let expired = self.inner.evict(|conn| {
            !conn.in_use && (now.saturating_duration_since(conn.last_used) > idle_timeout || !conn.channel.is_usable())
        });

        self.inner.state.lock().counters.cleanups += expired.len() as u64;

        for channel in &expired {
            log_eviction(channel.target(), "idle");
            channel.close().await;
        }

        expired.len()
    }

    /// Probes every idle, established connection and evicts those whose peer is gone.
    ///
    /// Connections that get acquired while being probed are marked unhealthy and
    /// evicted when released. Returns how many connections failed the probe.
    pub async fn health_check(&self) -> usize {
        let candidates: Vec<(u64, Arc<SecureChannel<P, C>>)> = {
            let state = self.inner.state.lock();
            state
                .targets
                .values()
                .flatten()
                .filter(|conn| !conn.in_use && conn.channel.state() == ChannelState::Ready)
                .map(|conn| (conn.id, Arc::clone(&conn.channel)))
                .collect()
        };

        let mut dead = Vec::new();
        for (id, channel) in candidates {
            if !channel.probe().await {
                dead.push(id);
            }
        }

        if dead.is_empty() {
            return 0;
        }

        let failed = dead.len();
        let evicted = {
            let mut state = self.inner.state.lock();
            for conn in state.targets.values_mut().flatten() {
                if dead.contains(&conn.id) {
                    conn.unhealthy = true;
                }
            }
            drop(state);

            self.inner.evict(|conn| !conn.in_use && conn.unhealthy)
        };

        self.inner.state.lock().counters.health_evictions += evicted.len() as u64;

        for channel in &evicted {
            log_eviction(channel.target(), "unhealthy");
            channel.close().await;
        }

        failed
    }

    /// A snapshot of occupancy and counters.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();

        let per_target: BTreeMap<_, _> = state
            .targets
            .iter()
            .filter(|(_, connections)| !connections.is_empty())
            .map(|(target, connections)| (target.clone(), connections.len()))
            .collect();

        PoolStats {
            total_connections: state.total,
            in_use: state.targets.values().flatten().filter(|conn| conn.in_use).count(),
            per_target,
            acquisitions: state.counters.acquisitions,
            creations: state.counters.creations,
            cleanups: state.counters.cleanups,
            health_evictions: state.counters.health_evictions,
            exhaustion_rejections: state.counters.exhaustion_rejections,
        }
    }

    /// Spawns the cleanup and health-check workers on the current Tokio runtime.
    ///
    /// Calling it while the workers run has no effect.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PoolClosed`] after [`ConnectionPool::close_all`].
    ///
    /// # Panics
    ///
    /// Panics when called outside of a Tokio runtime.
    pub fn start(&self) -> Result<()> {
        let mut workers = self.inner.workers.lock();

        if self.inner.state.lock().closed {
            return Err(Error::PoolClosed);
        }

        if workers.is_some() {
            return Ok(());
        }

        let (stop, stopped) = watch::channel(false);
        let handles = [
            (Maintenance::Cleanup, self.inner.config.cleanup_interval),
            (Maintenance::HealthCheck, self.inner.config.health_check_interval),
        ]
        .into_iter()
        .map(|(task, period)| {
            tokio::spawn(maintain(
                Arc::downgrade(&self.inner),
                self.inner.clock.clone(),
                period,
                stopped.clone(),
                task,
            ))
        })
        .collect();

        *workers = Some(Workers { stop, handles });
        Ok(())
    }

    /// Signals the workers to stop and waits until they have.
    pub async fn stop(&self) {
        let workers = self.inner.workers.lock().take();
        join_workers(workers).await;
    }

    /// Stops the workers, then closes every tracked connection, in use or not.
    ///
    /// Idempotent. Guards still held by callers keep their channel, which now reports
    /// [`Error::Closed`], and releasing them is a no-op.
    pub async fn close_all(&self) {
        // Flipped under the workers lock, in the same order as `start`.
        let workers = {
            let mut workers = self.inner.workers.lock();
            self.inner.state.lock().closed = true;
            workers.take()
        };
        join_workers(workers).await;

        let channels: Vec<_> = {
            let mut state = self.inner.state.lock();
            state.total = 0;
            state
                .targets
                .drain()
                .flat_map(|(_, connections)| connections)
                .map(|conn| conn.channel)
                .collect()
        };

        if channels.is_empty() {
            return;
        }

        for channel in &channels {
            channel.close().await;
        }

        tracing::event!(
            name: "tether.pool.closed",
            Level::INFO,
            pool.closed_connections = channels.len(),
        );
    }
}

async fn join_workers(workers: Option<Workers>) {
    if let Some(Workers { stop, handles }) = workers {
        let _ = stop.send(true);

        for handle in handles {
            if let Err(e) = handle.await {
                tracing::event!(
                    name: "tether.pool.worker",
                    Level::ERROR,
                    error.message = %e,
                );
            }
        }
    }
}

impl<P, C: Connector> PoolInner<P, C> {
    /// Removes every connection matching `predicate` and returns their channels.
    fn evict(&self, mut predicate: impl FnMut(&Pooled<P, C>) -> bool) -> Vec<Arc<SecureChannel<P, C>>> {
        let mut evicted = Vec::new();
        let mut state = self.state.lock();

        for connections in state.targets.values_mut() {
            connections.retain(|conn| {
                let remove = predicate(conn);
                if remove {
                    evicted.push(Arc::clone(&conn.channel));
                }
                !remove
            });
        }

        state.targets.retain(|_, connections| !connections.is_empty());
        state.total -= evicted.len();
        evicted
    }
}

impl<P, C> PoolInner<P, C>
where
    P: IdentityProvider,
    C: Connector,
{
    fn release(&self, target: &WorkloadId, id: u64) {
        let now = self.clock.instant();

        let evicted = {
            let mut state = self.state.lock();
            let Some(connections) = state.targets.get_mut(target) else {
                return;
            };
            let Some(index) = connections.iter().position(|conn| conn.id == id) else {
                return;
            };

            let conn = &mut connections[index];
            if conn.channel.is_usable() && !conn.unhealthy {
                conn.in_use = false;
                conn.last_used = now;
                return;
            }

            let conn = connections.swap_remove(index);
            if connections.is_empty() {
                state.targets.remove(target);
            }
            state.total -= 1;
            if conn.unhealthy {
                state.counters.health_evictions += 1;
            }
            conn.channel
        };

        log_eviction(evicted.target(), "released unusable");

        // Release runs in `Drop`, so the session is closed in the background if possible.
        if let Some(session) = evicted.detach()
            && let Ok(runtime) = tokio::runtime::Handle::try_current()
        {
            runtime.spawn(async move { session.close().await });
        }
    }
}

async fn maintain<P, C>(pool: Weak<PoolInner<P, C>>, clock: Clock, period: Duration, mut stop: watch::Receiver<bool>, task: Maintenance)
where
    P: IdentityProvider,
    C: Connector,
{
    let mut timer = PeriodicTimer::new(&clock, period);

    loop {
        tokio::select! {
            _ = stop.changed() => break,
            _ = timer.next() => {
                let Some(inner) = pool.upgrade() else {
                    break;
                };
                let pool = ConnectionPool { inner };

                let affected = match task {
                    Maintenance::Cleanup => pool.cleanup_idle().await,
                    Maintenance::HealthCheck => pool.health_check().await,
                };

                tracing::event!(
                    name: "tether.pool.maintenance",
                    Level::DEBUG,
                    pool.task = ?task,
                    pool.affected = affected,
                );
            }
        }
    }
}

fn log_eviction(target: &WorkloadId, reason: &'static str) {
    tracing::event!(
        name: "tether.pool.evict",
        Level::INFO,
        pool.target = %target,
        pool.reason = reason,
    );
}

impl<P, C: Connector> Clone for ConnectionPool<P, C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P, C: Connector> fmt::Debug for ConnectionPool<P, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.inner.config)
            .field("total", &self.inner.state.lock().total)
            .finish_non_exhaustive()
    }
}

/// Scoped access to a pooled [`SecureChannel`].
///
/// Dereferences to the channel. Dropping the guard returns the channel to the pool
/// exactly once; channels that became unusable or failed a health check meanwhile
/// are evicted instead.
pub struct PoolGuard<P, C>
where
    P: IdentityProvider,
    C: Connector,
{
    pool: Arc<PoolInner<P, C>>,
    target: WorkloadId,
    id: u64,
    channel: Arc<SecureChannel<P, C>>,
    released: bool,
}

impl<P, C> PoolGuard<P, C>
where
    P: IdentityProvider,
    C: Connector,
{
    /// The channel handed out by the pool.
    #[must_use]
    pub fn channel(&self) -> &SecureChannel<P, C> {
        &self.channel
    }
}

impl<P, C> Deref for PoolGuard<P, C>
where
    P: IdentityProvider,
    C: Connector,
{
    type Target = SecureChannel<P, C>;

    fn deref(&self) -> &Self::Target {
        &self.channel
    }
}

impl<P, C> Drop for PoolGuard<P, C>
where
    P: IdentityProvider,
    C: Connector,
{
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            self.pool.release(&self.target, self.id);
        }
    }
}

impl<P, C> fmt::Debug for PoolGuard<P, C>
where
    P: IdentityProvider,
    C: Connector,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolGuard")
            .field("target", &self.target)
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}
