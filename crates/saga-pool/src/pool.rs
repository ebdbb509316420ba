use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use saga_core::settings::PoolSettings;
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::PoolError;
use crate::manager::{Health, Manager};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    pub min_size: u32,
    pub max_size: u32,
    /// Idle entries untouched this long are evicted (above `min_size`) or
    /// probed (at `min_size`) by the sweep.
    pub idle_timeout: Duration,
    /// Default wait used by [`Pool::get`].
    pub connection_timeout: Duration,
    pub health_check_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::from(&PoolSettings::default())
    }
}

impl From<&PoolSettings> for PoolConfig {
    fn from(s: &PoolSettings) -> Self {
        Self {
            min_size: s.min_size,
            max_size: s.max_size,
            idle_timeout: s.idle_timeout(),
            connection_timeout: s.connection_timeout(),
            health_check_interval: s.health_check_interval(),
        }
    }
}

impl PoolConfig {
    fn validate(&self) -> Result<(), PoolError> {
        if self.max_size == 0 {
            return Err(PoolError::InvalidConfig("max_size must be at least 1".into()));
        }
        if self.min_size > self.max_size {
            return Err(PoolError::InvalidConfig(format!(
                "min_size {} exceeds max_size {}",
                self.min_size, self.max_size
            )));
        }
        Ok(())
    }
}

/// Read-only pool snapshot.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct PoolMetrics {
    pub total: u32,
    pub in_use: u32,
    pub idle: u32,
    pub min_size: u32,
    pub max_size: u32,
    pub created: u64,
    pub dead_replaced: u64,
    pub evicted: u64,
    pub timeouts: u64,
    pub avg_wait_ms: f64,
}

/// Outcome of one health sweep.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub probed: u32,
    pub evicted: u32,
    pub dead: u32,
    pub replenished: u32,
}

struct Entry<C> {
    id: u64,
    conn: C,
    created_at: Instant,
    last_used_at: Instant,
    health: Health,
}

struct Inner<M: Manager> {
    manager: M,
    config: PoolConfig,
    idle: Mutex<VecDeque<Entry<M::Connection>>>,
    /// One permit per concurrent holder (leases and the sweep).
    permits: Arc<Semaphore>,
    /// Live entries, idle or leased. Reserved before connecting.
    total: AtomicU32,
    in_use: AtomicU32,
    next_id: AtomicU64,
    created: AtomicU64,
    dead_replaced: AtomicU64,
    evicted: AtomicU64,
    timeouts: AtomicU64,
    waits: AtomicU64,
    wait_micros: AtomicU64,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

/// Shared handle to a pool. Cloning is cheap.
pub struct Pool<M: Manager> {
    inner: Arc<Inner<M>>,
}

impl<M: Manager> Clone for Pool<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M: Manager> Pool<M> {
    /// Build the pool and open `min_size` connections up front.
    pub async fn open(manager: M, config: PoolConfig) -> Result<Self, PoolError> {
        config.validate()?;
        let inner = Arc::new(Inner {
            manager,
            permits: Arc::new(Semaphore::new(config.max_size as usize)),
            config,
            idle: Mutex::new(VecDeque::new()),
            total: AtomicU32::new(0),
            in_use: AtomicU32::new(0),
            next_id: AtomicU64::new(1),
            created: AtomicU64::new(0),
            dead_replaced: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            waits: AtomicU64::new(0),
            wait_micros: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        });
        while inner.total.load(Ordering::Acquire) < inner.config.min_size {
            if !inner.reserve_slot() {
                break;
            }
            match inner.manager.connect().await {
                Ok(conn) => {
                    let entry = inner.new_entry(conn);
                    inner.idle.lock().push_back(entry);
                }
                Err(e) => {
                    inner.total.fetch_sub(1, Ordering::AcqRel);
                    return Err(e);
                }
            }
        }
        debug!(
            min = inner.config.min_size,
            max = inner.config.max_size,
            "pool opened"
        );
        Ok(Self { inner })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn manager(&self) -> &M {
        &self.inner.manager
    }

    /// Acquire with the configured connection timeout.
    pub async fn get(&self) -> Result<Lease<M>, PoolError> {
        self.acquire(self.inner.config.connection_timeout).await
    }

    /// Wait up to `timeout` for a healthy entry. Only the calling task
    /// waits. Never hands out a degraded or dead entry.
    pub async fn acquire(&self, timeout: Duration) -> Result<Lease<M>, PoolError> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(PoolError::Closed);
        }
        let started = Instant::now();
        let deadline = started + timeout;

        let permit = match tokio::time::timeout_at(
            deadline,
            Arc::clone(&inner.permits).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(PoolError::Closed),
            Err(_) => return Err(inner.timed_out(timeout)),
        };

        let entry = loop {
            if inner.closed.load(Ordering::Acquire) {
                return Err(PoolError::Closed);
            }
            let popped = inner.idle.lock().pop_back();
            if let Some(mut entry) = popped {
                match entry.health {
                    Health::Healthy => break entry,
                    Health::Degraded => {
                        if inner.manager.probe(&mut entry.conn).await {
                            entry.health = Health::Healthy;
                            break entry;
                        }
                        entry.health = Health::Dead;
                        inner.dispose(entry, "failed probe on acquire");
                        inner.dead_replaced.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                    Health::Dead => {
                        inner.dispose(entry, "dead in idle set");
                        continue;
                    }
                }
            }
            if inner.reserve_slot() {
                match tokio::time::timeout_at(deadline, inner.manager.connect()).await {
                    Ok(Ok(conn)) => break inner.new_entry(conn),
                    Ok(Err(e)) => {
                        inner.total.fetch_sub(1, Ordering::AcqRel);
                        return Err(e);
                    }
                    Err(_) => {
                        inner.total.fetch_sub(1, Ordering::AcqRel);
                        return Err(inner.timed_out(timeout));
                    }
                }
            }
            // At capacity with every slot accounted for, so an entry is on
            // its way back to the idle set.
            if Instant::now() >= deadline {
                return Err(inner.timed_out(timeout));
            }
            tokio::task::yield_now().await;
        };

        inner.in_use.fetch_add(1, Ordering::AcqRel);
        inner.waits.fetch_add(1, Ordering::Relaxed);
        inner
            .wait_micros
            .fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);

        Ok(Lease {
            entry: Some(entry),
            pool: Arc::clone(inner),
            _permit: permit,
        })
    }

    /// Return a lease explicitly. Equivalent to dropping it.
    pub fn release(&self, lease: Lease<M>) {
        drop(lease);
    }

    /// Probe or evict stale idle entries, one at a time, then top the pool
    /// back up to `min_size`.
    #[instrument(skip(self))]
    pub async fn sweep_once(&self) -> SweepReport {
        let inner = &self.inner;
        let mut report = SweepReport::default();
        let candidates = inner.idle.lock().len();

        for _ in 0..candidates {
            if inner.closed.load(Ordering::Acquire) {
                return report;
            }
            // Holding a permit keeps pool size bounded while the entry is
            // out of the idle set.
            let permit = match Arc::clone(&inner.permits).try_acquire_owned() {
                Ok(p) => p,
                Err(_) => break,
            };
            let Some(mut entry) = inner.idle.lock().pop_front() else {
                break;
            };
            let stale = entry.last_used_at.elapsed() >= inner.config.idle_timeout;
            if !stale && entry.health == Health::Healthy {
                inner.idle.lock().push_back(entry);
                drop(permit);
                continue;
            }
            if stale
                && entry.health == Health::Healthy
                && inner.total.load(Ordering::Acquire) > inner.config.min_size
            {
                inner.dispose(entry, "idle timeout");
                inner.evicted.fetch_add(1, Ordering::Relaxed);
                report.evicted += 1;
                drop(permit);
                continue;
            }
            report.probed += 1;
            if entry.health != Health::Dead && inner.manager.probe(&mut entry.conn).await {
                entry.health = Health::Healthy;
                entry.last_used_at = Instant::now();
                inner.idle.lock().push_back(entry);
            } else {
                entry.health = Health::Dead;
                inner.dispose(entry, "failed health probe");
                inner.dead_replaced.fetch_add(1, Ordering::Relaxed);
                report.dead += 1;
            }
            drop(permit);
        }

        report.replenished = replenish(inner).await;
        if report != SweepReport::default() {
            debug!(?report, "health sweep");
        }
        report
    }

    /// Run [`Pool::sweep_once`] every `health_check_interval` until
    /// [`Pool::close`].
    pub fn spawn_health_sweep(&self) -> JoinHandle<()> {
        let pool = self.clone();
        let shutdown = self.inner.shutdown.clone();
        let period = self.inner.config.health_check_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let _ = pool.sweep_once().await;
                    }
                }
            }
            debug!("health sweep stopped");
        })
    }

    /// Stop handing out leases and drop every idle entry. Leases still out
    /// are disposed when they come back.
    pub fn close(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        inner.shutdown.cancel();
        inner.permits.close();
        let drained: Vec<_> = inner.idle.lock().drain(..).collect();
        let count = drained.len();
        for entry in drained {
            inner.dispose(entry, "pool closed");
        }
        info!(drained = count, "pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn metrics(&self) -> PoolMetrics {
        let inner = &self.inner;
        let waits = inner.waits.load(Ordering::Relaxed);
        let avg_wait_ms = if waits == 0 {
            0.0
        } else {
            inner.wait_micros.load(Ordering::Relaxed) as f64 / waits as f64 / 1000.0
        };
        PoolMetrics {
            total: inner.total.load(Ordering::Acquire),
            in_use: inner.in_use.load(Ordering::Acquire),
            idle: inner.idle.lock().len() as u32,
            min_size: inner.config.min_size,
            max_size: inner.config.max_size,
            created: inner.created.load(Ordering::Relaxed),
            dead_replaced: inner.dead_replaced.load(Ordering::Relaxed),
            evicted: inner.evicted.load(Ordering::Relaxed),
            timeouts: inner.timeouts.load(Ordering::Relaxed),
            avg_wait_ms,
        }
    }
}

impl<M: Manager> Inner<M> {
    /// Claim room for one more entry if below `max_size`.
    fn reserve_slot(&self) -> bool {
        self.total
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.config.max_size).then_some(n + 1)
            })
            .is_ok()
    }

    fn new_entry(&self, conn: M::Connection) -> Entry<M::Connection> {
        let now = Instant::now();
        self.created.fetch_add(1, Ordering::Relaxed);
        Entry {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            conn,
            created_at: now,
            last_used_at: now,
            health: Health::Healthy,
        }
    }

    fn dispose(&self, entry: Entry<M::Connection>, reason: &'static str) {
        self.total.fetch_sub(1, Ordering::AcqRel);
        if entry.health == Health::Dead {
            info!(
                entry = entry.id,
                age_ms = entry.created_at.elapsed().as_millis() as u64,
                reason,
                "disposing pool entry"
            );
        } else {
            debug!(entry = entry.id, reason, "disposing pool entry");
        }
    }

    fn timed_out(&self, timeout: Duration) -> PoolError {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
        warn!(
            timeout_ms = timeout.as_millis() as u64,
            in_use = self.in_use.load(Ordering::Relaxed),
            max = self.config.max_size,
            "pool exhausted"
        );
        PoolError::Timeout(timeout)
    }
}

/// Open connections until `min_size` is reached or no permit is free.
async fn replenish<M: Manager>(inner: &Arc<Inner<M>>) -> u32 {
    let mut opened = 0;
    while !inner.closed.load(Ordering::Acquire)
        && inner.total.load(Ordering::Acquire) < inner.config.min_size
    {
        let permit = match Arc::clone(&inner.permits).try_acquire_owned() {
            Ok(p) => p,
            Err(TryAcquireError::NoPermits | TryAcquireError::Closed) => break,
        };
        if !inner.reserve_slot() {
            break;
        }
        match inner.manager.connect().await {
            Ok(conn) => {
                let entry = inner.new_entry(conn);
                inner.idle.lock().push_back(entry);
                opened += 1;
            }
            Err(e) => {
                inner.total.fetch_sub(1, Ordering::AcqRel);
                warn!(error = %e, "failed to replenish pool");
                break;
            }
        }
        drop(permit);
    }
    opened
}

/// Exclusive use of one pooled handle. Dropping the lease returns the handle
/// to the pool, or disposes it if it was marked dead.
pub struct Lease<M: Manager> {
    entry: Option<Entry<M::Connection>>,
    pool: Arc<Inner<M>>,
    // Released after the entry is back in the idle set.
    _permit: OwnedSemaphorePermit,
}

impl<M: Manager> Lease<M> {
    fn entry(&self) -> &Entry<M::Connection> {
        match &self.entry {
            Some(e) => e,
            None => unreachable!("lease entry is only taken on drop"),
        }
    }

    fn entry_mut(&mut self) -> &mut Entry<M::Connection> {
        match &mut self.entry {
            Some(e) => e,
            None => unreachable!("lease entry is only taken on drop"),
        }
    }

    pub fn id(&self) -> u64 {
        self.entry().id
    }

    pub fn health(&self) -> Health {
        self.entry().health
    }

    /// Dispose on release and replace up to `min_size`.
    pub fn mark_dead(&mut self) {
        self.entry_mut().health = Health::Dead;
    }

    /// Return to the pool, but probe before the next hand-out.
    pub fn mark_degraded(&mut self) {
        let entry = self.entry_mut();
        if entry.health == Health::Healthy {
            entry.health = Health::Degraded;
        }
    }
}

impl<M: Manager> Deref for Lease<M> {
    type Target = M::Connection;

    fn deref(&self) -> &Self::Target {
        &self.entry().conn
    }
}

impl<M: Manager> DerefMut for Lease<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.entry_mut().conn
    }
}

impl<M: Manager> Drop for Lease<M> {
    fn drop(&mut self) {
        let Some(mut entry) = self.entry.take() else {
            return;
        };
        let pool = &self.pool;
        pool.in_use.fetch_sub(1, Ordering::AcqRel);

        if pool.closed.load(Ordering::Acquire) {
            pool.dispose(entry, "pool closed");
            return;
        }
        if entry.health == Health::Dead {
            pool.dispose(entry, "marked dead");
            pool.dead_replaced.fetch_add(1, Ordering::Relaxed);
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let pool = Arc::clone(pool);
                drop(handle.spawn(async move {
                    let _ = replenish(&pool).await;
                }));
            }
            return;
        }
        entry.last_used_at = Instant::now();
        pool.idle.lock().push_back(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct FakeManager {
        opened: AtomicU64,
        fail_probe: AtomicBool,
        fail_connect: AtomicBool,
    }

    struct FakeConn {
        serial: u64,
    }

    #[async_trait]
    impl Manager for FakeManager {
        type Connection = FakeConn;

        async fn connect(&self) -> Result<FakeConn, PoolError> {
            if self.fail_connect.load(Ordering::SeqCst) {
                return Err(PoolError::Connect("refused".into()));
            }
            Ok(FakeConn {
                serial: self.opened.fetch_add(1, Ordering::SeqCst) + 1,
            })
        }

        async fn probe(&self, _conn: &mut FakeConn) -> bool {
            !self.fail_probe.load(Ordering::SeqCst)
        }
    }

    fn config(min: u32, max: u32) -> PoolConfig {
        PoolConfig {
            min_size: min,
            max_size: max,
            idle_timeout: Duration::from_secs(1),
            connection_timeout: Duration::from_millis(100),
            health_check_interval: Duration::from_millis(500),
        }
    }

    async fn pool(min: u32, max: u32) -> Pool<FakeManager> {
        Pool::open(FakeManager::default(), config(min, max)).await.unwrap()
    }

    #[tokio::test]
    async fn open_warms_to_min() {
        let pool = pool(2, 4).await;
        let m = pool.metrics();
        assert_eq!(m.total, 2);
        assert_eq!(m.idle, 2);
        assert_eq!(m.in_use, 0);
    }

    #[tokio::test]
    async fn open_rejects_bad_config() {
        let err = Pool::open(FakeManager::default(), config(3, 2)).await.err().unwrap();
        assert!(matches!(err, PoolError::InvalidConfig(_)));
        let err = Pool::open(FakeManager::default(), config(0, 0)).await.err().unwrap();
        assert!(matches!(err, PoolError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn open_fails_when_backend_unreachable() {
        let manager = FakeManager::default();
        manager.fail_connect.store(true, Ordering::SeqCst);
        let err = Pool::open(manager, config(1, 2)).await.err().unwrap();
        assert!(matches!(err, PoolError::Connect(_)));
    }

    #[tokio::test]
    async fn lease_returns_to_idle_on_drop() {
        let pool = pool(1, 2).await;
        let lease = pool.get().await.unwrap();
        let id = lease.id();
        assert_eq!(pool.metrics().in_use, 1);
        pool.release(lease);
        let m = pool.metrics();
        assert_eq!(m.in_use, 0);
        assert_eq!(m.idle, 1);
        let again = pool.get().await.unwrap();
        assert_eq!(again.id(), id);
    }

    #[tokio::test(start_paused = true)]
    async fn max_two_third_acquire_times_out() {
        let pool = pool(0, 2).await;
        let a = pool.acquire(Duration::from_millis(100)).await.unwrap();
        let b = pool.acquire(Duration::from_millis(100)).await.unwrap();
        assert_eq!(pool.metrics().in_use, 2);

        let started = Instant::now();
        let err = pool.acquire(Duration::from_millis(100)).await.err().unwrap();
        assert!(matches!(err, PoolError::Timeout(_)));
        assert!(err.is_retryable());
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(pool.metrics().total, 2);
        assert_eq!(pool.metrics().timeouts, 1);
        drop((a, b));
    }

    #[tokio::test(start_paused = true)]
    async fn max_two_third_acquire_waits_for_release() {
        let pool = pool(0, 2).await;
        let a = pool.acquire(Duration::from_millis(100)).await.unwrap();
        let _b = pool.acquire(Duration::from_millis(100)).await.unwrap();

        let releaser = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(a);
        });
        let c = pool.acquire(Duration::from_millis(100)).await.unwrap();
        releaser.await.unwrap();
        assert_eq!(pool.metrics().in_use, 2);
        assert_eq!(pool.metrics().total, 2);
        drop(c);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_leases_never_exceed_max() {
        let pool = pool(1, 3).await;
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for i in 0..24u64 {
            let pool = pool.clone();
            let current = Arc::clone(&current);
            let peak = Arc::clone(&peak);
            tasks.push(tokio::spawn(async move {
                let lease = pool.acquire(Duration::from_secs(10)).await.unwrap();
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(1 + i % 5)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                drop(lease);
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 3);
        let m = pool.metrics();
        assert!(m.total <= 3);
        assert_eq!(m.in_use, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dead_lease_is_disposed_and_replaced() {
        let pool = pool(1, 2).await;
        let mut lease = pool.get().await.unwrap();
        let dead_serial = lease.serial;
        lease.mark_dead();
        drop(lease);

        tokio::time::sleep(Duration::from_millis(1)).await;
        let m = pool.metrics();
        assert_eq!(m.dead_replaced, 1);
        assert_eq!(m.total, 1);

        let fresh = pool.get().await.unwrap();
        assert_ne!(fresh.serial, dead_serial);
    }

    #[tokio::test]
    async fn degraded_entry_probed_before_reuse() {
        let pool = pool(1, 2).await;
        let mut lease = pool.get().await.unwrap();
        let first = lease.serial;
        lease.mark_degraded();
        drop(lease);

        pool.manager().fail_probe.store(true, Ordering::SeqCst);
        let next = pool.get().await.unwrap();
        assert_ne!(next.serial, first);
        assert_eq!(next.health(), Health::Healthy);
        assert_eq!(pool.metrics().dead_replaced, 1);
    }

    #[tokio::test]
    async fn degraded_entry_reused_when_probe_passes() {
        let pool = pool(1, 2).await;
        let mut lease = pool.get().await.unwrap();
        let first = lease.serial;
        lease.mark_degraded();
        drop(lease);

        let next = pool.get().await.unwrap();
        assert_eq!(next.serial, first);
        assert_eq!(next.health(), Health::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_evicts_stale_entries_down_to_min() {
        let pool = pool(1, 4).await;
        let leases = vec![
            pool.get().await.unwrap(),
            pool.get().await.unwrap(),
            pool.get().await.unwrap(),
        ];
        drop(leases);
        assert_eq!(pool.metrics().idle, 3);

        tokio::time::advance(Duration::from_secs(2)).await;
        let report = pool.sweep_once().await;
        assert_eq!(report.evicted, 2);
        assert_eq!(report.probed, 1);
        assert_eq!(report.dead, 0);
        let m = pool.metrics();
        assert_eq!(m.total, 1);
        assert_eq!(m.evicted, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_replaces_entries_that_fail_probe() {
        let pool = pool(1, 2).await;
        tokio::time::advance(Duration::from_secs(2)).await;
        pool.manager().fail_probe.store(true, Ordering::SeqCst);

        let report = pool.sweep_once().await;
        assert_eq!(report.dead, 1);
        assert_eq!(report.replenished, 1);
        let m = pool.metrics();
        assert_eq!(m.total, 1);
        assert_eq!(m.dead_replaced, 1);
        assert_eq!(pool.manager().opened.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_leaves_fresh_entries_alone() {
        let pool = pool(2, 4).await;
        let report = pool.sweep_once().await;
        assert_eq!(report, SweepReport::default());
        assert_eq!(pool.metrics().total, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_skips_when_all_permits_taken() {
        let pool = pool(0, 1).await;
        let lease = pool.get().await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        let report = pool.sweep_once().await;
        assert_eq!(report, SweepReport::default());
        drop(lease);
    }

    #[tokio::test(start_paused = true)]
    async fn background_sweep_runs_until_close() {
        let pool = pool(1, 3).await;
        let extra = vec![pool.get().await.unwrap(), pool.get().await.unwrap()];
        drop(extra);
        let handle = pool.spawn_health_sweep();

        tokio::time::sleep(Duration::from_millis(1600)).await;
        assert_eq!(pool.metrics().total, 1);

        pool.close();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn close_drains_and_rejects() {
        let pool = pool(2, 3).await;
        let outstanding = pool.get().await.unwrap();
        pool.close();
        assert!(pool.is_closed());
        assert_eq!(pool.metrics().idle, 0);
        assert_eq!(pool.metrics().total, 1);

        assert!(matches!(pool.get().await, Err(PoolError::Closed)));
        drop(outstanding);
        assert_eq!(pool.metrics().total, 0);
    }

    #[tokio::test]
    async fn metrics_track_waits() {
        let pool = pool(1, 1).await;
        drop(pool.get().await.unwrap());
        drop(pool.get().await.unwrap());
        let m = pool.metrics();
        assert_eq!(m.created, 1);
        assert!(m.avg_wait_ms >= 0.0);
        let json = serde_json::to_value(&m).unwrap();
        assert_eq!(json["max_size"], 1);
    }
}
