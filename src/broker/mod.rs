//! Broker orchestration: the single entry point for every mutating
//! operation on pools and sessions.

pub mod reclaimer;

use crate::config::BrokerConfig;
use crate::error::{Error, Result};
use crate::metrics;
use crate::network::protocol::Notification;
use crate::pool::{Handle, Pool, PoolId, RangeAllocator};
use crate::session::{Session, SessionId, SessionRegistry};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// One pending reclaim wait, keyed by `(pool, offset, generation)`.
/// Fired by the victim's voluntary ack; abandoned on timeout.
pub(crate) struct ReclaimWaiter {
    pub owner: SessionId,
    pub tx: oneshot::Sender<()>,
}

pub(crate) type WaiterKey = (PoolId, u64, u64);

/// The server's orchestration core. Owns all pools and sessions; client
/// processes only ever hold session ids and handles.
pub struct Broker {
    pools: Vec<Arc<Pool>>,
    pub(crate) sessions: SessionRegistry,
    pub(crate) waiters: DashMap<WaiterKey, ReclaimWaiter>,
    pub(crate) timing: crate::config::TimingConfig,
    default_quota: Option<u64>,
}

impl Broker {
    pub fn new(pools: Vec<Arc<Pool>>, config: &BrokerConfig) -> Self {
        Self {
            pools,
            sessions: SessionRegistry::new(),
            waiters: DashMap::new(),
            timing: config.timing.clone(),
            default_quota: config.limits.default_quota_bytes,
        }
    }

    /// Build the broker and its pools straight from configuration.
    pub fn from_config(config: &BrokerConfig) -> Result<Self> {
        config.validate()?;
        let pools = config
            .pools
            .iter()
            .enumerate()
            .map(|(i, p)| Arc::new(Pool::new(i as PoolId, p.base_address, p.capacity_bytes)))
            .collect();
        Ok(Self::new(pools, config))
    }

    pub fn pools(&self) -> &[Arc<Pool>] {
        &self.pools
    }

    fn pool_by_id(&self, id: PoolId) -> Result<&Arc<Pool>> {
        self.pools
            .iter()
            .find(|p| p.id() == id)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown pool {id}")))
    }

    fn session(&self, id: SessionId) -> Result<Arc<Session>> {
        match self.sessions.get(id) {
            Some(session) if !session.is_dead() => Ok(session),
            _ => Err(Error::SessionDead(format!("session {id} is not active"))),
        }
    }

    /// Debug builds verify the full pool layout after every mutation; a
    /// violation latches the pool faulted and surfaces as a service-level
    /// fault, never a per-request error code.
    fn check_pool(&self, pool: &Pool, alloc: &RangeAllocator) -> Result<()> {
        if cfg!(debug_assertions) {
            if let Err(e) = alloc.verify() {
                pool.fault();
                error!(pool = pool.id(), "pool invariant violation: {}", e);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Create a session for a newly connected client process.
    pub fn handshake(
        &self,
        process_identity: &str,
        requested_quota: u64,
        notify: mpsc::UnboundedSender<Notification>,
    ) -> Result<Arc<Session>> {
        if process_identity.is_empty() {
            return Err(Error::InvalidArgument(
                "process identity cannot be empty".to_string(),
            ));
        }
        let quota = if requested_quota > 0 {
            Some(requested_quota)
        } else {
            self.default_quota
        };
        let session = Arc::new(Session::new(process_identity.to_string(), quota, notify));
        info!(
            session = %session.id,
            identity = %session.identity,
            quota = ?session.quota,
            "session established"
        );
        self.sessions.insert(session.clone());
        Ok(session)
    }

    pub fn heartbeat(&self, session_id: SessionId) -> Result<()> {
        self.session(session_id)?.touch();
        Ok(())
    }

    /// Allocate `size` bytes at `alignment` for `session_id`.
    ///
    /// Order of attempts: re-acquire one of the session's own Reserved
    /// ranges, then a fresh best-fit grant from any pool, then a single
    /// reclamation pass followed by one retry. No queuing beyond that:
    /// latency stays bounded and the caller decides its own backoff.
    pub async fn allocate(
        &self,
        session_id: SessionId,
        size: u64,
        alignment: u64,
    ) -> Result<Handle> {
        let timer = metrics::ALLOCATION_DURATION.start_timer();
        let result = self.allocate_inner(session_id, size, alignment).await;
        timer.observe_duration();
        if let Err(e) = &result {
            let outcome = match e {
                Error::Exhausted(_) => "exhausted",
                _ => "rejected",
            };
            metrics::ALLOCATIONS_TOTAL.with_label_values(&[outcome]).inc();
        }
        result
    }

    async fn allocate_inner(
        &self,
        session_id: SessionId,
        size: u64,
        alignment: u64,
    ) -> Result<Handle> {
        let session = self.session(session_id)?;
        RangeAllocator::validate_request(size, alignment)?;

        // Most head-room first; pools are fully independent.
        let mut pools = self.pools.clone();
        pools.sort_by_key(|p| std::cmp::Reverse(p.free_bytes()));

        // Fast path: hand back one of the session's own Reserved ranges.
        // No new bytes, so no quota check, and the reclaimer never runs.
        for pool in &pools {
            if pool.is_faulted() {
                continue;
            }
            let mut alloc = pool.lock().await;
            if let Some((offset, generation, len)) = alloc.reacquire(session_id, size, alignment) {
                pool.refresh_counters(&alloc);
                self.check_pool(pool, &alloc)?;
                metrics::ALLOCATIONS_TOTAL.with_label_values(&["reused"]).inc();
                return Ok(Handle {
                    pool: pool.id(),
                    offset,
                    len,
                    generation,
                });
            }
        }

        // Fresh grants add bytes; enforce quota headroom first.
        if session.would_exceed_quota(size) {
            return Err(Error::QuotaExceeded(format!(
                "session {session_id} at {} of {:?} bytes, requested {size} more",
                session.used_bytes(),
                session.quota
            )));
        }

        for pool in &pools {
            if pool.is_faulted() {
                continue;
            }
            let mut alloc = pool.lock().await;
            match alloc.allocate(size, alignment, session_id) {
                Ok((offset, generation)) => {
                    session.add_used(size);
                    pool.refresh_counters(&alloc);
                    self.check_pool(pool, &alloc)?;
                    metrics::ALLOCATIONS_TOTAL.with_label_values(&["granted"]).inc();
                    return Ok(Handle {
                        pool: pool.id(),
                        offset,
                        len: size,
                        generation,
                    });
                }
                Err(Error::Exhausted(_)) => continue,
                Err(e) => return Err(e),
            }
        }

        // Every pool is exhausted. Rank pools by the bytes other sessions
        // hold Reserved there; the requester's own reservations cannot be
        // evicted on its behalf, so they must not steer the pass. One
        // reclamation pass and one retry per candidate, most evictable
        // first.
        let mut targets = Vec::new();
        for pool in &pools {
            if pool.is_faulted() {
                continue;
            }
            let alloc = pool.lock().await;
            let evictable = alloc.reserved_bytes_excluding(session_id);
            if evictable > 0 {
                targets.push((evictable, Arc::clone(pool)));
            }
        }
        targets.sort_by_key(|(evictable, _)| std::cmp::Reverse(*evictable));

        for (_, target) in targets {
            let mut alloc = target.lock().await;
            let freed =
                reclaimer::reclaim(self, &target, &mut alloc, size, alignment, session_id).await;
            debug!(
                pool = target.id(),
                freed, size, "reclamation pass finished"
            );

            // The requester may have died during the bounded wait.
            self.session(session_id)?;

            match alloc.allocate(size, alignment, session_id) {
                Ok((offset, generation)) => {
                    session.add_used(size);
                    target.refresh_counters(&alloc);
                    self.check_pool(&target, &alloc)?;
                    metrics::ALLOCATIONS_TOTAL.with_label_values(&["granted"]).inc();
                    return Ok(Handle {
                        pool: target.id(),
                        offset,
                        len: size,
                        generation,
                    });
                }
                Err(Error::Exhausted(_)) => continue,
                Err(e) => return Err(e),
            }
        }

        Err(Error::Exhausted(format!(
            "no pool can satisfy {size} bytes at alignment {alignment} even after reclamation"
        )))
    }

    fn validate_handle(
        alloc: &RangeAllocator,
        session_id: SessionId,
        handle: &Handle,
    ) -> Result<()> {
        let entry = alloc.get(handle.offset).ok_or_else(|| {
            Error::NotOwner(format!("no live range for handle {handle}"))
        })?;
        if entry.generation != handle.generation {
            return Err(Error::NotOwner(format!(
                "stale handle {handle}: range was reclaimed and re-granted"
            )));
        }
        if entry.owner != session_id {
            return Err(Error::NotOwner(format!(
                "handle {handle} belongs to another session"
            )));
        }
        Ok(())
    }

    /// Release a range back to the broker as Reserved: the session keeps
    /// it (and it keeps counting toward the quota) for cheap
    /// re-acquisition, but it is now an eviction candidate.
    pub async fn release(&self, session_id: SessionId, handle: Handle) -> Result<()> {
        self.session(session_id)?;
        let pool = self.pool_by_id(handle.pool)?.clone();
        if pool.is_faulted() {
            return Err(Error::Internal(format!("pool {} is faulted", pool.id())));
        }
        let mut alloc = pool.lock().await;
        Self::validate_handle(&alloc, session_id, &handle)?;
        alloc.mark_reserved(handle.offset)?;
        pool.refresh_counters(&alloc);
        self.check_pool(&pool, &alloc)?;
        debug!(session = %session_id, %handle, "range released to reserved");
        Ok(())
    }

    /// Release a range straight to Free, relinquishing the re-acquisition
    /// preference.
    pub async fn release_final(&self, session_id: SessionId, handle: Handle) -> Result<()> {
        let session = self.session(session_id)?;
        let pool = self.pool_by_id(handle.pool)?.clone();
        if pool.is_faulted() {
            return Err(Error::Internal(format!("pool {} is faulted", pool.id())));
        }
        let mut alloc = pool.lock().await;
        Self::validate_handle(&alloc, session_id, &handle)?;
        let len = alloc.free(handle.offset)?;
        session.sub_used(len);
        pool.refresh_counters(&alloc);
        self.check_pool(&pool, &alloc)?;
        debug!(session = %session_id, %handle, "range freed");
        Ok(())
    }

    /// Victim's voluntary response to a release request. Never takes a
    /// pool lock: the reclaimer holding that lock is the one waiting on
    /// the other end of the one-shot. A late ack (waiter already gone)
    /// is indistinguishable from silence and ignored.
    pub fn reclaim_ack(&self, session_id: SessionId, handle: Handle) -> Result<()> {
        let key: WaiterKey = (handle.pool, handle.offset, handle.generation);
        if let Some((key, waiter)) = self.waiters.remove(&key) {
            if waiter.owner != session_id {
                self.waiters.insert(key, waiter);
                return Err(Error::Unauthorized(format!(
                    "reclaim ack for {handle} from non-owner session"
                )));
            }
            let _ = waiter.tx.send(());
        }
        Ok(())
    }

    /// Graceful client-requested close.
    pub async fn close_session(&self, session_id: SessionId) -> Result<()> {
        self.session(session_id)?;
        self.kill_session(session_id, "closed by client", false).await;
        Ok(())
    }

    /// Connection teardown without an explicit Close (EOF, I/O error).
    pub async fn disconnect(&self, session_id: SessionId) {
        if self.sessions.get(session_id).is_some() {
            self.kill_session(session_id, "connection lost", false).await;
        }
    }

    /// Transition a session to Dead and atomically return every range it
    /// owns, in every pool, to Free. The one case where Allocated memory
    /// is reclaimed without the owner's cooperation: a dead process can
    /// never release it.
    pub async fn kill_session(&self, session_id: SessionId, reason: &str, notify: bool) {
        let Some(session) = self.sessions.remove(session_id) else {
            return;
        };
        if !session.mark_dead() {
            return;
        }

        let mut freed_ranges = 0usize;
        let mut freed_bytes = 0u64;
        for pool in &self.pools {
            let mut alloc = pool.lock().await;
            for offset in alloc.ranges_owned_by(session_id) {
                match alloc.free(offset) {
                    Ok(len) => {
                        freed_ranges += 1;
                        freed_bytes += len;
                    }
                    Err(e) => warn!(pool = pool.id(), offset, "cleanup free failed: {}", e),
                }
            }
            pool.refresh_counters(&alloc);
        }

        if notify {
            session.try_notify(Notification::SessionClosed {
                reason: reason.to_string(),
            });
        }
        info!(
            session = %session_id,
            identity = %session.identity,
            reason,
            freed_ranges,
            freed_bytes,
            "session closed, ranges reclaimed"
        );
    }

    /// Periodic liveness sweep, decoupled from the request path so a
    /// traffic burst cannot mask a dead peer.
    pub fn spawn_liveness_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let broker = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(broker.timing.heartbeat_interval());
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                for session in broker.sessions.expired(broker.timing.heartbeat_timeout()) {
                    warn!(
                        session = %session.id,
                        identity = %session.identity,
                        idle = ?session.since_heartbeat(),
                        "heartbeat timeout"
                    );
                    metrics::SESSIONS_EXPIRED_TOTAL.inc();
                    broker
                        .kill_session(session.id, "heartbeat timeout", true)
                        .await;
                }
            }
        })
    }

    /// Read-only snapshot for operators; never takes a pool lock.
    pub fn stats(&self) -> BrokerStats {
        let pools = self
            .pools
            .iter()
            .map(|p| PoolStats {
                id: p.id(),
                capacity_bytes: p.capacity(),
                allocated_bytes: p.allocated_bytes(),
                reserved_bytes: p.reserved_bytes(),
                free_bytes: p.free_bytes(),
                utilization: p.utilization(),
                faulted: p.is_faulted(),
            })
            .collect();
        let sessions = self
            .sessions
            .snapshot()
            .into_iter()
            .map(|s| SessionStats {
                session_id: s.id,
                identity: s.identity.clone(),
                used_bytes: s.used_bytes(),
                quota_bytes: s.quota,
                state: format!("{:?}", s.state()),
            })
            .collect();
        BrokerStats {
            server_version: crate::VERSION.to_string(),
            pools,
            sessions,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStats {
    pub id: PoolId,
    pub capacity_bytes: u64,
    pub allocated_bytes: u64,
    pub reserved_bytes: u64,
    pub free_bytes: u64,
    pub utilization: f64,
    pub faulted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStats {
    pub session_id: SessionId,
    pub identity: String,
    pub used_bytes: u64,
    pub quota_bytes: Option<u64>,
    pub state: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerStats {
    pub server_version: String,
    pub pools: Vec<PoolStats>,
    pub sessions: Vec<SessionStats>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BrokerConfig, PoolConfig};
    use tokio::sync::mpsc::UnboundedReceiver;

    fn test_config(capacity: u64, release_timeout_ms: u64) -> BrokerConfig {
        let mut cfg = BrokerConfig {
            pools: vec![PoolConfig {
                capacity_bytes: capacity,
                base_address: 0,
            }],
            ..Default::default()
        };
        cfg.timing.release_timeout_ms = release_timeout_ms;
        cfg
    }

    fn broker(capacity: u64) -> Broker {
        Broker::from_config(&test_config(capacity, 30)).unwrap()
    }

    fn join(
        broker: &Broker,
        identity: &str,
        quota: u64,
    ) -> (SessionId, UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = broker.handshake(identity, quota, tx).unwrap();
        (session.id, rx)
    }

    #[tokio::test]
    async fn test_allocate_and_release_final() {
        let broker = broker(4096);
        let (a, _rx) = join(&broker, "proc-a", 0);

        let handle = broker.allocate(a, 1024, 256).await.unwrap();
        assert_eq!(handle.len, 1024);
        assert_eq!(handle.offset % 256, 0);
        assert_eq!(broker.pools()[0].allocated_bytes(), 1024);

        broker.release_final(a, handle).await.unwrap();
        assert_eq!(broker.pools()[0].allocated_bytes(), 0);
        assert_eq!(broker.pools()[0].free_bytes(), 4096);
    }

    #[tokio::test]
    async fn test_release_roundtrip_skips_reclaimer() {
        let broker = broker(8192);
        let (a, mut rx) = join(&broker, "proc-a", 0);

        let h1 = broker.allocate(a, 4096, 256).await.unwrap();
        broker.release(a, h1).await.unwrap();
        assert_eq!(broker.pools()[0].reserved_bytes(), 4096);

        // Re-acquisition hands back the same range without any eviction
        // traffic.
        let h2 = broker.allocate(a, 4096, 256).await.unwrap();
        assert_eq!(h2.offset, h1.offset);
        assert!(h2.generation > h1.generation);
        assert!(rx.try_recv().is_err(), "no reclaim notification expected");
    }

    #[tokio::test]
    async fn test_stale_handle_rejected_after_reacquire() {
        let broker = broker(8192);
        let (a, _rx) = join(&broker, "proc-a", 0);

        let h1 = broker.allocate(a, 1024, 1).await.unwrap();
        broker.release(a, h1).await.unwrap();
        let _h2 = broker.allocate(a, 1024, 1).await.unwrap();

        // h1's generation died with the re-grant.
        let err = broker.release(a, h1).await.unwrap_err();
        assert!(matches!(err, Error::NotOwner(_)));
    }

    #[tokio::test]
    async fn test_quota_enforcement() {
        let broker = broker(1 << 20);
        let (a, _rx) = join(&broker, "proc-a", 1000);

        let h = broker.allocate(a, 600, 1).await.unwrap();
        let err = broker.allocate(a, 401, 1).await.unwrap_err();
        assert!(matches!(err, Error::QuotaExceeded(_)));

        // Reserved bytes still count toward the quota: 600 Reserved plus
        // 250 Allocated leaves no headroom for another 250.
        broker.release(a, h).await.unwrap();
        let _h250 = broker.allocate(a, 250, 1).await.unwrap();
        let err = broker.allocate(a, 250, 1).await.unwrap_err();
        assert!(matches!(err, Error::QuotaExceeded(_)));

        // Re-acquiring the Reserved range adds no bytes, so it is always
        // allowed regardless of headroom.
        let h2 = broker.allocate(a, 600, 1).await.unwrap();
        assert_eq!(h2.offset, h.offset);
    }

    #[tokio::test]
    async fn test_forced_reclaim_scenario() {
        // Pool 1000: A reserves 600, B wants 500 -> A's range is evicted.
        let broker = broker(1000);
        let (a, mut a_rx) = join(&broker, "proc-a", 0);
        let (b, _b_rx) = join(&broker, "proc-b", 0);

        let ha = broker.allocate(a, 600, 1).await.unwrap();
        broker.release(a, ha).await.unwrap();

        let hb = broker.allocate(b, 500, 1).await.unwrap();
        assert!(hb.offset + hb.len <= 1000);
        assert_eq!(broker.pools()[0].reserved_bytes(), 0);

        // A was asked first, even though it never answered.
        match a_rx.try_recv().unwrap() {
            Notification::ReleaseRequest { handle, .. } => assert_eq!(handle.offset, ha.offset),
            other => panic!("unexpected notification: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_reclaim_skips_pools_where_only_requester_reserved() {
        // Two pools (1000 / 1600). B parks 1500 Reserved in the big pool;
        // that reservation cannot be evicted on B's own behalf, so it must
        // not attract the reclamation pass. Once C pins all remaining free
        // space, A's 600 Reserved bytes in the small pool are the only
        // evictable memory anywhere.
        let mut cfg = test_config(1000, 30);
        cfg.pools.push(PoolConfig {
            capacity_bytes: 1600,
            base_address: 0x10000,
        });
        let broker = Broker::from_config(&cfg).unwrap();
        let (a, mut a_rx) = join(&broker, "proc-a", 0);
        let (b, _b_rx) = join(&broker, "proc-b", 0);
        let (c, _c_rx) = join(&broker, "proc-c", 0);

        let hb = broker.allocate(b, 1500, 1).await.unwrap();
        broker.release(b, hb).await.unwrap();
        let ha = broker.allocate(a, 600, 1).await.unwrap();
        broker.release(a, ha).await.unwrap();
        let _c1 = broker.allocate(c, 400, 1).await.unwrap();
        let _c2 = broker.allocate(c, 100, 1).await.unwrap();

        // 1500 > 2 * 500, so B's own reservation is no shortcut either.
        let granted = broker.allocate(b, 500, 1).await.unwrap();
        assert_eq!(granted.pool, ha.pool);
        assert!(matches!(
            a_rx.try_recv(),
            Ok(Notification::ReleaseRequest { .. })
        ));
    }

    #[tokio::test]
    async fn test_exhaustion_with_live_memory() {
        // All 1000 bytes Allocated (not Reserved): nothing is evictable,
        // and live memory is never forcibly taken from a live session.
        let broker = broker(1000);
        let (a, _a_rx) = join(&broker, "proc-a", 0);
        let (b, _b_rx) = join(&broker, "proc-b", 0);

        let _ha = broker.allocate(a, 1000, 1).await.unwrap();
        let err = broker.allocate(b, 1, 1).await.unwrap_err();
        assert!(matches!(err, Error::Exhausted(_)));
        assert_eq!(broker.pools()[0].allocated_bytes(), 1000);
    }

    #[tokio::test]
    async fn test_voluntary_ack_short_circuits_the_wait() {
        // Long release timeout; the ack must complete the reclaim early.
        let mut cfg = test_config(1000, 5_000);
        cfg.timing.heartbeat_timeout_ms = 60_000;
        let broker = Arc::new(Broker::from_config(&cfg).unwrap());
        let (a, mut a_rx) = join(&broker, "proc-a", 0);
        let (b, _b_rx) = join(&broker, "proc-b", 0);

        let ha = broker.allocate(a, 600, 1).await.unwrap();
        broker.release(a, ha).await.unwrap();

        // A cooperates: ack as soon as the release request arrives.
        let acker = {
            let broker = broker.clone();
            tokio::spawn(async move {
                if let Some(Notification::ReleaseRequest { handle, .. }) = a_rx.recv().await {
                    broker.reclaim_ack(a, handle).unwrap();
                }
            })
        };

        let start = std::time::Instant::now();
        let hb = broker.allocate(b, 500, 1).await.unwrap();
        assert!(start.elapsed() < std::time::Duration::from_secs(2));
        assert_eq!(hb.len, 500);
        acker.await.unwrap();
    }

    #[tokio::test]
    async fn test_eviction_order_longest_idle_first() {
        let broker = broker(2000);
        let (a, mut a_rx) = join(&broker, "proc-a", 0);
        let (b, mut b_rx) = join(&broker, "proc-b", 0);
        let (c, _c_rx) = join(&broker, "proc-c", 0);

        let ha = broker.allocate(a, 800, 1).await.unwrap();
        let hb = broker.allocate(b, 800, 1).await.unwrap();
        broker.release(a, ha).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        broker.release(b, hb).await.unwrap();

        // 500 fits in either victim; A's range has been idle longer.
        let _hc = broker.allocate(c, 500, 1).await.unwrap();
        assert!(a_rx.try_recv().is_ok(), "longest-idle victim notified");
        assert!(b_rx.try_recv().is_err(), "newer reservation untouched");
    }

    #[tokio::test]
    async fn test_crash_reclamation() {
        let broker = broker(4096);
        let (a, _a_rx) = join(&broker, "proc-a", 0);
        let (b, _b_rx) = join(&broker, "proc-b", 0);

        let _h1 = broker.allocate(a, 1024, 1).await.unwrap();
        let h2 = broker.allocate(a, 512, 1).await.unwrap();
        broker.release(a, h2).await.unwrap();
        let hb = broker.allocate(b, 256, 1).await.unwrap();

        broker.kill_session(a, "test crash", false).await;

        // Every range of A is free again; B is untouched.
        assert_eq!(broker.pools()[0].allocated_bytes(), 256);
        assert_eq!(broker.pools()[0].reserved_bytes(), 0);
        broker.release_final(b, hb).await.unwrap();

        // Operations on the dead session fail fast.
        let err = broker.allocate(a, 16, 1).await.unwrap_err();
        assert!(matches!(err, Error::SessionDead(_)));
    }

    #[tokio::test]
    async fn test_zero_size_and_bad_alignment() {
        let broker = broker(4096);
        let (a, _rx) = join(&broker, "proc-a", 0);
        assert!(matches!(
            broker.allocate(a, 0, 1).await.unwrap_err(),
            Error::InvalidArgument(_)
        ));
        assert!(matches!(
            broker.allocate(a, 64, 3).await.unwrap_err(),
            Error::InvalidArgument(_)
        ));
    }

    #[tokio::test]
    async fn test_release_by_non_owner() {
        let broker = broker(4096);
        let (a, _a_rx) = join(&broker, "proc-a", 0);
        let (b, _b_rx) = join(&broker, "proc-b", 0);

        let ha = broker.allocate(a, 1024, 1).await.unwrap();
        let err = broker.release(b, ha).await.unwrap_err();
        assert!(matches!(err, Error::NotOwner(_)));
    }

    #[tokio::test]
    async fn test_stats_snapshot() {
        let broker = broker(4096);
        let (a, _rx) = join(&broker, "proc-a", 2048);
        let _h = broker.allocate(a, 1024, 1).await.unwrap();

        let stats = broker.stats();
        assert_eq!(stats.pools.len(), 1);
        assert_eq!(stats.pools[0].allocated_bytes, 1024);
        assert_eq!(stats.pools[0].utilization, 0.25);
        assert_eq!(stats.sessions.len(), 1);
        assert_eq!(stats.sessions[0].used_bytes, 1024);
        assert_eq!(stats.sessions[0].quota_bytes, Some(2048));
    }

    #[tokio::test]
    async fn test_liveness_sweeper_reclaims_dead_session() {
        let mut cfg = test_config(4096, 30);
        cfg.timing.heartbeat_interval_ms = 20;
        cfg.timing.heartbeat_timeout_ms = 80;
        let broker = Arc::new(Broker::from_config(&cfg).unwrap());
        let sweeper = broker.spawn_liveness_sweeper();

        let (a, mut a_rx) = join(&broker, "proc-a", 0);
        let _h = broker.allocate(a, 1024, 1).await.unwrap();

        // Never heartbeat; the sweeper must kill the session.
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        assert_eq!(broker.pools()[0].allocated_bytes(), 0);
        assert!(matches!(
            a_rx.try_recv(),
            Ok(Notification::SessionClosed { .. })
        ));
        sweeper.abort();
    }
}
