//! Eviction of Reserved ranges to satisfy a pending allocation.
//!
//! Runs with the target pool's lock already held by the allocate path.
//! Victims are asked to release voluntarily and given a bounded wait; a
//! victim that stays silent past the deadline loses the range anyway. A
//! process that marked memory idle and cannot answer within tens of
//! milliseconds has no pending use for it. At most one round trip per
//! victim, never an open-ended negotiation.

use super::{Broker, ReclaimWaiter, WaiterKey};
use crate::metrics;
use crate::network::protocol::Notification;
use crate::pool::{Handle, Pool, RangeAllocator};
use crate::session::SessionId;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

/// Free Reserved ranges in `pool` until `size` bytes at `alignment` fit,
/// longest-idle victims first, excluding the requester's own ranges.
/// Returns the number of bytes freed, which may fall short of the target;
/// the caller's retry then fails as Exhausted.
pub(crate) async fn reclaim(
    broker: &Broker,
    pool: &Pool,
    alloc: &mut RangeAllocator,
    size: u64,
    alignment: u64,
    excluding: SessionId,
) -> u64 {
    // Nothing Reserved means nothing to evict; skip the scan entirely.
    if alloc.reserved_bytes_excluding(excluding) == 0 {
        trace!(pool = pool.id(), "no reclaimable memory");
        return 0;
    }

    let deadline = broker.timing.release_timeout();
    let mut freed = 0u64;

    for victim in alloc.reserved_candidates(excluding) {
        if alloc.can_satisfy(size, alignment) {
            break;
        }

        let handle = Handle {
            pool: pool.id(),
            offset: victim.offset,
            len: victim.len,
            generation: victim.generation,
        };

        let outcome = match broker.sessions.get(victim.owner) {
            Some(session) => {
                session.set_draining();
                let (tx, rx) = oneshot::channel();
                let key: WaiterKey = (pool.id(), victim.offset, victim.generation);
                broker.waiters.insert(
                    key,
                    ReclaimWaiter {
                        owner: victim.owner,
                        tx,
                    },
                );
                let notified = session.try_notify(Notification::ReleaseRequest {
                    handle,
                    deadline_ms: deadline.as_millis() as u64,
                });

                let acked = if notified {
                    tokio::time::timeout(deadline, rx).await.is_ok()
                } else {
                    false
                };
                broker.waiters.remove(&key);
                session.set_active_if_draining();

                if acked {
                    "acked"
                } else {
                    warn!(
                        victim = %victim.owner,
                        %handle,
                        "no release ack within {:?}, force-freeing",
                        deadline
                    );
                    "forced"
                }
            }
            // Owner already unregistered; its ranges are fair game without
            // asking (the kill path is queued behind this pool lock).
            None => "orphaned",
        };

        match alloc.free(victim.offset) {
            Ok(len) => {
                freed += len;
                if let Some(session) = broker.sessions.get(victim.owner) {
                    session.sub_used(len);
                }
                metrics::RECLAIMS_TOTAL.with_label_values(&[outcome]).inc();
                debug!(
                    pool = pool.id(),
                    victim = %victim.owner,
                    %handle,
                    outcome,
                    idle = ?victim.reserved_since.elapsed(),
                    "reclaimed reserved range"
                );
            }
            Err(e) => warn!(pool = pool.id(), %handle, "reclaim free failed: {}", e),
        }
    }

    pool.refresh_counters(alloc);
    freed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BrokerConfig, PoolConfig};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn broker_with_pool(capacity: u64) -> Broker {
        let mut cfg = BrokerConfig {
            pools: vec![PoolConfig {
                capacity_bytes: capacity,
                base_address: 0,
            }],
            ..Default::default()
        };
        cfg.timing.release_timeout_ms = 20;
        Broker::from_config(&cfg).unwrap()
    }

    #[tokio::test]
    async fn test_reclaim_returns_zero_without_reserved_memory() {
        let broker = broker_with_pool(1000);
        let (tx, _rx) = mpsc::unbounded_channel();
        let a = broker.handshake("proc-a", 0, tx).unwrap();
        let _h = broker.allocate(a.id, 1000, 1).await.unwrap();

        let pool = broker.pools()[0].clone();
        let mut alloc = pool.lock().await;
        let freed = reclaim(&broker, &pool, &mut alloc, 100, 1, a.id).await;
        assert_eq!(freed, 0);
    }

    #[tokio::test]
    async fn test_reclaim_stops_once_request_fits() {
        let broker = broker_with_pool(3000);
        let (tx, _rx) = mpsc::unbounded_channel();
        let a = broker.handshake("proc-a", 0, tx).unwrap();
        let (tx_b, _rx_b) = mpsc::unbounded_channel();
        let b = broker.handshake("proc-b", 0, tx_b).unwrap();

        let h1 = broker.allocate(a.id, 1000, 1).await.unwrap();
        let h2 = broker.allocate(a.id, 1000, 1).await.unwrap();
        let h3 = broker.allocate(a.id, 1000, 1).await.unwrap();
        broker.release(a.id, h1).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        broker.release(a.id, h2).await.unwrap();
        broker.release(a.id, h3).await.unwrap();

        let pool = broker.pools()[0].clone();
        let mut alloc = pool.lock().await;
        let freed = reclaim(&broker, &pool, &mut alloc, 900, 1, b.id).await;
        // One victim is plenty for 900 bytes; the rest stays Reserved.
        assert_eq!(freed, 1000);
        assert_eq!(alloc.reserved_bytes(), 2000);
        assert!(alloc.can_satisfy(900, 1));
    }

    #[tokio::test]
    async fn test_reclaim_partial_when_target_unreachable() {
        let broker = broker_with_pool(1000);
        let (tx, _rx) = mpsc::unbounded_channel();
        let a = broker.handshake("proc-a", 0, tx).unwrap();
        let (tx_b, _rx_b) = mpsc::unbounded_channel();
        let b = broker.handshake("proc-b", 0, tx_b).unwrap();

        let h1 = broker.allocate(a.id, 300, 1).await.unwrap();
        let _h2 = broker.allocate(a.id, 700, 1).await.unwrap();
        broker.release(a.id, h1).await.unwrap();

        let pool = broker.pools()[0].clone();
        let mut alloc = pool.lock().await;
        // Only the 300-byte reservation is evictable; 900 can never fit.
        let freed = reclaim(&broker, &pool, &mut alloc, 900, 1, b.id).await;
        assert_eq!(freed, 300);
        assert!(!alloc.can_satisfy(900, 1));
    }

    #[tokio::test]
    async fn test_reclaim_updates_victim_usage() {
        let broker = Arc::new(broker_with_pool(1000));
        let (tx, _rx) = mpsc::unbounded_channel();
        let a = broker.handshake("proc-a", 0, tx).unwrap();
        let (tx_b, _rx_b) = mpsc::unbounded_channel();
        let b = broker.handshake("proc-b", 0, tx_b).unwrap();

        let h = broker.allocate(a.id, 600, 1).await.unwrap();
        broker.release(a.id, h).await.unwrap();
        assert_eq!(a.used_bytes(), 600);

        let _hb = broker.allocate(b.id, 500, 1).await.unwrap();
        assert_eq!(a.used_bytes(), 0);
        assert_eq!(b.used_bytes(), 500);
    }
}
