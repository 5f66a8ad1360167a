//! Server-side session state and liveness tracking.
//!
//! One `Session` per connected client process. The broker owns all of
//! them through the `SessionRegistry`; the client only ever sees its
//! session id and the handles granted to it.

use crate::network::protocol::Notification;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use uuid::Uuid;

pub type SessionId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    /// A release request for one of this session's Reserved ranges is in
    /// flight; scoped to that range, the session keeps serving requests.
    Draining,
    Dead,
}

/// Server-side state for one connected client process.
pub struct Session {
    pub id: SessionId,
    pub identity: String,
    /// Soft cap on Allocated + Reserved bytes; `None` means unenforced.
    pub quota: Option<u64>,
    pub connected_at: Instant,
    used: AtomicU64,
    state: Mutex<SessionState>,
    last_heartbeat: Mutex<Instant>,
    notify: mpsc::UnboundedSender<Notification>,
}

impl Session {
    pub fn new(
        identity: String,
        quota: Option<u64>,
        notify: mpsc::UnboundedSender<Notification>,
    ) -> Self {
        let now = Instant::now();
        Self {
            id: Uuid::new_v4(),
            identity,
            quota,
            connected_at: now,
            used: AtomicU64::new(0),
            state: Mutex::new(SessionState::Active),
            last_heartbeat: Mutex::new(now),
            notify,
        }
    }

    /// Allocated + Reserved bytes currently owned by this session.
    pub fn used_bytes(&self) -> u64 {
        self.used.load(Ordering::Relaxed)
    }

    pub fn add_used(&self, bytes: u64) {
        self.used.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn sub_used(&self, bytes: u64) {
        self.used.fetch_sub(bytes, Ordering::Relaxed);
    }

    /// Whether granting `extra` more bytes would push the session past its
    /// quota. Always false without a configured quota.
    pub fn would_exceed_quota(&self, extra: u64) -> bool {
        match self.quota {
            Some(quota) => self.used_bytes() + extra > quota,
            None => false,
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn is_dead(&self) -> bool {
        self.state() == SessionState::Dead
    }

    pub fn set_draining(&self) {
        let mut state = self.state.lock();
        if *state == SessionState::Active {
            *state = SessionState::Draining;
        }
    }

    pub fn set_active_if_draining(&self) {
        let mut state = self.state.lock();
        if *state == SessionState::Draining {
            *state = SessionState::Active;
        }
    }

    /// Transition to Dead. Returns false if the session was already dead,
    /// so cleanup runs exactly once.
    pub fn mark_dead(&self) -> bool {
        let mut state = self.state.lock();
        if *state == SessionState::Dead {
            return false;
        }
        *state = SessionState::Dead;
        true
    }

    /// Record a heartbeat (or any sign of life) from the client.
    pub fn touch(&self) {
        eprintln!("DBG touch {} at {:?}", self.id, Instant::now());
        *self.last_heartbeat.lock() = Instant::now();
    }

    pub fn since_heartbeat(&self) -> Duration {
        self.last_heartbeat.lock().elapsed()
    }

    pub fn is_expired(&self, timeout: Duration) -> bool {
        self.since_heartbeat() > timeout
    }

    /// Push an asynchronous server-to-client notification. Returns false
    /// if the connection side has already gone away.
    pub fn try_notify(&self, notification: Notification) -> bool {
        self.notify.send(notification).is_ok()
    }
}

/// All live sessions, keyed by session id.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: Arc<Session>) {
        self.sessions.insert(session.id, session);
        crate::metrics::ACTIVE_SESSIONS.set(self.sessions.len() as i64);
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, id: SessionId) -> Option<Arc<Session>> {
        let removed = self.sessions.remove(&id).map(|(_, session)| session);
        crate::metrics::ACTIVE_SESSIONS.set(self.sessions.len() as i64);
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Snapshot of every live session.
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Sessions whose last heartbeat is older than `timeout`.
    pub fn expired(&self, timeout: Duration) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .filter(|entry| entry.value().is_expired(timeout))
            .map(|entry| entry.value().clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(quota: Option<u64>) -> (Session, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Session::new("test-proc".to_string(), quota, tx), rx)
    }

    #[test]
    fn test_quota_headroom() {
        let (s, _rx) = session(Some(1000));
        assert!(!s.would_exceed_quota(1000));
        s.add_used(600);
        assert!(!s.would_exceed_quota(400));
        assert!(s.would_exceed_quota(401));

        let (unlimited, _rx) = session(None);
        unlimited.add_used(u64::MAX / 2);
        assert!(!unlimited.would_exceed_quota(1 << 40));
    }

    #[test]
    fn test_state_machine() {
        let (s, _rx) = session(None);
        assert_eq!(s.state(), SessionState::Active);

        s.set_draining();
        assert_eq!(s.state(), SessionState::Draining);
        s.set_active_if_draining();
        assert_eq!(s.state(), SessionState::Active);

        assert!(s.mark_dead());
        assert!(!s.mark_dead());
        // Dead is terminal.
        s.set_draining();
        assert_eq!(s.state(), SessionState::Dead);
    }

    #[test]
    fn test_heartbeat_expiry() {
        let (s, _rx) = session(None);
        assert!(!s.is_expired(Duration::from_secs(60)));
        std::thread::sleep(Duration::from_millis(10));
        assert!(s.is_expired(Duration::from_millis(1)));
        s.touch();
        assert!(!s.is_expired(Duration::from_millis(5)));
    }

    #[test]
    fn test_notify_after_receiver_drop() {
        let (s, rx) = session(None);
        drop(rx);
        assert!(!s.try_notify(Notification::SessionClosed {
            reason: "gone".to_string()
        }));
    }

    #[test]
    fn test_registry_roundtrip() {
        let registry = SessionRegistry::new();
        let (s, _rx) = session(None);
        let id = s.id;
        registry.insert(Arc::new(s));
        assert_eq!(registry.len(), 1);
        assert!(registry.get(id).is_some());
        assert!(registry.remove(id).is_some());
        assert!(registry.get(id).is_none());
    }
}
