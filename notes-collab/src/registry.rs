//! Session registry: which connections are viewing which document.
//!
//! The registry is the single source of truth for presence. Each session
//! guards its own member map, so joins and leaves on one document never
//! contend with another document's traffic.
//!
//! Lock order: the session map is never held while waiting for a member
//! lock. Eviction is the one place that takes the map write lock while
//! holding a member lock.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard, RwLock};

use crate::protocol::{ConnectionId, SessionId};
use crate::relay::PeerHandle;

/// Members of one session.
#[derive(Default)]
pub struct Members {
    peers: HashMap<ConnectionId, PeerHandle>,
    /// Set once the last member left and the session was removed from the
    /// registry. A joiner that still holds the old `Arc` must retry.
    evicted: bool,
}

impl Members {
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn contains(&self, conn: &ConnectionId) -> bool {
        self.peers.contains_key(conn)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerHandle> {
        self.peers.values()
    }
}

/// The live collaborative context for one document.
pub struct Session {
    id: SessionId,
    members: Mutex<Members>,
}

impl Session {
    fn new(id: SessionId) -> Self {
        Self {
            id,
            members: Mutex::new(Members::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Lock the member map. Anything sent while the guard is held is
    /// ordered against every other join, leave and broadcast of this session.
    pub async fn members(&self) -> MutexGuard<'_, Members> {
        self.members.lock().await
    }
}

/// Process-wide map from document id to session.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection to a session, creating the session if needed.
    ///
    /// Returns the member count after the join.
    pub async fn join(&self, session_id: &str, peer: PeerHandle) -> usize {
        loop {
            let session = self.get_or_create(session_id).await;
            let mut members = session.members().await;
            if members.evicted {
                // Lost a race with the last member leaving; the map now
                // holds (or will hold) a fresh session.
                continue;
            }
            members.peers.insert(peer.id(), peer.clone());
            return members.len();
        }
    }

    /// Remove a connection from a session.
    ///
    /// Returns the remaining member count, or `None` if the connection was
    /// not a member. The session is evicted as soon as it becomes empty.
    pub async fn leave(&self, session_id: &str, conn: ConnectionId) -> Option<usize> {
        let session = self.session(session_id).await?;
        let mut members = session.members().await;
        members.peers.remove(&conn)?;

        let remaining = members.len();
        if remaining == 0 {
            members.evicted = true;
            let mut sessions = self.sessions.write().await;
            if sessions
                .get(session_id)
                .is_some_and(|current| Arc::ptr_eq(current, &session))
            {
                sessions.remove(session_id);
                log::debug!("Session {session_id} evicted (empty)");
            }
        }
        Some(remaining)
    }

    /// Current member count, 0 for unknown sessions.
    pub async fn count(&self, session_id: &str) -> usize {
        match self.session(session_id).await {
            Some(session) => session.members().await.len(),
            None => 0,
        }
    }

    /// Check whether a connection is a member of a session.
    pub async fn contains(&self, session_id: &str, conn: &ConnectionId) -> bool {
        match self.session(session_id).await {
            Some(session) => session.members().await.contains(conn),
            None => false,
        }
    }

    /// Look up a live session.
    pub async fn session(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    /// Number of live sessions.
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Ids of all live sessions.
    pub async fn active_sessions(&self) -> Vec<SessionId> {
        self.sessions.read().await.keys().cloned().collect()
    }

    async fn get_or_create(&self, session_id: &str) -> Arc<Session> {
        // Fast path: read lock
        {
            let sessions = self.sessions.read().await;
            if let Some(session) = sessions.get(session_id) {
                return session.clone();
            }
        }

        let mut sessions = self.sessions.write().await;
        sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Session::new(session_id.to_string())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn peer() -> PeerHandle {
        PeerHandle::channel(Uuid::new_v4(), 8).0
    }

    #[tokio::test]
    async fn test_join_creates_session() {
        let registry = SessionRegistry::new();
        assert_eq!(registry.count("doc").await, 0);

        let count = registry.join("doc", peer()).await;
        assert_eq!(count, 1);
        assert_eq!(registry.session_count().await, 1);
        assert_eq!(registry.active_sessions().await, vec!["doc".to_string()]);
    }

    #[tokio::test]
    async fn test_count_tracks_membership() {
        let registry = SessionRegistry::new();
        let a = peer();
        let b = peer();

        assert_eq!(registry.join("doc", a.clone()).await, 1);
        assert_eq!(registry.join("doc", b.clone()).await, 2);
        assert_eq!(registry.count("doc").await, 2);

        assert_eq!(registry.leave("doc", a.id()).await, Some(1));
        assert_eq!(registry.count("doc").await, 1);
        assert!(registry.contains("doc", &b.id()).await);
        assert!(!registry.contains("doc", &a.id()).await);
    }

    #[tokio::test]
    async fn test_rejoin_same_connection_does_not_duplicate() {
        let registry = SessionRegistry::new();
        let a = peer();
        registry.join("doc", a.clone()).await;
        assert_eq!(registry.join("doc", a).await, 1);
    }

    #[tokio::test]
    async fn test_last_leave_evicts_session() {
        let registry = SessionRegistry::new();
        let a = peer();
        registry.join("doc", a.clone()).await;

        assert_eq!(registry.leave("doc", a.id()).await, Some(0));
        assert_eq!(registry.session_count().await, 0);
        assert!(registry.session("doc").await.is_none());
        assert_eq!(registry.count("doc").await, 0);
    }

    #[tokio::test]
    async fn test_leave_non_member_is_noop() {
        let registry = SessionRegistry::new();
        registry.join("doc", peer()).await;

        assert_eq!(registry.leave("doc", Uuid::new_v4()).await, None);
        assert_eq!(registry.leave("missing", Uuid::new_v4()).await, None);
        assert_eq!(registry.count("doc").await, 1);
    }

    #[tokio::test]
    async fn test_join_after_eviction_gets_fresh_session() {
        let registry = SessionRegistry::new();
        let a = peer();
        registry.join("doc", a.clone()).await;
        let old = registry.session("doc").await.unwrap();
        registry.leave("doc", a.id()).await;

        assert!(old.members().await.evicted);
        assert_eq!(registry.join("doc", peer()).await, 1);
        let fresh = registry.session("doc").await.unwrap();
        assert!(!Arc::ptr_eq(&old, &fresh));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_join_leave_keeps_count_exact() {
        let registry = Arc::new(SessionRegistry::new());
        let stayer = peer();
        registry.join("doc", stayer.clone()).await;

        let mut tasks = Vec::new();
        for _ in 0..64 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let p = peer();
                registry.join("doc", p.clone()).await;
                tokio::task::yield_now().await;
                registry.leave("doc", p.id()).await
            }));
        }
        for task in tasks {
            assert!(task.await.unwrap().is_some());
        }

        assert_eq!(registry.count("doc").await, 1);
        assert!(registry.contains("doc", &stayer.id()).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_churn_on_empty_session_never_loses_a_member() {
        let registry = Arc::new(SessionRegistry::new());

        let mut tasks = Vec::new();
        for _ in 0..32 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..20 {
                    let p = peer();
                    registry.join("hot", p.clone()).await;
                    assert!(registry.contains("hot", &p.id()).await);
                    registry.leave("hot", p.id()).await;
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(registry.count("hot").await, 0);
        assert_eq!(registry.session_count().await, 0);
    }
}
