//! Server-side session records for refresh-token chains
//!
//! A session is created when a refresh token is first issued, touched on
//! every refresh exchange, and soft-revoked on logout. Records are never
//! deleted so revocations stay auditable.
//!
//! [`SessionStore`] is the seam to the relational store; [`MemorySessionStore`]
//! is the in-process implementation. Mutations of one session are linearized
//! through a per-session mutex, so a revoke racing a rotate can never leave
//! the session live again.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::principal::Principal;

/// One refresh-token chain.
///
/// Timestamps are unix milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub principal_id: String,
    pub project_id: String,
    pub created_at: u64,
    pub last_rotated_at: u64,
    pub revoked: bool,
}

/// Persistence for sessions.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Start a new session for `principal`.
    async fn create(&self, principal: &Principal) -> Result<Session>;

    /// Record a refresh exchange. Fails with `SessionRevoked` if the session
    /// was revoked, `SessionNotFound` if it never existed.
    async fn rotate(&self, session_id: &str) -> Result<Session>;

    /// Mark the session revoked. Revoking twice is not an error.
    async fn revoke(&self, session_id: &str) -> Result<()>;

    /// Unknown sessions count as revoked.
    async fn is_revoked(&self, session_id: &str) -> bool;

    async fn get(&self, session_id: &str) -> Option<Session>;
}

/// In-memory session store.
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<String, Arc<Mutex<Session>>>>,
    clock: Arc<dyn Clock>,
}

impl MemorySessionStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            clock,
        }
    }

    async fn slot(&self, session_id: &str) -> Result<Arc<Mutex<Session>>> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| Error::SessionNotFound(session_id.to_owned()))
    }

    /// Number of sessions ever created, revoked ones included.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create(&self, principal: &Principal) -> Result<Session> {
        principal.validate()?;
        let now = self.clock.now_millis();
        let session = Session {
            session_id: uuid::Uuid::new_v4().to_string(),
            principal_id: principal.user_id.clone(),
            project_id: principal.project_id.clone(),
            created_at: now,
            last_rotated_at: now,
            revoked: false,
        };

        self.sessions.write().await.insert(
            session.session_id.clone(),
            Arc::new(Mutex::new(session.clone())),
        );
        info!(
            session_id = %session.session_id,
            project_id = %session.project_id,
            "session created"
        );
        Ok(session)
    }

    async fn rotate(&self, session_id: &str) -> Result<Session> {
        let slot = self.slot(session_id).await?;
        let mut session = slot.lock().await;
        if session.revoked {
            return Err(Error::SessionRevoked(session_id.to_owned()));
        }
        session.last_rotated_at = self.clock.now_millis();
        debug!(session_id, "session rotated");
        Ok(session.clone())
    }

    async fn revoke(&self, session_id: &str) -> Result<()> {
        let slot = self.slot(session_id).await?;
        let mut session = slot.lock().await;
        if !session.revoked {
            session.revoked = true;
            info!(session_id, "session revoked");
        }
        Ok(())
    }

    async fn is_revoked(&self, session_id: &str) -> bool {
        match self.slot(session_id).await {
            Ok(slot) => slot.lock().await.revoked,
            Err(_) => true,
        }
    }

    async fn get(&self, session_id: &str) -> Option<Session> {
        let slot = self.slot(session_id).await.ok()?;
        let session = slot.lock().await;
        Some(session.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::time::Duration;

    fn store() -> (Arc<MemorySessionStore>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000));
        (Arc::new(MemorySessionStore::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn create_records_principal() {
        let (store, _) = store();
        let session = store.create(&Principal::new("u1", "p1")).await.unwrap();
        assert_eq!(session.principal_id, "u1");
        assert_eq!(session.project_id, "p1");
        assert_eq!(session.created_at, 1_000);
        assert_eq!(session.created_at, session.last_rotated_at);
        assert!(!session.revoked);
        assert!(!store.is_revoked(&session.session_id).await);
    }

    #[tokio::test]
    async fn create_rejects_invalid_principal() {
        let (store, _) = store();
        assert!(matches!(
            store.create(&Principal::new("u1", "")).await,
            Err(Error::InvalidPrincipal(_))
        ));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn rotate_updates_last_rotated_at() {
        let (store, clock) = store();
        let session = store.create(&Principal::new("u1", "p1")).await.unwrap();
        clock.advance(Duration::from_secs(5));
        let rotated = store.rotate(&session.session_id).await.unwrap();
        assert_eq!(rotated.last_rotated_at, 6_000);
        assert_eq!(rotated.created_at, 1_000);
    }

    #[tokio::test]
    async fn revoke_is_idempotent() {
        let (store, _) = store();
        let session = store.create(&Principal::new("u1", "p1")).await.unwrap();

        store.revoke(&session.session_id).await.unwrap();
        store.revoke(&session.session_id).await.unwrap();

        assert!(store.is_revoked(&session.session_id).await);
        let record = store.get(&session.session_id).await.unwrap();
        assert!(record.revoked, "revoked sessions are kept for audit");
    }

    #[tokio::test]
    async fn rotate_after_revoke_fails() {
        let (store, _) = store();
        let session = store.create(&Principal::new("u1", "p1")).await.unwrap();
        store.revoke(&session.session_id).await.unwrap();
        assert_eq!(
            store.rotate(&session.session_id).await.unwrap_err(),
            Error::SessionRevoked(session.session_id.clone())
        );
    }

    #[tokio::test]
    async fn unknown_sessions_fail_closed() {
        let (store, _) = store();
        assert!(store.is_revoked("missing").await);
        assert_eq!(
            store.rotate("missing").await.unwrap_err(),
            Error::SessionNotFound("missing".into())
        );
        assert_eq!(
            store.revoke("missing").await.unwrap_err(),
            Error::SessionNotFound("missing".into())
        );
        assert!(store.get("missing").await.is_none());
    }

    #[tokio::test]
    async fn concurrent_revoke_and_rotate_never_resurrect() {
        let (store, _) = store();
        for _ in 0..20 {
            let session = store.create(&Principal::new("u1", "p1")).await.unwrap();
            let id = session.session_id.clone();

            let mut rotations = vec![];
            for _ in 0..4 {
                let store = store.clone();
                let id = id.clone();
                rotations.push(tokio::spawn(async move { store.rotate(&id).await }));
            }
            let revoker = {
                let store = store.clone();
                let id = id.clone();
                tokio::spawn(async move { store.revoke(&id).await })
            };

            revoker.await.unwrap().unwrap();
            // Once revoke has completed, the session stays revoked no matter
            // how the rotations interleaved.
            assert!(store.is_revoked(&id).await);
            for r in rotations {
                match r.await.unwrap() {
                    Ok(_) | Err(Error::SessionRevoked(_)) => {}
                    Err(e) => panic!("unexpected rotate error: {e}"),
                }
            }
            assert!(store.is_revoked(&id).await);
        }
    }
}
