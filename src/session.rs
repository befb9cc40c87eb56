//! Signed-in sessions.
//!
//! A [`Session`] is the explicit identity context handed to every operation
//! that needs to know who is acting. The [`SessionStore`] maps capability
//! tokens (the `sid` cookie) to sessions and serializes writes to each
//! user's record.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::api::{ApiError, ResourceKind, RestClient};
use crate::models::{Completion, NewUser, Role, User, UserId};

pub const SESSION_COOKIE: &str = "sid";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid username or password")]
    InvalidCredentials,
    #[error("username {0} is already taken")]
    UsernameTaken(String),
    #[error("{0} is required")]
    Missing(&'static str),
    #[error(transparent)]
    Remote(#[from] ApiError),
}

#[derive(Debug, Clone)]
pub struct Session {
    pub token: Uuid,
    pub user: User,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(user: User) -> Self {
        Self {
            token: Uuid::new_v4(),
            user,
            created_at: Utc::now(),
        }
    }

    pub fn is_admin(&self) -> bool {
        self.user.role.is_admin()
    }
}

/// Exclusive right to read-modify-write one user's record.
pub type UserWriteGuard = OwnedMutexGuard<()>;

#[derive(Clone)]
pub struct SessionStore {
    sessions: Arc<RwLock<HashMap<Uuid, Session>>>,
    writers: Arc<Mutex<HashMap<UserId, Arc<AsyncMutex<()>>>>>,
    ttl: chrono::Duration,
}

impl SessionStore {
    pub fn new(ttl: chrono::Duration) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            writers: Arc::new(Mutex::new(HashMap::new())),
            ttl,
        }
    }

    /// Wait for exclusive write access to `user`'s record. Every request
    /// that patches the user holds this from reading the cached user until
    /// the write lands in the cache.
    pub async fn lock_user(&self, user: UserId) -> UserWriteGuard {
        let lock = self.writers.lock().entry(user).or_default().clone();
        lock.lock_owned().await
    }

    /// Replace `session.user` with the cached copy, which may carry writes
    /// made by concurrent requests on the same session.
    pub fn reload(&self, session: &mut Session) {
        if let Some(cached) = self.get(session.token) {
            session.user = cached.user;
        }
    }

    /// Look up a live session. Expired sessions are dropped on access.
    pub fn get(&self, token: Uuid) -> Option<Session> {
        let now = Utc::now();
        {
            let sessions = self.sessions.read();
            match sessions.get(&token) {
                None => return None,
                Some(s) if now - s.created_at < self.ttl => return Some(s.clone()),
                Some(_) => {}
            }
        }
        self.sessions.write().remove(&token);
        tracing::debug!(%token, "session expired");
        None
    }

    /// Store `session`, replacing any previous state under its token.
    /// Expired sessions of every user are swept on the way.
    pub fn put(&self, session: &Session) {
        let now = Utc::now();
        let swept = {
            let mut sessions = self.sessions.write();
            let before = sessions.len();
            sessions.retain(|_, s| now - s.created_at < self.ttl);
            let swept = before - sessions.len();
            sessions.insert(session.token, session.clone());
            swept
        };
        if swept > 0 {
            tracing::debug!(swept, "expired sessions removed");
        }
        self.writers.lock().retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    /// Overwrite a live session. Returns `false` (and stores nothing) when
    /// the token was signed out or expired meanwhile.
    pub fn update(&self, session: &Session) -> bool {
        match self.sessions.write().get_mut(&session.token) {
            Some(slot) => {
                *slot = session.clone();
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, token: Uuid) -> bool {
        self.sessions.write().remove(&token).is_some()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn login(
        &self,
        client: &RestClient,
        username: &str,
        password: &str,
        cancel: &CancellationToken,
    ) -> Result<Session, SessionError> {
        let username = required("username", username)?;
        required("password", password)?;
        let users: Vec<User> = client
            .list_where(ResourceKind::Users, &[("username", username)], cancel)
            .await?;
        let user = users
            .into_iter()
            .find(|u| u.username == username && u.password.as_deref() == Some(password))
            .ok_or(SessionError::InvalidCredentials)?;
        let session = Session::new(user);
        self.put(&session);
        tracing::info!(user = %session.user.id, "signed in");
        Ok(session)
    }

    /// Create a standard learner account and sign it in.
    pub async fn register(
        &self,
        client: &RestClient,
        username: &str,
        email: &str,
        password: &str,
        cancel: &CancellationToken,
    ) -> Result<Session, SessionError> {
        let username = required("username", username)?;
        let email = required("email", email)?;
        required("password", password)?;
        let existing: Vec<User> = client
            .list_where(ResourceKind::Users, &[("username", username)], cancel)
            .await?;
        if existing.iter().any(|u| u.username == username) {
            return Err(SessionError::UsernameTaken(username.to_owned()));
        }
        let body = NewUser {
            username: username.to_owned(),
            email: email.to_owned(),
            password: password.to_owned(),
            role: Role::default(),
            enrolled_courses: BTreeSet::new(),
            completed_lessons: Completion::default(),
        };
        let user: User = client.create(ResourceKind::Users, &body, cancel).await?;
        let session = Session::new(user);
        self.put(&session);
        tracing::info!(user = %session.user.id, "registered");
        Ok(session)
    }

    pub fn logout(&self, token: Uuid) {
        if self.remove(token) {
            tracing::info!(%token, "signed out");
        }
    }

    /// Replace the cached identity with the store's current record.
    pub async fn refresh(
        &self,
        client: &RestClient,
        session: &mut Session,
        cancel: &CancellationToken,
    ) -> Result<(), SessionError> {
        let _writer = self.lock_user(session.user.id).await;
        let user: User = client.get(ResourceKind::Users, session.user.id, cancel).await?;
        session.user = user;
        self.update(session);
        Ok(())
    }
}

fn required<'a>(field: &'static str, value: &'a str) -> Result<&'a str, SessionError> {
    let value = value.trim();
    if value.is_empty() {
        Err(SessionError::Missing(field))
    } else {
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> User {
        serde_json::from_value(serde_json::json!({"id": 1, "username": "ada"})).expect("user")
    }

    #[test]
    fn put_get_remove() {
        let store = SessionStore::new(chrono::Duration::hours(1));
        let session = Session::new(user());
        store.put(&session);
        assert_eq!(store.get(session.token).map(|s| s.user.id), Some(UserId(1)));
        assert!(store.remove(session.token));
        assert!(store.get(session.token).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn expired_sessions_are_dropped() {
        let store = SessionStore::new(chrono::Duration::hours(1));
        let mut session = Session::new(user());
        session.created_at = Utc::now() - chrono::Duration::hours(2);
        store.put(&session);
        assert!(store.get(session.token).is_none());
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn put_sweeps_other_expired_sessions() {
        let store = SessionStore::new(chrono::Duration::hours(1));
        let mut stale = Session::new(user());
        stale.created_at = Utc::now() - chrono::Duration::hours(3);
        store.put(&stale);
        let fresh = Session::new(user());
        store.put(&fresh);
        assert_eq!(store.len(), 1);
        assert!(store.get(fresh.token).is_some());
    }

    #[test]
    fn update_does_not_revive_signed_out_sessions() {
        let store = SessionStore::new(chrono::Duration::hours(1));
        let mut session = Session::new(user());
        store.put(&session);
        session.user.username = "ada.l".into();
        assert!(store.update(&session));
        assert_eq!(store.get(session.token).map(|s| s.user.username), Some("ada.l".into()));

        store.logout(session.token);
        assert!(!store.update(&session));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn writes_to_one_user_are_serialized() {
        let store = SessionStore::new(chrono::Duration::hours(1));
        let held = store.lock_user(UserId(1)).await;
        let pending = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            store.lock_user(UserId(1)),
        )
        .await;
        assert!(pending.is_err());
        // other users are not blocked
        let _other = store.lock_user(UserId(2)).await;
        drop(held);
        let _again = store.lock_user(UserId(1)).await;
    }

    #[test]
    fn blank_fields_are_rejected() {
        assert!(matches!(required("username", "  "), Err(SessionError::Missing("username"))));
        assert_eq!(required("username", " ada ").ok(), Some("ada"));
    }
}
