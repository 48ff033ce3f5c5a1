//! Cookie-session and login-state storage
//!
//! Both maps are in-memory only: sessions do not survive a restart, which
//! simply sends users back through the login flow. Pending logins are
//! one-shot (taken on callback) and short-lived.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use uuid::Uuid;

use crate::provider::{Claims, generate_state};

/// Name of the session cookie.
pub const SESSION_COOKIE: &str = "oidc_session";

/// An established login session.
#[derive(Debug, Clone)]
pub struct Session {
    /// Opaque session id, also the cookie value
    pub id: String,
    /// Validated identity claims
    pub claims: Claims,
    /// Access token for the userinfo endpoint
    pub access_token: String,
    /// Provider that authenticated this session
    pub provider: String,
    created: Instant,
}

/// A login that has been redirected to the provider but not completed.
#[derive(Debug, Clone)]
pub struct PendingLogin {
    /// CSRF token, echoed back as the `state` query parameter
    pub state: String,
    /// Nonce bound into the ID token
    pub nonce: String,
    /// Provider the user was sent to
    pub provider: String,
    /// Path to return to after login
    pub return_to: String,
    created: Instant,
}

/// Concurrent session store.
pub struct SessionStore {
    sessions: DashMap<String, Session>,
    pending: DashMap<String, PendingLogin>,
    session_ttl: Duration,
    login_ttl: Duration,
}

impl SessionStore {
    /// Create with the given session lifetime. Pending logins expire after
    /// ten minutes.
    #[must_use]
    pub fn new(session_ttl: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            pending: DashMap::new(),
            session_ttl,
            login_ttl: Duration::from_secs(600),
        }
    }

    /// Begin a login: returns the pending record whose `state` goes into
    /// the authorization redirect.
    pub fn begin_login(&self, provider: &str, return_to: &str) -> PendingLogin {
        let login = PendingLogin {
            state: generate_state(),
            nonce: generate_state(),
            provider: provider.to_string(),
            return_to: return_to.to_string(),
            created: Instant::now(),
        };
        self.pending.insert(login.state.clone(), login.clone());
        login
    }

    /// Consume a pending login by its `state`. Each state is usable once.
    pub fn take_pending(&self, state: &str) -> Option<PendingLogin> {
        let (_, login) = self.pending.remove(state)?;
        if login.created.elapsed() > self.login_ttl {
            return None;
        }
        Some(login)
    }

    /// Establish a session and return its id.
    pub fn create(&self, claims: Claims, access_token: String, provider: String) -> String {
        let id = Uuid::new_v4().to_string();
        self.sessions.insert(
            id.clone(),
            Session {
                id: id.clone(),
                claims,
                access_token,
                provider,
                created: Instant::now(),
            },
        );
        id
    }

    /// Look up a live session; expired sessions are dropped on access.
    pub fn get(&self, id: &str) -> Option<Session> {
        let expired = match self.sessions.get(id) {
            Some(session) if session.created.elapsed() <= self.session_ttl => {
                return Some(session.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            self.sessions.remove(id);
        }
        None
    }

    /// Remove a session (logout).
    pub fn remove(&self, id: &str) {
        self.sessions.remove(id);
    }

    /// Number of live sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no sessions exist.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claims() -> Claims {
        Claims::new("user-1", "https://idp.example.com")
    }

    #[test]
    fn session_round_trip() {
        let store = SessionStore::new(Duration::from_secs(3600));
        let id = store.create(claims(), "token".to_string(), "idp1".to_string());

        let session = store.get(&id).unwrap();
        assert_eq!(session.claims.subject, "user-1");
        assert_eq!(session.provider, "idp1");

        store.remove(&id);
        assert!(store.get(&id).is_none());
    }

    #[test]
    fn expired_session_is_dropped() {
        let store = SessionStore::new(Duration::ZERO);
        let id = store.create(claims(), "token".to_string(), "idp1".to_string());
        std::thread::sleep(Duration::from_millis(5));
        assert!(store.get(&id).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn pending_login_is_one_shot() {
        let store = SessionStore::new(Duration::from_secs(3600));
        let login = store.begin_login("idp1", "/svc1/page");

        let taken = store.take_pending(&login.state).unwrap();
        assert_eq!(taken.provider, "idp1");
        assert_eq!(taken.return_to, "/svc1/page");

        // Second take fails
        assert!(store.take_pending(&login.state).is_none());
    }

    #[test]
    fn unknown_state_is_rejected() {
        let store = SessionStore::new(Duration::from_secs(3600));
        assert!(store.take_pending("forged-state").is_none());
    }

    #[test]
    fn session_ids_are_unique() {
        let store = SessionStore::new(Duration::from_secs(3600));
        let a = store.create(claims(), "t".to_string(), "idp1".to_string());
        let b = store.create(claims(), "t".to_string(), "idp1".to_string());
        assert_ne!(a, b);
        assert_eq!(store.len(), 2);
    }
}
