//! Server-side view of connected clients.
//!
//! A session is keyed by `client_id` and aggregates every transport that
//! client currently has open (clients pool connections, so several
//! transports per session are normal). The session dies when its last
//! transport closes or when no message at all arrives within the configured
//! session timeout; the server actor then releases everything the client
//! held.
//!
//! Owned and mutated exclusively by the server actor task.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use tokio::time::{Duration, Instant};

#[derive(Debug)]
pub struct Session {
    pub client_id: String,
    pub created_at: DateTime<Utc>,
    transports: HashSet<u64>,
    last_seen: Instant,
}

impl Session {
    fn new(client_id: String, conn_id: u64, now: Instant) -> Self {
        let mut transports = HashSet::new();
        transports.insert(conn_id);
        Self {
            client_id,
            created_at: Utc::now(),
            transports,
            last_seen: now,
        }
    }

    pub fn is_active(&self, timeout: Duration, now: Instant) -> bool {
        now.duration_since(self.last_seen) < timeout
    }
}

/// Session table of the coordination server.
#[derive(Debug)]
pub struct SessionManager {
    sessions: HashMap<String, Session>,
    session_timeout: Duration,
}

impl SessionManager {
    pub fn new(session_timeout: Duration) -> Self {
        Self {
            sessions: HashMap::new(),
            session_timeout,
        }
    }

    /// Record a message from `client_id` on transport `conn_id`, creating
    /// the session on first contact.
    pub fn touch(&mut self, client_id: &str, conn_id: u64, now: Instant) {
        match self.sessions.get_mut(client_id) {
            Some(session) => {
                session.transports.insert(conn_id);
                session.last_seen = now;
            }
            None => {
                self.sessions.insert(
                    client_id.to_string(),
                    Session::new(client_id.to_string(), conn_id, now),
                );
            }
        }
    }

    /// A transport closed. Returns the client ids whose last transport this
    /// was; those sessions are removed and must be cleaned up by the caller.
    pub fn detach(&mut self, conn_id: u64) -> Vec<String> {
        let mut gone = Vec::new();
        for session in self.sessions.values_mut() {
            session.transports.remove(&conn_id);
            if session.transports.is_empty() {
                gone.push(session.client_id.clone());
            }
        }
        for client_id in &gone {
            self.sessions.remove(client_id);
        }
        gone
    }

    /// Remove and return every session whose heartbeat has lapsed.
    pub fn lapsed(&mut self, now: Instant) -> Vec<String> {
        let timeout = self.session_timeout;
        let gone: Vec<String> = self
            .sessions
            .values()
            .filter(|s| !s.is_active(timeout, now))
            .map(|s| s.client_id.clone())
            .collect();
        for client_id in &gone {
            self.sessions.remove(client_id);
        }
        gone
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_created_on_first_message() {
        let mut mgr = SessionManager::new(Duration::from_secs(30));
        mgr.touch("client-1", 1, Instant::now());
        assert_eq!(mgr.len(), 1);
    }

    #[test]
    fn test_detach_last_transport_destroys_session() {
        let mut mgr = SessionManager::new(Duration::from_secs(30));
        let now = Instant::now();
        mgr.touch("client-1", 1, now);
        mgr.touch("client-1", 2, now);

        assert!(mgr.detach(1).is_empty(), "one transport still open");
        assert_eq!(mgr.detach(2), vec!["client-1".to_string()]);
        assert!(mgr.is_empty());
    }

    #[test]
    fn test_lapsed_sessions_are_removed() {
        let mut mgr = SessionManager::new(Duration::from_millis(100));
        let now = Instant::now();
        mgr.touch("client-1", 1, now);
        mgr.touch("client-2", 2, now + Duration::from_millis(500));

        let gone = mgr.lapsed(now + Duration::from_millis(550));
        assert_eq!(gone, vec!["client-1".to_string()]);
        assert_eq!(mgr.len(), 1);
    }

    #[test]
    fn test_touch_refreshes_heartbeat() {
        let mut mgr = SessionManager::new(Duration::from_millis(100));
        let now = Instant::now();
        mgr.touch("client-1", 1, now);
        mgr.touch("client-1", 1, now + Duration::from_millis(90));
        assert!(mgr.lapsed(now + Duration::from_millis(150)).is_empty());
    }
}
