//! Connection registry: which connections currently hold a live session.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// What the registry knows about a live session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEntry {
    pub session_id: String,
    pub agent_id: String,
    pub client_id: String,
    pub stream_sid: String,
    pub started_at: DateTime<Utc>,
}

/// Process-wide map from connection id to its live session.
///
/// A connection is inserted once its session reaches the active state and
/// removed when the session stops. Work that outlives a session (a reply
/// still being generated, say) checks membership before emitting.
///
/// Uses `std::sync::RwLock`: every acquisition is a single map operation
/// that never spans an `.await`.
#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
    sessions: Arc<RwLock<HashMap<String, SessionEntry>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `connection_id`, returning any entry it replaced.
    pub fn insert(&self, connection_id: &str, entry: SessionEntry) -> Option<SessionEntry> {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(connection_id.to_string(), entry)
    }

    pub fn remove(&self, connection_id: &str) -> Option<SessionEntry> {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(connection_id)
    }

    /// True if `connection_id` is still running the session `session_id`.
    pub fn is_current(&self, connection_id: &str, session_id: &str) -> bool {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(connection_id)
            .is_some_and(|entry| entry.session_id == session_id)
    }

    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(session_id: &str) -> SessionEntry {
        SessionEntry {
            session_id: session_id.to_string(),
            agent_id: "agent-1".to_string(),
            client_id: "acme".to_string(),
            stream_sid: "MZ1".to_string(),
            started_at: Utc::now(),
        }
    }

    #[test]
    fn insert_then_remove() {
        let registry = ConnectionRegistry::new();
        assert!(registry.is_empty());

        assert!(registry.insert("conn-1", entry("s1")).is_none());
        assert!(registry.is_current("conn-1", "s1"));
        assert_eq!(registry.len(), 1);

        assert_eq!(registry.remove("conn-1").unwrap().session_id, "s1");
        assert!(registry.remove("conn-1").is_none());
        assert!(!registry.is_current("conn-1", "s1"));
        assert!(registry.is_empty());
    }

    #[test]
    fn clones_share_state() {
        let registry = ConnectionRegistry::new();
        let other = registry.clone();
        registry.insert("conn-1", entry("s1"));
        assert!(other.is_current("conn-1", "s1"));
    }

    #[test]
    fn is_current_tracks_the_session_not_just_the_connection() {
        let registry = ConnectionRegistry::new();
        registry.insert("conn-1", entry("s1"));
        assert!(registry.is_current("conn-1", "s1"));
        assert!(!registry.is_current("conn-1", "s2"));
        assert!(!registry.is_current("conn-2", "s1"));
    }

    #[test]
    fn concurrent_sessions_do_not_interfere() {
        let registry = ConnectionRegistry::new();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    let conn = format!("conn-{i}");
                    registry.insert(&conn, entry(&format!("s{i}")));
                    if i % 2 == 0 {
                        registry.remove(&conn);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.len(), 4);
    }
}
