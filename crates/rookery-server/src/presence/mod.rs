//! Presence store for Rookery Server
//!
//! Tracks which users have live gateway sessions. The layout mirrors a
//! shared KV store so the maps can be swapped for a remote backend without
//! touching callers:
//! - `session_user`: session id -> owning user, with a TTL deadline that
//!   bounds orphaned entries from lost disconnects
//! - `user_sessions`: username -> set of live session ids
//! - `online`: the online-user set (non-empty session set)
//! - `last_seen`: epoch-millis stamp, written only when a user goes offline
//!
//! Connect, disconnect and TTL expiry return the roster delta to broadcast,
//! or `None` when nothing observable changed (multi-device close of a
//! non-last session, or a disconnect racing an expiry). All mutations go
//! through dashmap entry operations, never read-modify-write over separate
//! calls.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use tracing::{debug, info};

use crate::pipeline::{RosterEvent, RosterEventKind};

/// Default session TTL when no configuration is given
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(90);

/// Presence of a single user as seen by status queries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceStatus {
    Online,
    /// Offline since the given epoch-millis timestamp
    OfflineSince(i64),
    /// Never seen (no session history survives for this user)
    Unknown,
}

#[derive(Debug, Clone)]
struct SessionEntry {
    username: String,
    deadline: Instant,
}

/// Shared multi-session presence state
pub struct PresenceStore {
    session_user: DashMap<String, SessionEntry>,
    user_sessions: DashMap<String, HashSet<String>>,
    online: DashSet<String>,
    last_seen: DashMap<String, i64>,
    ttl: Duration,
}

impl PresenceStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            session_user: DashMap::new(),
            user_sessions: DashMap::new(),
            online: DashSet::new(),
            last_seen: DashMap::new(),
            ttl,
        }
    }

    /// Register a session for a user.
    ///
    /// Adds the session with a fresh TTL, marks the user online, clears any
    /// last-seen stamp and returns the JOIN delta carrying the full roster.
    pub fn connect(&self, username: &str, session_id: &str) -> RosterEvent {
        self.session_user.insert(
            session_id.to_string(),
            SessionEntry {
                username: username.to_string(),
                deadline: Instant::now() + self.ttl,
            },
        );
        {
            let mut sessions = self.user_sessions.entry(username.to_string()).or_default();
            sessions.insert(session_id.to_string());
            self.online.insert(username.to_string());
            self.last_seen.remove(username);
        }

        info!(user = username, session = session_id, "Session connected");
        RosterEvent {
            kind: RosterEventKind::Join,
            username: username.to_string(),
            online_users: self.roster(),
        }
    }

    /// Refresh the TTL of a live session. Returns `false` for unknown ids.
    pub fn touch(&self, session_id: &str) -> bool {
        match self.session_user.get_mut(session_id) {
            Some(mut entry) => {
                entry.deadline = Instant::now() + self.ttl;
                true
            }
            None => false,
        }
    }

    /// Remove a session. Idempotent: a close racing a TTL expiry yields the
    /// LEAVE delta exactly once.
    ///
    /// Returns `Some(LEAVE)` only when the last session of the user closed;
    /// a multi-device user stays online with no broadcast.
    pub fn disconnect(&self, session_id: &str) -> Option<RosterEvent> {
        let (_, entry) = self.session_user.remove(session_id)?;
        let username = entry.username;

        // The offline flip happens while the user's session-set entry is
        // still held, so a concurrent connect for the same user serializes
        // behind it instead of interleaving with the online/last-seen writes
        match self.user_sessions.entry(username.clone()) {
            Entry::Occupied(mut occupied) => {
                occupied.get_mut().remove(session_id);
                if !occupied.get().is_empty() {
                    debug!(user = %username, session = session_id, "Session closed, other sessions remain");
                    return None;
                }
                self.online.remove(&username);
                self.last_seen
                    .insert(username.clone(), Utc::now().timestamp_millis());
                occupied.remove();
            }
            Entry::Vacant(_) => {
                self.online.remove(&username);
                self.last_seen
                    .insert(username.clone(), Utc::now().timestamp_millis());
            }
        }

        info!(user = %username, session = session_id, "User went offline");
        Some(RosterEvent {
            kind: RosterEventKind::Leave,
            username,
            online_users: self.roster(),
        })
    }

    /// Expire sessions whose TTL deadline has lapsed.
    ///
    /// Returns the LEAVE deltas of users whose last session expired.
    pub fn sweep(&self) -> Vec<RosterEvent> {
        let now = Instant::now();
        let expired: Vec<String> = self
            .session_user
            .iter()
            .filter(|entry| entry.deadline <= now)
            .map(|entry| entry.key().clone())
            .collect();

        let mut events = Vec::new();
        for session_id in expired {
            debug!(session = %session_id, "Session TTL lapsed");
            if let Some(event) = self.disconnect(&session_id) {
                events.push(event);
            }
        }
        events
    }

    /// The set of online usernames, sorted
    pub fn online_users(&self) -> Vec<String> {
        let mut users: Vec<String> = self.online.iter().map(|u| u.clone()).collect();
        users.sort();
        users
    }

    /// The configured session TTL (gateways derive their heartbeat from it)
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Whether a user currently has at least one live session
    pub fn is_online(&self, username: &str) -> bool {
        self.online.contains(username)
    }

    /// Presence of a single user. Last-seen is authoritative only while
    /// offline; a user with no record at all reports Unknown.
    pub fn status_of(&self, username: &str) -> PresenceStatus {
        if self.online.contains(username) {
            return PresenceStatus::Online;
        }
        match self.last_seen.get(username) {
            Some(ts) => PresenceStatus::OfflineSince(*ts),
            None => PresenceStatus::Unknown,
        }
    }

    /// Comma-joined online roster, the public channel's payload format
    fn roster(&self) -> String {
        self.online_users().join(",")
    }
}

impl Default for PresenceStore {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_marks_online_and_broadcasts_join() {
        let store = PresenceStore::default();

        let event = store.connect("alice", "s1");
        assert_eq!(event.kind, RosterEventKind::Join);
        assert_eq!(event.online_users, "alice");
        assert!(store.is_online("alice"));
        assert_eq!(store.status_of("alice"), PresenceStatus::Online);
    }

    #[test]
    fn test_multi_session_stays_online_until_last_close() {
        let store = PresenceStore::default();
        store.connect("alice", "s1");
        store.connect("alice", "s2");

        // Closing one of two sessions: still online, no broadcast
        assert!(store.disconnect("s1").is_none());
        assert!(store.is_online("alice"));

        // Closing the last one: offline with a fresh last-seen
        let event = store.disconnect("s2").unwrap();
        assert_eq!(event.kind, RosterEventKind::Leave);
        assert!(!store.is_online("alice"));
        assert!(matches!(
            store.status_of("alice"),
            PresenceStatus::OfflineSince(_)
        ));
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let store = PresenceStore::default();
        store.connect("alice", "s1");

        assert!(store.disconnect("s1").is_some());
        // Racing close / TTL expiry resolves to a single LEAVE
        assert!(store.disconnect("s1").is_none());
    }

    #[test]
    fn test_reconnect_clears_last_seen() {
        let store = PresenceStore::default();
        store.connect("alice", "s1");
        store.disconnect("s1");
        assert!(matches!(
            store.status_of("alice"),
            PresenceStatus::OfflineSince(_)
        ));

        store.connect("alice", "s2");
        assert_eq!(store.status_of("alice"), PresenceStatus::Online);
        store.disconnect("s2");
        // Fresh stamp after the second offline transition
        assert!(matches!(
            store.status_of("alice"),
            PresenceStatus::OfflineSince(_)
        ));
    }

    #[test]
    fn test_unknown_user_status() {
        let store = PresenceStore::default();
        assert_eq!(store.status_of("nobody"), PresenceStatus::Unknown);
    }

    #[test]
    fn test_roster_is_sorted_and_comma_joined() {
        let store = PresenceStore::default();
        store.connect("carol", "s1");
        store.connect("alice", "s2");
        let event = store.connect("bob", "s3");
        assert_eq!(event.online_users, "alice,bob,carol");
    }

    #[tokio::test]
    async fn test_sweep_expires_lapsed_sessions() {
        let store = PresenceStore::new(Duration::from_millis(10));
        store.connect("alice", "s1");
        store.connect("bob", "s2");

        // bob keeps his session alive
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(store.touch("s2"));

        let events = store.sweep();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].username, "alice");
        assert!(!store.is_online("alice"));
        assert!(store.is_online("bob"));

        // Nothing left to expire
        assert!(store.sweep().is_empty());
    }

    #[test]
    fn test_touch_unknown_session() {
        let store = PresenceStore::default();
        assert!(!store.touch("nope"));
    }

    #[test]
    fn test_concurrent_reconnect_never_strands_user_offline() {
        use std::sync::Arc;

        // A close of the old session racing a connect of a new one must
        // always end with the user online
        for _ in 0..500 {
            let store = Arc::new(PresenceStore::default());
            store.connect("alice", "s1");

            let closer = {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    store.disconnect("s1");
                })
            };
            let opener = {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    store.connect("alice", "s2");
                })
            };
            closer.join().unwrap();
            opener.join().unwrap();

            assert!(store.is_online("alice"), "user offline with a live session");
            assert_eq!(store.status_of("alice"), PresenceStatus::Online);
        }
    }
}
