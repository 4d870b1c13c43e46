use crate::ChatTurn;
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

/// A fresh random session id.
pub fn new_session_id() -> String {
    Uuid::new_v4().to_string()
}

#[derive(Debug, Clone)]
struct Session {
    turns: Vec<ChatTurn>,
    created_at: DateTime<Utc>,
    last_active: DateTime<Utc>,
}

impl Session {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            turns: Vec::new(),
            created_at: now,
            last_active: now,
        }
    }
}

/// Per-session conversation history, keyed by session id. A session is
/// created on first access and lives until evicted.
#[derive(Debug, Default)]
pub struct ChatHistoryStore {
    sessions: RwLock<HashMap<String, Session>>,
}

impl ChatHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of the session's turns, oldest first.
    pub fn history(&self, session_id: &str) -> Vec<ChatTurn> {
        if let Some(session) = self.sessions.read().get(session_id) {
            return session.turns.clone();
        }

        let now = Utc::now();
        self.sessions
            .write()
            .entry(session_id.to_string())
            .or_insert_with(|| Session::new(now))
            .turns
            .clone()
    }

    pub fn append(&self, session_id: &str, turn: ChatTurn) {
        let now = Utc::now();
        let mut sessions = self.sessions.write();
        let session = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Session::new(now));
        session.turns.push(turn);
        session.last_active = now;
    }

    /// Number of turns recorded for a session; zero for unknown sessions.
    pub fn len(&self, session_id: &str) -> usize {
        self.sessions
            .read()
            .get(session_id)
            .map(|session| session.turns.len())
            .unwrap_or(0)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn created_at(&self, session_id: &str) -> Option<DateTime<Utc>> {
        self.sessions
            .read()
            .get(session_id)
            .map(|session| session.created_at)
    }

    pub fn evict(&self, session_id: &str) -> bool {
        self.sessions.write().remove(session_id).is_some()
    }

    /// Drops sessions idle for longer than `ttl` and returns their ids.
    pub fn evict_idle(&self, ttl: Duration) -> Vec<String> {
        self.evict_idle_at(Utc::now(), ttl)
    }

    pub fn evict_idle_at(&self, now: DateTime<Utc>, ttl: Duration) -> Vec<String> {
        let mut sessions = self.sessions.write();
        let idle = sessions
            .iter()
            .filter(|(_, session)| now - session.last_active > ttl)
            .map(|(id, _)| id.clone())
            .collect::<Vec<_>>();
        for id in &idle {
            sessions.remove(id);
        }
        if !idle.is_empty() {
            debug!(evicted = idle.len(), remaining = sessions.len(), "evicted idle sessions");
        }
        idle
    }
}

#[cfg(test)]
mod tests {
    use super::{new_session_id, ChatHistoryStore};
    use crate::{ChatTurn, Role};
    use chrono::{Duration, Utc};
    use std::sync::Arc;

    #[test]
    fn first_access_creates_an_empty_session() {
        let store = ChatHistoryStore::new();
        assert!(store.history("fresh").is_empty());
        assert_eq!(store.session_count(), 1);
        assert!(store.created_at("fresh").is_some());
    }

    #[test]
    fn generated_session_ids_are_unique() {
        assert_ne!(new_session_id(), new_session_id());
    }

    #[test]
    fn append_adds_exactly_one_turn() {
        let store = ChatHistoryStore::new();
        store.append("s", ChatTurn::user("hello"));
        store.append("s", ChatTurn::assistant("hi there"));
        assert_eq!(store.len("s"), 2);

        let turns = store.history("s");
        assert_eq!(turns[0].role, Role::User);
        assert_eq!(turns[1].content, "hi there");
    }

    #[test]
    fn evict_forgets_the_session() {
        let store = ChatHistoryStore::new();
        store.append("s", ChatTurn::user("hello"));
        assert!(store.evict("s"));
        assert!(!store.evict("s"));
        assert_eq!(store.len("s"), 0);
    }

    #[test]
    fn idle_sessions_are_evicted_by_ttl() {
        let store = ChatHistoryStore::new();
        store.append("old", ChatTurn::user("a"));
        store.append("new", ChatTurn::user("b"));

        let later = Utc::now() + Duration::minutes(30);
        assert!(store.evict_idle_at(later, Duration::hours(1)).is_empty());

        let much_later = Utc::now() + Duration::hours(2);
        let mut evicted = store.evict_idle_at(much_later, Duration::hours(1));
        evicted.sort();
        assert_eq!(evicted, vec!["new".to_string(), "old".to_string()]);
        assert_eq!(store.session_count(), 0);
    }

    #[test]
    fn concurrent_sessions_do_not_interleave() {
        let store = Arc::new(ChatHistoryStore::new());
        let handles = (0..4)
            .map(|worker| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    let session = format!("session-{worker}");
                    for turn in 0..50 {
                        store.append(&session, ChatTurn::user(format!("{worker}:{turn}")));
                    }
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().unwrap();
        }

        for worker in 0..4 {
            let turns = store.history(&format!("session-{worker}"));
            assert_eq!(turns.len(), 50);
            for (turn, entry) in turns.iter().enumerate() {
                assert_eq!(entry.content, format!("{worker}:{turn}"));
            }
        }
    }
}
