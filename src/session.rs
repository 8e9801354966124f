//! MCP session lifecycle management.
//!
//! A session groups the interactions of one client from its `initialize`
//! handshake onward. The server mints an opaque [`SessionId`] (returned via
//! the `Mcp-Session-Id` header on HTTP) and the client echoes it on every
//! subsequent request.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::model::{ClientCapabilities, ClientInfo, ProtocolVersion};

pub type SessionId = std::sync::Arc<str>;

/// Mint a session id: 128 bits of entropy, URL-safe.
pub fn new_session_id() -> SessionId {
    uuid::Uuid::new_v4().simple().to_string().into()
}

pub const MAX_SESSIONS: usize = 1000;
pub const SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(3600);
/// The inline expiry sweep runs once per this many creations.
const SWEEP_INTERVAL: u64 = 100;
/// Grace period before a protected session may be evicted as a last resort.
const PROTECTED_EVICTION_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub protocol_version: ProtocolVersion,
    pub client_info: ClientInfo,
    pub client_capabilities: ClientCapabilities,
    pub created_at: Instant,
    pub last_activity: Instant,
    /// Set on receipt of `notifications/initialized`.
    pub initialized: bool,
    /// Set while a server-push SSE stream is open; shields from LRU eviction.
    pub protected: bool,
}

impl Session {
    fn new(
        id: SessionId,
        protocol_version: ProtocolVersion,
        client_info: ClientInfo,
        client_capabilities: ClientCapabilities,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            protocol_version,
            client_info,
            client_capabilities,
            created_at: now,
            last_activity: now,
            initialized: false,
            protected: false,
        }
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }
}

type EvictCallback = Box<dyn Fn(&SessionId) + Send + Sync>;

struct Inner {
    sessions: HashMap<SessionId, Session>,
    creation_count: u64,
}

/// Owns all sessions. A single mutex serializes every mutation and lookup;
/// sessions are small and this is not a contention point at target load.
pub struct SessionManager {
    inner: Mutex<Inner>,
    max_sessions: usize,
    idle_timeout: Duration,
    on_evict: Mutex<Option<EvictCallback>>,
}

impl SessionManager {
    pub fn new(max_sessions: usize, idle_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                sessions: HashMap::new(),
                creation_count: 0,
            }),
            max_sessions,
            idle_timeout,
            on_evict: Mutex::new(None),
        }
    }

    /// Register the cleanup hook invoked for every evicted or expired
    /// session. The protocol handler uses this to purge subscriptions, SSE
    /// buffers, rate buckets, and tasks.
    pub fn set_on_evict(&self, callback: impl Fn(&SessionId) + Send + Sync + 'static) {
        *self.on_evict.lock().unwrap() = Some(Box::new(callback));
    }

    fn notify_evicted(&self, evicted: &[SessionId]) {
        if evicted.is_empty() {
            return;
        }
        let guard = self.on_evict.lock().unwrap();
        if let Some(callback) = guard.as_ref() {
            for id in evicted {
                callback(id);
            }
        }
    }

    /// Create a session for a freshly negotiated client. Runs the expiry
    /// sweep inline every [`SWEEP_INTERVAL`] creations, and evicts the
    /// least-recently-active unprotected session when at capacity.
    pub fn create(
        &self,
        protocol_version: ProtocolVersion,
        client_info: ClientInfo,
        client_capabilities: ClientCapabilities,
    ) -> SessionId {
        let id = new_session_id();
        let mut evicted = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            inner.creation_count += 1;
            if inner.creation_count % SWEEP_INTERVAL == 0 {
                Self::collect_expired(&mut inner, self.idle_timeout, &mut evicted);
            }
            if inner.sessions.len() >= self.max_sessions {
                Self::evict_one(&mut inner, &mut evicted);
            }
            inner.sessions.insert(
                id.clone(),
                Session::new(id.clone(), protocol_version, client_info, client_capabilities),
            );
        }
        self.notify_evicted(&evicted);
        tracing::debug!(session = %id, "created session");
        id
    }

    fn collect_expired(inner: &mut Inner, idle_timeout: Duration, evicted: &mut Vec<SessionId>) {
        let expired: Vec<SessionId> = inner
            .sessions
            .values()
            .filter(|s| s.idle_for() > idle_timeout)
            .map(|s| s.id.clone())
            .collect();
        for id in expired {
            inner.sessions.remove(&id);
            tracing::debug!(session = %id, "expired idle session");
            evicted.push(id);
        }
    }

    fn evict_one(inner: &mut Inner, evicted: &mut Vec<SessionId>) {
        let victim = inner
            .sessions
            .values()
            .filter(|s| !s.protected)
            .min_by_key(|s| s.last_activity)
            .map(|s| s.id.clone())
            .or_else(|| {
                // Every session is protected: fall back to the global oldest,
                // but only past the grace window.
                inner
                    .sessions
                    .values()
                    .min_by_key(|s| s.last_activity)
                    .filter(|s| s.idle_for() > PROTECTED_EVICTION_GRACE)
                    .map(|s| s.id.clone())
            });
        if let Some(id) = victim {
            inner.sessions.remove(&id);
            tracing::debug!(session = %id, "evicted session at capacity");
            evicted.push(id);
        }
    }

    pub fn get(&self, id: &str) -> Option<Session> {
        self.inner.lock().unwrap().sessions.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.lock().unwrap().sessions.contains_key(id)
    }

    /// Bump `last_activity`. Monotonic: the clock only moves forward.
    pub fn touch(&self, id: &str) {
        if let Some(session) = self.inner.lock().unwrap().sessions.get_mut(id) {
            session.last_activity = Instant::now();
        }
    }

    pub fn mark_initialized(&self, id: &str) {
        if let Some(session) = self.inner.lock().unwrap().sessions.get_mut(id) {
            session.initialized = true;
        }
    }

    pub fn set_protected(&self, id: &str, protected: bool) {
        if let Some(session) = self.inner.lock().unwrap().sessions.get_mut(id) {
            session.protected = protected;
        }
    }

    /// Explicit termination (HTTP DELETE). Returns whether it existed.
    pub fn terminate(&self, id: &str) -> bool {
        let removed = {
            let mut inner = self.inner.lock().unwrap();
            inner.sessions.remove(id)
        };
        match removed {
            Some(session) => {
                self.notify_evicted(&[session.id]);
                true
            }
            None => false,
        }
    }

    /// Idle-expiry sweep, callable by hosts that want an explicit pass.
    /// Protected sessions expire too: protection shields from LRU eviction
    /// only, not from the idle timeout.
    pub fn sweep_expired(&self) -> usize {
        let mut evicted = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            Self::collect_expired(&mut inner, self.idle_timeout, &mut evicted);
        }
        let count = evicted.len();
        self.notify_evicted(&evicted);
        count
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every session, invoking the eviction hook for each.
    pub fn clear(&self) {
        let ids: Vec<SessionId> = {
            let mut inner = self.inner.lock().unwrap();
            inner.sessions.drain().map(|(id, _)| id).collect()
        };
        self.notify_evicted(&ids);
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.inner.lock().unwrap().sessions.keys().cloned().collect()
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(MAX_SESSIONS, SESSION_IDLE_TIMEOUT)
    }
}
