//! SSE event buffering for streamable-HTTP resumability.
//!
//! Every frame sent to a session carries a monotonically increasing event id
//! and lands in a bounded per-session ring. A client reconnecting with
//! `Last-Event-ID: N` replays every buffered event with id > N, in order,
//! before seeing live traffic.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Buffer bound: at most this many events per session.
pub const MAX_BUFFERED_EVENTS: usize = 1024;
/// Buffer bound: events older than this are dropped.
pub const MAX_EVENT_AGE: Duration = Duration::from_secs(5 * 60);

/// One buffered SSE frame: id, event name, serialized payload.
#[derive(Debug, Clone)]
pub struct BufferedEvent {
    pub id: u64,
    pub event: &'static str,
    pub data: String,
    at: Instant,
}

#[derive(Default)]
struct SessionBuffer {
    next_id: u64,
    ring: VecDeque<BufferedEvent>,
}

/// Per-session SSE event ids and replay rings.
#[derive(Default)]
pub struct SseEventBuffer {
    sessions: Mutex<HashMap<String, SessionBuffer>>,
}

impl SseEventBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next event id for a session and buffer the frame.
    pub fn push(&self, session_id: &str, event: &'static str, data: String) -> u64 {
        let mut sessions = self.sessions.lock().unwrap();
        let buffer = sessions.entry(session_id.to_owned()).or_default();
        buffer.next_id += 1;
        let id = buffer.next_id;
        buffer.ring.push_back(BufferedEvent {
            id,
            event,
            data,
            at: Instant::now(),
        });
        while buffer.ring.len() > MAX_BUFFERED_EVENTS {
            buffer.ring.pop_front();
        }
        while buffer
            .ring
            .front()
            .is_some_and(|e| e.at.elapsed() > MAX_EVENT_AGE)
        {
            buffer.ring.pop_front();
        }
        id
    }

    /// Buffered events with id greater than `last_event_id`, in id order.
    pub fn replay_after(&self, session_id: &str, last_event_id: u64) -> Vec<BufferedEvent> {
        let sessions = self.sessions.lock().unwrap();
        match sessions.get(session_id) {
            Some(buffer) => buffer
                .ring
                .iter()
                .filter(|e| e.id > last_event_id && e.at.elapsed() <= MAX_EVENT_AGE)
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn remove_session(&self, session_id: &str) {
        self.sessions.lock().unwrap().remove(session_id);
    }

    pub fn clear(&self) {
        self.sessions.lock().unwrap().clear();
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_ids_are_monotonic_per_session() {
        let buffer = SseEventBuffer::new();
        assert_eq!(buffer.push("a", "message", "{}".into()), 1);
        assert_eq!(buffer.push("a", "message", "{}".into()), 2);
        assert_eq!(buffer.push("b", "message", "{}".into()), 1);
    }

    #[test]
    fn test_replay_returns_only_newer_events_in_order() {
        let buffer = SseEventBuffer::new();
        for i in 0..5 {
            buffer.push("a", "message", format!("{{\"n\":{i}}}"));
        }
        let replayed = buffer.replay_after("a", 2);
        let ids: Vec<u64> = replayed.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![3, 4, 5]);
    }

    #[test]
    fn test_ring_is_bounded() {
        let buffer = SseEventBuffer::new();
        for _ in 0..(MAX_BUFFERED_EVENTS + 50) {
            buffer.push("a", "message", "{}".into());
        }
        let replayed = buffer.replay_after("a", 0);
        assert_eq!(replayed.len(), MAX_BUFFERED_EVENTS);
        // The oldest frames were dropped, so replay starts past id 50.
        assert!(replayed.first().unwrap().id > 50);
    }

    #[test]
    fn test_replay_for_unknown_session_is_empty() {
        let buffer = SseEventBuffer::new();
        assert!(buffer.replay_after("missing", 0).is_empty());
    }

    #[test]
    fn test_remove_session_clears_state() {
        let buffer = SseEventBuffer::new();
        buffer.push("a", "message", "{}".into());
        buffer.remove_session("a");
        assert!(buffer.replay_after("a", 0).is_empty());
        assert_eq!(buffer.session_count(), 0);
    }
}
