//! SSE Publisher (spec.md §4.7): wire event types, per-client bounded
//! outbound queues with drop-oldest backpressure, and the client registry
//! the Summary Loop's `SSEPublisher` plugin broadcasts through.

pub mod auth;
pub mod http;

use crate::metrics::Registry;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::Notify;
use uuid::Uuid;

/// A single wire event emitted on `/summary/events` (spec.md §4.7 event
/// taxonomy). `render` produces the full `event: ...\ndata: ...\n\n` frame
/// body (axum wraps it, but tests assert on this text directly).
#[derive(Debug, Clone)]
pub enum SseEvent {
    Hello { client_id: String, schema_version: u32, panel_hashes: Value },
    FullSnapshot { panels: Value },
    PanelUpdate { panel: String, data: Value },
    PanelDiff { panel: String, patch: Value },
    PanelUpdateStructured { updates: Vec<StructuredUpdate> },
    Heartbeat { cycle: u64 },
    Bye { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct LineChange {
    pub index: usize,
    pub old: Option<String>,
    pub new: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StructuredUpdate {
    pub panel: String,
    pub hash: String,
    pub added: usize,
    pub removed: usize,
    pub changed_lines: Vec<LineChange>,
    pub total_lines: usize,
}

impl SseEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SseEvent::Hello { .. } => "hello",
            SseEvent::FullSnapshot { .. } => "full_snapshot",
            SseEvent::PanelUpdate { .. } => "panel_update",
            SseEvent::PanelDiff { .. } => "panel_diff",
            SseEvent::PanelUpdateStructured { .. } => "panel_update_structured",
            SseEvent::Heartbeat { .. } => "heartbeat",
            SseEvent::Bye { .. } => "bye",
        }
    }

    pub fn is_heartbeat(&self) -> bool {
        matches!(self, SseEvent::Heartbeat { .. })
    }

    fn payload(&self) -> Value {
        match self {
            SseEvent::Hello { client_id, schema_version, panel_hashes } => {
                serde_json::json!({ "client_id": client_id, "schema_version": schema_version, "panel_hashes": panel_hashes })
            }
            SseEvent::FullSnapshot { panels } => panels.clone(),
            SseEvent::PanelUpdate { panel, data } => serde_json::json!({ "panel": panel, "data": data }),
            SseEvent::PanelDiff { panel, patch } => serde_json::json!({ "panel": panel, "patch": patch }),
            SseEvent::PanelUpdateStructured { updates } => serde_json::json!({ "updates": updates }),
            SseEvent::Heartbeat { cycle } => serde_json::json!({ "cycle": cycle }),
            SseEvent::Bye { reason } => serde_json::json!({ "reason": reason }),
        }
    }

    /// Renders the SSE wire frame: `event: <name>\ndata: <json>\n\n`.
    pub fn render(&self) -> String {
        format!("event: {}\ndata: {}\n\n", self.name(), self.payload())
    }
}

/// A bounded per-client mailbox. On overflow the oldest non-heartbeat frame
/// is evicted first (spec.md §4.7 "drop oldest non-heartbeat events on
/// backpressure"); if every queued frame is a heartbeat, the new frame is
/// dropped instead.
struct ClientQueue {
    frames: Mutex<VecDeque<(String, bool)>>,
    notify: Notify,
    capacity: usize,
}

impl ClientQueue {
    fn new(capacity: usize) -> Self {
        Self {
            frames: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Returns `true` if a frame was dropped to make room (or because the
    /// queue was already saturated with heartbeats).
    fn push(&self, frame: String, is_heartbeat: bool) -> bool {
        let mut q = self.frames.lock();
        let mut dropped = false;
        if q.len() >= self.capacity {
            if let Some(pos) = q.iter().position(|(_, hb)| !*hb) {
                q.remove(pos);
                dropped = true;
            } else {
                dropped = true;
            }
        }
        if !dropped || q.len() < self.capacity {
            q.push_back((frame, is_heartbeat));
        }
        drop(q);
        self.notify.notify_one();
        dropped
    }

    async fn pop(&self) -> String {
        loop {
            if let Some((frame, _)) = self.frames.lock().pop_front() {
                return frame;
            }
            self.notify.notified().await;
        }
    }
}

struct ClientEntry {
    queue: Arc<ClientQueue>,
    ip: IpAddr,
    connected_at: std::time::Instant,
}

/// Registry of connected SSE clients plus the broadcast fan-out used by the
/// Summary Loop's publisher plugin.
pub struct Publisher {
    clients: Mutex<HashMap<Uuid, ClientEntry>>,
    queue_capacity: usize,
    metrics: Arc<Registry>,
}

impl Publisher {
    pub fn new(queue_capacity: usize, metrics: Arc<Registry>) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            queue_capacity,
            metrics,
        }
    }

    /// Registers a new client and returns its id plus the queue the SSE
    /// response stream reads from.
    pub fn register(&self, ip: IpAddr) -> (Uuid, Arc<ClientQueue>) {
        let id = Uuid::new_v4();
        let queue = Arc::new(ClientQueue::new(self.queue_capacity));
        self.clients.lock().insert(
            id,
            ClientEntry {
                queue: queue.clone(),
                ip,
                connected_at: std::time::Instant::now(),
            },
        );
        self.metrics.inc("g6_sse_http_connections_total", &[("result", "accepted")], 1);
        self.metrics.set("g6_sse_http_active_connections", &[], self.clients.lock().len() as f64);
        (id, queue)
    }

    pub fn unregister(&self, id: Uuid) {
        let mut clients = self.clients.lock();
        if let Some(entry) = clients.remove(&id) {
            let duration = entry.connected_at.elapsed().as_secs_f64();
            self.metrics.observe("g6_sse_connection_duration_sec", &[], duration);
        }
        self.metrics.set("g6_sse_http_active_connections", &[], clients.len() as f64);
    }

    /// Sends an event to every connected client, recording frame size and
    /// drop counts.
    pub fn broadcast(&self, event: &SseEvent) {
        let frame = event.render();
        self.metrics.observe("g6_sse_event_size_bytes", &[("type", event.name())], frame.len() as f64);
        if matches!(event, SseEvent::PanelUpdateStructured { .. }) {
            self.metrics.inc("g6_sse_structured_updates_total", &[], 1);
        }
        let clients = self.clients.lock();
        for entry in clients.values() {
            let dropped = entry.queue.push(frame.clone(), event.is_heartbeat());
            if dropped {
                self.metrics.inc("g6_sse_dropped_events_total", &[], 1);
            }
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_renders_expected_frame() {
        let event = SseEvent::Heartbeat { cycle: 7 };
        let frame = event.render();
        assert!(frame.starts_with("event: heartbeat\n"));
        assert!(frame.contains("\"cycle\":7"));
        assert!(frame.ends_with("\n\n"));
    }

    #[test]
    fn queue_drops_oldest_non_heartbeat_on_overflow() {
        let queue = ClientQueue::new(2);
        queue.push("a".to_string(), false);
        queue.push("b".to_string(), true);
        let dropped = queue.push("c".to_string(), false);
        assert!(dropped);
        let remaining: Vec<_> = queue.frames.lock().iter().map(|(f, _)| f.clone()).collect();
        assert_eq!(remaining, vec!["b".to_string(), "c".to_string()]);
    }

    #[tokio::test]
    async fn broadcast_delivers_to_registered_clients() {
        let metrics = Arc::new(Registry::new_for_test());
        let publisher = Publisher::new(10, metrics);
        let (id, queue) = publisher.register("127.0.0.1".parse().unwrap());
        publisher.broadcast(&SseEvent::Heartbeat { cycle: 1 });
        let frame = queue.pop().await;
        assert!(frame.contains("heartbeat"));
        publisher.unregister(id);
        assert_eq!(publisher.client_count(), 0);
    }
}
