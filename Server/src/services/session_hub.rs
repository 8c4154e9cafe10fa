use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use metrics::get_metrics;
use prometheus::IntCounter;
use tracing::{debug, info, instrument, warn};

use crate::types::SessionId;

/// Returned by a sink whose connection is no longer writable.
#[derive(Debug)]
pub struct SinkClosed;

/// One signaling connection the hub can write to. The socket.io layer
/// provides the production implementation; tests substitute their own.
pub trait SignalSink: Send + Sync {
    fn id(&self) -> &str;
    fn send_text(&self, message: &str) -> Result<(), SinkClosed>;
    fn close(&self);
}

type EndedCallback = Arc<dyn Fn(SessionId) + Send + Sync>;

/// Per-session registry of live signaling connections. All membership
/// mutation is serialized through one mutex; broadcast copies the member
/// list under the lock and performs writes after releasing it.
pub struct SessionHub {
    sessions: Mutex<HashMap<SessionId, Vec<Arc<dyn SignalSink>>>>,
    on_session_ended: RwLock<Option<EndedCallback>>,
    broadcasts_total: IntCounter,
    subscribers_dropped: IntCounter,
}

impl Default for SessionHub {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionHub {
    pub fn new() -> Self {
        let metrics = get_metrics();
        let broadcasts_total = metrics
            .get_or_create_counter("hub_broadcasts_total", "Number of session broadcasts")
            .unwrap();
        let subscribers_dropped = metrics
            .get_or_create_counter(
                "hub_subscribers_dropped",
                "Number of subscribers removed after a failed write",
            )
            .unwrap();

        Self {
            sessions: Mutex::new(HashMap::new()),
            on_session_ended: RwLock::new(None),
            broadcasts_total,
            subscribers_dropped,
        }
    }

    /// Callback fired exactly once when the last member of a session is
    /// removed; external archival hangs off this.
    pub fn set_session_ended_callback(&self, callback: EndedCallback) {
        *self.on_session_ended.write().unwrap() = Some(callback);
    }

    #[instrument(skip_all, fields(session_id = session_id))]
    pub fn subscribe(&self, session_id: SessionId, sink: Arc<dyn SignalSink>) {
        let mut sessions = self.sessions.lock().unwrap();
        sessions.entry(session_id).or_default().push(sink);
        debug!("subscriber added");
    }

    /// Remove a connection from whichever session holds it. Emptying the
    /// session fires the session-ended callback.
    #[instrument(skip_all, fields(conn_id = %conn_id))]
    pub fn unsubscribe(&self, conn_id: &str) {
        let mut ended = None;
        {
            let mut sessions = self.sessions.lock().unwrap();
            for (session_id, members) in sessions.iter_mut() {
                let before = members.len();
                members.retain(|sink| sink.id() != conn_id);
                if members.len() != before && members.is_empty() {
                    ended = Some(*session_id);
                    break;
                }
            }
            if let Some(session_id) = ended {
                sessions.remove(&session_id);
            }
        }

        if let Some(session_id) = ended {
            self.emit_session_ended(session_id);
        }
    }

    /// Deliver `message` to every current member of the session. A member
    /// whose write fails is removed and closed; no error reaches the caller.
    #[instrument(skip_all, fields(session_id = session_id))]
    pub fn broadcast(&self, session_id: SessionId, message: &str) {
        let targets: Vec<Arc<dyn SignalSink>> = {
            let sessions = self.sessions.lock().unwrap();
            sessions.get(&session_id).cloned().unwrap_or_default()
        };

        self.broadcasts_total.inc();

        // Writes happen outside the lock.
        let mut failed: Vec<String> = Vec::new();
        for sink in &targets {
            if sink.send_text(message).is_err() {
                warn!("write failed for subscriber {}", sink.id());
                failed.push(sink.id().to_string());
            }
        }
        if failed.is_empty() {
            return;
        }

        let mut dropped: Vec<Arc<dyn SignalSink>> = Vec::new();
        let mut ended = None;
        {
            let mut sessions = self.sessions.lock().unwrap();
            if let Some(members) = sessions.get_mut(&session_id) {
                members.retain(|sink| {
                    let failed_sink = failed.iter().any(|id| id == sink.id());
                    if failed_sink {
                        dropped.push(sink.clone());
                    }
                    !failed_sink
                });
                if members.is_empty() {
                    sessions.remove(&session_id);
                    ended = Some(session_id);
                }
            }
        }

        for sink in dropped {
            self.subscribers_dropped.inc();
            sink.close();
        }
        if let Some(session_id) = ended {
            self.emit_session_ended(session_id);
        }
    }

    pub fn member_count(&self, session_id: SessionId) -> usize {
        self.sessions
            .lock()
            .unwrap()
            .get(&session_id)
            .map_or(0, Vec::len)
    }

    /// Snapshot of `(session, member count)` pairs for the listing handler.
    pub fn sessions(&self) -> Vec<(SessionId, usize)> {
        self.sessions
            .lock()
            .unwrap()
            .iter()
            .map(|(id, members)| (*id, members.len()))
            .collect()
    }

    fn emit_session_ended(&self, session_id: SessionId) {
        info!("session {} ended", session_id);
        let callback = self.on_session_ended.read().unwrap().clone();
        if let Some(callback) = callback {
            callback(session_id);
        }
    }
}
