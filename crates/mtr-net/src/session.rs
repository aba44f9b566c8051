//! ---
//! mtr_section: "05-networking-external-interfaces"
//! mtr_subsection: "module"
//! mtr_type: "source"
//! mtr_scope: "code"
//! mtr_description: "Client WebSocket surface and session fan-out."
//! mtr_version: "v0.0.0-prealpha"
//! mtr_owner: "tbd"
//! ---
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use mtr_metrics::HubMetrics;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

/// Opaque handle for one attached client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

impl From<u64> for SessionId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

/// What a single broadcast achieved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Sessions the message was queued for.
    pub delivered: usize,
    /// Sessions removed because their queue was full or closed.
    pub dropped: usize,
}

/// Attached sessions and their outbound queues.
///
/// Each session owns a bounded queue drained by its writer task. A broadcast
/// never waits: a session whose queue is full or closed is removed on the
/// spot and the broadcast continues with the rest.
pub struct SessionRegistry {
    sessions: Mutex<IndexMap<SessionId, mpsc::Sender<Arc<str>>>>,
    next_id: AtomicU64,
    queue_depth: usize,
    metrics: Option<HubMetrics>,
}

impl SessionRegistry {
    /// Registry whose per-session queues hold `queue_depth` messages.
    pub fn new(queue_depth: usize, metrics: Option<HubMetrics>) -> Self {
        Self {
            sessions: Mutex::new(IndexMap::new()),
            next_id: AtomicU64::new(1),
            queue_depth: queue_depth.max(1),
            metrics,
        }
    }

    /// Attach a new session and hand back the receiving end of its queue.
    pub fn add(&self) -> (SessionId, mpsc::Receiver<Arc<str>>) {
        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(self.queue_depth);
        let count = {
            let mut sessions = self.sessions.lock();
            sessions.insert(id, tx);
            sessions.len()
        };
        if let Some(metrics) = &self.metrics {
            metrics.session_opened();
        }
        info!(session = %id, sessions = count, "client session attached");
        (id, rx)
    }

    /// Detach a session. Returns `false` when it was already gone.
    pub fn remove(&self, id: SessionId) -> bool {
        let removed = self.sessions.lock().shift_remove(&id).is_some();
        if removed {
            if let Some(metrics) = &self.metrics {
                metrics.session_closed();
            }
            info!(session = %id, "client session detached");
        }
        removed
    }

    /// Queue `text` for every attached session.
    pub fn broadcast(&self, text: &str) -> BroadcastReport {
        let payload: Arc<str> = Arc::from(text);
        let mut report = BroadcastReport::default();
        let mut sessions = self.sessions.lock();
        sessions.retain(|id, tx| match tx.try_send(payload.clone()) {
            Ok(()) => {
                report.delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                warn!(session = %id, "session queue full; dropping session");
                report.dropped += 1;
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(session = %id, "session queue closed; dropping session");
                report.dropped += 1;
                false
            }
        });
        drop(sessions);

        if let Some(metrics) = &self.metrics {
            metrics.broadcast_sent();
            for _ in 0..report.dropped {
                metrics.session_dropped();
                metrics.session_closed();
            }
        }
        report
    }

    /// Detach every session. Their writers see the queue close and hang up.
    pub fn close_all(&self) -> usize {
        let drained: Vec<SessionId> = {
            let mut sessions = self.sessions.lock();
            sessions.drain(..).map(|(id, _)| id).collect()
        };
        if let Some(metrics) = &self.metrics {
            for _ in &drained {
                metrics.session_closed();
            }
        }
        if !drained.is_empty() {
            info!(sessions = drained.len(), "detached all client sessions");
        }
        drained.len()
    }

    /// Number of attached sessions.
    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    /// `true` when nobody is attached.
    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// Attached sessions in attach order.
    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.lock().keys().copied().collect()
    }
}

impl fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.len())
            .field("queue_depth", &self.queue_depth)
            .finish()
    }
}
