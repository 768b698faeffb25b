use figlink_core::{Envelope, RelayError};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::{Duration, Instant},
};
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

pub type Reply = Result<Envelope, RelayError>;

struct PendingEntry {
    generation: u64,
    created_at: Instant,
    reply: oneshot::Sender<Reply>,
}

/// Requests awaiting a correlated response. Every entry leaves the table
/// exactly once: resolved, rejected, evicted on timeout, or failed with its
/// link.
#[derive(Clone, Default)]
pub struct PendingTable {
    entries: Arc<Mutex<HashMap<String, PendingEntry>>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PendingEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, request_id: impl Into<String>, generation: u64) -> oneshot::Receiver<Reply> {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(
            request_id.into(),
            PendingEntry {
                generation,
                created_at: Instant::now(),
                reply: tx,
            },
        );
        rx
    }

    /// Completes the pending request named by the envelope's `requestId`.
    /// A response carrying `error` rejects it with [`RelayError::Remote`].
    /// Envelopes that match nothing are handed back to the caller.
    pub fn resolve(&self, envelope: Envelope) -> Option<Envelope> {
        let entry = match envelope.request_id.as_deref() {
            Some(request_id) => self.lock().remove(request_id),
            None => None,
        };
        let Some(entry) = entry else {
            return Some(envelope);
        };
        let reply = match envelope.error.clone() {
            Some(message) => Err(RelayError::Remote(message)),
            None => Ok(envelope),
        };
        let _ = entry.reply.send(reply);
        None
    }

    pub fn reject(&self, request_id: &str, err: RelayError) -> bool {
        match self.lock().remove(request_id) {
            Some(entry) => {
                let _ = entry.reply.send(Err(err));
                true
            }
            None => false,
        }
    }

    pub fn evict(&self, request_id: &str) -> bool {
        self.lock().remove(request_id).is_some()
    }

    /// Rejects every request that was sent over link `generation`.
    pub fn fail_link(&self, generation: u64, err: RelayError) -> usize {
        let failed: Vec<(String, PendingEntry)> = {
            let mut entries = self.lock();
            let ids: Vec<String> = entries
                .iter()
                .filter(|(_, entry)| entry.generation == generation)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| entries.remove(&id).map(|entry| (id, entry)))
                .collect()
        };
        let count = failed.len();
        for (request_id, entry) in failed {
            debug!(
                event = "pending_rejected",
                request_id = %request_id,
                age_ms = entry.created_at.elapsed().as_millis() as u64,
                error = %err
            );
            let _ = entry.reply.send(Err(err.clone()));
        }
        count
    }

    pub fn fail_all(&self, err: RelayError) -> usize {
        let drained: Vec<PendingEntry> = self.lock().drain().map(|(_, entry)| entry).collect();
        let count = drained.len();
        for entry in drained {
            let _ = entry.reply.send(Err(err.clone()));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Waits for the reply to `request_id`. `None` or a zero duration waits
    /// without bound.
    pub async fn wait(
        &self,
        request_id: &str,
        rx: oneshot::Receiver<Reply>,
        timeout: Option<Duration>,
    ) -> Reply {
        let Some(limit) = timeout.filter(|limit| !limit.is_zero()) else {
            return rx.await.unwrap_or(Err(RelayError::ConnectionClosed));
        };
        match tokio::time::timeout(limit, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_canceled)) => Err(RelayError::ConnectionClosed),
            Err(_elapsed) => {
                self.evict(request_id);
                Err(RelayError::RequestTimeout {
                    request_id: request_id.to_string(),
                    timeout_ms: limit.as_millis() as u64,
                })
            }
        }
    }
}

/// Request ids unique per client instance: a random prefix plus a counter.
#[derive(Debug)]
pub struct RequestIds {
    prefix: String,
    next: AtomicU64,
}

impl Default for RequestIds {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestIds {
    pub fn new() -> Self {
        Self {
            prefix: Uuid::new_v4().simple().to_string(),
            next: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> String {
        let seq = self.next.fetch_add(1, Ordering::Relaxed);
        format!("{}-{seq}", self.prefix)
    }
}
