use crate::{
    link::{endpoint_url, Link, LinkSender},
    pending::{PendingTable, RequestIds},
};
use figlink_core::{ConnectionIdentity, Envelope, RelayError, DEFAULT_MAX_FRAME_BYTES};
use serde_json::Value;
use std::{
    sync::atomic::{AtomicU64, Ordering},
    sync::Arc,
    time::Duration,
};
use tokio::sync::{broadcast, Mutex};
use tracing::info;
use url::Url;

pub const DEFAULT_HUB_URL: &str = "ws://127.0.0.1:3055";
const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct RpcClientConfig {
    pub hub_url: Url,
    pub connection_id: String,
    pub connect_timeout: Duration,
    /// Used by [`RpcClient::call`]; `None` waits without bound.
    pub request_timeout: Option<Duration>,
    pub max_frame_bytes: usize,
}

impl RpcClientConfig {
    pub fn new(hub_url: Url, connection_id: impl Into<String>) -> Self {
        Self {
            hub_url,
            connection_id: connection_id.into(),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Some(Duration::from_secs(30)),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

/// Correlating client for one connection identity. Cloning shares the
/// connection and the pending table.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<Inner>,
}

struct Inner {
    config: RpcClientConfig,
    identity: ConnectionIdentity,
    url: Url,
    ids: RequestIds,
    generation: AtomicU64,
    pending: PendingTable,
    events: broadcast::Sender<Envelope>,
    link: Mutex<Option<Link>>,
}

impl RpcClient {
    pub fn new(config: RpcClientConfig) -> Result<Self, RelayError> {
        let identity = ConnectionIdentity::parse(&config.connection_id)?;
        let url = endpoint_url(&config.hub_url, &config.connection_id)?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                identity,
                url,
                ids: RequestIds::new(),
                generation: AtomicU64::new(0),
                pending: PendingTable::new(),
                events,
                link: Mutex::new(None),
            }),
        })
    }

    pub fn identity(&self) -> &ConnectionIdentity {
        &self.inner.identity
    }

    /// Opens the connection unless one is already open.
    pub async fn connect(&self) -> Result<(), RelayError> {
        self.ensure_link().await.map(|_| ())
    }

    async fn ensure_link(&self) -> Result<LinkSender, RelayError> {
        let mut slot = self.inner.link.lock().await;
        if let Some(link) = slot.as_ref() {
            if link.is_open() {
                return Ok(link.sender());
            }
        }
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (link, greeting) = Link::open(
            &self.inner.url,
            generation,
            self.inner.config.connect_timeout,
            self.inner.config.max_frame_bytes,
            self.inner.pending.clone(),
            self.inner.events.clone(),
        )
        .await?;
        info!(
            event = "rpc_connected",
            connection_id = %self.inner.config.connection_id,
            generation = generation,
            role = %greeting.data["role"]
        );
        let sender = link.sender();
        *slot = Some(link);
        Ok(sender)
    }

    pub async fn is_connected(&self) -> bool {
        self.inner
            .link
            .lock()
            .await
            .as_ref()
            .is_some_and(Link::is_open)
    }

    /// Sends `kind` with a fresh request id and waits for the matching
    /// response. `None` waits without bound.
    pub async fn request(
        &self,
        kind: &str,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Result<Envelope, RelayError> {
        let sender = self.ensure_link().await?;
        let envelope = Envelope::new(kind, payload)
            .with_request_id(self.inner.ids.next_id())
            .with_sender_role(self.inner.identity.role());
        sender.request(&self.inner.pending, envelope, timeout).await
    }

    /// [`RpcClient::request`] with the configured default timeout.
    pub async fn call(&self, kind: &str, payload: Value) -> Result<Envelope, RelayError> {
        self.request(kind, payload, self.inner.config.request_timeout)
            .await
    }

    /// Fire-and-forget send without correlation.
    pub async fn send(&self, kind: &str, payload: Value) -> Result<(), RelayError> {
        let envelope =
            Envelope::new(kind, payload).with_sender_role(self.inner.identity.role());
        self.send_envelope(&envelope).await
    }

    pub async fn send_envelope(&self, envelope: &Envelope) -> Result<(), RelayError> {
        let sender = self.ensure_link().await?;
        sender.send(envelope).await
    }

    /// Inbound frames that answered no pending request.
    pub fn events(&self) -> broadcast::Receiver<Envelope> {
        self.inner.events.subscribe()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    pub async fn disconnect(&self) {
        if let Some(link) = self.inner.link.lock().await.take() {
            link.close();
            info!(
                event = "rpc_disconnected",
                connection_id = %self.inner.config.connection_id,
                generation = link.generation()
            );
        }
    }
}
