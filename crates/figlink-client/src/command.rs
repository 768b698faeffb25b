use crate::{
    link::{endpoint_url, Link, LinkSender},
    pending::{PendingTable, RequestIds},
};
use figlink_core::{
    wire::JOIN, BackoffPolicy, ConnectionIdentity, Envelope, RelayError, DEFAULT_MAX_FRAME_BYTES,
};
use serde_json::{json, Value};
use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
};
use tracing::{error, info, warn};
use url::Url;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct CommandClientConfig {
    pub hub_url: Url,
    pub connection_id: String,
    pub backoff: BackoffPolicy,
    pub connect_timeout: Duration,
    pub command_timeout: Option<Duration>,
    pub max_frame_bytes: usize,
}

impl CommandClientConfig {
    pub fn new(hub_url: Url, connection_id: impl Into<String>) -> Self {
        Self {
            hub_url,
            connection_id: connection_id.into(),
            backoff: BackoffPolicy::default(),
            connect_timeout: Duration::from_secs(5),
            command_timeout: Some(Duration::from_secs(30)),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Waiting `delay` before reconnect attempt number `attempt` (1-based).
    BackoffWait { attempt: u32, delay: Duration },
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => f.write_str("disconnected"),
            ConnectionState::Connecting => f.write_str("connecting"),
            ConnectionState::Connected => f.write_str("connected"),
            ConnectionState::BackoffWait { attempt, delay } => {
                write!(f, "backoff(attempt={attempt}, delay={}ms)", delay.as_millis())
            }
            ConnectionState::Failed => f.write_str("failed"),
        }
    }
}

/// Plugin-side client: keeps a connection to the hub alive with
/// exponential back-off and requires a joined channel before commands.
#[derive(Clone)]
pub struct CommandClient {
    inner: Arc<Inner>,
}

struct Inner {
    config: CommandClientConfig,
    url: Url,
    ids: RequestIds,
    pending: PendingTable,
    events: broadcast::Sender<Envelope>,
    link: Mutex<Option<LinkSender>>,
    channel: Mutex<Option<String>>,
    state: watch::Sender<ConnectionState>,
    stop: watch::Sender<bool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Inner {
    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn current_link(&self) -> Option<LinkSender> {
        locked(&self.link).clone()
    }

    /// Forgets the dropped link. Channel membership never survives it.
    fn detach(&self) {
        locked(&self.link).take();
        if let Some(channel) = locked(&self.channel).take() {
            info!(event = "channel_cleared", channel = %channel);
        }
    }
}

impl CommandClient {
    /// Validates the identity and starts the connection supervisor.
    pub fn start(config: CommandClientConfig) -> Result<Self, RelayError> {
        ConnectionIdentity::parse(&config.connection_id)?;
        let url = endpoint_url(&config.hub_url, &config.connection_id)?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (stop, _) = watch::channel(false);
        let inner = Arc::new(Inner {
            config,
            url,
            ids: RequestIds::new(),
            pending: PendingTable::new(),
            events,
            link: Mutex::new(None),
            channel: Mutex::new(None),
            state,
            stop,
            supervisor: Mutex::new(None),
        });
        let task = tokio::spawn(supervise(inner.clone()));
        *locked(&inner.supervisor) = Some(task);
        Ok(Self { inner })
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn channel(&self) -> Option<String> {
        locked(&self.inner.channel).clone()
    }

    pub fn events(&self) -> broadcast::Receiver<Envelope> {
        self.inner.events.subscribe()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Waits until the supervisor reports `Connected`.
    pub async fn wait_connected(&self, timeout: Duration) -> Result<(), RelayError> {
        let mut changes = self.state_changes();
        let reached = tokio::time::timeout(
            timeout,
            changes.wait_for(|state| {
                matches!(state, ConnectionState::Connected | ConnectionState::Failed)
            }),
        )
        .await
        .map(|outcome| outcome.map(|state| *state));
        match reached {
            Ok(Ok(ConnectionState::Connected)) => Ok(()),
            Ok(_) => Err(self.unavailable()),
            Err(_) => Err(RelayError::NotConnected),
        }
    }

    fn unavailable(&self) -> RelayError {
        if self.state() == ConnectionState::Failed {
            RelayError::RetriesExhausted {
                attempts: self.inner.config.backoff.max_attempts,
            }
        } else {
            RelayError::NotConnected
        }
    }

    fn sender(&self) -> Result<LinkSender, RelayError> {
        self.inner
            .current_link()
            .filter(LinkSender::is_open)
            .ok_or_else(|| self.unavailable())
    }

    fn require_channel(&self) -> Result<String, RelayError> {
        self.channel().ok_or(RelayError::NoChannel)
    }

    /// Joins `channel`; on success it becomes the current channel until the
    /// connection drops.
    pub async fn join(&self, channel: &str) -> Result<Envelope, RelayError> {
        let channel = channel.trim();
        if channel.is_empty() {
            return Err(RelayError::ProtocolError("channel name is empty".into()));
        }
        let sender = self.sender()?;
        let envelope = Envelope::new(JOIN, json!({ "channel": channel }))
            .with_request_id(self.inner.ids.next_id());
        let reply = sender
            .request(&self.inner.pending, envelope, self.inner.config.command_timeout)
            .await?;
        // A reconnect in the meantime means the hub forgot the membership.
        if self.inner.current_link().map(|link| link.generation()) == Some(sender.generation()) {
            *locked(&self.inner.channel) = Some(channel.to_string());
            info!(event = "channel_joined", channel = %channel);
        }
        Ok(reply)
    }

    /// Sends a correlated command. Fails locally with
    /// [`RelayError::NoChannel`] until a channel has been joined.
    pub async fn send_command(
        &self,
        kind: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Envelope, RelayError> {
        self.require_channel()?;
        let sender = self.sender()?;
        let envelope = Envelope::new(kind, params).with_request_id(self.inner.ids.next_id());
        sender.request(&self.inner.pending, envelope, timeout).await
    }

    /// Uncorrelated message, such as a state announcement.
    pub async fn send(&self, kind: &str, data: Value) -> Result<(), RelayError> {
        self.require_channel()?;
        self.sender()?.send(&Envelope::new(kind, data)).await
    }

    /// Answers a request relayed from the other side by echoing its
    /// `requestId`.
    pub async fn reply(&self, request: &Envelope, kind: &str, data: Value) -> Result<(), RelayError> {
        let request_id = request
            .request_id
            .clone()
            .ok_or_else(|| RelayError::ProtocolError(format!("'{}' carries no requestId", request.kind)))?;
        let envelope = Envelope::new(kind, data).with_request_id(request_id);
        self.sender()?.send(&envelope).await
    }

    /// Stops the supervisor without reconnecting and rejects outstanding
    /// requests.
    pub async fn shutdown(&self) {
        self.inner.stop.send_replace(true);
        let task = locked(&self.inner.supervisor).take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.inner.detach();
        self.inner.pending.fail_all(RelayError::ConnectionClosed);
        self.inner.set_state(ConnectionState::Disconnected);
    }
}

async fn supervise(inner: Arc<Inner>) {
    let mut stop = inner.stop.subscribe();
    let mut generation: u64 = 0;
    // Reconnect waits since the last successful connection.
    let mut retries: u32 = 0;

    loop {
        if *stop.borrow() {
            break;
        }
        inner.set_state(ConnectionState::Connecting);
        generation += 1;
        let opened = tokio::select! {
            opened = Link::open(
                &inner.url,
                generation,
                inner.config.connect_timeout,
                inner.config.max_frame_bytes,
                inner.pending.clone(),
                inner.events.clone(),
            ) => opened,
            _ = stop.wait_for(|stopped| *stopped) => break,
        };

        match opened {
            Ok((link, _greeting)) => {
                retries = 0;
                *locked(&inner.link) = Some(link.sender());
                inner.set_state(ConnectionState::Connected);
                info!(
                    event = "command_connected",
                    connection_id = %inner.config.connection_id,
                    generation = generation
                );
                let stopped = tokio::select! {
                    _ = link.closed() => false,
                    _ = stop.wait_for(|stopped| *stopped) => true,
                };
                inner.detach();
                if stopped {
                    link.close();
                    break;
                }
                warn!(event = "command_disconnected", generation = generation);
            }
            Err(err) => {
                warn!(
                    event = "command_connect_error",
                    error = %err,
                    retries = retries
                );
            }
        }

        let Some(delay) = inner.config.backoff.delay_for(retries) else {
            error!(
                event = "command_retries_exhausted",
                connection_id = %inner.config.connection_id,
                attempts = retries
            );
            inner.set_state(ConnectionState::Failed);
            return;
        };
        retries += 1;
        inner.set_state(ConnectionState::BackoffWait {
            attempt: retries,
            delay,
        });
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = stop.wait_for(|stopped| *stopped) => break,
        }
    }
    inner.set_state(ConnectionState::Disconnected);
}
