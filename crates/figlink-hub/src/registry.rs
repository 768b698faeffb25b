use crate::heartbeat::LivenessClock;
use axum::extract::ws::{CloseFrame, Message};
use chrono::{DateTime, Utc};
use figlink_core::{ConnectionIdentity, Role};
use std::{collections::HashMap, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("connection '{0}' is already registered")]
    AlreadyRegistered(String),
    #[error("connection '{0}' is not registered")]
    NotFound(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    ClientClosed,
    ReadError,
    HeartbeatTimeout,
    Evicted,
    Replaced,
    Rejected,
    Shutdown,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::ClientClosed => "client_closed",
            CloseReason::ReadError => "read_error",
            CloseReason::HeartbeatTimeout => "heartbeat_timeout",
            CloseReason::Evicted => "evicted",
            CloseReason::Replaced => "replaced",
            CloseReason::Rejected => "rejected",
            CloseReason::Shutdown => "shutdown",
        }
    }

    fn close_code(&self) -> u16 {
        match self {
            CloseReason::ClientClosed | CloseReason::ReadError => 1000,
            CloseReason::HeartbeatTimeout | CloseReason::Shutdown => 1001,
            CloseReason::Evicted | CloseReason::Replaced | CloseReason::Rejected => 1008,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    Full,
    Closed,
}

/// Outbound half of a live socket: the writer queue plus the switch that
/// stops its read loop.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    sender: mpsc::Sender<Message>,
    closer: Arc<watch::Sender<Option<CloseReason>>>,
}

impl ConnectionHandle {
    pub fn new(sender: mpsc::Sender<Message>, closer: watch::Sender<Option<CloseReason>>) -> Self {
        Self {
            sender,
            closer: Arc::new(closer),
        }
    }

    pub fn channel(
        capacity: usize,
    ) -> (
        Self,
        mpsc::Receiver<Message>,
        watch::Receiver<Option<CloseReason>>,
    ) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (closer, closed) = watch::channel(None);
        (Self::new(tx, closer), rx, closed)
    }

    pub async fn send_text(&self, text: String, timeout: Duration) -> bool {
        self.sender
            .send_timeout(Message::Text(text), timeout)
            .await
            .is_ok()
    }

    pub fn try_send_text(&self, text: String) -> SendOutcome {
        match self.sender.try_send(Message::Text(text)) {
            Ok(()) => SendOutcome::Sent,
            Err(mpsc::error::TrySendError::Full(_)) => SendOutcome::Full,
            Err(mpsc::error::TrySendError::Closed(_)) => SendOutcome::Closed,
        }
    }

    pub fn is_closing(&self) -> bool {
        self.closer.borrow().is_some()
    }

    /// Queues a close frame and trips the read loop. The first reason wins.
    pub fn close(&self, reason: CloseReason) {
        if self.is_closing() {
            return;
        }
        self.closer.send_replace(Some(reason));
        let _ = self.sender.try_send(Message::Close(Some(CloseFrame {
            code: reason.close_code(),
            reason: reason.as_str().into(),
        })));
    }
}

#[derive(Debug)]
pub struct ConnectionEntry {
    identity: ConnectionIdentity,
    connection_id: String,
    serial: u64,
    created_at: DateTime<Utc>,
    clock: LivenessClock,
    handle: ConnectionHandle,
    channel: Option<String>,
    heartbeat: Option<JoinHandle<()>>,
}

impl ConnectionEntry {
    pub fn new(
        identity: ConnectionIdentity,
        serial: u64,
        handle: ConnectionHandle,
        clock: LivenessClock,
    ) -> Self {
        Self {
            connection_id: identity.connection_id(),
            identity,
            serial,
            created_at: Utc::now(),
            clock,
            handle,
            channel: None,
            heartbeat: None,
        }
    }

    pub fn identity(&self) -> &ConnectionIdentity {
        &self.identity
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn role(&self) -> Role {
        self.identity.role()
    }

    pub fn token(&self) -> &str {
        self.identity.token()
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// Milliseconds since the connection was admitted.
    pub fn age_ms(&self) -> i64 {
        (Utc::now() - self.created_at).num_milliseconds().max(0)
    }

    pub fn clock(&self) -> &LivenessClock {
        &self.clock
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    pub fn channel(&self) -> Option<&str> {
        self.channel.as_deref()
    }

    pub fn set_channel(&mut self, channel: String) {
        self.channel = Some(channel);
    }

    pub fn attach_heartbeat(&mut self, task: Option<JoinHandle<()>>) {
        if let Some(previous) = std::mem::replace(&mut self.heartbeat, task) {
            previous.abort();
        }
    }

    /// Cancels the heartbeat timers and force-closes the transport.
    pub fn shutdown(&mut self, reason: CloseReason) {
        if let Some(task) = self.heartbeat.take() {
            task.abort();
        }
        self.handle.close(reason);
    }
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    entries: HashMap<String, ConnectionEntry>,
    serial_counter: u64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_serial(&mut self) -> u64 {
        self.serial_counter += 1;
        self.serial_counter
    }

    pub fn register(&mut self, entry: ConnectionEntry) -> Result<(), RegistryError> {
        if self.entries.contains_key(entry.connection_id()) {
            return Err(RegistryError::AlreadyRegistered(
                entry.connection_id().to_string(),
            ));
        }
        self.entries.insert(entry.connection_id().to_string(), entry);
        Ok(())
    }

    /// Registers `entry`, handing back whatever held its identifier before.
    pub fn replace(&mut self, entry: ConnectionEntry) -> Option<ConnectionEntry> {
        self.entries.insert(entry.connection_id().to_string(), entry)
    }

    /// Removes the entry only if it is still the connection with `serial`;
    /// a stale close never removes a newer connection that reused the id.
    pub fn unregister(
        &mut self,
        connection_id: &str,
        serial: u64,
    ) -> Result<ConnectionEntry, RegistryError> {
        match self.entries.get(connection_id) {
            Some(entry) if entry.serial() == serial => {}
            _ => return Err(RegistryError::NotFound(connection_id.to_string())),
        }
        self.entries
            .remove(connection_id)
            .ok_or_else(|| RegistryError::NotFound(connection_id.to_string()))
    }

    pub fn lookup(&self, connection_id: &str) -> Result<&ConnectionEntry, RegistryError> {
        self.entries
            .get(connection_id)
            .ok_or_else(|| RegistryError::NotFound(connection_id.to_string()))
    }

    pub fn lookup_mut(
        &mut self,
        connection_id: &str,
        serial: u64,
    ) -> Result<&mut ConnectionEntry, RegistryError> {
        match self.entries.get_mut(connection_id) {
            Some(entry) if entry.serial() == serial => Ok(entry),
            _ => Err(RegistryError::NotFound(connection_id.to_string())),
        }
    }

    pub fn contains(&self, connection_id: &str) -> bool {
        self.entries.contains_key(connection_id)
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.entries.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn ids_for_token(&self, token: &str) -> Vec<String> {
        let mut ids: Vec<_> = self
            .entries
            .values()
            .filter(|entry| entry.token() == token)
            .map(|entry| entry.connection_id().to_string())
            .collect();
        ids.sort();
        ids
    }

    pub fn drain(&mut self) -> Vec<ConnectionEntry> {
        self.entries.drain().map(|(_, entry)| entry).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
