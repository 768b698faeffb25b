use crate::rpc::{RpcClient, RpcClientConfig};
use figlink_core::{identity::MCP_PREFIX, Envelope, RelayError};
use serde_json::Value;
use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tracing::info;

/// One lazily created [`RpcClient`] per access token, each dialing as
/// `mcp_<token>`.
pub struct RpcClientPool {
    template: RpcClientConfig,
    clients: Mutex<HashMap<String, RpcClient>>,
}

impl RpcClientPool {
    /// `template` supplies the hub url and timeouts; its connection id is
    /// replaced per token.
    pub fn new(template: RpcClientConfig) -> Self {
        Self {
            template,
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, RpcClient>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn client_for(&self, token: &str) -> Result<RpcClient, RelayError> {
        let mut clients = self.lock();
        if let Some(client) = clients.get(token) {
            return Ok(client.clone());
        }
        let config = RpcClientConfig {
            connection_id: format!("{MCP_PREFIX}{token}"),
            ..self.template.clone()
        };
        let client = RpcClient::new(config)?;
        clients.insert(token.to_string(), client.clone());
        info!(event = "pool_client_created", token = %token, size = clients.len());
        Ok(client)
    }

    pub async fn request(
        &self,
        token: &str,
        kind: &str,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Result<Envelope, RelayError> {
        self.client_for(token)?
            .request(kind, payload, timeout)
            .await
    }

    /// Drops the client for `token`. Returns whether one existed.
    pub async fn disconnect(&self, token: &str) -> bool {
        let removed = self.lock().remove(token);
        match removed {
            Some(client) => {
                client.disconnect().await;
                true
            }
            None => false,
        }
    }

    pub async fn disconnect_all(&self) -> usize {
        let drained: Vec<RpcClient> = self.lock().drain().map(|(_, client)| client).collect();
        let count = drained.len();
        for client in drained {
            client.disconnect().await;
        }
        count
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
