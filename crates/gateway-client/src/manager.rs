//! Gateway Manager - one client per remote instance

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::client::GatewayClient;
use crate::config::GatewayClientOptions;
use crate::error::Result;
use crate::interceptor::{ErrorTransformerInterceptor, Interceptor, LoggerInterceptor};

/// Registry of Gateway clients keyed by instance id
pub struct GatewayManager {
    clients: Arc<RwLock<HashMap<String, GatewayClient>>>,
    default_interceptors: Vec<Arc<dyn Interceptor>>,
}

impl Default for GatewayManager {
    fn default() -> Self {
        Self::new()
    }
}

impl GatewayManager {
    /// Every client gets a logger and an error transformer
    pub fn new() -> Self {
        Self::with_interceptors(vec![
            Arc::new(LoggerInterceptor::new()),
            Arc::new(ErrorTransformerInterceptor::new()),
        ])
    }

    /// Every client starts with `defaults`, shared across clients
    pub fn with_interceptors(defaults: Vec<Arc<dyn Interceptor>>) -> Self {
        Self {
            clients: Arc::new(RwLock::new(HashMap::new())),
            default_interceptors: defaults,
        }
    }

    /// Return the connected client for `instance_id`, creating and
    /// connecting one if needed.
    ///
    /// A registered client that is no longer connected is disconnected and
    /// replaced. `interceptors` run after the defaults and only apply when a
    /// new client is built. Concurrent calls for the same id are not
    /// coalesced; the last one to connect stays registered.
    pub async fn get_client(
        &self,
        instance_id: &str,
        options: GatewayClientOptions,
        interceptors: Vec<Arc<dyn Interceptor>>,
    ) -> Result<GatewayClient> {
        let stale = {
            let mut clients = self.clients.write().await;
            if let Some(client) = clients.get(instance_id).filter(|c| c.is_connected()) {
                return Ok(client.clone());
            }
            clients.remove(instance_id)
        };
        if let Some(stale) = stale {
            debug!("Replacing disconnected client for instance {}", instance_id);
            stale.disconnect().await;
        }

        let mut chain = self.default_interceptors.clone();
        chain.extend(interceptors);
        let client = GatewayClient::new(options, chain);
        client.connect().await?;

        info!("Gateway client registered for instance {}", instance_id);
        if let Some(previous) = self
            .clients
            .write()
            .await
            .insert(instance_id.to_string(), client.clone())
        {
            warn!("Instance {} was registered concurrently, replacing", instance_id);
            tokio::spawn(async move { previous.disconnect().await });
        }
        Ok(client)
    }

    /// The registered client for `instance_id`, connected or not
    pub async fn client(&self, instance_id: &str) -> Option<GatewayClient> {
        self.clients.read().await.get(instance_id).cloned()
    }

    /// Unregister the client for `instance_id`. Its disconnect runs in the
    /// background.
    pub async fn remove_client(&self, instance_id: &str) -> bool {
        let Some(client) = self.clients.write().await.remove(instance_id) else {
            return false;
        };
        info!("Gateway client for instance {} removed", instance_id);
        tokio::spawn(async move { client.disconnect().await });
        true
    }

    /// Disconnect every client and clear the registry
    pub async fn disconnect_all(&self) {
        let clients: Vec<(String, GatewayClient)> = self.clients.write().await.drain().collect();
        if clients.is_empty() {
            return;
        }
        info!("Disconnecting {} gateway clients", clients.len());
        join_all(clients.iter().map(|(_, client)| client.disconnect())).await;
    }

    /// Ids of instances whose client is currently connected
    pub async fn get_connected_instances(&self) -> Vec<String> {
        let clients = self.clients.read().await;
        let mut ids: Vec<String> = clients
            .iter()
            .filter(|(_, client)| client.is_connected())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }
}
