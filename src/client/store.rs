//! Routing client: resolves the owning node and retries on redirects

use crate::client::connection::Connection;
use crate::common::{
    validate_key, validate_value, ClientConfig, DigestHasher, Error, KeyHasher, Metadata, Result,
};
use crate::protocol::{KvMessage, StatusType};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Key-value client for a ring of storage nodes.
///
/// Starts from a seed address; learns the ring from NOT_RESPONSIBLE replies
/// or `refresh_metadata`. Holds one connection per node.
pub struct KvClient {
    seed: String,
    config: ClientConfig,
    hasher: Arc<dyn KeyHasher>,
    metadata: RwLock<Option<Arc<Metadata>>>,
    connections: tokio::sync::Mutex<HashMap<String, Arc<Connection>>>,
}

impl KvClient {
    pub fn new(seed: impl Into<String>, config: ClientConfig) -> Self {
        let hasher = Arc::new(DigestHasher::new(config.hash_prefix_bytes));
        Self::with_hasher(seed, config, hasher)
    }

    pub fn with_hasher(
        seed: impl Into<String>,
        config: ClientConfig,
        hasher: Arc<dyn KeyHasher>,
    ) -> Self {
        Self {
            seed: seed.into(),
            config,
            hasher,
            metadata: RwLock::new(None),
            connections: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Last metadata snapshot learned from the cluster.
    pub fn metadata(&self) -> Option<Arc<Metadata>> {
        self.metadata
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn adopt_metadata(&self, metadata: Metadata) -> Arc<Metadata> {
        tracing::debug!("Adopting metadata with {} nodes", metadata.len());
        let metadata = Arc::new(metadata);
        *self
            .metadata
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(metadata.clone());
        metadata
    }

    /// GET; the reply is GET_SUCCESS, GET_ERROR or a failure status.
    pub async fn get(&self, key: &str) -> Result<KvMessage> {
        validate_key(key, self.config.max_key_len)?;
        self.execute(KvMessage::get(key)).await
    }

    /// PUT; the reply is PUT_SUCCESS, PUT_UPDATE, PUT_ERROR or a failure status.
    pub async fn put(&self, key: &str, value: &str) -> Result<KvMessage> {
        validate_key(key, self.config.max_key_len)?;
        validate_value(value, self.config.max_value_len)?;
        self.execute(KvMessage::put(key, Some(value.to_string())))
            .await
    }

    /// Delete; the reply is DELETE_SUCCESS, DELETE_ERROR or a failure status.
    pub async fn delete(&self, key: &str) -> Result<KvMessage> {
        validate_key(key, self.config.max_key_len)?;
        self.execute(KvMessage::put(key, None)).await
    }

    /// Ask the known nodes (seed last) for their metadata.
    pub async fn refresh_metadata(&self) -> Result<Arc<Metadata>> {
        let mut candidates: Vec<String> = self
            .metadata()
            .map(|m| m.nodes().iter().map(|n| n.address()).collect())
            .unwrap_or_default();
        if !candidates.contains(&self.seed) {
            candidates.push(self.seed.clone());
        }

        for addr in candidates {
            let conn = match self.connection(&addr).await {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::debug!("Metadata source {} unavailable: {}", addr, e);
                    continue;
                }
            };
            match conn.request(&KvMessage::metadata_request()).await {
                Ok(reply) if reply.status == StatusType::MetadataSuccess => {
                    if let Some(metadata) = reply.metadata {
                        return Ok(self.adopt_metadata(metadata));
                    }
                }
                Ok(reply) => tracing::debug!("{} has no metadata: {}", addr, reply),
                Err(e) => {
                    tracing::debug!("Metadata request to {} failed: {}", addr, e);
                    self.drop_connection(&addr).await;
                }
            }
        }
        Err(Error::NoNodeAvailable)
    }

    /// Close every connection.
    pub async fn disconnect(&self) {
        let connections: Vec<_> = self.connections.lock().await.drain().collect();
        for (_, conn) in connections {
            conn.disconnect().await;
        }
    }

    fn route(&self, key: &str) -> Result<String> {
        match self.metadata() {
            Some(metadata) if !metadata.is_empty() => {
                Ok(metadata.resolve(self.hasher.as_ref(), key)?.address())
            }
            _ => Ok(self.seed.clone()),
        }
    }

    async fn connection(&self, addr: &str) -> Result<Arc<Connection>> {
        let mut connections = self.connections.lock().await;
        if let Some(conn) = connections.get(addr) {
            if conn.is_open() {
                return Ok(conn.clone());
            }
            connections.remove(addr);
        }
        let conn = Arc::new(Connection::connect(addr, &self.config).await?);
        connections.insert(addr.to_string(), conn.clone());
        Ok(conn)
    }

    async fn drop_connection(&self, addr: &str) {
        let conn = self.connections.lock().await.remove(addr);
        if let Some(conn) = conn {
            conn.disconnect().await;
        }
    }

    /// Route, send and follow redirects / back off on locks.
    async fn execute(&self, message: KvMessage) -> Result<KvMessage> {
        let key = message.key.clone().unwrap_or_default();
        let mut delay = self.config.retry_delay();
        let mut last: Result<KvMessage> = Err(Error::NoNodeAvailable);

        for attempt in 1..=self.config.max_attempts.max(1) {
            let addr = self.route(&key)?;

            let reply = match self.connection(&addr).await {
                Ok(conn) => conn.request(&message).await,
                Err(e) => Err(e),
            };

            let reply = match reply {
                Ok(reply) => reply,
                Err(e) if e.is_retryable() => {
                    tracing::warn!("Attempt {} against {} failed: {}", attempt, addr, e);
                    self.drop_connection(&addr).await;
                    last = Err(e);
                    // another node may know a newer ring
                    let _ = self.refresh_metadata().await;
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    continue;
                }
                Err(e) => return Err(e),
            };

            match reply.status {
                StatusType::ServerNotResponsible => {
                    tracing::debug!("{} is not responsible for {}", addr, key);
                    if let Some(metadata) = reply.metadata.clone() {
                        self.adopt_metadata(metadata);
                    }
                    last = Ok(reply);
                }
                StatusType::ServerStopped | StatusType::ServerWriteLock => {
                    tracing::debug!("{} answered {}, backing off {:?}", addr, reply.status, delay);
                    last = Ok(reply);
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                _ => return Ok(reply),
            }
        }

        last
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::NodeEndpoint;

    #[tokio::test]
    async fn test_limits_checked_before_sending() {
        // nothing listens here; validation must fail first
        let client = KvClient::new("127.0.0.1:1", ClientConfig::default());

        assert!(matches!(client.get("").await, Err(Error::EmptyKey)));
        assert!(matches!(
            client.put(&"k".repeat(21), "v").await,
            Err(Error::KeyTooLong { len: 21, max: 20 })
        ));
        let big = "x".repeat(120 * 1024 + 1);
        assert!(matches!(
            client.put("k", &big).await,
            Err(Error::ValueTooLong { .. })
        ));
    }

    #[test]
    fn test_routes_with_configured_prefix() {
        let hasher = DigestHasher::new(4);
        let nodes = (0..8)
            .map(|i| NodeEndpoint::new(format!("n{}", i), "127.0.0.1", 7000 + i, &hasher))
            .collect();
        let metadata = Metadata::new(nodes);

        let config = ClientConfig {
            hash_prefix_bytes: 4,
            ..Default::default()
        };
        let client = KvClient::new("127.0.0.1:1", config);
        client.adopt_metadata(metadata.clone());

        for i in 0..200 {
            let key = format!("key-{}", i);
            let owner = metadata.resolve(&hasher, &key).unwrap().address();
            assert_eq!(client.route(&key).unwrap(), owner, "{}", key);
        }
    }

    #[tokio::test]
    async fn test_unreachable_seed() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let config = ClientConfig {
            max_attempts: 2,
            retry_delay_ms: 1,
            connect_timeout_ms: 200,
            ..Default::default()
        };
        let client = KvClient::new(addr, config);
        let err = client.get("k").await.unwrap_err();
        assert!(err.is_retryable());
        assert!(client.refresh_metadata().await.is_err());
    }
}
