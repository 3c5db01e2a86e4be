//! Admin commands from the ECS to storage nodes

use crate::client::Connection;
use crate::common::{retry_with_backoff, ClientConfig, Error, Metadata, NodeEndpoint, Result};
use crate::protocol::{AdminCommand, KvMessage, StatusType, NO_METADATA, REQUEST_TIMED_OUT};
use std::time::Duration;

const BROADCAST_ATTEMPTS: usize = 3;

/// Sends one command per connection; nodes are contacted rarely.
#[derive(Debug, Clone)]
pub struct AdminClient {
    settings: ClientConfig,
}

impl AdminClient {
    pub fn new(settings: ClientConfig) -> Self {
        Self { settings }
    }

    async fn request(&self, node: &NodeEndpoint, message: KvMessage) -> Result<KvMessage> {
        let conn = Connection::connect(&node.address(), &self.settings).await?;
        let reply = conn.request(&message).await;
        conn.disconnect().await;
        reply
    }

    /// Run `command` on `node`; anything but ADMIN_SUCCESS is an error.
    pub async fn send(&self, node: &NodeEndpoint, command: AdminCommand) -> Result<()> {
        tracing::debug!("Admin {} -> {}", command, node);
        let reply = self.request(node, KvMessage::admin(command)).await?;
        if reply.status == StatusType::AdminSuccess {
            return Ok(());
        }
        Err(Error::Admin {
            node: node.name.clone(),
            reason: reply.error.unwrap_or_else(|| reply.status.to_string()),
        })
    }

    /// Send `command` to every node, collecting failures. Transport errors
    /// are retried; the broadcast commands are idempotent.
    pub async fn broadcast(&self, nodes: &[NodeEndpoint], command: AdminCommand) -> Vec<Error> {
        let mut failures = Vec::new();
        for node in nodes {
            let sent = retry_with_backoff(
                || self.send(node, command.clone()),
                BROADCAST_ATTEMPTS,
                self.settings.retry_delay(),
            )
            .await;
            if let Err(e) = sent {
                tracing::warn!("Admin {} on {} failed: {}", command, node.name, e);
                failures.push(e);
            }
        }
        failures
    }

    /// Health check: the node answers a METADATA request.
    ///
    /// A launched node without a ring yet counts as alive; any other FAILED
    /// reply (a timed out request included) does not.
    pub async fn ping(&self, node: &NodeEndpoint) -> Result<Option<Metadata>> {
        let reply = self.request(node, KvMessage::metadata_request()).await?;
        match reply.status {
            StatusType::MetadataSuccess => Ok(reply.metadata),
            StatusType::Failed if reply.error.as_deref() == Some(NO_METADATA) => Ok(None),
            StatusType::Failed if reply.error.as_deref() == Some(REQUEST_TIMED_OUT) => {
                Err(Error::Timeout(format!("{} did not answer", node)))
            }
            other => Err(Error::Protocol(format!(
                "health check answered {}: {}",
                other,
                reply.error.as_deref().unwrap_or("no reason")
            ))),
        }
    }

    /// Poll `node` until it accepts connections or `wait` elapses.
    pub async fn wait_reachable(&self, node: &NodeEndpoint, wait: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + wait;
        let mut delay = Duration::from_millis(50);
        loop {
            match self.ping(node).await {
                Ok(_) => return Ok(()),
                Err(e) if tokio::time::Instant::now() + delay >= deadline => {
                    return Err(Error::Timeout(format!("{} not reachable: {}", node, e)));
                }
                Err(_) => {
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(Duration::from_secs(1));
                }
            }
        }
    }
}
