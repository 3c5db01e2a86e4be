//! Application messages carried in frame bodies
//!
//! Encoded with bincode. Client and server of the same build always agree;
//! the encoding is not meant to be stable across versions.

use crate::common::{Metadata, NodeEndpoint, Result, RingPosition};
use serde::{Deserialize, Serialize};

/// FAILED reason of a node that has not been given a ring yet
pub const NO_METADATA: &str = "no metadata installed";

/// FAILED reason the client reports when no response arrived in time
pub const REQUEST_TIMED_OUT: &str = "request timed out";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusType {
    Get,
    GetSuccess,
    GetError,
    Put,
    PutSuccess,
    PutUpdate,
    PutError,
    DeleteSuccess,
    DeleteError,
    ServerStopped,
    ServerWriteLock,
    ServerNotResponsible,
    /// Request for the node's current metadata
    Metadata,
    MetadataSuccess,
    /// Replica push, applied without ownership checks
    Replicate,
    Disconnect,
    /// Synthesized locally: timeout, undecodable reply, bad request
    Failed,
    Admin,
    AdminSuccess,
    AdminError,
}

impl StatusType {
    /// Did the server apply (or acknowledge) the write?
    pub fn is_write_ack(self) -> bool {
        matches!(
            self,
            StatusType::PutSuccess
                | StatusType::PutUpdate
                | StatusType::DeleteSuccess
                | StatusType::DeleteError
        )
    }
}

impl std::fmt::Display for StatusType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StatusType::Get => "GET",
            StatusType::GetSuccess => "GET_SUCCESS",
            StatusType::GetError => "GET_ERROR",
            StatusType::Put => "PUT",
            StatusType::PutSuccess => "PUT_SUCCESS",
            StatusType::PutUpdate => "PUT_UPDATE",
            StatusType::PutError => "PUT_ERROR",
            StatusType::DeleteSuccess => "DELETE_SUCCESS",
            StatusType::DeleteError => "DELETE_ERROR",
            StatusType::ServerStopped => "SERVER_STOPPED",
            StatusType::ServerWriteLock => "SERVER_WRITE_LOCK",
            StatusType::ServerNotResponsible => "SERVER_NOT_RESPONSIBLE",
            StatusType::Metadata => "METADATA",
            StatusType::MetadataSuccess => "METADATA_SUCCESS",
            StatusType::Replicate => "REPLICATE",
            StatusType::Disconnect => "DISCONNECT",
            StatusType::Failed => "FAILED",
            StatusType::Admin => "ADMIN",
            StatusType::AdminSuccess => "ADMIN_SUCCESS",
            StatusType::AdminError => "ADMIN_ERROR",
        };
        f.write_str(name)
    }
}

/// Commands the ECS sends to storage nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdminCommand {
    /// Begin serving client requests
    Start,
    /// Answer client requests with SERVER_STOPPED
    Stop,
    /// Reject writes with SERVER_WRITE_LOCK
    LockWrite,
    UnlockWrite,
    UpdateMetadata(Metadata),
    /// Copy every record in `(start, end]` to `target`
    Transfer {
        target: NodeEndpoint,
        start: RingPosition,
        end: RingPosition,
    },
    /// Drop local records in `(start, end]`
    RemoveRange { start: RingPosition, end: RingPosition },
    Shutdown,
}

impl std::fmt::Display for AdminCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdminCommand::Start => write!(f, "start"),
            AdminCommand::Stop => write!(f, "stop"),
            AdminCommand::LockWrite => write!(f, "lock-write"),
            AdminCommand::UnlockWrite => write!(f, "unlock-write"),
            AdminCommand::UpdateMetadata(meta) => write!(f, "update-metadata({} nodes)", meta.len()),
            AdminCommand::Transfer { target, .. } => write!(f, "transfer -> {}", target.name),
            AdminCommand::RemoveRange { .. } => write!(f, "remove-range"),
            AdminCommand::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Body of every request and response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvMessage {
    pub status: StatusType,
    pub key: Option<String>,
    pub value: Option<String>,
    pub metadata: Option<Metadata>,
    pub admin: Option<AdminCommand>,
    pub error: Option<String>,
}

impl KvMessage {
    pub fn new(status: StatusType) -> Self {
        Self {
            status,
            key: None,
            value: None,
            metadata: None,
            admin: None,
            error: None,
        }
    }

    pub fn get(key: impl Into<String>) -> Self {
        Self::new(StatusType::Get).with_key(key)
    }

    /// PUT; `None` deletes the key.
    pub fn put(key: impl Into<String>, value: Option<String>) -> Self {
        let mut msg = Self::new(StatusType::Put).with_key(key);
        msg.value = value;
        msg
    }

    pub fn replicate(key: impl Into<String>, value: Option<String>) -> Self {
        let mut msg = Self::new(StatusType::Replicate).with_key(key);
        msg.value = value;
        msg
    }

    pub fn metadata_request() -> Self {
        Self::new(StatusType::Metadata)
    }

    pub fn disconnect() -> Self {
        Self::new(StatusType::Disconnect)
    }

    pub fn admin(command: AdminCommand) -> Self {
        let mut msg = Self::new(StatusType::Admin);
        msg.admin = Some(command);
        msg
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self::new(StatusType::Failed).with_error(reason)
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

impl std::fmt::Display for KvMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.status)?;
        if let Some(key) = &self.key {
            write!(f, " {}", key)?;
        }
        if let Some(value) = &self.value {
            write!(f, " {}", value)?;
        }
        if let Some(error) = &self.error {
            write!(f, " ({})", error)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::DigestHasher;

    #[test]
    fn test_put_delete_distinction() {
        let put = KvMessage::put("k", Some(String::new()));
        let delete = KvMessage::put("k", None);
        let put = KvMessage::decode(&put.encode().unwrap()).unwrap();
        let delete = KvMessage::decode(&delete.encode().unwrap()).unwrap();
        assert_eq!(put.value.as_deref(), Some(""));
        assert_eq!(delete.value, None);
    }

    #[test]
    fn test_metadata_payload() {
        let hasher = DigestHasher::default();
        let meta = Metadata::new(vec![
            NodeEndpoint::new("a", "127.0.0.1", 5000, &hasher),
            NodeEndpoint::new("b", "127.0.0.1", 5001, &hasher),
        ]);
        let msg = KvMessage::new(StatusType::ServerNotResponsible).with_metadata(meta.clone());
        let decoded = KvMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.metadata, Some(meta));
    }

    #[test]
    fn test_admin_payload() {
        let hasher = DigestHasher::default();
        let target = NodeEndpoint::new("b", "127.0.0.1", 5001, &hasher);
        let msg = KvMessage::admin(AdminCommand::Transfer {
            target: target.clone(),
            start: RingPosition::from_hex("00"),
            end: target.position.clone(),
        });
        let decoded = KvMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(KvMessage::decode(&[0xff, 0xff, 0xff, 0xff, 0xff]).is_err());
    }

    #[test]
    fn test_display() {
        let msg = KvMessage::new(StatusType::GetSuccess)
            .with_key("k")
            .with_value("v");
        assert_eq!(msg.to_string(), "GET_SUCCESS k v");
    }
}
