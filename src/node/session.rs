//! One client connection on a storage node
//!
//! Handshake, then strictly one response per request, in request order.

use crate::common::{validate_key, validate_value, Error, Result};
use crate::node::server::{NodeState, ServingState};
use crate::node::storage::PutOutcome;
use crate::protocol::{
    AdminCommand, FrameStatus, KvMessage, RequestFrame, ResponseFrame, StatusType, NO_METADATA,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;

/// Serve one accepted socket until the peer leaves or the node shuts down.
pub async fn run(state: Arc<NodeState>, socket: TcpStream, peer: SocketAddr) -> Result<()> {
    socket.set_nodelay(true)?;
    let (mut reader, mut writer) = socket.into_split();
    let mut shutdown = state.subscribe_shutdown();

    ResponseFrame::empty(0, FrameStatus::ConnectionEstablished)
        .write_to(&mut writer)
        .await?;
    tracing::debug!("Session opened: {}", peer);

    loop {
        if *shutdown.borrow_and_update() {
            break;
        }
        let frame = tokio::select! {
            frame = RequestFrame::read_from(&mut reader) => frame,
            _ = shutdown.changed() => break,
        };
        let frame = match frame {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("Session {}: read failed: {}", peer, e);
                break;
            }
        };

        let request = match KvMessage::decode(&frame.body) {
            Ok(request) => request,
            Err(e) => {
                tracing::debug!("Session {}: bad request #{}: {}", peer, frame.id, e);
                ResponseFrame::empty(frame.id, FrameStatus::BadRequest)
                    .write_to(&mut writer)
                    .await?;
                continue;
            }
        };

        if request.status == StatusType::Disconnect {
            ResponseFrame::empty(frame.id, FrameStatus::Disconnected)
                .write_to(&mut writer)
                .await?;
            break;
        }

        tracing::debug!("Session {}: #{} {}", peer, frame.id, request.status);
        let response = dispatch(&state, request).await;
        ResponseFrame::new(frame.id, FrameStatus::Ok, response.encode()?)
            .write_to(&mut writer)
            .await?;
    }

    tracing::debug!("Session closed: {}", peer);
    Ok(())
}

/// Answer one decoded request.
pub async fn dispatch(state: &NodeState, request: KvMessage) -> KvMessage {
    match request.status {
        StatusType::Get => handle_get(state, request).await,
        StatusType::Put => handle_put(state, request).await,
        StatusType::Replicate => handle_replicate(state, request).await,
        StatusType::Metadata => match state.metadata() {
            Some(metadata) => {
                KvMessage::new(StatusType::MetadataSuccess).with_metadata((*metadata).clone())
            }
            None => KvMessage::failed(NO_METADATA),
        },
        StatusType::Admin => handle_admin(state, request).await,
        other => KvMessage::failed(format!("unexpected request {}", other)),
    }
}

fn not_responsible(state: &NodeState, key: String) -> KvMessage {
    let mut reply = KvMessage::new(StatusType::ServerNotResponsible).with_key(key);
    reply.metadata = state.metadata().map(|m| (*m).clone());
    reply
}

async fn handle_get(state: &NodeState, request: KvMessage) -> KvMessage {
    let Some(key) = request.key else {
        return KvMessage::new(StatusType::GetError).with_error("missing key");
    };
    let Some(metadata) = state.metadata() else {
        return KvMessage::new(StatusType::ServerStopped).with_key(key);
    };
    if state.serving() == ServingState::Stopped {
        return KvMessage::new(StatusType::ServerStopped).with_key(key);
    }

    let position = state.hasher().position_of(&key);
    let replicas = state.config().replication_factor;
    if !metadata.is_readable_by(state.name(), &position, replicas) {
        return not_responsible(state, key);
    }

    let store = state.store().clone();
    let lookup = key.clone();
    let result = tokio::task::spawn_blocking(move || store.get(&lookup))
        .await
        .map_err(Error::from)
        .and_then(|r| r);

    match result {
        Ok(Some(value)) => KvMessage::new(StatusType::GetSuccess)
            .with_key(key)
            .with_value(value),
        Ok(None) => KvMessage::new(StatusType::GetError).with_key(key),
        Err(e) => {
            tracing::warn!("GET {} failed: {}", key, e);
            KvMessage::new(StatusType::GetError)
                .with_key(key)
                .with_error(e.to_string())
        }
    }
}

async fn handle_put(state: &NodeState, request: KvMessage) -> KvMessage {
    let Some(key) = request.key else {
        return KvMessage::new(StatusType::PutError).with_error("missing key");
    };
    let Some(metadata) = state.metadata() else {
        return KvMessage::new(StatusType::ServerStopped).with_key(key);
    };
    // a write lock waits for this write to land before it takes effect
    let _permit = state.write_permit().await;
    match state.serving() {
        ServingState::Stopped => return KvMessage::new(StatusType::ServerStopped).with_key(key),
        ServingState::WriteLocked => {
            return KvMessage::new(StatusType::ServerWriteLock).with_key(key)
        }
        ServingState::Serving => {}
    }

    let position = state.hasher().position_of(&key);
    if !metadata.is_responsible(state.name(), &position) {
        return not_responsible(state, key);
    }

    let limits = validate_key(&key, state.config().max_key_len).and_then(|_| match &request.value {
        Some(value) => validate_value(value, state.config().max_value_len),
        None => Ok(()),
    });
    if let Err(e) = limits {
        return write_error(key, request.value.is_none(), e);
    }

    apply_write(state, key, request.value, true).await
}

/// Replica pushes and range transfers: applied without ownership checks.
async fn handle_replicate(state: &NodeState, request: KvMessage) -> KvMessage {
    let Some(key) = request.key else {
        return KvMessage::new(StatusType::PutError).with_error("missing key");
    };
    apply_write(state, key, request.value, false).await
}

fn write_error(key: String, delete: bool, e: Error) -> KvMessage {
    let status = if delete {
        StatusType::DeleteError
    } else {
        StatusType::PutError
    };
    KvMessage::new(status).with_key(key).with_error(e.to_string())
}

/// Store one write; with `record` the replication delta sees it in the same
/// order storage does.
async fn apply_write(
    state: &NodeState,
    key: String,
    value: Option<String>,
    record: bool,
) -> KvMessage {
    let store = state.store().clone();
    let replication = record.then(|| state.replication().clone());
    let (k, v) = (key.clone(), value.clone());
    let result = tokio::task::spawn_blocking(move || {
        store.put_then(&k, v.as_deref(), |_| {
            if let Some(replication) = &replication {
                replication.record(&k, v.as_deref());
            }
        })
    })
    .await
    .map_err(Error::from)
    .and_then(|r| r);

    let status = match result {
        Ok(PutOutcome::Inserted) => StatusType::PutSuccess,
        Ok(PutOutcome::Updated) => StatusType::PutUpdate,
        Ok(PutOutcome::Deleted) => StatusType::DeleteSuccess,
        Ok(PutOutcome::DeleteMissing) => StatusType::DeleteError,
        Err(e) => {
            tracing::warn!("Write of {} failed: {}", key, e);
            return write_error(key, value.is_none(), e);
        }
    };
    let mut reply = KvMessage::new(status).with_key(key);
    reply.value = value;
    reply
}

async fn handle_admin(state: &NodeState, request: KvMessage) -> KvMessage {
    let Some(command) = request.admin else {
        return KvMessage::new(StatusType::AdminError).with_error("missing admin command");
    };
    tracing::info!("Node {}: admin {}", state.name(), command);

    let result = match command {
        AdminCommand::Start => {
            state.set_serving(ServingState::Serving);
            Ok(())
        }
        AdminCommand::Stop => {
            state.set_serving(ServingState::Stopped);
            Ok(())
        }
        AdminCommand::LockWrite => {
            state.lock_writes().await;
            Ok(())
        }
        AdminCommand::UnlockWrite => {
            if state.serving() == ServingState::WriteLocked {
                state.set_serving(ServingState::Serving);
            }
            Ok(())
        }
        AdminCommand::UpdateMetadata(metadata) => {
            state.update_metadata(metadata);
            Ok(())
        }
        AdminCommand::Transfer { target, start, end } => {
            state.transfer(&target, &start, &end).await.map(|_| ())
        }
        AdminCommand::RemoveRange { start, end } => {
            state.remove_range(&start, &end).await.map(|_| ())
        }
        AdminCommand::Shutdown => {
            state.request_shutdown();
            Ok(())
        }
    };

    match result {
        Ok(()) => KvMessage::new(StatusType::AdminSuccess),
        Err(e) => {
            tracing::warn!("Node {}: admin command failed: {}", state.name(), e);
            KvMessage::new(StatusType::AdminError).with_error(e.to_string())
        }
    }
}
