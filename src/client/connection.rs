//! Client side of one framed TCP connection to a storage node
//!
//! Provides:
//! - Handshake (waits for CONNECTION_ESTABLISHED)
//! - Correlation ids on every request
//! - A watcher task feeding response frames into a bounded queue
//! - Bounded waits: a timed-out request yields a FAILED message
//! - Orderly disconnect

use crate::common::{ClientConfig, Error, Result};
use crate::protocol::{FrameStatus, KvMessage, RequestFrame, ResponseFrame, REQUEST_TIMED_OUT};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// How long `disconnect` waits for the watcher before aborting it
const WATCHER_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Link state of a client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Established,
    Terminated,
}

pub struct Connection {
    peer: String,
    request_timeout: Duration,
    next_id: AtomicU32,
    running: Arc<AtomicBool>,
    state: Arc<RwLock<LinkState>>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    responses: tokio::sync::Mutex<mpsc::Receiver<ResponseFrame>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
    /// Serializes send + receive pairs issued through `request`
    request_lock: tokio::sync::Mutex<()>,
}

impl Connection {
    /// Connect and wait for the server's handshake.
    pub async fn connect(addr: &str, settings: &ClientConfig) -> Result<Self> {
        let connect_timeout = settings.connect_timeout();

        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::Timeout(format!("connecting to {}", addr)))?
            .map_err(|e| Error::ConnectionFailed(format!("{}: {}", addr, e)))?;
        stream.set_nodelay(true)?;

        let (reader, writer) = stream.into_split();
        let (tx, mut rx) = mpsc::channel(settings.queue_capacity.max(1));
        let running = Arc::new(AtomicBool::new(true));
        let state = Arc::new(RwLock::new(LinkState::Connecting));

        let watcher = tokio::spawn(watch_responses(
            reader,
            tx,
            running.clone(),
            state.clone(),
            addr.to_string(),
        ));

        let handshake = tokio::time::timeout(connect_timeout, rx.recv()).await;
        let established = matches!(
            handshake,
            Ok(Some(ResponseFrame {
                status: FrameStatus::ConnectionEstablished,
                ..
            }))
        );
        if !established {
            running.store(false, Ordering::Release);
            watcher.abort();
            return Err(match handshake {
                Err(_) => Error::Timeout(format!("handshake with {}", addr)),
                Ok(None) => Error::ConnectionClosed,
                Ok(Some(frame)) => Error::Protocol(format!(
                    "expected CONNECTION_ESTABLISHED from {}, got {:?}",
                    addr, frame.status
                )),
            });
        }

        set_state(&state, LinkState::Established);
        tracing::debug!("Connected to {}", addr);

        Ok(Self {
            peer: addr.to_string(),
            request_timeout: settings.request_timeout(),
            next_id: AtomicU32::new(1),
            running,
            state,
            writer: tokio::sync::Mutex::new(Some(writer)),
            responses: tokio::sync::Mutex::new(rx),
            watcher: Mutex::new(Some(watcher)),
            request_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn state(&self) -> LinkState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// False once disconnected or the server closed the socket.
    pub fn is_open(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Write one request frame and return its correlation id.
    pub async fn send(&self, message: &KvMessage) -> Result<u32> {
        if !self.is_open() {
            return Err(Error::ConnectionClosed);
        }
        let body = message.encode()?;
        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or(Error::ConnectionClosed)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("-> {} #{} {}", self.peer, id, message.status);
        RequestFrame::new(id, body).write_to(writer).await?;
        Ok(id)
    }

    /// Wait for the response to `id`.
    ///
    /// Responses carrying another id (answers to requests that already timed
    /// out) are dropped. A timeout yields a FAILED message and leaves the
    /// connection usable.
    pub async fn receive(&self, id: u32) -> Result<KvMessage> {
        let mut responses = self.responses.lock().await;
        let deadline = tokio::time::Instant::now() + self.request_timeout;

        loop {
            let frame = match tokio::time::timeout_at(deadline, responses.recv()).await {
                Err(_) => {
                    tracing::warn!("Request #{} to {} timed out", id, self.peer);
                    return Ok(KvMessage::failed(REQUEST_TIMED_OUT));
                }
                Ok(None) => {
                    self.terminate();
                    return Err(Error::ConnectionClosed);
                }
                Ok(Some(frame)) => frame,
            };

            if frame.status == FrameStatus::Disconnected {
                self.terminate();
                return Err(Error::ConnectionClosed);
            }
            if frame.id != id {
                tracing::debug!("Dropping response #{} while waiting for #{}", frame.id, id);
                continue;
            }

            return Ok(match frame.status {
                FrameStatus::Ok => KvMessage::decode(&frame.body).unwrap_or_else(|e| {
                    KvMessage::failed(format!("undecodable response: {}", e))
                }),
                FrameStatus::BadRequest => KvMessage::failed("bad request"),
                status => KvMessage::failed(format!("unexpected frame status {:?}", status)),
            });
        }
    }

    /// Send and wait for the matching response.
    pub async fn request(&self, message: &KvMessage) -> Result<KvMessage> {
        let _guard = self.request_lock.lock().await;
        let id = self.send(message).await?;
        self.receive(id).await
    }

    /// Close the connection; later sends fail with `ConnectionClosed`.
    pub async fn disconnect(&self) {
        self.running.store(false, Ordering::Release);

        if let Some(mut writer) = self.writer.lock().await.take() {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if let Ok(body) = KvMessage::disconnect().encode() {
                let _ = RequestFrame::new(id, body).write_to(&mut writer).await;
            }
            let _ = writer.shutdown().await;
        }

        let watcher = self
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut handle) = watcher {
            if tokio::time::timeout(WATCHER_JOIN_TIMEOUT, &mut handle)
                .await
                .is_err()
            {
                tracing::warn!("Watcher for {} did not stop, aborting", self.peer);
                handle.abort();
            }
        }

        let mut responses = self.responses.lock().await;
        responses.close();
        while responses.try_recv().is_ok() {}

        set_state(&self.state, LinkState::Terminated);
        tracing::debug!("Disconnected from {}", self.peer);
    }

    fn terminate(&self) {
        self.running.store(false, Ordering::Release);
        set_state(&self.state, LinkState::Terminated);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(handle) = self
            .watcher
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

fn set_state(state: &RwLock<LinkState>, next: LinkState) {
    *state.write().unwrap_or_else(PoisonError::into_inner) = next;
}

/// Forward response frames until the peer closes or says DISCONNECTED.
async fn watch_responses(
    mut reader: OwnedReadHalf,
    tx: mpsc::Sender<ResponseFrame>,
    running: Arc<AtomicBool>,
    state: Arc<RwLock<LinkState>>,
    peer: String,
) {
    loop {
        match ResponseFrame::read_from(&mut reader).await {
            Ok(Some(frame)) => {
                let closing = frame.status == FrameStatus::Disconnected;
                if tx.send(frame).await.is_err() || closing {
                    break;
                }
            }
            Ok(None) => {
                tracing::debug!("{} closed the connection", peer);
                break;
            }
            Err(e) => {
                if running.load(Ordering::Acquire) {
                    tracing::warn!("Connection to {} failed: {}", peer, e);
                }
                break;
            }
        }
    }
    running.store(false, Ordering::Release);
    set_state(&state, LinkState::Terminated);
}
