// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Editor bridge — a loopback-only websocket endpoint that lets a connected
//! editor extension see file-mutating tool calls before they run and decide
//! on them ahead of the interactive approval prompt.
//!
//! # Wire format
//!
//! JSON over WebSocket text frames (same choice as `sven-node`'s `ws.rs`: a
//! browser/editor-side client is comfortable with JSON and it avoids a CBOR
//! dependency on that side). Grounded on that file's `ControlCommand`/
//! `ControlEvent` tagged-enum shape and its `select!` read/write loop, not on
//! its axum transport — this bridge binds a bare `tokio-tungstenite` listener
//! (see `DESIGN.md`) because it is one unauthenticated local endpoint, not a
//! full HTTP surface.
//!
//! # Security
//!
//! Binds `127.0.0.1` only, never `0.0.0.0`. There is no authentication: the
//! bridge is only as trustworthy as the local machine, the same trust model
//! as a Unix domain socket.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use sven_config::EditorConfig;

/// Current wire protocol version, sent in the server's `connection_ack`.
const PROTOCOL_VERSION: u32 = 1;
/// How long a pending change waits for a decision before it is dropped and
/// treated as "no bridge opinion" (falls through to normal approval).
const PENDING_CHANGE_TTL: Duration = Duration::from_secs(30);
/// Bound on how many changes can be awaiting a decision at once, so a
/// disconnected or silent editor cannot leak memory indefinitely.
const MAX_PENDING_CHANGES: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("editor bridge: all {0} candidate ports starting at {1} are in use")]
    NoPortAvailable(u32, u16),
}

/// Tagged JSON protocol between the engine and a connected editor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeMessage {
    /// Sent by the server immediately after a client connects.
    ConnectionAck { protocol_version: u32 },
    /// Server → client: a file-mutating tool call is about to run.
    FileChange { id: String, path: String, diff: String },
    /// Client → server: approve the change named by `id`.
    ApplyChange { id: String },
    /// Client → server: reject the change named by `id`.
    RejectChange { id: String },
}

/// What the editor decided about an advertised change, or that nothing
/// decided in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeDecision {
    Apply,
    Reject,
}

struct PendingChange {
    decision_tx: oneshot::Sender<ChangeDecision>,
    created_at: Instant,
}

/// Shared handle used by the agent loop to advertise a change and, if any
/// editor is connected, await its decision.
#[derive(Clone)]
pub struct BridgeHandle {
    outbound: broadcast::Sender<BridgeMessage>,
    pending: Arc<Mutex<HashMap<String, PendingChange>>>,
}

impl BridgeHandle {
    /// Advertise a pending file change to any connected editor and wait up
    /// to `PENDING_CHANGE_TTL` for a decision.
    ///
    /// Returns `None` when no editor is connected (nothing subscribed to the
    /// outbound channel) or the wait times out — in both cases the caller
    /// should fall through to the normal approval gate rather than block.
    pub async fn advertise_change(&self, path: &str, diff: &str) -> Option<ChangeDecision> {
        if self.outbound.receiver_count() == 0 {
            return None;
        }

        let id = format!("chg_{}", uuid::Uuid::new_v4());
        let (decision_tx, decision_rx) = oneshot::channel();

        {
            let mut pending = self.pending.lock().await;
            evict_expired(&mut pending);
            if pending.len() >= MAX_PENDING_CHANGES {
                warn!("editor bridge pending-change map is full; dropping advertise");
                return None;
            }
            pending.insert(
                id.clone(),
                PendingChange {
                    decision_tx,
                    created_at: Instant::now(),
                },
            );
        }

        let msg = BridgeMessage::FileChange {
            id: id.clone(),
            path: path.to_string(),
            diff: diff.to_string(),
        };
        if self.outbound.send(msg).is_err() {
            self.pending.lock().await.remove(&id);
            return None;
        }

        match tokio::time::timeout(PENDING_CHANGE_TTL, decision_rx).await {
            Ok(Ok(decision)) => Some(decision),
            Ok(Err(_)) | Err(_) => {
                self.pending.lock().await.remove(&id);
                None
            }
        }
    }

    fn resolve(&self, id: &str, decision: ChangeDecision) {
        let pending = Arc::clone(&self.pending);
        let id = id.to_string();
        tokio::spawn(async move {
            if let Some(entry) = pending.lock().await.remove(&id) {
                let _ = entry.decision_tx.send(decision);
            }
        });
    }
}

fn evict_expired(pending: &mut HashMap<String, PendingChange>) {
    pending.retain(|_, v| v.created_at.elapsed() < PENDING_CHANGE_TTL);
}

/// A running editor bridge server. Dropping this stops accepting new
/// connections; existing connections are closed when their tasks notice the
/// listener task has exited.
pub struct EditorBridge {
    pub local_addr: SocketAddr,
    handle: BridgeHandle,
}

impl EditorBridge {
    /// Bind a loopback listener, trying `config.port`, then up to
    /// `config.max_fallbacks` ports above it, and spawn the accept loop.
    pub async fn bind(config: &EditorConfig) -> Result<Self, BridgeError> {
        let mut listener = None;
        let mut bound_addr = None;
        for offset in 0..=config.max_fallbacks {
            let port = config.port.saturating_add(offset as u16);
            let addr: SocketAddr = ([127, 0, 0, 1], port).into();
            match TcpListener::bind(addr).await {
                Ok(l) => {
                    bound_addr = Some(addr);
                    listener = Some(l);
                    break;
                }
                Err(e) => {
                    debug!(port, "editor bridge could not bind: {e}");
                }
            }
        }
        let listener = listener.ok_or(BridgeError::NoPortAvailable(
            config.max_fallbacks,
            config.port,
        ))?;
        let local_addr = bound_addr.expect("set alongside listener");

        let (outbound, _) = broadcast::channel(64);
        let handle = BridgeHandle {
            outbound,
            pending: Arc::new(Mutex::new(HashMap::new())),
        };

        let accept_handle = handle.clone();
        tokio::spawn(async move {
            info!(%local_addr, "editor bridge listening");
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let h = accept_handle.clone();
                        tokio::spawn(async move { handle_connection(stream, peer, h).await });
                    }
                    Err(e) => {
                        warn!("editor bridge accept failed: {e}");
                        break;
                    }
                }
            }
        });

        Ok(Self { local_addr, handle })
    }

    pub fn handle(&self) -> BridgeHandle {
        self.handle.clone()
    }
}

async fn handle_connection(stream: tokio::net::TcpStream, peer: SocketAddr, handle: BridgeHandle) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(%peer, "editor bridge websocket handshake failed: {e}");
            return;
        }
    };
    info!(%peer, "editor connected to bridge");

    let (mut sink, mut stream) = ws.split();
    let ack = BridgeMessage::ConnectionAck {
        protocol_version: PROTOCOL_VERSION,
    };
    if send(&mut sink, &ack).await.is_err() {
        return;
    }

    let mut outbound = handle.outbound.subscribe();
    loop {
        tokio::select! {
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        match serde_json::from_str::<BridgeMessage>(&text) {
                            Ok(BridgeMessage::ApplyChange { id }) => handle.resolve(&id, ChangeDecision::Apply),
                            Ok(BridgeMessage::RejectChange { id }) => handle.resolve(&id, ChangeDecision::Reject),
                            Ok(other) => debug!(%peer, "unexpected bridge message from client: {other:?}"),
                            Err(e) => warn!(%peer, "invalid bridge message JSON: {e}"),
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(%peer, "editor bridge recv error: {e}");
                        break;
                    }
                }
            }
            broadcast_msg = outbound.recv() => {
                match broadcast_msg {
                    Ok(msg) => {
                        if send(&mut sink, &msg).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(%peer, "editor bridge client lagged by {n} messages");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
    info!(%peer, "editor disconnected from bridge");
}

async fn send(
    sink: &mut (impl SinkExt<WsMessage> + Unpin),
    msg: &BridgeMessage,
) -> Result<(), ()> {
    let text = serde_json::to_string(msg).map_err(|_| ())?;
    sink.send(WsMessage::Text(text)).await.map_err(|_| ())
}
