//! WebSocket signaling broker.
//!
//! Terminates browser WebSockets, binds each socket to exactly one peer
//! session, and shuttles JSON envelopes both ways. The signaling callback
//! handed to the registry holds the client's outbound channel sender; once
//! the socket's writer task is gone those sends fail silently, which breaks
//! the callback/socket reference cycle at disconnect.

use crate::config::AppConfig;
use crate::errors::StreamError;
use crate::signaling::protocol::{self, CandidateData, ServerMessage};
use crate::types::BitrateCallback;
use crate::webrtc::peer::SignalingCallback;
use crate::webrtc::registry::PeerRegistry;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

type OutboundSender = mpsc::UnboundedSender<Message>;

pub struct SignalingBroker {
    config: AppConfig,
    registry: Arc<PeerRegistry>,
    bitrate_cb: StdMutex<Option<BitrateCallback>>,
    clients: Arc<Mutex<HashMap<String, OutboundSender>>>,
    shutdown: StdMutex<Option<CancellationToken>>,
    accept_task: StdMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SignalingBroker {
    pub fn new(config: AppConfig, registry: Arc<PeerRegistry>) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry,
            bitrate_cb: StdMutex::new(None),
            clients: Arc::new(Mutex::new(HashMap::new())),
            shutdown: StdMutex::new(None),
            accept_task: StdMutex::new(None),
        })
    }

    /// Wire browser bitrate hints into the encoder
    pub fn set_bitrate_callback(&self, cb: BitrateCallback) {
        *self.bitrate_cb.lock().unwrap() = Some(cb);
    }

    /// Bind the signaling port and spawn the accept loop. A bind failure is
    /// fatal to startup.
    pub async fn start(self: &Arc<Self>) -> Result<(), StreamError> {
        let port = self.config.server.signaling_port;
        let listener = TcpListener::bind(("0.0.0.0", port)).await.map_err(|e| {
            StreamError::SignalingError(format!("Failed to bind signaling port {}: {}", port, e))
        })?;

        let token = CancellationToken::new();
        *self.shutdown.lock().unwrap() = Some(token.clone());

        let broker = Arc::clone(self);
        let handle = tokio::spawn(async move {
            log::info!(
                "Signaling server listening on ws://0.0.0.0:{}",
                broker.config.server.signaling_port
            );
            loop {
                let accepted = tokio::select! {
                    _ = token.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                match accepted {
                    Ok((stream, addr)) => {
                        log::debug!("New WebSocket connection from {}", addr);
                        let broker = Arc::clone(&broker);
                        let token = token.clone();
                        tokio::spawn(async move {
                            broker.handle_client(stream, token).await;
                        });
                    }
                    Err(e) => log::warn!("Accept failed: {}", e),
                }
            }
            log::info!("Signaling accept loop stopped");
        });
        *self.accept_task.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Stop accepting, close every client, and drop the client map
    pub async fn stop(&self) {
        if let Some(token) = self.shutdown.lock().unwrap().take() {
            token.cancel();
        }
        let handle = self.accept_task.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        let mut clients = self.clients.lock().await;
        for (_, tx) in clients.drain() {
            let _ = tx.send(Message::Close(None));
        }
        log::info!("Signaling server stopped");
    }

    pub async fn client_count(&self) -> usize {
        self.clients.lock().await.len()
    }

    async fn handle_client(self: Arc<Self>, stream: TcpStream, token: CancellationToken) {
        let ws = match tokio_tungstenite::accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                log::warn!("WebSocket handshake failed: {}", e);
                return;
            }
        };

        let (mut sink, mut reader) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

        // Writer task owns the sink; dropping every sender ends it
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if sink.send(msg).await.is_err() || closing {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        // Signaling callback: peer session events → JSON envelopes out
        let sig_tx = tx.clone();
        let signaling_cb: SignalingCallback = Arc::new(move |kind: &str, payload: &str| {
            if let Some(envelope) = ServerMessage::from_signaling_event(kind, payload) {
                let _ = sig_tx.send(Message::Text(envelope.to_json()));
            }
        });

        let Some(peer_id) = self.registry.create_peer(signaling_cb).await else {
            log::warn!("Rejected client: max peers reached");
            let _ = tx.send(Message::Text(protocol::server_full_message().to_json()));
            let _ = tx.send(Message::Close(None));
            return;
        };

        log::info!("Client connected, assigned peer: {}", peer_id);

        let welcome = ServerMessage::Welcome {
            peer_id: peer_id.clone(),
            ice_servers: self.config.ice_servers(),
        };
        let _ = tx.send(Message::Text(welcome.to_json()));

        self.clients.lock().await.insert(peer_id.clone(), tx.clone());

        // The server owns the sendonly track, so it makes the offer
        self.registry.start_offer(&peer_id).await;

        loop {
            let incoming = tokio::select! {
                _ = token.cancelled() => break,
                incoming = reader.next() => incoming,
            };
            match incoming {
                Some(Ok(Message::Text(text))) => {
                    self.handle_message(&peer_id, &tx, &text).await;
                }
                Some(Ok(Message::Ping(payload))) => {
                    let _ = tx.send(Message::Pong(payload));
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::warn!("[{}] WebSocket error: {}", peer_id, e);
                    break;
                }
            }
        }

        self.disconnect(&peer_id).await;
    }

    async fn handle_message(&self, peer_id: &str, tx: &OutboundSender, text: &str) {
        let msg: serde_json::Value = match serde_json::from_str(text) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("[{}] Invalid JSON message: {}", peer_id, e);
                return;
            }
        };
        let kind = msg.get("type").and_then(|t| t.as_str()).unwrap_or("");

        match kind {
            "answer" => {
                let sdp = msg.get("sdp").and_then(|s| s.as_str()).unwrap_or("");
                if !sdp.is_empty() {
                    log::debug!("[{}] Received SDP answer", peer_id);
                    self.registry.handle_answer(peer_id, sdp).await;
                }
            }
            "candidate" => {
                let data: CandidateData = msg
                    .get("data")
                    .cloned()
                    .and_then(|d| serde_json::from_value(d).ok())
                    .unwrap_or(CandidateData {
                        candidate: String::new(),
                        sdp_mid: "0".to_string(),
                    });
                if !data.candidate.is_empty() {
                    log::debug!("[{}] Received ICE candidate", peer_id);
                    self.registry
                        .handle_candidate(peer_id, &data.candidate, &data.sdp_mid)
                        .await;
                }
            }
            "ping" => {
                let _ = tx.send(Message::Text(ServerMessage::Pong.to_json()));
            }
            "bitrate" => {
                if let Some(kbps) = msg.get("kbps").and_then(|k| k.as_u64()) {
                    let cb = self.bitrate_cb.lock().unwrap().clone();
                    if let Some(cb) = cb {
                        cb(kbps.min(u64::from(u32::MAX)) as u32);
                    }
                }
            }
            other => {
                log::debug!("[{}] Unknown message type: {}", peer_id, other);
            }
        }
    }

    /// Idempotent: close and error paths both land here
    async fn disconnect(&self, peer_id: &str) {
        let removed = self.clients.lock().await.remove(peer_id);
        self.registry.remove_peer(peer_id).await;
        if removed.is_some() {
            log::info!("Client disconnected: {}", peer_id);
        }
    }
}
