//! Owning registry of live peer sessions.
//!
//! One mutex guards the peer map; every operation, including the media
//! fanout, goes through it, so a session can never be reaped mid-send. A
//! background reaper erases sessions whose terminal closed flag is set.

use crate::config::WebRtcConfig;
use crate::webrtc::peer::{PeerSession, PeerStats, SignalingCallback};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Reaper wake period
const REAP_INTERVAL_MS: u64 = 2000;

/// Cancellation granularity inside the reaper sleep
const SLEEP_SLICE_MS: u64 = 100;

#[derive(Debug, Clone, Default)]
pub struct RegistryStats {
    pub total_peers: usize,
    pub connected_peers: usize,
    pub total_rtp_packets_sent: u64,
    pub total_bytes_sent: u64,
}

pub struct PeerRegistry {
    config: WebRtcConfig,
    peers: Arc<Mutex<HashMap<String, Arc<PeerSession>>>>,
    shutdown: StdMutex<Option<CancellationToken>>,
    reaper: StdMutex<Option<tokio::task::JoinHandle<()>>>,
    keyframe_cb: StdMutex<Option<Arc<dyn Fn() + Send + Sync>>>,
}

impl PeerRegistry {
    pub fn new(config: WebRtcConfig) -> Self {
        Self {
            config,
            peers: Arc::new(Mutex::new(HashMap::new())),
            shutdown: StdMutex::new(None),
            reaper: StdMutex::new(None),
            keyframe_cb: StdMutex::new(None),
        }
    }

    /// Invoked whenever a viewer finishes negotiation and wants a fresh
    /// decodable point; wired to the pipeline's keyframe request
    pub fn set_keyframe_callback(&self, cb: Arc<dyn Fn() + Send + Sync>) {
        *self.keyframe_cb.lock().unwrap() = Some(cb);
    }

    /// Create a session for a new client. Returns `None` when the registry
    /// is at capacity or construction fails; the session is in the map
    /// before any signaling callback for its id can fire.
    pub async fn create_peer(&self, signaling_cb: SignalingCallback) -> Option<String> {
        let mut peers = self.peers.lock().await;

        if peers.len() >= self.config.max_peers {
            log::warn!(
                "Max peers ({}) reached, rejecting new connection",
                self.config.max_peers
            );
            return None;
        }

        let mut peer_id = generate_peer_id();
        while peers.contains_key(&peer_id) {
            peer_id = generate_peer_id();
        }

        match PeerSession::new(peer_id.clone(), &self.config, signaling_cb).await {
            Ok(session) => {
                peers.insert(peer_id.clone(), Arc::new(session));
                log::info!("Created peer: {} (total: {})", peer_id, peers.len());
                Some(peer_id)
            }
            Err(e) => {
                log::error!("Failed to create peer: {}", e);
                None
            }
        }
    }

    pub async fn start_offer(&self, peer_id: &str) {
        let peers = self.peers.lock().await;
        match peers.get(peer_id) {
            Some(session) => {
                if let Err(e) = session.start_offer().await {
                    log::error!("[{}] Offer failed: {}", peer_id, e);
                }
            }
            None => log::warn!("Unknown peer for offer: {}", peer_id),
        }
    }

    pub async fn handle_answer(&self, peer_id: &str, sdp: &str) {
        let peers = self.peers.lock().await;
        match peers.get(peer_id) {
            Some(session) => {
                if let Err(e) = session.handle_answer(sdp).await {
                    log::warn!("[{}] Answer rejected: {}", peer_id, e);
                    return;
                }
                // A decodable point lets the new viewer start immediately
                let cb = self.keyframe_cb.lock().unwrap().clone();
                if let Some(cb) = cb {
                    cb();
                }
            }
            None => log::warn!("Unknown peer for answer: {}", peer_id),
        }
    }

    pub async fn handle_candidate(&self, peer_id: &str, candidate: &str, mid: &str) {
        let peers = self.peers.lock().await;
        match peers.get(peer_id) {
            Some(session) => session.handle_candidate(candidate, mid).await,
            None => log::warn!("Unknown peer for candidate: {}", peer_id),
        }
    }

    /// Drop a session and close its connection. Safe to call repeatedly;
    /// the second call is a no-op.
    pub async fn remove_peer(&self, peer_id: &str) {
        let removed = {
            let mut peers = self.peers.lock().await;
            let removed = peers.remove(peer_id);
            if removed.is_some() {
                log::info!("Removed peer: {} (remaining: {})", peer_id, peers.len());
            }
            removed
        };
        if let Some(session) = removed {
            session.close().await;
        }
    }

    /// Fan one access unit out to every connected session. The map lock is
    /// held for the duration; each send is non-blocking packetization plus
    /// a best-effort UDP write.
    pub async fn broadcast_nal(&self, data: &[u8], timestamp_us: u64) {
        let peers = self.peers.lock().await;
        for session in peers.values() {
            if session.is_connected() {
                session.send_h264_nal(data, timestamp_us).await;
            }
        }
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.lock().await.len()
    }

    /// Handle to a live session, for observation
    pub async fn get_session(&self, peer_id: &str) -> Option<Arc<PeerSession>> {
        self.peers.lock().await.get(peer_id).cloned()
    }

    pub async fn peer_stats(&self, peer_id: &str) -> Option<PeerStats> {
        let peers = self.peers.lock().await;
        peers.get(peer_id).map(|s| s.get_stats())
    }

    pub async fn get_stats(&self) -> RegistryStats {
        let peers = self.peers.lock().await;
        let mut stats = RegistryStats {
            total_peers: peers.len(),
            ..Default::default()
        };
        for session in peers.values() {
            if session.is_connected() {
                stats.connected_peers += 1;
            }
            let ps = session.get_stats();
            stats.total_rtp_packets_sent += ps.rtp_packets_sent;
            stats.total_bytes_sent += ps.bytes_sent;
        }
        stats
    }

    /// Spawn the reaper
    pub fn start(&self) {
        let token = CancellationToken::new();
        *self.shutdown.lock().unwrap() = Some(token.clone());

        let peers = Arc::clone(&self.peers);
        let handle = tokio::spawn(reaper_loop(peers, token));
        *self.reaper.lock().unwrap() = Some(handle);

        log::info!("Peer registry started (max peers: {})", self.config.max_peers);
    }

    /// Stop the reaper, then close and drop every session
    pub async fn stop(&self) {
        if let Some(token) = self.shutdown.lock().unwrap().take() {
            token.cancel();
        }
        let handle = self.reaper.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        let drained: Vec<Arc<PeerSession>> = {
            let mut peers = self.peers.lock().await;
            peers.drain().map(|(_, s)| s).collect()
        };
        for session in drained {
            session.close().await;
        }
        log::info!("Peer registry stopped");
    }
}

async fn reaper_loop(
    peers: Arc<Mutex<HashMap<String, Arc<PeerSession>>>>,
    token: CancellationToken,
) {
    'outer: loop {
        let mut elapsed = 0u64;
        while elapsed < REAP_INTERVAL_MS {
            tokio::select! {
                _ = token.cancelled() => break 'outer,
                _ = tokio::time::sleep(std::time::Duration::from_millis(SLEEP_SLICE_MS)) => {}
            }
            elapsed += SLEEP_SLICE_MS;
        }

        let reaped: Vec<(String, Arc<PeerSession>)> = {
            let mut peers = peers.lock().await;
            let dead: Vec<String> = peers
                .iter()
                .filter(|(_, s)| s.is_closed())
                .map(|(id, _)| id.clone())
                .collect();
            dead.into_iter()
                .filter_map(|id| peers.remove(&id).map(|s| (id, s)))
                .collect()
        };

        for (peer_id, session) in reaped {
            log::info!("Cleaning up disconnected peer: {}", peer_id);
            session.close().await;
        }
    }
}

fn generate_peer_id() -> String {
    format!("peer-{:08x}", rand::random::<u32>())
}
