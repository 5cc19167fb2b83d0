//! Supervised ingest pipeline.
//!
//! Owns the media source lifecycle: builds the configured source variant,
//! drives it to Playing, and rebuilds it after upstream failures with an
//! interruptible backoff. Produced access units flow through a bounded tap
//! (drop-oldest) into the installed NAL callback.

use crate::config::AppConfig;
use crate::ingest::encoder::{EncoderHandle, EncoderMode};
use crate::ingest::source::{self, SourceContext, SourceKind};
use crate::types::{NalBatch, NalCallback};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Bounded tap depth; overflow drops the oldest batches
const TAP_CAPACITY: usize = 5;

/// Cancellation granularity for reconnect backoff sleeps
const SLEEP_SLICE_MS: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Stopped,
    Building,
    Playing,
    Reconnecting,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Stopped => "stopped",
            PipelineState::Building => "building",
            PipelineState::Playing => "playing",
            PipelineState::Reconnecting => "reconnecting",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineStats {
    pub state: PipelineState,
    pub frames_received: u64,
    pub bytes_received: u64,
    pub reconnect_count: u64,
    pub dropped_batches: u64,
    pub connected: bool,
}

impl Default for PipelineStats {
    fn default() -> Self {
        Self {
            state: PipelineState::Stopped,
            frames_received: 0,
            bytes_received: 0,
            reconnect_count: 0,
            dropped_batches: 0,
            connected: false,
        }
    }
}

/// Supervised media source with self-healing reconnect
pub struct IngestPipeline {
    config: AppConfig,
    kind: SourceKind,
    callback: Mutex<Option<NalCallback>>,
    stats: Arc<Mutex<PipelineStats>>,
    encoder_handle: Option<Arc<EncoderHandle>>,
    running: AtomicBool,
    shutdown: Mutex<Option<CancellationToken>>,
    supervisor: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl IngestPipeline {
    pub fn new(config: AppConfig) -> Self {
        let kind = SourceKind::select(&config);
        let encoder_handle = kind.has_encoder().then(|| {
            let mode = if config.encoding.hw_encode {
                EncoderMode::Hardware
            } else {
                EncoderMode::Software
            };
            Arc::new(EncoderHandle::new(mode, config.webrtc.video.bitrate_kbps))
        });

        Self {
            config,
            kind,
            callback: Mutex::new(None),
            stats: Arc::new(Mutex::new(PipelineStats::default())),
            encoder_handle,
            running: AtomicBool::new(false),
            shutdown: Mutex::new(None),
            supervisor: Mutex::new(None),
        }
    }

    /// Install the sink for produced access units. Must be called before
    /// `start`. The tap task awaits each invocation in order; if the sink
    /// falls behind, the bounded tap drops the oldest batches and counts
    /// them in `dropped_batches`.
    pub fn set_nal_callback(&self, callback: NalCallback) {
        *self.callback.lock().unwrap() = Some(callback);
    }

    /// Spawn the supervisor. Idempotent while running; failures surface via
    /// stats and logs rather than the return path.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            log::warn!("Pipeline already running");
            return;
        }

        let token = CancellationToken::new();
        *self.shutdown.lock().unwrap() = Some(token.clone());

        let config = self.config.clone();
        let kind = self.kind;
        let stats = Arc::clone(&self.stats);
        let callback = self.callback.lock().unwrap().clone();
        let encoder_handle = self.encoder_handle.clone();

        let handle = tokio::spawn(async move {
            supervisor_loop(config, kind, stats, callback, encoder_handle, token).await;
        });
        *self.supervisor.lock().unwrap() = Some(handle);
    }

    /// Request shutdown, halt the source, and join the supervisor. Safe to
    /// call from any state, including before `start`.
    pub async fn stop(&self) {
        if let Some(token) = self.shutdown.lock().unwrap().take() {
            token.cancel();
        }
        let handle = self.supervisor.lock().unwrap().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                log::warn!("Pipeline supervisor join failed: {}", e);
            }
        }
        self.running.store(false, Ordering::SeqCst);
        let mut stats = self.stats.lock().unwrap();
        stats.state = PipelineState::Stopped;
        stats.connected = false;
    }

    /// Clamp and apply a bitrate target. No-op without an encoder or when
    /// the pipeline is not playing.
    pub fn set_bitrate(&self, kbps: u32) {
        let Some(handle) = self.encoder_handle.as_ref() else {
            log::debug!("Bitrate hint ignored: no encoder in this graph");
            return;
        };
        if self.state() != PipelineState::Playing {
            log::debug!("Bitrate hint ignored: pipeline not playing");
            return;
        }

        let video = &self.config.webrtc.video;
        let clamped = kbps.clamp(video.min_bitrate_kbps, video.max_bitrate_kbps);
        handle.set_bitrate(clamped);
    }

    pub fn get_stats(&self) -> PipelineStats {
        self.stats.lock().unwrap().clone()
    }

    pub fn state(&self) -> PipelineState {
        self.stats.lock().unwrap().state
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Encoder handle, when the configured graph has one
    pub fn encoder_handle(&self) -> Option<Arc<EncoderHandle>> {
        self.encoder_handle.clone()
    }

    /// Force the next encoded frame to be an IDR so a newly negotiated
    /// viewer can start decoding immediately. No-op on passthrough, where
    /// keyframe cadence is the camera's.
    pub fn request_keyframe(&self) {
        if let Some(handle) = self.encoder_handle.as_ref() {
            handle.request_idr();
        }
    }
}

async fn supervisor_loop(
    config: AppConfig,
    kind: SourceKind,
    stats: Arc<Mutex<PipelineStats>>,
    callback: Option<NalCallback>,
    encoder_handle: Option<Arc<EncoderHandle>>,
    token: CancellationToken,
) {
    log::info!("Pipeline supervisor started ({:?})", kind);
    let mut failed_attempts = 0u32;

    while !token.is_cancelled() {
        set_state(&stats, PipelineState::Building);

        let (tx, rx) = broadcast::channel::<NalBatch>(TAP_CAPACITY);
        let tap = tokio::spawn(tap_task(
            rx,
            callback.clone(),
            Arc::clone(&stats),
            token.clone(),
        ));

        let reached_playing = Arc::new(AtomicBool::new(false));
        let on_playing: Arc<dyn Fn() + Send + Sync> = {
            let stats = Arc::clone(&stats);
            let reached = Arc::clone(&reached_playing);
            Arc::new(move || {
                reached.store(true, Ordering::SeqCst);
                let mut s = stats.lock().unwrap();
                s.state = PipelineState::Playing;
                s.connected = true;
                log::info!("Pipeline is playing");
            })
        };

        let ctx = SourceContext {
            tx,
            shutdown: token.clone(),
            encoder_handle: encoder_handle.clone(),
            on_playing,
        };

        let result = source::run(kind, &config, &ctx).await;
        drop(ctx);
        let _ = tap.await;

        stats.lock().unwrap().connected = false;

        if token.is_cancelled() {
            break;
        }

        match result {
            Ok(()) => break,
            Err(e) => log::error!("Pipeline ended unexpectedly: {}", e),
        }

        if reached_playing.load(Ordering::SeqCst) {
            failed_attempts = 0;
        } else {
            failed_attempts += 1;
        }

        let max = config.rtsp.reconnect_max_attempts;
        if max > 0 && failed_attempts >= max {
            log::error!("Giving up after {} failed reconnect attempts", failed_attempts);
            break;
        }

        set_state(&stats, PipelineState::Reconnecting);
        stats.lock().unwrap().reconnect_count += 1;

        let interval_ms = config.rtsp.reconnect_interval_ms;
        log::info!("Reconnecting in {}ms...", interval_ms);
        if !interruptible_sleep(interval_ms, &token).await {
            break;
        }
    }

    {
        let mut s = stats.lock().unwrap();
        s.state = PipelineState::Stopped;
        s.connected = false;
    }
    log::info!("Pipeline supervisor stopped");
}

/// Drain the bounded tap into the installed callback, counting dropped
/// batches from lagged reads
async fn tap_task(
    mut rx: broadcast::Receiver<NalBatch>,
    callback: Option<NalCallback>,
    stats: Arc<Mutex<PipelineStats>>,
    token: CancellationToken,
) {
    loop {
        let batch = tokio::select! {
            _ = token.cancelled() => break,
            batch = rx.recv() => batch,
        };

        match batch {
            Ok(batch) => {
                if let Some(callback) = callback.as_ref() {
                    callback(&batch.data, batch.timestamp_us).await;
                }
                let mut s = stats.lock().unwrap();
                s.frames_received += 1;
                s.bytes_received += batch.len() as u64;
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                stats.lock().unwrap().dropped_batches += n;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn set_state(stats: &Arc<Mutex<PipelineStats>>, state: PipelineState) {
    let mut s = stats.lock().unwrap();
    if s.state != state {
        log::debug!("Pipeline state: {} -> {}", s.state.as_str(), state.as_str());
        s.state = state;
    }
}

/// Sleep `total_ms` in 100 ms slices; returns false when cancelled
async fn interruptible_sleep(total_ms: u64, token: &CancellationToken) -> bool {
    let mut elapsed = 0u64;
    while elapsed < total_ms {
        if token.is_cancelled() {
            return false;
        }
        let slice = SLEEP_SLICE_MS.min(total_ms - elapsed);
        tokio::select! {
            _ = token.cancelled() => return false,
            _ = tokio::time::sleep(std::time::Duration::from_millis(slice)) => {}
        }
        elapsed += slice;
    }
    !token.is_cancelled()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_test_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.webrtc.video.width = 64;
        config.webrtc.video.height = 48;
        config.webrtc.video.fps = 10;
        config
    }

    #[tokio::test]
    async fn stop_before_start_is_safe() {
        let pipeline = IngestPipeline::new(small_test_config());
        pipeline.stop().await;
        pipeline.stop().await;
        assert_eq!(pipeline.state(), PipelineState::Stopped);
        assert!(!pipeline.is_running());
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let pipeline = IngestPipeline::new(small_test_config());
        pipeline.start();
        pipeline.start();
        assert!(pipeline.is_running());
        pipeline.stop().await;
        assert!(!pipeline.is_running());
    }

    #[tokio::test]
    async fn bitrate_is_noop_when_not_playing() {
        let pipeline = IngestPipeline::new(small_test_config());
        let handle = pipeline.encoder_handle().unwrap();
        let before = handle.bitrate_property();
        pipeline.set_bitrate(50);
        assert_eq!(handle.bitrate_property(), before);
    }

    #[tokio::test]
    async fn max_attempts_halts_supervisor() {
        let mut config = AppConfig::default();
        config.rtsp.url = "rtsp://127.0.0.1:1/none".to_string();
        config.rtsp.reconnect_interval_ms = 50;
        config.rtsp.reconnect_max_attempts = 2;

        let pipeline = IngestPipeline::new(config);
        pipeline.start();

        // Wait for the supervisor to take its first failed attempt, then
        // for it to give up
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(10);
        while pipeline.get_stats().reconnect_count < 1 {
            assert!(
                tokio::time::Instant::now() < deadline,
                "no reconnect attempt happened"
            );
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        while pipeline.state() != PipelineState::Stopped {
            assert!(
                tokio::time::Instant::now() < deadline,
                "supervisor did not give up in time"
            );
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        pipeline.stop().await;
    }
}
