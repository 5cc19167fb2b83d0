//! Component wiring and lifecycle.
//!
//! Builds the pipeline, registry, and broker, wires the media and control
//! callbacks between them, starts them in dependency order, and runs the
//! coarse watchdog that rebuilds a stuck pipeline and logs operator stats.

use crate::config::AppConfig;
use crate::errors::StreamError;
use crate::ingest::{IngestPipeline, PipelineState};
use crate::signaling::SignalingBroker;
use crate::types::{BitrateCallback, NalCallback};
use crate::webrtc::PeerRegistry;
use bytes::Bytes;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Watchdog and stats period
const WATCHDOG_INTERVAL_SECS: u64 = 10;

/// Consecutive unhealthy intervals before the watchdog forces a rebuild;
/// gives the pipeline's own reconnect loop the first chance to recover
const UNHEALTHY_INTERVALS_BEFORE_RESTART: u32 = 2;

pub struct Supervisor {
    pipeline: Arc<IngestPipeline>,
    registry: Arc<PeerRegistry>,
    broker: Arc<SignalingBroker>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Supervisor {
    pub fn new(config: AppConfig) -> Arc<Self> {
        let pipeline = Arc::new(IngestPipeline::new(config.clone()));
        let registry = Arc::new(PeerRegistry::new(config.webrtc.clone()));
        let broker = SignalingBroker::new(config, Arc::clone(&registry));

        // Media path: the tap awaits each broadcast in turn, so ordering is
        // the tap's and backpressure lands on its bounded channel, where
        // drops are counted
        {
            let registry = Arc::clone(&registry);
            let nal_cb: NalCallback = Arc::new(move |data: &[u8], timestamp_us: u64| {
                let registry = Arc::clone(&registry);
                let data = Bytes::copy_from_slice(data);
                Box::pin(async move {
                    registry.broadcast_nal(&data, timestamp_us).await;
                })
            });
            pipeline.set_nal_callback(nal_cb);
        }

        // Control paths
        {
            let pipeline = Arc::clone(&pipeline);
            registry.set_keyframe_callback(Arc::new(move || pipeline.request_keyframe()));
        }
        {
            let pipeline = Arc::clone(&pipeline);
            let bitrate_cb: BitrateCallback =
                Arc::new(move |kbps: u32| pipeline.set_bitrate(kbps));
            broker.set_bitrate_callback(bitrate_cb);
        }

        Arc::new(Self {
            pipeline,
            registry,
            broker,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Start components in dependency order: registry reaper, signaling,
    /// then the media pipeline. Only the signaling bind is fatal.
    pub async fn start(self: &Arc<Self>) -> Result<(), StreamError> {
        self.registry.start();
        self.broker.start().await?;
        self.pipeline.start();

        {
            let supervisor = Arc::clone(self);
            self.tasks.lock().unwrap().push(tokio::spawn(async move {
                supervisor.watchdog_loop().await;
            }));
        }

        log::info!("All systems operational");
        Ok(())
    }

    /// Shut down in reverse start order
    pub async fn stop(&self) {
        log::info!("Shutting down...");
        self.shutdown.cancel();

        self.pipeline.stop().await;
        self.broker.stop().await;
        self.registry.stop().await;

        let tasks: Vec<_> = self.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        log::info!("Shutdown complete");
    }

    pub fn pipeline(&self) -> &Arc<IngestPipeline> {
        &self.pipeline
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    async fn watchdog_loop(&self) {
        let mut unhealthy_intervals = 0u32;

        loop {
            let mut elapsed = 0u64;
            while elapsed < WATCHDOG_INTERVAL_SECS * 1000 {
                tokio::select! {
                    _ = self.shutdown.cancelled() => return,
                    _ = tokio::time::sleep(std::time::Duration::from_millis(500)) => {}
                }
                elapsed += 500;
            }

            let pipeline_stats = self.pipeline.get_stats();
            let registry_stats = self.registry.get_stats().await;

            log::info!(
                "Pipeline: {} | frames: {} | {:.1} MB | reconnects: {} | dropped: {}",
                pipeline_stats.state.as_str(),
                pipeline_stats.frames_received,
                pipeline_stats.bytes_received as f64 / (1024.0 * 1024.0),
                pipeline_stats.reconnect_count,
                pipeline_stats.dropped_batches,
            );
            log::info!(
                "WebRTC: {}/{} peers connected | sent: {:.1} MB",
                registry_stats.connected_peers,
                registry_stats.total_peers,
                registry_stats.total_bytes_sent as f64 / (1024.0 * 1024.0),
            );

            // The pipeline's own reconnect loop handles transient faults;
            // only a pipeline stuck outside Playing for two intervals gets
            // forced through a full rebuild.
            if pipeline_stats.state != PipelineState::Playing && !self.shutdown.is_cancelled() {
                unhealthy_intervals += 1;
                if unhealthy_intervals >= UNHEALTHY_INTERVALS_BEFORE_RESTART {
                    log::warn!("Pipeline not running, forcing a rebuild");
                    self.pipeline.stop().await;
                    self.pipeline.start();
                    unhealthy_intervals = 0;
                }
            } else {
                unhealthy_intervals = 0;
            }
        }
    }
}
