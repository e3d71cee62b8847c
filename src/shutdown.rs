//! Cooperative shutdown (spec.md §5): a single `CancellationToken` fans out
//! to every long-running task; `run_shutdown_sequence` then drives the
//! ordered drain described in spec.md §5.

use std::time::Duration;

use log::{error, info, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::pipeline::PipelineHandle;
use crate::plugin::PluginRegistry;
use crate::publisher::Publisher;

const TOTAL_SHUTDOWN_BUDGET: Duration = Duration::from_secs(60);
const PIPELINE_DRAIN_DEADLINE: Duration = Duration::from_secs(20);
const PUBLISHER_FLUSH_DEADLINE: Duration = Duration::from_secs(30);

/// Everything `run_shutdown_sequence` needs to drive the ordered drain. The
/// acceptor/UDP/admin tasks are not referenced here directly: they all
/// observe the same `CancellationToken` and are joined by the caller before
/// or after this call as convenient, since nothing downstream depends on
/// their exact exit order relative to each other (spec.md §5 steps 1-2).
pub struct ShutdownCoordinator {
    pub cancel: CancellationToken,
    pub pipeline_intake: Option<PipelineHandle>,
    pub pipeline_join: JoinHandle<()>,
    pub publisher: std::sync::Arc<Publisher>,
    pub registry: std::sync::Arc<PluginRegistry>,
}

impl ShutdownCoordinator {
    /// Run spec.md §5 steps 3-6: drain the pipeline, flush the publisher,
    /// and shut down the plugin registry. Steps 1-2 (stop accepting new TCP
    /// connections, stop the UDP receiver) are triggered by cancelling
    /// `self.cancel` before this is called — reader loops for already-open
    /// sessions continue draining their pending buffers into the pipeline
    /// in the meantime, which is why this function only takes over at the
    /// intake-close step.
    pub async fn run(mut self) {
        let overall_start = tokio::time::Instant::now();
        info!("shutdown sequence starting");

        // Step 3/4: close the pipeline intake (drop the last sender handle)
        // and await worker drain up to a deadline.
        drop(self.pipeline_intake.take());
        match tokio::time::timeout(PIPELINE_DRAIN_DEADLINE, self.pipeline_join).await {
            Ok(Ok(())) => info!("pipeline drained cleanly"),
            Ok(Err(e)) => error!("pipeline worker task panicked during shutdown: {e}"),
            Err(_) => warn!(
                "pipeline drain exceeded its {:?} sub-deadline, abandoning in-flight work",
                PIPELINE_DRAIN_DEADLINE
            ),
        }

        // Step 5: Publisher.Flush(30s).
        if let Err(e) = self.publisher.flush(PUBLISHER_FLUSH_DEADLINE).await {
            error!("publisher flush did not complete within its deadline: {e}");
        }

        // Step 6: Plugin Registry shutdown.
        self.registry.shutdown().await;

        let elapsed = overall_start.elapsed();
        if elapsed > TOTAL_SHUTDOWN_BUDGET {
            warn!(
                "shutdown sequence took {:?}, exceeding the {:?} budget",
                elapsed, TOTAL_SHUTDOWN_BUDGET
            );
        } else {
            info!("shutdown sequence completed in {elapsed:?}");
        }
    }
}

/// Waits for SIGINT (or, on Unix, SIGTERM too) and cancels `token`.
pub async fn wait_for_shutdown_signal(token: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
            _ = sigterm.recv() => info!("received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received ctrl-c");
    }
    token.cancel();
}
