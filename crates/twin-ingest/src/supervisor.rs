//! Supervisor - restarts a faulted pipeline according to a RestartPolicy

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::watch;
use tracing::{error, info, warn};
use twin_core::{EventResult, EventSource, TimeSeriesSink};

use crate::error::{IngestError, IngestResult};
use crate::pipeline::{IngestionHandle, IngestionPipeline, PipelineConfig, PipelineState, PipelineStats};

/// Bounded exponential backoff between restarts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    #[serde(with = "secs")]
    pub initial: Duration,
    #[serde(with = "secs")]
    pub max: Duration,
    /// Consecutive failed restarts before giving up
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
            max_attempts: 10,
        }
    }
}

impl BackoffConfig {
    /// Delay before restart attempt `attempt` (1-based): `initial * 2^(attempt-1)`,
    /// capped at `max`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.initial
            .checked_mul(1u32 << exp)
            .map_or(self.max, |d| d.min(self.max))
    }
}

mod secs {
    use std::time::Duration;

    use serde::de::Error;
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs)
            .map_err(|e| D::Error::custom(format!("invalid duration {}: {}", secs, e)))
    }
}

/// What to do when a running pipeline faults
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RestartPolicy {
    /// The first fault is final
    #[default]
    Never,
    /// Reconnect with bounded exponential backoff
    Backoff(BackoffConfig),
}

/// Runs pipelines built from a source factory and restarts them on fault.
///
/// The first start is always fatal on failure. With
/// [`RestartPolicy::Never`] this behaves exactly like a bare pipeline.
pub struct Supervisor<F> {
    factory: F,
    sink: Arc<dyn TimeSeriesSink>,
    config: PipelineConfig,
    policy: RestartPolicy,
}

impl<F, S> Supervisor<F>
where
    F: FnMut() -> EventResult<S> + Send + 'static,
    S: EventSource + 'static,
{
    pub fn new(
        factory: F,
        sink: Arc<dyn TimeSeriesSink>,
        config: PipelineConfig,
        policy: RestartPolicy,
    ) -> Self {
        Self {
            factory,
            sink,
            config,
            policy,
        }
    }

    /// Start the first pipeline and supervise it on a background task.
    pub async fn start(mut self) -> IngestResult<IngestionHandle> {
        let (state_tx, state_rx) = watch::channel(PipelineState::Idle);
        let state_tx = Arc::new(state_tx);
        let stats = Arc::new(PipelineStats::default());

        let source = (self.factory)().map_err(IngestError::Startup)?;
        let mut pipeline = IngestionPipeline::with_shared(
            source,
            self.sink.clone(),
            self.config.clone(),
            state_tx.clone(),
            stats.clone(),
        );
        pipeline.start().await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(self.supervise(pipeline, state_tx, stats.clone(), shutdown_rx));

        Ok(IngestionHandle {
            shutdown: shutdown_tx,
            state: state_rx,
            stats,
            join,
        })
    }

    async fn supervise(
        mut self,
        mut pipeline: IngestionPipeline<S>,
        state: Arc<watch::Sender<PipelineState>>,
        stats: Arc<PipelineStats>,
        mut shutdown: watch::Receiver<bool>,
    ) -> IngestResult<()> {
        loop {
            let reason = match pipeline.run(shutdown.clone()).await {
                Ok(()) => return Ok(()),
                Err(IngestError::Faulted(reason)) => reason,
                Err(e) => return Err(e),
            };

            let backoff = match self.policy {
                RestartPolicy::Never => return Err(IngestError::Faulted(reason)),
                RestartPolicy::Backoff(backoff) => backoff,
            };

            let mut attempt = 0;
            let mut last = reason;
            pipeline = loop {
                attempt += 1;
                if attempt > backoff.max_attempts {
                    error!(attempts = backoff.max_attempts, %last, "Giving up on event stream");
                    state.send_replace(PipelineState::Faulted(format!(
                        "restarts exhausted: {}",
                        last
                    )));
                    return Err(IngestError::RestartsExhausted {
                        attempts: backoff.max_attempts,
                        last,
                    });
                }

                let delay = backoff.delay(attempt);
                warn!(attempt, delay_ms = delay.as_millis() as u64, %last, "Restarting ingestion");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = stop_requested(&mut shutdown) => {
                        state.send_replace(PipelineState::Stopped);
                        return Ok(());
                    }
                }

                let source = match (self.factory)() {
                    Ok(source) => source,
                    Err(e) => {
                        last = e.to_string();
                        continue;
                    }
                };
                let mut next = IngestionPipeline::with_shared(
                    source,
                    self.sink.clone(),
                    self.config.clone(),
                    state.clone(),
                    stats.clone(),
                );
                match next.start().await {
                    Ok(()) => {
                        info!(attempt, "Ingestion restarted");
                        break next;
                    }
                    Err(e) => last = e.to_string(),
                }
            };
        }
    }
}

async fn stop_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
