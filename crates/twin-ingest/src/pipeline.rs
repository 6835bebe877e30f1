//! IngestionPipeline - owned read loop with an explicit state machine
//!
//! ```text
//! Idle -> Connected -> Subscribed -> Listening -> Stopped | Faulted
//! ```
//!
//! The reader task is the only user of the event source. Samples cross a
//! bounded channel to a writer task that persists them one at a time.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use twin_core::{EventSource, Frame, Sample, TimeSeriesSink};

use crate::decoder::{decode_frame, FrameOutcome};
use crate::error::{IngestError, IngestResult};

/// Subscription filter matching every entity
pub const DEFAULT_FILTER: &str = "exists(thingId)";

/// Default capacity of the reader-to-writer channel
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Pipeline lifecycle state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "lowercase")]
pub enum PipelineState {
    Idle,
    Connected,
    Subscribed,
    Listening,
    Stopped,
    Faulted(String),
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Idle => "idle",
            PipelineState::Connected => "connected",
            PipelineState::Subscribed => "subscribed",
            PipelineState::Listening => "listening",
            PipelineState::Stopped => "stopped",
            PipelineState::Faulted(_) => "faulted",
        }
    }

    pub fn is_faulted(&self) -> bool {
        matches!(self, PipelineState::Faulted(_))
    }

    /// Stopped or faulted
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Stopped | PipelineState::Faulted(_))
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineState::Faulted(reason) => write!(f, "faulted ({})", reason),
            other => f.write_str(other.as_str()),
        }
    }
}

/// What the reader does when the channel to the writer is full
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Wait for capacity; a slow sink slows down reading
    #[default]
    Block,
    /// Drop the new sample and count it
    DropNewest,
}

/// Pipeline settings
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub filter: String,
    pub channel_capacity: usize,
    pub backpressure: BackpressurePolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_FILTER.to_string(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backpressure: BackpressurePolicy::default(),
        }
    }
}

/// Counters shared by the reader and writer tasks
#[derive(Debug, Default)]
pub struct PipelineStats {
    frames: AtomicU64,
    events: AtomicU64,
    malformed: AtomicU64,
    samples_written: AtomicU64,
    write_failures: AtomicU64,
    dropped: AtomicU64,
}

/// Point-in-time copy of [`PipelineStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub frames: u64,
    pub events: u64,
    pub malformed: u64,
    pub samples_written: u64,
    pub write_failures: u64,
    pub dropped: u64,
}

impl PipelineStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames: self.frames.load(Ordering::Relaxed),
            events: self.events.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            samples_written: self.samples_written.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Owns one event source and relays its events into a sink.
pub struct IngestionPipeline<S> {
    source: S,
    sink: Arc<dyn TimeSeriesSink>,
    config: PipelineConfig,
    state: Arc<watch::Sender<PipelineState>>,
    stats: Arc<PipelineStats>,
}

impl<S: EventSource + 'static> IngestionPipeline<S> {
    pub fn new(source: S, sink: Arc<dyn TimeSeriesSink>, config: PipelineConfig) -> Self {
        let (state, _) = watch::channel(PipelineState::Idle);
        Self::with_shared(source, sink, config, Arc::new(state), Arc::default())
    }

    /// Build a pipeline that publishes into an existing state channel and
    /// stats block, so restarts stay visible to the same observers.
    pub(crate) fn with_shared(
        source: S,
        sink: Arc<dyn TimeSeriesSink>,
        config: PipelineConfig,
        state: Arc<watch::Sender<PipelineState>>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        state.send_replace(PipelineState::Idle);
        Self {
            source,
            sink,
            config,
            state,
            stats,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state.borrow().clone()
    }

    /// Receiver that sees every state transition
    pub fn state_receiver(&self) -> watch::Receiver<PipelineState> {
        self.state.subscribe()
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        self.stats.clone()
    }

    fn set_state(&self, state: PipelineState) {
        debug!(state = %state, "Pipeline state change");
        self.state.send_replace(state);
    }

    /// Connect and subscribe. Failure is fatal: the pipeline is left
    /// `Faulted` and cannot be started again.
    pub async fn start(&mut self) -> IngestResult<()> {
        let current = self.state();
        if current != PipelineState::Idle {
            return Err(IngestError::InvalidState(current.to_string(), "idle"));
        }

        if let Err(e) = self.source.connect().await {
            error!(error = %e, "Cannot connect to event stream");
            self.set_state(PipelineState::Faulted(e.to_string()));
            return Err(IngestError::Startup(e));
        }
        self.set_state(PipelineState::Connected);

        if let Err(e) = self.source.subscribe(&self.config.filter).await {
            error!(error = %e, filter = %self.config.filter, "Cannot subscribe to events");
            let _ = self.source.close().await;
            self.set_state(PipelineState::Faulted(e.to_string()));
            return Err(IngestError::Startup(e));
        }
        self.set_state(PipelineState::Subscribed);
        info!(filter = %self.config.filter, "Event subscription started");
        Ok(())
    }

    /// Run the read loop until `shutdown` flips to `true` (-> `Stopped`,
    /// `Ok`) or the stream fails or closes (-> `Faulted`, `Err`).
    ///
    /// Queued samples are drained into the sink before the final state is
    /// published.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> IngestResult<()> {
        let current = self.state();
        if current != PipelineState::Subscribed {
            return Err(IngestError::InvalidState(current.to_string(), "subscribed"));
        }

        let capacity = self.config.channel_capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let writer = tokio::spawn(write_samples(rx, self.sink.clone(), self.stats.clone()));

        self.set_state(PipelineState::Listening);
        info!(capacity, backpressure = ?self.config.backpressure, "Listening for events");

        let outcome = if *shutdown.borrow() {
            Ok(())
        } else {
            self.read_loop(&tx, &mut shutdown).await
        };

        let _ = self.source.close().await;
        drop(tx);
        if let Err(e) = writer.await {
            warn!(error = %e, "Sample writer task failed");
        }

        let stats = self.stats.snapshot();
        match outcome {
            Ok(()) => {
                info!(?stats, "Ingestion stopped");
                self.set_state(PipelineState::Stopped);
                Ok(())
            }
            Err(reason) => {
                error!(%reason, ?stats, "Ingestion faulted");
                self.set_state(PipelineState::Faulted(reason.clone()));
                Err(IngestError::Faulted(reason))
            }
        }
    }

    async fn read_loop(
        &mut self,
        tx: &mpsc::Sender<Sample>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), String> {
        loop {
            let frame = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(());
                    }
                    continue;
                }
                frame = self.source.read_frame() => frame,
            };

            let frame = match frame {
                Ok(Frame::Close(reason)) => {
                    return Err(format!(
                        "backend closed the event stream{}",
                        reason.map(|r| format!(": {}", r)).unwrap_or_default()
                    ));
                }
                Ok(frame) => frame,
                Err(e) => return Err(e.to_string()),
            };
            PipelineStats::bump(&self.stats.frames);

            match decode_frame(&frame, Utc::now()) {
                FrameOutcome::Ignored => trace!("Ignoring non-text frame"),
                FrameOutcome::Acknowledged => debug!("Subscription acknowledged"),
                FrameOutcome::Malformed(reason) => {
                    PipelineStats::bump(&self.stats.malformed);
                    warn!(%reason, "Discarding undecodable frame");
                }
                FrameOutcome::Event(event) => {
                    PipelineStats::bump(&self.stats.events);
                    if event.is_merge() {
                        debug!(entity = %event.entity_id, samples = event.samples.len(), "Twin event");
                    } else {
                        info!(
                            entity = %event.entity_id,
                            topic = ?event.topic,
                            samples = event.samples.len(),
                            "Non-merge twin event"
                        );
                    }
                    for sample in event.samples {
                        dispatch(tx, sample, self.config.backpressure, &self.stats).await?;
                    }
                }
            }
        }
    }

    /// Start the pipeline and run it on its own task.
    pub async fn spawn(mut self) -> IngestResult<IngestionHandle> {
        self.start().await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let state = self.state_receiver();
        let stats = self.stats();
        let join = tokio::spawn(self.run(shutdown_rx));

        Ok(IngestionHandle {
            shutdown: shutdown_tx,
            state,
            stats,
            join,
        })
    }
}

async fn dispatch(
    tx: &mpsc::Sender<Sample>,
    sample: Sample,
    policy: BackpressurePolicy,
    stats: &PipelineStats,
) -> Result<(), String> {
    match policy {
        BackpressurePolicy::Block => tx
            .send(sample)
            .await
            .map_err(|_| "sample writer stopped".to_string()),
        BackpressurePolicy::DropNewest => match tx.try_send(sample) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(sample)) => {
                PipelineStats::bump(&stats.dropped);
                warn!(
                    entity = %sample.entity_id,
                    feature = %sample.feature,
                    "Sample channel full, dropping sample"
                );
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err("sample writer stopped".to_string()),
        },
    }
}

async fn write_samples(
    mut rx: mpsc::Receiver<Sample>,
    sink: Arc<dyn TimeSeriesSink>,
    stats: Arc<PipelineStats>,
) {
    while let Some(sample) = rx.recv().await {
        match sink.write(&sample).await {
            Ok(()) => {
                PipelineStats::bump(&stats.samples_written);
                trace!(entity = %sample.entity_id, feature = %sample.feature, value = sample.value, "Sample written");
            }
            Err(e) => {
                PipelineStats::bump(&stats.write_failures);
                warn!(
                    entity = %sample.entity_id,
                    feature = %sample.feature,
                    error = %e,
                    "Failed to write sample"
                );
            }
        }
    }
}

/// Control handle for a running pipeline or supervisor
pub struct IngestionHandle {
    pub(crate) shutdown: watch::Sender<bool>,
    pub(crate) state: watch::Receiver<PipelineState>,
    pub(crate) stats: Arc<PipelineStats>,
    pub(crate) join: JoinHandle<IngestResult<()>>,
}

impl IngestionHandle {
    pub fn state(&self) -> PipelineState {
        self.state.borrow().clone()
    }

    /// Receiver for health checks and tests
    pub fn state_receiver(&self) -> watch::Receiver<PipelineState> {
        self.state.clone()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Ask the loop to stop and wait for it
    pub async fn stop(self) -> IngestResult<()> {
        let _ = self.shutdown.send(true);
        Self::join(self.join).await
    }

    /// Wait for the loop to end on its own
    pub async fn wait(self) -> IngestResult<()> {
        // keep the sender alive so the loop does not read a dropped channel as stop
        let _shutdown = self.shutdown;
        Self::join(self.join).await
    }

    async fn join(join: JoinHandle<IngestResult<()>>) -> IngestResult<()> {
        join.await.map_err(|e| IngestError::Task(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingSink, ScriptedSource};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    const EVENT: &str =
        r#"{"thingId":"t1","features":{"temp":{"properties":{"value":42}},"hum":{"properties":{"value":"55.5"}}}}"#;

    fn pipeline(source: ScriptedSource, sink: Arc<RecordingSink>) -> IngestionPipeline<ScriptedSource> {
        IngestionPipeline::new(source, sink, PipelineConfig::default())
    }

    async fn wait_for(rx: &mut watch::Receiver<PipelineState>, want: fn(&PipelineState) -> bool) {
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(want))
            .await
            .expect("timed out waiting for state")
            .expect("state channel closed");
    }

    #[tokio::test]
    async fn start_moves_through_states() {
        let source = ScriptedSource::new();
        let log = source.log();
        let mut p = pipeline(source, Arc::new(RecordingSink::new()));
        assert_eq!(p.state(), PipelineState::Idle);

        p.start().await.unwrap();
        assert_eq!(p.state(), PipelineState::Subscribed);
        assert_eq!(log.lock().filters, vec![DEFAULT_FILTER.to_string()]);

        assert!(matches!(p.start().await, Err(IngestError::InvalidState(..))));
    }

    #[tokio::test]
    async fn connect_failure_is_fatal() {
        let mut p = pipeline(
            ScriptedSource::new().failing_connect(),
            Arc::new(RecordingSink::new()),
        );
        assert!(matches!(p.start().await, Err(IngestError::Startup(_))));
        assert!(p.state().is_faulted());
    }

    #[tokio::test]
    async fn subscribe_failure_closes_connection() {
        let source = ScriptedSource::new().failing_subscribe();
        let log = source.log();
        let mut p = pipeline(source, Arc::new(RecordingSink::new()));

        assert!(matches!(p.start().await, Err(IngestError::Startup(_))));
        assert!(p.state().is_faulted());
        assert_eq!(log.lock().closes, 1);
    }

    #[tokio::test]
    async fn run_requires_start() {
        let p = pipeline(ScriptedSource::new(), Arc::new(RecordingSink::new()));
        let (_tx, rx) = watch::channel(false);
        assert!(matches!(p.run(rx).await, Err(IngestError::InvalidState(..))));
    }

    #[tokio::test]
    async fn events_reach_the_sink_and_stop_is_clean() {
        let sink = Arc::new(RecordingSink::new());
        let source = ScriptedSource::new()
            .text("START-SEND-EVENTS")
            .text("garbage")
            .frame(Frame::Binary(bytes::Bytes::from_static(b"\x00")))
            .text(EVENT);
        let log = source.log();

        let handle = pipeline(source, sink.clone()).spawn().await.unwrap();
        let mut rx = handle.state_receiver();
        wait_for(&mut rx, |s| *s == PipelineState::Listening).await;

        tokio::time::timeout(Duration::from_secs(2), async {
            while sink.len() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let stats = handle.stats();
        handle.stop().await.unwrap();
        assert_eq!(*rx.borrow(), PipelineState::Stopped);
        assert_eq!(log.lock().closes, 1);

        let mut features: Vec<_> = sink.samples().into_iter().map(|s| (s.feature, s.value)).collect();
        features.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(features, vec![("hum".to_string(), 55.5), ("temp".to_string(), 42.0)]);
        assert_eq!(stats.frames, 4);
        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.events, 1);
    }

    #[tokio::test]
    async fn read_error_faults_and_halts_writes() {
        let sink = Arc::new(RecordingSink::new());
        let source = ScriptedSource::new()
            .text(EVENT)
            .error("connection reset by peer")
            .text(EVENT);

        let handle = pipeline(source, sink.clone()).spawn().await.unwrap();
        let result = handle.wait().await;

        match result {
            Err(IngestError::Faulted(reason)) => assert!(reason.contains("connection reset")),
            other => panic!("expected fault, got {:?}", other),
        }
        // Only the event before the reset was written
        assert_eq!(sink.len(), 2);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(sink.len(), 2);
    }

    #[tokio::test]
    async fn remote_close_faults() {
        let sink = Arc::new(RecordingSink::new());
        let source = ScriptedSource::new().frame(Frame::Close(Some("going away".into())));

        let handle = pipeline(source, sink).spawn().await.unwrap();
        let mut rx = handle.state_receiver();
        assert!(handle.wait().await.is_err());
        match &*rx.borrow_and_update() {
            PipelineState::Faulted(reason) => assert!(reason.contains("going away")),
            other => panic!("expected faulted, got {:?}", other),
        };
    }

    #[tokio::test]
    async fn sink_failures_do_not_stop_the_loop() {
        let sink = Arc::new(RecordingSink::failing());
        let source = ScriptedSource::new().text(EVENT).text(EVENT);

        let handle = pipeline(source, sink.clone()).spawn().await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while sink.attempts() < 4 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(handle.state(), PipelineState::Listening);
        assert_eq!(handle.stats().write_failures, 4);
        handle.stop().await.unwrap();
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn drop_newest_sheds_load_when_full() {
        let sink = Arc::new(RecordingSink::new().with_delay(Duration::from_millis(50)));
        let mut source = ScriptedSource::new();
        for i in 0..5 {
            source = source.text(format!(
                r#"{{"thingId":"t{}","features":{{"f":{{"properties":{{"value":{}}}}}}}}}"#,
                i, i
            ));
        }
        let config = PipelineConfig {
            channel_capacity: 1,
            backpressure: BackpressurePolicy::DropNewest,
            ..Default::default()
        };

        let handle = IngestionPipeline::new(source, sink.clone(), config)
            .spawn()
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let stats = handle.stats();
        handle.stop().await.unwrap();

        assert!(stats.dropped >= 3, "dropped {}", stats.dropped);
        assert_eq!(sink.len() as u64 + stats.dropped, 5);
    }

    #[test]
    fn backpressure_policy_names() {
        let block: BackpressurePolicy = serde_json::from_str("\"block\"").unwrap();
        let drop: BackpressurePolicy = serde_json::from_str("\"drop_newest\"").unwrap();
        assert_eq!(block, BackpressurePolicy::Block);
        assert_eq!(drop, BackpressurePolicy::DropNewest);
    }
}
