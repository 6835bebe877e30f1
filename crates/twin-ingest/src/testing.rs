//! Test doubles for the ingestion pipeline
//!
//! [`ScriptedSource`] replays a fixed list of frames and errors;
//! [`RecordingSink`] keeps every sample it is given.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use twin_core::{
    EventError, EventResult, EventSource, Frame, Sample, SinkError, SinkResult, TimeSeriesSink,
};

/// Sink that records samples in memory
#[derive(Debug, Default)]
pub struct RecordingSink {
    samples: Mutex<Vec<Sample>>,
    attempts: Mutex<usize>,
    failing: AtomicBool,
    delay: Option<Duration>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink whose writes fail until [`set_failing(false)`](Self::set_failing)
    pub fn failing() -> Self {
        let sink = Self::default();
        sink.set_failing(true);
        sink
    }

    /// Sleep before each write, to simulate a slow store
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Samples written successfully, in write order
    pub fn samples(&self) -> Vec<Sample> {
        self.samples.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.lock().is_empty()
    }

    /// Write calls seen, including failed ones
    pub fn attempts(&self) -> usize {
        *self.attempts.lock()
    }
}

#[async_trait]
impl TimeSeriesSink for RecordingSink {
    async fn write(&self, sample: &Sample) -> SinkResult<()> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        *self.attempts.lock() += 1;
        if self.failing.load(Ordering::SeqCst) {
            return Err(SinkError::Transport("recording sink set to fail".into()));
        }
        self.samples.lock().push(sample.clone());
        Ok(())
    }
}

/// One step of a [`ScriptedSource`] script
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Frame(Frame),
    /// `read_frame` fails with this message and the connection drops
    Error(String),
}

/// What a [`ScriptedSource`] has been asked to do
#[derive(Debug, Default, Clone)]
pub struct SourceLog {
    pub connects: usize,
    pub filters: Vec<String>,
    pub closes: usize,
}

/// Event source that replays a script.
///
/// Once the script is exhausted, `read_frame` waits forever, like an idle
/// backend. The log is shared so tests can inspect it after the pipeline
/// has consumed the source.
#[derive(Debug, Default)]
pub struct ScriptedSource {
    script: VecDeque<ScriptStep>,
    connected: bool,
    fail_connect: bool,
    fail_subscribe: bool,
    log: Arc<Mutex<SourceLog>>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a text frame
    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.script.push_back(ScriptStep::Frame(Frame::Text(text.into())));
        self
    }

    /// Queue any frame
    pub fn frame(mut self, frame: Frame) -> Self {
        self.script.push_back(ScriptStep::Frame(frame));
        self
    }

    /// Queue a read error
    pub fn error(mut self, message: impl Into<String>) -> Self {
        self.script.push_back(ScriptStep::Error(message.into()));
        self
    }

    pub fn failing_connect(mut self) -> Self {
        self.fail_connect = true;
        self
    }

    pub fn failing_subscribe(mut self) -> Self {
        self.fail_subscribe = true;
        self
    }

    /// Handle on the call log
    pub fn log(&self) -> Arc<Mutex<SourceLog>> {
        self.log.clone()
    }
}

#[async_trait]
impl EventSource for ScriptedSource {
    async fn connect(&mut self) -> EventResult<()> {
        if self.connected {
            return Err(EventError::AlreadyConnected);
        }
        self.log.lock().connects += 1;
        if self.fail_connect {
            return Err(EventError::Connect("connection refused".into()));
        }
        self.connected = true;
        Ok(())
    }

    async fn subscribe(&mut self, filter: &str) -> EventResult<()> {
        if !self.connected {
            return Err(EventError::NotConnected);
        }
        if self.fail_subscribe {
            return Err(EventError::Send("subscription rejected".into()));
        }
        self.log.lock().filters.push(filter.to_string());
        Ok(())
    }

    async fn read_frame(&mut self) -> EventResult<Frame> {
        if !self.connected {
            return Err(EventError::NotConnected);
        }
        match self.script.pop_front() {
            Some(ScriptStep::Frame(frame)) => {
                if matches!(frame, Frame::Close(_)) {
                    self.connected = false;
                }
                Ok(frame)
            }
            Some(ScriptStep::Error(message)) => {
                self.connected = false;
                Err(EventError::Read(message))
            }
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self) -> EventResult<()> {
        self.connected = false;
        self.log.lock().closes += 1;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}
