//! Deterministic agents and sinks for tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{stream, StreamExt};
use parking_lot::Mutex;
use saga_core::{AgentError, AgentKind, AgentRequest, Capability, ChunkStream, Message, OutboundFrame};

use crate::classify;
use crate::sink::StreamSink;

/// One step of a scripted agent's output.
#[derive(Clone, Debug)]
pub enum MockStep {
    Chunk(String),
    /// Pause before the next step.
    Delay(Duration),
    /// End the stream with an error.
    Fail(AgentError),
}

#[derive(Clone, Copy, Debug)]
enum AcceptRule {
    Always,
    Keywords,
    Never,
}

/// Agent that replays a fixed script on every call.
pub struct ScriptedAgent {
    name: String,
    kind: AgentKind,
    script: Vec<MockStep>,
    start_error: Option<AgentError>,
    accept: AcceptRule,
    call_count: AtomicUsize,
    histories: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedAgent {
    /// Streams `chunks` and accepts every request.
    pub fn new(name: &str, kind: AgentKind, chunks: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            kind,
            script: chunks.iter().map(|c| MockStep::Chunk(c.to_string())).collect(),
            start_error: None,
            accept: AcceptRule::Always,
            call_count: AtomicUsize::new(0),
            histories: Mutex::new(Vec::new()),
        }
    }

    pub fn with_script(mut self, script: Vec<MockStep>) -> Self {
        self.script = script;
        self
    }

    /// Fail after the scripted chunks.
    pub fn then_fail(mut self, error: AgentError) -> Self {
        self.script.push(MockStep::Fail(error));
        self
    }

    /// Fail before producing a stream at all.
    pub fn failing_to_start(mut self, error: AgentError) -> Self {
        self.start_error = Some(error);
        self
    }

    /// Pause before every chunk.
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.script = self
            .script
            .into_iter()
            .flat_map(|step| [MockStep::Delay(delay), step])
            .collect();
        self
    }

    /// Accept only requests matching this kind's keywords.
    pub fn accepting_keywords(mut self) -> Self {
        self.accept = AcceptRule::Keywords;
        self
    }

    pub fn never_accepts(mut self) -> Self {
        self.accept = AcceptRule::Never;
        self
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    /// The history passed to each call, in call order.
    pub fn histories(&self) -> Vec<Vec<Message>> {
        self.histories.lock().clone()
    }
}

#[async_trait]
impl Capability for ScriptedAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> AgentKind {
        self.kind
    }

    fn accepts(&self, request: &AgentRequest) -> bool {
        match self.accept {
            AcceptRule::Always => true,
            AcceptRule::Never => false,
            AcceptRule::Keywords => {
                classify::kind_pattern(self.kind).is_some_and(|re| re.is_match(&request.raw_text))
            }
        }
    }

    async fn stream(
        &self,
        _request: &AgentRequest,
        history: &[Message],
    ) -> Result<ChunkStream, AgentError> {
        self.call_count.fetch_add(1, Ordering::Relaxed);
        self.histories.lock().push(history.to_vec());
        if let Some(e) = &self.start_error {
            return Err(e.clone());
        }

        let mut items = Vec::new();
        let mut pending = Duration::ZERO;
        for step in &self.script {
            match step {
                MockStep::Delay(d) => pending += *d,
                MockStep::Chunk(c) => {
                    items.push((pending, Ok(c.clone())));
                    pending = Duration::ZERO;
                }
                MockStep::Fail(e) => {
                    items.push((pending, Err(e.clone())));
                    break;
                }
            }
        }

        let chunks = stream::iter(items).then(|(delay, item)| async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            item
        });
        Ok(Box::pin(chunks))
    }
}

/// Sink that records frames. Can simulate a client that disconnects.
pub struct RecordingSink {
    frames: Mutex<Vec<OutboundFrame>>,
    open: AtomicBool,
    close_after: Option<usize>,
    send_delay: Duration,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self {
            frames: Mutex::new(Vec::new()),
            open: AtomicBool::new(true),
            close_after: None,
            send_delay: Duration::ZERO,
        }
    }

    /// Accept `n` frames, then behave as a closed connection.
    pub fn closing_after(n: usize) -> Self {
        Self {
            close_after: Some(n),
            ..Self::new()
        }
    }

    /// A slow reader: every send takes `delay` before it is accepted.
    pub fn with_send_delay(mut self, delay: Duration) -> Self {
        self.send_delay = delay;
        self
    }

    pub fn close(&self) {
        self.open.store(false, Ordering::Release);
    }

    pub fn frames(&self) -> Vec<OutboundFrame> {
        self.frames.lock().clone()
    }
}

impl Default for RecordingSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StreamSink for RecordingSink {
    async fn send(&self, frame: OutboundFrame) -> bool {
        if !self.open.load(Ordering::Acquire) {
            return false;
        }
        if !self.send_delay.is_zero() {
            tokio::time::sleep(self.send_delay).await;
        }
        let mut frames = self.frames.lock();
        frames.push(frame);
        if self.close_after.is_some_and(|n| frames.len() >= n) {
            self.open.store(false, Ordering::Release);
        }
        true
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}
