//! Deterministic engine that replays scripted responses.
//!
//! Each prefill takes the next response from the [`Script`] (cycling when the
//! list runs out), appends the sentinel and then emits that byte stream
//! `chunk_bytes` bytes per step. Small chunk sizes split multi-byte
//! characters and the sentinel across steps, exactly as a real tokenizer's
//! byte output can.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{AudioSink, Engine, EngineLoader, EngineSnapshot};
use crate::error::SessionError;
use crate::history::ConversationTurn;

fn default_chunk_bytes() -> usize {
    4
}

/// What a [`ScriptedEngine`] replays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Script {
    /// Responses, one per request.
    pub responses: Vec<String>,
    /// Bytes written per step.
    #[serde(default = "default_chunk_bytes")]
    pub chunk_bytes: usize,
    /// Whether to terminate each response with the sentinel.
    #[serde(default = "default_true")]
    pub emit_sentinel: bool,
    /// Audio chunks produced by `synthesize_audio`.
    #[serde(default)]
    pub audio: Vec<Vec<f32>>,
    /// Fail with an engine error on this step of every request (0 = prefill).
    #[serde(default)]
    pub fail_at_step: Option<usize>,
}

fn default_true() -> bool {
    true
}

impl Script {
    pub fn new<S: Into<String>>(responses: impl IntoIterator<Item = S>) -> Self {
        Self {
            responses: responses.into_iter().map(Into::into).collect(),
            chunk_bytes: default_chunk_bytes(),
            emit_sentinel: true,
            audio: Vec::new(),
            fail_at_step: None,
        }
    }

    pub fn with_chunk_bytes(mut self, chunk_bytes: usize) -> Self {
        self.chunk_bytes = chunk_bytes;
        self
    }

    pub fn without_sentinel(mut self) -> Self {
        self.emit_sentinel = false;
        self
    }

    pub fn with_audio(mut self, audio: Vec<Vec<f32>>) -> Self {
        self.audio = audio;
        self
    }

    pub fn failing_at_step(mut self, step: usize) -> Self {
        self.fail_at_step = Some(step);
        self
    }

    /// Load a script from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SessionError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|e| {
            SessionError::InvalidConfig(format!(
                "Failed to parse script '{}': {}",
                path.display(),
                e
            ))
        })
    }
}

/// Every call the session made into a [`ScriptedEngine`].
#[derive(Debug, Clone, Default)]
pub struct CallRecord {
    pub prefill_calls: usize,
    pub decode_calls: usize,
    pub audio_calls: usize,
    pub last_turns: Vec<ConversationTurn>,
    pub last_sentinel: String,
    pub configs: Vec<serde_json::Value>,
}

/// Engine that writes scripted bytes instead of running a model.
pub struct ScriptedEngine {
    script: Script,
    next_response: usize,
    stream: Vec<u8>,
    cursor: usize,
    step: usize,
    active: bool,
    snapshot: EngineSnapshot,
    config: serde_json::Value,
    calls: Arc<Mutex<CallRecord>>,
}

impl ScriptedEngine {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            next_response: 0,
            stream: Vec::new(),
            cursor: 0,
            step: 0,
            active: false,
            snapshot: EngineSnapshot::default(),
            config: serde_json::Value::Object(serde_json::Map::new()),
            calls: Arc::new(Mutex::new(CallRecord::default())),
        }
    }

    /// Shared view of the calls made into this engine, usable after the
    /// engine has been handed to a session.
    pub fn calls(&self) -> Arc<Mutex<CallRecord>> {
        Arc::clone(&self.calls)
    }

    /// The configuration last applied.
    pub fn config(&self) -> &serde_json::Value {
        &self.config
    }

    fn check_failure(&self) -> Result<(), SessionError> {
        if self.script.fail_at_step == Some(self.step) {
            return Err(SessionError::EngineFailure(format!(
                "scripted failure at step {}",
                self.step
            )));
        }
        Ok(())
    }

    fn take_chunk(&mut self) -> Vec<u8> {
        let chunk = self.script.chunk_bytes.max(1);
        let end = (self.cursor + chunk).min(self.stream.len());
        let bytes = self.stream[self.cursor..end].to_vec();
        self.cursor = end;
        self.step += 1;
        self.snapshot.generated_tokens += 1;
        bytes
    }
}

impl Engine for ScriptedEngine {
    fn prefill(
        &mut self,
        turns: &[ConversationTurn],
        sentinel: &str,
        steps: usize,
    ) -> Result<Vec<u8>, SessionError> {
        let start = Instant::now();
        {
            let mut calls = self.calls.lock();
            calls.prefill_calls += 1;
            calls.last_turns = turns.to_vec();
            calls.last_sentinel = sentinel.to_string();
        }

        let response = if self.script.responses.is_empty() {
            String::new()
        } else {
            let idx = self.next_response % self.script.responses.len();
            self.next_response += 1;
            self.script.responses[idx].clone()
        };

        self.stream = response.into_bytes();
        if self.script.emit_sentinel {
            self.stream.extend_from_slice(sentinel.as_bytes());
        }
        self.cursor = 0;
        self.step = 0;
        self.active = true;
        self.snapshot = EngineSnapshot {
            prompt_tokens: turns
                .iter()
                .map(|t| t.content.split_whitespace().count() as u64)
                .sum(),
            ..EngineSnapshot::default()
        };

        let mut out = Vec::new();
        for _ in 0..steps {
            self.check_failure()?;
            out.extend(self.take_chunk());
        }

        self.snapshot.prefill_us = start.elapsed().as_micros() as u64;
        debug!(
            turns = turns.len(),
            prompt_tokens = self.snapshot.prompt_tokens,
            "Scripted prefill"
        );
        Ok(out)
    }

    fn decode_step(&mut self) -> Result<Vec<u8>, SessionError> {
        if !self.active {
            return Err(SessionError::EngineFailure(
                "decode_step called before prefill".to_string(),
            ));
        }
        let start = Instant::now();
        self.calls.lock().decode_calls += 1;
        self.check_failure()?;
        let bytes = self.take_chunk();
        self.snapshot.decode_us += start.elapsed().as_micros() as u64;
        Ok(bytes)
    }

    fn result_snapshot(&self) -> Option<EngineSnapshot> {
        self.active.then_some(self.snapshot)
    }

    fn synthesize_audio(&mut self, sink: &mut AudioSink<'_>) -> Result<(), SessionError> {
        let start = Instant::now();
        self.calls.lock().audio_calls += 1;
        let count = self.script.audio.len();
        for (i, chunk) in self.script.audio.iter().enumerate() {
            if !sink(chunk, i + 1 == count) {
                debug!(chunk = i, "Audio sink stopped synthesis");
                break;
            }
        }
        self.snapshot.audio_us += start.elapsed().as_micros() as u64;
        Ok(())
    }

    fn apply_config(&mut self, config: &serde_json::Value) -> Result<(), SessionError> {
        if !config.is_object() {
            return Err(SessionError::EngineFailure(
                "engine config must be a JSON object".to_string(),
            ));
        }
        self.config = config.clone();
        self.calls.lock().configs.push(config.clone());
        Ok(())
    }
}

/// Loads a [`ScriptedEngine`] from a JSON script file used as the model path.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScriptedLoader;

impl EngineLoader for ScriptedLoader {
    fn load(
        &self,
        model_path: &Path,
        config: &serde_json::Value,
    ) -> Result<Box<dyn Engine>, SessionError> {
        info!(path = %model_path.display(), "Loading scripted engine");
        let script = Script::from_file(model_path)?;
        let mut engine = ScriptedEngine::new(script);
        engine.apply_config(config)?;
        Ok(Box::new(engine))
    }
}
