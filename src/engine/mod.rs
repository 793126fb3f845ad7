//! The token-generation engine as seen by a session.
//!
//! A session never runs a model itself. It drives an [`Engine`] one step at a
//! time: a single prefill call that consumes the rendered conversation and
//! writes the first output chunk, then single-step continuations until the
//! turn ends. Engines are created by an [`EngineLoader`].
//!
//! - [`scripted::ScriptedEngine`]: deterministic engine that replays scripted
//!   responses, used by `strata-chat` and the test suite.

pub mod scripted;

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::SessionError;
use crate::history::ConversationTurn;

pub use scripted::{ScriptedEngine, ScriptedLoader};

/// Counters and timings for the engine's current request.
///
/// Values are cumulative from the most recent prefill, not per step. The
/// session reads one snapshot when a request ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub prompt_tokens: u64,
    pub generated_tokens: u64,
    pub prefill_us: u64,
    pub decode_us: u64,
    pub vision_us: u64,
    pub audio_us: u64,
}

/// Receives synthesized audio: `(samples, is_final)`. Return `false` to stop.
pub type AudioSink<'a> = dyn FnMut(&[f32], bool) -> bool + 'a;

/// A loaded model that produces output bytes one step at a time.
///
/// Engine handles are not reentrant; a session drives at most one request
/// at a time.
pub trait Engine: Send {
    /// Consume the full turn sequence and run `steps` output steps.
    ///
    /// Returns the bytes written. The engine writes `sentinel` into the same
    /// stream when the response is complete.
    fn prefill(
        &mut self,
        turns: &[ConversationTurn],
        sentinel: &str,
        steps: usize,
    ) -> Result<Vec<u8>, SessionError>;

    /// Run one more output step, returning the bytes written.
    fn decode_step(&mut self) -> Result<Vec<u8>, SessionError>;

    /// Metrics for the current request, or `None` if there is none.
    fn result_snapshot(&self) -> Option<EngineSnapshot>;

    /// Synthesize audio for the last response, streaming chunks to `sink`.
    fn synthesize_audio(&mut self, sink: &mut AudioSink<'_>) -> Result<(), SessionError> {
        let _ = sink;
        Ok(())
    }

    /// Replace the engine configuration.
    fn apply_config(&mut self, config: &serde_json::Value) -> Result<(), SessionError> {
        let _ = config;
        Ok(())
    }
}

/// Creates engines from model files.
pub trait EngineLoader {
    fn load(
        &self,
        model_path: &Path,
        config: &serde_json::Value,
    ) -> Result<Box<dyn Engine>, SessionError>;
}
