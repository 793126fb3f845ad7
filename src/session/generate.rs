//! The prefill/decode loop behind [`Session::submit`].
//!
//! One request runs as a single prefill step followed by single decode
//! steps. Output bytes go through a [`StreamDecoder`] that knows the
//! end-of-turn marker, and every complete unit is handed to the listener as
//! soon as it exists. The loop ends on the first of: the marker, a
//! cancellation (from [`Session::cancel`] or a listener returning `false`),
//! or the step budget running out. The prefill counts as the first step.

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use super::{GenerationState, Session};
use crate::decoder::StreamDecoder;
use crate::engine::Engine;
use crate::error::SessionError;
use crate::history::template::END_OF_TURN;
use crate::history::{ConversationTurn, Role, finalize_response, render_transcript};
use crate::metrics::{GenerationResult, MetricsCollector};

/// Why generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The engine wrote the end-of-turn marker.
    EndOfTurn,
    /// The step budget ran out.
    MaxTokens,
    /// Cancelled by the caller or a listener.
    Cancelled,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::EndOfTurn => write!(f, "end_of_turn"),
            StopReason::MaxTokens => write!(f, "max_tokens"),
            StopReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Receives the output of one request.
///
/// Closures `FnMut(&str) -> bool` are listeners that only care about units.
pub trait GenerationListener {
    /// A complete text unit. Return `false` to stop generating.
    fn on_unit(&mut self, unit: &str) -> bool;

    /// The request completed; not called when it was cancelled.
    fn on_complete(&mut self, result: &GenerationResult) {
        let _ = result;
    }

    /// The request was rejected or failed.
    fn on_error(&mut self, error: &SessionError) {
        let _ = error;
    }
}

impl<F> GenerationListener for F
where
    F: FnMut(&str) -> bool,
{
    fn on_unit(&mut self, unit: &str) -> bool {
        self(unit)
    }
}

/// Per-request debugging details.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Diagnostics {
    /// The rendered turn sequence given to the engine.
    pub prompt: String,
    /// Every unit delivered, before any history transform.
    pub raw_response: String,
    /// Engine steps issued, prefill included.
    pub engine_steps: usize,
    pub prefill_duration: Duration,
    pub decode_duration: Duration,
}

/// Output from one request.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationOutput {
    /// Why generation stopped.
    pub stop_reason: StopReason,
    /// The response in the form it is stored in history. For a cancelled
    /// request this is the partial text delivered so far.
    pub response: String,
    /// Engine-reported counts and timings.
    pub result: GenerationResult,
    pub diagnostics: Diagnostics,
}

/// What a request generates from.
#[derive(Debug, Clone)]
pub(crate) enum Request {
    /// A new user message answered against the stored history.
    Prompt(String),
    /// A caller-supplied turn sequence; history is neither read nor written.
    FullContext(Vec<ConversationTurn>),
}

impl Session {
    /// Run one request, reporting any error to the listener.
    pub(crate) fn run_request<L>(
        &self,
        request: Request,
        listener: &mut L,
    ) -> Result<GenerationOutput, SessionError>
    where
        L: GenerationListener + ?Sized,
    {
        self.generate_turn(request, listener).inspect_err(|e| {
            listener.on_error(e);
        })
    }

    fn generate_turn<L>(
        &self,
        request: Request,
        listener: &mut L,
    ) -> Result<GenerationOutput, SessionError>
    where
        L: GenerationListener + ?Sized,
    {
        let mut slot = self.engine.lock();
        let engine = slot.as_mut().ok_or(SessionError::SessionNotReady)?;

        if self.engine_config_stale.swap(false, Ordering::AcqRel) {
            let config = self.config.lock().engine_config();
            debug!("Applying deferred engine config");
            if let Err(e) = engine.apply_config(&config) {
                self.engine_config_stale.store(true, Ordering::Release);
                return Err(e);
            }
        }

        let (max_new_tokens, retain_history) = {
            let config = self.config.lock();
            (config.max_new_tokens, config.retain_history)
        };

        let turns = match &request {
            Request::Prompt(prompt) => {
                let mut history = self.history.lock();
                if !retain_history {
                    history.reset_to_system_only();
                }
                history.render(prompt)
            }
            Request::FullContext(turns) => turns.clone(),
        };

        let mut diagnostics = Diagnostics {
            prompt: render_transcript(&turns),
            ..Diagnostics::default()
        };
        let mut decoder = StreamDecoder::with_sentinel(END_OF_TURN);
        let mut response = String::new();

        self.set_state(GenerationState::Prefilling);
        debug!(turns = turns.len(), max_new_tokens, "Prefilling");
        let prefill_start = Instant::now();
        let first = match engine.prefill(&turns, END_OF_TURN, 1) {
            Ok(bytes) => bytes,
            Err(e) => return Err(self.fail(e)),
        };
        diagnostics.prefill_duration = prefill_start.elapsed();
        let mut steps = 1;

        self.set_state(GenerationState::Decoding);
        let decode_start = Instant::now();
        let mut end_of_turn = self.deliver(&mut decoder, &first, &mut response, listener);

        while !end_of_turn && !self.is_cancel_requested() && steps < max_new_tokens {
            let bytes = match engine.decode_step() {
                Ok(bytes) => bytes,
                Err(e) => return Err(self.fail(e)),
            };
            steps += 1;
            end_of_turn = self.deliver(&mut decoder, &bytes, &mut response, listener);
        }

        // Budget exhausted: bytes held back as a possible marker prefix are text.
        if !end_of_turn && !self.is_cancel_requested() {
            for unit in decoder.finish() {
                if !self.emit(&unit, &mut response, listener) {
                    break;
                }
            }
        }

        diagnostics.decode_duration = decode_start.elapsed();
        diagnostics.engine_steps = steps;
        diagnostics.raw_response = response.clone();

        let stop_reason = if end_of_turn {
            StopReason::EndOfTurn
        } else if self.is_cancel_requested() {
            StopReason::Cancelled
        } else {
            StopReason::MaxTokens
        };
        debug!(%stop_reason, steps, "Decode loop finished");

        if stop_reason == StopReason::Cancelled {
            let mut metrics = MetricsCollector::new();
            metrics.absorb(engine.result_snapshot().as_ref());
            self.set_state(GenerationState::Cancelled);
            self.set_state(GenerationState::Idle);
            info!(steps, "Generation cancelled; history unchanged");
            return Ok(GenerationOutput {
                stop_reason,
                response,
                result: metrics.finish(),
                diagnostics,
            });
        }

        if self.is_audio_enabled() {
            if let Err(e) = self.synthesize_audio(&mut **engine) {
                return Err(self.fail(e));
            }
        }

        let visible = finalize_response(self.mode, &response);
        if let Request::Prompt(prompt) = &request {
            let mut history = self.history.lock();
            let stored_user = history.stored_user(prompt);
            history.commit(Role::User, stored_user);
            history.commit(Role::Assistant, visible.clone());
            debug!(turns = history.len(), "Committed exchange");
        }

        let mut metrics = MetricsCollector::new();
        metrics.absorb(engine.result_snapshot().as_ref());
        let result = metrics.finish();

        self.set_state(GenerationState::Completed);
        info!(
            %stop_reason,
            steps,
            prompt_tokens = result.prompt_tokens,
            generated_tokens = result.generated_tokens,
            "Generation complete"
        );
        listener.on_complete(&result);
        self.set_state(GenerationState::Idle);

        Ok(GenerationOutput {
            stop_reason,
            response: visible,
            result,
            diagnostics,
        })
    }

    /// Feed engine bytes through the decoder and deliver complete units.
    ///
    /// Returns `true` once the end-of-turn marker is decoded. The marker
    /// itself is never delivered.
    fn deliver<L>(
        &self,
        decoder: &mut StreamDecoder,
        bytes: &[u8],
        response: &mut String,
        listener: &mut L,
    ) -> bool
    where
        L: GenerationListener + ?Sized,
    {
        for unit in decoder.feed(bytes) {
            if unit == END_OF_TURN {
                return true;
            }
            if !self.emit(&unit, response, listener) {
                break;
            }
        }
        false
    }

    fn emit<L>(&self, unit: &str, response: &mut String, listener: &mut L) -> bool
    where
        L: GenerationListener + ?Sized,
    {
        if self.is_cancel_requested() {
            return false;
        }
        response.push_str(unit);
        if !listener.on_unit(unit) {
            debug!("Listener requested stop");
            self.cancel_requested.store(true, Ordering::Release);
            return false;
        }
        true
    }

    fn synthesize_audio(&self, engine: &mut dyn Engine) -> Result<(), SessionError> {
        let mut callback = self.audio_callback.lock();
        let Some(callback) = callback.as_mut() else {
            debug!("Audio output enabled without a callback; skipping synthesis");
            return Ok(());
        };
        let mut sink = |samples: &[f32], is_final: bool| -> bool {
            if !self.is_audio_enabled() || self.is_cancel_requested() {
                return false;
            }
            callback(samples, is_final)
        };
        engine.synthesize_audio(&mut sink)
    }

    fn fail(&self, error: SessionError) -> SessionError {
        self.set_state(GenerationState::Failed);
        warn!(error = %error, kind = error.kind(), "Generation failed; history unchanged");
        self.set_state(GenerationState::Idle);
        error
    }
}
