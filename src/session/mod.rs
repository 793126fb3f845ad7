//! Conversational generation session.
//!
//! A [`Session`] owns the conversation history, the session configuration
//! and one engine handle. Each request renders the history plus a new user
//! message, streams the engine's output to a [`GenerationListener`] and, when
//! the turn completes, commits the exchange. At most one request runs at a
//! time; a second submission while one is in flight is rejected with
//! [`SessionError::GenerationInProgress`].
//!
//! Every method takes `&self`, so a session can be shared behind an [`Arc`]
//! and cancelled or reconfigured from another thread (or from inside a
//! listener) while a request runs. Replacing the engine is the exception:
//! [`Session::load`] and [`Session::attach_engine`] are rejected with
//! [`SessionError::GenerationInProgress`] until the request ends.
//!
//! ```ignore
//! let session = Session::new(SessionConfig::default(), &[])?;
//! session.load(&ScriptedLoader, Path::new("script.json"))?;
//! let output = session.submit("Hello", &mut |unit: &str| {
//!     print!("{unit}");
//!     true
//! })?;
//! println!("\n[{}]", output.stop_reason);
//! ```

mod generate;

pub use generate::{Diagnostics, GenerationListener, GenerationOutput, StopReason};

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::SessionConfig;
use crate::engine::{Engine, EngineLoader};
use crate::error::SessionError;
use crate::history::{ConversationHistory, ConversationTurn, TemplatingMode};

use generate::Request;

/// Name given to threads started by [`Session::spawn_submit`].
pub const WORKER_THREAD_NAME: &str = "strata-session-worker";

/// Config key for the assistant prompt template forwarded to the engine.
pub const ASSISTANT_PROMPT_KEY: &str = "assistant_prompt_template";

/// Where the current (or last) request is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationState {
    Idle,
    Prefilling,
    Decoding,
    Completed,
    Cancelled,
    Failed,
}

impl fmt::Display for GenerationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GenerationState::Idle => "idle",
            GenerationState::Prefilling => "prefilling",
            GenerationState::Decoding => "decoding",
            GenerationState::Completed => "completed",
            GenerationState::Cancelled => "cancelled",
            GenerationState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Receives synthesized audio: `(samples, is_final)`. Return `false` to stop.
pub type AudioCallback = dyn FnMut(&[f32], bool) -> bool + Send;

/// A conversation bound to one engine.
pub struct Session {
    mode: TemplatingMode,
    config: Mutex<SessionConfig>,
    history: Mutex<ConversationHistory>,
    engine: Mutex<Option<Box<dyn Engine>>>,
    audio_callback: Mutex<Option<Box<AudioCallback>>>,
    state: Mutex<GenerationState>,
    in_flight: AtomicBool,
    cancel_requested: AtomicBool,
    audio_enabled: AtomicBool,
    engine_config_stale: AtomicBool,
}

/// Clears the in-flight flag when a request ends, however it ends.
struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Session {
    /// Create a session without an engine.
    ///
    /// `seed` holds earlier messages alternating user, assistant, ...;
    /// they are stored after the system prompt.
    pub fn new(config: SessionConfig, seed: &[String]) -> Result<Self, SessionError> {
        config.validate()?;
        let mode = config.templating_mode;
        let mut history = ConversationHistory::with_system_prompt(mode, config.system_prompt.as_deref());
        history.seed(seed);

        info!(
            %mode,
            max_new_tokens = config.max_new_tokens,
            retain_history = config.retain_history,
            turns = history.len(),
            "Session created"
        );

        Ok(Self {
            mode,
            config: Mutex::new(config),
            history: Mutex::new(history),
            engine: Mutex::new(None),
            audio_callback: Mutex::new(None),
            state: Mutex::new(GenerationState::Idle),
            in_flight: AtomicBool::new(false),
            cancel_requested: AtomicBool::new(false),
            audio_enabled: AtomicBool::new(false),
            engine_config_stale: AtomicBool::new(false),
        })
    }

    /// Load an engine from `model_path`, replacing any current one.
    pub fn load(&self, loader: &dyn EngineLoader, model_path: &Path) -> Result<(), SessionError> {
        self.ensure_idle()?;
        let engine_config = self.config.lock().engine_config();
        info!(path = %model_path.display(), "Loading engine");
        let engine = loader.load(model_path, &engine_config)?;
        self.ensure_idle()?;
        *self.engine.lock() = Some(engine);
        self.engine_config_stale.store(false, Ordering::Release);
        info!("Engine ready");
        Ok(())
    }

    /// Use an already constructed engine. The session configuration is
    /// applied to it before the next request.
    pub fn attach_engine(&self, engine: Box<dyn Engine>) -> Result<(), SessionError> {
        self.ensure_idle()?;
        *self.engine.lock() = Some(engine);
        self.engine_config_stale.store(true, Ordering::Release);
        debug!("Engine attached");
        Ok(())
    }

    /// The engine lock is held for a whole request; waiting on it from a
    /// listener would never return.
    fn ensure_idle(&self) -> Result<(), SessionError> {
        if self.is_generating() {
            debug!("Rejected engine swap: generation in progress");
            return Err(SessionError::GenerationInProgress);
        }
        Ok(())
    }

    /// Whether an engine is present.
    pub fn is_ready(&self) -> bool {
        // A held engine lock means a request is running, which needs an engine.
        self.engine.try_lock().is_none_or(|engine| engine.is_some())
    }

    /// Answer `prompt` against the stored history, streaming to `listener`.
    ///
    /// Blocks until the turn ends. A completed exchange is committed to the
    /// history; a cancelled or failed one leaves it unchanged.
    pub fn submit<L>(&self, prompt: &str, listener: &mut L) -> Result<GenerationOutput, SessionError>
    where
        L: GenerationListener + ?Sized,
    {
        self.claim(listener)?;
        let _guard = InFlightGuard(&self.in_flight);
        self.run_request(Request::Prompt(prompt.to_string()), listener)
    }

    /// Generate from a caller-supplied turn sequence.
    ///
    /// The turns are sent as given; the stored history is neither read nor
    /// modified.
    pub fn submit_with_history<L>(
        &self,
        turns: Vec<ConversationTurn>,
        listener: &mut L,
    ) -> Result<GenerationOutput, SessionError>
    where
        L: GenerationListener + ?Sized,
    {
        self.claim(listener)?;
        let _guard = InFlightGuard(&self.in_flight);
        self.run_request(Request::FullContext(turns), listener)
    }

    /// Like [`submit`](Self::submit), but runs on a worker thread.
    ///
    /// A request already in flight is rejected here, on the calling thread.
    pub fn spawn_submit<L>(
        self: &Arc<Self>,
        prompt: impl Into<String>,
        listener: L,
    ) -> Result<JoinHandle<Result<GenerationOutput, SessionError>>, SessionError>
    where
        L: GenerationListener + Send + 'static,
    {
        self.spawn_request(Request::Prompt(prompt.into()), listener)
    }

    /// Like [`submit_with_history`](Self::submit_with_history), but runs on a
    /// worker thread.
    pub fn spawn_submit_with_history<L>(
        self: &Arc<Self>,
        turns: Vec<ConversationTurn>,
        listener: L,
    ) -> Result<JoinHandle<Result<GenerationOutput, SessionError>>, SessionError>
    where
        L: GenerationListener + Send + 'static,
    {
        self.spawn_request(Request::FullContext(turns), listener)
    }

    fn spawn_request<L>(
        self: &Arc<Self>,
        request: Request,
        mut listener: L,
    ) -> Result<JoinHandle<Result<GenerationOutput, SessionError>>, SessionError>
    where
        L: GenerationListener + Send + 'static,
    {
        self.claim(&mut listener)?;
        let session = Arc::clone(self);
        let spawned = std::thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_string())
            .spawn(move || {
                let _guard = InFlightGuard(&session.in_flight);
                session.run_request(request, &mut listener)
            });

        spawned.map_err(|e| {
            self.in_flight.store(false, Ordering::Release);
            SessionError::Worker(format!("Failed to spawn worker thread: {}", e))
        })
    }

    /// Mark a request as in flight, or reject it if one already is.
    fn claim<L>(&self, listener: &mut L) -> Result<(), SessionError>
    where
        L: GenerationListener + ?Sized,
    {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            let err = SessionError::GenerationInProgress;
            debug!("Rejected request: generation in progress");
            listener.on_error(&err);
            return Err(err);
        }
        // Cleared here, on the submitting thread, so a cancel issued after
        // submission returns is never lost.
        self.cancel_requested.store(false, Ordering::Release);
        Ok(())
    }

    /// Ask the running request to stop. It ends with
    /// [`StopReason::Cancelled`] after the current step.
    pub fn cancel(&self) {
        self.cancel_requested.store(true, Ordering::Release);
        debug!("Cancellation requested");
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::Acquire)
    }

    /// Whether a request is in flight.
    pub fn is_generating(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn state(&self) -> GenerationState {
        *self.state.lock()
    }

    fn set_state(&self, next: GenerationState) {
        let mut state = self.state.lock();
        let prev = std::mem::replace(&mut *state, next);
        debug!(from = %prev, to = %next, "Generation state");
    }

    /// Turn audio synthesis after each completed response on or off.
    ///
    /// Disabling it also stops a synthesis already under way.
    pub fn enable_audio_output(&self, enable: bool) {
        self.audio_enabled.store(enable, Ordering::Release);
        debug!(enable, "Audio output");
    }

    pub fn is_audio_enabled(&self) -> bool {
        self.audio_enabled.load(Ordering::Acquire)
    }

    /// Register the consumer of synthesized audio.
    pub fn set_audio_callback<F>(&self, callback: F)
    where
        F: FnMut(&[f32], bool) -> bool + Send + 'static,
    {
        *self.audio_callback.lock() = Some(Box::new(callback));
    }

    /// Merge a JSON object into the configuration.
    ///
    /// An invalid patch, or one the engine refuses, is rejected and leaves
    /// the configuration and history unchanged. The engine receives the new
    /// configuration immediately when idle, otherwise before the next request.
    pub fn update_config(&self, patch: &str) -> Result<(), SessionError> {
        let current = self.config();
        let merged = current.merged(patch)?;
        let system_prompt =
            (merged.system_prompt != current.system_prompt).then(|| merged.system_prompt.clone());
        self.commit_config(merged)?;

        if let Some(prompt) = system_prompt {
            let mut history = self.history.lock();
            match prompt {
                Some(text) => history.replace_system_prompt(&text),
                None => history.remove_system_prompt(),
            }
        }

        info!("Session config updated");
        Ok(())
    }

    pub fn config(&self) -> SessionConfig {
        self.config.lock().clone()
    }

    pub fn templating_mode(&self) -> TemplatingMode {
        self.mode
    }

    /// Change the step budget for later requests.
    pub fn set_max_new_tokens(&self, max_new_tokens: usize) -> Result<(), SessionError> {
        if max_new_tokens == 0 {
            return Err(SessionError::InvalidConfig(
                "max_new_tokens must be greater than 0".to_string(),
            ));
        }
        let mut next = self.config();
        next.max_new_tokens = max_new_tokens;
        self.commit_config(next)
    }

    /// Replace the system prompt, in the configuration and in the history.
    pub fn set_system_prompt(&self, text: impl Into<String>) -> Result<(), SessionError> {
        let text = text.into();
        let mut next = self.config();
        next.system_prompt = Some(text.clone());
        self.commit_config(next)?;
        self.history.lock().replace_system_prompt(&text);
        Ok(())
    }

    pub fn system_prompt(&self) -> Option<String> {
        self.config.lock().system_prompt.clone()
    }

    /// Set the template the engine uses to open assistant turns.
    pub fn set_assistant_prompt(&self, template: &str) -> Result<(), SessionError> {
        let mut next = self.config();
        next.extra
            .insert(ASSISTANT_PROMPT_KEY.to_string(), template.into());
        self.commit_config(next)
    }

    /// Snapshot of the stored turns.
    pub fn history(&self) -> Vec<ConversationTurn> {
        self.history.lock().turns().to_vec()
    }

    /// Keep only the first `keep` turns. `clear_history(1)` keeps just the
    /// system prompt.
    pub fn clear_history(&self, keep: usize) {
        self.history.lock().truncate(keep);
    }

    /// Drop every turn except the system prompt.
    pub fn reset(&self) {
        self.history.lock().reset_to_system_only();
        info!("Session history reset");
    }

    /// Hand `next` to the engine, then make it the session configuration.
    /// An engine error leaves the current configuration in place.
    fn commit_config(&self, next: SessionConfig) -> Result<(), SessionError> {
        self.push_engine_config(&next.engine_config())?;
        *self.config.lock() = next;
        Ok(())
    }

    /// Send `config` to the engine, or defer it to the next request if the
    /// engine is busy.
    fn push_engine_config(&self, config: &serde_json::Value) -> Result<(), SessionError> {
        match self.engine.try_lock() {
            Some(mut slot) => {
                if let Some(engine) = slot.as_mut() {
                    engine.apply_config(config)?;
                    self.engine_config_stale.store(false, Ordering::Release);
                    debug!("Engine config applied");
                }
            }
            None => {
                self.engine_config_stale.store(true, Ordering::Release);
                debug!("Engine busy; config deferred to next request");
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("mode", &self.mode)
            .field("state", &self.state())
            .field("generating", &self.is_generating())
            .field("turns", &self.history.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;
    use crate::engine::scripted::{CallRecord, Script};
    use crate::engine::{ScriptedEngine, ScriptedLoader};
    use crate::history::Role;

    fn scripted(session: &Session, script: Script) -> Arc<Mutex<CallRecord>> {
        let engine = ScriptedEngine::new(script);
        let calls = engine.calls();
        session.attach_engine(Box::new(engine)).unwrap();
        calls
    }

    fn default_session() -> Session {
        Session::new(SessionConfig::default(), &[]).unwrap()
    }

    #[test]
    fn test_new_starts_with_system_prompt() {
        let session = default_session();
        assert_eq!(session.history(), vec![ConversationTurn::system("You are a helpful assistant.")]);
        assert_eq!(session.state(), GenerationState::Idle);
        assert!(!session.is_ready());
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = SessionConfig {
            max_new_tokens: 0,
            ..SessionConfig::default()
        };
        assert!(matches!(
            Session::new(config, &[]),
            Err(SessionError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_new_with_seed() {
        let seed = vec!["hi".to_string(), " hello".to_string(), "again".to_string()];
        let session = Session::new(SessionConfig::default(), &seed).unwrap();
        let history = session.history();
        assert_eq!(history.len(), 4);
        assert_eq!(history[2], ConversationTurn::assistant("hello"));
        assert_eq!(history[3], ConversationTurn::user("again"));
    }

    #[test]
    fn test_submit_without_engine() {
        let session = default_session();
        let mut errors = Vec::new();
        struct Errors<'a>(&'a mut Vec<String>);
        impl GenerationListener for Errors<'_> {
            fn on_unit(&mut self, _unit: &str) -> bool {
                true
            }
            fn on_error(&mut self, error: &SessionError) {
                self.0.push(error.to_string());
            }
        }
        let result = session.submit("q", &mut Errors(&mut errors));
        assert!(matches!(result, Err(SessionError::SessionNotReady)));
        assert_eq!(errors.len(), 1);
        assert!(!session.is_generating());
    }

    #[test]
    fn test_submit_while_generating_rejected() {
        let session = default_session();
        scripted(&session, Script::new(["abc"]).with_chunk_bytes(1));
        let mut nested = None;
        let output = session
            .submit("outer", &mut |_: &str| {
                if nested.is_none() {
                    nested = Some(session.submit("inner", &mut |_: &str| true));
                }
                true
            })
            .unwrap();

        assert!(matches!(nested, Some(Err(SessionError::GenerationInProgress))));
        assert_eq!(output.response, "abc");
        assert!(!session.is_generating());
        // Only the outer exchange was stored.
        assert_eq!(session.history().len(), 3);
    }

    #[test]
    fn test_state_visible_during_generation() {
        let session = default_session();
        scripted(&session, Script::new(["ab"]).with_chunk_bytes(1));
        let mut states = Vec::new();
        session
            .submit("q", &mut |_: &str| {
                states.push(session.state());
                true
            })
            .unwrap();
        assert!(states.iter().all(|s| *s == GenerationState::Decoding));
        assert_eq!(session.state(), GenerationState::Idle);
    }

    #[test]
    fn test_load_with_loader() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("script.json");
        std::fs::write(&path, r#"{"responses": ["from file"]}"#).unwrap();

        let session = default_session();
        session.load(&ScriptedLoader, &path).unwrap();
        assert!(session.is_ready());
        let output = session.submit("q", &mut |_: &str| true).unwrap();
        assert_eq!(output.response, "from file");
    }

    #[test]
    fn test_load_failure_keeps_session_unready() {
        let dir = tempfile::tempdir().unwrap();
        let session = default_session();
        assert!(session.load(&ScriptedLoader, &dir.path().join("missing.json")).is_err());
        assert!(!session.is_ready());
    }

    #[test]
    fn test_attached_engine_receives_config_before_first_request() {
        let session = default_session();
        let calls = scripted(&session, Script::new(["ok"]));
        assert!(calls.lock().configs.is_empty());
        session.submit("q", &mut |_: &str| true).unwrap();
        let configs = calls.lock().configs.clone();
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0]["max_new_tokens"], 2048);
    }

    #[test]
    fn test_update_config_applies_immediately_when_idle() {
        let session = default_session();
        let calls = scripted(&session, Script::new(["ok"]));
        session.update_config(r#"{"max_new_tokens": 16, "temperature": 0.5}"#).unwrap();

        assert_eq!(session.config().max_new_tokens, 16);
        let configs = calls.lock().configs.clone();
        assert_eq!(configs.last().unwrap()["temperature"], 0.5);
    }

    #[test]
    fn test_update_config_deferred_while_generating() {
        let session = default_session();
        let calls = scripted(&session, Script::new(["abc", "def"]).with_chunk_bytes(1));
        session.submit("warm up", &mut |_: &str| true).unwrap();
        let before = calls.lock().configs.len();

        let mut updated = false;
        session
            .submit("q", &mut |_: &str| {
                if !updated {
                    session.update_config(r#"{"max_new_tokens": 3}"#).unwrap();
                    updated = true;
                }
                true
            })
            .unwrap();

        // Session-side value changes at once; the engine gets it next request.
        assert_eq!(session.config().max_new_tokens, 3);
        assert_eq!(calls.lock().configs.len(), before);
        let output = session.submit("again", &mut |_: &str| true).unwrap();
        assert_eq!(calls.lock().configs.len(), before + 1);
        assert_eq!(output.stop_reason, StopReason::MaxTokens);
        assert_eq!(output.diagnostics.engine_steps, 3);
    }

    #[test]
    fn test_invalid_update_leaves_config_unchanged() {
        let session = default_session();
        let before = session.config();
        match session.update_config(r#"{"max_new_tokens": "many"}"#) {
            Err(SessionError::InvalidConfig(_)) => {}
            other => panic!("Expected InvalidConfig, got {:?}", other),
        }
        assert!(session.update_config("not json").is_err());
        assert!(session.update_config(r#"{"is_r1": true}"#).is_err());
        assert_eq!(session.config(), before);
        assert_eq!(session.templating_mode(), TemplatingMode::Plain);
    }

    #[test]
    fn test_update_config_system_prompt_reaches_history() {
        let session = default_session();
        session.update_config(r#"{"system_prompt": "Be terse."}"#).unwrap();
        assert_eq!(session.history()[0], ConversationTurn::system("Be terse."));

        session.update_config(r#"{"system_prompt": null}"#).unwrap();
        assert!(session.history().is_empty());
        assert_eq!(session.system_prompt(), None);
    }

    #[test]
    fn test_update_config_keep_history_alias() {
        let session = default_session();
        session.update_config(r#"{"keep_history": false}"#).unwrap();
        assert!(!session.config().retain_history);
    }

    #[test]
    fn test_set_system_prompt() {
        let config = SessionConfig {
            templating_mode: TemplatingMode::Reasoning,
            ..SessionConfig::default()
        };
        let session = Session::new(config, &[]).unwrap();
        session.set_system_prompt("Think hard.").unwrap();
        assert_eq!(session.system_prompt().as_deref(), Some("Think hard."));
        assert_eq!(
            session.history()[0].content,
            "<|begin_of_sentence|>Think hard."
        );
    }

    #[test]
    fn test_set_max_new_tokens() {
        let session = default_session();
        session.set_max_new_tokens(7).unwrap();
        assert_eq!(session.config().max_new_tokens, 7);
        assert!(session.set_max_new_tokens(0).is_err());
        assert_eq!(session.config().max_new_tokens, 7);
    }

    #[test]
    fn test_set_assistant_prompt_forwarded() {
        let session = default_session();
        let calls = scripted(&session, Script::new(["ok"]));
        session.set_assistant_prompt("<|Assistant|>%s").unwrap();
        let configs = calls.lock().configs.clone();
        assert_eq!(configs.last().unwrap()[ASSISTANT_PROMPT_KEY], "<|Assistant|>%s");
    }

    #[test]
    fn test_clear_history_and_reset() {
        let seed: Vec<String> = ["u1", "a1", "u2", "a2"].iter().map(|s| s.to_string()).collect();
        let session = Session::new(SessionConfig::default(), &seed).unwrap();
        assert_eq!(session.history().len(), 5);

        session.clear_history(3);
        assert_eq!(session.history().len(), 3);
        session.reset();
        assert_eq!(session.history().len(), 1);
        assert_eq!(session.history()[0].role, Role::System);
    }

    #[test]
    fn test_cancel_between_requests_does_not_stick() {
        let session = default_session();
        scripted(&session, Script::new(["ok"]));
        session.cancel();
        assert!(session.is_cancel_requested());
        let output = session.submit("q", &mut |_: &str| true).unwrap();
        assert_eq!(output.stop_reason, StopReason::EndOfTurn);
    }

    #[test]
    fn test_spawn_submit_runs_on_worker_thread() {
        let session = Arc::new(default_session());
        scripted(&session, Script::new(["threaded"]));
        let (tx, rx) = mpsc::channel();
        let handle = session
            .spawn_submit("q", move |unit: &str| {
                let name = std::thread::current().name().map(str::to_string);
                tx.send((unit.to_string(), name)).is_ok()
            })
            .unwrap();

        let output = handle.join().unwrap().unwrap();
        assert_eq!(output.response, "threaded");
        let received: Vec<(String, Option<String>)> = rx.iter().collect();
        assert_eq!(received.iter().map(|(u, _)| u.as_str()).collect::<String>(), "threaded");
        assert!(received
            .iter()
            .all(|(_, name)| name.as_deref() == Some(WORKER_THREAD_NAME)));
        assert!(!session.is_generating());
        assert_eq!(session.history().len(), 3);
    }

    #[test]
    fn test_spawn_submit_cancelled_from_caller() {
        let session = Arc::new(default_session());
        scripted(&session, Script::new(["a".repeat(64)]).with_chunk_bytes(1).without_sentinel());
        let (started_tx, started_rx) = mpsc::channel();
        let (resume_tx, resume_rx) = mpsc::channel::<()>();

        let mut first = true;
        let handle = session
            .spawn_submit("q", move |_: &str| {
                if first {
                    first = false;
                    started_tx.send(()).ok();
                    resume_rx.recv().ok();
                }
                true
            })
            .unwrap();

        started_rx.recv().unwrap();
        assert!(matches!(
            session.spawn_submit("second", |_: &str| true),
            Err(SessionError::GenerationInProgress)
        ));
        session.cancel();
        resume_tx.send(()).unwrap();

        let output = handle.join().unwrap().unwrap();
        assert_eq!(output.stop_reason, StopReason::Cancelled);
        assert_eq!(output.response, "a");
        assert_eq!(session.history().len(), 1);
    }

    #[test]
    fn test_spawn_submit_with_history() {
        let session = Arc::new(default_session());
        let calls = scripted(&session, Script::new(["ok"]));
        let turns = vec![ConversationTurn::user("only this")];
        let handle = session
            .spawn_submit_with_history(turns.clone(), |_: &str| true)
            .unwrap();
        handle.join().unwrap().unwrap();
        assert_eq!(calls.lock().last_turns, turns);
        assert_eq!(session.history().len(), 1);
    }

    #[test]
    fn test_cancel_issued_right_after_spawn_is_honoured() {
        let session = Arc::new(default_session());
        scripted(&session, Script::new(["abcdef"]).with_chunk_bytes(1));

        // The worker cannot start until the engine lock is released.
        let handle = {
            let _engine = session.engine.lock();
            let handle = session.spawn_submit("q", |_: &str| true).unwrap();
            session.cancel();
            handle
        };

        let output = handle.join().unwrap().unwrap();
        assert_eq!(output.stop_reason, StopReason::Cancelled);
        assert!(output.response.is_empty());
        assert_eq!(session.history().len(), 1);
    }

    #[test]
    fn test_engine_swap_rejected_while_generating() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("script.json");
        std::fs::write(&path, r#"{"responses": ["replacement"]}"#).unwrap();

        let session = default_session();
        scripted(&session, Script::new(["ab"]).with_chunk_bytes(1));
        let mut swaps = Vec::new();
        let output = session
            .submit("q", &mut |_: &str| {
                if swaps.is_empty() {
                    swaps.push(session.load(&ScriptedLoader, &path));
                    swaps.push(session.attach_engine(Box::new(ScriptedEngine::new(Script::new(["x"])))));
                }
                true
            })
            .unwrap();

        assert_eq!(output.response, "ab");
        assert_eq!(swaps.len(), 2);
        assert!(swaps
            .iter()
            .all(|r| matches!(r, Err(SessionError::GenerationInProgress))));

        // Once idle, the swap goes through.
        session.load(&ScriptedLoader, &path).unwrap();
        let output = session.submit("again", &mut |_: &str| true).unwrap();
        assert_eq!(output.response, "replacement");
    }

    #[test]
    fn test_odd_seed_then_submit_sends_alternating_turns() {
        let seed: Vec<String> = ["hi", "hello", "again"].iter().map(|s| s.to_string()).collect();
        let session = Session::new(SessionConfig::default(), &seed).unwrap();
        let calls = scripted(&session, Script::new(["ok"]));

        // A cancelled request keeps the unanswered turn.
        session.submit("first try", &mut |_: &str| false).unwrap();
        assert_eq!(session.history()[3], ConversationTurn::user("again"));

        session.submit("q", &mut |_: &str| true).unwrap();
        let sent: Vec<String> = calls.lock().last_turns.iter().map(|t| t.content.clone()).collect();
        assert_eq!(sent, vec!["You are a helpful assistant.", "hi", "hello", "q"]);

        let stored: Vec<String> = session.history().into_iter().map(|t| t.content).collect();
        assert_eq!(stored, vec!["You are a helpful assistant.", "hi", "hello", "q", "ok"]);
    }

    #[test]
    fn test_clear_history_ending_on_user_turn() {
        let seed: Vec<String> = ["u1", "a1", "u2", "a2"].iter().map(|s| s.to_string()).collect();
        let session = Session::new(SessionConfig::default(), &seed).unwrap();
        let calls = scripted(&session, Script::new(["ok"]));
        session.clear_history(4);

        session.submit("u3", &mut |_: &str| true).unwrap();
        let roles: Vec<Role> = calls.lock().last_turns.iter().map(|t| t.role).collect();
        assert_eq!(roles, vec![Role::System, Role::User, Role::Assistant, Role::User]);
    }

    /// Accepts every config except the ones carrying `temperature` or the
    /// system prompt "Refused.".
    struct PickyEngine;

    impl Engine for PickyEngine {
        fn prefill(
            &mut self,
            _turns: &[ConversationTurn],
            sentinel: &str,
            _steps: usize,
        ) -> Result<Vec<u8>, SessionError> {
            Ok(format!("ok{sentinel}").into_bytes())
        }

        fn decode_step(&mut self) -> Result<Vec<u8>, SessionError> {
            Ok(Vec::new())
        }

        fn result_snapshot(&self) -> Option<crate::engine::EngineSnapshot> {
            None
        }

        fn apply_config(&mut self, config: &serde_json::Value) -> Result<(), SessionError> {
            if config.get("temperature").is_some() || config["system_prompt"] == "Refused." {
                return Err(SessionError::EngineFailure("config refused".to_string()));
            }
            Ok(())
        }
    }

    #[test]
    fn test_engine_rejected_config_leaves_session_unchanged() {
        let session = default_session();
        session.attach_engine(Box::new(PickyEngine)).unwrap();
        let config_before = session.config();
        let history_before = session.history();

        match session.update_config(r#"{"temperature": 0.3, "system_prompt": "New."}"#) {
            Err(SessionError::EngineFailure(msg)) => assert!(msg.contains("refused")),
            other => panic!("Expected EngineFailure, got {:?}", other),
        }
        assert!(session.set_system_prompt("Refused.").is_err());

        assert_eq!(session.config(), config_before);
        assert_eq!(session.history(), history_before);

        session.set_system_prompt("Accepted.").unwrap();
        assert_eq!(session.system_prompt().as_deref(), Some("Accepted."));
        assert_eq!(session.history()[0], ConversationTurn::system("Accepted."));
    }

    #[test]
    fn test_generation_state_display() {
        assert_eq!(GenerationState::Prefilling.to_string(), "prefilling");
        assert_eq!(GenerationState::Failed.to_string(), "failed");
    }
}
