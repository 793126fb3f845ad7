//! Session configuration.
//!
//! [`SessionConfig`] holds the fields the session itself interprets. Every
//! other key is kept in [`SessionConfig::extra`] and passed through to the
//! engine untouched.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::error::SessionError;
use crate::history::TemplatingMode;

pub const DEFAULT_MAX_NEW_TOKENS: usize = 2048;
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";

/// Typed session configuration with an opaque engine pass-through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Upper bound on output steps per submission, prefill included.
    pub max_new_tokens: usize,
    /// System turn content; `None` means the history has no system turn.
    pub system_prompt: Option<String>,
    /// Keep earlier exchanges in the prompt. When false, history is cut back
    /// to the system turn before every submission.
    pub retain_history: bool,
    /// Prompt formatting policy. Fixed once a session is built.
    pub templating_mode: TemplatingMode,
    /// Scratch directory for engines that memory-map weights.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mmap_dir: Option<PathBuf>,
    /// Unrecognised keys, forwarded verbatim to the engine.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: DEFAULT_MAX_NEW_TOKENS,
            system_prompt: Some(DEFAULT_SYSTEM_PROMPT.to_string()),
            retain_history: true,
            templating_mode: TemplatingMode::Plain,
            mmap_dir: None,
            extra: Map::new(),
        }
    }
}

/// Rewrite legacy key spellings to their canonical field names.
///
/// `keep_history` maps to `retain_history`; a boolean `is_r1` selects the
/// templating mode. An explicit canonical key wins over its alias.
fn canonicalize(obj: &mut Map<String, Value>) -> Result<(), SessionError> {
    if let Some(keep) = obj.remove("keep_history") {
        obj.entry("retain_history").or_insert(keep);
    }

    if let Some(is_r1) = obj.remove("is_r1") {
        let reasoning = is_r1.as_bool().ok_or_else(|| {
            SessionError::InvalidConfig(format!("'is_r1' must be a boolean, got {}", is_r1))
        })?;
        let mode = if reasoning {
            TemplatingMode::Reasoning
        } else {
            TemplatingMode::Plain
        };
        obj.entry("templating_mode")
            .or_insert_with(|| Value::String(mode.to_string()));
    }

    Ok(())
}

fn into_object(value: Value) -> Result<Map<String, Value>, SessionError> {
    match value {
        Value::Object(obj) => Ok(obj),
        other => Err(SessionError::InvalidConfig(format!(
            "config must be a JSON object, got {}",
            other
        ))),
    }
}

impl SessionConfig {
    /// Parse a JSON object.
    pub fn from_json(json: &str) -> Result<Self, SessionError> {
        let value: Value = serde_json::from_str(json)?;
        Self::from_value(value)
    }

    /// Build from an already-parsed JSON value.
    pub fn from_value(value: Value) -> Result<Self, SessionError> {
        let mut obj = into_object(value)?;
        canonicalize(&mut obj)?;
        let config: SessionConfig = serde_json::from_value(Value::Object(obj))?;
        config.validate()?;
        Ok(config)
    }

    /// Read a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SessionError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&text)
    }

    pub fn validate(&self) -> Result<(), SessionError> {
        if self.max_new_tokens == 0 {
            return Err(SessionError::InvalidConfig(
                "max_new_tokens must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Return a copy with the keys of the JSON object `patch` applied.
    ///
    /// `self` is never modified; any error leaves the caller's configuration
    /// as it was. The templating mode cannot change.
    pub fn merged(&self, patch: &str) -> Result<SessionConfig, SessionError> {
        let patch: Value = serde_json::from_str(patch)?;
        let mut patch = into_object(patch)?;
        canonicalize(&mut patch)?;

        let mut base = into_object(serde_json::to_value(self)?)?;
        base.extend(patch);

        let merged = Self::from_value(Value::Object(base))?;
        if merged.templating_mode != self.templating_mode {
            return Err(SessionError::InvalidConfig(format!(
                "templating_mode is fixed for the session (currently {})",
                self.templating_mode
            )));
        }
        Ok(merged)
    }

    /// Configuration handed to the engine at load time and on every update.
    ///
    /// Starts from the pass-through keys; session-derived keys take
    /// precedence over them.
    pub fn engine_config(&self) -> Value {
        let mut cfg = self.extra.clone();
        cfg.insert("max_new_tokens".to_string(), json!(self.max_new_tokens));
        if let Some(prompt) = &self.system_prompt {
            cfg.insert("system_prompt".to_string(), json!(prompt));
        }

        match &self.mmap_dir {
            Some(dir) => {
                cfg.insert("use_mmap".to_string(), json!(true));
                cfg.insert("tmp_path".to_string(), json!(dir.display().to_string()));
            }
            None => {
                cfg.insert("use_mmap".to_string(), json!(false));
            }
        }

        if self.templating_mode == TemplatingMode::Reasoning {
            // Reasoning prompts are pre-templated by the session.
            cfg.insert("use_template".to_string(), json!(false));
            cfg.insert("precision".to_string(), json!("high"));
        }

        Value::Object(cfg)
    }
}
