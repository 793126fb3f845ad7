//! Role-tagged conversation log and its prompt templating.
//!
//! [`ConversationHistory`] keeps the ordered turns of one session and renders
//! them, plus the turn being answered, into the structured role/content
//! sequence the engine consumes. Two templating policies are supported:
//!
//! - [`TemplatingMode::Plain`]: turns pass through untouched; the engine's own
//!   chat template supplies role separators.
//! - [`TemplatingMode::Reasoning`]: user turns carry explicit user/assistant
//!   markers, the turn being generated also opens a think block, and stored
//!   answers keep only the text after the reasoning trace.
//!
//! The mode is fixed when the history is created.

pub mod template;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::SessionError;

/// Who authored a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            other => Err(SessionError::InvalidConfig(format!(
                "Unknown role '{}'. Options: system, user, assistant",
                other
            ))),
        }
    }
}

/// One message in the conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
}

impl ConversationTurn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Prompt formatting policy for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemplatingMode {
    #[default]
    Plain,
    Reasoning,
}

impl fmt::Display for TemplatingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TemplatingMode::Plain => write!(f, "plain"),
            TemplatingMode::Reasoning => write!(f, "reasoning"),
        }
    }
}

/// Ordered conversation log for one session.
///
/// At most one system turn exists and it is always first; it is replaced in
/// place rather than appended. Consecutive turns never share a role.
#[derive(Debug, Clone)]
pub struct ConversationHistory {
    mode: TemplatingMode,
    turns: Vec<ConversationTurn>,
}

impl ConversationHistory {
    /// An empty history.
    pub fn new(mode: TemplatingMode) -> Self {
        Self {
            mode,
            turns: Vec::new(),
        }
    }

    /// A history that starts with `system_prompt`, if one is given.
    pub fn with_system_prompt(mode: TemplatingMode, system_prompt: Option<&str>) -> Self {
        let mut history = Self::new(mode);
        if let Some(prompt) = system_prompt {
            history.replace_system_prompt(prompt);
        }
        history
    }

    /// Append previously stored messages.
    ///
    /// `messages` alternate user, assistant, user, ... and are converted to
    /// their stored form the same way a live exchange would be.
    pub fn seed(&mut self, messages: &[String]) {
        for (i, message) in messages.iter().enumerate() {
            if i % 2 == 0 {
                let stored = self.stored_user(message);
                self.commit(Role::User, stored);
            } else {
                let stored = self.finalize_response(message);
                self.commit(Role::Assistant, stored);
            }
        }
        debug!(seeded = messages.len(), turns = self.turns.len(), "Seeded history");
    }

    pub fn mode(&self) -> TemplatingMode {
        self.mode
    }

    pub fn turns(&self) -> &[ConversationTurn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Stored content of the system turn, markers included.
    pub fn system_turn(&self) -> Option<&str> {
        self.turns
            .first()
            .filter(|t| t.role == Role::System)
            .map(|t| t.content.as_str())
    }

    /// Render the stored turns followed by the turn about to be answered.
    ///
    /// A trailing user turn that never got an answer (odd-length seed, or a
    /// truncation that ends on a user turn) is left out: the pending message
    /// supersedes it, and committing the exchange replaces it in storage.
    pub fn render(&self, pending_user: &str) -> Vec<ConversationTurn> {
        let answered = match self.unanswered_user() {
            Some(stale) => {
                warn!(
                    chars = stale.content.chars().count(),
                    "Unanswered user turn superseded by the new message"
                );
                &self.turns[..self.turns.len() - 1]
            }
            None => &self.turns[..],
        };

        let mut rendered = Vec::with_capacity(answered.len() + 1);
        rendered.extend(answered.iter().cloned());
        rendered.push(ConversationTurn::user(match self.mode {
            TemplatingMode::Plain => pending_user.to_string(),
            TemplatingMode::Reasoning => template::wrap_user(pending_user, true),
        }));
        rendered
    }

    /// Append a turn whose content is already in stored form.
    ///
    /// A system turn replaces the existing one. A turn with the same role as
    /// the last one replaces it, so roles keep alternating.
    pub fn commit(&mut self, role: Role, content: impl Into<String>) {
        let content = content.into();
        if role == Role::System {
            self.set_system_content(content);
            return;
        }

        match self.turns.last_mut() {
            Some(last) if last.role == role => {
                debug!(%role, "Replacing unanswered turn with the same role");
                last.content = content;
            }
            _ => self.turns.push(ConversationTurn::new(role, content)),
        }
    }

    /// The last turn, if it is a user turn still waiting for an answer.
    pub fn unanswered_user(&self) -> Option<&ConversationTurn> {
        self.turns.last().filter(|t| t.role == Role::User)
    }

    /// Form in which a user message is stored.
    pub fn stored_user(&self, content: &str) -> String {
        match self.mode {
            TemplatingMode::Plain => content.to_string(),
            TemplatingMode::Reasoning => template::wrap_user(content, false),
        }
    }

    /// Turn a raw response (sentinel excluded) into its stored form.
    pub fn finalize_response(&self, raw: &str) -> String {
        finalize_response(self.mode, raw)
    }

    /// Drop everything except the system turn.
    pub fn reset_to_system_only(&mut self) {
        let keep = usize::from(self.system_turn().is_some());
        self.truncate(keep);
    }

    /// Keep only the first `keep` turns.
    pub fn truncate(&mut self, keep: usize) {
        if self.turns.len() > keep {
            debug!(from = self.turns.len(), to = keep, "Truncating history");
            self.turns.truncate(keep);
        }
    }

    /// Replace the system turn, or insert one at the front.
    pub fn replace_system_prompt(&mut self, text: &str) {
        let content = match self.mode {
            TemplatingMode::Plain => text.to_string(),
            TemplatingMode::Reasoning => template::wrap_system(text),
        };
        self.set_system_content(content);
    }

    /// Remove the system turn, if there is one.
    pub fn remove_system_prompt(&mut self) {
        if self.system_turn().is_some() {
            self.turns.remove(0);
        }
    }

    fn set_system_content(&mut self, content: String) {
        match self.turns.first_mut() {
            Some(first) if first.role == Role::System => first.content = content,
            _ => self.turns.insert(0, ConversationTurn::system(content)),
        }
    }
}

/// Turn a raw response (sentinel excluded) into the visible answer.
///
/// The reasoning trace is removed and leading whitespace trimmed; reasoning
/// mode also appends the sentence-end marker its engines are trained on.
pub fn finalize_response(mode: TemplatingMode, raw: &str) -> String {
    let answer = match mode {
        TemplatingMode::Plain => raw.to_string(),
        TemplatingMode::Reasoning => template::reasoning_answer(raw),
    };
    template::trim_leading_whitespace(&template::strip_think_span(&answer)).to_string()
}

/// Flatten turns into `[role]: content` lines for diagnostics.
pub fn render_transcript(turns: &[ConversationTurn]) -> String {
    let mut out = String::new();
    for turn in turns {
        out.push('[');
        out.push_str(turn.role.as_str());
        out.push_str("]: ");
        out.push_str(&turn.content);
        out.push('\n');
    }
    out
}
