//! Shared CLI utilities for the `strata-chat` binary.

use std::io::Read;
use std::path::Path;

use crate::history::ConversationTurn;

/// Initialize tracing/logging to stderr.
///
/// If `disable` is true, no output is produced.
/// Otherwise respects `RUST_LOG` env var, defaulting to WARN.
pub fn init_logging(disable: bool) {
    use tracing_subscriber::EnvFilter;

    if disable {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    // A second call (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Read the user message from one of: prompt string, file path, or stdin.
///
/// Returns `Ok(None)` when no source is given, which the chat binary treats
/// as interactive mode.
pub fn read_input(
    prompt: Option<&str>,
    file: Option<&Path>,
    use_stdin: bool,
) -> Result<Option<String>, String> {
    if let Some(text) = prompt {
        return Ok(Some(text.to_string()));
    }

    if let Some(path) = file {
        return std::fs::read_to_string(path)
            .map(Some)
            .map_err(|e| format!("Failed to read file '{}': {}", path.display(), e));
    }

    if use_stdin {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .map_err(|e| format!("Failed to read stdin: {}", e))?;
        return Ok(Some(buf));
    }

    Ok(None)
}

/// Load earlier messages from a JSON array of strings
/// (user, assistant, user, ...).
pub fn read_seed(path: &Path) -> Result<Vec<String>, String> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read history file '{}': {}", path.display(), e))?;
    serde_json::from_str(&text)
        .map_err(|e| format!("History file '{}' must be a JSON array of strings: {}", path.display(), e))
}

/// Load a full turn sequence from a JSON array of `{"role", "content"}`
/// objects.
pub fn read_turns(path: &Path) -> Result<Vec<ConversationTurn>, String> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read context file '{}': {}", path.display(), e))?;
    let turns: Vec<ConversationTurn> = serde_json::from_str(&text)
        .map_err(|e| format!("Invalid context file '{}': {}", path.display(), e))?;
    if turns.is_empty() {
        return Err(format!("Context file '{}' has no turns", path.display()));
    }
    Ok(turns)
}

pub fn validate_output_format(s: &str) -> Result<String, String> {
    match s {
        "text" | "json" => Ok(s.to_string()),
        _ => Err(format!(
            "Unknown output format '{}'. Options: text, json",
            s
        )),
    }
}

/// One line typed in interactive mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCommand {
    /// A message for the assistant.
    Say(String),
    /// `/reset`: keep only the system prompt.
    Reset,
    /// `/clear N`: keep the first N turns.
    Clear(usize),
    /// `/system TEXT`: replace the system prompt.
    System(String),
    /// `/config JSON`: merge a config patch.
    Config(String),
    /// `/history`: print the stored turns.
    History,
    /// `/quit` or `/exit`.
    Quit,
}

/// Parse an interactive line. Lines not starting with `/` are messages.
pub fn parse_command(line: &str) -> Result<ChatCommand, String> {
    let line = line.trim_end_matches(['\r', '\n']);
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(ChatCommand::Say(line.to_string()));
    };

    let (name, arg) = match rest.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (rest, ""),
    };

    match name {
        "reset" => Ok(ChatCommand::Reset),
        "clear" => arg
            .parse::<usize>()
            .map(ChatCommand::Clear)
            .map_err(|_| format!("/clear expects a turn count, got '{}'", arg)),
        "system" if !arg.is_empty() => Ok(ChatCommand::System(arg.to_string())),
        "config" if !arg.is_empty() => Ok(ChatCommand::Config(arg.to_string())),
        "history" => Ok(ChatCommand::History),
        "quit" | "exit" => Ok(ChatCommand::Quit),
        "system" | "config" => Err(format!("/{} expects an argument", name)),
        other => Err(format!(
            "Unknown command '/{}'. Options: /reset, /clear N, /system TEXT, /config JSON, /history, /quit",
            other
        )),
    }
}
