// Prompt markers for the reasoning template and the text transforms applied
// when turns enter or leave the history.

/// End-of-turn marker the engine writes when it finishes a response.
pub const END_OF_TURN: &str = "<eop>";

pub const USER_START: &str = "<|User|>";
pub const ASSISTANT_START: &str = "<|Assistant|>";
pub const THINK_START: &str = "<think>\n";
pub const THINK_END: &str = "</think>";
pub const SENTENCE_START: &str = "<|begin_of_sentence|>";
pub const SENTENCE_END: &str = "<|end_of_sentence|>";

/// Wrap a user message in the reasoning template.
///
/// `generating` appends the think-start marker, which only the turn
/// currently being answered carries; stored turns never do, so replaying
/// history does not re-open a reasoning block.
pub fn wrap_user(content: &str, generating: bool) -> String {
    let mut out = String::with_capacity(
        USER_START.len() + content.len() + ASSISTANT_START.len() + THINK_START.len(),
    );
    out.push_str(USER_START);
    out.push_str(content);
    out.push_str(ASSISTANT_START);
    if generating {
        out.push_str(THINK_START);
    }
    out
}

/// Prefix a system prompt with the sentence-start marker.
pub fn wrap_system(content: &str) -> String {
    format!("{SENTENCE_START}{content}")
}

/// Remove the first `<think>\n … </think>` span, if both markers are present.
pub fn strip_think_span(content: &str) -> String {
    let Some(start) = content.find(THINK_START) else {
        return content.to_string();
    };
    let Some(end_rel) = content[start..].find(THINK_END) else {
        return content.to_string();
    };
    let end = start + end_rel + THINK_END.len();

    let mut out = String::with_capacity(content.len() - (end - start));
    out.push_str(&content[..start]);
    out.push_str(&content[end..]);
    out
}

/// Reduce a reasoning-mode response to its visible answer.
///
/// Everything up to and including the first `</think>` is dropped, leading
/// whitespace is trimmed and the sentence-end marker appended.
pub fn reasoning_answer(content: &str) -> String {
    let answer = match content.find(THINK_END) {
        Some(pos) => &content[pos + THINK_END.len()..],
        None => content,
    };
    format!("{}{SENTENCE_END}", trim_leading_whitespace(answer))
}

/// Trim leading ASCII whitespace.
pub fn trim_leading_whitespace(content: &str) -> &str {
    content.trim_start_matches(|c: char| c.is_ascii_whitespace() || c == '\x0b')
}
