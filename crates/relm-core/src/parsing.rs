use std::sync::OnceLock;

use regex::Regex;
use relm_llm::Message;
use serde_json::Value;

use crate::types::Iteration;

/// Per-field cap on execution output folded back into the prompt.
pub const REPL_OUTPUT_TRUNCATION: usize = 5000;

/// Terminal-answer marker whose argument is returned verbatim.
pub const FINAL_MARKER: &str = "FINAL";
/// Terminal-answer marker whose argument names an environment variable.
pub const FINAL_VAR_MARKER: &str = "FINAL_VAR";

fn code_block_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?s)```repl[ \t]*\n(.*?)```").expect("valid regex"))
}

/// Extract the code fragments the model marked for execution, in order.
pub fn find_code_blocks(response: &str) -> Vec<String> {
    code_block_pattern()
        .captures_iter(response)
        .map(|captures| captures[1].trim().to_string())
        .filter(|code| !code.is_empty())
        .collect()
}

/// Scan a response for a terminal answer.
///
/// `FINAL_VAR(name)` resolves through `lookup` against the environment's
/// current bindings; a missing variable means no terminal answer this round.
/// `FINAL(text)` returns the literal argument with one layer of surrounding
/// quotes stripped; it is never evaluated.
pub fn find_final_answer<F>(response: &str, lookup: F) -> Option<String>
where
    F: Fn(&str) -> Option<Value>,
{
    if let Some(argument) = extract_marker_argument(response, FINAL_VAR_MARKER) {
        let name = strip_quotes(&argument);
        return lookup(&name).map(value_to_text);
    }
    extract_marker_argument(response, FINAL_MARKER).map(|argument| strip_quotes(&argument))
}

/// Convert a finished iteration into the messages appended to the growing
/// history for the next prompting round.
pub fn format_iteration(iteration: &Iteration) -> Vec<Message> {
    let mut feedback = String::new();
    if iteration.code_blocks.is_empty() {
        feedback.push_str(
            "No code blocks were executed. Wrap code in ```repl fences when you want it run.",
        );
    } else {
        for (index, block) in iteration.code_blocks.iter().enumerate() {
            if index > 0 {
                feedback.push('\n');
            }
            feedback.push_str(&format!(
                "Code block {} output:\nstdout:\n{}\nstderr:\n{}\n",
                index + 1,
                truncate_output(&block.result.stdout, REPL_OUTPUT_TRUNCATION),
                truncate_output(&block.result.stderr, REPL_OUTPUT_TRUNCATION),
            ));
        }
    }

    vec![
        Message::assistant(iteration.response.clone()),
        Message::user(feedback),
    ]
}

/// Keep the head and tail of oversized output, noting how much was dropped.
pub fn truncate_output(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    let head = max_chars / 2;
    let tail = max_chars - head;
    let removed = count - max_chars;
    let head_text: String = text.chars().take(head).collect();
    let tail_text: String = text
        .chars()
        .skip(count.saturating_sub(tail))
        .collect();
    format!("{head_text}\n... [{removed} chars truncated] ...\n{tail_text}")
}

/// Find the last `marker(...)` occurrence and return the balanced argument.
fn extract_marker_argument(response: &str, marker: &str) -> Option<String> {
    let needle = format!("{marker}(");
    let start = response.rfind(&needle)?;
    let rest = &response[start + needle.len()..];
    let mut depth = 1usize;
    for (offset, ch) in rest.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(rest[..offset].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

fn strip_quotes(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.len() >= 2 {
        let first = trimmed.chars().next();
        let last = trimmed.chars().last();
        if (first == Some('"') && last == Some('"'))
            || (first == Some('\'') && last == Some('\''))
        {
            return trimmed[1..trimmed.len() - 1].to_string();
        }
    }
    trimmed.to_string()
}

fn value_to_text(value: Value) -> String {
    match value {
        Value::String(text) => text,
        other => other.to_string(),
    }
}
