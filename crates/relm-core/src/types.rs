use std::collections::BTreeMap;

use relm_llm::{Prompt, UsageSummary};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Task text stored in history is cut at this many characters.
pub const TASK_HISTORY_TRUNCATION: usize = 1000;

/// Record of a single completion serviced by the handler, local or remote.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompletionRecord {
    pub model: String,
    pub prompt: Prompt,
    pub response: String,
    /// Handler usage snapshot at the time of the call.
    pub usage: UsageSummary,
    pub duration_ms: u64,
}

/// Captured output of one code execution in an environment.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    /// Environment-visible bindings after the execution, in serializable
    /// form. Internal and `_`-prefixed names are excluded.
    pub locals: BTreeMap<String, Value>,
    pub duration_ms: u64,
    /// Sub-model calls made during this execution, in order.
    pub sub_calls: Vec<CompletionRecord>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CodeBlock {
    pub code: String,
    pub result: ExecutionResult,
}

/// One model-response + code-execution round within a turn.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Iteration {
    pub prompt: Prompt,
    pub response: String,
    pub code_blocks: Vec<CodeBlock>,
    pub final_answer: Option<String>,
    pub duration_ms: u64,
}

/// Lightweight form of an iteration kept in task history: response text and
/// per-block code/stdout/stderr, timing and locals dropped for compactness.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub response: String,
    pub code_blocks: Vec<CodeBlockRecord>,
    pub final_answer: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CodeBlockRecord {
    pub code: String,
    pub stdout: String,
    pub stderr: String,
}

impl From<&Iteration> for IterationRecord {
    fn from(iteration: &Iteration) -> Self {
        Self {
            response: iteration.response.clone(),
            code_blocks: iteration
                .code_blocks
                .iter()
                .map(|block| CodeBlockRecord {
                    code: block.code.clone(),
                    stdout: block.result.stdout.clone(),
                    stderr: block.result.stderr.clone(),
                })
                .collect(),
            final_answer: iteration.final_answer.clone(),
        }
    }
}

/// A completed turn in a persistent session. Append-only.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskHistoryEntry {
    pub turn_id: usize,
    pub task: String,
    pub answer: String,
    pub iterations: Vec<IterationRecord>,
    pub duration_ms: u64,
    pub usage: UsageSummary,
}

impl TaskHistoryEntry {
    pub fn new(
        turn_id: usize,
        task: &str,
        answer: impl Into<String>,
        iterations: Vec<IterationRecord>,
        duration_ms: u64,
        usage: UsageSummary,
    ) -> Self {
        Self {
            turn_id,
            task: truncate_task(task),
            answer: answer.into(),
            iterations,
            duration_ms,
            usage,
        }
    }

    /// One-line form used by history summaries.
    pub fn to_context_summary(&self) -> String {
        format!("[Turn {}] Task: {}\nAnswer: {}", self.turn_id, self.task, self.answer)
    }
}

/// Final result of a session-level completion call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RelmCompletion {
    pub root_model: String,
    pub prompt: Prompt,
    pub response: String,
    pub usage: UsageSummary,
    pub duration_ms: u64,
}

fn truncate_task(task: &str) -> String {
    if task.chars().count() <= TASK_HISTORY_TRUNCATION {
        return task.to_string();
    }
    let head: String = task.chars().take(TASK_HISTORY_TRUNCATION).collect();
    format!("{head}...")
}

/// Drop internal bindings from a locals snapshot: `_`-prefixed names and the
/// `context` binding the orchestrator installs itself.
pub fn filter_internal_locals(locals: BTreeMap<String, Value>) -> BTreeMap<String, Value> {
    locals
        .into_iter()
        .filter(|(name, _)| !name.starts_with('_') && name != "context")
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn long_tasks_are_truncated_with_ellipsis() {
        let task = "x".repeat(TASK_HISTORY_TRUNCATION + 50);
        let entry = TaskHistoryEntry::new(0, &task, "a", Vec::new(), 0, UsageSummary::default());
        assert_eq!(entry.task.chars().count(), TASK_HISTORY_TRUNCATION + 3);
        assert!(entry.task.ends_with("..."));
    }

    #[test]
    fn short_tasks_are_kept_verbatim() {
        let entry =
            TaskHistoryEntry::new(1, "short", "answer", Vec::new(), 5, UsageSummary::default());
        assert_eq!(entry.task, "short");
        assert_eq!(
            entry.to_context_summary(),
            "[Turn 1] Task: short\nAnswer: answer"
        );
    }

    #[test]
    fn internal_locals_are_filtered() {
        let locals = BTreeMap::from([
            ("x".to_string(), json!(1)),
            ("_tmp".to_string(), json!(2)),
            ("context".to_string(), json!({"doc": "body"})),
        ]);
        let filtered = filter_internal_locals(locals);
        assert_eq!(filtered.len(), 1);
        assert!(filtered.contains_key("x"));
    }

    #[test]
    fn iteration_record_drops_timing_and_locals() {
        let iteration = Iteration {
            prompt: Prompt::Text("p".to_string()),
            response: "r".to_string(),
            code_blocks: vec![CodeBlock {
                code: "print(1)".to_string(),
                result: ExecutionResult {
                    stdout: "1\n".to_string(),
                    stderr: String::new(),
                    locals: BTreeMap::from([("x".to_string(), json!(1))]),
                    duration_ms: 12,
                    sub_calls: Vec::new(),
                },
            }],
            final_answer: None,
            duration_ms: 40,
        };

        let record = IterationRecord::from(&iteration);
        assert_eq!(record.code_blocks.len(), 1);
        assert_eq!(record.code_blocks[0].stdout, "1\n");
        let value = serde_json::to_value(&record).unwrap();
        assert!(value["code_blocks"][0].get("locals").is_none());
    }
}
