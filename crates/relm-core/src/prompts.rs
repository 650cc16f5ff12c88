use relm_llm::{Message, Prompt};

/// System prompt for single-shot sessions.
pub const SYSTEM_PROMPT: &str = "You are tasked with answering a query with associated context. You can access, transform, and analyze this context interactively in a REPL environment that can recursively query sub-LLMs, which you are strongly encouraged to use as much as possible. You will be queried iteratively until you provide a final answer.

The REPL environment is initialized with:
1. A `context` variable that contains extremely important information about your query. Check the content of the `context` variable to understand what you are working with, and look through it sufficiently as you answer your query.
2. A `llm_query` function that allows you to query an LLM (that can handle around 500K chars) inside your REPL environment.
3. A `llm_query_batched` function that allows you to query multiple prompts concurrently: `llm_query_batched(prompts) -> answers`. This is much faster than sequential `llm_query` calls when you have multiple independent queries. Results are returned in the same order as the input prompts.
4. The ability to use `print()` statements to view the output of your REPL code and continue your reasoning.

You will only see truncated outputs from the REPL environment, so use the query functions on variables you want to analyze, and use variables as buffers to build up your final answer. A viable strategy is to look at the context, figure out a chunking strategy, query a sub-LLM per chunk with a particular question, save the answers to a buffer, then query a sub-LLM over all the buffers to produce your final answer.

When you want to execute code in the REPL environment, wrap it in triple backticks with the 'repl' language identifier:
```repl
chunk = context[:10000]
answer = llm_query(f\"What is the magic number in this chunk? {chunk}\")
print(answer)
```

IMPORTANT: When you are done with the iterative process, you MUST provide a final answer using one of these methods. Do not use these unless you have completed your task:
1. FINAL(your answer) - Returns the LITERAL text inside the parentheses. Does NOT evaluate code or variables. Use this only for simple text like FINAL(42) or FINAL(The answer is yes).
2. FINAL_VAR(variable_name) - Returns the value of a REPL variable. Use this when your answer is stored in a variable. For example, if you computed `result = 15 * 2` in the REPL, use FINAL_VAR(result) to return 30.

NEVER use FINAL(some_variable) expecting evaluation - always use FINAL_VAR() for variables.

Think step by step carefully, plan, and execute this plan immediately in your response -- do not just say what you will do. Remember to explicitly answer the original query in your final answer.";

/// System prompt for persistent multi-turn sessions.
pub const PERSISTENT_SYSTEM_PROMPT: &str = "You are tasked with answering queries in a multi-turn conversation. You have access to a REPL environment that maintains state across conversation turns. The `context` variable contains structured information about the conversation history and current task:
1. `turn_id`: The current turn number (0-indexed)
2. `task_history`: A list of previous tasks with full iteration details from earlier turns. Each entry has `turn_id`, `task`, `answer`, and `iterations` (the code executed and its outputs).
3. `context_{N}`: The input context for turn N (e.g. `context_0`, `context_1`, ...).

You also have access to:
- `llm_query(prompt)`: Query a sub-LLM that can handle ~500K characters
- `llm_query_batched(prompts)`: Query multiple prompts concurrently
- `print()`: View output and continue reasoning

In multi-turn mode you can reference previous turns' full work: check `context[\"task_history\"]` to see what was discussed before, read `context[\"context_0\"]`, `context[\"context_1\"]`, etc. for previous inputs, and build on variables created in earlier turns when state persistence is enabled.

When you are done, provide your final answer using:
1. FINAL(your answer) - Returns LITERAL text only. Does NOT evaluate variables.
2. FINAL_VAR(variable_name) - Returns a REPL variable's value. Use this for computed results.

Think step by step, consider the conversation history, and execute your plan immediately. Remember to explicitly answer the current query in your final answer.";

const USER_PROMPT: &str = "Think step-by-step on what to do using the REPL environment (which contains the context) to answer the prompt.\n\nContinue using the REPL environment, which has the `context` variable, and querying sub-LLMs by writing to ```repl``` tags, and determine your answer. Your next action:";

const FIRST_ITERATION_SAFEGUARD: &str = "You have not interacted with the REPL environment or seen your prompt / context yet. Your next action should be to look through and figure out how to answer the prompt, so don't just provide a final answer yet.\n\n";

const LATER_ITERATION_PREFIX: &str =
    "The history before is your previous interactions with the REPL environment. ";

/// Shape metadata about the input context, shown to the root model so it can
/// plan a chunking strategy without seeing the content itself.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueryMetadata {
    pub chunk_lengths: Vec<usize>,
    pub total_chars: usize,
    pub kind: &'static str,
}

impl QueryMetadata {
    pub fn from_prompt(prompt: &Prompt) -> Self {
        let chunk_lengths = prompt.chunk_lengths();
        Self {
            total_chars: chunk_lengths.iter().sum(),
            chunk_lengths,
            kind: prompt.kind(),
        }
    }

    /// Render the metadata line, listing at most the first 100 chunks.
    pub fn metadata_line(&self) -> String {
        let lengths = if self.chunk_lengths.len() > 100 {
            let shown: Vec<usize> = self.chunk_lengths[..100].to_vec();
            let others = self.chunk_lengths.len() - 100;
            format!("{shown:?}... [{others} others]")
        } else {
            format!("{:?}", self.chunk_lengths)
        };
        format!(
            "The `context` variable is a {} with {} total characters, broken up into chunks of char lengths: {}.",
            self.kind, self.total_chars, lengths
        )
    }
}

/// Build the initial message history: the system prompt plus the context
/// shape metadata.
pub fn build_system_messages(system_prompt: &str, metadata: &QueryMetadata) -> Vec<Message> {
    vec![Message::system(format!(
        "{system_prompt}\n\n{}",
        metadata.metadata_line()
    ))]
}

/// Per-turn prompting info for persistent sessions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PersistentTurn {
    pub turn_id: usize,
    pub has_history: bool,
}

/// Build the per-iteration user nudge. Wording differs between the first
/// iteration and later ones, and between persistent and single-shot mode.
pub fn build_user_prompt(
    root_prompt: Option<&str>,
    iteration: usize,
    persistent: Option<PersistentTurn>,
) -> Message {
    let base = match root_prompt {
        Some(root_prompt) => format!(
            "Think step-by-step on what to do using the REPL environment (which contains the context) to answer the original prompt: \"{root_prompt}\".\n\nContinue using the REPL environment, which has the `context` variable, and querying sub-LLMs by writing to ```repl``` tags, and determine your answer. Your next action:"
        ),
        None => USER_PROMPT.to_string(),
    };

    let content = match persistent {
        Some(turn) => {
            let history_note = if turn.has_history {
                "You have conversation history from previous turns - check `context[\"task_history\"]` to understand what was discussed before."
            } else {
                "This is the first turn - no previous conversation history."
            };
            let turn_note = format!(
                "This is turn {} of an ongoing conversation. The `context` variable contains `task_history` and `context_{}` for the current input.\n\n{}\n\n",
                turn.turn_id, turn.turn_id, history_note
            );
            if iteration == 0 {
                format!(
                    "You have not interacted with the REPL environment or seen your context yet. Your next action should be to examine the context (including any conversation history) and figure out how to answer the current task.\n\n{turn_note}{base}"
                )
            } else {
                format!(
                    "The history before is your previous interactions with the REPL environment in this turn. {turn_note}{base}"
                )
            }
        }
        None => {
            if iteration == 0 {
                format!("{FIRST_ITERATION_SAFEGUARD}{base}")
            } else {
                format!("{LATER_ITERATION_PREFIX}{base}")
            }
        }
    };

    Message::user(content)
}
