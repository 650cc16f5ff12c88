use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use relm_llm::{LmClient, Message, Prompt, UsageSummary};
use serde_json::Value;
use tracing::{debug, warn};

use crate::environment::{Environment, EnvironmentProvider};
use crate::errors::RelmError;
use crate::handler::LmHandler;
use crate::parsing::{find_code_blocks, find_final_answer, format_iteration};
use crate::prompts::{
    PERSISTENT_SYSTEM_PROMPT, PersistentTurn, QueryMetadata, SYSTEM_PROMPT, build_system_messages,
    build_user_prompt,
};
use crate::types::{
    CodeBlock, Iteration, IterationRecord, RelmCompletion, TaskHistoryEntry,
};

/// Session tuning knobs.
#[derive(Clone, Debug)]
pub struct RelmConfig {
    /// Recursion depth of this session. Sessions at `max_depth` or deeper
    /// answer with a single direct model call instead of the iterative loop.
    pub depth: usize,
    pub max_depth: usize,
    pub max_iterations: usize,
    /// Keep the environment and task history alive across `complete` calls.
    pub persistent: bool,
    /// Carry non-internal variables across turns. Requires `persistent`.
    pub persist_state: bool,
    pub system_prompt: Option<String>,
}

impl Default for RelmConfig {
    fn default() -> Self {
        Self {
            depth: 0,
            max_depth: 1,
            max_iterations: 30,
            persistent: false,
            persist_state: false,
            system_prompt: None,
        }
    }
}

/// Builder for [`Relm`] sessions.
pub struct RelmBuilder {
    root_client: Option<Arc<dyn LmClient>>,
    extra_clients: Vec<(String, Arc<dyn LmClient>)>,
    provider: Option<Arc<dyn EnvironmentProvider>>,
    config: RelmConfig,
}

impl RelmBuilder {
    pub fn new() -> Self {
        Self {
            root_client: None,
            extra_clients: Vec::new(),
            provider: None,
            config: RelmConfig::default(),
        }
    }

    pub fn root_client(mut self, client: Arc<dyn LmClient>) -> Self {
        self.root_client = Some(client);
        self
    }

    /// Register a named client available to sub-calls in addition to the root.
    pub fn register_client(mut self, name: impl Into<String>, client: Arc<dyn LmClient>) -> Self {
        self.extra_clients.push((name.into(), client));
        self
    }

    pub fn environment(mut self, provider: Arc<dyn EnvironmentProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn depth(mut self, depth: usize) -> Self {
        self.config.depth = depth;
        self
    }

    pub fn max_depth(mut self, max_depth: usize) -> Self {
        self.config.max_depth = max_depth;
        self
    }

    pub fn max_iterations(mut self, max_iterations: usize) -> Self {
        self.config.max_iterations = max_iterations;
        self
    }

    pub fn persistent(mut self, persistent: bool) -> Self {
        self.config.persistent = persistent;
        self
    }

    pub fn persist_state(mut self, persist_state: bool) -> Self {
        self.config.persist_state = persist_state;
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(prompt.into());
        self
    }

    pub fn build(self) -> Result<Relm, RelmError> {
        let root_client = self.root_client.ok_or_else(|| {
            RelmError::Configuration("a root client is required".to_string())
        })?;
        let provider = self.provider.ok_or_else(|| {
            RelmError::Configuration("an environment provider is required".to_string())
        })?;
        if self.config.max_iterations == 0 {
            return Err(RelmError::Configuration(
                "max_iterations must be at least 1".to_string(),
            ));
        }
        if self.config.persist_state && !self.config.persistent {
            return Err(RelmError::Configuration(
                "persist_state requires a persistent session".to_string(),
            ));
        }
        if self.config.persistent && !provider.supports_persistence() {
            return Err(RelmError::Configuration(
                "environment provider does not support persistent sessions".to_string(),
            ));
        }

        let system_prompt = self.config.system_prompt.clone().unwrap_or_else(|| {
            if self.config.persistent {
                PERSISTENT_SYSTEM_PROMPT.to_string()
            } else {
                SYSTEM_PROMPT.to_string()
            }
        });
        debug!(
            model = root_client.model_name(),
            depth = self.config.depth,
            max_iterations = self.config.max_iterations,
            persistent = self.config.persistent,
            "session configured"
        );

        Ok(Relm {
            root_client,
            extra_clients: self.extra_clients,
            provider,
            config: self.config,
            system_prompt,
            turn_count: 0,
            task_history: Vec::new(),
            persistent_contexts: Vec::new(),
            turn_histories: Vec::new(),
            persistent_locals: BTreeMap::new(),
            held_env: None,
        })
    }
}

impl Default for RelmBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A recursive language model session.
///
/// Each `complete` call runs the iterative loop: prompt the root model,
/// execute any fenced code in the environment, fold the output back into the
/// message history, and stop at a terminal answer or the iteration cap.
/// Persistent sessions additionally keep the environment and an append-only
/// task history across calls.
pub struct Relm {
    root_client: Arc<dyn LmClient>,
    extra_clients: Vec<(String, Arc<dyn LmClient>)>,
    provider: Arc<dyn EnvironmentProvider>,
    config: RelmConfig,
    system_prompt: String,
    turn_count: usize,
    task_history: Vec<TaskHistoryEntry>,
    /// Raw inputs of completed turns, re-installed as `context_{N}` bindings.
    persistent_contexts: Vec<Value>,
    /// Message transcripts of completed turns, installed as `history_{N}`
    /// bindings with `history` aliasing the first.
    turn_histories: Vec<Value>,
    persistent_locals: BTreeMap<String, Value>,
    held_env: Option<Box<dyn Environment>>,
}

impl Relm {
    pub fn builder() -> RelmBuilder {
        RelmBuilder::new()
    }

    /// Answer a query. `root_prompt` optionally names the concrete question
    /// repeated in every iteration nudge; without it the model is pointed at
    /// the `context` variable alone.
    pub async fn complete(
        &mut self,
        prompt: impl Into<Prompt>,
        root_prompt: Option<&str>,
    ) -> Result<RelmCompletion, RelmError> {
        let prompt = prompt.into();
        let started = Instant::now();

        if self.config.depth >= self.config.max_depth {
            return self.direct_completion(prompt, started).await;
        }

        let mut handler = LmHandler::new(self.root_client.clone());
        for (name, client) in &self.extra_clients {
            handler.register(name.clone(), client.clone());
        }
        let handler = Arc::new(handler);
        handler.start().await?;

        let mut env = match self.acquire_environment().await {
            Ok(env) => env,
            Err(error) => {
                handler.stop().await;
                return Err(error);
            }
        };

        let turn = self.run_turn(&mut env, &handler, &prompt, root_prompt).await;

        if turn.is_ok() && self.config.persist_state {
            self.persistent_locals = env.locals_snapshot();
        }
        if self.config.persistent {
            self.held_env = Some(env);
        } else if let Err(error) = env.cleanup().await {
            warn!(%error, "environment cleanup failed");
        }
        handler.stop().await;

        let (answer, iterations, messages) = turn?;
        let usage = handler.usage_summary();
        let duration_ms = started.elapsed().as_millis() as u64;

        if self.config.persistent {
            self.task_history.push(TaskHistoryEntry::new(
                self.turn_count,
                &task_text(&prompt),
                answer.clone(),
                iterations.iter().map(IterationRecord::from).collect(),
                duration_ms,
                usage.clone(),
            ));
            self.persistent_contexts
                .push(serde_json::to_value(&prompt).unwrap_or(Value::Null));
            self.turn_histories
                .push(serde_json::to_value(&messages).unwrap_or(Value::Null));
            self.turn_count += 1;
        }

        Ok(RelmCompletion {
            root_model: self.root_client.model_name().to_string(),
            prompt,
            response: answer,
            usage,
            duration_ms,
        })
    }

    /// Turns completed so far in a persistent session.
    pub fn turn_count(&self) -> usize {
        self.turn_count
    }

    pub fn get_task_history(&self) -> &[TaskHistoryEntry] {
        &self.task_history
    }

    /// Human-readable digest of the conversation so far.
    pub fn get_history_summary(&self) -> String {
        if self.task_history.is_empty() {
            return "No conversation history yet.".to_string();
        }
        let entries: Vec<String> = self
            .task_history
            .iter()
            .map(TaskHistoryEntry::to_context_summary)
            .collect();
        format!(
            "=== Conversation History ({} turns) ===\n\n{}",
            self.task_history.len(),
            entries.join("\n\n")
        )
    }

    /// Forget the recorded turns and reset numbering. Pass `discard_locals`
    /// to also drop variables carried across turns.
    pub fn clear_history(&mut self, discard_locals: bool) {
        self.task_history.clear();
        self.persistent_contexts.clear();
        self.turn_histories.clear();
        self.turn_count = 0;
        if discard_locals {
            self.persistent_locals.clear();
        }
    }

    pub fn persistent_locals(&self) -> &BTreeMap<String, Value> {
        &self.persistent_locals
    }

    /// Seed a variable into the next turn's environment.
    pub fn set_persistent_local(&mut self, name: impl Into<String>, value: Value) {
        self.persistent_locals.insert(name.into(), value);
    }

    pub fn has_live_environment(&self) -> bool {
        self.held_env.is_some()
    }

    /// Tear down a held environment. Persistent sessions keep answering after
    /// `close`; the next turn provisions a fresh environment.
    pub async fn close(&mut self) -> Result<(), RelmError> {
        if let Some(mut env) = self.held_env.take() {
            env.cleanup().await?;
        }
        Ok(())
    }

    async fn acquire_environment(&mut self) -> Result<Box<dyn Environment>, RelmError> {
        if self.config.persistent {
            if let Some(env) = self.held_env.take() {
                return Ok(env);
            }
        }
        self.provider.provision().await
    }

    async fn direct_completion(
        &self,
        prompt: Prompt,
        started: Instant,
    ) -> Result<RelmCompletion, RelmError> {
        debug!(depth = self.config.depth, "at depth limit; answering directly");
        let completion = self.root_client.complete(&prompt).await?;
        let mut usage = UsageSummary::default();
        usage.record(self.root_client.model_name(), completion.usage);
        Ok(RelmCompletion {
            root_model: self.root_client.model_name().to_string(),
            prompt,
            response: completion.text,
            usage,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn run_turn(
        &self,
        env: &mut Box<dyn Environment>,
        handler: &Arc<LmHandler>,
        prompt: &Prompt,
        root_prompt: Option<&str>,
    ) -> Result<(String, Vec<Iteration>, Vec<Message>), RelmError> {
        env.bind_handler(handler).await?;
        if self.config.persist_state && !self.persistent_locals.is_empty() {
            env.restore_locals(self.persistent_locals.clone());
        }
        if !self.turn_histories.is_empty() {
            env.restore_locals(self.history_bindings());
        }
        env.load_context(self.context_payload(prompt)?).await?;

        let metadata = QueryMetadata::from_prompt(prompt);
        let mut history = build_system_messages(&self.system_prompt, &metadata);
        let mut iterations: Vec<Iteration> = Vec::new();
        let persistent_turn = self.config.persistent.then_some(PersistentTurn {
            turn_id: self.turn_count,
            has_history: !self.task_history.is_empty(),
        });

        for index in 0..self.config.max_iterations {
            let mut messages = history.clone();
            messages.push(build_user_prompt(root_prompt, index, persistent_turn));
            let iteration_prompt = Prompt::Messages(messages);

            let iteration_started = Instant::now();
            let response = handler.complete(&iteration_prompt, None).await?;

            let mut code_blocks = Vec::new();
            for code in find_code_blocks(&response) {
                let result = env.execute(&code).await?;
                code_blocks.push(CodeBlock { code, result });
            }

            let final_answer = find_final_answer(&response, |name| env.lookup_local(name));
            let iteration = Iteration {
                prompt: iteration_prompt,
                response,
                code_blocks,
                final_answer: final_answer.clone(),
                duration_ms: iteration_started.elapsed().as_millis() as u64,
            };
            debug!(
                iteration = index,
                blocks = iteration.code_blocks.len(),
                terminal = final_answer.is_some(),
                "iteration finished"
            );
            history.extend(format_iteration(&iteration));
            iterations.push(iteration);

            if let Some(answer) = final_answer {
                return Ok((answer, iterations, history));
            }
        }

        // Out of iterations; ask for a best-effort answer over the history.
        history.push(Message::user(
            "You have reached the iteration limit. Provide a final answer to the original query now, based on the information gathered above.",
        ));
        let closing_prompt = Prompt::Messages(history.clone());
        let closing_started = Instant::now();
        let answer = handler.complete(&closing_prompt, None).await?;
        history.push(Message::assistant(answer.clone()));
        iterations.push(Iteration {
            prompt: closing_prompt,
            response: answer.clone(),
            code_blocks: Vec::new(),
            final_answer: Some(answer.clone()),
            duration_ms: closing_started.elapsed().as_millis() as u64,
        });
        Ok((answer, iterations, history))
    }

    /// Bindings exposing completed turns' transcripts: `history_{N}` per
    /// turn, `history` aliasing the first.
    fn history_bindings(&self) -> BTreeMap<String, Value> {
        let mut bindings = BTreeMap::new();
        for (turn, transcript) in self.turn_histories.iter().enumerate() {
            bindings.insert(format!("history_{turn}"), transcript.clone());
        }
        if let Some(first) = self.turn_histories.first() {
            bindings.insert("history".to_string(), first.clone());
        }
        bindings
    }

    fn context_payload(&self, prompt: &Prompt) -> Result<Value, RelmError> {
        let prompt_value = serde_json::to_value(prompt).map_err(|error| {
            RelmError::Environment(format!("failed to serialize context: {error}"))
        })?;
        if !self.config.persistent {
            return Ok(prompt_value);
        }

        let history = serde_json::to_value(&self.task_history).map_err(|error| {
            RelmError::Environment(format!("failed to serialize task history: {error}"))
        })?;
        let mut payload = serde_json::Map::new();
        payload.insert("turn_id".to_string(), Value::from(self.turn_count));
        payload.insert("task_history".to_string(), history);
        for (turn, context) in self.persistent_contexts.iter().enumerate() {
            payload.insert(format!("context_{turn}"), context.clone());
        }
        payload.insert(format!("context_{}", self.turn_count), prompt_value);
        Ok(Value::Object(payload))
    }
}

/// Short task description stored in history entries.
fn task_text(prompt: &Prompt) -> String {
    match prompt {
        Prompt::Text(text) => text.clone(),
        Prompt::Structured(Value::Object(map)) => map
            .get("task")
            .or_else(|| map.get("query"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| Value::Object(map.clone()).to_string()),
        other => other.to_text(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn task_text_prefers_task_and_query_keys() {
        assert_eq!(task_text(&Prompt::Text("plain".to_string())), "plain");
        assert_eq!(
            task_text(&Prompt::Structured(json!({"task": "t", "data": "d"}))),
            "t"
        );
        assert_eq!(
            task_text(&Prompt::Structured(json!({"query": "q"}))),
            "q"
        );
        let fallback = task_text(&Prompt::Structured(json!({"data": "d"})));
        assert!(fallback.contains("\"data\""));
    }
}
