use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use relm_llm::Prompt;
use serde_json::Value;

use crate::environment::{Environment, EnvironmentProvider};
use crate::errors::RelmError;
use crate::handler::LmHandler;
use crate::types::{CompletionRecord, ExecutionResult, filter_internal_locals};

/// Sub-model entry points exposed to executed code as `llm_query` and
/// `llm_query_batched`. Failures surface as `Error: ...` strings rather than
/// aborting the execution.
#[async_trait]
pub trait SubLm: Send + Sync {
    async fn query(&self, prompt: &str, model: Option<&str>) -> String;

    async fn query_batched(&self, prompts: &[String], model: Option<&str>) -> Vec<String>;
}

/// Output of one interpreted code fragment. Faults in the fragment itself are
/// captured into `stderr`, not returned as errors.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InterpreterOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Executes code fragments against a mutable set of bindings, with sub-model
/// access. Implementations embed whatever language the deployment runs.
#[async_trait]
pub trait Interpreter: Send + Sync {
    async fn run(
        &self,
        code: &str,
        locals: &mut BTreeMap<String, Value>,
        sub_lm: &dyn SubLm,
    ) -> Result<InterpreterOutput, RelmError>;
}

/// In-process `SubLm` over the turn's handler, recording every serviced call.
struct HandlerBridge {
    handler: Arc<LmHandler>,
    records: Arc<Mutex<Vec<CompletionRecord>>>,
}

impl HandlerBridge {
    fn drain_records(&self) -> Vec<CompletionRecord> {
        std::mem::take(
            &mut *self
                .records
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        )
    }
}

#[async_trait]
impl SubLm for HandlerBridge {
    async fn query(&self, prompt: &str, model: Option<&str>) -> String {
        match self
            .handler
            .complete_record(&Prompt::Text(prompt.to_string()), model)
            .await
        {
            Ok(record) => {
                let response = record.response.clone();
                self.records
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .push(record);
                response
            }
            Err(error) => format!("Error: {error}"),
        }
    }

    async fn query_batched(&self, prompts: &[String], model: Option<&str>) -> Vec<String> {
        let slots = self.handler.complete_batch(prompts, model).await;
        let mut responses = Vec::with_capacity(slots.len());
        for slot in slots {
            match slot {
                Ok(record) => {
                    responses.push(record.response.clone());
                    self.records
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .push(record);
                }
                Err(error) => responses.push(format!("Error: {error}")),
            }
        }
        responses
    }
}

/// Execution environment running in the orchestrator's own process. Sub-model
/// calls go straight to the handler, no HTTP hop involved.
pub struct LocalEnv {
    interpreter: Arc<dyn Interpreter>,
    locals: BTreeMap<String, Value>,
    bridge: Option<HandlerBridge>,
}

impl LocalEnv {
    pub fn new(interpreter: Arc<dyn Interpreter>) -> Self {
        Self {
            interpreter,
            locals: BTreeMap::new(),
            bridge: None,
        }
    }
}

#[async_trait]
impl Environment for LocalEnv {
    async fn setup(&mut self) -> Result<(), RelmError> {
        Ok(())
    }

    async fn bind_handler(&mut self, handler: &Arc<LmHandler>) -> Result<(), RelmError> {
        self.bridge = Some(HandlerBridge {
            handler: handler.clone(),
            records: Arc::new(Mutex::new(Vec::new())),
        });
        Ok(())
    }

    async fn load_context(&mut self, payload: Value) -> Result<(), RelmError> {
        self.locals.insert("context".to_string(), payload);
        Ok(())
    }

    async fn execute(&mut self, code: &str) -> Result<ExecutionResult, RelmError> {
        let bridge = self
            .bridge
            .as_ref()
            .ok_or_else(|| RelmError::Environment("no handler bound".to_string()))?;
        bridge.drain_records();

        let started = Instant::now();
        let output = self
            .interpreter
            .run(code, &mut self.locals, bridge)
            .await?;

        Ok(ExecutionResult {
            stdout: output.stdout,
            stderr: output.stderr,
            locals: filter_internal_locals(self.locals.clone()),
            duration_ms: started.elapsed().as_millis() as u64,
            sub_calls: bridge.drain_records(),
        })
    }

    fn lookup_local(&self, name: &str) -> Option<Value> {
        self.locals.get(name).cloned()
    }

    fn locals_snapshot(&self) -> BTreeMap<String, Value> {
        filter_internal_locals(self.locals.clone())
    }

    fn restore_locals(&mut self, locals: BTreeMap<String, Value>) {
        self.locals.extend(locals);
    }

    async fn cleanup(&mut self) -> Result<(), RelmError> {
        self.bridge = None;
        Ok(())
    }
}

/// Provider for in-process environments.
pub struct LocalProvider {
    interpreter: Arc<dyn Interpreter>,
}

impl LocalProvider {
    pub fn new(interpreter: Arc<dyn Interpreter>) -> Self {
        Self { interpreter }
    }
}

#[async_trait]
impl EnvironmentProvider for LocalProvider {
    fn supports_persistence(&self) -> bool {
        true
    }

    async fn provision(&self) -> Result<Box<dyn Environment>, RelmError> {
        let mut env = LocalEnv::new(self.interpreter.clone());
        env.setup().await?;
        Ok(Box::new(env))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relm_llm::{Completion, LlmError, LmClient, ModelUsage, UsageSummary};
    use serde_json::json;

    struct EchoClient;

    #[async_trait]
    impl LmClient for EchoClient {
        fn model_name(&self) -> &str {
            "echo"
        }

        async fn complete(&self, prompt: &Prompt) -> Result<Completion, LlmError> {
            Ok(Completion::new(
                format!("echo: {}", prompt.to_text()),
                ModelUsage::single_call(1, 1),
            ))
        }

        fn usage_summary(&self) -> UsageSummary {
            UsageSummary::default()
        }
    }

    /// Interpreter that stores the fragment under `last_code` and queries the
    /// sub-model with it, printing the answer.
    struct QueryingInterpreter;

    #[async_trait]
    impl Interpreter for QueryingInterpreter {
        async fn run(
            &self,
            code: &str,
            locals: &mut BTreeMap<String, Value>,
            sub_lm: &dyn SubLm,
        ) -> Result<InterpreterOutput, RelmError> {
            locals.insert("last_code".to_string(), json!(code));
            let answer = sub_lm.query(code, None).await;
            Ok(InterpreterOutput {
                stdout: format!("{answer}\n"),
                stderr: String::new(),
            })
        }
    }

    #[tokio::test]
    async fn execute_without_handler_is_an_environment_error() {
        let mut env = LocalEnv::new(Arc::new(QueryingInterpreter));
        let result = env.execute("x = 1").await;
        assert!(matches!(result, Err(RelmError::Environment(_))));
    }

    #[tokio::test]
    async fn execution_captures_sub_calls_and_locals() {
        let handler = Arc::new(LmHandler::new(Arc::new(EchoClient)));
        let mut env = LocalEnv::new(Arc::new(QueryingInterpreter));
        env.bind_handler(&handler).await.unwrap();
        env.load_context(json!("doc body")).await.unwrap();

        let result = env.execute("summarize").await.unwrap();
        assert_eq!(result.stdout, "echo: summarize\n");
        assert_eq!(result.sub_calls.len(), 1);
        assert_eq!(result.sub_calls[0].model, "echo");
        // `context` never leaks into the reported locals.
        assert!(!result.locals.contains_key("context"));
        assert_eq!(result.locals["last_code"], json!("summarize"));
        assert_eq!(env.lookup_local("context"), Some(json!("doc body")));
    }

    #[tokio::test]
    async fn records_reset_between_executions() {
        let handler = Arc::new(LmHandler::new(Arc::new(EchoClient)));
        let mut env = LocalEnv::new(Arc::new(QueryingInterpreter));
        env.bind_handler(&handler).await.unwrap();

        let first = env.execute("a").await.unwrap();
        let second = env.execute("b").await.unwrap();
        assert_eq!(first.sub_calls.len(), 1);
        assert_eq!(second.sub_calls.len(), 1);
        assert_eq!(second.sub_calls[0].prompt, Prompt::Text("b".to_string()));
    }

    #[tokio::test]
    async fn restored_locals_are_visible_to_lookup() {
        let mut env = LocalEnv::new(Arc::new(QueryingInterpreter));
        env.restore_locals(BTreeMap::from([("carried".to_string(), json!(7))]));
        assert_eq!(env.lookup_local("carried"), Some(json!(7)));
    }
}
