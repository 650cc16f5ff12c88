//! Shared fixtures: a scripted model client and a tiny assignment-language
//! interpreter, enough to drive the session loop without a real provider.
#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use relm_core::{Interpreter, InterpreterOutput, RelmError, SubLm};
use relm_llm::{Completion, LlmError, LmClient, ModelUsage, Prompt, UsageSummary};
use serde_json::Value;

pub struct ScriptedClient {
    name: String,
    responses: Mutex<VecDeque<String>>,
    usage: Mutex<UsageSummary>,
}

impl ScriptedClient {
    pub fn new(name: &str, responses: Vec<&str>) -> Self {
        Self {
            name: name.to_string(),
            responses: Mutex::new(responses.into_iter().map(str::to_string).collect()),
            usage: Mutex::new(UsageSummary::default()),
        }
    }

    pub fn remaining(&self) -> usize {
        self.responses.lock().unwrap().len()
    }
}

#[async_trait]
impl LmClient for ScriptedClient {
    fn model_name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, _prompt: &Prompt) -> Result<Completion, LlmError> {
        let next = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| LlmError::provider("script exhausted"))?;
        let usage = ModelUsage::single_call(10, 5);
        self.usage.lock().unwrap().record(&self.name, usage);
        Ok(Completion::new(next, usage))
    }

    fn usage_summary(&self) -> UsageSummary {
        self.usage.lock().unwrap().clone()
    }
}

/// Line-oriented interpreter for test fragments. Supported statements:
///
/// ```text
/// x = <json literal>
/// x = a * b                      (integer locals)
/// x = llm_query("prompt")
/// xs = llm_query_batched(["p1", "p2"])
/// print(expr)
/// ```
///
/// Faults in a statement land in stderr and execution continues.
pub struct MiniInterpreter;

#[async_trait]
impl Interpreter for MiniInterpreter {
    async fn run(
        &self,
        code: &str,
        locals: &mut BTreeMap<String, Value>,
        sub_lm: &dyn SubLm,
    ) -> Result<InterpreterOutput, RelmError> {
        let mut stdout = String::new();
        let mut stderr = String::new();

        for line in code.lines().map(str::trim).filter(|line| !line.is_empty()) {
            if let Some(inner) = line
                .strip_prefix("print(")
                .and_then(|rest| rest.strip_suffix(')'))
            {
                match eval_atom(inner.trim(), locals) {
                    Ok(value) => {
                        stdout.push_str(&render(&value));
                        stdout.push('\n');
                    }
                    Err(message) => push_line(&mut stderr, &message),
                }
            } else if let Some((name, expr)) = line.split_once('=') {
                match eval_expr(expr.trim(), locals, sub_lm).await {
                    Ok(value) => {
                        locals.insert(name.trim().to_string(), value);
                    }
                    Err(message) => push_line(&mut stderr, &message),
                }
            } else {
                push_line(&mut stderr, &format!("cannot parse statement: {line}"));
            }
        }

        Ok(InterpreterOutput { stdout, stderr })
    }
}

async fn eval_expr(
    expr: &str,
    locals: &BTreeMap<String, Value>,
    sub_lm: &dyn SubLm,
) -> Result<Value, String> {
    if let Some(inner) = expr
        .strip_prefix("llm_query_batched(")
        .and_then(|rest| rest.strip_suffix(')'))
    {
        let prompts: Vec<String> = serde_json::from_str(inner.trim())
            .map_err(|_| format!("llm_query_batched expects a JSON string array: {inner}"))?;
        let answers = sub_lm.query_batched(&prompts, None).await;
        return Ok(Value::from(answers));
    }
    if let Some(inner) = expr
        .strip_prefix("llm_query(")
        .and_then(|rest| rest.strip_suffix(')'))
    {
        let prompt = match eval_atom(inner.trim(), locals)? {
            Value::String(text) => text,
            other => other.to_string(),
        };
        return Ok(Value::String(sub_lm.query(&prompt, None).await));
    }
    if let Some((left, right)) = expr.split_once('*') {
        let left = as_int(&eval_atom(left.trim(), locals)?)?;
        let right = as_int(&eval_atom(right.trim(), locals)?)?;
        return Ok(Value::from(left * right));
    }
    eval_atom(expr, locals)
}

fn eval_atom(expr: &str, locals: &BTreeMap<String, Value>) -> Result<Value, String> {
    if let Ok(value) = serde_json::from_str::<Value>(expr) {
        return Ok(value);
    }
    locals
        .get(expr)
        .cloned()
        .ok_or_else(|| format!("name '{expr}' is not defined"))
}

fn as_int(value: &Value) -> Result<i64, String> {
    value
        .as_i64()
        .ok_or_else(|| format!("expected an integer, got {value}"))
}

fn render(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn push_line(buffer: &mut String, line: &str) {
    buffer.push_str(line);
    buffer.push('\n');
}
