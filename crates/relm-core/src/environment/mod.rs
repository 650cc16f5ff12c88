use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::errors::RelmError;
use crate::handler::LmHandler;
use crate::types::ExecutionResult;

pub mod local;
pub mod sandbox;

pub use local::*;
pub use sandbox::*;

/// A REPL-like execution environment the session drives.
///
/// `execute` never fails for faults in the executed code itself; those are
/// captured into the result's stderr. Errors returned here are
/// environment-level failures (unreachable sandbox, missing handler binding)
/// and are fatal to the turn.
#[async_trait]
pub trait Environment: Send + Sync {
    async fn setup(&mut self) -> Result<(), RelmError>;

    /// Point sub-model calls at the given handler. Called once per turn;
    /// reused environments are re-bound because each turn runs its own
    /// handler endpoint.
    async fn bind_handler(&mut self, handler: &Arc<LmHandler>) -> Result<(), RelmError>;

    /// Install the `context` binding the executed code reads.
    async fn load_context(&mut self, payload: Value) -> Result<(), RelmError>;

    async fn execute(&mut self, code: &str) -> Result<ExecutionResult, RelmError>;

    /// Resolve a variable in the environment's current bindings.
    fn lookup_local(&self, name: &str) -> Option<Value>;

    /// Serializable snapshot of non-internal bindings.
    fn locals_snapshot(&self) -> BTreeMap<String, Value>;

    /// Seed bindings carried over from previous turns.
    fn restore_locals(&mut self, locals: BTreeMap<String, Value>);

    async fn cleanup(&mut self) -> Result<(), RelmError>;
}

/// Builds environments for session turns. Persistent sessions provision one
/// environment and reuse it; single-shot sessions provision per call.
#[async_trait]
pub trait EnvironmentProvider: Send + Sync {
    fn supports_persistence(&self) -> bool;

    async fn provision(&self) -> Result<Box<dyn Environment>, RelmError>;
}
