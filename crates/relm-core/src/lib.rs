//! Recursive language model orchestration.
//!
//! A root model answers queries by writing code for a REPL-like environment
//! that can itself issue completions against sub-models, including a
//! recursive re-entry one level deeper. This crate provides the session loop,
//! the host-side completion handler, the execution-environment seam, and the
//! polling-based callback broker used when code runs on a remote sandbox.

pub mod broker;
pub mod environment;
pub mod errors;
pub mod handler;
pub mod parsing;
pub mod poller;
pub mod prompts;
pub mod session;
pub mod types;
pub mod wire;

pub use broker::*;
pub use environment::*;
pub use errors::*;
pub use handler::*;
pub use parsing::*;
pub use poller::*;
pub use prompts::*;
pub use session::*;
pub use types::*;
pub use wire::*;
