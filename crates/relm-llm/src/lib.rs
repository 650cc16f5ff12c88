//! Model-client contract for recursive language model sessions.
//!
//! This crate defines the prompt variants, the `LmClient` trait that concrete
//! provider wrappers implement, and the usage accounting types shared by the
//! orchestration crate.

pub mod client;
pub mod errors;
pub mod types;
pub mod usage;

pub use client::*;
pub use errors::*;
pub use types::*;
pub use usage::*;
