//! Confines an agent's tool calls to a project directory.
//!
//! Agent output is scanned for tool calls in any of the supported syntaxes
//! ([`extract`]), and each call is dispatched through a [`Dispatcher`] that
//! resolves paths with a [`tools::path_guard::PathGuard`] and validates
//! commands with a [`tools::policy::CommandValidator`] before anything runs.

pub mod config;
pub mod error;
pub mod extract;
pub mod tools;

pub use error::ToolError;
pub use extract::{extract, Extraction, Operation, SourceSyntax, ToolCall, Warning};
pub use tools::{Dispatcher, ToolResult, TurnReport};
