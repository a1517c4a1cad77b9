use registra_storage::StorageError;
use thiserror::Error;

use crate::script::ScriptError;

/// Errors raised by the policy core.
///
/// Resolution failures (unresolvable facts, missing permission or group
/// records) are not errors: they map to an ERROR-class operation result and
/// the enclosing pattern simply does not pass. Only malformed input, script
/// faults and collaborator failures propagate to the caller.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// Malformed input: null policy identifier, missing fact, and so on.
    #[error("Value error: {0}")]
    Value(String),

    /// Scripted policy logic failed. Scripts are trusted policy code; their
    /// failure is never silently absorbed.
    #[error("Script failure: {0}")]
    Script(#[from] ScriptError),

    /// A collaborator call failed.
    #[error("Storage failure: {0}")]
    Storage(#[from] StorageError),

    /// A policy document or template could not be parsed.
    #[error("Parse failure: {0}")]
    Parse(#[from] serde_json::Error),
}

impl PolicyError {
    pub fn value(message: impl Into<String>) -> Self {
        Self::Value(message.into())
    }

    /// Shorthand used when a pattern is missing its fact or match fact.
    pub(crate) fn missing_fact(which: &str) -> Self {
        Self::value(format!("Pattern {which} fact is null"))
    }
}

/// Type alias for policy results.
pub type PolicyResult<T> = std::result::Result<T, PolicyError>;
