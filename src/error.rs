//! Error taxonomy for the agent pipeline.
//!
//! Only `Structural`, `ToolResolution`, `Provider` and `Cancelled` ever cross a
//! component boundary. Tool execution failures are turned into plain result
//! strings by the executor and never show up here.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    /// Unparsable plan JSON or a step missing required fields
    #[error("Invalid plan: {0}")]
    Structural(String),

    /// No tool could be resolved for a step, even after the keyword fallback
    #[error("Could not resolve a tool for step {step}: {reason}")]
    ToolResolution { step: usize, reason: String },

    /// Model call failed (not cancelled)
    #[error("Model provider error: {0}")]
    Provider(String),

    /// The caller cancelled the operation
    #[error("Operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

pub type AgentResult<T> = Result<T, AgentError>;

impl AgentError {
    pub fn structural(msg: impl Into<String>) -> Self {
        Self::Structural(msg.into())
    }

    pub fn provider(msg: impl Into<String>) -> Self {
        Self::Provider(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<reqwest::Error> for AgentError {
    fn from(err: reqwest::Error) -> Self {
        Self::Provider(err.to_string())
    }
}
