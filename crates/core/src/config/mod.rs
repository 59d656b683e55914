mod loader;
mod types;
mod validate;

pub use loader::*;
pub use types::*;
pub use validate::*;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Missing `[build]` or `[import]` table for the requested command.
    #[error("Configuration section [{0}] is missing")]
    MissingSection(&'static str),

    /// Every independent problem found, reported together.
    #[error("Configuration validation failed: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

impl ConfigError {
    /// Individual validation messages (empty for non-validation errors).
    pub fn problems(&self) -> &[String] {
        match self {
            ConfigError::Invalid(problems) => problems,
            _ => &[],
        }
    }
}
