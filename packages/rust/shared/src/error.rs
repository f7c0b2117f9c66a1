//! Error types for Folio.
//!
//! Library crates use [`FolioError`] via `thiserror`; each build stage also
//! has its own typed error so the supervisor can classify failures.
//! The CLI wraps these with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for configuration, input, and filesystem operations.
#[derive(Debug, thiserror::Error)]
pub enum FolioError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Content model could not be read or is malformed.
    #[error("content error: {message}")]
    Content { message: String },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (unknown preset, invalid geometry, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// An external tool could not be run.
    #[error("tool error: {0}")]
    Tool(#[from] ToolError),
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, FolioError>;

impl FolioError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a content error from any displayable message.
    pub fn content(msg: impl Into<String>) -> Self {
        Self::Content {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Failure of an external command-line tool (normalizer, checker, rasterizer).
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    /// The program could not be started at all.
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    /// The program did not finish within its time box and was killed.
    #[error("`{program}` timed out after {timeout_ms} ms")]
    Timeout { program: String, timeout_ms: u64 },

    /// The program ran but reported failure.
    #[error("`{program}` exited with status {status}: {stderr}")]
    Failed {
        program: String,
        status: i32,
        stderr: String,
    },

    /// The program succeeded but its output was unusable.
    #[error("`{program}` produced unusable output: {message}")]
    Output { program: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = FolioError::config("unknown preset 'pocket'");
        assert_eq!(err.to_string(), "config error: unknown preset 'pocket'");

        let err = FolioError::content("chapters must not be empty");
        assert!(err.to_string().contains("chapters must not be empty"));
    }

    #[test]
    fn tool_error_converts_into_folio_error() {
        let err: FolioError = ToolError::Timeout {
            program: "gs".into(),
            timeout_ms: 1500,
        }
        .into();
        assert_eq!(err.to_string(), "tool error: `gs` timed out after 1500 ms");
    }
}
