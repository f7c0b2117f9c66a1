use std::path::PathBuf;

/// Failures talking to a rendering engine. All of them are transient from
/// the build's point of view: a fresh engine on the next attempt may succeed.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("failed to launch rendering engine `{program}`: {message}")]
    Launch { program: String, message: String },

    #[error("engine protocol error: {0}")]
    Protocol(String),

    #[error("engine {operation} timed out after {timeout_ms}ms")]
    Timeout {
        operation: &'static str,
        timeout_ms: u64,
    },

    #[error("engine exited unexpectedly during {operation}")]
    Crashed { operation: &'static str },

    #[error("engine reported an error during {operation}: {message}")]
    Remote {
        operation: &'static str,
        message: String,
    },

    #[error("engine cannot read {}: {message}", path.display())]
    Input { path: PathBuf, message: String },
}

impl EngineError {
    pub fn timeout(operation: &'static str, timeout: std::time::Duration) -> Self {
        Self::Timeout {
            operation,
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn timeout_message_names_operation() {
        let err = EngineError::timeout("export", Duration::from_millis(1500));
        assert!(err.is_timeout());
        assert_eq!(err.to_string(), "engine export timed out after 1500ms");
    }
}
