use std::ffi::OsString;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use folio_shared::{ToolCommand, ToolError, run_tool};

/// Verdict of an external structural check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityVerdict {
    Clean,
    /// Readable, with recoverable problems worth logging.
    Warnings(String),
    Broken(String),
}

#[async_trait]
pub trait IntegrityChecker: Send + Sync {
    fn name(&self) -> &str;

    async fn check(&self, pdf: &Path) -> Result<IntegrityVerdict, ToolError>;
}

/// `qpdf --check`: exit 0 is clean, 3 is warnings, anything else is broken.
#[derive(Debug, Clone)]
pub struct QpdfChecker {
    command: ToolCommand,
    timeout: Duration,
}

impl QpdfChecker {
    pub fn new(command: ToolCommand, timeout: Duration) -> Self {
        Self { command, timeout }
    }
}

#[async_trait]
impl IntegrityChecker for QpdfChecker {
    fn name(&self) -> &str {
        &self.command.program
    }

    async fn check(&self, pdf: &Path) -> Result<IntegrityVerdict, ToolError> {
        let args = [OsString::from("--check"), pdf.as_os_str().to_owned()];
        let output = run_tool(&self.command, &args, self.timeout).await?;
        let diagnostics = if output.stderr.is_empty() {
            String::from_utf8_lossy(&output.stdout).trim().to_string()
        } else {
            output.stderr
        };

        Ok(match output.status {
            0 => IntegrityVerdict::Clean,
            3 => IntegrityVerdict::Warnings(diagnostics),
            status => IntegrityVerdict::Broken(format!("exit status {status}: {diagnostics}")),
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> QpdfChecker {
        QpdfChecker::new(
            ToolCommand {
                program: "sh".into(),
                args: vec!["-c".into(), script.into(), "qpdf".into()],
            },
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn maps_exit_statuses_to_verdicts() {
        let pdf = Path::new("book.pdf");
        assert_eq!(sh("exit 0").check(pdf).await.unwrap(), IntegrityVerdict::Clean);
        assert_eq!(
            sh("echo 'xref stream repaired'; exit 3").check(pdf).await.unwrap(),
            IntegrityVerdict::Warnings("xref stream repaired".into())
        );
        match sh("echo 'damaged' >&2; exit 2").check(pdf).await.unwrap() {
            IntegrityVerdict::Broken(msg) => assert!(msg.contains("damaged")),
            other => panic!("expected Broken, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn passes_check_flag_and_path() {
        let checker = sh(r#"[ "$1" = "--check" ] && [ "$2" = "book.pdf" ]"#);
        assert_eq!(
            checker.check(Path::new("book.pdf")).await.unwrap(),
            IntegrityVerdict::Clean
        );
    }
}
