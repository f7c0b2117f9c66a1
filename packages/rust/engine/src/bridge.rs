//! Subprocess-backed rendering engine.
//!
//! Spawns a bridge program that hosts a headless browser and speaks
//! JSON-lines on stdin/stdout. The bridge answers with a `ready` message once
//! it can accept work; each request carries an id that the response echoes.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, instrument, warn};

use folio_shared::{EngineConfig, ToolCommand};

use crate::engine::{
    AssetState, EngineLauncher, ExportReceipt, ExportRequest, PageGeometry, RenderEngine,
};
use crate::error::EngineError;

/// How long a graceful shutdown may take before the process is killed.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Protocol types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RequestMessage<'a> {
    Load {
        id: String,
        path: &'a Path,
    },
    AwaitAssets {
        id: String,
    },
    Measure {
        id: String,
    },
    Export {
        id: String,
        #[serde(flatten)]
        request: &'a ExportRequest,
    },
    Shutdown,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseMessage {
    Ready {
        #[serde(default)]
        engine: Option<String>,
    },
    Loaded {
        id: String,
    },
    Assets {
        id: String,
        #[serde(flatten)]
        state: AssetState,
    },
    Geometry {
        id: String,
        pages: Vec<PageGeometry>,
    },
    Exported {
        id: String,
        #[serde(flatten)]
        receipt: ExportReceipt,
    },
    Error {
        #[serde(default)]
        id: Option<String>,
        error: String,
    },
}

impl ResponseMessage {
    fn id(&self) -> Option<&str> {
        match self {
            Self::Ready { .. } => None,
            Self::Loaded { id }
            | Self::Assets { id, .. }
            | Self::Geometry { id, .. }
            | Self::Exported { id, .. } => Some(id),
            Self::Error { id, .. } => id.as_deref(),
        }
    }
}

// ---------------------------------------------------------------------------
// Launcher
// ---------------------------------------------------------------------------

/// Launches [`BridgeEngine`] processes from `[engine]` configuration.
#[derive(Debug, Clone)]
pub struct BridgeLauncher {
    pub command: ToolCommand,
    pub ready_timeout: Duration,
}

impl From<&EngineConfig> for BridgeLauncher {
    fn from(config: &EngineConfig) -> Self {
        Self {
            command: ToolCommand {
                program: config.command.clone(),
                args: config.args.clone(),
            },
            ready_timeout: Duration::from_millis(config.ready_timeout_ms),
        }
    }
}

#[async_trait]
impl EngineLauncher for BridgeLauncher {
    async fn launch(&self) -> Result<Box<dyn RenderEngine>, EngineError> {
        let engine = BridgeEngine::spawn(&self.command, self.ready_timeout).await?;
        Ok(Box::new(engine))
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct BridgeEngine {
    name: String,
    child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    request_counter: u64,
    /// Set once a request timed out or the stream broke; the response
    /// stream can no longer be trusted.
    poisoned: bool,
}

impl BridgeEngine {
    /// Spawn the bridge and wait for its ready handshake.
    #[instrument(skip_all, fields(program = %command.program))]
    pub async fn spawn(command: &ToolCommand, ready_timeout: Duration) -> Result<Self, EngineError> {
        info!(args = ?command.args, "spawning render bridge");

        let launch_error = |message: String| EngineError::Launch {
            program: command.program.clone(),
            message,
        };

        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit()) // bridge logs go to parent stderr
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| launch_error(format!("{e}. Is `{}` installed?", command.program)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| launch_error("failed to capture bridge stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| launch_error("failed to capture bridge stdout".into()))?;

        let mut engine = Self {
            name: command.program.clone(),
            child,
            stdin,
            reader: BufReader::new(stdout),
            request_counter: 0,
            poisoned: false,
        };

        let ready = tokio::time::timeout(ready_timeout, engine.read_message("ready"))
            .await
            .map_err(|_| EngineError::timeout("ready", ready_timeout))??;

        match ready {
            ResponseMessage::Ready { engine: name } => {
                if let Some(name) = name {
                    engine.name = name;
                }
                info!(engine = %engine.name, "render bridge is ready");
                Ok(engine)
            }
            other => Err(EngineError::Protocol(format!(
                "expected ready message, got {other:?}"
            ))),
        }
    }

    fn next_id(&mut self) -> String {
        self.request_counter += 1;
        format!("req-{}", self.request_counter)
    }

    async fn write_message(
        &mut self,
        message: &RequestMessage<'_>,
        operation: &'static str,
    ) -> Result<(), EngineError> {
        let json = serde_json::to_string(message)
            .map_err(|e| EngineError::Protocol(format!("failed to serialize request: {e}")))?;
        let write = async {
            self.stdin.write_all(json.as_bytes()).await?;
            self.stdin.write_all(b"\n").await?;
            self.stdin.flush().await
        };
        write.await.map_err(|e| {
            debug!(error = %e, "bridge stdin write failed");
            EngineError::Crashed { operation }
        })
    }

    async fn read_message(&mut self, operation: &'static str) -> Result<ResponseMessage, EngineError> {
        let mut line = String::new();
        let read = self
            .reader
            .read_line(&mut line)
            .await
            .map_err(|_| EngineError::Crashed { operation })?;
        if read == 0 {
            return Err(EngineError::Crashed { operation });
        }
        serde_json::from_str(line.trim()).map_err(|e| {
            EngineError::Protocol(format!(
                "invalid bridge response: {e} (got: {})",
                line.chars().take(200).collect::<String>()
            ))
        })
    }

    /// Send one request and wait for the response carrying its id.
    async fn call(
        &mut self,
        operation: &'static str,
        id: &str,
        request: &RequestMessage<'_>,
        timeout: Duration,
    ) -> Result<ResponseMessage, EngineError> {
        if self.poisoned {
            return Err(EngineError::Protocol(
                "engine is unusable after an earlier failure".into(),
            ));
        }
        debug!(%id, operation, "bridge request");

        let exchange = async {
            self.write_message(request, operation).await?;
            loop {
                let message = self.read_message(operation).await?;
                match message.id() {
                    Some(got) if got == id => return Ok::<_, EngineError>(message),
                    _ => debug!(expected = %id, ?message, "skipping unrelated bridge message"),
                }
            }
        };

        let result = match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::timeout(operation, timeout)),
        };

        match result {
            Ok(ResponseMessage::Error { error, .. }) => Err(EngineError::Remote {
                operation,
                message: error,
            }),
            Ok(message) => Ok(message),
            Err(e) => {
                self.poisoned = true;
                Err(e)
            }
        }
    }
}

fn unexpected(operation: &'static str, message: ResponseMessage) -> EngineError {
    EngineError::Protocol(format!("unexpected response to {operation}: {message:?}"))
}

#[async_trait]
impl RenderEngine for BridgeEngine {
    fn name(&self) -> &str {
        &self.name
    }

    async fn load(&mut self, markup: &Path, timeout: Duration) -> Result<(), EngineError> {
        let id = self.next_id();
        let request = RequestMessage::Load {
            id: id.clone(),
            path: markup,
        };
        match self.call("load", &id, &request, timeout).await? {
            ResponseMessage::Loaded { .. } => Ok(()),
            other => Err(unexpected("load", other)),
        }
    }

    async fn await_assets(&mut self, timeout: Duration) -> Result<AssetState, EngineError> {
        let id = self.next_id();
        let request = RequestMessage::AwaitAssets { id: id.clone() };
        match self.call("await_assets", &id, &request, timeout).await? {
            ResponseMessage::Assets { state, .. } => Ok(state),
            other => Err(unexpected("await_assets", other)),
        }
    }

    async fn measure(&mut self, timeout: Duration) -> Result<Vec<PageGeometry>, EngineError> {
        let id = self.next_id();
        let request = RequestMessage::Measure { id: id.clone() };
        match self.call("measure", &id, &request, timeout).await? {
            ResponseMessage::Geometry { pages, .. } => Ok(pages),
            other => Err(unexpected("measure", other)),
        }
    }

    async fn export(
        &mut self,
        request: &ExportRequest,
        timeout: Duration,
    ) -> Result<ExportReceipt, EngineError> {
        let id = self.next_id();
        let message = RequestMessage::Export {
            id: id.clone(),
            request,
        };
        match self.call("export", &id, &message, timeout).await? {
            ResponseMessage::Exported { receipt, .. } => Ok(receipt),
            other => Err(unexpected("export", other)),
        }
    }

    async fn shutdown(&mut self) -> Result<(), EngineError> {
        if !self.poisoned {
            // Best effort: the bridge may already be gone.
            let _ = self.write_message(&RequestMessage::Shutdown, "shutdown").await;
        }

        match tokio::time::timeout(SHUTDOWN_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => {
                info!(?status, "render bridge exited");
                Ok(())
            }
            Ok(Err(e)) => {
                warn!("render bridge wait error: {e}");
                Ok(())
            }
            Err(_) => {
                warn!("render bridge ignored shutdown; killing");
                self.child
                    .kill()
                    .await
                    .map_err(|_| EngineError::Crashed { operation: "shutdown" })
            }
        }
    }
}
