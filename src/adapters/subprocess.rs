//! Subprocess expert dispatch.
//!
//! Each specialist runs as a separate program, usually an interpreter from
//! its own isolated environment plus a wrapper script. The request JSON is
//! written to stdin and the last non-empty stdout line is parsed as the
//! response.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, error, info};

use super::{Expert, ExpertError, ExpertRequest, ExpertResponse};

/// Expert backed by a child process
#[derive(Debug, Clone)]
pub struct SubprocessExpert {
    name: String,

    /// Program to run (e.g. an environment's python binary)
    program: PathBuf,

    /// Arguments, typically the wrapper script; the request travels on stdin
    args: Vec<String>,

    working_dir: Option<PathBuf>,

    /// Extra environment variables
    env: HashMap<String, String>,

    call_timeout: Duration,
}

impl SubprocessExpert {
    pub fn new(name: impl Into<String>, program: impl Into<PathBuf>, call_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: HashMap::new(),
            call_timeout,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(&self.env)
            .env("PYTHONUNBUFFERED", "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Dropping the wait future on timeout kills the child
            .kill_on_drop(true);

        // Put the interpreter's own bin directory first on PATH
        if let Some(bin_dir) = self.program.parent().filter(|p| !p.as_os_str().is_empty()) {
            let path = std::env::var("PATH").unwrap_or_default();
            command.env("PATH", format!("{}:{}", bin_dir.display(), path));
        }

        if let Some(ref dir) = self.working_dir {
            command.current_dir(dir);
        }

        command
    }

    /// Parse the final stdout line as the response
    fn parse_output(&self, stdout: &str) -> Result<ExpertResponse, ExpertError> {
        let last_line = stdout
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .ok_or_else(|| ExpertError::MalformedOutput {
                expert: self.name.clone(),
                detail: "no output".to_string(),
            })?;

        serde_json::from_str(last_line).map_err(|e| ExpertError::MalformedOutput {
            expert: self.name.clone(),
            detail: format!("{}: {}", e, truncate(last_line, 200)),
        })
    }
}

#[async_trait]
impl Expert for SubprocessExpert {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, request: ExpertRequest) -> Result<ExpertResponse, ExpertError> {
        info!(expert = %self.name, program = %self.program.display(), "Dispatching task");

        let mut child = self.command().spawn().map_err(|source| ExpertError::Spawn {
            expert: self.name.clone(),
            source,
        })?;

        // The stdin write counts against the call timeout
        let payload = request.to_json();
        let stdin = child.stdin.take();
        let exchange = async {
            if let Some(mut stdin) = stdin {
                // A worker that never reads stdin is not an error by itself
                if let Err(e) = stdin.write_all(payload.as_bytes()).await {
                    debug!(expert = %self.name, error = %e, "Worker closed stdin early");
                }
                // Dropped here to signal EOF
            }
            child.wait_with_output().await
        };

        let output = match timeout(self.call_timeout, exchange).await {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => {
                return Err(ExpertError::Spawn {
                    expert: self.name.clone(),
                    source,
                })
            }
            Err(_) => {
                error!(expert = %self.name, timeout = ?self.call_timeout, "Expert timed out");
                return Err(ExpertError::Timeout {
                    expert: self.name.clone(),
                    timeout: self.call_timeout,
                });
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let code = output.status.code().unwrap_or(-1);
            error!(expert = %self.name, code, "Expert exited with failure");
            return Err(ExpertError::NonZeroExit {
                expert: self.name.clone(),
                code,
                stderr: truncate(stderr.trim(), 2000).to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let response = self.parse_output(&stdout)?;
        debug!(expert = %self.name, status = ?response.status, "Expert finished");
        Ok(response)
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
