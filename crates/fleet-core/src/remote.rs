//! Command execution on cluster nodes.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, trace};

use crate::parallel::UnitError;
use crate::{Error, Result};

/// One node a command is sent to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeTarget {
    pub cluster: String,
    /// 1-based.
    pub node: usize,
    pub host: String,
    pub user: String,
    /// Working directory for local nodes; `None` for remote ones.
    pub local_dir: Option<PathBuf>,
}

impl NodeTarget {
    pub fn is_local(&self) -> bool {
        self.local_dir.is_some()
    }
}

/// Transport for per-node commands.
#[async_trait]
pub trait NodeRunner: Send + Sync {
    /// Run a bash script on the node, returning its combined output.
    async fn run(&self, target: &NodeTarget, script: &str) -> std::result::Result<Vec<u8>, UnitError>;

    /// Forget any recorded host key for `host`.
    async fn clear_host_key(&self, host: &str) -> Result<()>;
}

/// Runs scripts through `ssh` for remote nodes and `bash` for local ones.
#[derive(Debug, Clone)]
pub struct SshRunner {
    connect_timeout: Duration,
    extra_ssh_options: Vec<String>,
}

impl Default for SshRunner {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            extra_ssh_options: Vec::new(),
        }
    }
}

impl SshRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Additional `-o` options passed verbatim to `ssh`.
    pub fn with_ssh_options(mut self, options: impl IntoIterator<Item = String>) -> Self {
        self.extra_ssh_options.extend(options);
        self
    }

    fn command(&self, target: &NodeTarget, script: &str) -> Command {
        match &target.local_dir {
            Some(dir) => {
                let mut cmd = Command::new("bash");
                cmd.arg("-c").arg(script).current_dir(dir);
                cmd
            }
            None => {
                let timeout = format!("ConnectTimeout={}", self.connect_timeout.as_secs());
                let mut cmd = Command::new("ssh");
                cmd.args([
                    "-o",
                    "StrictHostKeyChecking=no",
                    "-o",
                    "BatchMode=yes",
                    "-o",
                    timeout.as_str(),
                ]);
                for opt in &self.extra_ssh_options {
                    cmd.arg("-o").arg(opt);
                }
                cmd.arg(format!("{}@{}", target.user, target.host))
                    .arg(format!("bash -c {}", shell_quote(script)));
                cmd
            }
        }
    }
}

#[async_trait]
impl NodeRunner for SshRunner {
    async fn run(&self, target: &NodeTarget, script: &str) -> std::result::Result<Vec<u8>, UnitError> {
        debug!(cluster = %target.cluster, node = target.node, "running on node");
        trace!(script, "node script");
        if let Some(dir) = &target.local_dir {
            tokio::fs::create_dir_all(dir).await.map_err(Error::from)?;
        }

        let output = self
            .command(target, script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(Error::from)?;

        let mut combined = output.stdout;
        combined.extend_from_slice(&output.stderr);
        if output.status.success() {
            Ok(combined)
        } else {
            Err(UnitError {
                error: Error::Command {
                    program: if target.is_local() { "bash".into() } else { "ssh".into() },
                    status: output.status.to_string(),
                    stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                },
                output: combined,
            })
        }
    }

    async fn clear_host_key(&self, host: &str) -> Result<()> {
        crate::command::run("ssh-keygen", &["-R", host]).await.map(drop)
    }
}

/// Single-quote `s` for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
