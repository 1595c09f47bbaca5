//! Invocation of the cloud vendors' command-line tools.

use std::env;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::process::Command;
use tracing::{debug, trace};

use crate::{Error, Result};

/// Upper bound on a single vendor CLI call.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Whether `program` resolves to an executable on `$PATH`.
pub fn on_path(program: &str) -> bool {
    let Some(paths) = env::var_os("PATH") else {
        return false;
    };
    env::split_paths(&paths).any(|dir| is_executable(&dir.join(program)))
}

fn is_executable(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        path.metadata()
            .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        path.is_file()
    }
}

/// Run `program args...` and return its stdout, failing on non-zero exit.
///
/// The child is killed if the returned future is dropped.
pub async fn run<S: AsRef<str>>(program: &str, args: &[S]) -> Result<String> {
    run_with_stdin(program, args, None).await
}

/// Like [`run`], feeding `stdin` to the child.
pub async fn run_with_stdin<S: AsRef<str>>(
    program: &str,
    args: &[S],
    stdin: Option<&[u8]>,
) -> Result<String> {
    let args: Vec<&str> = args.iter().map(AsRef::as_ref).collect();
    debug!(program, ?args, "running");

    let mut cmd = Command::new(program);
    cmd.args(&args)
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn()?;
    if let Some(input) = stdin
        && let Some(mut pipe) = child.stdin.take()
    {
        use tokio::io::AsyncWriteExt;
        pipe.write_all(input).await?;
    }

    let output = tokio::time::timeout(DEFAULT_TIMEOUT, child.wait_with_output())
        .await
        .map_err(|_| Error::Command {
            program: program.to_string(),
            status: "timed out".into(),
            stderr: format!("no result after {}s", DEFAULT_TIMEOUT.as_secs()),
        })??;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    if !output.status.success() {
        return Err(Error::Command {
            program: format!("{program} {}", args.join(" ")),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    trace!(program, bytes = stdout.len(), "command finished");
    Ok(stdout)
}

/// Run a command that prints JSON and decode it.
pub async fn json<T: DeserializeOwned, S: AsRef<str>>(program: &str, args: &[S]) -> Result<T> {
    let stdout = run(program, args).await?;
    // Some tools print nothing instead of `[]` for empty results.
    if stdout.trim().is_empty() {
        return Ok(serde_json::from_str("null").or_else(|_| serde_json::from_str("[]"))?);
    }
    Ok(serde_json::from_str(&stdout)?)
}
