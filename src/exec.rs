//! One-shot command execution inside a device's namespace.
//!
//! Distinct from terminal sessions: the child is spawned directly from the
//! request's argv — no shell, no parsing — with stdout, stderr, and the
//! exit code captured and returned.

use std::time::Duration;

use serde::Serialize;
use tokio::time::timeout;

use crate::error::{EmuError, ErrorKind, Result};

pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize)]
pub struct ExecOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

/// Run `argv` inside `namespace`, capturing output.
pub async fn run_in_namespace(
    namespace: &str,
    argv: &[String],
    deadline: Duration,
) -> Result<ExecOutcome> {
    let Some((program, args)) = argv.split_first() else {
        return Err(EmuError::invalid("argv must not be empty"));
    };

    let mut cmd = tokio::process::Command::new("ip");
    cmd.args(["netns", "exec", namespace, program.as_str()])
        .args(args)
        .kill_on_drop(true);

    let output = timeout(deadline, cmd.output())
        .await
        .map_err(|_| {
            EmuError::timeout(format!(
                "command did not finish within {deadline:?}: {}",
                argv.join(" ")
            ))
        })?
        .map_err(|e| EmuError::new(ErrorKind::KernelError, format!("spawn {program}: {e}")))?;

    Ok(ExecOutcome {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        exit_code: output.status.code(),
    })
}
