//! Child-process execution for the `ip`/`tc`/`iptables` tool family.
//!
//! Every kernel mutation in this crate goes through these helpers so that
//! tool failures carry the full command line and are classified into the
//! shared error taxonomy. Calls run through `tokio::process` and may block
//! for tens of milliseconds in the kernel; callers are expected to be on a
//! worker task, never on a latency-sensitive loop.

use std::process::Output;

use tokio::process::Command;
use tracing::trace;

use crate::error::{NetError, Result, classify_failure};

/// Run a command, returning its raw output regardless of exit status.
pub async fn run(program: &str, args: &[&str]) -> Result<Output> {
    trace!(%program, args = args.join(" "), "exec");
    Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| NetError::Kernel(format!("spawn {program}: {e}")))
}

/// Run a command, failing with a classified error if it exits non-zero.
pub async fn run_checked(program: &str, args: &[&str]) -> Result<Output> {
    let output = run(program, args).await?;
    if !output.status.success() {
        return Err(classify_failure(program, args, &output));
    }
    Ok(output)
}

/// Run a command and discard the result entirely. For best-effort cleanup
/// paths where a missing resource is the desired end state anyway.
pub async fn run_ignored(program: &str, args: &[&str]) {
    let _ = run(program, args).await;
}

/// Stdout of a checked command as lossily-decoded trimmed lines.
pub async fn run_lines(program: &str, args: &[&str]) -> Result<Vec<String>> {
    let output = run_checked(program, args).await?;
    Ok(String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(|l| l.trim_end().to_string())
        .filter(|l| !l.is_empty())
        .collect())
}
