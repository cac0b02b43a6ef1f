use std::process::Output;

use thiserror::Error;

/// Errors produced by kernel plumbing operations.
///
/// Variants map one-to-one onto the error kinds the control surface reports;
/// classification happens centrally in [`classify_failure`] so every `ip`,
/// `tc`, and `iptables` call surfaces the same taxonomy.
#[derive(Debug, Error)]
pub enum NetError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("insufficient privilege: {0}")]
    Privilege(String),

    #[error("kernel call failed: {0}")]
    Kernel(String),
}

pub type Result<T> = std::result::Result<T, NetError>;

/// Map a failed tool invocation to a `NetError` based on its stderr.
///
/// The iproute2/netfilter tools report well-known phrases for the cases the
/// callers need to distinguish; everything else is a plain kernel failure
/// carrying the full command line and stderr for diagnosis.
pub(crate) fn classify_failure(program: &str, args: &[&str], output: &Output) -> NetError {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stderr = stderr.trim();
    let what = format!("{} {}", program, args.join(" "));

    if stderr.contains("Operation not permitted") || stderr.contains("Permission denied") {
        NetError::Privilege(format!("{what}: {stderr}"))
    } else if stderr.contains("File exists") || stderr.contains("already exists") {
        NetError::AlreadyExists(what)
    } else if stderr.contains("No such file or directory")
        || stderr.contains("Cannot find device")
        || stderr.contains("No such device")
        || stderr.contains("No such process")
    {
        NetError::NotFound(what)
    } else {
        NetError::Kernel(format!("{what}: {stderr}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;
    use std::process::ExitStatus;

    fn fake_output(stderr: &str) -> Output {
        Output {
            status: ExitStatus::from_raw(256),
            stdout: Vec::new(),
            stderr: stderr.as_bytes().to_vec(),
        }
    }

    #[test]
    fn classifies_permission_errors() {
        let out = fake_output("RTNETLINK answers: Operation not permitted");
        assert!(matches!(
            classify_failure("ip", &["netns", "add", "x"], &out),
            NetError::Privilege(_)
        ));
    }

    #[test]
    fn classifies_duplicate_errors() {
        let out = fake_output("RTNETLINK answers: File exists");
        assert!(matches!(
            classify_failure("ip", &["netns", "add", "x"], &out),
            NetError::AlreadyExists(_)
        ));
    }

    #[test]
    fn classifies_missing_device() {
        let out = fake_output("Cannot find device \"eth7\"");
        assert!(matches!(
            classify_failure("ip", &["link", "del", "eth7"], &out),
            NetError::NotFound(_)
        ));
    }

    #[test]
    fn unknown_errors_are_kernel_errors() {
        let out = fake_output("something exploded");
        let err = classify_failure("tc", &["qdisc", "add"], &out);
        match err {
            NetError::Kernel(msg) => {
                assert!(msg.contains("tc qdisc add"));
                assert!(msg.contains("something exploded"));
            }
            other => panic!("expected Kernel, got {other:?}"),
        }
    }
}
