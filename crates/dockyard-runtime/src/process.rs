//! Graceful-then-forceful subprocess termination.
//!
//! The same escalation is used for execution timeouts and for shutting
//! down the event monitor: request a graceful stop, wait out a bounded
//! grace period, then kill.

use std::process::ExitStatus;
use std::time::Duration;
use tokio::process::Child;
use tracing::{debug, warn};

/// Ask the child to terminate, escalating to a kill after `grace`.
///
/// Returns the exit status when the child could be reaped.
pub async fn terminate_with_grace(
    child: &mut Child,
    grace: Duration,
) -> std::io::Result<Option<ExitStatus>> {
    request_termination(child);

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => {
            debug!("Child exited within grace period");
            status.map(Some)
        }
        Err(_) => {
            warn!(grace_ms = grace.as_millis() as u64, "Grace period elapsed, killing child");
            child.kill().await?;
            child.wait().await.map(Some)
        }
    }
}

/// Deliver the graceful termination signal.
///
/// SIGTERM on unix; elsewhere the best available option is an immediate
/// kill request.
fn request_termination(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // SAFETY: plain signal delivery to a child we own.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::process::Stdio;
    use tokio::process::Command;

    #[tokio::test]
    async fn test_graceful_exit_within_grace() {
        // `sleep` dies promptly on SIGTERM.
        let mut child = Command::new("sleep")
            .arg("30")
            .stdout(Stdio::null())
            .spawn()
            .unwrap();

        let status = terminate_with_grace(&mut child, Duration::from_secs(2))
            .await
            .unwrap();
        assert!(status.is_some());
        assert!(!status.unwrap().success());
    }

    #[tokio::test]
    async fn test_escalates_to_kill() {
        // Ignore SIGTERM so only the kill escalation can reap it.
        let mut child = Command::new("sh")
            .arg("-c")
            .arg("trap '' TERM; sleep 30")
            .stdout(Stdio::null())
            .spawn()
            .unwrap();

        // Give the shell a moment to install the trap.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let status = terminate_with_grace(&mut child, Duration::from_millis(300))
            .await
            .unwrap();
        assert!(status.is_some());
        assert!(!status.unwrap().success());
    }
}
