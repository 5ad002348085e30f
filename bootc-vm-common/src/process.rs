//! Graceful-then-forceful child process termination.

use std::io;
use tokio::process::Child;
use tokio::time::Duration;
use tracing::{debug, warn};

/// Send SIGTERM, wait up to `grace` for the child to exit, then escalate to
/// SIGKILL and wait for that too. No-op (returns `Ok`) if the child has
/// already exited — termination here must always be idempotent, since both
/// the proxy controller and the hypervisor drivers call it from a `Stop`
/// that may be invoked more than once.
pub async fn terminate_child(
    child: &mut Child,
    name: &str,
    grace: Duration,
) -> io::Result<()> {
    let Some(pid) = child.id() else {
        // Already reaped.
        return Ok(());
    };

    if unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) } < 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            // Exited between the id() check and the signal.
            let _ = child.wait().await;
            return Ok(());
        }
        return Err(err);
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            debug!(%name, %status, "process exited after SIGTERM");
            Ok(())
        }
        Ok(Err(e)) => Err(e),
        Err(_) => {
            warn!(%name, grace_ms = grace.as_millis(), "grace period elapsed, sending SIGKILL");
            child.start_kill()?;
            child.wait().await?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::process::Command;

    #[tokio::test]
    async fn terminates_a_sleeping_child_within_grace_period() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        terminate_child(&mut child, "sleep", Duration::from_millis(500))
            .await
            .unwrap();
        assert!(child.try_wait().unwrap().is_some());
    }

    #[tokio::test]
    async fn escalates_to_sigkill_when_grace_period_elapses() {
        // A child that ignores SIGTERM via a trap, to force the SIGKILL path.
        let mut child = Command::new("sh")
            .args(["-c", "trap '' TERM; sleep 30"])
            .spawn()
            .unwrap();
        terminate_child(&mut child, "stubborn", Duration::from_millis(200))
            .await
            .unwrap();
        assert!(child.try_wait().unwrap().is_some());
    }

    #[tokio::test]
    async fn already_exited_child_is_a_no_op() {
        let mut child = Command::new("true").spawn().unwrap();
        let _ = child.wait().await.unwrap();
        terminate_child(&mut child, "true", Duration::from_millis(100))
            .await
            .unwrap();
    }
}
