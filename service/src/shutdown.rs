//! Termination signals shared by the service and consumer binaries.

/// Wait for SIGTERM or Ctrl+C.
///
/// If no handler can be installed the failure is logged and this never
/// resolves, leaving the process to be stopped by the supervisor.
pub async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to register SIGTERM handler");
                wait_for_ctrl_c().await;
                return;
            },
        };

        tokio::select! {
            () = wait_for_ctrl_c() => {},
            _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    wait_for_ctrl_c().await;
}

async fn wait_for_ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    tracing::info!("Received Ctrl+C");
}

#[cfg(all(test, unix))]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::signal::unix::{SignalKind, signal};

    #[tokio::test]
    async fn sigterm_resolves_the_wait() {
        // Installed first so the signal can never fall through to the default action.
        let _guard = signal(SignalKind::terminate()).unwrap();
        let waiting = tokio::spawn(wait_for_signal());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiting.is_finished());

        let status = std::process::Command::new("kill")
            .args(["-TERM", &std::process::id().to_string()])
            .status()
            .unwrap();
        assert!(status.success());

        let done = tokio::time::timeout(Duration::from_secs(5), waiting).await;
        assert!(matches!(done, Ok(Ok(()))));
    }
}
