//! Process-wide cancellation.
//!
//! The consumer takes a `watch::Receiver<bool>`; `true` means stop. The
//! binary flips it when [`wait_for_signal`] returns.

pub use mentor_rating_service::wait_for_signal;
use tokio::sync::watch;

/// Resolve once `shutdown` carries `true`.
///
/// Never resolves if the sender is dropped without requesting shutdown.
pub async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}
