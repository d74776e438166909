//! Broadcast shutdown signal.
//!
//! The worker binary owns the [`ShutdownTx`]; every worker loop, copy worker and wait helper
//! holds a [`ShutdownRx`] and stops at the next batch boundary once the signal fires.

use tokio::sync::watch;

/// Sending side of the shutdown signal.
#[derive(Debug, Clone)]
pub struct ShutdownTx(watch::Sender<bool>);

impl ShutdownTx {
    /// Signals every receiver to shut down.
    pub fn shutdown(&self) {
        self.0.send_replace(true);
    }

    pub fn subscribe(&self) -> ShutdownRx {
        ShutdownRx(self.0.subscribe())
    }
}

/// Receiving side of the shutdown signal.
#[derive(Debug, Clone)]
pub struct ShutdownRx(watch::Receiver<bool>);

impl ShutdownRx {
    pub fn is_shutdown(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once shutdown was requested, immediately if it already was.
    ///
    /// A dropped sender counts as a shutdown request.
    pub async fn wait(&mut self) {
        let _ = self.0.wait_for(|shutdown| *shutdown).await;
    }
}

/// Creates a shutdown channel.
pub fn create_shutdown_channel() -> (ShutdownTx, ShutdownRx) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTx(tx), ShutdownRx(rx))
}

/// Outcome of an operation that can be interrupted by shutdown.
#[derive(Debug, PartialEq, Eq)]
pub enum ShutdownResult<T> {
    Ok(T),
    Shutdown,
}

/// Sleeps for `duration` unless shutdown is requested first.
pub async fn sleep_or_shutdown(
    duration: std::time::Duration,
    shutdown_rx: &mut ShutdownRx,
) -> ShutdownResult<()> {
    if shutdown_rx.is_shutdown() {
        return ShutdownResult::Shutdown;
    }

    tokio::select! {
        biased;

        _ = shutdown_rx.wait() => ShutdownResult::Shutdown,
        _ = tokio::time::sleep(duration) => ShutdownResult::Ok(()),
    }
}
