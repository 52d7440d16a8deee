use snafu::{ResultExt, Snafu};
use tokio::{
    signal::unix::{SignalKind, signal},
    sync::watch,
};

#[derive(Debug, Snafu)]
#[snafu(display("failed to construct signal watcher"))]
pub struct SignalError {
    source: std::io::Error,
}

/// Watches for process termination and multiplies the signal by sending it
/// to all acquired handles.
///
/// Every controller, watch task and background sweeper holds its own
/// handle; once the signal fires they finish their in-flight I/O and
/// return.
#[derive(Clone)]
pub struct ShutdownWatcher {
    watch_rx: watch::Receiver<()>,
}

impl ShutdownWatcher {
    /// Watches `SIGTERM` and `SIGINT`.
    pub fn terminate() -> Result<Self, SignalError> {
        let mut sigterm = signal(SignalKind::terminate()).context(SignalSnafu)?;
        let mut sigint = signal(SignalKind::interrupt()).context(SignalSnafu)?;
        let (watch_tx, watch_rx) = watch::channel(());

        tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => {}
                _ = sigint.recv() => {}
            }
            watch_tx.send(())
        });

        Ok(Self { watch_rx })
    }

    /// A watcher that only fires when the returned trigger is invoked.
    /// Used by tests and embedded setups.
    pub fn manual() -> (ShutdownTrigger, Self) {
        let (watch_tx, watch_rx) = watch::channel(());
        (ShutdownTrigger { watch_tx }, Self { watch_rx })
    }

    /// Acquire a new handle which completes once shutdown is requested.
    ///
    /// This handle can be cheaply re-acquired to gracefully shut down
    /// multiple concurrent tasks.
    pub fn handle(&self) -> impl Future<Output = ()> + Send + use<> {
        let mut watch_rx = self.watch_rx.clone();

        async move {
            watch_rx.changed().await.ok();
        }
    }
}

/// Fires the paired [`ShutdownWatcher::manual`] watcher.
pub struct ShutdownTrigger {
    watch_tx: watch::Sender<()>,
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.watch_tx.send(()).ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn manual_trigger_completes_all_handles() {
        let (trigger, watcher) = ShutdownWatcher::manual();
        let first = watcher.handle();
        let second = watcher.handle();

        trigger.trigger();

        first.await;
        second.await;
    }
}
