// Stop Signal - shared by the watcher loop and every job run

use tokio::sync::watch;

/// Receiving side of a stop request
#[derive(Clone)]
pub struct StopToken {
    rx: watch::Receiver<bool>,
}

impl StopToken {
    /// Check if stop was requested
    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until stop is requested. Returns immediately if it already was,
    /// or if the sender is gone.
    pub async fn stopped(&mut self) {
        let _ = self.rx.wait_for(|stopped| *stopped).await;
    }
}

/// Sending side of a stop request
pub struct StopSender {
    tx: watch::Sender<bool>,
}

impl StopSender {
    /// Request stop; every token observes it, including clones made later
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Create a stop channel
pub fn stop_channel() -> (StopSender, StopToken) {
    let (tx, rx) = watch::channel(false);
    (StopSender { tx }, StopToken { rx })
}
