//! Cancellation - watch channel ベースのキャンセル通知
//!
//! `CancelHandle` を持つ側が `cancel()` すると、全ての `CancelSignal` が
//! 発火する。Handle が cancel せずに drop された場合は発火しない。

use tokio::sync::watch;

use crate::domain::ReproError;

#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    pub fn cancel(&self) {
        // send_replace は receiver がいなくても値を更新する
        self.tx.send_replace(true);
    }

    pub fn signal(&self) -> CancelSignal {
        CancelSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// `Err(Cancelled)` once cancellation was requested.
    pub fn check(&self) -> Result<(), ReproError> {
        if self.is_cancelled() {
            Err(ReproError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves when cancellation is requested; pends forever otherwise.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn cancel_reaches_every_signal() {
        let handle = CancelHandle::new();
        let a = handle.signal();
        let b = a.clone();
        assert!(!a.is_cancelled());
        assert!(a.check().is_ok());

        handle.cancel();
        assert!(a.is_cancelled());
        assert!(matches!(b.check(), Err(ReproError::Cancelled)));
        tokio::time::timeout(Duration::from_secs(1), b.cancelled())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn signal_taken_after_cancel_is_already_fired() {
        let handle = CancelHandle::new();
        handle.cancel();
        assert!(handle.signal().is_cancelled());
    }

    #[tokio::test]
    async fn never_and_dropped_handles_do_not_fire() {
        let never = CancelSignal::never();
        let waited = tokio::time::timeout(Duration::from_millis(20), never.cancelled()).await;
        assert!(waited.is_err());

        let handle = CancelHandle::new();
        let signal = handle.signal();
        drop(handle);
        assert!(!signal.is_cancelled());
        let waited = tokio::time::timeout(Duration::from_millis(20), signal.cancelled()).await;
        assert!(waited.is_err());
    }
}
