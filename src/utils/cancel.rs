use tokio::sync::watch;

use crate::errors::{Result, UpdateError};

/// Owner side of a cancellation signal. Dropping it without calling
/// [`CancelHandle::cancel`] leaves every token un-cancelled.
#[derive(Debug)]
pub struct CancelHandle {
    control: watch::Sender<bool>,
}

#[derive(Clone, Debug)]
pub struct CancelToken {
    control: Option<watch::Receiver<bool>>,
}

pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (
        CancelHandle { control: tx },
        CancelToken { control: Some(rx) },
    )
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.control.send_replace(true);
    }

    pub fn token(&self) -> CancelToken {
        CancelToken {
            control: Some(self.control.subscribe()),
        }
    }
}

impl CancelToken {
    /// A token that never fires.
    pub fn none() -> Self {
        Self { control: None }
    }

    pub fn is_cancelled(&self) -> bool {
        self.control
            .as_ref()
            .map(|rx| *rx.borrow())
            .unwrap_or(false)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(UpdateError::Cancelled);
        }
        Ok(())
    }

    /// Resolves once cancellation is requested; pends forever otherwise.
    pub async fn cancelled(&self) {
        if let Some(rx) = self.control.as_ref() {
            let mut rx = rx.clone();
            if rx.wait_for(|cancelled| *cancelled).await.is_ok() {
                return;
            }
        }
        std::future::pending::<()>().await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn cancel_reaches_every_clone() {
        let (handle, token) = cancel_pair();
        let clone = token.clone();
        assert!(!token.is_cancelled());

        let waiter = tokio::spawn(async move { clone.cancelled().await });
        handle.cancel();

        tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("cancel should wake waiter")
            .expect("join waiter");
        assert!(token.is_cancelled());
        assert!(token.check().expect_err("cancelled").is_cancelled());
    }

    #[tokio::test]
    async fn dropped_handle_never_cancels() {
        let (handle, token) = cancel_pair();
        drop(handle);
        let fired = tokio::time::timeout(Duration::from_millis(50), token.cancelled()).await;
        assert!(fired.is_err());
        assert!(!CancelToken::none().is_cancelled());
    }
}
