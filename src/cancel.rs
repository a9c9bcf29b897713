//! Cooperative cancellation for consumers, migrations, and read models.
//!
//! Cancellation is a watch channel: a [`Canceller`] owns the sending
//! side, and every suspending call receives a cloned [`CancelToken`].
//! Dropping the canceller counts as cancellation, so a scope that ends
//! without an explicit `cancel()` still releases everything it started.

use tokio::sync::watch;

/// The owning side of a cancellation scope.
///
/// Cancels on [`cancel`](Canceller::cancel) or on drop.
#[derive(Debug)]
pub struct Canceller {
    tx: watch::Sender<bool>,
}

impl Canceller {
    /// Create a fresh, uncancelled scope.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// A token observing this scope.
    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: Some(self.tx.subscribe()),
        }
    }

    /// Fire the cancellation signal. Idempotent.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

impl Default for Canceller {
    fn default() -> Self {
        Self::new()
    }
}

/// A cloneable observer of a cancellation scope.
#[derive(Debug, Clone)]
pub struct CancelToken {
    /// `None` is the never-cancelled token.
    rx: Option<watch::Receiver<bool>>,
}

impl CancelToken {
    /// A token that never fires. Useful for consumers driven manually in
    /// tests or short-lived tooling.
    pub fn never() -> Self {
        Self { rx: None }
    }

    /// Whether the scope has been cancelled (or its canceller dropped).
    pub fn is_cancelled(&self) -> bool {
        match &self.rx {
            None => false,
            Some(rx) => *rx.borrow() || rx.has_changed().is_err(),
        }
    }

    /// Resolves once the scope is cancelled; pends forever for
    /// [`never`](CancelToken::never) tokens.
    pub async fn cancelled(&self) {
        let Some(rx) = &self.rx else {
            return std::future::pending().await;
        };
        let mut rx = rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                // Canceller dropped: the owning scope is gone.
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn token_starts_uncancelled() {
        let canceller = Canceller::new();
        let token = canceller.token();
        assert!(!token.is_cancelled());
    }

    #[tokio::test]
    async fn cancel_wakes_waiters() {
        let canceller = Canceller::new();
        let token = canceller.token();
        let waiter = tokio::spawn(async move { token.cancelled().await });
        canceller.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .expect("waiter task should not panic");
    }

    #[tokio::test]
    async fn dropping_canceller_counts_as_cancellation() {
        let canceller = Canceller::new();
        let token = canceller.token();
        drop(canceller);
        assert!(token.is_cancelled());
        tokio::time::timeout(Duration::from_secs(1), token.cancelled())
            .await
            .expect("dropped canceller should resolve waiters");
    }

    #[tokio::test]
    async fn never_token_pends() {
        let token = CancelToken::never();
        assert!(!token.is_cancelled());
        let outcome =
            tokio::time::timeout(Duration::from_millis(20), token.cancelled()).await;
        assert!(outcome.is_err(), "never token must not resolve");
    }

    #[tokio::test]
    async fn tokens_are_cloneable_and_consistent() {
        let canceller = Canceller::new();
        let a = canceller.token();
        let b = a.clone();
        canceller.cancel();
        assert!(a.is_cancelled());
        assert!(b.is_cancelled());
    }
}
