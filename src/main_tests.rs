// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for `main.rs` - leadership tracking and signal handling

#[cfg(test)]
mod tests {
    use super::super::{leader_identity, wait_for_leadership};
    use std::time::Duration as StdDuration;
    use tokio::sync::watch;
    use tokio::time::timeout;

    /// Test that SIGTERM signal handler can be created on Unix platforms
    #[tokio::test]
    #[cfg(unix)]
    async fn test_sigterm_signal_handler_creation() {
        use tokio::signal::unix::{signal, SignalKind};

        let result = signal(SignalKind::terminate());
        assert!(
            result.is_ok(),
            "Should be able to create SIGTERM signal handler"
        );
    }

    #[tokio::test]
    async fn test_wait_for_leadership_returns_when_already_leader() {
        let (_tx, mut rx) = watch::channel(true);
        timeout(StdDuration::from_millis(100), wait_for_leadership(&mut rx, true))
            .await
            .expect("current state already matches");
    }

    #[tokio::test]
    async fn test_wait_for_leadership_follows_changes() {
        let (tx, mut rx) = watch::channel(false);
        let waiter = tokio::spawn(async move {
            wait_for_leadership(&mut rx, true).await;
            wait_for_leadership(&mut rx, false).await;
        });

        tokio::time::sleep(StdDuration::from_millis(10)).await;
        tx.send(true).unwrap();
        tokio::time::sleep(StdDuration::from_millis(10)).await;
        tx.send(false).unwrap();

        timeout(StdDuration::from_secs(1), waiter)
            .await
            .expect("both transitions should be observed")
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_leadership_pends_when_manager_is_gone() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        let result = timeout(StdDuration::from_millis(50), wait_for_leadership(&mut rx, true)).await;
        assert!(result.is_err(), "a closed lease channel never reports leadership");
    }

    #[test]
    fn test_leader_identity_is_not_empty() {
        assert!(!leader_identity().is_empty());
    }
}
