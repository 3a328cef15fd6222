// SPDX-License-Identifier: Apache-2.0

use flume::{Receiver, Sender};
use std::fmt;

pub struct BoundedSender<T> {
    tx: Sender<T>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum SendError {
    Disconnected,
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::Disconnected => write!(f, "channel disconnected"),
        }
    }
}

impl<T> BoundedSender<T> {
    /// Async send. On a rendezvous channel this completes only once a
    /// receiver takes the item; dropping the returned future before
    /// completion leaves nothing queued.
    pub async fn send(&self, item: T) -> Result<(), SendError> {
        match self.tx.send_async(item).await {
            Ok(()) => Ok(()),
            Err(_e) => Err(SendError::Disconnected), // receiver closed
        }
    }

    /// Blocking send for non-async contexts.
    pub fn send_blocking(&self, item: T) -> Result<(), SendError> {
        match self.tx.send(item) {
            Ok(()) => Ok(()),
            Err(_e) => Err(SendError::Disconnected),
        }
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }
}

impl<T> Clone for BoundedSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

#[derive(Clone)]
pub struct BoundedReceiver<T> {
    rx: Receiver<T>,
}

impl<T> BoundedReceiver<T> {
    /// Async receive. Cancel-safe: dropping the future mid-poll never loses
    /// an item, which lets callers race it against timers in `select!`.
    pub async fn recv(&self) -> Option<T> {
        match self.rx.recv_async().await {
            Ok(item) => Some(item),
            Err(_e) => None, // disconnected
        }
    }

    /// Non-blocking receive. None if nothing is ready or the channel is
    /// disconnected.
    pub fn try_recv(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Blocking receive with a timeout, for non-async contexts.
    pub fn recv_timeout(&self, timeout: std::time::Duration) -> Option<T> {
        self.rx.recv_timeout(timeout).ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

pub fn bounded<T>(size: usize) -> (BoundedSender<T>, BoundedReceiver<T>) {
    let (tx, rx) = flume::bounded::<T>(size);

    let sender = BoundedSender { tx };
    let receiver = BoundedReceiver { rx };

    (sender, receiver)
}

/// A zero-capacity channel: every send waits for a matching receive.
pub fn rendezvous<T>() -> (BoundedSender<T>, BoundedReceiver<T>) {
    bounded(0)
}

#[cfg(test)]
mod tests {
    use super::{bounded, rendezvous, SendError};
    use tokio_test::{assert_ok, assert_pending, assert_ready, task::spawn};

    #[tokio::test]
    async fn basics() {
        let (tx, rx) = bounded(3);

        let msg = 10;

        let mut send1 = spawn(async { tx.send(msg).await });
        let mut recv1 = spawn(async { rx.recv().await });

        assert!(!send1.is_woken());
        assert!(!recv1.is_woken());

        assert_pending!(recv1.poll());

        assert_ok!(assert_ready!(send1.poll()));

        assert!(recv1.is_woken());

        assert_eq!(Some(msg), assert_ready!(recv1.poll()));

        drop(send1);
        drop(recv1);

        let mut recv2 = spawn(async { rx.recv().await });

        drop(tx);
        // receives None since send channel was closed
        assert_eq!(None, assert_ready!(recv2.poll()));
    }

    #[tokio::test]
    async fn rendezvous_send_waits_for_receiver() {
        let (tx, rx) = rendezvous();

        let msg = 7;

        let mut send1 = spawn(async { tx.send(msg).await });

        // no receiver yet, the send parks
        assert_pending!(send1.poll());

        let mut recv1 = spawn(async { rx.recv().await });
        assert_eq!(Some(msg), assert_ready!(recv1.poll()));

        assert_ok!(assert_ready!(send1.poll()));
    }

    #[tokio::test]
    async fn abandoned_rendezvous_send_leaves_nothing_queued() {
        let (tx, rx) = rendezvous::<i32>();

        {
            let mut send1 = spawn(async { tx.send(1).await });
            assert_pending!(send1.poll());
            // dropped before any receiver showed up
        }

        assert_eq!(None, rx.try_recv());
    }

    #[tokio::test]
    async fn sender_fails_on_rx_close() {
        let (tx, rx) = bounded(1);

        let msg = 10;

        let mut send1 = spawn(async { tx.send(msg).await });

        drop(rx);
        assert_eq!(Err(SendError::Disconnected), assert_ready!(send1.poll()));
    }
}
