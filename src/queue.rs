//! Per-client operation queue
//!
//! Every signaling transaction against a peer connection goes through this
//! queue, so no two transactions interleave: one consumer task drains items
//! in FIFO order and runs each to completion before looking at the next.
//! The queue is bound to the client's cancellation scope; once that scope
//! is cancelled, pending items are drained and any reply channel they carry
//! receives a cancellation error.

use std::future::Future;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

/// A signaling operation for one client.
pub(crate) enum QueueItem {
    /// Apply a remote offer and answer it. The answer (or failure) goes
    /// back through `reply`.
    Negotiate {
        offer: RTCSessionDescription,
        reply: oneshot::Sender<Result<RTCSessionDescription>>,
    },
    /// Run the local renegotiation loop, folding any requests that arrive
    /// while a loop is already in flight into that loop.
    Renegotiate,
    /// Grant the remote side permission to send its pending offer.
    AllowRemoteRenegotiation,
}

impl QueueItem {
    /// Delivers a cancellation error to whatever reply channel the item
    /// carries; items without a reply channel are simply dropped.
    pub(crate) fn cancel(self) {
        if let Self::Negotiate { reply, .. } = self {
            let _ = reply.send(Err(Error::ClientStopped));
        }
    }
}

/// Producer half: non-blocking `push`.
pub(crate) struct OperationQueue<T = QueueItem> {
    tx: mpsc::UnboundedSender<T>,
}

/// Consumer half: owned by exactly one task.
pub(crate) struct OperationConsumer<T = QueueItem> {
    rx: mpsc::UnboundedReceiver<T>,
}

pub(crate) fn operation_queue<T>() -> (OperationQueue<T>, OperationConsumer<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (OperationQueue { tx }, OperationConsumer { rx })
}

impl<T> OperationQueue<T> {
    /// Enqueues `item` and wakes the consumer. Fails only after the
    /// consumer has shut down.
    pub(crate) fn push(&self, item: T) -> Result<()> {
        self.tx.send(item).map_err(|_| Error::ClientStopped)
    }
}

impl<T> OperationConsumer<T> {
    /// Drains the queue in FIFO order, running `op` for each item, until
    /// `cancel` fires or every producer is gone. Items still queued at
    /// cancellation are handed to `on_cancelled`.
    pub(crate) async fn run<F, Fut>(
        mut self,
        cancel: CancellationToken,
        mut op: F,
        on_cancelled: impl Fn(T),
    ) where
        F: FnMut(T) -> Fut,
        Fut: Future<Output = ()>,
    {
        loop {
            tokio::select! {
                // Cancellation wins over queued work, so pending items are
                // drained with a cancellation error instead of running.
                biased;
                () = cancel.cancelled() => break,
                item = self.rx.recv() => match item {
                    Some(item) => op(item).await,
                    None => return,
                },
            }
        }

        self.rx.close();
        while let Ok(item) = self.rx.try_recv() {
            on_cancelled(item);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[tokio::test]
    async fn items_are_consumed_in_fifo_order() {
        let (queue, consumer) = operation_queue::<u32>();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let cancel = CancellationToken::new();

        for i in 0..100 {
            queue.push(i).unwrap();
        }
        drop(queue);

        let seen2 = Arc::clone(&seen);
        consumer
            .run(
                cancel,
                |item| {
                    let seen = Arc::clone(&seen2);
                    async move {
                        seen.lock().push(item);
                    }
                },
                |_| {},
            )
            .await;

        assert_eq!(*seen.lock(), (0..100).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn concurrent_producers_observe_a_total_order() {
        let (queue, consumer) = operation_queue::<(u8, u32)>();
        let queue = Arc::new(queue);
        let cancel = CancellationToken::new();

        let mut producers = Vec::new();
        for producer in 0..2u8 {
            let queue = Arc::clone(&queue);
            producers.push(tokio::spawn(async move {
                for i in 0..50 {
                    queue.push((producer, i)).unwrap();
                    tokio::task::yield_now().await;
                }
            }));
        }
        for task in producers {
            task.await.unwrap();
        }
        drop(queue);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        consumer
            .run(
                cancel,
                |item| {
                    let seen = Arc::clone(&seen2);
                    async move {
                        seen.lock().push(item);
                    }
                },
                |_| {},
            )
            .await;

        // Per producer, consumption preserves push order.
        let seen = seen.lock();
        for producer in 0..2u8 {
            let per: Vec<u32> = seen
                .iter()
                .filter(|(p, _)| *p == producer)
                .map(|(_, i)| *i)
                .collect();
            assert_eq!(per, (0..50).collect::<Vec<_>>());
        }
    }

    #[tokio::test]
    async fn cancellation_drains_pending_items() {
        let (queue, consumer) = operation_queue::<u32>();
        let cancel = CancellationToken::new();
        cancel.cancel();

        for i in 0..5 {
            queue.push(i).unwrap();
        }

        let drained = Arc::new(Mutex::new(Vec::new()));
        let drained2 = Arc::clone(&drained);
        consumer
            .run(cancel, |_| async {}, move |item| drained2.lock().push(item))
            .await;

        assert_eq!(*drained.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn negotiate_reply_gets_cancellation_error() {
        let (reply, rx) = oneshot::channel();
        let item = QueueItem::Negotiate {
            offer: RTCSessionDescription::default(),
            reply,
        };
        item.cancel();
        assert!(matches!(rx.await, Ok(Err(Error::ClientStopped))));
    }

    #[tokio::test]
    async fn push_after_consumer_shutdown_fails() {
        let (queue, consumer) = operation_queue::<u32>();
        drop(consumer);
        assert!(matches!(queue.push(1), Err(Error::ClientStopped)));
    }
}
