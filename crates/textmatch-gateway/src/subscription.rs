use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::stream::{BoxStream, Stream, StreamExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A live, cancellable feed.
///
/// Once [`Subscription::unsubscribe`] has been called, polling yields `None`
/// and no further item is ever produced, even if one was already buffered.
pub struct Subscription<T> {
    stream: BoxStream<'static, T>,
    cancel: CancellationToken,
}

impl<T: Send + 'static> Subscription<T> {
    pub fn new(stream: BoxStream<'static, T>) -> Self {
        Self {
            stream,
            cancel: CancellationToken::new(),
        }
    }

    pub fn unsubscribe(&self) {
        self.cancel.cancel();
    }

    pub fn is_unsubscribed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token that cancels this subscription from elsewhere.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Drives the feed on a background task, calling `callback` per item.
    pub fn spawn_callback<F>(mut self, mut callback: F) -> CallbackHandle
    where
        F: FnMut(T) + Send + 'static,
    {
        let cancel = self.cancel.clone();
        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = task_cancel.cancelled() => break,
                    item = self.next() => match item {
                        Some(item) => callback(item),
                        None => break,
                    },
                }
            }
        });

        CallbackHandle {
            cancel,
            task: Some(task),
        }
    }
}

impl<T> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        if self.cancel.is_cancelled() {
            return Poll::Ready(None);
        }
        self.stream.poll_next_unpin(cx)
    }
}

/// Handle to a callback-driven subscription. Dropping it cancels the feed.
pub struct CallbackHandle {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl CallbackHandle {
    /// Cancels the feed and waits for the driver task to exit. When this
    /// returns, the callback is not running and will never run again.
    pub async fn unsubscribe(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(|t| t.is_finished())
    }
}

impl Drop for CallbackHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use tokio::sync::mpsc;

    fn channel_subscription() -> (mpsc::UnboundedSender<u32>, Subscription<u32>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|v| (v, rx))
        });
        (tx, Subscription::new(stream.boxed()))
    }

    #[tokio::test]
    async fn nothing_is_yielded_after_unsubscribe() {
        let (tx, mut sub) = channel_subscription();
        tx.send(1).unwrap();
        assert_eq!(sub.next().await, Some(1));

        tx.send(2).unwrap();
        sub.unsubscribe();
        assert!(sub.is_unsubscribed());
        assert_eq!(sub.next().await, None);
    }

    #[tokio::test]
    async fn callback_never_fires_after_unsubscribe_returns() {
        let (tx, sub) = channel_subscription();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let handle = sub.spawn_callback(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tx.send(1).unwrap();
        while seen.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        handle.unsubscribe().await;
        let after = seen.load(Ordering::SeqCst);
        for i in 0..10 {
            let _ = tx.send(i);
        }
        tokio::task::yield_now().await;
        assert_eq!(seen.load(Ordering::SeqCst), after);
    }

    #[tokio::test]
    async fn dropping_the_handle_stops_the_driver() {
        let (_tx, sub) = channel_subscription();
        let token = sub.cancel_token();
        let handle = sub.spawn_callback(|_| {});
        drop(handle);
        assert!(token.is_cancelled());
    }
}
