//! Reactive plumbing: count observables and the latest-wins task slot.

use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Publishing side of a repository row-count observable.
///
/// Mutating repository methods call [`CountPublisher::set`] after commit;
/// emissions are serialized and monotone with respect to commit order.
#[derive(Debug)]
pub struct CountPublisher {
    tx: watch::Sender<i64>,
}

impl CountPublisher {
    pub fn new(initial: i64) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    /// Publish a new count. Subscribers see the latest value.
    pub fn set(&self, count: i64) {
        // send_replace never fails even with zero subscribers
        self.tx.send_replace(count);
    }

    pub fn get(&self) -> i64 {
        *self.tx.borrow()
    }

    /// Subscribe; the receiver immediately observes the current value.
    pub fn subscribe(&self) -> CountObservable {
        CountObservable {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for CountPublisher {
    fn default() -> Self {
        Self::new(0)
    }
}

/// Subscribing side of a row-count observable.
#[derive(Debug, Clone)]
pub struct CountObservable {
    rx: watch::Receiver<i64>,
}

impl CountObservable {
    /// Current value without waiting.
    pub fn get(&self) -> i64 {
        *self.rx.borrow()
    }

    /// Wait until the value changes, then return it.
    ///
    /// Returns `None` once the publisher is dropped.
    pub async fn changed(&mut self) -> Option<i64> {
        self.rx.changed().await.ok()?;
        Some(*self.rx.borrow_and_update())
    }
}

type Callback<T> = Arc<dyn Fn(T) + Send + Sync>;

/// Single-slot latest-wins executor.
///
/// Each [`ThrottledTask::post`] cancels the in-flight run and schedules the
/// new producer; only the surviving run's result reaches the completion
/// callback. Intermediate results are discarded without notice.
pub struct ThrottledTask<T> {
    callback: Callback<T>,
    current: Mutex<Option<CancellationToken>>,
}

impl<T: Send + 'static> ThrottledTask<T> {
    pub fn new(callback: impl Fn(T) + Send + Sync + 'static) -> Self {
        Self {
            callback: Arc::new(callback),
            current: Mutex::new(None),
        }
    }

    /// Schedule `producer`, cancelling whatever run is in flight.
    ///
    /// The producer receives a token it may observe for cooperative
    /// cancellation of expensive work.
    pub fn post<F, Fut>(&self, producer: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let token = CancellationToken::new();
        let previous = {
            let mut slot = self.current.lock().expect("throttled task slot poisoned");
            slot.replace(token.clone())
        };
        if let Some(previous) = previous {
            previous.cancel();
        }

        let callback = Arc::clone(&self.callback);
        let fut = producer(token.clone());
        tokio::spawn(async move {
            tokio::select! {
                biased;

                () = token.cancelled() => {}

                value = fut => {
                    if !token.is_cancelled() {
                        callback(value);
                    }
                }
            }
        });
    }

    /// Cancel the in-flight run, if any.
    pub fn cancel(&self) {
        if let Some(token) = self
            .current
            .lock()
            .expect("throttled task slot poisoned")
            .take()
        {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn count_observable_sees_current_value_on_subscribe() {
        let publisher = CountPublisher::new(7);
        let observable = publisher.subscribe();
        assert_eq!(observable.get(), 7);
    }

    #[tokio::test]
    async fn count_observable_sees_updates() {
        let publisher = CountPublisher::new(0);
        let mut observable = publisher.subscribe();

        publisher.set(3);
        assert_eq!(observable.changed().await, Some(3));

        publisher.set(5);
        assert_eq!(observable.changed().await, Some(5));
    }

    #[tokio::test]
    async fn count_observable_ends_when_publisher_drops() {
        let publisher = CountPublisher::new(0);
        let mut observable = publisher.subscribe();
        drop(publisher);
        assert_eq!(observable.changed().await, None);
    }

    #[tokio::test]
    async fn throttled_task_delivers_latest_post_only() {
        let delivered = Arc::new(AtomicI64::new(0));
        let sink = Arc::clone(&delivered);
        let task = ThrottledTask::new(move |v: i64| {
            sink.store(v, Ordering::SeqCst);
        });

        // Slow first run gets displaced by the second before it resolves.
        task.post(|_cancel| async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            1
        });
        task.post(|_cancel| async { 2 });

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(delivered.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn throttled_task_cancel_discards_result() {
        let delivered = Arc::new(AtomicI64::new(-1));
        let sink = Arc::clone(&delivered);
        let task = ThrottledTask::new(move |v: i64| {
            sink.store(v, Ordering::SeqCst);
        });

        task.post(|_cancel| async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            9
        });
        task.cancel();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(delivered.load(Ordering::SeqCst), -1);
    }
}
