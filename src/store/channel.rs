use tokio::sync::watch;

/// A named publish/subscribe channel with last-value-wins delivery.
///
/// Backed by [`tokio::sync::watch`]: a subscriber that falls behind only ever
/// sees the most recent value, values on one channel are observed in publish
/// order, and separate channels never block each other.
#[derive(Debug)]
pub struct Channel<T> {
    name: &'static str,
    tx: watch::Sender<T>,
}

impl<T> Channel<T>
where
    T: Clone + Send + Sync,
{
    pub fn new(name: &'static str, initial: T) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { name, tx }
    }

    /// Replaces the current value and wakes every subscriber.
    ///
    /// Succeeds even when nobody is subscribed.
    pub fn publish(&self, value: T) {
        self.tx.send_replace(value);
        tracing::trace!(
            channel = self.name,
            subscribers = self.tx.receiver_count(),
            "Published"
        );
    }

    pub fn current(&self) -> T {
        self.tx.borrow().clone()
    }

    /// Subscribes to values published from now on.
    pub fn subscribe(&self) -> Subscription<T> {
        Subscription {
            name: self.name,
            rx: self.tx.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// A live view onto a [`Channel`].
///
/// Dropping the subscription (or calling [`Subscription::unsubscribe`])
/// detaches it.
#[derive(Debug)]
pub struct Subscription<T> {
    name: &'static str,
    rx: watch::Receiver<T>,
}

impl<T> Clone for Subscription<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            rx: self.rx.clone(),
        }
    }
}

impl<T: Clone> Subscription<T> {
    /// Waits for the next publication and returns it.
    ///
    /// Several publications made while the subscriber was not polling are
    /// collapsed into the latest one. Returns `None` once the channel is gone.
    pub async fn next(&mut self) -> Option<T> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }

    /// Latest value without waiting; does not mark it as seen.
    pub fn latest(&self) -> T {
        self.rx.borrow().clone()
    }

    /// True if something was published since the last [`Subscription::next`].
    pub fn has_changed(&self) -> bool {
        self.rx.has_changed().unwrap_or(false)
    }

    pub fn unsubscribe(self) {
        tracing::trace!(channel = self.name, "Unsubscribed");
    }
}
