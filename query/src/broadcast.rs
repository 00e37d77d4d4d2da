use std::{
    cell::RefCell,
    pin::Pin,
    rc::{Rc, Weak},
    task::{Context, Poll},
};

use futures::Stream;
use futures_channel::mpsc;
use slotmap::{new_key_type, SlotMap};

new_key_type! {
    pub(crate) struct SubscriberKey;
}

/// Single-threaded multicast channel.
///
/// A replaying broadcast caches the last published value and hands it to every new
/// subscriber before anything published afterwards.
pub(crate) struct Broadcast<T> {
    channel: Rc<RefCell<Channel<T>>>,
}

struct Channel<T> {
    replay: bool,
    last: Option<T>,
    closed: bool,
    subscribers: SlotMap<SubscriberKey, mpsc::UnboundedSender<T>>,
}

impl<T> Clone for Broadcast<T> {
    fn clone(&self) -> Self {
        Self {
            channel: self.channel.clone(),
        }
    }
}

impl<T> Broadcast<T>
where
    T: Clone + 'static,
{
    /// Plain multicast. Late subscribers only see what is published after they joined.
    pub(crate) fn new() -> Self {
        Self::with_replay(false, None)
    }

    /// Multicast that replays the last value to new subscribers.
    pub(crate) fn replaying(initial: Option<T>) -> Self {
        Self::with_replay(true, initial)
    }

    fn with_replay(replay: bool, last: Option<T>) -> Self {
        Self {
            channel: Rc::new(RefCell::new(Channel {
                replay,
                last,
                closed: false,
                subscribers: SlotMap::with_key(),
            })),
        }
    }

    pub(crate) fn publish(&self, value: T) {
        let mut channel = self.channel.borrow_mut();
        if channel.closed {
            return;
        }
        // Receivers that went away are pruned here.
        channel
            .subscribers
            .retain(|_, sender| sender.unbounded_send(value.clone()).is_ok());
        if channel.replay {
            channel.last = Some(value);
        }
    }

    pub(crate) fn subscribe(&self) -> Subscription<T> {
        let (sender, receiver) = mpsc::unbounded();
        let mut channel = self.channel.borrow_mut();

        if let Some(last) = channel.last.clone() {
            let _ = sender.unbounded_send(last);
        }

        // A closed channel still replays, then ends.
        let key = if channel.closed {
            None
        } else {
            Some(channel.subscribers.insert(sender))
        };

        Subscription {
            receiver,
            key,
            channel: Rc::downgrade(&self.channel),
        }
    }

    /// Ends every subscription. Publishing afterwards is a no-op.
    pub(crate) fn close(&self) {
        let mut channel = self.channel.borrow_mut();
        channel.closed = true;
        channel.subscribers.clear();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.channel.borrow().closed
    }

    #[cfg(test)]
    pub(crate) fn subscriber_count(&self) -> usize {
        self.channel.borrow().subscribers.len()
    }
}

/// A live subscription to a broadcast. Dropping it unsubscribes.
pub struct Subscription<T> {
    receiver: mpsc::UnboundedReceiver<T>,
    key: Option<SubscriberKey>,
    channel: Weak<RefCell<Channel<T>>>,
}

impl<T> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.receiver).poll_next(cx)
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        let (Some(key), Some(channel)) = (self.key.take(), self.channel.upgrade()) else {
            return;
        };
        // If the channel is mid-publish the dead sender gets pruned on the next publish instead.
        if let Ok(mut channel) = channel.try_borrow_mut() {
            channel.subscribers.remove(key);
        };
    }
}

impl<T> std::fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use futures::{FutureExt, StreamExt};

    use super::*;

    #[test]
    fn replays_last_value_to_late_subscribers() {
        let broadcast = Broadcast::replaying(Some(0));
        broadcast.publish(1);

        let mut subscription = broadcast.subscribe();
        assert_eq!(subscription.next().now_or_never(), Some(Some(1)));

        broadcast.publish(2);
        assert_eq!(subscription.next().now_or_never(), Some(Some(2)));
    }

    #[test]
    fn plain_broadcast_does_not_replay() {
        let broadcast = Broadcast::new();
        broadcast.publish(1);

        let mut subscription = broadcast.subscribe();
        assert_eq!(subscription.next().now_or_never(), None);

        broadcast.publish(2);
        assert_eq!(subscription.next().now_or_never(), Some(Some(2)));
    }

    #[test]
    fn dropping_a_subscription_unsubscribes() {
        let broadcast = Broadcast::<u32>::new();
        let first = broadcast.subscribe();
        let _second = broadcast.subscribe();
        assert_eq!(broadcast.subscriber_count(), 2);

        drop(first);
        assert_eq!(broadcast.subscriber_count(), 1);
    }

    #[test]
    fn close_ends_subscriptions_after_replay() {
        let broadcast = Broadcast::replaying(Some("last"));
        let mut live = broadcast.subscribe();
        broadcast.close();

        assert_eq!(live.next().now_or_never(), Some(Some("last")));
        assert_eq!(live.next().now_or_never(), Some(None));

        let mut late = broadcast.subscribe();
        assert_eq!(late.next().now_or_never(), Some(Some("last")));
        assert_eq!(late.next().now_or_never(), Some(None));
        assert!(broadcast.is_closed());
    }
}
