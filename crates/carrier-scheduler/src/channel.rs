//! Consumable channels actors can subscribe to
//!
//! An actor registers interest with `ActorControl::consume`. The channel
//! wakes every registered consumer when data arrives; the consumer's
//! callback then runs on its own carrier whenever `has_available` is true.

use crate::scheduler::task::ActorWaker;
use crossbeam::queue::SegQueue;
use parking_lot::Mutex;

/// External queue that can wake consuming actors
pub trait ConsumableChannel: Send + Sync + 'static {
    /// Whether a consumer would find data right now
    fn has_available(&self) -> bool;

    /// Wake `waker` whenever data becomes available
    fn register_consumer(&self, waker: ActorWaker);

    /// Forget one registration of a consumer; the same actor may be
    /// registered once per subscription
    fn remove_consumer(&self, waker: &ActorWaker);
}

/// Unbounded multi-producer channel of messages
pub struct MessageChannel<T> {
    messages: SegQueue<T>,
    consumers: Mutex<Vec<ActorWaker>>,
}

impl<T: Send + 'static> MessageChannel<T> {
    /// Create an empty channel
    pub fn new() -> Self {
        Self {
            messages: SegQueue::new(),
            consumers: Mutex::new(Vec::new()),
        }
    }

    /// Append a message and wake all consumers
    pub fn offer(&self, message: T) {
        self.messages.push(message);
        let consumers = self.consumers.lock().clone();
        for consumer in consumers {
            consumer.wake();
        }
    }

    /// Take the oldest message
    pub fn poll(&self) -> Option<T> {
        self.messages.pop()
    }

    /// Number of queued messages
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether no message is queued
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Number of registered consumers
    pub fn consumer_count(&self) -> usize {
        self.consumers.lock().len()
    }
}

impl<T: Send + 'static> Default for MessageChannel<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> ConsumableChannel for MessageChannel<T> {
    fn has_available(&self) -> bool {
        !self.messages.is_empty()
    }

    fn register_consumer(&self, waker: ActorWaker) {
        self.consumers.lock().push(waker);
    }

    fn remove_consumer(&self, waker: &ActorWaker) {
        let mut consumers = self.consumers.lock();
        if let Some(pos) = consumers.iter().position(|w| w.will_wake(waker)) {
            consumers.swap_remove(pos);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offer_and_poll_in_order() {
        let channel = MessageChannel::new();
        assert!(!channel.has_available());

        channel.offer(1);
        channel.offer(2);
        assert!(channel.has_available());
        assert_eq!(channel.len(), 2);

        assert_eq!(channel.poll(), Some(1));
        assert_eq!(channel.poll(), Some(2));
        assert_eq!(channel.poll(), None);
        assert!(channel.is_empty());
    }

    #[test]
    fn test_consumer_registration() {
        let channel: MessageChannel<u8> = MessageChannel::new();
        let waker = ActorWaker::detached();
        channel.register_consumer(waker.clone());
        assert_eq!(channel.consumer_count(), 1);

        // Waking a detached consumer is a no-op
        channel.offer(1);

        channel.remove_consumer(&waker);
        assert_eq!(channel.consumer_count(), 0);
    }

    #[test]
    fn test_remove_consumer_drops_one_registration() {
        let channel: MessageChannel<u8> = MessageChannel::new();
        let waker = ActorWaker::detached();
        channel.register_consumer(waker.clone());
        channel.register_consumer(waker.clone());

        channel.remove_consumer(&waker);
        assert_eq!(channel.consumer_count(), 1);
        channel.remove_consumer(&waker);
        assert_eq!(channel.consumer_count(), 0);
    }
}
