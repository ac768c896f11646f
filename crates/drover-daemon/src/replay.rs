//! Bounded multicast channel with history replay.
//!
//! A [`ReplayChannel`] keeps the most recent `capacity` items. Every
//! subscriber has its own cursor, so a consumer that attaches late still sees
//! the retained history before live items. When the buffer is full the oldest
//! entry is dropped; a subscriber whose cursor fell behind resumes at the
//! oldest retained entry.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tokio_stream::Stream;

/// Default number of retained items per channel.
pub const DEFAULT_REPLAY_CAPACITY: usize = 100;

struct State<T> {
    buf: VecDeque<T>,
    capacity: usize,
    /// Sequence number the next pushed item will get.
    next_seq: u64,
    closed: bool,
}

impl<T> State<T> {
    /// Sequence number of `buf[0]`.
    fn first_seq(&self) -> u64 {
        self.next_seq - self.buf.len() as u64
    }
}

struct Shared<T> {
    state: Mutex<State<T>>,
    notify: Notify,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Producer side. Cheap to clone; all clones share one buffer.
pub struct ReplayChannel<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for ReplayChannel<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> std::fmt::Debug for ReplayChannel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("ReplayChannel")
            .field("len", &state.buf.len())
            .field("capacity", &state.capacity)
            .field("closed", &state.closed)
            .finish()
    }
}

impl<T: Clone> ReplayChannel<T> {
    /// Create a channel retaining at most `capacity` items (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    buf: VecDeque::with_capacity(capacity),
                    capacity,
                    next_seq: 0,
                    closed: false,
                }),
                notify: Notify::new(),
            }),
        }
    }

    /// Append an item and wake subscribers. Returns `false` once closed.
    pub fn push(&self, item: T) -> bool {
        self.append(item, false)
    }

    /// Append a last item and close, atomically with respect to other
    /// pushes. Returns `false` if the channel was already closed.
    pub fn push_and_close(&self, item: T) -> bool {
        self.append(item, true)
    }

    fn append(&self, item: T, close: bool) -> bool {
        {
            let mut state = self.shared.lock();
            if state.closed {
                return false;
            }
            if state.buf.len() == state.capacity {
                state.buf.pop_front();
            }
            state.buf.push_back(item);
            state.next_seq += 1;
            state.closed = close;
        }
        self.shared.notify.notify_waiters();
        true
    }

    /// Close the channel. Returns `true` only for the call that closed it.
    pub fn close(&self) -> bool {
        let newly_closed = {
            let mut state = self.shared.lock();
            !std::mem::replace(&mut state.closed, true)
        };
        if newly_closed {
            self.shared.notify.notify_waiters();
        }
        newly_closed
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Number of retained items.
    pub fn len(&self) -> usize {
        self.shared.lock().buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the retained history, oldest first.
    pub fn snapshot(&self) -> Vec<T> {
        self.shared.lock().buf.iter().cloned().collect()
    }

    /// New subscriber positioned at the oldest retained item.
    pub fn subscribe(&self) -> ReplaySubscriber<T> {
        let cursor = self.shared.lock().first_seq();
        ReplaySubscriber {
            shared: Arc::clone(&self.shared),
            cursor,
        }
    }
}

/// Consumer side with its own read cursor.
pub struct ReplaySubscriber<T> {
    shared: Arc<Shared<T>>,
    cursor: u64,
}

/// Result of a non-blocking read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TryRecv<T> {
    Item(T),
    Empty,
    Closed,
}

impl<T: Clone> ReplaySubscriber<T> {
    /// Non-blocking read.
    pub fn try_recv(&mut self) -> TryRecv<T> {
        let state = self.shared.lock();
        let first = state.first_seq();
        if self.cursor < first {
            self.cursor = first;
        }
        #[allow(clippy::cast_possible_truncation)]
        let idx = (self.cursor - first) as usize;
        match state.buf.get(idx) {
            Some(item) => {
                self.cursor += 1;
                TryRecv::Item(item.clone())
            }
            None if state.closed => TryRecv::Closed,
            None => TryRecv::Empty,
        }
    }

    /// Next item, waiting if none is available. `None` once the channel is
    /// closed and everything retained has been read.
    pub async fn recv(&mut self) -> Option<T> {
        let shared = Arc::clone(&self.shared);
        loop {
            let notified = shared.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a push between check and await
            // is not missed.
            notified.as_mut().enable();
            match self.try_recv() {
                TryRecv::Item(item) => return Some(item),
                TryRecv::Closed => return None,
                TryRecv::Empty => notified.await,
            }
        }
    }

    /// Drain every remaining item until the channel closes.
    pub async fn collect(mut self) -> Vec<T> {
        let mut out = Vec::new();
        while let Some(item) = self.recv().await {
            out.push(item);
        }
        out
    }

    pub fn into_stream(mut self) -> impl Stream<Item = T>
    where
        T: Send + 'static,
    {
        async_stream::stream! {
            while let Some(item) = self.recv().await {
                yield item;
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio_stream::StreamExt;

    #[test]
    fn late_subscriber_sees_history() {
        let ch = ReplayChannel::new(10);
        ch.push(1);
        ch.push(2);
        let mut sub = ch.subscribe();
        assert_eq!(sub.try_recv(), TryRecv::Item(1));
        assert_eq!(sub.try_recv(), TryRecv::Item(2));
        assert_eq!(sub.try_recv(), TryRecv::Empty);
        ch.close();
        assert_eq!(sub.try_recv(), TryRecv::Closed);
    }

    #[test]
    fn push_and_close_makes_the_item_last() {
        let ch = ReplayChannel::new(4);
        ch.push(1);
        assert!(ch.push_and_close(2));
        assert!(!ch.push(3));
        assert!(!ch.push_and_close(4));
        assert!(!ch.close());
        let mut sub = ch.subscribe();
        assert_eq!(sub.try_recv(), TryRecv::Item(1));
        assert_eq!(sub.try_recv(), TryRecv::Item(2));
        assert_eq!(sub.try_recv(), TryRecv::Closed);
    }

    #[test]
    fn full_buffer_drops_oldest() {
        let ch = ReplayChannel::new(3);
        for i in 0..5 {
            ch.push(i);
        }
        assert_eq!(ch.snapshot(), vec![2, 3, 4]);
        let mut sub = ch.subscribe();
        assert_eq!(sub.try_recv(), TryRecv::Item(2));
    }

    #[test]
    fn lagging_subscriber_skips_to_oldest_retained() {
        let ch = ReplayChannel::new(2);
        let mut sub = ch.subscribe();
        for i in 0..5 {
            ch.push(i);
        }
        assert_eq!(sub.try_recv(), TryRecv::Item(3));
        assert_eq!(sub.try_recv(), TryRecv::Item(4));
    }

    #[test]
    fn close_is_idempotent_and_rejects_pushes() {
        let ch = ReplayChannel::new(4);
        assert!(ch.push("a"));
        assert!(ch.close());
        assert!(!ch.close());
        assert!(!ch.push("b"));
        assert_eq!(ch.snapshot(), vec!["a"]);
    }

    #[test]
    fn zero_capacity_is_raised_to_one() {
        let ch = ReplayChannel::new(0);
        ch.push(1);
        ch.push(2);
        assert_eq!(ch.snapshot(), vec![2]);
    }

    #[tokio::test]
    async fn recv_wakes_on_push_and_close() {
        let ch = ReplayChannel::new(8);
        let sub = ch.subscribe();
        let reader = tokio::spawn(sub.collect());

        tokio::time::sleep(Duration::from_millis(10)).await;
        ch.push(1);
        ch.push(2);
        tokio::time::sleep(Duration::from_millis(10)).await;
        ch.push(3);
        ch.close();

        let got = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn multiple_subscribers_each_see_everything() {
        let ch = ReplayChannel::new(8);
        let a = tokio::spawn(ch.subscribe().collect());
        let b = tokio::spawn(ch.subscribe().into_stream().collect::<Vec<_>>());
        for i in 0..4 {
            ch.push(i);
        }
        ch.close();
        assert_eq!(a.await.unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(b.await.unwrap(), vec![0, 1, 2, 3]);
    }
}
