use crossbeam::queue::SegQueue;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Notify;

/// Lock-free two-lane ready queue.
///
/// The urgent lane is drained before the normal lane; it carries child procedures of
/// in-flight parents so a parent's subtree finishes ahead of unrelated work.
pub struct ReadyQueue<T> {
    urgent: SegQueue<T>,
    normal: SegQueue<T>,
    size: AtomicUsize,
    notify: Notify,
}

impl<T> Default for ReadyQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ReadyQueue<T> {
    pub fn new() -> Self {
        Self {
            urgent: SegQueue::new(),
            normal: SegQueue::new(),
            size: AtomicUsize::new(0),
            notify: Notify::new(),
        }
    }

    /// Push onto the normal FIFO lane
    pub fn push(&self, item: T) {
        self.size.fetch_add(1, Ordering::AcqRel);
        self.normal.push(item);
        self.notify.notify_one();
    }

    /// Push onto the urgent lane
    pub fn push_urgent(&self, item: T) {
        self.size.fetch_add(1, Ordering::AcqRel);
        self.urgent.push(item);
        self.notify.notify_one();
    }

    /// Pop the next item, urgent lane first
    pub fn pop(&self) -> Option<T> {
        let item = self.urgent.pop().or_else(|| self.normal.pop())?;
        self.size.fetch_sub(1, Ordering::AcqRel);
        Some(item)
    }

    /// Wait until something was pushed since the last wakeup.
    ///
    /// A push that happens before the consumer starts waiting leaves a permit, so a
    /// single consumer never misses a wakeup.
    pub async fn notified(&self) {
        self.notify.notified().await
    }

    /// Wake the consumer without pushing anything
    pub fn kick(&self) {
        self.notify.notify_one();
    }

    /// Returns the current number of items in the queue
    pub fn len(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    /// Checks if the queue is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clears all items from the queue
    pub fn clear(&self) {
        while self.pop().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_basic_operations() {
        let queue = ReadyQueue::new();

        assert!(queue.is_empty());
        assert_eq!(queue.len(), 0);
        assert_eq!(queue.pop(), None);

        queue.push(1);
        queue.push(2);
        queue.push(3);
        assert_eq!(queue.len(), 3);

        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.len(), 1);

        queue.clear();
        assert!(queue.is_empty());
    }

    #[test]
    fn test_urgent_lane_first() {
        let queue = ReadyQueue::new();
        queue.push(1);
        queue.push(2);
        queue.push_urgent(10);
        queue.push_urgent(11);

        assert_eq!(queue.pop(), Some(10));
        assert_eq!(queue.pop(), Some(11));
        assert_eq!(queue.pop(), Some(1));
        queue.push_urgent(12);
        assert_eq!(queue.pop(), Some(12));
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_concurrent_push_pop() {
        let queue = Arc::new(ReadyQueue::new());
        let num_threads = 8;
        let items_per_thread = 100;

        let mut handles = vec![];

        for i in 0..num_threads {
            let queue_clone = Arc::clone(&queue);
            handles.push(thread::spawn(move || {
                for j in 0..items_per_thread {
                    let value = i * items_per_thread + j;
                    if j % 3 == 0 {
                        queue_clone.push_urgent(value);
                    } else {
                        queue_clone.push(value);
                    }
                }
            }));
        }

        for _ in 0..num_threads {
            let queue_clone = Arc::clone(&queue);
            handles.push(thread::spawn(move || {
                let mut count = 0;
                while count < items_per_thread {
                    if queue_clone.pop().is_some() {
                        count += 1;
                    } else {
                        thread::yield_now();
                    }
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert!(queue.is_empty());
        assert_eq!(queue.len(), 0);
    }

    #[tokio::test]
    async fn test_push_before_wait_is_not_lost() {
        let queue = ReadyQueue::new();
        queue.push(7);
        tokio::time::timeout(Duration::from_millis(100), queue.notified())
            .await
            .expect("permit from earlier push");
        assert_eq!(queue.pop(), Some(7));
    }
}
