use ahash::AHashMap;
use std::{
    collections::VecDeque,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};
use tokio::{
    sync::{Mutex, Notify},
    time::Instant,
};

use crate::queue::{EventQueue, QueueError};

/// Process-local queue with the same push/pop semantics as the Redis list.
pub struct InMemoryQueue {
    lists: Mutex<AHashMap<String, VecDeque<String>>>,
    pushed: Notify,
    available: AtomicBool,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self {
            lists: Mutex::new(AHashMap::new()),
            pushed: Notify::new(),
            available: AtomicBool::new(true),
        }
    }

    /// Simulates the broker going away. Every operation fails while unavailable.
    #[cfg(test)]
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), QueueError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(QueueError::Unavailable("connection refused".to_string()))
        }
    }
}

#[async_trait::async_trait]
impl EventQueue for InMemoryQueue {
    async fn push(&self, queue: &str, payload: String) -> Result<(), QueueError> {
        self.check_available()?;
        self.lists
            .lock()
            .await
            .entry(queue.to_string())
            .or_default()
            .push_front(payload);
        self.pushed.notify_waiters();
        Ok(())
    }

    async fn pop(&self, queue: &str, timeout: Duration) -> Result<Option<String>, QueueError> {
        let deadline = Instant::now() + timeout;
        loop {
            // Registered before checking so a push between the check and the wait is not missed.
            let pushed = self.pushed.notified();
            self.check_available()?;
            if let Some(payload) = self
                .lists
                .lock()
                .await
                .get_mut(queue)
                .and_then(VecDeque::pop_back)
            {
                return Ok(Some(payload));
            }
            if tokio::time::timeout_at(deadline, pushed).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn len(&self, queue: &str) -> Result<u64, QueueError> {
        self.check_available()?;
        let lists = self.lists.lock().await;
        Ok(lists.get(queue).map_or(0, |list| list.len() as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = InMemoryQueue::new();
        for payload in ["a", "b", "c"] {
            queue.push("q", payload.to_string()).await.unwrap();
        }
        let mut popped = vec![];
        while let Some(payload) = queue.pop("q", Duration::from_millis(1)).await.unwrap() {
            popped.push(payload);
        }
        assert_eq!(popped, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_pop_times_out_empty() {
        let queue = InMemoryQueue::new();
        let popped = queue.pop("q", Duration::from_millis(20)).await.unwrap();
        assert_eq!(popped, None);
        assert_eq!(queue.len("q").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_blocked_pop_wakes_on_push() {
        let queue = Arc::new(InMemoryQueue::new());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop("q", Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push("q", "late".to_string()).await.unwrap();

        let popped = waiter.await.unwrap().unwrap();
        assert_eq!(popped.as_deref(), Some("late"));
    }

    #[tokio::test]
    async fn test_lists_are_independent() {
        let queue = InMemoryQueue::new();
        queue.push("one", "x".to_string()).await.unwrap();
        assert_eq!(queue.len("one").await.unwrap(), 1);
        assert_eq!(queue.len("two").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unavailable_rejects_push() {
        let queue = InMemoryQueue::new();
        queue.set_available(false);
        assert!(matches!(
            queue.push("q", "x".to_string()).await,
            Err(QueueError::Unavailable(_))
        ));
        queue.set_available(true);
        assert_eq!(queue.len("q").await.unwrap(), 0);
    }
}
