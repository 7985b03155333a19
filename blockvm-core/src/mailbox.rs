use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::error::SendError;
use crate::types::Message;

/// Multi-producer, single-consumer message queue attached to a block.
///
/// Any thread may push; only the worker currently executing the owning
/// block pops. The queue is FIFO, so messages from one sender to one
/// receiver arrive in send order. No ordering is promised across senders.
pub struct Mailbox {
    queue: Mutex<VecDeque<Message>>,
    len: AtomicUsize,
}

impl Mailbox {
    pub fn new() -> Mailbox {
        Mailbox {
            queue: Mutex::new(VecDeque::new()),
            len: AtomicUsize::new(0),
        }
    }

    /// Enqueue a message, failing fast when `capacity` is reached.
    /// A capacity of zero means unbounded.
    pub fn push(&self, msg: Message, capacity: usize) -> Result<(), SendError> {
        let mut q = self.queue.lock();
        if capacity > 0 && q.len() >= capacity {
            return Err(SendError::MailboxFull);
        }
        q.push_back(msg);
        self.len.store(q.len(), Ordering::Release);
        Ok(())
    }

    /// Enqueue a system notification (exit/down/upgrade). These bypass the
    /// capacity bound; dropping them would break link and monitor
    /// delivery guarantees.
    pub fn push_system(&self, msg: Message) {
        let mut q = self.queue.lock();
        q.push_back(msg);
        self.len.store(q.len(), Ordering::Release);
    }

    /// Dequeue the oldest message. Called only by the owning worker.
    pub fn pop(&self) -> Option<Message> {
        let mut q = self.queue.lock();
        let msg = q.pop_front();
        self.len.store(q.len(), Ordering::Release);
        msg
    }

    /// Selective receive: remove and return the first message matching
    /// `pred`, leaving the rest in arrival order.
    pub fn peek_match<F>(&self, pred: F) -> Option<Message>
    where
        F: Fn(&Message) -> bool,
    {
        let mut q = self.queue.lock();
        let idx = q.iter().position(&pred)?;
        let msg = q.remove(idx);
        self.len.store(q.len(), Ordering::Release);
        msg
    }

    /// Best-effort length without taking the lock.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove everything, returning the drained messages. Used when the
    /// owning block dies.
    pub fn drain(&self) -> Vec<Message> {
        let mut q = self.queue.lock();
        self.len.store(0, Ordering::Release);
        q.drain(..).collect()
    }
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}
