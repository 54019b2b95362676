use std::collections::VecDeque;

use crate::message::QueueMessage;

/// Storage behind one fair-queue flow.
///
/// The fair queue only ever needs the head's size to schedule, so storage
/// may live outside it: the receive side wraps the transport's own per-peer
/// buffers and the send side can pull from the forwarder's service queues.
pub trait FlowQueue {
    type Item: QueueMessage;

    /// Size of the head message, `None` when empty.
    fn head_size(&self) -> Option<usize>;

    fn pop(&mut self) -> Option<Self::Item>;

    /// Put a message back at the head after the next stage refused it.
    fn restore(&mut self, item: Self::Item);

    fn len(&self) -> usize;

    fn queued_bytes(&self) -> usize;

    /// Byte capacity, `None` when the bound is owned elsewhere.
    fn capacity_bytes(&self) -> Option<usize>;

    fn is_empty(&self) -> bool {
        self.head_size().is_none()
    }
}

/// Flow storage that accepts pushes directly.
pub trait PushQueue: FlowQueue {
    /// Exactly predicts whether `push` of a message of `size` bytes succeeds.
    fn can_push(&self, size: usize) -> bool;

    fn push(&mut self, item: Self::Item) -> Result<(), Self::Item>;
}

/// Byte-bounded FIFO owned by the fair queue.
#[derive(Debug)]
pub struct BoundedQueue<M> {
    items: VecDeque<M>,
    bytes: usize,
    capacity_bytes: usize,
}

impl<M: QueueMessage> BoundedQueue<M> {
    pub fn new(capacity_bytes: usize) -> Self {
        Self {
            items: VecDeque::new(),
            bytes: 0,
            capacity_bytes,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &M> {
        self.items.iter()
    }

    /// Keep only the messages matching `keep`, returning how many were dropped.
    pub fn retain(&mut self, mut keep: impl FnMut(&M) -> bool) -> usize {
        let before = self.items.len();
        let mut bytes = 0;
        self.items.retain(|item| {
            let kept = keep(item);
            if kept {
                bytes += item.size();
            }
            kept
        });
        self.bytes = bytes;
        before - self.items.len()
    }
}

impl<M: QueueMessage> FlowQueue for BoundedQueue<M> {
    type Item = M;

    fn head_size(&self) -> Option<usize> {
        self.items.front().map(QueueMessage::size)
    }

    fn pop(&mut self) -> Option<M> {
        let item = self.items.pop_front()?;
        self.bytes -= item.size();
        Some(item)
    }

    fn restore(&mut self, item: M) {
        // Restored items already held their space, so the bound is not rechecked.
        self.bytes += item.size();
        self.items.push_front(item);
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    fn queued_bytes(&self) -> usize {
        self.bytes
    }

    fn capacity_bytes(&self) -> Option<usize> {
        Some(self.capacity_bytes)
    }
}

impl<M: QueueMessage> PushQueue for BoundedQueue<M> {
    fn can_push(&self, size: usize) -> bool {
        self.bytes
            .checked_add(size)
            .is_some_and(|total| total <= self.capacity_bytes)
    }

    fn push(&mut self, item: M) -> Result<(), M> {
        if !self.can_push(item.size()) {
            return Err(item);
        }
        self.bytes += item.size();
        self.items.push_back(item);
        Ok(())
    }
}
