//! Prompts waiting for the channel to connect.

use std::collections::VecDeque;

/// A user message not yet handed to a connected channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingPrompt {
    pub text: String,
    pub attachments: Vec<String>,
}

/// Bounded FIFO of pending prompts. Each prompt leaves the queue exactly once.
#[derive(Debug)]
pub struct PendingQueue {
    items: VecDeque<PendingPrompt>,
    capacity: usize,
}

impl PendingQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a prompt; hands it back when the queue is full.
    pub fn push(&mut self, prompt: PendingPrompt) -> Result<(), PendingPrompt> {
        if self.items.len() >= self.capacity {
            return Err(prompt);
        }
        self.items.push_back(prompt);
        Ok(())
    }

    /// Take every queued prompt, oldest first.
    pub fn drain(&mut self) -> Vec<PendingPrompt> {
        self.items.drain(..).collect()
    }

    /// Put prompts back at the front, keeping their order (used when a flush is interrupted).
    pub fn requeue_front(&mut self, prompts: Vec<PendingPrompt>) {
        for p in prompts.into_iter().rev() {
            self.items.push_front(p);
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
