//! Local FIFO of fetched messages awaiting delivery.

use crate::message::ReceivedMessage;
use std::collections::VecDeque;

/// Ordered buffer of decoded messages, refilled from the backend only when empty
///
/// Not synchronized; callers hold the transport gate.
#[derive(Debug, Default)]
pub struct ReceiveBuffer {
    messages: VecDeque<ReceivedMessage>,
}

impl ReceiveBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append messages in the order given
    pub fn extend<I>(&mut self, messages: I)
    where
        I: IntoIterator<Item = ReceivedMessage>,
    {
        self.messages.extend(messages);
    }

    pub fn pop_front(&mut self) -> Option<ReceivedMessage> {
        self.messages.pop_front()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }
}

#[cfg(test)]
#[path = "buffer_tests.rs"]
mod tests;
