//! Lightweight RPC channels
//!
//! A channel carries fixed-size `{cmd, payload}` words through a bounded
//! lock-free ring. Each side is a distinct non-`Clone` handle, so a channel
//! has exactly one producer and one consumer. Both operations are
//! non-blocking.

use std::sync::Arc;

use crossbeam_queue::ArrayQueue;
use thiserror::Error;

/// Wire format of one channel message
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LrpcMsg {
    pub cmd: u64,
    pub payload: u64,
}

#[derive(Debug, Error)]
pub enum LrpcError {
    #[error("channel capacity {0} is not a non-zero power of two")]
    InvalidCapacity(usize),
}

/// Create a channel holding up to `capacity` messages.
pub fn channel(capacity: usize) -> Result<(LrpcSender, LrpcReceiver), LrpcError> {
    if !capacity.is_power_of_two() {
        return Err(LrpcError::InvalidCapacity(capacity));
    }
    let ring = Arc::new(ArrayQueue::new(capacity));
    Ok((
        LrpcSender {
            ring: Arc::clone(&ring),
        },
        LrpcReceiver { ring },
    ))
}

/// Producer half of a channel
pub struct LrpcSender {
    ring: Arc<ArrayQueue<LrpcMsg>>,
}

impl LrpcSender {
    /// Enqueue a message. Returns `false` when the ring is full.
    #[inline]
    pub fn send(&self, cmd: u64, payload: u64) -> bool {
        self.ring.push(LrpcMsg { cmd, payload }).is_ok()
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.ring.is_full()
    }
}

/// Consumer half of a channel
pub struct LrpcReceiver {
    ring: Arc<ArrayQueue<LrpcMsg>>,
}

impl LrpcReceiver {
    /// Dequeue the oldest message, if any.
    #[inline]
    pub fn recv(&self) -> Option<LrpcMsg> {
        self.ring.pop()
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}
