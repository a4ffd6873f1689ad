//! Bounded hand-off queue between pipeline threads
//!
//! One producer thread pushes, one consumer thread pops. The consumer's
//! blocking `pop` is the only suspension point of a stage, so `interrupt`
//! and `close` both wake it: `interrupt` for terminate paths, `close` for
//! end of stream.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use thiserror::Error;

use super::frame::Frame;

/// Why a `pop` returned without an item
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    #[error("timed out waiting for frame")]
    Timeout,
    #[error("queue closed")]
    Closed,
    #[error("wait interrupted")]
    Interrupted,
}

/// Why a push was refused; the item is handed back
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PushError<T> {
    #[error("queue full")]
    Full(T),
    #[error("queue closed")]
    Closed(T),
}

impl<T> PushError<T> {
    pub fn into_inner(self) -> T {
        match self {
            PushError::Full(item) | PushError::Closed(item) => item,
        }
    }
}

struct State<T> {
    items: VecDeque<T>,
    closed: bool,
    interrupted: bool,
}

/// Bounded single-producer/single-consumer queue
pub struct FrameQueue<T = Frame> {
    state: Mutex<State<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl<T> FrameQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(State {
                items: VecDeque::with_capacity(capacity),
                closed: false,
                interrupted: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Push, blocking while the queue is full
    pub fn push(&self, item: T) -> Result<(), PushError<T>> {
        let mut state = self.state.lock();
        while state.items.len() >= self.capacity && !state.closed {
            self.not_full.wait(&mut state);
        }
        if state.closed {
            return Err(PushError::Closed(item));
        }
        state.items.push_back(item);
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Push without blocking
    pub fn try_push(&self, item: T) -> Result<(), PushError<T>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(PushError::Closed(item));
        }
        if state.items.len() >= self.capacity {
            return Err(PushError::Full(item));
        }
        state.items.push_back(item);
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Push, evicting the oldest item when full. Returns the evicted item.
    ///
    /// Used where only the latest value matters (image sources).
    pub fn push_latest(&self, item: T) -> Result<Option<T>, PushError<T>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(PushError::Closed(item));
        }
        let evicted = if state.items.len() >= self.capacity {
            state.items.pop_front()
        } else {
            None
        };
        state.items.push_back(item);
        drop(state);
        self.not_empty.notify_one();
        Ok(evicted)
    }

    /// Pop, blocking until an item arrives, the timeout elapses, the queue
    /// is closed and drained, or the wait is interrupted.
    ///
    /// `None` waits forever.
    pub fn pop(&self, timeout: Option<Duration>) -> Result<T, QueueError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        loop {
            if state.interrupted {
                state.interrupted = false;
                return Err(QueueError::Interrupted);
            }
            if let Some(item) = state.items.pop_front() {
                drop(state);
                self.not_full.notify_one();
                return Ok(item);
            }
            if state.closed {
                return Err(QueueError::Closed);
            }
            match deadline {
                Some(deadline) => {
                    if self.not_empty.wait_until(&mut state, deadline).timed_out()
                        && state.items.is_empty()
                        && !state.interrupted
                        && !state.closed
                    {
                        return Err(QueueError::Timeout);
                    }
                }
                None => self.not_empty.wait(&mut state),
            }
        }
    }

    /// Pop without blocking
    pub fn try_pop(&self) -> Option<T> {
        let item = self.state.lock().items.pop_front();
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Wake the consumer; its current (or next) `pop` returns `Interrupted`
    pub fn interrupt(&self) {
        self.state.lock().interrupted = true;
        self.not_empty.notify_all();
    }

    /// Refuse further pushes; the consumer drains what is left, then sees `Closed`
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }
}
