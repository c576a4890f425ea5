//! Bounded memory for record batches.
//!
//! The pool hands out [`BytesMut`] blocks against a fixed memory ceiling.
//! Blocks of exactly the poolable size (the configured batch size) are kept
//! on a free list and reused; any other size is allocated fresh and only
//! tracked by count. When the ceiling is reached, callers queue up and are
//! served strictly first-come first-served: the waiter at the head of the
//! queue gathers memory as it is freed until it has enough.

use crate::{Error, Result};
use bytes::BytesMut;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

struct PoolState {
    free: VecDeque<BytesMut>,
    /// Memory not on the free list and not handed out.
    non_pooled_available: usize,
    waiters: VecDeque<Arc<Notify>>,
    /// Signalled whenever a caller starts waiting for memory.
    on_wait: Option<Arc<Notify>>,
    closed: bool,
}

impl PoolState {
    /// Moves free-list blocks into non-pooled memory until `size` is
    /// covered or the free list is empty.
    fn free_up(&mut self, size: usize, poolable_size: usize) {
        while self.non_pooled_available < size && self.free.pop_back().is_some() {
            self.non_pooled_available += poolable_size;
        }
    }

    fn has_available(&self) -> bool {
        self.non_pooled_available > 0 || !self.free.is_empty()
    }

    fn remove_waiter(&mut self, waiter: &Arc<Notify>) {
        if let Some(pos) = self.waiters.iter().position(|w| Arc::ptr_eq(w, waiter)) {
            self.waiters.remove(pos);
        }
    }

    fn signal_head(&self) {
        if let Some(head) = self.waiters.front() {
            head.notify_one();
        }
    }
}

pub struct BufferPool {
    total_memory: usize,
    poolable_size: usize,
    state: Mutex<PoolState>,
}

/// A queued allocation. Gives back partially gathered memory and wakes the
/// next waiter if the allocation is abandoned.
struct Waiter<'a> {
    pool: &'a BufferPool,
    notify: Arc<Notify>,
    accumulated: usize,
    finished: bool,
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let mut state = self.pool.lock();
        state.non_pooled_available += self.accumulated;
        state.remove_waiter(&self.notify);
        if state.has_available() {
            state.signal_head();
        }
    }
}

impl BufferPool {
    pub fn new(total_memory: usize, poolable_size: usize) -> Self {
        Self {
            total_memory,
            poolable_size,
            state: Mutex::new(PoolState {
                free: VecDeque::new(),
                non_pooled_available: total_memory,
                waiters: VecDeque::new(),
                on_wait: None,
                closed: false,
            }),
        }
    }

    /// Registers `notify` to be signalled each time an allocation has to
    /// wait, so that whoever frees memory can react immediately.
    pub fn notify_on_wait(&self, notify: Arc<Notify>) {
        self.lock().on_wait = Some(notify);
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Allocates a block of `size` bytes, waiting up to `max_wait` for memory
    /// to be freed.
    ///
    /// # Errors
    ///
    /// - [`Error::RecordTooLarge`] if `size` exceeds the pool's total memory
    /// - [`Error::Timeout`] if not enough memory was freed within `max_wait`
    /// - [`Error::Closed`] if the pool was closed before or during the wait
    pub async fn allocate(&self, size: usize, max_wait: Duration) -> Result<BytesMut> {
        if size > self.total_memory {
            return Err(Error::RecordTooLarge {
                message: format!(
                    "Attempt to allocate {} bytes, but there is a hard limit of {} on memory allocations.",
                    size, self.total_memory
                ),
            });
        }

        let notify = {
            let mut state = self.lock();
            if state.closed {
                return Err(Error::closed("Producer closed while allocating memory"));
            }

            if state.waiters.is_empty() {
                if size == self.poolable_size {
                    if let Some(block) = state.free.pop_front() {
                        return Ok(block);
                    }
                }
                let free_list_size = state.free.len() * self.poolable_size;
                if state.non_pooled_available + free_list_size >= size {
                    state.free_up(size, self.poolable_size);
                    state.non_pooled_available -= size;
                    return Ok(BytesMut::with_capacity(size));
                }
            }

            let notify = Arc::new(Notify::new());
            state.waiters.push_back(Arc::clone(&notify));
            // An empty queue means memory may already be free for the head.
            if state.waiters.len() == 1 && state.has_available() {
                notify.notify_one();
            }
            if let Some(on_wait) = &state.on_wait {
                on_wait.notify_one();
            }
            notify
        };

        trace!(size, "Waiting for buffer memory");
        let deadline = Instant::now() + max_wait;
        let mut waiter = Waiter {
            pool: self,
            notify,
            accumulated: 0,
            finished: false,
        };

        loop {
            let timed_out = tokio::time::timeout_at(deadline, waiter.notify.notified())
                .await
                .is_err();

            let mut state = self.lock();
            if state.closed {
                return Err(Error::closed("Producer closed while allocating memory"));
            }

            let is_head = state
                .waiters
                .front()
                .is_some_and(|head| Arc::ptr_eq(head, &waiter.notify));
            if is_head {
                if waiter.accumulated == 0 && size == self.poolable_size {
                    if let Some(block) = state.free.pop_front() {
                        waiter.finished = true;
                        state.remove_waiter(&waiter.notify);
                        if state.has_available() {
                            state.signal_head();
                        }
                        return Ok(block);
                    }
                }

                state.free_up(size - waiter.accumulated, self.poolable_size);
                let got = (size - waiter.accumulated).min(state.non_pooled_available);
                state.non_pooled_available -= got;
                waiter.accumulated += got;

                if waiter.accumulated == size {
                    waiter.finished = true;
                    state.remove_waiter(&waiter.notify);
                    if state.has_available() {
                        state.signal_head();
                    }
                    return Ok(BytesMut::with_capacity(size));
                }
            }

            if timed_out {
                debug!(
                    size,
                    accumulated = waiter.accumulated,
                    "Buffer allocation timed out"
                );
                return Err(Error::timeout(format!(
                    "Failed to allocate memory within the configured max blocking time {} ms.",
                    max_wait.as_millis()
                )));
            }
        }
    }

    /// Returns a block to the pool and wakes the oldest waiter.
    ///
    /// `size` is the size the block was allocated with. Blocks of the
    /// poolable size go back on the free list.
    pub fn deallocate(&self, mut block: BytesMut, size: usize) {
        let mut state = self.lock();
        if size == self.poolable_size && block.capacity() >= self.poolable_size {
            block.clear();
            state.free.push_back(block);
        } else {
            state.non_pooled_available += size;
        }
        state.signal_head();
    }

    /// Memory that can be allocated without waiting.
    pub fn available_memory(&self) -> usize {
        let state = self.lock();
        state.non_pooled_available + state.free.len() * self.poolable_size
    }

    /// Memory that is neither handed out nor on the free list.
    pub fn unallocated_memory(&self) -> usize {
        self.lock().non_pooled_available
    }

    /// Number of callers waiting for memory.
    pub fn queued(&self) -> usize {
        self.lock().waiters.len()
    }

    pub fn poolable_size(&self) -> usize {
        self.poolable_size
    }

    pub fn total_memory(&self) -> usize {
        self.total_memory
    }

    /// Fails current and future allocations with a closed error.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        for waiter in state.waiters.iter() {
            waiter.notify_one();
        }
    }
}
