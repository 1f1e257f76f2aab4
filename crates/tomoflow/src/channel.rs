/// Channel - bounded buffer pool between one producer and its consumers
///
/// The producer takes free buffers, fills them and finalizes them into the
/// ready queue. Consumers pop ready buffers in FIFO order and release them
/// back to the free set. At most `pool_size` buffers exist per channel, so
/// a producer that outruns its consumers blocks until one is released.

use crate::buffer::Buffer;
use crate::error::{EngineError, Result};
use crate::types::Requisition;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

struct State {
    requisition: Option<Requisition>,
    /// Buffers created so far (never exceeds the pool size)
    allocated: usize,
    free: Vec<Buffer>,
    ready: VecDeque<Buffer>,
    finished: bool,
    /// Consumers still popping from this channel
    consumers: usize,
}

struct ChannelInner {
    name: String,
    pool_size: usize,
    state: Mutex<State>,
    free_cv: Condvar,
    ready_cv: Condvar,
}

/// Shared handle to a channel; clones refer to the same pool
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    pub fn new(name: impl Into<String>, pool_size: usize) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                name: name.into(),
                pool_size: pool_size.max(1),
                state: Mutex::new(State {
                    requisition: None,
                    allocated: 0,
                    free: Vec::new(),
                    ready: VecDeque::new(),
                    finished: false,
                    consumers: 0,
                }),
                free_cv: Condvar::new(),
                ready_cv: Condvar::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn pool_size(&self) -> usize {
        self.inner.pool_size
    }

    /// Shape the pool was allocated for
    pub fn requisition(&self) -> Option<Requisition> {
        self.inner.state.lock().requisition.clone()
    }

    /// Fix the shape of the pool
    ///
    /// Repeating the same shape is a no-op; a different shape is an error.
    /// Buffers are created lazily by `get_output_buffer`.
    pub fn allocate_output_buffers(&self, requisition: &Requisition) -> Result<()> {
        let mut state = self.inner.state.lock();
        match &state.requisition {
            Some(existing) if existing == requisition => Ok(()),
            Some(existing) => Err(EngineError::AlreadyAllocated {
                existing: existing.clone(),
                requested: requisition.clone(),
            }),
            None => {
                log::debug!(
                    "Channel {}: pool of {} x {}",
                    self.inner.name,
                    self.inner.pool_size,
                    requisition
                );
                state.requisition = Some(requisition.clone());
                Ok(())
            }
        }
    }

    /// Take a free buffer, blocking while every buffer is in flight
    pub fn get_output_buffer(&self) -> Result<Buffer> {
        let mut state = self.inner.state.lock();
        let requisition = state.requisition.clone().ok_or_else(|| {
            EngineError::ResourceUnavailable(format!(
                "channel {} has no allocated buffers",
                self.inner.name
            ))
        })?;

        loop {
            if let Some(buffer) = state.free.pop() {
                return Ok(buffer);
            }
            if state.allocated < self.inner.pool_size {
                state.allocated += 1;
                return Ok(Buffer::new(&requisition));
            }
            self.inner.free_cv.wait(&mut state);
        }
    }

    /// Publish a filled buffer to consumers
    pub fn finalize_output_buffer(&self, buffer: Buffer) {
        let mut state = self.inner.state.lock();
        state.ready.push_back(buffer);
        drop(state);
        self.inner.ready_cv.notify_one();
    }

    /// Return an output buffer to the free set without publishing it
    pub fn discard_output_buffer(&self, buffer: Buffer) {
        self.release_input_buffer(buffer);
    }

    /// Next ready buffer in FIFO order
    ///
    /// Blocks until one is ready; `None` once the channel is finished and
    /// the ready queue is empty.
    pub fn pop_input_buffer(&self) -> Option<Buffer> {
        let mut state = self.inner.state.lock();
        loop {
            if let Some(buffer) = state.ready.pop_front() {
                return Some(buffer);
            }
            if state.finished {
                return None;
            }
            self.inner.ready_cv.wait(&mut state);
        }
    }

    /// Hand a consumed buffer back to the producer's free set
    pub fn release_input_buffer(&self, buffer: Buffer) {
        let mut state = self.inner.state.lock();
        state.free.push(buffer);
        drop(state);
        self.inner.free_cv.notify_one();
    }

    /// Signal that no more buffers will be produced. Idempotent.
    pub fn finish(&self) {
        let mut state = self.inner.state.lock();
        if !state.finished {
            state.finished = true;
            log::debug!("Channel {}: finished", self.inner.name);
        }
        drop(state);
        self.inner.ready_cv.notify_all();
    }

    /// Release every ready buffer without consuming it
    ///
    /// Waits up to `timeout` for the producer when nothing is ready.
    /// Returns true once the channel is finished and empty.
    pub fn drain_for(&self, timeout: Duration) -> bool {
        let mut state = self.inner.state.lock();
        if state.ready.is_empty() && !state.finished {
            self.inner.ready_cv.wait_for(&mut state, timeout);
        }

        let drained = state.ready.len();
        while let Some(buffer) = state.ready.pop_front() {
            state.free.push(buffer);
        }
        let done = state.finished;
        drop(state);

        if drained > 0 {
            log::trace!("Channel {}: discarded {} buffer(s)", self.inner.name, drained);
            self.inner.free_cv.notify_all();
        }
        done
    }

    /// Register a task that will pop from this channel
    pub fn attach_consumer(&self) {
        self.inner.state.lock().consumers += 1;
    }

    /// Unregister a consumer that stopped popping
    ///
    /// Returns true if no consumer is left, in which case the caller owns
    /// draining the channel. While other consumers remain, ready buffers
    /// stay queued for them.
    pub fn detach_consumer(&self) -> bool {
        let mut state = self.inner.state.lock();
        state.consumers = state.consumers.saturating_sub(1);
        let last = state.consumers == 0;
        if !last {
            log::debug!(
                "Channel {}: consumer detached, {} still attached",
                self.inner.name,
                state.consumers
            );
        }
        last
    }

    pub fn consumers(&self) -> usize {
        self.inner.state.lock().consumers
    }

    pub fn is_finished(&self) -> bool {
        self.inner.state.lock().finished
    }

    /// Buffers currently outside the free set
    pub fn in_flight(&self) -> usize {
        let state = self.inner.state.lock();
        state.allocated - state.free.len()
    }

    pub fn ready_len(&self) -> usize {
        self.inner.state.lock().ready.len()
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Channel")
            .field("name", &self.inner.name)
            .field("pool_size", &self.inner.pool_size)
            .field("allocated", &state.allocated)
            .field("ready", &state.ready.len())
            .field("finished", &state.finished)
            .field("consumers", &state.consumers)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn channel(pool: usize) -> Channel {
        let channel = Channel::new("test", pool);
        channel
            .allocate_output_buffers(&Requisition::new(&[2]))
            .unwrap();
        channel
    }

    #[test]
    fn unallocated_pool_is_an_error() {
        let channel = Channel::new("raw", 2);
        assert!(matches!(
            channel.get_output_buffer(),
            Err(EngineError::ResourceUnavailable(_))
        ));
    }

    #[test]
    fn reallocation_with_other_shape_fails() {
        let channel = channel(2);
        assert!(channel
            .allocate_output_buffers(&Requisition::new(&[2]))
            .is_ok());
        assert!(matches!(
            channel.allocate_output_buffers(&Requisition::new(&[3])),
            Err(EngineError::AlreadyAllocated { .. })
        ));
    }

    #[test]
    fn fifo_order_single_consumer() {
        let channel = channel(4);
        for i in 0..3 {
            let mut buffer = channel.get_output_buffer().unwrap();
            buffer.host_view().unwrap()[0] = i as f32;
            channel.finalize_output_buffer(buffer);
        }
        channel.finish();

        let mut seen = Vec::new();
        while let Some(mut buffer) = channel.pop_input_buffer() {
            seen.push(buffer.host_view().unwrap()[0]);
            channel.release_input_buffer(buffer);
        }
        assert_eq!(seen, vec![0.0, 1.0, 2.0]);
    }

    #[test]
    fn finish_is_idempotent() {
        let channel = channel(1);
        channel.finish();
        channel.finish();
        assert!(channel.is_finished());
        assert!(channel.pop_input_buffer().is_none());
    }

    #[test]
    fn finish_drains_ready_buffers_first() {
        let channel = channel(2);
        let buffer = channel.get_output_buffer().unwrap();
        channel.finalize_output_buffer(buffer);
        channel.finish();
        assert!(channel.pop_input_buffer().is_some());
        assert!(channel.pop_input_buffer().is_none());
    }

    #[test]
    fn finish_wakes_blocked_consumer() {
        let channel = channel(1);
        let consumer = {
            let channel = channel.clone();
            thread::spawn(move || channel.pop_input_buffer().is_none())
        };
        thread::sleep(Duration::from_millis(20));
        channel.finish();
        assert!(consumer.join().unwrap());
    }

    #[test]
    fn producer_blocks_when_pool_exhausted() {
        let channel = channel(2);
        let a = channel.get_output_buffer().unwrap();
        let b = channel.get_output_buffer().unwrap();
        channel.finalize_output_buffer(a);
        channel.finalize_output_buffer(b);
        assert_eq!(channel.in_flight(), 2);

        let got_third = Arc::new(AtomicUsize::new(0));
        let producer = {
            let channel = channel.clone();
            let got_third = Arc::clone(&got_third);
            thread::spawn(move || {
                let buffer = channel.get_output_buffer().unwrap();
                got_third.store(1, Ordering::SeqCst);
                channel.finalize_output_buffer(buffer);
            })
        };

        thread::sleep(Duration::from_millis(20));
        assert_eq!(got_third.load(Ordering::SeqCst), 0);

        let first = channel.pop_input_buffer().unwrap();
        channel.release_input_buffer(first);
        producer.join().unwrap();
        assert_eq!(got_third.load(Ordering::SeqCst), 1);
        assert!(channel.in_flight() <= channel.pool_size());
    }

    #[test]
    fn in_flight_never_exceeds_pool() {
        let channel = channel(3);
        let max_seen = Arc::new(AtomicUsize::new(0));

        let producer = {
            let channel = channel.clone();
            let max_seen = Arc::clone(&max_seen);
            thread::spawn(move || {
                for _ in 0..100 {
                    let buffer = channel.get_output_buffer().unwrap();
                    max_seen.fetch_max(channel.in_flight(), Ordering::SeqCst);
                    channel.finalize_output_buffer(buffer);
                }
                channel.finish();
            })
        };

        let mut count = 0;
        while let Some(buffer) = channel.pop_input_buffer() {
            count += 1;
            channel.release_input_buffer(buffer);
        }
        producer.join().unwrap();

        assert_eq!(count, 100);
        assert!(max_seen.load(Ordering::SeqCst) <= 3);
    }

    #[test]
    fn drain_releases_ready_buffers() {
        let channel = channel(2);
        let a = channel.get_output_buffer().unwrap();
        channel.finalize_output_buffer(a);

        assert!(!channel.drain_for(Duration::from_millis(1)));
        assert_eq!(channel.in_flight(), 0);

        channel.finish();
        assert!(channel.drain_for(Duration::from_millis(1)));
    }

    #[test]
    fn discarded_buffers_return_to_pool() {
        let channel = channel(1);
        let buffer = channel.get_output_buffer().unwrap();
        channel.discard_output_buffer(buffer);
        assert_eq!(channel.in_flight(), 0);
        assert_eq!(channel.ready_len(), 0);
        assert!(channel.get_output_buffer().is_ok());
    }

    #[test]
    fn only_the_last_consumer_owns_draining() {
        let channel = channel(2);
        channel.attach_consumer();
        channel.attach_consumer();
        assert_eq!(channel.consumers(), 2);

        let buffer = channel.get_output_buffer().unwrap();
        channel.finalize_output_buffer(buffer);

        assert!(!channel.detach_consumer());
        assert_eq!(channel.ready_len(), 1);
        assert!(channel.pop_input_buffer().is_some());

        assert!(channel.detach_consumer());
        assert_eq!(channel.consumers(), 0);
    }
}
