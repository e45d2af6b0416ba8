// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Bounded pool of decode-target slots shared between the decode engine and the consumer.
//!
//! Each slot cycles through `Free → Reserved → Ready → Free`. The engine reserves a slot before
//! decoding into it and publishes it once the picture is ready for display. The consumer takes
//! ready slots in publish order and releases them once it is done reading.
//!
//! All state lives behind a single mutex. Blocked parties wait on condition variables and are
//! woken either by the state change they are waiting for, or by [`FrameQueue::mark_ended`].

use std::collections::VecDeque;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use thiserror::Error;

use crate::Resolution;

/// Number of slots used when the stream does not ask for a specific amount.
pub const DEFAULT_CAPACITY: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Available for the engine to decode into.
    Free,
    /// The engine is decoding into this slot.
    Reserved,
    /// Decoding is complete and the picture can be displayed.
    Ready,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameQueueError {
    #[error("cannot allocate a frame queue with {0} slots")]
    Allocation(usize),
    #[error("slot {index} is out of range (capacity {capacity})")]
    InvalidIndex { index: usize, capacity: usize },
    #[error("slot {index} is {state:?}, expected {expected:?}")]
    InvalidState {
        index: usize,
        state: SlotState,
        expected: SlotState,
    },
    #[error("the stream has ended, no slot can be reserved")]
    StreamEnded,
    #[error("end of stream reached")]
    EndOfStream,
}

/// Interlacing information attached to a displayed picture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldInfo {
    pub progressive_frame: bool,
    pub top_field_first: bool,
    /// Number of additional fields to display, as signaled by the stream.
    pub repeat_first_field: i32,
}

impl Default for FieldInfo {
    fn default() -> Self {
        Self {
            progressive_frame: true,
            top_field_first: false,
            repeat_first_field: 0,
        }
    }
}

/// Opaque reference to the surface backing a slot.
///
/// The generation is bumped every time the slot is reserved, so a handle from a previous cycle
/// never compares equal to the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceHandle {
    pub index: usize,
    pub generation: u64,
}

/// A decoded picture handed to the consumer by [`FrameQueue::take_ready`].
///
/// The surface stays valid until the slot is given back with [`FrameQueue::release`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyFrame {
    pub surface: SurfaceHandle,
    /// Timestamp in the engine's native time base, if the packet carried one.
    pub timestamp: Option<i64>,
    pub field: FieldInfo,
    pub resolution: Resolution,
    /// Position of this frame in publish order, starting at 0.
    pub sequence: u64,
}

impl ReadyFrame {
    pub fn index(&self) -> usize {
        self.surface.index
    }
}

#[derive(Debug)]
struct Slot {
    state: SlotState,
    generation: u64,
    timestamp: Option<i64>,
    field: FieldInfo,
    sequence: u64,
}

impl Slot {
    fn new() -> Self {
        Self {
            state: SlotState::Free,
            generation: 0,
            timestamp: None,
            field: Default::default(),
            sequence: 0,
        }
    }
}

#[derive(Debug)]
struct Inner {
    slots: Vec<Slot>,
    /// Indices of the published slots, oldest first.
    ready: VecDeque<usize>,
    available: usize,
    ended: bool,
    published: u64,
}

#[derive(Debug)]
pub struct FrameQueue {
    inner: Mutex<Inner>,
    /// Signaled whenever a slot goes back to `Free`.
    slot_freed: Condvar,
    /// Signaled whenever a slot becomes `Ready`.
    frame_ready: Condvar,
    capacity: usize,
    resolution: Resolution,
}

impl FrameQueue {
    /// Creates a queue of `capacity` free slots for pictures of `resolution`.
    pub fn new(capacity: usize, resolution: Resolution) -> Result<Self, FrameQueueError> {
        if capacity == 0 {
            return Err(FrameQueueError::Allocation(capacity));
        }

        let mut slots = Vec::new();
        slots
            .try_reserve_exact(capacity)
            .map_err(|_| FrameQueueError::Allocation(capacity))?;
        slots.extend((0..capacity).map(|_| Slot::new()));

        let mut ready = VecDeque::new();
        ready
            .try_reserve_exact(capacity)
            .map_err(|_| FrameQueueError::Allocation(capacity))?;

        log::debug!("created frame queue with {capacity} slots of {resolution}");

        Ok(Self {
            inner: Mutex::new(Inner {
                slots,
                ready,
                available: capacity,
                ended: false,
                published: 0,
            }),
            slot_freed: Condvar::new(),
            frame_ready: Condvar::new(),
            capacity,
            resolution,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // The state is consistent at every point where a guard can be dropped, so a panic in
        // another holder does not invalidate it.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_index(&self, index: usize) -> Result<(), FrameQueueError> {
        if index >= self.capacity {
            return Err(FrameQueueError::InvalidIndex {
                index,
                capacity: self.capacity,
            });
        }

        Ok(())
    }

    /// Waits until slot `index` is free and reserves it for decoding.
    ///
    /// Only callers interested in `index` are blocked; every other operation on the queue can
    /// proceed while waiting. Returns [`FrameQueueError::StreamEnded`] immediately if the queue
    /// has ended, or as soon as it ends while waiting.
    pub fn reserve(&self, index: usize) -> Result<SurfaceHandle, FrameQueueError> {
        self.check_index(index)?;

        let mut inner = self.lock();
        loop {
            if inner.ended {
                return Err(FrameQueueError::StreamEnded);
            }
            if inner.slots[index].state == SlotState::Free {
                break;
            }
            log::trace!("slot {index} is {:?}, waiting", inner.slots[index].state);
            inner = self
                .slot_freed
                .wait(inner)
                .unwrap_or_else(PoisonError::into_inner);
        }

        inner.available -= 1;
        let slot = &mut inner.slots[index];
        slot.state = SlotState::Reserved;
        slot.generation += 1;
        slot.timestamp = None;
        slot.field = Default::default();

        Ok(SurfaceHandle {
            index,
            generation: slot.generation,
        })
    }

    /// Marks the reserved slot `index` as ready for display and wakes up consumers.
    ///
    /// Publishing is still allowed after the queue has ended, so pictures decoded before the end
    /// of stream are not lost.
    pub fn publish(
        &self,
        index: usize,
        timestamp: Option<i64>,
        field: FieldInfo,
    ) -> Result<(), FrameQueueError> {
        self.check_index(index)?;

        let mut inner = self.lock();
        let sequence = inner.published;
        let slot = &mut inner.slots[index];
        if slot.state != SlotState::Reserved {
            return Err(FrameQueueError::InvalidState {
                index,
                state: slot.state,
                expected: SlotState::Reserved,
            });
        }

        slot.state = SlotState::Ready;
        slot.timestamp = timestamp;
        slot.field = field;
        slot.sequence = sequence;
        inner.published += 1;
        inner.ready.push_back(index);
        drop(inner);

        self.frame_ready.notify_one();
        Ok(())
    }

    fn pop_ready(&self, inner: &mut Inner) -> Option<ReadyFrame> {
        let index = inner.ready.pop_front()?;
        let slot = &inner.slots[index];

        Some(ReadyFrame {
            surface: SurfaceHandle {
                index,
                generation: slot.generation,
            },
            timestamp: slot.timestamp,
            field: slot.field,
            resolution: self.resolution,
            sequence: slot.sequence,
        })
    }

    /// Returns the oldest published frame, waiting for one if needed.
    ///
    /// Once the queue has ended, the frames still waiting are returned before
    /// [`FrameQueueError::EndOfStream`].
    pub fn take_ready(&self) -> Result<ReadyFrame, FrameQueueError> {
        let mut inner = self.lock();
        loop {
            if let Some(frame) = self.pop_ready(&mut inner) {
                return Ok(frame);
            }
            if inner.ended {
                return Err(FrameQueueError::EndOfStream);
            }
            inner = self
                .frame_ready
                .wait(inner)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Non-blocking version of [`FrameQueue::take_ready`]. Returns `None` if no frame is
    /// currently waiting, whether or not the queue has ended.
    pub fn try_take_ready(&self) -> Option<ReadyFrame> {
        let mut inner = self.lock();
        self.pop_ready(&mut inner)
    }

    /// Gives slot `index` back once the consumer is done with its picture.
    ///
    /// A published frame that has not been taken yet can also be released, in which case it is
    /// dropped without being displayed.
    pub fn release(&self, index: usize) -> Result<(), FrameQueueError> {
        self.check_index(index)?;

        let mut inner = self.lock();
        let state = inner.slots[index].state;
        if state != SlotState::Ready {
            return Err(FrameQueueError::InvalidState {
                index,
                state,
                expected: SlotState::Ready,
            });
        }

        inner.ready.retain(|&i| i != index);
        inner.slots[index].state = SlotState::Free;
        inner.available += 1;
        drop(inner);

        self.slot_freed.notify_all();
        Ok(())
    }

    /// Signals the end of the stream. No slot can be reserved afterwards, and every waiter is
    /// woken up so it can observe it.
    pub fn mark_ended(&self) {
        let mut inner = self.lock();
        if !inner.ended {
            log::debug!("frame queue ended with {} frames pending", inner.ready.len());
        }
        inner.ended = true;
        drop(inner);

        self.slot_freed.notify_all();
        self.frame_ready.notify_all();
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    /// Number of slots that are neither reserved nor ready.
    pub fn num_available(&self) -> usize {
        self.lock().available
    }

    /// Whether no published frame is waiting to be taken.
    pub fn is_empty(&self) -> bool {
        self.lock().ready.is_empty()
    }

    pub fn is_ended(&self) -> bool {
        self.lock().ended
    }

    /// Total number of frames published since creation.
    pub fn published_frames(&self) -> u64 {
        self.lock().published
    }

    pub fn slot_state(&self, index: usize) -> Result<SlotState, FrameQueueError> {
        self.check_index(index)?;
        Ok(self.lock().slots[index].state)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;

    const SHORT_WAIT: Duration = Duration::from_millis(100);
    const LONG_WAIT: Duration = Duration::from_secs(5);

    fn queue(capacity: usize) -> Arc<FrameQueue> {
        let _ = env_logger::try_init();
        Arc::new(FrameQueue::new(capacity, Resolution::from((320, 240))).unwrap())
    }

    fn count(queue: &FrameQueue, state: SlotState) -> usize {
        (0..queue.capacity())
            .filter(|&i| queue.slot_state(i).unwrap() == state)
            .count()
    }

    fn check_available(queue: &FrameQueue) {
        let busy = count(queue, SlotState::Reserved) + count(queue, SlotState::Ready);
        assert_eq!(queue.num_available(), queue.capacity() - busy);
    }

    #[test]
    fn zero_capacity() {
        assert_eq!(
            FrameQueue::new(0, Resolution::from((320, 240))).unwrap_err(),
            FrameQueueError::Allocation(0)
        );
    }

    #[test]
    fn publish_order_is_kept() {
        let queue = queue(4);

        for i in 0..4 {
            queue.reserve(i).unwrap();
        }
        assert_eq!(queue.num_available(), 0);

        for i in [0, 2, 1, 3] {
            queue.publish(i, Some(i as i64 * 100), Default::default()).unwrap();
            check_available(&queue);
        }

        let order: Vec<_> = (0..4).map(|_| queue.take_ready().unwrap()).collect();
        assert_eq!(
            order.iter().map(ReadyFrame::index).collect::<Vec<_>>(),
            vec![0, 2, 1, 3]
        );
        assert_eq!(
            order.iter().map(|f| f.sequence).collect::<Vec<_>>(),
            vec![0, 1, 2, 3]
        );
        assert_eq!(order[1].timestamp, Some(200));
        assert_eq!(queue.published_frames(), 4);

        for frame in order {
            queue.release(frame.index()).unwrap();
            check_available(&queue);
        }
        assert_eq!(queue.num_available(), 4);
    }

    #[test]
    fn available_count_invariant() {
        let queue = queue(5);
        // Deterministic pseudo-random walk through legal transitions.
        let mut seed = 0x2545_f491_u32;
        let mut taken = Vec::new();

        for _ in 0..500 {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12345);
            let index = (seed >> 16) as usize % queue.capacity();
            match queue.slot_state(index).unwrap() {
                SlotState::Free => {
                    queue.reserve(index).unwrap();
                }
                SlotState::Reserved => queue.publish(index, None, Default::default()).unwrap(),
                SlotState::Ready => {
                    if let Some(frame) = queue.try_take_ready() {
                        taken.push(frame.index());
                    }
                    if let Some(index) = taken.pop() {
                        queue.release(index).unwrap();
                    }
                }
            }
            check_available(&queue);
        }
    }

    #[test]
    fn surface_generation_changes() {
        let queue = queue(1);

        let first = queue.reserve(0).unwrap();
        queue.publish(0, None, Default::default()).unwrap();
        let frame = queue.take_ready().unwrap();
        assert_eq!(frame.surface, first);
        queue.release(0).unwrap();

        let second = queue.reserve(0).unwrap();
        assert_eq!(second.index, first.index);
        assert_ne!(second, first);
    }

    #[test]
    fn invalid_transitions() {
        let queue = queue(2);

        assert_eq!(
            queue.publish(0, None, Default::default()),
            Err(FrameQueueError::InvalidState {
                index: 0,
                state: SlotState::Free,
                expected: SlotState::Reserved,
            })
        );
        assert_eq!(
            queue.release(1),
            Err(FrameQueueError::InvalidState {
                index: 1,
                state: SlotState::Free,
                expected: SlotState::Ready,
            })
        );

        queue.reserve(0).unwrap();
        assert!(matches!(
            queue.release(0),
            Err(FrameQueueError::InvalidState { .. })
        ));
        assert_eq!(
            queue.reserve(2),
            Err(FrameQueueError::InvalidIndex {
                index: 2,
                capacity: 2
            })
        );
        check_available(&queue);
    }

    #[test]
    fn release_untaken_frame() {
        let queue = queue(2);

        queue.reserve(0).unwrap();
        queue.reserve(1).unwrap();
        queue.publish(0, None, Default::default()).unwrap();
        queue.publish(1, None, Default::default()).unwrap();

        queue.release(0).unwrap();
        assert_eq!(queue.take_ready().unwrap().index(), 1);
        assert!(queue.try_take_ready().is_none());
    }

    #[test]
    fn reserve_blocks_until_release() {
        let queue = queue(2);
        queue.reserve(1).unwrap();
        queue.publish(1, Some(7), Default::default()).unwrap();

        let (tx, rx) = mpsc::channel();
        let waiter = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                let res = queue.reserve(1);
                tx.send(()).unwrap();
                res
            })
        };

        // Slot 1 is still ready, the second reservation must wait.
        assert!(rx.recv_timeout(SHORT_WAIT).is_err());
        assert_eq!(queue.slot_state(1).unwrap(), SlotState::Ready);
        // Other slots are unaffected.
        queue.reserve(0).unwrap();

        let frame = queue.take_ready().unwrap();
        queue.release(frame.index()).unwrap();

        rx.recv_timeout(LONG_WAIT).unwrap();
        let handle = waiter.join().unwrap().unwrap();
        assert_eq!(handle.index, 1);
        assert_eq!(queue.slot_state(1).unwrap(), SlotState::Reserved);
        check_available(&queue);
    }

    #[test]
    fn ended_queue_is_drained() {
        let queue = queue(3);
        queue.reserve(0).unwrap();
        queue.reserve(1).unwrap();
        queue.publish(1, None, Default::default()).unwrap();

        queue.mark_ended();
        assert!(queue.is_ended());
        assert_eq!(queue.reserve(2), Err(FrameQueueError::StreamEnded));

        // A picture that was being decoded can still be published.
        queue.publish(0, None, Default::default()).unwrap();

        assert_eq!(queue.take_ready().unwrap().index(), 1);
        assert_eq!(queue.take_ready().unwrap().index(), 0);
        assert_eq!(queue.take_ready(), Err(FrameQueueError::EndOfStream));
        assert_eq!(queue.take_ready(), Err(FrameQueueError::EndOfStream));
    }

    #[test]
    fn mark_ended_wakes_consumer() {
        let queue = queue(2);

        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.take_ready())
        };

        thread::sleep(SHORT_WAIT);
        queue.mark_ended();
        assert_eq!(consumer.join().unwrap(), Err(FrameQueueError::EndOfStream));
    }

    #[test]
    fn mark_ended_wakes_decoder() {
        let queue = queue(1);
        queue.reserve(0).unwrap();

        let decoder = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.reserve(0))
        };

        thread::sleep(SHORT_WAIT);
        queue.mark_ended();
        assert_eq!(decoder.join().unwrap(), Err(FrameQueueError::StreamEnded));
        assert_eq!(queue.slot_state(0).unwrap(), SlotState::Reserved);
    }

    #[test]
    fn consumer_wakes_on_publish() {
        let queue = queue(2);

        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.take_ready())
        };

        thread::sleep(SHORT_WAIT);
        queue.reserve(0).unwrap();
        queue.publish(0, Some(42), Default::default()).unwrap();

        let frame = consumer.join().unwrap().unwrap();
        assert_eq!(frame.index(), 0);
        assert_eq!(frame.timestamp, Some(42));
        assert_eq!(frame.resolution, Resolution::from((320, 240)));
    }
}
