//! Fixed-size frame ring between a connection's read and dispatch pumps
//!
//! One writer (read pump) and one reader (dispatch pump). Positions only
//! grow; slots are addressed by `pos & mask`. Each slot sits behind its own
//! mutex, which is uncontended as long as the single-writer single-reader
//! discipline holds.

use crate::protocol::Frame;
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// Ring occupancy errors, both transient
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RingError {
    #[error("ring buffer full")]
    Full,
    #[error("ring buffer empty")]
    Empty,
}

pub struct Ring {
    read_pos: AtomicU64,
    write_pos: AtomicU64,
    mask: u64,
    slots: Box<[Mutex<Frame>]>,
}

impl std::fmt::Debug for Ring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ring")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .finish()
    }
}

impl Ring {
    /// Create a ring with at least `capacity` slots, rounded up to a power of two
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1).next_power_of_two();
        let slots = (0..capacity).map(|_| Mutex::new(Frame::default())).collect();
        Self {
            read_pos: AtomicU64::new(0),
            write_pos: AtomicU64::new(0),
            mask: capacity as u64 - 1,
            slots,
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Frames written and not yet read
    #[must_use]
    pub fn len(&self) -> usize {
        let write = self.write_pos.load(Ordering::Acquire);
        let read = self.read_pos.load(Ordering::Acquire);
        write.saturating_sub(read) as usize
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Next free slot for the writer; commit with [`Ring::commit_write`]
    /// after dropping the guard
    pub fn try_reserve_write(&self) -> Result<MutexGuard<'_, Frame>, RingError> {
        let write = self.write_pos.load(Ordering::Relaxed);
        let read = self.read_pos.load(Ordering::Acquire);
        if write - read >= self.slots.len() as u64 {
            return Err(RingError::Full);
        }
        Ok(self.slots[(write & self.mask) as usize].lock())
    }

    pub fn commit_write(&self) {
        self.write_pos.fetch_add(1, Ordering::Release);
    }

    /// Oldest written slot for the reader; commit with [`Ring::commit_read`]
    /// after dropping the guard
    pub fn try_reserve_read(&self) -> Result<MutexGuard<'_, Frame>, RingError> {
        let read = self.read_pos.load(Ordering::Relaxed);
        let write = self.write_pos.load(Ordering::Acquire);
        if read == write {
            return Err(RingError::Empty);
        }
        Ok(self.slots[(read & self.mask) as usize].lock())
    }

    pub fn commit_read(&self) {
        self.read_pos.fetch_add(1, Ordering::Release);
    }

    /// Move a frame into the next free slot, handing it back when full
    pub fn push(&self, frame: Frame) -> Result<(), Frame> {
        {
            let Ok(mut slot) = self.try_reserve_write() else {
                return Err(frame);
            };
            *slot = frame;
        }
        self.commit_write();
        Ok(())
    }

    /// Take the oldest frame, leaving an empty frame in its slot
    pub fn pop(&self) -> Result<Frame, RingError> {
        let frame = {
            let mut slot = self.try_reserve_read()?;
            std::mem::take(&mut *slot)
        };
        self.commit_read();
        Ok(frame)
    }

    /// Zero both positions. Only valid while neither side is active.
    pub fn reset(&self) {
        self.read_pos.store(0, Ordering::Release);
        self.write_pos.store(0, Ordering::Release);
    }
}
