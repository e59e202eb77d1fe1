//! Delay queue for handshake and heartbeat deadlines
//!
//! Pending entries live in a slab and form a list sorted by expiry. One
//! background task per timer sleeps until the head expires and runs the
//! callback with the lock released. Handles carry a sequence number, so a
//! handle whose entry already fired or was deleted is simply ignored.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

/// Longest delay an entry can be scheduled with; longer delays are capped
const MAX_DELAY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

fn expiry_after(delay: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(delay.min(MAX_DELAY)).unwrap_or(now)
}

/// Reference to a scheduled entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerHandle {
    index: usize,
    seq: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    Pending,
    Firing,
}

struct Slot {
    seq: u64,
    expire: Instant,
    callback: Option<TimerCallback>,
    prev: Option<usize>,
    next: Option<usize>,
    state: SlotState,
}

impl Slot {
    fn free(next: Option<usize>) -> Self {
        Self {
            seq: 0,
            expire: Instant::now(),
            callback: None,
            prev: None,
            next,
            state: SlotState::Free,
        }
    }
}

enum Tick {
    Fire(TimerHandle, TimerCallback),
    Wait(Option<Instant>),
}

struct Entries {
    slots: Vec<Slot>,
    free_head: Option<usize>,
    free: usize,
    head: Option<usize>,
    tail: Option<usize>,
    pending: usize,
    grow_size: usize,
    grow_count: usize,
    seq: u64,
}

impl Entries {
    fn new(size: usize) -> Self {
        let mut entries = Self {
            slots: Vec::new(),
            free_head: None,
            free: 0,
            head: None,
            tail: None,
            pending: 0,
            grow_size: size.max(1),
            grow_count: 0,
            seq: 0,
        };
        entries.extend();
        entries
    }

    fn extend(&mut self) {
        let start = self.slots.len();
        let end = start + self.grow_size;
        for index in start..end {
            let next = if index + 1 < end {
                Some(index + 1)
            } else {
                self.free_head
            };
            self.slots.push(Slot::free(next));
        }
        self.free_head = Some(start);
        self.free += self.grow_size;
    }

    fn alloc(&mut self) -> usize {
        if self.free_head.is_none() {
            self.extend();
            self.grow_count += 1;
        }
        // extend() always leaves a free head
        let index = self.free_head.unwrap_or_default();
        self.free_head = self.slots[index].next;
        self.free -= 1;
        index
    }

    /// Give a slot back. When free capacity far exceeds demand and the slot
    /// is the slab's last, the slab shrinks instead.
    fn release(&mut self, index: usize) {
        let shrink = self.free > 2 * self.pending
            && self.free >= self.grow_size
            && index + 1 == self.slots.len();
        if shrink {
            self.slots.pop();
            return;
        }
        let slot = &mut self.slots[index];
        slot.state = SlotState::Free;
        slot.callback = None;
        slot.prev = None;
        slot.next = self.free_head;
        self.free_head = Some(index);
        self.free += 1;
    }

    fn get(&self, handle: TimerHandle) -> Option<&Slot> {
        self.slots
            .get(handle.index)
            .filter(|slot| slot.seq == handle.seq)
    }

    fn is_pending(&self, handle: TimerHandle) -> bool {
        self.get(handle)
            .is_some_and(|slot| slot.state == SlotState::Pending)
    }

    /// Insert into the sorted list, walking back from the tail. Returns true
    /// when the entry became the new head.
    fn link(&mut self, index: usize) -> bool {
        let expire = self.slots[index].expire;
        let mut cursor = self.tail;
        while let Some(at) = cursor {
            if self.slots[at].expire <= expire {
                break;
            }
            cursor = self.slots[at].prev;
        }

        let next = match cursor {
            Some(at) => self.slots[at].next.replace(index),
            None => self.head.replace(index),
        };
        match next {
            Some(n) => self.slots[n].prev = Some(index),
            None => self.tail = Some(index),
        }
        let slot = &mut self.slots[index];
        slot.prev = cursor;
        slot.next = next;
        self.pending += 1;
        cursor.is_none()
    }

    fn unlink(&mut self, index: usize) {
        let (prev, next) = {
            let slot = &mut self.slots[index];
            (slot.prev.take(), slot.next.take())
        };
        match prev {
            Some(p) => self.slots[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slots[n].prev = prev,
            None => self.tail = prev,
        }
        self.pending -= 1;
    }

    fn tick(&mut self, now: Instant) -> Tick {
        let Some(index) = self.head else {
            return Tick::Wait(None);
        };
        let expire = self.slots[index].expire;
        if expire > now {
            return Tick::Wait(Some(expire));
        }
        self.unlink(index);
        let slot = &mut self.slots[index];
        slot.state = SlotState::Firing;
        let handle = TimerHandle {
            index,
            seq: slot.seq,
        };
        match slot.callback.take() {
            Some(callback) => Tick::Fire(handle, callback),
            None => {
                self.release(index);
                Tick::Wait(Some(now))
            }
        }
    }
}

struct Shared {
    entries: Mutex<Entries>,
    wakeup: Notify,
}

/// Delay queue driven by one background task
pub struct Timer {
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

impl Timer {
    /// Create a timer with `size` preallocated entries and start its task on
    /// the current runtime
    #[must_use]
    pub fn new(size: usize) -> Self {
        let shared = Arc::new(Shared {
            entries: Mutex::new(Entries::new(size)),
            wakeup: Notify::new(),
        });
        let cancel = CancellationToken::new();
        tokio::spawn(run(Arc::clone(&shared), cancel.clone()));
        Self { shared, cancel }
    }

    /// Schedule `callback` to run once `delay` has elapsed
    pub fn add<F>(&self, delay: Duration, callback: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let expire = expiry_after(delay);
        let mut entries = self.shared.entries.lock();
        let index = entries.alloc();
        entries.seq += 1;
        let seq = entries.seq;

        let slot = &mut entries.slots[index];
        slot.seq = seq;
        slot.expire = expire;
        slot.callback = Some(Box::new(callback));
        slot.state = SlotState::Pending;

        if entries.link(index) {
            self.shared.wakeup.notify_one();
        }
        TimerHandle { index, seq }
    }

    /// Cancel a pending entry. Returns false when it already fired or was
    /// deleted.
    pub fn del(&self, handle: TimerHandle) -> bool {
        let mut entries = self.shared.entries.lock();
        if !entries.is_pending(handle) {
            return false;
        }
        entries.unlink(handle.index);
        entries.release(handle.index);
        true
    }

    /// Move a pending entry's expiry to `delay` from now. Returns false when
    /// the entry is no longer pending.
    pub fn set(&self, handle: TimerHandle, delay: Duration) -> bool {
        let expire = expiry_after(delay);
        let mut entries = self.shared.entries.lock();
        if !entries.is_pending(handle) {
            return false;
        }
        entries.unlink(handle.index);
        entries.slots[handle.index].expire = expire;
        if entries.link(handle.index) {
            self.shared.wakeup.notify_one();
        }
        true
    }

    /// Entries waiting to fire
    pub fn pending(&self) -> usize {
        self.shared.entries.lock().pending
    }

    /// Entries available without growing
    pub fn free(&self) -> usize {
        self.shared.entries.lock().free
    }

    /// Times the slab had to grow past its initial size
    pub fn grow_count(&self) -> usize {
        self.shared.entries.lock().grow_count
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let entries = self.shared.entries.lock();
        f.debug_struct("Timer")
            .field("pending", &entries.pending)
            .field("free", &entries.free)
            .field("grow_count", &entries.grow_count)
            .finish()
    }
}

async fn run(shared: Arc<Shared>, cancel: CancellationToken) {
    loop {
        let deadline = loop {
            let tick = shared.entries.lock().tick(Instant::now());
            match tick {
                Tick::Fire(handle, callback) => {
                    callback();
                    let mut entries = shared.entries.lock();
                    if entries
                        .get(handle)
                        .is_some_and(|slot| slot.state == SlotState::Firing)
                    {
                        entries.release(handle.index);
                    }
                }
                Tick::Wait(deadline) => break deadline,
            }
        };

        match deadline {
            Some(deadline) => {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = shared.wakeup.notified() => {}
                    () = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = shared.wakeup.notified() => {}
                }
            }
        }
    }
    tracing::trace!("Timer task stopped");
}
