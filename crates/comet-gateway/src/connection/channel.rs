//! Per-connection channel
//!
//! Holds what the rest of the gateway needs to reach one client: the inbound
//! ring staged by the read pump, the outbound signal queue drained by the
//! dispatch pump, the watched operations and the current room.

use super::ring::Ring;
use crate::broadcast::Room;
use crate::protocol::Frame;
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use thiserror::Error;
use tokio::sync::{mpsc, Notify};

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Message for the dispatch pump
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    /// Frames are waiting in the ring
    Ready,
    /// Stop after everything queued before this
    Finish,
    /// Server push, written as is
    Frame(Frame),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("signal queue full, message dropped")]
    QueueFull,
    #[error("channel closed")]
    Closed,
}

pub struct Channel {
    id: u64,
    ip: String,
    mid: AtomicI64,
    key: OnceLock<String>,
    ring: Ring,
    /// Woken by the dispatch pump after it drains the ring
    ring_space: Notify,
    signal: mpsc::Sender<Signal>,
    /// A `Ready` is queued and not yet consumed
    ready: AtomicBool,
    /// `Finish` could not be queued; the dispatch pump treats this as one
    closing: AtomicBool,
    /// Wakes a dispatch pump parked on an empty queue once `closing` is set
    closing_notify: Notify,
    watch_ops: RwLock<HashSet<i32>>,
    room: Mutex<Option<Arc<Room>>>,
}

impl Channel {
    /// Create a channel and the receiving end of its signal queue
    pub fn new(
        ip: impl Into<String>,
        ring_size: usize,
        queue_size: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Signal>) {
        let (tx, rx) = mpsc::channel(queue_size.max(1));
        let channel = Arc::new(Self {
            id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            ip: ip.into(),
            mid: AtomicI64::new(0),
            key: OnceLock::new(),
            ring: Ring::new(ring_size),
            ring_space: Notify::new(),
            signal: tx,
            ready: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            closing_notify: Notify::new(),
            watch_ops: RwLock::new(HashSet::new()),
            room: Mutex::new(None),
        });
        (channel, rx)
    }

    /// Process-unique id, used to link the channel into rooms
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn ip(&self) -> &str {
        &self.ip
    }

    /// Member id assigned at authentication, 0 before
    pub fn mid(&self) -> i64 {
        self.mid.load(Ordering::Acquire)
    }

    /// Connection key assigned at authentication, empty before
    pub fn key(&self) -> &str {
        self.key.get().map_or("", String::as_str)
    }

    /// Record the identity returned by the handler. The key can only be
    /// set once.
    pub fn authenticated(&self, mid: i64, key: impl Into<String>) {
        self.mid.store(mid, Ordering::Release);
        if self.key.set(key.into()).is_err() {
            tracing::warn!(channel = self.id, "Channel key already set");
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.key.get().is_some()
    }

    pub fn ring(&self) -> &Ring {
        &self.ring
    }

    pub fn watch(&self, ops: &[i32]) {
        let mut watched = self.watch_ops.write();
        watched.extend(ops.iter().copied());
    }

    pub fn unwatch(&self, ops: &[i32]) {
        let mut watched = self.watch_ops.write();
        for op in ops {
            watched.remove(op);
        }
    }

    /// Whether broadcasts of `op` should reach this channel
    pub fn need_push(&self, op: i32) -> bool {
        self.watch_ops.read().contains(&op)
    }

    /// Queue a server push without waiting; dropped when the queue is full
    pub fn push(&self, frame: Frame) -> Result<(), ChannelError> {
        match self.signal.try_send(Signal::Frame(frame)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::debug!(key = %self.key(), "Signal queue full, push dropped");
                Err(ChannelError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(ChannelError::Closed),
        }
    }

    /// Stage a frame in the ring for the dispatch pump. When the ring is
    /// full, wakes the pump and waits for it to make room.
    pub async fn stage(&self, frame: Frame) -> Result<(), ChannelError> {
        let mut frame = frame;
        loop {
            match self.ring.push(frame) {
                Ok(()) => return Ok(()),
                Err(back) => {
                    frame = back;
                    self.signal().await?;
                    self.ring_space.notified().await;
                }
            }
        }
    }

    /// Called by the dispatch pump after draining the ring
    pub fn ring_drained(&self) {
        self.ring_space.notify_one();
    }

    /// Tell the dispatch pump the ring has frames. Repeated signals before
    /// the pump wakes collapse into one.
    pub async fn signal(&self) -> Result<(), ChannelError> {
        if self.ready.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.signal
            .send(Signal::Ready)
            .await
            .map_err(|_| ChannelError::Closed)
    }

    /// Called by the dispatch pump when it takes a `Ready` off the queue
    pub fn ready_consumed(&self) {
        self.ready.store(false, Ordering::Release);
    }

    /// Ask the dispatch pump to stop once the queue is drained
    pub fn close(&self) {
        if self.signal.try_send(Signal::Finish).is_err() {
            self.closing.store(true, Ordering::Release);
            self.closing_notify.notify_one();
        }
    }

    /// Whether a close was requested while the queue was full
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Resolves once a close was requested while the queue was full. The
    /// wakeup is kept if nobody is waiting yet.
    pub async fn closing(&self) {
        while !self.is_closing() {
            self.closing_notify.notified().await;
        }
    }

    pub fn room(&self) -> Option<Arc<Room>> {
        self.room.lock().clone()
    }

    pub fn room_id(&self) -> Option<String> {
        self.room.lock().as_ref().map(|r| r.id().to_string())
    }

    pub(crate) fn set_room(&self, room: Option<Arc<Room>>) {
        *self.room.lock() = room;
    }

    pub(crate) fn take_room(&self) -> Option<Arc<Room>> {
        self.room.lock().take()
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("key", &self.key())
            .field("ip", &self.ip)
            .field("mid", &self.mid())
            .finish()
    }
}
