//! Connection shard
//!
//! A bucket owns a slice of the live connections (by key), the rooms those
//! connections are in, and a per-IP connection count. Room broadcasts are
//! handed round-robin to a fixed set of worker tasks.

use super::room::{Room, RoomError};
use crate::connection::Channel;
use crate::protocol::Frame;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

/// Sizing of one bucket
#[derive(Debug, Clone)]
pub struct BucketOptions {
    /// Initial connection map capacity
    pub channel: usize,
    /// Initial room map capacity
    pub room: usize,
    /// Number of room broadcast workers
    pub routine_amount: usize,
    /// Queue depth of each worker
    pub routine_size: usize,
}

impl Default for BucketOptions {
    fn default() -> Self {
        Self {
            channel: 1024,
            room: 1024,
            routine_amount: 32,
            routine_size: 1024,
        }
    }
}

/// A frame for every member of a room
#[derive(Debug, Clone)]
pub struct RoomMessage {
    pub room_id: String,
    pub frame: Frame,
}

#[derive(Default)]
struct Shard {
    channels: HashMap<String, Arc<Channel>>,
    rooms: HashMap<String, Arc<Room>>,
    ips: HashMap<String, usize>,
}

impl Shard {
    /// Drop one connection from an IP's count, evicting the entry at zero
    fn release_ip(&mut self, ip: &str) {
        if let Some(count) = self.ips.get_mut(ip) {
            *count -= 1;
            if *count == 0 {
                self.ips.remove(ip);
            }
        }
    }

    /// Link a channel into a room, creating the room on demand. A room that
    /// dropped between lookup and link is replaced by a fresh one.
    fn join(&mut self, room_id: &str, channel: &Arc<Channel>) -> Arc<Room> {
        loop {
            let room = Arc::clone(
                self.rooms
                    .entry(room_id.to_string())
                    .or_insert_with(|| Arc::new(Room::new(room_id))),
            );
            match room.put(channel) {
                Ok(()) => return room,
                Err(RoomError::Dropped) => {
                    self.rooms.remove(room_id);
                }
            }
        }
    }
}

pub struct Bucket {
    shard: RwLock<Shard>,
    workers: Vec<mpsc::Sender<RoomMessage>>,
    next_worker: AtomicUsize,
}

impl Bucket {
    /// Create a bucket and start its room workers on the current runtime
    pub fn new(options: &BucketOptions) -> Arc<Self> {
        let amount = options.routine_amount.max(1);
        let size = options.routine_size.max(1);

        Arc::new_cyclic(|weak: &Weak<Self>| {
            let workers = (0..amount)
                .map(|index| {
                    let (tx, rx) = mpsc::channel(size);
                    tokio::spawn(room_worker(index, weak.clone(), rx));
                    tx
                })
                .collect();

            Self {
                shard: RwLock::new(Shard {
                    channels: HashMap::with_capacity(options.channel),
                    rooms: HashMap::with_capacity(options.room),
                    ips: HashMap::new(),
                }),
                workers,
                next_worker: AtomicUsize::new(0),
            }
        })
    }

    /// Register a channel under its key, replacing and closing any previous
    /// channel with the same key, and join `room_id` when it is not empty
    pub fn put(&self, room_id: &str, channel: &Arc<Channel>) {
        let mut shard = self.shard.write();

        if let Some(old) = shard
            .channels
            .insert(channel.key().to_string(), Arc::clone(channel))
        {
            if old.id() == channel.id() {
                return;
            }
            tracing::debug!(key = %channel.key(), "Replacing channel with same key");
            shard.release_ip(old.ip());
            old.close();
        }

        if !room_id.is_empty() {
            let room = shard.join(room_id, channel);
            channel.set_room(Some(room));
        }

        *shard.ips.entry(channel.ip().to_string()).or_insert(0) += 1;
    }

    /// Remove a channel. The key mapping and IP count are only touched when
    /// the key still points at this exact channel.
    pub fn del(&self, channel: &Arc<Channel>) {
        let room = channel.take_room();

        {
            let mut shard = self.shard.write();
            let key = channel.key();
            if shard
                .channels
                .get(key)
                .is_some_and(|current| Arc::ptr_eq(current, channel))
            {
                shard.channels.remove(key);
                shard.release_ip(channel.ip());
            }
        }

        if let Some(room) = room {
            if room.del(channel) {
                self.del_room(&room);
            }
        }
    }

    /// Leave the current room and join `room_id`, or no room when empty
    pub fn change_room(&self, room_id: &str, channel: &Arc<Channel>) {
        if let Some(old) = channel.take_room() {
            if old.del(channel) {
                self.del_room(&old);
            }
        }
        if room_id.is_empty() {
            return;
        }
        let room = self.shard.write().join(room_id, channel);
        channel.set_room(Some(room));
    }

    fn del_room(&self, room: &Arc<Room>) {
        {
            let mut shard = self.shard.write();
            if shard
                .rooms
                .get(room.id())
                .is_some_and(|current| Arc::ptr_eq(current, room))
            {
                shard.rooms.remove(room.id());
            }
        }
        room.close();
    }

    pub fn channel(&self, key: &str) -> Option<Arc<Channel>> {
        self.shard.read().channels.get(key).cloned()
    }

    pub fn room(&self, room_id: &str) -> Option<Arc<Room>> {
        self.shard.read().rooms.get(room_id).cloned()
    }

    /// Push to every channel watching `op`
    pub fn broadcast(&self, frame: &Frame, op: i32) {
        let shard = self.shard.read();
        for channel in shard.channels.values() {
            if channel.need_push(op) {
                let _ = channel.push(frame.clone());
            }
        }
    }

    /// Hand a room broadcast to the next worker
    pub async fn broadcast_room(&self, msg: RoomMessage) {
        let index = self.next_worker.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        if self.workers[index].send(msg).await.is_err() {
            tracing::warn!(worker = index, "Room worker stopped, broadcast dropped");
        }
    }

    /// Online count of every non-empty room
    pub fn rooms_count(&self) -> HashMap<String, i32> {
        self.shard
            .read()
            .rooms
            .iter()
            .filter_map(|(id, room)| {
                let online = room.online();
                (online > 0).then(|| (id.clone(), online))
            })
            .collect()
    }

    /// Ids of every non-empty room
    pub fn rooms(&self) -> HashSet<String> {
        self.shard
            .read()
            .rooms
            .iter()
            .filter(|(_, room)| room.online() > 0)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Store cluster-wide online counts; rooms missing from `counts` reset
    pub fn up_rooms_count(&self, counts: &HashMap<String, i32>) {
        let shard = self.shard.read();
        for (id, room) in &shard.rooms {
            room.set_all_online(counts.get(id).copied().unwrap_or(0));
        }
    }

    /// Distinct client IPs with a live connection
    pub fn ip_count(&self) -> HashSet<String> {
        self.shard.read().ips.keys().cloned().collect()
    }

    pub fn ip_connections(&self, ip: &str) -> usize {
        self.shard.read().ips.get(ip).copied().unwrap_or(0)
    }

    pub fn channel_count(&self) -> usize {
        self.shard.read().channels.len()
    }

    pub fn room_count(&self) -> usize {
        self.shard.read().rooms.len()
    }

    /// Close every channel in the bucket
    pub fn close(&self) {
        let shard = self.shard.read();
        for channel in shard.channels.values() {
            channel.close();
        }
    }
}

impl std::fmt::Debug for Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shard = self.shard.read();
        f.debug_struct("Bucket")
            .field("channels", &shard.channels.len())
            .field("rooms", &shard.rooms.len())
            .field("workers", &self.workers.len())
            .finish()
    }
}

async fn room_worker(index: usize, bucket: Weak<Bucket>, mut rx: mpsc::Receiver<RoomMessage>) {
    while let Some(msg) = rx.recv().await {
        let Some(bucket) = bucket.upgrade() else { break };
        if let Some(room) = bucket.room(&msg.room_id) {
            room.push(&msg.frame);
        }
    }
    tracing::trace!(worker = index, "Room worker stopped");
}
