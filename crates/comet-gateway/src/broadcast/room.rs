//! Broadcast room
//!
//! Members form a doubly linked list keyed by channel id, so joining and
//! leaving are O(1) and a broadcast walks the list once.

use crate::connection::Channel;
use crate::protocol::Frame;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RoomError {
    /// The room emptied out and is being evicted; look it up again
    #[error("room dropped")]
    Dropped,
}

struct Link {
    channel: Arc<Channel>,
    prev: Option<u64>,
    next: Option<u64>,
}

#[derive(Default)]
struct Members {
    head: Option<u64>,
    links: HashMap<u64, Link>,
    online: i32,
    dropped: bool,
}

pub struct Room {
    id: String,
    members: RwLock<Members>,
    /// Cluster-wide online count, refreshed by the renew-online task
    all_online: AtomicI32,
}

impl Room {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            members: RwLock::new(Members::default()),
            all_online: AtomicI32::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Link a channel at the head of the list
    pub fn put(&self, channel: &Arc<Channel>) -> Result<(), RoomError> {
        let mut m = self.members.write();
        if m.dropped {
            return Err(RoomError::Dropped);
        }
        let id = channel.id();
        if m.links.contains_key(&id) {
            return Ok(());
        }

        let next = m.head;
        if let Some(link) = next.and_then(|head| m.links.get_mut(&head)) {
            link.prev = Some(id);
        }
        m.links.insert(
            id,
            Link {
                channel: Arc::clone(channel),
                prev: None,
                next,
            },
        );
        m.head = Some(id);
        m.online += 1;
        Ok(())
    }

    /// Unlink a channel. Returns true once, when the last member leaves.
    pub fn del(&self, channel: &Channel) -> bool {
        let mut m = self.members.write();
        let Some(link) = m.links.remove(&channel.id()) else {
            return false;
        };

        if let Some(next) = link.next.and_then(|id| m.links.get_mut(&id)) {
            next.prev = link.prev;
        }
        match link.prev {
            Some(prev) => {
                if let Some(prev) = m.links.get_mut(&prev) {
                    prev.next = link.next;
                }
            }
            None => m.head = link.next,
        }

        m.online -= 1;
        m.dropped = m.online == 0;
        m.dropped
    }

    /// Push a frame to every member
    pub fn push(&self, frame: &Frame) {
        let m = self.members.read();
        let mut cursor = m.head;
        while let Some(id) = cursor {
            let Some(link) = m.links.get(&id) else { break };
            // Full queues drop the frame; the channel logs it
            let _ = link.channel.push(frame.clone());
            cursor = link.next;
        }
    }

    /// Ask every member's dispatch pump to stop
    pub fn close(&self) {
        let m = self.members.read();
        let mut cursor = m.head;
        while let Some(id) = cursor {
            let Some(link) = m.links.get(&id) else { break };
            link.channel.close();
            cursor = link.next;
        }
    }

    /// Cluster-wide count when one is known, else the local count
    pub fn online_num(&self) -> i32 {
        let all = self.all_online.load(Ordering::Acquire);
        if all > 0 {
            all
        } else {
            self.online()
        }
    }

    /// Members linked on this node
    pub fn online(&self) -> i32 {
        self.members.read().online
    }

    pub fn set_all_online(&self, count: i32) {
        self.all_online.store(count, Ordering::Release);
    }

    pub fn is_dropped(&self) -> bool {
        self.members.read().dropped
    }

    /// Channel ids from head to tail
    pub fn member_ids(&self) -> Vec<u64> {
        let m = self.members.read();
        let mut ids = Vec::with_capacity(m.links.len());
        let mut cursor = m.head;
        while let Some(id) = cursor {
            ids.push(id);
            cursor = m.links.get(&id).and_then(|l| l.next);
        }
        ids
    }
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let m = self.members.read();
        f.debug_struct("Room")
            .field("id", &self.id)
            .field("online", &m.online)
            .field("dropped", &m.dropped)
            .field("all_online", &self.all_online.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Signal;
    use bytes::Bytes;

    fn channel() -> (Arc<Channel>, tokio::sync::mpsc::Receiver<Signal>) {
        Channel::new("127.0.0.1", 4, 8)
    }

    #[test]
    fn test_put_links_at_head() {
        let room = Room::new("live://1");
        let (a, _ra) = channel();
        let (b, _rb) = channel();
        let (c, _rc) = channel();

        room.put(&a).unwrap();
        room.put(&b).unwrap();
        room.put(&c).unwrap();

        assert_eq!(room.online(), 3);
        assert_eq!(room.member_ids(), vec![c.id(), b.id(), a.id()]);
    }

    #[test]
    fn test_put_twice_counts_once() {
        let room = Room::new("live://1");
        let (a, _ra) = channel();
        room.put(&a).unwrap();
        room.put(&a).unwrap();
        assert_eq!(room.online(), 1);
    }

    #[test]
    fn test_del_from_middle_head_and_tail() {
        let room = Room::new("live://1");
        let (a, _ra) = channel();
        let (b, _rb) = channel();
        let (c, _rc) = channel();
        for ch in [&a, &b, &c] {
            room.put(ch).unwrap();
        }

        assert!(!room.del(&b));
        assert_eq!(room.member_ids(), vec![c.id(), a.id()]);
        assert!(!room.del(&c));
        assert_eq!(room.member_ids(), vec![a.id()]);
        assert!(room.del(&a));
        assert!(room.member_ids().is_empty());
        assert_eq!(room.online(), 0);
    }

    #[test]
    fn test_only_last_del_reports_empty() {
        let room = Room::new("live://1");
        let (a, _ra) = channel();
        let (b, _rb) = channel();
        room.put(&a).unwrap();
        room.put(&b).unwrap();

        assert!(!room.del(&a));
        assert!(!room.del(&a));
        assert!(room.del(&b));
        assert!(!room.del(&b));
        assert!(room.is_dropped());
    }

    #[test]
    fn test_put_into_dropped_room_fails() {
        let room = Room::new("live://1");
        let (a, _ra) = channel();
        room.put(&a).unwrap();
        assert!(room.del(&a));

        assert_eq!(room.put(&a), Err(RoomError::Dropped));
    }

    #[test]
    fn test_push_reaches_every_member_unfiltered() {
        let room = Room::new("live://1");
        let (a, mut ra) = channel();
        let (b, mut rb) = channel();
        a.watch(&[1000]);
        room.put(&a).unwrap();
        room.put(&b).unwrap();

        room.push(&Frame::new(2000, Bytes::from_static(b"hello")));

        for rx in [&mut ra, &mut rb] {
            match rx.try_recv().unwrap() {
                Signal::Frame(f) => assert_eq!(f.body, Bytes::from_static(b"hello")),
                other => panic!("unexpected signal: {other:?}"),
            }
        }
    }

    #[test]
    fn test_close_finishes_members() {
        let room = Room::new("live://1");
        let (a, mut ra) = channel();
        room.put(&a).unwrap();
        room.close();
        assert_eq!(ra.try_recv().unwrap(), Signal::Finish);
    }

    #[test]
    fn test_online_num_prefers_cluster_count() {
        let room = Room::new("live://1");
        let (a, _ra) = channel();
        room.put(&a).unwrap();
        assert_eq!(room.online_num(), 1);

        room.set_all_online(40);
        assert_eq!(room.online_num(), 40);

        room.set_all_online(0);
        assert_eq!(room.online_num(), 1);
    }
}
