//! Rooms and connection shards

mod bucket;
mod room;

pub use bucket::{Bucket, BucketOptions, RoomMessage};
pub use room::{Room, RoomError};
