//! Test fixtures and data generators

use comet_gateway::handlers::IdentifyRequest;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counter for unique test data
static COUNTER: AtomicU64 = AtomicU64::new(1);

/// Get a unique suffix for test data
pub fn unique_suffix() -> u64 {
    COUNTER.fetch_add(1, Ordering::SeqCst)
}

/// Auth body for a fresh member
pub fn identify(room_id: &str, accepts: &[i32]) -> IdentifyRequest {
    let suffix = unique_suffix();
    IdentifyRequest {
        mid: suffix as i64,
        key: format!("key-{suffix}-{}", uuid::Uuid::new_v4().simple()),
        room_id: room_id.to_string(),
        accepts: accepts.to_vec(),
        heartbeat: 0,
    }
}

/// Unique room id
pub fn unique_room() -> String {
    format!("live://{}", unique_suffix())
}
