//! Integration test utilities for the comet gateway
//!
//! Spawns servers on ephemeral ports and drives them with framed TCP
//! clients.

pub mod fixtures;
pub mod helpers;

pub use fixtures::*;
pub use helpers::*;
