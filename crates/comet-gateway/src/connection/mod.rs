//! Per-connection state

mod channel;
mod ring;

pub use channel::{Channel, ChannelError, Signal};
pub use ring::{Ring, RingError};
