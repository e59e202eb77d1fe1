//! # comet-gateway
//!
//! Long-lived TCP connection gateway: binary frames, rooms, operation
//! watches, server push, and cross-node delivery through a broker.

pub mod broadcast;
pub mod broker;
pub mod connection;
pub mod handlers;
pub mod protocol;
pub mod round;
pub mod server;

pub use broadcast::{Bucket, BucketOptions, Room, RoomMessage};
pub use broker::{BrokerError, LocalBroker, LocalHub, MessageBroker, RedisBroker};
pub use connection::{Channel, ChannelError, Signal};
pub use handlers::{AuthReply, Handler, HandlerError, HandlerResult, IdentifyHandler};
pub use protocol::{DataCreator, Frame, FrameCodec, FrameError, InternalMessage, Operation, Payload};
pub use server::{Server, ServerBuilder, ServerConfig, ServerError};
