//! Wire protocol
//!
//! Frame layout, codec, operation codes and the broker envelope.

mod codec;
mod creator;
mod frame;
mod message;
mod operation;

pub use codec::{FrameCodec, DEFAULT_READ_LIMIT, DEFAULT_WRITE_LIMIT};
pub use creator::{
    decode_json, decode_ops, decode_raw, decode_text, BodyDecoder, DataCreator, Payload,
};
pub use frame::{Frame, FrameError, Header, HEADER_LEN, PROTOCOL_VERSION};
pub use message::InternalMessage;
pub use operation::Operation;
