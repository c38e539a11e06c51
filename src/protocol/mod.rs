pub mod codec;
pub mod command;
pub mod types;

pub use codec::RespCodec;
pub use command::{
    Coalesce, CommandDescriptor, CommandHandler, LocalCommand, RedisCommand, lookup_command,
};
pub use types::RespValue;

/// Number of hash slots the key space is divided into.
pub const SLOT_COUNT: u16 = 16384;

/// Maximum nesting of array replies; deeper frames are a protocol error.
pub const MAX_REPLY_DEPTH: usize = 8;
