//! # Chat Protocol Shared Library
//!
//! Types and helpers used by both the chat server and its clients:
//!
//! - [`protocol`]: the fixed-size datagram codec
//! - [`user`]: users and chat messages
//! - [`directory`]: the presence directory indexed by id and address
//! - [`config`]: protocol timings
//! - [`transport`]: the socket receive task feeding each tick loop

pub mod config;
pub mod directory;
pub mod protocol;
pub mod transport;
pub mod user;

pub use config::{ConfigError, Timings};
pub use directory::Directory;
pub use protocol::{
    ClientPacket, DecodeError, EncodeError, PacketKind, ServerPacket, DESCRIBE_ALL,
    LOGIN_REJECTED, MAGIC, PACKET_SIZE, PAYLOAD_SIZE, THROUGH_END,
};
pub use user::{User, UserId, UserMessage};
