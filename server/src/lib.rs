//! # Chat Server Library
//!
//! The authoritative side of the UDP chat protocol. The server admits users,
//! relays chat messages in a single global order, and keeps every peer's
//! presence, ping and typing state in sync.
//!
//! ## Architecture
//!
//! ### Sans-IO session
//! [`session::ServerSession`] holds the presence directory, the message log
//! and the id allocator. It consumes raw datagrams plus the current time and
//! queues outbound packets, which makes every protocol rule testable without
//! sockets or sleeps.
//!
//! ### Network driver
//! [`network::Server`] owns the UDP socket. A receive task pushes datagrams
//! into an unbounded queue; the tick loop (60 Hz by default) drains the
//! queue into the session, runs the keepalive/timeout sweep and flushes the
//! outbox. The tick loop is the only writer of protocol state.
//!
//! ### Recovery over an unreliable transport
//! Each peer numbers its chat messages. A gap makes the server ask the peer
//! to resend the missing range; the relayed stream carries a global index so
//! clients can do the same. Keepalive pings carry the log length, letting
//! idle clients notice that they fell behind.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::network::Server;
//! use shared::Timings;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut server = Server::bind("0.0.0.0:7777", Timings::default()).await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod network;
pub mod session;

pub use error::ServerError;
pub use network::Server;
pub use session::{IdAllocator, Outgoing, ServerSession};
