//! # Chat Client Library
//!
//! Client side of the UDP chat protocol. A client logs in with a username,
//! then exchanges chat messages, typing notifications and presence updates
//! with the server over unreliable datagrams.
//!
//! ## Architecture Overview
//!
//! ### Ordered Delivery
//! Every chat message relayed by the server carries a global index. The
//! client only accepts the next index it expects; anything past it triggers
//! a resend request for the missing range, anything before it is a duplicate.
//!
//! ### Reliable Sending
//! The client keeps every message it sent, numbered from zero, so it can
//! replay any range the server reports missing.
//!
//! ### Liveness
//! The server pings every connected client several times a second. A client
//! that hears nothing from the server warns once per silent second and gives
//! up after the liveness timeout.
//!
//! ## Module Organization
//!
//! - [`session`]: the protocol state machine, free of I/O
//! - [`network`]: the login handshake and the tick loop around the session
//! - [`events`]: callbacks through which the session reports changes
//! - [`terminal`]: a plain stdin/stdout front end
//! - [`error`]: the client error type
//!
//! ## Usage Example
//!
//! ```no_run
//! use client::{Client, NullSink};
//! use shared::Timings;
//!
//! # async fn demo() -> Result<(), client::ClientError> {
//! let server = "127.0.0.1:7777".parse().unwrap();
//! let (client, handle) =
//!     Client::connect("alice", server, Timings::default(), Box::new(NullSink)).await?;
//!
//! handle.send_message("hello");
//! handle.exit();
//! client.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod events;
pub mod network;
pub mod session;
pub mod terminal;

pub use error::ClientError;
pub use events::{EventSink, NullSink};
pub use network::{Client, ClientCommand, ClientHandle};
pub use session::{ClientSession, SessionState};
