//! Presentation-layer callbacks.
//!
//! The engine calls these synchronously from its tick loop at the moment the
//! corresponding state change happens. Implementations that drive a UI on
//! another thread are responsible for forwarding the calls there.

use crate::error::ClientError;
use shared::{User, UserMessage};

#[allow(unused_variables)]
pub trait EventSink {
    fn user_connected(&mut self, user: &User) {}

    fn user_disconnected(&mut self, user: &User) {}

    fn user_start_typing(&mut self, user: &User) {}

    fn user_stop_typing(&mut self, user: &User) {}

    fn message_received(&mut self, message: &UserMessage) {}

    fn ping_updated(&mut self, user: &User) {}

    /// No packet from the server for `seconds` whole seconds.
    fn timeout_warning(&mut self, seconds: u64) {}

    fn connection_restored(&mut self) {}

    /// The session is over; `run` returns this error right after.
    fn fatal_error(&mut self, error: &ClientError) {}
}

/// Sink that discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {}
