//! Users and chat messages as both endpoints track them.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Server-assigned user identifier.
pub type UserId = i64;

/// A chat participant.
///
/// The server creates one per successful login and binds it to the peer's
/// address. Clients create address-less mirrors the first time the server
/// identifies a user. Equality and hashing use the id alone.
#[derive(Debug, Clone)]
pub struct User {
    pub name: String,
    pub id: UserId,
    pub disconnected: bool,
    pub ping_ms: i32,
    /// Last time any packet concerning this user arrived
    pub last_seen: Instant,
    /// Peer address; only set on the server
    pub addr: Option<SocketAddr>,
    /// Next chat sequence number expected from this peer (server)
    pub next_expected_seq: i32,
    /// When the next keepalive ping is due (server)
    pub next_ping_at: Instant,
    /// Typing indicator deadline (client)
    pub typing_until: Option<Instant>,
}

impl User {
    /// Creates a server-side session for a peer that just logged in.
    pub fn remote(name: String, id: UserId, addr: SocketAddr, now: Instant) -> Self {
        Self {
            name,
            id,
            disconnected: false,
            ping_ms: 0,
            last_seen: now,
            addr: Some(addr),
            next_expected_seq: 0,
            next_ping_at: now,
            typing_until: None,
        }
    }

    /// Creates a client-side mirror of a server-assigned user.
    pub fn mirror(name: String, id: UserId, now: Instant) -> Self {
        Self {
            name,
            id,
            disconnected: false,
            ping_ms: 0,
            last_seen: now,
            addr: None,
            next_expected_seq: 0,
            next_ping_at: now,
            typing_until: None,
        }
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_seen = now;
    }

    pub fn is_timed_out(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) >= timeout
    }

    /// Marks the user disconnected. Returns false if it already was.
    pub fn disconnect(&mut self) -> bool {
        !std::mem::replace(&mut self.disconnected, true)
    }

    pub fn is_typing(&self) -> bool {
        self.typing_until.is_some()
    }

    /// Pushes the typing deadline out. Returns true if the user was not
    /// typing before.
    pub fn start_typing(&mut self, now: Instant, expiry: Duration) -> bool {
        self.typing_until.replace(now + expiry).is_none()
    }

    /// Clears the typing indicator. Returns true if it was set.
    pub fn stop_typing(&mut self) -> bool {
        self.typing_until.take().is_some()
    }

    pub fn typing_expired(&self, now: Instant) -> bool {
        matches!(self.typing_until, Some(deadline) if now > deadline)
    }
}

impl PartialEq for User {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for User {}

impl Hash for User {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.id)?;
        if let Some(addr) = self.addr {
            write!(f, " @{}", addr)?;
        }
        write!(f, " ({} ms", self.ping_ms)?;
        if self.disconnected {
            write!(f, ", disconnected")?;
        }
        write!(f, ")")
    }
}

/// A chat line as stored in the server log or handed to the presentation
/// layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserMessage {
    pub sender_id: UserId,
    pub sender_name: String,
    pub text: String,
}

impl UserMessage {
    pub fn new(sender: &User, text: String) -> Self {
        Self {
            sender_id: sender.id,
            sender_name: sender.name.clone(),
            text,
        }
    }
}

impl fmt::Display for UserMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.sender_name, self.text)
    }
}
