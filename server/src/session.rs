//! Server-side protocol state machine
//!
//! This module owns everything the server knows about its peers:
//! - The presence directory and the id allocator
//! - The authoritative, append-only message log
//! - Per-peer sequence tracking with gap detection
//! - Keepalive pings, RTT measurement and liveness timeouts
//!
//! It performs no I/O. Datagrams are fed in together with the current time
//! and every reply or broadcast is queued in an outbox that the network
//! layer flushes once per tick.

use log::{debug, info, warn};
use shared::protocol::resolve_range;
use shared::{
    ClientPacket, Directory, ServerPacket, Timings, User, UserId, UserMessage, DESCRIBE_ALL,
    LOGIN_REJECTED,
};
use std::net::SocketAddr;
use std::time::Instant;

/// A packet waiting to be sent to one peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    pub addr: SocketAddr,
    pub packet: ServerPacket,
}

/// Hands out user ids. Ids start at 1 and are never reused.
#[derive(Debug)]
pub struct IdAllocator {
    next: UserId,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self { next: 1 }
    }

    pub fn allocate(&mut self) -> UserId {
        let id = self.next;
        self.next += 1;
        id
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ServerSession {
    users: Directory,
    log: Vec<UserMessage>,
    ids: IdAllocator,
    timings: Timings,
    /// Reference point for ping timestamps
    epoch: Instant,
    outbox: Vec<Outgoing>,
}

impl ServerSession {
    pub fn new(timings: Timings, now: Instant) -> Self {
        Self {
            users: Directory::new(),
            log: Vec::new(),
            ids: IdAllocator::new(),
            timings,
            epoch: now,
            outbox: Vec::new(),
        }
    }

    pub fn users(&self) -> &Directory {
        &self.users
    }

    pub fn message_log(&self) -> &[UserMessage] {
        &self.log
    }

    /// Takes every packet queued since the last call.
    pub fn take_outbox(&mut self) -> Vec<Outgoing> {
        std::mem::take(&mut self.outbox)
    }

    /// Milliseconds since the session started, as carried in pings.
    fn timestamp_ms(&self, now: Instant) -> i64 {
        i64::try_from(now.saturating_duration_since(self.epoch).as_millis()).unwrap_or(i64::MAX)
    }

    fn send(&mut self, addr: SocketAddr, packet: ServerPacket) {
        self.outbox.push(Outgoing { addr, packet });
    }

    /// Queues `packet` for every connected user accepted by `filter`.
    fn broadcast(&mut self, packet: &ServerPacket, filter: impl Fn(&User) -> bool) {
        for user in self.users.iter() {
            if user.disconnected || !filter(user) {
                continue;
            }
            if let Some(addr) = user.addr {
                self.outbox.push(Outgoing {
                    addr,
                    packet: packet.clone(),
                });
            }
        }
    }

    /// Processes one raw datagram received from `from`.
    pub fn handle_datagram(&mut self, data: &[u8], from: SocketAddr, now: Instant) {
        let sender = self.users.by_addr_mut(from).map(|user| {
            if !user.disconnected {
                user.touch(now);
            }
            (user.id, user.disconnected)
        });

        if let Some((id, true)) = sender {
            warn!("Ignoring packet from disconnected user {} at {}", id, from);
            return;
        }
        let sender = sender.map(|(id, _)| id);

        let packet = match ClientPacket::decode(data) {
            Ok(Some(packet)) => packet,
            Ok(None) => {
                debug!("Ignoring packet of unknown type from {}", from);
                return;
            }
            Err(e) => {
                warn!("Dropping malformed packet from {}: {}", from, e);
                return;
            }
        };

        if let ClientPacket::Login { name } = packet {
            self.handle_login(sender, name, from, now);
            return;
        }

        let Some(sender) = sender else {
            debug!("Ignoring {:?} packet from unknown address {}", packet.kind(), from);
            return;
        };

        match packet {
            ClientPacket::Login { .. } => {}
            ClientPacket::Message { seq, text } => self.handle_message(sender, seq, text, from),
            ClientPacket::IdentifyRequest { user_id } => self.handle_identify(sender, user_id, from),
            ClientPacket::ResendRequest { from: start, to } => {
                self.handle_resend(sender, start, to, from)
            }
            ClientPacket::Ping { timestamp, .. } => self.handle_ping(sender, timestamp, now),
            ClientPacket::Disconnect => self.handle_disconnect(sender),
            ClientPacket::Typing => {
                let packet = ServerPacket::Typing { user_id: sender };
                self.broadcast(&packet, |user| user.id != sender);
            }
        }
    }

    fn handle_login(&mut self, sender: Option<UserId>, name: String, addr: SocketAddr, now: Instant) {
        if let Some(user_id) = sender {
            debug!("Repeated login from {}, resending id {}", addr, user_id);
            self.send(addr, ServerPacket::LoginReply { user_id });
            return;
        }

        let taken = self
            .users
            .iter()
            .any(|user| !user.disconnected && user.name == name);
        if taken {
            info!("Rejecting login from {}: name {:?} is in use", addr, name);
            self.send(
                addr,
                ServerPacket::LoginReply {
                    user_id: LOGIN_REJECTED,
                },
            );
            return;
        }

        let user_id = self.ids.allocate();
        let mut user = User::remote(name.clone(), user_id, addr, now);
        user.next_ping_at = now + self.timings.ping_interval();

        let announce = ServerPacket::Identify {
            user_id,
            disconnected: false,
            name,
        };
        self.broadcast(&announce, |_| true);

        info!("{} connected", user);
        self.users.add(user);
        self.send(addr, ServerPacket::LoginReply { user_id });
    }

    fn handle_message(&mut self, sender: UserId, seq: i32, text: String, addr: SocketAddr) {
        let Some(user) = self.users.get_mut(sender) else {
            return;
        };

        let expected = user.next_expected_seq;
        if seq < expected {
            warn!("Discarding old message {} from {}", seq, user);
            return;
        }
        if seq > expected {
            let Some(to) = seq.checked_add(1) else {
                warn!("Dropping message with out of range sequence {} from {}", seq, user);
                return;
            };
            warn!(
                "Message drop detected from {}: expected {}, got {} ({} missing)",
                user,
                expected,
                seq,
                i64::from(seq) - i64::from(expected)
            );
            self.send(
                addr,
                ServerPacket::ResendRequest {
                    from: expected,
                    to,
                },
            );
            return;
        }

        user.next_expected_seq += 1;
        let message = UserMessage::new(user, text);
        info!("{}", message);

        let index = self.log.len() as i32;
        let relay = ServerPacket::Message {
            index,
            sender_id: sender,
            text: message.text.clone(),
        };
        self.broadcast(&relay, |_| true);
        self.log.push(message);
    }

    fn handle_identify(&mut self, sender: UserId, user_id: UserId, addr: SocketAddr) {
        let describe = |user: &User| ServerPacket::Identify {
            user_id: user.id,
            disconnected: user.disconnected,
            name: user.name.clone(),
        };

        if user_id == DESCRIBE_ALL {
            let replies: Vec<ServerPacket> = self
                .users
                .iter()
                .filter(|user| user.id != sender)
                .map(describe)
                .collect();
            for packet in replies {
                self.send(addr, packet);
            }
            return;
        }

        match self.users.get(user_id).map(describe) {
            Some(packet) => self.send(addr, packet),
            None => warn!("User {} asked about unknown user id {}", sender, user_id),
        }
    }

    fn handle_resend(&mut self, sender: UserId, from: i32, to: i32, addr: SocketAddr) {
        let Some(range) = resolve_range(from, to, self.log.len()) else {
            warn!(
                "User {} requested an invalid range of messages, from {} to {}",
                sender, from, to
            );
            return;
        };

        debug!("Replaying messages {:?} to user {}", range, sender);
        for index in range {
            let message = &self.log[index];
            let packet = ServerPacket::Message {
                index: index as i32,
                sender_id: message.sender_id,
                text: message.text.clone(),
            };
            self.outbox.push(Outgoing { addr, packet });
        }
    }

    fn handle_ping(&mut self, sender: UserId, timestamp: i64, now: Instant) {
        let rtt = match self.timestamp_ms(now).checked_sub(timestamp) {
            Some(elapsed) if elapsed >= 0 => elapsed / 2,
            _ => {
                warn!("User {} echoed a bogus ping timestamp ({})", sender, timestamp);
                return;
            }
        };
        let ping_ms = i32::try_from(rtt).unwrap_or(i32::MAX);

        if let Some(user) = self.users.get_mut(sender) {
            user.ping_ms = ping_ms;
        }
        let packet = ServerPacket::UserPing {
            user_id: sender,
            ping_ms,
        };
        self.broadcast(&packet, |_| true);
    }

    fn handle_disconnect(&mut self, sender: UserId) {
        let Some(user) = self.users.get_mut(sender) else {
            return;
        };
        user.disconnect();
        info!("{} disconnected", user);

        // The sender is now flagged, so the broadcast skips it.
        let packet = ServerPacket::Disconnected { user_id: sender };
        self.broadcast(&packet, |_| true);
    }

    /// Per-tick housekeeping: keepalive pings and liveness timeouts.
    ///
    /// Timed-out users are only flagged; unlike an explicit disconnect this
    /// is not announced to the other peers.
    pub fn sweep(&mut self, now: Instant) {
        let timestamp = self.timestamp_ms(now);
        let message_count = self.log.len() as i32;
        let timeout = self.timings.liveness_timeout();
        let interval = self.timings.ping_interval();

        for user in self.users.iter_mut() {
            if user.disconnected {
                continue;
            }
            if user.is_timed_out(now, timeout) {
                user.disconnect();
                info!("{} timed out", user);
                continue;
            }
            if now >= user.next_ping_at {
                user.next_ping_at = now + interval;
                if let Some(addr) = user.addr {
                    self.outbox.push(Outgoing {
                        addr,
                        packet: ServerPacket::Ping {
                            timestamp,
                            message_count,
                        },
                    });
                }
            }
        }
    }
}
