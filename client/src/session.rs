//! Client-side protocol state machine
//!
//! Tracks what the client knows about the chat: the mirrored presence
//! directory, how many server messages it has consumed, the buffer of its
//! own sent messages (kept for resends), and the liveness of the server
//! connection.
//!
//! Like the server session it performs no I/O. The network layer feeds it
//! datagrams and the current time, then sends whatever it queued.

use crate::error::ClientError;
use crate::events::EventSink;
use log::{debug, info, warn};
use shared::protocol::resolve_range;
use shared::{
    ClientPacket, Directory, ServerPacket, Timings, User, UserId, UserMessage, DESCRIBE_ALL,
};
use std::time::{Duration, Instant};

/// Lifecycle of a client session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Connected,
    Exiting,
    Closed,
}

pub struct ClientSession {
    me: UserId,
    users: Directory,
    /// Our own chat messages, indexed by their sequence number
    sent: Vec<String>,
    /// Server messages accepted so far; the next expected global index
    consumed: i32,
    last_server_packet: Instant,
    last_timeout_warning: u64,
    /// Whether the one-shot presence request has gone out
    bootstrapped: bool,
    inbound_paused_until: Option<Instant>,
    timings: Timings,
    outbox: Vec<ClientPacket>,
    events: Box<dyn EventSink + Send>,
}

impl ClientSession {
    /// Starts a session for the user the server just admitted.
    pub fn new(
        name: String,
        id: UserId,
        timings: Timings,
        mut events: Box<dyn EventSink + Send>,
        now: Instant,
    ) -> Self {
        let me = User::mirror(name, id, now);
        events.user_connected(&me);

        let mut users = Directory::new();
        users.add(me);

        Self {
            me: id,
            users,
            sent: Vec::new(),
            consumed: 0,
            last_server_packet: now,
            last_timeout_warning: 0,
            bootstrapped: false,
            inbound_paused_until: None,
            timings,
            outbox: Vec::new(),
            events,
        }
    }

    pub fn user_id(&self) -> UserId {
        self.me
    }

    pub fn users(&self) -> &Directory {
        &self.users
    }

    /// Number of server messages accepted in order.
    pub fn consumed(&self) -> i32 {
        self.consumed
    }

    pub fn sent_messages(&self) -> &[String] {
        &self.sent
    }

    pub fn take_outbox(&mut self) -> Vec<ClientPacket> {
        std::mem::take(&mut self.outbox)
    }

    pub fn report_fatal(&mut self, error: &ClientError) {
        self.events.fatal_error(error);
    }

    /// Buffers a chat message under the next sequence number and queues it.
    pub fn send_message(&mut self, text: String) {
        let seq = self.sent.len() as i32;
        self.sent.push(text.clone());
        self.outbox.push(ClientPacket::Message { seq, text });
    }

    pub fn send_typing(&mut self) {
        self.outbox.push(ClientPacket::Typing);
    }

    pub fn send_disconnect(&mut self) {
        self.outbox.push(ClientPacket::Disconnect);
    }

    /// True while inbound processing is held back after the presence
    /// bootstrap request.
    pub fn inbound_paused(&self, now: Instant) -> bool {
        matches!(self.inbound_paused_until, Some(until) if now < until)
    }

    /// Processes one datagram from the server.
    pub fn handle_datagram(&mut self, data: &[u8], now: Instant) {
        self.last_server_packet = now;

        let packet = match ServerPacket::decode(data) {
            Ok(Some(packet)) => packet,
            Ok(None) => {
                debug!("Ignoring packet of unknown type from server");
                return;
            }
            Err(e) => {
                warn!("Dropping malformed packet from server: {}", e);
                return;
            }
        };

        match packet {
            ServerPacket::LoginReply { user_id } => {
                debug!("Ignoring late login reply (id {})", user_id);
            }
            ServerPacket::Message {
                index,
                sender_id,
                text,
            } => self.handle_message(index, sender_id, text, now),
            ServerPacket::ResendRequest { from, to } => self.handle_resend(from, to),
            ServerPacket::Identify {
                user_id,
                disconnected,
                name,
            } => self.handle_identify(user_id, disconnected, name, now),
            ServerPacket::Ping {
                timestamp,
                message_count,
            } => self.handle_ping(timestamp, message_count, now),
            ServerPacket::UserPing { user_id, ping_ms } => {
                self.handle_user_ping(user_id, ping_ms, now)
            }
            ServerPacket::Disconnected { user_id } => self.handle_disconnected(user_id),
            ServerPacket::Typing { user_id } => self.handle_typing(user_id, now),
        }
    }

    fn handle_message(&mut self, index: i32, sender_id: UserId, text: String, now: Instant) {
        if index < self.consumed {
            warn!("Discarding old message {} from server", index);
            return;
        }
        if index > self.consumed {
            let Some(to) = index.checked_add(1) else {
                warn!("Dropping message with out of range index {} from server", index);
                return;
            };
            warn!(
                "Message drop detected from server: expected {}, got {} ({} missing)",
                self.consumed,
                index,
                index - self.consumed
            );
            self.outbox.push(ClientPacket::ResendRequest {
                from: self.consumed,
                to,
            });
            return;
        }

        let Some(user) = self.users.get_mut(sender_id) else {
            info!("Message from unknown user id {}, requesting info", sender_id);
            self.outbox.push(ClientPacket::IdentifyRequest { user_id: sender_id });
            return;
        };

        self.consumed += 1;
        if user.stop_typing() {
            self.events.user_stop_typing(user);
        }
        if !user.disconnected {
            user.touch(now);
        }

        let message = UserMessage::new(user, text);
        info!("{}", message);
        self.events.message_received(&message);
    }

    fn handle_resend(&mut self, from: i32, to: i32) {
        let Some(range) = resolve_range(from, to, self.sent.len()) else {
            warn!(
                "Server requested an invalid range of messages, from {} to {}",
                from, to
            );
            return;
        };

        debug!("Resending messages {:?}", range);
        for seq in range {
            self.outbox.push(ClientPacket::Message {
                seq: seq as i32,
                text: self.sent[seq].clone(),
            });
        }
    }

    fn handle_identify(&mut self, user_id: UserId, disconnected: bool, name: String, now: Instant) {
        if self.users.get(user_id).is_some() {
            return;
        }

        let mut user = User::mirror(name, user_id, now);
        if disconnected {
            user.disconnect();
        } else {
            self.events.user_connected(&user);
        }
        info!("User id {} identified as {}", user_id, user);
        self.users.add(user);
    }

    fn handle_ping(&mut self, timestamp: i64, message_count: i32, now: Instant) {
        self.outbox.push(ClientPacket::Ping {
            timestamp,
            message_count,
        });

        if message_count < 0 {
            warn!("Server ping carries a negative message count");
        }
        if message_count <= self.consumed {
            return;
        }

        if !self.bootstrapped {
            self.bootstrapped = true;
            info!("Requesting users from server");
            self.outbox.push(ClientPacket::IdentifyRequest {
                user_id: DESCRIBE_ALL,
            });
            self.inbound_paused_until = Some(now + self.timings.bootstrap_pause());
        } else {
            warn!(
                "Running {} messages behind the server, requesting",
                message_count - self.consumed
            );
            self.outbox.push(ClientPacket::ResendRequest {
                from: self.consumed,
                to: message_count,
            });
        }
    }

    fn handle_user_ping(&mut self, user_id: UserId, ping_ms: i32, now: Instant) {
        let Some(user) = self.users.get_mut(user_id) else {
            info!("Ping value for unknown user id {}, requesting info", user_id);
            self.outbox.push(ClientPacket::IdentifyRequest { user_id });
            return;
        };
        if user.disconnected {
            warn!("Server sent a ping value for disconnected user {}", user);
            return;
        }
        if ping_ms < 0 {
            warn!("Server sent a negative ping for {}", user);
            return;
        }

        user.touch(now);
        user.ping_ms = ping_ms;
        self.events.ping_updated(user);
    }

    fn handle_disconnected(&mut self, user_id: UserId) {
        let Some(user) = self.users.get_mut(user_id) else {
            return;
        };
        if !user.disconnect() {
            return;
        }
        if user.stop_typing() {
            self.events.user_stop_typing(user);
        }
        info!("{} disconnected", user);
        self.events.user_disconnected(user);
    }

    fn handle_typing(&mut self, user_id: UserId, now: Instant) {
        let expiry = self.timings.typing_expiry();
        let Some(user) = self.users.get_mut(user_id) else {
            return;
        };
        if user.disconnected {
            return;
        }
        if user.start_typing(now, expiry) {
            self.events.user_start_typing(user);
        }
    }

    /// Checks how long the server has been silent.
    ///
    /// Every newly elapsed second is reported as a warning and refreshes
    /// the liveness of all connected users, so a stall on the server link
    /// is not mistaken for everyone leaving. Past the liveness timeout the
    /// session is over.
    pub fn check_server(&mut self, now: Instant) -> Result<(), ClientError> {
        let silent = now.saturating_duration_since(self.last_server_packet);
        let seconds = silent.as_secs();

        if seconds > self.timings.liveness_timeout_secs {
            return Err(ClientError::ServerTimeout { seconds });
        }

        if seconds > self.last_timeout_warning {
            self.last_timeout_warning = seconds;
            warn!(
                "Lost connection to the server, retrying... ({}/{})",
                seconds, self.timings.liveness_timeout_secs
            );
            self.events.timeout_warning(seconds);
            for user in self.users.iter_mut() {
                if !user.disconnected {
                    user.touch(now);
                }
            }
        } else if seconds == 0 && self.last_timeout_warning != 0 {
            self.last_timeout_warning = 0;
            info!("Connection restored");
            self.events.connection_restored();
        }
        Ok(())
    }

    /// Expires typing indicators and flags users that went silent.
    pub fn sweep_users(&mut self, now: Instant) {
        let timeout = self.timings.liveness_timeout();

        for user in self.users.iter_mut() {
            if user.typing_expired(now) {
                user.stop_typing();
                self.events.user_stop_typing(user);
            }
            if !user.disconnected && user.is_timed_out(now, timeout) {
                user.disconnect();
                if user.stop_typing() {
                    self.events.user_stop_typing(user);
                }
                info!("{} timed out", user);
                self.events.user_disconnected(user);
            }
        }
    }

    /// Time left until a paused inbound queue may be drained again.
    pub fn pause_remaining(&self, now: Instant) -> Duration {
        self.inbound_paused_until
            .map(|until| until.saturating_duration_since(now))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        Connected(UserId),
        Disconnected(UserId),
        StartTyping(UserId),
        StopTyping(UserId),
        Message(UserId, String),
        Ping(UserId, i32),
        TimeoutWarning(u64),
        Restored,
    }

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<Event>>>);

    impl Recorder {
        fn take(&self) -> Vec<Event> {
            std::mem::take(&mut *self.0.lock().unwrap())
        }
    }

    impl EventSink for Recorder {
        fn user_connected(&mut self, user: &User) {
            self.0.lock().unwrap().push(Event::Connected(user.id));
        }
        fn user_disconnected(&mut self, user: &User) {
            self.0.lock().unwrap().push(Event::Disconnected(user.id));
        }
        fn user_start_typing(&mut self, user: &User) {
            self.0.lock().unwrap().push(Event::StartTyping(user.id));
        }
        fn user_stop_typing(&mut self, user: &User) {
            self.0.lock().unwrap().push(Event::StopTyping(user.id));
        }
        fn message_received(&mut self, message: &UserMessage) {
            self.0
                .lock()
                .unwrap()
                .push(Event::Message(message.sender_id, message.text.clone()));
        }
        fn ping_updated(&mut self, user: &User) {
            self.0.lock().unwrap().push(Event::Ping(user.id, user.ping_ms));
        }
        fn timeout_warning(&mut self, seconds: u64) {
            self.0.lock().unwrap().push(Event::TimeoutWarning(seconds));
        }
        fn connection_restored(&mut self) {
            self.0.lock().unwrap().push(Event::Restored);
        }
    }

    fn setup(now: Instant) -> (ClientSession, Recorder) {
        let recorder = Recorder::default();
        let session = ClientSession::new(
            "alice".to_string(),
            1,
            Timings::default(),
            Box::new(recorder.clone()),
            now,
        );
        assert_eq!(recorder.take(), vec![Event::Connected(1)]);
        (session, recorder)
    }

    fn feed(session: &mut ClientSession, packet: ServerPacket, now: Instant) {
        let data = packet.encode().unwrap();
        session.handle_datagram(&data, now);
    }

    fn identify(session: &mut ClientSession, user_id: UserId, name: &str, now: Instant) {
        feed(
            session,
            ServerPacket::Identify {
                user_id,
                disconnected: false,
                name: name.to_string(),
            },
            now,
        );
    }

    fn message(index: i32, sender_id: UserId, text: &str) -> ServerPacket {
        ServerPacket::Message {
            index,
            sender_id,
            text: text.to_string(),
        }
    }

    #[test]
    fn test_messages_are_delivered_in_order_once() {
        let now = Instant::now();
        let (mut session, recorder) = setup(now);

        feed(&mut session, message(0, 1, "first"), now);
        feed(&mut session, message(0, 1, "first"), now);
        feed(&mut session, message(1, 1, "second"), now);

        assert_eq!(
            recorder.take(),
            vec![
                Event::Message(1, "first".to_string()),
                Event::Message(1, "second".to_string()),
            ]
        );
        assert_eq!(session.consumed(), 2);
        assert!(session.take_outbox().is_empty());
    }

    #[test]
    fn test_gap_requests_resend_and_waits() {
        let now = Instant::now();
        let (mut session, recorder) = setup(now);

        feed(&mut session, message(2, 1, "third"), now);
        assert_eq!(
            session.take_outbox(),
            vec![ClientPacket::ResendRequest { from: 0, to: 3 }]
        );
        assert!(recorder.take().is_empty());
        assert_eq!(session.consumed(), 0);

        // The replay then arrives in order.
        for (index, text) in ["first", "second", "third"].iter().enumerate() {
            feed(&mut session, message(index as i32, 1, text), now);
        }
        assert_eq!(session.consumed(), 3);
        assert_eq!(recorder.take().len(), 3);
    }

    #[test]
    fn test_max_index_is_dropped() {
        let now = Instant::now();
        let (mut session, recorder) = setup(now);

        feed(&mut session, message(i32::MAX, 1, "overflow"), now);
        assert!(session.take_outbox().is_empty());
        assert!(recorder.take().is_empty());

        feed(&mut session, message(0, 1, "first"), now);
        assert_eq!(session.consumed(), 1);
        assert_eq!(recorder.take(), vec![Event::Message(1, "first".to_string())]);
    }

    #[test]
    fn test_unknown_sender_is_identified_first() {
        let now = Instant::now();
        let (mut session, recorder) = setup(now);

        feed(&mut session, message(0, 7, "hello"), now);
        assert_eq!(
            session.take_outbox(),
            vec![ClientPacket::IdentifyRequest { user_id: 7 }]
        );
        assert_eq!(session.consumed(), 0);

        identify(&mut session, 7, "bob", now);
        feed(&mut session, message(0, 7, "hello"), now);
        assert_eq!(
            recorder.take(),
            vec![Event::Connected(7), Event::Message(7, "hello".to_string())]
        );
    }

    #[test]
    fn test_identify_is_idempotent() {
        let now = Instant::now();
        let (mut session, recorder) = setup(now);

        identify(&mut session, 2, "bob", now);
        identify(&mut session, 2, "robert", now);
        feed(
            &mut session,
            ServerPacket::Identify {
                user_id: 3,
                disconnected: true,
                name: "carol".to_string(),
            },
            now,
        );

        assert_eq!(recorder.take(), vec![Event::Connected(2)]);
        assert_eq!(session.users().get(2).unwrap().name, "bob");
        assert!(session.users().get(3).unwrap().disconnected);
    }

    #[test]
    fn test_ping_echo_and_bootstrap() {
        let now = Instant::now();
        let (mut session, _recorder) = setup(now);

        let ping = ServerPacket::Ping {
            timestamp: 1234,
            message_count: 0,
        };
        feed(&mut session, ping, now);
        assert_eq!(
            session.take_outbox(),
            vec![ClientPacket::Ping {
                timestamp: 1234,
                message_count: 0,
            }]
        );

        // First gap: ask for everyone and hold inbound processing.
        let ping = ServerPacket::Ping {
            timestamp: 1634,
            message_count: 3,
        };
        feed(&mut session, ping, now);
        assert_eq!(
            session.take_outbox(),
            vec![
                ClientPacket::Ping {
                    timestamp: 1634,
                    message_count: 3,
                },
                ClientPacket::IdentifyRequest {
                    user_id: DESCRIBE_ALL,
                },
            ]
        );
        assert!(session.inbound_paused(now));
        assert_eq!(session.pause_remaining(now), Duration::from_millis(100));
        assert!(!session.inbound_paused(now + Duration::from_millis(100)));

        // Later gaps: ask for exactly the missing range.
        let ping = ServerPacket::Ping {
            timestamp: 2034,
            message_count: 3,
        };
        feed(&mut session, ping, now);
        assert_eq!(
            session.take_outbox()[1],
            ClientPacket::ResendRequest { from: 0, to: 3 }
        );
    }

    #[test]
    fn test_resend_request_replays_sent_buffer() {
        let now = Instant::now();
        let (mut session, _recorder) = setup(now);

        session.send_message("a".to_string());
        session.send_message("b".to_string());
        session.send_message("c".to_string());
        session.take_outbox();

        feed(&mut session, ServerPacket::ResendRequest { from: 1, to: 3 }, now);
        assert_eq!(
            session.take_outbox(),
            vec![
                ClientPacket::Message {
                    seq: 1,
                    text: "b".to_string(),
                },
                ClientPacket::Message {
                    seq: 2,
                    text: "c".to_string(),
                },
            ]
        );

        feed(&mut session, ServerPacket::ResendRequest { from: 0, to: 4 }, now);
        assert!(session.take_outbox().is_empty());
    }

    #[test]
    fn test_user_ping_values() {
        let now = Instant::now();
        let (mut session, recorder) = setup(now);

        feed(&mut session, ServerPacket::UserPing { user_id: 1, ping_ms: 25 }, now);
        feed(&mut session, ServerPacket::UserPing { user_id: 1, ping_ms: -5 }, now);
        feed(&mut session, ServerPacket::UserPing { user_id: 9, ping_ms: 5 }, now);

        assert_eq!(recorder.take(), vec![Event::Ping(1, 25)]);
        assert_eq!(session.users().get(1).unwrap().ping_ms, 25);
        assert_eq!(
            session.take_outbox(),
            vec![ClientPacket::IdentifyRequest { user_id: 9 }]
        );
    }

    #[test]
    fn test_typing_and_disconnect() {
        let now = Instant::now();
        let (mut session, recorder) = setup(now);
        identify(&mut session, 2, "bob", now);
        recorder.take();

        feed(&mut session, ServerPacket::Typing { user_id: 2 }, now);
        feed(
            &mut session,
            ServerPacket::Typing { user_id: 2 },
            now + Duration::from_millis(500),
        );
        feed(&mut session, ServerPacket::Disconnected { user_id: 2 }, now);
        feed(&mut session, ServerPacket::Disconnected { user_id: 2 }, now);
        feed(&mut session, ServerPacket::Typing { user_id: 2 }, now);

        assert_eq!(
            recorder.take(),
            vec![
                Event::StartTyping(2),
                Event::StopTyping(2),
                Event::Disconnected(2),
            ]
        );
    }

    #[test]
    fn test_message_clears_typing() {
        let now = Instant::now();
        let (mut session, recorder) = setup(now);
        identify(&mut session, 2, "bob", now);
        feed(&mut session, ServerPacket::Typing { user_id: 2 }, now);
        recorder.take();

        feed(&mut session, message(0, 2, "done"), now);
        assert_eq!(
            recorder.take(),
            vec![Event::StopTyping(2), Event::Message(2, "done".to_string())]
        );
    }

    #[test]
    fn test_typing_expires() {
        let now = Instant::now();
        let (mut session, recorder) = setup(now);
        identify(&mut session, 2, "bob", now);
        feed(&mut session, ServerPacket::Typing { user_id: 2 }, now);
        recorder.take();

        session.sweep_users(now + Duration::from_millis(2999));
        assert!(recorder.take().is_empty());
        session.sweep_users(now + Duration::from_millis(3001));
        assert_eq!(recorder.take(), vec![Event::StopTyping(2)]);
    }

    #[test]
    fn test_silent_user_disconnects_exactly_once() {
        let now = Instant::now();
        let (mut session, recorder) = setup(now);
        identify(&mut session, 2, "bob", now);
        recorder.take();

        let later = now + Duration::from_secs(5);
        feed(&mut session, ServerPacket::UserPing { user_id: 1, ping_ms: 10 }, later);
        feed(&mut session, ServerPacket::Typing { user_id: 2 }, later);
        recorder.take();

        // Bob has been silent for ten seconds; alice was seen five seconds ago.
        let deadline = now + Duration::from_secs(10);
        session.sweep_users(deadline);
        session.sweep_users(deadline + Duration::from_millis(16));

        assert_eq!(
            recorder.take(),
            vec![Event::StopTyping(2), Event::Disconnected(2)]
        );
        assert!(session.users().get(2).unwrap().disconnected);
        assert!(!session.users().get(1).unwrap().disconnected);
    }

    #[test]
    fn test_server_silence_warnings_and_restore() {
        let now = Instant::now();
        let (mut session, recorder) = setup(now);

        session.check_server(now + Duration::from_millis(500)).unwrap();
        assert!(recorder.take().is_empty());

        session.check_server(now + Duration::from_millis(1100)).unwrap();
        session.check_server(now + Duration::from_millis(1500)).unwrap();
        session.check_server(now + Duration::from_millis(2100)).unwrap();
        assert_eq!(
            recorder.take(),
            vec![Event::TimeoutWarning(1), Event::TimeoutWarning(2)]
        );

        let back = now + Duration::from_millis(2200);
        feed(&mut session, ServerPacket::Typing { user_id: 99 }, back);
        session.check_server(back).unwrap();
        assert_eq!(recorder.take(), vec![Event::Restored]);
    }

    #[test]
    fn test_server_silence_is_fatal() {
        let now = Instant::now();
        let (mut session, _recorder) = setup(now);

        assert!(session.check_server(now + Duration::from_secs(10)).is_ok());
        let result = session.check_server(now + Duration::from_secs(11));
        assert!(matches!(
            result,
            Err(ClientError::ServerTimeout { seconds: 11 })
        ));
    }

    #[test]
    fn test_outbound_sequence_numbers() {
        let now = Instant::now();
        let (mut session, _recorder) = setup(now);

        session.send_typing();
        session.send_message("hi".to_string());
        session.send_message("there".to_string());
        session.send_disconnect();

        assert_eq!(
            session.take_outbox(),
            vec![
                ClientPacket::Typing,
                ClientPacket::Message {
                    seq: 0,
                    text: "hi".to_string(),
                },
                ClientPacket::Message {
                    seq: 1,
                    text: "there".to_string(),
                },
                ClientPacket::Disconnect,
            ]
        );
        assert_eq!(session.sent_messages().len(), 2);
    }
}
