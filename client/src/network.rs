//! Client network layer: login handshake, command queue and the tick loop

use crate::error::ClientError;
use crate::events::EventSink;
use crate::session::{ClientSession, SessionState};
use log::{debug, error, info, warn};
use shared::transport::{spawn_receiver, Inbound, ReceiverTask};
use shared::{ClientPacket, ServerPacket, Timings, UserId, PACKET_SIZE, PAYLOAD_SIZE};
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, timeout, MissedTickBehavior};

/// Work requested by the application, executed on the next tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    SendMessage(String),
    Typing,
    Exit,
}

/// Cloneable handle for queueing commands from any thread or task
#[derive(Debug, Clone)]
pub struct ClientHandle {
    commands: mpsc::UnboundedSender<ClientCommand>,
    state: watch::Receiver<SessionState>,
}

impl ClientHandle {
    /// Queues a chat message. Returns `false` if the text does not fit in a
    /// single packet, in which case nothing is queued.
    pub fn send_message(&self, text: &str) -> bool {
        if text.len() > PAYLOAD_SIZE {
            return false;
        }
        self.send(ClientCommand::SendMessage(text.to_string()));
        true
    }

    pub fn typing(&self) {
        self.send(ClientCommand::Typing);
    }

    /// Asks the client to announce its departure and stop.
    pub fn exit(&self) {
        self.send(ClientCommand::Exit);
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    fn send(&self, command: ClientCommand) {
        // The loop is gone once it exits; late commands have nowhere to go.
        if self.commands.send(command).is_err() {
            debug!("Client loop has stopped, dropping command");
        }
    }
}

/// Chat client driving a [`ClientSession`] at a fixed tick rate
pub struct Client {
    socket: Option<Arc<UdpSocket>>,
    session: ClientSession,
    state: watch::Sender<SessionState>,
    timings: Timings,
    drop_rate: f64,

    commands: mpsc::UnboundedReceiver<ClientCommand>,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    inbound_rx: mpsc::UnboundedReceiver<Inbound>,
    receiver: Option<ReceiverTask>,
}

impl Client {
    /// Logs in to the server at `server` as `name`.
    ///
    /// The login packet is sent up to `handshake_attempts` times, waiting
    /// `handshake_timeout_ms` for a reply after each. Returns the running
    /// client together with a handle for queueing commands.
    pub async fn connect(
        name: &str,
        server: SocketAddr,
        timings: Timings,
        events: Box<dyn EventSink + Send>,
    ) -> Result<(Client, ClientHandle), ClientError> {
        if name.len() > PAYLOAD_SIZE {
            return Err(ClientError::NameTooLong);
        }

        let (state_tx, state_rx) = watch::channel(SessionState::Connecting);

        let local: SocketAddr = if server.is_ipv6() {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(server).await?;
        info!("Connecting to {} as {}", server, name);

        let user_id = handshake(&socket, name, &timings).await?;
        info!("Logged in with user id {}", user_id);

        let session = ClientSession::new(
            name.to_string(),
            user_id,
            timings.clone(),
            events,
            Instant::now(),
        );
        state_tx.send_replace(SessionState::Connected);

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let client = Client {
            socket: Some(Arc::new(socket)),
            session,
            state: state_tx,
            timings,
            drop_rate: 0.0,
            commands: command_rx,
            inbound_tx,
            inbound_rx,
            receiver: None,
        };
        let handle = ClientHandle {
            commands: command_tx,
            state: state_rx,
        };
        Ok((client, handle))
    }

    /// Randomly discards this fraction of inbound datagrams.
    pub fn with_drop_rate(mut self, drop_rate: f64) -> Self {
        self.drop_rate = drop_rate;
        self
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn user_id(&self) -> UserId {
        self.session.user_id()
    }

    /// Runs the tick loop until the application exits or the session fails.
    ///
    /// Failures are reported to the event sink before being returned.
    pub async fn run(mut self) -> Result<(), ClientError> {
        if let Some(socket) = &self.socket {
            self.receiver = Some(spawn_receiver(
                Arc::clone(socket),
                self.inbound_tx.clone(),
                self.drop_rate,
            ));
        }

        let mut tick_interval = interval(self.timings.tick_duration());
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tick_interval.tick().await;
            match self.tick(Instant::now()).await {
                Ok(true) => {}
                Ok(false) => {
                    self.state.send_replace(SessionState::Closed);
                    info!("Client stopped");
                    return Ok(());
                }
                Err(e) => {
                    error!("Client session failed: {}", e);
                    self.shutdown();
                    self.session.report_fatal(&e);
                    self.state.send_replace(SessionState::Closed);
                    return Err(e);
                }
            }
        }
    }

    /// One pass of the loop. Returns `false` once the client is done.
    async fn tick(&mut self, now: Instant) -> Result<bool, ClientError> {
        self.drain_commands();
        self.flush().await;

        if self.state() == SessionState::Exiting {
            self.shutdown();
            return Ok(false);
        }

        if !self.session.inbound_paused(now) {
            while let Ok(message) = self.inbound_rx.try_recv() {
                match message {
                    Inbound::Datagram { data, .. } => self.session.handle_datagram(&data, now),
                    Inbound::Failed(e) => {
                        self.receiver = None;
                        return Err(ClientError::Receiver(e));
                    }
                }
                // A bootstrap request may have just paused the queue.
                if self.session.inbound_paused(now) {
                    debug!(
                        "Holding inbound packets for {:?}",
                        self.session.pause_remaining(now)
                    );
                    break;
                }
            }
        }

        self.session.check_server(now)?;
        self.session.sweep_users(now);
        self.flush().await;
        Ok(true)
    }

    fn drain_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                ClientCommand::SendMessage(text) => self.session.send_message(text),
                ClientCommand::Typing => self.session.send_typing(),
                ClientCommand::Exit => {
                    info!("Disconnecting from server");
                    self.session.send_disconnect();
                    self.state.send_replace(SessionState::Exiting);
                    // Anything queued after exit is discarded.
                    self.commands.close();
                    while self.commands.try_recv().is_ok() {}
                    return;
                }
            }
        }
    }

    async fn flush(&mut self) {
        let outbox = self.session.take_outbox();
        let Some(socket) = &self.socket else {
            return;
        };
        for packet in outbox {
            let data = match packet.encode() {
                Ok(data) => data,
                Err(e) => {
                    error!("Failed to encode {:?}: {}", packet.kind(), e);
                    continue;
                }
            };
            debug!("-> server {:?}", packet.kind());
            if let Err(e) = socket.send(&data).await {
                warn!("Failed to send packet to server: {}", e);
            }
        }
    }

    /// Stops the receive task and releases the socket.
    fn shutdown(&mut self) {
        self.receiver = None;
        self.socket = None;
    }
}

async fn handshake(
    socket: &UdpSocket,
    name: &str,
    timings: &Timings,
) -> Result<UserId, ClientError> {
    let login = ClientPacket::Login {
        name: name.to_string(),
    }
    .encode()?;
    let mut buffer = [0u8; PACKET_SIZE];
    let attempts = timings.handshake_attempts;

    for attempt in 1..=attempts {
        socket.send(&login).await?;

        match timeout(timings.handshake_timeout(), recv_reply(socket, &mut buffer)).await {
            Ok(Ok(len)) => return parse_login_reply(&buffer[..len], name),
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => warn!("No reply from server ({}/{})", attempt, attempts),
        }
    }

    Err(ClientError::HandshakeTimeout { attempts })
}

/// Waits for one datagram, skipping ICMP errors caused by a server that is
/// not up yet.
async fn recv_reply(socket: &UdpSocket, buffer: &mut [u8]) -> io::Result<usize> {
    loop {
        match socket.recv(buffer).await {
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset
                ) =>
            {
                debug!("Server unreachable: {}", e);
            }
            result => return result,
        }
    }
}

fn parse_login_reply(data: &[u8], name: &str) -> Result<UserId, ClientError> {
    match ServerPacket::decode(data) {
        Ok(Some(ServerPacket::LoginReply { user_id })) if user_id < 0 => {
            Err(ClientError::NameConflict(name.to_string()))
        }
        Ok(Some(ServerPacket::LoginReply { user_id })) => Ok(user_id),
        Ok(Some(other)) => Err(ClientError::Protocol(format!(
            "expected a login reply, got {:?}",
            other.kind()
        ))),
        Ok(None) => Err(ClientError::Protocol(
            "expected a login reply, got an unknown packet".to_string(),
        )),
        Err(e) => Err(ClientError::Protocol(e.to_string())),
    }
}
