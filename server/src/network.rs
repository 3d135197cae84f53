//! Server network layer: UDP socket, receive task and the tick loop

use crate::error::ServerError;
use crate::session::{Outgoing, ServerSession};
use log::{debug, error, info};
use shared::transport::{spawn_receiver, Inbound, ReceiverTask};
use shared::Timings;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};

/// Chat server driving a [`ServerSession`] at a fixed tick rate
pub struct Server {
    socket: Arc<UdpSocket>,
    session: ServerSession,
    timings: Timings,
    drop_rate: f64,

    // Inbound queue fed by the receive task
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    inbound_rx: mpsc::UnboundedReceiver<Inbound>,
    receiver: Option<ReceiverTask>,
}

impl Server {
    pub async fn bind(addr: impl ToSocketAddrs, timings: Timings) -> Result<Self, ServerError> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        info!("Server listening on {}", socket.local_addr()?);

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        Ok(Server {
            socket,
            session: ServerSession::new(timings.clone(), Instant::now()),
            timings,
            drop_rate: 0.0,
            inbound_tx,
            inbound_rx,
            receiver: None,
        })
    }

    /// Randomly discards this fraction of inbound datagrams.
    pub fn with_drop_rate(mut self, drop_rate: f64) -> Self {
        self.drop_rate = drop_rate;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.socket.local_addr()?)
    }

    pub fn session(&self) -> &ServerSession {
        &self.session
    }

    /// Runs until the receive task fails. There is no other way out.
    pub async fn run(&mut self) -> Result<(), ServerError> {
        self.receiver = Some(spawn_receiver(
            Arc::clone(&self.socket),
            self.inbound_tx.clone(),
            self.drop_rate,
        ));

        let mut tick_interval = interval(self.timings.tick_duration());
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!("Server started successfully");

        loop {
            tick_interval.tick().await;
            self.tick(Instant::now()).await?;
        }
    }

    /// Drains the inbound queue, runs housekeeping and flushes the outbox.
    async fn tick(&mut self, now: Instant) -> Result<(), ServerError> {
        while let Ok(message) = self.inbound_rx.try_recv() {
            match message {
                Inbound::Datagram { data, addr } => {
                    self.session.handle_datagram(&data, addr, now);
                }
                Inbound::Failed(e) => {
                    self.receiver = None;
                    return Err(ServerError::Receiver(e));
                }
            }
        }

        self.session.sweep(now);
        self.flush().await;
        Ok(())
    }

    async fn flush(&mut self) {
        for Outgoing { addr, packet } in self.session.take_outbox() {
            let data = match packet.encode() {
                Ok(data) => data,
                Err(e) => {
                    error!("Failed to encode {:?} for {}: {}", packet.kind(), addr, e);
                    continue;
                }
            };
            debug!("-> {} {:?}", addr, packet.kind());
            if let Err(e) = self.socket.send_to(&data, addr).await {
                error!("Failed to send packet to {}: {}", addr, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{ClientPacket, ServerPacket, PACKET_SIZE};
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    async fn recv_packet(socket: &UdpSocket) -> ServerPacket {
        let mut buf = [0u8; PACKET_SIZE];
        let len = tokio::time::timeout(Duration::from_secs(2), socket.recv(&mut buf))
            .await
            .expect("timed out waiting for server")
            .unwrap();
        ServerPacket::decode(&buf[..len]).unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_server_answers_login() {
        let mut server = assert_ok!(Server::bind("127.0.0.1:0", Timings::default()).await);
        let server_addr = assert_ok!(server.local_addr());
        tokio::spawn(async move { server.run().await });

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        peer.connect(server_addr).await.unwrap();
        let login = ClientPacket::Login {
            name: "alice".to_string(),
        };
        peer.send(&login.encode().unwrap()).await.unwrap();

        assert_eq!(recv_packet(&peer).await, ServerPacket::LoginReply { user_id: 1 });
    }

    #[tokio::test]
    async fn test_tick_without_traffic_is_quiet() {
        let mut server = assert_ok!(Server::bind("127.0.0.1:0", Timings::default()).await);
        assert_ok!(server.tick(Instant::now()).await);
        assert!(server.session().users().is_empty());
        assert!(server.session().message_log().is_empty());
    }

    #[tokio::test]
    async fn test_receiver_failure_is_fatal() {
        let mut server = assert_ok!(Server::bind("127.0.0.1:0", Timings::default()).await);
        server
            .inbound_tx
            .send(Inbound::Failed(std::io::Error::new(
                std::io::ErrorKind::Other,
                "boom",
            )))
            .unwrap();

        let error = assert_err!(server.tick(Instant::now()).await);
        assert!(matches!(error, ServerError::Receiver(_)));
    }
}
