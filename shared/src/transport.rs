//! Datagram receive task used by both endpoints.

use crate::protocol::PACKET_SIZE;
use log::{error, trace, warn};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Messages sent from the receive task to the tick loop
#[derive(Debug)]
pub enum Inbound {
    Datagram { data: Vec<u8>, addr: SocketAddr },
    /// The socket failed; no further datagrams will follow.
    Failed(io::Error),
}

/// Handle to a running receive task. Dropping it stops the task, which
/// releases its reference to the socket.
#[derive(Debug)]
pub struct ReceiverTask {
    handle: JoinHandle<()>,
}

impl Drop for ReceiverTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Spawns a task that only reads from `socket` and forwards raw datagrams.
///
/// Each datagram is discarded with probability `drop_rate` before it is
/// queued, which simulates a lossy network.
pub fn spawn_receiver(
    socket: Arc<UdpSocket>,
    tx: mpsc::UnboundedSender<Inbound>,
    drop_rate: f64,
) -> ReceiverTask {
    let handle = tokio::spawn(async move {
        let mut buffer = [0u8; PACKET_SIZE];

        loop {
            match socket.recv_from(&mut buffer).await {
                Ok((len, addr)) => {
                    if drop_rate > 0.0 && rand::random::<f64>() < drop_rate {
                        trace!("Simulated loss of datagram from {}", addr);
                        continue;
                    }
                    let data = buffer[..len].to_vec();
                    if tx.send(Inbound::Datagram { data, addr }).is_err() {
                        break;
                    }
                }
                // ICMP port unreachable from a vanished peer surfaces here on
                // some platforms; the socket itself is fine.
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                    warn!("Ignoring connection reset on receive: {}", e);
                }
                Err(e) => {
                    error!("Error receiving datagram: {}", e);
                    let _ = tx.send(Inbound::Failed(e));
                    break;
                }
            }
        }
    });

    ReceiverTask { handle }
}
