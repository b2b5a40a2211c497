//! UDP socket driver with burst receive.

use super::{AddressFamily, BatchTx, PacketBatch, ReceivedPacket, TransportError, TransportState};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Headroom above the MTU so oversized datagrams are read whole and
/// rejected by the codec rather than silently truncated.
const RECV_HEADROOM: usize = 100;

/// One bound UDP socket and its receive task.
pub struct UdpTransport {
    family: AddressFamily,
    bind_addr: SocketAddr,
    mtu: u16,
    burst: usize,
    state: TransportState,
    socket: Option<Arc<UdpSocket>>,
    batch_tx: BatchTx,
    recv_task: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl UdpTransport {
    pub fn new(bind_addr: SocketAddr, mtu: u16, burst: usize, batch_tx: BatchTx) -> Self {
        Self {
            family: AddressFamily::of(&bind_addr),
            bind_addr,
            mtu,
            burst: burst.max(1),
            state: TransportState::Configured,
            socket: None,
            batch_tx,
            recv_task: None,
            local_addr: None,
        }
    }

    pub fn family(&self) -> AddressFamily {
        self.family
    }

    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    /// Get the local bound address (only valid after start).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Shared socket handle for sending (only valid after start).
    pub fn socket(&self) -> Option<Arc<UdpSocket>> {
        self.socket.clone()
    }

    /// Bind the socket and spawn the burst receive loop.
    pub async fn start_async(&mut self) -> Result<(), TransportError> {
        if !self.state.can_start() {
            return Err(TransportError::AlreadyStarted);
        }

        let socket = UdpSocket::bind(self.bind_addr)
            .await
            .map_err(|e| TransportError::StartFailed(format!("bind {} failed: {}", self.bind_addr, e)))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| TransportError::StartFailed(format!("get local addr: {}", e)))?;

        let socket = Arc::new(socket);
        self.socket = Some(socket.clone());
        self.local_addr = Some(local_addr);

        let batch_tx = self.batch_tx.clone();
        let buf_size = self.mtu as usize + RECV_HEADROOM;
        let burst = self.burst;
        self.recv_task = Some(tokio::spawn(async move {
            udp_receive_loop(socket, batch_tx, buf_size, burst).await;
        }));
        self.state = TransportState::Up;

        info!(
            family = %self.family,
            local_addr = %local_addr,
            mtu = self.mtu,
            burst = self.burst,
            "UDP transport started"
        );
        Ok(())
    }

    /// Abort the receive task and close the socket.
    pub async fn stop_async(&mut self) -> Result<(), TransportError> {
        if !self.state.is_operational() {
            return Err(TransportError::NotStarted);
        }

        if let Some(task) = self.recv_task.take() {
            task.abort();
            let _ = task.await;
        }
        self.socket.take();
        self.local_addr = None;
        self.state = TransportState::Down;

        debug!(family = %self.family, "UDP transport stopped");
        Ok(())
    }

    /// Send one datagram.
    pub async fn send_async(&self, addr: SocketAddr, data: &[u8]) -> Result<usize, TransportError> {
        let socket = self.socket.as_ref().ok_or(TransportError::NotStarted)?;
        send_datagram(socket, self.mtu, addr, data).await
    }
}

/// Send one datagram on a shared socket, enforcing the MTU.
pub(crate) async fn send_datagram(
    socket: &UdpSocket,
    mtu: u16,
    addr: SocketAddr,
    data: &[u8],
) -> Result<usize, TransportError> {
    if data.len() > mtu as usize {
        return Err(TransportError::MtuExceeded {
            packet_size: data.len(),
            mtu,
        });
    }
    socket
        .send_to(data, addr)
        .await
        .map_err(|e| TransportError::SendFailed(format!("{}", e)))
}

/// Read one burst: wait for a datagram, then drain whatever is already
/// queued without waiting, up to `cap` datagrams in total.
pub async fn read_burst(
    socket: &UdpSocket,
    buf: &mut [u8],
    cap: usize,
) -> io::Result<PacketBatch> {
    let (len, remote_addr) = socket.recv_from(buf).await?;
    let mut batch = Vec::with_capacity(cap.min(64));
    batch.push(ReceivedPacket::new(remote_addr, buf[..len].to_vec()));

    while batch.len() < cap {
        match socket.try_recv_from(buf) {
            Ok((len, remote_addr)) => {
                batch.push(ReceivedPacket::new(remote_addr, buf[..len].to_vec()));
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => {
                // Deliver what was read; the error resurfaces next cycle if persistent
                debug!(error = %e, "UDP burst read interrupted");
                break;
            }
        }
    }
    Ok(batch)
}

/// UDP receive loop - runs as a spawned task.
async fn udp_receive_loop(socket: Arc<UdpSocket>, batch_tx: BatchTx, buf_size: usize, burst: usize) {
    let mut buf = vec![0u8; buf_size];

    debug!("UDP receive loop starting");

    loop {
        match read_burst(&socket, &mut buf, burst).await {
            Ok(batch) => {
                debug!(packets = batch.len(), "UDP burst received");
                if batch_tx.send(batch).await.is_err() {
                    info!("Packet channel closed, stopping receive loop");
                    break;
                }
            }
            Err(e) => {
                // Transient errors (e.g. ICMP port unreachable) are expected
                warn!(error = %e, "UDP receive error");
            }
        }
    }

    debug!("UDP receive loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::batch_channel;
    use std::collections::HashMap;
    use tokio::time::{sleep, timeout, Duration};

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test]
    async fn test_start_stop() {
        let (tx, _rx) = batch_channel(16);
        let mut transport = UdpTransport::new(loopback(), 1484, 30, tx);
        assert_eq!(transport.state(), TransportState::Configured);

        transport.start_async().await.unwrap();
        assert_eq!(transport.state(), TransportState::Up);
        assert!(transport.local_addr().is_some());
        assert!(matches!(
            transport.start_async().await,
            Err(TransportError::AlreadyStarted)
        ));

        transport.stop_async().await.unwrap();
        assert_eq!(transport.state(), TransportState::Down);
        assert!(matches!(
            transport.stop_async().await,
            Err(TransportError::NotStarted)
        ));
    }

    #[tokio::test]
    async fn test_send_recv() {
        let (tx1, _rx1) = batch_channel(16);
        let (tx2, mut rx2) = batch_channel(16);
        let mut t1 = UdpTransport::new(loopback(), 1484, 30, tx1);
        let mut t2 = UdpTransport::new(loopback(), 1484, 30, tx2);
        t1.start_async().await.unwrap();
        t2.start_async().await.unwrap();

        let sent = t1
            .send_async(t2.local_addr().unwrap(), b"hello world")
            .await
            .unwrap();
        assert_eq!(sent, 11);

        let batch = timeout(Duration::from_secs(1), rx2.recv())
            .await
            .expect("timeout")
            .expect("channel closed");
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].data, b"hello world");
        assert_eq!(batch[0].remote_addr, t1.local_addr().unwrap());

        t1.stop_async().await.unwrap();
        t2.stop_async().await.unwrap();
    }

    #[tokio::test]
    async fn test_mtu_exceeded() {
        let (tx, _rx) = batch_channel(16);
        let mut transport = UdpTransport::new(loopback(), 100, 30, tx);
        transport.start_async().await.unwrap();

        let result = transport
            .send_async("127.0.0.1:9".parse().unwrap(), &[0u8; 200])
            .await;
        assert!(matches!(result, Err(TransportError::MtuExceeded { .. })));

        transport.stop_async().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_not_started() {
        let (tx, _rx) = batch_channel(16);
        let transport = UdpTransport::new(loopback(), 1484, 30, tx);
        let result = transport.send_async("127.0.0.1:9".parse().unwrap(), b"x").await;
        assert!(matches!(result, Err(TransportError::NotStarted)));
    }

    #[tokio::test]
    async fn test_burst_cap_and_per_endpoint_order() {
        let receiver = UdpSocket::bind(loopback()).await.unwrap();
        let target = receiver.local_addr().unwrap();
        let senders = [
            UdpSocket::bind(loopback()).await.unwrap(),
            UdpSocket::bind(loopback()).await.unwrap(),
            UdpSocket::bind(loopback()).await.unwrap(),
        ];

        // 33 datagrams from 3 endpoints, interleaved
        for seq in 0u8..11 {
            for sender in &senders {
                sender.send_to(&[seq], target).await.unwrap();
            }
        }
        sleep(Duration::from_millis(100)).await;

        let mut buf = vec![0u8; 1600];
        let first = read_burst(&receiver, &mut buf, 30).await.unwrap();
        assert_eq!(first.len(), 30);
        let second = timeout(Duration::from_secs(1), read_burst(&receiver, &mut buf, 30))
            .await
            .expect("timeout")
            .unwrap();
        assert_eq!(second.len(), 3);

        let mut by_endpoint: HashMap<SocketAddr, Vec<u8>> = HashMap::new();
        for packet in first.iter().chain(second.iter()) {
            by_endpoint
                .entry(packet.remote_addr)
                .or_default()
                .push(packet.data[0]);
        }
        assert_eq!(by_endpoint.len(), 3);
        for seqs in by_endpoint.values() {
            assert_eq!(seqs, &(0u8..11).collect::<Vec<_>>());
        }
    }
}
