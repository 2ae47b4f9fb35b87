use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use bytes::Bytes;
use tokio::{
    net::{ToSocketAddrs, UdpSocket},
    sync::{mpsc, Mutex},
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::TransportConfig,
    error::Error,
    relay::packet::{is_rtcp, RelayPacket},
    transport::{rtp_transport::RtpTransport, Transport},
};

/// How often flows closed by their router are dropped from the flow table.
const PRUNE_INTERVAL: Duration = Duration::from_secs(5);

type Flows = Arc<StdMutex<HashMap<SocketAddr, Arc<RtpTransport>>>>;

/// RelayListener receives relay flows from other nodes on a single UDP socket.
///
/// Flows are told apart by their remote address. The first RTP packet of a flow carries the track id,
/// and the new [`RtpTransport`] is handed out by [`RelayListener::accept`].
#[derive(Debug)]
pub struct RelayListener {
    local_addr: SocketAddr,
    flows: Flows,
    accepted_receiver: Mutex<mpsc::Receiver<Arc<RtpTransport>>>,
    cancel: CancellationToken,
}

impl RelayListener {
    pub async fn bind<A: ToSocketAddrs>(addr: A, config: TransportConfig) -> Result<Self, Error> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local_addr = socket.local_addr()?;
        let (accepted_sender, accepted_receiver) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        let flows: Flows = Arc::new(StdMutex::new(HashMap::new()));

        {
            let cancel = cancel.clone();
            let flows = flows.clone();
            tokio::spawn(async move {
                Self::run_udp(socket, config, flows, accepted_sender, cancel).await;
            });
        }

        tracing::info!("RelayListener is listening on {}", local_addr);

        Ok(Self {
            local_addr,
            flows,
            accepted_receiver: Mutex::new(accepted_receiver),
            cancel,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Waits for the next relay flow. Returns `None` once the listener is closed.
    pub async fn accept(&self) -> Option<Arc<RtpTransport>> {
        let mut receiver = self.accepted_receiver.lock().await;
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            transport = receiver.recv() => transport,
        }
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Number of flows currently routed by this listener.
    pub fn flow_count(&self) -> usize {
        self.flows.lock().map(|flows| flows.len()).unwrap_or(0)
    }

    fn prune(flows: &Flows) {
        if let Ok(mut flows) = flows.lock() {
            flows.retain(|addr, flow| {
                let open = !flow.is_closed();
                if !open {
                    tracing::debug!("RelayListener flow from {} is closed", addr);
                }
                open
            });
        }
    }

    async fn run_udp(
        socket: Arc<UdpSocket>,
        config: TransportConfig,
        flows: Flows,
        accepted_sender: mpsc::Sender<Arc<RtpTransport>>,
        cancel: CancellationToken,
    ) {
        let mut buf = vec![0u8; 1500];
        let mut prune_ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + PRUNE_INTERVAL, PRUNE_INTERVAL);

        loop {
            let res = tokio::select! {
                _ = cancel.cancelled() => break,
                _ = prune_ticker.tick() => {
                    Self::prune(&flows);
                    continue;
                }
                res = socket.recv_from(&mut buf) => res,
            };
            let (len, addr) = match res {
                Ok(res) => res,
                Err(err) => {
                    tracing::error!("RelayListener failed to receive: {}", err);
                    continue;
                }
            };
            let data = Bytes::copy_from_slice(&buf[..len]);

            let known = match flows.lock() {
                Ok(flows) => flows.get(&addr).filter(|flow| !flow.is_closed()).cloned(),
                Err(_) => break,
            };
            if let Some(flow) = known {
                flow.handle_datagram(data);
                continue;
            }

            if is_rtcp(&data) {
                tracing::trace!("RelayListener ignores RTCP from unknown flow {}", addr);
                continue;
            }
            let track_id = match RelayPacket::unmarshal(&data) {
                Ok(packet) => packet.track_id,
                Err(err) => {
                    tracing::debug!("RelayListener dropped datagram from {}: {}", addr, err);
                    continue;
                }
            };

            // New flows are rare, a good moment to forget the closed ones.
            Self::prune(&flows);
            let flow = Arc::new(RtpTransport::accepted(
                track_id.clone(),
                socket.clone(),
                addr,
                &config,
            ));
            tracing::info!(
                "RelayListener accepted flow from {} for track_id={}",
                addr,
                track_id
            );
            flow.handle_datagram(data);
            if let Ok(mut flows) = flows.lock() {
                flows.insert(addr, flow.clone());
            }
            if accepted_sender.send(flow).await.is_err() {
                break;
            }
        }

        let remaining: Vec<Arc<RtpTransport>> = match flows.lock() {
            Ok(mut flows) => flows.drain().map(|(_, flow)| flow).collect(),
            Err(_) => Vec::new(),
        };
        for flow in remaining {
            flow.close().await;
        }
        tracing::debug!("RelayListener on {:?} has finished", socket.local_addr());
    }
}

impl Drop for RelayListener {
    fn drop(&mut self) {
        self.cancel.cancel();
        tracing::debug!("RelayListener {} is dropped", self.local_addr);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use webrtc::rtp;

    use super::*;

    fn packet(seq: u16) -> rtp::packet::Packet {
        let mut packet = rtp::packet::Packet::default();
        packet.header.version = 2;
        packet.header.payload_type = 111;
        packet.header.ssrc = 5;
        packet.header.sequence_number = seq;
        packet
    }

    #[tokio::test]
    async fn flows_are_accepted_per_remote_address() {
        let listener = RelayListener::bind("127.0.0.1:0", TransportConfig::default())
            .await
            .unwrap();
        let addr = listener.local_addr();

        let audio = RtpTransport::connect("audio".to_owned(), addr, &TransportConfig::default())
            .await
            .unwrap();
        audio.write_rtp(&packet(1)).unwrap();

        let accepted = tokio::time::timeout(Duration::from_secs(1), listener.accept())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(accepted.track_id(), "audio");
        let first = tokio::time::timeout(Duration::from_secs(1), accepted.read_rtp())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.header.sequence_number, 1);

        audio.write_rtp(&packet(2)).unwrap();
        let second = tokio::time::timeout(Duration::from_secs(1), accepted.read_rtp())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.header.sequence_number, 2);

        listener.close();
        assert!(listener.accept().await.is_none());
    }

    #[tokio::test]
    async fn closed_flows_leave_the_flow_table() {
        let listener = RelayListener::bind("127.0.0.1:0", TransportConfig::default())
            .await
            .unwrap();
        let addr = listener.local_addr();

        let first = RtpTransport::connect("first".to_owned(), addr, &TransportConfig::default())
            .await
            .unwrap();
        first.write_rtp(&packet(1)).unwrap();
        let accepted = tokio::time::timeout(Duration::from_secs(1), listener.accept())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(listener.flow_count(), 1);

        // what a router does when it is swept
        accepted.close().await;

        let second = RtpTransport::connect("second".to_owned(), addr, &TransportConfig::default())
            .await
            .unwrap();
        second.write_rtp(&packet(1)).unwrap();
        let accepted = tokio::time::timeout(Duration::from_secs(1), listener.accept())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(accepted.track_id(), "second");
        assert_eq!(listener.flow_count(), 1);
    }
}
