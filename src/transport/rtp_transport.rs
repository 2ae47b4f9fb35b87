use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::{net::UdpSocket, sync::mpsc};
use uuid::Uuid;
use webrtc::{rtcp, rtp, util::marshal::Marshal};

use crate::{
    config::TransportConfig,
    error::Error,
    relay::packet::{is_rtcp, RelayPacket},
};

use super::{RtcpPacket, Transport, TransportCore, TransportKind};

/// One relay flow between two nodes, carrying a single track.
///
/// RTP travels from the dialing node to the accepting node, RTCP feedback travels back on the same UDP flow.
#[derive(Debug)]
pub struct RtpTransport {
    core: Arc<TransportCore>,
    track_id: String,
    socket: Arc<UdpSocket>,
    remote_addr: SocketAddr,
}

impl RtpTransport {
    /// Opens a relay flow towards `remote_addr` for `track_id`. Use it as a subscriber of the local router.
    pub async fn connect(
        track_id: String,
        remote_addr: SocketAddr,
        config: &TransportConfig,
    ) -> Result<Arc<Self>, Error> {
        let bind_addr: SocketAddr = if remote_addr.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        let transport = Arc::new(Self::new(track_id, socket.clone(), remote_addr, config));

        let core = transport.core.clone();
        tokio::spawn(async move {
            Self::recv_loop(core, socket, remote_addr).await;
        });

        tracing::info!(
            "RtpTransport {} connected to {} for track_id={}",
            transport.core.id,
            remote_addr,
            transport.track_id
        );
        Ok(transport)
    }

    /// Wraps a flow accepted by [`crate::relay::listener::RelayListener`], which owns the receive side of the socket.
    pub(crate) fn accepted(
        track_id: String,
        socket: Arc<UdpSocket>,
        remote_addr: SocketAddr,
        config: &TransportConfig,
    ) -> Self {
        Self::new(track_id, socket, remote_addr, config)
    }

    fn new(
        track_id: String,
        socket: Arc<UdpSocket>,
        remote_addr: SocketAddr,
        config: &TransportConfig,
    ) -> Self {
        let id = Uuid::new_v4().to_string();
        tracing::debug!("RtpTransport {} is created for {}", id, remote_addr);
        Self {
            core: Arc::new(TransportCore::new(id, config)),
            track_id,
            socket,
            remote_addr,
        }
    }

    pub fn track_id(&self) -> &str {
        &self.track_id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.socket.local_addr()?)
    }

    async fn recv_loop(
        core: Arc<TransportCore>,
        socket: Arc<UdpSocket>,
        remote_addr: SocketAddr,
    ) {
        let cancel = core.cancel_token();
        let mut buf = vec![0u8; 1500];
        loop {
            let res = tokio::select! {
                _ = cancel.cancelled() => break,
                res = socket.recv_from(&mut buf) => res,
            };
            match res {
                Ok((len, addr)) => {
                    if addr != remote_addr {
                        tracing::trace!("RtpTransport {} ignores datagram from {}", core.id, addr);
                        continue;
                    }
                    handle_datagram(&core, Bytes::copy_from_slice(&buf[..len]));
                }
                Err(err) => {
                    tracing::error!("RtpTransport {} failed to receive: {}", core.id, err);
                    core.close();
                    break;
                }
            }
        }
        tracing::debug!("RtpTransport {} receive loop has finished", core.id);
    }

    /// Feeds one datagram of this flow into the transport.
    pub(crate) fn handle_datagram(&self, buf: Bytes) {
        handle_datagram(&self.core, buf)
    }

    fn send(&self, buf: &[u8]) -> Result<(), Error> {
        match self.socket.try_send_to(buf, self.remote_addr) {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                Err(self.core.backpressure_error())
            }
            Err(err) => {
                self.core.record_write_error();
                Err(Error::from(err))
            }
        }
    }
}

fn handle_datagram(core: &TransportCore, mut buf: Bytes) {
    if is_rtcp(&buf) {
        match rtcp::packet::unmarshal(&mut buf) {
            Ok(packets) => {
                for packet in packets {
                    core.deliver_rtcp(packet);
                }
            }
            Err(err) => {
                tracing::debug!("RtpTransport {} failed to unmarshal RTCP: {}", core.id, err);
            }
        }
        return;
    }

    match RelayPacket::unmarshal(&buf) {
        Ok(data) => {
            tracing::trace!(
                "RtpTransport {} received track_id={} seq={}",
                core.id,
                data.track_id,
                data.packet.header.sequence_number
            );
            core.deliver_rtp(data.packet);
        }
        Err(err) => {
            tracing::debug!("RtpTransport {} failed to unmarshal RTP: {}", core.id, err);
        }
    }
}

#[async_trait]
impl Transport for RtpTransport {
    fn id(&self) -> String {
        self.core.id.clone()
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Relay
    }

    async fn read_rtp(&self) -> Result<rtp::packet::Packet, Error> {
        self.core.read_rtp().await
    }

    fn write_rtp(&self, packet: &rtp::packet::Packet) -> Result<(), Error> {
        if self.core.is_closed() {
            return Err(self.core.closed_error());
        }
        let data = RelayPacket {
            packet: packet.clone(),
            track_id: self.track_id.clone(),
        };
        let buf = data.marshal()?;
        self.send(&buf)
    }

    fn write_rtcp(&self, packet: RtcpPacket) -> Result<(), Error> {
        if self.core.is_closed() {
            return Err(self.core.closed_error());
        }
        let buf = packet.marshal()?;
        self.send(&buf)
    }

    fn take_rtcp_receiver(&self) -> Option<mpsc::Receiver<RtcpPacket>> {
        self.core.take_rtcp_receiver()
    }

    fn write_error_count(&self) -> usize {
        self.core.write_error_count()
    }

    fn reset_write_errors(&self) {
        self.core.reset_write_errors()
    }

    async fn close(&self) {
        if self.core.close() {
            tracing::debug!("RtpTransport {} is closed", self.core.id);
        }
    }

    fn is_closed(&self) -> bool {
        self.core.is_closed()
    }
}

impl Drop for RtpTransport {
    fn drop(&mut self) {
        tracing::debug!("RtpTransport {} is dropped", self.core.id);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use webrtc::rtcp::transport_feedbacks::transport_layer_nack::{NackPair, TransportLayerNack};

    use super::*;

    fn packet(seq: u16) -> rtp::packet::Packet {
        let mut packet = rtp::packet::Packet::default();
        packet.header.version = 2;
        packet.header.payload_type = 96;
        packet.header.ssrc = 77;
        packet.header.sequence_number = seq;
        packet.payload = Bytes::from_static(&[9, 9, 9]);
        packet
    }

    #[tokio::test]
    async fn rtp_goes_out_and_feedback_comes_back() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();

        let transport =
            RtpTransport::connect("video".to_owned(), peer_addr, &TransportConfig::default())
                .await
                .unwrap();
        let mut rtcp_receiver = transport.take_rtcp_receiver().unwrap();

        transport.write_rtp(&packet(10)).unwrap();

        let mut buf = vec![0u8; 1500];
        let (len, from) = tokio::time::timeout(Duration::from_secs(1), peer.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let data = RelayPacket::unmarshal(&Bytes::copy_from_slice(&buf[..len])).unwrap();
        assert_eq!(data.track_id, "video");
        assert_eq!(data.packet.header.sequence_number, 10);

        let nack = TransportLayerNack {
            sender_ssrc: 0,
            media_ssrc: 77,
            nacks: vec![NackPair {
                packet_id: 10,
                lost_packets: 0,
            }],
        };
        peer.send_to(&nack.marshal().unwrap(), from).await.unwrap();

        let feedback = tokio::time::timeout(Duration::from_secs(1), rtcp_receiver.recv())
            .await
            .unwrap()
            .unwrap();
        let received = feedback
            .as_any()
            .downcast_ref::<TransportLayerNack>()
            .unwrap();
        assert_eq!(received.nacks[0].packet_id, 10);

        transport.close().await;
        assert!(transport.write_rtp(&packet(11)).is_err());
    }

    #[tokio::test]
    async fn unencodable_rtcp_is_a_marshal_error() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let transport = RtpTransport::connect(
            "video".to_owned(),
            peer.local_addr().unwrap(),
            &TransportConfig::default(),
        )
        .await
        .unwrap();

        let remb = rtcp::payload_feedbacks::receiver_estimated_maximum_bitrate::ReceiverEstimatedMaximumBitrate {
            sender_ssrc: 0,
            bitrate: -1.0,
            ssrcs: vec![77],
        };
        let err = transport.write_rtcp(Box::new(remb)).unwrap_err();
        assert!(matches!(err.kind, crate::error::Kind::UtilError(_)));
        assert_eq!(transport.write_error_count(), 0);
    }
}
