use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use derivative::Derivative;
use enclose::enc;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use webrtc::{
    api::{
        interceptor_registry::configure_rtcp_reports, media_engine::MediaEngine,
        setting_engine::SettingEngine, APIBuilder,
    },
    ice_transport::ice_candidate_type::RTCIceCandidateType,
    interceptor::registry::Registry,
    peer_connection::{peer_connection_state::RTCPeerConnectionState, RTCPeerConnection},
    rtcp::{
        payload_feedbacks::picture_loss_indication::PictureLossIndication,
        transport_feedbacks::transport_layer_nack::TransportLayerNack,
    },
    rtp,
    rtp_transceiver::{
        rtp_codec::RTCRtpCodecCapability, rtp_receiver::RTCRtpReceiver, rtp_sender::RTCRtpSender,
        RTCRtpTransceiver,
    },
    track::{
        track_local::{track_local_static_rtp::TrackLocalStaticRTP, TrackLocal, TrackLocalWriter},
        track_remote::TrackRemote,
    },
};

use crate::{
    config::WebRTCTransportConfig,
    error::{Error, TransportErrorKind},
};

use super::{RtcpPacket, Transport, TransportCore, TransportKind};

type LocalTracks = Arc<RwLock<HashMap<u32, Arc<TrackLocalStaticRTP>>>>;

/// This wraps a [`webrtc::peer_connection::RTCPeerConnection`] so a router can use it as publisher or subscriber.
///
/// Offer/answer and ICE candidates are exchanged by the caller through [`WebRtcTransport::peer_connection`].
/// Every remote track received on the connection is read into the same RTP queue, and every local track added
/// with [`WebRtcTransport::add_track`] is fed by [`Transport::write_rtp`] according to the packet SSRC.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct WebRtcTransport {
    core: Arc<TransportCore>,
    #[derivative(Debug = "ignore")]
    peer_connection: Arc<RTCPeerConnection>,
    #[derivative(Debug = "ignore")]
    local_tracks: LocalTracks,
    outgoing_sender: mpsc::Sender<rtp::packet::Packet>,
    rtcp_writer_sender: mpsc::Sender<RtcpPacket>,
}

impl WebRtcTransport {
    pub async fn new(config: WebRTCTransportConfig) -> Result<Self, Error> {
        let id = Uuid::new_v4().to_string();
        let peer_connection = Arc::new(generate_peer_connection(&config).await?);
        let core = Arc::new(TransportCore::new(id, &config.transport));
        let local_tracks: LocalTracks = Arc::new(RwLock::new(HashMap::new()));

        let (outgoing_sender, outgoing_receiver) =
            mpsc::channel(config.transport.write_channel_size.max(1));
        let (rtcp_writer_sender, rtcp_writer_receiver) =
            mpsc::channel(config.transport.rtcp_channel_size.max(1));

        tokio::spawn(enc!((core, local_tracks) async move {
            Self::rtp_writer_loop(core, local_tracks, outgoing_receiver).await;
        }));
        tokio::spawn(enc!((core, peer_connection) async move {
            Self::rtcp_writer_loop(core, peer_connection, rtcp_writer_receiver).await;
        }));

        let transport = Self {
            core,
            peer_connection,
            local_tracks,
            outgoing_sender,
            rtcp_writer_sender,
        };
        transport.peer_connection_hooks();

        tracing::debug!("WebRtcTransport {} is created", transport.core.id);

        Ok(transport)
    }

    pub fn peer_connection(&self) -> Arc<RTCPeerConnection> {
        self.peer_connection.clone()
    }

    /// Adds an outgoing track fed by packets whose SSRC is `source_ssrc`.
    /// Keyframe and retransmission requests received for this track are reported against `source_ssrc`.
    pub async fn add_track(
        &self,
        source_ssrc: u32,
        capability: RTCRtpCodecCapability,
        track_id: String,
        stream_id: String,
    ) -> Result<(), Error> {
        if self.core.is_closed() {
            return Err(self.core.closed_error());
        }
        let track = Arc::new(TrackLocalStaticRTP::new(capability, track_id.clone(), stream_id));
        let rtp_sender = self
            .peer_connection
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        self.local_tracks.write().await.insert(source_ssrc, track);

        let core = self.core.clone();
        tokio::spawn(async move {
            Self::rtcp_reader_loop(core, rtp_sender, source_ssrc).await;
        });

        tracing::debug!(
            "WebRtcTransport {} added track id={} for ssrc={}",
            self.core.id,
            track_id,
            source_ssrc
        );
        Ok(())
    }

    pub async fn remove_track(&self, source_ssrc: u32) -> Result<(), Error> {
        match self.local_tracks.write().await.remove(&source_ssrc) {
            Some(_) => Ok(()),
            None => Err(Error::new_transport(
                format!("Track for ssrc={} is not found", source_ssrc),
                TransportErrorKind::TrackNotFoundError,
            )),
        }
    }

    fn peer_connection_hooks(&self) {
        let core = self.core.clone();
        self.peer_connection.on_track(Box::new(enc!((core)
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                Box::pin(enc!((core) async move {
                    tracing::info!(
                        "WebRtcTransport {} track published: track_id={}, ssrc={}, payload_type={}",
                        core.id,
                        track.id(),
                        track.ssrc(),
                        track.payload_type()
                    );
                    tokio::spawn(async move {
                        Self::rtp_reader_loop(core, track).await;
                    });
                }))
            }
        )));

        let core = self.core.clone();
        self.peer_connection
            .on_peer_connection_state_change(Box::new(enc!((core) move |state: RTCPeerConnectionState| {
                tracing::debug!("WebRtcTransport {} connection state changed: {}", core.id, state);
                if state == RTCPeerConnectionState::Failed || state == RTCPeerConnectionState::Closed {
                    core.close();
                }
                Box::pin(async {})
            })));
    }

    async fn rtp_reader_loop(core: Arc<TransportCore>, track: Arc<TrackRemote>) {
        let ssrc = track.ssrc();
        let cancel = core.cancel_token();
        tracing::debug!("WebRtcTransport {} ssrc={} RTP reader has started", core.id, ssrc);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                res = track.read_rtp() => {
                    match res {
                        Ok((packet, _attr)) => {
                            if !core.deliver_rtp(packet) {
                                break;
                            }
                        }
                        Err(webrtc::Error::ErrClosedPipe) => break,
                        Err(webrtc::Error::Interceptor(webrtc::interceptor::Error::Srtp(
                            webrtc_srtp::Error::Util(webrtc_util::Error::ErrBufferClosed),
                        ))) => break,
                        Err(err) => {
                            tracing::error!("WebRtcTransport {} ssrc={} failed to read rtp: {}", core.id, ssrc, err);
                            break;
                        }
                    }
                }
            }
        }
        tracing::debug!("WebRtcTransport {} ssrc={} RTP reader has finished", core.id, ssrc);
    }

    async fn rtcp_reader_loop(core: Arc<TransportCore>, rtp_sender: Arc<RTCRtpSender>, source_ssrc: u32) {
        let cancel = core.cancel_token();
        loop {
            let res = tokio::select! {
                _ = cancel.cancelled() => break,
                res = rtp_sender.read_rtcp() => res,
            };
            let packets = match res {
                Ok((packets, _attr)) => packets,
                Err(err) => {
                    tracing::debug!("WebRtcTransport {} RTCP reader stopped: {}", core.id, err);
                    break;
                }
            };
            for packet in packets {
                if let Some(feedback) = rewrite_media_ssrc(packet.as_ref(), source_ssrc) {
                    if !core.deliver_rtcp(feedback) {
                        return;
                    }
                }
            }
        }
    }

    async fn rtp_writer_loop(
        core: Arc<TransportCore>,
        local_tracks: LocalTracks,
        mut receiver: mpsc::Receiver<rtp::packet::Packet>,
    ) {
        let cancel = core.cancel_token();
        loop {
            let packet = tokio::select! {
                _ = cancel.cancelled() => break,
                packet = receiver.recv() => match packet {
                    Some(packet) => packet,
                    None => break,
                },
            };
            let track = local_tracks.read().await.get(&packet.header.ssrc).cloned();
            match track {
                Some(track) => {
                    if let Err(err) = track.write_rtp(&packet).await {
                        core.record_write_error();
                        tracing::debug!("WebRtcTransport {} failed to write rtp: {}", core.id, err);
                    }
                }
                None => {
                    tracing::trace!(
                        "WebRtcTransport {} has no track for ssrc={}",
                        core.id,
                        packet.header.ssrc
                    );
                }
            }
        }
        tracing::debug!("WebRtcTransport {} RTP writer loop has finished", core.id);
    }

    async fn rtcp_writer_loop(
        core: Arc<TransportCore>,
        peer_connection: Arc<RTCPeerConnection>,
        mut receiver: mpsc::Receiver<RtcpPacket>,
    ) {
        let cancel: CancellationToken = core.cancel_token();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                data = receiver.recv() => {
                    match data {
                        Some(data) => {
                            if let Err(err) = peer_connection.write_rtcp(&[data]).await {
                                tracing::error!("WebRtcTransport {} error writing RTCP: {}", core.id, err);
                            }
                        }
                        None => break,
                    }
                }
            }
        }
        tracing::debug!("WebRtcTransport {} RTCP writer loop has finished", core.id);
    }
}

/// Keeps keyframe and retransmission requests only, reported against the publisher SSRC.
fn rewrite_media_ssrc(
    packet: &(dyn webrtc::rtcp::packet::Packet + Send + Sync),
    source_ssrc: u32,
) -> Option<RtcpPacket> {
    let any = packet.as_any();
    if let Some(pli) = any.downcast_ref::<PictureLossIndication>() {
        return Some(Box::new(PictureLossIndication {
            sender_ssrc: pli.sender_ssrc,
            media_ssrc: source_ssrc,
        }));
    }
    if let Some(nack) = any.downcast_ref::<TransportLayerNack>() {
        return Some(Box::new(TransportLayerNack {
            sender_ssrc: nack.sender_ssrc,
            media_ssrc: source_ssrc,
            nacks: nack.nacks.clone(),
        }));
    }
    None
}

/// Builds a peer connection with the default codecs. Only RTCP reports are generated by interceptors,
/// retransmission and bandwidth feedback are handled by the router.
pub async fn generate_peer_connection(
    config: &WebRTCTransportConfig,
) -> Result<RTCPeerConnection, Error> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;

    let registry = configure_rtcp_reports(Registry::new());

    let mut setting_engine = SettingEngine::default();
    if !config.announced_ips.is_empty() {
        let ips = config
            .announced_ips
            .iter()
            .map(|ip| ip.to_string())
            .collect::<Vec<_>>();
        setting_engine.set_nat_1to1_ips(ips, RTCIceCandidateType::Host);
    }

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .with_setting_engine(setting_engine)
        .build();

    let peer_connection = api
        .new_peer_connection(config.configuration.clone())
        .await?;
    Ok(peer_connection)
}

#[async_trait]
impl Transport for WebRtcTransport {
    fn id(&self) -> String {
        self.core.id.clone()
    }

    fn kind(&self) -> TransportKind {
        TransportKind::WebRTC
    }

    async fn read_rtp(&self) -> Result<rtp::packet::Packet, Error> {
        self.core.read_rtp().await
    }

    fn write_rtp(&self, packet: &rtp::packet::Packet) -> Result<(), Error> {
        if self.core.is_closed() {
            return Err(self.core.closed_error());
        }
        match self.outgoing_sender.try_send(packet.clone()) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(self.core.backpressure_error()),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.core.record_write_error();
                Err(self.core.closed_error())
            }
        }
    }

    fn write_rtcp(&self, packet: RtcpPacket) -> Result<(), Error> {
        if self.core.is_closed() {
            return Err(self.core.closed_error());
        }
        self.rtcp_writer_sender.try_send(packet).map_err(|_| {
            Error::new_transport(
                format!("WebRtcTransport {} RTCP queue is unavailable", self.core.id),
                TransportErrorKind::WriteBackpressureError,
            )
        })
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
        self.core.close();
        if let Err(err) = self.peer_connection.close().await {
            tracing::error!("WebRtcTransport {} failed to close peer connection: {}", self.core.id, err);
        }
        tracing::debug!("WebRtcTransport {} is closed", self.core.id);
    }

    fn is_closed(&self) -> bool {
        self.core.is_closed()
    }
}

impl Drop for WebRtcTransport {
    fn drop(&mut self) {
        tracing::debug!("WebRtcTransport {} is dropped", self.core.id);
    }
}

#[cfg(test)]
mod tests {
    use webrtc::rtcp::{
        payload_feedbacks::receiver_estimated_maximum_bitrate::ReceiverEstimatedMaximumBitrate,
        transport_feedbacks::transport_layer_nack::NackPair,
    };

    use super::*;

    #[test]
    fn feedback_is_reported_against_source_ssrc() {
        let nack = TransportLayerNack {
            sender_ssrc: 1,
            media_ssrc: 555,
            nacks: vec![NackPair {
                packet_id: 10,
                lost_packets: 0b11,
            }],
        };
        let rewritten = rewrite_media_ssrc(&nack, 42).unwrap();
        let rewritten = rewritten
            .as_any()
            .downcast_ref::<TransportLayerNack>()
            .unwrap();
        assert_eq!(rewritten.media_ssrc, 42);
        assert_eq!(rewritten.nacks, nack.nacks);

        let pli = PictureLossIndication {
            sender_ssrc: 1,
            media_ssrc: 555,
        };
        let rewritten = rewrite_media_ssrc(&pli, 42).unwrap();
        assert_eq!(rewritten.destination_ssrc(), vec![42]);
    }

    #[test]
    fn other_feedback_is_dropped() {
        let remb = ReceiverEstimatedMaximumBitrate {
            sender_ssrc: 1,
            bitrate: 1000.0,
            ssrcs: vec![555],
        };
        assert!(rewrite_media_ssrc(&remb, 42).is_none());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let transport = WebRtcTransport::new(WebRTCTransportConfig::default())
            .await
            .unwrap();
        assert_eq!(transport.kind(), TransportKind::WebRTC);
        transport.close().await;
        transport.close().await;
        assert!(transport.is_closed());
        assert!(transport.write_rtp(&rtp::packet::Packet::default()).is_err());
        assert!(transport.read_rtp().await.is_err());
    }
}
