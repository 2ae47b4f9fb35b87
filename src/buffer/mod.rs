use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use webrtc::{
    rtcp::{
        payload_feedbacks::{
            picture_loss_indication::PictureLossIndication,
            receiver_estimated_maximum_bitrate::ReceiverEstimatedMaximumBitrate,
        },
        transport_feedbacks::transport_layer_nack::TransportLayerNack,
    },
    rtp,
};

use crate::{config::BufferConfig, transport::RtcpPacket};

/// Bandwidth estimation from measured loss and bitrate.
pub mod estimator;
/// Retention ring and loss detection for one SSRC.
pub mod stream;

use estimator::estimate_bandwidth;
use stream::{StreamBuffer, StreamStats};

/// PacketBuffer keeps recent packets of every SSRC received from a publisher, and produces the feedback
/// the publisher needs: retransmission requests, bandwidth estimates and keyframe requests.
///
/// Feedback is queued on the channel returned by [`PacketBuffer::new`].
#[derive(Debug)]
pub struct PacketBuffer {
    config: BufferConfig,
    streams: Mutex<HashMap<u32, StreamBuffer>>,
    feedback_sender: mpsc::Sender<RtcpPacket>,
}

impl PacketBuffer {
    pub fn new(config: BufferConfig) -> (Self, mpsc::Receiver<RtcpPacket>) {
        let (feedback_sender, feedback_receiver) =
            mpsc::channel(config.feedback_channel_size.max(1));
        let buffer = Self {
            config,
            streams: Mutex::new(HashMap::new()),
            feedback_sender,
        };
        (buffer, feedback_receiver)
    }

    /// Stores a packet. The first packet of an SSRC binds its payload type.
    pub async fn push(&self, packet: rtp::packet::Packet) {
        let ssrc = packet.header.ssrc;
        let nack = {
            let mut streams = self.streams.lock().await;
            let stream = streams.entry(ssrc).or_insert_with(|| {
                tracing::debug!(
                    "PacketBuffer new stream ssrc={} payload_type={}",
                    ssrc,
                    packet.header.payload_type
                );
                StreamBuffer::new(ssrc, packet.header.payload_type, self.config.max_late)
            });
            stream.push(packet)
        };

        if let Some(pair) = nack {
            self.send_feedback(Box::new(TransportLayerNack {
                sender_ssrc: 0,
                media_ssrc: ssrc,
                nacks: vec![pair],
            }));
        }
    }

    pub async fn find_packet(&self, ssrc: u32, seq: u16) -> Option<Arc<rtp::packet::Packet>> {
        let streams = self.streams.lock().await;
        streams.get(&ssrc).and_then(|stream| stream.find_packet(seq))
    }

    pub async fn stats(&self) -> Vec<StreamStats> {
        let streams = self.streams.lock().await;
        let mut stats: Vec<StreamStats> = streams.values().map(|s| s.stats()).collect();
        stats.sort_by_key(|s| s.ssrc);
        stats
    }

    /// Starts the bandwidth estimate and keyframe request loops. Both stop when `cancel` fires.
    pub fn spawn_feedback_loops(self: &Arc<Self>, cancel: CancellationToken) {
        if let Some(interval) = self.config.remb_interval() {
            let buffer = self.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                buffer.remb_loop(interval, cancel).await;
            });
        }
        if let Some(interval) = self.config.pli_interval() {
            let buffer = self.clone();
            tokio::spawn(async move {
                buffer.pli_loop(interval, cancel).await;
            });
        }
    }

    async fn remb_loop(&self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    for packet in self.bandwidth_reports(interval.as_secs()).await {
                        self.send_feedback(packet);
                    }
                }
            }
        }
        tracing::debug!("PacketBuffer REMB loop has finished");
    }

    async fn pli_loop(&self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    for packet in self.keyframe_requests().await {
                        self.send_feedback(packet);
                    }
                }
            }
        }
        tracing::debug!("PacketBuffer PLI loop has finished");
    }

    /// One bandwidth estimate per SSRC for the cycle that just ended.
    pub(crate) async fn bandwidth_reports(&self, cycle_secs: u64) -> Vec<RtcpPacket> {
        let floor = self.config.low_bandwidth;
        let ceiling = self.config.ceiling();
        let mut streams = self.streams.lock().await;
        streams
            .values_mut()
            .map(|stream| {
                let (lost_rate, bitrate) = stream.calc_lost_rate_and_byte_rate(cycle_secs);
                let bandwidth = estimate_bandwidth(lost_rate, bitrate, floor, ceiling);
                tracing::trace!(
                    "PacketBuffer ssrc={} lost_rate={} bitrate={} estimate={}",
                    stream.ssrc(),
                    lost_rate,
                    bitrate,
                    bandwidth
                );
                Box::new(ReceiverEstimatedMaximumBitrate {
                    sender_ssrc: 0,
                    bitrate: bandwidth as f32,
                    ssrcs: vec![stream.ssrc()],
                }) as RtcpPacket
            })
            .collect()
    }

    pub(crate) async fn keyframe_requests(&self) -> Vec<RtcpPacket> {
        let streams = self.streams.lock().await;
        streams
            .values()
            .filter(|stream| self.config.is_video(stream.payload_type()))
            .map(|stream| {
                Box::new(PictureLossIndication {
                    sender_ssrc: 0,
                    media_ssrc: stream.ssrc(),
                }) as RtcpPacket
            })
            .collect()
    }

    fn send_feedback(&self, packet: RtcpPacket) {
        if let Err(err) = self.feedback_sender.try_send(packet) {
            tracing::warn!("PacketBuffer failed to queue feedback: {}", err);
        }
    }
}
