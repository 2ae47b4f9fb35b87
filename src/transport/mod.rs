use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex as StdMutex,
    },
};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use webrtc::{rtcp, rtp};

use crate::{
    config::TransportConfig,
    error::{Error, TransportErrorKind},
};

#[cfg(test)]
pub(crate) mod mock;
/// Server-to-server relay transport, one UDP flow per track.
pub mod rtp_transport;
/// Browser-facing transport backed by [`webrtc::peer_connection::RTCPeerConnection`].
pub mod webrtc_transport;

/// A control packet travelling next to the media stream (NACK, PLI, REMB...).
pub type RtcpPacket = Box<dyn rtcp::packet::Packet + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum TransportKind {
    #[strum(serialize = "webrtc")]
    WebRTC,
    #[strum(serialize = "relay")]
    Relay,
}

/// Transport is what a [`crate::router::Router`] reads media from and writes media to.
///
/// The router never looks behind this trait, so a browser peer connection and a relay flow
/// from another node are handled the same way.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    fn id(&self) -> String;

    fn kind(&self) -> TransportKind;

    /// Waits for the next RTP packet. An error means the transport is gone and no more packets will arrive.
    async fn read_rtp(&self) -> Result<rtp::packet::Packet, Error>;

    /// Queues a packet without waiting. A failure increments the write error counter.
    fn write_rtp(&self, packet: &rtp::packet::Packet) -> Result<(), Error>;

    fn write_rtcp(&self, packet: RtcpPacket) -> Result<(), Error>;

    /// Hands out the stream of control packets received from the remote side. Only the first call gets it.
    fn take_rtcp_receiver(&self) -> Option<mpsc::Receiver<RtcpPacket>>;

    fn write_error_count(&self) -> usize;

    fn reset_write_errors(&self);

    /// Closes the underlying session. Calling it more than once is a no-op.
    async fn close(&self);

    fn is_closed(&self) -> bool;
}

/// State every transport carries: the incoming channels, the write error counter and the closed flag.
#[derive(Debug)]
pub(crate) struct TransportCore {
    pub(crate) id: String,
    rtp_sender: mpsc::Sender<rtp::packet::Packet>,
    rtp_receiver: Mutex<mpsc::Receiver<rtp::packet::Packet>>,
    rtcp_sender: mpsc::Sender<RtcpPacket>,
    rtcp_receiver: StdMutex<Option<mpsc::Receiver<RtcpPacket>>>,
    write_errors: AtomicUsize,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl TransportCore {
    pub(crate) fn new(id: String, config: &TransportConfig) -> Self {
        let (rtp_sender, rtp_receiver) = mpsc::channel(config.rtp_channel_size.max(1));
        let (rtcp_sender, rtcp_receiver) = mpsc::channel(config.rtcp_channel_size.max(1));
        Self {
            id,
            rtp_sender,
            rtp_receiver: Mutex::new(rtp_receiver),
            rtcp_sender,
            rtcp_receiver: StdMutex::new(Some(rtcp_receiver)),
            write_errors: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    /// Pushes a packet received from the network. Returns false once the transport is closed.
    pub(crate) fn deliver_rtp(&self, packet: rtp::packet::Packet) -> bool {
        if self.is_closed() {
            return false;
        }
        match self.rtp_sender.try_send(packet) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(packet)) => {
                tracing::warn!(
                    "Transport {} RTP queue is full, dropping seq={}",
                    self.id,
                    packet.header.sequence_number
                );
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub(crate) fn deliver_rtcp(&self, packet: RtcpPacket) -> bool {
        if self.is_closed() {
            return false;
        }
        match self.rtcp_sender.try_send(packet) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!("Transport {} RTCP queue is full, dropping packet", self.id);
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub(crate) async fn read_rtp(&self) -> Result<rtp::packet::Packet, Error> {
        let mut receiver = self.rtp_receiver.lock().await;
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(self.closed_error()),
            packet = receiver.recv() => packet.ok_or_else(|| self.closed_error()),
        }
    }

    pub(crate) fn take_rtcp_receiver(&self) -> Option<mpsc::Receiver<RtcpPacket>> {
        match self.rtcp_receiver.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        }
    }

    pub(crate) fn record_write_error(&self) -> usize {
        self.write_errors.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn write_error_count(&self) -> usize {
        self.write_errors.load(Ordering::Relaxed)
    }

    pub(crate) fn reset_write_errors(&self) {
        self.write_errors.store(0, Ordering::Relaxed);
    }

    /// Marks the transport closed and wakes every pending reader. Returns true only for the first call.
    pub(crate) fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.cancel.cancel();
        true
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub(crate) fn closed_error(&self) -> Error {
        Error::new_transport(
            format!("Transport {} is closed", self.id),
            TransportErrorKind::TransportClosedError,
        )
    }

    pub(crate) fn backpressure_error(&self) -> Error {
        self.record_write_error();
        Error::new_transport(
            format!("Transport {} write queue is full", self.id),
            TransportErrorKind::WriteBackpressureError,
        )
    }
}
