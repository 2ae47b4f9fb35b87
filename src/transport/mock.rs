use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Mutex as StdMutex,
};

use async_trait::async_trait;
use tokio::sync::mpsc;
use webrtc::rtp;

use crate::{
    config::TransportConfig,
    error::{Error, TransportErrorKind},
};

use super::{RtcpPacket, Transport, TransportCore, TransportKind};

/// In-memory transport for router and registry tests.
#[derive(Debug)]
pub(crate) struct MockTransport {
    core: TransportCore,
    kind: TransportKind,
    fail_writes: AtomicBool,
    write_calls: AtomicUsize,
    written: StdMutex<Vec<rtp::packet::Packet>>,
    rtcp_written: StdMutex<Vec<RtcpPacket>>,
}

impl MockTransport {
    pub(crate) fn new(id: &str) -> Self {
        Self::with_kind(id, TransportKind::WebRTC)
    }

    pub(crate) fn relay(id: &str) -> Self {
        Self::with_kind(id, TransportKind::Relay)
    }

    fn with_kind(id: &str, kind: TransportKind) -> Self {
        Self {
            core: TransportCore::new(id.to_owned(), &TransportConfig::default()),
            kind,
            fail_writes: AtomicBool::new(false),
            write_calls: AtomicUsize::new(0),
            written: StdMutex::new(Vec::new()),
            rtcp_written: StdMutex::new(Vec::new()),
        }
    }

    /// Simulates a packet arriving from the remote publisher.
    pub(crate) fn push_rtp(&self, packet: rtp::packet::Packet) {
        self.core.deliver_rtp(packet);
    }

    /// Simulates feedback sent by the remote subscriber.
    pub(crate) fn push_rtcp(&self, packet: RtcpPacket) {
        self.core.deliver_rtcp(packet);
    }

    pub(crate) fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn write_calls(&self) -> usize {
        self.write_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn written_seqs(&self) -> Vec<u16> {
        self.written
            .lock()
            .unwrap()
            .iter()
            .map(|p| p.header.sequence_number)
            .collect()
    }

    pub(crate) fn take_rtcp_written(&self) -> Vec<RtcpPacket> {
        std::mem::take(&mut *self.rtcp_written.lock().unwrap())
    }

    /// Simulates the remote side going away.
    pub(crate) fn fail(&self) {
        self.core.close();
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn id(&self) -> String {
        self.core.id.clone()
    }

    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn read_rtp(&self) -> Result<rtp::packet::Packet, Error> {
        self.core.read_rtp().await
    }

    fn write_rtp(&self, packet: &rtp::packet::Packet) -> Result<(), Error> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        if self.core.is_closed() {
            return Err(self.core.closed_error());
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            self.core.record_write_error();
            return Err(Error::new_transport(
                "mock write failure".to_owned(),
                TransportErrorKind::WriteBackpressureError,
            ));
        }
        self.written.lock().unwrap().push(packet.clone());
        Ok(())
    }

    fn write_rtcp(&self, packet: RtcpPacket) -> Result<(), Error> {
        if self.core.is_closed() {
            return Err(self.core.closed_error());
        }
        self.rtcp_written.lock().unwrap().push(packet);
        Ok(())
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
    }

    fn is_closed(&self) -> bool {
        self.core.is_closed()
    }
}
