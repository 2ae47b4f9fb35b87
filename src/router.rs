use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex as StdMutex,
    },
};

use serde::Serialize;
use tokio::{
    sync::{mpsc, RwLock},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use webrtc::{
    rtcp::{
        payload_feedbacks::picture_loss_indication::PictureLossIndication,
        transport_feedbacks::transport_layer_nack::{NackPair, TransportLayerNack},
    },
    rtp,
};

use crate::{
    buffer::{stream::StreamStats, PacketBuffer},
    config::RouterConfig,
    error::{Error, RouterErrorKind},
    registry::RegistryEvent,
    transport::{RtcpPacket, Transport, TransportKind},
};

/// Router forwards the media of one track from its publisher to every subscriber.
///
/// It also answers retransmission requests from its [`PacketBuffer`] and forwards keyframe requests to the publisher.
#[derive(Debug)]
pub struct Router {
    pub id: String,
    track_id: String,
    config: RouterConfig,
    publisher: RwLock<Option<Arc<dyn Transport>>>,
    subscribers: RwLock<HashMap<String, Subscription>>,
    buffer: Arc<PacketBuffer>,
    feedback_receiver: StdMutex<Option<mpsc::Receiver<RtcpPacket>>>,
    // Held for reading while packets are written to subscribers, and for writing by close.
    write_gate: RwLock<()>,
    created_at: Instant,
    last_packet_ms: AtomicU64,
    closed: AtomicBool,
    cancel: CancellationToken,
    registry_event_sender: Option<mpsc::UnboundedSender<RegistryEvent>>,
}

#[derive(Debug)]
struct Subscription {
    transport: Arc<dyn Transport>,
    cancel: CancellationToken,
}

#[derive(Debug, Clone, Serialize)]
pub struct RouterStats {
    pub router_id: String,
    pub track_id: String,
    pub publisher_id: Option<String>,
    pub publisher_kind: Option<String>,
    pub subscriber_ids: Vec<String>,
    pub alive: bool,
    pub streams: Vec<StreamStats>,
}

impl Router {
    /// Creates a router that is not tracked by any [`crate::registry::Registry`].
    pub fn new(track_id: String, config: RouterConfig) -> Arc<Router> {
        Self::build(track_id, config, None)
    }

    pub(crate) fn new_with_registry(
        track_id: String,
        config: RouterConfig,
        registry_event_sender: mpsc::UnboundedSender<RegistryEvent>,
    ) -> Arc<Router> {
        Self::build(track_id, config, Some(registry_event_sender))
    }

    fn build(
        track_id: String,
        config: RouterConfig,
        registry_event_sender: Option<mpsc::UnboundedSender<RegistryEvent>>,
    ) -> Arc<Router> {
        let id = Uuid::new_v4().to_string();
        let (buffer, feedback_receiver) = PacketBuffer::new(config.buffer.clone());

        tracing::debug!("Router {} is created for track_id={}", id, track_id);

        Arc::new(Router {
            id,
            track_id,
            config,
            publisher: RwLock::new(None),
            subscribers: RwLock::new(HashMap::new()),
            buffer: Arc::new(buffer),
            feedback_receiver: StdMutex::new(Some(feedback_receiver)),
            write_gate: RwLock::new(()),
            created_at: Instant::now(),
            last_packet_ms: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            registry_event_sender,
        })
    }

    pub fn track_id(&self) -> &str {
        &self.track_id
    }

    /// Sets the publisher and starts forwarding its packets.
    ///
    /// A router has a single publisher for its whole life: a second call fails with
    /// [`RouterErrorKind::PublisherAlreadyExistsError`] and leaves the current publisher untouched.
    pub async fn add_pub(self: &Arc<Self>, transport: Arc<dyn Transport>) -> Result<(), Error> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        {
            let mut publisher = self.publisher.write().await;
            if let Some(current) = publisher.as_ref() {
                tracing::warn!(
                    "Router track_id={} already has publisher {}, refusing {}",
                    self.track_id,
                    current.id(),
                    transport.id()
                );
                return Err(Error::new_router(
                    format!("Track {} already has a publisher", self.track_id),
                    RouterErrorKind::PublisherAlreadyExistsError,
                ));
            }
            *publisher = Some(transport.clone());
        }
        if self.is_closed() {
            // close() may have read the publisher slot before it was set.
            transport.close().await;
            return Err(self.closed_error());
        }
        self.refresh();

        tracing::info!(
            "Router track_id={} publisher {} ({}) is added",
            self.track_id,
            transport.id(),
            transport.kind()
        );

        {
            let router = self.clone();
            tokio::spawn(async move {
                Self::rtp_fanout_loop(router, transport).await;
            });
        }

        let feedback_receiver = match self.feedback_receiver.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        if let Some(feedback_receiver) = feedback_receiver {
            let router = self.clone();
            tokio::spawn(async move {
                Self::feedback_loop(router, feedback_receiver).await;
            });
        }
        self.buffer.spawn_feedback_loops(self.cancel.child_token());

        Ok(())
    }

    /// Adds a subscriber. A subscriber already registered with the same id is replaced and closed.
    pub async fn add_sub(
        self: &Arc<Self>,
        subscriber_id: String,
        transport: Arc<dyn Transport>,
    ) -> Result<(), Error> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        let rtcp_receiver = transport.take_rtcp_receiver();
        let cancel = self.cancel.child_token();

        let replaced = {
            let mut subscribers = self.subscribers.write().await;
            if self.is_closed() {
                return Err(self.closed_error());
            }
            subscribers.insert(
                subscriber_id.clone(),
                Subscription {
                    transport: transport.clone(),
                    cancel: cancel.clone(),
                },
            )
        };

        if let Some(replaced) = replaced {
            tracing::debug!(
                "Router track_id={} subscriber id={} is replaced",
                self.track_id,
                subscriber_id
            );
            replaced.cancel.cancel();
            if !Arc::ptr_eq(&replaced.transport, &transport) {
                replaced.transport.close().await;
            }
        }

        match rtcp_receiver {
            Some(rtcp_receiver) => {
                let router = self.clone();
                let id = subscriber_id.clone();
                tokio::spawn(async move {
                    Self::rtcp_event_loop(router, id, transport, rtcp_receiver, cancel).await;
                });
            }
            None => {
                tracing::warn!(
                    "Router track_id={} subscriber id={} has no RTCP stream, feedback is ignored",
                    self.track_id,
                    subscriber_id
                );
            }
        }

        tracing::info!(
            "Router track_id={} subscriber id={} is added",
            self.track_id,
            subscriber_id
        );
        Ok(())
    }

    /// Removes and closes a subscriber. Unknown ids are ignored.
    pub async fn del_sub(&self, subscriber_id: &str) {
        let removed = self.subscribers.write().await.remove(subscriber_id);
        match removed {
            Some(subscription) => {
                subscription.cancel.cancel();
                subscription.transport.close().await;
                tracing::info!(
                    "Router track_id={} subscriber id={} is removed",
                    self.track_id,
                    subscriber_id
                );
            }
            None => {
                tracing::debug!(
                    "Router track_id={} subscriber id={} is not found",
                    self.track_id,
                    subscriber_id
                );
            }
        }
    }

    /// Removes the subscriber only if `transport` is still the one registered under `subscriber_id`.
    /// A subscriber replaced while the failing write was in flight is left alone.
    async fn evict_sub(&self, subscriber_id: &str, transport: &Arc<dyn Transport>) {
        let removed = {
            let mut subscribers = self.subscribers.write().await;
            match subscribers.get(subscriber_id) {
                Some(current) if Arc::ptr_eq(&current.transport, transport) => {
                    subscribers.remove(subscriber_id)
                }
                _ => None,
            }
        };
        match removed {
            Some(subscription) => {
                subscription.cancel.cancel();
                subscription.transport.close().await;
                tracing::warn!(
                    "Router track_id={} subscriber id={} is evicted",
                    self.track_id,
                    subscriber_id
                );
            }
            None => {
                tracing::debug!(
                    "Router track_id={} subscriber id={} was replaced, nothing to evict",
                    self.track_id,
                    subscriber_id
                );
            }
        }
    }

    pub async fn get_sub(&self, subscriber_id: &str) -> Option<Arc<dyn Transport>> {
        self.subscribers
            .read()
            .await
            .get(subscriber_id)
            .map(|s| s.transport.clone())
    }

    pub async fn subscriber_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.subscribers.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn has_no_subs(&self) -> bool {
        self.subscribers.read().await.is_empty()
    }

    pub async fn publisher(&self) -> Option<Arc<dyn Transport>> {
        self.publisher.read().await.clone()
    }

    /// True when the publisher is a relay flow from another node.
    pub async fn is_relay_pub(&self) -> bool {
        self.publisher
            .read()
            .await
            .as_ref()
            .map(|p| p.kind() == TransportKind::Relay)
            .unwrap_or(false)
    }

    /// True while the publisher sent a packet within the last `live_cycle`. A router without packets yet
    /// counts from its creation or from the moment its publisher was added.
    pub fn alive(&self) -> bool {
        let last = self.created_at
            + std::time::Duration::from_millis(self.last_packet_ms.load(Ordering::Relaxed));
        Instant::now() < last + self.config.live_cycle
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn stats(&self) -> RouterStats {
        let (publisher_id, publisher_kind) = match self.publisher.read().await.as_ref() {
            Some(p) => (Some(p.id()), Some(p.kind().to_string())),
            None => (None, None),
        };
        RouterStats {
            router_id: self.id.clone(),
            track_id: self.track_id.clone(),
            publisher_id,
            publisher_kind,
            subscriber_ids: self.subscriber_ids().await,
            alive: self.alive(),
            streams: self.buffer.stats().await,
        }
    }

    /// Stops forwarding and closes the publisher and every subscriber. Once it returns, no more packets are
    /// written to any subscriber. Calling it again is a no-op.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        // Wait for writes already in progress.
        drop(self.write_gate.write().await);

        let subscribers: Vec<Subscription> = self
            .subscribers
            .write()
            .await
            .drain()
            .map(|(_, s)| s)
            .collect();
        let publisher = self.publisher.read().await.clone();

        if let Some(publisher) = publisher {
            publisher.close().await;
        }
        for subscription in subscribers {
            subscription.transport.close().await;
        }

        if let Some(sender) = &self.registry_event_sender {
            if let Err(err) = sender.send(RegistryEvent::RouterClosed(
                self.track_id.clone(),
                self.id.clone(),
            )) {
                tracing::debug!("Router {} failed to send RouterClosed event: {}", self.id, err);
            }
        }

        tracing::info!("Router {} track_id={} is closed", self.id, self.track_id);
    }

    fn refresh(&self) {
        let elapsed = Instant::now().saturating_duration_since(self.created_at);
        self.last_packet_ms
            .store(elapsed.as_millis() as u64, Ordering::Relaxed);
    }

    fn closed_error(&self) -> Error {
        Error::new_router(
            format!("Router for track {} is closed", self.track_id),
            RouterErrorKind::RouterClosedError,
        )
    }

    async fn subscriber_snapshot(&self) -> Vec<(String, Arc<dyn Transport>)> {
        self.subscribers
            .read()
            .await
            .iter()
            .map(|(id, s)| (id.clone(), s.transport.clone()))
            .collect()
    }

    async fn rtp_fanout_loop(router: Arc<Router>, publisher: Arc<dyn Transport>) {
        tracing::debug!(
            "Router track_id={} fan-out loop has started",
            router.track_id
        );
        let cancel = router.cancel.clone();
        let max_write_errors = router.config.max_write_errors.max(1);

        loop {
            let packet = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                res = publisher.read_rtp() => match res {
                    Ok(packet) => packet,
                    Err(err) => {
                        tracing::info!(
                            "Router track_id={} publisher {} is gone: {}",
                            router.track_id,
                            publisher.id(),
                            err
                        );
                        break;
                    }
                },
            };

            router.refresh();
            router.buffer.push(packet.clone()).await;

            let subscribers = router.subscriber_snapshot().await;
            let mut evicted = Vec::new();
            {
                let _gate = router.write_gate.read().await;
                if router.is_closed() {
                    break;
                }
                for (id, subscriber) in subscribers {
                    if Self::write_to_subscriber(&id, &subscriber, &packet, max_write_errors) {
                        evicted.push((id, subscriber));
                    }
                }
            }

            for (id, subscriber) in evicted {
                router.evict_sub(&id, &subscriber).await;
            }
        }

        tracing::debug!(
            "Router track_id={} fan-out loop has finished",
            router.track_id
        );
        router.close().await;
    }

    /// Returns true when the subscriber has to be evicted.
    fn write_to_subscriber(
        id: &str,
        subscriber: &Arc<dyn Transport>,
        packet: &rtp::packet::Packet,
        max_write_errors: usize,
    ) -> bool {
        match subscriber.write_rtp(packet) {
            Ok(()) => {
                subscriber.reset_write_errors();
                false
            }
            Err(err) => {
                if err.is_closed() || subscriber.is_closed() {
                    return true;
                }
                let count = subscriber.write_error_count();
                tracing::trace!(
                    "subscriber id={} failed to write seq={} ({} errors): {}",
                    id,
                    packet.header.sequence_number,
                    count,
                    err
                );
                count >= max_write_errors
            }
        }
    }

    async fn rtcp_event_loop(
        router: Arc<Router>,
        subscriber_id: String,
        subscriber: Arc<dyn Transport>,
        mut rtcp_receiver: mpsc::Receiver<RtcpPacket>,
        cancel: CancellationToken,
    ) {
        tracing::debug!(
            "Router track_id={} subscriber id={} RTCP event loop has started",
            router.track_id,
            subscriber_id
        );
        loop {
            let packet = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                packet = rtcp_receiver.recv() => match packet {
                    Some(packet) => packet,
                    None => break,
                },
            };
            router.handle_subscriber_feedback(&subscriber, packet).await;
        }
        tracing::debug!(
            "Router track_id={} subscriber id={} RTCP event loop has finished",
            router.track_id,
            subscriber_id
        );
    }

    async fn handle_subscriber_feedback(&self, subscriber: &Arc<dyn Transport>, packet: RtcpPacket) {
        if packet.as_any().is::<PictureLossIndication>() {
            tracing::debug!("Router track_id={} forwards PLI", self.track_id);
            self.write_to_publisher(packet).await;
            return;
        }

        let (sender_ssrc, media_ssrc, pairs) =
            match packet.as_any().downcast_ref::<TransportLayerNack>() {
                Some(nack) => (nack.sender_ssrc, nack.media_ssrc, nack.nacks.clone()),
                None => {
                    tracing::trace!("Router track_id={} ignores {}", self.track_id, packet);
                    return;
                }
            };

        for seq in pairs.iter().flat_map(|pair| pair.packet_list()) {
            match self.buffer.find_packet(media_ssrc, seq).await {
                Some(found) => {
                    let _gate = self.write_gate.read().await;
                    if self.is_closed() {
                        return;
                    }
                    if let Err(err) = subscriber.write_rtp(&found) {
                        tracing::debug!(
                            "Router track_id={} failed to retransmit seq={}: {}",
                            self.track_id,
                            seq,
                            err
                        );
                    }
                }
                None => {
                    tracing::trace!(
                        "Router track_id={} has no packet ssrc={} seq={}, asking the publisher",
                        self.track_id,
                        media_ssrc,
                        seq
                    );
                    self.write_to_publisher(Box::new(TransportLayerNack {
                        sender_ssrc,
                        media_ssrc,
                        nacks: vec![NackPair {
                            packet_id: seq,
                            lost_packets: 0,
                        }],
                    }))
                    .await;
                }
            }
        }
    }

    async fn feedback_loop(router: Arc<Router>, mut feedback_receiver: mpsc::Receiver<RtcpPacket>) {
        let cancel = router.cancel.clone();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                packet = feedback_receiver.recv() => match packet {
                    Some(packet) => router.write_to_publisher(packet).await,
                    None => break,
                },
            }
        }
        tracing::debug!(
            "Router track_id={} feedback loop has finished",
            router.track_id
        );
    }

    async fn write_to_publisher(&self, packet: RtcpPacket) {
        let publisher = self.publisher.read().await.clone();
        match publisher {
            Some(publisher) => {
                if let Err(err) = publisher.write_rtcp(packet) {
                    tracing::debug!(
                        "Router track_id={} failed to write RTCP to publisher: {}",
                        self.track_id,
                        err
                    );
                }
            }
            None => {
                tracing::trace!(
                    "Router track_id={} has no publisher for feedback",
                    self.track_id
                );
            }
        }
    }
}

impl Drop for Router {
    fn drop(&mut self) {
        tracing::debug!("Router {} is dropped", self.id);
    }
}
