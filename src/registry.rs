use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};

use tokio::{
    sync::{mpsc, RwLock},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::RegistryConfig,
    relay::listener::RelayListener,
    router::{Router, RouterStats},
    transport::Transport,
};

/// Notifications for the signaling layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackEvent {
    /// The router of this track is gone; other nodes should be told the stream was removed.
    TrackRemoved(String),
}

#[derive(Debug)]
pub(crate) enum RegistryEvent {
    /// A router closed itself. Carries the track id and the router id.
    RouterClosed(String, String),
}

/// Registry owns every [`Router`] of the process, one per track id.
#[derive(Debug)]
pub struct Registry {
    config: RegistryConfig,
    routers: RwLock<HashMap<String, Arc<Router>>>,
    registry_event_sender: mpsc::UnboundedSender<RegistryEvent>,
    track_event_sender: mpsc::UnboundedSender<TrackEvent>,
    cancel: CancellationToken,
}

impl Registry {
    /// Creates the registry. [`TrackEvent`]s are delivered on the returned receiver.
    pub fn new(config: RegistryConfig) -> (Arc<Self>, mpsc::UnboundedReceiver<TrackEvent>) {
        let (registry_event_sender, registry_event_receiver) = mpsc::unbounded_channel();
        let (track_event_sender, track_event_receiver) = mpsc::unbounded_channel();

        let registry = Arc::new(Self {
            config,
            routers: RwLock::new(HashMap::new()),
            registry_event_sender,
            track_event_sender,
            cancel: CancellationToken::new(),
        });

        {
            let registry = Arc::downgrade(&registry);
            tokio::spawn(async move {
                Self::registry_event_loop(registry, registry_event_receiver).await;
            });
        }

        tracing::debug!("Registry is created");

        (registry, track_event_receiver)
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Returns the router of the track, creating it when there is none.
    pub async fn get_or_create(&self, track_id: &str) -> Arc<Router> {
        let mut routers = self.routers.write().await;
        if let Some(router) = routers.get(track_id) {
            if !router.is_closed() {
                return router.clone();
            }
        }
        let router = Router::new_with_registry(
            track_id.to_owned(),
            self.config.router.clone(),
            self.registry_event_sender.clone(),
        );
        routers.insert(track_id.to_owned(), router.clone());
        tracing::info!("Registry added router {} for track_id={}", router.id, track_id);
        router
    }

    pub async fn get(&self, track_id: &str) -> Option<Arc<Router>> {
        self.routers.read().await.get(track_id).cloned()
    }

    pub async fn track_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.routers.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn router_count(&self) -> usize {
        self.routers.read().await.len()
    }

    /// Removes the router of the track and closes it. Returns false when the track is unknown.
    pub async fn delete(&self, track_id: &str) -> bool {
        let removed = self.routers.write().await.remove(track_id);
        match removed {
            Some(router) => {
                router.close().await;
                tracing::info!("Registry deleted router for track_id={}", track_id);
                true
            }
            None => false,
        }
    }

    /// Closes and removes every router that is not alive anymore, and reports each removed track.
    pub async fn sweep(&self) -> Vec<String> {
        let stale: Vec<(String, Arc<Router>)> = {
            let mut routers = self.routers.write().await;
            let keys: Vec<String> = routers
                .iter()
                .filter(|(_, router)| router.is_closed() || !router.alive())
                .map(|(key, _)| key.clone())
                .collect();
            keys.into_iter()
                .filter_map(|key| routers.remove(&key).map(|router| (key, router)))
                .collect()
        };

        let mut removed = Vec::with_capacity(stale.len());
        for (track_id, router) in stale {
            router.close().await;
            tracing::info!("Registry swept router {} for track_id={}", router.id, track_id);
            self.notify_track_removed(&track_id);
            removed.push(track_id);
        }
        removed
    }

    /// Runs [`Registry::sweep`] every `sweep_interval` until [`Registry::close`].
    pub fn spawn_sweep_task(self: &Arc<Self>) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        let interval = registry.config.sweep_interval;
        let cancel = registry.cancel.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        registry.sweep().await;
                        if tracing::enabled!(tracing::Level::TRACE) {
                            match serde_json::to_string(&registry.stats().await) {
                                Ok(stats) => tracing::trace!("Registry stats: {}", stats),
                                Err(err) => tracing::debug!("Failed to serialize registry stats: {}", err),
                            }
                        }
                    }
                }
            }
            tracing::debug!("Registry sweep task has finished");
        })
    }

    /// Attaches every relay flow accepted by `listener` as the publisher of the router for its track.
    pub fn serve_relay(self: &Arc<Self>, listener: RelayListener) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let transport = tokio::select! {
                    _ = registry.cancel.cancelled() => break,
                    transport = listener.accept() => match transport {
                        Some(transport) => transport,
                        None => break,
                    },
                };
                let track_id = transport.track_id().to_owned();
                let router = registry.get_or_create(&track_id).await;
                if let Err(err) = router.add_pub(transport.clone()).await {
                    tracing::warn!("Registry rejected relay flow for track_id={}: {}", track_id, err);
                    transport.close().await;
                }
            }
            listener.close();
            tracing::debug!("Registry relay task has finished");
        })
    }

    /// Removes the subscriber from every router. Returns the tracks fed by a relay that have no subscriber left,
    /// so the caller can stop pulling them from the other node.
    pub async fn del_sub_from_all(&self, subscriber_id: &str) -> Vec<String> {
        let routers: Vec<Arc<Router>> = self.routers.read().await.values().cloned().collect();
        let mut idle_relays = Vec::new();
        for router in routers {
            if router.get_sub(subscriber_id).await.is_none() {
                continue;
            }
            router.del_sub(subscriber_id).await;
            if router.has_no_subs().await && router.is_relay_pub().await {
                idle_relays.push(router.track_id().to_owned());
            }
        }
        idle_relays.sort();
        idle_relays
    }

    pub async fn stats(&self) -> Vec<RouterStats> {
        let routers: Vec<Arc<Router>> = self.routers.read().await.values().cloned().collect();
        let mut stats = Vec::with_capacity(routers.len());
        for router in routers {
            stats.push(router.stats().await);
        }
        stats.sort_by(|a, b| a.track_id.cmp(&b.track_id));
        stats
    }

    /// Stops the background tasks and closes every router.
    pub async fn close(&self) {
        self.cancel.cancel();
        let routers: Vec<Arc<Router>> = self
            .routers
            .write()
            .await
            .drain()
            .map(|(_, router)| router)
            .collect();
        for router in routers {
            router.close().await;
        }
        tracing::debug!("Registry is closed");
    }

    fn notify_track_removed(&self, track_id: &str) {
        if let Err(err) = self
            .track_event_sender
            .send(TrackEvent::TrackRemoved(track_id.to_owned()))
        {
            tracing::debug!("Failed to send TrackRemoved track_id={}: {}", track_id, err);
        }
    }

    async fn registry_event_loop(
        registry: Weak<Registry>,
        mut event_receiver: mpsc::UnboundedReceiver<RegistryEvent>,
    ) {
        while let Some(event) = event_receiver.recv().await {
            let Some(registry) = registry.upgrade() else {
                break;
            };
            match event {
                RegistryEvent::RouterClosed(track_id, router_id) => {
                    let removed = {
                        let mut routers = registry.routers.write().await;
                        match routers.get(&track_id) {
                            Some(router) if router.id == router_id => routers.remove(&track_id),
                            _ => None,
                        }
                    };
                    if removed.is_some() {
                        tracing::info!("Registry removed closed router {} for track_id={}", router_id, track_id);
                        registry.notify_track_removed(&track_id);
                    }
                }
            }
        }
        tracing::debug!("Registry event loop finished");
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.cancel.cancel();
        tracing::debug!("Registry is dropped");
    }
}
