use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use tracing_subscriber::prelude::__tracing_subscriber_SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use trackrouter::config::{RegistryConfig, TransportConfig};
use trackrouter::registry::{Registry, TrackEvent};
use trackrouter::relay::listener::RelayListener;
use trackrouter::transport::rtp_transport::RtpTransport;

/// Receives relayed tracks on RELAY_ADDR. When FORWARD_TO and TRACK_ID are set, the track is
/// relayed again to that address, so two nodes can be chained.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let relay_addr = env::var("RELAY_ADDR").unwrap_or_else(|_| "0.0.0.0:9443".to_string());

    let (registry, mut track_events) = Registry::new(RegistryConfig::default());
    let sweep = registry.spawn_sweep_task();

    let listener = RelayListener::bind(relay_addr.as_str(), TransportConfig::default()).await?;
    tracing::info!("Listening for relay flows on {}", listener.local_addr());
    let relay = registry.serve_relay(listener);

    if let (Ok(forward_to), Ok(track_id)) = (env::var("FORWARD_TO"), env::var("TRACK_ID")) {
        let forward_to: SocketAddr = forward_to.parse()?;
        let registry = registry.clone();
        tokio::spawn(async move {
            // Subscribe once the track arrives, otherwise the sweep reclaims the empty router.
            let router = loop {
                if let Some(router) = registry.get(&track_id).await {
                    if router.publisher().await.is_some() {
                        break router;
                    }
                }
                tokio::time::sleep(Duration::from_millis(500)).await;
            };
            let transport =
                match RtpTransport::connect(track_id.clone(), forward_to, &TransportConfig::default())
                    .await
                {
                    Ok(transport) => transport,
                    Err(err) => {
                        tracing::error!("Failed to connect to {}: {}", forward_to, err);
                        return;
                    }
                };
            match router.add_sub(format!("relay-{}", forward_to), transport).await {
                Ok(()) => tracing::info!("Forwarding track {} to {}", track_id, forward_to),
                Err(err) => tracing::error!("Failed to forward track {}: {}", track_id, err),
            }
        });
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = track_events.recv() => match event {
                Some(TrackEvent::TrackRemoved(track_id)) => {
                    tracing::info!("Track {} was removed", track_id);
                }
                None => break,
            },
        }
    }

    registry.close().await;
    let _ = tokio::join!(sweep, relay);
    Ok(())
}
