use std::{net::IpAddr, time::Duration};

use serde::{Deserialize, Serialize};
use webrtc::peer_connection::configuration::RTCConfiguration;

/// Longest cycle allowed for the bandwidth estimate and keyframe request loops.
pub const MAX_CYCLE_SECS: u64 = 10;

/// Payload types treated as video when requesting keyframes: VP8, VP9 and H264.
pub const DEFAULT_VIDEO_PAYLOAD_TYPES: [u8; 3] = [96, 98, 102];

/// Configuration for [`crate::buffer::PacketBuffer`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Retention window in packets. A packet older than `max_late` sequence numbers behind the newest one is dropped.
    pub max_late: u16,
    /// Seconds between bandwidth estimates sent to the publisher. 0 disables them.
    pub remb_cycle: u64,
    /// Seconds between keyframe requests sent to the publisher. 0 disables them.
    pub pli_cycle: u64,
    /// Lower bound of the estimate, in bits per second.
    pub low_bandwidth: u64,
    /// Upper bound of the estimate, in bits per second.
    pub high_bandwidth: u64,
    /// Optional cap that lowers `high_bandwidth` for this publisher.
    pub max_bandwidth: Option<u64>,
    pub video_payload_types: Vec<u8>,
    pub feedback_channel_size: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_late: 1000,
            remb_cycle: 2,
            pli_cycle: 1,
            low_bandwidth: 240_000,
            high_bandwidth: 4_000_000,
            max_bandwidth: None,
            video_payload_types: DEFAULT_VIDEO_PAYLOAD_TYPES.to_vec(),
            feedback_channel_size: 1024,
        }
    }
}

impl BufferConfig {
    pub(crate) fn remb_interval(&self) -> Option<Duration> {
        cycle_interval(self.remb_cycle)
    }

    pub(crate) fn pli_interval(&self) -> Option<Duration> {
        cycle_interval(self.pli_cycle)
    }

    /// Ceiling of the estimate after applying `max_bandwidth`. Never below the floor.
    pub(crate) fn ceiling(&self) -> u64 {
        let ceiling = match self.max_bandwidth {
            Some(max) => self.high_bandwidth.min(max),
            None => self.high_bandwidth,
        };
        ceiling.max(self.low_bandwidth)
    }

    pub(crate) fn is_video(&self, payload_type: u8) -> bool {
        self.video_payload_types.contains(&payload_type)
    }
}

fn cycle_interval(cycle: u64) -> Option<Duration> {
    if cycle == 0 {
        return None;
    }
    Some(Duration::from_secs(cycle.min(MAX_CYCLE_SECS)))
}

/// Configuration for [`crate::router::Router`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Consecutive write failures after which a subscriber is evicted.
    pub max_write_errors: usize,
    /// A router that has not received a packet for this long is not alive.
    pub live_cycle: Duration,
    pub buffer: BufferConfig,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_write_errors: 100,
            live_cycle: Duration::from_secs(6),
            buffer: BufferConfig::default(),
        }
    }
}

/// Channel sizes shared by every [`crate::transport::Transport`] implementation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    pub rtp_channel_size: usize,
    pub rtcp_channel_size: usize,
    pub write_channel_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            rtp_channel_size: 1024,
            rtcp_channel_size: 1024,
            write_channel_size: 1024,
        }
    }
}

/// Configuration for [`crate::transport::webrtc_transport::WebRtcTransport`].
#[derive(Clone)]
pub struct WebRTCTransportConfig {
    pub configuration: RTCConfiguration,
    /// IPs announced as host candidates instead of the local interface addresses.
    pub announced_ips: Vec<IpAddr>,
    pub transport: TransportConfig,
}

impl std::fmt::Debug for WebRTCTransportConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRTCTransportConfig")
            .field("ice_servers", &self.configuration.ice_servers.len())
            .field("announced_ips", &self.announced_ips)
            .field("transport", &self.transport)
            .finish()
    }
}

impl Default for WebRTCTransportConfig {
    fn default() -> Self {
        Self {
            configuration: RTCConfiguration::default(),
            announced_ips: Vec::new(),
            transport: TransportConfig::default(),
        }
    }
}

/// Configuration for [`crate::registry::Registry`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// How often stale routers are reclaimed.
    pub sweep_interval: Duration,
    pub router: RouterConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(3),
            router: RouterConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycles_are_capped_and_zero_disables() {
        let mut config = BufferConfig::default();
        assert_eq!(config.remb_interval(), Some(Duration::from_secs(2)));
        config.remb_cycle = 30;
        assert_eq!(config.remb_interval(), Some(Duration::from_secs(10)));
        config.pli_cycle = 0;
        assert_eq!(config.pli_interval(), None);
    }

    #[test]
    fn max_bandwidth_lowers_ceiling() {
        let mut config = BufferConfig::default();
        assert_eq!(config.ceiling(), 4_000_000);
        config.max_bandwidth = Some(1_000_000);
        assert_eq!(config.ceiling(), 1_000_000);
        config.max_bandwidth = Some(1);
        assert_eq!(config.ceiling(), config.low_bandwidth);
    }
}
