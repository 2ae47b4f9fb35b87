#![deny(missing_debug_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg))]
//! # Trackrouter
//! Trackrouter is the media routing core of a selective forwarding unit. Each published track gets a
//! [`router::Router`] that fans its RTP packets out to every subscriber, answers retransmission requests from
//! its packet buffer and sends loss, bandwidth and keyframe feedback back to the publisher.
//!
//! Tracks are received from WebRTC peers ([`transport::webrtc_transport::WebRtcTransport`]) or relayed from other
//! nodes over plain UDP ([`transport::rtp_transport::RtpTransport`]). This doesn't provide signaling, please
//! create your own signaling server and drive the [`registry::Registry`] from it.

/// Packet retention, loss detection and feedback generation for a publisher.
pub mod buffer;
/// Configuration for [`registry::Registry`], [`router::Router`] and the transports.
pub mod config;
pub mod error;
/// Registry is a module that manages the routers of all tracks.
pub mod registry;
/// Relay is a module that receives tracks from other servers.
pub mod relay;
/// Router is a module that determines which media to distribute to whom.
pub mod router;
pub mod transport;
