use bytes::{BufMut, Bytes, BytesMut};
use webrtc::{rtp, util::marshal::Marshal};
use webrtc_util::Unmarshal;

use crate::error::{Error, RelayErrorKind};

/// A relayed RTP packet. The track id travels as a trailer so the receiving node knows which router the flow belongs to.
///
/// Layout: `| RTP packet | track id bytes | track id length (1 byte) |`
#[derive(Debug, Clone)]
pub(crate) struct RelayPacket {
    pub packet: rtp::packet::Packet,
    pub track_id: String,
}

impl RelayPacket {
    pub fn marshal(&self) -> Result<Bytes, Error> {
        let track_id_bytes = self.track_id.as_bytes();
        if track_id_bytes.len() > u8::MAX as usize {
            return Err(Error::new_relay(
                format!("Track id {} is too long to relay", self.track_id),
                RelayErrorKind::InvalidPacketError,
            ));
        }
        let packet_buf = self.packet.marshal()?;

        let mut buf = BytesMut::with_capacity(packet_buf.len() + track_id_bytes.len() + 1);
        buf.extend_from_slice(&packet_buf);
        buf.extend_from_slice(track_id_bytes);
        buf.put_u8(track_id_bytes.len() as u8);

        Ok(buf.freeze())
    }

    pub fn unmarshal(bytes: &Bytes) -> Result<Self, Error> {
        let len = bytes.len();
        if len == 0 {
            return Err(Error::new_relay(
                "Relay packet is empty".to_owned(),
                RelayErrorKind::InvalidPacketError,
            ));
        }
        let track_id_len = bytes[len - 1] as usize;
        let Some(track_id_start) = (len - 1).checked_sub(track_id_len) else {
            return Err(Error::new_relay(
                format!("Relay packet of {} bytes can not hold track id of {} bytes", len, track_id_len),
                RelayErrorKind::InvalidPacketError,
            ));
        };

        let track_id = String::from_utf8(bytes[track_id_start..len - 1].to_vec()).map_err(|err| {
            Error::new_relay(
                format!("Track id is not utf-8: {}", err),
                RelayErrorKind::UnmarshalError,
            )
        })?;

        let mut rtp_bytes = bytes.slice(..track_id_start);
        let packet = rtp::packet::Packet::unmarshal(&mut rtp_bytes)?;

        Ok(Self { packet, track_id })
    }
}

/// RTP and RTCP share one socket. RTCP packet types occupy 192..=223 in the second byte (RFC 5761).
pub(crate) fn is_rtcp(buf: &[u8]) -> bool {
    buf.len() >= 2 && (192..=223).contains(&buf[1])
}

#[cfg(test)]
mod tests {
    use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;

    use super::*;

    fn packet() -> rtp::packet::Packet {
        rtp::packet::Packet {
            header: rtp::header::Header {
                version: 2,
                payload_type: 96,
                sequence_number: 4242,
                timestamp: 90000,
                ssrc: 1234,
                marker: true,
                ..Default::default()
            },
            payload: Bytes::from_static(&[1, 2, 3, 4]),
        }
    }

    #[test]
    fn track_id_trailer_survives() {
        let data = RelayPacket {
            packet: packet(),
            track_id: "camera-1".to_owned(),
        };
        let buf = data.marshal().unwrap();
        assert_eq!(buf[buf.len() - 1] as usize, "camera-1".len());
        assert!(!is_rtcp(&buf));

        let decoded = RelayPacket::unmarshal(&buf).unwrap();
        assert_eq!(decoded.track_id, "camera-1");
        assert_eq!(decoded.packet.header.sequence_number, 4242);
        assert_eq!(decoded.packet.header.ssrc, 1234);
        assert_eq!(decoded.packet.payload, Bytes::from_static(&[1, 2, 3, 4]));
    }

    #[test]
    fn truncated_packet_is_rejected() {
        assert!(RelayPacket::unmarshal(&Bytes::new()).is_err());
        assert!(RelayPacket::unmarshal(&Bytes::from_static(&[1, 2, 200])).is_err());
    }

    #[test]
    fn rtcp_is_told_apart_from_rtp() {
        let pli = PictureLossIndication {
            sender_ssrc: 0,
            media_ssrc: 1234,
        };
        let buf = pli.marshal().unwrap();
        assert!(is_rtcp(&buf));
    }
}
