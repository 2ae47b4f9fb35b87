use std::sync::Arc;

use derivative::Derivative;
use serde::Serialize;
use webrtc::{
    rtcp::transport_feedbacks::transport_layer_nack::NackPair, rtp, util::marshal::MarshalSize,
};

/// One slot per possible sequence number.
pub const RING_SIZE: usize = 1 << 16;

/// A scan runs once the newest packet is this far ahead of the NACK cursor.
const NACK_SCAN_TRIGGER: u16 = 16;
/// Beyond this distance the cursor has fallen behind and is moved forward instead of scanning stale slots.
const NACK_SCAN_LIMIT: u16 = 23;
/// Packets this close to the newest one are not reported lost yet, they may only be reordered.
const NACK_CURSOR_STEP: u16 = 8;
/// A NACK pair covers its base sequence number plus this many following ones.
const NACK_BITMAP_WIDTH: u16 = 16;

/// The retention window must stay wider than a NACK scan and narrower than half the sequence space.
pub const MIN_MAX_LATE: u16 = NACK_SCAN_LIMIT + 1;
pub const MAX_MAX_LATE: u16 = 0x7fff;

/// Retention ring and loss detector for a single SSRC.
///
/// Sequence numbers are compared with `u16` wrapping subtraction: `a.wrapping_sub(b) < 0x8000` means `a` is
/// at or after `b`.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct StreamBuffer {
    ssrc: u32,
    payload_type: u8,
    #[derivative(Debug = "ignore")]
    ring: Box<[Option<Arc<rtp::packet::Packet>>]>,
    max_late: u16,
    last_push: Option<u16>,
    nack_cursor: u16,
    received: u64,
    lost: u64,
    bytes: u64,
    total_received: u64,
    total_lost: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamStats {
    pub ssrc: u32,
    pub payload_type: u8,
    pub last_sequence_number: Option<u16>,
    pub received: u64,
    pub lost: u64,
}

impl StreamBuffer {
    pub fn new(ssrc: u32, payload_type: u8, max_late: u16) -> Self {
        Self {
            ssrc,
            payload_type,
            ring: vec![None; RING_SIZE].into_boxed_slice(),
            max_late: max_late.clamp(MIN_MAX_LATE, MAX_MAX_LATE),
            last_push: None,
            nack_cursor: 0,
            received: 0,
            lost: 0,
            bytes: 0,
            total_received: 0,
            total_lost: 0,
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn payload_type(&self) -> u8 {
        self.payload_type
    }

    pub fn last_push(&self) -> Option<u16> {
        self.last_push
    }

    /// Stores the packet and returns a NACK pair when the scan this push triggered found losses.
    pub fn push(&mut self, packet: rtp::packet::Packet) -> Option<NackPair> {
        let seq = packet.header.sequence_number;

        match self.last_push {
            None => {
                self.last_push = Some(seq);
                self.nack_cursor = seq;
            }
            Some(last) => {
                let advance = seq.wrapping_sub(last);
                if advance != 0 && advance < 0x8000 {
                    self.clear_expired(last, seq);
                    self.last_push = Some(seq);
                } else if last.wrapping_sub(seq) >= self.max_late {
                    tracing::trace!(
                        "StreamBuffer ssrc={} dropped late packet seq={} last={}",
                        self.ssrc,
                        seq,
                        last
                    );
                    return None;
                }
            }
        }

        self.received += 1;
        self.total_received += 1;
        self.bytes += packet.marshal_size() as u64;

        self.ring[seq as usize] = Some(Arc::new(packet));
        self.scan_nack()
    }

    /// Returns the retained packet with this sequence number, if it is still inside the retention window.
    pub fn find_packet(&self, seq: u16) -> Option<Arc<rtp::packet::Packet>> {
        let last = self.last_push?;
        if last.wrapping_sub(seq) >= self.max_late {
            return None;
        }
        self.ring[seq as usize]
            .as_ref()
            .filter(|packet| packet.header.sequence_number == seq)
            .cloned()
    }

    /// Loss rate and bitrate (bits per second) since the previous call. Counters are reset afterwards.
    pub fn calc_lost_rate_and_byte_rate(&mut self, cycle_secs: u64) -> (f64, u64) {
        let total = self.lost + self.received;
        let lost_rate = if total == 0 {
            0.0
        } else {
            self.lost as f64 / total as f64
        };
        let byte_rate = if cycle_secs == 0 {
            0
        } else {
            self.bytes * 8 / cycle_secs
        };
        self.received = 0;
        self.lost = 0;
        self.bytes = 0;
        (lost_rate, byte_rate)
    }

    pub fn stats(&self) -> StreamStats {
        StreamStats {
            ssrc: self.ssrc,
            payload_type: self.payload_type,
            last_sequence_number: self.last_push,
            received: self.total_received,
            lost: self.total_lost,
        }
    }

    /// Empties the slots that fall out of the retention window when the newest sequence number moves from
    /// `old_last` to `new_last`.
    fn clear_expired(&mut self, old_last: u16, new_last: u16) {
        let advance = new_last.wrapping_sub(old_last);
        let (end, count) = if advance >= self.max_late {
            (old_last, self.max_late)
        } else {
            (new_last.wrapping_sub(self.max_late), advance)
        };
        for i in 0..count {
            self.ring[end.wrapping_sub(i) as usize] = None;
        }
    }

    fn scan_nack(&mut self) -> Option<NackPair> {
        let last = self.last_push?;
        let mut distance = last.wrapping_sub(self.nack_cursor);
        if distance < NACK_SCAN_TRIGGER {
            return None;
        }
        if distance > NACK_SCAN_LIMIT {
            // Only the most recent window is still worth reporting.
            self.nack_cursor = last.wrapping_sub(NACK_SCAN_TRIGGER);
            distance = NACK_SCAN_TRIGGER;
        }

        let begin = self.nack_cursor;
        let span = distance - NACK_CURSOR_STEP;
        let nack = self.find_losses(begin, span);
        self.nack_cursor = begin.wrapping_add(NACK_CURSOR_STEP);

        if let Some(pair) = &nack {
            // Windows overlap: the tail of this scan is scanned again by the next one, so only the
            // slots the cursor just moved past are counted.
            let lost = Self::count_settled_losses(pair, begin);
            self.lost += lost;
            self.total_lost += lost;
            tracing::debug!(
                "StreamBuffer ssrc={} lost packet_id={} bitmap={:#06x}",
                self.ssrc,
                pair.packet_id,
                pair.lost_packets
            );
        }
        nack
    }

    /// Builds one NACK pair from the first empty slot in `[begin, begin + span]` and the empty slots that follow it
    /// inside the same range.
    fn find_losses(&self, begin: u16, span: u16) -> Option<NackPair> {
        let first = (0..=span).find(|offset| self.is_missing(begin.wrapping_add(*offset)))?;
        let packet_id = begin.wrapping_add(first);

        let mut lost_packets = 0u16;
        for bit in 1..=NACK_BITMAP_WIDTH {
            if first + bit > span {
                break;
            }
            if self.is_missing(packet_id.wrapping_add(bit)) {
                lost_packets |= 1 << (bit - 1);
            }
        }
        Some(NackPair {
            packet_id,
            lost_packets,
        })
    }

    fn count_settled_losses(pair: &NackPair, begin: u16) -> u64 {
        let first = pair.packet_id.wrapping_sub(begin);
        if first >= NACK_CURSOR_STEP {
            return 0;
        }
        let following = (1..NACK_CURSOR_STEP - first)
            .filter(|bit| pair.lost_packets & (1 << (bit - 1)) != 0)
            .count() as u64;
        1 + following
    }

    fn is_missing(&self, seq: u16) -> bool {
        self.ring[seq as usize].is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(seq: u16) -> rtp::packet::Packet {
        let mut packet = rtp::packet::Packet::default();
        packet.header.version = 2;
        packet.header.ssrc = 1;
        packet.header.payload_type = 96;
        packet.header.sequence_number = seq;
        packet.header.timestamp = seq as u32 * 3000;
        packet.payload = bytes::Bytes::from(vec![0u8; 100]);
        packet
    }

    fn push_all(buffer: &mut StreamBuffer, seqs: impl IntoIterator<Item = u16>) -> Vec<NackPair> {
        seqs.into_iter()
            .filter_map(|seq| buffer.push(packet(seq)))
            .collect()
    }

    #[test]
    fn finds_every_packet_inside_window() {
        let mut buffer = StreamBuffer::new(1, 96, 100);
        push_all(&mut buffer, 0..300);
        for seq in 200..300 {
            let found = buffer.find_packet(seq).unwrap();
            assert_eq!(found.header.sequence_number, seq);
        }
    }

    #[test]
    fn evicted_packets_are_not_found() {
        let mut buffer = StreamBuffer::new(1, 96, 100);
        push_all(&mut buffer, 0..300);
        assert!(buffer.find_packet(199).is_none());
        assert!(buffer.find_packet(0).is_none());
        assert!(buffer.find_packet(300).is_none());
    }

    #[test]
    fn window_follows_sequence_wraparound() {
        let mut buffer = StreamBuffer::new(1, 96, 100);
        let seqs = (0..200u16).map(|i| 65_500u16.wrapping_add(i));
        push_all(&mut buffer, seqs);
        // last pushed is 65500 + 199 wrapped, i.e. 163
        assert_eq!(buffer.last_push(), Some(163));
        assert_eq!(buffer.find_packet(163).unwrap().header.sequence_number, 163);
        assert_eq!(buffer.find_packet(64).unwrap().header.sequence_number, 64);
        assert!(buffer.find_packet(63).is_none());
        assert!(buffer.find_packet(65_535).is_none());
        assert!(buffer.ring[65_535].is_none());
    }

    #[test]
    fn large_jump_clears_whole_window() {
        let mut buffer = StreamBuffer::new(1, 96, 100);
        push_all(&mut buffer, 0..50);
        push_all(&mut buffer, [5000]);
        assert!(buffer.ring.iter().take(50).all(|slot| slot.is_none()));
        assert!(buffer.find_packet(5000).is_some());
    }

    #[test]
    fn late_packet_inside_window_is_kept() {
        let mut buffer = StreamBuffer::new(1, 96, 100);
        push_all(&mut buffer, (0..10).filter(|seq| *seq != 4));
        push_all(&mut buffer, [4]);
        assert_eq!(buffer.last_push(), Some(9));
        assert!(buffer.find_packet(4).is_some());
    }

    #[test]
    fn single_loss_has_empty_bitmap() {
        let mut buffer = StreamBuffer::new(1, 96, 1000);
        let nacks = push_all(&mut buffer, (1..=17).filter(|seq| *seq != 3));
        assert_eq!(
            nacks,
            vec![NackPair {
                packet_id: 3,
                lost_packets: 0
            }]
        );
    }

    #[test]
    fn following_losses_are_marked_in_bitmap() {
        let mut buffer = StreamBuffer::new(1, 96, 1000);
        let nacks = push_all(&mut buffer, [1, 2, 18]);
        // scan covers 1..=10, so 3 is the base and 4..=10 are the following bits
        assert_eq!(
            nacks,
            vec![NackPair {
                packet_id: 3,
                lost_packets: 0x7f
            }]
        );
        // 9 and 10 are left to the next scan, only 3..=8 are counted so far
        let (lost_rate, _) = buffer.calc_lost_rate_and_byte_rate(1);
        assert_eq!(lost_rate, 6.0 / 9.0);
    }

    #[test]
    fn loss_on_window_edge_is_counted_once() {
        let mut buffer = StreamBuffer::new(1, 96, 1000);
        let nacks = push_all(&mut buffer, (1..=25).filter(|seq| *seq != 9));
        // 9 closes the first scan and opens the second one, so it is requested twice
        assert_eq!(nacks.len(), 2);
        assert!(nacks.iter().all(|pair| pair.packet_id == 9));
        assert_eq!(buffer.stats().lost, 1);
        let (lost_rate, _) = buffer.calc_lost_rate_and_byte_rate(1);
        assert_eq!(lost_rate, 1.0 / 25.0);
    }

    #[test]
    fn dropped_late_packet_is_not_counted() {
        let mut buffer = StreamBuffer::new(1, 96, 100);
        push_all(&mut buffer, 1000..1010);
        push_all(&mut buffer, [10]);
        assert!(buffer.find_packet(10).is_none());
        assert_eq!(buffer.stats().received, 10);
        let (_, bitrate) = buffer.calc_lost_rate_and_byte_rate(1);
        assert_eq!(bitrate, 10 * 112 * 8);
    }

    #[test]
    fn nack_scan_across_wraparound() {
        let mut buffer = StreamBuffer::new(1, 96, 1000);
        let seqs = (0..17u16)
            .map(|i| 65_530u16.wrapping_add(i))
            .filter(|seq| *seq != 0);
        let nacks = push_all(&mut buffer, seqs);
        assert_eq!(
            nacks,
            vec![NackPair {
                packet_id: 0,
                lost_packets: 0
            }]
        );
    }

    #[test]
    fn bitmap_never_exceeds_seventeen_packets() {
        let mut buffer = StreamBuffer::new(1, 96, 1000);
        push_all(&mut buffer, [100]);
        let nacks = push_all(&mut buffer, [200]);
        assert_eq!(nacks.len(), 1);
        assert_eq!(nacks[0].packet_id, 184);
        assert!(nacks[0].lost_packets.count_ones() <= 16);
    }

    #[test]
    fn counters_reset_after_each_cycle() {
        let mut buffer = StreamBuffer::new(1, 96, 1000);
        push_all(&mut buffer, 0..10);
        let (lost_rate, bitrate) = buffer.calc_lost_rate_and_byte_rate(2);
        assert_eq!(lost_rate, 0.0);
        assert_eq!(bitrate, 10 * 112 * 8 / 2);
        assert_eq!(buffer.calc_lost_rate_and_byte_rate(2), (0.0, 0));
        assert_eq!(buffer.stats().received, 10);
    }
}
