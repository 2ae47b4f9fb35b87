/// Loss rate below which the stream is considered healthy and allowed to double.
pub const LOW_LOSS_RATE: f64 = 0.1;

/// Converts the loss rate and bitrate measured over the last cycle into a bandwidth suggestion in bits per second.
///
/// The result always lies in `[floor, ceiling]` when `floor <= ceiling`.
pub fn estimate_bandwidth(lost_rate: f64, bitrate: u64, floor: u64, ceiling: u64) -> u64 {
    let estimate = if lost_rate == 0.0 && bitrate == 0 {
        ceiling
    } else if lost_rate < LOW_LOSS_RATE {
        bitrate.saturating_mul(2)
    } else {
        // NaN and negative values saturate to 0 and end up on the floor.
        (bitrate as f64 * (1.0 - lost_rate)) as u64
    };
    estimate.max(floor).min(ceiling)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FLOOR: u64 = 240_000;
    const CEILING: u64 = 4_000_000;

    #[test]
    fn idle_stream_gets_ceiling() {
        assert_eq!(estimate_bandwidth(0.0, 0, FLOOR, CEILING), CEILING);
    }

    #[test]
    fn low_loss_doubles() {
        assert_eq!(estimate_bandwidth(0.05, 1_000_000, FLOOR, CEILING), 2_000_000);
        assert_eq!(estimate_bandwidth(0.0, 500_000, FLOOR, CEILING), 1_000_000);
    }

    #[test]
    fn high_loss_scales_down() {
        assert_eq!(estimate_bandwidth(0.5, 1_000_000, FLOOR, CEILING), 500_000);
        assert_eq!(estimate_bandwidth(0.25, 2_000_000, FLOOR, CEILING), 1_500_000);
    }

    #[test]
    fn result_is_always_clamped() {
        let rates = [0.0, 0.01, 0.099, 0.1, 0.5, 0.99, 1.0, 1.5, -0.2, f64::NAN];
        let bitrates = [0, 1, 100_000, 240_000, 3_000_000, 10_000_000, u64::MAX];
        for rate in rates {
            for bitrate in bitrates {
                let estimate = estimate_bandwidth(rate, bitrate, FLOOR, CEILING);
                assert!(
                    (FLOOR..=CEILING).contains(&estimate),
                    "rate={} bitrate={} estimate={}",
                    rate,
                    bitrate,
                    estimate
                );
            }
        }
    }
}
