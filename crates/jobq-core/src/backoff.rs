use rand::Rng;

/// First-retry delay.
pub const BASE_MS: u64 = 10_000;
/// Ceiling on the exponential component.
pub const CAP_MS: u64 = 15 * 60 * 1000;
/// Uniform jitter added on top, exclusive upper bound.
pub const JITTER_MS: u64 = 1000;

/// Delay before a failed job becomes claimable again:
/// `min(CAP_MS, BASE_MS * 2^(attempt - 1)) + U[0, JITTER_MS)`.
///
/// `attempt` is 1-based: the attempt count already bumped by the claim.
pub fn backoff_ms(attempt: i32) -> u64 {
    exponential_ms(attempt) + rand::thread_rng().gen_range(0..JITTER_MS)
}

fn exponential_ms(attempt: i32) -> u64 {
    // The shift saturates well past CAP_MS; clamp the exponent so it
    // cannot overflow for absurd attempt values.
    let exp = attempt.saturating_sub(1).clamp(0, 20) as u32;
    BASE_MS.saturating_mul(1u64 << exp).min(CAP_MS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_attempt_starts_at_base() {
        assert_eq!(exponential_ms(1), BASE_MS);
    }

    #[test]
    fn doubles_per_attempt_until_cap() {
        assert_eq!(exponential_ms(2), 20_000);
        assert_eq!(exponential_ms(3), 40_000);
        assert_eq!(exponential_ms(4), 80_000);
        assert_eq!(exponential_ms(7), 640_000);
        assert_eq!(exponential_ms(8), CAP_MS);
        assert_eq!(exponential_ms(50), CAP_MS);
    }

    #[test]
    fn jitter_stays_within_window() {
        for attempt in 1..=12 {
            for _ in 0..100 {
                let ms = backoff_ms(attempt);
                let base = exponential_ms(attempt);
                assert!(ms >= base);
                assert!(ms < base + JITTER_MS);
            }
        }
    }

    #[test]
    fn degenerate_attempts_do_not_panic() {
        assert_eq!(exponential_ms(0), BASE_MS);
        assert_eq!(exponential_ms(-5), BASE_MS);
        assert_eq!(exponential_ms(i32::MAX), CAP_MS);
    }
}
