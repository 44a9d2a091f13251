//! Capped exponential backoff shared by in-process retry and dead-letter replay.

use std::time::Duration;

/// `min(base * 2^exponent, cap)`, saturating instead of overflowing.
pub fn capped_exponential(base: Duration, cap: Duration, exponent: u32) -> Duration {
    let factor = 2u32.checked_pow(exponent).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(Duration::MAX).min(cap)
}
