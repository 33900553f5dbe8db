//! Reconnect delay policy.
//!
//! Pure exponential backoff with a hard ceiling: attempt `n` (1-based)
//! waits `min(30s, 1s * 2^n)` before re-opening the connection.

use std::time::Duration;

/// Base delay unit in milliseconds.
pub const BASE_DELAY_MS: u64 = 1_000;

/// Ceiling on any single reconnect delay, in milliseconds.
pub const MAX_DELAY_MS: u64 = 30_000;

/// Computes the delay before reconnect attempt `attempt`.
///
/// Monotonically non-decreasing in `attempt`, saturates at
/// [`MAX_DELAY_MS`] instead of overflowing.
#[must_use]
pub fn reconnect_delay(attempt: u32) -> Duration {
    // 2^attempt saturates well past the ceiling; clamp the exponent so the
    // multiplication can never wrap even for absurd attempt counts.
    let factor = 2u64.saturating_pow(attempt.min(16));
    Duration::from_millis(BASE_DELAY_MS.saturating_mul(factor).min(MAX_DELAY_MS))
}
