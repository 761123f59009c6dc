// Copyright (c) Tetherline.
// Licensed under the MIT License.

//! Reconnect backoff scheduling.

use std::time::Duration;

use tokio::time::Instant;

/// Default shortest delay between reconnect attempts.
pub(super) const DEFAULT_MIN_RECONNECT: Duration = Duration::from_secs(1);
/// Default longest delay between reconnect attempts.
pub(super) const DEFAULT_MAX_RECONNECT: Duration = Duration::from_secs(128);

/// How long a connection must stay up beyond its scheduled next attempt
/// before the backoff resets. Guards against resetting while flapping.
const STABILITY_GRACE: Duration = Duration::from_secs(10);

/// Clamped-doubling backoff between reconnect attempts.
pub(super) struct ReconnectBackoff {
    min: Duration,
    max: Duration,
    current: Duration,
    reset_eligible_at: Option<Instant>,
}

impl ReconnectBackoff {
    pub(super) fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max,
            current: min,
            reset_eligible_at: None,
        }
    }

    /// Adopt new bounds, keeping the current delay inside them.
    pub(super) fn set_bounds(&mut self, min: Duration, max: Duration) {
        self.min = min;
        self.max = max;
        self.current = self.current.clamp(min, max);
    }

    /// Delay to wait before the next attempt. Doubles for the attempt after,
    /// saturating at the max.
    pub(super) fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    /// Record a successful connect. The backoff becomes eligible for reset
    /// once the connection has stayed up for the grace period beyond the
    /// delay that would be used next.
    pub(super) fn on_connected(&mut self, now: Instant) {
        self.reset_eligible_at = Some(now + self.current + STABILITY_GRACE);
    }

    /// Record the channel going away; resets the delay to the minimum only
    /// if the connection proved stable.
    pub(super) fn on_channel_loss(&mut self, now: Instant) {
        if let Some(eligible_at) = self.reset_eligible_at.take() {
            if now >= eligible_at {
                self.current = self.min;
            }
        }
    }
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_RECONNECT, DEFAULT_MAX_RECONNECT)
    }
}
