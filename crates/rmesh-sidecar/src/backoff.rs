// SPDX-License-Identifier: MIT OR Apache-2.0
//! Restart backoff schedule for bridge reconnection.

use std::time::Duration;

/// Floor of the restart delay.
pub const RESTART_MIN: Duration = Duration::from_millis(500);
/// Ceiling of the restart delay.
pub const RESTART_MAX: Duration = Duration::from_secs(30);

/// Exponential restart backoff: 0.5 s doubling up to 30 s.
///
/// A `ready` event resets the schedule to the floor.
#[derive(Debug, Clone)]
pub struct RestartBackoff {
    current: Duration,
    floor: Duration,
    cap: Duration,
}

impl Default for RestartBackoff {
    fn default() -> Self {
        Self::new(RESTART_MIN, RESTART_MAX)
    }
}

impl RestartBackoff {
    /// Build a schedule with explicit bounds.
    pub fn new(floor: Duration, cap: Duration) -> Self {
        Self {
            current: floor,
            floor,
            cap,
        }
    }

    /// The delay to sleep before the next restart; doubles the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.cap);
        delay
    }

    /// Reset to the floor.
    pub fn reset(&mut self) {
        self.current = self.floor;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_capped() {
        let mut b = RestartBackoff::default();
        assert_eq!(b.next_delay(), Duration::from_millis(500));
        assert_eq!(b.next_delay(), Duration::from_secs(1));
        assert_eq!(b.next_delay(), Duration::from_secs(2));
        for _ in 0..10 {
            b.next_delay();
        }
        assert_eq!(b.next_delay(), RESTART_MAX);
    }

    #[test]
    fn reset_returns_to_floor() {
        let mut b = RestartBackoff::default();
        b.next_delay();
        b.next_delay();
        b.reset();
        assert_eq!(b.next_delay(), RESTART_MIN);
    }
}
