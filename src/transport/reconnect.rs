use std::time::Duration;

use rand::Rng;

/// How long the transport waits before each automatic reconnection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReconnectionPolicy {
    /// A random base of 5 to 15 seconds, multiplied by 6 after 7 failed
    /// attempts and by 30 after 13.
    #[default]
    RandomIncreasingDelay,
    FixedDelay(Duration),
}

impl ReconnectionPolicy {
    /// Delay before attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self {
            ReconnectionPolicy::FixedDelay(delay) => *delay,
            ReconnectionPolicy::RandomIncreasingDelay => {
                let base: u64 = rand::thread_rng().gen_range(5..=15);
                let secs = if attempt > 13 {
                    base * 30
                } else if attempt > 7 {
                    base * 6
                } else {
                    base
                };
                Duration::from_secs(secs)
            }
        }
    }
}
