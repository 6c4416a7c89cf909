//! Per-group connection state machines: one socket per market group, one
//! per user group, each owning a single transport at a time.

pub mod market;
pub mod user;

pub use market::MarketGroupSocket;
pub use user::UserGroupSocket;

use std::time::Duration;

use rand::Rng;

/// Draw a fresh uniform keepalive period in `[min, max)`.
pub fn random_keepalive_period(min: Duration, max: Duration) -> Duration {
    let min_ms = min.as_millis() as u64;
    let max_ms = max.as_millis() as u64;
    if max_ms <= min_ms {
        return min;
    }
    let period_ms = rand::thread_rng().gen_range(min_ms..max_ms);
    Duration::from_millis(period_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keepalive_period_stays_in_window() {
        for _ in 0..200 {
            let period = random_keepalive_period(Duration::from_millis(15_000), Duration::from_millis(25_000));
            assert!(period >= Duration::from_millis(15_000));
            assert!(period < Duration::from_millis(25_000));
        }
    }
}
