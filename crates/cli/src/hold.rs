//! Debug hold: keep the process alive for a while so it can be inspected.

use std::time::Duration;

use tracing::info;

/// Sleeps for `minutes`, logging a countdown: every 30s while 5 minutes or more remain,
/// every 10s above one minute, then every second.
pub async fn hold(minutes: u64) {
    let mut left = minutes.saturating_mul(60);
    info!("Debug will run for {}m {}s.", left / 60, left % 60);
    while left > 0 {
        let step = if left >= 300 {
            30
        } else if left > 60 {
            10
        } else {
            1
        };
        if left > 60 {
            info!("Exiting in {}m {}s", left / 60, left % 60);
        } else {
            info!("Exiting in {left}s");
        }
        let step = step.min(left);
        tokio::time::sleep(Duration::from_secs(step)).await;
        left -= step;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn holds_for_the_requested_minutes() {
        let t0 = Instant::now();
        hold(6).await;
        let waited = t0.elapsed();
        assert!(waited >= Duration::from_secs(360) && waited < Duration::from_secs(361), "{waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn huge_hold_keeps_counting_down() {
        let res = tokio::time::timeout(Duration::from_secs(3600), hold(u64::MAX)).await;
        assert!(res.is_err(), "hold of u64::MAX minutes must still be running after an hour");
    }

    #[tokio::test(start_paused = true)]
    async fn zero_returns_immediately() {
        let t0 = Instant::now();
        hold(0).await;
        assert!(t0.elapsed() < Duration::from_secs(1));
    }
}
