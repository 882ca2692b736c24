//! Runtime-agnostic utility functions
//!
//! Keeps the cfg-flag selection of the timer in one place.

use std::time::Duration;

/// Sleep for the specified duration using the selected runtime
///
/// A zero duration returns immediately without touching the timer, which
/// keeps polling loops configured with zero delays fast in tests.
pub async fn sleep(duration: Duration) {
    if duration.is_zero() {
        return;
    }

    #[cfg(feature = "smol")]
    {
        smol::Timer::after(duration).await;
    }

    #[cfg(not(feature = "smol"))]
    {
        compile_error!("The `smol` runtime feature must be enabled to use sleep");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(feature = "smol")]
    #[test]
    fn test_sleep() {
        smol::block_on(async {
            let start = std::time::Instant::now();
            sleep(Duration::from_millis(100)).await;
            let elapsed = start.elapsed();
            assert!(elapsed >= Duration::from_millis(100));
        });
    }

    #[cfg(feature = "smol")]
    #[test]
    fn test_zero_sleep_returns_immediately() {
        smol::block_on(async {
            let start = std::time::Instant::now();
            sleep(Duration::ZERO).await;
            assert!(start.elapsed() < Duration::from_millis(50));
        });
    }
}
