use std::time::Duration;
use tokio::time::Instant;

/// Lets an action through at most once per window
///
/// The first call always passes.
#[derive(Debug)]
pub struct RateLimiter {
    window: Duration,
    last: Option<Instant>,
}

impl RateLimiter {
    /// Create a limiter with the given window
    #[must_use]
    pub const fn new(window: Duration) -> Self {
        Self { window, last: None }
    }

    /// Claim the window if it has elapsed since the last success
    pub fn try_acquire(&mut self) -> bool {
        let now = Instant::now();
        match self.last {
            Some(last) if now.duration_since(last) < self.window => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }

    /// Run `action` if the window allows it, returning whether it ran
    pub fn maybe_perform<F: FnOnce()>(&mut self, action: F) -> bool {
        if self.try_acquire() {
            action();
            true
        } else {
            false
        }
    }

    /// Window length
    #[must_use]
    pub const fn window(&self) -> Duration {
        self.window
    }
}
