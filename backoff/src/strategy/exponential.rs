use std::time::Duration;

use rand::Rng;

/// Exponential backoff with a cap and bounded jitter.
///
/// The un-jittered delay before retry `n` (counting from 0) is
/// `min(initial * factor^n, cap)`, see [`Exponential::delay_for`]. Jitter multiplies that by a
/// uniform sample from `[1 - jitter, 1 + jitter]`, and the result is clamped into
/// `[previous delay, cap]`, so consecutive delays never shrink.
///
/// # Example
/// ```
/// use backoff::strategy::exponential::Exponential;
/// use std::time::Duration;
///
/// let mut backoff = Exponential::new(
///     Duration::from_millis(100), // initial
///     Duration::from_secs(5),     // cap
///     2.0,                        // factor
///     0.0,                        // jitter
///     Some(3),                    // max retries
/// );
///
/// assert_eq!(backoff.next(), Some(Duration::from_millis(100)));
/// assert_eq!(backoff.next(), Some(Duration::from_millis(200)));
/// assert_eq!(backoff.next(), Some(Duration::from_millis(400)));
/// assert_eq!(backoff.next(), None);
/// ```
#[derive(Debug, Clone)]
pub struct Exponential {
    initial: Duration,
    cap: Duration,
    /// Growth per retry, never below 1.0.
    factor: f64,
    /// Between 0.0 and 1.0.
    jitter: f64,
    /// `None` retries forever.
    max_attempts: Option<u16>,
    current_attempt: u16,
    previous: Duration,
}

impl Exponential {
    /// Creates a new Exponential backoff strategy. A `factor` below 1.0 is raised to 1.0 and
    /// `jitter` is clamped into `[0.0, 1.0]`, so the delays can never shrink.
    pub fn new(
        initial: Duration,
        cap: Duration,
        factor: f64,
        jitter: f64,
        max_attempts: Option<u16>,
    ) -> Self {
        Self {
            initial: initial.min(cap),
            cap,
            factor: factor.max(1.0),
            jitter: jitter.clamp(0.0, 1.0),
            max_attempts,
            current_attempt: 0,
            previous: Duration::ZERO,
        }
    }

    pub fn from_millis(
        initial_ms: u64,
        cap_ms: u64,
        factor: f64,
        jitter: f64,
        max_attempts: Option<u16>,
    ) -> Self {
        Self::new(
            Duration::from_millis(initial_ms),
            Duration::from_millis(cap_ms),
            factor,
            jitter,
            max_attempts,
        )
    }

    /// The un-jittered delay before retry `attempt` (0-based), capped.
    pub fn delay_for(&self, attempt: u16) -> Duration {
        let initial_ms = self.initial.as_millis() as f64;
        let cap_ms = self.cap.as_millis() as f64;
        let delay_ms = initial_ms * self.factor.powi(i32::from(attempt));

        if !delay_ms.is_finite() || delay_ms >= cap_ms {
            return self.cap;
        }
        Duration::from_millis(delay_ms as u64)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter == 0.0 {
            return delay;
        }
        let sample: f64 = rand::rng().random_range(1.0 - self.jitter..=1.0 + self.jitter);
        let jittered_ms = (delay.as_millis() as f64 * sample).min(self.cap.as_millis() as f64);
        Duration::from_millis(jittered_ms as u64)
    }
}

impl Iterator for Exponential {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(max_attempts) = self.max_attempts
            && self.current_attempt >= max_attempts
        {
            return None;
        }

        let delay = self
            .jittered(self.delay_for(self.current_attempt))
            .clamp(self.previous, self.cap);

        self.current_attempt = self.current_attempt.saturating_add(1);
        self.previous = delay;
        Some(delay)
    }
}
