#![deny(rust_2018_idioms, clippy::disallowed_methods, clippy::disallowed_types)]
#![forbid(unsafe_code)]

use balpool_error::Recover;
use futures::Stream;
use rand::{rngs::SmallRng, Rng, SeedableRng};
use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};
use thiserror::Error;
use tokio::time;

/// A jittered exponential backoff strategy.
#[derive(Copy, Clone, Debug, Default)]
pub struct ExponentialBackoff {
    /// The minimum amount of time to wait before resuming an operation.
    min: Duration,

    /// The maximum amount of time to wait before resuming an operation.
    max: Duration,

    /// The ratio of the base timeout that may be randomly added to a backoff.
    ///
    /// Must be greater than or equal to 0.0.
    jitter: f64,
}

/// A jittered exponential backoff stream.
#[derive(Debug)]
pub struct ExponentialBackoffStream {
    backoff: ExponentialBackoff,
    rng: SmallRng,
    iterations: u32,
    sleep: Option<Pin<Box<time::Sleep>>>,
}

#[derive(Clone, Debug, Error)]
#[error("invalid backoff: {0}")]
pub struct InvalidBackoff(&'static str);

impl ExponentialBackoff {
    pub const fn new_unchecked(min: Duration, max: Duration, jitter: f64) -> Self {
        Self { min, max, jitter }
    }

    pub fn try_new(min: Duration, max: Duration, jitter: f64) -> Result<Self, InvalidBackoff> {
        if min > max {
            return Err(InvalidBackoff("maximum must not be less than minimum"));
        }
        if max == Duration::from_millis(0) {
            return Err(InvalidBackoff("maximum must be non-zero"));
        }
        if jitter < 0.0 {
            return Err(InvalidBackoff("jitter must not be negative"));
        }
        if jitter > 100.0 {
            return Err(InvalidBackoff("jitter must not be greater than 100"));
        }
        if !jitter.is_finite() {
            return Err(InvalidBackoff("jitter must be finite"));
        }
        Ok(Self { min, max, jitter })
    }

    pub fn min(&self) -> Duration {
        self.min
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    pub fn stream(&self) -> ExponentialBackoffStream {
        ExponentialBackoffStream {
            backoff: *self,
            rng: SmallRng::from_rng(&mut rand::rng()),
            iterations: 0,
            sleep: None,
        }
    }

    fn base(&self, iterations: u32) -> Duration {
        debug_assert!(
            self.min <= self.max,
            "maximum backoff must not be less than minimum backoff"
        );
        debug_assert!(
            self.max > Duration::from_millis(0),
            "Maximum backoff must be non-zero"
        );
        self.min
            .checked_mul(2_u32.saturating_pow(iterations))
            .unwrap_or(self.max)
            .min(self.max)
    }

    /// Returns a random, uniform duration on `[0, base*self.jitter]` no greater
    /// than `self.max`.
    fn jitter<R: Rng>(&self, base: Duration, rng: &mut R) -> Duration {
        if self.jitter == 0.0 {
            Duration::default()
        } else {
            let jitter_factor = rng.random::<f64>();
            let rand_jitter = jitter_factor * self.jitter;
            let secs = (base.as_secs() as f64) * rand_jitter;
            let nanos = (base.subsec_nanos() as f64) * rand_jitter;
            let remaining = self.max.saturating_sub(base);
            Duration::new(secs as u64, nanos as u32).min(remaining)
        }
    }
}

impl<E> Recover<E> for ExponentialBackoff {
    type Backoff = ExponentialBackoffStream;

    fn recover(&self, _: E) -> Result<Self::Backoff, E> {
        Ok(self.stream())
    }
}

impl Stream for ExponentialBackoffStream {
    type Item = ();

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        loop {
            // If there's an active delay, wait until it's done and then
            // update the state.
            if let Some(sleep) = this.sleep.as_mut() {
                futures::ready!(sleep.as_mut().poll(cx));

                this.sleep = None;
                this.iterations = this.iterations.saturating_add(1);
                return Poll::Ready(Some(()));
            }

            let backoff = {
                let base = this.backoff.base(this.iterations);
                base + this.backoff.jitter(base, &mut this.rng)
            };
            this.sleep = Some(Box::pin(time::sleep(backoff)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use quickcheck::*;

    quickcheck! {
        fn backoff_base_first(min_ms: u64, max_ms: u64) -> TestResult {
            let min = Duration::from_millis(min_ms);
            let max = Duration::from_millis(max_ms);
            let backoff = match ExponentialBackoff::try_new(min, max, 0.0) {
                Err(_) => return TestResult::discard(),
                Ok(backoff) => backoff,
            };
            let delay = backoff.base(0);
            TestResult::from_bool(min == delay)
        }

        fn backoff_base(min_ms: u64, max_ms: u64, iterations: u32) -> TestResult {
            let min = Duration::from_millis(min_ms);
            let max = Duration::from_millis(max_ms);
            let backoff = match ExponentialBackoff::try_new(min, max, 0.0) {
                Err(_) => return TestResult::discard(),
                Ok(backoff) => backoff,
            };
            let delay = backoff.base(iterations);
            TestResult::from_bool(min <= delay && delay <= max)
        }

        fn backoff_jitter(base_ms: u64, max_ms: u64, jitter: f64) -> TestResult {
            let base = Duration::from_millis(base_ms);
            let max = Duration::from_millis(max_ms);
            let backoff = match ExponentialBackoff::try_new(base, max, jitter) {
                Err(_) => return TestResult::discard(),
                Ok(backoff) => backoff,
            };

            let j = backoff.jitter(base, &mut rand::rng());
            TestResult::from_bool(j <= max.saturating_sub(base))
        }
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn recovers_every_error() {
        let backoff =
            ExponentialBackoff::try_new(Duration::from_millis(50), Duration::from_secs(1), 0.0)
                .unwrap();
        let mut stream =
            Recover::<&str>::recover(&backoff, "connection reset").expect("always recovers");

        let start = time::Instant::now();
        stream.next().await.expect("backoff never ends");
        assert_eq!(start.elapsed(), Duration::from_millis(50));
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn stream_waits_between_items() {
        let backoff = ExponentialBackoff::try_new(
            Duration::from_millis(100),
            Duration::from_secs(1),
            0.0,
        )
        .unwrap();
        let mut stream = backoff.stream();

        let start = time::Instant::now();
        stream.next().await.expect("backoff never ends");
        assert_eq!(start.elapsed(), Duration::from_millis(100));

        stream.next().await.expect("backoff never ends");
        assert_eq!(start.elapsed(), Duration::from_millis(300));
    }
}
