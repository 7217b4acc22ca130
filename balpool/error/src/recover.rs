use super::Error;
use futures::Stream;

/// An error recovery strategy.
pub trait Recover<E = Error> {
    type Backoff: Stream<Item = ()>;

    /// Given an E-typed error, determine if the error is recoverable.
    ///
    /// If it is, a backoff stream is returned. Each item yielded by the
    /// backoff signals that the caller may retry its operation; pulling the
    /// next item after a failed retry waits for a (possibly longer) delay.
    ///
    /// If the error is not recoverable, it is returned immediately.
    fn recover(&self, err: E) -> Result<Self::Backoff, E>;
}
