use rand::{Rng, rng};

/// A trait for sources of probe candidates.
///
/// Probe-based pools draw one candidate per attempt. Candidates of different
/// attempts (and of different callers) must be independent, otherwise
/// concurrent callers keep colliding on the same values.
///
/// Plugging in a fixed sequence makes retry and collision behavior
/// deterministic in tests.
///
/// # Example
/// ```
/// use quartermaster::CandidateSource;
///
/// struct Lowest;
/// impl CandidateSource for Lowest {
///     fn candidate(&self, low: i64, _high: i64) -> i64 {
///         low
///     }
/// }
///
/// assert_eq!(Lowest.candidate(3, 9), 3);
/// ```
pub trait CandidateSource: Send + Sync {
    /// Returns a value in `low..=high`.
    fn candidate(&self, low: i64, high: i64) -> i64;
}

/// A `CandidateSource` drawing uniformly from the thread-local RNG
/// (`rand::rng()`).
///
/// Each OS thread has its own generator, so callers on different threads do
/// not contend. The type stores nothing and may be shared freely.
#[derive(Default, Clone, Copy, Debug)]
pub struct ThreadRandom;

impl CandidateSource for ThreadRandom {
    fn candidate(&self, low: i64, high: i64) -> i64 {
        rng().random_range(low..=high)
    }
}
