//! Randomization of retry delays so a herd of failing role tasks does not
//! stampede a recovering provider in lockstep.

use rand::Rng;
use std::time::Duration;

/// How a scheduled delay gets randomized before the retry engine waits it
/// out.
#[derive(Debug, Clone)]
pub enum Jitter {
    /// Use the scheduled delay exactly (deterministic tests).
    None,
    /// Replace the delay with a uniform draw from `[0, delay]`.
    Full,
    /// Replace the delay with a uniform draw from `[delay/2, delay]`.
    Equal,
    /// Stretch the delay by a uniform draw from `[0, cap]`. This is the
    /// engine default: the schedule stays a lower bound.
    Additive { cap: Duration },
}

impl Jitter {
    pub fn full() -> Self {
        Jitter::Full
    }

    pub fn equal() -> Self {
        Jitter::Equal
    }

    pub fn additive(cap: Duration) -> Self {
        Jitter::Additive { cap }
    }

    /// Randomize one delay.
    pub fn apply(&self, delay: Duration) -> Duration {
        self.apply_with_rng(delay, &mut rand::rng())
    }

    /// Randomize one delay with a caller-supplied RNG (deterministic in
    /// tests).
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        match self {
            Jitter::None => delay,
            Jitter::Full => {
                let millis = delay.as_millis() as u64;
                if millis == 0 {
                    return Duration::from_millis(0);
                }
                Duration::from_millis(rng.random_range(0..=millis))
            }
            Jitter::Equal => {
                let millis = delay.as_millis() as u64;
                if millis == 0 {
                    return Duration::from_millis(0);
                }
                let half = millis / 2;
                Duration::from_millis(rng.random_range(half..=millis))
            }
            Jitter::Additive { cap } => {
                let cap_millis = cap.as_millis() as u64;
                if cap_millis == 0 {
                    return delay;
                }
                delay + Duration::from_millis(rng.random_range(0..=cap_millis))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn none_jitter_returns_exact_delay() {
        let delay = Duration::from_secs(1);
        assert_eq!(Jitter::None.apply(delay), delay);
    }

    #[test]
    fn full_jitter_is_between_zero_and_delay() {
        let jitter = Jitter::full();
        let delay = Duration::from_secs(1);
        for _ in 0..100 {
            let jittered = jitter.apply(delay);
            assert!(jittered <= delay);
        }
    }

    #[test]
    fn equal_jitter_is_between_half_and_delay() {
        let jitter = Jitter::equal();
        let delay = Duration::from_secs(1);
        for _ in 0..100 {
            let jittered = jitter.apply(delay);
            assert!(jittered >= Duration::from_millis(500));
            assert!(jittered <= delay);
        }
    }

    #[test]
    fn additive_jitter_never_shrinks_the_delay() {
        let jitter = Jitter::additive(Duration::from_millis(200));
        let delay = Duration::from_millis(1000);
        for _ in 0..100 {
            let jittered = jitter.apply(delay);
            assert!(jittered >= delay);
            assert!(jittered <= Duration::from_millis(1200));
        }
    }

    #[test]
    fn additive_jitter_with_zero_cap_is_identity() {
        let jitter = Jitter::additive(Duration::ZERO);
        let delay = Duration::from_millis(750);
        assert_eq!(jitter.apply(delay), delay);
    }

    #[test]
    fn deterministic_rng_gives_reproducible_jitter() {
        let jitter = Jitter::full();
        let delay = Duration::from_millis(1000);
        let a = jitter.apply_with_rng(delay, &mut StdRng::seed_from_u64(7));
        let b = jitter.apply_with_rng(delay, &mut StdRng::seed_from_u64(7));
        assert_eq!(a, b);
    }

    #[test]
    fn jitter_handles_zero_delay() {
        assert_eq!(Jitter::full().apply(Duration::ZERO), Duration::ZERO);
        assert_eq!(Jitter::equal().apply(Duration::ZERO), Duration::ZERO);
    }
}
