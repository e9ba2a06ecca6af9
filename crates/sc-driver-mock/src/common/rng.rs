//! Shared random source for the simulated robot.
//!
//! Failure injection and barcode generation draw from one ChaCha stream, so
//! a seeded mock replays the same faults and the same labels run after run.

use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Thread-safe ChaCha8 stream, seeded or from OS entropy.
pub struct MockRng {
    seed: Option<u64>,
    stream: Mutex<ChaCha8Rng>,
}

impl MockRng {
    /// Stream from `seed`, or from OS entropy when `None`.
    pub fn new(seed: Option<u64>) -> Self {
        let stream = seed.map_or_else(ChaCha8Rng::from_entropy, ChaCha8Rng::seed_from_u64);
        Self {
            seed,
            stream: Mutex::new(stream),
        }
    }

    /// Seed the stream was created with.
    pub fn seed(&self) -> Option<u64> {
        self.seed
    }

    /// Bernoulli draw: `true` with probability `p`. Values outside `[0, 1]`
    /// saturate without consuming the stream.
    pub fn chance(&self, p: f64) -> bool {
        match p {
            p if p <= 0.0 => false,
            p if p >= 1.0 => true,
            p => self.stream.lock().gen_bool(p),
        }
    }

    /// Pin label in the `SC` + six digits format printed on simulated pucks.
    pub fn barcode(&self) -> String {
        let serial: u32 = self.stream.lock().gen_range(0..1_000_000);
        format!("SC{:06}", serial)
    }
}

impl Default for MockRng {
    fn default() -> Self {
        Self::new(None)
    }
}

impl std::fmt::Debug for MockRng {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockRng").field("seed", &self.seed).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_seed_same_barcodes() {
        let a = MockRng::new(Some(42));
        let b = MockRng::new(Some(42));
        let labels_a: Vec<String> = (0..5).map(|_| a.barcode()).collect();
        let labels_b: Vec<String> = (0..5).map(|_| b.barcode()).collect();
        assert_eq!(labels_a, labels_b);
        assert_eq!(a.seed(), Some(42));
    }

    #[test]
    fn test_barcode_format() {
        let label = MockRng::default().barcode();
        assert_eq!(label.len(), 8);
        assert!(label.starts_with("SC"));
        assert!(label[2..].chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn test_chance_saturates() {
        let rng = MockRng::new(Some(7));
        assert!((0..100).all(|_| !rng.chance(0.0)));
        assert!((0..100).all(|_| !rng.chance(-1.0)));
        assert!((0..100).all(|_| rng.chance(1.0)));
    }

    #[test]
    fn test_chance_rate() {
        let rng = MockRng::new(Some(42));
        let hits = (0..10_000).filter(|_| rng.chance(0.3)).count();
        assert!((2_700..3_300).contains(&hits), "got {}", hits);
    }
}
