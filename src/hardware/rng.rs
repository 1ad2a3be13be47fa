//! Seeded RNG wrapper for simulated captures.
//!
//! A fixed seed makes simulated images reproducible in tests; without one
//! the generator is seeded from the OS.

use parking_lot::Mutex;
use rand::distributions::{Distribution, Standard};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Thread-safe seeded random number generator.
pub struct SimRng {
    inner: Mutex<ChaCha8Rng>,
    seed: Option<u64>,
}

impl SimRng {
    /// Create a new RNG with an optional seed.
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => ChaCha8Rng::seed_from_u64(s),
            None => ChaCha8Rng::from_entropy(),
        };
        Self {
            inner: Mutex::new(rng),
            seed,
        }
    }

    /// Draw `len` values covering the full range of `T`.
    ///
    /// For integer types this is uniform over every representable value;
    /// for floats it is uniform over `[0, 1)`.
    pub fn fill<T>(&self, len: usize) -> Vec<T>
    where
        Standard: Distribution<T>,
    {
        let mut rng = self.inner.lock();
        (0..len).map(|_| rng.r#gen::<T>()).collect()
    }
}

impl Default for SimRng {
    fn default() -> Self {
        Self::new(None)
    }
}

impl std::fmt::Debug for SimRng {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimRng")
            .field("seed", &self.seed)
            .field("inner", &"<Mutex<ChaCha8Rng>>")
            .finish()
    }
}
