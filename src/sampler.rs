//! Token Sampling
//!
//! Generation draws the next token from the model's output distribution.
//! The random source is a xorshift64* generator: tiny, seedable, and
//! identical on every platform, so a fixed seed reproduces a sample exactly.
//!
//! ## Inverse-CDF Sampling
//!
//! ```text
//! coin ~ U[0, 1)
//! return the first i with Σ_{j<=i} probs[j] > coin
//! ```
//!
//! Callers pass only the true-vocabulary slice of a probability row, so the
//! padded tail can never be drawn.

/// Seed used by the training loop's sampler
pub const DEFAULT_SEED: u64 = 1337;

/// xorshift64* pseudo-random generator
#[derive(Clone, Debug)]
pub struct Xorshift {
    state: u64,
}

impl Xorshift {
    /// A zero state would be a fixed point, so it is replaced by the default
    pub fn new(seed: u64) -> Self {
        Self {
            state: if seed == 0 { DEFAULT_SEED } else { seed },
        }
    }

    pub fn next_u32(&mut self) -> u32 {
        self.state ^= self.state >> 12;
        self.state ^= self.state << 25;
        self.state ^= self.state >> 27;
        (self.state.wrapping_mul(0x2545_F491_4F6C_DD1D) >> 32) as u32
    }

    /// Uniform float in [0, 1)
    pub fn next_f32(&mut self) -> f32 {
        (self.next_u32() >> 8) as f32 / 16_777_216.0
    }
}

impl Default for Xorshift {
    fn default() -> Self {
        Self::new(DEFAULT_SEED)
    }
}

/// Index drawn from `probs` (which should sum to 1) using `coin` in [0, 1)
///
/// Falls back to the last index when rounding leaves the cumulative sum
/// just short of `coin`.
pub fn sample_mult(probs: &[f32], coin: f32) -> usize {
    let mut cdf = 0.0f32;
    for (i, &p) in probs.iter().enumerate() {
        cdf += p;
        if coin < cdf {
            return i;
        }
    }
    probs.len().saturating_sub(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_seed_same_stream() {
        let mut a = Xorshift::new(42);
        let mut b = Xorshift::new(42);
        let xs: Vec<u32> = (0..16).map(|_| a.next_u32()).collect();
        let ys: Vec<u32> = (0..16).map(|_| b.next_u32()).collect();
        assert_eq!(xs, ys);
        assert_ne!(xs[0], xs[1]);
    }

    #[test]
    fn test_floats_in_unit_interval() {
        let mut rng = Xorshift::default();
        for _ in 0..10_000 {
            let x = rng.next_f32();
            assert!((0.0..1.0).contains(&x));
        }
    }

    #[test]
    fn test_sample_mult_picks_by_cdf() {
        let probs = [0.1, 0.2, 0.7];
        assert_eq!(sample_mult(&probs, 0.05), 0);
        assert_eq!(sample_mult(&probs, 0.25), 1);
        assert_eq!(sample_mult(&probs, 0.31), 2);
        assert_eq!(sample_mult(&probs, 0.99), 2);
    }

    #[test]
    fn test_sample_mult_rounding_fallback() {
        let probs = [0.3, 0.3, 0.3];
        assert_eq!(sample_mult(&probs, 0.95), 2);
    }

    #[test]
    fn test_sample_mult_skips_zero_mass() {
        let probs = [0.0, 1.0, 0.0];
        assert_eq!(sample_mult(&probs, 0.0), 1);
    }
}
