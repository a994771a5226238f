//! Cross-modal attention: gated pooling, pairwise fusion and the mixed
//! attention layer combining them.

pub mod mixed_attention;
pub mod pooling;

pub use mixed_attention::{AttentionMaps, MixedAttention, MixedAttentionOutput};
pub use pooling::{softmax_pool, AttentionFusion, FusionOutput, GatedAttentionPool};

/// Factor pair `(w, h)` with `w * h == n` and `w` the largest divisor of `n`
/// not exceeding `⌊√n⌋`. Primes give `(1, n)`.
pub fn find_closest_factors(n: usize) -> (usize, usize) {
    let mut root = (n as f64).sqrt() as usize;
    while (root + 1) * (root + 1) <= n {
        root += 1;
    }
    while root * root > n {
        root -= 1;
    }

    (1..=root)
        .rev()
        .find(|i| n % i == 0)
        .map(|i| (i, n / i))
        .unwrap_or((1, n))
}
