//! Deterministic synthetic scenes for end-to-end tests.

use ndarray::Array3;

/// Simple LCG, good enough for reproducible test imagery.
struct SimpleLcg {
    state: u64,
}

impl SimpleLcg {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        self.state = self.state.wrapping_mul(6364136223846793005).wrapping_add(1);
        self.state
    }

    fn next_f32(&mut self) -> f32 {
        let u = self.next_u64();
        (u >> 40) as f32 / (1u64 << 24) as f32
    }
}

/// A low-resolution hyperspectral cube with smooth spectral correlation.
pub fn random_hsi(rows: usize, cols: usize, bands: usize, seed: u64) -> Array3<f32> {
    let mut rng = SimpleLcg::new(seed);
    let base = Array3::from_shape_fn((rows, cols, 1), |_| rng.next_f32());
    Array3::from_shape_fn((rows, cols, bands), |(r, c, b)| {
        // Each band is the shared spatial pattern plus band-specific noise,
        // so spectral decompositions have real structure to find.
        let shared = base[[r, c, 0]];
        let jitter = ((r * 31 + c * 17 + b * 7) % 97) as f32 / 970.0;
        0.7 * shared + 0.3 * (b as f32 + 1.0) / (bands as f32) + jitter
    })
}

/// A high-resolution multispectral image.
pub fn random_msi(rows: usize, cols: usize, bands: usize, seed: u64) -> Array3<f32> {
    let mut rng = SimpleLcg::new(seed);
    Array3::from_shape_fn((rows, cols, bands), |_| rng.next_f32())
}
