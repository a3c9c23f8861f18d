//! Pipeline orchestration: residual + base fusion and final smoothing.
//!
//! The enhancer owns the two clean input arrays, runs the patch-based
//! residual reconstruction and the global detail-injection upsampling, sums
//! the two estimates band-wise, and finishes with a per-band guided filter
//! steered by the selected MSI guide bands.

use crate::float_trait::FuseFloat;
use crate::guided::guided_filter_volume;
use crate::loader::load_and_preprocess;
use crate::patch_processor::PatchProcessor;
use crate::upsampler::enhanced_hsi_upsampling;
use ndarray::{s, Array3};
use std::path::Path;

// =============================================================================
// Constants
// =============================================================================

/// Default number of components per decomposition method.
const DEFAULT_N_COMPONENTS: usize = 5;

/// Default number of dictionary atoms.
const DEFAULT_N_ATOMS: usize = 5;

/// Default L1 weight for the high-resolution sparse coding.
const DEFAULT_LAMBDA_REG: f64 = 5e-4;

/// Default patch size (HSI pixels per side).
const DEFAULT_PATCH_SIZE: usize = 12;

/// Default stride between patch starts.
const DEFAULT_STRIDE: usize = 1;

/// Default guided-filter radius.
const DEFAULT_GUIDE_RADIUS: usize = 1;

/// Default guided-filter edge regularizer.
const DEFAULT_GUIDE_EPS: f64 = 1e-4;

/// Default weight for MSI detail injection.
const DEFAULT_DETAIL_WEIGHT: f64 = 3.5;

/// Default MSI band indices used as the spatial guide.
const DEFAULT_GUIDE_BANDS: [usize; 3] = [1, 7, 11];

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the fusion pipeline.
///
/// All parameters have sensible defaults; use `Default::default()` for
/// standard settings.
#[derive(Debug, Clone)]
pub struct FusionConfig<F: FuseFloat> {
    /// Components per decomposition method. Default: 5
    pub n_components: usize,
    /// Dictionary atoms per patch. Default: 5
    pub n_atoms: usize,
    /// L1 weight of the sparse-coding objective. Default: 5e-4
    pub lambda_reg: F,
    /// Patch size in HSI pixels. Default: 12
    pub patch_size: usize,
    /// Stride between patch starts. Default: 1
    pub stride: usize,
    /// Guided-filter radius. Default: 1
    pub guide_radius: usize,
    /// Guided-filter regularizer. Default: 1e-4
    pub guide_eps: F,
    /// MSI detail injection weight. Default: 3.5
    pub detail_weight: F,
    /// MSI band indices used as the spatial guide. Default: [1, 7, 11]
    pub guide_bands: Vec<usize>,
    /// Seed for the randomized decomposition and dictionary stages.
    pub seed: u64,
}

impl<F: FuseFloat> Default for FusionConfig<F> {
    fn default() -> Self {
        Self {
            n_components: DEFAULT_N_COMPONENTS,
            n_atoms: DEFAULT_N_ATOMS,
            lambda_reg: F::from_f64_c(DEFAULT_LAMBDA_REG),
            patch_size: DEFAULT_PATCH_SIZE,
            stride: DEFAULT_STRIDE,
            guide_radius: DEFAULT_GUIDE_RADIUS,
            guide_eps: F::from_f64_c(DEFAULT_GUIDE_EPS),
            detail_weight: F::from_f64_c(DEFAULT_DETAIL_WEIGHT),
            guide_bands: DEFAULT_GUIDE_BANDS.to_vec(),
            seed: 0,
        }
    }
}

impl<F: FuseFloat> FusionConfig<F> {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the configuration parameters.
    pub fn validate(&self) -> Result<(), String> {
        if self.n_components == 0 {
            return Err("n_components must be > 0".to_string());
        }
        if self.n_atoms == 0 {
            return Err("n_atoms must be > 0".to_string());
        }
        if self.patch_size == 0 {
            return Err("patch_size must be > 0".to_string());
        }
        if self.stride == 0 {
            return Err("stride must be > 0".to_string());
        }
        if self.lambda_reg < F::zero() {
            return Err("lambda_reg must be >= 0".to_string());
        }
        if self.guide_eps <= F::zero() {
            return Err("guide_eps must be > 0".to_string());
        }
        if !self.detail_weight.is_finite() {
            return Err("detail_weight must be finite".to_string());
        }
        if self.guide_bands.is_empty() {
            return Err("guide_bands must not be empty".to_string());
        }
        Ok(())
    }
}

// =============================================================================
// Enhancer
// =============================================================================

/// HSI resolution enhancement by MSI fusion.
pub struct Enhancer<F: FuseFloat> {
    msi: Array3<F>,
    hsi: Array3<F>,
    config: FusionConfig<F>,
}

impl<F: FuseFloat> Enhancer<F> {
    /// Build an enhancer from two clean band-last arrays.
    ///
    /// The inputs must come from the loader contract: no non-finite values,
    /// both non-empty, MSI at least as large spatially as the HSI.
    pub fn new(msi: Array3<F>, hsi: Array3<F>, config: FusionConfig<F>) -> Result<Self, String> {
        config.validate()?;
        let (_, _, msi_bands) = msi.dim();
        if let Some(&bad) = config.guide_bands.iter().find(|&&b| b >= msi_bands) {
            return Err(format!(
                "Guide band index {} out of range: MSI has {} bands",
                bad, msi_bands
            ));
        }
        Ok(Self { msi, hsi, config })
    }

    /// Fuse the HSI with the MSI and return the enhanced HSI at MSI
    /// resolution.
    pub fn fuse_to_enhance(&self) -> Result<Array3<F>, String> {
        let processor = PatchProcessor::new(
            self.hsi.view(),
            self.msi.view(),
            self.config.n_components,
            self.config.n_atoms,
            self.config.lambda_reg,
            self.config.seed,
        );
        let residual = processor.run_parallel(self.config.patch_size, self.config.stride)?;

        let (mh, mw, _) = self.msi.dim();
        let n_guide = self.config.guide_bands.len();
        let mut guide = Array3::<F>::zeros((mh, mw, n_guide));
        for (dst, &src) in self.config.guide_bands.iter().enumerate() {
            guide
                .slice_mut(s![.., .., dst])
                .assign(&self.msi.slice(s![.., .., src]));
        }

        let base = enhanced_hsi_upsampling(
            self.hsi.view(),
            self.msi.view(),
            guide.view(),
            self.config.detail_weight,
        )?;

        let summed = &base + &residual;
        guided_filter_volume(
            guide.view(),
            summed.view(),
            self.config.guide_radius,
            self.config.guide_eps,
        )
    }
}

impl Enhancer<f32> {
    /// Build an enhancer straight from two raster files via the loader.
    pub fn from_files(
        msi_path: &Path,
        hsi_path: &Path,
        config: FusionConfig<f32>,
    ) -> Result<Self, String> {
        let (msi, hsi) = load_and_preprocess(msi_path, hsi_path, 0.5)?;
        Self::new(msi, hsi, config)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    // Helper: Simple LCG for deterministic test data
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

    fn random_volume(r: usize, c: usize, b: usize, seed: u64) -> Array3<f32> {
        let mut rng = SimpleLcg::new(seed);
        Array3::from_shape_fn((r, c, b), |_| rng.next_f32())
    }

    fn small_config() -> FusionConfig<f32> {
        FusionConfig {
            n_components: 3,
            n_atoms: 4,
            patch_size: 8,
            stride: 4,
            guide_bands: vec![0, 1, 2],
            ..Default::default()
        }
    }

    // ==================== Config Tests ====================

    #[test]
    fn test_default_config() {
        let config: FusionConfig<f32> = FusionConfig::default();
        assert_eq!(config.n_components, 5);
        assert_eq!(config.n_atoms, 5);
        assert_eq!(config.patch_size, 12);
        assert_eq!(config.stride, 1);
        assert_eq!(config.guide_radius, 1);
        assert_eq!(config.guide_bands, vec![1, 7, 11]);
        assert!((config.detail_weight - 3.5).abs() < 1e-6);
        assert!((config.lambda_reg - 5e-4).abs() < 1e-9);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation_rejects_zero_fields() {
        let mut config: FusionConfig<f32> = FusionConfig::default();
        config.patch_size = 0;
        assert!(config.validate().is_err());

        let mut config: FusionConfig<f32> = FusionConfig::default();
        config.stride = 0;
        assert!(config.validate().is_err());

        let mut config: FusionConfig<f32> = FusionConfig::default();
        config.n_atoms = 0;
        assert!(config.validate().is_err());

        let mut config: FusionConfig<f32> = FusionConfig::default();
        config.guide_bands.clear();
        assert!(config.validate().is_err());
    }

    // ==================== Enhancer Tests ====================

    #[test]
    fn test_rejects_out_of_range_guide_band() {
        let msi = random_volume(32, 32, 3, 1);
        let hsi = random_volume(16, 16, 4, 2);
        let config: FusionConfig<f32> = FusionConfig::default(); // guide band 7 > 2
        assert!(Enhancer::new(msi, hsi, config).is_err());
    }

    #[test]
    fn test_fuse_to_enhance_end_to_end_small() {
        let msi = random_volume(32, 32, 3, 3);
        let hsi = random_volume(16, 16, 4, 4);
        let enhancer = Enhancer::new(msi, hsi, small_config()).unwrap();

        let out = enhancer.fuse_to_enhance().unwrap();
        assert_eq!(out.dim(), (32, 32, 4));
        assert!(out.iter().all(|v| v.is_finite()));
        assert!(out.iter().any(|&v| v != 0.0));
    }

    #[test]
    fn test_fuse_output_tracks_hsi_radiometry() {
        // The fused image derives its radiometry from the HSI statistics;
        // per-band means should stay in the same ballpark.
        let msi = random_volume(32, 32, 3, 5);
        let hsi = random_volume(16, 16, 4, 6);
        let orig_means: Vec<f32> = (0..4)
            .map(|b| hsi.slice(s![.., .., b]).iter().sum::<f32>() / 256.0)
            .collect();

        let enhancer = Enhancer::new(msi, hsi, small_config()).unwrap();
        let out = enhancer.fuse_to_enhance().unwrap();

        for (b, &orig) in orig_means.iter().enumerate() {
            let mean = out.slice(s![.., .., b]).iter().sum::<f32>() / 1024.0;
            assert!(
                (mean - orig).abs() < 0.5,
                "band {} mean drifted: {} vs {}",
                b,
                mean,
                orig
            );
        }
    }
}
