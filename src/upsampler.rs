//! Global HSI upsampling with MSI detail injection.
//!
//! Produces the full-resolution base estimate: a smooth order-5 upsampling
//! of every HSI band, sharpened by the high-frequency component of a
//! grayscale guide derived from selected MSI bands, then rescaled band-wise
//! so the original HSI radiometry (mean/std) is preserved.

use crate::float_trait::FuseFloat;
use crate::interp::{gaussian_blur_2d, resize_volume, InterpOrder};
use ndarray::{s, Array2, Array3, ArrayView3};

/// Sigma of the low-pass filter that splits the guide into base and detail.
const GUIDE_LOWPASS_SIGMA: f64 = 1.0;

/// Epsilon in the guide min-max normalization denominator.
const GUIDE_RANGE_EPSILON: f64 = 1e-6;

/// Upsample `hsi` to the MSI grid while injecting MSI spatial detail.
///
/// For each band the detail signal `guide_high` (grayscale guide minus its
/// Gaussian low-pass) is added with weight `detail_weight`, then the band is
/// rescaled to match the mean/std recorded from the original HSI band. A
/// band whose enhanced version has zero variance is kept as-is.
///
/// # Errors
///
/// Returns a dimension-mismatch error when `hsi` has no bands or the guide
/// spatial extent differs from the MSI extent.
pub fn enhanced_hsi_upsampling<F: FuseFloat>(
    hsi: ArrayView3<F>,
    msi: ArrayView3<F>,
    guide: ArrayView3<F>,
    detail_weight: F,
) -> Result<Array3<F>, String> {
    let (hh, hw, bands) = hsi.dim();
    let (mh, mw, _) = msi.dim();
    let (gh, gw, guide_bands) = guide.dim();

    if bands < 1 {
        return Err("Inconsistent input dimensions: HSI has no spectral bands".to_string());
    }
    if (gh, gw) != (mh, mw) {
        return Err(format!(
            "Inconsistent input dimensions: guide extent ({}, {}) does not match MSI extent ({}, {})",
            gh, gw, mh, mw
        ));
    }
    if hh == 0 || hw == 0 || guide_bands == 0 {
        return Err("Inconsistent input dimensions: empty input".to_string());
    }

    // Per-band statistics of the original, recorded before upsampling
    let n_lr = F::usize_as(hh * hw);
    let mut original_means = vec![F::zero(); bands];
    let mut original_stds = vec![F::zero(); bands];
    for b in 0..bands {
        let mut sum = F::zero();
        for r in 0..hh {
            for c in 0..hw {
                sum += hsi[[r, c, b]];
            }
        }
        let mean = sum / n_lr;
        let mut var = F::zero();
        for r in 0..hh {
            for c in 0..hw {
                let d = hsi[[r, c, b]] - mean;
                var += d * d;
            }
        }
        original_means[b] = mean;
        original_stds[b] = (var / n_lr).sqrt();
    }

    let mut upsampled = resize_volume(hsi, mh, mw, InterpOrder::Quintic);

    // Grayscale guide, min-max scaled to [0, 1]
    let gb_norm = F::usize_as(guide_bands);
    let mut gray = Array2::<F>::zeros((mh, mw));
    for r in 0..mh {
        for c in 0..mw {
            let mut acc = F::zero();
            for b in 0..guide_bands {
                acc += guide[[r, c, b]];
            }
            gray[[r, c]] = acc / gb_norm;
        }
    }
    let g_min = gray.iter().copied().fold(F::infinity(), F::min);
    let g_max = gray.iter().copied().fold(F::neg_infinity(), F::max);
    let range = g_max - g_min + F::from_f64_c(GUIDE_RANGE_EPSILON);
    gray.mapv_inplace(|v| (v - g_min) / range);

    let guide_low = gaussian_blur_2d(gray.view(), F::from_f64_c(GUIDE_LOWPASS_SIGMA));
    let guide_high = &gray - &guide_low;

    let n_hr = F::usize_as(mh * mw);
    for b in 0..bands {
        let mut band = upsampled.slice_mut(s![.., .., b]);

        let mut sum = F::zero();
        for r in 0..mh {
            for c in 0..mw {
                band[[r, c]] += detail_weight * guide_high[[r, c]];
                sum += band[[r, c]];
            }
        }
        let band_mean = sum / n_hr;
        let mut var = F::zero();
        for r in 0..mh {
            for c in 0..mw {
                let d = band[[r, c]] - band_mean;
                var += d * d;
            }
        }
        let band_std = (var / n_hr).sqrt();

        if band_std > F::zero() {
            let gain = original_stds[b] / band_std;
            for r in 0..mh {
                for c in 0..mw {
                    band[[r, c]] = original_means[b] + (band[[r, c]] - band_mean) * gain;
                }
            }
        }
    }

    Ok(upsampled)
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

    fn band_mean(vol: &Array3<f32>, b: usize) -> f32 {
        let (h, w, _) = vol.dim();
        let mut sum = 0.0;
        for r in 0..h {
            for c in 0..w {
                sum += vol[[r, c, b]];
            }
        }
        sum / (h * w) as f32
    }

    fn band_std(vol: &Array3<f32>, b: usize) -> f32 {
        let (h, w, _) = vol.dim();
        let mean = band_mean(vol, b);
        let mut var = 0.0;
        for r in 0..h {
            for c in 0..w {
                var += (vol[[r, c, b]] - mean).powi(2);
            }
        }
        (var / (h * w) as f32).sqrt()
    }

    #[test]
    fn test_output_shape_and_finite() {
        let hsi = random_volume(50, 50, 10, 1);
        let msi = random_volume(100, 100, 3, 2);
        let guide = random_volume(100, 100, 3, 3);

        let out = enhanced_hsi_upsampling(hsi.view(), msi.view(), guide.view(), 2.0).unwrap();
        assert_eq!(out.dim(), (100, 100, 10));
        assert!(out.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_statistics_preserved_for_any_detail_weight() {
        let hsi = random_volume(20, 20, 4, 10);
        let msi = random_volume(40, 40, 3, 11);
        let guide = random_volume(40, 40, 3, 12);

        for &weight in &[0.0f32, 1.0, 3.5, 10.0] {
            let out =
                enhanced_hsi_upsampling(hsi.view(), msi.view(), guide.view(), weight).unwrap();
            for b in 0..4 {
                let orig_mean = band_mean(&hsi, b);
                let orig_std = band_std(&hsi, b);
                assert!(
                    (band_mean(&out, b) - orig_mean).abs() < 1e-3,
                    "mean drifted for weight {}",
                    weight
                );
                assert!(
                    (band_std(&out, b) - orig_std).abs() < 1e-3,
                    "std drifted for weight {}",
                    weight
                );
            }
        }
    }

    #[test]
    fn test_rejects_zero_band_hsi() {
        let hsi = Array3::<f32>::zeros((50, 50, 0));
        let msi = random_volume(100, 100, 3, 4);
        let guide = random_volume(100, 100, 3, 5);

        let err = enhanced_hsi_upsampling(hsi.view(), msi.view(), guide.view(), 2.0);
        assert!(err.is_err());
        assert!(err.unwrap_err().contains("Inconsistent input dimensions"));
    }

    #[test]
    fn test_rejects_guide_msi_extent_mismatch() {
        let hsi = random_volume(50, 50, 10, 6);
        let msi = random_volume(100, 100, 3, 7);
        let guide = random_volume(90, 100, 3, 8);

        let err = enhanced_hsi_upsampling(hsi.view(), msi.view(), guide.view(), 2.0);
        assert!(err.is_err());
        assert!(err.unwrap_err().contains("Inconsistent input dimensions"));
    }

    #[test]
    fn test_constant_band_kept_when_variance_zero() {
        // Constant HSI + constant guide: detail signal is zero, every
        // enhanced band has zero variance and is kept as-is.
        let hsi = Array3::from_elem((10, 10, 2), 1.5f32);
        let msi = random_volume(20, 20, 3, 9);
        let guide = Array3::from_elem((20, 20, 3), 0.5f32);

        let out = enhanced_hsi_upsampling(hsi.view(), msi.view(), guide.view(), 3.5).unwrap();
        for &v in out.iter() {
            assert!((v - 1.5).abs() < 1e-4);
        }
    }
}
