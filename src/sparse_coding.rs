//! Joint dictionary learning and FISTA sparse coding.
//!
//! A per-patch dictionary couples low-resolution guide structure to the
//! patch's spectral components so that, at high resolution, the guide alone
//! can index into plausible spectral content. The sparse codes for the
//! high-resolution guide then reconstruct a dense spectral prediction, and
//! subtracting the upsampled mean spectral shape leaves the residual that
//! the patch contributes to the fused image.

use crate::decomposition::normalize_columns;
use crate::float_trait::FuseFloat;
use crate::interp::{resize_band, InterpOrder};
use crate::linalg::spectral_norm;
use ndarray::{s, Array2, Array3, ArrayView2, ArrayView3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

// =============================================================================
// Constants
// =============================================================================

/// Default FISTA iteration cap.
pub const FISTA_MAX_ITER: usize = 75;

/// Default FISTA early-stop tolerance on the max coefficient change.
pub const FISTA_TOL: f64 = 1e-6;

/// Iterations before the FISTA early-stop check is allowed to fire.
const FISTA_MIN_ITER: usize = 5;

/// Power-iteration steps for the dictionary spectral norm.
const SPECTRAL_NORM_ITERS: usize = 100;

/// Outer alternating iterations for dictionary learning.
const DICT_OUTER_ITERS: usize = 20;

/// FISTA iterations per sparse-coding step inside dictionary learning.
const DICT_CODE_ITERS: usize = 30;

/// Atom-usage energy below which an atom is considered dead and re-seeded.
const DEAD_ATOM_EPSILON: f64 = 1e-10;

// =============================================================================
// FISTA
// =============================================================================

/// Solve `argmin_code 0.5*||target - code * D^T||^2 + lambda*||code||_1`
/// independently per sample row of `target`.
///
/// Accelerated proximal gradient: gradient steps of size `1/L` where `L` is
/// the squared spectral norm of the dictionary, soft-thresholding at
/// `lambda/L`, and a Nesterov momentum sequence. An all-zero dictionary
/// (`L == 0`) short-circuits to all-zero codes. After [`FISTA_MIN_ITER`]
/// iterations the loop stops early once the max-absolute coefficient change
/// falls below `tol`.
pub fn fista<F: FuseFloat>(
    target: ArrayView2<F>,
    dictionary: ArrayView2<F>,
    lambda_reg: F,
    max_iter: usize,
    tol: F,
) -> Array2<F> {
    let n_samples = target.nrows();
    let n_atoms = dictionary.ncols();

    let sigma = spectral_norm(dictionary, SPECTRAL_NORM_ITERS);
    let lipschitz = sigma * sigma;
    if lipschitz == F::zero() {
        return Array2::zeros((n_samples, n_atoms));
    }

    let threshold = lambda_reg / lipschitz;
    let mut alpha = Array2::<F>::zeros((n_samples, n_atoms));
    let mut y = Array2::<F>::zeros((n_samples, n_atoms));
    let mut t = F::one();

    for k in 0..max_iter {
        let alpha_prev = alpha.clone();

        // Descent step: y + (X - y D^T) D / L
        let residual = &target - &y.dot(&dictionary.t());
        let step = residual.dot(&dictionary).mapv(|v| v / lipschitz);
        let z = &y + &step;
        alpha = z.mapv(|v| {
            let mag = v.abs() - threshold;
            if mag > F::zero() {
                v.signum() * mag
            } else {
                F::zero()
            }
        });

        let four = F::from_f64_c(4.0);
        let t_next = (F::one() + (F::one() + four * t * t).sqrt()) / F::from_f64_c(2.0);
        let momentum = (t - F::one()) / t_next;
        y = &alpha + &(&alpha - &alpha_prev).mapv(|v| v * momentum);
        t = t_next;

        if k > FISTA_MIN_ITER {
            let max_change = alpha
                .iter()
                .zip(alpha_prev.iter())
                .map(|(a, b)| (*a - *b).abs())
                .fold(F::zero(), |acc, v| if v > acc { v } else { acc });
            if max_change < tol {
                break;
            }
        }
    }

    alpha
}

// =============================================================================
// Dictionary learning
// =============================================================================

/// Learn a joint dictionary from per-pixel low-resolution guide samples and
/// spectral components.
///
/// The two inputs are stacked column-wise per pixel into joint feature
/// vectors of dimension `n_guide_bands + n_component_cols`, then fitted by
/// alternating sparse coding (L1 weight 1) and sequential per-atom updates
/// for [`DICT_OUTER_ITERS`] outer iterations. Atoms are initialized from
/// seeded random data rows; dead atoms are re-seeded from the worst
/// reconstructed sample. Returns unit-column atoms of shape
/// `(n_features, n_atoms)`.
pub fn train_dictionary<F: FuseFloat>(
    guide_lr_flat: ArrayView2<F>,
    component_flat: ArrayView2<F>,
    n_atoms: usize,
    seed: u64,
) -> Result<Array2<F>, String> {
    let n_samples = guide_lr_flat.nrows();
    if component_flat.nrows() != n_samples {
        return Err(format!(
            "Dictionary training sample mismatch: guide has {} rows, components have {}",
            n_samples,
            component_flat.nrows()
        ));
    }
    if n_atoms == 0 {
        return Err("n_atoms must be > 0".to_string());
    }
    if n_samples == 0 {
        return Err("Dictionary training requires at least one sample".to_string());
    }

    let n_guide = guide_lr_flat.ncols();
    let n_features = n_guide + component_flat.ncols();

    // Joint per-pixel feature rows
    let mut data = Array2::<F>::zeros((n_samples, n_features));
    data.slice_mut(s![.., ..n_guide]).assign(&guide_lr_flat);
    data.slice_mut(s![.., n_guide..]).assign(&component_flat);

    // Initialize atoms from random data rows
    let mut rng = StdRng::seed_from_u64(seed);
    let mut dict = Array2::<F>::zeros((n_features, n_atoms));
    for a in 0..n_atoms {
        let row = rng.random_range(0..n_samples);
        for f in 0..n_features {
            dict[[f, a]] = data[[row, f]];
        }
    }
    normalize_columns(&mut dict);
    reseed_zero_atoms(&mut dict, &mut rng);

    let l1_weight = F::one();
    let tol = F::from_f64_c(FISTA_TOL);
    let dead_eps = F::from_f64_c(DEAD_ATOM_EPSILON);

    for _ in 0..DICT_OUTER_ITERS {
        let codes = fista(data.view(), dict.view(), l1_weight, DICT_CODE_ITERS, tol);

        // Reconstruction residual for the atom updates
        let mut residual = &data - &codes.dot(&dict.t());

        for a in 0..n_atoms {
            let mut energy = F::zero();
            for r in 0..n_samples {
                let c = codes[[r, a]];
                energy += c * c;
            }

            if energy < dead_eps {
                // Dead atom: re-seed from the worst reconstructed sample
                let worst = worst_sample(&residual);
                for f in 0..n_features {
                    dict[[f, a]] = data[[worst, f]];
                }
                normalize_column(&mut dict, a);
                continue;
            }

            // d_new = (R^T c + d * ||c||^2), normalized
            let mut numer = vec![F::zero(); n_features];
            for f in 0..n_features {
                let mut acc = dict[[f, a]] * energy;
                for r in 0..n_samples {
                    acc += residual[[r, f]] * codes[[r, a]];
                }
                numer[f] = acc;
            }
            let norm = numer.iter().map(|&v| v * v).sum::<F>().sqrt();
            if norm < dead_eps {
                continue;
            }

            // Commit the atom and keep the residual consistent:
            // R <- R - c (d_new - d_old)^T
            for f in 0..n_features {
                let d_new = numer[f] / norm;
                let delta = d_new - dict[[f, a]];
                dict[[f, a]] = d_new;
                for r in 0..n_samples {
                    let c = codes[[r, a]];
                    residual[[r, f]] -= c * delta;
                }
            }
        }
    }

    Ok(dict)
}

fn normalize_column<F: FuseFloat>(dict: &mut Array2<F>, col: usize) {
    let rows = dict.nrows();
    let mut sum_sq = F::zero();
    for r in 0..rows {
        let v = dict[[r, col]];
        sum_sq += v * v;
    }
    let norm = sum_sq.sqrt();
    if norm > F::from_f64_c(DEAD_ATOM_EPSILON) {
        for r in 0..rows {
            dict[[r, col]] /= norm;
        }
    }
}

fn reseed_zero_atoms<F: FuseFloat>(dict: &mut Array2<F>, rng: &mut StdRng) {
    let (rows, cols) = dict.dim();
    let eps = F::from_f64_c(DEAD_ATOM_EPSILON);
    for c in 0..cols {
        let norm = dict
            .column(c)
            .iter()
            .map(|&v| v * v)
            .sum::<F>()
            .sqrt();
        if norm < eps {
            for r in 0..rows {
                dict[[r, c]] = F::from_f64_c(rng.random::<f64>() * 2.0 - 1.0);
            }
            normalize_column(dict, c);
        }
    }
}

fn worst_sample<F: FuseFloat>(residual: &Array2<F>) -> usize {
    let mut worst = 0;
    let mut worst_norm = F::neg_infinity();
    for (r, row) in residual.rows().into_iter().enumerate() {
        let norm = row.iter().map(|&v| v * v).sum::<F>();
        if norm > worst_norm {
            worst_norm = norm;
            worst = r;
        }
    }
    worst
}

// =============================================================================
// High-resolution residual prediction
// =============================================================================

/// Predict the high-resolution spectral residual for one patch.
///
/// Trains the joint dictionary from `(guide_lr, components)`, sparse-codes
/// the flattened high-resolution guide against the guide rows of the
/// dictionary, and reconstructs dense joint vectors through the full
/// dictionary. The order-3 upsampled per-pixel mean of the spectral
/// components is subtracted from every predicted channel, leaving only the
/// detail beyond the mean spectral shape.
///
/// Returns `(h*f, w*f, n_guide + n_component_cols)`; the caller clamps the
/// channel count against the output band count.
pub fn sparse_code_residual<F: FuseFloat>(
    guide_lr: ArrayView3<F>,
    guide_hr: ArrayView3<F>,
    components: ArrayView3<F>,
    n_atoms: usize,
    factor: usize,
    lambda_reg: F,
    seed: u64,
) -> Result<Array3<F>, String> {
    let (h, w, n_guide) = guide_lr.dim();
    let (hh, hw, hr_guide) = guide_hr.dim();
    let (ch, cw, n_comp) = components.dim();

    if (ch, cw) != (h, w) {
        return Err(format!(
            "Component grid ({}, {}) does not match low-resolution guide ({}, {})",
            ch, cw, h, w
        ));
    }
    if hr_guide != n_guide {
        return Err(format!(
            "Guide band mismatch: low-resolution has {}, high-resolution has {}",
            n_guide, hr_guide
        ));
    }
    if (hh, hw) != (h * factor, w * factor) {
        return Err(format!(
            "High-resolution guide ({}, {}) does not match factor {} over ({}, {})",
            hh, hw, factor, h, w
        ));
    }

    let flatten = |v: ArrayView3<F>| -> Array2<F> {
        let (r, c, b) = v.dim();
        Array2::from_shape_fn((r * c, b), |(i, band)| v[[i / c, i % c, band]])
    };

    let guide_lr_flat = flatten(guide_lr);
    let guide_hr_flat = flatten(guide_hr);
    let comp_flat = flatten(components);

    let mut dict = train_dictionary(guide_lr_flat.view(), comp_flat.view(), n_atoms, seed)?;
    normalize_columns(&mut dict);

    // The guide rows index the atoms; the full atoms reconstruct.
    let dict_guide = dict.slice(s![..n_guide, ..]);
    let codes = fista(
        guide_hr_flat.view(),
        dict_guide,
        lambda_reg,
        FISTA_MAX_ITER,
        F::from_f64_c(FISTA_TOL),
    );
    let pred = codes.dot(&dict.t());

    // Mean spectral shape over the component columns, upsampled to HR
    let mut mean_lr = Array2::<F>::zeros((h, w));
    let comp_norm = F::usize_as(n_comp.max(1));
    for r in 0..h {
        for c in 0..w {
            let mut acc = F::zero();
            for b in 0..n_comp {
                acc += components[[r, c, b]];
            }
            mean_lr[[r, c]] = acc / comp_norm;
        }
    }
    let mean_hr = resize_band(mean_lr.view(), hh, hw, InterpOrder::Cubic);

    let n_features = pred.ncols();
    let residual = Array3::from_shape_fn((hh, hw, n_features), |(r, c, b)| {
        pred[[r * hw + c, b]] - mean_hr[[r, c]]
    });

    Ok(residual)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array2, Array3};

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

    fn random_matrix(rows: usize, cols: usize, seed: u64) -> Array2<f32> {
        let mut rng = SimpleLcg::new(seed);
        Array2::from_shape_fn((rows, cols), |_| rng.next_f32())
    }

    fn random_volume(r: usize, c: usize, b: usize, seed: u64) -> Array3<f32> {
        let mut rng = SimpleLcg::new(seed);
        Array3::from_shape_fn((r, c, b), |_| rng.next_f32())
    }

    // ==================== FISTA Tests ====================

    #[test]
    fn test_fista_zero_dictionary_returns_zero_codes() {
        let target = random_matrix(10, 4, 1);
        let dict = Array2::<f32>::zeros((4, 6));
        let codes = fista(target.view(), dict.view(), 0.1, FISTA_MAX_ITER, 1e-6);
        assert_eq!(codes.dim(), (10, 6));
        assert!(codes.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_fista_unregularized_least_squares() {
        // Orthonormal dictionary columns: the least-squares solution is X * D
        let mut dict = Array2::<f32>::zeros((4, 2));
        dict[[0, 0]] = 1.0;
        dict[[2, 1]] = 1.0;
        let target = random_matrix(12, 4, 5);

        let codes = fista(target.view(), dict.view(), 0.0, FISTA_MAX_ITER, 1e-9);
        let expected = target.dot(&dict);
        for (a, b) in codes.iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-4, "{} vs {}", a, b);
        }
    }

    #[test]
    fn test_fista_large_lambda_kills_codes() {
        let dict = {
            let mut d = random_matrix(4, 3, 9);
            normalize_columns(&mut d);
            d
        };
        let target = random_matrix(8, 4, 10);
        let codes = fista(target.view(), dict.view(), 1e6, FISTA_MAX_ITER, 1e-9);
        assert!(codes.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_fista_sparsity_increases_with_lambda() {
        let dict = {
            let mut d = random_matrix(6, 8, 21);
            normalize_columns(&mut d);
            d
        };
        let target = random_matrix(20, 6, 22);

        let count_nonzero = |codes: &Array2<f32>| codes.iter().filter(|&&v| v != 0.0).count();
        let loose = fista(target.view(), dict.view(), 0.001, FISTA_MAX_ITER, 1e-9);
        let tight = fista(target.view(), dict.view(), 0.5, FISTA_MAX_ITER, 1e-9);
        assert!(count_nonzero(&tight) <= count_nonzero(&loose));
    }

    // ==================== Dictionary Learning Tests ====================

    #[test]
    fn test_train_dictionary_shape_and_norms() {
        let guide = random_matrix(64, 3, 100);
        let comps = random_matrix(64, 15, 101);
        let dict = train_dictionary(guide.view(), comps.view(), 5, 0).unwrap();
        assert_eq!(dict.dim(), (18, 5));
        for c in 0..5 {
            let norm: f32 = dict.column(c).iter().map(|v| v * v).sum::<f32>().sqrt();
            assert!((norm - 1.0).abs() < 1e-3, "atom {} norm {}", c, norm);
        }
    }

    #[test]
    fn test_train_dictionary_deterministic() {
        let guide = random_matrix(36, 3, 7);
        let comps = random_matrix(36, 9, 8);
        let a = train_dictionary(guide.view(), comps.view(), 4, 11).unwrap();
        let b = train_dictionary(guide.view(), comps.view(), 4, 11).unwrap();
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(*x, *y);
        }
    }

    #[test]
    fn test_train_dictionary_rejects_mismatched_rows() {
        let guide = random_matrix(10, 3, 1);
        let comps = random_matrix(12, 4, 2);
        assert!(train_dictionary(guide.view(), comps.view(), 3, 0).is_err());
    }

    #[test]
    fn test_train_dictionary_improves_reconstruction() {
        // The learned dictionary should explain the data better than its
        // random initialization explains pure noise: reconstruction error
        // must come out well below the raw data energy.
        let guide = random_matrix(64, 3, 200);
        let comps = random_matrix(64, 6, 201);
        let dict = train_dictionary(guide.view(), comps.view(), 6, 0).unwrap();

        let mut data = Array2::<f32>::zeros((64, 9));
        data.slice_mut(s![.., ..3]).assign(&guide);
        data.slice_mut(s![.., 3..]).assign(&comps);

        let codes = fista(data.view(), dict.view(), 0.01, FISTA_MAX_ITER, 1e-8);
        let recon = codes.dot(&dict.t());
        let err: f32 = data
            .iter()
            .zip(recon.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum();
        let energy: f32 = data.iter().map(|v| v * v).sum();
        assert!(err < energy * 0.5, "err {} energy {}", err, energy);
    }

    // ==================== Residual Tests ====================

    #[test]
    fn test_sparse_code_residual_shape() {
        let guide_lr = random_volume(8, 8, 3, 301);
        let guide_hr = random_volume(16, 16, 3, 302);
        let comps = random_volume(8, 8, 6, 303);

        let residual =
            sparse_code_residual(guide_lr.view(), guide_hr.view(), comps.view(), 5, 2, 5e-4, 0)
                .unwrap();
        assert_eq!(residual.dim(), (16, 16, 9));
        assert!(residual.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_sparse_code_residual_rejects_bad_factor() {
        let guide_lr = random_volume(8, 8, 3, 1);
        let guide_hr = random_volume(15, 16, 3, 2);
        let comps = random_volume(8, 8, 6, 3);
        assert!(
            sparse_code_residual(guide_lr.view(), guide_hr.view(), comps.view(), 5, 2, 5e-4, 0)
                .is_err()
        );
    }

    #[test]
    fn test_sparse_code_residual_rejects_band_mismatch() {
        let guide_lr = random_volume(8, 8, 3, 1);
        let guide_hr = random_volume(16, 16, 4, 2);
        let comps = random_volume(8, 8, 6, 3);
        assert!(
            sparse_code_residual(guide_lr.view(), guide_hr.view(), comps.view(), 5, 2, 5e-4, 0)
                .is_err()
        );
    }
}
