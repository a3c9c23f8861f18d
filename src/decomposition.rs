//! Spectral decomposition of HSI patches.
//!
//! Three independent methods reduce a spectral patch `(h, w, b)` to a small
//! set of basis vectors over the pixel samples: a multiresolution wavelet
//! approximation, FastICA, and a non-negative factorization. Each returns a
//! `(h*w, n_components)` matrix with unit-L2 columns; columns that only
//! exist as zero padding stay exactly zero.
//!
//! Failures (degenerate covariance, empty input) are returned as errors and
//! handled at the patch-processing boundary, not here.

use crate::float_trait::FuseFloat;
use crate::linalg::{symmetric_decorrelation, symmetric_eigen};
use ndarray::{Array2, Array3, ArrayView3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

// =============================================================================
// Constants
// =============================================================================

/// Number of multiresolution levels in the wavelet approximation.
const WAVELET_LEVELS: usize = 3;

/// Iteration cap for the FastICA fixed-point update.
const ICA_MAX_ITER: usize = 200;

/// Convergence tolerance on the FastICA unmixing matrix.
const ICA_TOL: f64 = 1e-4;

/// Iteration cap for the multiplicative NMF updates.
const NMF_MAX_ITER: usize = 200;

/// Epsilon added to multiplicative-update denominators.
const MU_EPSILON: f64 = 1e-9;

/// Column norms below this are treated as zero and left un-normalized.
const NORM_EPSILON: f64 = 1e-12;

/// Eigenvalues below this are excluded from whitening.
const WHITEN_EPSILON: f64 = 1e-10;

// =============================================================================
// Shared helpers
// =============================================================================

/// Normalize each column to unit L2 norm; near-zero columns are skipped.
pub fn normalize_columns<F: FuseFloat>(matrix: &mut Array2<F>) {
    let (rows, cols) = matrix.dim();
    let eps = F::from_f64_c(NORM_EPSILON);
    for c in 0..cols {
        let mut sum_sq = F::zero();
        for r in 0..rows {
            let v = matrix[[r, c]];
            sum_sq += v * v;
        }
        let norm = sum_sq.sqrt();
        if norm > eps {
            for r in 0..rows {
                matrix[[r, c]] /= norm;
            }
        }
    }
}

/// Flatten a patch to f64 samples: row `r*w + c`, one column per band.
fn patch_to_samples<F: FuseFloat>(patch: ArrayView3<F>) -> Array2<f64> {
    let (h, w, b) = patch.dim();
    Array2::from_shape_fn((h * w, b), |(i, band)| {
        patch[[i / w, i % w, band]].to_f64().unwrap_or(0.0)
    })
}

/// Truncate/right-pad the f64 source columns to exactly `n_components`
/// columns of `F`, then unit-normalize the non-zero columns.
fn finish_components<F: FuseFloat>(source: &Array2<f64>, n_components: usize) -> Array2<F> {
    let rows = source.nrows();
    let copy_cols = source.ncols().min(n_components);
    let mut out = Array2::<F>::zeros((rows, n_components));
    for c in 0..copy_cols {
        for r in 0..rows {
            out[[r, c]] = F::from_f64_c(source[[r, c]]);
        }
    }
    normalize_columns(&mut out);
    out
}

fn validate_patch<F: FuseFloat>(patch: &ArrayView3<F>) -> Result<(), String> {
    let (h, w, b) = patch.dim();
    if h == 0 || w == 0 || b == 0 {
        return Err(format!(
            "Decomposition requires a non-empty patch, got shape ({}, {}, {})",
            h, w, b
        ));
    }
    Ok(())
}

// =============================================================================
// Wavelet approximation
// =============================================================================

/// Halve an axis by averaging adjacent pairs (odd tails pair with themselves).
fn haar_down_axis(data: &Array3<f64>, axis: usize) -> Array3<f64> {
    let dim = data.dim();
    let len = [dim.0, dim.1, dim.2][axis];
    let new_len = len.div_ceil(2);
    let mut shape = [dim.0, dim.1, dim.2];
    shape[axis] = new_len;

    Array3::from_shape_fn((shape[0], shape[1], shape[2]), |(i, j, k)| {
        let mut a = [i, j, k];
        let mut b = [i, j, k];
        a[axis] *= 2;
        b[axis] = (a[axis] + 1).min(len - 1);
        0.5 * (data[[a[0], a[1], a[2]]] + data[[b[0], b[1], b[2]]])
    })
}

/// Expand an axis to `target` by duplicating each coarse sample.
fn haar_up_axis(data: &Array3<f64>, axis: usize, target: usize) -> Array3<f64> {
    let dim = data.dim();
    let mut shape = [dim.0, dim.1, dim.2];
    shape[axis] = target;

    Array3::from_shape_fn((shape[0], shape[1], shape[2]), |(i, j, k)| {
        let mut src = [i, j, k];
        let coarse_len = [dim.0, dim.1, dim.2][axis];
        src[axis] = (src[axis] / 2).min(coarse_len - 1);
        data[[src[0], src[1], src[2]]]
    })
}

/// Multiresolution wavelet approximation of a spectral patch.
///
/// A 3-level separable Haar analysis along all three axes, reconstructed
/// from the lowest-frequency sub-band only (all detail coefficients zeroed).
/// The approximation is reshaped to `(h*w, b)` and truncated/zero-padded to
/// `n_components` unit-norm columns.
pub fn wavelet_components<F: FuseFloat>(
    patch: ArrayView3<F>,
    n_components: usize,
) -> Result<Array2<F>, String> {
    validate_patch(&patch)?;

    let mut approx = patch_to_samples_3d(patch);
    let mut shapes = Vec::with_capacity(WAVELET_LEVELS);
    for _ in 0..WAVELET_LEVELS {
        shapes.push(approx.dim());
        approx = haar_down_axis(&approx, 0);
        approx = haar_down_axis(&approx, 1);
        approx = haar_down_axis(&approx, 2);
    }
    for &(h, w, b) in shapes.iter().rev() {
        approx = haar_up_axis(&approx, 2, b);
        approx = haar_up_axis(&approx, 1, w);
        approx = haar_up_axis(&approx, 0, h);
    }

    let (h, w, b) = approx.dim();
    let flat = Array2::from_shape_fn((h * w, b), |(i, band)| approx[[i / w, i % w, band]]);
    Ok(finish_components(&flat, n_components))
}

fn patch_to_samples_3d<F: FuseFloat>(patch: ArrayView3<F>) -> Array3<f64> {
    let (h, w, b) = patch.dim();
    Array3::from_shape_fn((h, w, b), |(i, j, k)| {
        patch[[i, j, k]].to_f64().unwrap_or(0.0)
    })
}

// =============================================================================
// FastICA
// =============================================================================

/// Independent-component analysis of a spectral patch.
///
/// Each band is treated as an observed mixture over the `h*w` pixel samples.
/// The samples are centered and whitened through an eigen-decomposition of
/// the band covariance, then the parallel FastICA fixed-point update
/// (logcosh nonlinearity, symmetric decorrelation) runs for at most
/// [`ICA_MAX_ITER`] iterations from a seeded random unmixing matrix.
///
/// A patch with no spectral variance has no independent components and is
/// reported as an error (handled at the patch boundary).
pub fn fastica_components<F: FuseFloat>(
    patch: ArrayView3<F>,
    n_components: usize,
    seed: u64,
) -> Result<Array2<F>, String> {
    validate_patch(&patch)?;
    let samples = patch_to_samples(patch);
    let (n, b) = samples.dim();

    // Center each band
    let mut centered = samples;
    for band in 0..b {
        let mean = centered.column(band).sum() / n as f64;
        for r in 0..n {
            centered[[r, band]] -= mean;
        }
    }

    // Whitening via eigen-decomposition of the band covariance
    let cov = centered.t().dot(&centered) / n as f64;
    let (eigvals, eigvecs) = symmetric_eigen(cov.view());

    let k_requested = n_components.min(b).min(n);
    let mut k = 0;
    while k < k_requested && eigvals[k] > WHITEN_EPSILON {
        k += 1;
    }
    if k == 0 {
        return Err("FastICA: patch has no spectral variance to decompose".to_string());
    }

    let mut whitening = Array2::<f64>::zeros((b, k));
    for c in 0..k {
        let scale = 1.0 / eigvals[c].sqrt();
        for r in 0..b {
            whitening[[r, c]] = eigvecs[[r, c]] * scale;
        }
    }
    let z = centered.dot(&whitening);

    // Seeded unmixing matrix, decorrelated before the first update
    let mut rng = StdRng::seed_from_u64(seed);
    let mut w = Array2::from_shape_fn((k, k), |_| rng.random::<f64>() * 2.0 - 1.0);
    symmetric_decorrelation(&mut w);

    let n_f = n as f64;
    let mut converged = false;
    for _ in 0..ICA_MAX_ITER {
        let u = z.dot(&w.t());
        let g = u.mapv(f64::tanh);

        let mut g_prime_mean = vec![0.0f64; k];
        for (j, gm) in g_prime_mean.iter_mut().enumerate() {
            let mut acc = 0.0;
            for r in 0..n {
                let t = g[[r, j]];
                acc += 1.0 - t * t;
            }
            *gm = acc / n_f;
        }

        let mut w_new = g.t().dot(&z) / n_f;
        for j in 0..k {
            for c in 0..k {
                w_new[[j, c]] -= g_prime_mean[j] * w[[j, c]];
            }
        }
        symmetric_decorrelation(&mut w_new);

        // Convergence: rows of the new unmixing matrix aligned with the old
        let mut max_dev = 0.0f64;
        for j in 0..k {
            let mut dot = 0.0;
            for c in 0..k {
                dot += w_new[[j, c]] * w[[j, c]];
            }
            max_dev = max_dev.max((1.0 - dot.abs()).abs());
        }
        w = w_new;
        if max_dev < ICA_TOL {
            converged = true;
            break;
        }
    }
    if !converged {
        // The last iterate is still a usable unmixing estimate.
        log::warn!(
            "FastICA did not converge within {} iterations; using last estimate",
            ICA_MAX_ITER
        );
    }

    let sources = z.dot(&w.t());
    Ok(finish_components(&sources, n_components))
}

// =============================================================================
// Non-negative factorization
// =============================================================================

/// Non-negative factorization of the absolute patch samples.
///
/// Lee-Seung multiplicative updates for the Frobenius objective, with a
/// seeded scaled-random initialization, capped at [`NMF_MAX_ITER`]
/// iterations. The returned basis lives over the pixel samples.
pub fn nmf_components<F: FuseFloat>(
    patch: ArrayView3<F>,
    n_components: usize,
    seed: u64,
) -> Result<Array2<F>, String> {
    validate_patch(&patch)?;
    let x = patch_to_samples(patch).mapv(f64::abs);
    let (n, b) = x.dim();
    let k = n_components.min(n).min(b).max(1);

    let mean = x.sum() / (n * b) as f64;
    let avg = (mean / k as f64).max(0.0).sqrt();

    let mut rng = StdRng::seed_from_u64(seed);
    let mut w = Array2::from_shape_fn((n, k), |_| avg * rng.random::<f64>());
    let mut h = Array2::from_shape_fn((k, b), |_| avg * rng.random::<f64>());

    if avg > 0.0 {
        for _ in 0..NMF_MAX_ITER {
            // H <- H * (W^T X) / (W^T W H + eps)
            let wt_x = w.t().dot(&x);
            let wt_wh = w.t().dot(&w).dot(&h);
            for r in 0..k {
                for c in 0..b {
                    h[[r, c]] *= wt_x[[r, c]] / (wt_wh[[r, c]] + MU_EPSILON);
                }
            }

            // W <- W * (X H^T) / (W H H^T + eps)
            let x_ht = x.dot(&h.t());
            let w_hht = w.dot(&h.dot(&h.t()));
            for r in 0..n {
                for c in 0..k {
                    w[[r, c]] *= x_ht[[r, c]] / (w_hht[[r, c]] + MU_EPSILON);
                }
            }
        }
    }

    Ok(finish_components(&w, n_components))
}

// =============================================================================
// Tests
// =============================================================================
