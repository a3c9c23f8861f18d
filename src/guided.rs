//! Edge-aware guided image filtering.
//!
//! The final smoothing pass of the fusion pipeline: each output band is
//! filtered with the guided image filter (He et al.), steered by a small
//! multi-band guide so that spatial edges present in the guide survive the
//! smoothing. The implementation is the standard box-filter formulation
//! with a per-pixel K x K covariance solve for the K guide bands.

use crate::float_trait::FuseFloat;
use crate::linalg::solve_small;
use ndarray::{Array1, Array2, Array3, ArrayView2, ArrayView3};

/// Normalized box filter of radius `r` with edge-truncated windows.
///
/// Windows are clipped at the image border and normalized by the actual
/// window area, computed via running sums per axis.
fn box_filter(src: &Array2<f64>, radius: usize) -> Array2<f64> {
    let (rows, cols) = src.dim();
    let r = radius as isize;

    // Horizontal pass: windowed sums per row
    let mut horiz = Array2::<f64>::zeros((rows, cols));
    for i in 0..rows {
        let mut acc = 0.0;
        for c in 0..=(r.min(cols as isize - 1)) {
            acc += src[[i, c as usize]];
        }
        horiz[[i, 0]] = acc;
        for j in 1..cols {
            let enter = j as isize + r;
            let leave = j as isize - r - 1;
            if enter < cols as isize {
                acc += src[[i, enter as usize]];
            }
            if leave >= 0 {
                acc -= src[[i, leave as usize]];
            }
            horiz[[i, j]] = acc;
        }
    }

    // Vertical pass + normalization by actual window area
    let mut out = Array2::<f64>::zeros((rows, cols));
    for j in 0..cols {
        let mut acc = 0.0;
        for i in 0..=(r.min(rows as isize - 1)) {
            acc += horiz[[i as usize, j]];
        }
        out[[0, j]] = acc;
        for i in 1..rows {
            let enter = i as isize + r;
            let leave = i as isize - r - 1;
            if enter < rows as isize {
                acc += horiz[[enter as usize, j]];
            }
            if leave >= 0 {
                acc -= horiz[[leave as usize, j]];
            }
            out[[i, j]] = acc;
        }
    }

    for i in 0..rows {
        let h = ((i as isize + r).min(rows as isize - 1) - (i as isize - r).max(0) + 1) as f64;
        for j in 0..cols {
            let w = ((j as isize + r).min(cols as isize - 1) - (j as isize - r).max(0) + 1) as f64;
            out[[i, j]] /= h * w;
        }
    }

    out
}

/// Guided filter of a single band `src` steered by a K-band `guide`.
///
/// `radius` is the box-filter radius and `eps` the edge-preservation
/// regularizer added to the guide covariance diagonal. Returns the filtered
/// band; guide/src extent mismatch is an error.
pub fn guided_filter<F: FuseFloat>(
    guide: ArrayView3<F>,
    src: ArrayView2<F>,
    radius: usize,
    eps: F,
) -> Result<Array2<F>, String> {
    let (rows, cols, k) = guide.dim();
    if src.dim() != (rows, cols) {
        return Err(format!(
            "Guided filter extent mismatch: guide is ({}, {}), source is {:?}",
            rows, cols,
            src.dim()
        ));
    }
    if k == 0 {
        return Err("Guided filter requires at least one guide band".to_string());
    }

    let eps = eps.to_f64().unwrap_or(0.0);

    let guide_f64: Vec<Array2<f64>> = (0..k)
        .map(|b| {
            Array2::from_shape_fn((rows, cols), |(i, j)| {
                guide[[i, j, b]].to_f64().unwrap_or(0.0)
            })
        })
        .collect();
    let src_f64 = Array2::from_shape_fn((rows, cols), |(i, j)| src[[i, j]].to_f64().unwrap_or(0.0));

    let mean_guide: Vec<Array2<f64>> = guide_f64.iter().map(|g| box_filter(g, radius)).collect();
    let mean_src = box_filter(&src_f64, radius);

    // Cross-correlations guide x guide (upper triangle) and guide x src
    let mut corr_gg: Vec<Array2<f64>> = Vec::with_capacity(k * (k + 1) / 2);
    for a in 0..k {
        for b in a..k {
            corr_gg.push(box_filter(&(&guide_f64[a] * &guide_f64[b]), radius));
        }
    }
    let corr_gs: Vec<Array2<f64>> = guide_f64
        .iter()
        .map(|g| box_filter(&(g * &src_f64), radius))
        .collect();

    let tri_index = |a: usize, b: usize| -> usize {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        lo * k - lo * (lo + 1) / 2 + lo + (hi - lo)
    };

    // Per-pixel affine coefficients a (K per pixel) and b (scalar)
    let mut coeff_a: Vec<Array2<f64>> = (0..k).map(|_| Array2::zeros((rows, cols))).collect();
    let mut coeff_b = Array2::<f64>::zeros((rows, cols));

    for i in 0..rows {
        for j in 0..cols {
            let mut sigma = Array2::<f64>::zeros((k, k));
            let mut cov = Array1::<f64>::zeros(k);
            for a in 0..k {
                for b in a..k {
                    let v = corr_gg[tri_index(a, b)][[i, j]]
                        - mean_guide[a][[i, j]] * mean_guide[b][[i, j]];
                    sigma[[a, b]] = v;
                    sigma[[b, a]] = v;
                }
                sigma[[a, a]] += eps;
                cov[a] = corr_gs[a][[i, j]] - mean_guide[a][[i, j]] * mean_src[[i, j]];
            }

            let a_px = match solve_small(&mut sigma, &mut cov) {
                Some(x) => x,
                // Degenerate local covariance: fall back to pure smoothing
                None => Array1::zeros(k),
            };

            let mut b_px = mean_src[[i, j]];
            for a in 0..k {
                b_px -= a_px[a] * mean_guide[a][[i, j]];
                coeff_a[a][[i, j]] = a_px[a];
            }
            coeff_b[[i, j]] = b_px;
        }
    }

    let mean_a: Vec<Array2<f64>> = coeff_a.iter().map(|a| box_filter(a, radius)).collect();
    let mean_b = box_filter(&coeff_b, radius);

    let mut out = Array2::<F>::zeros((rows, cols));
    for i in 0..rows {
        for j in 0..cols {
            let mut v = mean_b[[i, j]];
            for a in 0..k {
                v += mean_a[a][[i, j]] * guide_f64[a][[i, j]];
            }
            out[[i, j]] = F::from_f64_c(v);
        }
    }

    Ok(out)
}

/// Apply the guided filter independently to every band of `src`.
pub fn guided_filter_volume<F: FuseFloat>(
    guide: ArrayView3<F>,
    src: ArrayView3<F>,
    radius: usize,
    eps: F,
) -> Result<Array3<F>, String> {
    let (rows, cols, bands) = src.dim();
    let mut out = Array3::<F>::zeros((rows, cols, bands));
    for b in 0..bands {
        let band = src.slice(ndarray::s![.., .., b]);
        let filtered = guided_filter(guide, band, radius, eps)?;
        out.slice_mut(ndarray::s![.., .., b]).assign(&filtered);
    }
    Ok(out)
}

// =============================================================================
// Tests
// =============================================================================
