//! Separable polynomial resampling and Gaussian filtering.
//!
//! The fusion pipeline resamples 2-D bands at three different spline orders:
//! order 2 for the low-resolution guide proxy, order 3 (Catmull-Rom) for the
//! component-mean upsampling, and order 5 for the global HSI upsampling.
//! All resampling is separable (rows, then columns) with edge-extended
//! source sampling, and per-axis tap weights are precomputed once and shared
//! across lines.

use crate::float_trait::FuseFloat;
use ndarray::{Array2, Array3, ArrayView2, ArrayView3};

/// Interpolation kernel order for `resize_band` / `resize_volume`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpOrder {
    /// 3-point quadratic Lagrange kernel.
    Quadratic,
    /// 4-point Catmull-Rom spline.
    Cubic,
    /// 6-point quintic Lagrange kernel.
    Quintic,
}

impl InterpOrder {
    fn taps(self) -> usize {
        match self {
            InterpOrder::Quadratic => 3,
            InterpOrder::Cubic => 4,
            InterpOrder::Quintic => 6,
        }
    }
}

/// Per-output-sample source taps: first source index and tap weights.
struct AxisTaps {
    start: Vec<isize>,
    weights: Vec<f64>,
    taps: usize,
}

/// Catmull-Rom weights for fractional offset `t` in [0, 1).
fn catmull_rom_weights(t: f64) -> [f64; 4] {
    let t2 = t * t;
    let t3 = t2 * t;
    [
        0.5 * (-t3 + 2.0 * t2 - t),
        0.5 * (3.0 * t3 - 5.0 * t2 + 2.0),
        0.5 * (-3.0 * t3 + 4.0 * t2 + t),
        0.5 * (t3 - t2),
    ]
}

/// Lagrange weights of degree `deg` over integer nodes `0..=deg`,
/// evaluated at local coordinate `u`.
fn lagrange_weights(u: f64, deg: usize, out: &mut [f64]) {
    for (j, w) in out.iter_mut().enumerate().take(deg + 1) {
        let mut acc = 1.0;
        for k in 0..=deg {
            if k != j {
                acc *= (u - k as f64) / (j as f64 - k as f64);
            }
        }
        *w = acc;
    }
}

/// Build the tap table for resampling an axis of length `src_len` to `dst_len`.
///
/// Output coordinate `i` samples the source at `(i + 0.5) * src/dst - 0.5`,
/// the pixel-center mapping used by image resizing.
fn build_axis_taps(src_len: usize, dst_len: usize, order: InterpOrder) -> AxisTaps {
    let taps = order.taps();
    let mut start = Vec::with_capacity(dst_len);
    let mut weights = Vec::with_capacity(dst_len * taps);
    let scale = src_len as f64 / dst_len as f64;

    let mut buf = [0.0f64; 6];
    for i in 0..dst_len {
        let sx = (i as f64 + 0.5) * scale - 0.5;
        match order {
            InterpOrder::Quadratic => {
                let s = sx.round() as isize - 1;
                lagrange_weights(sx - s as f64, 2, &mut buf);
                start.push(s);
                weights.extend_from_slice(&buf[..3]);
            }
            InterpOrder::Cubic => {
                let base = sx.floor() as isize;
                let w = catmull_rom_weights(sx - base as f64);
                start.push(base - 1);
                weights.extend_from_slice(&w);
            }
            InterpOrder::Quintic => {
                let s = sx.floor() as isize - 2;
                lagrange_weights(sx - s as f64, 5, &mut buf);
                start.push(s);
                weights.extend_from_slice(&buf[..6]);
            }
        }
    }

    AxisTaps {
        start,
        weights,
        taps,
    }
}

#[inline]
fn clamp_index(idx: isize, len: usize) -> usize {
    idx.clamp(0, len as isize - 1) as usize
}

/// Resample a single 2-D band to `(target_rows, target_cols)`.
///
/// Source sampling is edge-extended (clamped), matching a `nearest`/`edge`
/// boundary mode. Values are not range-clamped.
pub fn resize_band<F: FuseFloat>(
    src: ArrayView2<F>,
    target_rows: usize,
    target_cols: usize,
    order: InterpOrder,
) -> Array2<F> {
    let (rows, cols) = src.dim();
    if rows == 0 || cols == 0 || target_rows == 0 || target_cols == 0 {
        return Array2::zeros((target_rows, target_cols));
    }

    // Pass 1: resample rows (vertical axis)
    let row_taps = build_axis_taps(rows, target_rows, order);
    let mut intermediate = Array2::<f64>::zeros((target_rows, cols));
    for i in 0..target_rows {
        let s = row_taps.start[i];
        let w = &row_taps.weights[i * row_taps.taps..(i + 1) * row_taps.taps];
        for c in 0..cols {
            let mut acc = 0.0;
            for (k, &wk) in w.iter().enumerate() {
                let r = clamp_index(s + k as isize, rows);
                acc += wk * src[[r, c]].to_f64().unwrap_or(0.0);
            }
            intermediate[[i, c]] = acc;
        }
    }

    // Pass 2: resample columns (horizontal axis)
    let col_taps = build_axis_taps(cols, target_cols, order);
    let mut output = Array2::<F>::zeros((target_rows, target_cols));
    for j in 0..target_cols {
        let s = col_taps.start[j];
        let w = &col_taps.weights[j * col_taps.taps..(j + 1) * col_taps.taps];
        for i in 0..target_rows {
            let mut acc = 0.0;
            for (k, &wk) in w.iter().enumerate() {
                let c = clamp_index(s + k as isize, cols);
                acc += wk * intermediate[[i, c]];
            }
            output[[i, j]] = F::from_f64_c(acc);
        }
    }

    output
}

/// Resample every band of a band-last 3-D volume to the given spatial extent.
pub fn resize_volume<F: FuseFloat>(
    src: ArrayView3<F>,
    target_rows: usize,
    target_cols: usize,
    order: InterpOrder,
) -> Array3<F> {
    let (_, _, bands) = src.dim();
    let mut output = Array3::<F>::zeros((target_rows, target_cols, bands));
    for b in 0..bands {
        let band = src.slice(ndarray::s![.., .., b]);
        let resized = resize_band(band, target_rows, target_cols, order);
        output
            .slice_mut(ndarray::s![.., .., b])
            .assign(&resized);
    }
    output
}

/// Mirror an out-of-range index back into `[0, len)` (scipy `reflect` mode).
fn reflect_index(mut idx: isize, len: usize) -> usize {
    let n = len as isize;
    if n == 1 {
        return 0;
    }
    loop {
        if idx < 0 {
            idx = -idx - 1;
        } else if idx >= n {
            idx = 2 * n - 1 - idx;
        } else {
            return idx as usize;
        }
    }
}

/// Compute a normalized 1-D Gaussian kernel with radius `ceil(truncate * sigma)`.
fn gaussian_kernel_1d<F: FuseFloat>(sigma: F) -> Vec<f64> {
    let sigma = sigma.to_f64().unwrap_or(0.0);
    if sigma <= 0.0 {
        return vec![1.0];
    }
    let truncate = F::GAUSSIAN_TRUNCATE.to_f64().unwrap_or(4.0);
    let radius = (truncate * sigma).ceil() as isize;
    let mut kernel = Vec::with_capacity((2 * radius + 1) as usize);
    let mut sum = 0.0;
    for i in -radius..=radius {
        let x = i as f64;
        let val = (-0.5 * (x / sigma).powi(2)).exp();
        kernel.push(val);
        sum += val;
    }
    for k in &mut kernel {
        *k /= sum;
    }
    kernel
}

/// Separable 2-D Gaussian blur with reflective boundary handling.
pub fn gaussian_blur_2d<F: FuseFloat>(src: ArrayView2<F>, sigma: F) -> Array2<F> {
    let (rows, cols) = src.dim();
    let kernel = gaussian_kernel_1d::<F>(sigma);
    let radius = (kernel.len() / 2) as isize;

    let mut vertical = Array2::<f64>::zeros((rows, cols));
    for c in 0..cols {
        for r in 0..rows {
            let mut acc = 0.0;
            for (k, &kv) in kernel.iter().enumerate() {
                let idx = reflect_index(r as isize + k as isize - radius, rows);
                acc += kv * src[[idx, c]].to_f64().unwrap_or(0.0);
            }
            vertical[[r, c]] = acc;
        }
    }

    let mut output = Array2::<F>::zeros((rows, cols));
    for r in 0..rows {
        for c in 0..cols {
            let mut acc = 0.0;
            for (k, &kv) in kernel.iter().enumerate() {
                let idx = reflect_index(c as isize + k as isize - radius, cols);
                acc += kv * vertical[[r, idx]];
            }
            output[[r, c]] = F::from_f64_c(acc);
        }
    }

    output
}
