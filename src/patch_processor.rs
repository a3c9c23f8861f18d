//! Patch-based sparse-reconstruction fusion.
//!
//! Tiles the HSI extent into (possibly overlapping) patches, runs the three
//! spectral decompositions and the sparse-coding stage per patch on a
//! bounded worker pool, and reconstructs a full-resolution residual image by
//! overlap-add averaging. Each patch is a pure function from its extracted
//! windows to an optional residual-with-placement; the accumulator grids are
//! only ever written by a single-threaded commit (or merged worker-local
//! copies), so the result is independent of patch completion order.

use crate::decomposition::{fastica_components, nmf_components, wavelet_components};
use crate::float_trait::FuseFloat;
use crate::interp::{resize_volume, InterpOrder};
use crate::sparse_coding::sparse_code_residual;
use ndarray::{s, Array2, Array3, ArrayView3};
use rayon::prelude::*;

// =============================================================================
// Constants
// =============================================================================

/// Fixed width of the patch worker pool.
const WORKER_POOL_WIDTH: usize = 4;

/// Inputs below this element count are processed with the lightweight
/// collect strategy; larger inputs use chunked workers with local
/// accumulators to avoid a large intermediate result vector.
const SMALL_INPUT_VOLUME: usize = 1_000_000;

/// A patch contributes only if strictly more than this many pixels are
/// jointly finite in the HSI and low-resolution guide windows.
const MIN_VALID_PIXELS: usize = 5;

// =============================================================================
// Types
// =============================================================================

/// How patch units are distributed over the worker pool.
///
/// Both strategies preserve per-patch independence and order-insensitive
/// accumulation; `Auto` picks by total input volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionStrategy {
    /// Choose by input volume.
    #[default]
    Auto,
    /// Parallel map over patches, single-threaded commit of the results.
    Collected,
    /// Coordinate chunks with worker-local accumulator grids, merged
    /// pairwise after the parallel section.
    ChunkedReduce,
}

/// One patch's residual contribution and its high-resolution placement.
struct PatchResidual<F> {
    row: usize,
    col: usize,
    residual: Array3<F>,
}

/// Drives per-patch decomposition + sparse coding over a tiled scene.
pub struct PatchProcessor<'a, F: FuseFloat> {
    hsi: ArrayView3<'a, F>,
    msi: ArrayView3<'a, F>,
    n_components: usize,
    n_atoms: usize,
    lambda_reg: F,
    seed: u64,
}

impl<'a, F: FuseFloat> PatchProcessor<'a, F> {
    pub fn new(
        hsi: ArrayView3<'a, F>,
        msi: ArrayView3<'a, F>,
        n_components: usize,
        n_atoms: usize,
        lambda_reg: F,
        seed: u64,
    ) -> Self {
        Self {
            hsi,
            msi,
            n_components,
            n_atoms,
            lambda_reg,
            seed,
        }
    }

    /// Run the full tile/dispatch/accumulate/normalize pipeline.
    ///
    /// Returns the overlap-add averaged residual image of shape
    /// `(Hm, Wm, Bh)`. Pixels never covered by a contributing patch are
    /// exactly zero.
    pub fn run_parallel(&self, patch_size: usize, stride: usize) -> Result<Array3<F>, String> {
        self.run_with_strategy(patch_size, stride, ExecutionStrategy::Auto)
    }

    /// As [`run_parallel`](Self::run_parallel) with an explicit execution
    /// strategy. The output is invariant to the strategy up to floating
    /// summation order.
    pub fn run_with_strategy(
        &self,
        patch_size: usize,
        stride: usize,
        strategy: ExecutionStrategy,
    ) -> Result<Array3<F>, String> {
        let (hh, hw, hsi_bands) = self.hsi.dim();
        let (mh, mw, _) = self.msi.dim();

        if patch_size == 0 || stride == 0 {
            return Err("patch_size and stride must be > 0".to_string());
        }
        if self.n_components == 0 || self.n_atoms == 0 {
            return Err("n_components and n_atoms must be > 0".to_string());
        }
        if hsi_bands == 0 {
            return Err("HSI must have at least one band".to_string());
        }
        if hh == 0 || hw == 0 || mh == 0 || mw == 0 {
            return Err("Input images must have non-zero spatial extent".to_string());
        }

        let factor = mh / hh;
        if factor == 0 {
            return Err(format!(
                "MSI height {} is smaller than HSI height {}",
                mh, hh
            ));
        }
        if mw < hw * factor {
            return Err(format!(
                "MSI extent ({}, {}) is inconsistent with HSI extent ({}, {}) at scale factor {}",
                mh, mw, hh, hw, factor
            ));
        }

        // Low-resolution guide proxy for co-registration during coding
        let msi_lr = resize_volume(self.msi, hh, hw, InterpOrder::Quadratic);

        let coords: Vec<(usize, usize)> = tile_coords(hh, hw, patch_size, stride);

        let mut residual_grid = Array3::<F>::zeros((mh, mw, hsi_bands));
        let mut count_grid = Array2::<u32>::zeros((mh, mw));

        let strategy = match strategy {
            ExecutionStrategy::Auto => {
                if self.hsi.len() < SMALL_INPUT_VOLUME {
                    ExecutionStrategy::Collected
                } else {
                    ExecutionStrategy::ChunkedReduce
                }
            }
            explicit => explicit,
        };

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(WORKER_POOL_WIDTH)
            .build()
            .map_err(|e| format!("Failed to build worker pool: {}", e))?;

        match strategy {
            ExecutionStrategy::Collected => {
                let results: Vec<Option<PatchResidual<F>>> = pool.install(|| {
                    coords
                        .par_iter()
                        .map(|&(x, y)| self.process_patch(x, y, patch_size, factor, &msi_lr))
                        .collect()
                });
                for result in results.into_iter().flatten() {
                    commit_residual(&mut residual_grid, &mut count_grid, &result);
                }
            }
            ExecutionStrategy::ChunkedReduce => {
                let chunk_len = coords.len().div_ceil(WORKER_POOL_WIDTH).max(1);
                let merged = pool.install(|| {
                    coords
                        .par_chunks(chunk_len)
                        .map(|chunk| {
                            let mut local_grid = Array3::<F>::zeros((mh, mw, hsi_bands));
                            let mut local_counts = Array2::<u32>::zeros((mh, mw));
                            for &(x, y) in chunk {
                                if let Some(result) =
                                    self.process_patch(x, y, patch_size, factor, &msi_lr)
                                {
                                    commit_residual(&mut local_grid, &mut local_counts, &result);
                                }
                            }
                            (local_grid, local_counts)
                        })
                        .reduce_with(|(mut a_grid, mut a_counts), (b_grid, b_counts)| {
                            a_grid += &b_grid;
                            a_counts += &b_counts;
                            (a_grid, a_counts)
                        })
                });
                if let Some((grid, counts)) = merged {
                    residual_grid = grid;
                    count_grid = counts;
                }
            }
            ExecutionStrategy::Auto => unreachable!("Auto resolved above"),
        }

        // Overlap-add average
        for r in 0..mh {
            for c in 0..mw {
                let count = count_grid[[r, c]];
                if count > 0 {
                    let scale = F::usize_as(count as usize);
                    for b in 0..hsi_bands {
                        residual_grid[[r, c, b]] /= scale;
                    }
                }
            }
        }

        Ok(residual_grid)
    }

    /// Process a single patch at HSI coordinate `(x, y)`.
    ///
    /// Any error raised by the numerical stages is absorbed here: logged
    /// with the patch coordinate and converted to "no contribution".
    fn process_patch(
        &self,
        x: usize,
        y: usize,
        patch_size: usize,
        factor: usize,
        msi_lr: &Array3<F>,
    ) -> Option<PatchResidual<F>> {
        match self.try_process_patch(x, y, patch_size, factor, msi_lr) {
            Ok(result) => result,
            Err(e) => {
                log::warn!("Patch ({}, {}) failed: {}", x, y, e);
                None
            }
        }
    }

    fn try_process_patch(
        &self,
        x: usize,
        y: usize,
        patch_size: usize,
        factor: usize,
        msi_lr: &Array3<F>,
    ) -> Result<Option<PatchResidual<F>>, String> {
        let hsi_patch = self
            .hsi
            .slice(s![x..x + patch_size, y..y + patch_size, ..]);
        let msi_lr_patch = msi_lr.slice(s![x..x + patch_size, y..y + patch_size, ..]);
        let hr = patch_size * factor;
        let msi_hr_patch = self
            .msi
            .slice(s![x * factor..x * factor + hr, y * factor..y * factor + hr, ..]);

        // A pixel is valid when every band is finite in both the HSI and
        // the low-resolution guide window.
        let mut valid_count = 0usize;
        for r in 0..patch_size {
            for c in 0..patch_size {
                let hsi_ok = (0..hsi_patch.dim().2).all(|b| hsi_patch[[r, c, b]].is_finite());
                let lr_ok = (0..msi_lr_patch.dim().2).all(|b| msi_lr_patch[[r, c, b]].is_finite());
                if hsi_ok && lr_ok {
                    valid_count += 1;
                }
            }
        }
        if valid_count <= MIN_VALID_PIXELS {
            return Ok(None);
        }

        let hsi_clean = fill_invalid(hsi_patch);
        let msi_lr_clean = fill_invalid(msi_lr_patch);
        let msi_hr_clean = fill_invalid(msi_hr_patch);

        let patch_seed = self.seed ^ (((x as u64) << 32) | y as u64);

        let wt = wavelet_components(hsi_clean.view(), self.n_components)?;
        let ica = fastica_components(hsi_clean.view(), self.n_components, patch_seed)?;
        let nmf = nmf_components(hsi_clean.view(), self.n_components, patch_seed)?;

        // ComponentSet: horizontal concatenation, reshaped onto the patch grid
        let n = self.n_components;
        let combined = Array3::from_shape_fn((patch_size, patch_size, 3 * n), |(r, c, k)| {
            let i = r * patch_size + c;
            match k / n {
                0 => wt[[i, k % n]],
                1 => ica[[i, k % n]],
                _ => nmf[[i, k % n]],
            }
        });

        let residual = sparse_code_residual(
            msi_lr_clean.view(),
            msi_hr_clean.view(),
            combined.view(),
            self.n_atoms,
            factor,
            self.lambda_reg,
            patch_seed,
        )?;

        Ok(Some(PatchResidual {
            row: x * factor,
            col: y * factor,
            residual,
        }))
    }
}

// =============================================================================
// Tiling and accumulation
// =============================================================================

/// Top-left patch coordinates on the stride grid; boundary patches that do
/// not fit are simply not generated.
fn tile_coords(rows: usize, cols: usize, patch_size: usize, stride: usize) -> Vec<(usize, usize)> {
    let mut coords = Vec::new();
    if rows < patch_size || cols < patch_size {
        return coords;
    }
    let mut x = 0;
    while x <= rows - patch_size {
        let mut y = 0;
        while y <= cols - patch_size {
            coords.push((x, y));
            y += stride;
        }
        x += stride;
    }
    coords
}

/// Replace non-finite entries with the mean of the window's finite entries.
fn fill_invalid<F: FuseFloat>(window: ArrayView3<F>) -> Array3<F> {
    let mut sum = F::zero();
    let mut count = 0usize;
    for &v in window.iter() {
        if v.is_finite() {
            sum += v;
            count += 1;
        }
    }
    let fill = if count > 0 {
        sum / F::usize_as(count)
    } else {
        F::zero()
    };
    window.map(|&v| if v.is_finite() { v } else { fill })
}

/// Add one patch residual into the accumulator grids, clamped to stay
/// within the output bounds, with the channel count clamped to the output
/// band count.
fn commit_residual<F: FuseFloat>(
    grid: &mut Array3<F>,
    counts: &mut Array2<u32>,
    result: &PatchResidual<F>,
) {
    let (out_rows, out_cols, out_bands) = grid.dim();
    let (rh, rw, rb) = result.residual.dim();

    let row_start = result.row.min(out_rows.saturating_sub(rh));
    let col_start = result.col.min(out_cols.saturating_sub(rw));
    let row_end = (row_start + rh).min(out_rows);
    let col_end = (col_start + rw).min(out_cols);
    let bands = rb.min(out_bands);

    for r in row_start..row_end {
        for c in col_start..col_end {
            for b in 0..bands {
                grid[[r, c, b]] += result.residual[[r - row_start, c - col_start, b]];
            }
            counts[[r, c]] += 1;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
