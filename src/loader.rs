//! Raster loading and pre-filling of invalid pixels.
//!
//! The upstream collaborator of the fusion core: reads multi-band TIFF
//! rasters (one grayscale page per spectral band), masks non-positive
//! source values as invalid, drops HSI bands that are mostly invalid, and
//! fills the remaining invalid pixels so that no non-finite value ever
//! reaches the numerical pipeline.

use ndarray::Array3;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use tiff::decoder::{Decoder, DecodingResult};
use tiff::ColorType;

/// Window size of the median pre-fill filter.
const MEDIAN_WINDOW: usize = 3;

/// Load a multi-band raster as a band-last `(H, W, B)` array.
///
/// Each TIFF page becomes one spectral band. Non-positive source values are
/// masked to NaN for the preprocessing stage to fill.
pub fn load_image(path: &Path) -> Result<Array3<f32>, String> {
    let file =
        File::open(path).map_err(|e| format!("Failed to open {}: {}", path.display(), e))?;
    let reader = BufReader::new(file);
    let mut decoder =
        Decoder::new(reader).map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;

    let mut bands: Vec<Vec<f32>> = Vec::new();
    let mut width = 0usize;
    let mut height = 0usize;

    loop {
        let (w, h) = decoder
            .dimensions()
            .map_err(|e| format!("TIFF error in {}: {}", path.display(), e))?;
        let color_type = decoder
            .colortype()
            .map_err(|e| format!("TIFF error in {}: {}", path.display(), e))?;

        if !matches!(
            color_type,
            ColorType::Gray(8) | ColorType::Gray(16) | ColorType::Gray(32) | ColorType::Gray(64)
        ) {
            return Err(format!(
                "Unsupported TIFF color type {:?} in {}: expected one grayscale page per band",
                color_type,
                path.display()
            ));
        }

        if bands.is_empty() {
            width = w as usize;
            height = h as usize;
        } else if w as usize != width || h as usize != height {
            return Err(format!(
                "TIFF pages in {} have inconsistent dimensions: expected {}x{}, got {}x{}",
                path.display(),
                width,
                height,
                w,
                h
            ));
        }

        let image_data = decoder
            .read_image()
            .map_err(|e| format!("TIFF error in {}: {}", path.display(), e))?;

        let band: Vec<f32> = match image_data {
            DecodingResult::U8(data) => data.into_iter().map(|v| v as f32).collect(),
            DecodingResult::U16(data) => data.into_iter().map(|v| v as f32).collect(),
            DecodingResult::U32(data) => data.into_iter().map(|v| v as f32).collect(),
            DecodingResult::U64(data) => data.into_iter().map(|v| v as f32).collect(),
            DecodingResult::I8(data) => data.into_iter().map(|v| v as f32).collect(),
            DecodingResult::I16(data) => data.into_iter().map(|v| v as f32).collect(),
            DecodingResult::I32(data) => data.into_iter().map(|v| v as f32).collect(),
            DecodingResult::I64(data) => data.into_iter().map(|v| v as f32).collect(),
            DecodingResult::F32(data) => data,
            DecodingResult::F64(data) => data.into_iter().map(|v| v as f32).collect(),
        };
        bands.push(band);

        if decoder.more_images() {
            if decoder.next_image().is_err() {
                break;
            }
        } else {
            break;
        }
    }

    if bands.is_empty() {
        return Err(format!("No pages found in TIFF {}", path.display()));
    }

    let n_bands = bands.len();
    let mut data = Array3::<f32>::zeros((height, width, n_bands));
    for (band_idx, band_data) in bands.into_iter().enumerate() {
        for (pixel_idx, val) in band_data.into_iter().enumerate() {
            let r = pixel_idx / width;
            let c = pixel_idx % width;
            if r < height {
                // Non-positive source values are invalid
                data[[r, c, band_idx]] = if val <= 0.0 { f32::NAN } else { val };
            }
        }
    }

    Ok(data)
}

/// Median of the finite values in the `window`-cube around a voxel,
/// nearest-edge padded. NaN when the window holds no finite value.
fn local_median(data: &Array3<f32>, r: usize, c: usize, b: usize, window: usize) -> f32 {
    let (rows, cols, bands) = data.dim();
    let radius = (window / 2) as isize;
    let mut values: Vec<f32> = Vec::with_capacity(window * window * window);

    for dr in -radius..=radius {
        for dc in -radius..=radius {
            for db in -radius..=radius {
                let rr = (r as isize + dr).clamp(0, rows as isize - 1) as usize;
                let cc = (c as isize + dc).clamp(0, cols as isize - 1) as usize;
                let bb = (b as isize + db).clamp(0, bands as isize - 1) as usize;
                let v = data[[rr, cc, bb]];
                if v.is_finite() {
                    values.push(v);
                }
            }
        }
    }

    if values.is_empty() {
        return f32::NAN;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    values[values.len() / 2]
}

/// Fill invalid pixels: median-filtered substitution first, global finite
/// mean for whatever remains. An all-invalid input becomes all zeros.
pub fn preprocess(data: &Array3<f32>) -> Array3<f32> {
    let (rows, cols, bands) = data.dim();
    let any_valid = data.iter().any(|v| v.is_finite());
    if !any_valid {
        return Array3::zeros((rows, cols, bands));
    }

    let mut filled = data.clone();
    for r in 0..rows {
        for c in 0..cols {
            for b in 0..bands {
                if !data[[r, c, b]].is_finite() {
                    filled[[r, c, b]] = local_median(data, r, c, b, MEDIAN_WINDOW);
                }
            }
        }
    }

    // Global finite mean for pixels the median could not fill
    let mut sum = 0.0f64;
    let mut count = 0usize;
    for &v in filled.iter() {
        if v.is_finite() {
            sum += v as f64;
            count += 1;
        }
    }
    let mean = if count > 0 { (sum / count as f64) as f32 } else { 0.0 };
    filled.mapv_inplace(|v| if v.is_finite() { v } else { mean });

    filled
}

/// Drop bands whose invalid-pixel fraction exceeds `threshold`.
///
/// Returns the retained bands and the indices of the eliminated ones.
pub fn eliminate_invalid_bands(
    data: &Array3<f32>,
    threshold: f32,
) -> (Array3<f32>, Vec<usize>) {
    let (rows, cols, bands) = data.dim();
    let pixels = (rows * cols) as f32;

    let mut keep = Vec::with_capacity(bands);
    let mut eliminated = Vec::new();
    for b in 0..bands {
        let invalid = data
            .slice(ndarray::s![.., .., b])
            .iter()
            .filter(|v| !v.is_finite())
            .count() as f32;
        if invalid / pixels <= threshold {
            keep.push(b);
        } else {
            eliminated.push(b);
        }
    }

    let mut kept = Array3::<f32>::zeros((rows, cols, keep.len()));
    for (dst, &src) in keep.iter().enumerate() {
        kept.slice_mut(ndarray::s![.., .., dst])
            .assign(&data.slice(ndarray::s![.., .., src]));
    }

    (kept, eliminated)
}

/// Load and preprocess an MSI/HSI pair per the loader contract.
///
/// HSI bands whose invalid fraction exceeds `invalid_threshold` are dropped
/// before preprocessing; both arrays come back fully finite.
pub fn load_and_preprocess(
    msi_path: &Path,
    hsi_path: &Path,
    invalid_threshold: f32,
) -> Result<(Array3<f32>, Array3<f32>), String> {
    let msi = load_image(msi_path)?;
    let hsi = load_image(hsi_path)?;

    let (hsi, eliminated) = eliminate_invalid_bands(&hsi, invalid_threshold);
    if eliminated.is_empty() {
        log::info!("No bands were eliminated");
    } else {
        log::info!("Eliminated band numbers: {:?}", eliminated);
    }

    let msi = preprocess(&msi);
    let hsi = preprocess(&hsi);

    Ok((msi, hsi))
}

// =============================================================================
// Tests
// =============================================================================
