//! Command-line front end for the fusion pipeline.

use anyhow::{Context, Result};
use clap::Parser;
use hsifuse::{Enhancer, FusionConfig};
use log::info;
use ndarray::Array3;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;

#[derive(Parser)]
#[clap(name = "hsifuse", about = "HSI resolution enhancement by MSI fusion")]
struct Args {
    /// Path to the MSI raster (multi-band TIFF)
    #[clap(long)]
    msi_path: PathBuf,

    /// Path to the HSI raster (multi-band TIFF)
    #[clap(long)]
    hsi_path: PathBuf,

    /// Patch size in HSI pixels
    #[clap(long, default_value = "12")]
    patch_size: usize,

    /// Stride between patch starts
    #[clap(long, default_value = "1")]
    stride: usize,

    /// Radius of the final guided filter
    #[clap(long, default_value = "1")]
    guide_radius: usize,

    /// Weight for MSI detail injection
    #[clap(long, default_value = "3.5")]
    detail_weight: f32,

    /// Output path for the enhanced HSI (.npy)
    #[clap(long, default_value = "output/hsi_enhanced.npy")]
    output_path: PathBuf,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Err(e) = run() {
        log::error!("Error during enhancement: {:#}", e);
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();

    let config = FusionConfig::<f32> {
        patch_size: args.patch_size,
        stride: args.stride,
        guide_radius: args.guide_radius,
        detail_weight: args.detail_weight,
        ..Default::default()
    };

    let enhancer = Enhancer::from_files(&args.msi_path, &args.hsi_path, config)
        .map_err(anyhow::Error::msg)
        .context("Failed to load input rasters")?;

    let enhanced = enhancer
        .fuse_to_enhance()
        .map_err(anyhow::Error::msg)
        .context("Enhancement failed")?;

    if let Some(parent) = args.output_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }
    write_npy(&args.output_path, &enhanced)
        .with_context(|| format!("Failed to write {}", args.output_path.display()))?;

    info!(
        "HSI enhancement completed. Output shape: {:?}, saved to {}",
        enhanced.dim(),
        args.output_path.display()
    );
    println!(
        "HSI enhancement completed. Output shape: {:?}",
        enhanced.dim()
    );
    println!("Enhanced HSI saved to: {}", args.output_path.display());

    Ok(())
}

/// Write a band-last f32 array as a NumPy `.npy` file (v1.0, C order).
fn write_npy(path: &std::path::Path, data: &Array3<f32>) -> Result<()> {
    let (h, w, b) = data.dim();
    let mut header = format!(
        "{{'descr': '<f4', 'fortran_order': False, 'shape': ({}, {}, {}), }}",
        h, w, b
    );
    // Pad so magic + version + length field + header is 64-byte aligned
    let unpadded = 6 + 2 + 2 + header.len() + 1;
    let padding = (64 - unpadded % 64) % 64;
    header.push_str(&" ".repeat(padding));
    header.push('\n');

    let file = File::create(path)?;
    let mut out = BufWriter::new(file);
    out.write_all(b"\x93NUMPY")?;
    out.write_all(&[1u8, 0u8])?;
    out.write_all(&(header.len() as u16).to_le_bytes())?;
    out.write_all(header.as_bytes())?;

    for &v in data.iter() {
        out.write_all(&v.to_le_bytes())?;
    }
    out.flush()?;
    Ok(())
}
