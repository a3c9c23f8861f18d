//! Hyperspectral/multispectral image fusion.
//!
//! Fuses a low-spatial-resolution hyperspectral image (HSI) with a
//! high-spatial-resolution multispectral image (MSI) of the same scene into
//! an HSI at MSI resolution. Spectral content comes from the HSI; spatial
//! detail is injected from the MSI through patch-based sparse reconstruction
//! and a global detail-injection upsampling, finished with an edge-aware
//! guided smoothing pass.

pub mod decomposition;
pub mod enhancer;
pub mod float_trait;
pub mod guided;
pub mod interp;
pub mod linalg;
pub mod loader;
pub mod patch_processor;
pub mod sparse_coding;
pub mod upsampler;

// Re-export commonly used types at the crate root
pub use enhancer::{Enhancer, FusionConfig};
pub use float_trait::FuseFloat;
pub use guided::{guided_filter, guided_filter_volume};
pub use loader::load_and_preprocess;
pub use patch_processor::{ExecutionStrategy, PatchProcessor};
pub use sparse_coding::{fista, sparse_code_residual, train_dictionary};
pub use upsampler::enhanced_hsi_upsampling;
