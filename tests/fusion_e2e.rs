mod common;

use common::synthetic_scene::{random_hsi, random_msi};
use hsifuse::{Enhancer, FusionConfig, PatchProcessor};

#[test]
fn synthetic_scene_fuses_to_msi_resolution() {
    // 50x50x10 HSI with a co-registered 100x100x3 MSI: scale factor 2
    let hsi = random_hsi(50, 50, 10, 20240731);
    let msi = random_msi(100, 100, 3, 19);

    let config = FusionConfig::<f32> {
        patch_size: 8,
        stride: 4,
        guide_bands: vec![0, 1, 2],
        ..Default::default()
    };

    let enhancer = Enhancer::new(msi, hsi, config).expect("valid inputs");
    let enhanced = enhancer.fuse_to_enhance().expect("fusion should succeed");

    assert_eq!(enhanced.dim(), (100, 100, 10));
    assert!(
        enhanced.iter().all(|v| v.is_finite()),
        "fused output must be fully finite"
    );
    assert!(
        enhanced.iter().any(|&v| v != 0.0),
        "fused output must contain signal"
    );
}

#[test]
fn residual_stage_covers_the_full_grid() {
    let hsi = random_hsi(50, 50, 10, 7);
    let msi = random_msi(100, 100, 3, 8);

    let processor = PatchProcessor::new(hsi.view(), msi.view(), 5, 5, 5e-4, 0);
    let residual = processor.run_parallel(8, 4).expect("residual run");

    assert_eq!(residual.dim(), (100, 100, 10));
    assert!(residual.iter().all(|v| v.is_finite()));
    // patch 8 / stride 4 tiles the 50-pixel extent completely
    assert!(residual.iter().any(|&v| v != 0.0));
}
