//! Core PCA and change detection modules

pub mod mask;
pub mod moments;
pub mod eigen;
pub mod reconstruct;
pub mod stats;
pub mod threshold;
pub mod merge;
pub mod pca;

// Re-export main types
pub use mask::{build_mask, valid_count};
pub use moments::{band_mean, estimator, BandMoments, MomentEstimator, MomentParams};
pub use eigen::{EigenDecomposer, EigenResult};
pub use reconstruct::{component_path, ComponentReconstructor};
pub use stats::{ComponentStatistics, PcaStats};
pub use threshold::{
    classify_block, detection_path, generate_all, ComponentAnalysis, DetectionRange, DetectionState,
};
pub use merge::{merge_blocks, merge_detection_layers, MergeMethod};
pub use pca::{build_worker_pool, run_pca, run_pca_on, PcaOutcome, PcaParams, STATS_FILE_NAME};
