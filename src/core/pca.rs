//! PCA entry point: moments, eigen-decomposition, component rasters and stats

use crate::core::eigen::EigenDecomposer;
use crate::core::moments::{MomentEstimator, MomentParams};
use crate::core::reconstruct::ComponentReconstructor;
use crate::core::stats::PcaStats;
use crate::io::pyramids::build_pyramids_for;
use crate::io::stack::{BandSource, RasterStack, DEFAULT_CHUNK_BLOCK_SIZE};
use crate::types::{EstimatorKind, Nodata, PcaError, PcaResult};
use rayon::ThreadPool;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// File name of the run summary inside the output directory
pub const STATS_FILE_NAME: &str = "pca_stats.json";

/// Parameters of one PCA run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PcaParams {
    pub first_raster: PathBuf,
    /// Optional second date, stacked after the bands of the first raster
    #[serde(default)]
    pub second_raster: Option<PathBuf>,
    /// Number of components to write (1..=total bands)
    pub n_components: usize,
    #[serde(default)]
    pub estimator: EstimatorKind,
    pub output_dir: PathBuf,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// Side of a square chunk in pixels
    #[serde(default = "default_chunk_block_size")]
    pub chunk_block_size: usize,
    #[serde(default)]
    pub nodata: Option<Nodata>,
    /// Build overviews for the components after writing them
    #[serde(default = "default_build_pyramids")]
    pub build_pyramids: bool,
}

fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_chunk_block_size() -> usize {
    DEFAULT_CHUNK_BLOCK_SIZE
}

fn default_build_pyramids() -> bool {
    true
}

impl PcaParams {
    pub fn new<P: AsRef<Path>, Q: AsRef<Path>>(first_raster: P, output_dir: Q, n_components: usize) -> Self {
        Self {
            first_raster: first_raster.as_ref().to_path_buf(),
            second_raster: None,
            n_components,
            estimator: EstimatorKind::default(),
            output_dir: output_dir.as_ref().to_path_buf(),
            worker_count: default_worker_count(),
            chunk_block_size: default_chunk_block_size(),
            nodata: None,
            build_pyramids: default_build_pyramids(),
        }
    }

    /// Check the parameters that do not need the rasters
    pub fn validate(&self) -> PcaResult<()> {
        if self.n_components == 0 {
            return Err(PcaError::InvalidArgument(
                "Number of components must be at least 1".to_string(),
            ));
        }
        if self.worker_count == 0 {
            return Err(PcaError::InvalidArgument(
                "Worker count must be at least 1".to_string(),
            ));
        }
        if self.chunk_block_size == 0 {
            return Err(PcaError::InvalidArgument(
                "Chunk block size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn moment_params(&self) -> MomentParams {
        MomentParams {
            kind: self.estimator,
            chunk_block_size: self.chunk_block_size,
            nodata: self.nodata,
        }
    }

    pub fn from_json_file(path: &Path) -> PcaResult<Self> {
        let file = std::fs::File::open(path)?;
        let params: Self = serde_json::from_reader(file)?;
        Ok(params)
    }

    pub fn to_json_file(&self, path: &Path) -> PcaResult<()> {
        let file = std::fs::File::create(path)?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }
}

/// Result of a PCA run
#[derive(Debug, Clone)]
pub enum PcaOutcome {
    Completed {
        component_paths: Vec<PathBuf>,
        stats: PcaStats,
    },
    /// Every pixel was masked out; nothing was written
    NoValidData,
}

impl PcaOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, PcaOutcome::Completed { .. })
    }

    pub fn component_paths(&self) -> Option<&[PathBuf]> {
        match self {
            PcaOutcome::Completed { component_paths, .. } => Some(component_paths),
            PcaOutcome::NoValidData => None,
        }
    }

    pub fn stats(&self) -> Option<&PcaStats> {
        match self {
            PcaOutcome::Completed { stats, .. } => Some(stats),
            PcaOutcome::NoValidData => None,
        }
    }
}

/// Build the bounded worker pool of a run
pub fn build_worker_pool(worker_count: usize) -> PcaResult<Arc<ThreadPool>> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(worker_count.max(1))
        .thread_name(|i| format!("pca-worker-{}", i))
        .build()
        .map(Arc::new)
        .map_err(|e| PcaError::Compute(format!("Failed to start worker pool: {}", e)))
}

/// Open the input rasters and run the PCA
pub fn run_pca(params: &PcaParams) -> PcaResult<PcaOutcome> {
    params.validate()?;
    let stack = RasterStack::open(&params.first_raster, params.second_raster.as_ref())?;
    let outcome = run_pca_on(&stack, params);
    stack.close();
    outcome
}

/// Run the PCA over any band source.
///
/// `first_raster`/`second_raster` of `params` are ignored here.
pub fn run_pca_on(source: &dyn BandSource, params: &PcaParams) -> PcaResult<PcaOutcome> {
    params.validate()?;
    let n_bands = source.band_count();
    if params.n_components > n_bands {
        return Err(PcaError::InvalidArgument(format!(
            "Requested {} components from a stack of {} bands",
            params.n_components, n_bands
        )));
    }

    log::info!(
        "Starting PCA: {} bands, {} components, {} estimator, {} workers",
        n_bands,
        params.n_components,
        params.estimator,
        params.worker_count
    );

    let pool = build_worker_pool(params.worker_count)?;
    let moments = MomentEstimator::new(params.moment_params(), pool.clone()).estimate(source)?;
    if !moments.has_valid_data() {
        log::warn!("No valid pixels, no components written");
        return Ok(PcaOutcome::NoValidData);
    }

    let eigen = match EigenDecomposer::decompose(&moments.matrix, params.n_components) {
        Ok(eigen) => eigen,
        Err(PcaError::DegenerateData(msg)) => {
            log::warn!("{}", msg);
            return Ok(PcaOutcome::NoValidData);
        }
        Err(e) => return Err(e),
    };

    std::fs::create_dir_all(&params.output_dir)?;
    let reconstructor = ComponentReconstructor::new(&eigen, &moments.means, params.nodata, pool)?;
    let component_paths =
        reconstructor.write_components(source, &params.output_dir, params.chunk_block_size)?;

    if params.build_pyramids {
        build_pyramids_for(&component_paths);
    }

    let stats = PcaStats::from_eigen(&eigen, params.estimator, moments.valid_pixels);
    stats.to_json_file(&params.output_dir.join(STATS_FILE_NAME))?;

    log::info!("PCA finished: {} components", component_paths.len());
    Ok(PcaOutcome::Completed {
        component_paths,
        stats,
    })
}
