//! Analysis session: private workspace, single-flight PCA runs and per-component
//! detection state.

use crate::core::merge::{merge_detection_layers, MergeMethod};
use crate::core::pca::{run_pca, PcaOutcome, PcaParams};
use crate::core::stats::PcaStats;
use crate::core::threshold::{detection_path, ComponentAnalysis};
use crate::io::stack::DEFAULT_CHUNK_BLOCK_SIZE;
use crate::types::{Nodata, PcaError, PcaResult};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use tempfile::TempDir;

/// Clears the busy flag when a run ends, including on panic
struct BusyGuard(Arc<AtomicBool>);

impl BusyGuard {
    fn acquire(flag: &Arc<AtomicBool>) -> PcaResult<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| {
                PcaError::InvalidArgument("A PCA run is already in progress".to_string())
            })?;
        Ok(Self(flag.clone()))
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// One change-detection session.
///
/// Owns a temporary workspace that is removed on [`PcaSession::close`] or drop.
pub struct PcaSession {
    workspace: TempDir,
    busy: Arc<AtomicBool>,
    stats: Option<PcaStats>,
    components: Vec<ComponentAnalysis>,
    /// Chunk size of the last run, reused for thresholding and merging
    chunk_block_size: usize,
}

impl PcaSession {
    pub fn new() -> PcaResult<Self> {
        let workspace = tempfile::Builder::new().prefix("pca4cd_").tempdir()?;
        log::info!("Session workspace: {}", workspace.path().display());
        Ok(Self {
            workspace,
            busy: Arc::new(AtomicBool::new(false)),
            stats: None,
            components: Vec::new(),
            chunk_block_size: DEFAULT_CHUNK_BLOCK_SIZE,
        })
    }

    pub fn workspace(&self) -> &Path {
        self.workspace.path()
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Parameters writing into the session workspace
    pub fn params<P: AsRef<Path>>(&self, first_raster: P, n_components: usize) -> PcaParams {
        PcaParams::new(first_raster, self.workspace(), n_components)
    }

    /// Run the PCA on a background thread; the result arrives on the channel.
    ///
    /// Fails immediately if another run of this session is still in flight.
    pub fn spawn_run(&self, params: PcaParams) -> PcaResult<Receiver<PcaResult<PcaOutcome>>> {
        let guard = BusyGuard::acquire(&self.busy)?;
        let (tx, rx) = mpsc::channel();

        std::thread::Builder::new()
            .name("pca-run".to_string())
            .spawn(move || {
                let result = run_pca(&params);
                drop(guard);
                if tx.send(result).is_err() {
                    log::debug!("PCA result dropped, receiver is gone");
                }
            })
            .map_err(|e| PcaError::Compute(format!("Failed to start PCA thread: {}", e)))?;

        Ok(rx)
    }

    /// Run the PCA and make its components available for thresholding
    pub fn run_pca(&mut self, params: PcaParams) -> PcaResult<PcaOutcome> {
        let nodata = params.nodata;
        let chunk_block_size = params.chunk_block_size;
        let rx = self.spawn_run(params)?;
        let outcome = rx
            .recv()
            .map_err(|_| PcaError::Compute("PCA thread ended without a result".to_string()))??;

        if let PcaOutcome::Completed {
            component_paths,
            stats,
        } = &outcome
        {
            self.chunk_block_size = chunk_block_size;
            self.set_components(component_paths, nodata);
            self.stats = Some(stats.clone());
        }
        Ok(outcome)
    }

    /// Use existing component rasters instead of computing them
    pub fn load_components<P: AsRef<Path>>(&mut self, paths: &[P], nodata: Option<Nodata>) {
        self.set_components(paths, nodata);
        self.stats = Some(PcaStats::external());
    }

    fn set_components<P: AsRef<Path>>(
        &mut self,
        paths: &[P],
        nodata: Option<Nodata>,
    ) {
        let chunk_block_size = self.chunk_block_size;
        self.components = paths
            .iter()
            .enumerate()
            .map(|(i, path)| {
                ComponentAnalysis::new(i + 1, path, nodata).with_chunk_block_size(chunk_block_size)
            })
            .collect();
    }

    pub fn stats(&self) -> Option<&PcaStats> {
        self.stats.as_ref()
    }

    pub fn components(&self) -> &[ComponentAnalysis] {
        &self.components
    }

    pub fn component_analysis(&mut self, pc_id: usize) -> Option<&mut ComponentAnalysis> {
        self.components.iter_mut().find(|c| c.pc_id() == pc_id)
    }

    /// Workspace path of the detection layer of component `pc_id`
    pub fn detection_path(&self, pc_id: usize) -> PathBuf {
        detection_path(self.workspace(), pc_id)
    }

    /// Classify component `pc_id` with its current range into the workspace
    pub fn generate_detection(&mut self, pc_id: usize) -> PcaResult<PathBuf> {
        let path = self.detection_path(pc_id);
        let analysis = self.component_analysis(pc_id).ok_or_else(|| {
            PcaError::InvalidArgument(format!("No principal component {} in this session", pc_id))
        })?;
        analysis.generate(&path)
    }

    /// Merge every generated detection layer into `output_path`
    pub fn merge_detections(&self, method: MergeMethod, output_path: &Path) -> PcaResult<PathBuf> {
        let layers: Vec<&Path> = self
            .components
            .iter()
            .filter_map(|c| c.detection_path())
            .collect();
        merge_detection_layers(&layers, method, output_path, self.chunk_block_size)
    }

    /// Remove the workspace and everything in it
    pub fn close(self) -> PcaResult<()> {
        log::info!("Closing session workspace {}", self.workspace.path().display());
        self.workspace.close()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workspace_lifecycle() {
        let session = PcaSession::new().unwrap();
        let workspace = session.workspace().to_path_buf();
        assert!(workspace.is_dir());
        assert_eq!(
            session.detection_path(2),
            workspace.join("pc_2_detection.tif")
        );
        assert_eq!(session.params("a.tif", 1).output_dir, workspace);

        session.close().unwrap();
        assert!(!workspace.exists());
    }

    #[test]
    fn test_single_flight_guard() {
        let session = PcaSession::new().unwrap();
        let guard = BusyGuard::acquire(&session.busy).unwrap();
        assert!(session.is_busy());

        let params = session.params("missing.tif", 1);
        assert!(matches!(
            session.spawn_run(params),
            Err(PcaError::InvalidArgument(_))
        ));

        drop(guard);
        assert!(!session.is_busy());
    }

    #[test]
    fn test_failed_run_releases_busy_flag() {
        let mut session = PcaSession::new().unwrap();
        let params = session.params("/nonexistent/a.tif", 1);
        assert!(matches!(session.run_pca(params), Err(PcaError::Input(_))));
        assert!(!session.is_busy());
        assert!(session.components().is_empty());
    }

    #[test]
    fn test_loaded_components_have_no_eigenvalues() {
        let mut session = PcaSession::new().unwrap();
        session.load_components(&["/data/pc_1.tif", "/data/pc_2.tif"], None);
        assert_eq!(session.components().len(), 2);
        assert!(session
            .components()
            .iter()
            .all(|c| c.chunk_block_size() == DEFAULT_CHUNK_BLOCK_SIZE));
        assert_eq!(session.stats().unwrap().eigenvalue_summary(1), "Eigenvalue: --");
        assert!(session.component_analysis(2).is_some());
        assert!(session.component_analysis(3).is_none());
        assert!(session.generate_detection(3).is_err());
    }
}
