use crate::types::{PcaError, PcaResult};
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Number of concurrent `gdaladdo` processes
const PYRAMID_WORKERS: usize = 2;

/// Build overview pyramids for a raster with the external `gdaladdo` tool
pub fn build_pyramids(path: &Path) -> PcaResult<()> {
    log::debug!("Building pyramids for {}", path.display());

    let status = Command::new("gdaladdo")
        .args(["--config", "BIGTIFF_OVERVIEW", "YES"])
        .arg(path)
        .status()
        .map_err(|e| PcaError::ExternalTool(format!("Failed to run gdaladdo: {}", e)))?;

    if !status.success() {
        return Err(PcaError::ExternalTool(format!(
            "gdaladdo exited with {} for {}",
            status,
            path.display()
        )));
    }
    Ok(())
}

/// Build pyramids for every output file.
///
/// Overviews only speed up display, so failures are logged and dropped.
pub fn build_pyramids_for(paths: &[PathBuf]) {
    let pool = match rayon::ThreadPoolBuilder::new()
        .num_threads(PYRAMID_WORKERS)
        .build()
    {
        Ok(pool) => pool,
        Err(e) => {
            log::warn!("Skipping pyramids, could not start workers: {}", e);
            return;
        }
    };

    pool.install(|| {
        paths.par_iter().for_each(|path| {
            if let Err(e) = build_pyramids(path) {
                log::warn!("Pyramids not built for {}: {}", path.display(), e);
            }
        });
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pyramid_failure_is_not_fatal() {
        // Whether or not gdaladdo is installed, a missing file must not panic
        let missing = PathBuf::from("/nonexistent/dir/pc_1.tif");
        build_pyramids_for(&[missing.clone()]);
        assert!(build_pyramids(&missing).is_err());
    }
}
