//! pca4cd: Principal Components Analysis for Change Detection
//!
//! Computes principal components over one or two co-registered multi-band
//! rasters without loading them fully into memory, writes one GeoTIFF per
//! component and thresholds components into binary change layers that can be
//! merged by union or intersection.

pub mod types;
pub mod io;
pub mod core;
pub mod session;

// Re-export main types and functions for easier access
pub use types::{
    parse_nodata, Band, BlockWindow, ComponentImage, DetectionImage, EstimatorKind, GeoMetadata,
    GeoTransform, Nodata, PcaError, PcaResult, ValidityMask,
};

pub use io::{BandSource, MemoryStack, RasterBandReader, RasterStack};
pub use crate::core::{
    run_pca, run_pca_on, ComponentAnalysis, ComponentStatistics, DetectionRange, DetectionState,
    EigenDecomposer, EigenResult, MergeMethod, PcaOutcome, PcaParams, PcaStats,
};
pub use session::PcaSession;

#[cfg(feature = "python")]
mod python {
    use super::*;
    use numpy::ToPyArray;
    use pyo3::exceptions::{PyRuntimeError, PyValueError};
    use pyo3::prelude::*;
    use pyo3::types::PyDict;
    use std::path::{Path, PathBuf};

    fn to_py_err(e: PcaError) -> PyErr {
        match e {
            PcaError::Input(_) | PcaError::InvalidArgument(_) => {
                PyErr::new::<PyValueError, _>(format!("{}: {}", e.category(), e))
            }
            _ => PyErr::new::<PyRuntimeError, _>(format!("{}: {}", e.category(), e)),
        }
    }

    fn path_strings(paths: &[PathBuf]) -> Vec<String> {
        paths.iter().map(|p| p.display().to_string()).collect()
    }

    /// Run the PCA. Returns `(component_files, stats)` or `(False, False)`
    /// when no valid pixels remain after masking.
    #[pyfunction]
    #[pyo3(signature = (
        first_raster,
        second_raster,
        n_pc,
        estimator,
        output_dir,
        n_workers,
        block_size = crate::io::DEFAULT_CHUNK_BLOCK_SIZE,
        nodata = None,
        build_pyramids = true
    ))]
    #[allow(clippy::too_many_arguments)]
    fn pca(
        py: Python,
        first_raster: String,
        second_raster: Option<String>,
        n_pc: usize,
        estimator: &str,
        output_dir: String,
        n_workers: usize,
        block_size: usize,
        nodata: Option<String>,
        build_pyramids: bool,
    ) -> PyResult<PyObject> {
        let mut params = PcaParams::new(&first_raster, &output_dir, n_pc);
        params.second_raster = second_raster.map(PathBuf::from);
        params.estimator = estimator.parse().map_err(to_py_err)?;
        params.worker_count = n_workers;
        params.chunk_block_size = block_size;
        params.nodata = match nodata {
            Some(s) => parse_nodata(&s).map_err(to_py_err)?,
            None => None,
        };
        params.build_pyramids = build_pyramids;

        let outcome = py.allow_threads(|| run_pca(&params)).map_err(to_py_err)?;
        match outcome {
            PcaOutcome::Completed {
                component_paths,
                stats,
            } => {
                let dict = PyDict::new(py);
                dict.set_item("eigenvals", stats.eigenvalues.clone())?;
                dict.set_item("eigenvals_%", stats.eigenvalue_percentages.clone())?;
                match &stats.eigenvectors {
                    Some(vectors) => dict.set_item("eigenvectors", vectors.to_pyarray(py))?,
                    None => dict.set_item("eigenvectors", py.None())?,
                }
                Ok((path_strings(&component_paths), dict).into_py(py))
            }
            PcaOutcome::NoValidData => Ok((false, false).into_py(py)),
        }
    }

    /// Threshold one component raster into a 1 / 0 detection layer
    #[pyfunction]
    #[pyo3(signature = (component_path, output_path, range_from, range_to, nodata = None))]
    fn detection_layer(
        py: Python,
        component_path: String,
        output_path: String,
        range_from: f64,
        range_to: f64,
        nodata: Option<String>,
    ) -> PyResult<String> {
        let nodata = match nodata {
            Some(s) => parse_nodata(&s).map_err(to_py_err)?,
            None => None,
        };
        let range = DetectionRange::new(range_from, range_to).map_err(to_py_err)?;

        let mut analysis = ComponentAnalysis::new(1, &component_path, nodata);
        analysis.set_range(range);
        let path = py
            .allow_threads(|| analysis.generate(Path::new(&output_path)))
            .map_err(to_py_err)?;
        Ok(path.display().to_string())
    }

    /// Merge detection layers with "Union" or "Intersection"
    #[pyfunction]
    fn merge_detection_layers(
        py: Python,
        inputs: Vec<String>,
        method: &str,
        output_path: String,
    ) -> PyResult<String> {
        let method: MergeMethod = method.parse().map_err(to_py_err)?;
        let path = py
            .allow_threads(|| {
                crate::core::merge_detection_layers(
                    &inputs,
                    method,
                    Path::new(&output_path),
                    crate::io::DEFAULT_CHUNK_BLOCK_SIZE,
                )
            })
            .map_err(to_py_err)?;
        Ok(path.display().to_string())
    }

    /// Python module definition
    #[pymodule]
    fn _core(_py: Python, m: &PyModule) -> PyResult<()> {
        m.add_function(wrap_pyfunction!(pca, m)?)?;
        m.add_function(wrap_pyfunction!(detection_layer, m)?)?;
        m.add_function(wrap_pyfunction!(merge_detection_layers, m)?)?;
        Ok(())
    }
}
