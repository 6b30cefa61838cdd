use crate::core::eigen::EigenResult;
use crate::io::raster::RasterBandReader;
use crate::io::stack::RowChunks;
use crate::types::{BlockWindow, EstimatorKind, Nodata, PcaResult};
use chrono::{DateTime, Utc};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Summary of a PCA run returned alongside the component files.
///
/// Every field is optional: components loaded from disk instead of computed
/// carry no eigen information, and consumers show a placeholder instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PcaStats {
    pub eigenvalues: Option<Vec<f64>>,
    pub eigenvalue_percentages: Option<Vec<f64>>,
    pub eigenvectors: Option<Array2<f64>>,
    pub estimator: Option<EstimatorKind>,
    pub valid_pixels: Option<usize>,
    pub generated_at: DateTime<Utc>,
}

impl PcaStats {
    /// Package the decomposition of a finished run
    pub fn from_eigen(eigen: &EigenResult, estimator: EstimatorKind, valid_pixels: usize) -> Self {
        Self {
            eigenvalues: Some(eigen.eigenvalues.clone()),
            eigenvalue_percentages: Some(eigen.eigenvalue_percentages.clone()),
            eigenvectors: Some(eigen.eigenvectors.clone()),
            estimator: Some(estimator),
            valid_pixels: Some(valid_pixels),
            generated_at: Utc::now(),
        }
    }

    /// Stats for components that were loaded rather than computed
    pub fn external() -> Self {
        Self {
            eigenvalues: None,
            eigenvalue_percentages: None,
            eigenvectors: None,
            estimator: None,
            valid_pixels: None,
            generated_at: Utc::now(),
        }
    }

    /// Eigenvalue of component `pc_id` (1-based)
    pub fn eigenvalue(&self, pc_id: usize) -> Option<f64> {
        let idx = pc_id.checked_sub(1)?;
        self.eigenvalues.as_ref()?.get(idx).copied()
    }

    /// Header line for component `pc_id`, e.g. `Eigenvalue: 2.31 (57.75%)`
    pub fn eigenvalue_summary(&self, pc_id: usize) -> String {
        let idx = pc_id.wrapping_sub(1);
        let percentage = self
            .eigenvalue_percentages
            .as_ref()
            .and_then(|p| p.get(idx).copied());
        match (self.eigenvalue(pc_id), percentage) {
            (Some(value), Some(pct)) => {
                format!("Eigenvalue: {} ({}%)", round2(value), round2(pct))
            }
            (Some(value), None) => format!("Eigenvalue: {}", round2(value)),
            _ => "Eigenvalue: --".to_string(),
        }
    }

    pub fn to_json_file(&self, path: &Path) -> PcaResult<()> {
        let file = std::fs::File::create(path)?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }

    pub fn from_json_file(path: &Path) -> PcaResult<Self> {
        let file = std::fs::File::open(path)?;
        Ok(serde_json::from_reader(file)?)
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Descriptive statistics of a component or an AOI sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ComponentStatistics {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub std: f64,
    pub p25: f64,
    pub p50: f64,
    pub p75: f64,
}

impl ComponentStatistics {
    /// Statistics over `values`, ignoring NaN. `None` for an empty sample.
    pub fn from_values(mut values: Vec<f64>) -> Option<Self> {
        values.retain(|v| !v.is_nan());
        if values.is_empty() {
            return None;
        }
        values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;

        Some(Self {
            count: values.len(),
            min: values[0],
            max: values[values.len() - 1],
            std: variance.sqrt(),
            p25: percentile_sorted(&values, 25.0),
            p50: percentile_sorted(&values, 50.0),
            p75: percentile_sorted(&values, 75.0),
        })
    }

    /// Statistics of a component raster, excluding its nodata pixels
    pub fn from_component_raster<P: AsRef<Path>>(
        path: P,
        nodata: Option<Nodata>,
        chunk_block_size: usize,
    ) -> PcaResult<Option<Self>> {
        let reader = RasterBandReader::open(path)?;
        let geo = reader.geo_metadata().clone();
        let mut values = Vec::with_capacity(geo.width * geo.height);

        for (row_off, n_rows) in RowChunks::new((geo.height, geo.width), chunk_block_size) {
            let block = reader.read_block(1, BlockWindow::rows(row_off, n_rows, geo.width))?;
            values.extend(
                block
                    .iter()
                    .copied()
                    .filter(|&v| !nodata.map_or(false, |n| n.matches(v))),
            );
        }
        reader.close();

        Ok(Self::from_values(values))
    }
}

/// Linear interpolation between closest ranks of a sorted, non-empty slice
fn percentile_sorted(sorted: &[f64], q: f64) -> f64 {
    let rank = q / 100.0 * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let weight = rank - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * weight
}
