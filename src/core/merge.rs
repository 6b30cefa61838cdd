use crate::io::raster::{create_detection_raster, write_rows, RasterBandReader};
use crate::io::stack::RowChunks;
use crate::types::{BlockWindow, DetectionImage, PcaError, PcaResult};
use ndarray::{Array2, Zip};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// How several detection layers are combined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergeMethod {
    /// Change where any layer marks change
    Union,
    /// Change only where every layer marks change
    Intersection,
}

impl fmt::Display for MergeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergeMethod::Union => write!(f, "Union"),
            MergeMethod::Intersection => write!(f, "Intersection"),
        }
    }
}

impl FromStr for MergeMethod {
    type Err = PcaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "union" => Ok(MergeMethod::Union),
            "intersection" => Ok(MergeMethod::Intersection),
            _ => Err(PcaError::InvalidArgument(format!(
                "Invalid merge method: '{}' (expected Union or Intersection)",
                s
            ))),
        }
    }
}

/// Per-pixel change flag of one detection block.
///
/// Only the value 1 counts as change, and never when 1 is the declared nodata.
fn change_flags(block: &DetectionImage, nodata: Option<f64>) -> Array2<bool> {
    let one_is_nodata = nodata == Some(1.0);
    block.mapv(|v| v == 1 && !one_is_nodata)
}

/// Combine aligned detection blocks pixel by pixel
pub fn merge_blocks(blocks: &[Array2<bool>], method: MergeMethod) -> PcaResult<DetectionImage> {
    let shape = match blocks.first() {
        Some(block) => block.dim(),
        None => {
            return Err(PcaError::InvalidArgument(
                "No detection layers to merge".to_string(),
            ))
        }
    };
    if blocks.iter().any(|b| b.dim() != shape) {
        return Err(PcaError::Input(
            "Detection layers do not share the same grid".to_string(),
        ));
    }

    let mut merged = match method {
        MergeMethod::Union => Array2::from_elem(shape, false),
        MergeMethod::Intersection => Array2::from_elem(shape, true),
    };
    for block in blocks {
        Zip::from(&mut merged).and(block).for_each(|m, &change| {
            *m = match method {
                MergeMethod::Union => *m || change,
                MergeMethod::Intersection => *m && change,
            };
        });
    }

    Ok(merged.mapv(u8::from))
}

/// Merge detection rasters into `output_path` with the same 1 / 0 semantics
pub fn merge_detection_layers<P: AsRef<Path>>(
    inputs: &[P],
    method: MergeMethod,
    output_path: &Path,
    chunk_block_size: usize,
) -> PcaResult<PathBuf> {
    if inputs.is_empty() {
        return Err(PcaError::InvalidArgument(
            "No detection layers to merge".to_string(),
        ));
    }
    log::info!(
        "Merging {} detection layers ({}) into {}",
        inputs.len(),
        method,
        output_path.display()
    );

    let readers: Vec<RasterBandReader> = inputs
        .iter()
        .map(RasterBandReader::open)
        .collect::<PcaResult<_>>()?;
    let geo = readers[0].geo_metadata().clone();
    for reader in &readers[1..] {
        geo.check_same_grid(reader.geo_metadata())?;
    }
    let nodata: Vec<Option<f64>> = readers
        .iter()
        .map(|r| r.band_nodata(1))
        .collect::<PcaResult<_>>()?;

    {
        let dataset = create_detection_raster(output_path, &geo)?;
        for (row_off, n_rows) in RowChunks::new((geo.height, geo.width), chunk_block_size) {
            let window = BlockWindow::rows(row_off, n_rows, geo.width);
            let flags: Vec<Array2<bool>> = readers
                .iter()
                .zip(&nodata)
                .map(|(reader, &nd)| {
                    reader
                        .read_block_as::<u8>(1, window)
                        .map(|block| change_flags(&block, nd))
                })
                .collect::<PcaResult<_>>()?;
            let merged = merge_blocks(&flags, method)?;
            write_rows(&dataset, row_off, &merged)?;
        }
    }

    for reader in readers {
        reader.close();
    }
    Ok(output_path.to_path_buf())
}
