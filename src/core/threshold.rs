use crate::io::raster::{create_detection_raster, write_rows, RasterBandReader};
use crate::io::stack::{RowChunks, DEFAULT_CHUNK_BLOCK_SIZE};
use crate::types::{BlockWindow, DetectionImage, Nodata, PcaError, PcaResult};
use ndarray::{ArrayView2, Zip};
use rayon::prelude::*;
use std::path::{Path, PathBuf};

/// Closed interval `[from, to]` of component values classified as change
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionRange {
    pub from: f64,
    pub to: f64,
}

impl DetectionRange {
    pub fn new(from: f64, to: f64) -> PcaResult<Self> {
        if from.is_nan() || to.is_nan() {
            return Err(PcaError::InvalidArgument(
                "Detection range bounds must be numbers".to_string(),
            ));
        }
        if from > to {
            return Err(PcaError::InvalidArgument(format!(
                "Detection range is empty: from {} > to {}",
                from, to
            )));
        }
        Ok(Self { from, to })
    }

    /// Range covering an AOI sample, widened to three decimals.
    ///
    /// Zeros, nodata and NaN are dropped first; `None` when nothing is left.
    pub fn from_samples<I>(values: I, nodata: Option<Nodata>) -> Option<Self>
    where
        I: IntoIterator<Item = f64>,
    {
        let (min, max) = values
            .into_iter()
            .filter(|&v| is_classifiable(v, nodata))
            .fold(None, |acc: Option<(f64, f64)>, v| match acc {
                Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
                None => Some((v, v)),
            })?;

        Some(Self {
            from: (min * 1000.0).floor() / 1000.0,
            to: (max * 1000.0).ceil() / 1000.0,
        })
    }

    #[inline]
    pub fn contains(&self, value: f64) -> bool {
        value >= self.from && value <= self.to
    }
}

/// Background, nodata and NaN pixels never count as change
#[inline]
fn is_classifiable(value: f64, nodata: Option<Nodata>) -> bool {
    !value.is_nan() && value != 0.0 && !nodata.map_or(false, |n| n.matches(value))
}

/// Classify a block of component values into 1 (change) / 0 (no change)
pub fn classify_block(
    block: &ArrayView2<f64>,
    range: DetectionRange,
    nodata: Option<Nodata>,
) -> DetectionImage {
    let mut detection = DetectionImage::zeros(block.dim());
    Zip::from(&mut detection).and(block).par_for_each(|d, &v| {
        if is_classifiable(v, nodata) && range.contains(v) {
            *d = 1;
        }
    });
    detection
}

/// Classification progress for one component
#[derive(Debug, Clone, PartialEq)]
pub enum DetectionState {
    NoRange,
    RangeSet(DetectionRange),
    Ready { range: DetectionRange, path: PathBuf },
}

/// Thresholds one principal component raster into a detection layer
#[derive(Debug, Clone)]
pub struct ComponentAnalysis {
    pc_id: usize,
    component_path: PathBuf,
    nodata: Option<Nodata>,
    chunk_block_size: usize,
    state: DetectionState,
}

impl ComponentAnalysis {
    pub fn new<P: AsRef<Path>>(pc_id: usize, component_path: P, nodata: Option<Nodata>) -> Self {
        Self {
            pc_id,
            component_path: component_path.as_ref().to_path_buf(),
            nodata,
            chunk_block_size: DEFAULT_CHUNK_BLOCK_SIZE,
            state: DetectionState::NoRange,
        }
    }

    pub fn with_chunk_block_size(mut self, chunk_block_size: usize) -> Self {
        self.chunk_block_size = chunk_block_size.max(1);
        self
    }

    pub fn pc_id(&self) -> usize {
        self.pc_id
    }

    pub fn chunk_block_size(&self) -> usize {
        self.chunk_block_size
    }

    pub fn component_path(&self) -> &Path {
        &self.component_path
    }

    pub fn state(&self) -> &DetectionState {
        &self.state
    }

    pub fn range(&self) -> Option<DetectionRange> {
        match &self.state {
            DetectionState::NoRange => None,
            DetectionState::RangeSet(range) | DetectionState::Ready { range, .. } => Some(*range),
        }
    }

    /// Path of the last generated detection layer
    pub fn detection_path(&self) -> Option<&Path> {
        match &self.state {
            DetectionState::Ready { path, .. } => Some(path),
            _ => None,
        }
    }

    /// Set a new range; any previous detection layer becomes stale
    pub fn set_range(&mut self, range: DetectionRange) {
        log::debug!("PC{} detection range set to [{}, {}]", self.pc_id, range.from, range.to);
        self.state = DetectionState::RangeSet(range);
    }

    /// Sample the component inside a pixel window and derive the range from it
    pub fn set_range_from_aoi(&mut self, window: BlockWindow) -> PcaResult<Option<DetectionRange>> {
        let values = self.sample_window(window)?;
        let range = DetectionRange::from_samples(values, self.nodata);
        if let Some(range) = range {
            self.set_range(range);
        } else {
            log::warn!("PC{}: no valid pixels inside the AOI", self.pc_id);
        }
        Ok(range)
    }

    /// Component values inside a pixel window
    pub fn sample_window(&self, window: BlockWindow) -> PcaResult<Vec<f64>> {
        let reader = RasterBandReader::open(&self.component_path)?;
        let block = reader.read_block(1, window)?;
        reader.close();
        Ok(block.iter().copied().collect())
    }

    /// Classify the component with the current range into `output_path`,
    /// overwriting any earlier layer.
    ///
    /// The previous layer stops being current as soon as classification starts;
    /// on failure the half-written output is removed and the state stays
    /// `RangeSet`.
    pub fn generate(&mut self, output_path: &Path) -> PcaResult<PathBuf> {
        let range = self.range().ok_or_else(|| {
            PcaError::InvalidArgument(format!("PC{}: no detection range set", self.pc_id))
        })?;
        self.state = DetectionState::RangeSet(range);

        log::info!(
            "Generating detection layer for PC{} in [{}, {}]",
            self.pc_id,
            range.from,
            range.to
        );

        let reader = RasterBandReader::open(&self.component_path)?;
        let written = self.write_detection(&reader, range, output_path);
        reader.close();

        if let Err(e) = written {
            log::warn!("PC{} detection failed, removing partial output: {}", self.pc_id, e);
            if output_path.exists() {
                if let Err(rm_err) = std::fs::remove_file(output_path) {
                    log::warn!("Could not remove {}: {}", output_path.display(), rm_err);
                }
            }
            return Err(e);
        }

        self.state = DetectionState::Ready {
            range,
            path: output_path.to_path_buf(),
        };
        Ok(output_path.to_path_buf())
    }

    fn write_detection(
        &self,
        reader: &RasterBandReader,
        range: DetectionRange,
        output_path: &Path,
    ) -> PcaResult<()> {
        let geo = reader.geo_metadata();
        let dataset = create_detection_raster(output_path, geo)?;
        for (row_off, n_rows) in RowChunks::new((geo.height, geo.width), self.chunk_block_size) {
            let block = reader.read_block(1, BlockWindow::rows(row_off, n_rows, geo.width))?;
            let detection = classify_block(&block.view(), range, self.nodata);
            write_rows(&dataset, row_off, &detection)?;
        }
        Ok(())
    }
}

/// Default file name of the detection layer of component `pc_id`
pub fn detection_path(out_dir: &Path, pc_id: usize) -> PathBuf {
    out_dir.join(format!("pc_{}_detection.tif", pc_id))
}

/// Classify every component of a run in parallel with one range each
pub fn generate_all(
    analyses: &mut [ComponentAnalysis],
    output_dir: &Path,
) -> Vec<PcaResult<PathBuf>> {
    analyses
        .par_iter_mut()
        .map(|analysis| {
            let path = detection_path(output_dir, analysis.pc_id());
            analysis.generate(&path)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_closed_interval_boundaries() {
        let block = array![[-1.0, -0.5, 0.25], [0.5, 0.75, 1.0]];
        let range = DetectionRange::new(-0.5, 0.5).unwrap();
        let detection = classify_block(&block.view(), range, None);
        assert_eq!(detection, array![[0, 1, 1], [1, 0, 0]]);
    }

    #[test]
    fn test_background_and_nodata_never_change() {
        let block = array![[0.0, -9999.0, f64::NAN, 2.0]];
        let range = DetectionRange::new(-10000.0, 10000.0).unwrap();
        let detection = classify_block(&block.view(), range, Some(Nodata::Value(-9999.0)));
        assert_eq!(detection, array![[0, 0, 0, 1]]);
    }

    #[test]
    fn test_classification_is_deterministic() {
        let block = array![[0.1, 0.2, 0.3], [0.4, 0.5, 0.6]];
        let range = DetectionRange::new(0.2, 0.5).unwrap();
        let first = classify_block(&block.view(), range, None);
        let second = classify_block(&block.view(), range, None);
        assert_eq!(first, second);
    }

    #[test]
    fn test_range_validation() {
        assert!(DetectionRange::new(1.0, 0.0).is_err());
        assert!(DetectionRange::new(f64::NAN, 0.0).is_err());
        assert!(DetectionRange::new(1.0, 1.0).is_ok());
    }

    #[test]
    fn test_range_from_aoi_samples() {
        let range = DetectionRange::from_samples(
            vec![0.0, 1.23456, -0.5, f64::NAN, 2.0001, -9999.0],
            Some(Nodata::Value(-9999.0)),
        )
        .unwrap();
        assert_eq!(range.from, -0.5);
        assert_eq!(range.to, 2.001);

        let widened = DetectionRange::from_samples(vec![0.12345, 0.5], None).unwrap();
        assert_eq!(widened.from, 0.123);

        assert!(DetectionRange::from_samples(vec![0.0, f64::NAN], None).is_none());
    }

    #[test]
    fn test_state_machine() {
        let mut analysis = ComponentAnalysis::new(1, "/tmp/pc_1.tif", None);
        assert_eq!(analysis.state(), &DetectionState::NoRange);
        assert!(analysis.range().is_none());
        assert!(matches!(
            analysis.generate(Path::new("/tmp/pc_1_detection.tif")),
            Err(PcaError::InvalidArgument(_))
        ));

        let range = DetectionRange::new(-1.0, 1.0).unwrap();
        analysis.set_range(range);
        assert_eq!(analysis.state(), &DetectionState::RangeSet(range));
        assert!(analysis.detection_path().is_none());
        assert_eq!(analysis.chunk_block_size(), DEFAULT_CHUNK_BLOCK_SIZE);
    }
}
