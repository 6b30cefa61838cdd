use crate::io::raster::RasterBandReader;
use crate::types::{Band, BlockWindow, GeoMetadata, PcaError, PcaResult};
use ndarray::s;
use std::path::Path;

/// Band-wise view over the pixels fed into a PCA run.
///
/// Bands are addressed with 0-based indices across the whole stack. Reads are
/// always full-width row strips so chunked passes stay aligned across bands.
pub trait BandSource {
    /// Total number of bands in the stack
    fn band_count(&self) -> usize;

    /// (rows, cols) shared by every band
    fn shape(&self) -> (usize, usize);

    /// Read `n_rows` rows starting at `row_off` from band `band` (0-based)
    fn read_rows(&self, band: usize, row_off: usize, n_rows: usize) -> PcaResult<Band>;

    /// Georeferencing to copy onto outputs, if the source has any
    fn geo_metadata(&self) -> Option<GeoMetadata>;

    /// Read the same row strip from every band
    fn read_strip(&self, row_off: usize, n_rows: usize) -> PcaResult<Vec<Band>> {
        (0..self.band_count())
            .map(|band| self.read_rows(band, row_off, n_rows))
            .collect()
    }
}

/// One or two rasters concatenated band-wise.
///
/// Band `j` maps to band `j + 1` of the first raster when `j` is below its
/// band count, otherwise to band `j - count(first) + 1` of the second raster.
pub struct RasterStack {
    first: RasterBandReader,
    second: Option<RasterBandReader>,
}

impl RasterStack {
    /// Open the rasters and check they share a grid before stacking them
    pub fn open<P: AsRef<Path>>(first: P, second: Option<P>) -> PcaResult<Self> {
        let first = RasterBandReader::open(first)?;
        let second = match second {
            Some(path) => {
                let reader = RasterBandReader::open(path)?;
                first.geo_metadata().check_same_grid(reader.geo_metadata())?;
                Some(reader)
            }
            None => None,
        };

        log::info!(
            "Raster stack: {} bands ({}x{})",
            first.band_count() + second.as_ref().map_or(0, |r| r.band_count()),
            first.geo_metadata().width,
            first.geo_metadata().height
        );

        Ok(Self { first, second })
    }

    pub fn first(&self) -> &RasterBandReader {
        &self.first
    }

    pub fn second(&self) -> Option<&RasterBandReader> {
        self.second.as_ref()
    }

    /// Resolve a 0-based stack index into (reader, 1-based band index)
    pub fn locate(&self, band: usize) -> PcaResult<(&RasterBandReader, usize)> {
        let first_count = self.first.band_count();
        if band < first_count {
            return Ok((&self.first, band + 1));
        }
        match &self.second {
            Some(second) if band - first_count < second.band_count() => {
                Ok((second, band - first_count + 1))
            }
            _ => Err(PcaError::InvalidArgument(format!(
                "Band index {} out of range for a stack of {} bands",
                band,
                self.band_count()
            ))),
        }
    }

    /// Release both dataset handles
    pub fn close(self) {
        self.first.close();
        if let Some(second) = self.second {
            second.close();
        }
    }
}

impl BandSource for RasterStack {
    fn band_count(&self) -> usize {
        self.first.band_count() + self.second.as_ref().map_or(0, |r| r.band_count())
    }

    fn shape(&self) -> (usize, usize) {
        let geo = self.first.geo_metadata();
        (geo.height, geo.width)
    }

    fn read_rows(&self, band: usize, row_off: usize, n_rows: usize) -> PcaResult<Band> {
        let (reader, index) = self.locate(band)?;
        let (_, cols) = self.shape();
        reader.read_block(index, BlockWindow::rows(row_off, n_rows, cols))
    }

    fn geo_metadata(&self) -> Option<GeoMetadata> {
        Some(self.first.geo_metadata().clone())
    }
}

/// Bands already held in memory, e.g. handed over from a host application
#[derive(Debug, Clone)]
pub struct MemoryStack {
    bands: Vec<Band>,
    geo: Option<GeoMetadata>,
}

impl MemoryStack {
    pub fn new(bands: Vec<Band>) -> PcaResult<Self> {
        let first_shape = match bands.first() {
            Some(band) => band.dim(),
            None => {
                return Err(PcaError::Input("Band stack is empty".to_string()));
            }
        };
        if let Some(pos) = bands.iter().position(|b| b.dim() != first_shape) {
            return Err(PcaError::Input(format!(
                "Band {} has shape {:?}, expected {:?}",
                pos,
                bands[pos].dim(),
                first_shape
            )));
        }
        Ok(Self { bands, geo: None })
    }

    pub fn with_geo_metadata(mut self, geo: GeoMetadata) -> Self {
        self.geo = Some(geo);
        self
    }

    pub fn bands(&self) -> &[Band] {
        &self.bands
    }
}

impl BandSource for MemoryStack {
    fn band_count(&self) -> usize {
        self.bands.len()
    }

    fn shape(&self) -> (usize, usize) {
        self.bands[0].dim()
    }

    fn read_rows(&self, band: usize, row_off: usize, n_rows: usize) -> PcaResult<Band> {
        let data = self.bands.get(band).ok_or_else(|| {
            PcaError::InvalidArgument(format!(
                "Band index {} out of range for a stack of {} bands",
                band,
                self.bands.len()
            ))
        })?;
        let (rows, _) = data.dim();
        if row_off + n_rows > rows {
            return Err(PcaError::InvalidArgument(format!(
                "Rows {}..{} exceed band height {}",
                row_off,
                row_off + n_rows,
                rows
            )));
        }
        Ok(data.slice(s![row_off..row_off + n_rows, ..]).to_owned())
    }

    fn geo_metadata(&self) -> Option<GeoMetadata> {
        self.geo.clone()
    }
}

/// Default side of a square chunk, in pixels
pub const DEFAULT_CHUNK_BLOCK_SIZE: usize = 1000;

/// Splits a raster into full-width row strips of roughly `block_size²` pixels
#[derive(Debug, Clone, Copy)]
pub struct RowChunks {
    rows: usize,
    chunk_rows: usize,
    next: usize,
}

impl RowChunks {
    pub fn new(shape: (usize, usize), block_size: usize) -> Self {
        let (rows, cols) = shape;
        let pixels_per_chunk = block_size.saturating_mul(block_size).max(1);
        let chunk_rows = (pixels_per_chunk / cols.max(1)).max(1);
        Self { rows, chunk_rows, next: 0 }
    }

    pub fn chunk_rows(&self) -> usize {
        self.chunk_rows
    }
}

impl Iterator for RowChunks {
    /// (row offset, number of rows)
    type Item = (usize, usize);

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.rows {
            return None;
        }
        let row_off = self.next;
        let n_rows = self.chunk_rows.min(self.rows - row_off);
        self.next += n_rows;
        Some((row_off, n_rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_row_chunks_cover_raster() {
        let chunks: Vec<_> = RowChunks::new((10, 4), 3).collect();
        // 9 pixels per chunk over 4 columns -> 2 rows per strip
        assert_eq!(chunks, vec![(0, 2), (2, 2), (4, 2), (6, 2), (8, 2)]);

        let chunks: Vec<_> = RowChunks::new((5, 100), 2).collect();
        assert_eq!(chunks.len(), 5);
        assert!(chunks.iter().all(|&(_, n)| n == 1));

        let chunks: Vec<_> = RowChunks::new((7, 3), 1000).collect();
        assert_eq!(chunks, vec![(0, 7)]);
    }

    #[test]
    fn test_memory_stack_reads() {
        let stack = MemoryStack::new(vec![
            array![[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]],
            array![[7.0, 8.0], [9.0, 10.0], [11.0, 12.0]],
        ])
        .unwrap();

        assert_eq!(stack.band_count(), 2);
        assert_eq!(stack.shape(), (3, 2));

        let strip = stack.read_rows(1, 1, 2).unwrap();
        assert_eq!(strip, array![[9.0, 10.0], [11.0, 12.0]]);

        assert!(stack.read_rows(2, 0, 1).is_err());
        assert!(stack.read_rows(0, 2, 2).is_err());

        let all = stack.read_strip(0, 1).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0], array![[1.0, 2.0]]);
    }

    #[test]
    fn test_memory_stack_rejects_mismatched_bands() {
        let result = MemoryStack::new(vec![
            array![[1.0, 2.0]],
            array![[1.0], [2.0]],
        ]);
        assert!(matches!(result, Err(PcaError::Input(_))));
        assert!(MemoryStack::new(Vec::new()).is_err());
    }
}
