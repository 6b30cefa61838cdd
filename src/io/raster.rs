use crate::types::{
    Band, BlockWindow, GeoMetadata, GeoTransform, Nodata, PcaError, PcaResult,
};
use gdal::raster::{Buffer, GdalType, RasterCreationOption};
use gdal::{Dataset, DriverManager};
use ndarray::Array2;
use std::path::{Path, PathBuf};

/// Read-only handle on a georeferenced raster dataset.
///
/// The underlying dataset stays open until the reader is dropped or
/// [`RasterBandReader::close`] is called, so callers should release it as soon
/// as the outputs of a run are written.
pub struct RasterBandReader {
    path: PathBuf,
    dataset: Dataset,
    metadata: GeoMetadata,
    band_count: usize,
}

impl RasterBandReader {
    /// Open a raster; anything GDAL cannot open is reported as an input error
    pub fn open<P: AsRef<Path>>(path: P) -> PcaResult<Self> {
        let path = path.as_ref();
        log::debug!("Opening raster: {}", path.display());

        let dataset = Dataset::open(path).map_err(|e| {
            PcaError::Input(format!("Failed to open raster {}: {}", path.display(), e))
        })?;

        let (width, height) = dataset.raster_size();
        let band_count = dataset.raster_count().max(0) as usize;
        if band_count == 0 {
            return Err(PcaError::Input(format!(
                "Raster {} has no bands",
                path.display()
            )));
        }

        let transform = dataset.geo_transform().ok().map(|gt| GeoTransform::from_gdal(&gt));
        let projection = Some(dataset.projection()).filter(|p| !p.is_empty());

        log::debug!(
            "Raster {}: {}x{} pixels, {} bands",
            path.display(),
            width,
            height,
            band_count
        );

        Ok(Self {
            path: path.to_path_buf(),
            dataset,
            metadata: GeoMetadata {
                transform,
                projection,
                width,
                height,
            },
            band_count,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn band_count(&self) -> usize {
        self.band_count
    }

    pub fn geo_metadata(&self) -> &GeoMetadata {
        &self.metadata
    }

    /// Nodata value declared on a band (1-based index), if any
    pub fn band_nodata(&self, index: usize) -> PcaResult<Option<f64>> {
        let band = self.dataset.rasterband(self.check_index(index)?)?;
        Ok(band.no_data_value())
    }

    /// Read a full band (1-based index) cast to f64
    pub fn read_band(&self, index: usize) -> PcaResult<Band> {
        let window = BlockWindow {
            col_off: 0,
            row_off: 0,
            cols: self.metadata.width,
            rows: self.metadata.height,
        };
        self.read_block(index, window)
    }

    /// Read a window of a band (1-based index) cast to f64
    pub fn read_block(&self, index: usize, window: BlockWindow) -> PcaResult<Band> {
        self.read_block_as::<f64>(index, window)
    }

    /// Read a window of a band (1-based index) as any GDAL pixel type
    pub fn read_block_as<T: GdalType + Copy>(
        &self,
        index: usize,
        window: BlockWindow,
    ) -> PcaResult<Array2<T>> {
        if window.col_off + window.cols > self.metadata.width
            || window.row_off + window.rows > self.metadata.height
        {
            return Err(PcaError::InvalidArgument(format!(
                "Window {:?} exceeds raster size {}x{}",
                window, self.metadata.width, self.metadata.height
            )));
        }

        let band = self.dataset.rasterband(self.check_index(index)?)?;
        let buffer = band.read_as::<T>(
            (window.col_off as isize, window.row_off as isize),
            (window.cols, window.rows),
            (window.cols, window.rows),
            None,
        )?;

        Ok(Array2::from_shape_vec((window.rows, window.cols), buffer.data)?)
    }

    /// Release the dataset handle
    pub fn close(self) {
        log::debug!("Closing raster: {}", self.path.display());
        drop(self.dataset);
    }

    fn check_index(&self, index: usize) -> PcaResult<isize> {
        if index == 0 || index > self.band_count {
            return Err(PcaError::InvalidArgument(format!(
                "Band {} out of range for {} (1..={})",
                index,
                self.path.display(),
                self.band_count
            )));
        }
        Ok(index as isize)
    }
}

fn apply_georeferencing(dataset: &mut Dataset, geo: &GeoMetadata) -> PcaResult<()> {
    if let Some(transform) = &geo.transform {
        dataset.set_geo_transform(&transform.to_gdal())?;
    }
    if let Some(projection) = &geo.projection {
        dataset.set_projection(projection)?;
    }
    Ok(())
}

/// Create a single-band Float32 GeoTIFF georeferenced like `geo`
pub fn create_component_raster<P: AsRef<Path>>(
    path: P,
    geo: &GeoMetadata,
    nodata: Option<Nodata>,
) -> PcaResult<Dataset> {
    let driver = DriverManager::get_driver_by_name("GTiff")?;
    let mut dataset = driver.create_with_band_type::<f32, _>(
        path.as_ref(),
        geo.width as isize,
        geo.height as isize,
        1,
    )?;
    apply_georeferencing(&mut dataset, geo)?;

    if let Some(nodata) = nodata {
        let mut band = dataset.rasterband(1)?;
        band.set_no_data_value(Some(nodata.as_gdal()))?;
    }

    Ok(dataset)
}

/// Create a single-band 1-bit Byte GeoTIFF with nodata 0
pub fn create_detection_raster<P: AsRef<Path>>(
    path: P,
    geo: &GeoMetadata,
) -> PcaResult<Dataset> {
    let driver = DriverManager::get_driver_by_name("GTiff")?;
    let options = [
        RasterCreationOption { key: "NBITS", value: "1" },
        RasterCreationOption { key: "COMPRESS", value: "NONE" },
    ];
    let mut dataset = driver.create_with_band_type_with_options::<u8, _>(
        path.as_ref(),
        geo.width as isize,
        geo.height as isize,
        1,
        &options,
    )?;
    apply_georeferencing(&mut dataset, geo)?;

    {
        let mut band = dataset.rasterband(1)?;
        band.set_no_data_value(Some(0.0))?;
    }

    Ok(dataset)
}

/// Write a block of rows into band 1 starting at `row_off`
pub fn write_rows<T: GdalType + Copy>(
    dataset: &Dataset,
    row_off: usize,
    block: &Array2<T>,
) -> PcaResult<()> {
    let (rows, cols) = block.dim();
    let mut band = dataset.rasterband(1)?;
    let flat_data: Vec<T> = block.iter().copied().collect();
    let buffer = Buffer::new((cols, rows), flat_data);
    band.write((0, row_off as isize), (cols, rows), &buffer)?;
    Ok(())
}
