//! Helpers shared by the integration tests

#![allow(dead_code)]

use gdal::raster::{Buffer, GdalType};
use gdal::DriverManager;
use ndarray::Array2;
use std::path::{Path, PathBuf};

pub const GEO_TRANSFORM: [f64; 6] = [500_000.0, 10.0, 0.0, 4_600_000.0, 0.0, -10.0];

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Write a GeoTIFF with one band per array, typed like the arrays
pub fn write_raster<T: GdalType + Copy>(path: &Path, bands: &[Array2<T>], nodata: Option<f64>) -> PathBuf {
    let (rows, cols) = bands[0].dim();
    let driver = DriverManager::get_driver_by_name("GTiff").expect("GTiff driver missing");
    let mut dataset = driver
        .create_with_band_type::<T, _>(path, cols as isize, rows as isize, bands.len() as isize)
        .expect("Failed to create test raster");
    dataset
        .set_geo_transform(&GEO_TRANSFORM)
        .expect("Failed to set geotransform");

    for (i, band_data) in bands.iter().enumerate() {
        let mut band = dataset.rasterband(i as isize + 1).expect("Missing band");
        let buffer = Buffer::new((cols, rows), band_data.iter().copied().collect());
        band.write((0, 0), (cols, rows), &buffer)
            .expect("Failed to write test band");
        if let Some(nodata) = nodata {
            band.set_no_data_value(Some(nodata))
                .expect("Failed to set nodata");
        }
    }
    path.to_path_buf()
}

/// Read band 1 of a raster as f64
pub fn read_raster(path: &Path) -> Array2<f64> {
    let reader = pca4cd::RasterBandReader::open(path).expect("Failed to open output raster");
    reader.read_band(1).expect("Failed to read output raster")
}
