//! Raster I/O: GDAL-backed band readers, band stacks and GeoTIFF writers

pub mod pyramids;
pub mod raster;
pub mod stack;

pub use pyramids::{build_pyramids, build_pyramids_for};
pub use raster::{create_component_raster, create_detection_raster, write_rows, RasterBandReader};
pub use stack::{BandSource, MemoryStack, RasterStack, RowChunks, DEFAULT_CHUNK_BLOCK_SIZE};
