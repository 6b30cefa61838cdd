use crate::core::eigen::EigenResult;
use crate::core::mask::build_mask;
use crate::io::raster::{create_component_raster, write_rows};
use crate::io::stack::{BandSource, RowChunks};
use crate::types::{Band, ComponentImage, GeoMetadata, Nodata, PcaError, PcaResult, ValidityMask};
use gdal::Dataset;
use ndarray::{Array2, Zip};
use rayon::prelude::*;
use rayon::ThreadPool;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// File name of the k-th (1-based) component inside the output directory
pub fn component_path(out_dir: &Path, k: usize) -> PathBuf {
    out_dir.join(format!("pc_{}.tif", k))
}

/// Projects centered bands onto the retained eigenvectors.
///
/// `pc_k[p] = sum_j eigenvectors[j, k] * (band_j[p] - mean_j)` for every pixel
/// outside the validity mask; masked pixels receive the input nodata sentinel.
pub struct ComponentReconstructor {
    eigenvectors: Array2<f64>,
    means: Vec<f64>,
    nodata: Option<Nodata>,
    pool: Arc<ThreadPool>,
}

impl ComponentReconstructor {
    pub fn new(
        eigen: &EigenResult,
        means: &[f64],
        nodata: Option<Nodata>,
        pool: Arc<ThreadPool>,
    ) -> PcaResult<Self> {
        if eigen.n_bands() != means.len() {
            return Err(PcaError::Compute(format!(
                "Eigenvectors cover {} bands but {} band means were given",
                eigen.n_bands(),
                means.len()
            )));
        }
        Ok(Self {
            eigenvectors: eigen.eigenvectors.clone(),
            means: means.to_vec(),
            nodata,
            pool,
        })
    }

    pub fn n_components(&self) -> usize {
        self.eigenvectors.ncols()
    }

    /// Compute every retained component for one strip of bands
    pub fn project(&self, bands: &[Band], mask: &ValidityMask) -> PcaResult<Vec<ComponentImage>> {
        if bands.len() != self.means.len() {
            return Err(PcaError::Compute(format!(
                "Expected {} bands, got {}",
                self.means.len(),
                bands.len()
            )));
        }
        let shape = mask.dim();
        let fill = self.nodata.map_or(f32::NAN, |n| n.as_f32());

        let components: Vec<ComponentImage> = self.pool.install(|| {
            (0..self.n_components())
                .into_par_iter()
                .map(|k| {
                    let mut acc = Array2::<f64>::zeros(shape);
                    for (j, band) in bands.iter().enumerate() {
                        let weight = self.eigenvectors[[j, k]];
                        let mean = self.means[j];
                        Zip::from(&mut acc)
                            .and(band)
                            .for_each(|a, &b| *a += weight * (b - mean));
                    }

                    let mut component = ComponentImage::zeros(shape);
                    Zip::from(&mut component)
                        .and(&acc)
                        .and(mask)
                        .for_each(|c, &a, &invalid| *c = if invalid { fill } else { a as f32 });
                    component
                })
                .collect()
        });

        Ok(components)
    }

    /// Write `pc_1.tif ..= pc_n.tif` into `out_dir`.
    ///
    /// On failure every component file of this run is removed before the error
    /// is returned, so no half-written output is left behind.
    pub fn write_components(
        &self,
        source: &dyn BandSource,
        out_dir: &Path,
        chunk_block_size: usize,
    ) -> PcaResult<Vec<PathBuf>> {
        let paths: Vec<PathBuf> = (1..=self.n_components())
            .map(|k| component_path(out_dir, k))
            .collect();

        log::info!(
            "Writing {} principal components to {}",
            paths.len(),
            out_dir.display()
        );

        match self.write_into(source, &paths, chunk_block_size) {
            Ok(()) => Ok(paths),
            Err(e) => {
                log::warn!("Component reconstruction failed, removing partial outputs: {}", e);
                for path in paths.iter().filter(|p| p.exists()) {
                    if let Err(rm_err) = std::fs::remove_file(path) {
                        log::warn!("Could not remove {}: {}", path.display(), rm_err);
                    }
                }
                Err(e)
            }
        }
    }

    fn write_into(
        &self,
        source: &dyn BandSource,
        paths: &[PathBuf],
        chunk_block_size: usize,
    ) -> PcaResult<()> {
        let (rows, cols) = source.shape();
        let geo = source.geo_metadata().unwrap_or(GeoMetadata {
            transform: None,
            projection: None,
            width: cols,
            height: rows,
        });

        let datasets: Vec<Dataset> = paths
            .iter()
            .map(|path| create_component_raster(path, &geo, self.nodata))
            .collect::<PcaResult<_>>()?;

        for (row_off, n_rows) in RowChunks::new((rows, cols), chunk_block_size) {
            let strip = source.read_strip(row_off, n_rows)?;
            let mask = build_mask(&strip, self.nodata);
            let components = self.project(&strip, &mask)?;

            for (dataset, component) in datasets.iter().zip(&components) {
                write_rows(dataset, row_off, component)?;
            }
            log::debug!("Components written for rows {}..{}", row_off, row_off + n_rows);
        }

        Ok(())
    }
}
