use crate::core::mask::{build_mask, valid_count};
use crate::io::stack::{BandSource, RowChunks};
use crate::types::{Band, EstimatorKind, Nodata, PcaResult, ValidityMask};
use ndarray::{Array2, ArrayView2, Zip};
use rayon::prelude::*;
use rayon::ThreadPool;
use std::sync::Arc;

/// Moment estimator parameters
#[derive(Debug, Clone)]
pub struct MomentParams {
    /// Correlation or covariance matrix
    pub kind: EstimatorKind,
    /// Side of a square chunk; each strip holds about `chunk_block_size²` pixels per band
    pub chunk_block_size: usize,
    /// Invalid pixel marker
    pub nodata: Option<Nodata>,
}

impl Default for MomentParams {
    fn default() -> Self {
        Self {
            kind: EstimatorKind::Correlation,
            chunk_block_size: 1000,
            nodata: None,
        }
    }
}

/// Per-band means and the estimator matrix over valid pixels
#[derive(Debug, Clone)]
pub struct BandMoments {
    pub means: Vec<f64>,
    pub matrix: Array2<f64>,
    pub valid_pixels: usize,
}

impl BandMoments {
    /// True when the matrix has at least one finite entry
    pub fn has_valid_data(&self) -> bool {
        self.valid_pixels > 0 && self.matrix.iter().any(|v| v.is_finite())
    }
}

/// Mean of `band` over pixels not flagged in `mask`
pub fn band_mean(band: &ArrayView2<f64>, mask: &ValidityMask) -> f64 {
    let (sum, count) = masked_sum(band, mask);
    if count == 0 {
        f64::NAN
    } else {
        sum / count as f64
    }
}

/// Sample covariance or Pearson correlation of two bands over jointly valid pixels
pub fn estimator(
    band_i: &ArrayView2<f64>,
    band_j: &ArrayView2<f64>,
    mask: &ValidityMask,
    kind: EstimatorKind,
) -> f64 {
    let mean_i = band_mean(band_i, mask);
    let mean_j = band_mean(band_j, mask);
    let count = valid_count(mask);

    let s_ij = cross_deviation(band_i, band_j, mean_i, mean_j, mask);
    match kind {
        EstimatorKind::Covariance => covariance(s_ij, count),
        EstimatorKind::Correlation => {
            let s_ii = cross_deviation(band_i, band_i, mean_i, mean_i, mask);
            let s_jj = cross_deviation(band_j, band_j, mean_j, mean_j, mask);
            correlation(s_ij, s_ii, s_jj)
        }
    }
}

fn masked_sum(band: &ArrayView2<f64>, mask: &ValidityMask) -> (f64, usize) {
    let mut sum = 0.0;
    let mut count = 0usize;
    Zip::from(band).and(mask).for_each(|&v, &invalid| {
        if !invalid {
            sum += v;
            count += 1;
        }
    });
    (sum, count)
}

fn cross_deviation(
    band_i: &ArrayView2<f64>,
    band_j: &ArrayView2<f64>,
    mean_i: f64,
    mean_j: f64,
    mask: &ValidityMask,
) -> f64 {
    let mut acc = 0.0;
    Zip::from(band_i).and(band_j).and(mask).for_each(|&a, &b, &invalid| {
        if !invalid {
            acc += (a - mean_i) * (b - mean_j);
        }
    });
    acc
}

fn covariance(s_ij: f64, count: usize) -> f64 {
    if count < 2 {
        f64::NAN
    } else {
        s_ij / (count - 1) as f64
    }
}

fn correlation(s_ij: f64, s_ii: f64, s_jj: f64) -> f64 {
    let denom = (s_ii * s_jj).sqrt();
    if denom > 0.0 {
        // Clamp rounding noise so |r| never exceeds 1
        (s_ij / denom).clamp(-1.0, 1.0)
    } else {
        f64::NAN
    }
}

/// Chunked two-pass estimator over a [`BandSource`].
///
/// The first pass accumulates per-band sums, the second the centered cross
/// products of every band pair (upper triangle only, mirrored at the end).
/// Both passes keep f64 accumulators across chunks, so the chunk size only
/// changes peak memory.
pub struct MomentEstimator {
    params: MomentParams,
    pool: Arc<ThreadPool>,
}

impl MomentEstimator {
    pub fn new(params: MomentParams, pool: Arc<ThreadPool>) -> Self {
        Self { params, pool }
    }

    pub fn params(&self) -> &MomentParams {
        &self.params
    }

    /// Compute band means and the estimator matrix
    pub fn estimate(&self, source: &dyn BandSource) -> PcaResult<BandMoments> {
        let n_bands = source.band_count();
        log::info!(
            "Estimating {} matrix for {} bands ({}x{} pixels)",
            self.params.kind,
            n_bands,
            source.shape().1,
            source.shape().0
        );

        let (sums, valid_pixels) = self.accumulate_sums(source)?;
        let means: Vec<f64> = sums
            .iter()
            .map(|&s| if valid_pixels == 0 { f64::NAN } else { s / valid_pixels as f64 })
            .collect();
        log::debug!("Band means over {} valid pixels: {:?}", valid_pixels, means);

        if valid_pixels == 0 {
            log::warn!("Every pixel is masked as nodata");
            return Ok(BandMoments {
                means,
                matrix: Array2::from_elem((n_bands, n_bands), f64::NAN),
                valid_pixels,
            });
        }

        let cross = self.accumulate_cross_products(source, &means)?;
        let matrix = self.finish_matrix(&cross, valid_pixels);
        log::debug!("Estimator matrix:\n{:?}", matrix);

        Ok(BandMoments {
            means,
            matrix,
            valid_pixels,
        })
    }

    fn read_masked_strip(
        &self,
        source: &dyn BandSource,
        row_off: usize,
        n_rows: usize,
    ) -> PcaResult<(Vec<Band>, ValidityMask)> {
        let strip = source.read_strip(row_off, n_rows)?;
        let mask = build_mask(&strip, self.params.nodata);
        Ok((strip, mask))
    }

    fn accumulate_sums(&self, source: &dyn BandSource) -> PcaResult<(Vec<f64>, usize)> {
        let n_bands = source.band_count();
        let mut sums = vec![0.0; n_bands];
        let mut valid_pixels = 0usize;

        for (row_off, n_rows) in RowChunks::new(source.shape(), self.params.chunk_block_size) {
            let (strip, mask) = self.read_masked_strip(source, row_off, n_rows)?;

            let chunk_sums: Vec<(f64, usize)> = self.pool.install(|| {
                strip
                    .par_iter()
                    .map(|band| masked_sum(&band.view(), &mask))
                    .collect()
            });

            for (total, (s, _)) in sums.iter_mut().zip(&chunk_sums) {
                *total += s;
            }
            valid_pixels += chunk_sums.first().map_or(0, |&(_, c)| c);
        }

        Ok((sums, valid_pixels))
    }

    fn accumulate_cross_products(
        &self,
        source: &dyn BandSource,
        means: &[f64],
    ) -> PcaResult<Array2<f64>> {
        let n_bands = source.band_count();
        let pairs: Vec<(usize, usize)> = (0..n_bands)
            .flat_map(|i| (i..n_bands).map(move |j| (i, j)))
            .collect();
        let mut cross = Array2::<f64>::zeros((n_bands, n_bands));

        for (row_off, n_rows) in RowChunks::new(source.shape(), self.params.chunk_block_size) {
            let (strip, mask) = self.read_masked_strip(source, row_off, n_rows)?;
            log::debug!("Cross products for rows {}..{}", row_off, row_off + n_rows);

            let partial: Vec<f64> = self.pool.install(|| {
                pairs
                    .par_iter()
                    .map(|&(i, j)| {
                        cross_deviation(&strip[i].view(), &strip[j].view(), means[i], means[j], &mask)
                    })
                    .collect()
            });

            for (&(i, j), value) in pairs.iter().zip(partial) {
                cross[[i, j]] += value;
            }
        }

        Ok(cross)
    }

    fn finish_matrix(&self, cross: &Array2<f64>, valid_pixels: usize) -> Array2<f64> {
        let n_bands = cross.nrows();
        let mut matrix = Array2::<f64>::zeros((n_bands, n_bands));

        for i in 0..n_bands {
            for j in i..n_bands {
                let value = match self.params.kind {
                    EstimatorKind::Covariance => covariance(cross[[i, j]], valid_pixels),
                    EstimatorKind::Correlation => {
                        correlation(cross[[i, j]], cross[[i, i]], cross[[j, j]])
                    }
                };
                matrix[[i, j]] = value;
                matrix[[j, i]] = value;
            }
        }

        matrix
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::stack::MemoryStack;
    use approx::assert_relative_eq;
    use ndarray::array;

    fn pool() -> Arc<ThreadPool> {
        Arc::new(rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap())
    }

    #[test]
    fn test_band_mean_skips_masked_pixels() {
        let band = array![[1.0, 2.0], [3.0, 100.0]];
        let mask = array![[false, false], [false, true]];
        assert_relative_eq!(band_mean(&band.view(), &mask), 2.0);

        let all_masked = Array2::from_elem((2, 2), true);
        assert!(band_mean(&band.view(), &all_masked).is_nan());
    }

    #[test]
    fn test_pairwise_estimators() {
        let a = array![[1.0, 2.0], [3.0, 4.0]];
        let b = array![[2.0, 4.0], [6.0, 8.0]];
        let mask = Array2::from_elem((2, 2), false);

        // var(a) = 5/3 with the n - 1 denominator
        let cov_aa = estimator(&a.view(), &a.view(), &mask, EstimatorKind::Covariance);
        assert_relative_eq!(cov_aa, 5.0 / 3.0, epsilon = 1e-12);

        let cov_ab = estimator(&a.view(), &b.view(), &mask, EstimatorKind::Covariance);
        assert_relative_eq!(cov_ab, 10.0 / 3.0, epsilon = 1e-12);

        let corr_ab = estimator(&a.view(), &b.view(), &mask, EstimatorKind::Correlation);
        assert_relative_eq!(corr_ab, 1.0, epsilon = 1e-12);

        let c = array![[4.0, 3.0], [2.0, 1.0]];
        let corr_ac = estimator(&a.view(), &c.view(), &mask, EstimatorKind::Correlation);
        assert_relative_eq!(corr_ac, -1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_constant_band_correlation_is_undefined() {
        let a = array![[1.0, 2.0], [3.0, 4.0]];
        let flat = array![[5.0, 5.0], [5.0, 5.0]];
        let mask = Array2::from_elem((2, 2), false);
        assert!(estimator(&a.view(), &flat.view(), &mask, EstimatorKind::Correlation).is_nan());
    }

    #[test]
    fn test_chunked_matches_direct() {
        let a = Array2::from_shape_fn((7, 5), |(r, c)| (r * 5 + c) as f64 * 0.5 + 1.0);
        let b = Array2::from_shape_fn((7, 5), |(r, c)| ((r * 3 + c * 7) % 11) as f64);
        let c = Array2::from_shape_fn((7, 5), |(r, c)| if (r + c) % 6 == 0 { 0.0 } else { (r as f64).sin() + c as f64 });
        let stack = MemoryStack::new(vec![a.clone(), b.clone(), c.clone()]).unwrap();
        let nodata = Some(Nodata::Value(0.0));

        let bands = vec![a, b, c];
        let mask = build_mask(&bands, nodata);

        for kind in [EstimatorKind::Covariance, EstimatorKind::Correlation] {
            for block in [1, 2, 3, 100] {
                let estimator_engine = MomentEstimator::new(
                    MomentParams { kind, chunk_block_size: block, nodata },
                    pool(),
                );
                let moments = estimator_engine.estimate(&stack).unwrap();
                assert_eq!(moments.valid_pixels, valid_count(&mask));

                for i in 0..3 {
                    assert_relative_eq!(
                        moments.means[i],
                        band_mean(&bands[i].view(), &mask),
                        epsilon = 1e-10
                    );
                    for j in 0..3 {
                        let direct = estimator(&bands[i].view(), &bands[j].view(), &mask, kind);
                        assert_relative_eq!(moments.matrix[[i, j]], direct, epsilon = 1e-10);
                        assert_eq!(moments.matrix[[i, j]], moments.matrix[[j, i]]);
                    }
                }

                if kind == EstimatorKind::Correlation {
                    for i in 0..3 {
                        assert_relative_eq!(moments.matrix[[i, i]], 1.0, epsilon = 1e-12);
                    }
                }
            }
        }
    }

    #[test]
    fn test_fully_masked_stack_has_no_valid_data() {
        let stack = MemoryStack::new(vec![
            Array2::zeros((3, 3)),
            Array2::from_elem((3, 3), 2.0),
        ])
        .unwrap();
        let engine = MomentEstimator::new(
            MomentParams {
                kind: EstimatorKind::Covariance,
                chunk_block_size: 2,
                nodata: Some(Nodata::Value(0.0)),
            },
            pool(),
        );

        let moments = engine.estimate(&stack).unwrap();
        assert_eq!(moments.valid_pixels, 0);
        assert!(!moments.has_valid_data());
        assert!(moments.matrix.iter().all(|v| v.is_nan()));
    }
}
