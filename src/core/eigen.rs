use crate::types::{PcaError, PcaResult};
use nalgebra::{DMatrix, SymmetricEigen};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// Iteration cap for the symmetric QR sweeps
const MAX_ITERATIONS: usize = 10_000;

/// Sorted eigen-decomposition of the estimator matrix
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EigenResult {
    /// All eigenvalues, descending
    pub eigenvalues: Vec<f64>,
    /// `eigenvalue * 100 / n_bands` for each eigenvalue
    pub eigenvalue_percentages: Vec<f64>,
    /// n_bands x n_components; column k belongs to `eigenvalues[k]`
    pub eigenvectors: Array2<f64>,
}

impl EigenResult {
    pub fn n_bands(&self) -> usize {
        self.eigenvectors.nrows()
    }

    pub fn n_components(&self) -> usize {
        self.eigenvectors.ncols()
    }
}

/// Eigen-decomposition of symmetric estimator matrices
pub struct EigenDecomposer;

impl EigenDecomposer {
    /// Decompose `matrix` and keep the leading `n_components` eigenvectors.
    ///
    /// Uses the symmetric solver only; the matrix is symmetric by construction.
    pub fn decompose(matrix: &Array2<f64>, n_components: usize) -> PcaResult<EigenResult> {
        let (rows, cols) = matrix.dim();
        if rows != cols || rows == 0 {
            return Err(PcaError::Compute(format!(
                "Estimator matrix must be square and non-empty, got {}x{}",
                rows, cols
            )));
        }
        let n_bands = rows;

        if n_components == 0 || n_components > n_bands {
            return Err(PcaError::InvalidArgument(format!(
                "Number of components must be in 1..={}, got {}",
                n_bands, n_components
            )));
        }

        if !matrix.iter().any(|v| v.is_finite()) {
            return Err(PcaError::DegenerateData(
                "Estimator matrix has no finite entries".to_string(),
            ));
        }

        let undefined_bands: Vec<usize> = (0..n_bands)
            .filter(|&i| matrix.row(i).iter().any(|v| !v.is_finite()))
            .map(|i| i + 1)
            .collect();
        if !undefined_bands.is_empty() {
            return Err(PcaError::Compute(format!(
                "Estimator matrix is undefined for bands {:?} (constant or empty over valid pixels)",
                undefined_bands
            )));
        }

        let na_matrix = DMatrix::from_fn(n_bands, n_bands, |i, j| matrix[[i, j]]);
        let eigen = SymmetricEigen::try_new(na_matrix, f64::EPSILON, MAX_ITERATIONS)
            .ok_or_else(|| {
                PcaError::Compute(format!(
                    "Symmetric eigen-decomposition did not converge in {} iterations",
                    MAX_ITERATIONS
                ))
            })?;

        // Sort eigenvalue indices in decreasing order
        let mut order: Vec<usize> = (0..n_bands).collect();
        order.sort_by(|&a, &b| {
            eigen.eigenvalues[b]
                .partial_cmp(&eigen.eigenvalues[a])
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let eigenvalues: Vec<f64> = order.iter().map(|&idx| eigen.eigenvalues[idx]).collect();
        let eigenvalue_percentages = eigenvalues
            .iter()
            .map(|&value| value * 100.0 / n_bands as f64)
            .collect();

        let eigenvectors = Array2::from_shape_fn((n_bands, n_components), |(j, k)| {
            eigen.eigenvectors[(j, order[k])]
        });

        log::info!("Eigenvalues: {:?}", eigenvalues);

        Ok(EigenResult {
            eigenvalues,
            eigenvalue_percentages,
            eigenvectors,
        })
    }
}
