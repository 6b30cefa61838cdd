use ndarray::Array2;
use num_traits::Float;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Band pixels after casting to floating point (rows x cols)
pub type Band = Array2<f64>;

/// Principal component pixels as written to disk
pub type ComponentImage = Array2<f32>;

/// Binary change layer (1 = change, 0 = no change / nodata)
pub type DetectionImage = Array2<u8>;

/// Pixel-wise exclusion mask, `true` where the pixel is invalid in any band
pub type ValidityMask = Array2<bool>;

/// Geospatial transformation parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub top_left_x: f64,
    pub pixel_width: f64,
    pub rotation_x: f64,
    pub top_left_y: f64,
    pub rotation_y: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    pub fn from_gdal(gt: &gdal::GeoTransform) -> Self {
        Self {
            top_left_x: gt[0],
            pixel_width: gt[1],
            rotation_x: gt[2],
            top_left_y: gt[3],
            rotation_y: gt[4],
            pixel_height: gt[5],
        }
    }

    pub fn to_gdal(&self) -> gdal::GeoTransform {
        [
            self.top_left_x,
            self.pixel_width,
            self.rotation_x,
            self.top_left_y,
            self.rotation_y,
            self.pixel_height,
        ]
    }

    /// (width, height) of a pixel in map units
    pub fn pixel_size(&self) -> (f64, f64) {
        (self.pixel_width, self.pixel_height)
    }
}

/// Georeferencing carried from an input raster onto every output raster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoMetadata {
    pub transform: Option<GeoTransform>,
    pub projection: Option<String>,
    pub width: usize,
    pub height: usize,
}

impl GeoMetadata {
    /// Check that two rasters share dimensions, pixel size and projection.
    pub fn check_same_grid(&self, other: &GeoMetadata) -> PcaResult<()> {
        if self.width != other.width || self.height != other.height {
            return Err(PcaError::Input(format!(
                "Raster dimensions differ: {}x{} vs {}x{}",
                self.width, self.height, other.width, other.height
            )));
        }

        if let (Some(a), Some(b)) = (&self.transform, &other.transform) {
            let (aw, ah) = a.pixel_size();
            let (bw, bh) = b.pixel_size();
            if !approx::relative_eq!(aw, bw, max_relative = 1e-9)
                || !approx::relative_eq!(ah, bh, max_relative = 1e-9)
            {
                return Err(PcaError::Input(format!(
                    "Pixel sizes differ: ({}, {}) vs ({}, {})",
                    aw, ah, bw, bh
                )));
            }
        }

        if let (Some(a), Some(b)) = (&self.projection, &other.projection) {
            if a != b {
                return Err(PcaError::Input(
                    "Rasters do not share the same projection".to_string(),
                ));
            }
        }

        Ok(())
    }
}

/// Pixel window for blocked reads (offsets and sizes in pixels)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockWindow {
    pub col_off: usize,
    pub row_off: usize,
    pub cols: usize,
    pub rows: usize,
}

impl BlockWindow {
    pub fn rows(row_off: usize, rows: usize, cols: usize) -> Self {
        Self { col_off: 0, row_off, cols, rows }
    }
}

/// Declared invalid-pixel marker
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Nodata {
    /// Not-a-number pixels are invalid
    Nan,
    /// Pixels equal to this value are invalid
    Value(f64),
}

impl Nodata {
    /// Whether `value` is marked invalid by this sentinel.
    ///
    /// Float32 rasters store the sentinel rounded to f32, so a pixel also
    /// matches when it equals the sentinel at single precision.
    #[inline]
    pub fn matches<T: Float>(&self, value: T) -> bool {
        match self {
            Nodata::Nan => value.is_nan(),
            Nodata::Value(v) => value.to_f64().map_or(false, |x| {
                let single = *v as f32;
                x == *v || (single.is_finite() && x == f64::from(single))
            }),
        }
    }

    /// Sentinel as written into float output rasters
    pub fn as_f32(&self) -> f32 {
        match self {
            Nodata::Nan => f32::NAN,
            Nodata::Value(v) => *v as f32,
        }
    }

    /// Sentinel as declared on a GDAL band
    pub fn as_gdal(&self) -> f64 {
        match self {
            Nodata::Nan => f64::NAN,
            Nodata::Value(v) => *v,
        }
    }
}

impl fmt::Display for Nodata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Nodata::Nan => write!(f, "nan"),
            Nodata::Value(v) => write!(f, "{}", v),
        }
    }
}

impl FromStr for Nodata {
    type Err = PcaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("nan") {
            return Ok(Nodata::Nan);
        }
        match trimmed.parse::<f64>() {
            Ok(v) if v.is_nan() => Ok(Nodata::Nan),
            Ok(v) => Ok(Nodata::Value(v)),
            Err(_) => Err(PcaError::Input(format!("Invalid nodata value: '{}'", s))),
        }
    }
}

/// Parse an optional nodata string; empty or "none" means no sentinel.
pub fn parse_nodata(s: &str) -> PcaResult<Option<Nodata>> {
    let trimmed = s.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("none") {
        return Ok(None);
    }
    trimmed.parse().map(Some)
}

/// Estimator matrix used for the eigen-decomposition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EstimatorKind {
    Correlation,
    Covariance,
}

impl Default for EstimatorKind {
    fn default() -> Self {
        EstimatorKind::Correlation
    }
}

impl fmt::Display for EstimatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EstimatorKind::Correlation => write!(f, "Correlation"),
            EstimatorKind::Covariance => write!(f, "Covariance"),
        }
    }
}

impl FromStr for EstimatorKind {
    type Err = PcaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "correlation" => Ok(EstimatorKind::Correlation),
            "covariance" => Ok(EstimatorKind::Covariance),
            _ => Err(PcaError::InvalidArgument(format!(
                "Invalid estimator matrix: '{}' (expected Correlation or Covariance)",
                s
            ))),
        }
    }
}

/// Error types for PCA processing
#[derive(Debug, thiserror::Error)]
pub enum PcaError {
    #[error("Input error: {0}")]
    Input(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("No valid data: {0}")]
    DegenerateData(String),

    #[error("Compute error: {0}")]
    Compute(String),

    #[error("External tool error: {0}")]
    ExternalTool(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PcaError {
    /// One-line failure category for user-facing messages
    pub fn category(&self) -> &'static str {
        match self {
            PcaError::Input(_) => "Invalid input data",
            PcaError::InvalidArgument(_) => "Invalid parameters",
            PcaError::DegenerateData(_) => "No valid data to compute the principal components",
            PcaError::Compute(_) => "Error computing the principal components",
            PcaError::ExternalTool(_) => "External tool failed",
            PcaError::Io(_) | PcaError::Gdal(_) | PcaError::Serialization(_) => {
                "Error reading or writing files"
            }
        }
    }
}

impl From<ndarray::ShapeError> for PcaError {
    fn from(e: ndarray::ShapeError) -> Self {
        PcaError::Compute(format!("Array shape error: {}", e))
    }
}

/// Result type for PCA operations
pub type PcaResult<T> = Result<T, PcaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nodata_parsing() {
        assert_eq!("nan".parse::<Nodata>().unwrap(), Nodata::Nan);
        assert_eq!("NaN".parse::<Nodata>().unwrap(), Nodata::Nan);
        assert_eq!("-9999".parse::<Nodata>().unwrap(), Nodata::Value(-9999.0));
        assert_eq!(" 0 ".parse::<Nodata>().unwrap(), Nodata::Value(0.0));
        assert!("abc".parse::<Nodata>().is_err());

        assert_eq!(parse_nodata("").unwrap(), None);
        assert_eq!(parse_nodata("None").unwrap(), None);
        assert_eq!(parse_nodata("0").unwrap(), Some(Nodata::Value(0.0)));
        assert!(matches!(parse_nodata("x1"), Err(PcaError::Input(_))));
    }

    #[test]
    fn test_nodata_matches() {
        assert!(Nodata::Nan.matches(f64::NAN));
        assert!(!Nodata::Nan.matches(0.0f32));
        assert!(Nodata::Value(0.0).matches(0.0f64));
        assert!(!Nodata::Value(0.0).matches(f32::NAN));
        assert!(Nodata::Value(-9999.0).matches(-9999.0f32));
    }

    #[test]
    fn test_nodata_matches_single_precision_pixels() {
        // 0.1 written into a Float32 raster reads back as 0.10000000149...
        let stored = f64::from(0.1f32);
        assert_ne!(stored, 0.1);
        assert!(Nodata::Value(0.1).matches(stored));
        assert!(Nodata::Value(0.1).matches(0.1f32));
        assert!(Nodata::Value(-3.4e38).matches(f64::from(-3.4e38f32)));

        // Neighbouring values stay valid
        assert!(!Nodata::Value(0.1).matches(0.1000001f64));
        assert!(!Nodata::Value(0.1).matches(f64::from(0.1f32) + 1e-7));

        // Sentinels outside the f32 range never match infinities
        assert!(!Nodata::Value(1e300).matches(f64::INFINITY));
    }

    #[test]
    fn test_estimator_kind_parsing() {
        assert_eq!("Correlation".parse::<EstimatorKind>().unwrap(), EstimatorKind::Correlation);
        assert_eq!("covariance".parse::<EstimatorKind>().unwrap(), EstimatorKind::Covariance);
        assert!("pearson".parse::<EstimatorKind>().is_err());
    }

    #[test]
    fn test_grid_check() {
        let transform = GeoTransform {
            top_left_x: 500000.0,
            pixel_width: 30.0,
            rotation_x: 0.0,
            top_left_y: 4000000.0,
            rotation_y: 0.0,
            pixel_height: -30.0,
        };
        let a = GeoMetadata {
            transform: Some(transform),
            projection: Some("EPSG:32618".to_string()),
            width: 10,
            height: 20,
        };

        assert!(a.check_same_grid(&a.clone()).is_ok());

        let mut b = a.clone();
        b.width = 11;
        assert!(matches!(a.check_same_grid(&b), Err(PcaError::Input(_))));

        let mut c = a.clone();
        c.transform = Some(GeoTransform { pixel_width: 10.0, ..transform });
        assert!(matches!(a.check_same_grid(&c), Err(PcaError::Input(_))));

        let mut d = a.clone();
        d.projection = Some("EPSG:4326".to_string());
        assert!(matches!(a.check_same_grid(&d), Err(PcaError::Input(_))));
    }
}
