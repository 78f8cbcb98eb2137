use serde::{Deserialize, Deserializer, Serialize};
use std::path::PathBuf;

/// Estimation window extent in pixels, always stored as (width, height)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "(u32, u32)", into = "(u32, u32)")]
pub struct WindowSize {
    pub width: u32,
    pub height: u32,
}

impl WindowSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Build from an engine report given in (rows, columns) order
    pub fn from_rows_cols(rows: u32, cols: u32) -> Self {
        Self {
            width: cols,
            height: rows,
        }
    }

    /// Both axes must reach `minimum`
    pub fn meets(&self, minimum: u32) -> bool {
        self.width >= minimum && self.height >= minimum
    }
}

impl From<(u32, u32)> for WindowSize {
    fn from((width, height): (u32, u32)) -> Self {
        Self { width, height }
    }
}

impl From<WindowSize> for (u32, u32) {
    fn from(ws: WindowSize) -> Self {
        (ws.width, ws.height)
    }
}

impl std::fmt::Display for WindowSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}]", self.width, self.height)
    }
}

/// Outcome of CRS alignment for one target raster
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CrsInfo {
    /// CRS the target was converted into, if a conversion happened
    pub crs: Option<String>,
    pub crs_converted: bool,
}

impl CrsInfo {
    pub fn unchanged() -> Self {
        Self::default()
    }

    pub fn converted(crs: impl Into<String>) -> Self {
        Self {
            crs: Some(crs.into()),
            crs_converted: true,
        }
    }
}

/// Per-file coregistration result.
///
/// Created once by the orchestrator and never modified afterwards. Every field has a
/// default so that a failed attempt still produces a complete record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoregistrationRecord {
    pub original_ssim: Option<f64>,
    pub coregistered_ssim: Option<f64>,
    pub change_ssim: f64,
    #[serde(deserialize_with = "whole_pixels")]
    pub shift_x: Option<i64>,
    #[serde(deserialize_with = "whole_pixels")]
    pub shift_y: Option<i64>,
    pub shift_x_meters: Option<f64>,
    pub shift_y_meters: Option<f64>,
    /// Percentage in [0, 100]; older result files store `false` when unresolved
    #[serde(deserialize_with = "reliability_or_false")]
    pub shift_reliability: Option<f64>,
    pub window_size: WindowSize,
    pub success: bool,
    #[serde(alias = "CRS")]
    pub crs: Option<String>,
    #[serde(alias = "CRS_converted")]
    pub crs_converted: bool,
}

impl Default for CoregistrationRecord {
    fn default() -> Self {
        Self {
            original_ssim: Some(0.0),
            coregistered_ssim: Some(0.0),
            change_ssim: 0.0,
            shift_x: Some(0),
            shift_y: Some(0),
            shift_x_meters: Some(0.0),
            shift_y_meters: Some(0.0),
            shift_reliability: None,
            window_size: WindowSize::default(),
            success: false,
            crs: None,
            crs_converted: false,
        }
    }
}

impl CoregistrationRecord {
    /// Default record for an attempt that produced no usable result
    pub fn failed(crs_info: CrsInfo) -> Self {
        Self {
            crs: crs_info.crs,
            crs_converted: crs_info.crs_converted,
            ..Self::default()
        }
    }

    /// Difference of the similarity scores, 0 unless both are known
    pub fn similarity_change(original: Option<f64>, coregistered: Option<f64>) -> f64 {
        match (original, coregistered) {
            (Some(before), Some(after)) => after - before,
            _ => 0.0,
        }
    }
}

fn reliability_or_false<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(f64),
        Flag(bool),
    }

    Ok(match Option::<Raw>::deserialize(deserializer)? {
        Some(Raw::Number(value)) => Some(value),
        Some(Raw::Flag(_)) | None => None,
    })
}

/// Pixel shifts written by other tools may carry a fractional part. Values outside the
/// `i64` range read as missing.
fn whole_pixels<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(i64),
        Float(f64),
    }

    Ok(match Option::<Raw>::deserialize(deserializer)? {
        Some(Raw::Int(value)) => Some(value),
        Some(Raw::Float(value)) if value.round().abs() < i64::MAX as f64 => {
            Some(value.round() as i64)
        }
        Some(Raw::Float(_)) | None => None,
    })
}

/// Affine geotransform in GDAL coefficient order
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
    pub fn from_gdal(gt: [f64; 6]) -> Self {
        Self {
            top_left_x: gt[0],
            pixel_width: gt[1],
            rotation_x: gt[2],
            top_left_y: gt[3],
            rotation_y: gt[4],
            pixel_height: gt[5],
        }
    }

    pub fn to_gdal(&self) -> [f64; 6] {
        [
            self.top_left_x,
            self.pixel_width,
            self.rotation_x,
            self.top_left_y,
            self.rotation_y,
            self.pixel_height,
        ]
    }

    /// Compose with a translation of (`dx`, `dy`) source pixels.
    ///
    /// Equivalent to `self * Affine::translation(dx, dy)`: only the origin moves, the
    /// pixel size and rotation terms are untouched.
    pub fn translated_by_pixels(&self, dx: f64, dy: f64) -> Self {
        Self {
            top_left_x: self.top_left_x + self.pixel_width * dx + self.rotation_x * dy,
            top_left_y: self.top_left_y + self.rotation_y * dx + self.pixel_height * dy,
            ..*self
        }
    }

    /// Absolute pixel size (x, y) in map units
    pub fn resolution(&self) -> (f64, f64) {
        (self.pixel_width.abs(), self.pixel_height.abs())
    }
}

/// Error types for coregistration processing
#[derive(Debug, thiserror::Error)]
pub enum CoregError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(feature = "gdal")]
    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),

    #[error("Cannot condition {}: {reason}", path.display())]
    Conditioning { path: PathBuf, reason: String },

    #[error("Coregistration engine failed: {0}")]
    Engine(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid data format: {0}")]
    InvalidFormat(String),
}

impl CoregError {
    pub fn conditioning(path: impl Into<PathBuf>, reason: impl std::fmt::Display) -> Self {
        CoregError::Conditioning {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

/// Result type for coregistration operations
pub type CoregResult<T> = Result<T, CoregError>;
