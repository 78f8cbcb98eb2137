use crate::types::{CoregError, CoregResult, GeoTransform};
use ndarray::Array3;
use std::path::Path;

/// Sample type of a raster band, kept so rewritten files match their source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RasterDataType {
    UInt8,
    UInt16,
    Int16,
    UInt32,
    Int32,
    Float32,
    Float64,
}

impl RasterDataType {
    /// Whether `value` can be stored in this type without loss
    pub fn can_represent(&self, value: f64) -> bool {
        let integral = value.is_finite() && value.fract() == 0.0;
        match self {
            RasterDataType::UInt8 => integral && (0.0..=u8::MAX as f64).contains(&value),
            RasterDataType::UInt16 => integral && (0.0..=u16::MAX as f64).contains(&value),
            RasterDataType::Int16 => {
                integral && (i16::MIN as f64..=i16::MAX as f64).contains(&value)
            }
            RasterDataType::UInt32 => integral && (0.0..=u32::MAX as f64).contains(&value),
            RasterDataType::Int32 => {
                integral && (i32::MIN as f64..=i32::MAX as f64).contains(&value)
            }
            RasterDataType::Float32 | RasterDataType::Float64 => !value.is_nan(),
        }
    }
}

/// Resampling kernel used when a raster is warped into another CRS
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resampling {
    Nearest,
    Bilinear,
}

impl Resampling {
    pub fn as_gdal_name(&self) -> &'static str {
        match self {
            Resampling::Nearest => "near",
            Resampling::Bilinear => "bilinear",
        }
    }
}

/// A georeferenced multi-band raster held in memory
#[derive(Debug, Clone, PartialEq)]
pub struct Raster {
    /// Band values indexed (band, row, column)
    pub bands: Array3<f64>,
    pub geo_transform: GeoTransform,
    /// CRS as an authority code (`EPSG:32610`) or WKT
    pub crs: String,
    pub nodata: Option<f64>,
    pub data_type: RasterDataType,
    pub compression: Option<String>,
}

impl Raster {
    pub fn band_count(&self) -> usize {
        self.bands.dim().0
    }

    /// (width, height) in pixels
    pub fn size(&self) -> (usize, usize) {
        let (_, rows, cols) = self.bands.dim();
        (cols, rows)
    }

    /// Replace every sample equal to the current no-data value with `new_nodata`
    /// and declare `new_nodata` as the no-data value.
    ///
    /// A NaN sentinel matches NaN samples. Returns the number of rewritten samples.
    pub fn substitute_nodata(&mut self, new_nodata: f64) -> usize {
        let mut replaced = 0;
        if let Some(old) = self.nodata {
            for value in self.bands.iter_mut() {
                let matches = if old.is_nan() {
                    value.is_nan()
                } else {
                    *value == old
                };
                if matches {
                    *value = new_nodata;
                    replaced += 1;
                }
            }
        }
        self.nodata = Some(new_nodata);
        replaced
    }

    /// Same samples, origin moved by (`dx`, `dy`) pixels of this raster's grid
    pub fn shifted(&self, dx: f64, dy: f64) -> Raster {
        Raster {
            geo_transform: self.geo_transform.translated_by_pixels(dx, dy),
            compression: Some(
                self.compression
                    .clone()
                    .unwrap_or_else(|| "LZW".to_string()),
            ),
            ..self.clone()
        }
    }
}

/// Raster file access used by the conditioner and the shift propagator
pub trait RasterIo: Send + Sync {
    /// Read every band of the raster at `path`
    fn read(&self, path: &Path) -> CoregResult<Raster>;

    /// Write `raster` to `path`, replacing any existing file
    fn write(&self, path: &Path, raster: &Raster) -> CoregResult<()>;

    /// CRS of the raster at `path`
    fn crs(&self, path: &Path) -> CoregResult<String>;

    /// Warp `src` into `target_crs`, keeping its native resolution, and write to `dst`
    fn reproject(
        &self,
        src: &Path,
        dst: &Path,
        target_crs: &str,
        resampling: Resampling,
    ) -> CoregResult<()>;

    fn exists(&self, path: &Path) -> bool {
        path.is_file()
    }

    /// Move a raster file, replacing `to`
    fn rename(&self, from: &Path, to: &Path) -> CoregResult<()> {
        std::fs::rename(from, to).map_err(CoregError::from)
    }

    /// Byte-for-byte copy of a raster file, replacing `to`
    fn copy(&self, from: &Path, to: &Path) -> CoregResult<()> {
        std::fs::copy(from, to)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn raster(values: Vec<f64>, nodata: Option<f64>) -> Raster {
        Raster {
            bands: Array3::from_shape_vec((2, 1, 2), values).unwrap(),
            geo_transform: GeoTransform::from_gdal([0.0, 10.0, 0.0, 100.0, 0.0, -10.0]),
            crs: "EPSG:32610".to_string(),
            nodata,
            data_type: RasterDataType::Float32,
            compression: None,
        }
    }

    #[test]
    fn test_substitute_infinite_nodata() {
        let mut r = raster(
            vec![f64::NEG_INFINITY, 1.0, 2.0, f64::NEG_INFINITY],
            Some(f64::NEG_INFINITY),
        );
        let replaced = r.substitute_nodata(0.0);
        assert_eq!(replaced, 2);
        assert_eq!(r.nodata, Some(0.0));
        assert!(r.bands.iter().all(|v| v.is_finite()));
        assert_eq!(r.bands[[0, 0, 1]], 1.0);
    }

    #[test]
    fn test_substitute_nan_nodata() {
        let mut r = raster(vec![f64::NAN, 1.0, 2.0, 3.0], Some(f64::NAN));
        assert_eq!(r.substitute_nodata(0.0), 1);
        assert_eq!(r.bands[[0, 0, 0]], 0.0);
    }

    #[test]
    fn test_substitute_without_sentinel_only_sets_metadata() {
        let mut r = raster(vec![0.0, 1.0, 2.0, 3.0], None);
        assert_eq!(r.substitute_nodata(0.0), 0);
        assert_eq!(r.nodata, Some(0.0));
    }

    #[test]
    fn test_shifted_keeps_samples() {
        let r = raster(vec![1.0, 2.0, 3.0, 4.0], None);
        let s = r.shifted(2.0, 1.0);
        assert_eq!(s.bands, r.bands);
        assert_eq!(s.geo_transform.top_left_x, 20.0);
        assert_eq!(s.geo_transform.top_left_y, 90.0);
        assert_eq!(s.compression.as_deref(), Some("LZW"));
    }

    #[test]
    fn test_data_type_range() {
        assert!(RasterDataType::UInt16.can_represent(0.0));
        assert!(!RasterDataType::UInt16.can_represent(-1.0));
        assert!(!RasterDataType::Int16.can_represent(f64::NEG_INFINITY));
        assert!(RasterDataType::Float32.can_represent(f64::NEG_INFINITY));
    }
}
