//! Makes a reference/target raster pair safe to hand to the coregistration engine.
//!
//! Two things can break the engine: targets in a different CRS than the reference, and
//! infinite no-data sentinels. Both are fixed on copies inside a workspace directory,
//! the original inputs are only rewritten when the caller explicitly asks for it.

use crate::io::raster::{RasterIo, Resampling};
use crate::types::{CoregError, CoregResult, CrsInfo};
use std::path::{Path, PathBuf};

/// Paths the engine should use, plus what happened to the target's CRS
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionedPair {
    pub reference: PathBuf,
    pub target: PathBuf,
    pub crs_info: CrsInfo,
}

pub struct RasterConditioner<'a> {
    io: &'a dyn RasterIo,
    reference_nodata: f64,
    target_nodata: f64,
}

impl<'a> RasterConditioner<'a> {
    pub fn new(io: &'a dyn RasterIo) -> Self {
        Self {
            io,
            reference_nodata: 0.0,
            target_nodata: 0.0,
        }
    }

    /// Use `(reference, target)` as the finite no-data values
    pub fn with_nodata(mut self, nodata: (f64, f64)) -> Self {
        self.reference_nodata = nodata.0;
        self.target_nodata = nodata.1;
        self
    }

    /// Condition both rasters of a pair into `workspace`
    pub fn condition(
        &self,
        reference: &Path,
        target: &Path,
        workspace: &Path,
    ) -> CoregResult<ConditionedPair> {
        let ready_reference = self.condition_reference(reference, workspace)?;
        let (ready_target, crs_info) = self.condition_target(&ready_reference, target, workspace)?;
        Ok(ConditionedPair {
            reference: ready_reference,
            target: ready_target,
            crs_info,
        })
    }

    /// Copy of the reference with a finite no-data value, under `workspace/reference`
    pub fn condition_reference(&self, reference: &Path, workspace: &Path) -> CoregResult<PathBuf> {
        let output = workspace.join("reference").join(file_name(reference)?);
        self.update_nodata(reference, Some(&output), self.reference_nodata)
    }

    /// Reproject (if needed) and sanitize one target.
    ///
    /// Every target gets its own directory under `workspace/targets` so concurrent
    /// calls for different targets never share a path.
    pub fn condition_target(
        &self,
        reference: &Path,
        target: &Path,
        workspace: &Path,
    ) -> CoregResult<(PathBuf, CrsInfo)> {
        let name = file_name(target)?;
        let target_dir = workspace.join("targets").join(stem(target)?);

        let reference_crs = self.io.crs(reference).map_err(|e| as_conditioning(reference, e))?;
        let target_crs = self.io.crs(target).map_err(|e| as_conditioning(target, e))?;

        let mut source = target.to_path_buf();
        let mut crs_info = CrsInfo::unchanged();
        if !same_crs(&reference_crs, &target_crs) {
            log::info!(
                "{} is in {} but the reference is in {}; reprojecting",
                name,
                target_crs,
                reference_crs
            );
            let reprojected = target_dir.join("new_crs").join(&name);
            self.io
                .reproject(target, &reprojected, &reference_crs, Resampling::Bilinear)
                .map_err(|e| as_conditioning(target, e))?;
            source = reprojected;
            crs_info = CrsInfo::converted(reference_crs);
        }

        let ready = target_dir.join(&name);
        let ready = self.update_nodata(&source, Some(&ready), self.target_nodata)?;
        Ok((ready, crs_info))
    }

    /// Rewrite every sample equal to the raster's no-data sentinel to `new_nodata`.
    ///
    /// With an `output` the result is written there. Without one the raster at `path`
    /// is replaced through a temporary file in the same directory, so a failure at any
    /// step leaves the original untouched.
    pub fn update_nodata(
        &self,
        path: &Path,
        output: Option<&Path>,
        new_nodata: f64,
    ) -> CoregResult<PathBuf> {
        let mut raster = self.io.read(path).map_err(|e| as_conditioning(path, e))?;
        if !raster.data_type.can_represent(new_nodata) {
            return Err(CoregError::conditioning(
                path,
                format!("no-data value {} does not fit {:?}", new_nodata, raster.data_type),
            ));
        }
        let old_nodata = raster.nodata;
        let replaced = raster.substitute_nodata(new_nodata);
        log::debug!(
            "{}: no-data {:?} -> {} ({} samples rewritten)",
            path.display(),
            old_nodata,
            new_nodata,
            replaced
        );

        match output {
            Some(output) => {
                if let Some(parent) = output.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                self.io.write(output, &raster)?;
                Ok(output.to_path_buf())
            }
            None => {
                let dir = match path.parent() {
                    Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
                    _ => PathBuf::from("."),
                };
                // Removed on drop unless the rename below succeeded
                let temp = tempfile::Builder::new()
                    .prefix(".nodata_")
                    .suffix(".tif")
                    .tempfile_in(&dir)?
                    .into_temp_path();
                self.io.write(&temp, &raster)?;
                self.io.rename(&temp, path)?;
                Ok(path.to_path_buf())
            }
        }
    }
}

fn same_crs(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

fn as_conditioning(path: &Path, error: CoregError) -> CoregError {
    match error {
        CoregError::Conditioning { .. } => error,
        other => CoregError::conditioning(path, other),
    }
}

pub(crate) fn file_name(path: &Path) -> CoregResult<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| CoregError::conditioning(path, "path has no file name"))
}

pub(crate) fn stem(path: &Path) -> CoregResult<String> {
    path.file_stem()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| CoregError::conditioning(path, "path has no file name"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::memory::MemoryRasterIo;
    use crate::io::raster::{Raster, RasterDataType};
    use crate::types::GeoTransform;
    use ndarray::Array3;
    use tempfile::TempDir;

    fn raster(crs: &str, nodata: Option<f64>) -> Raster {
        Raster {
            bands: Array3::from_shape_vec(
                (1, 2, 2),
                vec![f64::NEG_INFINITY, 10.0, 20.0, f64::NEG_INFINITY],
            )
            .unwrap(),
            geo_transform: GeoTransform::from_gdal([0.0, 10.0, 0.0, 100.0, 0.0, -10.0]),
            crs: crs.to_string(),
            nodata,
            data_type: RasterDataType::Float32,
            compression: None,
        }
    }

    #[test]
    fn test_condition_same_crs() {
        let dir = TempDir::new().unwrap();
        let io = MemoryRasterIo::new();
        let reference = dir.path().join("ref_ms.tif");
        let target = dir.path().join("2023-01-01-00-00-00_S2_ms.tif");
        io.insert(&reference, raster("EPSG:32610", Some(f64::NEG_INFINITY)));
        io.insert(&target, raster("EPSG:32610", Some(f64::NEG_INFINITY)));

        let workspace = dir.path().join("work");
        let pair = RasterConditioner::new(&io)
            .condition(&reference, &target, &workspace)
            .unwrap();

        assert_eq!(pair.crs_info, CrsInfo::unchanged());
        assert!(pair.reference.starts_with(&workspace));
        assert!(pair.target.starts_with(&workspace));

        let ready = io.get(&pair.target).unwrap();
        assert_eq!(ready.nodata, Some(0.0));
        assert_eq!(ready.bands[[0, 0, 0]], 0.0);
        assert_eq!(ready.bands[[0, 0, 1]], 10.0);

        // originals untouched
        let original = io.get(&target).unwrap();
        assert_eq!(original.nodata, Some(f64::NEG_INFINITY));
    }

    #[test]
    fn test_condition_reprojects_target() {
        let dir = TempDir::new().unwrap();
        let io = MemoryRasterIo::new();
        let reference = dir.path().join("ref.tif");
        let target = dir.path().join("target_ms.tif");
        io.insert(&reference, raster("EPSG:32610", None));
        io.insert(&target, raster("EPSG:32611", None));

        let pair = RasterConditioner::new(&io)
            .condition(&reference, &target, &dir.path().join("work"))
            .unwrap();

        assert_eq!(pair.crs_info, CrsInfo::converted("EPSG:32610"));
        assert_eq!(io.get(&pair.target).unwrap().crs, "EPSG:32610");
    }

    #[test]
    fn test_unreadable_target_is_conditioning_error() {
        let dir = TempDir::new().unwrap();
        let io = MemoryRasterIo::new();
        let reference = dir.path().join("ref.tif");
        io.insert(&reference, raster("EPSG:32610", None));

        let err = RasterConditioner::new(&io)
            .condition(&reference, &dir.path().join("missing.tif"), dir.path())
            .unwrap_err();
        assert!(matches!(err, CoregError::Conditioning { .. }));
    }

    #[test]
    fn test_missing_crs_is_conditioning_error() {
        let dir = TempDir::new().unwrap();
        let io = MemoryRasterIo::new();
        let reference = dir.path().join("ref.tif");
        let target = dir.path().join("target.tif");
        io.insert(&reference, raster("EPSG:32610", None));
        io.insert(&target, raster("", None));

        let err = RasterConditioner::new(&io)
            .condition(&reference, &target, dir.path())
            .unwrap_err();
        assert!(matches!(err, CoregError::Conditioning { .. }));
    }

    #[test]
    fn test_in_place_update_swaps_atomically() {
        let dir = TempDir::new().unwrap();
        let io = MemoryRasterIo::new();
        let path = dir.path().join("scene_ms.tif");
        io.insert(&path, raster("EPSG:32610", Some(f64::NEG_INFINITY)));

        let result = RasterConditioner::new(&io)
            .update_nodata(&path, None, 0.0)
            .unwrap();

        assert_eq!(result, path);
        assert_eq!(io.get(&path).unwrap().nodata, Some(0.0));
        // only the original path remains in the store
        assert_eq!(io.paths(), vec![path]);
    }

    #[test]
    fn test_in_place_failure_keeps_original() {
        let dir = TempDir::new().unwrap();
        let io = MemoryRasterIo::new();
        let path = dir.path().join("scene_ms.tif");
        let mut r = raster("EPSG:32610", Some(f64::NEG_INFINITY));
        r.data_type = RasterDataType::UInt8;
        io.insert(&path, r.clone());

        let err = RasterConditioner::new(&io)
            .update_nodata(&path, None, -1.0)
            .unwrap_err();
        assert!(matches!(err, CoregError::Conditioning { .. }));
        assert_eq!(io.get(&path).unwrap().nodata, r.nodata);
    }
}
