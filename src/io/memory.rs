use crate::io::raster::{Raster, RasterIo, Resampling};
use crate::types::{CoregError, CoregResult};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// In-memory raster store keyed by path.
///
/// Useful for dry runs and for exercising the pipeline without GDAL. Reprojection only
/// relabels the CRS; pixel values and the grid are left as they are.
#[derive(Debug, Default)]
pub struct MemoryRasterIo {
    rasters: RwLock<HashMap<PathBuf, Raster>>,
}

impl MemoryRasterIo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<P: AsRef<Path>>(&self, path: P, raster: Raster) {
        if let Ok(mut rasters) = self.rasters.write() {
            rasters.insert(path.as_ref().to_path_buf(), raster);
        }
    }

    pub fn get<P: AsRef<Path>>(&self, path: P) -> Option<Raster> {
        self.rasters
            .read()
            .ok()
            .and_then(|rasters| rasters.get(path.as_ref()).cloned())
    }

    /// Paths currently held, sorted
    pub fn paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self
            .rasters
            .read()
            .map(|rasters| rasters.keys().cloned().collect())
            .unwrap_or_default();
        paths.sort();
        paths
    }

    fn poisoned() -> CoregError {
        CoregError::InvalidFormat("in-memory raster store lock poisoned".to_string())
    }
}

impl RasterIo for MemoryRasterIo {
    fn read(&self, path: &Path) -> CoregResult<Raster> {
        self.get(path).ok_or_else(|| {
            CoregError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no raster at {}", path.display()),
            ))
        })
    }

    fn write(&self, path: &Path, raster: &Raster) -> CoregResult<()> {
        let mut rasters = self.rasters.write().map_err(|_| Self::poisoned())?;
        rasters.insert(path.to_path_buf(), raster.clone());
        Ok(())
    }

    fn crs(&self, path: &Path) -> CoregResult<String> {
        let raster = self.read(path)?;
        if raster.crs.trim().is_empty() {
            return Err(CoregError::conditioning(path, "raster has no CRS"));
        }
        Ok(raster.crs)
    }

    fn reproject(
        &self,
        src: &Path,
        dst: &Path,
        target_crs: &str,
        _resampling: Resampling,
    ) -> CoregResult<()> {
        let mut raster = self.read(src)?;
        raster.crs = target_crs.to_string();
        self.write(dst, &raster)
    }

    fn exists(&self, path: &Path) -> bool {
        self.rasters
            .read()
            .map(|rasters| rasters.contains_key(path))
            .unwrap_or(false)
    }

    fn rename(&self, from: &Path, to: &Path) -> CoregResult<()> {
        let mut rasters = self.rasters.write().map_err(|_| Self::poisoned())?;
        let raster = rasters.remove(from).ok_or_else(|| {
            CoregError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no raster at {}", from.display()),
            ))
        })?;
        rasters.insert(to.to_path_buf(), raster);
        Ok(())
    }

    fn copy(&self, from: &Path, to: &Path) -> CoregResult<()> {
        let raster = self.read(from)?;
        self.write(to, &raster)
    }
}
