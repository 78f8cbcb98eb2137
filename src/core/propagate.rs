//! Re-applying accepted shifts to the companion rasters of each scene.
//!
//! A multispectral primary `<stem>_ms.tif` has siblings `<stem>_mask.tif`, and per
//! satellite `<stem>_pan.tif` or `<stem>_swir.tif`, each in a folder named after the
//! band, plus a `<stem>.txt` metadata file. Planet scenes sit in one flat directory and
//! pair `*_AnalyticMS_toar_clip.tif` with `*_udm2_clip.tif`.

use crate::core::filter::{FilterRow, FilterTable};
use crate::io::raster::{RasterIo, Resampling};
use crate::io::session::Satellite;
use crate::settings::PropagationSettings;
use crate::types::CoregResult;
use std::path::{Path, PathBuf};

const PRIMARY_TAG: &str = "_ms.";
const PLANET_PRIMARY: &str = "AnalyticMS_toar_clip";
const PLANET_MASK: &str = "udm2_clip";

/// A companion raster of a primary file, relative to the group directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sibling {
    /// Band folder; `None` for siblings stored beside the primary
    pub folder: Option<&'static str>,
    pub filename: String,
    /// Whether the values are class labels, which must not be interpolated
    pub categorical: bool,
}

impl Sibling {
    pub fn relative_path(&self) -> PathBuf {
        match self.folder {
            Some(folder) => Path::new(folder).join(&self.filename),
            None => PathBuf::from(&self.filename),
        }
    }
}

/// How sibling file names are derived from a primary file name
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SiblingPolicy {
    /// Band folders under a satellite directory
    Banded { folders: Vec<&'static str> },
    /// Planet flat directory
    Planet,
}

impl SiblingPolicy {
    pub fn for_satellite(satellite: Satellite) -> Self {
        match satellite {
            Satellite::Planet => SiblingPolicy::Planet,
            other => {
                let mut folders = vec!["mask"];
                folders.extend(
                    other
                        .extra_folders()
                        .iter()
                        .copied()
                        .filter(|f| *f == "pan" || *f == "swir"),
                );
                SiblingPolicy::Banded { folders }
            }
        }
    }

    /// Raster siblings of `primary`; empty when the name does not follow the convention
    pub fn raster_siblings(&self, primary: &str) -> Vec<Sibling> {
        match self {
            SiblingPolicy::Banded { folders } => folders
                .iter()
                .filter_map(|folder| {
                    band_sibling_name(primary, folder).map(|filename| Sibling {
                        folder: Some(*folder),
                        filename,
                        categorical: *folder == "mask",
                    })
                })
                .collect(),
            SiblingPolicy::Planet => primary
                .contains(PLANET_PRIMARY)
                .then(|| Sibling {
                    folder: None,
                    filename: primary.replacen(PLANET_PRIMARY, PLANET_MASK, 1),
                    categorical: true,
                })
                .into_iter()
                .collect(),
        }
    }

    /// Metadata file of `primary` in the `meta` folder; Planet scenes have none
    pub fn meta_sibling(&self, primary: &str) -> Option<Sibling> {
        match self {
            SiblingPolicy::Banded { .. } => {
                let index = primary.rfind(PRIMARY_TAG)?;
                Some(Sibling {
                    folder: Some("meta"),
                    filename: format!("{}.txt", &primary[..index]),
                    categorical: false,
                })
            }
            SiblingPolicy::Planet => None,
        }
    }
}

/// `<stem>_ms.<ext>` → `<stem>_<band>.<ext>`
fn band_sibling_name(primary: &str, band: &str) -> Option<String> {
    let index = primary.rfind(PRIMARY_TAG)?;
    Some(format!(
        "{}_{}{}",
        &primary[..index],
        band,
        &primary[index + PRIMARY_TAG.len() - 1..]
    ))
}

/// What a propagation run did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PropagationReport {
    pub shifted: usize,
    pub meta_copied: usize,
    pub backfilled: usize,
    pub missing: usize,
    pub failed: usize,
}

pub struct ShiftPropagator<'a> {
    io: &'a dyn RasterIo,
    settings: PropagationSettings,
}

impl<'a> ShiftPropagator<'a> {
    pub fn new(io: &'a dyn RasterIo, settings: PropagationSettings) -> Self {
        Self { io, settings }
    }

    /// Shift the siblings of the accepted rows (every row with `apply_to_all`) from
    /// `source_dir` into `coregistered_dir`.
    ///
    /// Rows of a grouped table are handled only when their group is in `groups`; a flat
    /// table uses the Planet naming. Missing or unreadable siblings are logged and
    /// skipped.
    pub fn propagate(
        &self,
        table: &FilterTable,
        coregistered_dir: &Path,
        source_dir: &Path,
        groups: &[Satellite],
    ) -> CoregResult<PropagationReport> {
        let mut report = PropagationReport::default();

        let mut selected: Vec<(&FilterRow, SiblingPolicy, PathBuf, PathBuf)> = Vec::new();
        for row in table.rows() {
            let Some((policy, group_dir)) = self.group_of(row, groups) else {
                continue;
            };
            selected.push((
                row,
                policy,
                source_dir.join(&group_dir),
                coregistered_dir.join(&group_dir),
            ));
        }

        if self.settings.replace_failed_files {
            for (row, policy, source, destination) in &selected {
                let siblings = policy
                    .raster_siblings(&row.filename)
                    .into_iter()
                    .chain(policy.meta_sibling(&row.filename));
                for sibling in siblings {
                    if self.copy_sibling(&sibling, source, destination, &mut report)? {
                        report.backfilled += 1;
                    }
                }
            }
        } else {
            for (row, policy, source, destination) in &selected {
                if !row.passed() {
                    continue;
                }
                if let Some(meta) = policy.meta_sibling(&row.filename) {
                    if self.copy_meta(&meta, source, destination)? {
                        report.meta_copied += 1;
                    }
                }
            }
        }

        for (row, policy, source, destination) in &selected {
            if !(row.passed() || self.settings.apply_to_all) {
                continue;
            }
            let (Some(shift_x), Some(shift_y)) = (row.record.shift_x, row.record.shift_y) else {
                log::warn!("{} has no pixel shift; siblings left as they are", row.filename);
                continue;
            };
            for sibling in policy.raster_siblings(&row.filename) {
                let src = source.join(sibling.relative_path());
                if !self.io.exists(&src) {
                    log::warn!("Sibling {} not found, skipping", src.display());
                    report.missing += 1;
                    continue;
                }
                let dst = destination.join(sibling.relative_path());
                match self.shift_sibling(row, &sibling, &src, &dst, shift_x, shift_y) {
                    Ok(()) => report.shifted += 1,
                    Err(e) => {
                        log::warn!("Could not shift {}: {}", src.display(), e);
                        report.failed += 1;
                    }
                }
            }
        }

        log::info!(
            "Propagation: {} siblings shifted, {} meta files copied, {} backfilled, {} missing, {} failed",
            report.shifted,
            report.meta_copied,
            report.backfilled,
            report.missing,
            report.failed
        );
        Ok(report)
    }

    fn group_of(&self, row: &FilterRow, groups: &[Satellite]) -> Option<(SiblingPolicy, PathBuf)> {
        match &row.satellite {
            None => Some((SiblingPolicy::Planet, PathBuf::new())),
            Some(name) => match name.parse::<Satellite>() {
                Ok(satellite) if groups.contains(&satellite) => {
                    Some((SiblingPolicy::for_satellite(satellite), PathBuf::from(name)))
                }
                Ok(_) => None,
                Err(_) => {
                    log::warn!("Unknown group '{}' for {}, skipping", name, row.filename);
                    None
                }
            },
        }
    }

    fn shift_sibling(
        &self,
        row: &FilterRow,
        sibling: &Sibling,
        src: &Path,
        dst: &Path,
        shift_x: i64,
        shift_y: i64,
    ) -> CoregResult<()> {
        let parent = dst.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent)?;

        let mut input = src.to_path_buf();
        if let (true, Some(crs)) = (row.record.crs_converted, row.record.crs.as_deref()) {
            let reprojected = parent.join("new_crs").join(&sibling.filename);
            std::fs::create_dir_all(parent.join("new_crs"))?;
            let resampling = if sibling.categorical {
                Resampling::Nearest
            } else {
                Resampling::Bilinear
            };
            self.io.reproject(src, &reprojected, crs, resampling)?;
            input = reprojected;
        }

        let raster = self.io.read(&input)?;
        let shifted = raster.shifted(shift_x as f64, shift_y as f64);
        log::debug!(
            "{} -> {} shifted by ({}, {}) px",
            input.display(),
            dst.display(),
            shift_x,
            shift_y
        );
        self.io.write(dst, &shifted)
    }

    /// Unregistered copy of a sibling; false when the source is absent
    fn copy_sibling(
        &self,
        sibling: &Sibling,
        source: &Path,
        destination: &Path,
        report: &mut PropagationReport,
    ) -> CoregResult<bool> {
        if sibling.folder == Some("meta") {
            return self.copy_meta(sibling, source, destination);
        }
        let src = source.join(sibling.relative_path());
        if !self.io.exists(&src) {
            return Ok(false);
        }
        let dst = destination.join(sibling.relative_path());
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match self.io.copy(&src, &dst) {
            Ok(()) => Ok(true),
            Err(e) => {
                log::warn!("Could not copy {}: {}", src.display(), e);
                report.failed += 1;
                Ok(false)
            }
        }
    }

    fn copy_meta(&self, meta: &Sibling, source: &Path, destination: &Path) -> CoregResult<bool> {
        let src = source.join(meta.relative_path());
        if !src.is_file() {
            return Ok(false);
        }
        let dst = destination.join(meta.relative_path());
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(&src, &dst)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_banded_sibling_names() {
        let primary = "2023-12-09-18-40-32_L9_ID_ms1_datetime06-06-24__09_02_37_ms.tif";
        let policy = SiblingPolicy::for_satellite(Satellite::L9);
        let siblings = policy.raster_siblings(primary);
        assert_eq!(
            siblings
                .iter()
                .map(|s| s.relative_path())
                .collect::<Vec<_>>(),
            vec![
                PathBuf::from("mask/2023-12-09-18-40-32_L9_ID_ms1_datetime06-06-24__09_02_37_mask.tif"),
                PathBuf::from("pan/2023-12-09-18-40-32_L9_ID_ms1_datetime06-06-24__09_02_37_pan.tif"),
            ]
        );
        assert!(siblings[0].categorical);
        assert!(!siblings[1].categorical);
        assert_eq!(
            policy.meta_sibling(primary).unwrap().relative_path(),
            PathBuf::from("meta/2023-12-09-18-40-32_L9_ID_ms1_datetime06-06-24__09_02_37.txt")
        );
    }

    #[test]
    fn test_per_satellite_folders() {
        assert_eq!(
            SiblingPolicy::for_satellite(Satellite::S2),
            SiblingPolicy::Banded {
                folders: vec!["mask", "swir"]
            }
        );
        assert_eq!(
            SiblingPolicy::for_satellite(Satellite::L5),
            SiblingPolicy::Banded {
                folders: vec!["mask"]
            }
        );
    }

    #[test]
    fn test_planet_sibling() {
        let policy = SiblingPolicy::for_satellite(Satellite::Planet);
        let siblings = policy.raster_siblings("20200603_203636_82_1068_3B_AnalyticMS_toar_clip.tif");
        assert_eq!(siblings.len(), 1);
        assert_eq!(siblings[0].filename, "20200603_203636_82_1068_3B_udm2_clip.tif");
        assert_eq!(siblings[0].folder, None);
        assert!(policy.meta_sibling("x_AnalyticMS_toar_clip.tif").is_none());
    }

    #[test]
    fn test_unconventional_name_has_no_siblings() {
        let policy = SiblingPolicy::for_satellite(Satellite::S2);
        assert!(policy.raster_siblings("scene.tif").is_empty());
        assert!(policy.meta_sibling("scene.tif").is_none());
    }
}
