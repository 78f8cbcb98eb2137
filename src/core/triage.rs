//! Setting rejected coregistrations aside.

use crate::core::filter::FilterTable;
use crate::settings::{TriageMode, TriageSettings};
use crate::types::CoregResult;
use indexmap::IndexMap;
use std::path::{Path, PathBuf};

/// Quarantine folder inside the coregistered directory
pub const FAILED_DIR: &str = "failed_coregistration";

/// Folder of the primary multispectral rasters inside a group directory
const PRIMARY_FOLDER: &str = "ms";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TriageReport {
    pub passed: usize,
    /// Failed files moved or copied into quarantine
    pub quarantined: usize,
    /// Failed files whose unregistered original was put back
    pub replaced: usize,
    /// Failed files with nothing to quarantine
    pub missing: usize,
}

/// Failed filenames per group, in table order
pub fn failed_files_by_group(table: &FilterTable) -> IndexMap<Option<String>, Vec<String>> {
    let mut failed: IndexMap<Option<String>, Vec<String>> = IndexMap::new();
    for row in table.failed_rows() {
        failed
            .entry(row.satellite.clone())
            .or_default()
            .push(row.filename.clone());
    }
    failed
}

/// Where a file of `group` lives below `base`: `<base>/<group>/ms` or `<base>` when flat
fn primary_dir(base: &Path, group: Option<&str>) -> PathBuf {
    match group {
        Some(group) => base.join(group).join(PRIMARY_FOLDER),
        None => base.to_path_buf(),
    }
}

/// Move (or copy) every failed file into `failed_coregistration/<group>/`.
///
/// The move/copy flags are validated before any file is touched. With `replace`, the
/// unregistered original of each failed file is copied to where the rejected output was.
pub fn triage(
    table: &FilterTable,
    coregistered_dir: &Path,
    unregistered_dir: &Path,
    settings: &TriageSettings,
) -> CoregResult<TriageReport> {
    let mode = settings.mode()?;
    let mut report = TriageReport {
        passed: table.counts().passed,
        ..TriageReport::default()
    };

    for (group, filenames) in failed_files_by_group(table) {
        let group = group.as_deref();
        let source_dir = primary_dir(coregistered_dir, group);
        let quarantine = match group {
            Some(group) => coregistered_dir.join(FAILED_DIR).join(group),
            None => coregistered_dir.join(FAILED_DIR),
        };
        std::fs::create_dir_all(&quarantine)?;

        for filename in &filenames {
            let src = source_dir.join(filename);
            let dst = quarantine.join(filename);
            if !src.is_file() {
                log::warn!("Failed file {} not found, nothing to set aside", src.display());
                report.missing += 1;
            } else {
                match mode {
                    TriageMode::Copy => {
                        std::fs::copy(&src, &dst)?;
                    }
                    TriageMode::Move => move_file(&src, &dst)?,
                }
                log::debug!("{:?} {} -> {}", mode, src.display(), dst.display());
                report.quarantined += 1;
            }

            if settings.replace {
                let original = primary_dir(unregistered_dir, group).join(filename);
                if original.is_file() {
                    std::fs::create_dir_all(&source_dir)?;
                    std::fs::copy(&original, &src)?;
                    report.replaced += 1;
                } else {
                    log::warn!("Original {} not found, cannot replace", original.display());
                }
            }
        }
    }

    log::info!(
        "Triage ({:?}): {} passed, {} set aside, {} replaced, {} missing",
        mode,
        report.passed,
        report.quarantined,
        report.replaced,
        report.missing
    );
    Ok(report)
}

/// Rename, falling back to copy and delete across file systems
pub(crate) fn move_file(src: &Path, dst: &Path) -> CoregResult<()> {
    if std::fs::rename(src, dst).is_err() {
        std::fs::copy(src, dst)?;
        std::fs::remove_file(src)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::filter::FilterRow;
    use crate::types::{CoregError, CoregistrationRecord};
    use tempfile::TempDir;

    fn table() -> FilterTable {
        let mut bad = FilterRow::new(
            "bad_ms.tif",
            Some("S2".to_string()),
            CoregistrationRecord::default(),
        );
        bad.reject("test");
        let good = FilterRow::new(
            "good_ms.tif",
            Some("S2".to_string()),
            CoregistrationRecord::default(),
        );
        FilterTable::from_rows(vec![bad, good])
    }

    fn session(dir: &Path) -> (PathBuf, PathBuf) {
        let coregistered = dir.join("coregistered");
        let unregistered = dir.join("session");
        for base in [&coregistered, &unregistered] {
            std::fs::create_dir_all(base.join("S2").join("ms")).unwrap();
            for name in ["bad_ms.tif", "good_ms.tif"] {
                std::fs::write(base.join("S2").join("ms").join(name), base.to_string_lossy().as_bytes())
                    .unwrap();
            }
        }
        (coregistered, unregistered)
    }

    #[test]
    fn test_move_quarantines_failed_file() {
        let dir = TempDir::new().unwrap();
        let (coregistered, unregistered) = session(dir.path());

        let report = triage(&table(), &coregistered, &unregistered, &TriageSettings::default()).unwrap();

        assert_eq!(report.quarantined, 1);
        assert!(!coregistered.join("S2/ms/bad_ms.tif").exists());
        assert!(coregistered.join("failed_coregistration/S2/bad_ms.tif").exists());
        assert!(coregistered.join("S2/ms/good_ms.tif").exists());
    }

    #[test]
    fn test_copy_with_replace_restores_original() {
        let dir = TempDir::new().unwrap();
        let (coregistered, unregistered) = session(dir.path());
        let settings = TriageSettings {
            copy_only: true,
            move_only: false,
            replace: true,
        };

        let report = triage(&table(), &coregistered, &unregistered, &settings).unwrap();

        assert_eq!(report.replaced, 1);
        let quarantined =
            std::fs::read_to_string(coregistered.join("failed_coregistration/S2/bad_ms.tif")).unwrap();
        assert_eq!(quarantined, coregistered.to_string_lossy());
        let restored = std::fs::read_to_string(coregistered.join("S2/ms/bad_ms.tif")).unwrap();
        assert_eq!(restored, unregistered.to_string_lossy());
    }

    #[test]
    fn test_conflicting_flags_touch_nothing() {
        let dir = TempDir::new().unwrap();
        let (coregistered, unregistered) = session(dir.path());
        let settings = TriageSettings {
            copy_only: true,
            move_only: true,
            replace: false,
        };

        let err = triage(&table(), &coregistered, &unregistered, &settings).unwrap_err();
        assert!(matches!(err, CoregError::Configuration(_)));
        assert!(!coregistered.join(FAILED_DIR).exists());
        assert!(coregistered.join("S2/ms/bad_ms.tif").exists());
    }

    #[test]
    fn test_flat_layout() {
        let dir = TempDir::new().unwrap();
        let coregistered = dir.path().join("coregistered");
        std::fs::create_dir_all(&coregistered).unwrap();
        std::fs::write(coregistered.join("x_AnalyticMS_toar_clip.tif"), b"x").unwrap();
        let mut row = FilterRow::new("x_AnalyticMS_toar_clip.tif", None, CoregistrationRecord::default());
        row.reject("test");

        triage(
            &FilterTable::from_rows(vec![row]),
            &coregistered,
            dir.path(),
            &TriageSettings::default(),
        )
        .unwrap();
        assert!(coregistered
            .join("failed_coregistration/x_AnalyticMS_toar_clip.tif")
            .exists());
    }
}
