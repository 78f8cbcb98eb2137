use approx::assert_relative_eq;
use coastreg::core::{FilterRow, FilterTable, ShiftPropagator};
use coastreg::io::raster::RasterDataType;
use coastreg::io::{MemoryRasterIo, Raster, Satellite};
use coastreg::settings::PropagationSettings;
use coastreg::types::{CoregistrationRecord, GeoTransform};
use ndarray::Array3;
use std::path::Path;
use tempfile::TempDir;

const STEM: &str = "2023-12-09-18-40-32_L9_site";

fn raster(crs: &str) -> Raster {
    Raster {
        bands: Array3::from_elem((1, 3, 3), 7.0),
        geo_transform: GeoTransform::from_gdal([500000.0, 15.0, 0.0, 4200000.0, 0.0, -15.0]),
        crs: crs.to_string(),
        nodata: Some(0.0),
        data_type: RasterDataType::UInt16,
        compression: None,
    }
}

fn row(name: &str, shift: (i64, i64), passed: bool, crs: Option<&str>) -> FilterRow {
    let mut row = FilterRow::new(
        name,
        Some("L9".to_string()),
        CoregistrationRecord {
            shift_x: Some(shift.0),
            shift_y: Some(shift.1),
            success: true,
            crs: crs.map(String::from),
            crs_converted: crs.is_some(),
            ..CoregistrationRecord::default()
        },
    );
    if !passed {
        row.reject("shift reliability below 40");
    }
    row
}

fn seed(io: &MemoryRasterIo, source: &Path, stem: &str) {
    io.insert(source.join("L9/mask").join(format!("{}_mask.tif", stem)), raster("EPSG:32611"));
    io.insert(source.join("L9/pan").join(format!("{}_pan.tif", stem)), raster("EPSG:32611"));
    let meta = source.join("L9/meta");
    std::fs::create_dir_all(&meta).expect("Failed to create meta dir");
    std::fs::write(meta.join(format!("{}.txt", stem)), "acq_date\t2023-12-09")
        .expect("Failed to write meta");
}

#[test]
fn test_passed_rows_get_shifted_siblings_and_meta() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = TempDir::new().expect("Failed to create temp dir");
    let (source, coregistered) = (dir.path().to_path_buf(), dir.path().join("coregistered"));
    let io = MemoryRasterIo::new();
    seed(&io, &source, STEM);
    seed(&io, &source, "2023-12-25-18-40-32_L9_site");

    let table = FilterTable::from_rows(vec![
        row(&format!("{}_ms.tif", STEM), (2, -1), true, None),
        row("2023-12-25-18-40-32_L9_site_ms.tif", (9, 9), false, None),
    ]);
    let report = ShiftPropagator::new(&io, PropagationSettings::default())
        .propagate(&table, &coregistered, &source, &[Satellite::L9])
        .expect("Propagation failed");

    assert_eq!(report.shifted, 2);
    assert_eq!(report.meta_copied, 1);
    assert_eq!(report.missing, 0);

    let mask = io
        .get(coregistered.join("L9/mask").join(format!("{}_mask.tif", STEM)))
        .expect("Shifted mask missing");
    let gt = mask.geo_transform;
    assert_relative_eq!(gt.top_left_x, 500030.0);
    assert_relative_eq!(gt.top_left_y, 4200015.0);
    assert_eq!(mask.bands, raster("EPSG:32611").bands);
    assert_eq!(mask.compression.as_deref(), Some("LZW"));

    assert!(coregistered.join("L9/meta").join(format!("{}.txt", STEM)).is_file());
    assert!(io
        .get(coregistered.join("L9/mask/2023-12-25-18-40-32_L9_site_mask.tif"))
        .is_none());
}

#[test]
fn test_converted_crs_is_applied_before_shifting() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = TempDir::new().expect("Failed to create temp dir");
    let (source, coregistered) = (dir.path().to_path_buf(), dir.path().join("coregistered"));
    let io = MemoryRasterIo::new();
    seed(&io, &source, STEM);

    let table = FilterTable::from_rows(vec![row(
        &format!("{}_ms.tif", STEM),
        (1, 1),
        true,
        Some("EPSG:32610"),
    )]);
    ShiftPropagator::new(&io, PropagationSettings::default())
        .propagate(&table, &coregistered, &source, &[Satellite::L9])
        .expect("Propagation failed");

    let pan = io
        .get(coregistered.join("L9/pan").join(format!("{}_pan.tif", STEM)))
        .expect("Shifted pan missing");
    assert_eq!(pan.crs, "EPSG:32610");
    assert!(io
        .paths()
        .iter()
        .any(|p| p.ends_with(format!("L9/pan/new_crs/{}_pan.tif", STEM))));
}

#[test]
fn test_missing_sibling_is_skipped_and_counted() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = TempDir::new().expect("Failed to create temp dir");
    let (source, coregistered) = (dir.path().to_path_buf(), dir.path().join("coregistered"));
    let io = MemoryRasterIo::new();
    io.insert(
        source.join("L9/mask").join(format!("{}_mask.tif", STEM)),
        raster("EPSG:32611"),
    );

    let table = FilterTable::from_rows(vec![row(&format!("{}_ms.tif", STEM), (1, 0), true, None)]);
    let report = ShiftPropagator::new(&io, PropagationSettings::default())
        .propagate(&table, &coregistered, &source, &[Satellite::L9])
        .expect("Propagation failed");

    assert_eq!(report.shifted, 1);
    assert_eq!(report.missing, 1);
    assert_eq!(report.meta_copied, 0);
}

#[test]
fn test_apply_to_all_and_backfill() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = TempDir::new().expect("Failed to create temp dir");
    let (source, coregistered) = (dir.path().to_path_buf(), dir.path().join("coregistered"));
    let io = MemoryRasterIo::new();
    seed(&io, &source, STEM);

    let table = FilterTable::from_rows(vec![row(&format!("{}_ms.tif", STEM), (3, 0), false, None)]);
    let settings = PropagationSettings {
        apply_to_all: true,
        replace_failed_files: true,
    };
    let report = ShiftPropagator::new(&io, settings)
        .propagate(&table, &coregistered, &source, &[Satellite::L9])
        .expect("Propagation failed");

    assert_eq!(report.backfilled, 3);
    assert_eq!(report.shifted, 2);
    let mask = io
        .get(coregistered.join("L9/mask").join(format!("{}_mask.tif", STEM)))
        .expect("Mask missing");
    assert_relative_eq!(mask.geo_transform.top_left_x, 500045.0);
}

#[test]
fn test_groups_outside_selection_are_untouched() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = TempDir::new().expect("Failed to create temp dir");
    let (source, coregistered) = (dir.path().to_path_buf(), dir.path().join("coregistered"));
    let io = MemoryRasterIo::new();
    seed(&io, &source, STEM);

    let table = FilterTable::from_rows(vec![row(&format!("{}_ms.tif", STEM), (1, 1), true, None)]);
    let report = ShiftPropagator::new(&io, PropagationSettings::default())
        .propagate(&table, &coregistered, &source, &[Satellite::S2])
        .expect("Propagation failed");
    assert_eq!(report, Default::default());
}
