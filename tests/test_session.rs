use coastreg::core::pipeline::{FILTERED_TABLE_FILE, README_FILE, RESULTS_FILE};
use coastreg::core::{
    postprocess, CoregistrationEngine, CoregistrationOrchestrator, EngineResult, SessionRunner,
};
use coastreg::io::raster::RasterDataType;
use coastreg::io::{load_results, MemoryRasterIo, Raster, Satellite};
use coastreg::settings::{CoregistrationSettings, FilterSettings, PipelineConfig};
use coastreg::types::{CoregError, CoregResult, GeoTransform};
use ndarray::Array3;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// Converges on every target except those with `bad` in the name, which get a poor
/// reliability, and `crash`, which errors
struct ScriptedEngine;

impl CoregistrationEngine for ScriptedEngine {
    fn estimate(
        &self,
        _reference: &Path,
        target: &Path,
        output: &Path,
        _settings: &CoregistrationSettings,
    ) -> CoregResult<EngineResult> {
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if name.contains("crash") {
            return Err(CoregError::Engine("no correlation peak".to_string()));
        }
        std::fs::write(output, name.as_bytes())?;
        Ok(EngineResult {
            success: true,
            shift_px: Some((1.0, -1.0)),
            shift_map: Some((30.0, -30.0)),
            similarity_before: Some(0.6),
            similarity_after: Some(0.8),
            reliability: Some(if name.contains("bad") { 10.0 } else { 75.0 }),
            window_size: Some((256, 256)),
        })
    }
}

fn raster(crs: &str) -> Raster {
    Raster {
        bands: Array3::from_elem((4, 8, 8), 100.0),
        geo_transform: GeoTransform::from_gdal([300000.0, 30.0, 0.0, 5000000.0, 0.0, -30.0]),
        crs: crs.to_string(),
        nodata: Some(f64::NEG_INFINITY),
        data_type: RasterDataType::Float32,
        compression: None,
    }
}

struct Session {
    _dir: TempDir,
    root: PathBuf,
    io: Arc<MemoryRasterIo>,
    reference: PathBuf,
    targets: Vec<(Satellite, Vec<PathBuf>)>,
}

fn session() -> Session {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let root = dir.path().to_path_buf();
    let io = Arc::new(MemoryRasterIo::new());
    let reference = root.join("reference.tif");
    io.insert(&reference, raster("EPSG:32610"));

    let mut targets = Vec::new();
    for (satellite, names) in [
        (Satellite::L8, vec!["2023-01-01-10-00-00_L8_good_ms.tif", "2023-01-02-10-00-00_L8_bad_ms.tif"]),
        (Satellite::S2, vec!["2023-01-03-10-00-00_S2_good_ms.tif", "2023-01-04-10-00-00_S2_crash_ms.tif"]),
    ] {
        let mut paths = Vec::new();
        for name in names {
            let path = root.join(satellite.as_str()).join("ms").join(name);
            io.insert(&path, raster("EPSG:32611"));
            let mask = root
                .join(satellite.as_str())
                .join("mask")
                .join(name.replace("_ms.", "_mask."));
            io.insert(&mask, raster("EPSG:32611"));
            paths.push(path);
        }
        targets.push((satellite, paths));
    }

    Session {
        _dir: dir,
        root,
        io,
        reference,
        targets,
    }
}

fn runner(session: &Session) -> SessionRunner {
    SessionRunner::new(CoregistrationOrchestrator::new(
        Arc::new(ScriptedEngine),
        session.io.clone(),
        CoregistrationSettings::default(),
        session.root.join("workspace"),
    ))
}

#[test]
fn test_grouped_run_records_every_target() {
    let _ = env_logger::builder().is_test(true).try_init();
    let session = session();
    let coregistered = session.root.join("coregistered");

    let results = runner(&session)
        .run_grouped(&session.reference, &session.targets, &coregistered)
        .expect("Session run failed");

    assert_eq!(results.group_names(), vec!["L8", "S2"]);
    assert_eq!(results.len(), 4);
    for (group, name, record) in results.records() {
        println!("{:?} {} success={} crs={:?}", group, name, record.success, record.crs);
        assert_eq!(record.success, !name.contains("crash"));
        if record.success {
            assert_eq!(record.crs.as_deref(), Some("EPSG:32610"));
            assert!(record.crs_converted);
            assert_eq!((record.shift_x, record.shift_y), (Some(1), Some(-1)));
        }
    }
    assert!(!coregistered
        .join("S2/ms/2023-01-04-10-00-00_S2_crash_ms.tif")
        .exists());

    let saved = load_results(&coregistered.join(RESULTS_FILE)).expect("Results not saved");
    assert_eq!(saved, results);
    assert_eq!(saved.settings["ws"], serde_json::json!([256, 256]));
}

#[cfg(feature = "parallel")]
#[test]
fn test_parallel_run_matches_sequential() {
    let _ = env_logger::builder().is_test(true).try_init();
    let session = session();

    let sequential = runner(&session)
        .run_grouped(&session.reference, &session.targets, &session.root.join("seq"))
        .expect("Sequential run failed");
    let parallel = runner(&session)
        .parallel(true)
        .run_grouped(&session.reference, &session.targets, &session.root.join("par"))
        .expect("Parallel run failed");
    assert_eq!(sequential, parallel);
}

#[test]
fn test_postprocess_filters_triages_and_propagates() {
    let _ = env_logger::builder().is_test(true).try_init();
    let session = session();
    let coregistered = session.root.join("coregistered");
    let results = runner(&session)
        .run_grouped(&session.reference, &session.targets, &coregistered)
        .expect("Session run failed");

    let config = PipelineConfig {
        filtering: FilterSettings {
            shift_reliability: Some(40.0),
            window_size: Some(50),
            max_shift_meters: Some(250.0),
            ..FilterSettings::default()
        },
        ..PipelineConfig::default()
    };
    let (table, summary) = postprocess(
        &results,
        &config,
        session.io.as_ref(),
        &coregistered,
        &session.root,
        &[Satellite::L8, Satellite::S2],
    )
    .expect("Post-processing failed");

    let passed: Vec<&str> = table.passed_rows().map(|r| r.filename.as_str()).collect();
    assert_eq!(
        passed,
        vec!["2023-01-01-10-00-00_L8_good_ms.tif", "2023-01-03-10-00-00_S2_good_ms.tif"]
    );
    assert_eq!(summary.total.failed, 2);
    assert_eq!(summary.successful, 3);

    // The rejected L8 output is set aside, the crashed S2 target never had one
    assert!(coregistered
        .join("failed_coregistration/L8/2023-01-02-10-00-00_L8_bad_ms.tif")
        .exists());
    let triage = summary.triage.expect("No triage report");
    assert_eq!((triage.quarantined, triage.missing), (1, 1));

    // Accepted shifts reach the CRS-converted mask siblings
    let propagation = summary.propagation.expect("No propagation report");
    assert_eq!(propagation.shifted, 2);
    let mask = session
        .io
        .get(coregistered.join("L8/mask/2023-01-01-10-00-00_L8_good_mask.tif"))
        .expect("Shifted mask missing");
    assert_eq!(mask.crs, "EPSG:32610");

    assert!(coregistered.join(FILTERED_TABLE_FILE).is_file());
    let readme = std::fs::read_to_string(coregistered.join(README_FILE)).expect("No readme");
    assert!(readme.contains("Total number of coregistrations: 4"));
}
