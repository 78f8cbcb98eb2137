//! Persisted result file and the filtered table export.

use crate::core::aggregate::ResultSet;
use crate::core::filter::{FilterRow, FilterTable};
use crate::types::CoregResult;
use serde::Serialize;
use std::io::Write;
use std::path::Path;

/// Write `results` as indented JSON, `settings` last
pub fn save_results(path: &Path, results: &ResultSet) -> CoregResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut buffer = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut buffer, formatter);
    results.serialize(&mut serializer)?;
    std::fs::write(path, buffer)?;
    log::debug!("Saved {} records to {}", results.len(), path.display());
    Ok(())
}

pub fn load_results(path: &Path) -> CoregResult<ResultSet> {
    let text = std::fs::read_to_string(path)?;
    let results: ResultSet = serde_json::from_str(&text)?;
    log::debug!("Loaded {} records from {}", results.len(), path.display());
    Ok(results)
}

const RECORD_COLUMNS: [&str; 12] = [
    "original_ssim",
    "coregistered_ssim",
    "change_ssim",
    "shift_x",
    "shift_y",
    "shift_x_meters",
    "shift_y_meters",
    "shift_reliability",
    "window_size",
    "success",
    "crs",
    "crs_converted",
];

/// Column names for `table`: `filename` first, then the record fields, then the
/// filter columns present on this table
pub fn csv_header(table: &FilterTable) -> Vec<&'static str> {
    let mut header = vec!["filename"];
    header.extend(RECORD_COLUMNS);
    if table.is_grouped() {
        header.push("satellite");
    }
    header.push("filter_passed");
    header.push("filter_description");
    if table.has_z_scores() {
        header.push("z_score");
    }
    header
}

fn csv_row(row: &FilterRow, table: &FilterTable) -> Vec<String> {
    let r = &row.record;
    let mut fields = vec![
        row.filename.clone(),
        optional_float(r.original_ssim),
        optional_float(r.coregistered_ssim),
        float(r.change_ssim),
        optional(r.shift_x),
        optional(r.shift_y),
        optional_float(r.shift_x_meters),
        optional_float(r.shift_y_meters),
        optional_float(r.shift_reliability),
        r.window_size.to_string(),
        python_bool(r.success),
        r.crs.clone().unwrap_or_default(),
        python_bool(r.crs_converted),
    ];
    if table.is_grouped() {
        fields.push(row.satellite.clone().unwrap_or_default());
    }
    fields.push(python_bool(row.passed()));
    fields.push(row.description().unwrap_or_default().to_string());
    if table.has_z_scores() {
        fields.push(optional_float(row.z_score));
    }
    fields
}

fn optional<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

/// Floats keep their decimal point, so `20.0` is not written as `20`
fn float(value: f64) -> String {
    format!("{:?}", value)
}

fn optional_float(value: Option<f64>) -> String {
    value.map(float).unwrap_or_default()
}

/// Booleans as the readers of these tables expect them
fn python_bool(value: bool) -> String {
    let text = if value { "True" } else { "False" };
    text.to_string()
}

fn escape(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Export the filter table as CSV, one row per file
pub fn write_filter_csv(path: &Path, table: &FilterTable) -> CoregResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut out = std::io::BufWriter::new(std::fs::File::create(path)?);
    writeln!(out, "{}", csv_header(table).join(","))?;
    for row in table.rows() {
        let fields: Vec<String> = csv_row(row, table).iter().map(|f| escape(f)).collect();
        writeln!(out, "{}", fields.join(","))?;
    }
    out.flush()?;
    log::info!("Filtered table ({} rows) written to {}", table.len(), path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::aggregate::aggregate;
    use crate::core::filter::{apply_filters, FilterChain, FilterStage};
    use crate::core::orchestrator::CoregisteredFile;
    use crate::types::{CoregistrationRecord, WindowSize};
    use serde_json::json;
    use tempfile::TempDir;

    fn results() -> ResultSet {
        let record = CoregistrationRecord {
            shift_x: Some(2),
            shift_y: Some(-1),
            shift_x_meters: Some(20.0),
            shift_y_meters: Some(-10.0),
            shift_reliability: Some(55.5),
            window_size: WindowSize::new(40, 60),
            success: true,
            ..CoregistrationRecord::default()
        };
        aggregate(
            vec![(
                "L8",
                vec![CoregisteredFile {
                    filename: "a_ms.tif".to_string(),
                    record,
                }],
            )],
            json!({"ws": [256, 256], "nodata": [0, 0]}),
        )
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("transformation_results.json");
        let set = results();
        save_results(&path, &set).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("    \"L8\""));
        assert!(text.trim_end().ends_with('}'));
        assert!(text.rfind("\"settings\"").unwrap() > text.rfind("a_ms.tif").unwrap());
        assert_eq!(load_results(&path).unwrap(), set);
    }

    #[test]
    fn test_csv_layout() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("filtered_files.csv");
        let table = apply_filters(
            FilterTable::from_result_set(&results()),
            &FilterChain::new().with_stage(FilterStage::WindowSize { min_pixels: 50 }),
        );
        write_filter_csv(&path, &table).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next().unwrap(),
            "filename,original_ssim,coregistered_ssim,change_ssim,shift_x,shift_y,\
             shift_x_meters,shift_y_meters,shift_reliability,window_size,success,crs,\
             crs_converted,satellite,filter_passed,filter_description"
        );
        assert_eq!(
            lines.next().unwrap(),
            "a_ms.tif,0.0,0.0,0.0,2,-1,20.0,-10.0,55.5,\"[40, 60]\",True,,False,L8,False,\
             \"window size [40, 60] below 50; \""
        );
    }
}
