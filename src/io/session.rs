//! Session directory conventions: satellite and date tokens in file names, the
//! `coregistered` output tree and the session config file.

use crate::types::{CoregError, CoregResult};
use chrono::NaiveDateTime;
use indexmap::IndexMap;
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Name of the output tree inside a session directory
pub const COREGISTERED_DIR: &str = "coregistered";

const DATE_FORMAT: &str = "%Y-%m-%d-%H-%M-%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Satellite {
    L5,
    L7,
    L8,
    L9,
    S2,
    Planet,
}

impl Satellite {
    /// Satellites whose code appears as a token in downloaded file names
    pub const TAGGED: [Satellite; 5] = [
        Satellite::L5,
        Satellite::L7,
        Satellite::L8,
        Satellite::L9,
        Satellite::S2,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Satellite::L5 => "L5",
            Satellite::L7 => "L7",
            Satellite::L8 => "L8",
            Satellite::L9 => "L9",
            Satellite::S2 => "S2",
            Satellite::Planet => "planet",
        }
    }

    /// Band folders besides `ms`, `mask` and `meta`
    pub fn extra_folders(&self) -> &'static [&'static str] {
        match self {
            Satellite::S2 => &["swir"],
            Satellite::L7 | Satellite::L8 | Satellite::L9 => &["pan"],
            Satellite::Planet => &["nir"],
            Satellite::L5 => &[],
        }
    }
}

impl fmt::Display for Satellite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Satellite {
    type Err = CoregError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "L5" => Ok(Satellite::L5),
            "L7" => Ok(Satellite::L7),
            "L8" => Ok(Satellite::L8),
            "L9" => Ok(Satellite::L9),
            "S2" => Ok(Satellite::S2),
            "PLANET" => Ok(Satellite::Planet),
            _ => Err(CoregError::Configuration(format!(
                "satellite '{}' not recognized",
                s
            ))),
        }
    }
}

/// Satellite code carried in a file name as `_<code>_` or `_<code>.` (any case)
pub fn find_satellite_in_filename(filename: &str) -> Option<Satellite> {
    Satellite::TAGGED.into_iter().find(|satellite| {
        Regex::new(&format!(r"(?i)_{}(?:[_.]|$)", satellite.as_str()))
            .map(|re| re.is_match(filename))
            .unwrap_or(false)
    })
}

/// Leading `YYYY-MM-DD-HH-MM-SS` acquisition time, if it is a real timestamp
pub fn extract_date_from_filename(filename: &str) -> Option<String> {
    let re = Regex::new(r"^\d{4}-\d{2}-\d{2}-\d{2}-\d{2}-\d{2}").ok()?;
    let date = re.find(filename)?.as_str();
    NaiveDateTime::parse_from_str(date, DATE_FORMAT).ok()?;
    Some(date.to_string())
}

/// Acquisition dates per satellite of the `*.<extension>` files in `directory`.
///
/// Used on a folder of curated previews: whatever survived curation decides which
/// multispectral scenes get coregistered. Every tagged satellite has an entry.
pub fn filtered_dates_by_satellite(
    directory: &Path,
    extension: &str,
) -> CoregResult<IndexMap<Satellite, BTreeSet<String>>> {
    let mut dates: IndexMap<Satellite, BTreeSet<String>> = Satellite::TAGGED
        .into_iter()
        .map(|s| (s, BTreeSet::new()))
        .collect();

    for entry in std::fs::read_dir(directory)? {
        let path = entry?.path();
        if !has_extension(&path, extension) {
            continue;
        }
        let Some(filename) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let (Some(date), Some(satellite)) = (
            extract_date_from_filename(filename),
            find_satellite_in_filename(filename),
        ) else {
            continue;
        };
        if let Some(set) = dates.get_mut(&satellite) {
            set.insert(date);
        }
    }
    Ok(dates)
}

/// Files in `directory` ending in `suffix` whose acquisition date is in `dates`, sorted
pub fn files_for_dates(
    directory: &Path,
    suffix: &str,
    dates: &BTreeSet<String>,
) -> CoregResult<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(directory)? {
        let path = entry?.path();
        let Some(filename) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !filename.ends_with(suffix) {
            continue;
        }
        if extract_date_from_filename(filename).is_some_and(|d| dates.contains(&d)) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn has_extension(path: &Path, extension: &str) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case(extension.trim_start_matches('.')))
        .unwrap_or(false)
}

/// Create `<session>/coregistered` with one band tree per satellite.
///
/// Satellite names are checked before anything is created.
pub fn create_coregistered_directory(session_dir: &Path, satellites: &[&str]) -> CoregResult<PathBuf> {
    let parsed = satellites
        .iter()
        .map(|s| s.parse::<Satellite>())
        .collect::<CoregResult<Vec<_>>>()?;

    let root = session_dir.join(COREGISTERED_DIR);
    std::fs::create_dir_all(root.join("jpg_files").join("preprocessed"))?;
    for satellite in parsed {
        let base = root.join(satellite.as_str());
        for folder in ["ms", "mask", "meta"]
            .iter()
            .chain(satellite.extra_folders().iter())
        {
            std::fs::create_dir_all(base.join(folder))?;
        }
    }
    log::info!("Created coregistered directory {}", root.display());
    Ok(root)
}

/// Write a copy of the session config to `output_dir/config.json` that points every ROI
/// at its coregistered sub-directory and records the coregistration settings.
pub fn save_coregistered_config(
    config_path: &Path,
    output_dir: &Path,
    settings: &Value,
) -> CoregResult<PathBuf> {
    let text = std::fs::read_to_string(config_path)?;
    let mut config: Value = serde_json::from_str(&text)?;
    let object = config.as_object_mut().ok_or_else(|| {
        CoregError::InvalidFormat(format!("{} is not a JSON object", config_path.display()))
    })?;

    let roi_ids: Vec<String> = object
        .get("roi_ids")
        .and_then(Value::as_array)
        .map(|ids| {
            ids.iter()
                .filter_map(|id| match id {
                    Value::String(s) => Some(s.clone()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();

    for roi_id in roi_ids {
        let Some(inputs) = object.get_mut(&roi_id).and_then(Value::as_object_mut) else {
            log::warn!("ROI {} listed in roi_ids has no entry", roi_id);
            continue;
        };
        let sitename = inputs
            .get("sitename")
            .and_then(Value::as_str)
            .ok_or_else(|| CoregError::InvalidFormat(format!("ROI {} has no sitename", roi_id)))?;
        let coregistered = format!("{}{}{}", sitename, std::path::MAIN_SEPARATOR, COREGISTERED_DIR);
        inputs.insert("sitename".to_string(), Value::String(coregistered));
    }
    object.insert("coregistered_settings".to_string(), settings.clone());

    std::fs::create_dir_all(output_dir)?;
    let new_path = output_dir.join("config.json");
    std::fs::write(&new_path, serde_json::to_string_pretty(&config)?)?;
    Ok(new_path)
}
