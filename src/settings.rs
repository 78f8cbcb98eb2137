//! Run configuration value objects.
//!
//! Each struct is built once per run (from defaults or a JSON config file) and handed
//! around by reference. Nothing here is mutated after construction.

use crate::types::{CoregError, CoregResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Parameters forwarded to the coregistration engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoregistrationSettings {
    /// Matching window size (width, height) in pixels
    pub ws: (u32, u32),
    /// No-data value of the (reference, target) rasters
    pub nodata: (f64, f64),
    /// Maximum admissible shift in pixels
    pub max_shift: u32,
    /// Force the window size to a power of two
    pub binary_ws: bool,
    pub progress: bool,
    /// Verbose engine output
    pub v: bool,
    /// Let the engine swallow internal errors and report `success = false`
    pub ignore_errors: bool,
    /// Output raster format
    pub fmt_out: String,
}

impl Default for CoregistrationSettings {
    fn default() -> Self {
        Self {
            ws: (256, 256),
            nodata: (0.0, 0.0),
            max_shift: 100,
            binary_ws: false,
            progress: false,
            v: false,
            ignore_errors: true,
            fmt_out: "GTiff".to_string(),
        }
    }
}

impl CoregistrationSettings {
    /// No-data value that conditioned target rasters are rewritten to
    pub fn target_nodata(&self) -> f64 {
        self.nodata.1
    }

    /// No-data value that the conditioned reference raster is rewritten to
    pub fn reference_nodata(&self) -> f64 {
        self.nodata.0
    }
}

/// Per-axis bounds on the map-unit shift
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ShiftRangeMeters {
    /// Minimum allowed (x, y) shift in meters
    pub min: (f64, f64),
    /// Maximum allowed (x, y) shift in meters
    pub max: (f64, f64),
}

/// Which quality filters run and with what thresholds.
///
/// Thresholds left as `None` disable their stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterSettings {
    /// Minimum shift reliability in percent
    pub shift_reliability: Option<f64>,
    /// Minimum window width and height in pixels
    pub window_size: Option<u32>,
    /// Maximum absolute shift in meters along either axis
    pub max_shift_meters: Option<f64>,
    pub filter_z_score: bool,
    pub z_score_threshold: f64,
    /// Compute the z-score population from rows still passing only
    pub filter_z_score_filter_passed_only: bool,
    pub shift_range_meters: Option<ShiftRangeMeters>,
}

impl Default for FilterSettings {
    fn default() -> Self {
        Self {
            shift_reliability: None,
            window_size: None,
            max_shift_meters: None,
            filter_z_score: false,
            z_score_threshold: 2.0,
            filter_z_score_filter_passed_only: false,
            shift_range_meters: None,
        }
    }
}

impl FilterSettings {
    /// Thresholds used by the batch workflow for Landsat/Sentinel-2 sessions
    pub fn recommended() -> Self {
        Self {
            shift_reliability: Some(40.0),
            window_size: Some(50),
            max_shift_meters: Some(250.0),
            filter_z_score: true,
            z_score_threshold: 2.0,
            filter_z_score_filter_passed_only: false,
            shift_range_meters: None,
        }
    }
}

/// How rejected coregistrations are set aside
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriageMode {
    Move,
    Copy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriageSettings {
    pub copy_only: bool,
    pub move_only: bool,
    /// Put the unregistered original back where the rejected file was
    pub replace: bool,
}

impl Default for TriageSettings {
    fn default() -> Self {
        Self {
            copy_only: false,
            move_only: true,
            replace: false,
        }
    }
}

impl TriageSettings {
    /// Resolve the two flags into a single mode; exactly one must be set
    pub fn mode(&self) -> CoregResult<TriageMode> {
        match (self.copy_only, self.move_only) {
            (true, false) => Ok(TriageMode::Copy),
            (false, true) => Ok(TriageMode::Move),
            _ => Err(CoregError::Configuration(
                "exactly one of 'copy_only' or 'move_only' must be true".to_string(),
            )),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PropagationSettings {
    /// Apply shifts to siblings of every file, not only the ones that passed
    pub apply_to_all: bool,
    /// Copy unregistered siblings for every file before shifts are applied
    pub replace_failed_files: bool,
}

/// Complete configuration of a run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    #[serde(alias = "coregister_settings")]
    pub coregistration: CoregistrationSettings,
    #[serde(alias = "filtering_settings")]
    pub filtering: FilterSettings,
    pub triage: TriageSettings,
    pub propagation: PropagationSettings,
}

impl PipelineConfig {
    /// Load from a JSON file; absent sections and keys take their defaults
    pub fn from_file<P: AsRef<Path>>(path: P) -> CoregResult<Self> {
        log::debug!("Loading pipeline config from {}", path.as_ref().display());
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: PipelineConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject contradictory settings before any file is touched
    pub fn validate(&self) -> CoregResult<()> {
        self.triage.mode()?;
        let (w, h) = self.coregistration.ws;
        if w == 0 || h == 0 {
            return Err(CoregError::Configuration(format!(
                "window size must be positive, got ({}, {})",
                w, h
            )));
        }
        if !self.filtering.z_score_threshold.is_finite() {
            return Err(CoregError::Configuration(
                "z_score_threshold must be finite".to_string(),
            ));
        }
        Ok(())
    }
}
