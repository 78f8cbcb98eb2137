use crate::settings::CoregistrationSettings;
use crate::types::CoregResult;
use std::path::Path;

/// What a coregistration engine reports for one target raster.
///
/// Only these fields are read by the rest of the crate; whatever else an engine
/// computes internally stays inside it.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineResult {
    pub success: bool,
    /// Shift in pixels (x, y)
    pub shift_px: Option<(f64, f64)>,
    /// Shift in map units (x, y)
    pub shift_map: Option<(f64, f64)>,
    pub similarity_before: Option<f64>,
    pub similarity_after: Option<f64>,
    /// Shift reliability in percent
    pub reliability: Option<f64>,
    /// Matching window actually used, in (rows, columns) order
    pub window_size: Option<(u32, u32)>,
}

/// Shift estimator treated as a black box.
///
/// Given a reference and a target raster in the same CRS, it estimates the translation,
/// writes the corrected target to `output` when it succeeds, and reports the outcome.
/// An `Err` or a result with `success == false` are both treated as a failed attempt.
pub trait CoregistrationEngine: Send + Sync {
    fn estimate(
        &self,
        reference: &Path,
        target: &Path,
        output: &Path,
        settings: &CoregistrationSettings,
    ) -> CoregResult<EngineResult>;
}
