//! Quality filtering of coregistration results.
//!
//! A [`FilterTable`] is a flat, mutable view of a [`ResultSet`] with one row per file.
//! Each [`FilterStage`] can only turn a row's `filter_passed` from true to false, and
//! records why in the row's description. Stages run in the order a [`FilterChain`]
//! lists them.

use crate::core::aggregate::ResultSet;
use crate::settings::{FilterSettings, ShiftRangeMeters};
use crate::types::CoregistrationRecord;
use indexmap::IndexMap;

/// One file in the filter table
#[derive(Debug, Clone, PartialEq)]
pub struct FilterRow {
    pub filename: String,
    /// Group key, `None` for flat result sets
    pub satellite: Option<String>,
    pub record: CoregistrationRecord,
    filter_passed: bool,
    filter_description: Option<String>,
    /// Combined shift z-score, set by the z-score stage for the rows it scored
    pub z_score: Option<f64>,
}

impl FilterRow {
    pub fn new(
        filename: impl Into<String>,
        satellite: Option<String>,
        record: CoregistrationRecord,
    ) -> Self {
        Self {
            filename: filename.into(),
            satellite,
            record,
            filter_passed: true,
            filter_description: None,
            z_score: None,
        }
    }

    pub fn passed(&self) -> bool {
        self.filter_passed
    }

    pub fn description(&self) -> Option<&str> {
        self.filter_description.as_deref()
    }

    /// Mark the row as failed and append `reason` to its description
    pub fn reject(&mut self, reason: &str) {
        self.filter_passed = false;
        self.filter_description
            .get_or_insert_with(String::new)
            .push_str(&format!("{}; ", reason));
    }
}

/// Passed/failed counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FilterCounts {
    pub passed: usize,
    pub failed: usize,
}

impl FilterCounts {
    pub fn total(&self) -> usize {
        self.passed + self.failed
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterTable {
    rows: Vec<FilterRow>,
    grouped: bool,
    z_score_computed: bool,
}

impl FilterTable {
    /// Flatten a result set into rows, every row starting as passed
    pub fn from_result_set(results: &ResultSet) -> Self {
        let rows = results
            .records()
            .into_iter()
            .map(|(group, filename, record)| {
                FilterRow::new(filename, group.map(str::to_string), record.clone())
            })
            .collect();
        Self {
            rows,
            grouped: !results.is_flat(),
            z_score_computed: false,
        }
    }

    pub fn from_rows(rows: Vec<FilterRow>) -> Self {
        let grouped = rows.iter().any(|r| r.satellite.is_some());
        Self {
            rows,
            grouped,
            z_score_computed: false,
        }
    }

    pub fn rows(&self) -> &[FilterRow] {
        &self.rows
    }

    pub fn is_grouped(&self) -> bool {
        self.grouped
    }

    /// Whether a z-score stage ran over this table
    pub fn has_z_scores(&self) -> bool {
        self.z_score_computed
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn row(&self, filename: &str) -> Option<&FilterRow> {
        self.rows.iter().find(|r| r.filename == filename)
    }

    pub fn passed_rows(&self) -> impl Iterator<Item = &FilterRow> {
        self.rows.iter().filter(|r| r.passed())
    }

    pub fn failed_rows(&self) -> impl Iterator<Item = &FilterRow> {
        self.rows.iter().filter(|r| !r.passed())
    }

    pub fn counts(&self) -> FilterCounts {
        let passed = self.passed_rows().count();
        FilterCounts {
            passed,
            failed: self.rows.len() - passed,
        }
    }

    /// Counts per group in first-seen order; flat tables report under `None`
    pub fn counts_by_group(&self) -> IndexMap<Option<String>, FilterCounts> {
        let mut counts: IndexMap<Option<String>, FilterCounts> = IndexMap::new();
        for row in &self.rows {
            let entry = counts.entry(row.satellite.clone()).or_default();
            if row.passed() {
                entry.passed += 1;
            } else {
                entry.failed += 1;
            }
        }
        counts
    }
}

/// A single pass/fail predicate over the table
#[derive(Debug, Clone, PartialEq)]
pub enum FilterStage {
    /// Reject rows without an after-coregistration similarity
    NullSimilarity,
    /// Reject rows whose reliability is missing or below `min_percent`
    Reliability { min_percent: f64 },
    /// Reject rows whose window width or height is below `min_pixels`
    WindowSize { min_pixels: u32 },
    /// Reject rows whose absolute shift along either axis exceeds `max_meters`, or is missing
    MaxShift { max_meters: f64 },
    /// Statistical outlier rejection on the pixel shifts
    ZScore { threshold: f64, passed_only: bool },
    /// Reject rows whose map shifts fall outside per-axis bounds
    ShiftRange(ShiftRangeMeters),
}

impl FilterStage {
    pub fn name(&self) -> &'static str {
        match self {
            FilterStage::NullSimilarity => "null_similarity",
            FilterStage::Reliability { .. } => "shift_reliability",
            FilterStage::WindowSize { .. } => "window_size",
            FilterStage::MaxShift { .. } => "max_shift_meters",
            FilterStage::ZScore { .. } => "z_score",
            FilterStage::ShiftRange(_) => "shift_range_meters",
        }
    }

    pub fn apply(&self, table: &mut FilterTable) {
        let before = table.counts().passed;
        match self {
            FilterStage::ZScore {
                threshold,
                passed_only,
            } => apply_z_score(table, *threshold, *passed_only),
            _ => {
                for row in table.rows.iter_mut() {
                    for reason in self.row_rejections(&row.record) {
                        row.reject(&reason);
                    }
                }
            }
        }
        log::info!(
            "Filter '{}' rejected {} of {} rows",
            self.name(),
            before - table.counts().passed,
            before
        );
    }

    fn row_rejections(&self, record: &CoregistrationRecord) -> Vec<String> {
        match self {
            FilterStage::NullSimilarity => match record.coregistered_ssim {
                Some(_) => vec![],
                None => vec!["coregistered ssim is null".to_string()],
            },
            FilterStage::Reliability { min_percent } => match record.shift_reliability {
                Some(value) if value >= *min_percent => vec![],
                _ => vec![format!("shift reliability below {}", min_percent)],
            },
            FilterStage::WindowSize { min_pixels } => {
                if record.window_size.meets(*min_pixels) {
                    vec![]
                } else {
                    vec![format!(
                        "window size {} below {}",
                        record.window_size, min_pixels
                    )]
                }
            }
            FilterStage::MaxShift { max_meters } => {
                match (record.shift_x_meters, record.shift_y_meters) {
                    (Some(x), Some(y)) if x.abs() <= *max_meters && y.abs() <= *max_meters => {
                        vec![]
                    }
                    (Some(_), Some(_)) => {
                        vec![format!("shift exceeded max shift meters ({})", max_meters)]
                    }
                    _ => vec!["shift meters missing".to_string()],
                }
            }
            FilterStage::ShiftRange(range) => {
                let mut reasons = Vec::new();
                let axes = [
                    ("shift_x_meters", record.shift_x_meters, range.min.0, range.max.0),
                    ("shift_y_meters", record.shift_y_meters, range.min.1, range.max.1),
                ];
                for (column, value, min, max) in axes {
                    match value {
                        Some(v) if v < min => reasons.push(format!("{} below {}", column, min)),
                        Some(v) if v > max => reasons.push(format!("{} exceeded {}", column, max)),
                        Some(_) => {}
                        None => reasons.push(format!("{} missing", column)),
                    }
                }
                reasons
            }
            FilterStage::ZScore { .. } => vec![],
        }
    }
}

/// Population statistics of integer shifts, kept as exact integer sums so the result
/// does not depend on row order.
struct ShiftStats {
    n: i128,
    sum: i128,
    /// n * sum(v^2) - sum(v)^2, i.e. n^2 times the population variance
    spread: i128,
}

impl ShiftStats {
    /// `None` when the sums do not fit in an `i128`
    fn new(values: &[i64]) -> Option<Self> {
        let n = values.len() as i128;
        let (mut sum, mut sum_sq) = (0i128, 0i128);
        for &v in values {
            let v = v as i128;
            sum = sum.checked_add(v)?;
            sum_sq = sum_sq.checked_add(v.checked_mul(v)?)?;
        }
        let spread = n.checked_mul(sum_sq)?.checked_sub(sum.checked_mul(sum)?)?;
        Some(Self { n, sum, spread })
    }

    /// z of `value`; an axis without spread contributes 0
    fn z(&self, value: i64) -> Option<f64> {
        if self.spread <= 0 {
            return Some(0.0);
        }
        let deviation = self.n.checked_mul(value as i128)?.checked_sub(self.sum)?;
        Some(deviation as f64 / (self.spread as f64).sqrt())
    }
}

/// Combined z-score `sqrt(z_x^2 + z_y^2)` over the eligible rows.
///
/// Eligible rows have both pixel shifts (and, with `passed_only`, are still passing).
/// A row is rejected when its score meets or exceeds `threshold` or cannot be defined:
/// a missing shift, fewer than two eligible rows, no spread on either axis, or shifts too
/// large for exact sums. With
/// `passed_only`, rows that already failed are left as they are.
fn apply_z_score(table: &mut FilterTable, threshold: f64, passed_only: bool) {
    let eligible = |row: &FilterRow| {
        row.record.shift_x.is_some()
            && row.record.shift_y.is_some()
            && (!passed_only || row.passed())
    };

    let (xs, ys): (Vec<i64>, Vec<i64>) = table
        .rows
        .iter()
        .filter(|&row| eligible(row))
        .filter_map(|row| Some((row.record.shift_x?, row.record.shift_y?)))
        .unzip();
    let stats = match (ShiftStats::new(&xs), ShiftStats::new(&ys)) {
        (Some(x), Some(y)) if xs.len() >= 2 && (x.spread > 0 || y.spread > 0) => Some((x, y)),
        (Some(_), Some(_)) => {
            log::warn!(
                "z-score undefined over {} rows (no spread in the shifts)",
                xs.len()
            );
            None
        }
        _ => {
            log::warn!("z-score undefined over {} rows (shift sums overflow)", xs.len());
            None
        }
    };

    for row in table.rows.iter_mut() {
        if passed_only && !row.passed() {
            continue;
        }
        let score = match (row.record.shift_x, row.record.shift_y) {
            (Some(x), Some(y)) => stats
                .as_ref()
                .and_then(|(sx, sy)| Some(sx.z(x)?.hypot(sy.z(y)?))),
            _ => None,
        };
        row.z_score = score;
        match score {
            Some(z) if z < threshold => {}
            Some(_) => row.reject(&format!("z score exceeded z threshold ({})", threshold)),
            None => row.reject("z score undefined"),
        }
    }
    table.z_score_computed = true;
}

/// Ordered list of stages
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterChain {
    stages: Vec<FilterStage>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stage(mut self, stage: FilterStage) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn stages(&self) -> &[FilterStage] {
        &self.stages
    }

    /// The conventional chain: null similarity, then each configured stage
    pub fn from_settings(settings: &FilterSettings) -> Self {
        let mut chain = Self::new().with_stage(FilterStage::NullSimilarity);
        if let Some(min_percent) = settings.shift_reliability {
            chain = chain.with_stage(FilterStage::Reliability { min_percent });
        }
        if let Some(min_pixels) = settings.window_size {
            chain = chain.with_stage(FilterStage::WindowSize { min_pixels });
        }
        if let Some(max_meters) = settings.max_shift_meters {
            chain = chain.with_stage(FilterStage::MaxShift { max_meters });
        }
        if settings.filter_z_score {
            chain = chain.with_stage(FilterStage::ZScore {
                threshold: settings.z_score_threshold,
                passed_only: settings.filter_z_score_filter_passed_only,
            });
        }
        if let Some(range) = settings.shift_range_meters {
            chain = chain.with_stage(FilterStage::ShiftRange(range));
        }
        chain
    }
}

/// Run every stage of `chain` over `table` in order
pub fn apply_filters(mut table: FilterTable, chain: &FilterChain) -> FilterTable {
    for stage in chain.stages() {
        stage.apply(&mut table);
    }
    let counts = table.counts();
    log::info!(
        "Filtering done: {} passed, {} failed",
        counts.passed,
        counts.failed
    );
    table
}
