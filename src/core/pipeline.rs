//! End-to-end session processing: coregister every group, persist the result set,
//! then filter, triage and propagate.

use crate::core::aggregate::{aggregate_flat, ResultSet};
use crate::core::filter::{apply_filters, FilterChain, FilterCounts, FilterTable};
use crate::core::orchestrator::{CoregisteredFile, CoregistrationOrchestrator};
use crate::core::propagate::{PropagationReport, ShiftPropagator};
use crate::core::triage::{triage, TriageReport};
use crate::io::raster::RasterIo;
use crate::io::results::{save_results, write_filter_csv};
use crate::io::session::Satellite;
use crate::settings::PipelineConfig;
use crate::types::CoregResult;
use indexmap::IndexMap;
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};

pub const RESULTS_FILE: &str = "transformation_results.json";
pub const FILTERED_TABLE_FILE: &str = "filtered_files.csv";
pub const README_FILE: &str = "readme.txt";

/// Counts and averages reported at the end of a run
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub total: FilterCounts,
    pub by_group: IndexMap<Option<String>, FilterCounts>,
    /// Records where the engine converged
    pub successful: usize,
    /// Mean `change_ssim` over the converged records, 0 when there are none
    pub mean_change_ssim: f64,
    pub settings: Value,
    pub triage: Option<TriageReport>,
    pub propagation: Option<PropagationReport>,
}

impl RunSummary {
    pub fn new(results: &ResultSet, table: &FilterTable) -> Self {
        let improvements: Vec<f64> = results
            .records()
            .into_iter()
            .filter(|(_, _, record)| record.success)
            .map(|(_, _, record)| record.change_ssim)
            .collect();
        let mean_change_ssim = if improvements.is_empty() {
            0.0
        } else {
            improvements.iter().sum::<f64>() / improvements.len() as f64
        };
        Self {
            total: table.counts(),
            by_group: table.counts_by_group(),
            successful: improvements.len(),
            mean_change_ssim,
            settings: results.settings.clone(),
            triage: None,
            propagation: None,
        }
    }

    pub fn write_readme(&self, dir: &Path) -> CoregResult<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(README_FILE);
        std::fs::write(&path, self.to_string())?;
        Ok(path)
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Total number of coregistrations: {}", self.total.total())?;
        writeln!(f, "Number of successful coregistrations: {}", self.successful)?;
        writeln!(f, "Average improvement in SSIM score: {}", self.mean_change_ssim)?;
        writeln!(f, "Passed filtering: {}", self.total.passed)?;
        writeln!(f, "Failed filtering: {}", self.total.failed)?;
        for (group, counts) in &self.by_group {
            if let Some(group) = group {
                writeln!(f, "  {}: {} passed, {} failed", group, counts.passed, counts.failed)?;
            }
        }
        if let Some(report) = &self.propagation {
            writeln!(
                f,
                "Siblings shifted: {} ({} missing)",
                report.shifted, report.missing
            )?;
        }
        writeln!(f, "Settings: {}", self.settings)
    }
}

/// Filter `results`, export the table, set rejected files aside and propagate the
/// accepted shifts. Writes `filtered_files.csv` and `readme.txt` into `coregistered_dir`.
pub fn postprocess(
    results: &ResultSet,
    config: &PipelineConfig,
    io: &dyn RasterIo,
    coregistered_dir: &Path,
    unregistered_dir: &Path,
    groups: &[Satellite],
) -> CoregResult<(FilterTable, RunSummary)> {
    config.validate()?;
    let table = apply_filters(
        FilterTable::from_result_set(results),
        &FilterChain::from_settings(&config.filtering),
    );
    write_filter_csv(&coregistered_dir.join(FILTERED_TABLE_FILE), &table)?;

    let triage_report = triage(&table, coregistered_dir, unregistered_dir, &config.triage)?;
    let propagation = ShiftPropagator::new(io, config.propagation.clone()).propagate(
        &table,
        coregistered_dir,
        unregistered_dir,
        groups,
    )?;

    let mut summary = RunSummary::new(results, &table);
    summary.triage = Some(triage_report);
    summary.propagation = Some(propagation);
    summary.write_readme(coregistered_dir)?;
    log::info!("Run summary:\n{}", summary);
    Ok((table, summary))
}

/// Coregistration of a whole session against one reference raster
pub struct SessionRunner {
    orchestrator: CoregistrationOrchestrator,
    #[cfg(feature = "parallel")]
    parallel: bool,
}

impl SessionRunner {
    pub fn new(orchestrator: CoregistrationOrchestrator) -> Self {
        Self {
            orchestrator,
            #[cfg(feature = "parallel")]
            parallel: false,
        }
    }

    /// Coregister the targets of each group concurrently
    #[cfg(feature = "parallel")]
    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    fn settings_value(&self) -> CoregResult<Value> {
        Ok(serde_json::to_value(self.orchestrator.settings())?)
    }

    fn run_batch(
        &self,
        targets: &[PathBuf],
        reference: &Path,
        out_dir: &Path,
    ) -> CoregResult<Vec<CoregisteredFile>> {
        #[cfg(feature = "parallel")]
        {
            if self.parallel {
                return self
                    .orchestrator
                    .coregister_many_parallel(targets, reference, out_dir);
            }
        }
        self.orchestrator.coregister_many(targets, reference, out_dir)
    }

    /// Coregister each group's targets into `coregistered_dir/<group>/ms`.
    ///
    /// The result file is rewritten after every group so an interrupted run keeps
    /// what it finished.
    pub fn run_grouped(
        &self,
        reference: &Path,
        targets_by_group: &[(Satellite, Vec<PathBuf>)],
        coregistered_dir: &Path,
    ) -> CoregResult<ResultSet> {
        let results_path = coregistered_dir.join(RESULTS_FILE);
        let mut results = ResultSet::grouped(self.settings_value()?);
        for (satellite, targets) in targets_by_group {
            log::info!("Coregistering {} {} files", targets.len(), satellite);
            let out_dir = coregistered_dir.join(satellite.as_str()).join("ms");
            let files = self.run_batch(targets, reference, &out_dir)?;
            results.insert_group(satellite.as_str(), files);
            save_results(&results_path, &results)?;
        }
        Ok(results)
    }

    /// Coregister a flat directory of targets into `coregistered_dir`
    pub fn run_flat(
        &self,
        reference: &Path,
        targets: &[PathBuf],
        coregistered_dir: &Path,
    ) -> CoregResult<ResultSet> {
        let files = self.run_batch(targets, reference, coregistered_dir)?;
        let results = aggregate_flat(files, self.settings_value()?);
        save_results(&coregistered_dir.join(RESULTS_FILE), &results)?;
        Ok(results)
    }
}
