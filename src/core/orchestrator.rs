use crate::core::conditioner::{file_name, stem, RasterConditioner};
use crate::core::engine::{CoregistrationEngine, EngineResult};
use crate::core::triage::move_file;
use crate::io::raster::RasterIo;
use crate::settings::CoregistrationSettings;
use crate::types::{CoregResult, CoregistrationRecord, CrsInfo, WindowSize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
#[cfg(feature = "parallel")]
use std::sync::atomic::{AtomicBool, Ordering};
#[cfg(feature = "parallel")]
use std::time::Duration;

/// A target raster's base name with its coregistration record
#[derive(Debug, Clone, PartialEq)]
pub struct CoregisteredFile {
    pub filename: String,
    pub record: CoregistrationRecord,
}

/// Drives the coregistration engine over target rasters against one reference
#[derive(Clone)]
pub struct CoregistrationOrchestrator {
    engine: Arc<dyn CoregistrationEngine>,
    io: Arc<dyn RasterIo>,
    settings: CoregistrationSettings,
    workspace: PathBuf,
    #[cfg(feature = "parallel")]
    timeout: Option<Duration>,
}

impl CoregistrationOrchestrator {
    /// Conditioned copies of the inputs are written below `workspace`
    pub fn new(
        engine: Arc<dyn CoregistrationEngine>,
        io: Arc<dyn RasterIo>,
        settings: CoregistrationSettings,
        workspace: impl Into<PathBuf>,
    ) -> Self {
        Self {
            engine,
            io,
            settings,
            workspace: workspace.into(),
            #[cfg(feature = "parallel")]
            timeout: None,
        }
    }

    /// Give up on a single target after `timeout` when running in parallel
    #[cfg(feature = "parallel")]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn settings(&self) -> &CoregistrationSettings {
        &self.settings
    }

    fn conditioner(&self) -> RasterConditioner<'_> {
        RasterConditioner::new(self.io.as_ref()).with_nodata((
            self.settings.reference_nodata(),
            self.settings.target_nodata(),
        ))
    }

    /// Coregister a single target.
    ///
    /// Errors only when the attempt cannot start (conditioning or I/O); an engine
    /// failure is reported as a record with `success == false`.
    pub fn coregister_one(
        &self,
        reference: &Path,
        target: &Path,
        out_dir: &Path,
    ) -> CoregResult<CoregisteredFile> {
        let ready_reference = self
            .conditioner()
            .condition_reference(reference, &self.workspace)?;
        self.coregister_conditioned(&ready_reference, target, out_dir)
    }

    /// Coregister every target in order; individual failures do not stop the batch.
    ///
    /// Only a reference that cannot be conditioned aborts the call.
    pub fn coregister_many(
        &self,
        targets: &[PathBuf],
        reference: &Path,
        out_dir: &Path,
    ) -> CoregResult<Vec<CoregisteredFile>> {
        log::info!(
            "Coregistering {} targets against {}",
            targets.len(),
            reference.display()
        );
        let ready_reference = self
            .conditioner()
            .condition_reference(reference, &self.workspace)?;

        let files: Vec<CoregisteredFile> = targets
            .iter()
            .map(|target| self.coregister_or_fail(&ready_reference, target, out_dir))
            .collect();

        log_batch_outcome(&files);
        Ok(files)
    }

    /// Parallel variant of [`coregister_many`](Self::coregister_many).
    ///
    /// Each target writes to its own output path and conditions into its own workspace
    /// directory. With a timeout set, a target that does not finish in time yields a
    /// failed record and its worker is abandoned.
    #[cfg(feature = "parallel")]
    pub fn coregister_many_parallel(
        &self,
        targets: &[PathBuf],
        reference: &Path,
        out_dir: &Path,
    ) -> CoregResult<Vec<CoregisteredFile>> {
        use rayon::prelude::*;

        log::info!(
            "Coregistering {} targets against {} in parallel",
            targets.len(),
            reference.display()
        );
        let ready_reference = self
            .conditioner()
            .condition_reference(reference, &self.workspace)?;
        std::fs::create_dir_all(out_dir)?;

        let files: Vec<CoregisteredFile> = targets
            .par_iter()
            .map(|target| match self.timeout {
                Some(timeout) => self.coregister_with_timeout(&ready_reference, target, out_dir, timeout),
                None => self.coregister_or_fail(&ready_reference, target, out_dir),
            })
            .collect();

        log_batch_outcome(&files);
        Ok(files)
    }

    /// Runs the target on a worker thread and waits at most `timeout` for it.
    ///
    /// Output reaches `out_dir` only when the worker reports back in time. An abandoned
    /// worker removes its staged output once the engine returns.
    #[cfg(feature = "parallel")]
    fn coregister_with_timeout(
        &self,
        ready_reference: &Path,
        target: &Path,
        out_dir: &Path,
        timeout: Duration,
    ) -> CoregisteredFile {
        let (tx, rx) = std::sync::mpsc::channel::<StagedFile>();
        let cancelled = Arc::new(AtomicBool::new(false));
        let worker = self.clone();
        let abandoned = Arc::clone(&cancelled);
        let (reference, job_target) = (ready_reference.to_path_buf(), target.to_path_buf());
        std::thread::spawn(move || {
            let staged = worker.stage_or_fail(&reference, &job_target);
            if abandoned.load(Ordering::SeqCst) {
                staged.discard();
            } else if let Err(unsent) = tx.send(staged) {
                unsent.0.discard();
            }
        });

        match rx.recv_timeout(timeout) {
            Ok(staged) => self.publish_or_fail(staged, target, out_dir),
            Err(_) => {
                cancelled.store(true, Ordering::SeqCst);
                log::warn!(
                    "{} did not finish within {:?}; recording it as failed",
                    target.display(),
                    timeout
                );
                CoregisteredFile {
                    filename: display_name(target),
                    record: CoregistrationRecord::failed(CrsInfo::unchanged()),
                }
            }
        }
    }

    fn coregister_or_fail(
        &self,
        ready_reference: &Path,
        target: &Path,
        out_dir: &Path,
    ) -> CoregisteredFile {
        let staged = self.stage_or_fail(ready_reference, target);
        self.publish_or_fail(staged, target, out_dir)
    }

    fn coregister_conditioned(
        &self,
        ready_reference: &Path,
        target: &Path,
        out_dir: &Path,
    ) -> CoregResult<CoregisteredFile> {
        let staged = self.stage(ready_reference, target)?;
        staged.publish(out_dir)
    }

    fn stage_or_fail(&self, ready_reference: &Path, target: &Path) -> StagedFile {
        self.stage(ready_reference, target).unwrap_or_else(|e| {
            log::error!("Skipping {}: {}", target.display(), e);
            StagedFile {
                file: CoregisteredFile {
                    filename: display_name(target),
                    record: CoregistrationRecord::failed(CrsInfo::unchanged()),
                },
                output: None,
            }
        })
    }

    fn publish_or_fail(
        &self,
        staged: StagedFile,
        target: &Path,
        out_dir: &Path,
    ) -> CoregisteredFile {
        staged.publish(out_dir).unwrap_or_else(|e| {
            log::error!("Could not publish {}: {}", target.display(), e);
            CoregisteredFile {
                filename: display_name(target),
                record: CoregistrationRecord::failed(CrsInfo::unchanged()),
            }
        })
    }

    /// Condition `target` and run the engine with its output kept in the target's
    /// workspace directory
    fn stage(&self, ready_reference: &Path, target: &Path) -> CoregResult<StagedFile> {
        let filename = file_name(target)?;
        let (ready_target, crs_info) =
            self.conditioner()
                .condition_target(ready_reference, target, &self.workspace)?;

        let staging_dir = self
            .workspace
            .join("targets")
            .join(stem(target)?)
            .join("output");
        std::fs::create_dir_all(&staging_dir)?;
        let output = staging_dir.join(&filename);
        log::debug!(
            "Engine run: reference={} target={} output={}",
            ready_reference.display(),
            ready_target.display(),
            output.display()
        );

        let staged = match self
            .engine
            .estimate(ready_reference, &ready_target, &output, &self.settings)
        {
            Ok(result) if result.success => {
                let record = record_from_engine(&result, crs_info);
                log::info!(
                    "{}: shift ({:?}, {:?}) px, reliability {:?}",
                    filename,
                    record.shift_x,
                    record.shift_y,
                    record.shift_reliability
                );
                StagedFile {
                    file: CoregisteredFile { filename, record },
                    output: Some(output),
                }
            }
            Ok(_) => {
                log::warn!("{}: engine did not converge", filename);
                discard_output(&output);
                StagedFile {
                    file: CoregisteredFile {
                        filename,
                        record: CoregistrationRecord::failed(crs_info),
                    },
                    output: None,
                }
            }
            Err(e) => {
                log::warn!("{}: engine error: {}", filename, e);
                discard_output(&output);
                StagedFile {
                    file: CoregisteredFile {
                        filename,
                        record: CoregistrationRecord::failed(crs_info),
                    },
                    output: None,
                }
            }
        };
        Ok(staged)
    }
}

/// A finished attempt whose engine output still sits in the workspace
struct StagedFile {
    file: CoregisteredFile,
    /// Set only for a successful attempt
    output: Option<PathBuf>,
}

impl StagedFile {
    /// Move the engine output to `out_dir/<filename>`
    fn publish(self, out_dir: &Path) -> CoregResult<CoregisteredFile> {
        if let Some(output) = &self.output {
            if output.exists() {
                std::fs::create_dir_all(out_dir)?;
                if let Err(e) = move_file(output, &out_dir.join(&self.file.filename)) {
                    discard_output(output);
                    return Err(e);
                }
            } else {
                log::warn!("{}: engine wrote no output", self.file.filename);
            }
        }
        Ok(self.file)
    }

    #[cfg(feature = "parallel")]
    fn discard(self) {
        if let Some(output) = &self.output {
            log::debug!("Discarding abandoned output {}", output.display());
            discard_output(output);
        }
    }
}

/// Normalize a successful engine result into a record
pub fn record_from_engine(result: &EngineResult, crs_info: CrsInfo) -> CoregistrationRecord {
    let (shift_x, shift_y) = result
        .shift_px
        .map(|(x, y)| (Some(x.round() as i64), Some(y.round() as i64)))
        .unwrap_or((Some(0), Some(0)));

    CoregistrationRecord {
        original_ssim: result.similarity_before,
        coregistered_ssim: result.similarity_after,
        change_ssim: CoregistrationRecord::similarity_change(
            result.similarity_before,
            result.similarity_after,
        ),
        shift_x,
        shift_y,
        shift_x_meters: result.shift_map.map(|(x, _)| x),
        shift_y_meters: result.shift_map.map(|(_, y)| y),
        shift_reliability: result.reliability,
        window_size: result
            .window_size
            .map(|(rows, cols)| WindowSize::from_rows_cols(rows, cols))
            .unwrap_or_default(),
        success: true,
        crs: crs_info.crs,
        crs_converted: crs_info.crs_converted,
    }
}

fn discard_output(output: &Path) {
    if output.exists() {
        if let Err(e) = std::fs::remove_file(output) {
            log::warn!("Could not remove {}: {}", output.display(), e);
        }
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn log_batch_outcome(files: &[CoregisteredFile]) {
    let succeeded = files.iter().filter(|f| f.record.success).count();
    log::info!(
        "Coregistration finished: {} succeeded, {} failed",
        succeeded,
        files.len() - succeeded
    );
}
