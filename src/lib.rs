//! coastreg: batch coregistration of multispectral satellite tiles
//!
//! This library aligns a session of Landsat, Sentinel-2 and PlanetScope tiles to a
//! single reference raster, aggregates the estimated shifts, rejects unreliable
//! results, sets rejected files aside and applies accepted shifts to sibling rasters.

pub mod types;
pub mod settings;
pub mod io;
pub mod core;

// Re-export main types and functions for easier access
pub use types::{CoregError, CoregResult, CoregistrationRecord, CrsInfo, GeoTransform, WindowSize};

pub use settings::{
    CoregistrationSettings, FilterSettings, PipelineConfig, PropagationSettings, ShiftRangeMeters,
    TriageSettings,
};

pub use io::{MemoryRasterIo, Raster, RasterIo, Satellite};

pub use crate::core::{
    apply_filters, CoregisteredFile, CoregistrationEngine, CoregistrationOrchestrator, EngineResult,
    FilterChain, FilterTable, ResultSet,
};

#[cfg(feature = "python")]
mod python {
    use crate::core::{
        aggregate_flat, apply_filters, postprocess, triage, CoregistrationEngine,
        CoregistrationOrchestrator, EngineResult, FilterChain, FilterTable, ResultSet,
    };
    use crate::io::Satellite;
    use crate::settings::{CoregistrationSettings, FilterSettings, PipelineConfig, TriageSettings};
    use crate::types::{CoregError, CoregResult};
    use crate::io::{load_results, write_filter_csv, GdalRasterIo};
    use pyo3::prelude::*;
    use pyo3::types::PyDict;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;

    fn runtime_error(e: impl std::fmt::Display) -> PyErr {
        PyErr::new::<pyo3::exceptions::PyRuntimeError, _>(format!("{}", e))
    }

    fn value_error(e: impl std::fmt::Display) -> PyErr {
        PyErr::new::<pyo3::exceptions::PyValueError, _>(format!("{}", e))
    }

    fn parse_json<T: serde::de::DeserializeOwned + Default>(text: Option<&str>) -> PyResult<T> {
        match text {
            Some(text) => serde_json::from_str(text).map_err(value_error),
            None => Ok(T::default()),
        }
    }

    /// Python module definition
    #[pymodule]
    fn _core(_py: Python, m: &PyModule) -> PyResult<()> {
        m.add_class::<PyResultSet>()?;
        m.add_class::<PyFilterTable>()?;
        m.add_function(wrap_pyfunction!(coregister_batch, m)?)?;
        m.add_function(wrap_pyfunction!(filter_results, m)?)?;
        m.add_function(wrap_pyfunction!(triage_results, m)?)?;
        m.add_function(wrap_pyfunction!(postprocess_session, m)?)?;
        Ok(())
    }

    /// Engine backed by a Python callable
    /// `f(reference, target, output, settings_json) -> dict`
    struct PyEngine {
        callable: PyObject,
    }

    fn item<'py, T: FromPyObject<'py>>(dict: &'py PyDict, key: &str) -> PyResult<Option<T>> {
        match dict.get_item(key)? {
            Some(value) if !value.is_none() => Ok(Some(value.extract()?)),
            _ => Ok(None),
        }
    }

    fn engine_result(dict: &PyDict) -> PyResult<EngineResult> {
        Ok(EngineResult {
            success: item(dict, "success")?.unwrap_or(false),
            shift_px: item(dict, "shift_px")?,
            shift_map: item(dict, "shift_map")?,
            similarity_before: item(dict, "ssim_orig")?,
            similarity_after: item(dict, "ssim_deshifted")?,
            reliability: item(dict, "shift_reliability")?,
            window_size: item(dict, "window_size")?,
        })
    }

    impl CoregistrationEngine for PyEngine {
        fn estimate(
            &self,
            reference: &Path,
            target: &Path,
            output: &Path,
            settings: &CoregistrationSettings,
        ) -> CoregResult<EngineResult> {
            let settings = serde_json::to_string(settings)?;
            Python::with_gil(|py| {
                let returned = self.callable.call1(
                    py,
                    (
                        reference.to_string_lossy().into_owned(),
                        target.to_string_lossy().into_owned(),
                        output.to_string_lossy().into_owned(),
                        settings,
                    ),
                )?;
                let dict: &PyDict = returned.as_ref(py).downcast()?;
                engine_result(dict)
            })
            .map_err(|e| CoregError::Engine(e.to_string()))
        }
    }

    /// Python wrapper for ResultSet
    #[pyclass(name = "ResultSet")]
    struct PyResultSet {
        inner: ResultSet,
    }

    #[pymethods]
    impl PyResultSet {
        #[staticmethod]
        fn load(path: String) -> PyResult<Self> {
            let inner = load_results(Path::new(&path)).map_err(runtime_error)?;
            Ok(PyResultSet { inner })
        }

        fn group_names(&self) -> Vec<String> {
            self.inner.group_names().into_iter().map(String::from).collect()
        }

        fn to_json(&self) -> PyResult<String> {
            serde_json::to_string(&self.inner).map_err(runtime_error)
        }

        #[pyo3(signature = (filter_settings=None))]
        fn filter(&self, filter_settings: Option<&str>) -> PyResult<PyFilterTable> {
            let settings: FilterSettings = parse_json(filter_settings)?;
            let table = apply_filters(
                FilterTable::from_result_set(&self.inner),
                &FilterChain::from_settings(&settings),
            );
            Ok(PyFilterTable { inner: table })
        }

        fn __len__(&self) -> usize {
            self.inner.len()
        }
    }

    /// Python wrapper for FilterTable
    #[pyclass(name = "FilterTable")]
    struct PyFilterTable {
        inner: FilterTable,
    }

    #[pymethods]
    impl PyFilterTable {
        fn passed(&self) -> Vec<String> {
            self.inner.passed_rows().map(|r| r.filename.clone()).collect()
        }

        fn failed(&self) -> Vec<String> {
            self.inner.failed_rows().map(|r| r.filename.clone()).collect()
        }

        fn description(&self, filename: &str) -> Option<String> {
            self.inner
                .row(filename)
                .and_then(|r| r.description().map(String::from))
        }

        fn z_score(&self, filename: &str) -> Option<f64> {
            self.inner.row(filename).and_then(|r| r.z_score)
        }

        fn to_csv(&self, path: String) -> PyResult<()> {
            write_filter_csv(Path::new(&path), &self.inner).map_err(runtime_error)
        }

        fn __len__(&self) -> usize {
            self.inner.len()
        }
    }

    /// Coregister `targets` against `reference` and return the result set as JSON
    #[pyfunction]
    #[pyo3(signature = (engine, reference, targets, out_dir, workspace, settings=None, parallel=false))]
    fn coregister_batch(
        py: Python,
        engine: PyObject,
        reference: String,
        targets: Vec<String>,
        out_dir: String,
        workspace: String,
        settings: Option<&str>,
        parallel: bool,
    ) -> PyResult<String> {
        let settings: CoregistrationSettings = parse_json(settings)?;
        let orchestrator = CoregistrationOrchestrator::new(
            Arc::new(PyEngine { callable: engine }),
            Arc::new(GdalRasterIo::new()),
            settings,
            workspace,
        );
        let targets: Vec<PathBuf> = targets.into_iter().map(PathBuf::from).collect();

        let results = py.allow_threads(|| {
            let files = if parallel {
                orchestrator.coregister_many_parallel(&targets, Path::new(&reference), Path::new(&out_dir))
            } else {
                orchestrator.coregister_many(&targets, Path::new(&reference), Path::new(&out_dir))
            }?;
            let settings = serde_json::to_value(orchestrator.settings())?;
            Ok::<_, CoregError>(aggregate_flat(files, settings))
        });
        let results = results.map_err(runtime_error)?;
        serde_json::to_string(&results).map_err(runtime_error)
    }

    /// Filter a saved result file and write the table to `output_csv`.
    /// Returns the (passed, failed) counts.
    #[pyfunction]
    #[pyo3(signature = (results_path, output_csv, filter_settings=None))]
    fn filter_results(
        results_path: String,
        output_csv: String,
        filter_settings: Option<&str>,
    ) -> PyResult<(usize, usize)> {
        let settings: FilterSettings = parse_json(filter_settings)?;
        let results = load_results(Path::new(&results_path)).map_err(runtime_error)?;
        let table = apply_filters(
            FilterTable::from_result_set(&results),
            &FilterChain::from_settings(&settings),
        );
        write_filter_csv(Path::new(&output_csv), &table).map_err(runtime_error)?;
        let counts = table.counts();
        Ok((counts.passed, counts.failed))
    }

    /// Set aside the files of `results_path` rejected by the filters
    #[pyfunction]
    #[pyo3(signature = (results_path, coregistered_dir, unregistered_dir, filter_settings=None, triage_settings=None))]
    fn triage_results(
        results_path: String,
        coregistered_dir: String,
        unregistered_dir: String,
        filter_settings: Option<&str>,
        triage_settings: Option<&str>,
    ) -> PyResult<usize> {
        let filtering: FilterSettings = parse_json(filter_settings)?;
        let settings: TriageSettings = parse_json(triage_settings)?;
        let results = load_results(Path::new(&results_path)).map_err(runtime_error)?;
        let table = apply_filters(
            FilterTable::from_result_set(&results),
            &FilterChain::from_settings(&filtering),
        );
        let report = triage(
            &table,
            Path::new(&coregistered_dir),
            Path::new(&unregistered_dir),
            &settings,
        )
        .map_err(runtime_error)?;
        Ok(report.quarantined)
    }

    /// Filter, triage and propagate a finished session; returns the run summary text
    #[pyfunction]
    fn postprocess_session(
        results_path: String,
        config_path: String,
        coregistered_dir: String,
        unregistered_dir: String,
    ) -> PyResult<String> {
        let config = PipelineConfig::from_file(&config_path).map_err(value_error)?;
        let results = load_results(Path::new(&results_path)).map_err(runtime_error)?;
        let groups = results
            .group_names()
            .into_iter()
            .map(|g| g.parse::<Satellite>())
            .collect::<CoregResult<Vec<_>>>()
            .map_err(value_error)?;
        let (_, summary) = postprocess(
            &results,
            &config,
            &GdalRasterIo::new(),
            Path::new(&coregistered_dir),
            Path::new(&unregistered_dir),
            &groups,
        )
        .map_err(runtime_error)?;
        Ok(summary.to_string())
    }
}
