use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use coastreg::core::{apply_filters, triage, FilterChain, FilterTable, ResultSet};
use coastreg::io::{create_coregistered_directory, load_results, write_filter_csv};
use coastreg::settings::{FilterSettings, PipelineConfig};
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(name = "coastreg", version, about = "Post-process satellite coregistration sessions")]
struct Cli {
    #[arg(short, long, global = true, help = "Enable debug logging")]
    verbose: bool,
    #[arg(
        long,
        global = true,
        help = "Pipeline config JSON (recommended filter thresholds when omitted)"
    )]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the coregistered output tree of a session
    Init {
        session_dir: PathBuf,
        #[arg(long, value_delimiter = ',', default_value = "L5,L7,L8,L9,S2")]
        satellites: Vec<String>,
    },
    /// Filter a result file and export the table as CSV
    Filter {
        results: PathBuf,
        #[arg(long, help = "Output CSV (defaults next to the result file)")]
        output: Option<PathBuf>,
    },
    /// Set aside the files rejected by the filters
    Triage {
        results: PathBuf,
        #[arg(long)]
        coregistered_dir: PathBuf,
        #[arg(long)]
        unregistered_dir: PathBuf,
    },
    /// Apply accepted shifts to the sibling rasters
    Propagate {
        results: PathBuf,
        #[arg(long)]
        coregistered_dir: PathBuf,
        #[arg(long)]
        unregistered_dir: PathBuf,
    },
    /// Filter, triage and propagate in one go
    Postprocess {
        results: PathBuf,
        #[arg(long)]
        coregistered_dir: PathBuf,
        #[arg(long)]
        unregistered_dir: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Init {
            session_dir,
            satellites,
        } => {
            let names: Vec<&str> = satellites.iter().map(String::as_str).collect();
            let root = create_coregistered_directory(&session_dir, &names)
                .with_context(|| format!("creating output tree in {}", session_dir.display()))?;
            println!("{}", root.display());
        }
        Commands::Filter { results, output } => {
            let table = filter(&results, &config.filtering)?;
            let output = output
                .unwrap_or_else(|| results.with_file_name(coastreg::core::pipeline::FILTERED_TABLE_FILE));
            write_filter_csv(&output, &table)
                .with_context(|| format!("writing {}", output.display()))?;
            let counts = table.counts();
            println!("{} passed, {} failed", counts.passed, counts.failed);
        }
        Commands::Triage {
            results,
            coregistered_dir,
            unregistered_dir,
        } => {
            let table = filter(&results, &config.filtering)?;
            let report = triage(&table, &coregistered_dir, &unregistered_dir, &config.triage)?;
            println!(
                "{} passed, {} set aside, {} replaced, {} missing",
                report.passed, report.quarantined, report.replaced, report.missing
            );
        }
        Commands::Propagate {
            results,
            coregistered_dir,
            unregistered_dir,
        } => propagate(&config, &results, &coregistered_dir, &unregistered_dir)?,
        Commands::Postprocess {
            results,
            coregistered_dir,
            unregistered_dir,
        } => postprocess(&config, &results, &coregistered_dir, &unregistered_dir)?,
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
    match path {
        Some(path) => PipelineConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display())),
        None => Ok(PipelineConfig {
            filtering: FilterSettings::recommended(),
            ..PipelineConfig::default()
        }),
    }
}

fn load(results: &Path) -> Result<ResultSet> {
    load_results(results).with_context(|| format!("loading results {}", results.display()))
}

fn filter(results: &Path, settings: &FilterSettings) -> Result<FilterTable> {
    let results = load(results)?;
    Ok(apply_filters(
        FilterTable::from_result_set(&results),
        &FilterChain::from_settings(settings),
    ))
}

#[cfg(feature = "gdal")]
fn groups(results: &ResultSet) -> Result<Vec<coastreg::io::Satellite>> {
    results
        .group_names()
        .into_iter()
        .map(|g| g.parse::<coastreg::io::Satellite>().with_context(|| format!("group '{}'", g)))
        .collect()
}

#[cfg(feature = "gdal")]
fn propagate(
    config: &PipelineConfig,
    results: &Path,
    coregistered_dir: &Path,
    unregistered_dir: &Path,
) -> Result<()> {
    use coastreg::core::ShiftPropagator;
    use coastreg::io::GdalRasterIo;

    let results = load(results)?;
    let table = apply_filters(
        FilterTable::from_result_set(&results),
        &FilterChain::from_settings(&config.filtering),
    );
    let io = GdalRasterIo::new();
    let report = ShiftPropagator::new(&io, config.propagation.clone()).propagate(
        &table,
        coregistered_dir,
        unregistered_dir,
        &groups(&results)?,
    )?;
    println!(
        "{} shifted, {} meta copied, {} backfilled, {} missing, {} failed",
        report.shifted, report.meta_copied, report.backfilled, report.missing, report.failed
    );
    Ok(())
}

#[cfg(feature = "gdal")]
fn postprocess(
    config: &PipelineConfig,
    results: &Path,
    coregistered_dir: &Path,
    unregistered_dir: &Path,
) -> Result<()> {
    let results = load(results)?;
    let (_, summary) = coastreg::core::postprocess(
        &results,
        config,
        &coastreg::io::GdalRasterIo::new(),
        coregistered_dir,
        unregistered_dir,
        &groups(&results)?,
    )?;
    print!("{}", summary);
    Ok(())
}

#[cfg(not(feature = "gdal"))]
fn propagate(_: &PipelineConfig, _: &Path, _: &Path, _: &Path) -> Result<()> {
    anyhow::bail!("raster propagation requires the 'gdal' feature")
}

#[cfg(not(feature = "gdal"))]
fn postprocess(_: &PipelineConfig, _: &Path, _: &Path, _: &Path) -> Result<()> {
    anyhow::bail!("post-processing requires the 'gdal' feature")
}
