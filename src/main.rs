use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

use causeway::{import_data, run, Data, Method, PipelineConfig, TrimConfig};

#[derive(Parser)]
#[command(name = "causeway")]
#[command(about = "Treatment-effect estimation for observational data")]
#[command(version)]
struct Cli {
    /// Delimited data file with a header row
    path: PathBuf,

    /// Binary (0/1) treatment column
    #[arg(long)]
    treatment: String,

    /// Outcome column
    #[arg(long)]
    outcome: String,

    /// Covariate columns. Defaults to every other column.
    #[arg(long, value_delimiter = ',')]
    covariates: Option<Vec<String>>,

    /// Field delimiter of the data file
    #[arg(long, default_value = ",")]
    delimiter: char,

    /// JSON pipeline configuration; unset fields take their defaults
    #[arg(long)]
    config: Option<PathBuf>,

    /// Covariates always kept in the propensity model
    #[arg(long, value_delimiter = ',')]
    basic: Option<Vec<String>>,

    /// Fixed propensity trimming cutoff in (0, 0.5)
    #[arg(long)]
    trim_cutoff: Option<f64>,

    /// Estimators to run (ols, blocking, matching, weighting)
    #[arg(long, value_delimiter = ',', value_parser = parse_method)]
    methods: Option<Vec<Method>>,

    /// Print each estimator's estimate or error as JSON instead of tables
    #[arg(long)]
    json: bool,

    /// Log verbosity level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: tracing::Level,
}

fn parse_method(s: &str) -> std::result::Result<Method, String> {
    serde_json::from_value(serde_json::Value::String(s.to_lowercase()))
        .map_err(|_| format!("unknown estimator `{}`", s))
}

// Load the configuration file, then let command line flags override it.
fn load_config(cli: &Cli) -> Result<PipelineConfig> {
    let mut cfg = match &cli.config {
        Some(path) => PipelineConfig::from_json_file(path)
            .with_context(|| format!("reading configuration {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    if let Some(basic) = &cli.basic {
        cfg.propensity.basic = basic.clone();
    }
    if let Some(cutoff) = cli.trim_cutoff {
        cfg.trim = TrimConfig::Fixed { cutoff };
    }
    if let Some(methods) = &cli.methods {
        cfg.estimators.methods = methods.clone();
    }
    Ok(cfg)
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(cli.log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cfg = load_config(&cli)?;
    let delimiter = u8::try_from(cli.delimiter).context("delimiter must be a single-byte character")?;
    let frame = import_data(&cli.path, delimiter)
        .with_context(|| format!("loading {}", cli.path.display()))?;
    let sample = Data::from_frame(&frame, &cli.outcome, &cli.treatment, cli.covariates.as_deref())?
        .into_sample();

    let report = run(&sample, &cfg)?;
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report.estimates)?);
    } else {
        println!("{}", report);
    }
    Ok(())
}
