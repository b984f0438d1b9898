// ========================================================================================
//
//                         THE COMMAND LINE FRONT END: FOEHNIX
//
// ========================================================================================
//
// Two commands:
//
// 1.  `fit` reads a tab-separated time series, fits the mixture, prints the summary,
//     and optionally writes the probability table and the model artifact.
//
// 2.  `predict` loads a saved model artifact and classifies the rows of new data.
//
// The control settings come either from a TOML file (`--config`) or from flags; the
// two sources are mutually exclusive so there is never a question of precedence.

use clap::{Args, Parser, Subcommand};
use foehnix::control::{Control, parse_maxit, parse_switch, parse_tol};
use foehnix::data::DataError;
use foehnix::{FitSpec, ModelArtifact, RowFilter, TimeSeries, Verbosity, fit};
use std::path::{Path, PathBuf};
use std::process;

// ========================================================================================
//                         COMMAND-LINE INTERFACE DEFINITION
// ========================================================================================

#[derive(Parser)]
#[command(
    name = "foehnix",
    version,
    about = "Foehn classification with two-component mixture models",
    long_about = "Fits a two-component mixture model (background and foehn) to a meteorological \
                  time series, optionally with concomitant variables driving the mixing probability."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fit a model to a time series
    #[command(about = "Fit a foehn mixture model (outputs: probability table, model.toml)")]
    Fit(FitArgs),

    /// Classify new data with a saved model
    #[command(about = "Apply a saved model to new data (outputs: probability table)")]
    Predict {
        /// Tab-separated input with a header row
        data: PathBuf,

        /// Model artifact written by `fit --model`
        #[arg(long)]
        model: PathBuf,

        /// Name of the time column (integer seconds)
        #[arg(long, default_value = "time")]
        time_column: String,

        /// Where to write the probability table
        #[arg(long, default_value = "predictions.tsv")]
        output: PathBuf,
    },
}

#[derive(Args)]
struct FitArgs {
    /// Tab-separated input with a header row
    data: PathBuf,

    /// Column holding the predictor (e.g. wind speed)
    #[arg(long)]
    predictor: String,

    /// Name of the time column (integer seconds)
    #[arg(long, default_value = "time")]
    time_column: String,

    /// Concomitant column, may be repeated
    #[arg(long = "concomitant", value_name = "COLUMN")]
    concomitants: Vec<String>,

    /// Row filter `<column>=<lower>:<upper>`, may be repeated
    #[arg(long = "filter", value_name = "FILTER", value_parser = parse_filter)]
    filters: Vec<RowFilter>,

    /// TOML control file; replaces all control flags below
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Component family: gaussian or logistic
    #[arg(long, required_unless_present = "config", conflicts_with = "config")]
    family: Option<String>,

    /// true if the foehn component is the one with lower predictor values
    #[arg(long, value_parser = parse_switch, required_unless_present = "config", conflicts_with = "config")]
    switch: Option<bool>,

    /// Iteration caps, `N` or `EM,IWLS`; 0 disables a cap
    #[arg(long, conflicts_with = "config")]
    maxit: Option<String>,

    /// Tolerances, `T` or `EM,IWLS`
    #[arg(long, conflicts_with = "config")]
    tol: Option<String>,

    /// Fit on the raw instead of the z-scored variables
    #[arg(long, conflicts_with = "config")]
    no_standardize: bool,

    /// Inflate the series even above the safety ratio
    #[arg(long, conflicts_with = "config")]
    force_inflate: bool,

    /// Left censoring bound
    #[arg(long, conflicts_with = "config", allow_hyphen_values = true)]
    left: Option<f64>,

    /// Right censoring bound
    #[arg(long, conflicts_with = "config", allow_hyphen_values = true)]
    right: Option<f64>,

    /// true, false or silent
    #[arg(long, conflicts_with = "config", value_parser = parse_verbose)]
    verbose: Option<Verbosity>,

    /// Where to write the probability table
    #[arg(long, default_value = "foehnix_prob.tsv")]
    output: PathBuf,

    /// Where to write the model artifact
    #[arg(long)]
    model: Option<PathBuf>,
}

fn parse_filter(value: &str) -> Result<RowFilter, DataError> {
    value.parse()
}

fn parse_verbose(value: &str) -> Result<Verbosity, foehnix::ControlError> {
    value.parse()
}

// ========================================================================================
//                                  THE MAIN FUNCTION
// ========================================================================================

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Fit(args) => fit_command(args),
        Commands::Predict {
            data,
            model,
            time_column,
            output,
        } => predict_command(&data, &model, &time_column, &output),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn fit_command(args: FitArgs) -> Result<(), Box<dyn std::error::Error>> {
    let control = build_control(&args)?;
    let data = TimeSeries::load_tsv(&args.data, &args.time_column)?;

    let mut spec = FitSpec::new(args.predictor.as_str()).concomitants(args.concomitants.iter().cloned());
    for filter in args.filters {
        spec = spec.filter(filter);
    }

    let model = fit(&data, &spec, &control)?;
    println!("{}", model.summary());

    model.prob().write_tsv(&args.output)?;
    println!("Probabilities saved to: {}", args.output.display());

    if let Some(path) = &args.model {
        model.save(path)?;
        println!("Model saved to: {}", path.display());
    }
    Ok(())
}

fn build_control(args: &FitArgs) -> Result<Control, Box<dyn std::error::Error>> {
    if let Some(path) = &args.config {
        log::info!("Reading control settings from '{}'", path.display());
        return Ok(Control::from_toml_file(path)?);
    }

    let family = args.family.as_deref().ok_or("--family is required without --config")?;
    let switch = args.switch.ok_or("--switch is required without --config")?;
    let mut builder = Control::builder(family, switch)
        .standardize(!args.no_standardize)
        .force_inflate(args.force_inflate);
    if let Some(maxit) = &args.maxit {
        builder = builder.maxit(&parse_maxit(maxit)?);
    }
    if let Some(tol) = &args.tol {
        builder = builder.tol(&parse_tol(tol)?);
    }
    if let Some(left) = args.left {
        builder = builder.left(left);
    }
    if let Some(right) = args.right {
        builder = builder.right(right);
    }
    if let Some(verbose) = args.verbose {
        builder = builder.verbose(verbose);
    }
    Ok(builder.build()?)
}

fn predict_command(
    data_path: &Path,
    model_path: &Path,
    time_column: &str,
    output: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    println!("Loading model from: {}", model_path.display());
    let model = ModelArtifact::load(model_path)?;

    let data = TimeSeries::load_tsv(data_path, time_column)?;
    println!("Loaded {} rows for prediction", data.len());

    let table = model.predict(&data)?;
    table.write_tsv(output)?;
    println!(
        "Predictions saved to: {} ({} classified, {:.1} percent foehn)",
        output.display(),
        table.n_classified(),
        100.0 * table.occurrence()
    );
    Ok(())
}
