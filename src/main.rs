use std::path::PathBuf;
use std::process;

use clap::Parser;
use competing_risks::config::ExperimentSettings;
use competing_risks::driver::{self, DryRunLauncher, ExperimentLauncher};

#[derive(Parser)]
#[command(
    name = "experiment_competing_risk",
    about = "Train the competing-risks model comparison on one dataset",
    long_about = "Runs the DSM, NFG, DeSurv and DeepHit grid searches (10 runs) on one dataset. \
                 Results land in <results-dir>/<DATASET>_<model>.csv; interrupted runs resume \
                 from their .json checkpoint."
)]
struct Cli {
    /// FRAMINGHAM, SYNTHETIC_COMPETING, PBC or SEER
    dataset: String,

    /// Only run this cross-validation fold
    fold: Option<String>,

    /// TOML file with default settings (flags below override it)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Trials sampled from each grid
    #[arg(long, value_name = "N")]
    n_iter: Option<usize>,

    /// Maximum training epochs per trial
    #[arg(long, value_name = "N")]
    max_epochs: Option<usize>,

    /// Epochs without validation improvement before training stops
    #[arg(long, value_name = "N")]
    patience: Option<usize>,

    /// Seed for trial sampling, fold assignment and minibatches
    #[arg(long)]
    seed: Option<u64>,

    /// Number of cross-validation folds
    #[arg(long, value_name = "K")]
    k_folds: Option<usize>,

    #[arg(long, value_name = "DIR")]
    results_dir: Option<PathBuf>,

    /// Directory holding <DATASET>.csv files
    #[arg(long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Rerun even when results or checkpoints exist
    #[arg(long)]
    force: bool,

    /// Read the dataset and log the plan without training
    #[arg(long)]
    dry_run: bool,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut settings = match &cli.config {
        Some(path) => ExperimentSettings::from_toml_file(path)?,
        None => ExperimentSettings::default(),
    };
    if let Some(n_iter) = cli.n_iter {
        settings = settings.with_n_iter(n_iter);
    }
    if let Some(max_epochs) = cli.max_epochs {
        settings = settings.with_max_epochs(max_epochs);
    }
    if let Some(patience) = cli.patience {
        settings = settings.with_patience(patience);
    }
    if let Some(seed) = cli.seed {
        settings = settings.with_random_seed(seed);
    }
    if let Some(k_folds) = cli.k_folds {
        settings = settings.with_k_folds(k_folds);
    }
    if let Some(dir) = cli.results_dir {
        settings = settings.with_results_dir(dir);
    }
    if let Some(dir) = cli.data_dir {
        settings = settings.with_data_dir(dir);
    }
    if cli.force {
        settings = settings.with_force(true);
    }
    log::debug!("settings: {:?}", settings);

    let launched = if cli.dry_run {
        driver::run(&cli.dataset, cli.fold.as_deref(), &settings, &mut DryRunLauncher)?
    } else {
        let mut launcher = ExperimentLauncher::new(settings.clone());
        driver::run(&cli.dataset, cli.fold.as_deref(), &settings, &mut launcher)?
    };

    log::info!("Finished {} experiments on {}", launched, cli.dataset);
    Ok(())
}
