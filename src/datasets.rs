//! Dataset identifiers and loading.
//!
//! Real datasets are read from `<data_dir>/<NAME>.csv`: a header row with a
//! `time` column, an `event` column (0 = censored, k = cause k) and any number
//! of numeric covariate columns. Blank covariate cells are imputed with the
//! column mean. `SYNTHETIC_COMPETING` falls back to a seeded generator when no
//! file is present.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Exp, StandardNormal};
use serde::{Deserialize, Serialize};

use crate::data::CompetingRisksData;
use crate::error::{ExperimentError, Result};

/// Subjects in the generated synthetic competing risks dataset.
pub const SYNTHETIC_SAMPLES: usize = 30_000;
const SYNTHETIC_FEATURES: usize = 12;
const SYNTHETIC_SEED: u64 = 2018;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dataset {
    Framingham,
    SyntheticCompeting,
    Pbc,
    Seer,
}

impl Dataset {
    pub const ALL: [Dataset; 4] = [
        Dataset::Framingham,
        Dataset::SyntheticCompeting,
        Dataset::Pbc,
        Dataset::Seer,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Dataset::Framingham => "FRAMINGHAM",
            Dataset::SyntheticCompeting => "SYNTHETIC_COMPETING",
            Dataset::Pbc => "PBC",
            Dataset::Seer => "SEER",
        }
    }

    /// where the csv for this dataset is expected
    pub fn csv_path(&self, data_dir: &Path) -> PathBuf {
        data_dir.join(format!("{}.csv", self.name()))
    }
}

impl fmt::Display for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Dataset {
    type Err = ExperimentError;

    fn from_str(s: &str) -> Result<Self> {
        Dataset::ALL
            .into_iter()
            .find(|dataset| dataset.name() == s)
            .ok_or_else(|| ExperimentError::unknown_dataset(s))
    }
}

/// Load a dataset. With `competing = false` every label other than cause 1
/// is treated as censoring.
pub fn load_dataset(dataset: Dataset, competing: bool, data_dir: &Path) -> Result<CompetingRisksData> {
    let path = dataset.csv_path(data_dir);

    let data = if path.is_file() {
        log::info!("Loading {} from {}", dataset, path.display());
        read_csv(&path)?
    } else if dataset == Dataset::SyntheticCompeting {
        log::info!(
            "No {} found, generating {} synthetic subjects",
            path.display(),
            SYNTHETIC_SAMPLES
        );
        generate_synthetic_competing(SYNTHETIC_SAMPLES, SYNTHETIC_SEED)?
    } else {
        return Err(ExperimentError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("dataset file {} does not exist", path.display()),
        )));
    };

    log::info!(
        "{}: {} subjects, {} covariates, {} causes",
        dataset,
        data.n_samples(),
        data.n_features(),
        data.n_causes()
    );

    Ok(if competing { data } else { data.single_cause(1) })
}

/// Read a `time,event,<covariates...>` csv.
pub fn read_csv(path: &Path) -> Result<CompetingRisksData> {
    let mut reader = csv::ReaderBuilder::new().has_headers(true).from_path(path)?;
    let headers = reader.headers()?.clone();

    let column = |name: &str| {
        headers
            .iter()
            .position(|h| h.trim() == name)
            .ok_or_else(|| ExperimentError::invalid_survival_data(format!("missing '{}' column", name)))
    };
    let time_col = column("time")?;
    let event_col = column("event")?;

    let feature_cols: Vec<usize> = (0..headers.len())
        .filter(|&c| c != time_col && c != event_col)
        .collect();
    let feature_names: Vec<String> = feature_cols.iter().map(|&c| headers[c].trim().to_string()).collect();

    let mut times = Vec::new();
    let mut events = Vec::new();
    let mut cells: Vec<Option<f64>> = Vec::new();

    for (row, record) in reader.records().enumerate() {
        let record = record?;
        let line = row + 2; // 1-based, after the header

        times.push(parse_number(record.get(time_col).unwrap_or(""), "time", line)?);

        let event = parse_number(record.get(event_col).unwrap_or(""), "event", line)?;
        if event < 0.0 || event.fract() != 0.0 {
            return Err(ExperimentError::invalid_survival_data(format!(
                "line {}: event must be a non-negative integer, got {}",
                line, event
            )));
        }
        events.push(event as usize);

        for &c in &feature_cols {
            let raw = record.get(c).unwrap_or("").trim();
            if raw.is_empty() || raw.eq_ignore_ascii_case("nan") || raw.eq_ignore_ascii_case("na") {
                cells.push(None);
            } else {
                cells.push(Some(parse_number(raw, &headers[c], line)?));
            }
        }
    }

    let n_samples = times.len();
    let n_features = feature_cols.len();
    let covariates = impute_column_means(cells, n_samples, n_features, &feature_names)?;

    CompetingRisksData::new(times, events, covariates)?.with_feature_names(feature_names)
}

fn parse_number(raw: &str, column: &str, line: usize) -> Result<f64> {
    raw.trim().parse::<f64>().map_err(|_| {
        ExperimentError::invalid_survival_data(format!(
            "line {}: column '{}' is not numeric ({:?})",
            line, column, raw
        ))
    })
}

fn impute_column_means(
    cells: Vec<Option<f64>>,
    n_samples: usize,
    n_features: usize,
    feature_names: &[String],
) -> Result<Array2<f64>> {
    let mut means = vec![0.0; n_features];
    let mut counts = vec![0usize; n_features];
    for (i, cell) in cells.iter().enumerate() {
        if let Some(v) = cell {
            means[i % n_features] += v;
            counts[i % n_features] += 1;
        }
    }

    for j in 0..n_features {
        if counts[j] == 0 && n_samples > 0 {
            return Err(ExperimentError::invalid_survival_data(format!(
                "column '{}' has no values",
                feature_names[j]
            )));
        }
        let missing = n_samples - counts[j];
        if missing > 0 {
            log::warn!("Imputing {} missing values in '{}' with the column mean", missing, feature_names[j]);
        }
        means[j] /= counts[j].max(1) as f64;
    }

    let values: Vec<f64> = cells
        .into_iter()
        .enumerate()
        .map(|(i, cell)| cell.unwrap_or(means[i % n_features]))
        .collect();

    Array2::from_shape_vec((n_samples, n_features), values)
        .map_err(|e| ExperimentError::invalid_dimensions(e.to_string()))
}

/// Two-cause synthetic data with non-linear hazards.
///
/// Features are iid N(0, 1). Latent times are exponential with rates
/// `exp(0.1 * (sum x3)^2 + 0.1 * sum xk)` for cause k, where x1, x2, x3 are
/// consecutive blocks of four features. Half the subjects are censored at a
/// uniform time before their first failure.
pub fn generate_synthetic_competing(n_samples: usize, seed: u64) -> Result<CompetingRisksData> {
    let mut rng = StdRng::seed_from_u64(seed);
    let block = SYNTHETIC_FEATURES / 3;

    let mut covariates_vec = Vec::with_capacity(n_samples * SYNTHETIC_FEATURES);
    let mut times = Vec::with_capacity(n_samples);
    let mut events = Vec::with_capacity(n_samples);

    for _ in 0..n_samples {
        let x: Vec<f64> = (0..SYNTHETIC_FEATURES).map(|_| rng.sample(StandardNormal)).collect();
        let shared: f64 = x[2 * block..].iter().sum();

        let mut latent = [0.0; 2];
        for (cause, slot) in latent.iter_mut().enumerate() {
            let own: f64 = x[cause * block..(cause + 1) * block].iter().sum();
            let rate = (0.1 * shared * shared + 0.1 * own).exp();
            let dist = Exp::new(rate)
                .map_err(|e| ExperimentError::numerical_error(format!("cause {} rate {}: {}", cause + 1, rate, e)))?;
            *slot = rng.sample(dist);
        }

        let (first, cause) = if latent[0] <= latent[1] { (latent[0], 1) } else { (latent[1], 2) };

        if rng.gen_bool(0.5) {
            times.push(rng.gen_range(0.0..=first));
            events.push(0);
        } else {
            times.push(first);
            events.push(cause);
        }
        covariates_vec.extend(x);
    }

    let covariates = Array2::from_shape_vec((n_samples, SYNTHETIC_FEATURES), covariates_vec)
        .map_err(|e| ExperimentError::invalid_dimensions(e.to_string()))?;
    let names = (1..=SYNTHETIC_FEATURES).map(|j| format!("feature{}", j)).collect();

    CompetingRisksData::new(times, events, covariates)?.with_feature_names(names)
}
