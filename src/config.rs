use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::experiment::RunnerOptions;

/// settings shared by every run of one driver invocation
///
/// every field is optional in a toml file, missing ones keep their default:
///
/// ```toml
/// n_iter = 20
/// max_epochs = 200
/// results_dir = "scratch/Results"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExperimentSettings {
    pub n_iter: usize,              // trials sampled per grid
    pub max_epochs: usize,          // the single `epochs` candidate
    pub patience: usize,            // early stopping, epochs w/o val improvement
    pub random_seed: u64,
    pub k_folds: usize,
    pub evaluation_points: usize,   // cumulative incidence columns per cause
    pub results_dir: PathBuf,
    pub data_dir: PathBuf,
    pub force: bool,                // rerun even if results exist
}

impl Default for ExperimentSettings {
    fn default() -> Self {
        Self {
            n_iter: 100,
            max_epochs: 1000,
            patience: 10,
            random_seed: 0,
            k_folds: 5,
            evaluation_points: 100,
            results_dir: PathBuf::from("Results"),
            data_dir: PathBuf::from("data"),
            force: false,
        }
    }
}

impl ExperimentSettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// read settings from a toml file
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    pub fn with_n_iter(mut self, n_iter: usize) -> Self {
        self.n_iter = n_iter;
        self
    }

    pub fn with_max_epochs(mut self, max_epochs: usize) -> Self {
        self.max_epochs = max_epochs;
        self
    }

    pub fn with_patience(mut self, patience: usize) -> Self {
        self.patience = patience;
        self
    }

    pub fn with_random_seed(mut self, seed: u64) -> Self {
        self.random_seed = seed;
        self
    }

    pub fn with_k_folds(mut self, k_folds: usize) -> Self {
        self.k_folds = k_folds;
        self
    }

    pub fn with_evaluation_points(mut self, points: usize) -> Self {
        self.evaluation_points = points;
        self
    }

    pub fn with_results_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.results_dir = dir.into();
        self
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn runner_options(&self) -> RunnerOptions {
        RunnerOptions {
            k_folds: self.k_folds,
            force: self.force,
            evaluation_points: self.evaluation_points,
        }
    }
}
