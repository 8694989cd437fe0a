//! # competing risks experiments
//!
//! grid-search comparison of competing-risks survival models (DSM, NFG,
//! DeSurv, DeepHit) - sample hyperparameters, cross-validate, keep the best
//!
//! ## what you get
//!
//! - the comparison plan: 10 runs per dataset, each w/ its own grid
//! - seeded sampling from the cartesian product of a grid
//! - stratified k-fold runner w/ checkpoints you can resume from
//! - cause-specific cox backend w/ cumulative incidence predictions
//!
//! ## quick start
//!
//! ```rust,no_run
//! use competing_risks::{
//!     datasets::{load_dataset, Dataset},
//!     driver::SearchSpace,
//!     experiment::NfgExperiment,
//!     family::TrainOptions,
//! };
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let data = load_dataset(Dataset::Pbc, true, Path::new("data"))?;
//! let grid = SearchSpace::new(Dataset::Pbc, 1000).nfg()?;
//!
//! NfgExperiment::create(&grid, 100, "Results/PBC_nfg", 0, None)?
//!     .train(&data, TrainOptions::default())?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod data;
pub mod datasets;
pub mod driver;
pub mod error;
pub mod experiment;
pub mod family;
pub mod grid;
pub mod metrics;
pub mod model;
pub mod optimization;

pub use config::ExperimentSettings;
pub use data::CompetingRisksData;
pub use datasets::Dataset;
pub use error::{ExperimentError, Result};
pub use grid::{ParamGrid, ParameterSampler, Params};
pub use model::CauseSpecificCox;
