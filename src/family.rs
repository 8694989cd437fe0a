//! The four model families the experiments compare.
//!
//! Each family checks the options its grid carries and turns one sampled
//! trial into a fitted [`CauseSpecificCox`]. Architectural options are
//! validated and kept with the trial; the Cox backend consumes the optimizer
//! options (`epochs`, `learning_rate`, `batch`) and `dropout`.

use crate::data::CompetingRisksData;
use crate::error::{ExperimentError, Result};
use crate::grid::Params;
use crate::model::CauseSpecificCox;
use crate::optimization::OptimizationConfig;

/// Per-call flags for [`crate::experiment::ExperimentRunner::train`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrainOptions {
    /// one sub-model per cause instead of shared parameters
    pub cause_specific: bool,
    /// early stopping patience in epochs
    pub patience: usize,
}

impl Default for TrainOptions {
    fn default() -> Self {
        Self {
            cause_specific: false,
            patience: OptimizationConfig::default().patience,
        }
    }
}

impl TrainOptions {
    pub fn cause_specific() -> Self {
        Self { cause_specific: true, ..Self::default() }
    }

    pub fn with_patience(mut self, patience: usize) -> Self {
        self.patience = patience;
        self
    }
}

pub trait ModelFamily {
    /// short name used in logs
    const NAME: &'static str;

    /// check the family-specific options of one trial
    fn validate(params: &Params) -> Result<()>;

    /// fit one trial; `val` drives early stopping
    fn fit(
        params: &Params,
        train: &CompetingRisksData,
        val: &CompetingRisksData,
        n_causes: usize,
        options: TrainOptions,
        seed: u64,
    ) -> Result<CauseSpecificCox> {
        Self::validate(params)?;

        let mut model = CauseSpecificCox::new()
            .with_max_epochs(params.usize("epochs")?)
            .with_learning_rate(positive(params, "learning_rate")?)
            .with_batch_size(params.usize("batch")?)
            .with_cause_specific(options.cause_specific)
            .with_patience(options.patience)
            .with_seed(seed);
        if params.contains("dropout") {
            model = model.with_dropout(params.float("dropout")?)?;
        }

        model.fit(train, val, n_causes)?;
        Ok(model)
    }
}

/// Deep Survival Machines: mixture of `k` parametric distributions
pub struct Dsm;

/// Neural Fine-Gray
pub struct Nfg;

/// DeSurv: ODE-based cumulative incidence
pub struct DeSurv;

/// DeepHit: discrete-time joint distribution over causes
pub struct DeepHit;

const ACTIVATIONS: [&str; 3] = ["Tanh", "ReLU", "ReLU6"];

impl ModelFamily for Dsm {
    const NAME: &'static str = "DSM";

    fn validate(params: &Params) -> Result<()> {
        if params.usize("k")? == 0 {
            return Err(ExperimentError::invalid_parameter("k", "0"));
        }
        let distribution = params.string("distribution")?;
        if !["LogNormal", "Weibull"].contains(&distribution) {
            return Err(ExperimentError::invalid_parameter("distribution", distribution));
        }
        layers(params, "layers")
    }
}

impl ModelFamily for Nfg {
    const NAME: &'static str = "NFG";

    fn validate(params: &Params) -> Result<()> {
        let dropout = params.float("dropout")?;
        if !(0.0..1.0).contains(&dropout) {
            return Err(ExperimentError::invalid_parameter("dropout", dropout.to_string()));
        }
        if params.contains("multihead") {
            params.bool("multihead")?;
        }
        activation(params)?;
        layers(params, "layers")?;
        layers(params, "layers_surv")
    }
}

impl ModelFamily for DeSurv {
    const NAME: &'static str = "DeSurv";

    fn validate(params: &Params) -> Result<()> {
        params.bool("embedding")?;
        activation(params)?;
        layers(params, "layers")?;
        layers(params, "layers_surv")
    }
}

impl ModelFamily for DeepHit {
    const NAME: &'static str = "DeepHit";

    fn validate(params: &Params) -> Result<()> {
        layers(params, "nodes")?;
        layers(params, "shared")
    }
}

fn layers(params: &Params, option: &str) -> Result<()> {
    let shape = params.layers(option)?;
    if shape.is_empty() || shape.contains(&0) {
        return Err(ExperimentError::invalid_parameter(option, format!("{:?}", shape)));
    }
    Ok(())
}

fn activation(params: &Params) -> Result<()> {
    let act = params.string("act")?;
    if !ACTIVATIONS.contains(&act) {
        return Err(ExperimentError::invalid_parameter("act", act));
    }
    Ok(())
}

fn positive(params: &Params, option: &str) -> Result<f64> {
    let value = params.float(option)?;
    if value > 0.0 && value.is_finite() {
        Ok(value)
    } else {
        Err(ExperimentError::invalid_parameter(option, value.to_string()))
    }
}
