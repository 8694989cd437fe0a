use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};
use crate::{
    data::CompetingRisksData,
    error::{ExperimentError, Result},
    optimization::{mean_negative_log_likelihood, CoxOptimizer, OptimizationConfig},
};

/// ridge strength per unit of dropout odds p / (1 - p)
const DROPOUT_RIDGE_SCALE: f64 = 0.01;

/// breslow baseline hazard for one cause: jump sizes at the cause's event times
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BaselineHazard {
    pub times: Vec<f64>,
    pub jumps: Vec<f64>,
}

/// one cox model per cause, fit by minibatch adam w/ early stopping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CauseSpecificCox {
    coefficients: Option<Vec<Array1<f64>>>, // fitted betas, one per cause
    baselines: Vec<BaselineHazard>,         // one per cause
    learning_rate: f64,
    max_epochs: usize,
    batch_size: usize,
    l2_penalty: f64,                        // ridge penalty
    patience: usize,                        // epochs w/o val improvement
    cause_specific: bool,                   // stop each cause on its own
    seed: u64,
}

impl Default for CauseSpecificCox {
    fn default() -> Self {
        let config = OptimizationConfig::default();
        Self {
            coefficients: None,
            baselines: Vec::new(),
            learning_rate: config.learning_rate,
            max_epochs: config.max_epochs,
            batch_size: config.batch_size,
            l2_penalty: config.l2_penalty,
            patience: config.patience,
            cause_specific: false,
            seed: config.seed,
        }
    }
}

impl CauseSpecificCox {
    /// new model w/ defaults
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_learning_rate(mut self, learning_rate: f64) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    /// passes over the training set before giving up
    pub fn with_max_epochs(mut self, max_epochs: usize) -> Self {
        self.max_epochs = max_epochs;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// add ridge penalty (L2) - shrinks coefficients
    pub fn with_l2_penalty(mut self, penalty: f64) -> Self {
        self.l2_penalty = penalty.max(0.0);
        self
    }

    /// dropout on a linear predictor acts like a ridge penalty on the odds p / (1 - p)
    pub fn with_dropout(mut self, dropout: f64) -> Result<Self> {
        if !(0.0..1.0).contains(&dropout) {
            return Err(ExperimentError::invalid_parameter("dropout", dropout.to_string()));
        }
        self.l2_penalty += DROPOUT_RIDGE_SCALE * dropout / (1.0 - dropout);
        Ok(self)
    }

    /// epochs without validation improvement before a cause stops
    pub fn with_patience(mut self, patience: usize) -> Self {
        self.patience = patience.max(1);
        self
    }

    /// stop each cause on its own validation loss instead of the sum
    pub fn with_cause_specific(mut self, cause_specific: bool) -> Self {
        self.cause_specific = cause_specific;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// fit causes 1..=n_causes on `train`, early stopping on `val`
    pub fn fit(&mut self, train: &CompetingRisksData, val: &CompetingRisksData, n_causes: usize) -> Result<&mut Self> {
        if n_causes == 0 {
            return Err(ExperimentError::invalid_survival_data("no events to model"));
        }

        let optimizer = CoxOptimizer::new(OptimizationConfig {
            l2_penalty: self.l2_penalty,
            max_epochs: self.max_epochs,
            batch_size: self.batch_size,
            learning_rate: self.learning_rate,
            patience: self.patience,
            seed: self.seed,
            ..OptimizationConfig::default()
        });

        let coefficients = optimizer.optimize(train, val, n_causes, self.cause_specific)?;
        self.baselines = coefficients
            .iter()
            .enumerate()
            .map(|(c, beta)| breslow_baseline(train, c + 1, beta.view()))
            .collect();
        self.coefficients = Some(coefficients);

        Ok(self)
    }

    /// fitted coefficients, one vector per cause
    pub fn coefficients(&self) -> Result<&[Array1<f64>]> {
        self.coefficients.as_deref().ok_or(ExperimentError::ModelNotFitted)
    }

    pub fn n_causes(&self) -> usize {
        self.coefficients.as_ref().map_or(0, Vec::len)
    }

    pub fn is_fitted(&self) -> bool {
        self.coefficients.is_some()
    }

    /// linear predictor x·beta_k for cause k (1-based)
    pub fn predict_risk(&self, covariates: ArrayView2<f64>, cause: usize) -> Result<Array1<f64>> {
        let coefficients = self.coefficients()?;
        let beta = cause
            .checked_sub(1)
            .and_then(|c| coefficients.get(c))
            .ok_or_else(|| ExperimentError::invalid_parameter("cause", cause.to_string()))?;

        if covariates.ncols() != beta.len() {
            return Err(ExperimentError::invalid_dimensions(
                format!("feature count mismatch: expected {}, got {}", beta.len(), covariates.ncols())
            ));
        }

        Ok(covariates.dot(beta))
    }

    /// cumulative incidence per cause at `times`: one (n_samples x n_times) matrix per cause
    ///
    /// at each baseline jump the chance of failing is 1 - exp(-dH) shared out
    /// across causes by hazard, so the incidences plus survival sum to 1
    pub fn predict_cif(&self, covariates: ArrayView2<f64>, times: ArrayView1<f64>) -> Result<Vec<Array2<f64>>> {
        let n_causes = self.n_causes();
        let risks: Vec<Array1<f64>> = (1..=n_causes)
            .map(|k| self.predict_risk(covariates, k).map(|r| r.mapv(f64::exp)))
            .collect::<Result<_>>()?;

        let mut jump_times: Vec<f64> = self.baselines.iter().flat_map(|b| b.times.iter().copied()).collect();
        jump_times.sort_by(f64::total_cmp);
        jump_times.dedup();

        // per merged jump time, baseline increment for every cause
        let increments: Vec<Vec<f64>> = jump_times
            .iter()
            .map(|&t| self.baselines.iter().map(|b| b.jump_at(t)).collect())
            .collect();

        let mut eval_order: Vec<usize> = (0..times.len()).collect();
        eval_order.sort_by(|&a, &b| times[a].total_cmp(&times[b]));

        let n_samples = covariates.nrows();
        let mut cifs = vec![Array2::zeros((n_samples, times.len())); n_causes];

        for i in 0..n_samples {
            let mut survival = 1.0;
            let mut incidence = vec![0.0; n_causes];
            let mut next_jump = 0;

            for &col in &eval_order {
                while next_jump < jump_times.len() && jump_times[next_jump] <= times[col] {
                    let hazards: Vec<f64> = (0..n_causes).map(|c| increments[next_jump][c] * risks[c][i]).collect();
                    let total: f64 = hazards.iter().sum();
                    if total > 0.0 {
                        let failing = survival * (1.0 - (-total).exp());
                        for c in 0..n_causes {
                            incidence[c] += failing * hazards[c] / total;
                        }
                        survival -= failing;
                    }
                    next_jump += 1;
                }
                for c in 0..n_causes {
                    cifs[c][[i, col]] = incidence[c];
                }
            }
        }

        Ok(cifs)
    }

    /// summed per-subject negative partial log-likelihood across causes
    pub fn loss(&self, data: &CompetingRisksData) -> Result<f64> {
        let coefficients = self.coefficients()?;
        Ok(coefficients
            .iter()
            .enumerate()
            .map(|(c, beta)| {
                let events = data.cause_indicator(c + 1);
                mean_negative_log_likelihood(data.covariates(), data.times(), &events, beta.view())
            })
            .sum())
    }

    /// what regularization / optimizer settings are we using?
    pub fn l2_penalty(&self) -> f64 {
        self.l2_penalty
    }

    pub fn patience(&self) -> usize {
        self.patience
    }
}

impl BaselineHazard {
    fn jump_at(&self, time: f64) -> f64 {
        self.times
            .binary_search_by(|t| t.total_cmp(&time))
            .map(|idx| self.jumps[idx])
            .unwrap_or(0.0)
    }
}

/// dH0(t) = d(t) / sum_{j at risk} exp(x_j beta) at each event time of `cause`
///
/// One pass over subjects sorted by decreasing time, tied times join the risk
/// set together before their deaths are counted.
fn breslow_baseline(data: &CompetingRisksData, cause: usize, beta: ArrayView1<f64>) -> BaselineHazard {
    let risk = data.covariates().dot(&beta).mapv(f64::exp);
    let times = data.times();
    let events = data.events();
    let n = times.len();

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| times[b].total_cmp(&times[a]));

    let mut event_times = Vec::new();
    let mut jumps = Vec::new();
    let mut at_risk = 0.0;

    let mut start = 0;
    while start < n {
        let time = times[order[start]];
        let mut end = start;
        let mut deaths = 0usize;
        while end < n && times[order[end]] == time {
            let i = order[end];
            at_risk += risk[i];
            if events[i] == cause {
                deaths += 1;
            }
            end += 1;
        }

        if deaths > 0 {
            event_times.push(time);
            jumps.push(if at_risk > 0.0 { deaths as f64 / at_risk } else { 0.0 });
        }
        start = end;
    }

    event_times.reverse();
    jumps.reverse();
    BaselineHazard { times: event_times, jumps }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn create_test_data() -> CompetingRisksData {
        let times = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0];
        let events = vec![1, 2, 1, 1, 0, 2, 1, 0];
        let covariates = Array2::from_shape_vec((8, 3), vec![
            1.0, 0.0, 0.5,
            0.0, 1.0, -0.5,
            1.0, 1.0, 0.0,
            -1.0, 0.0, 1.0,
            0.0, -1.0, -1.0,
            1.0, -1.0, 0.5,
            -1.0, 1.0, -0.5,
            0.0, 0.0, 0.0,
        ]).unwrap();

        CompetingRisksData::new(times, events, covariates).unwrap()
    }

    fn fitted_model() -> (CauseSpecificCox, CompetingRisksData) {
        let data = create_test_data();
        let mut model = CauseSpecificCox::new()
            .with_learning_rate(0.01)
            .with_max_epochs(100)
            .with_batch_size(4);
        model.fit(&data, &data, 2).unwrap();
        (model, data)
    }

    #[test]
    fn test_model_creation() {
        let model = CauseSpecificCox::new()
            .with_learning_rate(1e-4)
            .with_batch_size(250)
            .with_max_epochs(500)
            .with_l2_penalty(-1.0);

        assert_eq!(model.learning_rate, 1e-4);
        assert_eq!(model.batch_size, 250);
        assert_eq!(model.max_epochs, 500);
        assert_eq!(model.l2_penalty(), 0.0);
        assert!(!model.is_fitted());
    }

    #[test]
    fn test_dropout_maps_to_ridge() {
        let model = CauseSpecificCox::new().with_dropout(0.5).unwrap();
        assert_relative_eq!(model.l2_penalty(), DROPOUT_RIDGE_SCALE, epsilon = 1e-12);
        assert_eq!(CauseSpecificCox::new().with_dropout(0.0).unwrap().l2_penalty(), 0.0);
        assert!(CauseSpecificCox::new().with_dropout(1.0).is_err());
    }

    #[test]
    fn test_model_not_fitted_error() {
        let model = CauseSpecificCox::new();
        assert!(model.coefficients().is_err());
        assert!(model.predict_risk(Array2::zeros((5, 3)).view(), 1).is_err());
        assert!(model.loss(&create_test_data()).is_err());
    }

    #[test]
    fn test_fit_and_predict_risk() {
        let (model, data) = fitted_model();
        assert!(model.is_fitted());
        assert_eq!(model.n_causes(), 2);

        let risk = model.predict_risk(data.covariates(), 2).unwrap();
        assert_eq!(risk.len(), 8);
        assert!(risk.iter().all(|r| r.is_finite()));

        assert!(model.predict_risk(data.covariates(), 0).is_err());
        assert!(model.predict_risk(data.covariates(), 3).is_err());
        assert!(model.predict_risk(Array2::zeros((5, 2)).view(), 1).is_err());
    }

    #[test]
    fn test_cif_is_monotone_and_bounded() {
        let (model, data) = fitted_model();
        let times = Array1::from(vec![8.0, 0.5, 2.0, 4.5, 100.0]);
        let cifs = model.predict_cif(data.covariates(), times.view()).unwrap();

        assert_eq!(cifs.len(), 2);
        assert_eq!(cifs[0].dim(), (8, 5));

        // columns in increasing time order: 1 (0.5), 2 (2.0), 3 (4.5), 0 (8.0), 4 (100)
        let ordered = [1, 2, 3, 0, 4];
        for i in 0..8 {
            for w in ordered.windows(2) {
                assert!(cifs[0][[i, w[0]]] <= cifs[0][[i, w[1]]] + 1e-12);
                assert!(cifs[1][[i, w[0]]] <= cifs[1][[i, w[1]]] + 1e-12);
            }
            assert_eq!(cifs[0][[i, 1]], 0.0);
            let total = cifs[0][[i, 4]] + cifs[1][[i, 4]];
            assert!(total > 0.0 && total <= 1.0 + 1e-12);
        }
    }

    #[test]
    fn test_breslow_baseline_at_zero_coefficients() {
        let data = create_test_data();
        let baseline = breslow_baseline(&data, 1, Array1::zeros(3).view());

        // cause 1 fails at 1, 3, 4, 7 with 8, 6, 5, 2 at risk
        assert_eq!(baseline.times, vec![1.0, 3.0, 4.0, 7.0]);
        assert_relative_eq!(baseline.jumps[0], 1.0 / 8.0, epsilon = 1e-12);
        assert_relative_eq!(baseline.jumps[3], 1.0 / 2.0, epsilon = 1e-12);
        assert_eq!(baseline.jump_at(3.0), 1.0 / 6.0);
        assert_eq!(baseline.jump_at(2.0), 0.0);
    }

    #[test]
    fn test_breslow_baseline_with_ties_matches_direct_sums() {
        let times = vec![2.0, 1.0, 2.0, 3.0, 2.0, 5.0, 3.0, 1.0];
        let events = vec![1, 1, 1, 2, 0, 1, 1, 0];
        let covariates = Array2::from_shape_vec((8, 2), vec![
            0.5, -1.0,
            1.0, 0.0,
            -0.5, 0.5,
            0.0, 1.0,
            2.0, -0.5,
            -1.0, 0.0,
            0.3, 0.3,
            0.0, -2.0,
        ]).unwrap();
        let data = CompetingRisksData::new(times.clone(), events.clone(), covariates.clone()).unwrap();
        let beta = Array1::from(vec![0.4, -0.7]);
        let risk = covariates.dot(&beta).mapv(f64::exp);

        let baseline = breslow_baseline(&data, 1, beta.view());
        assert_eq!(baseline.times, vec![1.0, 2.0, 3.0, 5.0]);

        for (&t, &jump) in baseline.times.iter().zip(&baseline.jumps) {
            let deaths = (0..8).filter(|&i| times[i] == t && events[i] == 1).count() as f64;
            let at_risk: f64 = (0..8).filter(|&i| times[i] >= t).map(|i| risk[i]).sum();
            assert_relative_eq!(jump, deaths / at_risk, epsilon = 1e-12);
        }
        // two cause-1 deaths tied at t = 2
        assert_relative_eq!(
            baseline.jump_at(2.0),
            2.0 / (risk[0] + risk[2] + risk[3] + risk[4] + risk[5] + risk[6]),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_loss_is_finite() {
        let (model, data) = fitted_model();
        assert!(model.loss(&data).unwrap().is_finite());
    }
}
