use ndarray::{Array1, ArrayView1, ArrayView2};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use crate::{
    data::CompetingRisksData,
    error::{ExperimentError, Result},
};

/// Configuration for cause-specific Cox optimization
#[derive(Debug, Clone)]
pub struct OptimizationConfig {
    pub l2_penalty: f64,
    pub max_epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub patience: usize,    // epochs without validation improvement before stopping
    pub beta1: f64,         // Adam momentum parameter
    pub beta2: f64,         // Adam decay parameter for second moment
    pub epsilon: f64,       // Adam numerical stability
    pub seed: u64,          // minibatch shuffling
}

impl Default for OptimizationConfig {
    fn default() -> Self {
        Self {
            l2_penalty: 0.0,
            max_epochs: 1000,
            batch_size: 100,
            learning_rate: 0.001,
            patience: 10,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            seed: 0,
        }
    }
}

/// Adam optimizer state for momentum tracking
#[derive(Debug, Clone)]
struct AdamState {
    m: Array1<f64>,  // First moment estimate
    v: Array1<f64>,  // Second moment estimate
    t: usize,        // Time step
}

impl AdamState {
    fn new(n_features: usize) -> Self {
        Self {
            m: Array1::zeros(n_features),
            v: Array1::zeros(n_features),
            t: 0,
        }
    }
}

/// Causes whose early stopping is decided together
#[derive(Debug, Clone)]
struct StoppingGroup {
    causes: Vec<usize>,   // 0-based positions into the coefficient list
    best_loss: f64,
    best: Vec<Array1<f64>>,
    waited: usize,
    active: bool,
}

/// Minibatch Adam over the Breslow partial likelihood, one coefficient
/// vector per cause, early stopping on a validation set.
pub struct CoxOptimizer {
    config: OptimizationConfig,
}

impl CoxOptimizer {
    pub fn new(config: OptimizationConfig) -> Self {
        Self { config }
    }

    /// Fit causes `1..=n_causes`. With `cause_specific` every cause stops on
    /// its own validation loss; otherwise all causes stop on their sum.
    pub fn optimize(
        &self,
        train: &CompetingRisksData,
        val: &CompetingRisksData,
        n_causes: usize,
        cause_specific: bool,
    ) -> Result<Vec<Array1<f64>>> {
        if train.n_features() != val.n_features() {
            return Err(ExperimentError::invalid_dimensions(
                format!("train has {} features, val has {}", train.n_features(), val.n_features())
            ));
        }
        if self.config.batch_size == 0 || self.config.learning_rate <= 0.0 {
            return Err(ExperimentError::invalid_parameter(
                "optimizer",
                format!("batch={} learning_rate={}", self.config.batch_size, self.config.learning_rate),
            ));
        }

        let n_features = train.n_features();
        let mut betas: Vec<Array1<f64>> = vec![Array1::zeros(n_features); n_causes];
        let mut adam: Vec<AdamState> = vec![AdamState::new(n_features); n_causes];

        let train_events: Vec<Vec<bool>> = (1..=n_causes).map(|k| train.cause_indicator(k)).collect();
        let val_events: Vec<Vec<bool>> = (1..=n_causes).map(|k| val.cause_indicator(k)).collect();

        let val_losses = |betas: &[Array1<f64>]| -> Vec<f64> {
            betas
                .iter()
                .zip(&val_events)
                .map(|(beta, events)| {
                    mean_negative_log_likelihood(val.covariates(), val.times(), events, beta.view())
                })
                .collect()
        };

        let initial = val_losses(&betas);
        let groupings: Vec<Vec<usize>> = if cause_specific {
            (0..n_causes).map(|c| vec![c]).collect()
        } else {
            vec![(0..n_causes).collect()]
        };
        let mut groups: Vec<StoppingGroup> = groupings
            .into_iter()
            .map(|causes| StoppingGroup {
                best_loss: causes.iter().map(|&c| initial[c]).sum(),
                best: causes.iter().map(|&c| betas[c].clone()).collect(),
                causes,
                waited: 0,
                active: true,
            })
            .collect();

        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let mut order: Vec<usize> = (0..train.n_samples()).collect();

        for epoch in 0..self.config.max_epochs {
            let active: Vec<usize> = groups
                .iter()
                .filter(|g| g.active)
                .flat_map(|g| g.causes.iter().copied())
                .collect();
            if active.is_empty() {
                log::debug!("all causes stopped early at epoch {}", epoch);
                break;
            }

            order.shuffle(&mut rng);
            let mut diverged = false;

            for batch in order.chunks(self.config.batch_size) {
                let x = train.covariates().select(ndarray::Axis(0), batch);
                let t = train.times().select(ndarray::Axis(0), batch);

                for &c in &active {
                    let events: Vec<bool> = batch.iter().map(|&i| train_events[c][i]).collect();
                    let (_, mut gradient) = negative_log_likelihood_and_gradient(x.view(), t.view(), &events, betas[c].view());
                    gradient /= batch.len() as f64;

                    if self.config.l2_penalty > 0.0 {
                        gradient = &gradient + &(self.config.l2_penalty * &betas[c]);
                    }

                    if gradient.iter().any(|g| !g.is_finite()) {
                        diverged = true;
                        break;
                    }

                    self.adam_step(&mut adam[c], &mut betas[c], &gradient);
                }

                if diverged {
                    break;
                }
            }

            if diverged || betas.iter().any(|b| b.iter().any(|v| !v.is_finite())) {
                if epoch == 0 {
                    return Err(ExperimentError::optimization_failed(
                        "gradient became non-finite in the first epoch"
                    ));
                }
                log::warn!("gradient became non-finite at epoch {}, keeping best coefficients", epoch);
                break;
            }

            let losses = val_losses(&betas);
            for group in groups.iter_mut().filter(|g| g.active) {
                let loss: f64 = group.causes.iter().map(|&c| losses[c]).sum();
                if loss < group.best_loss {
                    group.best_loss = loss;
                    group.best = group.causes.iter().map(|&c| betas[c].clone()).collect();
                    group.waited = 0;
                } else {
                    group.waited += 1;
                    if group.waited >= self.config.patience {
                        group.active = false;
                    }
                }
            }
        }

        for group in groups {
            for (c, beta) in group.causes.into_iter().zip(group.best) {
                betas[c] = beta;
            }
        }

        Ok(betas)
    }

    /// One Adam descent step with the clipping the solver has always used
    fn adam_step(&self, state: &mut AdamState, beta: &mut Array1<f64>, gradient: &Array1<f64>) {
        state.t += 1;

        state.m = &(self.config.beta1 * &state.m) + &((1.0 - self.config.beta1) * gradient);
        state.v = &(self.config.beta2 * &state.v) + &((1.0 - self.config.beta2) * &gradient.mapv(|g| g * g));

        let m_hat = &state.m / (1.0 - self.config.beta1.powi(state.t as i32));
        let v_hat = &state.v / (1.0 - self.config.beta2.powi(state.t as i32));

        for i in 0..beta.len() {
            let update = self.config.learning_rate * m_hat[i] / (v_hat[i].sqrt() + self.config.epsilon);
            // Clip updates to reasonable range
            beta[i] -= update.clamp(-1.0, 1.0);
            beta[i] = beta[i].clamp(-10.0, 10.0);
        }
    }
}

/// Negative Breslow partial log-likelihood and its gradient w.r.t. beta.
///
/// Runs in one pass over subjects sorted by decreasing time, so the risk set
/// sums are cumulative. Tied times enter the risk set before their events.
pub fn negative_log_likelihood_and_gradient(
    covariates: ArrayView2<f64>,
    times: ArrayView1<f64>,
    events: &[bool],
    beta: ArrayView1<f64>,
) -> (f64, Array1<f64>) {
    let n = times.len();
    let n_features = covariates.ncols();
    let mut gradient = Array1::zeros(n_features);
    if n == 0 || !events.iter().any(|&e| e) {
        return (0.0, gradient);
    }

    let eta = covariates.dot(&beta);
    let max_eta = eta.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| times[b].total_cmp(&times[a]));

    let mut s0 = 0.0;                              // sum of exp(eta - max) in risk set
    let mut s1: Array1<f64> = Array1::zeros(n_features); // same, weighted by covariates
    let mut loss = 0.0;

    let mut start = 0;
    while start < n {
        let time = times[order[start]];
        let mut end = start;
        while end < n && times[order[end]] == time {
            let i = order[end];
            let w = (eta[i] - max_eta).exp();
            s0 += w;
            s1.scaled_add(w, &covariates.row(i));
            end += 1;
        }

        let log_s0 = s0.ln() + max_eta;
        let mean = &s1 / s0;
        for &i in &order[start..end] {
            if events[i] {
                loss -= eta[i] - log_s0;
                gradient -= &(&covariates.row(i) - &mean);
            }
        }
        start = end;
    }

    (loss, gradient)
}

/// Negative partial log-likelihood divided by the number of subjects
pub fn mean_negative_log_likelihood(
    covariates: ArrayView2<f64>,
    times: ArrayView1<f64>,
    events: &[bool],
    beta: ArrayView1<f64>,
) -> f64 {
    if times.is_empty() {
        return 0.0;
    }
    let (loss, _) = negative_log_likelihood_and_gradient(covariates, times, events, beta);
    loss / times.len() as f64
}
