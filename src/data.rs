use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use crate::error::{ExperimentError, Result};

/// competing risks data - times, cause labels, and patient features
#[derive(Debug, Clone)]
pub struct CompetingRisksData {
    times: Array1<f64>,          // time to event/censoring
    events: Array1<usize>,       // 0 = censored, k = cause k
    covariates: Array2<f64>,     // patient features (n_samples x n_features)
    feature_names: Vec<String>,  // one name per covariate column
}

impl CompetingRisksData {
    /// make new competing risks data from raw vecs/arrays
    pub fn new(
        times: Vec<f64>,         // survival/censoring times
        events: Vec<usize>,      // 0 = censored, k = failed from cause k
        covariates: Array2<f64>, // patient features matrix
    ) -> Result<Self> {
        let n_samples = times.len();

        if events.len() != n_samples {
            return Err(ExperimentError::invalid_dimensions(
                format!("times len ({}) != events len ({})", n_samples, events.len())
            ));
        }

        if covariates.nrows() != n_samples {
            return Err(ExperimentError::invalid_dimensions(
                format!("covariates rows ({}) != n_samples ({})", covariates.nrows(), n_samples)
            ));
        }

        if times.iter().any(|&t| t < 0.0 || !t.is_finite()) {
            return Err(ExperimentError::invalid_survival_data(
                "survival times must be non-negative & finite"
            ));
        }

        let feature_names = (0..covariates.ncols()).map(|j| format!("x{}", j)).collect();

        Ok(Self {
            times: Array1::from(times),
            events: Array1::from(events),
            covariates,
            feature_names,
        })
    }

    /// give names to the covariate columns
    pub fn with_feature_names(mut self, names: Vec<String>) -> Result<Self> {
        if names.len() != self.n_features() {
            return Err(ExperimentError::invalid_dimensions(
                format!("{} feature names for {} covariates", names.len(), self.n_features())
            ));
        }
        self.feature_names = names;
        Ok(self)
    }

    /// how many patients
    pub fn n_samples(&self) -> usize {
        self.times.len()
    }

    /// how many features per patient
    pub fn n_features(&self) -> usize {
        self.covariates.ncols()
    }

    /// highest cause label present (0 if everyone is censored)
    pub fn n_causes(&self) -> usize {
        self.events.iter().copied().max().unwrap_or(0)
    }

    /// survival/censoring times
    pub fn times(&self) -> ArrayView1<'_, f64> {
        self.times.view()
    }

    /// cause labels, 0 = censored
    pub fn events(&self) -> ArrayView1<'_, usize> {
        self.events.view()
    }

    /// patient feature matrix
    pub fn covariates(&self) -> ArrayView2<'_, f64> {
        self.covariates.view()
    }

    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    /// true where the patient failed from `cause`; competing events count as censored
    pub fn cause_indicator(&self, cause: usize) -> Vec<bool> {
        self.events.iter().map(|&e| e == cause).collect()
    }

    /// unique event times for one cause, in order
    pub fn event_times(&self, cause: usize) -> Vec<f64> {
        let mut times: Vec<f64> = self.times
            .iter()
            .zip(self.events.iter())
            .filter_map(|(&time, &event)| if event == cause { Some(time) } else { None })
            .collect();

        times.sort_by(f64::total_cmp);
        times.dedup();
        times
    }

    /// grab a subset of patients by indices
    pub fn subset(&self, indices: &[usize]) -> Result<Self> {
        if indices.iter().any(|&i| i >= self.n_samples()) {
            return Err(ExperimentError::invalid_dimensions(
                "subset index out of bounds"
            ));
        }

        Ok(Self {
            times: self.times.select(Axis(0), indices),
            events: self.events.select(Axis(0), indices),
            covariates: self.covariates.select(Axis(0), indices),
            feature_names: self.feature_names.clone(),
        })
    }

    /// collapse to a binary problem: label 1 where `e == cause`, 0 otherwise
    pub fn single_cause(&self, cause: usize) -> Self {
        Self {
            times: self.times.clone(),
            events: self.events.mapv(|e| usize::from(e == cause)),
            covariates: self.covariates.clone(),
            feature_names: self.feature_names.clone(),
        }
    }

    /// standardize features (mean=0, std=1) - modifies in place
    ///
    /// constant columns are only centred
    pub fn standardize_covariates(&mut self) -> Result<(Array1<f64>, Array1<f64>)> {
        let means = self.covariates
            .mean_axis(Axis(0))
            .ok_or_else(|| ExperimentError::invalid_dimensions("can't standardize an empty dataset"))?;
        let mut stds = self.covariates.std_axis(Axis(0), 0.0);
        stds.mapv_inplace(|s| if s > 0.0 && s.is_finite() { s } else { 1.0 });

        for mut row in self.covariates.rows_mut() {
            row -= &means;
            row /= &stds;
        }

        Ok((means, stds))
    }
}
