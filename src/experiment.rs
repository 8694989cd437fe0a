//! Grid-search experiment runner.
//!
//! `create` either resumes a checkpoint, short-circuits on a finished run, or
//! samples fresh trials. `train` runs stratified K-fold cross-validation: on
//! each fold the training part is split 80/10/10 into train/dev/val, every
//! trial is fit on train with early stopping on val, and the trial with the
//! lowest dev loss is kept. Progress is checkpointed after every trial so an
//! interrupted run picks up where it stopped.
//!
//! Files, for a run at `path` (with `_<fold>` appended when a fold is given):
//! - `<path>.json`: checkpoint
//! - `<path>.csv`: cumulative incidence predictions; marks the run done

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use ndarray::Array1;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::data::CompetingRisksData;
use crate::error::{ExperimentError, Result};
use crate::family::{DeSurv, DeepHit, Dsm, ModelFamily, Nfg, TrainOptions};
use crate::grid::{ParamGrid, ParameterSampler, Params};
use crate::metrics::{cause_specific_c_index, mean_and_std};
use crate::model::CauseSpecificCox;

pub type DsmExperiment = ExperimentRunner<Dsm>;
pub type NfgExperiment = ExperimentRunner<Nfg>;
pub type DeSurvExperiment = ExperimentRunner<DeSurv>;
pub type DeepHitExperiment = ExperimentRunner<DeepHit>;

/// Share of each fold's training part held out, then halved into dev and val.
const HOLDOUT_FRACTION: f64 = 0.2;

/// Knobs for [`ExperimentRunner::create_with`].
#[derive(Debug, Clone, PartialEq)]
pub struct RunnerOptions {
    pub k_folds: usize,
    /// ignore existing results and checkpoints
    pub force: bool,
    /// time points at which cumulative incidence is written
    pub evaluation_points: usize,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            k_folds: 5,
            force: false,
            evaluation_points: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FoldBest {
    params: Params,
    loss: f64,
    model: CauseSpecificCox,
}

/// Everything needed to resume a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ExperimentState {
    family: String,
    grid: ParamGrid,
    n_iter: usize,
    trials: Vec<Params>,
    k_folds: usize,
    random_seed: u64,
    fold: Option<usize>,
    next_fold: usize,
    next_trial: usize,
    fold_assignment: Vec<Option<usize>>,
    best: BTreeMap<usize, FoldBest>,
}

impl ExperimentState {
    /// a checkpoint only resumes the exact search that wrote it
    fn matches(&self, grid: &ParamGrid, n_iter: usize, k_folds: usize, random_seed: u64, fold: Option<usize>) -> bool {
        self.grid == *grid
            && self.n_iter == n_iter
            && self.k_folds == k_folds
            && self.random_seed == random_seed
            && self.fold == fold
    }
}

pub struct ExperimentRunner<F: ModelFamily> {
    base: PathBuf,
    state: ExperimentState,
    completed: bool,
    evaluation_points: usize,
    _family: PhantomData<F>,
}

impl<F: ModelFamily> ExperimentRunner<F> {
    /// `create` with default [`RunnerOptions`]
    pub fn create(
        grid: &ParamGrid,
        n_iter: usize,
        path: impl AsRef<Path>,
        random_seed: u64,
        fold: Option<usize>,
    ) -> Result<Self> {
        Self::create_with(grid, n_iter, path, random_seed, fold, &RunnerOptions::default())
    }

    pub fn create_with(
        grid: &ParamGrid,
        n_iter: usize,
        path: impl AsRef<Path>,
        random_seed: u64,
        fold: Option<usize>,
        options: &RunnerOptions,
    ) -> Result<Self> {
        if options.k_folds < 2 {
            return Err(ExperimentError::invalid_parameter("k_folds", options.k_folds.to_string()));
        }
        if let Some(f) = fold {
            if f >= options.k_folds {
                return Err(ExperimentError::invalid_fold(f.to_string()));
            }
        }

        let base = match fold {
            Some(f) => append(path.as_ref(), &format!("_{}", f)),
            None => path.as_ref().to_path_buf(),
        };
        let fresh = |trials: Vec<Params>, completed: bool| Self {
            base: base.clone(),
            state: ExperimentState {
                family: F::NAME.to_string(),
                grid: grid.clone(),
                n_iter,
                trials,
                k_folds: options.k_folds,
                random_seed,
                fold,
                next_fold: 0,
                next_trial: 0,
                fold_assignment: Vec::new(),
                best: BTreeMap::new(),
            },
            completed,
            evaluation_points: options.evaluation_points.max(1),
            _family: PhantomData,
        };

        if !options.force {
            let results = append(&base, ".csv");
            if results.is_file() {
                log::info!("{} already exists, skipping {} run", results.display(), F::NAME);
                return Ok(fresh(Vec::new(), true));
            }

            let checkpoint = append(&base, ".json");
            if checkpoint.is_file() {
                match load_state(&checkpoint, F::NAME) {
                    Ok(state) if state.matches(grid, n_iter, options.k_folds, random_seed, fold) => {
                        log::info!(
                            "Loading previous copy of {} (fold {}, trial {})",
                            checkpoint.display(),
                            state.next_fold,
                            state.next_trial
                        );
                        let mut runner = fresh(Vec::new(), false);
                        runner.state = state;
                        return Ok(runner);
                    }
                    Ok(_) => {
                        log::warn!(
                            "Reinitialising {}: checkpoint was made with a different grid, n_iter, k_folds, seed or fold",
                            checkpoint.display()
                        );
                        fs::remove_file(&checkpoint)?;
                    }
                    Err(e) => {
                        log::warn!("Reinitialising {}: unreadable checkpoint ({})", checkpoint.display(), e);
                        fs::remove_file(&checkpoint)?;
                    }
                }
            }
        }

        let trials = ParameterSampler::new(grid.clone(), n_iter, random_seed).sample()?;
        log::debug!("{}: sampled {} trials for {}", F::NAME, trials.len(), base.display());
        Ok(fresh(trials, false))
    }

    /// Cross-validate every trial and write predictions. A no-op when the
    /// run's results already existed at `create` time.
    pub fn train(&mut self, data: &CompetingRisksData, options: TrainOptions) -> Result<&mut Self> {
        if self.completed {
            return Ok(self);
        }

        let k = self.state.k_folds;
        if data.n_samples() < k {
            return Err(ExperimentError::invalid_dimensions(
                format!("{} subjects can't be split into {} folds", data.n_samples(), k)
            ));
        }
        let n_causes = data.n_causes();
        if n_causes == 0 {
            return Err(ExperimentError::invalid_survival_data("every subject is censored"));
        }

        if self.state.fold_assignment.is_empty() {
            self.state.fold_assignment = vec![None; data.n_samples()];
        } else if self.state.fold_assignment.len() != data.n_samples() {
            return Err(ExperimentError::invalid_dimensions(format!(
                "checkpoint covers {} subjects, data has {}",
                self.state.fold_assignment.len(),
                data.n_samples()
            )));
        }

        let mut data = data.clone();
        data.standardize_covariates()?;

        let seed = self.state.random_seed;
        let events = data.events().to_vec();
        let folds = stratified_k_fold(&events, k, seed);

        log::info!(
            "{}: {} trials x {} folds -> {}",
            F::NAME,
            self.state.trials.len(),
            if self.state.fold.is_some() { 1 } else { k },
            self.base.display()
        );

        for (i, test_idx) in folds.iter().enumerate() {
            for &j in test_idx {
                self.state.fold_assignment[j] = Some(i);
            }
            if i < self.state.next_fold || self.state.fold.is_some_and(|f| f != i) {
                continue;
            }

            let mut in_test = vec![false; data.n_samples()];
            for &j in test_idx {
                in_test[j] = true;
            }
            let train_idx: Vec<usize> = (0..data.n_samples()).filter(|&j| !in_test[j]).collect();
            let (train_idx, holdout_idx) = stratified_split(&train_idx, &events, HOLDOUT_FRACTION, seed);
            let (dev_idx, val_idx) = stratified_split(&holdout_idx, &events, 0.5, seed);

            let train = data.subset(&train_idx)?;
            let dev = data.subset(&dev_idx)?;
            let val = data.subset(&val_idx)?;
            log::debug!(
                "fold {}: train {}, dev {}, val {}, test {}",
                i,
                train.n_samples(),
                dev.n_samples(),
                val.n_samples(),
                test_idx.len()
            );

            for trial in self.state.next_trial..self.state.trials.len() {
                let params = self.state.trials[trial].clone();
                let model = F::fit(&params, &train, &val, n_causes, options, seed)?;
                let loss = model.loss(&dev)?;
                log::debug!("fold {} trial {} {}: dev loss {:.6}", i, trial, params, loss);

                let improves = self.state.best.get(&i).map_or(true, |best| loss < best.loss);
                if loss.is_finite() && improves {
                    self.state.best.insert(i, FoldBest { params, loss, model });
                }

                self.state.next_trial = trial + 1;
                self.save()?;
            }

            self.log_fold(i, &data, test_idx, n_causes);

            self.state.next_fold = i + 1;
            self.state.next_trial = 0;
            self.save()?;
        }

        self.write_predictions(&data, n_causes)?;
        self.completed = true;
        Ok(self)
    }

    fn log_fold(&self, fold: usize, data: &CompetingRisksData, test_idx: &[usize], n_causes: usize) {
        let Some(best) = self.state.best.get(&fold) else {
            log::warn!("{} fold {}: no trial produced a finite dev loss", F::NAME, fold);
            return;
        };
        let Ok(test) = data.subset(test_idx) else {
            return;
        };

        let c_indices: Vec<f64> = (1..=n_causes)
            .map(|cause| {
                best.model
                    .predict_risk(test.covariates(), cause)
                    .and_then(|risk| cause_specific_c_index(risk.view(), test.times(), test.events(), cause))
                    .unwrap_or(f64::NAN)
            })
            .collect();

        let rendered: Vec<String> = c_indices
            .iter()
            .enumerate()
            .map(|(c, v)| format!("cause {}: {:.4}", c + 1, v))
            .collect();
        log::info!(
            "{} fold {}: best {} (dev loss {:.6}), test C-index {}",
            F::NAME,
            fold,
            best.params,
            best.loss,
            rendered.join(", ")
        );
        if let Some((mean, std)) = mean_and_std(&c_indices) {
            log::debug!("{} fold {}: mean C-index {:.4} +/- {:.4}", F::NAME, fold, mean, std);
        }
    }

    /// one row per subject in a trained fold, cumulative incidence per cause and time
    fn write_predictions(&self, data: &CompetingRisksData, n_causes: usize) -> Result<()> {
        let times = evaluation_times(data, self.evaluation_points);
        let path = self.results_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut writer = csv::Writer::from_path(&path)?;
        let mut header = vec!["index".to_string(), "fold".to_string(), "time".to_string(), "event".to_string()];
        for cause in 1..=n_causes {
            header.extend(times.iter().map(|t| format!("{}_{:.4}", cause, t)));
        }
        writer.write_record(&header)?;

        let mut rows = 0;
        for (&fold, best) in &self.state.best {
            let members: Vec<usize> = self
                .state
                .fold_assignment
                .iter()
                .enumerate()
                .filter_map(|(j, f)| (*f == Some(fold)).then_some(j))
                .collect();
            let subset = data.subset(&members)?;
            let cifs = best.model.predict_cif(subset.covariates(), times.view())?;

            for (row, &j) in members.iter().enumerate() {
                let mut record = vec![
                    j.to_string(),
                    fold.to_string(),
                    data.times()[j].to_string(),
                    data.events()[j].to_string(),
                ];
                for cif in &cifs {
                    record.extend(cif.row(row).iter().map(|v| v.to_string()));
                }
                writer.write_record(&record)?;
                rows += 1;
            }
        }
        writer.flush()?;

        log::info!("{}: wrote {} predictions to {}", F::NAME, rows, path.display());
        Ok(())
    }

    fn save(&self) -> Result<()> {
        let path = self.checkpoint_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = append(&path, ".tmp");
        let mut writer = BufWriter::new(File::create(&tmp)?);
        serde_json::to_writer(&mut writer, &self.state)?;
        writer.flush()?;
        drop(writer);
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// `<path>[_<fold>].csv`
    pub fn results_path(&self) -> PathBuf {
        append(&self.base, ".csv")
    }

    /// `<path>[_<fold>].json`
    pub fn checkpoint_path(&self) -> PathBuf {
        append(&self.base, ".json")
    }

    /// true when results were already on disk or `train` finished
    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub fn trials(&self) -> &[Params] {
        &self.state.trials
    }

    pub fn best_params(&self, fold: usize) -> Option<&Params> {
        self.state.best.get(&fold).map(|b| &b.params)
    }

    pub fn best_loss(&self, fold: usize) -> Option<f64> {
        self.state.best.get(&fold).map(|b| b.loss)
    }

    pub fn best_model(&self, fold: usize) -> Option<&CauseSpecificCox> {
        self.state.best.get(&fold).map(|b| &b.model)
    }
}

fn load_state(path: &Path, family: &str) -> Result<ExperimentState> {
    let state: ExperimentState = serde_json::from_reader(BufReader::new(File::open(path)?))?;
    if state.family != family {
        return Err(ExperimentError::invalid_parameter("family", state.family));
    }
    Ok(state)
}

fn append(path: &Path, suffix: &str) -> PathBuf {
    let mut s: OsString = path.as_os_str().to_owned();
    s.push(suffix);
    PathBuf::from(s)
}

/// evenly spaced between the first and last observed event
fn evaluation_times(data: &CompetingRisksData, points: usize) -> Array1<f64> {
    let event_times: Vec<f64> = data
        .times()
        .iter()
        .zip(data.events().iter())
        .filter_map(|(&t, &e)| (e > 0).then_some(t))
        .collect();
    let min = event_times.iter().copied().fold(f64::INFINITY, f64::min);
    let max = event_times.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    if points == 1 || min == max {
        return Array1::from(vec![max]);
    }
    Array1::linspace(min, max, points)
}

/// Test indices per fold. Subjects are grouped by label, shuffled, and dealt
/// round-robin so every fold sees the same mix of causes.
pub fn stratified_k_fold(labels: &[usize], k: usize, seed: u64) -> Vec<Vec<usize>> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut folds: Vec<Vec<usize>> = vec![Vec::new(); k];

    let mut dealt = 0;
    for mut members in group_by_label(labels, (0..labels.len()).collect()).into_values() {
        members.shuffle(&mut rng);
        for idx in members {
            folds[dealt % k].push(idx);
            dealt += 1;
        }
    }

    for fold in &mut folds {
        fold.sort_unstable();
    }
    folds
}

/// Split `indices` into (kept, held out), holding out `fraction` of every label.
pub fn stratified_split(indices: &[usize], labels: &[usize], fraction: f64, seed: u64) -> (Vec<usize>, Vec<usize>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut kept = Vec::new();
    let mut held = Vec::new();

    for mut members in group_by_label(labels, indices.to_vec()).into_values() {
        members.shuffle(&mut rng);
        let n_held = (members.len() as f64 * fraction).round() as usize;
        held.extend_from_slice(&members[..n_held]);
        kept.extend_from_slice(&members[n_held..]);
    }

    kept.sort_unstable();
    held.sort_unstable();
    (kept, held)
}

fn group_by_label(labels: &[usize], indices: Vec<usize>) -> BTreeMap<usize, Vec<usize>> {
    let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for idx in indices {
        groups.entry(labels[idx]).or_default().push(idx);
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasets::generate_synthetic_competing;
    use crate::grid::layer_shapes;

    fn tiny_grid() -> ParamGrid {
        ParamGrid::new()
            .with("epochs", [3_i64])
            .unwrap()
            .with("learning_rate", [1e-2, 1e-3])
            .unwrap()
            .with("batch", [50_usize])
            .unwrap()
            .with("nodes", layer_shapes(&[25], 2))
            .unwrap()
            .with("shared", [vec![25_usize]])
            .unwrap()
    }

    #[test]
    fn test_stratified_k_fold_partitions() {
        let labels: Vec<usize> = (0..50).map(|i| i % 3).collect();
        let folds = stratified_k_fold(&labels, 5, 0);

        assert_eq!(folds.len(), 5);
        let mut all: Vec<usize> = folds.iter().flatten().copied().collect();
        all.sort_unstable();
        assert_eq!(all, (0..50).collect::<Vec<_>>());

        for fold in &folds {
            assert_eq!(fold.len(), 10);
            let cause_two = fold.iter().filter(|&&j| labels[j] == 2).count();
            assert!((3..=4).contains(&cause_two));
        }

        assert_eq!(folds, stratified_k_fold(&labels, 5, 0));
    }

    #[test]
    fn test_stratified_split_fraction() {
        let labels: Vec<usize> = (0..100).map(|i| usize::from(i % 4 == 0)).collect();
        let indices: Vec<usize> = (0..100).collect();
        let (kept, held) = stratified_split(&indices, &labels, 0.2, 1);

        assert_eq!(kept.len() + held.len(), 100);
        assert_eq!(held.len(), 20);
        assert_eq!(held.iter().filter(|&&j| labels[j] == 1).count(), 5);
    }

    #[test]
    fn test_append_suffix() {
        assert_eq!(append(Path::new("Results/PBC_dsm"), "_2"), PathBuf::from("Results/PBC_dsm_2"));
    }

    #[test]
    fn test_create_samples_bounded_trials() {
        let dir = tempfile::tempdir().unwrap();
        let runner = DeepHitExperiment::create(&tiny_grid(), 3, dir.path().join("x_dh"), 0, None).unwrap();
        assert_eq!(runner.trials().len(), 3);
        assert!(!runner.is_completed());

        let all = DeepHitExperiment::create(&tiny_grid(), 100, dir.path().join("x_dh"), 0, None).unwrap();
        assert_eq!(all.trials().len(), 4);
    }

    #[test]
    fn test_fold_out_of_range() {
        let dir = tempfile::tempdir().unwrap();
        let result = DeepHitExperiment::create(&tiny_grid(), 3, dir.path().join("x"), 0, Some(5));
        assert!(matches!(result, Err(ExperimentError::InvalidFold { .. })));
    }

    #[test]
    fn test_train_single_fold_writes_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let data = generate_synthetic_competing(200, 5).unwrap();
        let options = RunnerOptions { evaluation_points: 4, ..RunnerOptions::default() };

        let mut runner = DeepHitExperiment::create_with(&tiny_grid(), 2, dir.path().join("SYN_dh"), 0, Some(1), &options).unwrap();
        runner.train(&data, TrainOptions::default()).unwrap();

        assert!(runner.is_completed());
        assert!(runner.best_params(1).is_some());
        assert!(runner.best_params(0).is_none());
        assert!(dir.path().join("SYN_dh_1.csv").is_file());
        assert!(dir.path().join("SYN_dh_1.json").is_file());

        let mut reader = csv::Reader::from_path(dir.path().join("SYN_dh_1.csv")).unwrap();
        // index, fold, time, event + 2 causes x 4 times
        assert_eq!(reader.headers().unwrap().len(), 12);
        assert_eq!(reader.records().count(), 40);
    }

    #[test]
    fn test_resume_from_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let data = generate_synthetic_competing(100, 6).unwrap();
        let path = dir.path().join("SYN_dh");

        let mut runner = DeepHitExperiment::create(&tiny_grid(), 2, &path, 0, Some(0)).unwrap();
        runner.train(&data, TrainOptions::default()).unwrap();
        let loss = runner.best_loss(0).unwrap();

        // results gone, checkpoint kept: resumed state has the finished fold
        fs::remove_file(runner.results_path()).unwrap();
        let resumed = DeepHitExperiment::create(&tiny_grid(), 2, &path, 0, Some(0)).unwrap();
        assert_eq!(resumed.best_loss(0), Some(loss));

        // a checkpoint from another family is discarded
        let other = NfgExperiment::create(&tiny_grid(), 2, &path, 0, Some(0)).unwrap();
        assert!(other.best_loss(0).is_none());
        assert!(!dir.path().join("SYN_dh_0.json").exists());
    }

    #[test]
    fn test_checkpoint_from_other_settings_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let data = generate_synthetic_competing(100, 8).unwrap();
        let path = dir.path().join("SYN_dh");

        let mut runner = DeepHitExperiment::create(&tiny_grid(), 2, &path, 0, Some(0)).unwrap();
        runner.train(&data, TrainOptions::default()).unwrap();
        fs::remove_file(runner.results_path()).unwrap();

        let more_trials = DeepHitExperiment::create(&tiny_grid(), 4, &path, 0, Some(0)).unwrap();
        assert_eq!(more_trials.trials().len(), 4);
        assert!(more_trials.best_loss(0).is_none());
        assert!(!dir.path().join("SYN_dh_0.json").exists());

        let mut runner = DeepHitExperiment::create(&tiny_grid(), 2, &path, 0, Some(0)).unwrap();
        runner.train(&data, TrainOptions::default()).unwrap();
        fs::remove_file(runner.results_path()).unwrap();

        let longer = tiny_grid().with("epochs", [5_i64]).unwrap();
        let other_grid = DeepHitExperiment::create(&longer, 2, &path, 0, Some(0)).unwrap();
        assert!(other_grid.best_loss(0).is_none());

        let options = RunnerOptions { k_folds: 3, ..RunnerOptions::default() };
        let mut runner = DeepHitExperiment::create(&tiny_grid(), 2, &path, 0, Some(0)).unwrap();
        runner.train(&data, TrainOptions::default()).unwrap();
        fs::remove_file(runner.results_path()).unwrap();
        let other_folds = DeepHitExperiment::create_with(&tiny_grid(), 2, &path, 0, Some(0), &options).unwrap();
        assert!(other_folds.best_loss(0).is_none());
    }

    #[test]
    fn test_corrupt_checkpoint_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("SYN_dh.json"), "{not json").unwrap();

        let runner = DeepHitExperiment::create(&tiny_grid(), 2, dir.path().join("SYN_dh"), 0, None).unwrap();
        assert_eq!(runner.trials().len(), 2);
        assert!(!dir.path().join("SYN_dh.json").exists());
    }

    #[test]
    fn test_existing_results_skip_training() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("SYN_dh.csv"), "done\n").unwrap();

        let mut runner = DeepHitExperiment::create(&tiny_grid(), 2, dir.path().join("SYN_dh"), 0, None).unwrap();
        assert!(runner.is_completed());

        // empty data would fail if training actually ran
        let empty = CompetingRisksData::new(vec![], vec![], ndarray::Array2::zeros((0, 1))).unwrap();
        assert!(runner.train(&empty, TrainOptions::default()).is_ok());
        assert_eq!(fs::read_to_string(dir.path().join("SYN_dh.csv")).unwrap(), "done\n");
    }

    #[test]
    fn test_all_censored_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let data = generate_synthetic_competing(50, 1).unwrap().single_cause(7);

        let mut runner = DeepHitExperiment::create(&tiny_grid(), 1, dir.path().join("x"), 0, None).unwrap();
        assert!(runner.train(&data, TrainOptions::default()).is_err());
    }
}
