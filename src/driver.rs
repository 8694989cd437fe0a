//! The competing-risks comparison: which grids are searched, for which model
//! family, with which labels, and where the results go.
//!
//! [`experiment_plan`] is pure. [`run`] parses the command line arguments,
//! loads the dataset and hands each planned run to a [`Launcher`].

use std::fmt;
use std::path::{Path, PathBuf};

use crate::config::ExperimentSettings;
use crate::data::CompetingRisksData;
use crate::datasets::{load_dataset, Dataset};
use crate::error::{ExperimentError, Result};
use crate::experiment::ExperimentRunner;
use crate::family::{DeSurv, DeepHit, Dsm, ModelFamily, Nfg, TrainOptions};
use crate::grid::{batch_candidates, layer_shapes, ParamGrid, LAYER_WIDTHS};

const LEARNING_RATES: [f64; 2] = [1e-3, 1e-4];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Dsm,
    Nfg,
    DeSurv,
    DeepHit,
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Family::Dsm => Dsm::NAME,
            Family::Nfg => Nfg::NAME,
            Family::DeSurv => DeSurv::NAME,
            Family::DeepHit => DeepHit::NAME,
        })
    }
}

/// Which labels a run is trained on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventTarget {
    /// every cause label as loaded
    AllCauses,
    /// `e == 1`: cause 1 against everything else ("nc", no competing risks)
    SingleCause,
}

/// One `create(...).train(...)` invocation.
#[derive(Debug, Clone)]
pub struct PlannedRun {
    pub family: Family,
    pub suffix: &'static str,
    pub grid: ParamGrid,
    pub target: EventTarget,
    pub options: TrainOptions,
}

impl PlannedRun {
    /// `<results_dir>/<DATASET>_<suffix>`
    pub fn path(&self, results_dir: &Path, dataset: Dataset) -> PathBuf {
        results_dir.join(format!("{}_{}", dataset, self.suffix))
    }
}

/// The candidate values shared between families for one dataset.
#[derive(Debug, Clone)]
pub struct SearchSpace {
    dataset: Dataset,
    max_epochs: usize,
}

impl SearchSpace {
    pub fn new(dataset: Dataset, max_epochs: usize) -> Self {
        Self { dataset, max_epochs }
    }

    /// 8 shapes: depths 1-4 at each width
    pub fn layers(&self) -> Vec<Vec<usize>> {
        layer_shapes(&LAYER_WIDTHS, 4)
    }

    /// 16 shapes: depths 1-8 at each width
    pub fn layers_large(&self) -> Vec<Vec<usize>> {
        layer_shapes(&LAYER_WIDTHS, 8)
    }

    pub fn batch(&self) -> Vec<usize> {
        batch_candidates(self.dataset)
    }

    fn common(&self) -> Result<ParamGrid> {
        ParamGrid::new()
            .with("epochs", [self.max_epochs])?
            .with("learning_rate", LEARNING_RATES)?
            .with("batch", self.batch())
    }

    pub fn dsm(&self) -> Result<ParamGrid> {
        self.common()?
            .with("k", [2_i64, 3, 4, 5])?
            .with("distribution", ["LogNormal", "Weibull"])?
            .with("layers", self.layers_large())
    }

    pub fn nfg(&self) -> Result<ParamGrid> {
        self.common()?
            .with("dropout", [0.0, 0.25, 0.5, 0.75])?
            .with("layers_surv", self.layers())?
            .with("layers", self.layers())?
            .with("act", ["Tanh"])
    }

    /// NFG with a single shared output head
    pub fn nfg_mono(&self) -> Result<ParamGrid> {
        self.nfg()?.with("multihead", [false])
    }

    pub fn desurv(&self) -> Result<ParamGrid> {
        self.common()?
            .with("embedding", [true])?
            .with("layers_surv", self.layers())?
            .with("layers", self.layers())?
            .with("act", ["Tanh"])
    }

    pub fn deephit(&self) -> Result<ParamGrid> {
        self.common()?
            .with("nodes", self.layers())?
            .with("shared", self.layers())
    }
}

/// The ten runs of one comparison, in launch order.
pub fn experiment_plan(dataset: Dataset, max_epochs: usize) -> Result<Vec<PlannedRun>> {
    let space = SearchSpace::new(dataset, max_epochs);
    let planned = |family: Family, suffix: &'static str, grid: ParamGrid, target: EventTarget, options: TrainOptions| {
        PlannedRun { family, suffix, grid, target, options }
    };
    let all = EventTarget::AllCauses;
    let nc = EventTarget::SingleCause;
    let plain = TrainOptions::default();

    let dsm = space.dsm()?;
    let nfg = space.nfg()?;
    let desurv = space.desurv()?;
    let deephit = space.deephit()?;

    Ok(vec![
        planned(Family::Dsm, "dsm", dsm.clone(), all, plain),
        planned(Family::Dsm, "dsmnc", dsm, nc, plain),
        planned(Family::Nfg, "nfg", nfg.clone(), all, plain),
        planned(Family::Nfg, "nfgnc", nfg.clone(), nc, plain),
        planned(Family::Nfg, "nfgcs", nfg, all, TrainOptions::cause_specific()),
        planned(Family::Nfg, "nfgmono", space.nfg_mono()?, all, plain),
        planned(Family::DeSurv, "ds", desurv.clone(), all, plain),
        planned(Family::DeSurv, "dsnc", desurv, nc, plain),
        planned(Family::DeepHit, "dh", deephit.clone(), all, plain),
        planned(Family::DeepHit, "dhnc", deephit, nc, plain),
    ])
}

/// Executes one planned run.
pub trait Launcher {
    fn launch(&mut self, run: &PlannedRun, path: &Path, fold: Option<usize>, data: &CompetingRisksData) -> Result<()>;
}

/// Creates the family's runner and trains it.
pub struct ExperimentLauncher {
    settings: ExperimentSettings,
}

impl ExperimentLauncher {
    pub fn new(settings: ExperimentSettings) -> Self {
        Self { settings }
    }

    fn launch_family<F: ModelFamily>(
        &self,
        run: &PlannedRun,
        path: &Path,
        fold: Option<usize>,
        data: &CompetingRisksData,
    ) -> Result<()> {
        ExperimentRunner::<F>::create_with(
            &run.grid,
            self.settings.n_iter,
            path,
            self.settings.random_seed,
            fold,
            &self.settings.runner_options(),
        )?
        .train(data, run.options.with_patience(self.settings.patience))?;
        Ok(())
    }
}

impl Launcher for ExperimentLauncher {
    fn launch(&mut self, run: &PlannedRun, path: &Path, fold: Option<usize>, data: &CompetingRisksData) -> Result<()> {
        match run.family {
            Family::Dsm => self.launch_family::<Dsm>(run, path, fold, data),
            Family::Nfg => self.launch_family::<Nfg>(run, path, fold, data),
            Family::DeSurv => self.launch_family::<DeSurv>(run, path, fold, data),
            Family::DeepHit => self.launch_family::<DeepHit>(run, path, fold, data),
        }
    }
}

/// Logs what would run without training anything.
#[derive(Debug, Default)]
pub struct DryRunLauncher;

impl Launcher for DryRunLauncher {
    fn launch(&mut self, run: &PlannedRun, path: &Path, fold: Option<usize>, data: &CompetingRisksData) -> Result<()> {
        log::info!(
            "[dry run] {} -> {} (fold {:?}, {} combinations, {} causes, {:?})",
            run.family,
            path.display(),
            fold,
            run.grid.size()?,
            data.n_causes(),
            run.options
        );
        Ok(())
    }
}

/// Fold argument: a non-negative integer.
pub fn parse_fold(raw: &str) -> Result<usize> {
    raw.trim().parse::<usize>().map_err(|_| ExperimentError::invalid_fold(raw))
}

/// Parse the arguments, load the dataset and launch every planned run in
/// order. Returns the number of launches.
pub fn run<L: Launcher>(
    dataset: &str,
    fold: Option<&str>,
    settings: &ExperimentSettings,
    launcher: &mut L,
) -> Result<usize> {
    let dataset: Dataset = dataset.parse()?;
    let fold = fold.map(parse_fold).transpose()?;

    log::info!("Script running experiments on {}", dataset);
    let plan = experiment_plan(dataset, settings.max_epochs)?;

    let data = load_dataset(dataset, true, &settings.data_dir)?;
    let single_cause = data.single_cause(1);

    for planned in &plan {
        let path = planned.path(&settings.results_dir, dataset);
        let labels = match planned.target {
            EventTarget::AllCauses => &data,
            EventTarget::SingleCause => &single_cause,
        };
        log::info!("{} -> {}", planned.family, path.display());
        launcher.launch(planned, &path, fold, labels)?;
    }

    Ok(plan.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grid_sizes() {
        let space = SearchSpace::new(Dataset::Pbc, 1000);
        assert_eq!(space.dsm().unwrap().size().unwrap(), 512);
        assert_eq!(space.nfg().unwrap().size().unwrap(), 1024);
        assert_eq!(space.nfg_mono().unwrap().size().unwrap(), 1024);
        assert_eq!(space.desurv().unwrap().size().unwrap(), 256);
        assert_eq!(space.deephit().unwrap().size().unwrap(), 256);
    }

    #[test]
    fn test_layers_menu() {
        let space = SearchSpace::new(Dataset::Framingham, 1000);
        assert_eq!(space.layers().len(), 8);
        assert_eq!(space.layers_large().len(), 16);
        assert!(space.layers().iter().all(|shape| (1..=4).contains(&shape.len())));
        assert!(space.layers_large().iter().all(|shape| (1..=8).contains(&shape.len())));
    }

    #[test]
    fn test_seer_batches() {
        let seer = SearchSpace::new(Dataset::Seer, 1000).deephit().unwrap();
        assert_eq!(
            seer.get("batch").unwrap(),
            &[crate::grid::ParamValue::Int(1000), crate::grid::ParamValue::Int(5000)]
        );
    }

    #[test]
    fn test_plan_order_and_variants() {
        let plan = experiment_plan(Dataset::Pbc, 1000).unwrap();
        let suffixes: Vec<&str> = plan.iter().map(|r| r.suffix).collect();
        assert_eq!(
            suffixes,
            vec!["dsm", "dsmnc", "nfg", "nfgnc", "nfgcs", "nfgmono", "ds", "dsnc", "dh", "dhnc"]
        );

        for run in &plan {
            let nc = run.suffix.ends_with("nc");
            assert_eq!(run.target == EventTarget::SingleCause, nc);
            assert_eq!(run.options.cause_specific, run.suffix == "nfgcs");
            assert_eq!(run.grid.get("multihead").is_some(), run.suffix == "nfgmono");
        }

        assert_eq!(
            plan[0].path(Path::new("Results"), Dataset::Pbc),
            PathBuf::from("Results/PBC_dsm")
        );
    }

    #[test]
    fn test_parse_fold() {
        assert_eq!(parse_fold("3").unwrap(), 3);
        assert!(matches!(parse_fold("three"), Err(ExperimentError::InvalidFold { .. })));
        assert!(parse_fold("-1").is_err());
    }
}
