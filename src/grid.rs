//! Hyperparameter grids and the seeded sampler that draws trials from them.

use std::collections::BTreeMap;
use std::fmt;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::datasets::Dataset;
use crate::error::{ExperimentError, Result};

/// Widths tried for every hidden layer shape.
pub const LAYER_WIDTHS: [usize; 2] = [25, 50];

/// A single candidate value for a grid option.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    Layers(Vec<usize>),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Int(v) => write!(f, "{}", v),
            ParamValue::Float(v) => write!(f, "{}", v),
            ParamValue::Bool(v) => write!(f, "{}", v),
            ParamValue::Str(v) => write!(f, "{}", v),
            ParamValue::Layers(v) => write!(f, "{:?}", v),
        }
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        ParamValue::Int(value)
    }
}

impl From<usize> for ParamValue {
    fn from(value: usize) -> Self {
        ParamValue::Int(value as i64)
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        ParamValue::Float(value)
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        ParamValue::Bool(value)
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::Str(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        ParamValue::Str(value)
    }
}

impl From<Vec<usize>> for ParamValue {
    fn from(value: Vec<usize>) -> Self {
        ParamValue::Layers(value)
    }
}

/// Option name -> ordered, non-empty list of candidates. Keys stay sorted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParamGrid {
    options: BTreeMap<String, Vec<ParamValue>>,
}

impl ParamGrid {
    pub fn new() -> Self {
        Self::default()
    }

    /// builder form of [`ParamGrid::insert`]
    pub fn with<V, I>(mut self, option: &str, values: I) -> Result<Self>
    where
        V: Into<ParamValue>,
        I: IntoIterator<Item = V>,
    {
        self.insert(option, values)?;
        Ok(self)
    }

    /// set (or replace) the candidates for one option
    pub fn insert<V, I>(&mut self, option: &str, values: I) -> Result<()>
    where
        V: Into<ParamValue>,
        I: IntoIterator<Item = V>,
    {
        let values: Vec<ParamValue> = values.into_iter().map(Into::into).collect();
        if values.is_empty() {
            return Err(ExperimentError::empty_grid(option));
        }
        self.options.insert(option.to_string(), values);
        Ok(())
    }

    pub fn get(&self, option: &str) -> Option<&[ParamValue]> {
        self.options.get(option).map(Vec::as_slice)
    }

    /// number of options
    pub fn len(&self) -> usize {
        self.options.len()
    }

    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }

    /// number of combinations in the Cartesian product
    pub fn size(&self) -> Result<usize> {
        self.options.iter().try_fold(1usize, |acc, (option, values)| {
            acc.checked_mul(values.len())
                .ok_or_else(|| ExperimentError::invalid_parameter(option.as_str(), "grid too large"))
        })
    }

    pub fn options(&self) -> impl Iterator<Item = (&str, &[ParamValue])> {
        self.options.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// combination number `index`, last option varying fastest
    pub fn combination(&self, index: usize) -> Result<Params> {
        let size = self.size()?;
        if index >= size {
            return Err(ExperimentError::invalid_parameter(
                "combination",
                format!("{} >= grid size {}", index, size),
            ));
        }

        let mut remainder = index;
        let mut params = BTreeMap::new();
        for (option, values) in self.options.iter().rev() {
            let offset = remainder % values.len();
            remainder /= values.len();
            params.insert(option.clone(), values[offset].clone());
        }
        Ok(Params(params))
    }
}

/// One sampled combination: option name -> chosen value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Params(BTreeMap<String, ParamValue>);

impl Params {
    pub fn get(&self, option: &str) -> Option<&ParamValue> {
        self.0.get(option)
    }

    pub fn contains(&self, option: &str) -> bool {
        self.0.contains_key(option)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    fn require(&self, option: &str) -> Result<&ParamValue> {
        self.0
            .get(option)
            .ok_or_else(|| ExperimentError::invalid_parameter(option, "missing"))
    }

    pub fn float(&self, option: &str) -> Result<f64> {
        match self.require(option)? {
            ParamValue::Float(v) => Ok(*v),
            ParamValue::Int(v) => Ok(*v as f64),
            other => Err(ExperimentError::invalid_parameter(option, other.to_string())),
        }
    }

    pub fn usize(&self, option: &str) -> Result<usize> {
        match self.require(option)? {
            ParamValue::Int(v) if *v >= 0 => Ok(*v as usize),
            other => Err(ExperimentError::invalid_parameter(option, other.to_string())),
        }
    }

    pub fn bool(&self, option: &str) -> Result<bool> {
        match self.require(option)? {
            ParamValue::Bool(v) => Ok(*v),
            other => Err(ExperimentError::invalid_parameter(option, other.to_string())),
        }
    }

    pub fn string(&self, option: &str) -> Result<&str> {
        match self.require(option)? {
            ParamValue::Str(v) => Ok(v.as_str()),
            other => Err(ExperimentError::invalid_parameter(option, other.to_string())),
        }
    }

    pub fn layers(&self, option: &str) -> Result<&[usize]> {
        match self.require(option)? {
            ParamValue::Layers(v) => Ok(v.as_slice()),
            other => Err(ExperimentError::invalid_parameter(option, other.to_string())),
        }
    }
}

impl fmt::Display for Params {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self.0.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        write!(f, "{{{}}}", rendered.join(", "))
    }
}

/// Draws up to `n_iter` distinct combinations from a grid, uniformly and
/// without replacement. Same grid + same seed = same trials, same order.
#[derive(Debug, Clone)]
pub struct ParameterSampler {
    grid: ParamGrid,
    n_iter: usize,
    seed: u64,
}

impl ParameterSampler {
    pub fn new(grid: ParamGrid, n_iter: usize, seed: u64) -> Self {
        Self { grid, n_iter, seed }
    }

    pub fn sample(&self) -> Result<Vec<Params>> {
        let size = self.grid.size()?;
        let amount = self.n_iter.min(size);
        if amount < self.n_iter {
            log::debug!(
                "grid has only {} combinations, sampling all of them instead of {}",
                size,
                self.n_iter
            );
        }

        let mut rng = StdRng::seed_from_u64(self.seed);
        rand::seq::index::sample(&mut rng, size, amount)
            .into_iter()
            .map(|index| self.grid.combination(index))
            .collect()
    }
}

/// `[[w] * (d + 1) for w in widths for d in 0..max_depth]`
pub fn layer_shapes(widths: &[usize], max_depth: usize) -> Vec<Vec<usize>> {
    widths
        .iter()
        .flat_map(|&width| (1..=max_depth).map(move |depth| vec![width; depth]))
        .collect()
}

/// batch sizes scale with the dataset: SEER is orders of magnitude bigger
pub fn batch_candidates(dataset: Dataset) -> Vec<usize> {
    match dataset {
        Dataset::Seer => vec![1000, 5000],
        _ => vec![100, 250],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn small_grid() -> ParamGrid {
        ParamGrid::new()
            .with("learning_rate", [1e-3, 1e-4])
            .unwrap()
            .with("batch", [100_usize, 250])
            .unwrap()
            .with("act", ["Tanh"])
            .unwrap()
    }

    #[test]
    fn test_layer_shapes() {
        let layers = layer_shapes(&LAYER_WIDTHS, 4);
        assert_eq!(layers.len(), 8);
        assert_eq!(layers[0], vec![25]);
        assert_eq!(layers[3], vec![25, 25, 25, 25]);
        assert_eq!(layers[4], vec![50]);
        assert_eq!(layers[7], vec![50; 4]);

        let layers_large = layer_shapes(&LAYER_WIDTHS, 8);
        assert_eq!(layers_large.len(), 16);
        assert_eq!(layers_large[7], vec![25; 8]);
        assert_eq!(layers_large[15], vec![50; 8]);
    }

    #[test]
    fn test_batch_candidates() {
        assert_eq!(batch_candidates(Dataset::Framingham), vec![100, 250]);
        assert_eq!(batch_candidates(Dataset::SyntheticCompeting), vec![100, 250]);
        assert_eq!(batch_candidates(Dataset::Pbc), vec![100, 250]);
        assert_eq!(batch_candidates(Dataset::Seer), vec![1000, 5000]);
    }

    #[test]
    fn test_empty_candidates_rejected() {
        let empty: Vec<f64> = Vec::new();
        let err = ParamGrid::new().with("dropout", empty).unwrap_err();
        assert!(matches!(err, ExperimentError::EmptyGrid { ref option } if option == "dropout"));
    }

    #[test]
    fn test_grid_size_and_combination() {
        let grid = small_grid();
        assert_eq!(grid.len(), 3);
        assert_eq!(grid.size().unwrap(), 4);

        // keys sorted: act, batch, learning_rate; learning_rate varies fastest
        let first = grid.combination(0).unwrap();
        assert_eq!(first.float("learning_rate").unwrap(), 1e-3);
        assert_eq!(first.usize("batch").unwrap(), 100);

        let second = grid.combination(1).unwrap();
        assert_eq!(second.float("learning_rate").unwrap(), 1e-4);
        assert_eq!(second.usize("batch").unwrap(), 100);

        let third = grid.combination(2).unwrap();
        assert_eq!(third.usize("batch").unwrap(), 250);

        assert!(grid.combination(4).is_err());
    }

    #[test]
    fn test_sampler_is_bounded_and_distinct() {
        let grid = ParamGrid::new()
            .with("layers", layer_shapes(&LAYER_WIDTHS, 8))
            .unwrap()
            .with("k", [2_i64, 3, 4, 5])
            .unwrap()
            .with("learning_rate", [1e-3, 1e-4])
            .unwrap();

        let trials = ParameterSampler::new(grid.clone(), 20, 0).sample().unwrap();
        assert_eq!(trials.len(), 20);

        let rendered: HashSet<String> = trials.iter().map(|p| p.to_string()).collect();
        assert_eq!(rendered.len(), 20);

        // n_iter larger than the grid takes every combination once
        let all = ParameterSampler::new(grid, 1000, 0).sample().unwrap();
        assert_eq!(all.len(), 128);
    }

    #[test]
    fn test_sampler_is_deterministic() {
        let a = ParameterSampler::new(small_grid(), 3, 7).sample().unwrap();
        let b = ParameterSampler::new(small_grid(), 3, 7).sample().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_typed_getters() {
        let params = ParamGrid::new()
            .with("layers", [vec![25_usize, 25]])
            .unwrap()
            .with("multihead", [false])
            .unwrap()
            .with("distribution", ["Weibull"])
            .unwrap()
            .with("epochs", [1000_i64])
            .unwrap()
            .combination(0)
            .unwrap();

        assert_eq!(params.layers("layers").unwrap(), &[25, 25]);
        assert!(!params.bool("multihead").unwrap());
        assert_eq!(params.string("distribution").unwrap(), "Weibull");
        assert_eq!(params.usize("epochs").unwrap(), 1000);
        assert_eq!(params.float("epochs").unwrap(), 1000.0);

        assert!(params.float("distribution").is_err());
        assert!(params.usize("missing").is_err());
    }
}
