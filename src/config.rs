//! Experiment configuration.
//!
//! Every field has a default, so a configuration file only lists what it changes:
//!
//! ```toml
//! [generator]
//! ceiling = 100
//!
//! [search]
//! study_name = "small-sets"
//! n_trials = 20
//! ```

use std::{fs, io, path::Path, path::PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    dataset::GeneratorConfig,
    train::{SearchSpace, TrainConfig},
};

/// Errors raised while loading a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("cannot read {path}: {source}")]
    Io {
        /// The file.
        path: PathBuf,
        /// The underlying error.
        source: io::Error,
    },
    /// The file is not a valid configuration.
    #[error("invalid configuration in {path}: {source}")]
    Parse {
        /// The file.
        path: PathBuf,
        /// The underlying error.
        source: toml::de::Error,
    },
}

/// The whole experiment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Shape of the generated sets.
    pub generator: GeneratorConfig,
    /// Dataset sizes and batch capacities.
    pub batch: BatchConfig,
    /// Settings shared by every training run.
    pub train: TrainConfig,
    /// The hyperparameter search.
    pub search: SearchConfig,
}

impl Config {
    /// Read a configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Dataset sizes and batch capacities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BatchConfig {
    /// Number of training sets.
    pub train_sets: usize,
    /// Number of test sets.
    pub test_sets: usize,
    /// Seed of the training sets.
    pub train_seed: u64,
    /// Seed of the test sets.
    pub test_seed: u64,
    /// Element slots of the training batch, sized to the data when absent.
    pub max_elements: Option<usize>,
    /// Target slots of the training batch.
    pub max_sets: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            train_sets: 100,
            test_sets: 100,
            train_seed: 1,
            test_seed: 2,
            max_elements: None,
            max_sets: 100,
        }
    }
}

/// Which sampler proposes parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SamplerKind {
    /// Tree-structured Parzen estimator.
    #[default]
    Tpe,
    /// Uniform random draws.
    Random,
}

/// The hyperparameter search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SearchConfig {
    /// Name under which trials are stored; reusing it resumes the study.
    pub study_name: String,
    /// The SQLite database holding the trials.
    pub storage: PathBuf,
    /// Number of trials to run.
    pub n_trials: usize,
    /// The sampler.
    pub sampler: SamplerKind,
    /// Seed of the sampler.
    pub sampler_seed: u64,
    /// Trials completed before pruning starts.
    pub pruner_startup_trials: usize,
    /// Epochs before pruning starts within a trial.
    pub pruner_warmup_steps: usize,
    /// The ranges hyperparameters are drawn from.
    pub space: SearchSpace,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            study_name: "deep-set".to_string(),
            storage: PathBuf::from("db.sqlite3"),
            n_trials: 100,
            sampler: SamplerKind::Tpe,
            sampler_seed: 0,
            pruner_startup_trials: 5,
            pruner_warmup_steps: 0,
            space: SearchSpace::default(),
        }
    }
}
