//! Hyperparameter search with durable trials and pruning.
//!
//! A [`Study`] proposes parameters through a [`Sampler`], runs an objective once per proposal,
//! and records every trial in a [`SqliteStorage`] so a study can be resumed by name. While a
//! trial runs it reports intermediate values, and a [`Pruner`] compares them with the other
//! trials at the same step to stop hopeless trials early.
//!
//! The training loop only sees the [`TrialContext`] trait, so any controller able to suggest
//! parameters and decide on pruning can drive it.

use std::{collections::BTreeMap, fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::tensor::TensorError;

pub mod pruner;
pub mod sampler;
pub mod storage;
pub mod study;

pub use pruner::{MedianPruner, NopPruner, Pruner};
pub use sampler::{RandomSampler, Sampler, TpeSampler};
pub use storage::{SqliteStorage, StorageError};
pub use study::{Study, Trial};

/// Errors raised by the search controller.
#[derive(Debug, Error)]
pub enum SearchError {
    /// Reading or writing the trial storage failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// A parameter was requested with an empty or inverted range.
    #[error("invalid distribution for parameter {name}: {reason}")]
    InvalidDistribution {
        /// The parameter name.
        name: String,
        /// Why the distribution is invalid.
        reason: String,
    },
    /// A parameter was requested twice with different distributions in the same trial.
    #[error("parameter {0} was already suggested with another distribution")]
    IncompatibleDistribution(String),
    /// A categorical value could not be converted.
    #[error("cannot encode categorical choice: {0}")]
    Encoding(#[from] serde_json::Error),
    /// The objective failed with an error that is not a trial outcome.
    #[error("trial {number} failed")]
    Objective {
        /// The number of the failed trial.
        number: usize,
        /// The error returned by the objective.
        #[source]
        source: Box<TrialError>,
    },
}

/// Ways a trial can end other than by returning its value.
#[derive(Debug, Error)]
pub enum TrialError {
    /// The controller decided to abandon the trial.
    #[error("trial was pruned at step {step}")]
    Pruned {
        /// The last reported step.
        step: usize,
    },
    /// The loss became NaN.
    #[error("loss diverged at step {step}")]
    Diverged {
        /// The step at which the loss became NaN.
        step: usize,
    },
    /// The controller failed.
    #[error(transparent)]
    Search(#[from] SearchError),
    /// A numerical operation failed.
    #[error(transparent)]
    Tensor(#[from] TensorError),
}

/// The interface a training loop uses to talk to the search controller.
pub trait TrialContext {
    /// Pick one of `choices`.
    fn suggest_categorical<T>(&mut self, name: &str, choices: &[T]) -> Result<T, SearchError>
    where
        T: Serialize + Clone;

    /// Pick an integer in `low..=high`.
    fn suggest_int(&mut self, name: &str, low: i64, high: i64) -> Result<i64, SearchError>;

    /// Pick a float in `[low, high]`, uniformly in log space when `log` is set.
    fn suggest_float(
        &mut self,
        name: &str,
        low: f64,
        high: f64,
        log: bool,
    ) -> Result<f64, SearchError>;

    /// Record the objective value reached at `step`.
    fn report(&mut self, value: f64, step: usize) -> Result<(), SearchError>;

    /// Whether the trial should be abandoned given the values reported so far.
    fn should_prune(&self) -> bool;
}

/// The space a parameter is drawn from.
///
/// Values are stored in an internal representation: the index of the choice for
/// categorical parameters, the value itself otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Distribution {
    /// One of a finite list of choices.
    Categorical {
        /// The choices, as JSON values.
        choices: Vec<serde_json::Value>,
    },
    /// An integer in `low..=high`.
    Int {
        /// Smallest value.
        low: i64,
        /// Largest value.
        high: i64,
    },
    /// A float in `[low, high]`.
    Float {
        /// Smallest value.
        low: f64,
        /// Largest value.
        high: f64,
        /// Whether values are sampled uniformly in log space.
        log: bool,
    },
}

impl Distribution {
    /// Check that the distribution can be sampled.
    pub fn validate(&self, name: &str) -> Result<(), SearchError> {
        let reason = match self {
            Self::Categorical { choices } if choices.is_empty() => "no choice",
            Self::Int { low, high } if low > high => "low is greater than high",
            Self::Float { low, high, .. } if !(low <= high) => "low is greater than high",
            Self::Float { low, log: true, .. } if *low <= 0.0 => "log scale needs positive bounds",
            _ => return Ok(()),
        };
        Err(SearchError::InvalidDistribution {
            name: name.to_string(),
            reason: reason.to_string(),
        })
    }

    /// Whether an internal value can have been drawn from this distribution.
    pub fn contains(&self, value: f64) -> bool {
        match self {
            Self::Categorical { choices } => {
                value.fract() == 0.0 && value >= 0.0 && (value as usize) < choices.len()
            }
            Self::Int { low, high } => {
                value.fract() == 0.0 && value >= *low as f64 && value <= *high as f64
            }
            Self::Float { low, high, .. } => value >= *low && value <= *high,
        }
    }
}

/// The state of a trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrialState {
    /// The objective is still running, or the process died while it was.
    Running,
    /// The objective returned a value.
    Complete,
    /// The trial was abandoned by the pruner.
    Pruned,
    /// The objective failed or diverged.
    Fail,
}

impl TrialState {
    /// The name used in storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Complete => "COMPLETE",
            Self::Pruned => "PRUNED",
            Self::Fail => "FAIL",
        }
    }

    /// Whether the trial has ended.
    pub fn is_finished(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Display for TrialState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrialState {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RUNNING" => Ok(Self::Running),
            "COMPLETE" => Ok(Self::Complete),
            "PRUNED" => Ok(Self::Pruned),
            "FAIL" => Ok(Self::Fail),
            other => Err(StorageError::UnknownState(other.to_string())),
        }
    }
}

/// A snapshot of a trial as recorded in storage.
#[derive(Debug, Clone, PartialEq)]
pub struct FrozenTrial {
    /// The storage identifier.
    pub id: i64,
    /// The position of the trial within its study, starting at 0.
    pub number: usize,
    /// The state of the trial.
    pub state: TrialState,
    /// The final value, if any.
    pub value: Option<f64>,
    /// Parameter values in their internal representation.
    pub params: BTreeMap<String, f64>,
    /// The distribution each parameter was drawn from.
    pub distributions: BTreeMap<String, Distribution>,
    /// Values reported while the trial was running, by step.
    pub intermediate_values: BTreeMap<usize, f64>,
}

impl FrozenTrial {
    /// A trial that has just started.
    pub fn running(id: i64, number: usize) -> Self {
        Self {
            id,
            number,
            state: TrialState::Running,
            value: None,
            params: BTreeMap::new(),
            distributions: BTreeMap::new(),
            intermediate_values: BTreeMap::new(),
        }
    }

    /// The last step a value was reported for.
    pub fn last_step(&self) -> Option<usize> {
        self.intermediate_values.keys().next_back().copied()
    }

    /// The smallest non-NaN value reported so far, or NaN if every value is NaN.
    pub fn best_intermediate_value(&self) -> Option<f64> {
        if self.intermediate_values.is_empty() {
            return None;
        }
        Some(
            self.intermediate_values
                .values()
                .copied()
                .filter(|v| !v.is_nan())
                .fold(f64::NAN, f64::min),
        )
    }

    /// Decode a parameter into a readable value.
    pub fn param(&self, name: &str) -> Option<serde_json::Value> {
        let value = *self.params.get(name)?;
        match self.distributions.get(name)? {
            Distribution::Categorical { choices } => choices.get(value as usize).cloned(),
            Distribution::Int { .. } => Some(serde_json::Value::from(value as i64)),
            Distribution::Float { .. } => Some(serde_json::Value::from(value)),
        }
    }

    /// All parameters decoded into readable values.
    pub fn readable_params(&self) -> BTreeMap<String, serde_json::Value> {
        self.params
            .keys()
            .filter_map(|k| Some((k.clone(), self.param(k)?)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distribution_validation() {
        assert!(Distribution::Int { low: 1, high: 10 }.validate("d").is_ok());
        assert!(Distribution::Int { low: 2, high: 1 }.validate("d").is_err());
        assert!(Distribution::Categorical { choices: vec![] }
            .validate("w")
            .is_err());
        let lr = Distribution::Float {
            low: 0.0,
            high: 0.1,
            log: true,
        };
        assert!(lr.validate("lr").is_err());
    }

    #[test]
    fn distribution_json_is_tagged() {
        let d = Distribution::Float {
            low: 1e-5,
            high: 0.1,
            log: true,
        };
        let json = serde_json::to_string(&d).unwrap();
        assert!(json.contains("\"type\":\"float\""));
        assert_eq!(serde_json::from_str::<Distribution>(&json).unwrap(), d);
    }

    #[test]
    fn best_intermediate_skips_nan() {
        let mut t = FrozenTrial::running(1, 0);
        assert_eq!(t.best_intermediate_value(), None);
        t.intermediate_values.insert(0, f64::NAN);
        assert!(t.best_intermediate_value().unwrap().is_nan());
        t.intermediate_values.insert(1, 3.0);
        t.intermediate_values.insert(2, 2.0);
        assert_eq!(t.best_intermediate_value(), Some(2.0));
        assert_eq!(t.last_step(), Some(2));
    }

    #[test]
    fn readable_params() {
        let mut t = FrozenTrial::running(1, 0);
        t.params.insert("width".into(), 2.0);
        t.distributions.insert(
            "width".into(),
            Distribution::Categorical {
                choices: vec![4.into(), 8.into(), 16.into()],
            },
        );
        assert_eq!(t.param("width"), Some(serde_json::Value::from(16)));
    }
}
