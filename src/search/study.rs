//! Studies: the ask, run and record loop over trials kept in a [`SqliteStorage`].

use log::{info, warn};
use serde::Serialize;

use crate::search::{
    Distribution, FrozenTrial, Pruner, Sampler, SearchError, SqliteStorage, TrialContext,
    TrialError, TrialState,
};

/// A named series of trials sharing a sampler, a pruner and a storage.
pub struct Study {
    storage: SqliteStorage,
    study_id: i64,
    name: String,
    sampler: Box<dyn Sampler>,
    pruner: Box<dyn Pruner>,
}

impl Study {
    /// Load the study called `name` from `storage`, creating it if needed.
    ///
    /// Trials left running by an interrupted process are marked as failed.
    pub fn open<S, P>(
        mut storage: SqliteStorage,
        name: &str,
        sampler: S,
        pruner: P,
    ) -> Result<Self, SearchError>
    where
        S: Sampler + 'static,
        P: Pruner + 'static,
    {
        let study_id = storage.create_study(name)?;
        let stale = storage.fail_stale_trials(study_id)?;
        if stale > 0 {
            warn!("marked {stale} interrupted trial(s) of study {name:?} as failed");
        }
        let existing = storage.trials(study_id)?.len();
        if existing > 0 {
            info!("resuming study {name:?} with {existing} recorded trial(s)");
        }
        Ok(Self {
            storage,
            study_id,
            name: name.to_string(),
            sampler: Box::new(sampler),
            pruner: Box::new(pruner),
        })
    }

    /// The name of the study.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Every trial recorded so far, ordered by number.
    pub fn trials(&self) -> Result<Vec<FrozenTrial>, SearchError> {
        Ok(self.storage.trials(self.study_id)?)
    }

    /// The completed trial with the smallest value.
    pub fn best_trial(&self) -> Result<Option<FrozenTrial>, SearchError> {
        let value = |t: &FrozenTrial| t.value.unwrap_or(f64::INFINITY);
        Ok(self
            .trials()?
            .into_iter()
            .filter(|t| t.state == TrialState::Complete)
            .filter(|t| t.value.is_some_and(|v| !v.is_nan()))
            .min_by(|a, b| value(a).total_cmp(&value(b))))
    }

    /// Start a new trial.
    pub fn ask(&mut self) -> Result<Trial<'_>, SearchError> {
        let history = self.storage.trials(self.study_id)?;
        let trial = self.storage.create_trial(self.study_id)?;
        Ok(Trial {
            study: self,
            trial,
            history,
        })
    }

    /// Run `n_trials` new trials of `objective` one after the other.
    ///
    /// Pruned and diverged trials are recorded and the search goes on. Any other error from
    /// the objective is recorded as a failure and stops the search.
    pub fn optimize<F>(&mut self, n_trials: usize, mut objective: F) -> Result<(), SearchError>
    where
        F: FnMut(&mut Trial<'_>) -> Result<f64, TrialError>,
    {
        for _ in 0..n_trials {
            let mut trial = self.ask()?;
            let outcome = objective(&mut trial);
            trial.finish(outcome)?;
            if let Some(best) = self.best_trial()? {
                info!(
                    "best is trial {} with value {}",
                    best.number,
                    best.value.unwrap_or(f64::NAN)
                );
            }
        }
        Ok(())
    }
}

/// A running trial of a [`Study`].
pub struct Trial<'s> {
    study: &'s mut Study,
    trial: FrozenTrial,
    history: Vec<FrozenTrial>,
}

impl Trial<'_> {
    /// The position of the trial within its study.
    pub fn number(&self) -> usize {
        self.trial.number
    }

    /// The trial as recorded so far.
    pub fn frozen(&self) -> &FrozenTrial {
        &self.trial
    }

    fn suggest(&mut self, name: &str, distribution: Distribution) -> Result<f64, SearchError> {
        distribution.validate(name)?;
        if let Some(existing) = self.trial.distributions.get(name) {
            if *existing != distribution {
                return Err(SearchError::IncompatibleDistribution(name.to_string()));
            }
            if let Some(value) = self.trial.params.get(name) {
                return Ok(*value);
            }
        }
        let value = self
            .study
            .sampler
            .sample(&self.history, name, &distribution);
        self.study
            .storage
            .set_param(self.trial.id, name, value, &distribution)?;
        self.trial.params.insert(name.to_string(), value);
        self.trial
            .distributions
            .insert(name.to_string(), distribution);
        Ok(value)
    }

    /// Record the outcome of the objective and return the finished trial.
    pub fn finish(self, outcome: Result<f64, TrialError>) -> Result<FrozenTrial, SearchError> {
        let Self {
            study, mut trial, ..
        } = self;
        let (state, value) = match outcome {
            Ok(v) if v.is_nan() => {
                warn!("trial {} returned NaN", trial.number);
                (TrialState::Fail, f64::INFINITY)
            }
            Ok(v) => (TrialState::Complete, v),
            Err(TrialError::Pruned { step }) => {
                info!("trial {} pruned at step {step}", trial.number);
                let last = trial.intermediate_values.values().next_back().copied();
                (TrialState::Pruned, last.unwrap_or(f64::NAN))
            }
            Err(TrialError::Diverged { step }) => {
                warn!("trial {} diverged at step {step}", trial.number);
                (TrialState::Fail, f64::INFINITY)
            }
            Err(source) => {
                study
                    .storage
                    .finish(trial.id, TrialState::Fail, None)?;
                return Err(SearchError::Objective {
                    number: trial.number,
                    source: Box::new(source),
                });
            }
        };
        study.storage.finish(trial.id, state, Some(value))?;
        trial.state = state;
        trial.value = (!value.is_nan()).then_some(value);
        info!(
            "trial {} finished as {state} with value {value} and parameters {:?}",
            trial.number,
            trial.readable_params()
        );
        Ok(trial)
    }
}

impl TrialContext for Trial<'_> {
    fn suggest_categorical<T>(&mut self, name: &str, choices: &[T]) -> Result<T, SearchError>
    where
        T: Serialize + Clone,
    {
        let encoded = choices
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()?;
        let index = self.suggest(name, Distribution::Categorical { choices: encoded })?;
        choices
            .get(index as usize)
            .cloned()
            .ok_or_else(|| SearchError::InvalidDistribution {
                name: name.to_string(),
                reason: format!("sampled index {index} is out of range"),
            })
    }

    fn suggest_int(&mut self, name: &str, low: i64, high: i64) -> Result<i64, SearchError> {
        Ok(self.suggest(name, Distribution::Int { low, high })? as i64)
    }

    fn suggest_float(
        &mut self,
        name: &str,
        low: f64,
        high: f64,
        log: bool,
    ) -> Result<f64, SearchError> {
        self.suggest(name, Distribution::Float { low, high, log })
    }

    fn report(&mut self, value: f64, step: usize) -> Result<(), SearchError> {
        self.study.storage.report(self.trial.id, step, value)?;
        self.trial.intermediate_values.insert(step, value);
        Ok(())
    }

    fn should_prune(&self) -> bool {
        self.study.pruner.prune(&self.history, &self.trial)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        search::{MedianPruner, NopPruner, RandomSampler},
        tensor::TensorError,
    };

    fn study(storage: SqliteStorage) -> Study {
        Study::open(storage, "test", RandomSampler::new(0), NopPruner).unwrap()
    }

    #[test]
    fn outcomes_map_to_states() {
        let mut study = study(SqliteStorage::in_memory().unwrap());
        let mut outcomes = vec![
            Ok(2.0),
            Err(TrialError::Pruned { step: 1 }),
            Err(TrialError::Diverged { step: 3 }),
            Ok(f64::NAN),
            Ok(5.0),
        ]
        .into_iter();
        study
            .optimize(5, |trial| {
                trial.report(0.5, 0)?;
                trial.report(0.25, 1)?;
                outcomes.next().unwrap()
            })
            .unwrap();

        let trials = study.trials().unwrap();
        let states: Vec<_> = trials.iter().map(|t| t.state).collect();
        assert_eq!(
            states,
            vec![
                TrialState::Complete,
                TrialState::Pruned,
                TrialState::Fail,
                TrialState::Fail,
                TrialState::Complete
            ]
        );
        assert_eq!(trials[1].value, Some(0.25));
        assert_eq!(trials[2].value, Some(f64::INFINITY));
        assert_eq!(trials[3].value, Some(f64::INFINITY));

        // The pruned trial has the smallest value but is not eligible.
        assert_eq!(study.best_trial().unwrap().unwrap().number, 0);
    }

    #[test]
    fn other_errors_stop_the_search() {
        let mut study = study(SqliteStorage::in_memory().unwrap());
        let mut calls = 0;
        let err = study
            .optimize(3, |_| {
                calls += 1;
                Err(TensorError::Rank {
                    expected: 2,
                    shape: vec![3],
                }
                .into())
            })
            .unwrap_err();
        assert!(matches!(err, SearchError::Objective { number: 0, .. }));
        assert_eq!(calls, 1);
        assert_eq!(study.trials().unwrap()[0].state, TrialState::Fail);
    }

    #[test]
    fn repeated_suggestions_are_consistent() {
        let mut study = study(SqliteStorage::in_memory().unwrap());
        let mut trial = study.ask().unwrap();
        let width = trial.suggest_categorical("width", &[4, 8, 16]).unwrap();
        assert_eq!(trial.suggest_categorical("width", &[4, 8, 16]).unwrap(), width);
        assert!(matches!(
            trial.suggest_int("width", 1, 3),
            Err(SearchError::IncompatibleDistribution(_))
        ));
        assert!(matches!(
            trial.suggest_float("lr", 1.0, 0.1, true),
            Err(SearchError::InvalidDistribution { .. })
        ));
        let lr = trial.suggest_float("lr", 1e-5, 0.1, true).unwrap();
        assert!((1e-5..=0.1).contains(&lr));
        let frozen = trial.finish(Ok(1.0)).unwrap();
        assert_eq!(frozen.param("width"), Some(serde_json::Value::from(width)));
    }

    #[test]
    fn study_resumes_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.sqlite3");

        let mut first = study(SqliteStorage::open(&path).unwrap());
        first
            .optimize(3, |t| Ok(t.suggest_int("depth", 1, 10)? as f64))
            .unwrap();
        // Left running, as if the process had been killed.
        let _ = first.ask().unwrap().number();
        drop(first);

        let mut second = study(SqliteStorage::open(&path).unwrap());
        assert_eq!(second.trials().unwrap()[3].state, TrialState::Fail);
        second
            .optimize(2, |t| Ok(t.suggest_int("depth", 1, 10)? as f64))
            .unwrap();
        let numbers: Vec<_> = second.trials().unwrap().iter().map(|t| t.number).collect();
        assert_eq!(numbers, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn median_pruner_sees_previous_trials() {
        let storage = SqliteStorage::in_memory().unwrap();
        let mut study =
            Study::open(storage, "prune", RandomSampler::new(0), MedianPruner::default()).unwrap();
        study
            .optimize(5, |t| {
                t.report(1.0, 0)?;
                assert!(!t.should_prune());
                Ok(1.0)
            })
            .unwrap();
        let mut trial = study.ask().unwrap();
        trial.report(3.0, 0).unwrap();
        assert_eq!(trial.frozen().number, 5);
        assert_eq!(trial.frozen().intermediate_values.get(&0), Some(&3.0));
        assert_eq!(trial.frozen().state, TrialState::Running);
        assert!(trial.should_prune());
    }
}
