//! Training a [`DeepSet`] under a stopping policy, as one trial of a search.

use log::info;
use rand::{rngs::StdRng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::{
    autodiff::Tape,
    batch::PaddedBatch,
    nn::{masked_mse, Architecture, DeepSet},
    optim::Adam,
    search::{SearchError, TrialContext, TrialError},
    tensor::Tensor,
};

/// Why a training run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// A loss became NaN.
    Diverged,
    /// The test loss stopped improving.
    Plateau,
    /// The epoch cap was reached.
    MaxEpochs,
}

/// When to stop training.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoppingPolicy {
    /// The plateau rule is not applied before this epoch.
    pub warmup: usize,
    /// Number of epochs in each of the two windows compared by the plateau rule.
    pub window: usize,
    /// Training never runs more epochs than this.
    pub max_epochs: usize,
}

impl Default for StoppingPolicy {
    fn default() -> Self {
        Self {
            warmup: 200,
            window: 100,
            max_epochs: 5000,
        }
    }
}

impl StoppingPolicy {
    /// Decide whether to stop after `epoch`, given the test losses of every epoch so far.
    ///
    /// A NaN loss is checked first. The run has plateaued when the best test loss of the last
    /// `window` epochs is no better than the best of the `window` epochs before them.
    pub fn check(&self, epoch: usize, train_loss: f32, test_losses: &[f32]) -> Option<StopReason> {
        if train_loss.is_nan() || test_losses.last().is_some_and(|l| l.is_nan()) {
            return Some(StopReason::Diverged);
        }
        let n = test_losses.len();
        if epoch >= self.warmup && self.window > 0 && n >= 2 * self.window {
            let recent = min(&test_losses[n - self.window..]);
            let previous = min(&test_losses[n - 2 * self.window..n - self.window]);
            if recent >= previous {
                return Some(StopReason::Plateau);
            }
        }
        (epoch + 1 >= self.max_epochs).then_some(StopReason::MaxEpochs)
    }
}

fn min(losses: &[f32]) -> f32 {
    losses.iter().copied().fold(f32::INFINITY, f32::min)
}

/// The outcome of a training run that was not pruned and did not diverge.
#[derive(Debug, Clone)]
pub struct FitReport {
    /// The smallest test loss seen.
    pub best_test_loss: f32,
    /// The number of epochs run.
    pub epochs: usize,
    /// Why the run stopped.
    pub stop_reason: StopReason,
    /// Train loss after every epoch.
    pub train_losses: Vec<f32>,
    /// Test loss after every epoch.
    pub test_losses: Vec<f32>,
}

/// Run `step` once per epoch until `policy` or the search controller stops it.
///
/// `step` performs one update and returns the train and test losses measured with the updated
/// parameters. The test loss is reported to `ctx` at every epoch, and the run is abandoned with
/// [`TrialError::Pruned`] as soon as `ctx` asks for it. A NaN loss ends the run with
/// [`TrialError::Diverged`].
pub fn fit<C, F>(
    ctx: &mut C,
    policy: &StoppingPolicy,
    report_interval: usize,
    mut step: F,
) -> Result<FitReport, TrialError>
where
    C: TrialContext,
    F: FnMut(usize) -> Result<(f32, f32), TrialError>,
{
    let mut report = FitReport {
        best_test_loss: f32::INFINITY,
        epochs: 0,
        stop_reason: StopReason::MaxEpochs,
        train_losses: Vec::new(),
        test_losses: Vec::new(),
    };
    for epoch in 0..policy.max_epochs {
        let (train_loss, test_loss) = step(epoch)?;
        report.train_losses.push(train_loss);
        report.test_losses.push(test_loss);
        report.epochs = epoch + 1;

        ctx.report(f64::from(test_loss), epoch)?;
        if ctx.should_prune() {
            return Err(TrialError::Pruned { step: epoch });
        }
        report.best_test_loss = report.best_test_loss.min(test_loss);

        let stop = policy.check(epoch, train_loss, &report.test_losses);
        if stop.is_some() || epoch % report_interval.max(1) == 0 {
            info!("epoch {epoch:>4}: train loss {train_loss:.5}, test loss {test_loss:.5}");
        }
        match stop {
            Some(StopReason::Diverged) => return Err(TrialError::Diverged { step: epoch }),
            Some(reason) => {
                report.stop_reason = reason;
                return Ok(report);
            }
            None => {}
        }
    }
    Ok(report)
}

/// The ranges hyperparameters are drawn from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SearchSpace {
    /// Candidate layer widths for both networks.
    pub widths: Vec<usize>,
    /// Smallest number of layers.
    pub min_depth: i64,
    /// Largest number of layers.
    pub max_depth: i64,
    /// Smallest learning rate.
    pub min_learning_rate: f64,
    /// Largest learning rate.
    pub max_learning_rate: f64,
}

impl Default for SearchSpace {
    fn default() -> Self {
        Self {
            widths: (2..=9).map(|p| 1 << p).collect(),
            min_depth: 1,
            max_depth: 10,
            min_learning_rate: 1e-5,
            max_learning_rate: 1e-1,
        }
    }
}

/// The parameters of one trial.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Hyperparams {
    /// Widths and depths of the model.
    pub architecture: Architecture,
    /// Adam step size.
    pub learning_rate: f64,
}

impl Hyperparams {
    /// Ask `ctx` for every hyperparameter.
    pub fn suggest<C>(ctx: &mut C, space: &SearchSpace) -> Result<Self, SearchError>
    where
        C: TrialContext,
    {
        let phi_width = ctx.suggest_categorical("width1", &space.widths)?;
        let phi_depth = ctx.suggest_int("depth1", space.min_depth, space.max_depth)?;
        let rho_width = ctx.suggest_categorical("width2", &space.widths)?;
        let rho_depth = ctx.suggest_int("depth2", space.min_depth, space.max_depth)?;
        let learning_rate = ctx.suggest_float(
            "lr",
            space.min_learning_rate,
            space.max_learning_rate,
            true,
        )?;
        Ok(Self {
            architecture: Architecture {
                phi_width,
                phi_depth: phi_depth as usize,
                rho_width,
                rho_depth: rho_depth as usize,
            },
            learning_rate,
        })
    }
}

/// Settings of a training run that are not searched over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrainConfig {
    /// Seed of the initial parameters, shared by every trial.
    pub init_seed: u64,
    /// A progress line is logged every this many epochs.
    pub report_interval: usize,
    /// When to stop.
    pub stopping: StoppingPolicy,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            init_seed: 0,
            report_interval: 50,
            stopping: StoppingPolicy::default(),
        }
    }
}

/// Train a fresh model with `hp` on `train_batch`, measuring the test loss on `test_batch`.
pub fn train<C>(
    ctx: &mut C,
    hp: &Hyperparams,
    train_batch: &PaddedBatch,
    test_batch: &PaddedBatch,
    config: &TrainConfig,
) -> Result<FitReport, TrialError>
where
    C: TrialContext,
{
    let mut rng = StdRng::seed_from_u64(config.init_seed);
    let mut model = DeepSet::new(&mut rng, train_batch.dim(), &hp.architecture);
    let mut adam = Adam::new(hp.learning_rate as f32);
    let mut tape = Tape::default();
    info!(
        "training {} parameters with {:?}, learning rate {:e}",
        model.parameter_count(),
        hp.architecture,
        hp.learning_rate
    );

    fit(ctx, &config.stopping, config.report_interval, |_| {
        tape.clear();
        let forward = model.forward(&tape, train_batch)?;
        let loss = masked_mse(&tape, &forward.output, train_batch)?;
        let train_loss = loss.value().item().unwrap_or(f32::NAN);
        let gradients = loss.gradients()?;
        let gradients: Vec<Tensor> = forward
            .parameters
            .iter()
            .map(|p| gradients.wrt(p))
            .collect();
        adam.step(model.parameters_mut(), &gradients)?;
        let test_loss = model.evaluate(test_batch)?;
        Ok((train_loss, test_loss))
    })
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};
    use serde::Serialize;

    use super::*;
    use crate::{
        dataset::{generate, GeneratorConfig},
        search::{MedianPruner, RandomSampler, SqliteStorage, Study, TrialState},
    };

    /// A controller that picks the first choice or the lower bound and prunes on demand.
    #[derive(Default)]
    struct Fixed {
        reports: Vec<(usize, f64)>,
        prune_at: Option<usize>,
    }

    impl TrialContext for Fixed {
        fn suggest_categorical<T>(&mut self, name: &str, choices: &[T]) -> Result<T, SearchError>
        where
            T: Serialize + Clone,
        {
            choices
                .first()
                .cloned()
                .ok_or_else(|| SearchError::InvalidDistribution {
                    name: name.to_string(),
                    reason: "no choice".to_string(),
                })
        }

        fn suggest_int(&mut self, _name: &str, low: i64, _high: i64) -> Result<i64, SearchError> {
            Ok(low)
        }

        fn suggest_float(
            &mut self,
            _name: &str,
            low: f64,
            _high: f64,
            _log: bool,
        ) -> Result<f64, SearchError> {
            Ok(low)
        }

        fn report(&mut self, value: f64, step: usize) -> Result<(), SearchError> {
            self.reports.push((step, value));
            Ok(())
        }

        fn should_prune(&self) -> bool {
            self.prune_at
                .is_some_and(|at| self.reports.last().is_some_and(|(s, _)| *s >= at))
        }
    }

    fn decreasing_then_flat(epoch: usize) -> f32 {
        1.0 / (1.0 + epoch.min(299) as f32)
    }

    #[test]
    fn stops_once_the_plateau_is_detected() {
        let mut ctx = Fixed::default();
        let report = fit(&mut ctx, &StoppingPolicy::default(), 50, |e| {
            let l = decreasing_then_flat(e);
            Ok((l, l))
        })
        .unwrap();
        assert_eq!(report.stop_reason, StopReason::Plateau);
        assert_eq!(report.epochs, 400);
        assert_eq!(report.best_test_loss, decreasing_then_flat(299));
        assert_eq!(ctx.reports.len(), 400);
    }

    #[test]
    fn never_stops_before_warmup() {
        let mut ctx = Fixed::default();
        let report = fit(&mut ctx, &StoppingPolicy::default(), 50, |_| Ok((1.0, 1.0))).unwrap();
        assert_eq!(report.stop_reason, StopReason::Plateau);
        assert_eq!(report.epochs, 201);
    }

    #[test]
    fn epoch_cap() {
        let policy = StoppingPolicy {
            max_epochs: 30,
            ..StoppingPolicy::default()
        };
        let report = fit(&mut Fixed::default(), &policy, 50, |_| Ok((1.0, 1.0))).unwrap();
        assert_eq!(report.stop_reason, StopReason::MaxEpochs);
        assert_eq!(report.epochs, 30);
    }

    #[test]
    fn nan_loss_diverges() {
        let result = fit(&mut Fixed::default(), &StoppingPolicy::default(), 50, |e| {
            Ok((if e == 7 { f32::NAN } else { 1.0 }, 1.0))
        });
        assert!(matches!(result, Err(TrialError::Diverged { step: 7 })));
    }

    #[test]
    fn pruning_signal_propagates() {
        let mut ctx = Fixed {
            prune_at: Some(10),
            ..Fixed::default()
        };
        let result = fit(&mut ctx, &StoppingPolicy::default(), 50, |_| Ok((1.0, 1.0)));
        assert!(matches!(result, Err(TrialError::Pruned { step: 10 })));
    }

    #[test]
    fn trial_far_behind_others_is_pruned() {
        let pruner = MedianPruner {
            n_warmup_steps: 10,
            ..MedianPruner::default()
        };
        let storage = SqliteStorage::in_memory().unwrap();
        let mut study = Study::open(storage, "pruning", RandomSampler::new(0), pruner).unwrap();
        let policy = StoppingPolicy {
            max_epochs: 20,
            ..StoppingPolicy::default()
        };
        study
            .optimize(5, |trial| {
                let report = fit(trial, &policy, 50, |e| Ok((0.1, 0.1 + e as f32 * 1e-3)))?;
                Ok(f64::from(report.best_test_loss))
            })
            .unwrap();
        study
            .optimize(1, |trial| {
                let result = fit(trial, &policy, 50, |_| Ok((10.0, 10.0)));
                assert!(matches!(result, Err(TrialError::Pruned { step: 10 })));
                Ok(f64::from(result?.best_test_loss))
            })
            .unwrap();
        let trials = study.trials().unwrap();
        assert_eq!(trials[5].state, TrialState::Pruned);
        assert_eq!(trials[5].intermediate_values.len(), 11);
        assert_eq!(study.best_trial().unwrap().unwrap().number, 0);
    }

    #[test]
    fn hyperparams_use_the_search_space() {
        let hp = Hyperparams::suggest(&mut Fixed::default(), &SearchSpace::default()).unwrap();
        assert_eq!(
            hp.architecture,
            Architecture {
                phi_width: 4,
                phi_depth: 1,
                rho_width: 4,
                rho_depth: 1,
            }
        );
        assert_eq!(hp.learning_rate, 1e-5);
        assert_eq!(SearchSpace::default().widths.last(), Some(&512));
    }

    #[test]
    fn training_reduces_the_loss() {
        let config = GeneratorConfig {
            ceiling: 20,
            dim: 2,
        };
        let train_set = generate(&mut StdRng::seed_from_u64(1), 16, &config);
        let test_set = generate(&mut StdRng::seed_from_u64(2), 16, &config);
        let train_batch = PaddedBatch::tight(&train_set).unwrap();
        let test_batch = PaddedBatch::tight(&test_set).unwrap();
        let hp = Hyperparams {
            architecture: Architecture {
                phi_width: 16,
                phi_depth: 2,
                rho_width: 16,
                rho_depth: 2,
            },
            learning_rate: 1e-2,
        };
        let config = TrainConfig {
            stopping: StoppingPolicy {
                max_epochs: 100,
                ..StoppingPolicy::default()
            },
            ..TrainConfig::default()
        };
        let report = train(&mut Fixed::default(), &hp, &train_batch, &test_batch, &config).unwrap();
        assert_eq!(report.epochs, 100);
        let first = report.train_losses[0];
        let last = *report.train_losses.last().unwrap();
        assert!(last < first, "train loss went from {first} to {last}");
    }
}
