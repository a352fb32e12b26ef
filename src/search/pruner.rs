//! Early stopping of unpromising trials.

use log::debug;

use crate::search::{FrozenTrial, TrialState};

/// Decides whether a running trial should be abandoned.
pub trait Pruner {
    /// Compare `trial` with the other trials of the study.
    ///
    /// `trials` holds the trials that existed when `trial` started; only finished ones matter.
    fn prune(&self, trials: &[FrozenTrial], trial: &FrozenTrial) -> bool;
}

/// Never prunes.
#[derive(Debug, Clone, Copy, Default)]
pub struct NopPruner;

impl Pruner for NopPruner {
    fn prune(&self, _trials: &[FrozenTrial], _trial: &FrozenTrial) -> bool {
        false
    }
}

/// Prunes a trial whose best value so far is worse than the median of the completed trials at
/// the same step.
#[derive(Debug, Clone, Copy)]
pub struct MedianPruner {
    /// Pruning is disabled until this many trials have completed.
    pub n_startup_trials: usize,
    /// Pruning is disabled before this step.
    pub n_warmup_steps: usize,
    /// Pruning is only considered every this many steps after the warm-up.
    pub interval_steps: usize,
    /// The minimum number of completed trials with a value at the step.
    pub n_min_trials: usize,
}

impl Default for MedianPruner {
    fn default() -> Self {
        Self {
            n_startup_trials: 5,
            n_warmup_steps: 0,
            interval_steps: 1,
            n_min_trials: 1,
        }
    }
}

impl Pruner for MedianPruner {
    fn prune(&self, trials: &[FrozenTrial], trial: &FrozenTrial) -> bool {
        let Some(step) = trial.last_step() else {
            return false;
        };
        let completed: Vec<_> = trials
            .iter()
            .filter(|t| t.state == TrialState::Complete)
            .collect();
        if completed.len() < self.n_startup_trials || step < self.n_warmup_steps {
            return false;
        }
        if (step - self.n_warmup_steps) % self.interval_steps.max(1) != 0 {
            return false;
        }
        let Some(best) = trial.best_intermediate_value() else {
            return false;
        };
        if best.is_nan() {
            return true;
        }
        let mut others: Vec<f64> = completed
            .iter()
            .filter_map(|t| t.intermediate_values.get(&step).copied())
            .filter(|v| !v.is_nan())
            .collect();
        if others.is_empty() || others.len() < self.n_min_trials {
            return false;
        }
        let median = percentile(&mut others, 50.0);
        debug!(
            "trial {} at step {step}: best {best} vs median {median} of {} trials",
            trial.number,
            others.len()
        );
        best > median
    }
}

/// Percentile with linear interpolation between closest ranks.
fn percentile(values: &mut [f64], q: f64) -> f64 {
    values.sort_by(f64::total_cmp);
    let rank = q / 100.0 * (values.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    values[lo] + (values[hi] - values[lo]) * (rank - lo as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finished(number: usize, values: &[(usize, f64)]) -> FrozenTrial {
        let mut t = FrozenTrial::running(number as i64, number);
        t.state = TrialState::Complete;
        t.intermediate_values = values.iter().copied().collect();
        t.value = values.iter().map(|(_, v)| *v).reduce(f64::min);
        t
    }

    fn running(values: &[(usize, f64)]) -> FrozenTrial {
        let mut t = FrozenTrial::running(99, 99);
        t.intermediate_values = values.iter().copied().collect();
        t
    }

    #[test]
    fn median_of_even_count_interpolates() {
        assert_eq!(percentile(&mut [4.0, 1.0, 3.0, 2.0], 50.0), 2.5);
        assert_eq!(percentile(&mut [5.0], 50.0), 5.0);
    }

    #[test]
    fn prunes_worse_than_median() {
        let history: Vec<_> = (0..5).map(|i| finished(i, &[(0, 1.0 + i as f64)])).collect();
        let pruner = MedianPruner::default();
        assert!(pruner.prune(&history, &running(&[(0, 3.5)])));
        assert!(!pruner.prune(&history, &running(&[(0, 2.5)])));
    }

    #[test]
    fn waits_for_startup_trials() {
        let history: Vec<_> = (0..4).map(|i| finished(i, &[(0, 1.0)])).collect();
        assert!(!MedianPruner::default().prune(&history, &running(&[(0, 100.0)])));
    }

    #[test]
    fn respects_warmup() {
        let history: Vec<_> = (0..5).map(|i| finished(i, &[(0, 1.0), (3, 1.0)])).collect();
        let pruner = MedianPruner {
            n_warmup_steps: 3,
            ..MedianPruner::default()
        };
        assert!(!pruner.prune(&history, &running(&[(0, 100.0)])));
        assert!(pruner.prune(&history, &running(&[(0, 100.0), (3, 100.0)])));
    }

    #[test]
    fn nan_is_always_pruned() {
        let history: Vec<_> = (0..5).map(|i| finished(i, &[(0, 1.0)])).collect();
        assert!(MedianPruner::default().prune(&history, &running(&[(0, f64::NAN)])));
    }

    #[test]
    fn ignores_unfinished_and_pruned_trials() {
        let mut history: Vec<_> = (0..5).map(|i| finished(i, &[(0, 1.0)])).collect();
        for t in &mut history {
            t.state = TrialState::Pruned;
        }
        assert!(!MedianPruner::default().prune(&history, &running(&[(0, 100.0)])));
        assert!(!NopPruner.prune(&history, &running(&[(0, 100.0)])));
    }
}
