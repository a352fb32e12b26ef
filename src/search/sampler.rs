//! Parameter proposal strategies.
//!
//! Samplers work in the internal representation of [`Distribution`]: the index of the choice
//! for categorical parameters and the value itself otherwise.

use std::{
    cmp::Ordering,
    f64::consts::{PI, SQRT_2},
};

use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::StandardNormal;

use crate::search::{Distribution, FrozenTrial, TrialState};

/// Proposes a value for one parameter given the trials seen so far.
pub trait Sampler {
    /// Draw the internal value of parameter `name` from `distribution`.
    fn sample(&mut self, trials: &[FrozenTrial], name: &str, distribution: &Distribution) -> f64;
}

/// Independent uniform draws.
#[derive(Debug, Clone)]
pub struct RandomSampler {
    rng: StdRng,
}

impl RandomSampler {
    /// Create a sampler with a fixed seed.
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Sampler for RandomSampler {
    fn sample(&mut self, _trials: &[FrozenTrial], _name: &str, distribution: &Distribution) -> f64 {
        sample_uniform(&mut self.rng, distribution)
    }
}

fn sample_uniform<R: Rng>(rng: &mut R, distribution: &Distribution) -> f64 {
    match distribution {
        Distribution::Categorical { choices } => rng.gen_range(0..choices.len()) as f64,
        Distribution::Int { low, high } => rng.gen_range(*low..=*high) as f64,
        Distribution::Float { low, high, log: true } => {
            rng.gen_range(low.ln()..=high.ln()).exp().clamp(*low, *high)
        }
        Distribution::Float { low, high, .. } => rng.gen_range(*low..=*high),
    }
}

/// Tree-structured Parzen estimator.
///
/// Once enough trials have completed, the observations of a parameter are split into the best
/// `min(ceil(0.1 n), 25)` and the rest. Each part is modelled by a mixture of truncated normals
/// (or weighted counts for categorical parameters) and the candidate maximizing the ratio of the
/// two densities is proposed. Parameters are modelled independently of each other.
#[derive(Debug, Clone)]
pub struct TpeSampler {
    rng: StdRng,
    /// Trials sampled at random before the model is used.
    pub n_startup_trials: usize,
    /// Candidates drawn from the good-trial model per proposal.
    pub n_ei_candidates: usize,
    /// Weight of the prior component in each mixture.
    pub prior_weight: f64,
}

impl TpeSampler {
    /// Create a sampler with a fixed seed and the default settings.
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            n_startup_trials: 10,
            n_ei_candidates: 24,
            prior_weight: 1.0,
        }
    }

    fn sample_numerical(&mut self, below: &[f64], above: &[f64], low: f64, high: f64) -> f64 {
        let good = Parzen::new(below, low, high, self.prior_weight);
        let bad = Parzen::new(above, low, high, self.prior_weight);
        let mut best = (f64::NEG_INFINITY, (low + high) / 2.0);
        for _ in 0..self.n_ei_candidates {
            let x = good.sample(&mut self.rng);
            let score = good.log_pdf(x) - bad.log_pdf(x);
            if score > best.0 {
                best = (score, x);
            }
        }
        best.1
    }

    fn sample_categorical(&mut self, below: &[f64], above: &[f64], n_choices: usize) -> f64 {
        let good = self.categorical_weights(below, n_choices);
        let bad = self.categorical_weights(above, n_choices);
        let mut best = (f64::NEG_INFINITY, 0);
        for _ in 0..self.n_ei_candidates {
            let c = pick(&mut self.rng, &good);
            let score = good[c].ln() - bad[c].ln();
            if score > best.0 {
                best = (score, c);
            }
        }
        best.1 as f64
    }

    fn categorical_weights(&self, observations: &[f64], n_choices: usize) -> Vec<f64> {
        let mut weights = vec![self.prior_weight / n_choices as f64; n_choices];
        for (index, w) in observations.iter().zip(default_weights(observations.len())) {
            if let Some(slot) = weights.get_mut(*index as usize) {
                *slot += w;
            }
        }
        let total: f64 = weights.iter().sum();
        weights.iter().map(|w| w / total).collect()
    }
}

impl Sampler for TpeSampler {
    fn sample(&mut self, trials: &[FrozenTrial], name: &str, distribution: &Distribution) -> f64 {
        let complete = trials
            .iter()
            .filter(|t| t.state == TrialState::Complete)
            .count();
        if complete < self.n_startup_trials {
            return sample_uniform(&mut self.rng, distribution);
        }

        let Some((below, above)) = split_observations(trials, name, distribution) else {
            return sample_uniform(&mut self.rng, distribution);
        };

        match distribution {
            Distribution::Categorical { choices } if choices.len() > 1 => {
                self.sample_categorical(&below, &above, choices.len())
            }
            Distribution::Categorical { .. } => 0.0,
            Distribution::Int { low, high } if low < high => {
                let (low, high) = (*low as f64, *high as f64);
                self.sample_numerical(&below, &above, low - 0.5, high + 0.5)
                    .round()
                    .clamp(low, high)
            }
            Distribution::Int { low, .. } => *low as f64,
            Distribution::Float { low, high, log } if low < high => {
                if *log {
                    let ln = |v: &Vec<f64>| v.iter().map(|x| x.ln()).collect::<Vec<_>>();
                    self.sample_numerical(&ln(&below), &ln(&above), low.ln(), high.ln())
                        .exp()
                        .clamp(*low, *high)
                } else {
                    self.sample_numerical(&below, &above, *low, *high)
                        .clamp(*low, *high)
                }
            }
            Distribution::Float { low, .. } => *low,
        }
    }
}

/// Split the values of `name` drawn by finished trials into the good and the bad group.
///
/// Each group keeps trial order. Returns `None` when no trial drew `name` from `distribution`.
fn split_observations(
    trials: &[FrozenTrial],
    name: &str,
    distribution: &Distribution,
) -> Option<(Vec<f64>, Vec<f64>)> {
    // (rank, number, parameter) of every finished trial that drew `name` from the same space.
    // Completed trials rank by value; pruned ones follow, deepest first, then by value.
    let mut observed: Vec<(Rank, usize, f64)> = trials
        .iter()
        .filter(|t| t.distributions.get(name) == Some(distribution))
        .filter_map(|t| {
            let value = t.value.filter(|v| !v.is_nan())?;
            let rank = match t.state {
                TrialState::Complete => Rank::Complete(value),
                TrialState::Pruned => {
                    let step = t.intermediate_values.keys().next_back().copied();
                    Rank::Pruned(step.unwrap_or(0), value)
                }
                _ => return None,
            };
            Some((rank, t.number, *t.params.get(name)?))
        })
        .collect();
    if observed.is_empty() {
        return None;
    }
    observed.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));
    let n_below = ((observed.len() as f64 * 0.1).ceil() as usize).min(25);
    let (below, above) = observed.split_at_mut(n_below);
    below.sort_by_key(|o| o.1);
    above.sort_by_key(|o| o.1);
    Some((
        below.iter().map(|o| o.2).collect(),
        above.iter().map(|o| o.2).collect(),
    ))
}

/// Position of a finished trial when splitting observations into good and bad.
#[derive(Debug, Clone, Copy)]
enum Rank {
    Complete(f64),
    /// Last reported step and value.
    Pruned(usize, f64),
}

impl Rank {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Complete(a), Self::Complete(b)) => a.total_cmp(b),
            (Self::Complete(_), Self::Pruned(..)) => Ordering::Less,
            (Self::Pruned(..), Self::Complete(_)) => Ordering::Greater,
            (Self::Pruned(sa, a), Self::Pruned(sb, b)) => sb.cmp(sa).then(a.total_cmp(b)),
        }
    }
}

/// A mixture of normals truncated to `[low, high]`, one per observation plus a wide prior.
#[derive(Debug)]
struct Parzen {
    weights: Vec<f64>,
    mus: Vec<f64>,
    sigmas: Vec<f64>,
    low: f64,
    high: f64,
}

impl Parzen {
    fn new(observations: &[f64], low: f64, high: f64, prior_weight: f64) -> Self {
        let span = high - low;
        let prior_mu = (low + high) / 2.0;
        let mut components: Vec<(f64, f64, bool)> = observations
            .iter()
            .zip(default_weights(observations.len()))
            .map(|(mu, w)| (*mu, w, false))
            .collect();
        components.push((prior_mu, prior_weight, true));
        components.sort_by(|a, b| a.0.total_cmp(&b.0));

        // Each bandwidth is the distance to the farther neighbour, bounded by the range.
        let sigma_min = span / (1.0 + observations.len() as f64).min(100.0);
        let mut sigmas = Vec::with_capacity(components.len());
        for (i, (mu, _, prior)) in components.iter().enumerate() {
            if *prior {
                sigmas.push(span);
                continue;
            }
            let left = if i == 0 { low } else { components[i - 1].0 };
            let right = components.get(i + 1).map_or(high, |c| c.0);
            sigmas.push((mu - left).max(right - mu).clamp(sigma_min, span));
        }

        let total: f64 = components.iter().map(|c| c.1).sum();
        Self {
            weights: components.iter().map(|c| c.1 / total).collect(),
            mus: components.iter().map(|c| c.0).collect(),
            sigmas,
            low,
            high,
        }
    }

    fn sample<R: Rng>(&self, rng: &mut R) -> f64 {
        let i = pick(rng, &self.weights);
        let (mu, sigma) = (self.mus[i], self.sigmas[i]);
        for _ in 0..100 {
            let z: f64 = rng.sample(StandardNormal);
            let x = mu + sigma * z;
            if (self.low..=self.high).contains(&x) {
                return x;
            }
        }
        mu.clamp(self.low, self.high)
    }

    fn log_pdf(&self, x: f64) -> f64 {
        let terms: Vec<f64> = self
            .weights
            .iter()
            .zip(&self.mus)
            .zip(&self.sigmas)
            .map(|((w, mu), sigma)| {
                let z = (x - mu) / sigma;
                let mass = normal_cdf((self.high - mu) / sigma) - normal_cdf((self.low - mu) / sigma);
                w.ln() - 0.5 * z * z - sigma.ln() - 0.5 * (2.0 * PI).ln()
                    - mass.max(f64::MIN_POSITIVE).ln()
            })
            .collect();
        log_sum_exp(&terms)
    }
}

/// Observation weights in trial order: flat for recent trials, ramping down for old ones.
fn default_weights(n: usize) -> Vec<f64> {
    const FLAT: usize = 25;
    if n < FLAT {
        return vec![1.0; n];
    }
    let ramp = n - FLAT;
    (0..ramp)
        .map(|i| {
            if ramp == 1 {
                1.0 / n as f64
            } else {
                1.0 / n as f64 + (1.0 - 1.0 / n as f64) * i as f64 / (ramp - 1) as f64
            }
        })
        .chain(std::iter::repeat(1.0).take(FLAT))
        .collect()
}

/// Draw an index with probability proportional to `weights`.
fn pick<R: Rng>(rng: &mut R, weights: &[f64]) -> usize {
    let total: f64 = weights.iter().sum();
    let mut u = rng.gen::<f64>() * total;
    for (i, w) in weights.iter().enumerate() {
        if u < *w {
            return i;
        }
        u -= w;
    }
    weights.len().saturating_sub(1)
}

fn log_sum_exp(terms: &[f64]) -> f64 {
    let max = terms.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY {
        return max;
    }
    max + terms.iter().map(|t| (t - max).exp()).sum::<f64>().ln()
}

fn normal_cdf(z: f64) -> f64 {
    0.5 * (1.0 + erf(z / SQRT_2))
}

/// Abramowitz and Stegun 7.1.26, absolute error below 1.5e-7.
fn erf(x: f64) -> f64 {
    let t = 1.0 / (1.0 + 0.327_591_1 * x.abs());
    let poly = t
        * (0.254_829_592
            + t * (-0.284_496_736 + t * (1.421_413_741 + t * (-1.453_152_027 + t * 1.061_405_429))));
    (1.0 - poly * (-x * x).exp()).copysign(x)
}
