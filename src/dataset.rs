//! Synthetic datasets of variable-size sets.
//!
//! Set sizes follow an exponential distribution, so most sets are small while a few are large.
//! Each element is a vector drawn from the standard normal distribution, and the target of a set
//! is a non-linear, permutation-invariant function of its elements that no model linear in the
//! elements can fit.

use rand::Rng;
use rand_distr::{Exp1, StandardNormal};
use serde::{Deserialize, Serialize};

use crate::tensor::{Tensor, TensorError};

/// Parameters of the set generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GeneratorConfig {
    /// The largest number of elements in a set.
    pub ceiling: usize,
    /// The dimension of every element.
    pub dim: usize,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            ceiling: 400,
            dim: 2,
        }
    }
}

/// A single set together with its target.
#[derive(Debug, Clone)]
pub struct SetSample {
    /// The elements of the set, one per row.
    pub elements: Tensor,
    /// The value to predict for the set.
    pub target: f32,
}

impl SetSample {
    /// Create a sample whose target is computed with [`true_mapping`].
    pub fn new(elements: Tensor) -> Result<Self, TensorError> {
        let target = true_mapping(&elements)?;
        Ok(Self { elements, target })
    }

    /// The number of elements in the set.
    pub fn len(&self) -> usize {
        self.elements.shape().first().copied().unwrap_or(0)
    }

    /// Check if the set has no element.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The dimension of the elements.
    pub fn dim(&self) -> usize {
        self.elements.shape().get(1).copied().unwrap_or(0)
    }
}

/// The function the model learns: `ln(1 + |Σᵢ (xᵢ₀² + 3·xᵢ₁)|)`.
///
/// Columns past the second are ignored. A set of one-dimensional elements only contributes the
/// squared term.
pub fn true_mapping(elements: &Tensor) -> Result<f32, TensorError> {
    let (rows, _) = elements.dims2()?;
    let mut sum = 0.0f32;
    for r in 0..rows {
        let x = elements.row(r)?;
        sum += x.first().map_or(0.0, |x0| x0 * x0);
        sum += x.get(1).map_or(0.0, |x1| 3.0 * x1);
    }
    Ok(sum.abs().ln_1p())
}

/// Draw `count` set sizes.
///
/// Sizes are drawn from the unit exponential distribution and rescaled so that, after adding one
/// and truncating, the largest equals `ceiling`. Every size lies in `1..=ceiling`.
pub fn cardinalities<R>(rng: &mut R, count: usize, ceiling: usize) -> Vec<usize>
where
    R: Rng,
{
    let draws: Vec<f64> = (0..count).map(|_| rng.sample(Exp1)).collect();
    let max = draws.iter().copied().fold(0.0, f64::max);
    let span = ceiling.saturating_sub(1) as f64;
    draws
        .into_iter()
        .map(|n| {
            let relative = if max > 0.0 { n / max } else { 0.0 };
            ((relative * span + 1.0) as usize).clamp(1, ceiling.max(1))
        })
        .collect()
}

/// Generate `count` sets with their targets.
pub fn generate<R>(rng: &mut R, count: usize, config: &GeneratorConfig) -> Vec<SetSample>
where
    R: Rng,
{
    cardinalities(rng, count, config.ceiling)
        .into_iter()
        .map(|n| {
            let data: Vec<f32> = (0..n * config.dim)
                .map(|_| rng.sample(StandardNormal))
                .collect();
            let elements = Tensor::from_vec(&[n, config.dim], data)
                .expect("generated data always fills its shape");
            let target = true_mapping(&elements).expect("generated elements form a matrix");
            SetSample { elements, target }
        })
        .collect()
}
