//! Fixed-capacity batches of variable-size sets.
//!
//! All elements of all sets are concatenated into one matrix and padded with zero rows, targets
//! are padded with zeros, and an [`Incidence`] records which element rows belong to which target
//! slot. A mask marks the target slots holding real sets so padding never reaches the loss.

use log::info;
use thiserror::Error;

use crate::{
    dataset::SetSample,
    tensor::{Incidence, Tensor, TensorError},
};

/// Errors raised while building a [`PaddedBatch`].
#[derive(Debug, Error)]
pub enum BatchError {
    /// The sets hold more elements than the batch has element slots.
    #[error("{elements} elements do not fit into {capacity} element slots")]
    TooManyElements {
        /// Total number of elements over all sets.
        elements: usize,
        /// Number of element slots.
        capacity: usize,
    },
    /// There are more sets than the batch has target slots.
    #[error("{sets} sets do not fit into {capacity} target slots")]
    TooManySets {
        /// Number of sets.
        sets: usize,
        /// Number of target slots.
        capacity: usize,
    },
    /// Two sets disagree on the dimension of their elements.
    #[error("set {index} has elements of dimension {got}, expected {expected}")]
    DimensionMismatch {
        /// Position of the offending set.
        index: usize,
        /// Dimension of the first set.
        expected: usize,
        /// Dimension of the offending set.
        got: usize,
    },
    /// A set whose elements are not a matrix.
    #[error("set {index} has elements of shape {shape:?}, expected a matrix")]
    Rank {
        /// Position of the offending set.
        index: usize,
        /// Shape of its elements.
        shape: Vec<usize>,
    },
    /// No set was given, so the element dimension is unknown.
    #[error("cannot build a batch without any set")]
    Empty,
    /// A tensor could not be built.
    #[error(transparent)]
    Tensor(#[from] TensorError),
}

/// Padded representation of a list of sets.
#[derive(Debug, Clone)]
pub struct PaddedBatch {
    /// Elements of all sets, concatenated in order, shape `[max_elements, dim]`.
    pub elements: Tensor,
    /// Targets of all sets, shape `[max_sets, 1]`.
    pub targets: Tensor,
    /// 1 for target slots holding a set, 0 for padding, shape `[max_sets, 1]`.
    pub mask: Tensor,
    /// Relation from target slots to the element slots of their set.
    pub incidence: Incidence,
    n_sets: usize,
    n_elements: usize,
}

impl PaddedBatch {
    /// Concatenate and pad `samples` to the given capacities.
    ///
    /// Fails instead of truncating when the samples do not fit.
    pub fn new(
        samples: &[SetSample],
        max_elements: usize,
        max_sets: usize,
    ) -> Result<Self, BatchError> {
        if samples.is_empty() {
            return Err(BatchError::Empty);
        }
        let mut dims = Vec::with_capacity(samples.len());
        for (index, sample) in samples.iter().enumerate() {
            let shape = sample.elements.dims2().map_err(|_| BatchError::Rank {
                index,
                shape: sample.elements.shape().to_vec(),
            })?;
            dims.push(shape);
        }
        let dim = dims[0].1;
        if let Some((index, (_, got))) = dims.iter().enumerate().find(|(_, (_, d))| *d != dim) {
            return Err(BatchError::DimensionMismatch {
                index,
                expected: dim,
                got: *got,
            });
        }
        if samples.len() > max_sets {
            return Err(BatchError::TooManySets {
                sets: samples.len(),
                capacity: max_sets,
            });
        }
        let sizes: Vec<usize> = dims.iter().map(|(rows, _)| *rows).collect();
        let n_elements: usize = sizes.iter().sum();
        if n_elements > max_elements {
            return Err(BatchError::TooManyElements {
                elements: n_elements,
                capacity: max_elements,
            });
        }

        let mut elements = Vec::with_capacity(max_elements * dim);
        for sample in samples {
            elements.extend_from_slice(sample.elements.as_slice());
        }
        elements.resize(max_elements * dim, 0.0);

        let mut targets: Vec<f32> = samples.iter().map(|s| s.target).collect();
        targets.resize(max_sets, 0.0);
        let mut mask = vec![1.0; samples.len()];
        mask.resize(max_sets, 0.0);

        let batch = Self {
            elements: Tensor::from_vec(&[max_elements, dim], elements)?,
            targets: Tensor::from_vec(&[max_sets, 1], targets)?,
            mask: Tensor::from_vec(&[max_sets, 1], mask)?,
            incidence: Incidence::from_group_sizes(&sizes, max_sets, max_elements)?,
            n_sets: samples.len(),
            n_elements,
        };
        info!(
            "X fractional overhead {:.2}, y fractional overhead {:.2}",
            batch.element_overhead(),
            batch.target_overhead()
        );
        Ok(batch)
    }

    /// Concatenate `samples` without any padding.
    pub fn tight(samples: &[SetSample]) -> Result<Self, BatchError> {
        let max_elements = samples.iter().map(SetSample::len).sum();
        Self::new(samples, max_elements, samples.len())
    }

    /// The number of real sets.
    pub fn n_sets(&self) -> usize {
        self.n_sets
    }

    /// The number of real elements.
    pub fn n_elements(&self) -> usize {
        self.n_elements
    }

    /// The number of element slots.
    pub fn max_elements(&self) -> usize {
        self.incidence.cols()
    }

    /// The number of target slots.
    pub fn max_sets(&self) -> usize {
        self.incidence.rows()
    }

    /// The dimension of the elements.
    pub fn dim(&self) -> usize {
        self.elements.shape()[1]
    }

    /// The mask as booleans, one per target slot.
    pub fn mask_values(&self) -> Vec<bool> {
        self.mask.as_slice().iter().map(|m| *m != 0.0).collect()
    }

    /// The fraction of element slots that belong to no set.
    pub fn element_overhead(&self) -> f64 {
        overhead(self.incidence.column_coverage(), self.max_elements())
    }

    /// The fraction of target slots that hold padding.
    pub fn target_overhead(&self) -> f64 {
        overhead(self.n_sets, self.max_sets())
    }
}

fn overhead(used: usize, capacity: usize) -> f64 {
    if capacity == 0 {
        return 0.0;
    }
    (capacity - used) as f64 / capacity as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(rows: &[[f32; 2]]) -> SetSample {
        let data: Vec<f32> = rows.iter().flatten().copied().collect();
        SetSample::new(Tensor::new(&[rows.len(), 2], &data).unwrap()).unwrap()
    }

    #[test]
    fn single_set_scenario() {
        let samples = [sample(&[[1., 0.], [0., 1.], [1., 1.]])];
        let batch = PaddedBatch::new(&samples, 10, 2).unwrap();

        let target = 8f32.ln_1p();
        assert!((batch.targets.ravel()[0] - target).abs() < 1e-6);
        assert_eq!(batch.targets.ravel()[1], 0.0);
        assert_eq!(batch.mask_values(), vec![true, false]);

        let dense = batch.incidence.to_dense();
        let mut row0 = vec![0.0; 10];
        row0[..3].fill(1.0);
        assert_eq!(dense.row(0).unwrap(), row0.as_slice());
        assert_eq!(dense.row(1).unwrap(), vec![0.0; 10].as_slice());

        assert_eq!(batch.elements.shape(), &[10, 2]);
        assert_eq!(batch.n_elements(), 3);
        assert_eq!(batch.n_sets(), 1);
        assert_eq!(
            &batch.elements.as_slice()[..6],
            &[1., 0., 0., 1., 1., 1.]
        );
        assert!(batch.elements.as_slice()[6..].iter().all(|x| *x == 0.0));
        assert!((batch.element_overhead() - 0.7).abs() < 1e-12);
        assert!((batch.target_overhead() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn capacity_is_a_precondition() {
        let samples = [sample(&[[1., 0.], [0., 1.]]), sample(&[[2., 2.]])];
        assert!(matches!(
            PaddedBatch::new(&samples, 2, 2),
            Err(BatchError::TooManyElements {
                elements: 3,
                capacity: 2
            })
        ));
        assert!(matches!(
            PaddedBatch::new(&samples, 3, 1),
            Err(BatchError::TooManySets {
                sets: 2,
                capacity: 1
            })
        ));
        assert!(PaddedBatch::new(&samples, 3, 2).is_ok());
    }

    #[test]
    fn tight_batch_has_no_overhead() {
        let samples = [sample(&[[1., 0.], [0., 1.]]), sample(&[[2., 2.]])];
        let batch = PaddedBatch::tight(&samples).unwrap();
        assert_eq!(batch.max_elements(), 3);
        assert_eq!(batch.max_sets(), 2);
        assert_eq!(batch.element_overhead(), 0.0);
        assert_eq!(batch.target_overhead(), 0.0);
    }

    #[test]
    fn mixed_dimensions_are_rejected() {
        let odd = SetSample::new(Tensor::new(&[1, 3], &[1., 2., 3.]).unwrap()).unwrap();
        let samples = [sample(&[[1., 0.]]), odd];
        assert!(matches!(
            PaddedBatch::new(&samples, 10, 2),
            Err(BatchError::DimensionMismatch { index: 1, .. })
        ));
        assert!(matches!(PaddedBatch::new(&[], 10, 2), Err(BatchError::Empty)));
    }

    #[test]
    fn elements_must_form_a_matrix() {
        let data: Vec<f32> = (1..=12).map(|x| x as f32).collect();
        let cube = SetSample {
            elements: Tensor::new(&[3, 2, 2], &data).unwrap(),
            target: 1.0,
        };
        assert!(matches!(
            PaddedBatch::new(&[cube], 4, 1),
            Err(BatchError::Rank { index: 0, ref shape }) if shape == &[3, 2, 2]
        ));

        let flat = SetSample {
            elements: Tensor::new(&[3], &[1., 2., 3.]).unwrap(),
            target: 1.0,
        };
        assert!(matches!(
            PaddedBatch::new(&[sample(&[[1., 0.]]), flat], 5, 2),
            Err(BatchError::Rank { index: 1, .. })
        ));
    }
}
