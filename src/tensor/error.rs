//! Defines tensor errors.

use thiserror::Error;

/// An error type for all operations on tensors.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum TensorError {
    /// An operation was performed on 2 objects with incompatible shapes.
    #[error("incompatible shapes {0:?} and {1:?}")]
    IncompatibleShapes(Vec<usize>, Vec<usize>),
    /// The data given does not fill the requested shape.
    #[error("shape {shape:?} holds {expected} elements, but {got} were given")]
    ElementCount {
        /// The requested shape.
        shape: Vec<usize>,
        /// The number of elements the shape holds.
        expected: usize,
        /// The number of elements given.
        got: usize,
    },
    /// An operation requiring a tensor of a specific rank got another.
    #[error("expected a tensor of rank {expected}, got shape {shape:?}")]
    Rank {
        /// The required rank.
        expected: usize,
        /// The shape that was given.
        shape: Vec<usize>,
    },
    /// An index lies outside of the tensor.
    #[error("index {index} out of bounds for an axis of size {size}")]
    OutOfBounds {
        /// The offending index.
        index: usize,
        /// The size of the axis.
        size: usize,
    },
}
