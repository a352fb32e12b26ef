//! Local derivatives of the differentiable operations.
//!
//! Each operation keeps what it needs from the forward pass (shared tensor buffers, so this is
//! cheap) and flows an adjoint back to its inputs.

use crate::tensor::{Incidence, Tensor, TensorError};

/// Function to compute the gradient flow of an unary function.
pub trait UnaryDiff {
    /// Flow the gradient through, updating it by the local gradient w.r.t. the input.
    fn df(&self, d: &Tensor) -> Result<Tensor, TensorError>;
}

/// Function to compute the gradient flow of a binary function.
pub trait BinaryDiff {
    /// Flow the gradient through, updating it by the local gradient w.r.t. the LHS input.
    fn dfda(&self, d: &Tensor) -> Result<Tensor, TensorError>;

    /// Flow the gradient through, updating it by the local gradient w.r.t. the RHS input.
    fn dfdb(&self, d: &Tensor) -> Result<Tensor, TensorError>;
}

pub struct Add {
    pub lhs_shape: Vec<usize>,
    pub rhs_shape: Vec<usize>,
}

impl BinaryDiff for Add {
    fn dfda(&self, d: &Tensor) -> Result<Tensor, TensorError> {
        d.sum_to(&self.lhs_shape)
    }

    fn dfdb(&self, d: &Tensor) -> Result<Tensor, TensorError> {
        d.sum_to(&self.rhs_shape)
    }
}

pub struct Sub {
    pub lhs_shape: Vec<usize>,
    pub rhs_shape: Vec<usize>,
}

impl BinaryDiff for Sub {
    fn dfda(&self, d: &Tensor) -> Result<Tensor, TensorError> {
        d.sum_to(&self.lhs_shape)
    }

    fn dfdb(&self, d: &Tensor) -> Result<Tensor, TensorError> {
        Ok(d.sum_to(&self.rhs_shape)?.scale(-1.0))
    }
}

pub struct Mul {
    pub lhs: Tensor,
    pub rhs: Tensor,
}

impl BinaryDiff for Mul {
    fn dfda(&self, d: &Tensor) -> Result<Tensor, TensorError> {
        d.mul(&self.rhs)?.sum_to(self.lhs.shape())
    }

    fn dfdb(&self, d: &Tensor) -> Result<Tensor, TensorError> {
        d.mul(&self.lhs)?.sum_to(self.rhs.shape())
    }
}

pub struct MatMul {
    pub lhs: Tensor,
    pub rhs: Tensor,
}

impl BinaryDiff for MatMul {
    fn dfda(&self, d: &Tensor) -> Result<Tensor, TensorError> {
        d.matmul(&self.rhs.transpose()?)
    }

    fn dfdb(&self, d: &Tensor) -> Result<Tensor, TensorError> {
        self.lhs.transpose()?.matmul(d)
    }
}

pub struct Relu {
    pub arg: Tensor,
}

impl UnaryDiff for Relu {
    fn df(&self, d: &Tensor) -> Result<Tensor, TensorError> {
        d.zip(&self.arg, |d, x| if x > 0.0 { d } else { 0.0 })
    }
}

pub struct Square {
    pub arg: Tensor,
}

impl UnaryDiff for Square {
    fn df(&self, d: &Tensor) -> Result<Tensor, TensorError> {
        d.zip(&self.arg, |d, x| 2.0 * x * d)
    }
}

pub struct Mean {
    pub shape: Vec<usize>,
}

impl UnaryDiff for Mean {
    fn df(&self, d: &Tensor) -> Result<Tensor, TensorError> {
        let n: usize = self.shape.iter().product();
        let d = d.item().ok_or_else(|| TensorError::Rank {
            expected: 0,
            shape: d.shape().to_vec(),
        })?;
        Ok(Tensor::full(&self.shape, d / n as f32))
    }
}

pub struct Reshape {
    pub shape: Vec<usize>,
}

impl UnaryDiff for Reshape {
    fn df(&self, d: &Tensor) -> Result<Tensor, TensorError> {
        d.reshape(&self.shape)
    }
}

/// Pooling of element rows into group rows through an [`Incidence`].
pub struct Aggregate {
    pub incidence: Incidence,
}

impl UnaryDiff for Aggregate {
    fn df(&self, d: &Tensor) -> Result<Tensor, TensorError> {
        self.incidence.transpose_matmul(d)
    }
}
