//! Reverse-mode auto-differentiation on tensors. This implementation uses a tape to store the
//! computation graph.

use std::{cell::RefCell, fmt};

use crate::{
    autodiff::ops::{
        Add, Aggregate, BinaryDiff, MatMul, Mean, Mul, Relu, Reshape, Square, Sub, UnaryDiff,
    },
    tensor::{Incidence, Tensor, TensorError},
};

/// A node in the computation graph holding the index of the nodes it depends on and the
/// operation able to flow gradients back to them.
enum TapeNode {
    Var,
    Unary(Box<dyn UnaryDiff>, usize),
    Binary(Box<dyn BinaryDiff>, usize, usize),
}

impl fmt::Debug for TapeNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Var => write!(f, "Var"),
            Self::Unary(_, a) => write!(f, "Unary({a})"),
            Self::Binary(_, a, b) => write!(f, "Binary({a}, {b})"),
        }
    }
}

/// A tape recording the computation graph where each element holds the local derivatives
/// of a variable with respect to variables that it directly depends on.
#[derive(Debug, Default)]
pub struct Tape {
    nodes: RefCell<Vec<TapeNode>>,
}

impl Tape {
    /// Get the number of nodes in the tape.
    pub fn len(&self) -> usize {
        self.nodes.borrow().len()
    }

    /// Check if the tape is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove all nodes from the tape.
    ///
    /// Variables created before the call must not be used afterwards.
    pub fn clear(&mut self) {
        self.nodes.get_mut().clear();
    }

    /// Add a node to the tape and return its index.
    fn add_node(&self, node: TapeNode) -> usize {
        let mut nodes = self.nodes.borrow_mut();
        let index = nodes.len();
        nodes.push(node);
        index
    }

    /// Add a variable to the tape and return it. A variable created this way does not depends on
    /// any other variable.
    pub fn add_variable(&self, value: Tensor) -> Var<'_> {
        Var {
            index: self.add_node(TapeNode::Var),
            value,
            tape: self,
        }
    }
}

/// A variable in the computation graph. Operation on variables return new variables and do not
/// mutate the original ones.
#[derive(Debug, Clone)]
pub struct Var<'ctx> {
    value: Tensor,
    index: usize,
    tape: &'ctx Tape,
}

impl<'ctx> Var<'ctx> {
    /// The value computed by the forward pass.
    pub fn value(&self) -> &Tensor {
        &self.value
    }

    fn unary(&self, value: Tensor, op: impl UnaryDiff + 'static) -> Self {
        Var {
            value,
            index: self.tape.add_node(TapeNode::Unary(Box::new(op), self.index)),
            tape: self.tape,
        }
    }

    fn binary(&self, rhs: &Self, value: Tensor, op: impl BinaryDiff + 'static) -> Self {
        assert!(
            std::ptr::eq(self.tape, rhs.tape),
            "variables belong to different tapes"
        );
        Var {
            value,
            index: self
                .tape
                .add_node(TapeNode::Binary(Box::new(op), self.index, rhs.index)),
            tape: self.tape,
        }
    }

    /// Add `rhs` element-wise, broadcasting both operands.
    pub fn add(&self, rhs: &Self) -> Result<Self, TensorError> {
        let value = self.value.add(&rhs.value)?;
        let op = Add {
            lhs_shape: self.value.shape().to_vec(),
            rhs_shape: rhs.value.shape().to_vec(),
        };
        Ok(self.binary(rhs, value, op))
    }

    /// Subtract `rhs` element-wise, broadcasting both operands.
    pub fn sub(&self, rhs: &Self) -> Result<Self, TensorError> {
        let value = self.value.sub(&rhs.value)?;
        let op = Sub {
            lhs_shape: self.value.shape().to_vec(),
            rhs_shape: rhs.value.shape().to_vec(),
        };
        Ok(self.binary(rhs, value, op))
    }

    /// Multiply by `rhs` element-wise, broadcasting both operands.
    pub fn mul(&self, rhs: &Self) -> Result<Self, TensorError> {
        let value = self.value.mul(&rhs.value)?;
        let op = Mul {
            lhs: self.value.clone(),
            rhs: rhs.value.clone(),
        };
        Ok(self.binary(rhs, value, op))
    }

    /// Multiply two matrices.
    pub fn matmul(&self, rhs: &Self) -> Result<Self, TensorError> {
        let value = self.value.matmul(&rhs.value)?;
        let op = MatMul {
            lhs: self.value.clone(),
            rhs: rhs.value.clone(),
        };
        Ok(self.binary(rhs, value, op))
    }

    /// Apply the rectified linear unit to each element.
    #[must_use]
    pub fn relu(&self) -> Self {
        let value = self.value.map(|x| x.max(0.0));
        self.unary(
            value,
            Relu {
                arg: self.value.clone(),
            },
        )
    }

    /// Square each element.
    #[must_use]
    pub fn square(&self) -> Self {
        let value = self.value.map(|x| x * x);
        self.unary(
            value,
            Square {
                arg: self.value.clone(),
            },
        )
    }

    /// Average all elements into a scalar.
    #[must_use]
    pub fn mean(&self) -> Self {
        let value = Tensor::scalar(self.value.mean());
        self.unary(
            value,
            Mean {
                shape: self.value.shape().to_vec(),
            },
        )
    }

    /// Reshape the variable, keeping the number of elements unchanged.
    pub fn reshape(&self, shape: &[usize]) -> Result<Self, TensorError> {
        let value = self.value.reshape(shape)?;
        Ok(self.unary(
            value,
            Reshape {
                shape: self.value.shape().to_vec(),
            },
        ))
    }

    /// Sum the rows of each group of the incidence relation.
    pub fn aggregate(&self, incidence: &Incidence) -> Result<Self, TensorError> {
        let value = incidence.matmul(&self.value)?;
        Ok(self.unary(
            value,
            Aggregate {
                incidence: incidence.clone(),
            },
        ))
    }

    /// Back-propagate from this variable.
    ///
    /// The adjoint of this variable is seeded with ones, so for a scalar the result holds the
    /// gradient of the scalar with respect to every variable recorded before it.
    pub fn gradients(&self) -> Result<Gradients, TensorError> {
        let mut adjoints: Vec<Option<Tensor>> = vec![None; self.index + 1];
        adjoints[self.index] = Some(Tensor::full(self.value.shape(), 1.0));
        let nodes = self.tape.nodes.borrow();
        for i in (0..=self.index).rev() {
            let Some(adjoint) = adjoints[i].take() else {
                continue;
            };
            match &nodes[i] {
                TapeNode::Var => {}
                TapeNode::Unary(op, a) => {
                    let df = op.df(&adjoint)?;
                    accumulate(&mut adjoints[*a], df)?;
                }
                TapeNode::Binary(op, a, b) => {
                    let dfda = op.dfda(&adjoint)?;
                    let dfdb = op.dfdb(&adjoint)?;
                    accumulate(&mut adjoints[*a], dfda)?;
                    accumulate(&mut adjoints[*b], dfdb)?;
                }
            }
            adjoints[i] = Some(adjoint);
        }
        Ok(Gradients { adjoints })
    }
}

fn accumulate(slot: &mut Option<Tensor>, df: Tensor) -> Result<(), TensorError> {
    *slot = Some(match slot.take() {
        None => df,
        Some(c) => c.add(&df)?,
    });
    Ok(())
}

/// The gradients of a variable with respect to the variables it was computed from.
#[derive(Debug)]
pub struct Gradients {
    adjoints: Vec<Option<Tensor>>,
}

impl Gradients {
    /// Return the gradient with respect to `var`, or `None` if the result does not depend on it.
    pub fn get(&self, var: &Var<'_>) -> Option<&Tensor> {
        self.adjoints.get(var.index).and_then(Option::as_ref)
    }

    /// Return the gradient with respect to `var`, using zeros where the result does not depend on
    /// it.
    pub fn wrt(&self, var: &Var<'_>) -> Tensor {
        self.get(var)
            .cloned()
            .unwrap_or_else(|| Tensor::zeros(var.value.shape()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn float_eq(lhs: f32, rhs: f32, tolerance: f32) -> bool {
        (lhs - rhs).abs() <= tolerance
    }

    #[test]
    fn product_rule() {
        let tape = Tape::default();
        let x = tape.add_variable(Tensor::from([2.0, 3.0]));
        let y = tape.add_variable(Tensor::from([5.0, 7.0]));
        let z = x.mul(&y).unwrap().add(&x).unwrap().mean();
        let grads = z.gradients().unwrap();
        assert_eq!(grads.wrt(&x).ravel(), vec![3.0, 4.0]);
        assert_eq!(grads.wrt(&y).ravel(), vec![1.0, 1.5]);
    }

    #[test]
    fn broadcast_gradient_is_reduced() {
        let tape = Tape::default();
        let x = tape.add_variable(Tensor::new(&[2, 3], &[1., 2., 3., 4., 5., 6.]).unwrap());
        let b = tape.add_variable(Tensor::new(&[1, 3], &[0., 0., 0.]).unwrap());
        let z = x.add(&b).unwrap().mean();
        let grads = z.gradients().unwrap();
        assert_eq!(grads.wrt(&b).shape(), &[1, 3]);
        for g in grads.wrt(&b).ravel() {
            assert!(float_eq(g, 1.0 / 3.0, 1e-6));
        }
    }

    #[test]
    fn unused_variable_has_zero_gradient() {
        let tape = Tape::default();
        let x = tape.add_variable(Tensor::from([1.0]));
        let unused = tape.add_variable(Tensor::from([1.0, 2.0]));
        let z = x.square().mean();
        let grads = z.gradients().unwrap();
        assert!(grads.get(&unused).is_none());
        assert_eq!(grads.wrt(&unused).ravel(), vec![0.0, 0.0]);
        assert_eq!(grads.wrt(&x).ravel(), vec![2.0]);
    }

    #[test]
    fn matmul_relu_matches_finite_differences() {
        let w = Tensor::new(&[2, 2], &[0.5, -1.0, 1.5, 0.25]).unwrap();
        let inputs = Tensor::new(&[3, 2], &[1.0, 2.0, -1.0, 0.5, 0.3, -0.7]).unwrap();
        let loss = |w: &Tensor| {
            let tape = Tape::default();
            let x = tape.add_variable(inputs.clone());
            let w = tape.add_variable(w.clone());
            let z = x.matmul(&w).unwrap().relu().square().mean();
            let value = z.value().ravel()[0];
            value
        };

        let tape = Tape::default();
        let x = tape.add_variable(inputs.clone());
        let wv = tape.add_variable(w.clone());
        let z = x.matmul(&wv).unwrap().relu().square().mean();
        let grad = z.gradients().unwrap().wrt(&wv).ravel();

        let eps = 1e-3;
        for i in 0..4 {
            let mut plus = w.ravel();
            let mut minus = w.ravel();
            plus[i] += eps;
            minus[i] -= eps;
            let numerical = (loss(&Tensor::new(&[2, 2], &plus).unwrap())
                - loss(&Tensor::new(&[2, 2], &minus).unwrap()))
                / (2.0 * eps);
            assert!(
                float_eq(grad[i], numerical, 5e-3),
                "{i}: {} vs {numerical}",
                grad[i]
            );
        }
    }

    #[test]
    fn aggregate_gradient_scatters_to_members() {
        let incidence = Incidence::from_group_sizes(&[2, 1], 3, 4).unwrap();
        let tape = Tape::default();
        let x = tape.add_variable(Tensor::full(&[4, 2], 1.0));
        let pooled = x.aggregate(&incidence).unwrap();
        assert_eq!(pooled.value().ravel(), vec![2., 2., 1., 1., 0., 0.]);
        let z = pooled.mean();
        let g = z.gradients().unwrap().wrt(&x).ravel();
        let sixth = 1.0 / 6.0;
        assert_eq!(g, vec![sixth, sixth, sixth, sixth, sixth, sixth, 0.0, 0.0]);
    }

    #[test]
    fn clearing_the_tape() {
        let mut tape = Tape::default();
        {
            let x = tape.add_variable(Tensor::scalar(1.0));
            let _ = x.square();
        }
        assert_eq!(tape.len(), 2);
        tape.clear();
        assert!(tape.is_empty());
    }
}
