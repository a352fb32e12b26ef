//! Gradient-based optimizers.

use crate::tensor::{Tensor, TensorError};

/// Adaptive moment estimation.
#[derive(Debug, Clone)]
pub struct Adam {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    eps: f32,
    step: i32,
    moments: Vec<(Vec<f32>, Vec<f32>)>,
}

impl Adam {
    /// Create an optimizer with the usual decay rates `0.9` and `0.999`.
    pub fn new(learning_rate: f32) -> Self {
        Self {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            step: 0,
            moments: Vec::new(),
        }
    }

    /// The number of updates applied so far.
    pub fn steps(&self) -> i32 {
        self.step
    }

    /// Update every parameter in place given its gradient.
    ///
    /// Parameters must be given in the same order on every call.
    pub fn step(&mut self, params: Vec<&mut Tensor>, grads: &[Tensor]) -> Result<(), TensorError> {
        if params.len() != grads.len() {
            return Err(TensorError::IncompatibleShapes(
                vec![params.len()],
                vec![grads.len()],
            ));
        }
        if !self.moments.is_empty() && self.moments.len() != grads.len() {
            return Err(TensorError::IncompatibleShapes(
                vec![self.moments.len()],
                vec![grads.len()],
            ));
        }
        for (i, (param, grad)) in params.iter().zip(grads).enumerate() {
            let seen = self.moments.get(i).map_or(grad.elems(), |(m, _)| m.len());
            if param.shape() != grad.shape() || seen != grad.elems() {
                return Err(TensorError::IncompatibleShapes(
                    param.shape().to_vec(),
                    grad.shape().to_vec(),
                ));
            }
        }
        if self.moments.is_empty() {
            self.moments = grads
                .iter()
                .map(|g| (vec![0.0; g.elems()], vec![0.0; g.elems()]))
                .collect();
        }

        self.step += 1;
        let correction1 = 1.0 - self.beta1.powi(self.step);
        let correction2 = 1.0 - self.beta2.powi(self.step);
        for ((param, grad), (m, v)) in params.into_iter().zip(grads).zip(&mut self.moments) {
            let mut updated = param.ravel();
            for (((p, g), m), v) in updated
                .iter_mut()
                .zip(grad.as_slice())
                .zip(m.iter_mut())
                .zip(v.iter_mut())
            {
                *m = self.beta1 * *m + (1.0 - self.beta1) * g;
                *v = self.beta2 * *v + (1.0 - self.beta2) * g * g;
                let m_hat = *m / correction1;
                let v_hat = *v / correction2;
                *p -= self.learning_rate * m_hat / (v_hat.sqrt() + self.eps);
            }
            *param = Tensor::from_vec(grad.shape(), updated)?;
        }
        Ok(())
    }
}
