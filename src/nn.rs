//! Neural network building blocks and the permutation-invariant set model.

use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::{
    autodiff::{Tape, Var},
    batch::PaddedBatch,
    tensor::{Incidence, Tensor, TensorError},
};

/// A fully-connected layer computing `x · weight + bias`.
#[derive(Debug, Clone)]
pub struct Dense {
    /// Weights of shape `[input, output]`.
    pub weight: Tensor,
    /// Bias of shape `[1, output]`.
    pub bias: Tensor,
}

impl Dense {
    /// Create a layer with weights drawn from `N(0, 1/input)` and a zero bias.
    pub fn new<R>(rng: &mut R, input_size: usize, output_size: usize) -> Self
    where
        R: Rng,
    {
        let std = 1.0 / (input_size.max(1) as f32).sqrt();
        let distribution = Normal::new(0.0, std).expect("standard deviation is positive");
        let weights = (0..input_size * output_size)
            .map(|_| distribution.sample(rng))
            .collect();
        Self {
            weight: Tensor::from_vec(&[input_size, output_size], weights)
                .expect("weights fill the layer"),
            bias: Tensor::zeros(&[1, output_size]),
        }
    }

    /// The number of outputs.
    pub fn output_size(&self) -> usize {
        self.bias.elems()
    }

    /// Record the layer's parameters on the tape and apply the layer to `input`.
    fn call<'t>(
        &self,
        tape: &'t Tape,
        input: &Var<'t>,
        params: &mut Vec<Var<'t>>,
    ) -> Result<Var<'t>, TensorError> {
        let weight = tape.add_variable(self.weight.clone());
        let bias = tape.add_variable(self.bias.clone());
        let output = input.matmul(&weight)?.add(&bias)?;
        params.push(weight);
        params.push(bias);
        Ok(output)
    }

    fn apply(&self, input: &Tensor) -> Result<Tensor, TensorError> {
        input.matmul(&self.weight)?.add(&self.bias)
    }
}

/// A multi-layer perceptron: hidden layers followed by ReLU, then an optional linear output layer.
#[derive(Debug, Clone)]
pub struct Mlp {
    hidden: Vec<Dense>,
    output: Option<Dense>,
}

impl Mlp {
    /// Create an MLP with `depth` hidden layers of `width` units.
    pub fn new<R>(
        rng: &mut R,
        input_size: usize,
        width: usize,
        depth: usize,
        output_size: Option<usize>,
    ) -> Self
    where
        R: Rng,
    {
        let mut hidden = Vec::with_capacity(depth);
        let mut size = input_size;
        for _ in 0..depth {
            hidden.push(Dense::new(rng, size, width));
            size = width;
        }
        let output = output_size.map(|n| Dense::new(rng, size, n));
        Self { hidden, output }
    }

    /// The number of outputs.
    pub fn output_size(&self, input_size: usize) -> usize {
        self.output
            .as_ref()
            .or(self.hidden.last())
            .map_or(input_size, Dense::output_size)
    }

    fn layers(&self) -> impl Iterator<Item = &Dense> {
        self.hidden.iter().chain(self.output.as_ref())
    }

    fn layers_mut(&mut self) -> impl Iterator<Item = &mut Dense> {
        self.hidden.iter_mut().chain(self.output.as_mut())
    }

    /// Applies the MLP to the given input, recording every parameter in `params`.
    pub fn call<'t>(
        &self,
        tape: &'t Tape,
        input: &Var<'t>,
        params: &mut Vec<Var<'t>>,
    ) -> Result<Var<'t>, TensorError> {
        let mut x = input.clone();
        for layer in &self.hidden {
            x = layer.call(tape, &x, params)?.relu();
        }
        if let Some(layer) = &self.output {
            x = layer.call(tape, &x, params)?;
        }
        Ok(x)
    }

    /// Applies the MLP without recording anything.
    pub fn apply(&self, input: &Tensor) -> Result<Tensor, TensorError> {
        let mut x = input.clone();
        for layer in &self.hidden {
            x = layer.apply(&x)?.map(|v| v.max(0.0));
        }
        if let Some(layer) = &self.output {
            x = layer.apply(&x)?;
        }
        Ok(x)
    }
}

/// Widths and depths of the encoder and decoder of a [`DeepSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Architecture {
    /// Units per encoder layer.
    pub phi_width: usize,
    /// Number of encoder layers.
    pub phi_depth: usize,
    /// Units per decoder layer.
    pub rho_width: usize,
    /// Number of decoder layers.
    pub rho_depth: usize,
}

/// The result of a forward pass recorded on a tape.
#[derive(Debug)]
pub struct Forward<'t> {
    /// One prediction per target slot, shape `[max_sets, 1]`.
    pub output: Var<'t>,
    /// The model parameters, in the order of [`DeepSet::parameters`].
    pub parameters: Vec<Var<'t>>,
}

/// Permutation-invariant model: `rho(Σ_{x ∈ set} phi(x))`.
#[derive(Debug, Clone)]
pub struct DeepSet {
    phi: Mlp,
    rho: Mlp,
}

impl DeepSet {
    /// Create a model for elements of dimension `dim`.
    pub fn new<R>(rng: &mut R, dim: usize, architecture: &Architecture) -> Self
    where
        R: Rng,
    {
        let phi = Mlp::new(
            rng,
            dim,
            architecture.phi_width,
            architecture.phi_depth,
            None,
        );
        let embedding = phi.output_size(dim);
        let rho = Mlp::new(
            rng,
            embedding,
            architecture.rho_width,
            architecture.rho_depth,
            Some(1),
        );
        Self { phi, rho }
    }

    /// Returns all parameters of the model.
    pub fn parameters(&self) -> Vec<&Tensor> {
        self.phi
            .layers()
            .chain(self.rho.layers())
            .flat_map(|l| [&l.weight, &l.bias])
            .collect()
    }

    /// Returns all parameters of the model for updating.
    pub fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        self.phi
            .layers_mut()
            .chain(self.rho.layers_mut())
            .flat_map(|l| [&mut l.weight, &mut l.bias])
            .collect()
    }

    /// The number of scalar parameters.
    pub fn parameter_count(&self) -> usize {
        self.parameters().iter().map(|t| t.elems()).sum()
    }

    /// Predict every target slot of `batch`, recording the computation on `tape`.
    pub fn forward<'t>(
        &self,
        tape: &'t Tape,
        batch: &PaddedBatch,
    ) -> Result<Forward<'t>, TensorError> {
        let mut parameters = Vec::new();
        let elements = tape.add_variable(batch.elements.clone());
        let embedded = self.phi.call(tape, &elements, &mut parameters)?;
        let pooled = embedded.aggregate(&batch.incidence)?;
        let output = self.rho.call(tape, &pooled, &mut parameters)?;
        Ok(Forward { output, parameters })
    }

    /// The pooled embedding of every group of `incidence`.
    pub fn embed(&self, elements: &Tensor, incidence: &Incidence) -> Result<Tensor, TensorError> {
        incidence.matmul(&self.phi.apply(elements)?)
    }

    /// Predict every group of `incidence` without recording anything.
    pub fn predict(&self, elements: &Tensor, incidence: &Incidence) -> Result<Tensor, TensorError> {
        self.rho.apply(&self.embed(elements, incidence)?)
    }

    /// The masked mean squared error on `batch`, without recording anything.
    pub fn evaluate(&self, batch: &PaddedBatch) -> Result<f32, TensorError> {
        let prediction = self.predict(&batch.elements, &batch.incidence)?;
        let squared = batch.targets.sub(&prediction)?.map(|d| d * d);
        Ok(batch.mask.mul(&squared)?.mean())
    }
}

/// The mean over all target slots of `mask * (targets - prediction)²`.
///
/// Padded slots are zeroed by the mask but still count in the mean.
pub fn masked_mse<'t>(
    tape: &'t Tape,
    prediction: &Var<'t>,
    batch: &PaddedBatch,
) -> Result<Var<'t>, TensorError> {
    let targets = tape.add_variable(batch.targets.clone());
    let mask = tape.add_variable(batch.mask.clone());
    Ok(mask.mul(&targets.sub(prediction)?.square())?.mean())
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;
    use crate::{dataset::SetSample, tensor::Tensor};

    fn architecture() -> Architecture {
        Architecture {
            phi_width: 8,
            phi_depth: 2,
            rho_width: 4,
            rho_depth: 1,
        }
    }

    fn samples() -> Vec<SetSample> {
        vec![
            SetSample::new(Tensor::new(&[3, 2], &[1., 0., 0., 1., 1., 1.]).unwrap()).unwrap(),
            SetSample::new(Tensor::new(&[2, 2], &[0.5, -1., 2., 0.25]).unwrap()).unwrap(),
        ]
    }

    #[test]
    fn parameter_layout() {
        let model = DeepSet::new(&mut StdRng::seed_from_u64(0), 2, &architecture());
        let shapes: Vec<_> = model
            .parameters()
            .iter()
            .map(|p| p.shape().to_vec())
            .collect();
        assert_eq!(
            shapes,
            vec![
                vec![2, 8],
                vec![1, 8],
                vec![8, 8],
                vec![1, 8],
                vec![8, 4],
                vec![1, 4],
                vec![4, 1],
                vec![1, 1],
            ]
        );
        assert_eq!(model.parameter_count(), 16 + 8 + 64 + 8 + 32 + 4 + 4 + 1);
    }

    #[test]
    fn forward_matches_untraced_prediction() {
        let model = DeepSet::new(&mut StdRng::seed_from_u64(0), 2, &architecture());
        let batch = PaddedBatch::new(&samples(), 8, 3).unwrap();
        let tape = Tape::default();
        let forward = model.forward(&tape, &batch).unwrap();
        let predicted = model.predict(&batch.elements, &batch.incidence).unwrap();
        assert_eq!(forward.output.value().shape(), &[3, 1]);
        assert_eq!(forward.output.value(), &predicted);
        assert_eq!(forward.parameters.len(), model.parameters().len());
    }

    #[test]
    fn loss_ignores_padded_targets() {
        let model = DeepSet::new(&mut StdRng::seed_from_u64(0), 2, &architecture());
        let batch = PaddedBatch::new(&samples(), 8, 4).unwrap();
        let mut tampered = batch.clone();
        tampered.targets = Tensor::new(
            &[4, 1],
            &[batch.targets.ravel()[0], batch.targets.ravel()[1], 100.0, -7.0],
        )
        .unwrap();

        let tape = Tape::default();
        let pred = model.forward(&tape, &batch).unwrap().output;
        let loss = masked_mse(&tape, &pred, &batch).unwrap();
        let tampered_loss = masked_mse(&tape, &pred, &tampered).unwrap();
        assert_eq!(loss.value(), tampered_loss.value());
        assert_eq!(
            model.evaluate(&batch).unwrap(),
            model.evaluate(&tampered).unwrap()
        );
        assert!((loss.value().item().unwrap() - model.evaluate(&batch).unwrap()).abs() < 1e-6);
    }

    #[test]
    fn padding_rows_pool_to_zero() {
        let model = DeepSet::new(&mut StdRng::seed_from_u64(0), 2, &architecture());
        let batch = PaddedBatch::new(&samples(), 8, 4).unwrap();
        let pooled = model.embed(&batch.elements, &batch.incidence).unwrap();
        assert!(pooled.row(2).unwrap().iter().all(|x| *x == 0.0));
        assert!(pooled.row(3).unwrap().iter().all(|x| *x == 0.0));
    }
}
