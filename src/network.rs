use crate::{
    autograd::{value_and_grad, Variable0, Variable1, VariableD},
    error::Error,
    functional::argmax_rows,
    index::ParameterIndex,
    layer::{BuiltLayer, Layer},
};
use anyhow::{bail, ensure, Result};
use ndarray::{linalg::Dot, Array1, Array2, ArrayView1, ArrayView2, ArrayViewD, Ix1, Ix2, Zip};
use rand::Rng;
use rand_distr::StandardNormal;

/// A sequence of layers sharing one flat parameter vector.
///
/// Each layer reads its slice of the vector, registered under `"layer{i}_{kind}"`, through
/// its own [`ParameterIndex`].
///
/// The loss is the negative log posterior with a gaussian prior:
///
/// `l2_reg * w·w - sum(predictions(w, x) * targets)`
#[derive(Debug, Clone)]
pub struct Network {
    input_shape: Vec<usize>,
    layers: Vec<BuiltLayer>,
    index: ParameterIndex,
    l2_reg: f32,
}

impl Network {
    /// Assembles `layers` for inputs with `input_shape`.
    ///
    /// The input shape does not include the batch dimension.
    ///
    /// **Errors**
    ///
    /// Fails if any layer can not be built for the shape produced by the previous layer.
    pub fn new(
        input_shape: impl Into<Vec<usize>>,
        layers: impl IntoIterator<Item = Layer>,
        l2_reg: f32,
    ) -> Result<Self> {
        let input_shape = input_shape.into();
        let mut shape = input_shape.clone();
        let mut index = ParameterIndex::default();
        let mut built = Vec::new();
        for (i, layer) in layers.into_iter().enumerate() {
            let layer = layer.build_weights_dict(&shape)?;
            tracing::debug!(
                "layer{i}: {:?} {:?} -> {:?} ({} weights)",
                layer.layer(),
                layer.input_shape(),
                layer.output_shape(),
                layer.num_weights(),
            );
            index.add_weights(format!("layer{i}_{}", layer.layer().kind()), [layer.num_weights()])?;
            shape = layer.output_shape().to_vec();
            built.push(layer);
        }
        ensure!(!built.is_empty(), "Network has no layers!");
        tracing::info!("Total number of weights in the network: {}", index.len());
        Ok(Self {
            input_shape,
            layers: built,
            index,
            l2_reg,
        })
    }
    /// The assembled layers.
    pub fn layers(&self) -> &[BuiltLayer] {
        &self.layers
    }
    /// The index of each layer's slice of the parameters.
    pub fn index(&self) -> &ParameterIndex {
        &self.index
    }
    /// The total number of parameters.
    pub fn num_weights(&self) -> usize {
        self.index.len()
    }
    /// The input shape, excluding the batch dimension.
    pub fn input_shape(&self) -> &[usize] {
        &self.input_shape
    }
    /// The output shape, excluding the batch dimension.
    pub fn output_shape(&self) -> &[usize] {
        self.layers
            .last()
            .map(BuiltLayer::output_shape)
            .unwrap_or(self.input_shape.as_slice())
    }
    /// The L2 regularization strength.
    pub fn l2_reg(&self) -> f32 {
        self.l2_reg
    }
    /// Draws initial parameters from a standard normal scaled by `param_scale`.
    pub fn init_weights<R: Rng>(&self, rng: &mut R, param_scale: f32) -> Array1<f32> {
        Array1::from_shape_simple_fn(self.num_weights(), || {
            param_scale * rng.sample::<f32, _>(StandardNormal)
        })
    }
    /// The outputs of the last layer for a batch of `inputs`.
    ///
    /// **Errors**
    ///
    /// - [`Error::InputShape`] if the shape of each input is not
    ///   [`.input_shape()`](Network::input_shape).
    /// - [`Error::ParameterLength`] if `weights` is not
    ///   [`.num_weights()`](Network::num_weights) long.
    pub fn predictions(&self, weights: &Variable1, inputs: ArrayViewD<f32>) -> Result<VariableD> {
        if inputs.shape().get(1..) != Some(self.input_shape.as_slice()) {
            bail!(Error::InputShape {
                expected: self.input_shape.clone(),
                found: inputs.shape().get(1..).unwrap_or_default().to_vec(),
            });
        }
        let mut x = VariableD::from(inputs.to_shared());
        for (layer, (name, _, _)) in self.layers.iter().zip(self.index.blocks()) {
            let layer_weights = self.index.get(weights, name)?.into_dimensionality::<Ix1>()?;
            x = layer.forward_pass(x, &layer_weights)?;
        }
        Ok(x)
    }
    /// Like [`.predictions()`](Network::predictions) without autograd.
    ///
    /// The outputs are [batch, classes].
    pub fn predict(
        &self,
        weights: ArrayView1<f32>,
        inputs: ArrayViewD<f32>,
    ) -> Result<Array2<f32>> {
        let outputs = self.predictions(&Variable1::from(weights.to_shared()), inputs)?;
        Ok(outputs.into_value().into_dimensionality::<Ix2>()?.into_owned())
    }
    /// The loss for a batch of `inputs` with one hot `targets`.
    pub fn loss(
        &self,
        weights: &Variable1,
        inputs: ArrayViewD<f32>,
        targets: ArrayView2<f32>,
    ) -> Result<Variable0> {
        let log_prior = weights.dot(weights)?.scale(-self.l2_reg);
        let predictions = self
            .predictions(weights, inputs)?
            .into_dimensionality::<Ix2>()?;
        let log_lik = predictions.mul_const(targets.to_shared())?.sum();
        Ok(log_prior.add(&log_lik)?.scale(-1.))
    }
    /// The loss and its gradient with respect to `weights`.
    pub fn loss_grad(
        &self,
        weights: ArrayView1<f32>,
        inputs: ArrayViewD<f32>,
        targets: ArrayView2<f32>,
    ) -> Result<(f32, Array1<f32>)> {
        value_and_grad(|w| self.loss(&w, inputs, targets), weights)
    }
    /// The fraction of `inputs` where the predicted class is not the target class.
    ///
    /// Classes are the argmax of each row, the first max wins ties.
    pub fn frac_err(
        &self,
        weights: ArrayView1<f32>,
        inputs: ArrayViewD<f32>,
        targets: ArrayView2<f32>,
    ) -> Result<f32> {
        let predictions = self.predict(weights, inputs)?;
        ensure!(
            predictions.dim() == targets.dim(),
            "Predictions {:?} do not match targets {:?}!",
            predictions.shape(),
            targets.shape()
        );
        if predictions.is_empty() {
            return Ok(0.);
        }
        let errors = Zip::from(&argmax_rows(predictions.view()))
            .and(&argmax_rows(targets))
            .fold(0usize, |n, p, t| n + (p != t) as usize);
        Ok(errors as f32 / predictions.nrows() as f32)
    }
}
