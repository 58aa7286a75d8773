use crate::{
    autograd::{Variable1, VariableD},
    error::Error,
    functional::{conv2, log_softmax, max_pool2},
    index::ParameterIndex,
};
use anyhow::{bail, Result};
use ndarray::{linalg::Dot, Ix2, Ix4};
use serde::{Deserialize, Serialize};

/// Activation of a [`Layer::Dense`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Activation {
    /// Elementwise tanh.
    Tanh,
    /// Normalized log probabilities.
    LogSoftmax,
}

/// Layer description.
///
/// Layers do not own parameters. [`.build_weights_dict()`](Layer::build_weights_dict) computes
/// the shapes of the parameters for an input shape, which are then read from a flat vector
/// with [`BuiltLayer::forward_pass()`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Layer {
    /// Valid 2d convolution with a bias per filter.
    Conv {
        /// The kernel shape [kh, kw].
        kernel: [usize; 2],
        /// The number of output channels.
        filters: usize,
    },
    /// Max pooling over non overlapping tiles.
    MaxPool {
        /// The tile shape [ph, pw].
        pool: [usize; 2],
    },
    /// Fully connected layer.
    Dense {
        /// The number of outputs.
        size: usize,
        /// The activation.
        activation: Activation,
    },
}

impl Layer {
    /// A [`Layer::Conv`].
    pub fn conv(kernel: [usize; 2], filters: usize) -> Self {
        Self::Conv { kernel, filters }
    }
    /// A [`Layer::MaxPool`].
    pub fn max_pool(pool: [usize; 2]) -> Self {
        Self::MaxPool { pool }
    }
    /// A [`Layer::Dense`] with [`Activation::Tanh`].
    pub fn tanh(size: usize) -> Self {
        Self::Dense {
            size,
            activation: Activation::Tanh,
        }
    }
    /// A [`Layer::Dense`] with [`Activation::LogSoftmax`].
    pub fn softmax(size: usize) -> Self {
        Self::Dense {
            size,
            activation: Activation::LogSoftmax,
        }
    }
    /// A short name for the layer kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Conv { .. } => "conv",
            Self::MaxPool { .. } => "max_pool",
            Self::Dense {
                activation: Activation::Tanh,
                ..
            } => "tanh",
            Self::Dense {
                activation: Activation::LogSoftmax,
                ..
            } => "softmax",
        }
    }
    /// Assembles the layer for inputs with `input_shape`.
    ///
    /// The input shape does not include the batch dimension. Conv and pool layers expect
    /// [channels, height, width].
    ///
    /// **Errors**
    /// - Conv and pool layers fail if the input is not 3 dimensional.
    /// - [`Error::KernelShape`] if the kernel is larger than the input.
    /// - [`Error::PoolShape`] if the pool does not tile the input.
    pub fn build_weights_dict(&self, input_shape: &[usize]) -> Result<BuiltLayer> {
        let mut index = ParameterIndex::default();
        let output_shape = match *self {
            Self::Conv { kernel, filters } => {
                let [c, h, w] = image_shape(input_shape)?;
                let [kh, kw] = kernel;
                if kh == 0 || kw == 0 || kh > h || kw > w {
                    bail!(Error::KernelShape {
                        kernel,
                        input: input_shape.to_vec(),
                    });
                }
                index.add_weights("params", [c, filters, kh, kw])?;
                index.add_weights("biases", [1, filters, 1, 1])?;
                vec![filters, h - kh + 1, w - kw + 1]
            }
            Self::MaxPool { pool } => {
                let [c, h, w] = image_shape(input_shape)?;
                let [ph, pw] = pool;
                if ph == 0 || pw == 0 || h % ph != 0 || w % pw != 0 {
                    bail!(Error::PoolShape {
                        pool,
                        input: input_shape.to_vec(),
                    });
                }
                vec![c, h / ph, w / pw]
            }
            Self::Dense { size, .. } => {
                index.add_weights("params", [input_shape.iter().product(), size])?;
                index.add_weights("biases", [size])?;
                vec![size]
            }
        };
        Ok(BuiltLayer {
            layer: *self,
            index,
            input_shape: input_shape.to_vec(),
            output_shape,
        })
    }
}

fn image_shape(input_shape: &[usize]) -> Result<[usize; 3]> {
    match *input_shape {
        [c, h, w] => Ok([c, h, w]),
        _ => bail!("Expected [channels, height, width] input, found {input_shape:?}!"),
    }
}

/// An assembled [`Layer`].
#[derive(Debug, Clone)]
pub struct BuiltLayer {
    layer: Layer,
    index: ParameterIndex,
    input_shape: Vec<usize>,
    output_shape: Vec<usize>,
}

impl BuiltLayer {
    /// The layer.
    pub fn layer(&self) -> &Layer {
        &self.layer
    }
    /// The index of the layer parameters.
    ///
    /// Offsets are relative to the layer's slice of the network parameters.
    pub fn index(&self) -> &ParameterIndex {
        &self.index
    }
    /// The number of parameters.
    pub fn num_weights(&self) -> usize {
        self.index.len()
    }
    /// The input shape, excluding the batch dimension.
    pub fn input_shape(&self) -> &[usize] {
        &self.input_shape
    }
    /// The output shape, excluding the batch dimension.
    pub fn output_shape(&self) -> &[usize] {
        &self.output_shape
    }
    /// Computes the output for a batch of `inputs` with the layer parameters `weights`.
    ///
    /// `weights` must have length [`.num_weights()`](BuiltLayer::num_weights).
    pub fn forward_pass(&self, inputs: VariableD, weights: &Variable1) -> Result<VariableD> {
        if inputs.shape().get(1..) != Some(self.input_shape.as_slice()) {
            bail!(Error::InputShape {
                expected: self.input_shape.clone(),
                found: inputs.shape().get(1..).unwrap_or_default().to_vec(),
            });
        }
        match self.layer {
            Layer::Conv { .. } => {
                let params = self
                    .index
                    .get(weights, "params")?
                    .into_dimensionality::<Ix4>()?;
                let biases = self.index.get(weights, "biases")?;
                let inputs = inputs.into_dimensionality::<Ix4>()?;
                Ok(conv2(&inputs, &params)?.add(&biases)?.into_dyn())
            }
            Layer::MaxPool { pool } => {
                let inputs = inputs.into_dimensionality::<Ix4>()?;
                Ok(max_pool2(&inputs, pool)?.into_dyn())
            }
            Layer::Dense { activation, .. } => {
                let params = self
                    .index
                    .get(weights, "params")?
                    .into_dimensionality::<Ix2>()?;
                let biases = self.index.get(weights, "biases")?;
                let x = inputs.flatten()?.dot(&params)?.add(&biases)?;
                let y = match activation {
                    Activation::Tanh => x.tanh(),
                    Activation::LogSoftmax => log_softmax(&x),
                };
                Ok(y.into_dyn())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::{array, s, Array, Array1, ArrayD, IxDyn};

    fn forward(
        layer: &BuiltLayer,
        inputs: ArrayD<f32>,
        weights: Array1<f32>,
    ) -> Result<ArrayD<f32>> {
        Ok(layer
            .forward_pass(VariableD::from(inputs), &Variable1::from(weights))?
            .into_value()
            .into_owned())
    }

    #[test]
    fn conv_shapes() -> Result<()> {
        let layer = Layer::conv([5, 5], 6).build_weights_dict(&[1, 28, 28])?;
        assert_eq!(layer.output_shape(), &[6, 24, 24]);
        assert_eq!(layer.num_weights(), 6 * 25 + 6);
        assert_eq!(layer.index().shape("params")?, &[1, 6, 5, 5]);
        assert_eq!(layer.index().shape("biases")?, &[1, 6, 1, 1]);
        Ok(())
    }

    #[test]
    fn conv_kernel_too_large() {
        let error = Layer::conv([5, 3], 1)
            .build_weights_dict(&[1, 4, 4])
            .unwrap_err();
        assert_eq!(
            error.downcast_ref::<Error>(),
            Some(&Error::KernelShape {
                kernel: [5, 3],
                input: vec![1, 4, 4],
            })
        );
    }

    #[test]
    fn conv_requires_image_input() {
        assert!(Layer::conv([1, 1], 1).build_weights_dict(&[10]).is_err());
        assert!(Layer::max_pool([1, 1]).build_weights_dict(&[1, 10]).is_err());
    }

    #[test]
    fn conv_adds_bias_per_filter() -> Result<()> {
        // 1x1 kernel: output = w[c, f] * x + b[f]
        let layer = Layer::conv([1, 1], 2).build_weights_dict(&[1, 2, 2])?;
        let inputs = Array::from_shape_vec(IxDyn(&[1, 1, 2, 2]), vec![1f32, 2., 3., 4.])?;
        let weights = array![2f32, -1., 0.5, 10.];
        let outputs = forward(&layer, inputs, weights)?;
        assert_eq!(outputs.shape(), &[1, 2, 2, 2]);
        assert_eq!(
            outputs.iter().copied().collect::<Vec<_>>(),
            vec![2.5, 4.5, 6.5, 8.5, 9., 8., 7., 6.]
        );
        Ok(())
    }

    #[test]
    fn max_pool_shapes() -> Result<()> {
        let layer = Layer::max_pool([2, 2]).build_weights_dict(&[6, 24, 24])?;
        assert_eq!(layer.output_shape(), &[6, 12, 12]);
        assert_eq!(layer.num_weights(), 0);
        Ok(())
    }

    #[test]
    fn max_pool_requires_tiling() {
        let error = Layer::max_pool([2, 3])
            .build_weights_dict(&[1, 4, 4])
            .unwrap_err();
        assert_eq!(
            error.downcast_ref::<Error>(),
            Some(&Error::PoolShape {
                pool: [2, 3],
                input: vec![1, 4, 4],
            })
        );
    }

    #[test]
    fn max_pool_forward() -> Result<()> {
        let layer = Layer::max_pool([2, 2]).build_weights_dict(&[1, 2, 4])?;
        let inputs = Array::from_shape_vec(
            IxDyn(&[1, 1, 2, 4]),
            vec![1f32, 5., -1., -2., 3., 2., -3., -4.],
        )?;
        let outputs = forward(&layer, inputs, Array1::zeros(0))?;
        assert_eq!(outputs.shape(), &[1, 1, 1, 2]);
        assert_eq!(outputs.as_slice(), Some([5f32, -1.].as_ref()));
        Ok(())
    }

    #[test]
    fn dense_shapes() -> Result<()> {
        let layer = Layer::tanh(120).build_weights_dict(&[6, 12, 12])?;
        assert_eq!(layer.output_shape(), &[120]);
        assert_eq!(layer.num_weights(), 864 * 120 + 120);
        let layer = Layer::softmax(2).build_weights_dict(&[120])?;
        assert_eq!(layer.output_shape(), &[2]);
        assert_eq!(layer.num_weights(), 242);
        Ok(())
    }

    #[test]
    fn dense_tanh_forward() -> Result<()> {
        let layer = Layer::tanh(2).build_weights_dict(&[1, 1, 3])?;
        let inputs =
            Array::from_shape_vec(IxDyn(&[2, 1, 1, 3]), vec![1f32, 0., -1., 0.5, 0.5, 0.5])?;
        let mut weights = Array1::zeros(layer.num_weights());
        weights
            .slice_mut(s![..6])
            .assign(&array![0.1f32, 0.2, 0.3, 0.4, 0.5, 0.6]);
        weights.slice_mut(s![6..]).assign(&array![0.0f32, -0.1]);
        let outputs = forward(&layer, inputs, weights)?;
        assert_eq!(outputs.shape(), &[2, 2]);
        let expected = [
            (0.1f32 - 0.5).tanh(),
            (0.2f32 - 0.6 - 0.1).tanh(),
            (0.5f32 * 0.9).tanh(),
            (0.5f32 * 1.2 - 0.1).tanh(),
        ];
        for (y, y_true) in outputs.iter().zip(expected) {
            assert_relative_eq!(*y, y_true, epsilon = 1e-6);
        }
        Ok(())
    }

    #[test]
    fn softmax_rows_normalize() -> Result<()> {
        let layer = Layer::softmax(3).build_weights_dict(&[2])?;
        let inputs = Array::from_shape_vec(IxDyn(&[2, 2]), vec![1000f32, -1000., 0., 0.])?;
        let weights = Array::range(0f32, layer.num_weights() as f32, 1.);
        let outputs = forward(&layer, inputs, weights)?;
        for row in outputs.outer_iter() {
            assert!(row.iter().all(|x| x.is_finite()));
            assert_relative_eq!(row.mapv(f32::exp).sum(), 1., epsilon = 1e-5);
        }
        Ok(())
    }

    #[test]
    fn forward_rejects_input_shape() -> Result<()> {
        let layer = Layer::tanh(2).build_weights_dict(&[3])?;
        let weights = Array1::zeros(layer.num_weights());
        let error = forward(&layer, ArrayD::zeros(IxDyn(&[4, 2])), weights).unwrap_err();
        assert_eq!(
            error.downcast_ref::<Error>(),
            Some(&Error::InputShape {
                expected: vec![3],
                found: vec![2],
            })
        );
        Ok(())
    }

    #[test]
    fn layer_serde() -> Result<()> {
        let layers = vec![
            Layer::conv([5, 5], 6),
            Layer::max_pool([2, 2]),
            Layer::tanh(120),
            Layer::softmax(2),
        ];
        let json = serde_json::to_string(&layers)?;
        assert_eq!(serde_json::from_str::<Vec<Layer>>(&json)?, layers);
        Ok(())
    }
}
