use crate::{error::Error, layer::Layer, optimizer::Sgd};
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

/// Training configuration.
///
/// Missing fields take their [default](TrainConfig::default) values, so a JSON file only needs
/// the fields it changes.
///
/// ```
/// # use anyhow::Result;
/// # fn main() -> Result<()> {
/// use convnet::config::TrainConfig;
///
/// let config = TrainConfig::from_json(r#"{ "num_epochs": 5 }"#)?;
/// assert_eq!(config.num_epochs, 5);
/// assert_eq!(config.batch_size, 256);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    /// Strength of the L2 penalty on the weights.
    pub l2_reg: f32,
    /// Standard deviation of the initial weights.
    pub param_scale: f32,
    /// SGD step size.
    pub learning_rate: f32,
    /// SGD momentum, also used as the dampening.
    pub momentum: f32,
    /// Examples per update.
    pub batch_size: usize,
    /// Number of passes over the training set.
    pub num_epochs: usize,
    /// Seed for the weights and the generated data.
    pub seed: u64,
    /// Total number of generated images.
    pub n_total: usize,
    /// Number of generated images used for training.
    pub n_train: usize,
    /// Shape of each input, [channels, height, width].
    pub input_shape: Vec<usize>,
    /// The layers, applied in order.
    pub layers: Vec<Layer>,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            l2_reg: 1.,
            param_scale: 0.9,
            learning_rate: 1e-3,
            momentum: 0.9,
            batch_size: 256,
            num_epochs: 50,
            seed: 0,
            n_total: 1000,
            n_train: 800,
            input_shape: vec![1, 28, 28],
            layers: vec![
                Layer::conv([5, 5], 1),
                Layer::max_pool([2, 2]),
                Layer::tanh(120),
                Layer::softmax(2),
            ],
        }
    }
}

impl TrainConfig {
    /// Parses and validates a JSON config.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }
    /// Reads, parses and validates a JSON config file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_json(&fs::read_to_string(path)?)
    }
    /// Checks that values are in range.
    ///
    /// **Errors**
    ///
    /// [`Error::InvalidConfig`] naming the first invalid field.
    pub fn validate(&self) -> Result<()> {
        let invalid = if self.batch_size == 0 {
            "batch_size must be positive"
        } else if self.n_train > self.n_total {
            "n_train must not exceed n_total"
        } else if !(self.learning_rate.is_finite() && self.learning_rate > 0.) {
            "learning_rate must be positive"
        } else if !(0.0..1.0).contains(&self.momentum) {
            "momentum must be in [0, 1)"
        } else if !(self.l2_reg.is_finite() && self.l2_reg >= 0.) {
            "l2_reg must not be negative"
        } else if !(self.param_scale.is_finite() && self.param_scale >= 0.) {
            "param_scale must not be negative"
        } else if self.layers.is_empty() {
            "layers must not be empty"
        } else {
            return Ok(());
        };
        bail!(Error::InvalidConfig(invalid.to_string()))
    }
    /// The optimizer described by the config.
    pub fn optimizer(&self) -> Sgd {
        Sgd::builder()
            .learning_rate(self.learning_rate)
            .momentum(self.momentum)
            .dampening(self.momentum)
            .build()
    }
}
