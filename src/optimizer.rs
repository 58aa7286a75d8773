use anyhow::{ensure, Result};
use ndarray::{Array1, ArrayView1, ArrayViewMut1, Zip};
use serde::{Deserialize, Serialize};

/// Optimizer builders.
pub mod builder {
    use super::*;

    /// Builder for creating a [`Sgd`].
    #[derive(Debug, Clone, Copy)]
    pub struct SgdBuilder {
        learning_rate: f32,
        momentum: f32,
        dampening: Option<f32>,
    }

    impl SgdBuilder {
        pub(super) fn new() -> Self {
            Self {
                learning_rate: 0.01,
                momentum: 0.,
                dampening: None,
            }
        }
        /// Learning rate. Default is 0.01.
        pub fn learning_rate(self, learning_rate: f32) -> Self {
            Self {
                learning_rate,
                ..self
            }
        }
        /// Momentum. Default is 0.
        pub fn momentum(self, momentum: f32) -> Self {
            Self { momentum, ..self }
        }
        /// Dampening of the gradient added to the velocity. Defaults to the momentum.
        pub fn dampening(self, dampening: f32) -> Self {
            Self {
                dampening: Some(dampening),
                ..self
            }
        }
        /// Builds the optimizer.
        pub fn build(self) -> Sgd {
            let Self {
                learning_rate,
                momentum,
                dampening,
            } = self;
            Sgd {
                learning_rate,
                momentum,
                dampening: dampening.unwrap_or(momentum),
                velocity: None,
            }
        }
    }
}
use builder::SgdBuilder;

/// Stochastic Gradient Descent with momentum.
///
/// Each update computes
///
/// - `velocity = momentum * velocity + (1 - dampening) * grad`
/// - `weights -= learning_rate * velocity`
///
/// The velocity starts at zero. With the default dampening equal to the momentum it is an
/// exponential moving average of the gradient.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sgd {
    learning_rate: f32,
    momentum: f32,
    dampening: f32,
    #[serde(default)]
    velocity: Option<Array1<f32>>,
}

impl Sgd {
    /// A builder for creating a [`Sgd`].
    pub fn builder() -> SgdBuilder {
        SgdBuilder::new()
    }
    /// The learning rate.
    pub fn learning_rate(&self) -> f32 {
        self.learning_rate
    }
    /// The momentum.
    pub fn momentum(&self) -> f32 {
        self.momentum
    }
    /// The dampening.
    pub fn dampening(&self) -> f32 {
        self.dampening
    }
    /// The velocity, if [`.update()`](Sgd::update) has been called.
    pub fn velocity(&self) -> Option<ArrayView1<f32>> {
        self.velocity.as_ref().map(Array1::view)
    }
    /// Updates `weights` inplace with `grad`.
    ///
    /// **Errors**
    ///
    /// Fails if `grad` or the stored velocity do not match `weights`.
    pub fn update(&mut self, mut weights: ArrayViewMut1<f32>, grad: ArrayView1<f32>) -> Result<()> {
        ensure!(
            grad.len() == weights.len(),
            "Gradient length {} does not match weights {}!",
            grad.len(),
            weights.len()
        );
        let (learning_rate, momentum, dampening) =
            (self.learning_rate, self.momentum, self.dampening);
        let velocity = self
            .velocity
            .get_or_insert_with(|| Array1::zeros(weights.len()));
        ensure!(
            velocity.len() == weights.len(),
            "Velocity length {} does not match weights {}!",
            velocity.len(),
            weights.len()
        );
        Zip::from(&mut weights)
            .and(&grad)
            .and(velocity)
            .for_each(|w, g, v| {
                *v = momentum * *v + (1. - dampening) * *g;
                *w -= learning_rate * *v;
            });
        Ok(())
    }
    /// Clears the velocity.
    pub fn reset(&mut self) {
        self.velocity = None;
    }
}
