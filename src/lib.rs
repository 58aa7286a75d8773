/*!
# Example
A LeNet style network, trained with momentum SGD on generated images of squares.
```no_run
# use anyhow::Result;
# fn main() -> Result<()> {
use convnet::{
    dataset::squares,
    layer::Layer,
    network::Network,
    optimizer::Sgd,
    train::{report_header, Trainer},
};
use rand::{rngs::StdRng, SeedableRng};

let mut rng = StdRng::seed_from_u64(0);
let network = Network::new(
    [1, 28, 28],
    [
        Layer::conv([5, 5], 1),
        Layer::max_pool([2, 2]),
        Layer::tanh(120),
        Layer::softmax(2),
    ],
    1.,
)?;
let weights = network.init_weights(&mut rng, 0.9);
let dataset = squares::generate(1000, 800, &mut rng)?;
let optimizer = Sgd::builder().learning_rate(1e-3).momentum(0.9).build();
let mut trainer = Trainer::new(network, weights, optimizer, 256)?;
println!("{}", report_header());
trainer.fit(&dataset, 50, |stats| println!("{stats}"))?;
# Ok(())
# }
```
*/
#![warn(missing_docs)]

/// Reverse mode autograd.
pub mod autograd;
/// Training configuration.
pub mod config;
/// Datasets.
pub mod dataset;
/// Errors.
pub mod error;
/// Convolution, pooling, and softmax.
pub mod functional;
/// Parameter blocks of a flat vector.
pub mod index;
/// Layers.
pub mod layer;
/// Networks.
pub mod network;
/// Optimizers.
pub mod optimizer;
/// Training.
pub mod train;
