use anyhow::Result;
use approx::assert_relative_eq;
use convnet::{
    config::TrainConfig,
    dataset::{squares, Dataset},
    layer::Layer,
    network::Network,
    optimizer::Sgd,
    train::{make_batches, Trainer},
};
use ndarray::Array1;
use rand::{rngs::StdRng, SeedableRng};

fn setup(seed: u64) -> Result<(Network, Array1<f32>, Dataset)> {
    let mut rng = StdRng::seed_from_u64(seed);
    let network = Network::new(
        [1, 28, 28],
        [
            Layer::conv([5, 5], 2),
            Layer::max_pool([2, 2]),
            Layer::tanh(16),
            Layer::softmax(2),
        ],
        1.,
    )?;
    let weights = network.init_weights(&mut rng, 0.1);
    let dataset = squares::generate(80, 60, &mut rng)?;
    Ok((network, weights, dataset))
}

fn sgd() -> Sgd {
    Sgd::builder().learning_rate(1e-2).momentum(0.9).build()
}

#[test]
fn same_seed_same_run() -> Result<()> {
    let run = || -> Result<Vec<(f32, f32, f32)>> {
        let (network, weights, dataset) = setup(3)?;
        let mut trainer = Trainer::new(network, weights, sgd(), 16)?;
        Ok(trainer
            .fit(&dataset, 3, |_| ())?
            .iter()
            .map(|stats| (stats.train_err, stats.test_err, stats.mean_loss))
            .collect())
    };
    assert_eq!(run()?, run()?);
    Ok(())
}

/// Trains the default LeNet on the default squares for `num_epochs`.
fn default_run(num_epochs: usize) -> Result<Vec<(f32, f32)>> {
    let config = TrainConfig {
        num_epochs,
        ..TrainConfig::default()
    };
    let mut rng = StdRng::seed_from_u64(config.seed);
    let network = Network::new(
        config.input_shape.clone(),
        config.layers.iter().copied(),
        config.l2_reg,
    )?;
    let weights = network.init_weights(&mut rng, config.param_scale);
    let dataset = squares::generate(config.n_total, config.n_train, &mut rng)?;
    let mut trainer = Trainer::new(network, weights, config.optimizer(), config.batch_size)?;
    Ok(trainer
        .fit(&dataset, config.num_epochs, |_| ())?
        .iter()
        .map(|stats| (stats.train_err, stats.test_err))
        .collect())
}

#[test]
fn default_run_errors() -> Result<()> {
    let errors = default_run(2)?;
    assert_eq!(errors, default_run(2)?);
    assert_eq!(errors.len(), 2);
    // The first epoch reports the initial weights.
    assert_relative_eq!(errors[0].0, 0.5175, epsilon = 1e-6);
    assert_relative_eq!(errors[0].1, 0.525, epsilon = 1e-6);
    // Within a few examples of (0.475, 0.475) after one epoch.
    assert_relative_eq!(errors[1].0, 0.475, epsilon = 0.01);
    assert_relative_eq!(errors[1].1, 0.475, epsilon = 0.01);
    Ok(())
}

#[test]
fn errors_are_reported_before_updates() -> Result<()> {
    let (network, weights, dataset) = setup(5)?;
    let initial_train_err = network.frac_err(
        weights.view(),
        dataset.train_images.view().into_dyn(),
        dataset.train_labels.view(),
    )?;
    let initial_test_err = network.frac_err(
        weights.view(),
        dataset.test_images.view().into_dyn(),
        dataset.test_labels.view(),
    )?;
    let mut trainer = Trainer::new(network, weights.clone(), sgd(), 16)?;
    let first = trainer.train_epoch(&dataset)?;
    assert_eq!(first.epoch, 0);
    assert_eq!(first.train_err, initial_train_err);
    assert_eq!(first.test_err, initial_test_err);
    assert_ne!(trainer.weights(), weights.view());

    let after_first = trainer.weights().to_owned();
    let train_err = trainer.network().frac_err(
        after_first.view(),
        dataset.train_images.view().into_dyn(),
        dataset.train_labels.view(),
    )?;
    let second = trainer.train_epoch(&dataset)?;
    assert_eq!(second.epoch, 1);
    assert_eq!(second.train_err, train_err);
    assert_eq!(trainer.epoch(), 2);
    Ok(())
}

#[test]
fn single_batch_update() -> Result<()> {
    // One batch from zero velocity: w1 = w0 - lr * (1 - m) * grad(w0)
    let (network, weights, dataset) = setup(7)?;
    let (_, grad) = network.loss_grad(
        weights.view(),
        dataset.train_images.view().into_dyn(),
        dataset.train_labels.view(),
    )?;
    let mut trainer = Trainer::new(network, weights.clone(), sgd(), dataset.train_len())?;
    trainer.train_epoch(&dataset)?;
    let expected = &weights - &(grad * (1e-2 * 0.1));
    for (w, w_true) in trainer.weights().iter().zip(expected.iter()) {
        assert_relative_eq!(*w, *w_true, epsilon = 1e-5, max_relative = 1e-4);
    }
    Ok(())
}

#[test]
fn loss_decreases() -> Result<()> {
    let (network, weights, dataset) = setup(11)?;
    let mut trainer = Trainer::new(network, weights, sgd(), 20)?;
    let mut epochs = Vec::new();
    let stats = trainer.fit(&dataset, 5, |stats| epochs.push(stats.epoch))?;
    assert_eq!(epochs, [0, 1, 2, 3, 4]);
    assert!(stats.iter().all(|stats| stats.mean_loss.is_finite()));
    assert!(stats[4].mean_loss < stats[0].mean_loss);
    Ok(())
}

#[test]
fn default_config_assembles() -> Result<()> {
    let config = TrainConfig::default();
    let network = Network::new(
        config.input_shape.clone(),
        config.layers.iter().copied(),
        config.l2_reg,
    )?;
    // conv 1x1x5x5 + 1, dense 144x120 + 120, dense 120x2 + 2
    assert_eq!(network.num_weights(), 26 + 17400 + 242);
    assert_eq!(network.output_shape(), &[2]);
    assert_eq!(make_batches(config.n_train, config.batch_size).len(), 4);
    Ok(())
}

#[test]
fn weights_must_match_network() -> Result<()> {
    let (network, weights, _) = setup(0)?;
    let truncated = weights.slice(ndarray::s![1..]).to_owned();
    assert!(Trainer::new(network, truncated, sgd(), 16).is_err());
    Ok(())
}
