use anyhow::Result;
use convnet::{
    config::TrainConfig,
    dataset::squares,
    network::Network,
    train::{report_header, Trainer},
};
use rand::{rngs::StdRng, SeedableRng};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = TrainConfig::default();
    config.validate()?;
    let mut rng = StdRng::seed_from_u64(config.seed);

    let network = Network::new(
        config.input_shape.clone(),
        config.layers.iter().copied(),
        config.l2_reg,
    )?;
    let weights = network.init_weights(&mut rng, config.param_scale);

    info!("Generating {} square images...", config.n_total);
    let dataset = squares::generate(config.n_total, config.n_train, &mut rng)?;

    let mut trainer = Trainer::new(network, weights, config.optimizer(), config.batch_size)?;
    println!("{}", report_header());
    let stats = trainer.fit(&dataset, config.num_epochs, |stats| println!("{stats}"))?;
    if let Some(last) = stats.last() {
        info!(
            "Finished {} epochs, last train err {} test err {}",
            stats.len(),
            last.train_err,
            last.test_err
        );
    }
    Ok(())
}
