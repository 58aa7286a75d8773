use crate::{dataset::Dataset, network::Network, optimizer::Sgd};
use anyhow::{ensure, Result};
use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};
use std::{
    fmt::{self, Display},
    ops::Range,
    time::{Duration, Instant},
};

/// Splits `0..n_total` into consecutive ranges of `n_batch`.
///
/// The last range is shorter if `n_batch` does not divide `n_total`.
pub fn make_batches(n_total: usize, n_batch: usize) -> Vec<Range<usize>> {
    if n_batch == 0 {
        return Vec::new();
    }
    (0..n_total)
        .step_by(n_batch)
        .map(|start| start..n_total.min(start + n_batch))
        .collect()
}

/// The header for [`EpochStats::report_line()`].
pub fn report_header() -> &'static str {
    "    Epoch      |    Train err  |   Test error  "
}

/// Statistics of an epoch.
#[non_exhaustive]
#[derive(Default, Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct EpochStats {
    /// The epoch, starting at 0.
    pub epoch: usize,
    /// The fraction of misclassified training examples, before the epoch's updates.
    pub train_err: f32,
    /// The fraction of misclassified test examples, before the epoch's updates.
    pub test_err: f32,
    /// The mean loss of the batches.
    pub mean_loss: f32,
    /// The run time of the epoch.
    pub elapsed: Duration,
}

impl EpochStats {
    /// A fixed width line with the epoch and errors.
    pub fn report_line(&self) -> String {
        format!(
            "{:15}|{:15?}|{:15?}",
            self.epoch, self.train_err, self.test_err
        )
    }
}

impl Display for EpochStats {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.report_line())
    }
}

/// Trains a [`Network`] with [`Sgd`].
#[derive(Debug)]
pub struct Trainer {
    network: Network,
    weights: Array1<f32>,
    optimizer: Sgd,
    batch_size: usize,
    epoch: usize,
}

impl Trainer {
    /// Creates a trainer starting from `weights`.
    ///
    /// **Errors**
    ///
    /// Fails if `weights` does not have [`network.num_weights()`](Network::num_weights) elements
    /// or `batch_size` is 0.
    pub fn new(
        network: Network,
        weights: Array1<f32>,
        optimizer: Sgd,
        batch_size: usize,
    ) -> Result<Self> {
        ensure!(
            weights.len() == network.num_weights(),
            "Expected {} weights, found {}!",
            network.num_weights(),
            weights.len()
        );
        ensure!(batch_size > 0, "batch_size must be positive!");
        Ok(Self {
            network,
            weights,
            optimizer,
            batch_size,
            epoch: 0,
        })
    }
    /// The network.
    pub fn network(&self) -> &Network {
        &self.network
    }
    /// The current weights.
    pub fn weights(&self) -> ArrayView1<f32> {
        self.weights.view()
    }
    /// Consumes the trainer, returning the weights.
    pub fn into_weights(self) -> Array1<f32> {
        self.weights
    }
    /// The optimizer.
    pub fn optimizer(&self) -> &Sgd {
        &self.optimizer
    }
    /// The number of completed epochs.
    pub fn epoch(&self) -> usize {
        self.epoch
    }
    /// Runs an epoch over the training set.
    ///
    /// The errors are computed before any update, so they reflect the weights at the end of
    /// the previous epoch. Batches are taken in order, without shuffling.
    pub fn train_epoch(&mut self, dataset: &Dataset) -> Result<EpochStats> {
        let start = Instant::now();
        let train_err = self.network.frac_err(
            self.weights.view(),
            dataset.train_images.view().into_dyn(),
            dataset.train_labels.view(),
        )?;
        let test_err = self.network.frac_err(
            self.weights.view(),
            dataset.test_images.view().into_dyn(),
            dataset.test_labels.view(),
        )?;
        let batches = make_batches(dataset.train_len(), self.batch_size);
        let mut total_loss = 0.;
        for batch in batches.iter().cloned() {
            let (images, labels) = dataset.train_batch(batch);
            let (loss, grad) =
                self.network
                    .loss_grad(self.weights.view(), images.into_dyn(), labels)?;
            if !loss.is_finite() {
                tracing::warn!("Non finite loss {loss} in epoch {}!", self.epoch);
            }
            total_loss += loss;
            self.optimizer.update(self.weights.view_mut(), grad.view())?;
        }
        let mean_loss = if batches.is_empty() {
            0.
        } else {
            total_loss / batches.len() as f32
        };
        let stats = EpochStats {
            epoch: self.epoch,
            train_err,
            test_err,
            mean_loss,
            elapsed: start.elapsed(),
        };
        tracing::debug!(
            "epoch {}: mean loss {:.4} in {:?}",
            stats.epoch,
            stats.mean_loss,
            stats.elapsed
        );
        self.epoch += 1;
        Ok(stats)
    }
    /// Runs `num_epochs` epochs, calling `on_epoch` after each.
    ///
    /// Returns the stats of every epoch.
    pub fn fit<F>(
        &mut self,
        dataset: &Dataset,
        num_epochs: usize,
        mut on_epoch: F,
    ) -> Result<Vec<EpochStats>>
    where
        F: FnMut(&EpochStats),
    {
        let mut stats = Vec::with_capacity(num_epochs);
        for _ in 0..num_epochs {
            let epoch_stats = self.train_epoch(dataset)?;
            on_epoch(&epoch_stats);
            stats.push(epoch_stats);
        }
        Ok(stats)
    }
}
