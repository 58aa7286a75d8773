//! Two classes of 28x28 images: filled squares (class 1) and square outlines (class 0).
//!
//! Squares have a random side length and position. Pixels are 1 on the square and 0 elsewhere.
use super::{add_color_channel, one_hot, Dataset};
use anyhow::{ensure, Result};
use ndarray::{s, Array3};
use rand::Rng;

/// The height and width of the images.
pub const IMAGE_SIZE: usize = 28;
/// The smallest side length of a square.
pub const MIN_SIDE: usize = 6;
/// The largest side length of a square.
pub const MAX_SIDE: usize = 16;
/// The width of the border of an outline.
pub const BORDER: usize = 2;

/// Generates `n_total` images, the first `n_train` for training and the rest for testing.
///
/// The output only depends on the state of `rng`.
///
/// ```
/// # use anyhow::Result;
/// # fn main() -> Result<()> {
/// use convnet::dataset::squares;
/// use rand::{rngs::StdRng, SeedableRng};
///
/// let dataset = squares::generate(1000, 800, &mut StdRng::seed_from_u64(0))?;
/// assert_eq!(dataset.train_images.shape(), &[800, 1, 28, 28]);
/// assert_eq!(dataset.test_labels.shape(), &[200, 2]);
/// # Ok(())
/// # }
/// ```
pub fn generate<R: Rng>(n_total: usize, n_train: usize, rng: &mut R) -> Result<Dataset> {
    ensure!(
        n_train <= n_total,
        "Can not take {n_train} training images from {n_total}!"
    );
    let mut images = Array3::zeros([n_total, IMAGE_SIZE, IMAGE_SIZE]);
    let mut labels = Vec::with_capacity(n_total);
    for mut image in images.outer_iter_mut() {
        let filled = rng.gen_bool(0.5);
        let side = rng.gen_range(MIN_SIDE..=MAX_SIDE);
        let top = rng.gen_range(0..=IMAGE_SIZE - side);
        let left = rng.gen_range(0..=IMAGE_SIZE - side);
        image
            .slice_mut(s![top..top + side, left..left + side])
            .fill(1.);
        if !filled {
            image
                .slice_mut(s![
                    top + BORDER..top + side - BORDER,
                    left + BORDER..left + side - BORDER
                ])
                .fill(0.);
        }
        labels.push(filled as usize);
    }
    let images = add_color_channel(images);
    let labels = one_hot(&labels, 2)?;
    Dataset::new(
        images.slice(s![..n_train, .., .., ..]).to_owned(),
        labels.slice(s![..n_train, ..]).to_owned(),
        images.slice(s![n_train.., .., .., ..]).to_owned(),
        labels.slice(s![n_train.., ..]).to_owned(),
    )
}
