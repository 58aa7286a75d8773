use crate::error::Error;
use anyhow::{bail, Result};
use ndarray::{s, Array2, Array3, Array4, ArrayView2, ArrayView4, Axis};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Generated images of squares.
pub mod squares;

/// Train and test images with one hot labels.
///
/// Images are [n, channels, height, width], labels are [n, classes].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    /// The training images.
    pub train_images: Array4<f32>,
    /// The training labels.
    pub train_labels: Array2<f32>,
    /// The test images.
    pub test_images: Array4<f32>,
    /// The test labels.
    pub test_labels: Array2<f32>,
}

impl Dataset {
    /// Creates a dataset.
    ///
    /// **Errors**
    ///
    /// [`Error::LabelCount`] if the number of images and labels differ.
    pub fn new(
        train_images: Array4<f32>,
        train_labels: Array2<f32>,
        test_images: Array4<f32>,
        test_labels: Array2<f32>,
    ) -> Result<Self> {
        for (images, labels) in [
            (train_images.len_of(Axis(0)), train_labels.nrows()),
            (test_images.len_of(Axis(0)), test_labels.nrows()),
        ] {
            if images != labels {
                bail!(Error::LabelCount { images, labels });
            }
        }
        if train_labels.ncols() != test_labels.ncols() {
            bail!(
                "Train labels have {} classes, test labels have {}!",
                train_labels.ncols(),
                test_labels.ncols()
            );
        }
        Ok(Self {
            train_images,
            train_labels,
            test_images,
            test_labels,
        })
    }
    /// The number of training examples.
    pub fn train_len(&self) -> usize {
        self.train_labels.nrows()
    }
    /// The number of test examples.
    pub fn test_len(&self) -> usize {
        self.test_labels.nrows()
    }
    /// The number of classes.
    pub fn classes(&self) -> usize {
        self.train_labels.ncols()
    }
    /// The training images and labels in `range`.
    pub fn train_batch(&self, range: Range<usize>) -> (ArrayView4<f32>, ArrayView2<f32>) {
        (
            self.train_images.slice(s![range.clone(), .., .., ..]),
            self.train_labels.slice(s![range, ..]),
        )
    }
}

/// Encodes `labels` as rows with a 1 at the label and 0 elsewhere.
///
/// **Errors**
///
/// Fails if a label is not less than `classes`.
pub fn one_hot(labels: &[usize], classes: usize) -> Result<Array2<f32>> {
    let mut output = Array2::zeros([labels.len(), classes]);
    for (mut y, label) in output.outer_iter_mut().zip(labels.iter().copied()) {
        if label >= classes {
            bail!("Label {label} out of range for {classes} classes!");
        }
        y[label] = 1.;
    }
    Ok(output)
}

/// Reshapes [n, height, width] images to [n, 1, height, width].
pub fn add_color_channel(images: Array3<f32>) -> Array4<f32> {
    images.insert_axis(Axis(1))
}
