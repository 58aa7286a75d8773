use thiserror::Error;

/// Configuration and shape errors.
///
/// Library functions return [`anyhow::Result`]. These can be recovered with
/// [`anyhow::Error::downcast_ref()`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// A block with the same name was already added to a
    /// [`ParameterIndex`](crate::index::ParameterIndex).
    #[error("Parameter block {0:?} is already registered!")]
    DuplicateBlock(String),
    /// No block with this name was added to the
    /// [`ParameterIndex`](crate::index::ParameterIndex).
    #[error("Parameter block {0:?} is not registered!")]
    UnknownBlock(String),
    /// The flat parameter vector does not match the registered size.
    #[error("Expected a parameter vector of length {expected}, found {found}!")]
    ParameterLength {
        /// Total registered size.
        expected: usize,
        /// Length of the vector.
        found: usize,
    },
    /// The pool does not tile the input exactly.
    #[error("Pool {pool:?} does not tile input {input:?}!")]
    PoolShape {
        /// Pool shape.
        pool: [usize; 2],
        /// Input shape [channels, height, width].
        input: Vec<usize>,
    },
    /// The kernel does not fit in the input.
    #[error("Kernel {kernel:?} does not fit input {input:?}!")]
    KernelShape {
        /// Kernel shape.
        kernel: [usize; 2],
        /// Input shape [channels, height, width].
        input: Vec<usize>,
    },
    /// The input does not have the expected shape.
    #[error("Expected input shape {expected:?}, found {found:?}!")]
    InputShape {
        /// Expected shape, excluding the batch dimension.
        expected: Vec<usize>,
        /// Actual shape, excluding the batch dimension.
        found: Vec<usize>,
    },
    /// Images and labels have different lengths.
    #[error("Found {images} images but {labels} labels!")]
    LabelCount {
        /// Number of images.
        images: usize,
        /// Number of labels.
        labels: usize,
    },
    /// A configuration value is out of range.
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
}
