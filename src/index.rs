use crate::{
    autograd::{Variable1, VariableD},
    error::Error,
};
use anyhow::{bail, Result};
use ndarray::{s, ArrayView1, ArrayViewD, IxDyn};
use std::{collections::HashMap, ops::Range};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Block {
    name: String,
    range: Range<usize>,
    shape: Vec<usize>,
}

/// Named views into a flat parameter vector.
///
/// Blocks are added in order and occupy contiguous, non overlapping ranges. The total length
/// of a vector indexed by this is [`.len()`](ParameterIndex::len).
///
/// ```
/// # use anyhow::Result;
/// # fn main() -> Result<()> {
/// use convnet::index::ParameterIndex;
/// use ndarray::Array;
///
/// let mut index = ParameterIndex::default();
/// index.add_weights("params", [2, 3])?;
/// index.add_weights("biases", [3])?;
/// assert_eq!(index.len(), 9);
/// let w = Array::range(0f32, 9., 1.);
/// let biases = index.view(w.view(), "biases")?;
/// assert_eq!(biases.as_slice(), Some([6f32, 7., 8.].as_ref()));
/// # Ok(())
/// # }
/// ```
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct ParameterIndex {
    blocks: Vec<Block>,
    names: HashMap<String, usize>,
    len: usize,
}

impl ParameterIndex {
    /// Appends a block `name` with `shape`.
    ///
    /// **Errors**
    ///
    /// [`Error::DuplicateBlock`] if `name` is already registered.
    pub fn add_weights(
        &mut self,
        name: impl Into<String>,
        shape: impl AsRef<[usize]>,
    ) -> Result<()> {
        let name = name.into();
        if self.names.contains_key(&name) {
            bail!(Error::DuplicateBlock(name));
        }
        let shape = shape.as_ref().to_vec();
        let start = self.len;
        self.len += shape.iter().product::<usize>();
        self.names.insert(name.clone(), self.blocks.len());
        self.blocks.push(Block {
            name,
            range: start..self.len,
            shape,
        });
        Ok(())
    }
    /// The total number of parameters.
    pub fn len(&self) -> usize {
        self.len
    }
    /// Whether there are no parameters.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
    /// Iterator over the name, range, and shape of each block, in insertion order.
    pub fn blocks(&self) -> impl Iterator<Item = (&str, Range<usize>, &[usize])> {
        self.blocks
            .iter()
            .map(|block| (block.name.as_str(), block.range.clone(), block.shape.as_slice()))
    }
    /// The range of block `name`.
    pub fn range(&self, name: &str) -> Result<Range<usize>> {
        Ok(self.block(name)?.range.clone())
    }
    /// The shape of block `name`.
    pub fn shape(&self, name: &str) -> Result<&[usize]> {
        Ok(&self.block(name)?.shape)
    }
    /// Block `name` of `vector`, reshaped to its registered shape.
    ///
    /// The gradient of the block is scattered back into the vector.
    ///
    /// **Errors**
    /// - [`Error::ParameterLength`] if the vector length is not [`.len()`](ParameterIndex::len).
    /// - [`Error::UnknownBlock`] if `name` is not registered.
    pub fn get(&self, vector: &Variable1, name: &str) -> Result<VariableD> {
        self.check_len(vector.len())?;
        let block = self.block(name)?;
        vector
            .slice(block.range.clone())?
            .into_shape(IxDyn(&block.shape))
    }
    /// Like [`.get()`](ParameterIndex::get), without autograd.
    pub fn view<'a>(&self, vector: ArrayView1<'a, f32>, name: &str) -> Result<ArrayViewD<'a, f32>> {
        self.check_len(vector.len())?;
        let block = self.block(name)?;
        Ok(vector
            .slice_move(s![block.range.clone()])
            .into_shape(IxDyn(&block.shape))?)
    }
    fn block(&self, name: &str) -> Result<&Block> {
        match self.names.get(name) {
            Some(i) => Ok(&self.blocks[*i]),
            None => bail!(Error::UnknownBlock(name.to_string())),
        }
    }
    fn check_len(&self, found: usize) -> Result<()> {
        if found != self.len {
            bail!(Error::ParameterLength {
                expected: self.len,
                found,
            });
        }
        Ok(())
    }
}
