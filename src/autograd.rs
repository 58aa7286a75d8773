/*!
Reverse mode automatic differentiation.

A [`Variable`] is an array with an optional [`Node`]. Operations on variables with a node
register edges with a [`VariableBuilder`], which compute the gradient of each input from the
gradient of the output. [`Variable0::backward()`] traverses the graph, visiting a node only
once every edge into it has contributed.

```
# use anyhow::Result;
# fn main() -> Result<()> {
use convnet::autograd::value_and_grad;
use ndarray::{array, linalg::Dot};

let x = array![1f32, 2., 3.];
let (y, dx) = value_and_grad(|x| x.dot(&x), x.view())?;
assert_eq!(y, 14.);
assert_eq!(dx, array![2f32, 4., 6.]);
# Ok(())
# }
```
*/
use anyhow::{anyhow, ensure, Result};
use ndarray::{
    arr0, linalg::Dot, s, ArcArray, Array, Array1, ArrayD, ArrayView1, Axis, Dimension,
    IntoDimension, Ix0, Ix1, Ix2, Ix4, IxDyn, ShapeError, Zip,
};
use parking_lot::{Mutex, RwLock};
use std::{
    collections::VecDeque,
    fmt::{self, Debug},
    marker::PhantomData,
    ops::Range,
    sync::{Arc, Weak},
};

type GradLock = Arc<RwLock<Option<ArrayD<f32>>>>;

/// Builders.
pub mod builder {
    use super::*;

    /// VariableBuilder.
    ///
    ///```
    /// # use anyhow::Result;
    /// # use convnet::autograd::Variable1;
    /// # use ndarray::array;
    /// # fn main() -> Result<()> {
    /// let input = Variable1::builder().node().build(array![1f32, -2.].into_shared());
    /// let mut builder = Variable1::builder();
    /// if let Some(node) = input.node() {
    ///     // Add an edge computing the input gradient from the output gradient.
    ///     builder.edge(node, |output_grad| Ok(output_grad.mapv(|dy| 2. * dy)));
    /// }
    /// let output = builder.build(input.value().mapv(|x| 2. * x).into_shared());
    /// # let _ = output;
    /// # Ok(())
    /// # }
    ///```
    pub struct VariableBuilder<D: Dimension> {
        grad: Option<GradLock>,
        edges: Vec<EdgeInner>,
        _m: PhantomData<D>,
    }

    impl<D: Dimension + 'static> VariableBuilder<D> {
        pub(super) fn new() -> Self {
            Self {
                grad: None,
                edges: Vec::new(),
                _m: PhantomData,
            }
        }
        /// Adds a node.
        ///
        /// Ensures a node is created even if edges are not added. Use this for leaves whose
        /// gradient should be read after the backward pass.
        pub fn node(mut self) -> Self {
            if self.grad.is_none() {
                self.grad.replace(GradLock::default());
            }
            self
        }
        /// Adds an edge.
        ///
        /// During the backward pass, `f` computes the gradient of `node` given the gradient of
        /// the output. When multiple edges compute the same gradient, they are added together.
        pub fn edge<D2, F>(&mut self, node: &Node<D2>, f: F)
        where
            D2: Dimension,
            F: FnOnce(ArcArray<f32, D>) -> Result<Array<f32, D2>> + Send + Sync + 'static,
        {
            let output_grad_lock = self.grad.get_or_insert_with(GradLock::default).clone();
            let mut output_grad_lock = Some(output_grad_lock);
            let node = node.inner.clone();
            let mut input_grad_lock = Arc::downgrade(&node.grad);
            let dim = node.dim.clone();
            let name = std::any::type_name::<F>();
            let mut f = Some(f);
            let op: EdgeOp = Box::new(move || -> Result<()> {
                let input_grad_lock = Weak::upgrade(&std::mem::take(&mut input_grad_lock));
                if let Some((f, (input_grad_lock, output_grad_lock))) =
                    f.take().zip(input_grad_lock.zip(output_grad_lock.take()))
                {
                    let grad = output_grad_lock
                        .read()
                        .clone()
                        .ok_or_else(|| anyhow!("{name}: missing output gradient!"))?;
                    std::mem::drop(output_grad_lock);
                    let grad = (f)(grad.into_dimensionality::<D>()?.into_shared())?.into_dyn();
                    ensure!(
                        grad.shape() == dim.slice(),
                        "{name}: expected gradient shape {:?}, found {:?}!",
                        dim.slice(),
                        grad.shape()
                    );
                    let mut guard = input_grad_lock.write();
                    if let Some(input_grad) = guard.as_mut() {
                        *input_grad += &grad;
                    } else {
                        guard.replace(grad);
                    }
                }
                Ok(())
            });
            self.edges.push(EdgeInner { name, op, node })
        }
        /// Builds the variable with `value`.
        pub fn build(self, value: ArcArray<f32, D>) -> Variable<D> {
            let node = self
                .grad
                .map(|grad| Node::new(value.raw_dim().into_dyn(), grad, self.edges));
            Variable { value, node }
        }
    }
}
use builder::VariableBuilder;

type EdgeOp = Box<dyn FnMut() -> Result<()> + Send + Sync + 'static>;

struct EdgeInner {
    name: &'static str,
    op: EdgeOp,
    node: Arc<NodeInner>,
}

impl Debug for EdgeInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EdgeInner")
            .field("name", &self.name)
            .field("node", &self.node)
            .finish()
    }
}

#[derive(Debug)]
struct NodeInner {
    dim: IxDyn,
    grad: GradLock,
    edges: Mutex<Vec<EdgeInner>>,
}

impl NodeInner {
    fn ready(&self) -> bool {
        Arc::weak_count(&self.grad) == 0
    }
}

/// Node.
///
/// Nodes store gradients and are connected via [`VariableBuilder::edge()`] to form a graph
/// that is traversed in [`.backward()`](Node::backward).
#[derive(Clone, Debug)]
pub struct Node<D: Dimension> {
    inner: Arc<NodeInner>,
    _m: PhantomData<D>,
}

impl<D: Dimension> Node<D> {
    fn new(dim: IxDyn, grad: GradLock, edges: Vec<EdgeInner>) -> Self {
        Self {
            inner: Arc::new(NodeInner {
                dim,
                grad,
                edges: Mutex::new(edges),
            }),
            _m: PhantomData,
        }
    }
    /// The gradient.
    ///
    /// None until the backward pass has reached this node.
    pub fn grad(&self) -> Option<Array<f32, D>> {
        self.inner.grad.read().clone()?.into_dimensionality().ok()
    }
    /// Executes the backward pass, seeding the gradient with ones.
    pub fn backward(&self) -> Result<()> {
        let grad = ArrayD::ones(self.inner.dim.clone()).into_dimensionality::<D>()?;
        self.backward_grad(grad)
    }
    /// Executes the backward pass with `grad`.
    ///
    /// Does nothing if the gradient of this node was already computed.
    pub fn backward_grad(&self, grad: Array<f32, D>) -> Result<()> {
        ensure!(
            grad.shape() == self.inner.dim.slice(),
            "Expected gradient shape {:?}, found {:?}!",
            self.inner.dim.slice(),
            grad.shape()
        );
        {
            let mut guard = self.inner.grad.write();
            if guard.is_some() {
                return Ok(());
            }
            guard.replace(grad.into_dyn());
        }
        let mut queue = VecDeque::new();
        queue.push_back(self.inner.clone());
        while let Some(node) = queue.pop_front() {
            let edges = std::mem::take(&mut *node.edges.lock());
            std::mem::drop(node);
            for mut edge in edges {
                (edge.op)()?;
                let node = edge.node;
                if node.ready() {
                    queue.push_back(node);
                }
            }
        }
        Ok(())
    }
    fn into_dyn(self) -> Node<IxDyn> {
        Node {
            inner: self.inner,
            _m: PhantomData,
        }
    }
    fn into_dimensionality<D2: Dimension>(self) -> Node<D2> {
        Node {
            inner: self.inner,
            _m: PhantomData,
        }
    }
}

/// Variable.
///
/// Variables are arrays with an optional [`Node`] that stores a gradient. Operations on
/// variables with a node create a graph of edges that is traversed during the backward pass to
/// compute the gradients.
///
/// Variables without a node are created from arrays via [`From`].
#[derive(Clone, Debug)]
pub struct Variable<D: Dimension> {
    value: ArcArray<f32, D>,
    node: Option<Node<D>>,
}

/// Variable with 1 element
pub type Variable0 = Variable<Ix0>;
/// Variable with 1 dimension
pub type Variable1 = Variable<Ix1>;
/// Variable with 2 dimensions
pub type Variable2 = Variable<Ix2>;
/// Variable with 4 dimensions
pub type Variable4 = Variable<Ix4>;
/// Variable with dynamic dimensions
pub type VariableD = Variable<IxDyn>;

impl<D: Dimension + 'static> Variable<D> {
    /// A `VariableBuilder` for creating nodes and edges.
    pub fn builder() -> VariableBuilder<D> {
        VariableBuilder::new()
    }
    /// The value of the variable.
    pub fn value(&self) -> &ArcArray<f32, D> {
        &self.value
    }
    /// Converts the variable into its value.
    pub fn into_value(self) -> ArcArray<f32, D> {
        self.value
    }
    /// The node.
    pub fn node(&self) -> Option<&Node<D>> {
        self.node.as_ref()
    }
    /// The shape.
    pub fn shape(&self) -> &[usize] {
        self.value.shape()
    }
    /// The dim in pattern form.
    pub fn dim(&self) -> D::Pattern {
        self.value.dim()
    }
    /// The dim.
    pub fn raw_dim(&self) -> D {
        self.value.raw_dim()
    }
    /// The number of dimensions.
    pub fn ndim(&self) -> usize {
        self.value.ndim()
    }
    /// The number of elements.
    pub fn len(&self) -> usize {
        self.value.len()
    }
    /// Whether the variable has no elements.
    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }
    /// Converts into dimensionality `D2`.
    pub fn into_dimensionality<D2>(self) -> Result<Variable<D2>, ShapeError>
    where
        D2: Dimension,
    {
        let value = self.value.into_dimensionality()?;
        Ok(Variable {
            value,
            node: self.node.map(Node::into_dimensionality),
        })
    }
    /// Converts into a dynamic dimensional variable.
    pub fn into_dyn(self) -> VariableD {
        Variable {
            value: self.value.into_dyn(),
            node: self.node.map(Node::into_dyn),
        }
    }
    /// Converts into `shape`.
    ///
    /// The element order is the standard (row major) order.
    pub fn into_shape<E>(self, shape: E) -> Result<Variable<E::Dim>>
    where
        E: IntoDimension,
        E::Dim: 'static,
    {
        let dim = self.raw_dim();
        let mut builder = Variable::<E::Dim>::builder();
        if let Some(node) = self.node() {
            builder.edge(node, move |output_grad| {
                Ok(standard_layout(output_grad).into_shape(dim)?.into_owned())
            })
        }
        let value = standard_layout(self.value).into_shape(shape)?;
        Ok(builder.build(value))
    }
    /// Flattens the variable into [batch, features].
    pub fn flatten(self) -> Result<Variable2> {
        let batch_size = self.shape().first().copied().unwrap_or(1);
        let features = self.shape().iter().skip(1).product::<usize>();
        self.into_shape([batch_size, features])
    }
    /// Adds `rhs`, broadcasting it to the shape of `self`.
    pub fn add<D2>(&self, rhs: &Variable<D2>) -> Result<Self>
    where
        D2: Dimension + 'static,
    {
        let rhs_value = rhs.value.broadcast(self.raw_dim()).ok_or_else(|| {
            anyhow!(
                "Can not broadcast {:?} -> {:?}!",
                rhs.shape(),
                self.shape()
            )
        })?;
        let value = (&self.value + &rhs_value).into_shared();
        let mut builder = Self::builder();
        if let Some(node) = self.node() {
            builder.edge(node, |output_grad| Ok(output_grad.into_owned()));
        }
        if let Some(node) = rhs.node() {
            let dim = rhs.raw_dim();
            builder.edge(node, move |output_grad| broadcast_backward(output_grad, dim));
        }
        Ok(builder.build(value))
    }
    /// Multiplies every element by `alpha`.
    pub fn scale(&self, alpha: f32) -> Self {
        let mut builder = Self::builder();
        if let Some(node) = self.node() {
            builder.edge(node, move |output_grad| Ok(output_grad.mapv(|dy| alpha * dy)));
        }
        builder.build((&self.value * alpha).into_shared())
    }
    /// Multiplies elementwise by a constant array of the same shape.
    pub fn mul_const(&self, rhs: ArcArray<f32, D>) -> Result<Self> {
        ensure!(
            self.shape() == rhs.shape(),
            "Can not multiply {:?} by {:?}!",
            self.shape(),
            rhs.shape()
        );
        let value = (&self.value * &rhs).into_shared();
        let mut builder = Self::builder();
        if let Some(node) = self.node() {
            builder.edge(node, move |output_grad| Ok(&output_grad * &rhs));
        }
        Ok(builder.build(value))
    }
    /// Elementwise hyperbolic tangent.
    pub fn tanh(&self) -> Self {
        let value = self.value.mapv(f32::tanh).into_shared();
        let mut builder = Self::builder();
        if let Some(node) = self.node() {
            let output = value.clone();
            builder.edge(node, move |output_grad| {
                Ok(Zip::from(&output_grad)
                    .and(&output)
                    .map_collect(|dy, y| dy * (1. - y * y)))
            });
        }
        builder.build(value)
    }
    /// Sums all elements.
    pub fn sum(&self) -> Variable0 {
        let mut builder = Variable0::builder();
        if let Some(node) = self.node() {
            let dim = self.raw_dim();
            builder.edge(node, move |output_grad: ArcArray<f32, Ix0>| {
                Ok(Array::from_elem(dim, output_grad[()]))
            });
        }
        builder.build(arr0(self.value.sum()).into_shared())
    }
}

impl Variable0 {
    /// The scalar value.
    pub fn into_scalar(self) -> f32 {
        self.value[()]
    }
    /// Executes the backward pass.
    ///
    /// See [`Node::backward`].
    pub fn backward(&self) -> Result<()> {
        if let Some(node) = self.node.as_ref() {
            node.backward()?;
        }
        Ok(())
    }
}

impl Variable1 {
    /// A contiguous slice of the vector.
    ///
    /// The gradient of the slice is scattered back into `range`.
    pub fn slice(&self, range: Range<usize>) -> Result<Self> {
        let len = self.len();
        ensure!(
            range.start <= range.end && range.end <= len,
            "Slice {range:?} out of bounds for length {len}!"
        );
        let value = self.value.slice(s![range.clone()]).to_shared();
        let mut builder = Self::builder();
        if let Some(node) = self.node() {
            builder.edge(node, move |output_grad| {
                let mut input_grad = Array1::zeros(len);
                input_grad.slice_mut(s![range]).assign(&output_grad);
                Ok(input_grad)
            });
        }
        Ok(builder.build(value))
    }
}

impl<D: Dimension> From<Array<f32, D>> for Variable<D> {
    fn from(array: Array<f32, D>) -> Self {
        Self::from(array.into_shared())
    }
}

impl<D: Dimension> From<ArcArray<f32, D>> for Variable<D> {
    fn from(array: ArcArray<f32, D>) -> Self {
        Self {
            value: array,
            node: None,
        }
    }
}

impl Dot<Self> for Variable1 {
    type Output = Result<Variable0>;
    fn dot(&self, rhs: &Self) -> Result<Variable0> {
        ensure!(
            self.len() == rhs.len(),
            "Can not dot {:?} with {:?}!",
            self.shape(),
            rhs.shape()
        );
        let lhs = self;
        let mut builder = Variable0::builder();
        if let Some(node) = lhs.node() {
            let rhs = rhs.value().clone();
            builder.edge(node, move |output_grad| Ok(&rhs * output_grad[()]));
        }
        if let Some(node) = rhs.node() {
            let lhs = lhs.value().clone();
            builder.edge(node, move |output_grad| Ok(&lhs * output_grad[()]));
        }
        let value = arr0(lhs.value().dot(rhs.value())).into_shared();
        Ok(builder.build(value))
    }
}

impl Dot<Self> for Variable2 {
    type Output = Result<Self>;
    fn dot(&self, rhs: &Self) -> Result<Self> {
        let (_, k) = self.dim();
        let (k2, _) = rhs.dim();
        ensure!(
            k == k2,
            "Can not dot {:?} with {:?}!",
            self.shape(),
            rhs.shape()
        );
        let lhs = self;
        let mut builder = Self::builder();
        if let Some(node) = lhs.node() {
            let rhs = rhs.value().clone();
            builder.edge(node, move |output_grad| Ok(output_grad.dot(&rhs.t())));
        }
        if let Some(node) = rhs.node() {
            let lhs = lhs.value().clone();
            builder.edge(node, move |output_grad| Ok(lhs.t().dot(&output_grad)));
        }
        let value = lhs.value().dot(rhs.value()).into_shared();
        Ok(builder.build(value))
    }
}

fn standard_layout<D: Dimension>(array: ArcArray<f32, D>) -> ArcArray<f32, D> {
    if array.is_standard_layout() {
        array
    } else {
        array.as_standard_layout().to_shared()
    }
}

/// Sums `output_grad` over the axes that were broadcast from `dim`.
fn broadcast_backward<D1: Dimension, D2: Dimension>(
    output_grad: ArcArray<f32, D1>,
    dim: D2,
) -> Result<Array<f32, D2>> {
    let mut grad = output_grad.into_owned().into_dyn();
    let leading = grad.ndim().saturating_sub(dim.ndim());
    for _ in 0..leading {
        grad = grad.sum_axis(Axis(0));
    }
    for (axis, d) in dim.slice().iter().copied().enumerate() {
        if d == 1 && grad.shape()[axis] != 1 {
            grad = grad.sum_axis(Axis(axis)).insert_axis(Axis(axis));
        }
    }
    Ok(grad.into_shape(dim)?)
}

/// Evaluates `f` at `x` and computes its gradient with respect to `x`.
///
/// Returns (`f(x)`, `df/dx`). If the output does not depend on `x`, the gradient is zero.
pub fn value_and_grad<F>(f: F, x: ArrayView1<f32>) -> Result<(f32, Array1<f32>)>
where
    F: FnOnce(Variable1) -> Result<Variable0>,
{
    let input = Variable1::builder().node().build(x.to_shared());
    let node = input.node().cloned();
    let output = f(input)?;
    output.backward()?;
    let grad = node
        .and_then(|node| node.grad())
        .unwrap_or_else(|| Array1::zeros(x.len()));
    Ok((output.into_scalar(), grad))
}

/// Converts a scalar function of a vector into a function computing its gradient.
///
/// Auxiliary data (ie a batch of inputs and targets) can be captured by `f`.
pub fn grad<F>(f: F) -> impl Fn(ArrayView1<f32>) -> Result<Array1<f32>>
where
    F: Fn(Variable1) -> Result<Variable0>,
{
    move |x: ArrayView1<f32>| value_and_grad(&f, x).map(|(_, grad)| grad)
}
