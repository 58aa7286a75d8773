//! Differentiable kernels used by the layers.
//!
//! Each operation has a host forward routine, host backward routines, and a wrapper on
//! [`Variable`]s that wires them together with
//! [`VariableBuilder::edge()`](crate::autograd::builder::VariableBuilder::edge).
//! Work is split across batch elements (or weight entries) with rayon. Every task writes a
//! disjoint region of the output, so results do not depend on scheduling.
use crate::autograd::{Variable2, Variable4};
use anyhow::{ensure, Result};
use ndarray::{s, Array1, Array2, Array4, ArrayView2, ArrayView4, Axis, Zip};
use rayon::prelude::*;

/// Valid 2d cross-correlation.
///
/// - input: [n, c_in, h, w]
/// - weight: [c_in, c_out, kh, kw]
/// - output: [n, c_out, h - kh + 1, w - kw + 1]
///
/// Sums over the input channels.
pub fn conv2(input: &Variable4, weight: &Variable4) -> Result<Variable4> {
    let (_, ic, ih, iw) = input.dim();
    let (weight_ic, _, kh, kw) = weight.dim();
    ensure!(
        ic == weight_ic,
        "Input {:?} does not match weight {:?}!",
        input.shape(),
        weight.shape()
    );
    ensure!(
        kh <= ih && kw <= iw,
        "Kernel {:?} larger than input {:?}!",
        &weight.shape()[2..],
        &input.shape()[2..]
    );
    let output = conv2_forward(input.value().view(), weight.value().view());
    let mut builder = Variable4::builder();
    if let Some(node) = input.node() {
        let weight = weight.value().clone();
        builder.edge(node, move |output_grad| {
            Ok(conv2_backward_input(
                weight.view(),
                output_grad.view(),
                [ih, iw],
            ))
        });
    }
    if let Some(node) = weight.node() {
        let input = input.value().clone();
        builder.edge(node, move |output_grad| {
            Ok(conv2_backward_weight(
                input.view(),
                output_grad.view(),
                [kh, kw],
            ))
        });
    }
    Ok(builder.build(output.into_shared()))
}

fn conv2_forward(input: ArrayView4<f32>, weight: ArrayView4<f32>) -> Array4<f32> {
    let (bs, _, ih, iw) = input.dim();
    let (_, oc, kh, kw) = weight.dim();
    let (oh, ow) = (ih - kh + 1, iw - kw + 1);
    let mut output = Array4::zeros([bs, oc, oh, ow]);
    output
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .zip(input.axis_iter(Axis(0)))
        .for_each(|(mut y, x)| {
            for ((ci, co, fi, fj), w) in weight.indexed_iter() {
                y.index_axis_mut(Axis(0), co)
                    .scaled_add(*w, &x.slice(s![ci, fi..fi + oh, fj..fj + ow]));
            }
        });
    output
}

fn conv2_backward_input(
    weight: ArrayView4<f32>,
    output_grad: ArrayView4<f32>,
    [ih, iw]: [usize; 2],
) -> Array4<f32> {
    let (bs, _, oh, ow) = output_grad.dim();
    let (ic, _, _, _) = weight.dim();
    let mut input_grad = Array4::zeros([bs, ic, ih, iw]);
    input_grad
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .zip(output_grad.axis_iter(Axis(0)))
        .for_each(|(mut dx, dy)| {
            for ((ci, co, fi, fj), w) in weight.indexed_iter() {
                dx.slice_mut(s![ci, fi..fi + oh, fj..fj + ow])
                    .scaled_add(*w, &dy.index_axis(Axis(0), co));
            }
        });
    input_grad
}

fn conv2_backward_weight(
    input: ArrayView4<f32>,
    output_grad: ArrayView4<f32>,
    [kh, kw]: [usize; 2],
) -> Array4<f32> {
    let (_, ic, _, _) = input.dim();
    let (_, oc, oh, ow) = output_grad.dim();
    let mut weight_grad = Array4::zeros([ic, oc, kh, kw]);
    Zip::indexed(&mut weight_grad).par_for_each(|(ci, co, fi, fj), dw| {
        let x = input.slice(s![.., ci, fi..fi + oh, fj..fj + ow]);
        let dy = output_grad.slice(s![.., co, .., ..]);
        *dw = Zip::from(&x).and(&dy).fold(0., |acc, x, dy| acc + x * dy);
    });
    weight_grad
}

/// Max pooling over non-overlapping [ph, pw] tiles.
///
/// The pool must tile the spatial dimensions of the input exactly.
///
/// The maximum is taken over the rows of each tile, then over the columns. The gradient follows
/// the same two stages: it is split evenly between the columns whose maximum is the tile
/// maximum, then between the entries of each such column equal to that maximum.
pub fn max_pool2(input: &Variable4, pool: [usize; 2]) -> Result<Variable4> {
    let (_, _, ih, iw) = input.dim();
    let [ph, pw] = pool;
    ensure!(
        ph > 0 && pw > 0 && ih % ph == 0 && iw % pw == 0,
        "Pool {pool:?} does not tile input {:?}!",
        input.shape()
    );
    let output = max_pool2_forward(input.value().view(), pool).into_shared();
    let mut builder = Variable4::builder();
    if let Some(node) = input.node() {
        let input = input.value().clone();
        let output = output.clone();
        builder.edge(node, move |output_grad| {
            Ok(max_pool2_backward(
                input.view(),
                output.view(),
                output_grad.view(),
                pool,
            ))
        });
    }
    Ok(builder.build(output))
}

fn max_pool2_forward(input: ArrayView4<f32>, [ph, pw]: [usize; 2]) -> Array4<f32> {
    let (bs, c, ih, iw) = input.dim();
    let mut output = Array4::zeros([bs, c, ih / ph, iw / pw]);
    Zip::from(&mut output)
        .and(input.exact_chunks([1, 1, ph, pw]))
        .par_for_each(|y, x| {
            *y = x.fold(f32::NEG_INFINITY, |m, x| m.max(*x));
        });
    output
}

fn max_pool2_backward(
    input: ArrayView4<f32>,
    output: ArrayView4<f32>,
    output_grad: ArrayView4<f32>,
    [ph, pw]: [usize; 2],
) -> Array4<f32> {
    let mut input_grad = Array4::zeros(input.raw_dim());
    Zip::from(input_grad.exact_chunks_mut([1, 1, ph, pw]))
        .and(input.exact_chunks([1, 1, ph, pw]))
        .and(&output)
        .and(&output_grad)
        .par_for_each(|mut dx, x, y, dy| {
            // Rows of the tile are reduced first, then columns, each stage splitting ties.
            let x = x.slice(s![0, 0, .., ..]);
            let mut dx = dx.slice_mut(s![0, 0, .., ..]);
            let col_max = x.fold_axis(Axis(0), f32::NEG_INFINITY, |m, x| m.max(*x));
            let cols = col_max.iter().filter(|m| **m == *y).count().max(1) as f32;
            for ((x, mut dx), m) in x
                .axis_iter(Axis(1))
                .zip(dx.axis_iter_mut(Axis(1)))
                .zip(col_max.iter())
            {
                if *m != *y {
                    continue;
                }
                let rows = x.iter().filter(|x| **x == *m).count() as f32;
                Zip::from(&mut dx).and(&x).for_each(|dx, x| {
                    if *x == *m {
                        *dx = *dy / (cols * rows);
                    }
                });
            }
        });
    input_grad
}

/// Normalized log probabilities along axis 1.
///
/// Computes `x - logsumexp(x)` for each row, subtracting the row max before exponentiating.
pub fn log_softmax(input: &Variable2) -> Variable2 {
    let output = log_softmax_forward(input.value().view()).into_shared();
    let mut builder = Variable2::builder();
    if let Some(node) = input.node() {
        let output = output.clone();
        builder.edge(node, move |output_grad| {
            let mut input_grad = output_grad.into_owned();
            for (mut dx, y) in input_grad.outer_iter_mut().zip(output.outer_iter()) {
                let dy_sum = dx.sum();
                Zip::from(&mut dx)
                    .and(&y)
                    .for_each(|dx, y| *dx -= y.exp() * dy_sum);
            }
            Ok(input_grad)
        });
    }
    builder.build(output)
}

fn log_softmax_forward(input: ArrayView2<f32>) -> Array2<f32> {
    let mut output = input.to_owned();
    for mut x in output.outer_iter_mut() {
        let max = x.fold(f32::NEG_INFINITY, |m, x| m.max(*x));
        let ln_sum = x.iter().map(|x| (x - max).exp()).sum::<f32>().ln();
        x.mapv_inplace(|x| (x - max) - ln_sum);
    }
    output
}

/// The index of the max of each row.
///
/// The first index wins ties.
pub fn argmax_rows(input: ArrayView2<f32>) -> Array1<usize> {
    input
        .outer_iter()
        .map(|x| {
            x.iter()
                .copied()
                .enumerate()
                .fold((0, f32::NEG_INFINITY), |(i_max, max), (i, x)| {
                    if x > max {
                        (i, x)
                    } else {
                        (i_max, max)
                    }
                })
                .0
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autograd::{value_and_grad, Variable1};
    use approx::assert_relative_eq;
    use ndarray::{array, Array};

    fn sequence(shape: [usize; 4]) -> Array4<f32> {
        let len = shape.iter().product::<usize>();
        Array::from_iter((0..len).map(|x| ((x * 7) % 11) as f32 - 5.))
            .into_shape(shape)
            .unwrap()
    }

    fn conv2_naive(input: &Array4<f32>, weight: &Array4<f32>) -> Array4<f32> {
        let (bs, ic, ih, iw) = input.dim();
        let (_, oc, kh, kw) = weight.dim();
        let (oh, ow) = (ih - kh + 1, iw - kw + 1);
        let mut output = Array4::zeros([bs, oc, oh, ow]);
        for ((b, co, i, j), y) in output.indexed_iter_mut() {
            for ci in 0..ic {
                for fi in 0..kh {
                    for fj in 0..kw {
                        *y += input[[b, ci, i + fi, j + fj]] * weight[[ci, co, fi, fj]];
                    }
                }
            }
        }
        output
    }

    #[test]
    fn conv2_matches_naive() -> Result<()> {
        let input = sequence([2, 3, 6, 5]);
        let weight = sequence([3, 4, 3, 2]).mapv(|x| x / 4.);
        let output = conv2(
            &Variable4::from(input.clone()),
            &Variable4::from(weight.clone()),
        )?;
        assert_eq!(output.shape(), &[2, 4, 4, 4]);
        let expected = conv2_naive(&input, &weight);
        for (y, y_true) in output.value().iter().zip(expected.iter()) {
            assert_relative_eq!(*y, *y_true, epsilon = 1e-4);
        }
        Ok(())
    }

    #[test]
    fn conv2_channel_mismatch() {
        let input = Variable4::from(Array4::zeros([1, 2, 5, 5]));
        let weight = Variable4::from(Array4::zeros([3, 1, 3, 3]));
        assert!(conv2(&input, &weight).is_err());
    }

    #[test]
    fn conv2_grads_match_naive() -> Result<()> {
        // d/dw sum(conv2(x, w) * t) and d/dx of the same, checked against direct sums.
        let input = sequence([2, 2, 4, 4]).mapv(|x| x / 5.);
        let weight = sequence([2, 3, 2, 2]).mapv(|x| x / 7.);
        let target = sequence([2, 3, 3, 3]);
        let n_input = input.len();
        let w = Array::from_iter(input.iter().chain(weight.iter()).copied());
        let (_, dw) = value_and_grad(
            |w: Variable1| {
                let x = w.slice(0..n_input)?.into_shape([2, 2, 4, 4])?;
                let k = w.slice(n_input..w.len())?.into_shape([2, 3, 2, 2])?;
                Ok(conv2(&x, &k)?.mul_const(target.clone().into_shared())?.sum())
            },
            w.view(),
        )?;
        for ((ci, co, fi, fj), dk) in dw
            .slice(s![n_input..])
            .into_shape([2, 3, 2, 2])?
            .indexed_iter()
        {
            let mut expected = 0.;
            for ((b, _, i, j), t) in target.indexed_iter().filter(|((_, c, _, _), _)| *c == co) {
                expected += input[[b, ci, i + fi, j + fj]] * t;
            }
            assert_relative_eq!(*dk, expected, epsilon = 1e-3);
        }
        for ((b, ci, i, j), dx) in dw
            .slice(s![..n_input])
            .into_shape([2, 2, 4, 4])?
            .indexed_iter()
        {
            let mut expected = 0.;
            for ((_, co, fi, fj), k) in weight.indexed_iter().filter(|((c, ..), _)| *c == ci) {
                if i >= fi && j >= fj && i - fi < 3 && j - fj < 3 {
                    expected += k * target[[b, co, i - fi, j - fj]];
                }
            }
            assert_relative_eq!(*dx, expected, epsilon = 1e-3);
        }
        Ok(())
    }

    #[test]
    fn max_pool2_tiles() -> Result<()> {
        let input = sequence([2, 3, 4, 6]);
        let output = max_pool2(&Variable4::from(input.clone()), [2, 3])?;
        assert_eq!(output.shape(), &[2, 3, 2, 2]);
        for ((b, c, i, j), y) in output.value().indexed_iter() {
            let tile = input.slice(s![b, c, 2 * i..2 * i + 2, 3 * j..3 * j + 3]);
            let max = tile.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            assert_eq!(*y, max);
        }
        Ok(())
    }

    #[test]
    fn max_pool2_requires_exact_tiling() {
        let input = Variable4::from(Array4::zeros([1, 1, 5, 4]));
        assert!(max_pool2(&input, [2, 2]).is_err());
    }

    #[test]
    fn max_pool2_splits_ties() -> Result<()> {
        let x = array![1f32, 3., 3., 0., 5., 4., 4., 4.];
        let (y, dx) = value_and_grad(
            |x: Variable1| Ok(max_pool2(&x.into_shape([1, 2, 2, 2])?, [2, 2])?.sum()),
            x.view(),
        )?;
        assert_eq!(y, 8.);
        assert_eq!(dx, array![0f32, 0.5, 0.5, 0., 1., 0., 0., 0.]);
        Ok(())
    }

    #[test]
    fn max_pool2_splits_ties_by_row_then_column() -> Result<()> {
        // Both columns reach 4, column 0 twice.
        let x = array![4f32, 4., 4., 0.];
        let (_, dx) = value_and_grad(
            |x: Variable1| Ok(max_pool2(&x.into_shape([1, 1, 2, 2])?, [2, 2])?.sum()),
            x.view(),
        )?;
        assert_eq!(dx, array![0.25f32, 0.5, 0.25, 0.]);
        Ok(())
    }

    #[test]
    fn log_softmax_normalizes_large_inputs() {
        let input = array![[1000f32, 0., -1000.], [1e4, 1e4, 1e4], [0.1, 0.2, 0.3]];
        let output = log_softmax(&Variable2::from(input));
        for row in output.value().outer_iter() {
            assert!(row.iter().all(|x| x.is_finite()));
            assert_relative_eq!(row.mapv(f32::exp).sum(), 1., epsilon = 1e-5);
        }
    }

    #[test]
    fn log_softmax_keeps_precision_at_large_magnitudes() {
        let input = array![[1e6f32, 1e6, 1e6], [3e7, 3e7, 0.]];
        let output = log_softmax(&Variable2::from(input));
        let output = output.value();
        for x in output.row(0) {
            assert_relative_eq!(*x, -(3f32.ln()), epsilon = 1e-6);
        }
        assert_relative_eq!(output[[1, 0]], -(2f32.ln()), epsilon = 1e-6);
        assert_relative_eq!(output[[1, 1]], -(2f32.ln()), epsilon = 1e-6);
        for row in output.outer_iter() {
            assert_relative_eq!(row.mapv(f32::exp).sum(), 1., epsilon = 1e-6);
        }
    }

    #[test]
    fn log_softmax_grad_is_target_minus_softmax() -> Result<()> {
        // d/dx sum(log_softmax(x) * t) = t - softmax(x) * sum(t)
        let x = array![0.5f32, -1., 2.];
        let t = array![[0f32, 1., 0.]].into_shared();
        let (_, dx) = value_and_grad(
            |x: Variable1| Ok(log_softmax(&x.into_shape([1, 3])?).mul_const(t.clone())?.sum()),
            x.view(),
        )?;
        let softmax = x.mapv(f32::exp) / x.mapv(f32::exp).sum();
        for i in 0..3 {
            assert_relative_eq!(dx[i], t[[0, i]] - softmax[i], epsilon = 1e-6);
        }
        Ok(())
    }

    #[test]
    fn argmax_first_wins() {
        let x = array![[0f32, 2., 2.], [5., 1., 0.], [-1., -1., -1.]];
        assert_eq!(argmax_rows(x.view()), array![1, 0, 0]);
    }
}
