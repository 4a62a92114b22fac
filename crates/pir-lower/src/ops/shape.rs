//! Reshape-like operators: reshape, flatten, concat, stack, (un)squeeze, expand, cast, arange.

use tracing::trace;

use super::{checked_axes, literal_ints, operand, static_int_list, with_tensor};
use crate::error::{LoweringError, LoweringResult};
use crate::lowering::{checked_axis, LowerCtx, LoweredValue};
use crate::source::{kinds, node_dtype, SourceNode};
use crate::target::{GatherMode, Layer, LayerParam};
use crate::tensor::{DType, Dimension, TensorLiteral};

converter!(RESHAPE, "reshape", [kinds::RESHAPE], lower_reshape);
converter!(FLATTEN, "flatten", [kinds::FLATTEN], lower_flatten);
converter!(CONCAT, "concat", [kinds::CONCAT], lower_concat);
converter!(STACK, "stack", [kinds::STACK], lower_stack);
converter!(
    UNSQUEEZE,
    "unsqueeze",
    [kinds::UNSQUEEZE, kinds::UNSQUEEZE_],
    lower_unsqueeze
);
converter!(SQUEEZE, "squeeze", [kinds::SQUEEZE, kinds::SQUEEZE_], lower_squeeze);
converter!(EXPAND, "expand", [kinds::EXPAND], lower_expand);
converter!(EXPAND_AS, "expand_as", [kinds::EXPAND_AS], lower_expand_as);
converter!(CAST, "cast", [kinds::CAST, kinds::CAST_], lower_cast);
converter!(GATHER_ND, "gather_nd", [kinds::GATHER_ND], lower_gather_nd);
converter!(ARANGE, "arange", [kinds::ARANGE], lower_arange);

/// Largest sequence folded into a literal; longer ones become an `Arange` layer.
const ARANGE_FOLD_LIMIT: usize = 1 << 16;

/// A literal target shape is set directly on the shuffle; `0` copies the input extent.
fn lower_reshape(
    ctx: &mut LowerCtx<'_>,
    node: &SourceNode,
    inputs: &[LoweredValue],
) -> LoweringResult<Vec<LoweredValue>> {
    let x = operand(node, inputs, 0)?;
    let shape = operand(node, inputs, 1)?;
    let input = ctx.materialize(x)?;
    let reshape = match literal_ints(shape)? {
        Some(dims) => {
            trace!(?dims, "static reshape");
            LayerParam::Static(dims)
        }
        None => {
            trace!("dynamic reshape");
            let dims = ctx.shape_vector(shape)?;
            LayerParam::Runtime(ctx.materialize(&dims)?.id)
        }
    };
    let out = ctx.add_layer(Layer::Shuffle {
        input: input.id,
        first_transpose: None,
        reshape: Some(reshape),
        zero_is_placeholder: true,
    })?;
    Ok(vec![out.into()])
}

fn lower_flatten(
    ctx: &mut LowerCtx<'_>,
    node: &SourceNode,
    inputs: &[LoweredValue],
) -> LoweringResult<Vec<LoweredValue>> {
    let x = operand(node, inputs, 0)?;
    let rank = x.rank();
    if rank == 0 {
        return Ok(vec![ctx.reshape_static(x, &[1])?]);
    }
    let start = checked_axis(node.attr_i64_or("start_axis", 0)?, rank)?;
    let stop = checked_axis(node.attr_i64_or("stop_axis", -1)?, rank)?;
    if start > stop {
        return Err(LoweringError::invalid(format!(
            "flatten start_axis {start} is after stop_axis {stop}"
        )));
    }

    if let Some(dims) = x.shape().static_dims() {
        let dims: Vec<i64> = dims.iter().map(|&dim| dim as i64).collect();
        let mut target = dims[..start].to_vec();
        target.push(dims[start..=stop].iter().product());
        target.extend_from_slice(&dims[stop + 1..]);
        trace!(?target, "static flatten");
        return Ok(vec![ctx.reshape_static(x, &target)?]);
    }

    trace!(start, stop, "dynamic flatten");
    let shape = ctx.shape_of(x)?;
    let mut parts = Vec::with_capacity(3);
    if start > 0 {
        parts.push(ctx.slice_1d(&shape, 0, start)?);
    }
    let flattened = ctx.slice_1d(&shape, start, stop - start + 1)?;
    parts.push(ctx.reduce_prod(&flattened)?);
    if stop + 1 < rank {
        parts.push(ctx.slice_1d(&shape, stop + 1, rank - stop - 1)?);
    }
    let target = ctx.concat(&parts)?;
    Ok(vec![ctx.reshape(x, &target)?])
}

/// Operands are the inputs followed by the axis.
fn lower_concat(
    ctx: &mut LowerCtx<'_>,
    node: &SourceNode,
    inputs: &[LoweredValue],
) -> LoweringResult<Vec<LoweredValue>> {
    let (axis, parts) = inputs
        .split_last()
        .filter(|(_, parts)| !parts.is_empty())
        .ok_or_else(|| LoweringError::invalid("concat needs inputs and an axis operand"))?;
    let axis = match axis.as_scalar_int() {
        Ok(axis) => axis,
        Err(LoweringError::NotConstant) => {
            return Err(LoweringError::unsupported(
                &node.kind,
                "axis must be a constant",
            ))
        }
        Err(err) => return Err(err),
    };
    let axis = checked_axis(axis, parts[0].rank())?;
    let mut tensors = Vec::with_capacity(parts.len());
    for part in parts {
        tensors.push(ctx.materialize(part)?.id);
    }
    let out = ctx.add_layer(Layer::Concat {
        inputs: tensors,
        axis,
    })?;
    Ok(vec![out.into()])
}

fn lower_stack(
    ctx: &mut LowerCtx<'_>,
    node: &SourceNode,
    inputs: &[LoweredValue],
) -> LoweringResult<Vec<LoweredValue>> {
    let first = operand(node, inputs, 0)?;
    let axis = checked_axis(node.attr_i64_or("axis", 0)?, first.rank() + 1)?;
    let mut tensors = Vec::with_capacity(inputs.len());
    for input in inputs {
        let expanded = ctx.insert_unit_dim(input, axis)?;
        tensors.push(ctx.materialize(&expanded)?.id);
    }
    let out = ctx.add_layer(Layer::Concat {
        inputs: tensors,
        axis,
    })?;
    Ok(vec![out.into()])
}

/// Axes are inserted in order, each relative to the rank reached so far.
fn lower_unsqueeze(
    ctx: &mut LowerCtx<'_>,
    node: &SourceNode,
    inputs: &[LoweredValue],
) -> LoweringResult<Vec<LoweredValue>> {
    let mut value = operand(node, inputs, 0)?.clone();
    let axes = static_int_list(node, inputs, 1, "axis")?.unwrap_or_default();
    for axis in axes {
        let axis = checked_axis(axis, value.rank() + 1)?;
        value = ctx.insert_unit_dim(&value, axis)?;
    }
    Ok(vec![value])
}

/// Drops listed axes of extent 1; dynamic candidates go only when the declared output needs it.
fn lower_squeeze(
    ctx: &mut LowerCtx<'_>,
    node: &SourceNode,
    inputs: &[LoweredValue],
) -> LoweringResult<Vec<LoweredValue>> {
    let x = operand(node, inputs, 0)?;
    let rank = x.rank();
    let listed = static_int_list(node, inputs, 1, "axis")?.unwrap_or_default();
    let candidates = if listed.is_empty() {
        (0..rank).collect()
    } else {
        checked_axes(&listed, rank)?
    };
    let dims = x.shape().dims();
    let unit: Vec<usize> = candidates
        .iter()
        .copied()
        .filter(|&axis| dims[axis] == Dimension::Static(1))
        .collect();
    let dynamic: Vec<usize> = candidates
        .iter()
        .copied()
        .filter(|&axis| dims[axis].is_dynamic())
        .collect();
    let declared = node.output_rank(0)?;
    let mut dropped = unit;
    if !dynamic.is_empty() && rank - dropped.len() - dynamic.len() == declared {
        trace!(?dynamic, "squeezing dynamic axes per declared output rank");
        dropped.extend(dynamic);
    }
    Ok(vec![ctx.drop_axes(x, &dropped)?])
}

fn lower_expand(
    ctx: &mut LowerCtx<'_>,
    node: &SourceNode,
    inputs: &[LoweredValue],
) -> LoweringResult<Vec<LoweredValue>> {
    let x = operand(node, inputs, 0)?;
    let shape = operand(node, inputs, 1)?;
    let target_rank = match literal_ints(shape)? {
        Some(dims) => dims.len(),
        None => match shape.rank() {
            0 => 1,
            _ => shape.dim(0).and_then(Dimension::as_static).ok_or_else(|| {
                LoweringError::unsupported(&node.kind, "target shape has unknown length")
            })?,
        },
    };
    expand_to(ctx, x, target_rank, shape)
}

/// Broadcasts to the shape of the second operand, or to the `target_shape` attribute.
fn lower_expand_as(
    ctx: &mut LowerCtx<'_>,
    node: &SourceNode,
    inputs: &[LoweredValue],
) -> LoweringResult<Vec<LoweredValue>> {
    let x = operand(node, inputs, 0)?;
    let (target_rank, shape) = match inputs.get(1) {
        Some(y) => (y.rank(), ctx.shape_of(y)?),
        None => {
            let dims = node.require_i64_array("target_shape")?;
            (dims.len(), ctx.int_const(&dims)?)
        }
    };
    expand_to(ctx, x, target_rank, &shape)
}

fn expand_to(
    ctx: &mut LowerCtx<'_>,
    x: &LoweredValue,
    target_rank: usize,
    shape: &LoweredValue,
) -> LoweringResult<Vec<LoweredValue>> {
    if target_rank < x.rank() {
        return Err(LoweringError::invalid(format!(
            "cannot expand rank {} to rank {target_rank}",
            x.rank()
        )));
    }
    Ok(vec![ctx.expand(x, target_rank, shape)?])
}

fn lower_cast(
    ctx: &mut LowerCtx<'_>,
    node: &SourceNode,
    inputs: &[LoweredValue],
) -> LoweringResult<Vec<LoweredValue>> {
    let x = operand(node, inputs, 0)?;
    let dtype = node_dtype(node, "dtype")?;
    Ok(vec![ctx.cast(x, dtype)?])
}

/// The last index axis holds coordinate tuples into the leading data axes.
fn lower_gather_nd(
    ctx: &mut LowerCtx<'_>,
    node: &SourceNode,
    inputs: &[LoweredValue],
) -> LoweringResult<Vec<LoweredValue>> {
    let x = operand(node, inputs, 0)?;
    let index = operand(node, inputs, 1)?;
    if !index.dtype().is_integer() {
        return Err(LoweringError::invalid(format!(
            "gather_nd index must be an integer tensor, got {}",
            index.spec()
        )));
    }
    let indices = ctx.materialize(index)?;
    let out = with_tensor(ctx, x, |data| Layer::Gather {
        data: data.id,
        indices: indices.id,
        axis: 0,
        mode: GatherMode::Nd,
    })?;
    Ok(vec![out])
}

/// `[start, end)` by `step`; the element count is `ceil((end - start) / step)`.
fn lower_arange(
    ctx: &mut LowerCtx<'_>,
    node: &SourceNode,
    inputs: &[LoweredValue],
) -> LoweringResult<Vec<LoweredValue>> {
    let start = operand(node, inputs, 0)?;
    let end = operand(node, inputs, 1)?;
    let step = operand(node, inputs, 2)?;
    let dtype = node_dtype(node, "dtype")?;

    if let (Ok(first), Ok(last), Ok(delta)) =
        (start.as_constant(), end.as_constant(), step.as_constant())
    {
        let (first, last, delta) = (scalar(first)?, scalar(last)?, scalar(delta)?);
        if delta == 0.0 {
            return Err(LoweringError::invalid("arange step is zero"));
        }
        let count = ((last - first) / delta).ceil().max(0.0) as usize;
        if count <= ARANGE_FOLD_LIMIT {
            let values: Vec<f64> = (0..count).map(|i| first + i as f64 * delta).collect();
            trace!(count, "static arange");
            return Ok(vec![TensorLiteral::from_f64s(dtype, &[count], &values)?.into()]);
        }
        if first.fract() != 0.0 || delta.fract() != 0.0 {
            return Err(LoweringError::unsupported(
                &node.kind,
                format!("fractional sequence of {count} elements is too long to fold"),
            ));
        }
        trace!(count, "arange too long to fold");
        let out = ctx.add_layer(Layer::Arange {
            count: LayerParam::Static(vec![count as i64]),
            start: LayerParam::Static(vec![first as i64]),
            step: LayerParam::Static(vec![delta as i64]),
            dtype: DType::Si32,
        })?;
        return Ok(vec![ctx.cast(&LoweredValue::from(out), dtype)?]);
    }

    if !dtype.is_integer() || [start, end, step].iter().any(|v| v.dtype().is_float()) {
        return Err(LoweringError::unsupported(
            &node.kind,
            "runtime bounds need an integer sequence",
        ));
    }
    let span = ctx.sub(end, start)?;
    let zero = ctx.int_const(&[0])?;
    let negated = ctx.sub(&zero, &span)?;
    let quotient = ctx.floor_div(&negated, step)?;
    let count = ctx.sub(&zero, &quotient)?;
    let count = ctx.max(&count, &zero)?;
    let count = ctx.layer_param(&count)?;
    let first = ctx.layer_param(start)?;
    let delta = ctx.layer_param(step)?;
    let out = ctx.add_layer(Layer::Arange {
        count,
        start: first,
        step: delta,
        dtype: DType::Si32,
    })?;
    Ok(vec![ctx.cast(&LoweredValue::from(out), dtype)?])
}

fn scalar(literal: &TensorLiteral) -> LoweringResult<f64> {
    match literal.to_f64s().as_slice() {
        [value] => Ok(*value),
        other => Err(LoweringError::invalid(format!(
            "expected a scalar bound, found {} values",
            other.len()
        ))),
    }
}
