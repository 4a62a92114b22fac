//! Elementwise arithmetic, reductions and value clamping.

use tracing::trace;

use super::{checked_axes, operand, scalar_like, static_int_list, with_tensor};
use crate::error::{LoweringError, LoweringResult};
use crate::lowering::{LowerCtx, LoweredValue};
use crate::source::{kinds, SourceNode};
use crate::target::{ActivationKind, ElementwiseOp, Layer, ReduceOp, UnaryOp};
use crate::tensor::DType;

converter!(ADD, "add", [kinds::ADD, kinds::ADD_], lower_add);
converter!(SUBTRACT, "subtract", [kinds::SUBTRACT], lower_subtract);
converter!(MULTIPLY, "multiply", [kinds::MULTIPLY], lower_multiply);
converter!(DIVIDE, "divide", [kinds::DIVIDE], lower_divide);
converter!(FLOOR_DIVIDE, "floor_divide", [kinds::FLOOR_DIVIDE], lower_floor_divide);
converter!(MAXIMUM, "maximum", [kinds::MAXIMUM], lower_maximum);
converter!(MINIMUM, "minimum", [kinds::MINIMUM], lower_minimum);
converter!(
    REMAINDER,
    "remainder",
    [kinds::REMAINDER, kinds::REMAINDER_],
    lower_remainder
);
converter!(SCALE, "scale", [kinds::SCALE], lower_scale);
converter!(MAX, "max", [kinds::MAX], lower_max);
converter!(MIN, "min", [kinds::MIN], lower_min);
converter!(SUM, "sum", [kinds::SUM], lower_sum);
converter!(ANY, "any", [kinds::ANY], lower_any);
converter!(ALL, "all", [kinds::ALL], lower_all);
converter!(CLIP, "clip", [kinds::CLIP], lower_clip);
converter!(LOG, "log", [kinds::LOG], lower_log);

/// Brings a literal operand to the dtype of the other side.
fn align_dtypes(
    ctx: &mut LowerCtx<'_>,
    lhs: &LoweredValue,
    rhs: &LoweredValue,
) -> LoweringResult<(LoweredValue, LoweredValue)> {
    if lhs.dtype() == rhs.dtype() {
        return Ok((lhs.clone(), rhs.clone()));
    }
    match (lhs.is_constant(), rhs.is_constant()) {
        (_, true) => Ok((lhs.clone(), ctx.cast(rhs, lhs.dtype())?)),
        (true, false) => Ok((ctx.cast(lhs, rhs.dtype())?, rhs.clone())),
        (false, false) => Err(LoweringError::invalid(format!(
            "elementwise operands disagree on dtype: {} vs {}",
            lhs.dtype(),
            rhs.dtype()
        ))),
    }
}

/// Broadcast binary operation over data tensors.
pub(crate) fn elementwise(
    ctx: &mut LowerCtx<'_>,
    op: ElementwiseOp,
    lhs: &LoweredValue,
    rhs: &LoweredValue,
) -> LoweringResult<LoweredValue> {
    let (lhs, rhs) = align_dtypes(ctx, lhs, rhs)?;
    let (lhs, rhs) = ctx.broadcast_pair(&lhs, &rhs)?;
    let lhs = ctx.materialize(&lhs)?;
    let rhs = ctx.materialize(&rhs)?;
    Ok(ctx
        .add_layer(Layer::ElementwiseBinary {
            op,
            lhs: lhs.id,
            rhs: rhs.id,
        })?
        .into())
}

/// `value <op> scalar` with the scalar shaped `[1, .., 1]` so the layer broadcasts it.
pub(crate) fn with_scalar(
    ctx: &mut LowerCtx<'_>,
    op: ElementwiseOp,
    value: &LoweredValue,
    scalar: f64,
) -> LoweringResult<LoweredValue> {
    let lhs = ctx.materialize(value)?;
    let literal = scalar_like(lhs.dtype(), lhs.rank(), scalar)?;
    let rhs = ctx.constant(literal)?;
    Ok(ctx
        .add_layer(Layer::ElementwiseBinary {
            op,
            lhs: lhs.id,
            rhs: rhs.id,
        })?
        .into())
}

fn binary(
    op: ElementwiseOp,
    ctx: &mut LowerCtx<'_>,
    node: &SourceNode,
    inputs: &[LoweredValue],
) -> LoweringResult<Vec<LoweredValue>> {
    let lhs = operand(node, inputs, 0)?;
    let rhs = operand(node, inputs, 1)?;
    Ok(vec![elementwise(ctx, op, lhs, rhs)?])
}

fn lower_add(
    ctx: &mut LowerCtx<'_>,
    node: &SourceNode,
    inputs: &[LoweredValue],
) -> LoweringResult<Vec<LoweredValue>> {
    binary(ElementwiseOp::Sum, ctx, node, inputs)
}

fn lower_subtract(
    ctx: &mut LowerCtx<'_>,
    node: &SourceNode,
    inputs: &[LoweredValue],
) -> LoweringResult<Vec<LoweredValue>> {
    binary(ElementwiseOp::Sub, ctx, node, inputs)
}

fn lower_multiply(
    ctx: &mut LowerCtx<'_>,
    node: &SourceNode,
    inputs: &[LoweredValue],
) -> LoweringResult<Vec<LoweredValue>> {
    binary(ElementwiseOp::Prod, ctx, node, inputs)
}

fn lower_divide(
    ctx: &mut LowerCtx<'_>,
    node: &SourceNode,
    inputs: &[LoweredValue],
) -> LoweringResult<Vec<LoweredValue>> {
    binary(ElementwiseOp::Div, ctx, node, inputs)
}

fn lower_floor_divide(
    ctx: &mut LowerCtx<'_>,
    node: &SourceNode,
    inputs: &[LoweredValue],
) -> LoweringResult<Vec<LoweredValue>> {
    binary(ElementwiseOp::FloorDiv, ctx, node, inputs)
}

fn lower_maximum(
    ctx: &mut LowerCtx<'_>,
    node: &SourceNode,
    inputs: &[LoweredValue],
) -> LoweringResult<Vec<LoweredValue>> {
    binary(ElementwiseOp::Max, ctx, node, inputs)
}

fn lower_minimum(
    ctx: &mut LowerCtx<'_>,
    node: &SourceNode,
    inputs: &[LoweredValue],
) -> LoweringResult<Vec<LoweredValue>> {
    binary(ElementwiseOp::Min, ctx, node, inputs)
}

/// Floor modulo: `x - floor(x / y) * y`, so the result takes the sign of `y`.
fn lower_remainder(
    ctx: &mut LowerCtx<'_>,
    node: &SourceNode,
    inputs: &[LoweredValue],
) -> LoweringResult<Vec<LoweredValue>> {
    let (lhs, rhs) = align_dtypes(ctx, operand(node, inputs, 0)?, operand(node, inputs, 1)?)?;
    let (lhs, rhs) = ctx.broadcast_pair(&lhs, &rhs)?;
    let lhs = ctx.materialize(&lhs)?;
    let rhs = ctx.materialize(&rhs)?;
    let quotient = ctx.add_layer(Layer::ElementwiseBinary {
        op: ElementwiseOp::FloorDiv,
        lhs: lhs.id,
        rhs: rhs.id,
    })?;
    let whole = ctx.add_layer(Layer::ElementwiseBinary {
        op: ElementwiseOp::Prod,
        lhs: rhs.id,
        rhs: quotient.id,
    })?;
    let out = ctx.add_layer(Layer::ElementwiseBinary {
        op: ElementwiseOp::Sub,
        lhs: lhs.id,
        rhs: whole.id,
    })?;
    Ok(vec![out.into()])
}

/// `x * scale + bias`, or `(x + bias) * scale` when `bias_after_scale` is false.
fn lower_scale(
    ctx: &mut LowerCtx<'_>,
    node: &SourceNode,
    inputs: &[LoweredValue],
) -> LoweringResult<Vec<LoweredValue>> {
    let x = operand(node, inputs, 0)?;
    let bias = node.attr_f64_or("bias", 0.0)?;
    let bias_after_scale = node.attr_bool_or("bias_after_scale", true)?;
    let scale = match inputs.get(1) {
        Some(scale) => scale.clone(),
        None => {
            let factor = node.attr_f64_or("scale", 1.0)?;
            scalar_like(x.dtype(), 0, factor)?.into()
        }
    };
    let unit_scale = scale
        .as_constant()
        .is_ok_and(|literal| literal.to_f64s().iter().all(|&v| v == 1.0));

    let apply_scale = |ctx: &mut LowerCtx<'_>, value: &LoweredValue| {
        if unit_scale {
            Ok(value.clone())
        } else {
            elementwise(ctx, ElementwiseOp::Prod, value, &scale)
        }
    };
    let apply_bias = |ctx: &mut LowerCtx<'_>, value: &LoweredValue| {
        if bias == 0.0 {
            Ok(value.clone())
        } else {
            with_scalar(ctx, ElementwiseOp::Sum, value, bias)
        }
    };

    trace!(bias, bias_after_scale, unit_scale, "scale");
    let out = if bias_after_scale {
        let scaled = apply_scale(ctx, x)?;
        apply_bias(ctx, &scaled)?
    } else {
        let shifted = apply_bias(ctx, x)?;
        apply_scale(ctx, &shifted)?
    };
    Ok(vec![out])
}

/// Axis bitmask for a reduction; no axes means every axis.
fn reduce_mask(
    ctx: &LowerCtx<'_>,
    node: &SourceNode,
    inputs: &[LoweredValue],
    rank: usize,
) -> LoweringResult<u32> {
    let listed = static_int_list(node, inputs, 1, "axis")?.unwrap_or_default();
    let axes = if listed.is_empty() {
        (0..rank).collect()
    } else {
        checked_axes(&listed, rank)?
    };
    if ctx.implicit_batch() && axes.contains(&0) {
        return Err(LoweringError::invalid(format!(
            "{} cannot reduce the implicit batch axis",
            node.kind
        )));
    }
    if let Some(&axis) = axes.iter().find(|&&axis| axis >= 32) {
        return Err(LoweringError::unsupported(
            &node.kind,
            format!("axis {axis} does not fit the reduce mask"),
        ));
    }
    Ok(axes.iter().fold(0u32, |mask, &axis| mask | (1 << axis)))
}

fn reduce(
    op: ReduceOp,
    ctx: &mut LowerCtx<'_>,
    node: &SourceNode,
    inputs: &[LoweredValue],
) -> LoweringResult<LoweredValue> {
    let x = operand(node, inputs, 0)?;
    let axes = reduce_mask(ctx, node, inputs, x.rank())?;
    let keep_dims = node.attr_bool_or("keepdim", false)?;
    if x.rank() == 0 {
        return Ok(x.clone());
    }
    with_tensor(ctx, x, |input| Layer::Reduce {
        op,
        input: input.id,
        axes,
        keep_dims,
    })
}

fn lower_max(
    ctx: &mut LowerCtx<'_>,
    node: &SourceNode,
    inputs: &[LoweredValue],
) -> LoweringResult<Vec<LoweredValue>> {
    Ok(vec![reduce(ReduceOp::Max, ctx, node, inputs)?])
}

fn lower_min(
    ctx: &mut LowerCtx<'_>,
    node: &SourceNode,
    inputs: &[LoweredValue],
) -> LoweringResult<Vec<LoweredValue>> {
    Ok(vec![reduce(ReduceOp::Min, ctx, node, inputs)?])
}

/// Sums in the declared output dtype.
fn lower_sum(
    ctx: &mut LowerCtx<'_>,
    node: &SourceNode,
    inputs: &[LoweredValue],
) -> LoweringResult<Vec<LoweredValue>> {
    let dtype = node.output_spec(0)?.dtype;
    let mut inputs = inputs.to_vec();
    if let Some(x) = inputs.first_mut() {
        if x.dtype() != dtype {
            *x = ctx.cast(x, dtype)?;
        }
    }
    Ok(vec![reduce(ReduceOp::Sum, ctx, node, &inputs)?])
}

/// Bool reduction through an `int32` max/min.
fn reduce_bool(
    op: ReduceOp,
    ctx: &mut LowerCtx<'_>,
    node: &SourceNode,
    inputs: &[LoweredValue],
) -> LoweringResult<Vec<LoweredValue>> {
    let x = operand(node, inputs, 0)?;
    let mut cast = inputs.to_vec();
    cast[0] = ctx.cast(x, DType::Si32)?;
    let reduced = reduce(op, ctx, node, &cast)?;
    Ok(vec![ctx.cast(&reduced, DType::I1)?])
}

fn lower_any(
    ctx: &mut LowerCtx<'_>,
    node: &SourceNode,
    inputs: &[LoweredValue],
) -> LoweringResult<Vec<LoweredValue>> {
    reduce_bool(ReduceOp::Max, ctx, node, inputs)
}

fn lower_all(
    ctx: &mut LowerCtx<'_>,
    node: &SourceNode,
    inputs: &[LoweredValue],
) -> LoweringResult<Vec<LoweredValue>> {
    reduce_bool(ReduceOp::Min, ctx, node, inputs)
}

fn literal_scalar(value: &LoweredValue) -> Option<f64> {
    let literal = value.as_constant().ok()?;
    match literal.to_f64s().as_slice() {
        [value] => Some(*value),
        _ => None,
    }
}

/// Literal bounds on a float input become one clip activation; anything else uses max/min.
fn lower_clip(
    ctx: &mut LowerCtx<'_>,
    node: &SourceNode,
    inputs: &[LoweredValue],
) -> LoweringResult<Vec<LoweredValue>> {
    let x = operand(node, inputs, 0)?;
    let min = operand(node, inputs, 1)?;
    let max = operand(node, inputs, 2)?;
    if let (true, Some(lower), Some(upper)) =
        (x.dtype().is_float(), literal_scalar(min), literal_scalar(max))
    {
        trace!(lower, upper, "clip activation");
        let out = with_tensor(ctx, x, |input| Layer::Activation {
            kind: ActivationKind::Clip,
            input: input.id,
            alpha: lower,
            beta: upper,
        })?;
        return Ok(vec![out]);
    }
    let floored = elementwise(ctx, ElementwiseOp::Max, x, min)?;
    Ok(vec![elementwise(ctx, ElementwiseOp::Min, &floored, max)?])
}

/// Integer inputs are promoted to `float32` first.
fn lower_log(
    ctx: &mut LowerCtx<'_>,
    node: &SourceNode,
    inputs: &[LoweredValue],
) -> LoweringResult<Vec<LoweredValue>> {
    let mut x = operand(node, inputs, 0)?.clone();
    if !x.dtype().is_float() {
        x = ctx.cast(&x, DType::F32)?;
    }
    let out = with_tensor(ctx, &x, |input| Layer::Unary {
        op: UnaryOp::Log,
        input: input.id,
    })?;
    Ok(vec![out])
}
