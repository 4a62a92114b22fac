//! Activation functions.

use std::f64::consts::FRAC_1_SQRT_2;

use super::math::with_scalar;
use super::{operand, with_tensor};
use crate::error::{LoweringError, LoweringResult};
use crate::lowering::{checked_axis, LowerCtx, LoweredValue};
use crate::source::{kinds, SourceNode};
use crate::target::{ActivationKind, ElementwiseOp, Layer, UnaryOp};

converter!(RELU, "relu", [kinds::RELU], lower_relu);
converter!(TANH, "tanh", [kinds::TANH], lower_tanh);
converter!(SIGMOID, "sigmoid", [kinds::SIGMOID], lower_sigmoid);
converter!(SOFTMAX, "softmax", [kinds::SOFTMAX], lower_softmax);
converter!(GELU, "gelu", [kinds::GELU], lower_gelu);
converter!(HARDSIGMOID, "hardsigmoid", [kinds::HARDSIGMOID], lower_hardsigmoid);
converter!(HARDSWISH, "hardswish", [kinds::HARDSWISH], lower_hardswish);
converter!(SOFTPLUS, "softplus", [kinds::SOFTPLUS], lower_softplus);
converter!(SWISH, "swish", [kinds::SWISH, kinds::SILU], lower_swish);

/// Lowest finite `float32`, used as an open lower clip bound.
const F32_LOWEST: f64 = f32::MIN as f64;

fn activation(
    ctx: &mut LowerCtx<'_>,
    kind: ActivationKind,
    x: &LoweredValue,
    alpha: f64,
    beta: f64,
) -> LoweringResult<LoweredValue> {
    with_tensor(ctx, x, |input| Layer::Activation {
        kind,
        input: input.id,
        alpha,
        beta,
    })
}

fn product(
    ctx: &mut LowerCtx<'_>,
    lhs: &LoweredValue,
    rhs: &LoweredValue,
) -> LoweringResult<LoweredValue> {
    let lhs = ctx.materialize(lhs)?;
    let rhs = ctx.materialize(rhs)?;
    Ok(ctx
        .add_layer(Layer::ElementwiseBinary {
            op: ElementwiseOp::Prod,
            lhs: lhs.id,
            rhs: rhs.id,
        })?
        .into())
}

fn lower_relu(
    ctx: &mut LowerCtx<'_>,
    node: &SourceNode,
    inputs: &[LoweredValue],
) -> LoweringResult<Vec<LoweredValue>> {
    let x = operand(node, inputs, 0)?;
    Ok(vec![activation(ctx, ActivationKind::Relu, x, 0.0, 0.0)?])
}

fn lower_tanh(
    ctx: &mut LowerCtx<'_>,
    node: &SourceNode,
    inputs: &[LoweredValue],
) -> LoweringResult<Vec<LoweredValue>> {
    let x = operand(node, inputs, 0)?;
    Ok(vec![activation(ctx, ActivationKind::Tanh, x, 0.0, 0.0)?])
}

fn lower_sigmoid(
    ctx: &mut LowerCtx<'_>,
    node: &SourceNode,
    inputs: &[LoweredValue],
) -> LoweringResult<Vec<LoweredValue>> {
    let x = operand(node, inputs, 0)?;
    Ok(vec![activation(ctx, ActivationKind::Sigmoid, x, 0.0, 0.0)?])
}

fn lower_softmax(
    ctx: &mut LowerCtx<'_>,
    node: &SourceNode,
    inputs: &[LoweredValue],
) -> LoweringResult<Vec<LoweredValue>> {
    let x = operand(node, inputs, 0)?;
    let axis = checked_axis(node.attr_i64_or("axis", -1)?, x.rank())?;
    if axis >= 32 {
        return Err(LoweringError::unsupported(
            &node.kind,
            format!("axis {axis} does not fit the softmax mask"),
        ));
    }
    let out = with_tensor(ctx, x, |input| Layer::Softmax {
        input: input.id,
        axes: 1 << axis,
    })?;
    Ok(vec![out])
}

/// Exact form `0.5 * x * (1 + erf(x / sqrt(2)))`; the tanh approximation is not lowered.
fn lower_gelu(
    ctx: &mut LowerCtx<'_>,
    node: &SourceNode,
    inputs: &[LoweredValue],
) -> LoweringResult<Vec<LoweredValue>> {
    if node.attr_bool_or("approximate", false)? {
        return Err(LoweringError::unsupported(
            &node.kind,
            "approximate gelu is not supported",
        ));
    }
    let x = operand(node, inputs, 0)?;
    let scaled = with_scalar(ctx, ElementwiseOp::Prod, x, FRAC_1_SQRT_2)?;
    let erf = with_tensor(ctx, &scaled, |input| Layer::Unary {
        op: UnaryOp::Erf,
        input: input.id,
    })?;
    let shifted = with_scalar(ctx, ElementwiseOp::Sum, &erf, 1.0)?;
    let halved = with_scalar(ctx, ElementwiseOp::Prod, &shifted, 0.5)?;
    Ok(vec![product(ctx, x, &halved)?])
}

fn lower_hardsigmoid(
    ctx: &mut LowerCtx<'_>,
    node: &SourceNode,
    inputs: &[LoweredValue],
) -> LoweringResult<Vec<LoweredValue>> {
    let x = operand(node, inputs, 0)?;
    let slope = node.attr_f64_or("slope", 1.0 / 6.0)?;
    let offset = node.attr_f64_or("offset", 0.5)?;
    Ok(vec![activation(
        ctx,
        ActivationKind::HardSigmoid,
        x,
        slope,
        offset,
    )?])
}

/// `x * hardsigmoid(x)` with slope 1/6 and offset 1/2.
fn lower_hardswish(
    ctx: &mut LowerCtx<'_>,
    node: &SourceNode,
    inputs: &[LoweredValue],
) -> LoweringResult<Vec<LoweredValue>> {
    let x = operand(node, inputs, 0)?;
    let gate = activation(ctx, ActivationKind::HardSigmoid, x, 1.0 / 6.0, 0.5)?;
    Ok(vec![product(ctx, x, &gate)?])
}

/// `log(1 + exp(beta * x)) / beta`, passing `x` through where `beta * x > threshold`.
fn lower_softplus(
    ctx: &mut LowerCtx<'_>,
    node: &SourceNode,
    inputs: &[LoweredValue],
) -> LoweringResult<Vec<LoweredValue>> {
    let x = operand(node, inputs, 0)?;
    let beta = node.attr_f64_or("beta", 1.0)?;
    let threshold = node.attr_f64_or("threshold", 20.0)?;
    if beta == 0.0 {
        return Err(LoweringError::invalid("softplus beta is zero"));
    }
    let clipped = activation(ctx, ActivationKind::Clip, x, F32_LOWEST, threshold / beta)?;
    let smooth = activation(ctx, ActivationKind::Softplus, &clipped, 1.0 / beta, beta)?;

    let input = ctx.materialize(x)?;
    let scaled = with_scalar(ctx, ElementwiseOp::Prod, &input.clone().into(), beta)?;
    let linear = with_scalar(ctx, ElementwiseOp::Greater, &scaled, threshold)?;
    let smooth = ctx.materialize(&smooth)?;
    let linear = ctx.materialize(&linear)?;
    let out = ctx.add_layer(Layer::Select {
        condition: linear.id,
        then_value: input.id,
        else_value: smooth.id,
    })?;
    Ok(vec![out.into()])
}

/// `x * sigmoid(x)`; swish and silu share the lowering.
fn lower_swish(
    ctx: &mut LowerCtx<'_>,
    node: &SourceNode,
    inputs: &[LoweredValue],
) -> LoweringResult<Vec<LoweredValue>> {
    let x = operand(node, inputs, 0)?;
    let gate = activation(ctx, ActivationKind::Sigmoid, x, 0.0, 0.0)?;
    Ok(vec![product(ctx, x, &gate)?])
}
