//! Index-rearranging operators: tile and roll.

use tracing::trace;

use super::{literal_ints, operand};
use crate::error::{LoweringError, LoweringResult};
use crate::lowering::{checked_axis, LowerCtx, LoweredValue};
use crate::source::{kinds, SourceNode};
use crate::target::{GatherMode, Layer, SampleMode};
use crate::tensor::Dimension;

converter!(TILE, "tile", [kinds::TILE], lower_tile);
converter!(ROLL, "roll", [kinds::ROLL], lower_roll);

/// Length of a 1-D index operand, literal or runtime.
fn vector_len(node: &SourceNode, value: &LoweredValue, what: &str) -> LoweringResult<usize> {
    match value.shape().dims() {
        [] => Ok(1),
        [Dimension::Static(len)] => Ok(*len),
        [Dimension::Dynamic] => Err(LoweringError::unsupported(
            &node.kind,
            format!("{what} has unknown length"),
        )),
        _ => Err(LoweringError::invalid(format!(
            "{}: {what} must be a vector, got {}",
            node.kind,
            value.spec()
        ))),
    }
}

/// Repeats the input by reading it with a wrapping slice over the enlarged shape.
fn lower_tile(
    ctx: &mut LowerCtx<'_>,
    node: &SourceNode,
    inputs: &[LoweredValue],
) -> LoweringResult<Vec<LoweredValue>> {
    let mut x = operand(node, inputs, 0)?.clone();
    let repeats_value = operand(node, inputs, 1)?;
    let rank = x.rank();
    let repeat_rank = vector_len(node, repeats_value, "repeat_times")?;
    if literal_ints(repeats_value)?.is_some_and(|repeats| repeats.iter().any(|&r| r < 0)) {
        return Err(LoweringError::invalid("tile repeat_times must be non-negative"));
    }

    let mut repeats = ctx.shape_vector(repeats_value)?;
    if rank > repeat_rank {
        let ones = ctx.int_const(&vec![1; rank - repeat_rank])?;
        repeats = ctx.concat(&[ones, repeats])?;
    } else if rank < repeat_rank {
        x = ctx.pad_rank(&x, repeat_rank)?;
    }
    let out_rank = rank.max(repeat_rank);

    let shape = ctx.shape_of(&x)?;
    let size = ctx.mul(&shape, &repeats)?;
    let start = ctx.int_const(&vec![0; out_rank])?;
    let stride = ctx.int_const(&vec![1; out_rank])?;
    trace!(rank = out_rank, "tile via wrapping slice");
    Ok(vec![ctx.slice(&x, &start, &size, &stride, SampleMode::Wrap)?])
}

/// Rotates along each axis by gathering `[start, extent)` followed by `[0, start)`.
fn lower_roll(
    ctx: &mut LowerCtx<'_>,
    node: &SourceNode,
    inputs: &[LoweredValue],
) -> LoweringResult<Vec<LoweredValue>> {
    let x = operand(node, inputs, 0)?;
    let shifts_value = operand(node, inputs, 1)?;
    let shifts = literal_ints(shifts_value)?;
    let listed = node.attr_i64_array("axis")?.unwrap_or_default();
    let shift_count = vector_len(node, shifts_value, "shifts")?;

    // Without axes the flattened tensor is rolled and the shape restored.
    if listed.is_empty() {
        if shift_count != 1 {
            return Err(LoweringError::invalid(format!(
                "roll without axes takes one shift, got {shift_count}"
            )));
        }
        let shape = ctx.shape_of(x)?;
        let flat = ctx.reshape_static(x, &[-1])?;
        let rolled = roll_axes(ctx, &flat, shifts_value, shifts.as_deref(), &[0])?;
        return Ok(vec![ctx.reshape(&rolled, &shape)?]);
    }

    if shift_count != listed.len() {
        return Err(LoweringError::invalid(format!(
            "roll has {shift_count} shifts for {} axes",
            listed.len()
        )));
    }
    let axes = listed
        .iter()
        .map(|&axis| checked_axis(axis, x.rank()))
        .collect::<LoweringResult<Vec<_>>>()?;
    Ok(vec![roll_axes(ctx, x, shifts_value, shifts.as_deref(), &axes)?])
}

fn roll_axes(
    ctx: &mut LowerCtx<'_>,
    x: &LoweredValue,
    shifts_value: &LoweredValue,
    shifts: Option<&[i64]>,
    axes: &[usize],
) -> LoweringResult<LoweredValue> {
    let zero = ctx.int_const(&[0])?;
    let mut current = x.clone();
    for (slot, &axis) in axes.iter().enumerate() {
        let shift = match shifts {
            Some(values) => ctx.int_const(&[values[slot]])?,
            None => {
                let vector = ctx.shape_vector(shifts_value)?;
                ctx.gather_element(&vector, slot)?
            }
        };
        let extent = ctx.dim_size(&current, axis)?;
        if extent.as_ints().is_ok_and(|values| values == [0]) {
            continue;
        }

        // start = ((extent - shift) mod extent + extent) mod extent
        let behind = ctx.sub(&extent, &shift)?;
        let start = euclid_rem(ctx, &behind, &extent)?;
        let start = ctx.sum(&start, &extent)?;
        let start = euclid_rem(ctx, &start, &extent)?;

        let tail = ctx.sub(&extent, &start)?;
        let first = ctx.arange(&start, &tail)?;
        let second = ctx.arange(&zero, &start)?;
        let indices = ctx.concat(&[first, second])?;
        let indices = ctx.materialize(&indices)?;
        let data = ctx.materialize(&current)?;
        trace!(axis, "roll gather");
        current = ctx
            .add_layer(Layer::Gather {
                data: data.id,
                indices: indices.id,
                axis,
                mode: GatherMode::Default,
            })?
            .into();
    }
    Ok(current)
}

/// `value - floor(value / modulus) * modulus`
fn euclid_rem(
    ctx: &mut LowerCtx<'_>,
    value: &LoweredValue,
    modulus: &LoweredValue,
) -> LoweringResult<LoweredValue> {
    let quotient = ctx.floor_div(value, modulus)?;
    let whole = ctx.mul(&quotient, modulus)?;
    ctx.sub(value, &whole)
}
