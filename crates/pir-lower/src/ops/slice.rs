//! Window-selecting operators: slice, strided_slice, split and split_with_num.
//!
//! All four end in one full-rank slice layer per output. Start, size and
//! stride vectors are assembled per axis with the shape-arithmetic helpers,
//! so a literal input shape yields literal parameters and a dynamic one
//! yields a small subgraph over the runtime shape.

use tracing::trace;

use super::{checked_axes, literal_ints, operand};
use crate::error::{LoweringError, LoweringResult};
use crate::lowering::{checked_axis, LowerCtx, LoweredValue};
use crate::source::{kinds, SourceNode};
use crate::target::SampleMode;
use crate::tensor::Dimension;

converter!(SLICE, "slice", [kinds::SLICE], lower_slice);
converter!(STRIDED_SLICE, "strided_slice", [kinds::STRIDED_SLICE], lower_strided_slice);
converter!(SPLIT, "split", [kinds::SPLIT], lower_split);
converter!(SPLIT_WITH_NUM, "split_with_num", [kinds::SPLIT_WITH_NUM], lower_split_with_num);

/// Entry `index` of an index operand as a one-element vector.
///
/// Literal entries saturate to the int32 range of target shape tensors, so
/// sentinels such as `i64::MAX` still clamp to the axis extent.
fn element(
    ctx: &mut LowerCtx<'_>,
    value: &LoweredValue,
    literal: Option<&[i64]>,
    index: usize,
) -> LoweringResult<LoweredValue> {
    match literal {
        Some(values) => {
            let entry = values.get(index).copied().ok_or_else(|| {
                LoweringError::invalid(format!(
                    "index list has {} entries, axis #{index} needs one",
                    values.len()
                ))
            })?;
            ctx.int_const(&[entry.clamp(i64::from(i32::MIN), i64::from(i32::MAX))])
        }
        None => {
            let vector = ctx.shape_vector(value)?;
            ctx.gather_element(&vector, index)
        }
    }
}

fn check_len(what: &str, literal: Option<&[i64]>, axes: usize) -> LoweringResult<()> {
    match literal {
        Some(values) if values.len() != axes => Err(LoweringError::invalid(format!(
            "{what} has {} entries for {axes} axes",
            values.len()
        ))),
        _ => Ok(()),
    }
}

fn lower_slice(
    ctx: &mut LowerCtx<'_>,
    node: &SourceNode,
    inputs: &[LoweredValue],
) -> LoweringResult<Vec<LoweredValue>> {
    let x = operand(node, inputs, 0)?;
    let starts_value = operand(node, inputs, 1)?;
    let ends_value = operand(node, inputs, 2)?;
    let rank = x.rank();
    let axes = checked_axes(&node.require_i64_array("axes")?, rank)?;
    let decrease = checked_axes(
        &node.attr_i64_array("decrease_axis")?.unwrap_or_default(),
        rank,
    )?;
    let starts = literal_ints(starts_value)?;
    let ends = literal_ints(ends_value)?;
    check_len("starts", starts.as_deref(), axes.len())?;
    check_len("ends", ends.as_deref(), axes.len())?;

    let zero = ctx.int_const(&[0])?;
    let mut start_parts = Vec::with_capacity(rank);
    let mut size_parts = Vec::with_capacity(rank);
    for axis in 0..rank {
        let dim = ctx.dim_size(x, axis)?;
        let Some(slot) = axes.iter().position(|&listed| listed == axis) else {
            start_parts.push(zero.clone());
            size_parts.push(dim);
            continue;
        };
        let start = element(ctx, starts_value, starts.as_deref(), slot)?;
        let start = ctx.normalize_index(&start, &dim)?;
        let start = ctx.clamp(&start, &zero, &dim)?;
        let end = element(ctx, ends_value, ends.as_deref(), slot)?;
        let end = ctx.normalize_index(&end, &dim)?;
        let end = ctx.clamp(&end, &zero, &dim)?;
        let size = ctx.sub(&end, &start)?;
        start_parts.push(start);
        size_parts.push(ctx.max(&size, &zero)?);
    }
    let start = ctx.concat(&start_parts)?;
    let size = ctx.concat(&size_parts)?;
    let stride = ctx.int_const(&vec![1; rank])?;
    let out = ctx.slice(x, &start, &size, &stride, SampleMode::Strict)?;

    if decrease.is_empty() {
        return Ok(vec![out]);
    }
    trace!(?decrease, "dropping decreased axes");
    if decrease.len() == rank && node.output_rank(0)? == 1 {
        return Ok(vec![ctx.reshape_static(&out, &[1])?]);
    }
    Ok(vec![ctx.drop_axes(&out, &decrease)?])
}

/// Negative literal indices are resolved now; a runtime index is fixed with a select.
fn fix_negative(
    ctx: &mut LowerCtx<'_>,
    index: &LoweredValue,
    dim: &LoweredValue,
) -> LoweringResult<LoweredValue> {
    if index.is_constant() {
        return ctx.normalize_index(index, dim);
    }
    let zero = ctx.int_const(&[0])?;
    let negative = ctx.less_than(index, &zero)?;
    let wrapped = ctx.sum(index, dim)?;
    ctx.select(&negative, &wrapped, index)
}

fn lower_strided_slice(
    ctx: &mut LowerCtx<'_>,
    node: &SourceNode,
    inputs: &[LoweredValue],
) -> LoweringResult<Vec<LoweredValue>> {
    let x = operand(node, inputs, 0)?;
    let starts_value = operand(node, inputs, 1)?;
    let ends_value = operand(node, inputs, 2)?;
    let strides_value = operand(node, inputs, 3)?;
    let rank = x.rank();
    let axes = checked_axes(&node.require_i64_array("axes")?, rank)?;
    let starts = literal_ints(starts_value)?;
    let ends = literal_ints(ends_value)?;
    let strides = literal_ints(strides_value)?;
    check_len("starts", starts.as_deref(), axes.len())?;
    check_len("ends", ends.as_deref(), axes.len())?;
    check_len("strides", strides.as_deref(), axes.len())?;
    if strides.as_deref().is_some_and(|values| values.contains(&0)) {
        return Err(LoweringError::invalid("strided_slice stride is zero"));
    }

    let zero = ctx.int_const(&[0])?;
    let one = ctx.int_const(&[1])?;
    let minus_one = ctx.int_const(&[-1])?;
    let mut start_parts = Vec::with_capacity(rank);
    let mut size_parts = Vec::with_capacity(rank);
    let mut stride_parts = Vec::with_capacity(rank);
    for axis in 0..rank {
        let dim = ctx.dim_size(x, axis)?;
        let Some(slot) = axes.iter().position(|&listed| listed == axis) else {
            start_parts.push(zero.clone());
            size_parts.push(dim);
            stride_parts.push(one.clone());
            continue;
        };
        let start = element(ctx, starts_value, starts.as_deref(), slot)?;
        let mut start = fix_negative(ctx, &start, &dim)?;
        let end = element(ctx, ends_value, ends.as_deref(), slot)?;
        let mut end = fix_negative(ctx, &end, &dim)?;
        let stride = element(ctx, strides_value, strides.as_deref(), slot)?;

        match stride.as_scalar_int() {
            Ok(step) if step > 0 => {
                start = ctx.clamp(&start, &zero, &dim)?;
                end = ctx.clamp(&end, &zero, &dim)?;
            }
            Ok(_) => {
                let last = ctx.sub(&dim, &one)?;
                start = ctx.clamp(&start, &zero, &last)?;
                end = ctx.clamp(&end, &minus_one, &last)?;
            }
            Err(LoweringError::NotConstant) => {
                trace!(axis, "runtime stride, selecting clamp bounds");
                let last = ctx.sub(&dim, &one)?;
                let backward = ctx.less_than(&stride, &zero)?;
                let upper = ctx.select(&backward, &last, &dim)?;
                let end_lower = ctx.select(&backward, &minus_one, &zero)?;
                start = ctx.clamp(&start, &zero, &upper)?;
                end = ctx.clamp(&end, &end_lower, &upper)?;
            }
            Err(err) => return Err(err),
        }

        // size = -floor((start - min(end, dim)) / stride)
        let bounded = ctx.min(&end, &dim)?;
        let span = ctx.sub(&start, &bounded)?;
        let steps = ctx.floor_div(&span, &stride)?;
        let size = ctx.sub(&zero, &steps)?;
        start_parts.push(start);
        size_parts.push(ctx.max(&size, &zero)?);
        stride_parts.push(stride);
    }
    let start = ctx.concat(&start_parts)?;
    let size = ctx.concat(&size_parts)?;
    let stride = ctx.concat(&stride_parts)?;
    Ok(vec![ctx.slice(
        x,
        &start,
        &size,
        &stride,
        SampleMode::Strict,
    )?])
}

/// Split axis: known now, or a normalized one-element runtime vector.
enum SplitAxis {
    Literal(usize),
    Runtime(LoweredValue),
}

fn split_axis(
    ctx: &mut LowerCtx<'_>,
    axis: &LoweredValue,
    rank: usize,
) -> LoweringResult<SplitAxis> {
    match axis.as_scalar_int() {
        Ok(value) => Ok(SplitAxis::Literal(checked_axis(value, rank)?)),
        Err(LoweringError::NotConstant) => {
            trace!("runtime split axis");
            let vector = ctx.shape_vector(axis)?;
            let rank = ctx.int_const(&[rank as i64])?;
            Ok(SplitAxis::Runtime(ctx.normalize_index(&vector, &rank)?))
        }
        Err(err) => Err(err),
    }
}

fn axis_extent(
    ctx: &mut LowerCtx<'_>,
    x: &LoweredValue,
    shape: &LoweredValue,
    axis: &SplitAxis,
) -> LoweringResult<LoweredValue> {
    match axis {
        SplitAxis::Literal(axis) => ctx.dim_size(x, *axis),
        SplitAxis::Runtime(axis) => ctx.gather(shape, axis),
    }
}

/// Start and size vectors selecting `[offset, offset + size)` along `axis` and everything elsewhere.
fn axis_window(
    ctx: &mut LowerCtx<'_>,
    shape: &LoweredValue,
    rank: usize,
    axis: &SplitAxis,
    offset: &LoweredValue,
    size: &LoweredValue,
) -> LoweringResult<(LoweredValue, LoweredValue)> {
    match axis {
        SplitAxis::Literal(axis) => {
            let axis = *axis;
            let before = ctx.int_const(&vec![0; axis])?;
            let after = ctx.int_const(&vec![0; rank - axis - 1])?;
            let start = ctx.concat(&[before, offset.clone(), after])?;
            let mut sizes = Vec::with_capacity(3);
            if axis > 0 {
                sizes.push(ctx.slice_1d(shape, 0, axis)?);
            }
            sizes.push(size.clone());
            if axis + 1 < rank {
                sizes.push(ctx.slice_1d(shape, axis + 1, rank - axis - 1)?);
            }
            let size = ctx.concat(&sizes)?;
            Ok((start, size))
        }
        SplitAxis::Runtime(axis) => {
            let positions: Vec<i64> = (0..rank as i64).collect();
            let positions = ctx.int_const(&positions)?;
            let mask = ctx.equal(&positions, axis)?;
            let weights = ctx.cast_bool_to_int(&mask)?;
            let start = ctx.mul(&weights, offset)?;
            let size = ctx.select(&mask, size, shape)?;
            Ok((start, size))
        }
    }
}

/// One slice per section, walking a running offset along the axis.
fn slices_along(
    ctx: &mut LowerCtx<'_>,
    x: &LoweredValue,
    shape: &LoweredValue,
    axis: &SplitAxis,
    sections: &[LoweredValue],
) -> LoweringResult<Vec<LoweredValue>> {
    let rank = x.rank();
    let stride = ctx.int_const(&vec![1; rank])?;
    let mut offset = ctx.int_const(&[0])?;
    let mut outputs = Vec::with_capacity(sections.len());
    for section in sections {
        let (start, size) = axis_window(ctx, shape, rank, axis, &offset, section)?;
        outputs.push(ctx.slice(x, &start, &size, &stride, SampleMode::Strict)?);
        offset = ctx.sum(&offset, section)?;
    }
    Ok(outputs)
}

fn lower_split(
    ctx: &mut LowerCtx<'_>,
    node: &SourceNode,
    inputs: &[LoweredValue],
) -> LoweringResult<Vec<LoweredValue>> {
    let x = operand(node, inputs, 0)?;
    let sections_value = operand(node, inputs, 1)?;
    let axis = split_axis(ctx, operand(node, inputs, 2)?, x.rank())?;
    let shape = ctx.shape_of(x)?;

    let sections = match literal_ints(sections_value)? {
        Some(sections) => {
            let inferred = sections.iter().filter(|&&size| size < 0).count();
            if inferred > 1 {
                return Err(LoweringError::invalid(
                    "split sections may infer at most one size",
                ));
            }
            let fixed: i64 = sections.iter().filter(|&&size| size >= 0).sum();
            let mut parts = Vec::with_capacity(sections.len());
            for size in sections {
                if size < 0 {
                    let extent = axis_extent(ctx, x, &shape, &axis)?;
                    let fixed = ctx.int_const(&[fixed])?;
                    parts.push(ctx.sub(&extent, &fixed)?);
                } else {
                    parts.push(ctx.int_const(&[size])?);
                }
            }
            parts
        }
        None => {
            let count = match sections_value.shape().dims() {
                [Dimension::Static(count)] => *count,
                _ => {
                    return Err(LoweringError::UnsupportedDynamicSections {
                        kind: node.kind.clone(),
                    })
                }
            };
            trace!(count, "runtime split sections");
            let vector = ctx.shape_vector(sections_value)?;
            (0..count)
                .map(|index| ctx.gather_element(&vector, index))
                .collect::<LoweringResult<Vec<_>>>()?
        }
    };
    if sections.len() != node.outputs.len() {
        return Err(LoweringError::invalid(format!(
            "split has {} sections, node declares {} outputs",
            sections.len(),
            node.outputs.len()
        )));
    }
    slices_along(ctx, x, &shape, &axis, &sections)
}

/// Equal sections of `floor(extent / num)` along the axis.
fn lower_split_with_num(
    ctx: &mut LowerCtx<'_>,
    node: &SourceNode,
    inputs: &[LoweredValue],
) -> LoweringResult<Vec<LoweredValue>> {
    let x = operand(node, inputs, 0)?;
    let num = node.require_i64("num")?;
    if num <= 0 {
        return Err(LoweringError::invalid(format!(
            "split_with_num needs a positive num, got {num}"
        )));
    }
    let axis = match inputs.get(1) {
        Some(axis) => split_axis(ctx, axis, x.rank())?,
        None => SplitAxis::Literal(checked_axis(node.attr_i64_or("axis", 0)?, x.rank())?),
    };
    if num as usize != node.outputs.len() {
        return Err(LoweringError::invalid(format!(
            "split_with_num num={num}, node declares {} outputs",
            node.outputs.len()
        )));
    }
    let shape = ctx.shape_of(x)?;
    let extent = axis_extent(ctx, x, &shape, &axis)?;
    let count = ctx.int_const(&[num])?;
    let section = ctx.floor_div(&extent, &count)?;
    let sections = vec![section; num as usize];
    slices_along(ctx, x, &shape, &axis, &sections)
}
