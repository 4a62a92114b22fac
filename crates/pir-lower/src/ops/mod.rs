//! Lowering routines, one per source operator kind.
//!
//! Every routine registers itself in [`crate::lowering::CONVERTERS`] through
//! the `converter!` macro, so adding a file here is enough to make its kinds
//! resolvable by [`crate::lowering::builtin_registry`].

use crate::error::{LoweringError, LoweringResult};
use crate::lowering::{checked_axis, LowerCtx, LoweredValue};
use crate::source::SourceNode;
use crate::target::{Layer, TensorRef};
use crate::tensor::{DType, TensorLiteral};

/// Registers a lowering routine for one or more kind aliases.
///
/// Built-in routines target engine versions 8.0 and later.
macro_rules! converter {
    ($def:ident, $name:literal, [$($kind:expr),+ $(,)?], $lower:path) => {
        #[::linkme::distributed_slice(crate::lowering::CONVERTERS)]
        static $def: crate::lowering::ConverterDef = crate::lowering::ConverterDef {
            kinds: &[$($kind),+],
            version: crate::lowering::VersionReq::AtLeast(
                crate::lowering::TargetVersion::new(8, 0, 0),
            ),
            converter: crate::lowering::Converter {
                name: $name,
                lower: $lower,
            },
        };
    };
}

pub mod activation;
pub mod index;
pub mod math;
pub mod shape;
pub mod slice;

pub(crate) fn operand<'v>(
    node: &SourceNode,
    inputs: &'v [LoweredValue],
    index: usize,
) -> LoweringResult<&'v LoweredValue> {
    inputs.get(index).ok_or_else(|| {
        LoweringError::invalid(format!(
            "{}: expected operand #{index}, got {}",
            node.kind,
            inputs.len()
        ))
    })
}

/// Integer list carried by operand `index`; `None` when it is a runtime tensor.
pub(crate) fn literal_ints(value: &LoweredValue) -> LoweringResult<Option<Vec<i64>>> {
    match value.as_ints() {
        Ok(values) => Ok(Some(values)),
        Err(LoweringError::NotConstant) => Ok(None),
        Err(err) => Err(err),
    }
}

/// Integer list from operand `index` when present, else from attribute `attr`.
///
/// A runtime operand is rejected: callers of this helper need the list now.
pub(crate) fn static_int_list(
    node: &SourceNode,
    inputs: &[LoweredValue],
    index: usize,
    attr: &str,
) -> LoweringResult<Option<Vec<i64>>> {
    match inputs.get(index) {
        Some(value) => literal_ints(value)?.map(Some).ok_or_else(|| {
            LoweringError::unsupported(
                &node.kind,
                format!("operand #{index} ('{attr}') must be a constant"),
            )
        }),
        None => node.attr_i64_array(attr),
    }
}

/// Normalizes every axis in `axes` against `rank`, rejecting duplicates.
pub(crate) fn checked_axes(axes: &[i64], rank: usize) -> LoweringResult<Vec<usize>> {
    let mut out = Vec::with_capacity(axes.len());
    for &axis in axes {
        let axis = checked_axis(axis, rank)?;
        if out.contains(&axis) {
            return Err(LoweringError::invalid(format!("axis {axis} listed twice")));
        }
        out.push(axis);
    }
    Ok(out)
}

/// A `[1, .., 1]` literal of `rank` holding `value`, for broadcasting against a tensor.
pub(crate) fn scalar_like(dtype: DType, rank: usize, value: f64) -> LoweringResult<TensorLiteral> {
    TensorLiteral::from_f64s(dtype, &vec![1; rank], &[value])
}

/// Emits a layer on `value` after promoting it to a tensor.
pub(crate) fn with_tensor(
    ctx: &mut LowerCtx<'_>,
    value: &LoweredValue,
    build: impl FnOnce(TensorRef) -> Layer,
) -> LoweringResult<LoweredValue> {
    let input = ctx.materialize(value)?;
    Ok(ctx.add_layer(build(input))?.into())
}
