use super::kinds;
use super::SourceNode;
use crate::error::{LoweringError, LoweringResult};
use crate::tensor::{DType, TensorLiteral};

/// Reads the dtype attribute of `node`, falling back to its first declared output.
pub(crate) fn node_dtype(node: &SourceNode, attr: &str) -> LoweringResult<DType> {
    match node.attr_str(attr)? {
        Some(name) => DType::from_name(name).ok_or_else(|| {
            LoweringError::unsupported(&node.kind, format!("dtype '{name}' has no target type"))
        }),
        None => Ok(node.output_spec(0)?.dtype),
    }
}

fn static_dims(node: &SourceNode, dims: &[i64]) -> LoweringResult<Vec<usize>> {
    dims.iter()
        .map(|&dim| {
            usize::try_from(dim).map_err(|_| {
                LoweringError::invalid(format!("{}: negative extent {dim} in constant", node.kind))
            })
        })
        .collect()
}

/// Literal payload of a constant-producing node, or `None` for any other kind.
pub fn constant_payload(node: &SourceNode) -> LoweringResult<Option<TensorLiteral>> {
    let literal = match node.kind.as_str() {
        kinds::FULL => {
            let dims = static_dims(node, &node.require_i64_array("shape")?)?;
            let value = node.attr_f64_or("value", 0.0)?;
            let dtype = node_dtype(node, "dtype")?;
            let count = dims.iter().product::<usize>();
            TensorLiteral::from_f64s(dtype, &dims, &vec![value; count])?
        }
        kinds::FULL_INT_ARRAY => {
            let values = node.require_i64_array("value")?;
            let dtype = match node.attr_str("dtype")? {
                Some(_) => node_dtype(node, "dtype")?,
                None => DType::Si64,
            };
            TensorLiteral::from_i64s(dtype, &[values.len()], &values)?
        }
        kinds::ASSIGN_VALUE => {
            let dims = static_dims(node, &node.require_i64_array("shape")?)?;
            let values = node.attr_f64_array("values")?.ok_or_else(|| {
                LoweringError::invalid(format!("{}: missing attribute 'values'", node.kind))
            })?;
            let dtype = node_dtype(node, "dtype")?;
            TensorLiteral::from_f64s(dtype, &dims, &values)?
        }
        kinds::BUILTIN_CONSTANT => match node.attr_tensor("value")? {
            Some(literal) => literal.clone(),
            None => {
                return Err(LoweringError::invalid(format!(
                    "{}: missing tensor attribute 'value'",
                    node.kind
                )))
            }
        },
        _ => return Ok(None),
    };
    Ok(Some(literal))
}
