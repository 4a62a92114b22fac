use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{LoweringError, LoweringResult};
use crate::tensor::{TensorLiteral, TensorSpec};

/// Identifies a node within one source graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// Output slot `index` of node `node`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueRef {
    pub node: NodeId,
    pub index: usize,
}

impl ValueRef {
    pub fn new(node: NodeId, index: usize) -> Self {
        Self { node, index }
    }
}

impl fmt::Display for ValueRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.node, self.index)
    }
}

/// Statically typed attribute payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum AttrValue {
    I64(i64),
    F64(f64),
    Bool(bool),
    String(String),
    I64Array(Vec<i64>),
    F64Array(Vec<f64>),
    BoolArray(Vec<bool>),
    StringArray(Vec<String>),
    Tensor(TensorLiteral),
}

impl AttrValue {
    fn type_name(&self) -> &'static str {
        match self {
            AttrValue::I64(_) => "i64",
            AttrValue::F64(_) => "f64",
            AttrValue::Bool(_) => "bool",
            AttrValue::String(_) => "string",
            AttrValue::I64Array(_) => "i64[]",
            AttrValue::F64Array(_) => "f64[]",
            AttrValue::BoolArray(_) => "bool[]",
            AttrValue::StringArray(_) => "string[]",
            AttrValue::Tensor(_) => "tensor",
        }
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::I64(value) => write!(f, "{value}"),
            AttrValue::F64(value) => write!(f, "{value:?}"),
            AttrValue::Bool(value) => write!(f, "{value}"),
            AttrValue::String(value) => write!(f, "{value:?}"),
            AttrValue::I64Array(values) => write!(f, "{values:?}"),
            AttrValue::F64Array(values) => write!(f, "{values:?}"),
            AttrValue::BoolArray(values) => write!(f, "{values:?}"),
            AttrValue::StringArray(values) => write!(f, "{values:?}"),
            AttrValue::Tensor(literal) => write!(f, "tensor<{}>", literal.spec),
        }
    }
}

/// One operator instance. Attribute absence is always an explicit `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceNode {
    pub id: NodeId,
    pub kind: String,
    #[serde(default)]
    pub operands: Vec<ValueRef>,
    #[serde(default)]
    pub outputs: Vec<TensorSpec>,
    #[serde(default)]
    pub attrs: BTreeMap<String, AttrValue>,
}

impl SourceNode {
    pub fn attr(&self, name: &str) -> Option<&AttrValue> {
        self.attrs.get(name)
    }

    pub fn has_attr(&self, name: &str) -> bool {
        self.attrs.contains_key(name)
    }

    fn mismatch(&self, name: &str, expected: &str, found: &AttrValue) -> LoweringError {
        LoweringError::invalid(format!(
            "{}: attribute '{name}' should be {expected}, found {}",
            self.kind,
            found.type_name()
        ))
    }

    fn missing(&self, name: &str) -> LoweringError {
        LoweringError::invalid(format!("{}: missing attribute '{name}'", self.kind))
    }

    pub fn attr_i64(&self, name: &str) -> LoweringResult<Option<i64>> {
        match self.attr(name) {
            None => Ok(None),
            Some(AttrValue::I64(value)) => Ok(Some(*value)),
            Some(AttrValue::F64(value)) if value.fract() == 0.0 => Ok(Some(*value as i64)),
            Some(other) => Err(self.mismatch(name, "an integer", other)),
        }
    }

    pub fn attr_i64_or(&self, name: &str, default: i64) -> LoweringResult<i64> {
        Ok(self.attr_i64(name)?.unwrap_or(default))
    }

    pub fn require_i64(&self, name: &str) -> LoweringResult<i64> {
        self.attr_i64(name)?.ok_or_else(|| self.missing(name))
    }

    pub fn attr_f64(&self, name: &str) -> LoweringResult<Option<f64>> {
        match self.attr(name) {
            None => Ok(None),
            Some(AttrValue::F64(value)) => Ok(Some(*value)),
            Some(AttrValue::I64(value)) => Ok(Some(*value as f64)),
            Some(other) => Err(self.mismatch(name, "a number", other)),
        }
    }

    pub fn attr_f64_or(&self, name: &str, default: f64) -> LoweringResult<f64> {
        Ok(self.attr_f64(name)?.unwrap_or(default))
    }

    pub fn attr_bool(&self, name: &str) -> LoweringResult<Option<bool>> {
        match self.attr(name) {
            None => Ok(None),
            Some(AttrValue::Bool(value)) => Ok(Some(*value)),
            Some(other) => Err(self.mismatch(name, "a bool", other)),
        }
    }

    pub fn attr_bool_or(&self, name: &str, default: bool) -> LoweringResult<bool> {
        Ok(self.attr_bool(name)?.unwrap_or(default))
    }

    pub fn attr_str(&self, name: &str) -> LoweringResult<Option<&str>> {
        match self.attr(name) {
            None => Ok(None),
            Some(AttrValue::String(value)) => Ok(Some(value.as_str())),
            Some(other) => Err(self.mismatch(name, "a string", other)),
        }
    }

    /// Integer list attribute; a scalar integer reads as a one-element list.
    pub fn attr_i64_array(&self, name: &str) -> LoweringResult<Option<Vec<i64>>> {
        match self.attr(name) {
            None => Ok(None),
            Some(AttrValue::I64Array(values)) => Ok(Some(values.clone())),
            Some(AttrValue::I64(value)) => Ok(Some(vec![*value])),
            Some(other) => Err(self.mismatch(name, "an integer list", other)),
        }
    }

    pub fn require_i64_array(&self, name: &str) -> LoweringResult<Vec<i64>> {
        self.attr_i64_array(name)?.ok_or_else(|| self.missing(name))
    }

    pub fn attr_f64_array(&self, name: &str) -> LoweringResult<Option<Vec<f64>>> {
        match self.attr(name) {
            None => Ok(None),
            Some(AttrValue::F64Array(values)) => Ok(Some(values.clone())),
            Some(AttrValue::I64Array(values)) => {
                Ok(Some(values.iter().map(|&value| value as f64).collect()))
            }
            Some(other) => Err(self.mismatch(name, "a number list", other)),
        }
    }

    pub fn attr_tensor(&self, name: &str) -> LoweringResult<Option<&TensorLiteral>> {
        match self.attr(name) {
            None => Ok(None),
            Some(AttrValue::Tensor(literal)) => Ok(Some(literal)),
            Some(other) => Err(self.mismatch(name, "a tensor", other)),
        }
    }

    pub fn operand(&self, index: usize) -> LoweringResult<ValueRef> {
        self.operands.get(index).copied().ok_or_else(|| {
            LoweringError::invalid(format!(
                "{}: expected operand #{index}, node has {}",
                self.kind,
                self.operands.len()
            ))
        })
    }

    pub fn output_spec(&self, index: usize) -> LoweringResult<&TensorSpec> {
        self.outputs.get(index).ok_or_else(|| {
            LoweringError::invalid(format!(
                "{}: expected output #{index}, node has {}",
                self.kind,
                self.outputs.len()
            ))
        })
    }

    pub fn output_rank(&self, index: usize) -> LoweringResult<usize> {
        Ok(self.output_spec(index)?.rank())
    }
}

impl fmt::Display for SourceNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, _) in self.outputs.iter().enumerate() {
            if idx > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", ValueRef::new(self.id, idx))?;
        }
        if !self.outputs.is_empty() {
            f.write_str(" = ")?;
        }
        write!(f, "{}(", self.kind)?;
        for (idx, operand) in self.operands.iter().enumerate() {
            if idx > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{operand}")?;
        }
        f.write_str(")")?;
        if !self.attrs.is_empty() {
            f.write_str(" {")?;
            for (idx, (name, value)) in self.attrs.iter().enumerate() {
                if idx > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{name}: {value}")?;
            }
            f.write_str("}")?;
        }
        if !self.outputs.is_empty() {
            f.write_str(" : ")?;
            for (idx, spec) in self.outputs.iter().enumerate() {
                if idx > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{spec}")?;
            }
        }
        Ok(())
    }
}
