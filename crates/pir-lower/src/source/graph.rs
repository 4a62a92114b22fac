use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use super::kinds;
use super::{AttrValue, NodeId, SourceNode, ValueRef};
use crate::error::{LoweringError, LoweringResult};
use crate::tensor::{DType, Shape, TensorLiteral, TensorSpec};

/// A PIR program body: nodes in definition order plus the values it returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "SourceGraphRepr", into = "SourceGraphRepr")]
pub struct SourceGraph {
    nodes: Vec<SourceNode>,
    outputs: Vec<ValueRef>,
    index: HashMap<NodeId, usize>,
}

#[derive(Serialize, Deserialize)]
struct SourceGraphRepr {
    nodes: Vec<SourceNode>,
    #[serde(default)]
    outputs: Vec<ValueRef>,
}

impl TryFrom<SourceGraphRepr> for SourceGraph {
    type Error = LoweringError;

    fn try_from(repr: SourceGraphRepr) -> Result<Self, Self::Error> {
        SourceGraph::new(repr.nodes, repr.outputs)
    }
}

impl From<SourceGraph> for SourceGraphRepr {
    fn from(graph: SourceGraph) -> Self {
        SourceGraphRepr {
            nodes: graph.nodes,
            outputs: graph.outputs,
        }
    }
}

impl SourceGraph {
    pub fn new(nodes: Vec<SourceNode>, outputs: Vec<ValueRef>) -> LoweringResult<Self> {
        let mut index = HashMap::with_capacity(nodes.len());
        for (position, node) in nodes.iter().enumerate() {
            if index.insert(node.id, position).is_some() {
                return Err(LoweringError::invalid(format!(
                    "node id {} is defined twice",
                    node.id
                )));
            }
        }
        Ok(Self {
            nodes,
            outputs,
            index,
        })
    }

    pub fn nodes(&self) -> &[SourceNode] {
        &self.nodes
    }

    pub fn outputs(&self) -> &[ValueRef] {
        &self.outputs
    }

    pub fn node(&self, id: NodeId) -> Option<&SourceNode> {
        self.index.get(&id).map(|&position| &self.nodes[position])
    }

    /// The node defining `value`, if it is part of this graph.
    pub fn producer(&self, value: ValueRef) -> Option<&SourceNode> {
        self.node(value.node)
            .filter(|node| value.index < node.outputs.len())
    }

    pub fn value_spec(&self, value: ValueRef) -> Option<&TensorSpec> {
        self.producer(value)
            .and_then(|node| node.outputs.get(value.index))
    }

    /// Nodes ordered so every producer precedes its consumers; ties keep definition order.
    ///
    /// Operands that reference nodes outside the graph do not constrain the
    /// order; the driver reports them when it tries to resolve them.
    pub fn topological_order(&self) -> LoweringResult<Vec<&SourceNode>> {
        let mut pending = vec![0usize; self.nodes.len()];
        let mut users: Vec<Vec<usize>> = vec![Vec::new(); self.nodes.len()];
        for (position, node) in self.nodes.iter().enumerate() {
            for operand in &node.operands {
                if let Some(&producer) = self.index.get(&operand.node) {
                    pending[position] += 1;
                    users[producer].push(position);
                }
            }
        }

        let mut ready: BinaryHeap<Reverse<usize>> = pending
            .iter()
            .enumerate()
            .filter(|(_, &count)| count == 0)
            .map(|(position, _)| Reverse(position))
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(Reverse(position)) = ready.pop() {
            order.push(&self.nodes[position]);
            for &user in &users[position] {
                pending[user] -= 1;
                if pending[user] == 0 {
                    ready.push(Reverse(user));
                }
            }
        }

        if order.len() != self.nodes.len() {
            let stuck: Vec<String> = pending
                .iter()
                .enumerate()
                .filter(|(_, &count)| count > 0)
                .map(|(position, _)| self.nodes[position].id.to_string())
                .collect();
            return Err(LoweringError::invalid(format!(
                "graph contains a cycle through {}",
                stuck.join(", ")
            )));
        }
        Ok(order)
    }

    pub fn to_json_string(&self) -> LoweringResult<String> {
        serde_json::to_string_pretty(self).map_err(LoweringError::from)
    }

    pub fn from_json_str(text: &str) -> LoweringResult<Self> {
        serde_json::from_str(text).map_err(LoweringError::from)
    }
}

impl fmt::Display for SourceGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for node in &self.nodes {
            writeln!(f, "{node}")?;
        }
        f.write_str("return ")?;
        for (idx, value) in self.outputs.iter().enumerate() {
            if idx > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{value}")?;
        }
        Ok(())
    }
}

/// Incremental construction of a [`SourceGraph`], mostly for tests and tooling.
#[derive(Debug, Default)]
pub struct SourceGraphBuilder {
    nodes: Vec<SourceNode>,
    outputs: Vec<ValueRef>,
}

impl SourceGraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> NodeId {
        NodeId(self.nodes.len() as u32)
    }

    /// Appends a node and returns its output values.
    pub fn op(
        &mut self,
        kind: &str,
        operands: &[ValueRef],
        attrs: Vec<(&str, AttrValue)>,
        outputs: Vec<TensorSpec>,
    ) -> Vec<ValueRef> {
        let id = self.next_id();
        let count = outputs.len();
        self.nodes.push(SourceNode {
            id,
            kind: kind.to_string(),
            operands: operands.to_vec(),
            outputs,
            attrs: attrs
                .into_iter()
                .map(|(name, value)| (name.to_string(), value))
                .collect::<BTreeMap<_, _>>(),
        });
        (0..count).map(|index| ValueRef::new(id, index)).collect()
    }

    /// Single-output form of [`SourceGraphBuilder::op`].
    pub fn op1(
        &mut self,
        kind: &str,
        operands: &[ValueRef],
        attrs: Vec<(&str, AttrValue)>,
        output: TensorSpec,
    ) -> ValueRef {
        let id = self.next_id();
        self.op(kind, operands, attrs, vec![output]);
        ValueRef::new(id, 0)
    }

    pub fn input(&mut self, name: &str, spec: TensorSpec) -> ValueRef {
        self.op1(
            kinds::DATA,
            &[],
            vec![("name", AttrValue::String(name.to_string()))],
            spec,
        )
    }

    pub fn full_int_array(&mut self, values: &[i64]) -> ValueRef {
        self.op1(
            kinds::FULL_INT_ARRAY,
            &[],
            vec![
                ("value", AttrValue::I64Array(values.to_vec())),
                ("dtype", AttrValue::String("int64".to_string())),
            ],
            TensorSpec::new(DType::Si64, Shape::from_static(&[values.len()])),
        )
    }

    pub fn full(&mut self, dims: &[usize], value: f64, dtype: DType) -> ValueRef {
        self.op1(
            kinds::FULL,
            &[],
            vec![
                (
                    "shape",
                    AttrValue::I64Array(dims.iter().map(|&dim| dim as i64).collect()),
                ),
                ("value", AttrValue::F64(value)),
                ("dtype", AttrValue::String(dtype.name().to_string())),
            ],
            TensorSpec::new(dtype, Shape::from_static(dims)),
        )
    }

    pub fn constant(&mut self, literal: TensorLiteral) -> ValueRef {
        let spec = literal.spec.clone();
        self.op1(
            kinds::BUILTIN_CONSTANT,
            &[],
            vec![("value", AttrValue::Tensor(literal))],
            spec,
        )
    }

    pub fn output(&mut self, value: ValueRef) {
        self.outputs.push(value);
    }

    pub fn finish(self) -> LoweringResult<SourceGraph> {
        SourceGraph::new(self.nodes, self.outputs)
    }
}
