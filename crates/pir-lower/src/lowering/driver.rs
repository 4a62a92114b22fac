//! Topological walk that lowers every source node through the registry.

use std::collections::HashMap;

use tracing::{debug, info};

use super::context::LowerCtx;
use super::registry::ConverterRegistry;
use super::value::LoweredValue;
use crate::config::LowerOptions;
use crate::error::{LoweringError, LoweringResult};
use crate::source::{constant_payload, kinds, SourceGraph, SourceNode, ValueRef};
use crate::target::{NetworkBuilder, TensorRef};

/// Lowered value of every source value produced so far. Entries are never replaced.
#[derive(Debug, Default, Clone)]
pub struct ValueTable {
    values: HashMap<ValueRef, LoweredValue>,
}

impl ValueTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, value: ValueRef) -> Option<&LoweredValue> {
        self.values.get(&value)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn insert(&mut self, value: ValueRef, lowered: LoweredValue) -> LoweringResult<()> {
        if self.values.contains_key(&value) {
            return Err(LoweringError::invalid(format!("value {value} defined twice")));
        }
        self.values.insert(value, lowered);
        Ok(())
    }
}

/// Result of one [`translate`] call.
#[derive(Debug)]
pub struct Translation {
    /// Network tensors marked as graph outputs, in graph output order.
    pub outputs: Vec<TensorRef>,
    pub values: ValueTable,
    /// Nodes that went through a converter, excluding inputs and constants.
    pub lowered_nodes: usize,
}

/// Lowers `graph` into `net`.
///
/// The first failing node aborts the pass. Its error is wrapped with the
/// node's kind and topological position; nothing of that node is recorded.
pub fn translate(
    graph: &SourceGraph,
    net: &mut dyn NetworkBuilder,
    registry: &ConverterRegistry,
    options: &LowerOptions,
) -> LoweringResult<Translation> {
    let order = graph.topological_order()?;
    let mut table = ValueTable::new();
    let mut lowered_nodes = 0usize;

    for (position, node) in order.iter().enumerate() {
        debug!(kind = %node.kind, node = %node.id, position, "lowering node");
        net.begin_node(node);
        let outputs = lower_node(graph, net, registry, options, &table, node)
            .map_err(|err| match err {
                LoweringError::NotConstant => LoweringError::invalid(
                    "converter required a constant operand and did not fall back",
                ),
                other => other,
            })
            .map_err(|err| err.at_node(&node.kind, position))?;
        if !kinds::is_constant_producer(&node.kind) && node.kind != kinds::DATA {
            lowered_nodes += 1;
        }
        for (index, value) in outputs.into_iter().enumerate() {
            table
                .insert(ValueRef::new(node.id, index), value)
                .map_err(|err| err.at_node(&node.kind, position))?;
        }
    }

    let mut outputs = Vec::with_capacity(graph.outputs().len());
    for (idx, value) in graph.outputs().iter().enumerate() {
        let lowered = table.get(*value).ok_or_else(|| {
            LoweringError::invalid(format!("graph output {value} was never produced"))
        })?;
        let tensor = lowered.materialize(&mut *net)?;
        net.mark_output(tensor.id, &format!("output_{idx}"))?;
        outputs.push(tensor);
    }

    info!(
        nodes = order.len(),
        lowered = lowered_nodes,
        outputs = outputs.len(),
        "translation finished"
    );
    Ok(Translation {
        outputs,
        values: table,
        lowered_nodes,
    })
}

fn lower_node(
    graph: &SourceGraph,
    net: &mut dyn NetworkBuilder,
    registry: &ConverterRegistry,
    options: &LowerOptions,
    table: &ValueTable,
    node: &SourceNode,
) -> LoweringResult<Vec<LoweredValue>> {
    if node.kind == kinds::DATA {
        let spec = node.output_spec(0)?.clone();
        let name = match node.attr_str("name")? {
            Some(name) => name.to_string(),
            None => format!("input_{}", node.id.0),
        };
        return Ok(vec![net.add_input(&name, spec)?.into()]);
    }
    if let Some(literal) = constant_payload(node)? {
        return Ok(vec![literal.into()]);
    }

    let mut inputs = Vec::with_capacity(node.operands.len());
    for (index, operand) in node.operands.iter().enumerate() {
        let value = table
            .get(*operand)
            .ok_or(LoweringError::UnresolvedOperand {
                node: node.id,
                index,
                value: *operand,
            })?;
        inputs.push(value.clone());
    }

    let converter = registry.lookup(&node.kind, options.target_version)?;
    let mut ctx = LowerCtx::new(net, graph, options);
    let outputs = (converter.lower)(&mut ctx, node, &inputs)?;

    if outputs.len() != node.outputs.len() {
        return Err(LoweringError::invalid(format!(
            "converter '{}' produced {} outputs, node declares {}",
            converter.name,
            outputs.len(),
            node.outputs.len()
        )));
    }
    if options.verify_output_ranks {
        for (index, (value, declared)) in outputs.iter().zip(&node.outputs).enumerate() {
            let rank = if ctx.implicit_batch() && declared.rank() > 0 {
                declared.rank() - 1
            } else {
                declared.rank()
            };
            if value.rank() != rank && value.rank() != declared.rank() {
                return Err(LoweringError::invalid(format!(
                    "converter '{}' output #{index} has rank {}, node declares {}",
                    converter.name,
                    value.rank(),
                    declared
                )));
            }
        }
    }
    Ok(outputs)
}
