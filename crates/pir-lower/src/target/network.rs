use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use super::infer::{infer_layer, Known, TensorLookup};
use super::layer::{Layer, LayerKind, TensorId, TensorRef};
use crate::error::{LoweringError, LoweringResult};
use crate::source::{NodeId, SourceNode};
use crate::tensor::TensorSpec;

/// Write-only construction interface of a target network.
///
/// Converters only ever add layers and read back the specs of the tensors
/// they produced; they never inspect or rewrite what was emitted before.
pub trait NetworkBuilder {
    fn has_implicit_batch_dimension(&self) -> bool;

    /// Called by the driver before it lowers `node`, so layers can be attributed.
    fn begin_node(&mut self, _node: &SourceNode) {}

    fn add_input(&mut self, name: &str, spec: TensorSpec) -> LoweringResult<TensorRef>;

    fn add_layer(&mut self, layer: Layer) -> LoweringResult<Vec<TensorRef>>;

    fn mark_output(&mut self, tensor: TensorId, name: &str) -> LoweringResult<()>;

    fn tensor_spec(&self, tensor: TensorId) -> Option<TensorSpec>;
}

/// One emitted layer with the tensors it defines and the source node it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedLayer {
    pub layer: Layer,
    pub outputs: Vec<TensorId>,
    pub origin: Option<NodeId>,
}

/// In-memory [`NetworkBuilder`] that records every layer and infers output specs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Network {
    implicit_batch: bool,
    inputs: Vec<(String, TensorId)>,
    outputs: Vec<(String, TensorId)>,
    layers: Vec<RecordedLayer>,
    tensors: Vec<TensorSpec>,
    #[serde(skip)]
    known: HashMap<TensorId, Known>,
    #[serde(skip)]
    current_origin: Option<NodeId>,
}

impl Network {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_implicit_batch(mut self, implicit: bool) -> Self {
        self.implicit_batch = implicit;
        self
    }

    pub fn layers(&self) -> &[RecordedLayer] {
        &self.layers
    }

    pub fn inputs(&self) -> &[(String, TensorId)] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[(String, TensorId)] {
        &self.outputs
    }

    pub fn tensor_count(&self) -> usize {
        self.tensors.len()
    }

    pub fn spec(&self, tensor: TensorId) -> Option<&TensorSpec> {
        self.tensors.get(tensor.0 as usize)
    }

    /// Values of `tensor` known while building, one entry per element.
    pub fn known_values(&self, tensor: TensorId) -> Option<&[Option<i64>]> {
        self.known.get(&tensor).map(Vec::as_slice)
    }

    /// The layer that defines `tensor`, if it is not a network input.
    pub fn producer(&self, tensor: TensorId) -> Option<&RecordedLayer> {
        self.layers
            .iter()
            .find(|recorded| recorded.outputs.contains(&tensor))
    }

    pub fn count_kind(&self, kind: LayerKind) -> usize {
        self.layers
            .iter()
            .filter(|recorded| recorded.layer.kind() == kind)
            .count()
    }

    pub fn kind_histogram(&self) -> BTreeMap<LayerKind, usize> {
        let mut histogram = BTreeMap::new();
        for recorded in &self.layers {
            *histogram.entry(recorded.layer.kind()).or_insert(0) += 1;
        }
        histogram
    }

    /// Layers attributed to `node`, in emission order.
    pub fn layers_for(&self, node: NodeId) -> impl Iterator<Item = &RecordedLayer> {
        self.layers
            .iter()
            .filter(move |recorded| recorded.origin == Some(node))
    }

    pub fn to_json_string(&self) -> LoweringResult<String> {
        serde_json::to_string_pretty(self).map_err(LoweringError::from)
    }

    fn define(&mut self, spec: TensorSpec, known: Option<Known>) -> TensorRef {
        let id = TensorId(self.tensors.len() as u32);
        self.tensors.push(spec.clone());
        if let Some(values) = known {
            self.known.insert(id, values);
        }
        TensorRef::new(id, spec)
    }
}

impl TensorLookup for Network {
    fn spec_of(&self, id: TensorId) -> LoweringResult<&TensorSpec> {
        self.spec(id)
            .ok_or_else(|| LoweringError::target(format!("unknown tensor {id}")))
    }

    fn known_of(&self, id: TensorId) -> Option<&[Option<i64>]> {
        self.known_values(id)
    }
}

impl NetworkBuilder for Network {
    fn has_implicit_batch_dimension(&self) -> bool {
        self.implicit_batch
    }

    fn begin_node(&mut self, node: &SourceNode) {
        self.current_origin = Some(node.id);
    }

    fn add_input(&mut self, name: &str, spec: TensorSpec) -> LoweringResult<TensorRef> {
        if self.inputs.iter().any(|(existing, _)| existing == name) {
            return Err(LoweringError::target(format!("duplicate network input '{name}'")));
        }
        let tensor = self.define(spec, None);
        self.inputs.push((name.to_string(), tensor.id));
        Ok(tensor)
    }

    fn add_layer(&mut self, layer: Layer) -> LoweringResult<Vec<TensorRef>> {
        let inferred = infer_layer(&*self, &layer)?;
        let outputs: Vec<TensorRef> = inferred
            .into_iter()
            .map(|out| self.define(out.spec, out.known))
            .collect();
        self.layers.push(RecordedLayer {
            layer,
            outputs: outputs.iter().map(|tensor| tensor.id).collect(),
            origin: self.current_origin,
        });
        Ok(outputs)
    }

    fn mark_output(&mut self, tensor: TensorId, name: &str) -> LoweringResult<()> {
        if self.spec(tensor).is_none() {
            return Err(LoweringError::target(format!("cannot mark unknown tensor {tensor}")));
        }
        self.outputs.push((name.to_string(), tensor));
        Ok(())
    }

    fn tensor_spec(&self, tensor: TensorId) -> Option<TensorSpec> {
        self.spec(tensor).cloned()
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, id) in &self.inputs {
            if let Some(spec) = self.spec(*id) {
                writeln!(f, "input {name}: {id} {spec}")?;
            }
        }
        for recorded in &self.layers {
            for (idx, id) in recorded.outputs.iter().enumerate() {
                if idx > 0 {
                    f.write_str(", ")?;
                }
                match self.spec(*id) {
                    Some(spec) => write!(f, "{id}: {spec}")?,
                    None => write!(f, "{id}")?,
                }
            }
            write!(f, " = {:?}", recorded.layer.kind())?;
            let inputs = recorded.layer.inputs();
            if !inputs.is_empty() {
                let names: Vec<String> = inputs.iter().map(ToString::to_string).collect();
                write!(f, "({})", names.join(", "))?;
            }
            if let Some(origin) = recorded.origin {
                write!(f, "  // {origin}")?;
            }
            writeln!(f)?;
        }
        for (name, id) in &self.outputs {
            writeln!(f, "output {name}: {id}")?;
        }
        Ok(())
    }
}
