#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Once;

use anyhow::{anyhow, Result};
use pir_lower::pipeline::{lower_graph, Lowered};
use pir_lower::source::AttrValue;
use pir_lower::target::interp::{evaluate, HostTensor};
use pir_lower::target::{LayerKind, RecordedLayer};
use pir_lower::{DType, LowerOptions, Shape, SourceGraph, TensorSpec};
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Routes library logs to the test writer; `RUST_LOG` picks the level.
pub fn init_logging() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Spec with `-1` marking dynamic extents.
pub fn spec(dtype: DType, dims: &[i64]) -> TensorSpec {
    TensorSpec::new(dtype, Shape::from_i64s(dims))
}

pub fn f32s(dims: &[i64]) -> TensorSpec {
    spec(DType::F32, dims)
}

pub fn i32s(dims: &[i64]) -> TensorSpec {
    spec(DType::Si32, dims)
}

pub fn ints(values: &[i64]) -> AttrValue {
    AttrValue::I64Array(values.to_vec())
}

pub fn lower(graph: &SourceGraph) -> Result<Lowered> {
    init_logging();
    lower_graph(graph, &LowerOptions::default())
}

pub fn host(dtype: DType, dims: &[usize], data: &[f64]) -> HostTensor {
    HostTensor::new(dtype, dims.to_vec(), data.to_vec())
        .unwrap_or_else(|err| panic!("bad host tensor: {err}"))
}

/// Evaluates the lowered network and returns `output_{index}`.
pub fn run(lowered: &Lowered, inputs: Vec<(&str, HostTensor)>, index: usize) -> Result<HostTensor> {
    let inputs: BTreeMap<String, HostTensor> = inputs
        .into_iter()
        .map(|(name, tensor)| (name.to_string(), tensor))
        .collect();
    let mut outputs = evaluate(&lowered.network, &inputs)?;
    let name = format!("output_{index}");
    outputs
        .remove(&name)
        .ok_or_else(|| anyhow!("network has no output named {name}"))
}

pub fn output_spec(lowered: &Lowered, index: usize) -> TensorSpec {
    lowered.translation.outputs[index].spec.clone()
}

pub fn layers_of(lowered: &Lowered, kind: LayerKind) -> Vec<&RecordedLayer> {
    lowered
        .network
        .layers()
        .iter()
        .filter(|recorded| recorded.layer.kind() == kind)
        .collect()
}

pub fn assert_close(actual: &[f64], expected: &[f64], tolerance: f64) {
    assert_eq!(actual.len(), expected.len(), "length mismatch: {actual:?} vs {expected:?}");
    for (idx, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!(
            (a - e).abs() <= tolerance,
            "element {idx}: {a} vs {e} (tolerance {tolerance})"
        );
    }
}
