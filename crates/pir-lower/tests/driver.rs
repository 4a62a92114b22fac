mod common;

use std::collections::BTreeMap;
use std::fs;

use pir_lower::lowering::{Converter, LowerCtx, LowerFn};
use pir_lower::pipeline::{lower_graph_file, lower_graph_with, lower_json};
use pir_lower::source::{kinds, NodeId};
use pir_lower::target::LayerKind;
use pir_lower::{
    ConverterRegistry, DType, LowerOptions, LoweredValue, LoweringError, LoweringResult,
    SourceGraph, SourceGraphBuilder, SourceNode, TargetVersion, ValueRef, VersionReq,
};

use common::{f32s, host, init_logging, lower, run};

fn lowering_error(err: &anyhow::Error) -> &LoweringError {
    err.downcast_ref::<LoweringError>()
        .unwrap_or_else(|| panic!("expected a lowering error, got {err:#}"))
}

fn relu_tanh() -> SourceGraph {
    let mut b = SourceGraphBuilder::new();
    let x = b.input("x", f32s(&[2, 3]));
    let y = b.op1(kinds::RELU, &[x], vec![], f32s(&[2, 3]));
    let z = b.op1(kinds::TANH, &[y], vec![], f32s(&[2, 3]));
    b.output(z);
    b.finish().expect("graph")
}

fn single_relu() -> SourceGraph {
    let mut b = SourceGraphBuilder::new();
    let x = b.input("x", f32s(&[2, 3]));
    let y = b.op1(kinds::RELU, &[x], vec![], f32s(&[2, 3]));
    b.output(y);
    b.finish().expect("graph")
}

fn registry_with(lower: LowerFn, name: &'static str) -> ConverterRegistry {
    let mut registry = ConverterRegistry::new();
    let any = VersionReq::AtLeast(TargetVersion::new(0, 0, 0));
    registry
        .register(kinds::RELU, any, Converter { name, lower })
        .expect("registration");
    registry
}

fn wrong_rank(
    ctx: &mut LowerCtx<'_>,
    _node: &SourceNode,
    _inputs: &[LoweredValue],
) -> LoweringResult<Vec<LoweredValue>> {
    Ok(vec![ctx.int_const(&[1, 2])?])
}

fn leaks_not_constant(
    _ctx: &mut LowerCtx<'_>,
    _node: &SourceNode,
    _inputs: &[LoweredValue],
) -> LoweringResult<Vec<LoweredValue>> {
    Err(LoweringError::NotConstant)
}

fn no_outputs(
    _ctx: &mut LowerCtx<'_>,
    _node: &SourceNode,
    _inputs: &[LoweredValue],
) -> LoweringResult<Vec<LoweredValue>> {
    Ok(Vec::new())
}

fn node(id: u32, kind: &str, operands: Vec<ValueRef>) -> SourceNode {
    SourceNode {
        id: NodeId(id),
        kind: kind.to_string(),
        operands,
        outputs: vec![f32s(&[2])],
        attrs: BTreeMap::new(),
    }
}

#[test]
fn unknown_kind_reports_missing_converter_at_its_position() {
    let mut b = SourceGraphBuilder::new();
    let x = b.input("x", f32s(&[2]));
    let y = b.op1("pd_op.lgamma", &[x], vec![], f32s(&[2]));
    b.output(y);
    let graph = b.finish().expect("graph");

    let err = lower(&graph).expect_err("no converter");
    match lowering_error(&err) {
        LoweringError::Node {
            kind,
            position,
            source,
        } => {
            assert_eq!(kind, "pd_op.lgamma");
            assert_eq!(*position, 1);
            match &**source {
                LoweringError::NoConverter { kind, version } => {
                    assert_eq!(kind, "pd_op.lgamma");
                    assert_eq!(version, "8.6.0");
                }
                other => panic!("unexpected source: {other}"),
            }
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn operand_from_outside_the_graph_is_unresolved() {
    let graph = SourceGraph::new(
        vec![node(0, kinds::RELU, vec![ValueRef::new(NodeId(7), 0)])],
        vec![ValueRef::new(NodeId(0), 0)],
    )
    .expect("graph");

    let err = lower(&graph).expect_err("dangling operand");
    let err = lowering_error(&err);
    assert!(err.is_invalid_graph(), "{err}");
    match err.root_cause() {
        LoweringError::UnresolvedOperand { node, index, value } => {
            assert_eq!(*node, NodeId(0));
            assert_eq!(*index, 0);
            assert_eq!(*value, ValueRef::new(NodeId(7), 0));
        }
        other => panic!("unexpected root cause: {other}"),
    }
}

#[test]
fn cyclic_graph_is_invalid() {
    let graph = SourceGraph::new(
        vec![
            node(0, kinds::RELU, vec![ValueRef::new(NodeId(1), 0)]),
            node(1, kinds::TANH, vec![ValueRef::new(NodeId(0), 0)]),
        ],
        vec![ValueRef::new(NodeId(1), 0)],
    )
    .expect("graph");

    let err = lower(&graph).expect_err("cycle");
    let err = lowering_error(&err);
    assert!(err.is_invalid_graph(), "{err}");
    assert!(err.to_string().contains("cycle"), "{err}");
}

#[test]
fn duplicate_node_ids_are_rejected() {
    let err = SourceGraph::new(
        vec![node(3, kinds::RELU, vec![]), node(3, kinds::TANH, vec![])],
        vec![],
    )
    .expect_err("duplicate ids");
    assert!(err.is_invalid_graph(), "{err}");
}

#[test]
fn outputs_are_marked_in_graph_order() {
    let mut b = SourceGraphBuilder::new();
    let x = b.input("x", f32s(&[2]));
    let y = b.op1(kinds::RELU, &[x], vec![], f32s(&[2]));
    let z = b.op1(kinds::TANH, &[x], vec![], f32s(&[2]));
    b.output(z);
    b.output(y);
    let graph = b.finish().expect("graph");

    let lowered = lower(&graph).expect("lowering");
    let names: Vec<&str> = lowered
        .network
        .outputs()
        .iter()
        .map(|(name, _)| name.as_str())
        .collect();
    assert_eq!(names, vec!["output_0", "output_1"]);
    assert_eq!(lowered.translation.outputs.len(), 2);

    let relu = run(&lowered, vec![("x", host(DType::F32, &[2], &[-1.0, 2.0]))], 1)
        .expect("evaluation");
    assert_eq!(relu.data, vec![0.0, 2.0]);
}

#[test]
fn lowered_node_count_skips_inputs_and_constants() {
    let mut b = SourceGraphBuilder::new();
    let x = b.input("x", f32s(&[2]));
    let two = b.full(&[1], 2.0, DType::F32);
    let y = b.op1(kinds::MULTIPLY, &[x, two], vec![], f32s(&[2]));
    let z = b.op1(kinds::RELU, &[y], vec![], f32s(&[2]));
    b.output(z);
    let graph = b.finish().expect("graph");

    let lowered = lower(&graph).expect("lowering");
    assert_eq!(lowered.translation.lowered_nodes, 2);
    assert_eq!(lowered.translation.values.len(), 4);
}

#[test]
fn layers_are_attributed_to_their_source_node() {
    let lowered = lower(&relu_tanh()).expect("lowering");
    let relu: Vec<_> = lowered.network.layers_for(NodeId(1)).collect();
    let tanh: Vec<_> = lowered.network.layers_for(NodeId(2)).collect();
    assert_eq!(relu.len(), 1);
    assert_eq!(tanh.len(), 1);
    assert_eq!(relu[0].layer.kind(), LayerKind::Activation);
    assert_eq!(lowered.network.layers_for(NodeId(0)).count(), 0);
}

#[test]
fn constant_graph_output_is_materialized() {
    let mut b = SourceGraphBuilder::new();
    let value = b.full(&[3], 1.5, DType::F32);
    b.output(value);
    let graph = b.finish().expect("graph");

    let lowered = lower(&graph).expect("lowering");
    assert_eq!(lowered.translation.lowered_nodes, 0);
    assert_eq!(lowered.network.count_kind(LayerKind::Constant), 1);
    let out = run(&lowered, vec![], 0).expect("evaluation");
    assert_eq!(out.data, vec![1.5, 1.5, 1.5]);
}

#[test]
fn output_rank_mismatch_is_invalid_unless_verification_is_off() {
    init_logging();
    let registry = registry_with(wrong_rank, "wrong_rank");
    let graph = single_relu();

    let err = lower_graph_with(&graph, &registry, &LowerOptions::default())
        .expect_err("rank mismatch");
    let err = lowering_error(&err);
    assert!(err.is_invalid_graph(), "{err}");
    assert!(err.to_string().contains("wrong_rank"), "{err}");

    let relaxed = LowerOptions {
        verify_output_ranks: false,
        ..LowerOptions::default()
    };
    let lowered = lower_graph_with(&graph, &registry, &relaxed).expect("unverified lowering");
    assert_eq!(lowered.translation.outputs[0].spec.rank(), 1);
}

#[test]
fn leaked_not_constant_becomes_invalid_graph() {
    init_logging();
    let registry = registry_with(leaks_not_constant, "leaky");
    let err = lower_graph_with(&single_relu(), &registry, &LowerOptions::default())
        .expect_err("leak");
    let err = lowering_error(&err);
    assert!(!err.is_not_constant(), "{err}");
    assert!(err.is_invalid_graph(), "{err}");
}

#[test]
fn converter_output_count_must_match_node() {
    init_logging();
    let registry = registry_with(no_outputs, "empty");
    let err = lower_graph_with(&single_relu(), &registry, &LowerOptions::default())
        .expect_err("count mismatch");
    assert!(lowering_error(&err).is_invalid_graph());
}

#[test]
fn target_version_selects_converters() {
    init_logging();
    let options = LowerOptions::default().with_target_version(TargetVersion::new(7, 2, 0));
    let err = pir_lower::pipeline::lower_graph(&single_relu(), &options).expect_err("too old");
    assert!(matches!(
        lowering_error(&err).root_cause(),
        LoweringError::NoConverter { .. }
    ));
}

#[test]
fn json_graph_lowers_like_the_built_graph() -> anyhow::Result<()> {
    init_logging();
    let graph = relu_tanh();
    let text = graph.to_json_string()?;
    assert_eq!(SourceGraph::from_json_str(&text)?, graph);

    let from_json = lower_json(&text, &LowerOptions::default())?;
    let direct = lower(&graph)?;
    assert_eq!(
        from_json.network.kind_histogram(),
        direct.network.kind_histogram()
    );
    Ok(())
}

#[test]
fn malformed_json_fails_with_context() {
    let err = lower_json("{\"nodes\": 3}", &LowerOptions::default()).expect_err("bad json");
    assert!(format!("{err:#}").contains("failed to parse source graph"));
}

#[test]
fn graph_file_round_trip() {
    init_logging();
    let path = std::env::temp_dir().join(format!("pir-lower-driver-{}.json", std::process::id()));
    fs::write(&path, relu_tanh().to_json_string().expect("serialize")).expect("write graph");
    let lowered = lower_graph_file(&path, &LowerOptions::default());
    fs::remove_file(&path).ok();
    let lowered = lowered.expect("lowering");
    assert_eq!(lowered.network.count_kind(LayerKind::Activation), 2);

    let missing = lower_graph_file(path.with_extension("missing"), &LowerOptions::default());
    assert!(missing.is_err());
}
