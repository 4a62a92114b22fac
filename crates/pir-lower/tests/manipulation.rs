mod common;

use pir_lower::source::{kinds, AttrValue};
use pir_lower::target::{Layer, LayerKind, LayerParam};
use pir_lower::{DType, SourceGraphBuilder};

use common::{f32s, host, i32s, layers_of, lower, output_spec, run, spec};

fn iota(count: usize) -> Vec<f64> {
    (0..count).map(|v| v as f64).collect()
}

#[test]
fn reshape_with_literal_dims_sets_them_on_the_shuffle() {
    let mut b = SourceGraphBuilder::new();
    let x = b.input("x", f32s(&[2, 3, 4]));
    let shape = b.full_int_array(&[0, -1]);
    let y = b.op1(kinds::RESHAPE, &[x, shape], vec![], f32s(&[2, 12]));
    b.output(y);
    let graph = b.finish().expect("graph");

    let lowered = lower(&graph).expect("lowering");
    let shuffles = layers_of(&lowered, LayerKind::Shuffle);
    assert_eq!(shuffles.len(), 1);
    match &shuffles[0].layer {
        Layer::Shuffle {
            reshape: Some(LayerParam::Static(dims)),
            zero_is_placeholder,
            first_transpose,
            ..
        } => {
            assert_eq!(dims, &vec![0, -1]);
            assert!(*zero_is_placeholder);
            assert!(first_transpose.is_none());
        }
        other => panic!("unexpected layer {other:?}"),
    }
    assert_eq!(output_spec(&lowered, 0), f32s(&[2, 12]));

    let out = run(&lowered, vec![("x", host(DType::F32, &[2, 3, 4], &iota(24)))], 0)
        .expect("evaluation");
    assert_eq!(out.dims, vec![2, 12]);
    assert_eq!(out.data, iota(24));
}

#[test]
fn reshape_with_runtime_dims_reads_them_from_a_tensor() {
    let mut b = SourceGraphBuilder::new();
    let x = b.input("x", f32s(&[-1, 6]));
    let shape = b.input("shape", i32s(&[2]));
    let y = b.op1(kinds::RESHAPE, &[x, shape], vec![], f32s(&[-1, -1]));
    b.output(y);
    let graph = b.finish().expect("graph");

    let lowered = lower(&graph).expect("lowering");
    let shuffle = &layers_of(&lowered, LayerKind::Shuffle)[0].layer;
    assert!(matches!(
        shuffle,
        Layer::Shuffle {
            reshape: Some(LayerParam::Runtime(_)),
            ..
        }
    ));

    let out = run(
        &lowered,
        vec![
            ("x", host(DType::F32, &[2, 6], &iota(12))),
            ("shape", host(DType::Si32, &[2], &[3.0, 4.0])),
        ],
        0,
    )
    .expect("evaluation");
    assert_eq!(out.dims, vec![3, 4]);
}

#[test]
fn flatten_static_range_multiplies_extents() {
    let mut b = SourceGraphBuilder::new();
    let x = b.input("x", f32s(&[2, 3, 4, 5]));
    let y = b.op1(
        kinds::FLATTEN,
        &[x],
        vec![("start_axis", AttrValue::I64(1)), ("stop_axis", AttrValue::I64(2))],
        f32s(&[2, 12, 5]),
    );
    b.output(y);
    let graph = b.finish().expect("graph");

    let lowered = lower(&graph).expect("lowering");
    assert_eq!(output_spec(&lowered, 0), f32s(&[2, 12, 5]));
    assert_eq!(lowered.network.count_kind(LayerKind::Shape), 0);
}

#[test]
fn flatten_dynamic_leading_axis_uses_runtime_shape() {
    let mut b = SourceGraphBuilder::new();
    let x = b.input("x", f32s(&[-1, 3, 4]));
    let y = b.op1(
        kinds::FLATTEN,
        &[x],
        vec![("start_axis", AttrValue::I64(1))],
        f32s(&[-1, 12]),
    );
    b.output(y);
    let graph = b.finish().expect("graph");

    let lowered = lower(&graph).expect("lowering");
    assert_eq!(output_spec(&lowered, 0).rank(), 2);
    assert_eq!(lowered.network.count_kind(LayerKind::Shape), 1);

    let out = run(&lowered, vec![("x", host(DType::F32, &[2, 3, 4], &iota(24)))], 0)
        .expect("evaluation");
    assert_eq!(out.dims, vec![2, 12]);
    assert_eq!(out.data, iota(24));
}

#[test]
fn flatten_of_scalar_yields_one_element_vector() {
    let mut b = SourceGraphBuilder::new();
    let x = b.input("x", f32s(&[]));
    let y = b.op1(kinds::FLATTEN, &[x], vec![], f32s(&[1]));
    b.output(y);
    let graph = b.finish().expect("graph");

    let lowered = lower(&graph).expect("lowering");
    let out = run(&lowered, vec![("x", host(DType::F32, &[], &[7.0]))], 0).expect("evaluation");
    assert_eq!(out.dims, vec![1]);
    assert_eq!(out.data, vec![7.0]);
}

#[test]
fn flatten_rejects_inverted_axis_range() {
    let mut b = SourceGraphBuilder::new();
    let x = b.input("x", f32s(&[2, 3, 4]));
    let y = b.op1(
        kinds::FLATTEN,
        &[x],
        vec![("start_axis", AttrValue::I64(2)), ("stop_axis", AttrValue::I64(1))],
        f32s(&[2, 3, 4]),
    );
    b.output(y);
    let graph = b.finish().expect("graph");

    let err = lower(&graph).expect_err("start after stop");
    assert!(format!("{err:#}").contains("start_axis"), "{err:#}");
}

#[test]
fn concat_takes_axis_as_last_operand() {
    let mut b = SourceGraphBuilder::new();
    let lhs = b.input("lhs", f32s(&[2, 2]));
    let rhs = b.input("rhs", f32s(&[2, 3]));
    let axis = b.full_int_array(&[-1]);
    let y = b.op1(kinds::CONCAT, &[lhs, rhs, axis], vec![], f32s(&[2, 5]));
    b.output(y);
    let graph = b.finish().expect("graph");

    let lowered = lower(&graph).expect("lowering");
    assert_eq!(output_spec(&lowered, 0), f32s(&[2, 5]));
    let out = run(
        &lowered,
        vec![
            ("lhs", host(DType::F32, &[2, 2], &[1.0, 2.0, 3.0, 4.0])),
            ("rhs", host(DType::F32, &[2, 3], &[5.0, 6.0, 7.0, 8.0, 9.0, 10.0])),
        ],
        0,
    )
    .expect("evaluation");
    assert_eq!(
        out.data,
        vec![1.0, 2.0, 5.0, 6.0, 7.0, 3.0, 4.0, 8.0, 9.0, 10.0]
    );
}

#[test]
fn concat_with_runtime_axis_is_unsupported() {
    let mut b = SourceGraphBuilder::new();
    let lhs = b.input("lhs", f32s(&[2]));
    let rhs = b.input("rhs", f32s(&[2]));
    let axis = b.input("axis", i32s(&[1]));
    let y = b.op1(kinds::CONCAT, &[lhs, rhs, axis], vec![], f32s(&[4]));
    b.output(y);
    let graph = b.finish().expect("graph");

    let err = lower(&graph).expect_err("runtime axis");
    let err = err
        .downcast_ref::<pir_lower::LoweringError>()
        .expect("lowering error");
    assert!(err.is_unsupported(), "{err}");
}

#[test]
fn stack_inserts_new_axis() {
    let mut b = SourceGraphBuilder::new();
    let lhs = b.input("lhs", f32s(&[2]));
    let rhs = b.input("rhs", f32s(&[2]));
    let y = b.op1(
        kinds::STACK,
        &[lhs, rhs],
        vec![("axis", AttrValue::I64(1))],
        f32s(&[2, 2]),
    );
    b.output(y);
    let graph = b.finish().expect("graph");

    let lowered = lower(&graph).expect("lowering");
    let out = run(
        &lowered,
        vec![
            ("lhs", host(DType::F32, &[2], &[1.0, 2.0])),
            ("rhs", host(DType::F32, &[2], &[3.0, 4.0])),
        ],
        0,
    )
    .expect("evaluation");
    assert_eq!(out.dims, vec![2, 2]);
    assert_eq!(out.data, vec![1.0, 3.0, 2.0, 4.0]);
}

#[test]
fn unsqueeze_inserts_axes_in_order() {
    let mut b = SourceGraphBuilder::new();
    let x = b.input("x", f32s(&[3, 4]));
    let axes = b.full_int_array(&[0, -1]);
    let y = b.op1(kinds::UNSQUEEZE, &[x, axes], vec![], f32s(&[1, 3, 4, 1]));
    b.output(y);
    let graph = b.finish().expect("graph");

    let lowered = lower(&graph).expect("lowering");
    assert_eq!(output_spec(&lowered, 0), f32s(&[1, 3, 4, 1]));
}

#[test]
fn unsqueeze_of_dynamic_input_builds_target_shape() {
    let mut b = SourceGraphBuilder::new();
    let x = b.input("x", f32s(&[-1, 4]));
    let y = b.op1(
        kinds::UNSQUEEZE_,
        &[x],
        vec![("axis", common::ints(&[1]))],
        f32s(&[-1, 1, 4]),
    );
    b.output(y);
    let graph = b.finish().expect("graph");

    let lowered = lower(&graph).expect("lowering");
    let out = run(&lowered, vec![("x", host(DType::F32, &[2, 4], &iota(8)))], 0)
        .expect("evaluation");
    assert_eq!(out.dims, vec![2, 1, 4]);
}

#[test]
fn squeeze_without_axes_drops_every_unit_axis() {
    let mut b = SourceGraphBuilder::new();
    let x = b.input("x", f32s(&[1, 3, 1]));
    let axes = b.full_int_array(&[]);
    let y = b.op1(kinds::SQUEEZE, &[x, axes], vec![], f32s(&[3]));
    b.output(y);
    let graph = b.finish().expect("graph");

    let lowered = lower(&graph).expect("lowering");
    assert_eq!(output_spec(&lowered, 0), f32s(&[3]));
}

#[test]
fn squeeze_drops_dynamic_axes_only_when_declared_rank_needs_it() {
    let build = |declared: &[i64]| {
        let mut b = SourceGraphBuilder::new();
        let x = b.input("x", f32s(&[-1, 3, 1]));
        let axes = b.full_int_array(&[0, 2]);
        let y = b.op1(kinds::SQUEEZE, &[x, axes], vec![], f32s(declared));
        b.output(y);
        b.finish().expect("graph")
    };

    let lowered = lower(&build(&[3])).expect("lowering");
    assert_eq!(output_spec(&lowered, 0).rank(), 1);
    let out = run(&lowered, vec![("x", host(DType::F32, &[1, 3, 1], &iota(3)))], 0)
        .expect("evaluation");
    assert_eq!(out.dims, vec![3]);

    let lowered = lower(&build(&[-1, 3])).expect("lowering");
    assert_eq!(output_spec(&lowered, 0).rank(), 2);
}

#[test]
fn expand_broadcasts_unit_axes_and_keeps_minus_one() {
    let mut b = SourceGraphBuilder::new();
    let x = b.input("x", f32s(&[3, 1]));
    let shape = b.full_int_array(&[2, -1, 4]);
    let y = b.op1(kinds::EXPAND, &[x, shape], vec![], f32s(&[2, 3, 4]));
    b.output(y);
    let graph = b.finish().expect("graph");

    let lowered = lower(&graph).expect("lowering");
    assert_eq!(output_spec(&lowered, 0), f32s(&[2, 3, 4]));
    let out = run(&lowered, vec![("x", host(DType::F32, &[3, 1], &[1.0, 2.0, 3.0]))], 0)
        .expect("evaluation");
    assert_eq!(out.dims, vec![2, 3, 4]);
    for (flat, value) in out.data.iter().enumerate() {
        let row = (flat / 4) % 3;
        assert_eq!(*value, (row + 1) as f64, "element {flat}");
    }
}

#[test]
fn expand_as_follows_the_second_operand() {
    let mut b = SourceGraphBuilder::new();
    let x = b.input("x", f32s(&[1, 4]));
    let y = b.input("y", f32s(&[-1, 4]));
    let z = b.op1(kinds::EXPAND_AS, &[x, y], vec![], f32s(&[-1, 4]));
    b.output(z);
    let graph = b.finish().expect("graph");

    let lowered = lower(&graph).expect("lowering");
    let out = run(
        &lowered,
        vec![
            ("x", host(DType::F32, &[1, 4], &[1.0, 2.0, 3.0, 4.0])),
            ("y", host(DType::F32, &[3, 4], &iota(12))),
        ],
        0,
    )
    .expect("evaluation");
    assert_eq!(out.dims, vec![3, 4]);
    assert_eq!(&out.data[8..], &[1.0, 2.0, 3.0, 4.0]);
}

#[test]
fn expand_to_lower_rank_is_rejected() {
    let mut b = SourceGraphBuilder::new();
    let x = b.input("x", f32s(&[2, 3]));
    let shape = b.full_int_array(&[3]);
    let y = b.op1(kinds::EXPAND, &[x, shape], vec![], f32s(&[2, 3]));
    b.output(y);
    let graph = b.finish().expect("graph");
    assert!(lower(&graph).is_err());
}

#[test]
fn cast_converts_dtype_by_name() {
    let mut b = SourceGraphBuilder::new();
    let x = b.input("x", f32s(&[3]));
    let y = b.op1(
        kinds::CAST,
        &[x],
        vec![("dtype", AttrValue::String("int32".into()))],
        i32s(&[3]),
    );
    b.output(y);
    let graph = b.finish().expect("graph");

    let lowered = lower(&graph).expect("lowering");
    assert_eq!(lowered.network.count_kind(LayerKind::Cast), 1);
    let out = run(&lowered, vec![("x", host(DType::F32, &[3], &[1.7, 2.2, 3.0]))], 0)
        .expect("evaluation");
    assert_eq!(out.dtype, DType::Si32);
    assert_eq!(out.to_i64s(), vec![1, 2, 3]);
}

#[test]
fn cast_to_same_dtype_emits_nothing() {
    let mut b = SourceGraphBuilder::new();
    let x = b.input("x", f32s(&[3]));
    let y = b.op1(
        kinds::CAST_,
        &[x],
        vec![("dtype", AttrValue::String("float32".into()))],
        f32s(&[3]),
    );
    b.output(y);
    let graph = b.finish().expect("graph");

    let lowered = lower(&graph).expect("lowering");
    assert!(lowered.network.layers().is_empty());
}

#[test]
fn gather_nd_picks_coordinate_tuples() {
    let mut b = SourceGraphBuilder::new();
    let x = b.input("x", f32s(&[2, 3]));
    let index = b.input("index", spec(DType::Si64, &[2, 2]));
    let y = b.op1(kinds::GATHER_ND, &[x, index], vec![], f32s(&[2]));
    b.output(y);
    let graph = b.finish().expect("graph");

    let lowered = lower(&graph).expect("lowering");
    let out = run(
        &lowered,
        vec![
            ("x", host(DType::F32, &[2, 3], &iota(6))),
            ("index", host(DType::Si64, &[2, 2], &[0.0, 2.0, 1.0, 1.0])),
        ],
        0,
    )
    .expect("evaluation");
    assert_eq!(out.data, vec![2.0, 4.0]);
}

#[test]
fn arange_with_literal_bounds_is_a_constant() {
    let mut b = SourceGraphBuilder::new();
    let start = b.full(&[], 1.0, DType::Si64);
    let end = b.full(&[], 10.0, DType::Si64);
    let step = b.full(&[], 3.0, DType::Si64);
    let y = b.op1(
        kinds::ARANGE,
        &[start, end, step],
        vec![("dtype", AttrValue::String("int64".into()))],
        spec(DType::Si64, &[3]),
    );
    b.output(y);
    let graph = b.finish().expect("graph");

    let lowered = lower(&graph).expect("lowering");
    assert_eq!(lowered.network.count_kind(LayerKind::Arange), 0);
    let out = run(&lowered, vec![], 0).expect("evaluation");
    assert_eq!(out.to_i64s(), vec![1, 4, 7]);
}

#[test]
fn arange_with_runtime_end_counts_by_ceiling() {
    let mut b = SourceGraphBuilder::new();
    let start = b.full(&[], 2.0, DType::Si64);
    let end = b.input("end", spec(DType::Si64, &[]));
    let step = b.full(&[], 3.0, DType::Si64);
    let y = b.op1(
        kinds::ARANGE,
        &[start, end, step],
        vec![("dtype", AttrValue::String("int64".into()))],
        spec(DType::Si64, &[-1]),
    );
    b.output(y);
    let graph = b.finish().expect("graph");

    let lowered = lower(&graph).expect("lowering");
    assert_eq!(lowered.network.count_kind(LayerKind::Arange), 1);
    let out = run(&lowered, vec![("end", host(DType::Si64, &[], &[10.0]))], 0)
        .expect("evaluation");
    assert_eq!(out.dtype, DType::Si64);
    assert_eq!(out.to_i64s(), vec![2, 5, 8]);
}

#[test]
fn long_literal_arange_is_emitted_as_a_layer() {
    let mut b = SourceGraphBuilder::new();
    let start = b.full(&[], 5.0, DType::Si64);
    let end = b.full(&[], 100_005.0, DType::Si64);
    let step = b.full(&[], 1.0, DType::Si64);
    let y = b.op1(
        kinds::ARANGE,
        &[start, end, step],
        vec![("dtype", AttrValue::String("int64".into()))],
        spec(DType::Si64, &[100_000]),
    );
    b.output(y);
    let graph = b.finish().expect("graph");

    let lowered = lower(&graph).expect("lowering");
    assert_eq!(lowered.network.count_kind(LayerKind::Arange), 1);
    assert_eq!(lowered.network.count_kind(LayerKind::Constant), 0);
    let out = run(&lowered, vec![], 0).expect("evaluation");
    assert_eq!(out.dims, vec![100_000]);
    let values = out.to_i64s();
    assert_eq!(values[0], 5);
    assert_eq!(values[99_999], 100_004);
}

#[test]
fn long_fractional_arange_is_unsupported() {
    let mut b = SourceGraphBuilder::new();
    let start = b.full(&[], 0.0, DType::F32);
    let end = b.full(&[], 50_000.0, DType::F32);
    let step = b.full(&[], 0.5, DType::F32);
    let y = b.op1(
        kinds::ARANGE,
        &[start, end, step],
        vec![("dtype", AttrValue::String("float32".into()))],
        f32s(&[100_000]),
    );
    b.output(y);
    let graph = b.finish().expect("graph");

    let err = lower(&graph).expect_err("too long to fold");
    let err = err.downcast_ref::<pir_lower::LoweringError>().expect("lowering error");
    assert!(err.is_unsupported(), "{err}");
}
