use pir_lower::lowering::{Converter, LowerCtx};
use pir_lower::source::kinds;
use pir_lower::{
    builtin_registry, ConverterRegistry, LoweredValue, LoweringError, LoweringResult,
    SourceNode, TargetVersion, VersionReq,
};

fn passthrough(
    _ctx: &mut LowerCtx<'_>,
    _node: &SourceNode,
    inputs: &[LoweredValue],
) -> LoweringResult<Vec<LoweredValue>> {
    Ok(inputs.to_vec())
}

fn nothing(
    _ctx: &mut LowerCtx<'_>,
    _node: &SourceNode,
    _inputs: &[LoweredValue],
) -> LoweringResult<Vec<LoweredValue>> {
    Ok(Vec::new())
}

const PASSTHROUGH: Converter = Converter {
    name: "passthrough",
    lower: passthrough,
};

const NOTHING: Converter = Converter {
    name: "nothing",
    lower: nothing,
};

fn v8() -> VersionReq {
    VersionReq::Major(8)
}

#[test]
fn builtin_registry_covers_every_supported_kind() {
    let registry = builtin_registry().expect("built-in registry should assemble");
    for kind in [
        kinds::RESHAPE,
        kinds::FLATTEN,
        kinds::CONCAT,
        kinds::STACK,
        kinds::UNSQUEEZE,
        kinds::UNSQUEEZE_,
        kinds::SQUEEZE,
        kinds::SQUEEZE_,
        kinds::EXPAND,
        kinds::EXPAND_AS,
        kinds::CAST,
        kinds::CAST_,
        kinds::SLICE,
        kinds::STRIDED_SLICE,
        kinds::SPLIT,
        kinds::SPLIT_WITH_NUM,
        kinds::TILE,
        kinds::ROLL,
        kinds::GATHER_ND,
        kinds::ARANGE,
        kinds::ADD,
        kinds::ADD_,
        kinds::SUBTRACT,
        kinds::MULTIPLY,
        kinds::DIVIDE,
        kinds::FLOOR_DIVIDE,
        kinds::MAXIMUM,
        kinds::MINIMUM,
        kinds::REMAINDER,
        kinds::REMAINDER_,
        kinds::SCALE,
        kinds::MAX,
        kinds::MIN,
        kinds::SUM,
        kinds::ANY,
        kinds::ALL,
        kinds::CLIP,
        kinds::LOG,
        kinds::RELU,
        kinds::TANH,
        kinds::SIGMOID,
        kinds::SOFTMAX,
        kinds::GELU,
        kinds::HARDSIGMOID,
        kinds::HARDSWISH,
        kinds::SOFTPLUS,
        kinds::SWISH,
        kinds::SILU,
    ] {
        assert!(registry.contains(kind), "{kind} has no converter");
        registry
            .lookup(kind, TargetVersion::new(8, 6, 0))
            .unwrap_or_else(|err| panic!("lookup of {kind} failed: {err}"));
    }
}

#[test]
fn builtin_converters_require_version_eight() {
    let registry = builtin_registry().expect("built-in registry should assemble");
    let err = registry
        .lookup(kinds::RELU, TargetVersion::new(7, 1, 3))
        .expect_err("7.x has no converters");
    assert!(matches!(err, LoweringError::NoConverter { .. }), "{err}");
    assert!(registry.lookup(kinds::RELU, TargetVersion::new(10, 0, 0)).is_ok());
}

#[test]
fn aliases_share_one_routine() {
    let registry = builtin_registry().expect("built-in registry should assemble");
    let version = TargetVersion::new(8, 6, 0);
    let add = registry.lookup(kinds::ADD, version).expect("add");
    let add_inplace = registry.lookup(kinds::ADD_, version).expect("add_");
    assert_eq!(add.name, add_inplace.name);
    let swish = registry.lookup(kinds::SWISH, version).expect("swish");
    let silu = registry.lookup(kinds::SILU, version).expect("silu");
    assert_eq!(swish.name, silu.name);
}

#[test]
fn registering_same_routine_twice_is_idempotent() {
    let mut registry = ConverterRegistry::new();
    registry.register("pd_op.relu", v8(), PASSTHROUGH).expect("first");
    registry.register("pd_op.relu", v8(), PASSTHROUGH).expect("second");
    assert_eq!(registry.len(), 1);
}

#[test]
fn registering_distinct_routines_under_one_key_conflicts() {
    let mut registry = ConverterRegistry::new();
    registry.register("pd_op.relu", v8(), PASSTHROUGH).expect("first");
    let err = registry
        .register("pd_op.relu", v8(), NOTHING)
        .expect_err("conflicting registration must fail");
    match err {
        LoweringError::DuplicateConverter {
            kind,
            existing,
            incoming,
            ..
        } => {
            assert_eq!(kind, "pd_op.relu");
            assert_eq!(existing, "passthrough");
            assert_eq!(incoming, "nothing");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn disjoint_version_ranges_pick_the_matching_routine() {
    let mut registry = ConverterRegistry::new();
    registry
        .register(
            "pd_op.relu",
            VersionReq::AtMost(TargetVersion::new(8, 4, 99)),
            PASSTHROUGH,
        )
        .expect("old range");
    registry
        .register(
            "pd_op.relu",
            VersionReq::AtLeast(TargetVersion::new(8, 5, 0)),
            NOTHING,
        )
        .expect("new range");

    let old = registry
        .lookup("pd_op.relu", TargetVersion::new(8, 2, 0))
        .expect("old");
    assert_eq!(old.name, "passthrough");
    let new = registry
        .lookup("pd_op.relu", TargetVersion::new(8, 6, 1))
        .expect("new");
    assert_eq!(new.name, "nothing");
}

#[test]
fn overlapping_predicates_are_reported_at_lookup() {
    let mut registry = ConverterRegistry::new();
    registry
        .register("pd_op.tanh", VersionReq::Major(8), PASSTHROUGH)
        .expect("major");
    registry
        .register(
            "pd_op.tanh",
            VersionReq::AtLeast(TargetVersion::new(8, 0, 0)),
            NOTHING,
        )
        .expect("different predicate registers");
    let err = registry
        .lookup("pd_op.tanh", TargetVersion::new(8, 6, 0))
        .expect_err("two routines match");
    assert!(matches!(err, LoweringError::DuplicateConverter { .. }), "{err}");
    // Only the open-ended predicate matches 9.x.
    let nine = registry
        .lookup("pd_op.tanh", TargetVersion::new(9, 0, 0))
        .expect("9.x");
    assert_eq!(nine.name, "nothing");
}

#[test]
fn unknown_kind_reports_no_converter() {
    let registry = ConverterRegistry::new();
    assert!(registry.is_empty());
    let err = registry
        .lookup("pd_op.fancy", TargetVersion::new(8, 6, 0))
        .expect_err("empty registry");
    match err {
        LoweringError::NoConverter { kind, version } => {
            assert_eq!(kind, "pd_op.fancy");
            assert_eq!(version, "8.6.0");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn version_requirements_parse_and_match() {
    let cases = [
        ("8.x", TargetVersion::new(8, 6, 0), true),
        ("8.x", TargetVersion::new(9, 0, 0), false),
        (">=8.5", TargetVersion::new(8, 5, 0), true),
        (">=8.5", TargetVersion::new(8, 4, 3), false),
        ("<=9.0", TargetVersion::new(9, 0, 0), true),
        ("<=9.0", TargetVersion::new(9, 0, 1), false),
        ("8.0..=8.6", TargetVersion::new(8, 6, 0), true),
        ("8.0..=8.6", TargetVersion::new(8, 6, 1), false),
        ("*", TargetVersion::new(1, 0, 0), true),
    ];
    for (text, version, expected) in cases {
        let req = VersionReq::parse(text).unwrap_or_else(|err| panic!("{text}: {err}"));
        assert_eq!(req.matches(version), expected, "{text} vs {version}");
    }
    assert!(VersionReq::parse("eight").is_err());
}

#[test]
fn custom_predicates_compare_by_label() {
    fn even_minor(version: TargetVersion) -> bool {
        version.minor % 2 == 0
    }
    let req = VersionReq::Custom {
        label: "even-minor",
        test: even_minor,
    };
    assert!(req.matches(TargetVersion::new(8, 6, 0)));
    assert!(!req.matches(TargetVersion::new(8, 5, 0)));
    assert_eq!(req.to_string(), "even-minor");

    let mut registry = ConverterRegistry::new();
    registry.register("pd_op.log", req, PASSTHROUGH).expect("custom");
    registry
        .register("pd_op.log", req, PASSTHROUGH)
        .expect("same label, same routine");
}

#[test]
fn target_version_parses_leniently() {
    assert_eq!(TargetVersion::parse("8.6"), TargetVersion::new(8, 6, 0));
    assert_eq!(TargetVersion::parse(" 10.1.2 "), TargetVersion::new(10, 1, 2));
    assert_eq!(TargetVersion::parse("garbage"), TargetVersion::new(0, 0, 0));
    assert!(TargetVersion::new(8, 10, 0) > TargetVersion::new(8, 9, 9));
}
