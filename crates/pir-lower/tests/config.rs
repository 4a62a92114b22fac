use std::env;

use pir_lower::{LowerOptions, TargetVersion};

#[test]
fn defaults_target_recent_runtime_with_rank_checks() {
    let options = LowerOptions::default();
    assert_eq!(options.target_version, TargetVersion::new(8, 6, 0));
    assert!(options.verify_output_ranks);
    assert!(!options.implicit_batch);
}

#[test]
fn options_round_trip_through_json() {
    let options = LowerOptions::default()
        .with_target_version(TargetVersion::new(10, 2, 1))
        .with_implicit_batch(true);
    let text = options.to_json_string().expect("serialize");
    assert!(text.contains("\"10.2.1\""), "{text}");
    let parsed = LowerOptions::from_json_str(&text).expect("parse");
    assert_eq!(parsed, options);
}

#[test]
fn partial_json_keeps_defaults() {
    let parsed = LowerOptions::from_json_str(r#"{ "target_version": "8.4" }"#).expect("parse");
    assert_eq!(parsed.target_version, TargetVersion::new(8, 4, 0));
    assert!(parsed.verify_output_ranks);
    assert!(!parsed.implicit_batch);

    assert!(LowerOptions::from_json_str("[1, 2]").is_err());
}

// Process environment is shared between test threads, so every variable is
// exercised from this one test.
#[test]
fn environment_overrides_defaults() {
    env::set_var("PIRLOWER_TRT_VERSION", "9.1");
    env::set_var("PIRLOWER_VERIFY_RANKS", "off");
    env::set_var("PIRLOWER_IMPLICIT_BATCH", "Yes");
    let options = LowerOptions::from_env().expect("valid environment");
    assert_eq!(options.target_version, TargetVersion::new(9, 1, 0));
    assert!(!options.verify_output_ranks);
    assert!(options.implicit_batch);

    env::set_var("PIRLOWER_IMPLICIT_BATCH", "sometimes");
    let err = LowerOptions::from_env().expect_err("bad truth value");
    assert!(err.is_invalid_graph(), "{err}");
    assert!(err.to_string().contains("PIRLOWER_IMPLICIT_BATCH"), "{err}");

    for name in [
        "PIRLOWER_TRT_VERSION",
        "PIRLOWER_VERIFY_RANKS",
        "PIRLOWER_IMPLICIT_BATCH",
    ] {
        env::remove_var(name);
    }
    assert_eq!(
        LowerOptions::from_env().expect("empty environment"),
        LowerOptions::default()
    );
}
