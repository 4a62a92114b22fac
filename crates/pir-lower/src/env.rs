use std::env;
use std::sync::OnceLock;

use crate::error::{LoweringError, LoweringResult};

static PIRLOWER_TRACE_LAYERS: OnceLock<bool> = OnceLock::new();

/// Parses a boolean the way `strtobool` does; anything unrecognised is an error.
pub(crate) fn parse_bool(value: &str) -> Option<bool> {
    let normalized = value.trim().to_ascii_lowercase();
    match normalized.as_str() {
        "y" | "yes" | "t" | "true" | "on" | "1" => Some(true),
        "n" | "no" | "f" | "false" | "off" | "0" => Some(false),
        _ => None,
    }
}

pub(crate) fn env_string(name: &str) -> Option<String> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => Some(value.trim().to_string()),
        _ => None,
    }
}

pub(crate) fn env_bool(name: &str) -> LoweringResult<Option<bool>> {
    match env_string(name) {
        None => Ok(None),
        Some(value) => parse_bool(&value).map(Some).ok_or_else(|| {
            LoweringError::invalid(format!("{name}: invalid truth value '{value}'"))
        }),
    }
}

/// Whether every emitted layer should be logged. Read once per process.
pub(crate) fn trace_layers_enabled() -> bool {
    *PIRLOWER_TRACE_LAYERS.get_or_init(|| {
        env_string("PIRLOWER_TRACE_LAYERS")
            .and_then(|value| parse_bool(&value))
            .unwrap_or(false)
    })
}
