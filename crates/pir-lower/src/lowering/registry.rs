//! Process-wide mapping from (operator kind, target version) to lowering routines.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::debug;

use super::context::LowerCtx;
use super::value::LoweredValue;
use crate::error::{LoweringError, LoweringResult};
use crate::source::SourceNode;

/// `major.minor.patch` of the target runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl TargetVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Lenient parse: missing or non-numeric components read as `0`.
    pub fn parse(text: &str) -> Self {
        let mut parts = text
            .trim()
            .split('.')
            .map(|part| part.trim().parse::<u32>().unwrap_or(0));
        Self {
            major: parts.next().unwrap_or(0),
            minor: parts.next().unwrap_or(0),
            patch: parts.next().unwrap_or(0),
        }
    }
}

impl fmt::Display for TargetVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for TargetVersion {
    type Err = std::convert::Infallible;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(text))
    }
}

impl Serialize for TargetVersion {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for TargetVersion {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        Ok(TargetVersion::parse(&text))
    }
}

/// Predicate over target versions attached to every registration.
#[derive(Debug, Clone, Copy)]
pub enum VersionReq {
    Any,
    /// `"8.x"`: any version with this major number.
    Major(u32),
    AtLeast(TargetVersion),
    AtMost(TargetVersion),
    /// Inclusive on both ends.
    Between(TargetVersion, TargetVersion),
    Custom {
        label: &'static str,
        test: fn(TargetVersion) -> bool,
    },
}

impl VersionReq {
    pub fn matches(&self, version: TargetVersion) -> bool {
        match self {
            VersionReq::Any => true,
            VersionReq::Major(major) => version.major == *major,
            VersionReq::AtLeast(min) => version >= *min,
            VersionReq::AtMost(max) => version <= *max,
            VersionReq::Between(min, max) => *min <= version && version <= *max,
            VersionReq::Custom { test, .. } => test(version),
        }
    }

    /// Parses `"8.x"`, `">=8.6"`, `"<=9.0"`, `"8.0..=9.1"` or `"*"`.
    pub fn parse(text: &str) -> LoweringResult<Self> {
        let text = text.trim();
        if text == "*" || text.is_empty() {
            return Ok(VersionReq::Any);
        }
        if let Some(rest) = text.strip_prefix(">=") {
            return Ok(VersionReq::AtLeast(TargetVersion::parse(rest)));
        }
        if let Some(rest) = text.strip_prefix("<=") {
            return Ok(VersionReq::AtMost(TargetVersion::parse(rest)));
        }
        if let Some((lo, hi)) = text.split_once("..=") {
            return Ok(VersionReq::Between(
                TargetVersion::parse(lo),
                TargetVersion::parse(hi),
            ));
        }
        if let Some(major) = text.strip_suffix(".x") {
            return major
                .trim()
                .parse::<u32>()
                .map(VersionReq::Major)
                .map_err(|_| LoweringError::invalid(format!("bad version requirement '{text}'")));
        }
        Err(LoweringError::invalid(format!(
            "bad version requirement '{text}'"
        )))
    }
}

impl PartialEq for VersionReq {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (VersionReq::Any, VersionReq::Any) => true,
            (VersionReq::Major(a), VersionReq::Major(b)) => a == b,
            (VersionReq::AtLeast(a), VersionReq::AtLeast(b)) => a == b,
            (VersionReq::AtMost(a), VersionReq::AtMost(b)) => a == b,
            (VersionReq::Between(a0, a1), VersionReq::Between(b0, b1)) => a0 == b0 && a1 == b1,
            (VersionReq::Custom { label: a, .. }, VersionReq::Custom { label: b, .. }) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for VersionReq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionReq::Any => f.write_str("*"),
            VersionReq::Major(major) => write!(f, "{major}.x"),
            VersionReq::AtLeast(min) => write!(f, ">={min}"),
            VersionReq::AtMost(max) => write!(f, "<={max}"),
            VersionReq::Between(min, max) => write!(f, "{min}..={max}"),
            VersionReq::Custom { label, .. } => f.write_str(label),
        }
    }
}

/// Signature shared by every lowering routine.
pub type LowerFn =
    fn(&mut LowerCtx<'_>, &SourceNode, &[LoweredValue]) -> LoweringResult<Vec<LoweredValue>>;

/// A named lowering routine. Two registrations are the same routine iff their names match.
#[derive(Clone, Copy)]
pub struct Converter {
    pub name: &'static str,
    pub lower: LowerFn,
}

impl fmt::Debug for Converter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Converter").field("name", &self.name).finish()
    }
}

/// Static registration record collected through [`CONVERTERS`].
pub struct ConverterDef {
    /// Every kind alias the routine handles, e.g. `pd_op.add` and `pd_op.add_`.
    pub kinds: &'static [&'static str],
    pub version: VersionReq,
    pub converter: Converter,
}

#[linkme::distributed_slice]
pub static CONVERTERS: [ConverterDef] = [..];

#[derive(Debug, Clone)]
struct Entry {
    version: VersionReq,
    converter: Converter,
}

/// Converters keyed by operator kind. Read-only once translation starts.
#[derive(Debug, Clone, Default)]
pub struct ConverterRegistry {
    entries: HashMap<String, Vec<Entry>>,
}

impl ConverterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every converter linked into the binary.
    pub fn with_builtin() -> LoweringResult<Self> {
        let mut registry = Self::new();
        for def in CONVERTERS.iter() {
            registry.register_def(def)?;
        }
        Ok(registry)
    }

    pub fn register(
        &mut self,
        kind: &str,
        version: VersionReq,
        converter: Converter,
    ) -> LoweringResult<()> {
        let entries = self.entries.entry(kind.to_string()).or_default();
        if let Some(existing) = entries.iter().find(|entry| entry.version == version) {
            if existing.converter.name == converter.name {
                return Ok(());
            }
            return Err(LoweringError::DuplicateConverter {
                kind: kind.to_string(),
                version: version.to_string(),
                existing: existing.converter.name.to_string(),
                incoming: converter.name.to_string(),
            });
        }
        debug!(kind, %version, converter = converter.name, "registered converter");
        entries.push(Entry { version, converter });
        Ok(())
    }

    pub fn register_def(&mut self, def: &ConverterDef) -> LoweringResult<()> {
        for kind in def.kinds {
            self.register(kind, def.version, def.converter)?;
        }
        Ok(())
    }

    /// Resolves the routine for `kind` at `version`.
    ///
    /// Overlapping predicates that select two different routines are a
    /// conflict, not a tie to break silently.
    pub fn lookup(&self, kind: &str, version: TargetVersion) -> LoweringResult<Converter> {
        let mut found: Option<&Entry> = None;
        for entry in self.entries.get(kind).into_iter().flatten() {
            if !entry.version.matches(version) {
                continue;
            }
            match found {
                Some(previous) if previous.converter.name != entry.converter.name => {
                    return Err(LoweringError::DuplicateConverter {
                        kind: kind.to_string(),
                        version: version.to_string(),
                        existing: previous.converter.name.to_string(),
                        incoming: entry.converter.name.to_string(),
                    });
                }
                Some(_) => {}
                None => found = Some(entry),
            }
        }
        found
            .map(|entry| entry.converter)
            .ok_or_else(|| LoweringError::NoConverter {
                kind: kind.to_string(),
                version: version.to_string(),
            })
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.entries.contains_key(kind)
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.entries.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

static BUILTIN_REGISTRY: OnceLock<Result<ConverterRegistry, String>> = OnceLock::new();

/// Shared registry of built-in converters, built on first use.
pub fn builtin_registry() -> LoweringResult<&'static ConverterRegistry> {
    BUILTIN_REGISTRY
        .get_or_init(|| ConverterRegistry::with_builtin().map_err(|err| err.to_string()))
        .as_ref()
        .map_err(|message| LoweringError::invalid(format!("built-in registry: {message}")))
}
