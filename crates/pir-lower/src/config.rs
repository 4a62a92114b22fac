//! Options that steer a single translation.

use serde::{Deserialize, Serialize};

use crate::env::{env_bool, env_string};
use crate::error::{LoweringError, LoweringResult};
use crate::lowering::TargetVersion;

/// Knobs for [`crate::translate`]. Every field has a default so partial JSON
/// documents deserialize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LowerOptions {
    /// Version used to pick converters from the registry.
    pub target_version: TargetVersion,
    /// Reject converter outputs whose rank differs from the node's declared outputs.
    pub verify_output_ranks: bool,
    /// The target network treats the leading dimension as an implicit batch.
    pub implicit_batch: bool,
}

impl Default for LowerOptions {
    fn default() -> Self {
        Self {
            target_version: TargetVersion::new(8, 6, 0),
            verify_output_ranks: true,
            implicit_batch: false,
        }
    }
}

impl LowerOptions {
    /// Defaults overlaid with `PIRLOWER_TRT_VERSION`, `PIRLOWER_VERIFY_RANKS`
    /// and `PIRLOWER_IMPLICIT_BATCH`.
    pub fn from_env() -> LoweringResult<Self> {
        let mut options = Self::default();
        if let Some(version) = env_string("PIRLOWER_TRT_VERSION") {
            options.target_version = TargetVersion::parse(&version);
        }
        if let Some(verify) = env_bool("PIRLOWER_VERIFY_RANKS")? {
            options.verify_output_ranks = verify;
        }
        if let Some(implicit) = env_bool("PIRLOWER_IMPLICIT_BATCH")? {
            options.implicit_batch = implicit;
        }
        Ok(options)
    }

    pub fn with_target_version(mut self, version: TargetVersion) -> Self {
        self.target_version = version;
        self
    }

    pub fn with_implicit_batch(mut self, implicit: bool) -> Self {
        self.implicit_batch = implicit;
        self
    }

    pub fn from_json_str(text: &str) -> LoweringResult<Self> {
        serde_json::from_str(text).map_err(LoweringError::from)
    }

    pub fn to_json_string(&self) -> LoweringResult<String> {
        serde_json::to_string_pretty(self).map_err(LoweringError::from)
    }
}
