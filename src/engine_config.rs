// Engine-wide tunables for rule evaluation and attribution windows.
//
// Everything here has a sensible default. Hosts that need different limits
// build an EngineConfig with the builder setters or load one from JSON.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::accumulator::ValueMergePolicy;

/// Errors raised while loading or validating an [`EngineConfig`].
#[derive(Debug, Error)]
pub enum EngineConfigError {
    #[error("JSON parse error: {0}")]
    JsonParseError(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

/// Limits and policies shared by every component of the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Deepest AND/OR/NOT nesting accepted when parsing a matching rule.
    pub max_rule_depth: usize,

    /// Deepest parameter path (segments plus wildcard expansions) followed
    /// while resolving a rule's `param_key`.
    pub max_path_depth: usize,

    /// How repeated values of the same event parameter are combined.
    pub value_merge_policy: ValueMergePolicy,

    /// Upper bounds (days since install) of each postback window.
    /// Index 0 is postback sequence 1.
    pub postback_window_days: Vec<u32>,

    /// A window also ends when no conversion update happened for this many
    /// hours after the last one. `None` disables the check.
    pub last_conversion_window_hours: Option<u32>,
}

impl EngineConfig {
    pub fn new() -> Self {
        Self {
            max_rule_depth: 32,
            max_path_depth: 32,
            value_merge_policy: ValueMergePolicy::Max,
            postback_window_days: vec![2, 7, 35],
            last_conversion_window_hours: Some(24),
        }
    }

    pub fn with_max_rule_depth(mut self, depth: usize) -> Self {
        self.max_rule_depth = depth;
        self
    }

    pub fn with_max_path_depth(mut self, depth: usize) -> Self {
        self.max_path_depth = depth;
        self
    }

    pub fn with_value_merge_policy(mut self, policy: ValueMergePolicy) -> Self {
        self.value_merge_policy = policy;
        self
    }

    pub fn with_postback_window_days(mut self, days: Vec<u32>) -> Self {
        self.postback_window_days = days;
        self
    }

    pub fn with_last_conversion_window_hours(mut self, hours: Option<u32>) -> Self {
        self.last_conversion_window_hours = hours;
        self
    }

    /// Load from a JSON document. Missing keys keep their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, EngineConfigError> {
        let config: EngineConfig = serde_json::from_str(json)
            .map_err(|e| EngineConfigError::JsonParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the limits. Postback windows must be strictly increasing.
    pub fn validate(&self) -> Result<(), EngineConfigError> {
        if self.max_rule_depth == 0 {
            return Err(EngineConfigError::InvalidConfiguration(
                "max_rule_depth must be at least 1".to_string(),
            ));
        }
        if self.max_path_depth == 0 {
            return Err(EngineConfigError::InvalidConfiguration(
                "max_path_depth must be at least 1".to_string(),
            ));
        }
        if self.postback_window_days.is_empty() {
            return Err(EngineConfigError::InvalidConfiguration(
                "postback_window_days cannot be empty".to_string(),
            ));
        }
        if self.postback_window_days.len() > u8::MAX as usize {
            return Err(EngineConfigError::InvalidConfiguration(format!(
                "too many postback windows: {}",
                self.postback_window_days.len()
            )));
        }
        let increasing = self
            .postback_window_days
            .windows(2)
            .all(|pair| pair[0] < pair[1]);
        if !increasing || self.postback_window_days[0] == 0 {
            return Err(EngineConfigError::InvalidConfiguration(format!(
                "postback_window_days must be positive and strictly increasing: {:?}",
                self.postback_window_days
            )));
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}
