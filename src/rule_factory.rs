// Builds MatchRule trees from the server wire format.
//
//   multi-entry:  {"and": [<rule>, ...]}  {"or": [...]}  {"not": [<rule>]}
//   single-entry: {"<param_key>": {"<operator>": <condition>}}
//
// The lone key of a rule object decides its kind. A combinator wire key makes
// it multi-entry; anything else is a parameter path. One malformed node fails
// the whole tree.

use log::debug;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::engine_config::EngineConfig;
use crate::match_rule::{
    MatchRule, MultiEntryRule, OperatorCategory, RuleCondition, RuleOperator, SingleEntryRule,
    DEFAULT_MAX_PATH_DEPTH,
};

/// Default bound on AND/OR/NOT nesting.
pub const DEFAULT_MAX_RULE_DEPTH: usize = 32;

/// Rule parse errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuleParseError {
    #[error("JSON parse error: {0}")]
    JsonParseError(String),

    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Unknown operator: {0}")]
    UnknownOperator(String),

    #[error("Operator {operator} is not allowed here: {reason}")]
    UnexpectedOperator { operator: String, reason: String },

    #[error("Condition for operator {operator} must be {expected}")]
    ConditionMismatch { operator: String, expected: String },

    #[error("Invalid condition for operator {operator}: {reason}")]
    InvalidCondition { operator: String, reason: String },

    #[error("Invalid regex pattern {pattern:?}: {reason}")]
    InvalidRegex { pattern: String, reason: String },

    #[error("Invalid param key: {0:?}")]
    InvalidParamKey(String),

    #[error("Operator {operator} requires {expected} rule(s), got {actual}")]
    InvalidArity {
        operator: String,
        expected: String,
        actual: usize,
    },

    #[error("Rule nesting exceeds maximum depth of {0}")]
    DepthExceeded(usize),
}

/// Parser for advertiser rules with configurable depth limits.
#[derive(Debug, Clone)]
pub struct RuleFactory {
    max_rule_depth: usize,
    max_path_depth: usize,
}

impl RuleFactory {
    pub fn new() -> Self {
        Self {
            max_rule_depth: DEFAULT_MAX_RULE_DEPTH,
            max_path_depth: DEFAULT_MAX_PATH_DEPTH,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_rule_depth: config.max_rule_depth,
            max_path_depth: config.max_path_depth,
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

    /// Parse a rule from a JSON string using default limits.
    pub fn from_json_str(json: &str) -> Result<MatchRule, RuleParseError> {
        Self::new().parse_str(json)
    }

    /// Parse a rule from a JSON value using default limits.
    pub fn from_value(value: &Value) -> Result<MatchRule, RuleParseError> {
        Self::new().parse_value(value)
    }

    pub fn parse_str(&self, json: &str) -> Result<MatchRule, RuleParseError> {
        let value: Value = serde_json::from_str(json)
            .map_err(|e| RuleParseError::JsonParseError(e.to_string()))?;
        self.parse_value(&value)
    }

    pub fn parse_value(&self, value: &Value) -> Result<MatchRule, RuleParseError> {
        let rule = self.parse_at(value, 1)?;
        debug!("Parsed {} rule with depth {}", rule.operator(), rule.depth());
        Ok(rule)
    }

    /// The server sends the matching rule either as an object or as a
    /// JSON-encoded string.
    pub fn parse_embedded(&self, value: &Value) -> Result<MatchRule, RuleParseError> {
        match value {
            Value::String(json) => self.parse_str(json),
            other => self.parse_value(other),
        }
    }

    fn parse_at(&self, value: &Value, depth: usize) -> Result<MatchRule, RuleParseError> {
        if depth > self.max_rule_depth {
            return Err(RuleParseError::DepthExceeded(self.max_rule_depth));
        }

        let object = value.as_object().ok_or_else(|| {
            RuleParseError::InvalidFormat(format!("rule must be a JSON object, got {}", value))
        })?;
        let (key, body) = single_entry(object, "rule")?;

        match RuleOperator::from_wire_key(key) {
            Some(operator) if operator.is_combinator() => {
                let children = body.as_array().ok_or_else(|| {
                    RuleParseError::InvalidFormat(format!(
                        "operands of {} must be an array",
                        operator
                    ))
                })?;
                let rules = children
                    .iter()
                    .map(|child| self.parse_at(child, depth + 1))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(MultiEntryRule::new(operator, rules)?.into())
            }
            _ => self.parse_single(key, body),
        }
    }

    fn parse_single(&self, param_key: &str, body: &Value) -> Result<MatchRule, RuleParseError> {
        let object = body.as_object().ok_or_else(|| {
            RuleParseError::InvalidFormat(format!(
                "condition for {:?} must be a JSON object",
                param_key
            ))
        })?;
        let (operator_key, raw) = single_entry(object, "condition")?;

        let operator = RuleOperator::from_wire_key(operator_key)
            .ok_or_else(|| RuleParseError::UnknownOperator(operator_key.to_string()))?;

        let mismatch = || RuleParseError::ConditionMismatch {
            operator: operator.to_string(),
            expected: operator.category().to_string(),
        };

        let condition = match operator.category() {
            OperatorCategory::Combinator => {
                return Err(RuleParseError::UnexpectedOperator {
                    operator: operator.to_string(),
                    reason: "combinators cannot be used on a parameter".to_string(),
                });
            }
            OperatorCategory::Linguistic => {
                RuleCondition::Linguistic(raw.as_str().ok_or_else(mismatch)?.to_string())
            }
            OperatorCategory::Numerical => {
                RuleCondition::Numerical(raw.as_f64().ok_or_else(mismatch)?)
            }
            OperatorCategory::Membership => {
                let items = raw.as_array().ok_or_else(mismatch)?;
                let items = items
                    .iter()
                    .map(|item| item.as_str().map(str::to_string))
                    .collect::<Option<Vec<_>>>()
                    .ok_or_else(mismatch)?;
                RuleCondition::Membership(items)
            }
        };

        let rule = SingleEntryRule::new(operator, param_key, condition)?
            .with_max_path_depth(self.max_path_depth);
        Ok(rule.into())
    }
}

impl Default for RuleFactory {
    fn default() -> Self {
        Self::new()
    }
}

fn single_entry<'a>(
    object: &'a Map<String, Value>,
    what: &str,
) -> Result<(&'a str, &'a Value), RuleParseError> {
    let mut entries = object.iter();
    match (entries.next(), entries.next()) {
        (Some((key, value)), None) => Ok((key.as_str(), value)),
        (None, _) => Err(RuleParseError::InvalidFormat(format!("{} object is empty", what))),
        (Some(_), Some(_)) => Err(RuleParseError::InvalidFormat(format!(
            "{} object must have exactly one key, got {}",
            what,
            object.len()
        ))),
    }
}
