// Advertiser matching rules evaluated against app event parameters.
//
// A rule tree has two node kinds:
// 1. SingleEntryRule: one operator applied to the value found at a
//    dot-delimited parameter path (with `[*]` / `*` wildcard segments)
// 2. MultiEntryRule: AND / OR / NOT over child rules
//
// Evaluation is three valued internally. A leaf whose path does not resolve,
// or resolves to a value of the wrong type, is indeterminate rather than
// false, so negation never turns a missing key into a match.

use regex::Regex;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Number, Value};
use std::fmt;

use crate::rule_factory::{RuleFactory, RuleParseError};

/// Event parameters as delivered by the app event logger.
pub type EventParameters = Map<String, Value>;

/// Default bound on path traversal depth for a single rule.
pub const DEFAULT_MAX_PATH_DEPTH: usize = 32;

const PATH_DELIMITER: char = '.';
const ARRAY_WILDCARD_SUFFIX: &str = "[*]";
const ANY_CHILD: &str = "*";

// ============================================================================
// OPERATORS
// ============================================================================

/// What kind of condition an operator consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperatorCategory {
    /// AND / OR / NOT over child rules
    Combinator,
    /// String comparison against `linguistic_condition`
    Linguistic,
    /// Numeric comparison against `numerical_condition`
    Numerical,
    /// Set membership against `array_condition`
    Membership,
}

impl fmt::Display for OperatorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let expected = match self {
            OperatorCategory::Combinator => "a list of rules",
            OperatorCategory::Linguistic => "a string",
            OperatorCategory::Numerical => "a number",
            OperatorCategory::Membership => "a non-empty array of strings",
        };
        write!(f, "{}", expected)
    }
}

/// Operators understood by advertiser rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleOperator {
    And,
    Or,
    Not,
    Contains,
    NotContains,
    StartsWith,
    CaseInsensitiveContains,
    CaseInsensitiveNotContains,
    CaseInsensitiveStartsWith,
    RegexMatch,
    Equal,
    NotEqual,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    CaseInsensitiveIsAny,
    CaseInsensitiveIsNotAny,
    IsAny,
    IsNotAny,
}

impl RuleOperator {
    pub const ALL: [RuleOperator; 20] = [
        RuleOperator::And,
        RuleOperator::Or,
        RuleOperator::Not,
        RuleOperator::Contains,
        RuleOperator::NotContains,
        RuleOperator::StartsWith,
        RuleOperator::CaseInsensitiveContains,
        RuleOperator::CaseInsensitiveNotContains,
        RuleOperator::CaseInsensitiveStartsWith,
        RuleOperator::RegexMatch,
        RuleOperator::Equal,
        RuleOperator::NotEqual,
        RuleOperator::LessThan,
        RuleOperator::LessThanOrEqual,
        RuleOperator::GreaterThan,
        RuleOperator::GreaterThanOrEqual,
        RuleOperator::CaseInsensitiveIsAny,
        RuleOperator::CaseInsensitiveIsNotAny,
        RuleOperator::IsAny,
        RuleOperator::IsNotAny,
    ];

    /// Key used for this operator in the server payload.
    pub fn wire_key(self) -> &'static str {
        match self {
            RuleOperator::And => "and",
            RuleOperator::Or => "or",
            RuleOperator::Not => "not",
            RuleOperator::Contains => "contains",
            RuleOperator::NotContains => "not_contains",
            RuleOperator::StartsWith => "starts_with",
            RuleOperator::CaseInsensitiveContains => "i_contains",
            RuleOperator::CaseInsensitiveNotContains => "i_not_contains",
            RuleOperator::CaseInsensitiveStartsWith => "i_starts_with",
            RuleOperator::RegexMatch => "regex_match",
            RuleOperator::Equal => "eq",
            RuleOperator::NotEqual => "neq",
            RuleOperator::LessThan => "lt",
            RuleOperator::LessThanOrEqual => "lte",
            RuleOperator::GreaterThan => "gt",
            RuleOperator::GreaterThanOrEqual => "gte",
            RuleOperator::CaseInsensitiveIsAny => "i_is_any",
            RuleOperator::CaseInsensitiveIsNotAny => "i_is_not_any",
            RuleOperator::IsAny => "is_any",
            RuleOperator::IsNotAny => "is_not_any",
        }
    }

    /// Looks up an operator by wire key, ignoring ASCII case.
    pub fn from_wire_key(key: &str) -> Option<Self> {
        let key = key.to_ascii_lowercase();
        Self::ALL.iter().copied().find(|op| op.wire_key() == key)
    }

    pub fn category(self) -> OperatorCategory {
        match self {
            RuleOperator::And | RuleOperator::Or | RuleOperator::Not => {
                OperatorCategory::Combinator
            }
            RuleOperator::Contains
            | RuleOperator::NotContains
            | RuleOperator::StartsWith
            | RuleOperator::CaseInsensitiveContains
            | RuleOperator::CaseInsensitiveNotContains
            | RuleOperator::CaseInsensitiveStartsWith
            | RuleOperator::RegexMatch
            | RuleOperator::Equal
            | RuleOperator::NotEqual => OperatorCategory::Linguistic,
            RuleOperator::LessThan
            | RuleOperator::LessThanOrEqual
            | RuleOperator::GreaterThan
            | RuleOperator::GreaterThanOrEqual => OperatorCategory::Numerical,
            RuleOperator::CaseInsensitiveIsAny
            | RuleOperator::CaseInsensitiveIsNotAny
            | RuleOperator::IsAny
            | RuleOperator::IsNotAny => OperatorCategory::Membership,
        }
    }

    pub fn is_combinator(self) -> bool {
        self.category() == OperatorCategory::Combinator
    }

    /// True for operators that assert the absence of something.
    pub fn is_negated(self) -> bool {
        matches!(
            self,
            RuleOperator::NotContains
                | RuleOperator::CaseInsensitiveNotContains
                | RuleOperator::NotEqual
                | RuleOperator::CaseInsensitiveIsNotAny
                | RuleOperator::IsNotAny
        )
    }
}

impl fmt::Display for RuleOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.wire_key())
    }
}

// ============================================================================
// CONDITIONS
// ============================================================================

/// The comparison value of a single-entry rule. Exactly one kind is present
/// and it always agrees with the operator's category.
#[derive(Debug, Clone, PartialEq)]
pub enum RuleCondition {
    Linguistic(String),
    Numerical(f64),
    Membership(Vec<String>),
}

impl RuleCondition {
    pub fn category(&self) -> OperatorCategory {
        match self {
            RuleCondition::Linguistic(_) => OperatorCategory::Linguistic,
            RuleCondition::Numerical(_) => OperatorCategory::Numerical,
            RuleCondition::Membership(_) => OperatorCategory::Membership,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            RuleCondition::Linguistic(s) => Value::String(s.clone()),
            // Whole numbers go back out as integers, the way the server sends them.
            RuleCondition::Numerical(n) if n.fract() == 0.0 && n.abs() < 1e15 => {
                Value::from(*n as i64)
            }
            RuleCondition::Numerical(n) => Number::from_f64(*n)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            RuleCondition::Membership(items) => {
                Value::Array(items.iter().cloned().map(Value::String).collect())
            }
        }
    }
}

// ============================================================================
// PARAMETER PATHS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum PathSegment {
    /// Plain object key
    Key(String),
    /// `key[*]`: every element of the array stored under `key`
    ArrayItems(String),
    /// `*`: every child of the current object or array
    AnyChild,
}

fn parse_path(param_key: &str) -> Result<Vec<PathSegment>, RuleParseError> {
    if param_key.is_empty() {
        return Err(RuleParseError::InvalidParamKey(
            "param key cannot be empty".to_string(),
        ));
    }

    param_key
        .split(PATH_DELIMITER)
        .map(|segment| {
            if segment == ANY_CHILD {
                Ok(PathSegment::AnyChild)
            } else if let Some(key) = segment.strip_suffix(ARRAY_WILDCARD_SUFFIX) {
                if key.is_empty() {
                    Err(RuleParseError::InvalidParamKey(param_key.to_string()))
                } else {
                    Ok(PathSegment::ArrayItems(key.to_string()))
                }
            } else if segment.is_empty() {
                Err(RuleParseError::InvalidParamKey(param_key.to_string()))
            } else {
                Ok(PathSegment::Key(segment.to_string()))
            }
        })
        .collect()
}

fn numeric_value(node: &Value) -> Option<f64> {
    match node {
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

// ============================================================================
// SINGLE ENTRY RULE
// ============================================================================

/// One operator applied to the value at `param_key`.
///
/// The path is parsed and, for `regex_match`, the pattern compiled once when
/// the rule is built. A rule that cannot be built is rejected, so a parsed
/// rule never faults during evaluation. Patterns follow `regex` syntax, which
/// has no look-around or backreferences.
#[derive(Debug, Clone)]
pub struct SingleEntryRule {
    operator: RuleOperator,
    param_key: String,
    condition: RuleCondition,
    path: Vec<PathSegment>,
    pattern: Option<Regex>,
    max_path_depth: usize,
}

impl SingleEntryRule {
    pub fn new(
        operator: RuleOperator,
        param_key: impl Into<String>,
        condition: RuleCondition,
    ) -> Result<Self, RuleParseError> {
        let param_key = param_key.into();
        let category = operator.category();

        if category == OperatorCategory::Combinator {
            return Err(RuleParseError::UnexpectedOperator {
                operator: operator.to_string(),
                reason: "combinators cannot be used on a parameter".to_string(),
            });
        }
        if condition.category() != category {
            return Err(RuleParseError::ConditionMismatch {
                operator: operator.to_string(),
                expected: category.to_string(),
            });
        }

        match &condition {
            RuleCondition::Numerical(n) if !n.is_finite() => {
                return Err(RuleParseError::InvalidCondition {
                    operator: operator.to_string(),
                    reason: format!("{} is not a finite number", n),
                });
            }
            RuleCondition::Membership(items) if items.is_empty() => {
                return Err(RuleParseError::InvalidCondition {
                    operator: operator.to_string(),
                    reason: "array condition cannot be empty".to_string(),
                });
            }
            _ => {}
        }

        let pattern = match (operator, &condition) {
            (RuleOperator::RegexMatch, RuleCondition::Linguistic(p)) => {
                if p.is_empty() {
                    return Err(RuleParseError::InvalidCondition {
                        operator: operator.to_string(),
                        reason: "pattern cannot be empty".to_string(),
                    });
                }
                let compiled = Regex::new(p).map_err(|e| RuleParseError::InvalidRegex {
                    pattern: p.clone(),
                    reason: e.to_string(),
                })?;
                Some(compiled)
            }
            _ => None,
        };

        let path = parse_path(&param_key)?;

        Ok(SingleEntryRule {
            operator,
            param_key,
            condition,
            path,
            pattern,
            max_path_depth: DEFAULT_MAX_PATH_DEPTH,
        })
    }

    pub fn linguistic(
        operator: RuleOperator,
        param_key: impl Into<String>,
        condition: impl Into<String>,
    ) -> Result<Self, RuleParseError> {
        Self::new(operator, param_key, RuleCondition::Linguistic(condition.into()))
    }

    pub fn numerical(
        operator: RuleOperator,
        param_key: impl Into<String>,
        condition: f64,
    ) -> Result<Self, RuleParseError> {
        Self::new(operator, param_key, RuleCondition::Numerical(condition))
    }

    pub fn membership<I, S>(
        operator: RuleOperator,
        param_key: impl Into<String>,
        condition: I,
    ) -> Result<Self, RuleParseError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let items = condition.into_iter().map(Into::into).collect();
        Self::new(operator, param_key, RuleCondition::Membership(items))
    }

    pub fn with_max_path_depth(mut self, depth: usize) -> Self {
        self.max_path_depth = depth;
        self
    }

    pub fn operator(&self) -> RuleOperator {
        self.operator
    }

    pub fn param_key(&self) -> &str {
        &self.param_key
    }

    pub fn condition(&self) -> &RuleCondition {
        &self.condition
    }

    pub fn linguistic_condition(&self) -> Option<&str> {
        match &self.condition {
            RuleCondition::Linguistic(s) => Some(s),
            _ => None,
        }
    }

    pub fn numerical_condition(&self) -> Option<f64> {
        match self.condition {
            RuleCondition::Numerical(n) => Some(n),
            _ => None,
        }
    }

    pub fn array_condition(&self) -> Option<&[String]> {
        match &self.condition {
            RuleCondition::Membership(items) => Some(items),
            _ => None,
        }
    }

    pub fn is_matched(&self, params: Option<&EventParameters>) -> bool {
        self.evaluate(params) == Some(true)
    }

    /// `None` when the path does not resolve to a value of the right type.
    pub(crate) fn evaluate(&self, params: Option<&EventParameters>) -> Option<bool> {
        let params = params?;
        if params.is_empty() {
            return None;
        }
        self.evaluate_in_object(params, &self.path, 0)
    }

    fn evaluate_in_object(
        &self,
        object: &EventParameters,
        path: &[PathSegment],
        depth: usize,
    ) -> Option<bool> {
        if depth >= self.max_path_depth {
            return None;
        }
        let (segment, rest) = path.split_first()?;
        match segment {
            PathSegment::Key(key) => self.evaluate_at(object.get(key)?, rest, depth + 1),
            PathSegment::ArrayItems(key) => match object.get(key)? {
                Value::Array(items) => self.evaluate_any(items.iter(), rest, depth + 1),
                _ => None,
            },
            PathSegment::AnyChild => self.evaluate_any(object.values(), rest, depth + 1),
        }
    }

    fn evaluate_at(&self, node: &Value, path: &[PathSegment], depth: usize) -> Option<bool> {
        if path.is_empty() {
            return self.compare(node);
        }
        match node {
            Value::Object(object) => self.evaluate_in_object(object, path, depth),
            Value::Array(items) if path[0] == PathSegment::AnyChild => {
                if depth >= self.max_path_depth {
                    return None;
                }
                self.evaluate_any(items.iter(), &path[1..], depth + 1)
            }
            _ => None,
        }
    }

    /// Any traversal that matches wins. Indeterminate only if every
    /// traversal was.
    fn evaluate_any<'a>(
        &self,
        nodes: impl Iterator<Item = &'a Value>,
        path: &[PathSegment],
        depth: usize,
    ) -> Option<bool> {
        let mut outcome = None;
        for node in nodes {
            match self.evaluate_at(node, path, depth) {
                Some(true) => return Some(true),
                Some(false) => outcome = Some(false),
                None => {}
            }
        }
        outcome
    }

    fn compare(&self, node: &Value) -> Option<bool> {
        match &self.condition {
            RuleCondition::Linguistic(condition) => {
                let value = node.as_str()?;
                Some(self.compare_linguistic(value, condition))
            }
            RuleCondition::Numerical(condition) => {
                let value = numeric_value(node)?;
                Some(self.compare_numerical(value, *condition))
            }
            RuleCondition::Membership(items) => {
                let value = node.as_str()?;
                Some(self.compare_membership(value, items))
            }
        }
    }

    fn compare_linguistic(&self, value: &str, condition: &str) -> bool {
        match self.operator {
            RuleOperator::Contains => value.contains(condition),
            RuleOperator::NotContains => !value.contains(condition),
            RuleOperator::StartsWith => value.starts_with(condition),
            RuleOperator::CaseInsensitiveContains => {
                value.to_lowercase().contains(&condition.to_lowercase())
            }
            RuleOperator::CaseInsensitiveNotContains => {
                !value.to_lowercase().contains(&condition.to_lowercase())
            }
            RuleOperator::CaseInsensitiveStartsWith => {
                value.to_lowercase().starts_with(&condition.to_lowercase())
            }
            RuleOperator::RegexMatch => self
                .pattern
                .as_ref()
                .map_or(false, |pattern| pattern.is_match(value)),
            RuleOperator::Equal => value == condition,
            RuleOperator::NotEqual => value != condition,
            _ => false,
        }
    }

    fn compare_numerical(&self, value: f64, condition: f64) -> bool {
        match self.operator {
            RuleOperator::LessThan => value < condition,
            RuleOperator::LessThanOrEqual => value <= condition,
            RuleOperator::GreaterThan => value > condition,
            RuleOperator::GreaterThanOrEqual => value >= condition,
            _ => false,
        }
    }

    fn compare_membership(&self, value: &str, items: &[String]) -> bool {
        let contains = |ignore_case: bool| {
            if ignore_case {
                let value = value.to_lowercase();
                items.iter().any(|item| item.to_lowercase() == value)
            } else {
                items.iter().any(|item| item == value)
            }
        };

        match self.operator {
            RuleOperator::IsAny => contains(false),
            RuleOperator::IsNotAny => !contains(false),
            RuleOperator::CaseInsensitiveIsAny => contains(true),
            RuleOperator::CaseInsensitiveIsNotAny => !contains(true),
            _ => false,
        }
    }

    fn to_json(&self) -> Value {
        let mut condition = Map::new();
        condition.insert(self.operator.wire_key().to_string(), self.condition.to_value());
        let mut rule = Map::new();
        rule.insert(self.param_key.clone(), Value::Object(condition));
        Value::Object(rule)
    }
}

// The compiled regex and parsed path are derived from the other fields.
impl PartialEq for SingleEntryRule {
    fn eq(&self, other: &Self) -> bool {
        self.operator == other.operator
            && self.param_key == other.param_key
            && self.condition == other.condition
    }
}

// ============================================================================
// MULTI ENTRY RULE
// ============================================================================

/// Boolean combination of child rules.
#[derive(Debug, Clone, PartialEq)]
pub struct MultiEntryRule {
    operator: RuleOperator,
    rules: Vec<MatchRule>,
}

impl MultiEntryRule {
    pub fn new(operator: RuleOperator, rules: Vec<MatchRule>) -> Result<Self, RuleParseError> {
        if !operator.is_combinator() {
            return Err(RuleParseError::UnexpectedOperator {
                operator: operator.to_string(),
                reason: "only and/or/not can combine rules".to_string(),
            });
        }
        if rules.is_empty() {
            return Err(RuleParseError::InvalidArity {
                operator: operator.to_string(),
                expected: "at least 1".to_string(),
                actual: 0,
            });
        }
        if operator == RuleOperator::Not && rules.len() != 1 {
            return Err(RuleParseError::InvalidArity {
                operator: operator.to_string(),
                expected: "exactly 1".to_string(),
                actual: rules.len(),
            });
        }
        Ok(MultiEntryRule { operator, rules })
    }

    pub fn and(rules: Vec<MatchRule>) -> Result<Self, RuleParseError> {
        Self::new(RuleOperator::And, rules)
    }

    pub fn or(rules: Vec<MatchRule>) -> Result<Self, RuleParseError> {
        Self::new(RuleOperator::Or, rules)
    }

    pub fn not(rule: MatchRule) -> Self {
        MultiEntryRule {
            operator: RuleOperator::Not,
            rules: vec![rule],
        }
    }

    pub fn operator(&self) -> RuleOperator {
        self.operator
    }

    pub fn rules(&self) -> &[MatchRule] {
        &self.rules
    }

    pub fn is_matched(&self, params: Option<&EventParameters>) -> bool {
        self.evaluate(params) == Some(true)
    }

    pub(crate) fn evaluate(&self, params: Option<&EventParameters>) -> Option<bool> {
        match self.operator {
            RuleOperator::And => {
                let mut outcome = Some(true);
                for rule in &self.rules {
                    match rule.evaluate(params) {
                        Some(false) => return Some(false),
                        Some(true) => {}
                        None => outcome = None,
                    }
                }
                outcome
            }
            RuleOperator::Or => {
                let mut outcome = Some(false);
                for rule in &self.rules {
                    match rule.evaluate(params) {
                        Some(true) => return Some(true),
                        Some(false) => {}
                        None => outcome = None,
                    }
                }
                outcome
            }
            RuleOperator::Not => self
                .rules
                .first()
                .and_then(|rule| rule.evaluate(params))
                .map(|matched| !matched),
            _ => None,
        }
    }

    fn to_json(&self) -> Value {
        let children = self.rules.iter().map(MatchRule::to_json).collect();
        let mut rule = Map::new();
        rule.insert(self.operator.wire_key().to_string(), Value::Array(children));
        Value::Object(rule)
    }
}

// ============================================================================
// MATCH RULE
// ============================================================================

/// A parsed advertiser rule tree.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchRule {
    Single(SingleEntryRule),
    Multi(MultiEntryRule),
}

impl MatchRule {
    /// Returns true only when the parameters positively satisfy the rule.
    pub fn is_matched(&self, params: Option<&EventParameters>) -> bool {
        self.evaluate(params) == Some(true)
    }

    pub(crate) fn evaluate(&self, params: Option<&EventParameters>) -> Option<bool> {
        match self {
            MatchRule::Single(rule) => rule.evaluate(params),
            MatchRule::Multi(rule) => rule.evaluate(params),
        }
    }

    pub fn operator(&self) -> RuleOperator {
        match self {
            MatchRule::Single(rule) => rule.operator(),
            MatchRule::Multi(rule) => rule.operator(),
        }
    }

    /// Nesting depth; a single-entry rule has depth 1.
    pub fn depth(&self) -> usize {
        match self {
            MatchRule::Single(_) => 1,
            MatchRule::Multi(rule) => {
                1 + rule.rules.iter().map(MatchRule::depth).max().unwrap_or(0)
            }
        }
    }

    /// Serialises back to the server wire format.
    pub fn to_json(&self) -> Value {
        match self {
            MatchRule::Single(rule) => rule.to_json(),
            MatchRule::Multi(rule) => rule.to_json(),
        }
    }
}

impl From<SingleEntryRule> for MatchRule {
    fn from(rule: SingleEntryRule) -> Self {
        MatchRule::Single(rule)
    }
}

impl From<MultiEntryRule> for MatchRule {
    fn from(rule: MultiEntryRule) -> Self {
        MatchRule::Multi(rule)
    }
}

impl Serialize for MatchRule {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for MatchRule {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        RuleFactory::new()
            .parse_value(&value)
            .map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: Value) -> EventParameters {
        match value {
            Value::Object(map) => map,
            _ => panic!("test parameters must be an object"),
        }
    }

    fn contains_rule(operator: RuleOperator, key: &str, condition: &str) -> SingleEntryRule {
        SingleEntryRule::linguistic(operator, key, condition).unwrap()
    }

    fn membership_rule(operator: RuleOperator, values: &[&str]) -> SingleEntryRule {
        SingleEntryRule::membership(operator, "category", values.iter().copied()).unwrap()
    }

    fn matches_params(rule: &SingleEntryRule, value: Value) -> bool {
        rule.is_matched(Some(&params(value)))
    }

    #[test]
    fn test_operator_wire_keys_roundtrip() {
        for op in RuleOperator::ALL {
            assert_eq!(RuleOperator::from_wire_key(op.wire_key()), Some(op));
        }
        assert_eq!(
            RuleOperator::from_wire_key("I_CONTAINS"),
            Some(RuleOperator::CaseInsensitiveContains)
        );
        assert_eq!(RuleOperator::from_wire_key("unknown"), None);
    }

    #[test]
    fn test_nested_path_match() {
        let rule = contains_rule(RuleOperator::Contains, "fb_content.title", "hello");
        assert!(rule.is_matched(Some(&params(json!({"fb_content": {"title": "helloworld"}})))));
        assert!(!rule.is_matched(Some(&params(json!({"fb_content": {"title": "HelloWorld"}})))));
        assert!(!rule.is_matched(Some(&params(json!({"fb_content": {"tt": "helloworld"}})))));
        assert!(!rule.is_matched(Some(&params(json!({"fb_content": {"title": 100}})))));
        assert!(!rule.is_matched(Some(&params(json!({"quantity": {"title": "helloworld"}})))));
        assert!(!rule.is_matched(None));
        assert!(!rule.is_matched(Some(&EventParameters::new())));
    }

    #[test]
    fn test_numeric_path_match() {
        let rule = SingleEntryRule::numerical(
            RuleOperator::GreaterThan,
            "fb_content.product1.quantity",
            10.0,
        )
        .unwrap();
        assert!(matches_params(&rule, json!({"fb_content": {"product1": {"quantity": 100}}})));
        assert!(!matches_params(&rule, json!({"fb_content": {"product1": {"quantity": 1}}})));
        assert!(!matches_params(&rule, json!({"fb_content": {"product1": {"quantity": "12.5"}}})));
    }

    #[test]
    fn test_array_wildcard_path() {
        let rule = contains_rule(RuleOperator::Contains, "fb_content[*].id", "coffee");
        let items = json!([{"id": "shop"}, {"id": "coffeeshop"}]);
        assert!(matches_params(&rule, json!({"fb_content": items})));
        assert!(!matches_params(&rule, json!({"fb_content": {"id": "coffeeshop"}})));
        assert!(!matches_params(&rule, json!({"fb_content": [{"id": "shop"}]})));
        assert!(!matches_params(&rule, json!({"fb_content": []})));
    }

    #[test]
    fn test_any_child_wildcard_path() {
        let rule = contains_rule(RuleOperator::Equal, "products.*.sku", "abc");
        let products = json!({"a": {"sku": "x"}, "b": {"sku": "abc"}});
        assert!(matches_params(&rule, json!({"products": products})));
        assert!(matches_params(&rule, json!({"products": [{"sku": "abc"}]})));
        assert!(!matches_params(&rule, json!({"products": {"a": {"sku": "x"}}})));
    }

    #[test]
    fn test_string_operators() {
        let value = params(json!({"name": "Coffee Shop"}));
        let cases = [
            (RuleOperator::Contains, "Shop", true),
            (RuleOperator::Contains, "shop", false),
            (RuleOperator::CaseInsensitiveContains, "shop", true),
            (RuleOperator::NotContains, "tea", true),
            (RuleOperator::NotContains, "Coffee", false),
            (RuleOperator::CaseInsensitiveNotContains, "coffee", false),
            (RuleOperator::StartsWith, "Coffee", true),
            (RuleOperator::StartsWith, "coffee", false),
            (RuleOperator::CaseInsensitiveStartsWith, "coffee", true),
            (RuleOperator::Equal, "Coffee Shop", true),
            (RuleOperator::Equal, "coffee shop", false),
            (RuleOperator::NotEqual, "Tea Shop", true),
            (RuleOperator::NotEqual, "Coffee Shop", false),
        ];
        for (op, condition, expected) in cases {
            let rule = contains_rule(op, "name", condition);
            assert_eq!(rule.is_matched(Some(&value)), expected, "{} {}", op, condition);
        }
    }

    #[test]
    fn test_numeric_operators() {
        let value = params(json!({"value": 10}));
        let cases = [
            (RuleOperator::LessThan, 11.0, true),
            (RuleOperator::LessThan, 10.0, false),
            (RuleOperator::LessThanOrEqual, 10.0, true),
            (RuleOperator::GreaterThan, 10.0, false),
            (RuleOperator::GreaterThan, 9.5, true),
            (RuleOperator::GreaterThanOrEqual, 10.0, true),
        ];
        for (op, condition, expected) in cases {
            let rule = SingleEntryRule::numerical(op, "value", condition).unwrap();
            assert_eq!(rule.is_matched(Some(&value)), expected, "{} {}", op, condition);
        }
    }

    #[test]
    fn test_regex_match_anywhere() {
        let pattern = "eylea.us/support/?$|eylea.us/support/?";
        let rule = contains_rule(RuleOperator::RegexMatch, "url", pattern);
        assert!(rule.is_matched(Some(&params(json!({"url": "eylea.us/support"})))));
        assert!(rule.is_matched(Some(&params(json!({"url": "https://www.eylea.us/support/"})))));
        assert!(!rule.is_matched(Some(&params(json!({"url": "eylea.us/other"})))));
        assert!(!rule.is_matched(Some(&params(json!({"url": 42})))));
    }

    #[test]
    fn test_regex_rejected_when_invalid() {
        assert!(matches!(
            SingleEntryRule::linguistic(RuleOperator::RegexMatch, "url", "(unclosed"),
            Err(RuleParseError::InvalidRegex { .. })
        ));
        assert!(matches!(
            SingleEntryRule::linguistic(RuleOperator::RegexMatch, "url", ""),
            Err(RuleParseError::InvalidCondition { .. })
        ));
    }

    #[test]
    fn test_regex_without_lookaround_or_backreferences() {
        for pattern in ["shoe(?=-sale)", "(?<!x)sku", r"(a)\1"] {
            assert!(matches!(
                SingleEntryRule::linguistic(RuleOperator::RegexMatch, "url", pattern),
                Err(RuleParseError::InvalidRegex { .. })
            ));
        }
    }

    #[test]
    fn test_is_any_case_sensitivity() {
        let value = params(json!({"category": "B"}));
        let sensitive = membership_rule(RuleOperator::IsAny, &["a", "b"]);
        let insensitive = membership_rule(RuleOperator::CaseInsensitiveIsAny, &["a", "b"]);
        assert!(!sensitive.is_matched(Some(&value)));
        assert!(insensitive.is_matched(Some(&value)));

        let not_any = membership_rule(RuleOperator::IsNotAny, &["a", "b"]);
        let i_not_any = membership_rule(RuleOperator::CaseInsensitiveIsNotAny, &["a", "b"]);
        assert!(not_any.is_matched(Some(&value)));
        assert!(!i_not_any.is_matched(Some(&value)));
    }

    #[test]
    fn test_negated_operator_requires_key() {
        let rule = contains_rule(RuleOperator::NotContains, "fb_content_id", "abc");
        assert!(!rule.is_matched(Some(&EventParameters::new())));
        assert!(!rule.is_matched(Some(&params(json!({"other": "xyz"})))));
        assert!(rule.is_matched(Some(&params(json!({"fb_content_id": "xyz"})))));

        let not_any = membership_rule(RuleOperator::IsNotAny, &["a"]);
        assert!(!not_any.is_matched(Some(&params(json!({"other": "b"})))));
    }

    #[test]
    fn test_condition_must_match_operator() {
        let result = SingleEntryRule::new(
            RuleOperator::Contains,
            "name",
            RuleCondition::Numerical(1.0),
        );
        assert!(matches!(result, Err(RuleParseError::ConditionMismatch { .. })));

        let result =
            SingleEntryRule::new(RuleOperator::And, "name", RuleCondition::Linguistic("x".into()));
        assert!(matches!(result, Err(RuleParseError::UnexpectedOperator { .. })));

        let result = SingleEntryRule::membership(RuleOperator::IsAny, "name", Vec::<String>::new());
        assert!(matches!(result, Err(RuleParseError::InvalidCondition { .. })));

        let result = SingleEntryRule::numerical(RuleOperator::LessThan, "value", f64::NAN);
        assert!(matches!(result, Err(RuleParseError::InvalidCondition { .. })));
    }

    #[test]
    fn test_invalid_param_keys() {
        for key in ["", "a..b", "[*].id", "a."] {
            assert!(
                matches!(
                    SingleEntryRule::linguistic(RuleOperator::Equal, key, "x"),
                    Err(RuleParseError::InvalidParamKey(_))
                ),
                "{:?}",
                key
            );
        }
    }

    #[test]
    fn test_multi_entry_and_or() {
        let a = MatchRule::from(contains_rule(RuleOperator::Equal, "a", "1"));
        let b = MatchRule::from(contains_rule(RuleOperator::Equal, "b", "2"));
        let and = MultiEntryRule::and(vec![a.clone(), b.clone()]).unwrap();
        let or = MultiEntryRule::or(vec![a, b]).unwrap();

        let both = params(json!({"a": "1", "b": "2"}));
        let only_a = params(json!({"a": "1", "b": "3"}));
        let neither = params(json!({"a": "0", "b": "3"}));

        assert!(and.is_matched(Some(&both)));
        assert!(!and.is_matched(Some(&only_a)));
        assert!(or.is_matched(Some(&only_a)));
        assert!(!or.is_matched(Some(&neither)));
    }

    #[test]
    fn test_multi_entry_not() {
        let inner = MatchRule::from(contains_rule(RuleOperator::Contains, "fb_content_id", "abc"));
        let not = MultiEntryRule::not(inner.clone());

        let present_match = params(json!({"fb_content_id": "xabcx"}));
        let present_miss = params(json!({"fb_content_id": "xyz"}));
        let absent = params(json!({"other": "abc"}));

        assert_eq!(not.is_matched(Some(&present_match)), !inner.is_matched(Some(&present_match)));
        assert_eq!(not.is_matched(Some(&present_miss)), !inner.is_matched(Some(&present_miss)));
        assert!(!inner.is_matched(Some(&absent)));
        assert!(!not.is_matched(Some(&absent)));
    }

    #[test]
    fn test_multi_entry_arity() {
        let a = MatchRule::from(contains_rule(RuleOperator::Equal, "a", "1"));
        assert!(matches!(MultiEntryRule::and(vec![]), Err(RuleParseError::InvalidArity { .. })));
        assert!(matches!(
            MultiEntryRule::new(RuleOperator::Not, vec![a.clone(), a.clone()]),
            Err(RuleParseError::InvalidArity { .. })
        ));
        assert!(matches!(
            MultiEntryRule::new(RuleOperator::Contains, vec![a]),
            Err(RuleParseError::UnexpectedOperator { .. })
        ));
    }

    #[test]
    fn test_nested_rules_and_depth() {
        let purchase = MatchRule::from(contains_rule(
            RuleOperator::CaseInsensitiveStartsWith,
            "event",
            "fb_mobile",
        ));
        let quantity = MatchRule::from(
            SingleEntryRule::numerical(RuleOperator::GreaterThan, "quantity", 2.0).unwrap(),
        );
        let inner = MatchRule::from(MultiEntryRule::or(vec![purchase, quantity]).unwrap());
        let outer = MatchRule::from(
            MultiEntryRule::and(vec![
                inner,
                MatchRule::from(contains_rule(RuleOperator::NotEqual, "store", "closed")),
            ])
            .unwrap(),
        );

        assert_eq!(outer.depth(), 3);
        let purchase_event = params(json!({"event": "FB_MOBILE_PURCHASE", "store": "open"}));
        let bulk_event = params(json!({"event": "other", "quantity": 3, "store": "open"}));
        assert!(outer.is_matched(Some(&purchase_event)));
        assert!(outer.is_matched(Some(&bulk_event)));
        assert!(!outer.is_matched(Some(&params(json!({"event": "other", "quantity": 3})))));
    }

    #[test]
    fn test_path_depth_bound() {
        let rule = contains_rule(RuleOperator::Equal, "a.b.c", "x").with_max_path_depth(2);
        assert!(!rule.is_matched(Some(&params(json!({"a": {"b": {"c": "x"}}})))));

        let rule = contains_rule(RuleOperator::Equal, "a.b.c", "x").with_max_path_depth(3);
        assert!(rule.is_matched(Some(&params(json!({"a": {"b": {"c": "x"}}})))));
    }

    #[test]
    fn test_to_json_wire_format() {
        let rule = MatchRule::from(
            MultiEntryRule::and(vec![
                MatchRule::from(contains_rule(
                    RuleOperator::CaseInsensitiveContains,
                    "fb_content[*].id",
                    "abc",
                )),
                MatchRule::from(
                    SingleEntryRule::membership(RuleOperator::IsAny, "currency", ["USD"]).unwrap(),
                ),
            ])
            .unwrap(),
        );
        assert_eq!(
            rule.to_json(),
            json!({"and": [
                {"fb_content[*].id": {"i_contains": "abc"}},
                {"currency": {"is_any": ["USD"]}}
            ]})
        );

        let encoded = serde_json::to_string(&rule).unwrap();
        let decoded: MatchRule = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, rule);
    }
}
