// Immutable configuration snapshot delivered by the server.
//
// A Configuration is built once from JSON and never mutated afterwards.
// `event_set` and `currency_set` are derived from the rules during parsing.
// Invalid individual rules are dropped with a warning; a configuration with
// no usable conversion value rule is rejected as a whole.

use log::warn;
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use thiserror::Error;

use crate::conversion_rule::{
    CoarseValueConfig, ConversionValueRule, EventRequirement, LockWindowRule, LockWindowTrigger,
};
use crate::match_rule::MatchRule;
use crate::rule_factory::{RuleFactory, RuleParseError};

pub const DEFAULT_CURRENCY: &str = "USD";

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigurationError {
    #[error("JSON parse error: {0}")]
    JsonParseError(String),

    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid field {field}: {reason}")]
    InvalidField { field: String, reason: String },

    #[error("No valid conversion value rules")]
    NoValidRules,

    #[error("Invalid matching rule: {0}")]
    InvalidMatchingRule(#[from] RuleParseError),
}

/// Campaign mode the configuration was issued for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConfigMode {
    #[default]
    Default,
    Brand,
    Cpas,
}

impl ConfigMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ConfigMode::Default => "DEFAULT",
            ConfigMode::Brand => "BRAND",
            ConfigMode::Cpas => "CPAS",
        }
    }

    pub fn from_wire(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "DEFAULT" => Some(ConfigMode::Default),
            "BRAND" => Some(ConfigMode::Brand),
            "CPAS" => Some(ConfigMode::Cpas),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Configuration {
    valid_from: i64,
    cutoff_time_days: u32,
    default_currency: String,
    mode: ConfigMode,
    business_id: Option<String>,
    matching_rule: Option<MatchRule>,
    conversion_value_rules: Vec<ConversionValueRule>,
    coarse_value_configs: Vec<CoarseValueConfig>,
    lock_window_rules: Vec<LockWindowRule>,
    event_set: BTreeSet<String>,
    currency_set: BTreeSet<String>,
}

impl Configuration {
    /// Parse with the default rule limits.
    pub fn from_json(value: &Value) -> Result<Self, ConfigurationError> {
        Self::from_json_with(value, &RuleFactory::new())
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigurationError> {
        let value: Value = serde_json::from_str(json)
            .map_err(|e| ConfigurationError::JsonParseError(e.to_string()))?;
        Self::from_json(&value)
    }

    /// Unwrap a Graph API style `{"data": [{...}]}` payload and parse its
    /// first entry. A bare configuration object is accepted as-is.
    pub fn from_graph_response(value: &Value) -> Result<Self, ConfigurationError> {
        Self::from_graph_response_with(value, &RuleFactory::new())
    }

    pub fn from_graph_response_with(
        value: &Value,
        factory: &RuleFactory,
    ) -> Result<Self, ConfigurationError> {
        match value.get("data") {
            Some(Value::Array(entries)) => {
                let first = entries.first().ok_or_else(|| {
                    ConfigurationError::InvalidFormat("response data is empty".to_string())
                })?;
                Self::from_json_with(first, factory)
            }
            Some(other) => Err(ConfigurationError::InvalidFormat(format!(
                "response data must be an array, got {}",
                other
            ))),
            None => Self::from_json_with(value, factory),
        }
    }

    pub fn from_json_with(
        value: &Value,
        factory: &RuleFactory,
    ) -> Result<Self, ConfigurationError> {
        let object = value.as_object().ok_or_else(|| {
            ConfigurationError::InvalidFormat("configuration must be a JSON object".to_string())
        })?;

        let cutoff_time_days = object
            .get("cutoff_time")
            .ok_or(ConfigurationError::MissingField("cutoff_time"))?
            .as_u64()
            .and_then(|days| u32::try_from(days).ok())
            .ok_or_else(|| ConfigurationError::InvalidField {
                field: "cutoff_time".to_string(),
                reason: "expected a non-negative number of days".to_string(),
            })?;

        let valid_from = match object.get("valid_from") {
            None | Some(Value::Null) => 0,
            Some(v) => v.as_i64().ok_or_else(|| ConfigurationError::InvalidField {
                field: "valid_from".to_string(),
                reason: format!("expected an integer timestamp, got {}", v),
            })?,
        };

        let default_currency = object
            .get("default_currency")
            .and_then(Value::as_str)
            .filter(|currency| !currency.is_empty())
            .unwrap_or(DEFAULT_CURRENCY)
            .to_uppercase();

        let mode = match object.get("config_mode").and_then(Value::as_str) {
            None => ConfigMode::Default,
            Some(raw) => ConfigMode::from_wire(raw).unwrap_or_else(|| {
                warn!("Unknown config_mode {:?}, treating as DEFAULT", raw);
                ConfigMode::Default
            }),
        };

        let business_id = ["business_id", "advertiser_id"]
            .iter()
            .find_map(|key| match object.get(*key) {
                Some(Value::String(id)) if !id.is_empty() => Some(id.clone()),
                Some(Value::Number(id)) => Some(id.to_string()),
                _ => None,
            });

        let raw_rule = ["matching_rule", "param_rule"]
            .iter()
            .find_map(|key| object.get(*key).filter(|v| !v.is_null()));
        let matching_rule = match (raw_rule, &business_id) {
            (Some(raw), Some(_)) => Some(factory.parse_embedded(raw)?),
            (None, Some(_)) => return Err(ConfigurationError::MissingField("matching_rule")),
            (Some(raw), None) => match factory.parse_embedded(raw) {
                Ok(rule) => Some(rule),
                Err(e) => {
                    warn!("Ignoring unparsable matching rule: {}", e);
                    None
                }
            },
            (None, None) => None,
        };

        let entries = object
            .get("conversion_value_rules")
            .ok_or(ConfigurationError::MissingField("conversion_value_rules"))?
            .as_array()
            .ok_or_else(|| ConfigurationError::InvalidField {
                field: "conversion_value_rules".to_string(),
                reason: "expected an array".to_string(),
            })?;
        if entries.is_empty() {
            return Err(ConfigurationError::NoValidRules);
        }

        let mut conversion_value_rules =
            parse_each(entries, "conversion value rule", ConversionValueRule::from_json);
        if conversion_value_rules.is_empty() {
            return Err(ConfigurationError::NoValidRules);
        }
        sort_conversion_rules(&mut conversion_value_rules);

        let coarse_value_configs = match object.get("coarse_cv_configs").and_then(Value::as_array) {
            Some(entries) => {
                parse_each(entries, "coarse value config", CoarseValueConfig::from_json)
            }
            None => Vec::new(),
        };

        let lock_window_rules = match object.get("lock_window_rules").and_then(Value::as_array) {
            Some(entries) => parse_each(entries, "lock window rule", LockWindowRule::from_json),
            None => Vec::new(),
        };

        Ok(Self::assemble(
            valid_from,
            cutoff_time_days,
            default_currency,
            mode,
            business_id,
            matching_rule,
            conversion_value_rules,
            coarse_value_configs,
            lock_window_rules,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        valid_from: i64,
        cutoff_time_days: u32,
        default_currency: String,
        mode: ConfigMode,
        business_id: Option<String>,
        matching_rule: Option<MatchRule>,
        conversion_value_rules: Vec<ConversionValueRule>,
        coarse_value_configs: Vec<CoarseValueConfig>,
        lock_window_rules: Vec<LockWindowRule>,
    ) -> Self {
        let mut requirements: Vec<&EventRequirement> = Vec::new();
        for rule in &conversion_value_rules {
            requirements.extend(rule.events.iter());
        }
        for config in &coarse_value_configs {
            for rule in &config.rules {
                requirements.extend(rule.events.iter());
            }
        }
        for rule in &lock_window_rules {
            if let LockWindowTrigger::Event { events } = &rule.trigger {
                requirements.extend(events.iter());
            }
        }

        let event_set = requirements
            .iter()
            .map(|event| event.event_name.clone())
            .collect();
        let currency_set = requirements
            .iter()
            .filter_map(|event| event.values.as_ref())
            .flat_map(|values| values.keys().cloned())
            .collect();

        Self {
            valid_from,
            cutoff_time_days,
            default_currency,
            mode,
            business_id,
            matching_rule,
            conversion_value_rules,
            coarse_value_configs,
            lock_window_rules,
            event_set,
            currency_set,
        }
    }

    /// Serialise back to the wire schema.
    pub fn to_json(&self) -> Value {
        let mut object = Map::new();
        object.insert("valid_from".to_string(), json!(self.valid_from));
        object.insert("cutoff_time".to_string(), json!(self.cutoff_time_days));
        object.insert("default_currency".to_string(), json!(self.default_currency));
        object.insert("config_mode".to_string(), json!(self.mode.as_str()));
        if let Some(business_id) = &self.business_id {
            object.insert("business_id".to_string(), json!(business_id));
        }
        if let Some(rule) = &self.matching_rule {
            object.insert("matching_rule".to_string(), rule.to_json());
        }
        object.insert(
            "conversion_value_rules".to_string(),
            Value::Array(
                self.conversion_value_rules
                    .iter()
                    .map(ConversionValueRule::to_json)
                    .collect(),
            ),
        );
        if !self.coarse_value_configs.is_empty() {
            object.insert(
                "coarse_cv_configs".to_string(),
                Value::Array(
                    self.coarse_value_configs
                        .iter()
                        .map(CoarseValueConfig::to_json)
                        .collect(),
                ),
            );
        }
        if !self.lock_window_rules.is_empty() {
            object.insert(
                "lock_window_rules".to_string(),
                Value::Array(self.lock_window_rules.iter().map(LockWindowRule::to_json).collect()),
            );
        }
        Value::Object(object)
    }

    pub fn valid_from(&self) -> i64 {
        self.valid_from
    }

    pub fn cutoff_time_days(&self) -> u32 {
        self.cutoff_time_days
    }

    pub fn default_currency(&self) -> &str {
        &self.default_currency
    }

    pub fn mode(&self) -> ConfigMode {
        self.mode
    }

    pub fn business_id(&self) -> Option<&str> {
        self.business_id.as_deref()
    }

    pub fn matching_rule(&self) -> Option<&MatchRule> {
        self.matching_rule.as_ref()
    }

    /// Ordered by descending priority; equal priorities keep payload order.
    pub fn conversion_value_rules(&self) -> &[ConversionValueRule] {
        &self.conversion_value_rules
    }

    pub fn coarse_value_configs(&self) -> &[CoarseValueConfig] {
        &self.coarse_value_configs
    }

    pub fn coarse_value_config_for(
        &self,
        postback_sequence_index: u8,
    ) -> Option<&CoarseValueConfig> {
        self.coarse_value_configs
            .iter()
            .find(|config| config.postback_sequence_index == postback_sequence_index)
    }

    pub fn lock_window_rules(&self) -> &[LockWindowRule] {
        &self.lock_window_rules
    }

    pub fn lock_window_rules_for(
        &self,
        postback_sequence_index: u8,
    ) -> impl Iterator<Item = &LockWindowRule> {
        self.lock_window_rules
            .iter()
            .filter(move |rule| rule.postback_sequence_index == postback_sequence_index)
    }

    pub fn event_set(&self) -> &BTreeSet<String> {
        &self.event_set
    }

    pub fn currency_set(&self) -> &BTreeSet<String> {
        &self.currency_set
    }

    pub fn is_same_valid_from(&self, valid_from: i64, business_id: Option<&str>) -> bool {
        self.valid_from == valid_from && self.is_same_business_id(business_id)
    }

    pub fn is_same_business_id(&self, business_id: Option<&str>) -> bool {
        self.business_id.as_deref() == business_id
    }

    /// Whether events with this name can affect the conversion value.
    pub fn is_reporting_event(&self, event_name: &str) -> bool {
        self.event_set.contains(event_name)
    }

    /// Upper-cased `currency` if some rule has a threshold in it, otherwise
    /// the default currency.
    pub fn resolve_currency(&self, currency: Option<&str>) -> String {
        currency
            .map(str::to_uppercase)
            .filter(|currency| self.currency_set.contains(currency))
            .unwrap_or_else(|| self.default_currency.clone())
    }
}

/// Stable sort by descending priority.
pub fn sort_conversion_rules(rules: &mut [ConversionValueRule]) {
    rules.sort_by(|a, b| b.priority.cmp(&a.priority));
}

fn parse_each<T>(
    entries: &[Value],
    what: &str,
    parse: impl Fn(&Value) -> Result<T, ConfigurationError>,
) -> Vec<T> {
    entries
        .iter()
        .filter_map(|entry| match parse(entry) {
            Ok(item) => Some(item),
            Err(e) => {
                warn!("Dropping invalid {}: {}", what, e);
                None
            }
        })
        .collect()
}
