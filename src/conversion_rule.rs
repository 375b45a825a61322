// Conversion value rules and their SKAdNetwork 4 companions.
//
// All three rule kinds (fine value, coarse value, lock window) share the same
// event requirement check: every listed event was recorded and every
// per-currency threshold is met by the running value.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fmt;

use crate::accumulator::EventAccumulator;
use crate::configuration::ConfigurationError;

// ============================================================================
// EVENT REQUIREMENTS
// ============================================================================

/// One event a rule needs, optionally with minimum values per currency.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRequirement {
    pub event_name: String,
    /// Upper-cased currency -> minimum amount
    pub values: Option<BTreeMap<String, f64>>,
}

impl EventRequirement {
    pub fn new(event_name: impl Into<String>) -> Self {
        Self {
            event_name: event_name.into(),
            values: None,
        }
    }

    pub fn with_threshold(mut self, currency: &str, amount: f64) -> Self {
        self.values
            .get_or_insert_with(BTreeMap::new)
            .insert(currency.to_uppercase(), amount);
        self
    }

    /// Parse `{"event_name": "...", "values": [{"currency": "usd", "amount": 100}]}`.
    pub fn from_json(value: &Value) -> Result<Self, ConfigurationError> {
        let object = as_object(value, "events[]")?;
        let event_name = object
            .get("event_name")
            .and_then(Value::as_str)
            .filter(|name| !name.is_empty())
            .ok_or(ConfigurationError::MissingField("event_name"))?;

        let values = match object.get("values") {
            None | Some(Value::Null) => None,
            Some(Value::Array(entries)) => {
                let mut thresholds = BTreeMap::new();
                for entry in entries {
                    let currency = entry
                        .get("currency")
                        .and_then(Value::as_str)
                        .ok_or(ConfigurationError::MissingField("currency"))?;
                    let amount = entry
                        .get("amount")
                        .and_then(Value::as_f64)
                        .ok_or(ConfigurationError::MissingField("amount"))?;
                    thresholds.insert(currency.to_uppercase(), amount);
                }
                Some(thresholds)
            }
            Some(other) => {
                return Err(ConfigurationError::InvalidField {
                    field: "values".to_string(),
                    reason: format!("expected an array, got {}", other),
                })
            }
        };

        Ok(Self {
            event_name: event_name.to_string(),
            values,
        })
    }

    pub fn to_json(&self) -> Value {
        let mut object = Map::new();
        object.insert("event_name".to_string(), json!(self.event_name));
        if let Some(values) = &self.values {
            let entries = values
                .iter()
                .map(|(currency, amount)| json!({"currency": currency, "amount": amount}))
                .collect();
            object.insert("values".to_string(), Value::Array(entries));
        }
        Value::Object(object)
    }

    /// A threshold on a currency that was never recorded disqualifies.
    pub fn is_satisfied(&self, accumulator: &EventAccumulator) -> bool {
        if !accumulator.has_event(&self.event_name) {
            return false;
        }
        match &self.values {
            None => true,
            Some(thresholds) => thresholds.iter().all(|(currency, amount)| {
                accumulator
                    .value_for(&self.event_name, currency)
                    .map_or(false, |recorded| recorded >= *amount)
            }),
        }
    }
}

/// True when `events` is non-empty and every requirement is satisfied.
pub fn events_satisfied(events: &[EventRequirement], accumulator: &EventAccumulator) -> bool {
    !events.is_empty() && events.iter().all(|event| event.is_satisfied(accumulator))
}

fn contains_event(events: &[EventRequirement], name: &str) -> bool {
    events.iter().any(|event| event.event_name == name)
}

fn parse_events(value: Option<&Value>) -> Result<Vec<EventRequirement>, ConfigurationError> {
    let entries = value
        .and_then(Value::as_array)
        .ok_or(ConfigurationError::MissingField("events"))?;
    if entries.is_empty() {
        return Err(ConfigurationError::InvalidField {
            field: "events".to_string(),
            reason: "must not be empty".to_string(),
        });
    }
    entries.iter().map(EventRequirement::from_json).collect()
}

fn events_to_json(events: &[EventRequirement]) -> Value {
    Value::Array(events.iter().map(EventRequirement::to_json).collect())
}

fn as_object<'a>(
    value: &'a Value,
    field: &str,
) -> Result<&'a Map<String, Value>, ConfigurationError> {
    value.as_object().ok_or_else(|| ConfigurationError::InvalidField {
        field: field.to_string(),
        reason: format!("expected an object, got {}", value),
    })
}

fn postback_index(object: &Map<String, Value>) -> Result<u8, ConfigurationError> {
    let index = object
        .get("postback_sequence_index")
        .and_then(Value::as_u64)
        .ok_or(ConfigurationError::MissingField("postback_sequence_index"))?;
    u8::try_from(index)
        .ok()
        .filter(|index| *index >= 1)
        .ok_or_else(|| ConfigurationError::InvalidField {
            field: "postback_sequence_index".to_string(),
            reason: format!("{} is out of range", index),
        })
}

// ============================================================================
// FINE CONVERSION VALUE RULES
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct ConversionValueRule {
    pub conversion_value: u32,
    pub priority: i64,
    pub events: Vec<EventRequirement>,
}

impl ConversionValueRule {
    pub fn new(conversion_value: u32, priority: i64, events: Vec<EventRequirement>) -> Self {
        Self {
            conversion_value,
            priority,
            events,
        }
    }

    /// Parse one entry of `conversion_value_rules`. A missing priority
    /// defaults to the conversion value.
    pub fn from_json(value: &Value) -> Result<Self, ConfigurationError> {
        let object = as_object(value, "conversion_value_rules[]")?;
        let raw_value = object
            .get("conversion_value")
            .and_then(Value::as_u64)
            .ok_or(ConfigurationError::MissingField("conversion_value"))?;
        let conversion_value =
            u32::try_from(raw_value).map_err(|_| ConfigurationError::InvalidField {
                field: "conversion_value".to_string(),
                reason: format!("{} is out of range", raw_value),
            })?;

        let priority = match object.get("priority") {
            None | Some(Value::Null) => i64::from(conversion_value),
            Some(p) => p.as_i64().ok_or_else(|| ConfigurationError::InvalidField {
                field: "priority".to_string(),
                reason: format!("expected an integer, got {}", p),
            })?,
        };

        let events = parse_events(object.get("events"))?;

        Ok(Self {
            conversion_value,
            priority,
            events,
        })
    }

    pub fn to_json(&self) -> Value {
        json!({
            "conversion_value": self.conversion_value,
            "priority": self.priority,
            "events": events_to_json(&self.events),
        })
    }

    pub fn is_satisfied(&self, accumulator: &EventAccumulator) -> bool {
        events_satisfied(&self.events, accumulator)
    }

    pub fn contains_event(&self, name: &str) -> bool {
        contains_event(&self.events, name)
    }
}

// ============================================================================
// COARSE VALUES
// ============================================================================

/// SKAdNetwork coarse conversion value. Ordered `Low < Medium < High`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoarseValue {
    Low,
    Medium,
    High,
}

impl CoarseValue {
    pub fn as_str(self) -> &'static str {
        match self {
            CoarseValue::Low => "low",
            CoarseValue::Medium => "medium",
            CoarseValue::High => "high",
        }
    }

    pub fn from_wire(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "low" => Some(CoarseValue::Low),
            "medium" => Some(CoarseValue::Medium),
            "high" => Some(CoarseValue::High),
            _ => None,
        }
    }
}

impl fmt::Display for CoarseValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CoarseValueRule {
    pub coarse_value: CoarseValue,
    pub events: Vec<EventRequirement>,
}

impl CoarseValueRule {
    pub fn new(coarse_value: CoarseValue, events: Vec<EventRequirement>) -> Self {
        Self {
            coarse_value,
            events,
        }
    }

    /// Parse `{"coarse_cv_value": "high", "events": [...]}`.
    pub fn from_json(value: &Value) -> Result<Self, ConfigurationError> {
        let object = as_object(value, "coarse_cv_rules[]")?;
        let raw = object
            .get("coarse_cv_value")
            .and_then(Value::as_str)
            .ok_or(ConfigurationError::MissingField("coarse_cv_value"))?;
        let coarse_value =
            CoarseValue::from_wire(raw).ok_or_else(|| ConfigurationError::InvalidField {
                field: "coarse_cv_value".to_string(),
                reason: format!("unknown coarse value {:?}", raw),
            })?;
        let events = parse_events(object.get("events"))?;
        Ok(Self {
            coarse_value,
            events,
        })
    }

    pub fn to_json(&self) -> Value {
        json!({
            "coarse_cv_value": self.coarse_value.as_str(),
            "events": events_to_json(&self.events),
        })
    }

    pub fn is_satisfied(&self, accumulator: &EventAccumulator) -> bool {
        events_satisfied(&self.events, accumulator)
    }

    pub fn contains_event(&self, name: &str) -> bool {
        contains_event(&self.events, name)
    }
}

/// Coarse value rules for one postback window, ordered high to low.
#[derive(Debug, Clone, PartialEq)]
pub struct CoarseValueConfig {
    pub postback_sequence_index: u8,
    pub rules: Vec<CoarseValueRule>,
}

impl CoarseValueConfig {
    pub fn new(postback_sequence_index: u8, mut rules: Vec<CoarseValueRule>) -> Self {
        sort_coarse_rules(&mut rules);
        Self {
            postback_sequence_index,
            rules,
        }
    }

    /// Parse `{"postback_sequence_index": 1, "coarse_cv_rules": [...]}`.
    pub fn from_json(value: &Value) -> Result<Self, ConfigurationError> {
        let object = as_object(value, "coarse_cv_configs[]")?;
        let postback_sequence_index = postback_index(object)?;
        let entries = object
            .get("coarse_cv_rules")
            .and_then(Value::as_array)
            .ok_or(ConfigurationError::MissingField("coarse_cv_rules"))?;

        let rules = entries
            .iter()
            .filter_map(|entry| match CoarseValueRule::from_json(entry) {
                Ok(rule) => Some(rule),
                Err(e) => {
                    log::warn!("Dropping coarse value rule: {}", e);
                    None
                }
            })
            .collect::<Vec<_>>();

        if rules.is_empty() {
            return Err(ConfigurationError::InvalidField {
                field: "coarse_cv_rules".to_string(),
                reason: "no valid rules".to_string(),
            });
        }

        Ok(Self::new(postback_sequence_index, rules))
    }

    pub fn to_json(&self) -> Value {
        json!({
            "postback_sequence_index": self.postback_sequence_index,
            "coarse_cv_rules": self.rules.iter().map(CoarseValueRule::to_json).collect::<Vec<_>>(),
        })
    }

    /// Highest coarse value whose events are satisfied.
    pub fn select(&self, accumulator: &EventAccumulator) -> Option<CoarseValue> {
        self.rules
            .iter()
            .find(|rule| rule.is_satisfied(accumulator))
            .map(|rule| rule.coarse_value)
    }
}

/// Stable sort, high before low.
pub fn sort_coarse_rules(rules: &mut [CoarseValueRule]) {
    rules.sort_by(|a, b| b.coarse_value.cmp(&a.coarse_value));
}

// ============================================================================
// LOCK WINDOW RULES
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum LockWindowTrigger {
    /// Lock once these events are satisfied.
    Event { events: Vec<EventRequirement> },
    /// Lock once this many hours passed since the postback window opened.
    Time { hours: u32 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct LockWindowRule {
    pub postback_sequence_index: u8,
    pub trigger: LockWindowTrigger,
}

impl LockWindowRule {
    pub fn new(postback_sequence_index: u8, trigger: LockWindowTrigger) -> Self {
        Self {
            postback_sequence_index,
            trigger,
        }
    }

    /// Parse `{"lock_window_type": "event"|"time", "postback_sequence_index": n,
    /// "events": [...]}` or `{..., "time": hours}`.
    pub fn from_json(value: &Value) -> Result<Self, ConfigurationError> {
        let object = as_object(value, "lock_window_rules[]")?;
        let postback_sequence_index = postback_index(object)?;
        let kind = object
            .get("lock_window_type")
            .and_then(Value::as_str)
            .ok_or(ConfigurationError::MissingField("lock_window_type"))?;

        let trigger = match kind.to_ascii_lowercase().as_str() {
            "event" => LockWindowTrigger::Event {
                events: parse_events(object.get("events"))?,
            },
            "time" => {
                let hours = object
                    .get("time")
                    .and_then(Value::as_u64)
                    .and_then(|hours| u32::try_from(hours).ok())
                    .ok_or(ConfigurationError::MissingField("time"))?;
                LockWindowTrigger::Time { hours }
            }
            other => {
                return Err(ConfigurationError::InvalidField {
                    field: "lock_window_type".to_string(),
                    reason: format!("unknown lock window type {:?}", other),
                })
            }
        };

        Ok(Self {
            postback_sequence_index,
            trigger,
        })
    }

    pub fn to_json(&self) -> Value {
        match &self.trigger {
            LockWindowTrigger::Event { events } => json!({
                "lock_window_type": "event",
                "postback_sequence_index": self.postback_sequence_index,
                "events": events_to_json(events),
            }),
            LockWindowTrigger::Time { hours } => json!({
                "lock_window_type": "time",
                "postback_sequence_index": self.postback_sequence_index,
                "time": hours,
            }),
        }
    }

    /// `hours_in_window` is the time elapsed since this postback window opened.
    pub fn is_locked(&self, accumulator: &EventAccumulator, hours_in_window: i64) -> bool {
        match &self.trigger {
            LockWindowTrigger::Event { events } => events_satisfied(events, accumulator),
            LockWindowTrigger::Time { hours } => hours_in_window >= i64::from(*hours),
        }
    }
}
