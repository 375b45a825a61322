// Per-window record of conversion events.
//
// Holds which events happened, the running value per (event, parameter), the
// merged event parameters and whether any recorded event passed the
// advertiser matching rule. No internal locking; AttributionContext owns the
// only instance.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::match_rule::EventParameters;

/// How a new value for an already recorded (event, parameter) pair is folded
/// into the running value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueMergePolicy {
    /// Keep the largest value seen. Thresholds read as "at least X in one event".
    #[default]
    Max,
    /// Running total across events.
    Sum,
}

impl ValueMergePolicy {
    pub fn merge(self, current: Option<f64>, value: f64) -> f64 {
        match (self, current) {
            (_, None) => value,
            (ValueMergePolicy::Max, Some(current)) => current.max(value),
            (ValueMergePolicy::Sum, Some(current)) => current + value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EventAccumulator {
    #[serde(default)]
    recorded_events: BTreeSet<String>,

    /// event name -> parameter (currency) -> running value
    #[serde(default)]
    recorded_values: BTreeMap<String, BTreeMap<String, f64>>,

    #[serde(default)]
    recorded_parameters: EventParameters,

    /// Set once an event passed the advertiser matching rule.
    #[serde(default)]
    rule_matched: bool,

    #[serde(default)]
    merge_policy: ValueMergePolicy,
}

impl EventAccumulator {
    pub fn new(merge_policy: ValueMergePolicy) -> Self {
        Self {
            merge_policy,
            ..Self::default()
        }
    }

    pub fn merge_policy(&self) -> ValueMergePolicy {
        self.merge_policy
    }

    /// Record an occurrence of `event` with its parameter values.
    ///
    /// Returns true when the recorded state changed: a first occurrence of the
    /// event, or a running value that moved. Non-finite values are ignored.
    pub fn record<I, K>(&mut self, event: &str, values: I) -> bool
    where
        I: IntoIterator<Item = (K, f64)>,
        K: Into<String>,
    {
        let mut changed = self.recorded_events.insert(event.to_string());

        for (param, value) in values {
            if !value.is_finite() {
                continue;
            }
            let per_event = self.recorded_values.entry(event.to_string()).or_default();
            let param = param.into();
            let current = per_event.get(&param).copied();
            let merged = self.merge_policy.merge(current, value);
            if current != Some(merged) {
                per_event.insert(param, merged);
                changed = true;
            }
        }

        changed
    }

    /// Record an event that carries no values.
    pub fn record_event(&mut self, event: &str) -> bool {
        self.record(event, std::iter::empty::<(String, f64)>())
    }

    /// Shallow-merge event parameters into the aggregated matching input.
    /// Later values overwrite earlier ones key by key.
    pub fn record_parameters(&mut self, params: &EventParameters) -> bool {
        let mut changed = false;
        for (key, value) in params {
            if self.recorded_parameters.get(key) != Some(value) {
                self.recorded_parameters.insert(key.clone(), value.clone());
                changed = true;
            }
        }
        changed
    }

    /// Remember that an event passed the matching rule. Never unset until
    /// `reset`. Returns true on the first match.
    pub fn mark_rule_matched(&mut self) -> bool {
        !std::mem::replace(&mut self.rule_matched, true)
    }

    pub fn has_matched_rule(&self) -> bool {
        self.rule_matched
    }

    pub fn has_event(&self, event: &str) -> bool {
        self.recorded_events.contains(event)
    }

    pub fn value_for(&self, event: &str, param: &str) -> Option<f64> {
        self.recorded_values.get(event)?.get(param).copied()
    }

    pub fn values_for(&self, event: &str) -> Option<&BTreeMap<String, f64>> {
        self.recorded_values.get(event)
    }

    pub fn recorded_events(&self) -> &BTreeSet<String> {
        &self.recorded_events
    }

    pub fn recorded_parameters(&self) -> &EventParameters {
        &self.recorded_parameters
    }

    pub fn is_empty(&self) -> bool {
        self.recorded_events.is_empty()
            && self.recorded_values.is_empty()
            && self.recorded_parameters.is_empty()
            && !self.rule_matched
    }

    /// Forget everything recorded. The merge policy is kept.
    pub fn reset(&mut self) {
        self.recorded_events.clear();
        self.recorded_values.clear();
        self.recorded_parameters.clear();
        self.rule_matched = false;
    }
}
