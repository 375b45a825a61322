// Attribution selection: which values to report for a window right now.
//
// The selector is a pure function of (configuration, accumulator, window,
// now). It never mutates anything, so it can run on any thread against a
// shared Configuration.

use chrono::{DateTime, Duration, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::accumulator::EventAccumulator;
use crate::configuration::Configuration;
use crate::conversion_rule::CoarseValue;
use crate::engine_config::EngineConfig;

const HOURS_PER_DAY: i64 = 24;

// ============================================================================
// ATTRIBUTION WINDOW
// ============================================================================

/// Identifier of one attribution window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WindowId(Uuid);

impl WindowId {
    pub fn new() -> Self {
        WindowId(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for WindowId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for WindowId {
    fn from(uuid: Uuid) -> Self {
        WindowId(uuid)
    }
}

impl std::fmt::Display for WindowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributionWindow {
    pub id: WindowId,
    /// Install or re-engagement time the window is measured from.
    pub started_at: DateTime<Utc>,
    /// Last time the reported value changed.
    pub last_conversion_at: Option<DateTime<Utc>>,
}

impl AttributionWindow {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            id: WindowId::new(),
            started_at,
            last_conversion_at: None,
        }
    }

    pub fn with_last_conversion_at(mut self, at: DateTime<Utc>) -> Self {
        self.last_conversion_at = Some(at);
        self
    }

    /// Time since the window started. Clock skew never yields a negative span.
    pub fn elapsed(&self, now: DateTime<Utc>) -> Duration {
        (now - self.started_at).max(Duration::zero())
    }
}

// ============================================================================
// SELECTION RESULT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SelectionResult {
    pub conversion_value: Option<u32>,
    pub priority: Option<i64>,
    pub coarse_value: Option<CoarseValue>,
    pub postback_sequence_index: Option<u8>,
    pub lock_window: bool,
    /// The window is over; this is the last evaluation.
    pub is_final: bool,
    /// The advertiser matching rule accepted a recorded event.
    pub is_eligible: bool,
}

impl SelectionResult {
    /// Whether the caller should hand this result to the postback sender.
    /// A final result is reportable even without a value.
    pub fn should_report(&self) -> bool {
        self.is_eligible
            && (self.conversion_value.is_some()
                || self.coarse_value.is_some()
                || self.lock_window
                || self.is_final)
    }
}

// ============================================================================
// SELECTOR
// ============================================================================

#[derive(Debug, Clone)]
pub struct AttributionSelector {
    postback_window_days: Vec<u32>,
    last_conversion_window_hours: Option<u32>,
}

impl AttributionSelector {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            postback_window_days: config.postback_window_days.clone(),
            last_conversion_window_hours: config.last_conversion_window_hours,
        }
    }

    /// Pick the fine value, coarse value and lock-window state to report.
    ///
    /// Conversion value rules are already in descending priority order, so
    /// the first satisfied one wins.
    pub fn select(
        &self,
        config: &Configuration,
        accumulator: &EventAccumulator,
        window: &AttributionWindow,
        now: DateTime<Utc>,
    ) -> SelectionResult {
        let is_final = self.is_cutoff(config, window, now);
        let postback_sequence_index = self.postback_sequence_index(window, now);

        if let Some(rule) = config.matching_rule() {
            let matched = accumulator.has_matched_rule()
                || rule.is_matched(Some(accumulator.recorded_parameters()));
            if !matched {
                debug!("Window {} is not eligible under the matching rule", window.id);
                return SelectionResult {
                    postback_sequence_index,
                    is_final,
                    is_eligible: false,
                    ..SelectionResult::default()
                };
            }
        }

        let fine = config
            .conversion_value_rules()
            .iter()
            .find(|rule| rule.is_satisfied(accumulator));

        let coarse_value = postback_sequence_index
            .and_then(|index| config.coarse_value_config_for(index))
            .and_then(|coarse| coarse.select(accumulator));

        let lock_window = match postback_sequence_index {
            Some(index) => {
                let hours_in_window = self.hours_in_postback_window(window, now, index);
                config
                    .lock_window_rules_for(index)
                    .any(|rule| rule.is_locked(accumulator, hours_in_window))
            }
            None => false,
        };

        let result = SelectionResult {
            conversion_value: fine.map(|rule| rule.conversion_value),
            priority: fine.map(|rule| rule.priority),
            coarse_value,
            postback_sequence_index,
            lock_window,
            is_final,
            is_eligible: true,
        };
        debug!("Selection for window {}: {:?}", window.id, result);
        result
    }

    /// 1-based index of the postback window `now` falls in, or `None` once
    /// every window has closed.
    pub fn postback_sequence_index(
        &self,
        window: &AttributionWindow,
        now: DateTime<Utc>,
    ) -> Option<u8> {
        let elapsed = window.elapsed(now);
        self.postback_window_days
            .iter()
            .position(|days| elapsed < Duration::days(i64::from(*days)))
            .and_then(|position| u8::try_from(position + 1).ok())
    }

    /// The window is over when the cutoff elapsed since it started, or when
    /// the last conversion update is older than the configured limit.
    pub fn is_cutoff(
        &self,
        config: &Configuration,
        window: &AttributionWindow,
        now: DateTime<Utc>,
    ) -> bool {
        let cutoff = Duration::days(i64::from(config.cutoff_time_days()));
        if window.elapsed(now) >= cutoff {
            return true;
        }

        match (window.last_conversion_at, self.last_conversion_window_hours) {
            (Some(last), Some(hours)) => now - last > Duration::hours(i64::from(hours)),
            _ => false,
        }
    }

    fn hours_in_postback_window(
        &self,
        window: &AttributionWindow,
        now: DateTime<Utc>,
        index: u8,
    ) -> i64 {
        let opened_after_days = usize::from(index)
            .checked_sub(2)
            .and_then(|previous| self.postback_window_days.get(previous))
            .copied()
            .unwrap_or(0);
        window.elapsed(now).num_hours() - i64::from(opened_after_days) * HOURS_PER_DAY
    }
}

impl Default for AttributionSelector {
    fn default() -> Self {
        Self::new(&EngineConfig::default())
    }
}
