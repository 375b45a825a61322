// Attribution state for one app install.
//
// AttributionContext owns the installed configuration, the event accumulator,
// the current attribution window and the last reported selection. Every
// mutation goes through it; callers share it behind SharedContext so record,
// evaluate and configuration swaps are serialized.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::accumulator::EventAccumulator;
use crate::configuration::{ConfigMode, Configuration, ConfigurationError};
use crate::conversion_rule::CoarseValue;
use crate::engine_config::{EngineConfig, EngineConfigError};
use crate::event_parameters::{in_segment_value, processed_parameters};
use crate::match_rule::EventParameters;
use crate::rule_factory::RuleFactory;
use crate::selector::{AttributionSelector, AttributionWindow, SelectionResult, WindowId};

pub type SharedContext = Arc<Mutex<AttributionContext>>;

/// What happened to an offered configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    /// First configuration for this context.
    Installed,
    /// Same `valid_from` and business id as the installed one; kept the old.
    Unchanged,
    /// Older than the installed one; ignored.
    Stale,
    /// Replaced the installed configuration. Reported state was reset.
    Superseded { previous_valid_from: i64 },
}

/// Decision handed to the postback sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Postback {
    pub window_id: WindowId,
    pub conversion_value: Option<u32>,
    pub coarse_value: Option<CoarseValue>,
    pub postback_sequence_index: Option<u8>,
    pub lock_window: bool,
    pub is_final: bool,
}

impl Postback {
    fn from_selection(window_id: WindowId, result: &SelectionResult) -> Self {
        Self {
            window_id,
            conversion_value: result.conversion_value,
            coarse_value: result.coarse_value,
            postback_sequence_index: result.postback_sequence_index,
            lock_window: result.lock_window,
            is_final: result.is_final,
        }
    }
}

/// Persistable form of an AttributionContext.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    /// Installed configuration in wire format.
    pub configuration: Option<Value>,
    pub accumulator: EventAccumulator,
    pub window: Option<AttributionWindow>,
    pub last_reported: Option<SelectionResult>,
    #[serde(default)]
    pub is_finalized: bool,
}

pub struct AttributionContext {
    engine: EngineConfig,
    factory: RuleFactory,
    selector: AttributionSelector,
    configuration: Option<Arc<Configuration>>,
    accumulator: EventAccumulator,
    window: Option<AttributionWindow>,
    last_reported: Option<SelectionResult>,
    is_finalized: bool,
}

impl AttributionContext {
    pub fn new(engine: EngineConfig) -> Result<Self, EngineConfigError> {
        engine.validate()?;
        Ok(Self {
            factory: RuleFactory::from_config(&engine),
            selector: AttributionSelector::new(&engine),
            accumulator: EventAccumulator::new(engine.value_merge_policy),
            configuration: None,
            window: None,
            last_reported: None,
            is_finalized: false,
            engine,
        })
    }

    pub fn shared(self) -> SharedContext {
        Arc::new(Mutex::new(self))
    }

    pub fn engine_config(&self) -> &EngineConfig {
        &self.engine
    }

    /// Rule parser carrying this engine's depth limits.
    pub fn rule_factory(&self) -> &RuleFactory {
        &self.factory
    }

    pub fn configuration(&self) -> Option<&Arc<Configuration>> {
        self.configuration.as_ref()
    }

    pub fn accumulator(&self) -> &EventAccumulator {
        &self.accumulator
    }

    pub fn window(&self) -> Option<&AttributionWindow> {
        self.window.as_ref()
    }

    pub fn last_reported(&self) -> Option<&SelectionResult> {
        self.last_reported.as_ref()
    }

    /// A final postback went out; nothing more is recorded until a new window.
    pub fn is_finalized(&self) -> bool {
        self.is_finalized
    }

    // ========================================================================
    // TRANSITIONS
    // ========================================================================

    /// Offer a freshly parsed configuration.
    pub fn install_configuration(&mut self, configuration: Configuration) -> InstallOutcome {
        let current = match &self.configuration {
            None => {
                info!(
                    "Installed configuration valid_from={} with {} rules",
                    configuration.valid_from(),
                    configuration.conversion_value_rules().len()
                );
                self.configuration = Some(Arc::new(configuration));
                return InstallOutcome::Installed;
            }
            Some(current) => current,
        };

        if current.is_same_valid_from(configuration.valid_from(), configuration.business_id()) {
            debug!("Configuration valid_from={} already installed", configuration.valid_from());
            return InstallOutcome::Unchanged;
        }

        let previous_valid_from = current.valid_from();
        if current.is_same_business_id(configuration.business_id())
            && configuration.valid_from() < previous_valid_from
        {
            warn!(
                "Ignoring configuration valid_from={} older than installed {}",
                configuration.valid_from(),
                previous_valid_from
            );
            return InstallOutcome::Stale;
        }

        info!(
            "Configuration valid_from={} superseded by valid_from={}",
            previous_valid_from,
            configuration.valid_from()
        );
        self.configuration = Some(Arc::new(configuration));
        self.last_reported = None;
        InstallOutcome::Superseded { previous_valid_from }
    }

    /// Begin a new attribution window. Everything recorded so far is dropped.
    pub fn start_new_window(&mut self, now: DateTime<Utc>) -> WindowId {
        let window = AttributionWindow::new(now);
        let id = window.id;
        info!("Starting attribution window {} at {}", id, now);
        self.window = Some(window);
        self.accumulator.reset();
        self.last_reported = None;
        self.is_finalized = false;
        id
    }

    /// Record an app event. Returns true when the recorded state changed.
    ///
    /// Events the configuration does not reference, or whose own parameters
    /// fail the matching rule, are ignored. In CPAS mode
    /// the value is replaced by the in-segment value of `fb_content`.
    pub fn record_event(
        &mut self,
        event_name: &str,
        currency: Option<&str>,
        value: Option<f64>,
        params: Option<&EventParameters>,
    ) -> bool {
        let configuration = match (&self.configuration, &self.window) {
            (Some(configuration), Some(_)) if !self.is_finalized => Arc::clone(configuration),
            _ => return false,
        };
        if !configuration.is_reporting_event(event_name) {
            return false;
        }

        let processed = processed_parameters(params);
        if let Some(rule) = configuration.matching_rule() {
            if !rule.is_matched(processed.as_ref()) {
                debug!("Dropping {}: parameters fail the matching rule", event_name);
                return false;
            }
        }
        let currency = configuration.resolve_currency(currency);
        let value = if configuration.mode() == ConfigMode::Cpas {
            Some(in_segment_value(processed.as_ref(), configuration.matching_rule()))
        } else {
            value
        };

        let mut changed = self
            .accumulator
            .record(event_name, value.map(|value| (currency, value)));
        if let Some(processed) = &processed {
            changed |= self.accumulator.record_parameters(processed);
        }
        if configuration.matching_rule().is_some() {
            changed |= self.accumulator.mark_rule_matched();
        }

        debug!("Recorded {} (changed: {})", event_name, changed);
        changed
    }

    /// Run the selector and return a postback when there is something new to
    /// report. A result identical to the last reported one, or one with a
    /// lower priority, is suppressed unless it is final.
    pub fn evaluate(&mut self, now: DateTime<Utc>) -> Option<Postback> {
        if self.is_finalized {
            return None;
        }
        let configuration = self.configuration.as_ref()?;
        let window = self.window.as_mut()?;

        let result = self.selector.select(configuration, &self.accumulator, window, now);

        if result.is_final && !result.is_eligible {
            info!("Window {} closed without an eligible value", window.id);
            self.is_finalized = true;
            return None;
        }
        if !result.should_report() {
            return None;
        }

        if let Some(last) = &self.last_reported {
            if *last == result {
                return None;
            }
            let regressed = matches!(
                (last.priority, result.priority),
                (Some(previous), Some(current)) if current < previous
            ) || (last.conversion_value.is_some() && result.conversion_value.is_none());
            if regressed && !result.is_final {
                debug!("Suppressing lower priority selection for window {}", window.id);
                return None;
            }
        }

        let value_changed = self.last_reported.as_ref().map_or(true, |last| {
            last.conversion_value != result.conversion_value
                || last.coarse_value != result.coarse_value
        });
        if value_changed && (result.conversion_value.is_some() || result.coarse_value.is_some()) {
            window.last_conversion_at = Some(now);
        }

        let postback = Postback::from_selection(window.id, &result);
        if result.is_final {
            info!("Final postback for window {}", window.id);
            self.is_finalized = true;
        }
        self.last_reported = Some(result);
        Some(postback)
    }

    // ========================================================================
    // PERSISTENCE
    // ========================================================================

    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            configuration: self.configuration.as_ref().map(|c| c.to_json()),
            accumulator: self.accumulator.clone(),
            window: self.window.clone(),
            last_reported: self.last_reported.clone(),
            is_finalized: self.is_finalized,
        }
    }

    /// Replace the current state with a snapshot. On error nothing changes.
    pub fn restore(&mut self, snapshot: ContextSnapshot) -> Result<(), ConfigurationError> {
        let configuration = snapshot
            .configuration
            .as_ref()
            .map(|value| Configuration::from_json_with(value, &self.factory))
            .transpose()?;

        self.configuration = configuration.map(Arc::new);
        self.accumulator = snapshot.accumulator;
        self.window = snapshot.window;
        self.last_reported = snapshot.last_reported;
        self.is_finalized = snapshot.is_finalized;
        Ok(())
    }
}
