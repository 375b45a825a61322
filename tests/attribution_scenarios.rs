// End-to-end attribution flows through the public API.

use aem_engine::{
    AttributionContext, AttributionSelector, AttributionWindow, CoarseValue, Configuration,
    ConfigurationFetcher, ConfigurationRefresher, EngineConfig, EventAccumulator, EventParameters,
    FetchError, InstallOutcome, JsonFileSnapshotStore, RuleFactory, RuleOperator, SingleEntryRule,
    SnapshotStore, ValueMergePolicy,
};
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::{json, Value};
use std::sync::Arc;

fn install_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 9, 30, 0).unwrap()
}

fn params(value: Value) -> EventParameters {
    value.as_object().cloned().unwrap()
}

fn purchase_config() -> Configuration {
    Configuration::from_json(&json!({
        "cutoff_time": 1,
        "conversion_value_rules": [
            {"conversion_value": 10, "priority": 1, "events": [{"event_name": "Purchase"}]}
        ]
    }))
    .unwrap()
}

#[test]
fn test_recorded_event_selects_its_rule() {
    let mut accumulator = EventAccumulator::default();
    accumulator.record_event("Purchase");
    let window = AttributionWindow::new(install_time());

    let result = AttributionSelector::default().select(
        &purchase_config(),
        &accumulator,
        &window,
        install_time() + Duration::hours(2),
    );
    assert_eq!(result.conversion_value, Some(10));
}

#[test]
fn test_empty_window_past_cutoff_is_final_without_value() {
    let window = AttributionWindow::new(install_time());
    let result = AttributionSelector::default().select(
        &purchase_config(),
        &EventAccumulator::default(),
        &window,
        install_time() + Duration::days(1),
    );
    assert_eq!(result.conversion_value, None);
    assert!(result.is_final);
}

#[test]
fn test_priority_beats_payload_order() {
    let config = Configuration::from_json(&json!({
        "cutoff_time": 1,
        "conversion_value_rules": [
            {"conversion_value": 5, "priority": 5, "events": [{"event_name": "Purchase"}]},
            {"conversion_value": 10, "priority": 10, "events": [{"event_name": "Purchase"}]}
        ]
    }))
    .unwrap();
    let mut accumulator = EventAccumulator::default();
    accumulator.record_event("Purchase");

    let result = AttributionSelector::default().select(
        &config,
        &accumulator,
        &AttributionWindow::new(install_time()),
        install_time(),
    );
    assert_eq!(result.priority, Some(10));
    assert_eq!(result.conversion_value, Some(10));
}

#[test]
fn test_negated_rule_on_absent_key_does_not_match() {
    let rule =
        SingleEntryRule::linguistic(RuleOperator::NotContains, "fb_content_id", "abc").unwrap();
    assert!(!rule.is_matched(Some(&EventParameters::new())));
}

#[test]
fn test_is_any_case_variants() {
    let value = params(json!({"category": "B"}));
    let sensitive = json!({"category": {"is_any": ["a", "b"]}});
    let insensitive = json!({"category": {"i_is_any": ["a", "b"]}});
    let sensitive = RuleFactory::from_value(&sensitive).unwrap();
    let insensitive = RuleFactory::from_value(&insensitive).unwrap();
    assert!(!sensitive.is_matched(Some(&value)));
    assert!(insensitive.is_matched(Some(&value)));
}

#[test]
fn test_full_lifecycle_with_persistence() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(JsonFileSnapshotStore::new(dir.path().join("attribution.json")));

    let fetcher: Arc<dyn ConfigurationFetcher> = Arc::new(|| -> Result<Value, FetchError> {
        Ok(json!({"data": [{
            "valid_from": 1717200000,
            "cutoff_time": 2,
            "default_currency": "usd",
            "business_id": "1234",
            "param_rule": "{\"or\":[{\"fb_content[*].id\":{\"i_starts_with\":\"shoe-\"}}]}",
            "conversion_value_rules": [
                {"conversion_value": 30, "priority": 30, "events": [{
                    "event_name": "fb_mobile_purchase",
                    "values": [{"currency": "USD", "amount": 200}]
                }]},
                {"conversion_value": 12, "priority": 12, "events": [
                    {"event_name": "fb_mobile_add_to_cart"},
                    {"event_name": "fb_mobile_purchase"}
                ]},
                {"conversion_value": 3, "priority": 3, "events": [
                    {"event_name": "fb_mobile_add_to_cart"}
                ]}
            ]
        }]}))
    });

    let context = AttributionContext::new(EngineConfig::default()).unwrap().shared();
    let refresher =
        ConfigurationRefresher::new(fetcher, Arc::clone(&context)).with_store(store.clone());
    assert_eq!(refresher.refresh().unwrap().outcome, InstallOutcome::Installed);

    let shoe = params(json!({"fb_content": "[{\"id\": \"SHOE-42\"}]"}));
    {
        let mut ctx = context.lock();
        ctx.start_new_window(install_time());
        assert!(ctx.record_event("fb_mobile_add_to_cart", None, None, Some(&shoe)));
        let first = ctx.evaluate(install_time() + Duration::minutes(5)).unwrap();
        assert_eq!(first.conversion_value, Some(3));

        let hat = params(json!({"fb_content": [{"id": "hat-7"}]}));
        assert!(!ctx.record_event("fb_mobile_purchase", Some("usd"), Some(500.0), Some(&hat)));
        ctx.record_event("fb_mobile_purchase", Some("usd"), Some(80.0), Some(&shoe));
        let second = ctx.evaluate(install_time() + Duration::minutes(10)).unwrap();
        assert_eq!(second.conversion_value, Some(12));
    }
    refresher.persist().unwrap();

    let restored = AttributionContext::new(EngineConfig::default()).unwrap().shared();
    let fetcher: Arc<dyn ConfigurationFetcher> = Arc::new(|| -> Result<Value, FetchError> {
        Err(FetchError::Transport("offline".to_string()))
    });
    let second_launch =
        ConfigurationRefresher::new(fetcher, Arc::clone(&restored)).with_store(store.clone());
    assert!(second_launch.restore_from_store().unwrap());
    assert!(second_launch.refresh().is_err());

    let mut ctx = restored.lock();
    assert_eq!(ctx.configuration().unwrap().business_id(), Some("1234"));
    ctx.record_event("fb_mobile_purchase", Some("USD"), Some(250.0), Some(&shoe));
    let third = ctx.evaluate(install_time() + Duration::minutes(20)).unwrap();
    assert_eq!(third.conversion_value, Some(30));

    let last = ctx.evaluate(install_time() + Duration::days(2)).unwrap();
    assert!(last.is_final);
    assert_eq!(last.conversion_value, Some(30));
    assert!(store.load().unwrap().is_some());
}

#[test]
fn test_skan_running_totals_and_coarse_values() {
    let engine = EngineConfig::new().with_value_merge_policy(ValueMergePolicy::Sum);
    let mut context = AttributionContext::new(engine).unwrap();
    let config = Configuration::from_graph_response(&json!({"data": [{
        "cutoff_time": 2,
        "conversion_value_rules": [
            {"conversion_value": 3, "events": [{
                "event_name": "fb_mobile_purchase",
                "values": [{"currency": "USD", "amount": 300}]
            }]},
            {"conversion_value": 1, "events": [{"event_name": "fb_mobile_purchase"}]}
        ],
        "coarse_cv_configs": [{
            "postback_sequence_index": 1,
            "coarse_cv_rules": [
                {"coarse_cv_value": "medium", "events": [{"event_name": "fb_mobile_purchase"}]},
                {"coarse_cv_value": "high", "events": [{
                    "event_name": "fb_mobile_purchase",
                    "values": [{"currency": "USD", "amount": 300}]
                }]}
            ]
        }]
    }]}))
    .unwrap();
    assert_eq!(context.install_configuration(config), InstallOutcome::Installed);
    context.start_new_window(install_time());

    context.record_event("fb_mobile_purchase", Some("USD"), Some(100.0), None);
    let first = context.evaluate(install_time() + Duration::hours(1)).unwrap();
    assert_eq!(first.conversion_value, Some(1));
    assert_eq!(first.coarse_value, Some(CoarseValue::Medium));
    assert_eq!(first.postback_sequence_index, Some(1));

    context.record_event("fb_mobile_purchase", Some("USD"), Some(201.0), None);
    assert_eq!(context.accumulator().value_for("fb_mobile_purchase", "USD"), Some(301.0));
    let second = context.evaluate(install_time() + Duration::hours(2)).unwrap();
    assert_eq!(second.conversion_value, Some(3));
    assert_eq!(second.coarse_value, Some(CoarseValue::High));
}
