// Event parameter preprocessing before rule matching.

use serde_json::Value;

use crate::match_rule::{EventParameters, MatchRule};

pub const CONTENT_KEY: &str = "fb_content";
pub const CONTENT_ID_KEY: &str = "fb_content_id";
pub const ITEM_PRICE_KEY: &str = "item_price";
pub const QUANTITY_KEY: &str = "quantity";

/// Decode `fb_content` and `fb_content_id` when the logger delivered them as
/// JSON-encoded arrays or objects. Anything else is left untouched.
pub fn processed_parameters(params: Option<&EventParameters>) -> Option<EventParameters> {
    let mut processed = params?.clone();

    for key in [CONTENT_KEY, CONTENT_ID_KEY] {
        let decoded = processed
            .get(key)
            .and_then(Value::as_str)
            .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
            .filter(|decoded| decoded.is_array() || decoded.is_object());
        if let Some(decoded) = decoded {
            processed.insert(key.to_string(), decoded);
        }
    }

    Some(processed)
}

/// Value of the `fb_content` items that belong to the advertiser's segment:
/// the sum of `item_price * quantity` over items the matching rule accepts.
/// Missing quantity counts as 1, missing price as 0. Without a matching rule
/// every item counts.
pub fn in_segment_value(
    params: Option<&EventParameters>,
    matching_rule: Option<&MatchRule>,
) -> f64 {
    let items = match params.and_then(|p| p.get(CONTENT_KEY)).and_then(Value::as_array) {
        Some(items) => items,
        None => return 0.0,
    };

    items
        .iter()
        .filter(|item| item.is_object())
        .filter(|item| match matching_rule {
            None => true,
            Some(rule) => {
                let mut single = EventParameters::new();
                single.insert(CONTENT_KEY.to_string(), Value::Array(vec![(*item).clone()]));
                rule.is_matched(Some(&single))
            }
        })
        .map(|item| {
            let price = item.get(ITEM_PRICE_KEY).and_then(Value::as_f64).unwrap_or(0.0);
            let quantity = item.get(QUANTITY_KEY).and_then(Value::as_f64).unwrap_or(1.0);
            price * quantity
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule_factory::RuleFactory;
    use serde_json::json;

    fn params(value: Value) -> EventParameters {
        value.as_object().cloned().unwrap()
    }

    fn content_rule() -> MatchRule {
        RuleFactory::from_value(&json!({
            "or": [{"fb_content[*].id": {"eq": "12345"}}]
        }))
        .unwrap()
    }

    #[test]
    fn test_processed_parameters_decodes_content() {
        let raw = params(json!({
            "fb_content": r#"[{"id": "123", "quantity": 2}]"#,
            "fb_content_id": r#"["123", "456"]"#,
            "fb_currency": "USD"
        }));
        let processed = processed_parameters(Some(&raw)).unwrap();
        assert_eq!(processed["fb_content"], json!([{"id": "123", "quantity": 2}]));
        assert_eq!(processed["fb_content_id"], json!(["123", "456"]));
        assert_eq!(processed["fb_currency"], json!("USD"));
    }

    #[test]
    fn test_processed_parameters_keeps_undecodable() {
        let raw = params(json!({"fb_content_id": "12345", "fb_content": [{"id": "1"}]}));
        let processed = processed_parameters(Some(&raw)).unwrap();
        assert_eq!(processed, raw);
        assert!(processed_parameters(None).is_none());
    }

    #[test]
    fn test_in_segment_value() {
        let value = params(json!({
            "fb_content": [
                {"id": "12345", "item_price": 10, "quantity": 2},
                {"id": "12345", "item_price": 100, "quantity": 3},
                {"id": "testing", "item_price": 100, "quantity": 2}
            ]
        }));
        assert_eq!(in_segment_value(Some(&value), Some(&content_rule())), 320.0);
        assert_eq!(in_segment_value(Some(&value), None), 520.0);
    }

    #[test]
    fn test_in_segment_value_defaults() {
        let no_price = params(json!({"fb_content": [{"id": "12345", "quantity": 2}]}));
        assert_eq!(in_segment_value(Some(&no_price), Some(&content_rule())), 0.0);

        let no_quantity = params(json!({"fb_content": [{"id": "12345", "item_price": 100}]}));
        assert_eq!(in_segment_value(Some(&no_quantity), Some(&content_rule())), 100.0);
    }

    #[test]
    fn test_in_segment_value_without_content() {
        assert_eq!(in_segment_value(None, Some(&content_rule())), 0.0);
        let value = params(json!({"fb_content": "not an array"}));
        assert_eq!(in_segment_value(Some(&value), None), 0.0);
    }
}
