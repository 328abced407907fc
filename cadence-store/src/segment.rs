//! Segment predicate evaluation.
//!
//! A segment is an ordered conjunction of `(field, operator, value)`
//! conditions. The in-memory backend evaluates them here; the Postgres
//! backend compiles them to a parameterized `WHERE` clause with the same
//! semantics. `custom.<key>` dereferences the subscriber's JSON fields.

use cadence_common::audience::{ConditionOperator, SegmentCondition, Subscriber, SubscriberStatus};

/// Resolve a condition field against a subscriber.
///
/// Returns `None` when the field is absent (e.g. a custom key the
/// subscriber never set), which only `is_empty` treats as a match.
fn field_value(subscriber: &Subscriber, field: &str) -> Option<String> {
    if let Some(key) = field.strip_prefix("custom.") {
        return subscriber.custom_fields.get(key).map(json_as_text);
    }

    match field {
        "email" => Some(subscriber.email.as_str().to_string()),
        "name" => subscriber.name.clone(),
        "status" => Some(
            match subscriber.status {
                SubscriberStatus::Active => "active",
                SubscriberStatus::Unsubscribed => "unsubscribed",
                SubscriberStatus::Bounced => "bounced",
                SubscriberStatus::Complained => "complained",
            }
            .to_string(),
        ),
        "created_at" => Some(subscriber.created_at.to_rfc3339()),
        _ => None,
    }
}

fn json_as_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn condition_value_text(condition: &SegmentCondition) -> String {
    json_as_text(&condition.value)
}

/// Ordering comparison: numeric when both sides parse as numbers,
/// lexicographic otherwise.
fn compare(actual: &str, expected: &str) -> std::cmp::Ordering {
    match (actual.parse::<f64>(), expected.parse::<f64>()) {
        (Ok(a), Ok(b)) => a.partial_cmp(&b).unwrap_or(std::cmp::Ordering::Equal),
        _ => actual.cmp(expected),
    }
}

/// Whether `subscriber` satisfies a single condition.
#[must_use]
pub fn matches(subscriber: &Subscriber, condition: &SegmentCondition) -> bool {
    let actual = field_value(subscriber, &condition.field);
    let expected = condition_value_text(condition);

    match condition.operator {
        ConditionOperator::IsEmpty => actual.as_deref().is_none_or(str::is_empty),
        ConditionOperator::IsNotEmpty => actual.as_deref().is_some_and(|v| !v.is_empty()),
        _ => {
            let Some(actual) = actual else {
                // Absent fields fail every value comparison, including
                // the negative ones: there is nothing to compare.
                return matches!(condition.operator, ConditionOperator::NotEquals);
            };
            match condition.operator {
                ConditionOperator::Equals => actual == expected,
                ConditionOperator::NotEquals => actual != expected,
                ConditionOperator::Contains => actual.contains(&expected),
                ConditionOperator::NotContains => !actual.contains(&expected),
                ConditionOperator::StartsWith => actual.starts_with(&expected),
                ConditionOperator::EndsWith => actual.ends_with(&expected),
                ConditionOperator::GreaterThan => compare(&actual, &expected).is_gt(),
                ConditionOperator::LessThan => compare(&actual, &expected).is_lt(),
                ConditionOperator::GreaterOrEqual => compare(&actual, &expected).is_ge(),
                ConditionOperator::LessOrEqual => compare(&actual, &expected).is_le(),
                ConditionOperator::IsEmpty | ConditionOperator::IsNotEmpty => unreachable!(),
            }
        }
    }
}

/// Whether `subscriber` satisfies every condition of the segment.
#[must_use]
pub fn matches_all(subscriber: &Subscriber, conditions: &[SegmentCondition]) -> bool {
    conditions
        .iter()
        .all(|condition| matches(subscriber, condition))
}

/// Compile one condition to a SQL fragment.
///
/// Returns the fragment and the bound value (when the operator takes one);
/// `placeholder` is the 1-based parameter index to reference.
#[must_use]
pub fn condition_sql(condition: &SegmentCondition, placeholder: usize) -> (String, Option<String>) {
    let column = condition.field.strip_prefix("custom.").map_or_else(
        || match condition.field.as_str() {
            "email" | "name" | "status" => condition.field.clone(),
            "created_at" => "created_at::text".to_string(),
            // Unknown built-ins never match; keeps the clause well-formed.
            _ => "NULL".to_string(),
        },
        |key| format!("custom_fields->>'{}'", key.replace('\'', "''")),
    );

    let value = condition_value_text(condition);
    let param = format!("${placeholder}");

    match condition.operator {
        ConditionOperator::Equals => (format!("{column} = {param}"), Some(value)),
        ConditionOperator::NotEquals => (
            format!("({column} IS NULL OR {column} <> {param})"),
            Some(value),
        ),
        ConditionOperator::Contains => (
            format!("{column} LIKE '%' || {param} || '%'"),
            Some(value),
        ),
        ConditionOperator::NotContains => (
            format!("{column} NOT LIKE '%' || {param} || '%'"),
            Some(value),
        ),
        ConditionOperator::StartsWith => (format!("{column} LIKE {param} || '%'"), Some(value)),
        ConditionOperator::EndsWith => (format!("{column} LIKE '%' || {param}"), Some(value)),
        ConditionOperator::IsEmpty => (format!("({column} IS NULL OR {column} = '')"), None),
        ConditionOperator::IsNotEmpty => {
            (format!("({column} IS NOT NULL AND {column} <> '')"), None)
        }
        ConditionOperator::GreaterThan => (format!("{column} > {param}"), Some(value)),
        ConditionOperator::LessThan => (format!("{column} < {param}"), Some(value)),
        ConditionOperator::GreaterOrEqual => (format!("{column} >= {param}"), Some(value)),
        ConditionOperator::LessOrEqual => (format!("{column} <= {param}"), Some(value)),
    }
}

#[cfg(test)]
mod tests {
    use cadence_common::{
        EmailAddress,
        audience::{Subscriber, SubscriberStatus},
        ids::{OrgId, SubscriberId},
    };
    use chrono::Utc;

    use super::*;

    fn subscriber(email: &str, name: Option<&str>, custom: serde_json::Value) -> Subscriber {
        let serde_json::Value::Object(custom_fields) = custom else {
            panic!("custom fields must be an object");
        };
        Subscriber {
            id: SubscriberId::generate(),
            org_id: OrgId::generate(),
            email: EmailAddress::parse(email).unwrap(),
            name: name.map(str::to_string),
            status: SubscriberStatus::Active,
            list_ids: Vec::new(),
            custom_fields,
            created_at: Utc::now(),
        }
    }

    fn condition(field: &str, operator: ConditionOperator, value: serde_json::Value) -> SegmentCondition {
        SegmentCondition {
            field: field.to_string(),
            operator,
            value,
        }
    }

    #[test]
    fn string_operators() {
        let sub = subscriber("jane@example.com", Some("Jane"), serde_json::json!({}));

        assert!(matches(
            &sub,
            &condition("email", ConditionOperator::EndsWith, "@example.com".into())
        ));
        assert!(matches(
            &sub,
            &condition("name", ConditionOperator::StartsWith, "Ja".into())
        ));
        assert!(matches(
            &sub,
            &condition("email", ConditionOperator::Contains, "ane@".into())
        ));
        assert!(!matches(
            &sub,
            &condition("email", ConditionOperator::Equals, "other@example.com".into())
        ));
    }

    #[test]
    fn custom_field_lookup() {
        let sub = subscriber(
            "a@example.com",
            None,
            serde_json::json!({"plan": "pro", "score": 42}),
        );

        assert!(matches(
            &sub,
            &condition("custom.plan", ConditionOperator::Equals, "pro".into())
        ));
        assert!(matches(
            &sub,
            &condition(
                "custom.score",
                ConditionOperator::GreaterThan,
                serde_json::json!(10)
            )
        ));
        assert!(!matches(
            &sub,
            &condition(
                "custom.score",
                ConditionOperator::LessOrEqual,
                serde_json::json!(41.5)
            )
        ));
    }

    #[test]
    fn numeric_comparison_is_numeric_not_lexical() {
        let sub = subscriber("a@example.com", None, serde_json::json!({"age": 9}));
        // Lexically "9" > "10"; numerically it is not.
        assert!(!matches(
            &sub,
            &condition("custom.age", ConditionOperator::GreaterThan, serde_json::json!(10))
        ));
    }

    #[test]
    fn empty_and_missing_fields() {
        let sub = subscriber("a@example.com", None, serde_json::json!({}));

        assert!(matches(
            &sub,
            &condition("name", ConditionOperator::IsEmpty, serde_json::Value::Null)
        ));
        assert!(!matches(
            &sub,
            &condition("name", ConditionOperator::IsNotEmpty, serde_json::Value::Null)
        ));
        // Missing custom field: only not_equals succeeds.
        assert!(matches(
            &sub,
            &condition("custom.plan", ConditionOperator::NotEquals, "pro".into())
        ));
        assert!(!matches(
            &sub,
            &condition("custom.plan", ConditionOperator::Equals, "pro".into())
        ));
    }

    #[test]
    fn conjunction_requires_every_condition() {
        let sub = subscriber("a@example.com", Some("Ann"), serde_json::json!({"plan": "pro"}));
        let conditions = vec![
            condition("custom.plan", ConditionOperator::Equals, "pro".into()),
            condition("name", ConditionOperator::Equals, "Bob".into()),
        ];
        assert!(!matches_all(&sub, &conditions));
    }

    #[test]
    fn sql_fragments_reference_placeholders() {
        let (sql, value) = condition_sql(
            &condition("custom.plan", ConditionOperator::Equals, "pro".into()),
            3,
        );
        assert_eq!(sql, "custom_fields->>'plan' = $3");
        assert_eq!(value.as_deref(), Some("pro"));

        let (sql, value) = condition_sql(
            &condition("name", ConditionOperator::IsEmpty, serde_json::Value::Null),
            1,
        );
        assert_eq!(sql, "(name IS NULL OR name = '')");
        assert!(value.is_none());
    }
}
