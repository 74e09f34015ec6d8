use serde_json::Value;

use crate::domain::workflow::{ConditionOperator, TriggerCondition, WorkflowTrigger};

/// Decides whether `trigger` fires for the given evaluation scope.
///
/// `event` is the event type being dispatched, if any. Manual and time-based
/// triggers always fire when asked; event-based triggers need a matching
/// event type and every condition to hold.
pub fn evaluate_trigger(trigger: &WorkflowTrigger, scope: &Value, event: Option<&str>) -> bool {
    match trigger {
        WorkflowTrigger::Manual | WorkflowTrigger::TimeBased { .. } => true,
        WorkflowTrigger::EventBased { event_type, conditions } => {
            event == Some(event_type.as_str()) && conditions_hold(conditions, scope)
        }
        WorkflowTrigger::ConditionBased { conditions } => conditions_hold(conditions, scope),
    }
}

pub fn conditions_hold(conditions: &[TriggerCondition], scope: &Value) -> bool {
    conditions.iter().all(|condition| evaluate_condition(condition, scope))
}

pub fn evaluate_condition(condition: &TriggerCondition, scope: &Value) -> bool {
    let actual = lookup(scope, &condition.field);
    let expected = &condition.value;

    match condition.operator {
        ConditionOperator::Exists => actual.is_some_and(|value| !value.is_null()),
        ConditionOperator::NotExists => actual.map_or(true, Value::is_null),
        ConditionOperator::Equals => actual.is_some_and(|value| values_equal(value, expected)),
        ConditionOperator::NotEquals => !actual.is_some_and(|value| values_equal(value, expected)),
        ConditionOperator::GreaterThan => {
            compare_numbers(actual, expected).is_some_and(|(left, right)| left > right)
        }
        ConditionOperator::LessThan => {
            compare_numbers(actual, expected).is_some_and(|(left, right)| left < right)
        }
        ConditionOperator::Contains => actual.is_some_and(|value| contains(value, expected)),
        ConditionOperator::NotContains => !actual.is_some_and(|value| contains(value, expected)),
    }
}

/// Resolves a dotted path (`customer.name`, `jobs.0.status`) inside `scope`.
pub fn lookup<'a>(scope: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = scope;
    for segment in path.split('.').filter(|segment| !segment.is_empty()) {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn values_equal(actual: &Value, expected: &Value) -> bool {
    match (as_number(actual), as_number(expected)) {
        (Some(left), Some(right)) => (left - right).abs() < f64::EPSILON,
        _ => match (actual, expected) {
            (Value::String(left), Value::String(right)) => left.eq_ignore_ascii_case(right),
            _ => actual == expected,
        },
    }
}

fn compare_numbers(actual: Option<&Value>, expected: &Value) -> Option<(f64, f64)> {
    Some((as_number(actual?)?, as_number(expected)?))
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::String(text) => match needle {
            Value::String(fragment) => text.to_lowercase().contains(&fragment.to_lowercase()),
            other => text.contains(&other.to_string()),
        },
        Value::Array(items) => items.iter().any(|item| values_equal(item, needle)),
        Value::Object(map) => needle.as_str().is_some_and(|key| map.contains_key(key)),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{evaluate_condition, evaluate_trigger, lookup};
    use crate::domain::workflow::{ConditionOperator, TriggerCondition, WorkflowTrigger};

    fn condition(field: &str, operator: ConditionOperator, value: serde_json::Value) -> TriggerCondition {
        TriggerCondition { field: field.to_string(), operator, value }
    }

    #[test]
    fn manual_and_time_based_triggers_always_fire() {
        let scope = json!({});
        assert!(evaluate_trigger(&WorkflowTrigger::Manual, &scope, None));
        assert!(evaluate_trigger(
            &WorkflowTrigger::TimeBased { schedule: "0 9 * * *".to_string(), frequency: None },
            &scope,
            None,
        ));
    }

    #[test]
    fn event_trigger_requires_matching_event_and_conditions() {
        let trigger = WorkflowTrigger::EventBased {
            event_type: "appointment.requested".to_string(),
            conditions: vec![condition("entities.date", ConditionOperator::Exists, json!(null))],
        };
        let scope = json!({ "entities": { "date": "tomorrow" } });

        assert!(evaluate_trigger(&trigger, &scope, Some("appointment.requested")));
        assert!(!evaluate_trigger(&trigger, &scope, Some("lead.captured")));
        assert!(!evaluate_trigger(&trigger, &scope, None));
        assert!(!evaluate_trigger(&trigger, &json!({}), Some("appointment.requested")));
    }

    #[test]
    fn operators_compare_against_fetched_field() {
        let scope = json!({
            "business": { "financials": { "overdue_invoice_count": 4, "revenue_30d": "1200.50" } },
            "customer": { "name": "Dana Reyes", "tags": ["vip", "repeat"] },
        });

        let cases = [
            (condition("customer.name", ConditionOperator::Equals, json!("dana reyes")), true),
            (condition("customer.name", ConditionOperator::NotEquals, json!("Sam")), true),
            (condition("business.financials.overdue_invoice_count", ConditionOperator::GreaterThan, json!(3)), true),
            (condition("business.financials.revenue_30d", ConditionOperator::LessThan, json!(1000)), false),
            (condition("customer.tags", ConditionOperator::Contains, json!("vip")), true),
            (condition("customer.name", ConditionOperator::NotContains, json!("reyes")), false),
            (condition("customer.phone", ConditionOperator::NotExists, json!(null)), true),
            (condition("customer.phone", ConditionOperator::GreaterThan, json!(1)), false),
        ];

        for (condition, expected) in cases {
            assert_eq!(evaluate_condition(&condition, &scope), expected, "{condition:?}");
        }
    }

    #[test]
    fn lookup_walks_objects_and_arrays() {
        let scope = json!({ "jobs": [{ "status": "open" }] });
        assert_eq!(lookup(&scope, "jobs.0.status"), Some(&json!("open")));
        assert_eq!(lookup(&scope, "jobs.1.status"), None);
    }
}
