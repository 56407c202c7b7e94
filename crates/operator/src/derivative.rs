//! Subset comparison between a desired object and the live one.
//!
//! `desired` is a derivative of `live` when every value it specifies is present and
//! equal in `live`. Unset values (`null`, `""`, `[]`, `{}`) match anything, so fields
//! the API server defaults never cause a write. Arrays match positionally against a
//! prefix of the live array.

use serde_json::Value;

pub fn is_derivative(desired: &Value, live: &Value) -> bool {
    if is_unset(desired) {
        return true;
    }
    match (desired, live) {
        (Value::Object(want), Value::Object(have)) => want
            .iter()
            .all(|(k, v)| is_unset(v) || have.get(k).is_some_and(|h| is_derivative(v, h))),
        (Value::Array(want), Value::Array(have)) => {
            want.len() <= have.len() && want.iter().zip(have).all(|(w, h)| is_derivative(w, h))
        }
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => desired == live,
    }
}

fn is_unset(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn extra_live_fields_are_ignored() {
        let desired = json!({"spec": {"replicas": 1, "template": {"spec": {"containers": [{"name": "nginx"}]}}}});
        let live = json!({"spec": {"replicas": 1, "progressDeadlineSeconds": 600,
            "template": {"spec": {"containers": [{"name": "nginx", "terminationMessagePath": "/dev/termination-log"}],
            "dnsPolicy": "ClusterFirst"}}}});
        assert!(is_derivative(&desired, &live));
        assert!(!is_derivative(&live, &desired));
    }

    #[test]
    fn changed_scalars_are_detected() {
        let desired = json!({"metadata": {"annotations": {"checksum/config": "b"}}});
        let live = json!({"metadata": {"annotations": {"checksum/config": "a"}}});
        assert!(!is_derivative(&desired, &live));
        assert!(!is_derivative(&json!({"replicas": 0}), &json!({"replicas": 2})));
        assert!(!is_derivative(&json!({"paused": false}), &json!({})));
    }

    #[test]
    fn unset_values_match_anything() {
        assert!(is_derivative(&json!({"labels": {}, "name": "", "args": [], "x": null}), &json!({"labels": {"a": "b"}})));
    }

    #[test]
    fn arrays_compare_as_prefix() {
        assert!(is_derivative(&json!([{"name": "a"}]), &json!([{"name": "a"}, {"name": "b"}])));
        assert!(!is_derivative(&json!([{"name": "a"}, {"name": "b"}]), &json!([{"name": "a"}])));
        assert!(!is_derivative(&json!([{"name": "b"}]), &json!([{"name": "a"}, {"name": "b"}])));
    }

    #[test]
    fn integer_and_float_forms_are_equal() {
        assert!(is_derivative(&json!({"mode": 420}), &json!({"mode": 420.0})));
    }

    fn leaf() -> impl Strategy<Value = Value> {
        prop_oneof![
            any::<bool>().prop_map(Value::from),
            any::<i32>().prop_map(Value::from),
            "[a-z]{1,6}".prop_map(Value::from),
        ]
    }

    fn value() -> impl Strategy<Value = Value> {
        leaf().prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::from),
                prop::collection::btree_map("[a-z]{1,4}", inner, 0..4)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        })
    }

    proptest! {
        #[test]
        fn every_value_is_its_own_derivative(v in value()) {
            prop_assert!(is_derivative(&v, &v));
        }

        #[test]
        fn adding_live_only_keys_keeps_derivative(
            desired in prop::collection::btree_map("[a-m]{1,4}", value(), 0..4),
            extra in prop::collection::btree_map("[n-z]{1,4}", value(), 0..4),
        ) {
            let want = Value::Object(desired.clone().into_iter().collect());
            let have = Value::Object(desired.into_iter().chain(extra).collect());
            prop_assert!(is_derivative(&want, &have));
        }
    }
}
