//! Property-based tests (fuzzing) for the mirror's input handling.
//!
//! Uses proptest to generate random/malformed inputs and verify parsing,
//! naming and value coercion never panic, only return clean errors.
//!
//! Run with: `cargo test --test proptest_fuzz`

use std::collections::HashSet;
use std::time::Duration;

use proptest::prelude::*;
use serde_json::{json, Value};

use crm_mirror::schema::naming::{is_safe_ident, sanitize_ident, ColumnAllocator};
use crm_mirror::schema::types::{coerce, CellValue, ScalarKind, ValueShape};
use crm_mirror::{Notification, RetryConfig};

// =============================================================================
// Strategies for generating test data
// =============================================================================

/// Generate arbitrary JSON values (including invalid structures)
fn arbitrary_json_strategy() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| Value::Number(n.into())),
        any::<f64>().prop_map(|f| json!(f)),
        ".*".prop_map(Value::String),
    ];

    leaf.prop_recursive(
        4,  // depth
        64, // max nodes
        10, // items per collection
        |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..10).prop_map(Value::Array),
                prop::collection::hash_map(".*", inner, 0..10)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        },
    )
}

fn shape_strategy() -> impl Strategy<Value = ValueShape> {
    let kind = prop_oneof![
        Just(ScalarKind::Integer),
        Just(ScalarKind::Float),
        Just(ScalarKind::Boolean),
        Just(ScalarKind::Timestamp),
        Just(ScalarKind::Date),
        Just(ScalarKind::Text),
    ];
    prop_oneof![
        kind.clone().prop_map(ValueShape::Scalar),
        kind.prop_map(ValueShape::List),
        Just(ValueShape::Json),
    ]
}

/// Remote-looking field names: mostly `UF_CRM_*`, sometimes anything at all.
fn field_name_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        "UF_CRM_[A-Z0-9_]{1,20}",
        "[A-Za-z][A-Za-z0-9_ -]{0,80}",
        ".{0,100}",
    ]
}

// =============================================================================
// Column Naming Invariants
// =============================================================================

proptest! {
    /// Whatever the remote sends, the column name is a safe identifier
    #[test]
    fn prop_sanitized_names_are_safe(name in ".*") {
        let ident = sanitize_ident(&name);
        prop_assert!(is_safe_ident(&ident), "unsafe identifier {:?} from {:?}", ident, name);
    }

    /// Sanitizing is stable: a clean name maps to itself
    #[test]
    fn prop_sanitize_is_idempotent(name in "[A-Za-z0-9 _.-]{0,40}") {
        let once = sanitize_ident(&name);
        prop_assert_eq!(sanitize_ident(&once), once);
    }

    /// Names are case-insensitive
    #[test]
    fn prop_sanitize_ignores_ascii_case(name in "[A-Za-z0-9_]{1,40}") {
        prop_assert_eq!(sanitize_ident(&name), sanitize_ident(&name.to_ascii_uppercase()));
    }

    /// One table never gets two columns with the same name
    #[test]
    fn prop_allocator_never_repeats(names in prop::collection::vec(field_name_strategy(), 0..60)) {
        let mut allocator = ColumnAllocator::with_reserved();
        let mut seen: HashSet<String> = ["id", "raw_snapshot", "created_at", "updated_at"]
            .into_iter()
            .map(String::from)
            .collect();

        for name in &names {
            let column = allocator.allocate(name);
            prop_assert!(is_safe_ident(&column), "unsafe column {:?}", column);
            prop_assert!(seen.insert(column.clone()), "duplicate column {:?}", column);
        }
    }
}

// =============================================================================
// Notification Parsing Fuzz Tests
// =============================================================================

proptest! {
    /// Notification parsing should never panic on arbitrary JSON
    #[test]
    fn fuzz_notification_from_arbitrary_json(body in arbitrary_json_strategy()) {
        let _ = Notification::from_json(&body);
    }

    /// Form bodies are arbitrary bytes off the wire
    #[test]
    fn fuzz_notification_from_arbitrary_form(body in ".*") {
        let _ = Notification::from_form(&body);
    }

    /// Plausible events with junk ids parse or fail cleanly; a parse always has a positive id
    #[test]
    fn fuzz_notification_with_junk_id(
        event in prop_oneof![
            Just("ONCRMDEALUPDATE"),
            Just("ONCRMCONTACTADD"),
            Just("ONCRMLEADDELETE"),
            Just("ONCRMDYNAMICITEMUPDATE"),
        ],
        id in arbitrary_json_strategy(),
        entity_type in arbitrary_json_strategy(),
    ) {
        let body = json!({
            "event": event,
            "data": {"FIELDS": {"ID": id, "ENTITY_TYPE_ID": entity_type}},
        });
        if let Ok(notification) = Notification::from_json(&body) {
            prop_assert!(notification.entity_id > 0);
            prop_assert_eq!(notification.event_name.as_str(), event);
        }
    }

    /// Flat form keys carry the same information as nested JSON
    #[test]
    fn prop_form_and_json_agree(id in 1i64..1_000_000) {
        let form = format!("event=ONCRMDEALUPDATE&data%5BFIELDS%5D%5BID%5D={id}");
        let from_form = Notification::from_form(&form).unwrap();
        let from_json = Notification::from_json(&json!({
            "event": "ONCRMDEALUPDATE",
            "data": {"FIELDS": {"ID": id.to_string()}},
        }))
        .unwrap();

        prop_assert_eq!(from_form.entity_id, id);
        prop_assert_eq!(from_form.entity_key(), from_json.entity_key());
        prop_assert_eq!(from_form.action, from_json.action);
    }
}

// =============================================================================
// Value Coercion Fuzz Tests
// =============================================================================

proptest! {
    /// Coercion should never panic, only reject
    #[test]
    fn fuzz_coerce_arbitrary_values(value in arbitrary_json_strategy(), shape in shape_strategy()) {
        let _ = coerce(&value, shape);
    }

    /// Null always stores as NULL, whatever the column
    #[test]
    fn prop_null_is_always_null(shape in shape_strategy()) {
        prop_assert_eq!(coerce(&Value::Null, shape), Ok(CellValue::Null));
    }

    /// Text columns accept anything non-null
    #[test]
    fn prop_text_accepts_everything(value in arbitrary_json_strategy()) {
        prop_assume!(!value.is_null());
        let cell = coerce(&value, ValueShape::Scalar(ScalarKind::Text));
        prop_assert!(matches!(cell, Ok(CellValue::Text(_))));
    }

    /// Integers survive as strings, the way the API usually sends them
    #[test]
    fn prop_integer_strings_round_trip(n in any::<i32>()) {
        let cell = coerce(&json!(n.to_string()), ValueShape::Scalar(ScalarKind::Integer));
        prop_assert_eq!(cell, Ok(CellValue::Int(i64::from(n))));
    }

    /// Multi-valued and structured columns always hold valid JSON text
    #[test]
    fn prop_json_columns_hold_json(value in arbitrary_json_strategy(), list in any::<bool>()) {
        let shape = if list { ValueShape::List(ScalarKind::Text) } else { ValueShape::Json };
        match coerce(&value, shape) {
            Ok(CellValue::Null) => prop_assert!(value.is_null()),
            Ok(CellValue::Text(text)) => {
                prop_assert!(serde_json::from_str::<Value>(&text).is_ok(), "not JSON: {}", text);
            }
            other => prop_assert!(false, "unexpected cell {:?}", other),
        }
    }
}

// =============================================================================
// Retry Backoff Invariants
// =============================================================================

proptest! {
    /// Delays never shrink between attempts and never pass the cap
    #[test]
    fn prop_backoff_monotonic_and_capped(
        initial_ms in 1u64..10_000,
        max_ms in 1u64..600_000,
        factor in 1.0f64..4.0,
        attempts in 1usize..200,
    ) {
        let config = RetryConfig {
            max_retries: None,
            initial_delay: Duration::from_millis(initial_ms),
            max_delay: Duration::from_millis(max_ms),
            factor,
            jitter: 0.0,
        };

        let mut previous = Duration::ZERO;
        for attempt in 0..attempts {
            let delay = config.delay_for_attempt(attempt);
            prop_assert!(delay <= config.max_delay);
            prop_assert!(delay >= previous.min(config.max_delay));
            previous = delay;
        }
    }

    /// Jitter stays within its band around the base delay
    #[test]
    fn prop_jitter_bounded(attempt in 0usize..20, jitter in 0.0f64..0.5) {
        let config = RetryConfig {
            jitter,
            ..RetryConfig::remote()
        };
        let base = config.delay_for_attempt(attempt).as_secs_f64();
        let delay = config.jittered_delay(attempt).as_secs_f64();
        prop_assert!(delay >= base * (1.0 - jitter) - 1e-6);
        prop_assert!(delay <= base * (1.0 + jitter) + 1e-6);
    }

    /// The attempt cap is exact
    #[test]
    fn prop_allows_another_respects_cap(max in 1usize..50, attempts in 0usize..100) {
        let config = RetryConfig {
            max_retries: Some(max),
            ..RetryConfig::remote()
        };
        prop_assert_eq!(config.allows_another(attempts), attempts < max);
    }
}
