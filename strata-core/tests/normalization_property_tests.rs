//! Property tests for the record merge algebra and response normalization.

use proptest::prelude::*;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use strata_core::{
    CacheKeyBuilder, DefaultCacheKeyBuilder, FieldType, FieldValue, NoKeyResolver, Record,
    RecordSet, ResponseField, ResponseNormalizer, Variables,
};

fn arb_scalar() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| json!(n)),
        "[a-zA-Z0-9 ]{0,12}".prop_map(Value::String),
    ]
}

fn arb_field_value() -> impl Strategy<Value = FieldValue> {
    prop_oneof![
        arb_scalar().prop_map(FieldValue::from_scalar_json),
        "[a-z]{1,4}(\\.[0-9])?".prop_map(FieldValue::reference),
        prop::collection::vec(arb_scalar().prop_map(FieldValue::from_scalar_json), 0..4)
            .prop_map(FieldValue::List),
    ]
}

fn arb_record() -> impl Strategy<Value = Record> {
    (
        "[a-z]{1,3}",
        prop::collection::btree_map("[a-z]{1,6}", arb_field_value(), 0..6),
    )
        .prop_map(|(key, fields)| {
            fields
                .into_iter()
                .fold(Record::builder(key), |b, (k, v)| b.field(k, v))
                .build()
        })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Property: merging the same records a second time changes nothing.
    #[test]
    fn prop_second_merge_reports_no_changes(records in prop::collection::vec(arb_record(), 1..8)) {
        let mut set = RecordSet::new();
        for record in records.clone() {
            set.merge(record);
        }
        for record in records {
            prop_assert!(set.merge(record).is_empty());
        }
    }

    /// Property: every reported change names a field the incoming record carries.
    #[test]
    fn prop_changes_are_subset_of_incoming_fields(base in arb_record(), incoming in arb_record()) {
        let incoming = incoming
            .fields()
            .iter()
            .fold(Record::builder(base.key()), |b, (k, v)| b.field(k.clone(), v.clone()))
            .build();
        let mut merged = base.clone();
        let changed = merged.merge_from(&incoming);
        for key in &changed {
            prop_assert!(incoming.field_keys().contains(key));
        }
    }

    /// Property: argument declaration order never changes a field's cache key.
    #[test]
    fn prop_cache_key_ignores_argument_order(
        args in prop::collection::btree_map("[a-z]{1,5}", any::<i32>(), 1..6)
    ) {
        let mut forward = Map::new();
        for (k, v) in &args {
            forward.insert(k.clone(), json!(v));
        }
        let mut backward = Map::new();
        for (k, v) in args.iter().rev() {
            backward.insert(k.clone(), json!(v));
        }
        let a = ResponseField::object("hero", vec![]).arguments(Value::Object(forward));
        let b = ResponseField::object("hero", vec![]).arguments(Value::Object(backward));
        let vars = Variables::new();
        prop_assert_eq!(
            DefaultCacheKeyBuilder.build(&a, &vars),
            DefaultCacheKeyBuilder.build(&b, &vars)
        );
    }

    /// Property: every written field appears in the dependent key set.
    #[test]
    fn prop_written_fields_are_dependent_keys(
        names in prop::collection::vec(prop::option::of("[a-zA-Z ]{0,10}"), 0..6)
    ) {
        let selections = vec![
            ResponseField::object_list("characters", vec![ResponseField::scalar("name")]),
            ResponseField::list("tags", FieldType::Scalar),
        ];
        let characters: Vec<Value> = names
            .iter()
            .map(|n| json!({ "name": n }))
            .collect();
        let data = json!({ "characters": characters, "tags": names });
        let normalizer = ResponseNormalizer::new(Arc::new(NoKeyResolver), Arc::new(DefaultCacheKeyBuilder));
        let out = normalizer
            .normalize("QUERY_ROOT", &selections, &Variables::new(), data.as_object().unwrap())
            .unwrap();

        prop_assert_eq!(out.records.len(), names.len() + 1);
        for record in out.records.records() {
            prop_assert!(out.dependent_keys.contains(record.key()));
            for key in record.field_keys() {
                prop_assert!(out.dependent_keys.contains(&key));
            }
        }
    }
}
