//! Property tests for the document and encryption primitives.

use promptdesk_config::document;
use promptdesk_config::{CryptoService, EncryptionMethod, MasterKeySource, MigrationEngine};
use proptest::prelude::*;
use secrecy::SecretString;
use serde_json::{Map, Value, json};

fn crypto_in(dir: &std::path::Path, method: EncryptionMethod) -> CryptoService {
    let mut service = CryptoService::new(dir.join("keys"), method).with_iterations(1_000);
    service
        .initialize_master_key(&MasterKeySource::Password(SecretString::from(
            "orchard-gate-42",
        )))
        .expect("master key initializes");
    service
}

fn json_leaf() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| json!(n)),
        "[a-z]{0,8}".prop_map(Value::String),
    ]
}

fn json_value() -> impl Strategy<Value = Value> {
    json_leaf().prop_recursive(3, 16, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::btree_map("[a-z]{1,4}", inner, 0..4)
                .prop_map(|entries| Value::Object(entries.into_iter().collect())),
        ]
    })
}

fn json_object() -> impl Strategy<Value = Map<String, Value>> {
    prop::collection::btree_map("[a-z]{1,4}", json_value(), 0..5)
        .prop_map(|entries| entries.into_iter().collect())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_aes_roundtrips_non_json_strings(text in "[ -~]{0,64}") {
        // Strings that themselves parse as JSON intentionally come back as
        // the parsed value, so they are excluded here.
        prop_assume!(serde_json::from_str::<Value>(&text).is_err());

        let dir = tempfile::tempdir().unwrap();
        let crypto = crypto_in(dir.path(), EncryptionMethod::AesGcm);

        let original = Value::String(text);
        let encrypted = crypto.encrypt_value(&original).unwrap();
        prop_assert_eq!(crypto.decrypt_value(&encrypted).unwrap(), original);
    }

    #[test]
    fn prop_aes_roundtrips_structured_values(value in json_value()) {
        prop_assume!(!value.is_string());

        let dir = tempfile::tempdir().unwrap();
        let crypto = crypto_in(dir.path(), EncryptionMethod::AesGcm);

        let encrypted = crypto.encrypt_value(&value).unwrap();
        prop_assert_eq!(crypto.decrypt_value(&encrypted).unwrap(), value);
    }

    #[test]
    fn prop_obfuscation_roundtrips_structured_values(value in json_value()) {
        prop_assume!(!value.is_string());

        let dir = tempfile::tempdir().unwrap();
        let crypto = crypto_in(dir.path(), EncryptionMethod::Obfuscated);

        let encrypted = crypto.encrypt_value(&value).unwrap();
        prop_assert_eq!(crypto.decrypt_value(&encrypted).unwrap(), value);
    }
}

proptest! {
    #[test]
    fn prop_deep_merge_keys_are_the_union(base in json_object(), overlay in json_object()) {
        let mut merged = base.clone();
        document::deep_merge(&mut merged, overlay.clone());

        for key in base.keys().chain(overlay.keys()) {
            prop_assert!(merged.contains_key(key), "missing key '{key}'");
        }
        // Keys the overlay omits keep their base values.
        for (key, base_value) in &base {
            if !overlay.contains_key(key) {
                prop_assert_eq!(&merged[key], base_value);
            }
        }
        for key in merged.keys() {
            prop_assert!(
                base.contains_key(key) || overlay.contains_key(key),
                "invented key '{key}'"
            );
        }
    }

    #[test]
    fn prop_deep_merge_overlay_wins_outside_object_pairs(
        base in json_object(),
        overlay in json_object(),
    ) {
        let mut merged = base.clone();
        document::deep_merge(&mut merged, overlay.clone());

        for (key, overlay_value) in &overlay {
            let both_objects =
                base.get(key).is_some_and(Value::is_object) && overlay_value.is_object();
            if !both_objects {
                prop_assert_eq!(&merged[key], overlay_value);
            }
        }
    }

    #[test]
    fn prop_deep_merge_is_idempotent(base in json_object(), overlay in json_object()) {
        let mut merged = base;
        document::deep_merge(&mut merged, overlay.clone());

        let mut again = merged.clone();
        document::deep_merge(&mut again, overlay);
        prop_assert_eq!(again, merged);
    }

    #[test]
    fn prop_set_path_then_get_path_returns_the_value(
        segments in prop::collection::vec("[a-z]{1,3}", 1..4),
        value in json_value(),
    ) {
        let dotted = segments.join(".");
        let mut root = Map::new();
        document::set_path(&mut root, &dotted, value.clone());
        let doc = Value::Object(root);
        prop_assert_eq!(document::get_path(&doc, &dotted), Some(&value));
    }
}

proptest! {
    #[test]
    fn prop_migration_is_deterministic_and_idempotent(extra in json_object()) {
        let engine = MigrationEngine::new();
        // Generated keys are at most four characters, so they can never
        // collide with the keys the migration reads or writes.
        let mut doc = extra;
        doc.insert(
            "api_settings".to_string(),
            json!({"openai": {"api_key": "sk-seed", "enabled": true}}),
        );

        let first = engine
            .migrate_section("llm", doc.clone(), Some("0.9.0"))
            .unwrap();
        let second = engine.migrate_section("llm", doc, Some("0.9.0")).unwrap();
        prop_assert_eq!(&first.data, &second.data);
        prop_assert_eq!(&first.applied, &second.applied);

        // Migrating the already-migrated document is a pass-through.
        let again = engine
            .migrate_section("llm", first.data.clone(), Some("1.0.0"))
            .unwrap();
        prop_assert!(again.applied.is_empty());
        prop_assert_eq!(again.data, first.data);
    }
}

#[test]
fn test_json_shaped_strings_reparse_on_decrypt() {
    let dir = tempfile::tempdir().unwrap();
    let crypto = crypto_in(dir.path(), EncryptionMethod::AesGcm);

    let encrypted = crypto
        .encrypt_value(&Value::String("123".to_string()))
        .unwrap();
    assert_eq!(crypto.decrypt_value(&encrypted).unwrap(), json!(123));
}
