//! Property tests for draft change tracking.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use serde_json::Value;
use tessera_core::{EntityType, Fields, SystemClock};
use tessera_storage::{InMemoryPersistentStore, ResilientStore};
use tessera_sync::DraftStore;
use tessera_test_utils::generators::{arb_field_name, arb_record, arb_value};

fn draft_store() -> DraftStore {
    DraftStore::new(
        ResilientStore::new(Arc::new(InMemoryPersistentStore::new())),
        Arc::new(SystemClock),
        256,
        Duration::from_secs(3600),
    )
}

fn block_on<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap()
        .block_on(future)
}

fn value_of(fields: &BTreeMap<String, Value>, field: &str) -> Value {
    fields.get(field).cloned().unwrap_or(Value::Null)
}

fn arb_edits() -> impl Strategy<Value = Vec<(String, Value)>> {
    prop::collection::vec((arb_field_name(), arb_value()), 0..24)
}

proptest! {
    /// The diff is exactly the fields whose value moved off the baseline.
    #[test]
    fn prop_changes_match_baseline_diff(record in arb_record(), edits in arb_edits()) {
        let entity_type = EntityType::new("project");
        let store = draft_store();
        let baseline: BTreeMap<String, Value> = record.fields.clone().into_iter().collect();

        let changes = block_on(async {
            store.start_edit(&entity_type, &record).await;
            for (field, value) in &edits {
                store
                    .update_field(&entity_type, &record.id, field, value.clone())
                    .await
                    .unwrap();
            }
            store.get_changes(&entity_type, &record.id).unwrap()
        });

        let mut current = baseline.clone();
        for (field, value) in edits {
            current.insert(field, value);
        }
        let expected: Fields = current
            .keys()
            .filter(|field| value_of(&current, field) != value_of(&baseline, field))
            .map(|field| (field.clone(), value_of(&current, field)))
            .collect();
        prop_assert_eq!(changes, expected);
    }

    /// Editing and then restoring every touched field leaves nothing to save.
    #[test]
    fn prop_edit_then_revert_is_clean(record in arb_record(), edits in arb_edits()) {
        let entity_type = EntityType::new("project");
        let store = draft_store();

        let changes = block_on(async {
            store.start_edit(&entity_type, &record).await;
            for (field, value) in &edits {
                store
                    .update_field(&entity_type, &record.id, field, value.clone())
                    .await
                    .unwrap();
            }
            for (field, _) in &edits {
                let original = record.get(field).cloned().unwrap_or(Value::Null);
                store
                    .update_field(&entity_type, &record.id, field, original)
                    .await
                    .unwrap();
            }
            store.get_changes(&entity_type, &record.id).unwrap()
        });

        prop_assert!(changes.is_empty(), "leftover changes: {:?}", changes);
    }

    /// Undoing every step walks the draft back to its baseline.
    #[test]
    fn prop_full_undo_restores_baseline(record in arb_record(), edits in arb_edits()) {
        let entity_type = EntityType::new("project");
        let store = draft_store();

        let draft = block_on(async {
            store.start_edit(&entity_type, &record).await;
            for (field, value) in &edits {
                store
                    .update_field(&entity_type, &record.id, field, value.clone())
                    .await
                    .unwrap();
            }
            while store.undo(&entity_type, &record.id).await.is_ok() {}
            store.get(&entity_type, &record.id).unwrap()
        });

        prop_assert!(!draft.is_dirty());
        prop_assert!(draft.history.is_empty());
        for (field, value) in &record.fields {
            prop_assert_eq!(draft.current.get(field), Some(value));
        }
    }
}
