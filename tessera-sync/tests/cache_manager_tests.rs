//! End-to-end behaviour of the cache manager against scripted backends.

use std::sync::Arc;

use serde_json::json;
use tempfile::TempDir;
use tessera_core::{
    CacheKey, ChangeOperation, EntityType, FetchError, InvalidationEvent, ListParams, RecordId,
    ReconnectConfig,
};
use tessera_storage::{LmdbPersistentStore, PersistentStore, ReadSource};
use tessera_sync::{CacheContext, CacheManager, MutationState, PushMessage};
use tessera_test_utils::assertions::{
    assert_fresh, assert_miss, assert_not_found, assert_validation_error, field_of,
};
use tessera_test_utils::fixtures::{changes, project, test_config, three_project_lists};
use tessera_test_utils::{ManualClock, MockPushConnector, MockTransport, RawRecord};

fn project_type() -> EntityType {
    EntityType::new("project")
}

async fn settle() {
    for _ in 0..100 {
        tokio::task::yield_now().await;
    }
}

/// A manager whose three project lists all hold P1 in `Planning`.
async fn seeded() -> (Arc<CacheManager>, Arc<MockTransport>, Vec<CacheKey>) {
    let transport = MockTransport::new();
    let lists = three_project_lists();
    for key in &lists {
        transport.respond_page(key, &[project("P1", "Planning"), project("P2", "Planning")]);
    }
    let manager = CacheManager::create(CacheContext::new(test_config(), transport.clone())).unwrap();
    for key in &lists {
        manager.read(key).await.unwrap();
    }
    (manager, transport, lists)
}

#[tokio::test]
async fn test_optimistic_update_then_validation_rollback_across_three_lists() {
    let (manager, transport, lists) = seeded().await;
    let before: Vec<_> = lists
        .iter()
        .map(|key| manager.volatile().peek(key).unwrap().value)
        .collect();

    transport.hold_mutations();
    transport.reply_to_mutation(Err(FetchError::validation("stage is locked")));

    let entity_type = project_type();
    let id = RecordId::new("P1");
    let update = manager.update(&entity_type, &id, changes(&[("stage", json!("Execution"))]));
    let observe = async {
        transport.wait_for_mutations(1).await;
        for key in &lists {
            assert_eq!(
                field_of(&manager.get(key), "P1", "stage"),
                Some(json!("Execution"))
            );
        }
        transport.release_mutations();
    };
    let (result, ()) = tokio::join!(update, observe);

    assert_validation_error(&result);
    for (key, before) in lists.iter().zip(before) {
        assert_eq!(manager.volatile().peek(key).unwrap().value, before);
        assert_eq!(
            field_of(&manager.get(key), "P1", "stage"),
            Some(json!("Planning"))
        );
    }
    assert_eq!(manager.pending_mutations(), 0);
}

#[tokio::test]
async fn test_confirmed_update_is_consistent_across_views() {
    let (manager, transport, lists) = seeded().await;
    transport.reply_to_mutation(Ok(Some(
        project("P1", "Execution").with_field("updated_by", json!("server")),
    )));

    let outcome = manager
        .update(
            &project_type(),
            &RecordId::new("P1"),
            changes(&[("stage", json!("Execution"))]),
        )
        .await
        .unwrap();
    assert_eq!(outcome.state, MutationState::Confirmed);

    for key in &lists {
        let lookup = manager.get(key);
        assert_eq!(field_of(&lookup, "P1", "stage"), Some(json!("Execution")));
        assert_eq!(field_of(&lookup, "P1", "updated_by"), Some(json!("server")));
        assert_eq!(field_of(&lookup, "P2", "stage"), Some(json!("Planning")));
    }
}

#[tokio::test]
async fn test_concurrent_reads_are_deduplicated() {
    let transport = MockTransport::new();
    let key = CacheKey::list("project", &ListParams::page(50, 0));
    transport.respond_page(&key, &[project("P1", "Planning")]);
    transport.hold_fetches();
    let manager = CacheManager::create(CacheContext::new(test_config(), transport.clone())).unwrap();

    let reads = futures_util::future::join_all((0..8).map(|_| manager.read(&key)));
    let release = async {
        transport.wait_for_fetches(1).await;
        settle().await;
        transport.release_fetches();
    };
    let (results, ()) = tokio::join!(reads, release);

    assert_eq!(transport.fetch_count(), 1);
    let values: Vec<_> = results
        .into_iter()
        .map(|read| read.unwrap().into_value())
        .collect();
    assert_eq!(values.len(), 8);
    assert!(values.iter().all(|v| v == &values[0]));
}

#[tokio::test]
async fn test_stale_read_carries_refresh_error() {
    let transport = MockTransport::new();
    let clock = ManualClock::starting_now();
    let key = CacheKey::list("project", &ListParams::page(20, 0));
    transport.respond_page(&key, &[project("P1", "Planning")]);
    let manager = CacheManager::create(
        CacheContext::new(test_config(), transport.clone()).with_clock(clock.clone()),
    )
    .unwrap();

    let first = manager.read(&key).await.unwrap();
    assert!(!first.is_stale());

    transport.respond(&key, Err(FetchError::network("backend down")));
    clock.advance(chrono::Duration::minutes(3));

    let stale = manager.read(&key).await.unwrap();
    assert!(stale.is_stale());
    transport.wait_for_fetches(2).await;
    settle().await;

    let again = manager.read(&key).await.unwrap();
    assert!(again.is_stale());
    assert_eq!(again.value(), first.value());
    assert!(matches!(again.refresh_error(), Some(FetchError::Network { .. })));

    clock.advance(chrono::Duration::hours(1));
    assert_miss(&manager.get(&key));
}

#[tokio::test]
async fn test_restart_rehydrates_values_and_drafts_from_lmdb() {
    let dir = TempDir::new().expect("TempDir creation should succeed");
    let store: Arc<dyn PersistentStore> =
        Arc::new(LmdbPersistentStore::new(dir.path().join("cache"), 8).unwrap());
    let transport = MockTransport::new();
    let key = CacheKey::list("project", &ListParams::page(20, 0));
    transport.respond_page(&key, &[project("P1", "Planning")]);
    transport.respond_record("project", &project("P1", "Planning"));

    let first = CacheManager::create(
        CacheContext::new(test_config(), transport.clone()).with_persistent(Arc::clone(&store)),
    )
    .unwrap();
    first.read(&key).await.unwrap();
    let id = RecordId::new("P1");
    first.start_edit(&project_type(), &id).await.unwrap();
    first
        .drafts()
        .update_field(&project_type(), &id, "stage", json!("Closing"))
        .await
        .unwrap();
    first.teardown();
    drop(first);

    let second = CacheManager::create(
        CacheContext::new(test_config(), transport.clone()).with_persistent(store),
    )
    .unwrap();
    let report = second.hydrate().await.unwrap();
    assert_eq!(report.drafts, 1);
    let draft_changes = second.drafts().get_changes(&project_type(), &id).unwrap();
    assert_eq!(draft_changes, changes(&[("stage", json!("Closing"))]));

    let fetches_before = transport.fetch_count();
    let read = second.read(&key).await.unwrap();
    assert_eq!(read.source(), ReadSource::Persistent);
    assert!(read.is_stale());

    transport.wait_for_fetches(fetches_before + 1).await;
    settle().await;
    assert_fresh(&second.get(&key));
}

#[tokio::test]
async fn test_missing_record_surfaces_not_found() {
    let transport = MockTransport::new();
    let id = RecordId::new("P404");
    transport.respond(
        &CacheKey::detail("project", &id),
        Err(FetchError::NotFound {
            entity_type: project_type(),
            id: Some(id.clone()),
        }),
    );
    let manager = CacheManager::create(CacheContext::new(test_config(), transport)).unwrap();

    let result = manager.detail(&project_type(), &id).await;
    assert_not_found(&result, "project");
    assert!(manager.start_edit(&project_type(), &id).await.is_err());
}

#[tokio::test]
async fn test_create_then_delete_through_manager() {
    let transport = MockTransport::new();
    let key = CacheKey::list("project", &ListParams::page(20, 0));
    transport.respond_page(&key, &[project("P1", "Planning")]);
    let manager = CacheManager::create(CacheContext::new(test_config(), transport.clone())).unwrap();
    manager.read(&key).await.unwrap();

    let created = manager
        .create_record(&project_type(), changes(&[("name", json!("Fresh"))]))
        .await
        .unwrap();
    let server: RawRecord = created.record.unwrap();
    assert_eq!(server.id, RecordId::new("srv-1"));
    assert_eq!(field_of(&manager.get(&key), "srv-1", "name"), Some(json!("Fresh")));

    manager.delete(&project_type(), &server.id).await.unwrap();
    assert_eq!(field_of(&manager.get(&key), "srv-1", "name"), None);
    assert_miss(&manager.get(&CacheKey::detail("project", &server.id)));
}

fn fast_reconnect() -> ReconnectConfig {
    ReconnectConfig {
        initial_ms: 1,
        max_ms: 4,
        multiplier: 2.0,
        jitter_ms: 0,
    }
}

#[tokio::test]
async fn test_push_invalidation_and_reconnect() {
    let transport = MockTransport::new();
    let key = CacheKey::list("project", &ListParams::page(20, 0));
    transport.respond_page(&key, &[project("P1", "Planning")]);
    transport.respond_metadata("project", &tessera_test_utils::fixtures::project_metadata());
    let connector = MockPushConnector::new();
    let mut config = test_config();
    config.reconnect = fast_reconnect();
    let manager = CacheManager::create(
        CacheContext::new(config, transport.clone()).with_push(Arc::new(connector.clone())),
    )
    .unwrap();
    connector.wait_for_connects(1).await;

    manager
        .open_view(&project_type(), &ListParams::page(20, 0))
        .await
        .unwrap();
    connector.wait_for_sent(1).await;
    assert_eq!(connector.sent()[0], PushMessage::subscribe(project_type()));

    let event = InvalidationEvent::new("project", Some(RecordId::new("P1")), ChangeOperation::Update);
    assert!(connector.push_message(&PushMessage::Invalidate(event)));
    while !manager.volatile().peek(&key).unwrap().invalidated {
        tokio::task::yield_now().await;
    }

    manager.refresh(&key).await.unwrap();
    assert!(!manager.volatile().peek(&key).unwrap().invalidated);

    connector.disconnect();
    connector.wait_for_connects(2).await;
    connector.wait_for_sent(2).await;
    assert_eq!(connector.sent()[1], PushMessage::subscribe(project_type()));
    while !manager.volatile().peek(&key).unwrap().invalidated {
        tokio::task::yield_now().await;
    }
    assert!(manager
        .volatile()
        .peek(&CacheKey::metadata("project"))
        .unwrap()
        .invalidated);

    manager.teardown();
    let mut delivered = true;
    for _ in 0..100 {
        delivered = connector.push("{}");
        if !delivered {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert!(!delivered, "push task still running after teardown");
}

#[tokio::test]
async fn test_late_connect_invalidates_view_fetched_before_it() {
    let transport = MockTransport::new();
    let key = CacheKey::list("project", &ListParams::page(20, 0));
    transport.respond_page(&key, &[project("P1", "Planning")]);
    transport.respond_metadata("project", &tessera_test_utils::fixtures::project_metadata());
    let connector = MockPushConnector::new();
    connector.refuse_connections(true);
    let mut config = test_config();
    config.reconnect = fast_reconnect();
    let manager = CacheManager::create(
        CacheContext::new(config, transport.clone()).with_push(Arc::new(connector.clone())),
    )
    .unwrap();

    manager
        .open_view(&project_type(), &ListParams::page(20, 0))
        .await
        .unwrap();
    assert!(!manager.volatile().peek(&key).unwrap().invalidated);

    connector.refuse_connections(false);
    connector.wait_for_connects(1).await;
    while !manager.volatile().peek(&key).unwrap().invalidated {
        tokio::task::yield_now().await;
    }
    settle().await;

    let subscribes: Vec<PushMessage> = connector
        .sent()
        .into_iter()
        .filter(|message| matches!(message, PushMessage::Subscribe(_)))
        .collect();
    assert_eq!(subscribes, vec![PushMessage::subscribe(project_type())]);
    manager.teardown();
}

#[tokio::test]
async fn test_undecodable_push_frame_is_ignored() {
    let transport = MockTransport::new();
    let key = CacheKey::list("project", &ListParams::page(20, 0));
    transport.respond_page(&key, &[project("P1", "Planning")]);
    let connector = MockPushConnector::new();
    let manager = CacheManager::create(
        CacheContext::new(test_config(), transport).with_push(Arc::new(connector.clone())),
    )
    .unwrap();
    connector.wait_for_connects(1).await;
    manager.read(&key).await.unwrap();

    assert!(connector.push("not json at all"));
    settle().await;
    assert!(connector.is_connected());
    assert!(!manager.volatile().peek(&key).unwrap().invalidated);
}
