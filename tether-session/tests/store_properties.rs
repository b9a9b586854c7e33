mod common;

use chrono::Duration;
use common::Harness;
use tether_session::{
    AuditEventType, PlatformId, SessionError, SessionStore, StoreSettings, UserId,
};

#[tokio::test]
async fn test_switch_scenario_for_user_42() {
    let h = Harness::new();

    let id = h.store.create(UserId(42), Some(PlatformId(7))).await.unwrap();
    let ctx = h.store.get(&id).await.unwrap();
    assert_eq!((ctx.user_id, ctx.platform_id), (UserId(42), Some(PlatformId(7))));

    h.store.update_platform(&id, PlatformId(9)).await.unwrap();
    let ctx = h.store.get(&id).await.unwrap();
    assert_eq!((ctx.user_id, ctx.platform_id), (UserId(42), Some(PlatformId(9))));

    let err = h.store.update_platform(&id, PlatformId(55)).await.unwrap_err();
    assert!(matches!(err, SessionError::Forbidden { .. }));

    let ctx = h.store.get(&id).await.unwrap();
    assert_eq!(ctx.platform_id, Some(PlatformId(9)));
    assert_eq!(ctx.version, 2);
}

#[tokio::test]
async fn test_switch_is_visible_to_independent_reader() {
    let h = Harness::new();
    let reader = h.independent_reader();

    let id = h.store.create(UserId(42), Some(PlatformId(7))).await.unwrap();
    h.store.update_platform(&id, PlatformId(11)).await.unwrap();

    let seen = reader.get(&id).await.unwrap();
    assert_eq!(seen.platform_id, Some(PlatformId(11)));
    assert_eq!(seen.version, 2);
}

#[tokio::test]
async fn test_create_rejects_unusable_platforms() {
    let h = Harness::new();

    let foreign = h.store.create(UserId(42), Some(PlatformId(55))).await;
    assert!(matches!(foreign, Err(SessionError::Validation { .. })));

    let missing = h.store.create(UserId(42), Some(PlatformId(404))).await;
    assert!(matches!(missing, Err(SessionError::Validation { .. })));

    h.platforms.set_active(PlatformId(9), false).await;
    let inactive = h.store.create(UserId(42), Some(PlatformId(9))).await;
    assert!(matches!(inactive, Err(SessionError::Validation { .. })));

    assert!(h.backend.is_empty().await);
    assert_eq!(h.audit.count_of(AuditEventType::Created).await, 0);
}

#[tokio::test]
async fn test_inactive_platform_switch_is_forbidden_and_harmless() {
    let h = Harness::new();
    let id = h.store.create(UserId(42), Some(PlatformId(7))).await.unwrap();

    h.platforms.set_active(PlatformId(9), false).await;
    let err = h.store.update_platform(&id, PlatformId(9)).await.unwrap_err();

    assert!(matches!(err, SessionError::Forbidden { .. }));
    let ctx = h.store.get(&id).await.unwrap();
    assert_eq!(ctx.platform_id, Some(PlatformId(7)));
    assert_eq!(ctx.version, 1);
}

#[tokio::test]
async fn test_idle_expiry_is_not_found_before_deletion() {
    let h = Harness::new();
    let id = h.store.create(UserId(42), None).await.unwrap();

    h.clock.advance(Duration::minutes(31));

    assert!(matches!(h.store.get(&id).await, Err(SessionError::NotFound)));
    assert!(matches!(h.store.touch(&id).await, Err(SessionError::NotFound)));
    assert_eq!(h.backend.len().await, 1);

    assert_eq!(h.store.cleanup_expired(10).await.unwrap(), 1);
    assert!(h.backend.is_empty().await);
    assert_eq!(h.audit.count_of(AuditEventType::IdleExpired).await, 1);
    assert_eq!(h.audit.count_of(AuditEventType::AbsoluteExpired).await, 0);
}

#[tokio::test]
async fn test_touch_slides_idle_window_but_not_absolute_ceiling() {
    let h = Harness::new();
    let id = h.store.create(UserId(42), None).await.unwrap();
    let created = h.store.get(&id).await.unwrap();

    // 20 minutes at a time stays inside the 30 minute idle window
    for _ in 0..35 {
        h.clock.advance(Duration::minutes(20));
        h.store.touch(&id).await.unwrap();
    }

    let ctx = h.store.get(&id).await.unwrap();
    assert_eq!(ctx.expires_at, created.expires_at);
    assert_eq!(ctx.version, 36);

    for _ in 0..2 {
        h.clock.advance(Duration::minutes(20));
        let _ = h.store.touch(&id).await;
    }

    assert!(matches!(h.store.get(&id).await, Err(SessionError::NotFound)));
    assert_eq!(h.store.cleanup_expired(10).await.unwrap(), 1);
    assert_eq!(h.audit.count_of(AuditEventType::AbsoluteExpired).await, 1);
}

#[tokio::test]
async fn test_touch_clears_platform_the_user_lost() {
    let h = Harness::new();
    let id = h.store.create(UserId(42), Some(PlatformId(7))).await.unwrap();

    h.platforms.transfer(PlatformId(7), UserId(99)).await;
    let ctx = h.store.touch(&id).await.unwrap();

    assert_eq!(ctx.platform_id, None);
    assert_eq!(h.store.get(&id).await.unwrap().platform_id, None);
    assert_eq!(h.audit.count_of(AuditEventType::PlatformSwitched).await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_updates_never_tear() {
    let h = Harness::with_settings(StoreSettings {
        max_cas_retries: 2,
        ..StoreSettings::default()
    });
    let id = h.store.create(UserId(42), Some(PlatformId(7))).await.unwrap();

    let tasks = (0..32).map(|i| {
        let store = h.store.clone();
        let id = id.clone();
        let target = if i % 2 == 0 { PlatformId(9) } else { PlatformId(11) };
        tokio::spawn(async move { store.update_platform(&id, target).await })
    });

    let mut successes = 0u64;
    for result in futures::future::join_all(tasks).await {
        match result.unwrap() {
            Ok(_) => successes += 1,
            Err(SessionError::Conflict { .. }) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    let ctx = h.store.get(&id).await.unwrap();
    assert!(successes >= 1);
    assert_eq!(ctx.version, 1 + successes);
    assert!(matches!(ctx.platform_id, Some(PlatformId(9)) | Some(PlatformId(11))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_compare_and_set_lets_exactly_one_writer_win() {
    let h = Harness::new();
    let id = h.store.create(UserId(42), Some(PlatformId(7))).await.unwrap();

    let a = {
        let store = h.store.clone();
        let id = id.clone();
        tokio::spawn(async move { store.compare_and_set_platform(&id, PlatformId(9), 1).await })
    };
    let b = {
        let store = h.store.clone();
        let id = id.clone();
        tokio::spawn(async move { store.compare_and_set_platform(&id, PlatformId(11), 1).await })
    };

    let results = [a.await.unwrap(), b.await.unwrap()];
    let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    let conflicts = results
        .iter()
        .filter(|r| matches!(r, Err(SessionError::Conflict { .. })))
        .count();

    assert_eq!(winners.len(), 1);
    assert_eq!(conflicts, 1);

    let ctx = h.store.get(&id).await.unwrap();
    assert_eq!(ctx.version, 2);
    assert_eq!(ctx.platform_id, winners[0].platform_id);
}

#[tokio::test]
async fn test_invalidate_is_idempotent_and_audited_once() {
    let h = Harness::new();
    let id = h.store.create(UserId(42), None).await.unwrap();

    h.store.invalidate(&id).await.unwrap();
    h.store.invalidate(&id).await.unwrap();

    assert!(matches!(h.store.get(&id).await, Err(SessionError::NotFound)));
    assert_eq!(h.audit.count_of(AuditEventType::Destroyed).await, 1);

    // Already audited as destroyed, so the sweep adds nothing
    assert_eq!(h.store.cleanup_expired(10).await.unwrap(), 1);
    assert_eq!(h.audit.events().await.len(), 2);
}

#[tokio::test]
async fn test_migrate_rotates_and_carries_platform() {
    let h = Harness::new();
    let old = h.store.create(UserId(42), Some(PlatformId(9))).await.unwrap();

    let new = h.store.migrate(Some(&old), UserId(42), None, None).await.unwrap();

    assert_ne!(old, new);
    assert!(matches!(h.store.get(&old).await, Err(SessionError::NotFound)));
    assert_eq!(h.store.get(&new).await.unwrap().platform_id, Some(PlatformId(9)));

    let destroyed: Vec<_> = h
        .audit
        .events()
        .await
        .into_iter()
        .filter(|e| e.event_type == AuditEventType::Destroyed)
        .collect();
    assert_eq!(destroyed.len(), 1);
    assert_eq!(destroyed[0].detail["reason"], "rotated");
    assert_eq!(destroyed[0].session_tag, old.tag());
}

#[tokio::test]
async fn test_rejected_migrate_keeps_previous_session() {
    let h = Harness::new();
    let old = h.store.create(UserId(42), Some(PlatformId(7))).await.unwrap();

    let result = h
        .store
        .migrate(Some(&old), UserId(42), Some(PlatformId(55)), None)
        .await;

    assert!(matches!(result, Err(SessionError::Validation { .. })));
    let ctx = h.store.get(&old).await.unwrap();
    assert_eq!(ctx.platform_id, Some(PlatformId(7)));
    assert_eq!(h.audit.count_of(AuditEventType::Destroyed).await, 0);
    assert_eq!(h.audit.count_of(AuditEventType::Created).await, 1);
}

#[tokio::test]
async fn test_migrate_does_not_leak_platform_across_users() {
    let h = Harness::new();
    let old = h.store.create(UserId(42), Some(PlatformId(9))).await.unwrap();

    let new = h.store.migrate(Some(&old), UserId(99), None, None).await.unwrap();

    let ctx = h.store.get(&new).await.unwrap();
    assert_eq!(ctx.user_id, UserId(99));
    assert_eq!(ctx.platform_id, None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cleanup_never_removes_valid_rows_under_traffic() {
    let h = Harness::new();

    for _ in 0..120 {
        h.store.create(UserId(42), None).await.unwrap();
    }
    h.clock.advance(Duration::minutes(31));

    let mut live = Vec::new();
    for _ in 0..30 {
        live.push(h.store.create(UserId(42), Some(PlatformId(7))).await.unwrap());
    }

    let traffic = {
        let store = h.store.clone();
        let live = live.clone();
        tokio::spawn(async move {
            for _ in 0..5 {
                for id in &live {
                    store.touch(id).await.unwrap();
                }
            }
        })
    };

    let sweeper = {
        let store: SessionStore = h.store.clone();
        tokio::spawn(async move {
            let mut total = 0;
            loop {
                let removed = store.cleanup_expired(16).await.unwrap();
                total += removed;
                if removed < 16 {
                    return total;
                }
                tokio::task::yield_now().await;
            }
        })
    };

    traffic.await.unwrap();
    assert_eq!(sweeper.await.unwrap(), 120);

    assert_eq!(h.backend.len().await, 30);
    for id in &live {
        let ctx = h.store.get(id).await.unwrap();
        assert_eq!(ctx.version, 6);
    }
    assert_eq!(h.audit.count_of(AuditEventType::IdleExpired).await, 120);
}

#[tokio::test]
async fn test_fresh_ids_are_unique() {
    let h = Harness::new();
    let mut seen = std::collections::HashSet::new();

    for _ in 0..200 {
        let id = h.store.create(UserId(42), None).await.unwrap();
        assert!(seen.insert(id.as_str().to_string()));
    }

}
