//! Registration, update and unregister jobs end to end

mod common;

use futures::future::join_all;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

use common::{harness, harness_with, settle, url, wait_for_event, FakeProcess};
use sworker::{
    ContextConfig, ProcessId, RegistrationStore, ServiceWorkerContext, ServiceWorkerError,
    SledRegistrationStore, VersionStatus, WorkerEvent, WorkerStatus,
};

#[tokio::test]
async fn concurrent_registrations_share_one_job() {
    let h = harness().await;
    h.scripts.close();

    let calls = (0..5).map(|_| {
        let ctx = h.ctx.clone();
        tokio::spawn(async move { ctx.register(url("/app/"), url("/app/sw.js"), None).await })
    });
    let calls: Vec<_> = calls.collect();
    tokio::time::sleep(Duration::from_millis(50)).await;
    h.scripts.open();

    let results: Vec<_> = join_all(calls)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    settle().await;
    let first = &results[0];
    assert!(first.active_version.is_some());
    for result in &results {
        assert_eq!(result, first);
    }
    assert_eq!(h.process.start_count(), 1);
    assert_eq!(h.store.len(), 1);
}

#[tokio::test]
async fn registering_the_same_script_twice_reuses_the_registration() {
    let h = harness().await;

    let first = h.ctx.register(url("/app/"), url("/app/sw.js"), None).await.unwrap();
    let second = h.ctx.register(url("/app/"), url("/app/sw.js"), None).await.unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(first.active_version, second.active_version);
    settle().await;
    assert_eq!(h.process.start_count(), 1);
}

#[tokio::test]
async fn version_is_active_once_the_process_accepts_the_start() {
    let h = harness().await;
    h.process.pause();

    let registration = h.ctx.register(url("/app/"), url("/app/sw.js"), None).await.unwrap();
    let version = h
        .ctx
        .version_info(registration.active_version.unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(version.status, VersionStatus::Active);

    let instance = h.ctx.instance_info(version.instance_id).await.unwrap().unwrap();
    assert_eq!(instance.status, WorkerStatus::Starting);
    assert_eq!(instance.process_id, Some(ProcessId(1)));
}

#[tokio::test]
async fn changing_the_script_replaces_the_registration() {
    let h = harness().await;
    let mut events = h.ctx.subscribe();

    let old = h.ctx.register(url("/app/"), url("/app/sw.js"), None).await.unwrap();
    let old_version = h.ctx.version_info(old.active_version.unwrap()).await.unwrap().unwrap();
    wait_for_event(&mut events, |e| {
        matches!(e, WorkerEvent::Started { instance_id, .. } if *instance_id == old_version.instance_id)
    })
    .await;

    let new = h.ctx.register(url("/app/"), url("/app/sw2.js"), None).await.unwrap();
    assert_ne!(new.id, old.id);
    assert_eq!(new.script_url, url("/app/sw2.js"));
    let new_version = h.ctx.version_info(new.active_version.unwrap()).await.unwrap().unwrap();

    // The old worker is stopped before the replacement comes up.
    let stopped = wait_for_event(&mut events, |e| {
        matches!(e, WorkerEvent::Stopped { .. } | WorkerEvent::Started { .. })
    })
    .await;
    assert_eq!(
        stopped,
        WorkerEvent::Stopped {
            instance_id: old_version.instance_id
        }
    );
    wait_for_event(&mut events, |e| {
        matches!(e, WorkerEvent::Started { instance_id, .. } if *instance_id == new_version.instance_id)
    })
    .await;

    assert_eq!(h.ctx.version_info(old_version.id).await.unwrap(), None);
    assert_eq!(h.store.get(&url("/app/")), Some(new));
}

#[tokio::test]
async fn unchanged_script_update_leaves_registration_untouched() {
    let h = harness().await;
    let registration = h.ctx.register(url("/app/"), url("/app/sw.js"), None).await.unwrap();

    let err = h.ctx.update(url("/app/"), true).await.unwrap_err();
    assert!(matches!(err, ServiceWorkerError::ScriptUnchanged { .. }));
    assert!(!err.is_retryable());

    assert_eq!(h.store.get(&url("/app/")), Some(registration.clone()));
    let version = h
        .ctx
        .version_info(registration.active_version.unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(version.status, VersionStatus::Active);
    settle().await;
    assert_eq!(h.process.start_count(), 1);
}

#[tokio::test]
async fn changed_script_update_swaps_in_a_new_version() {
    let h = harness().await;
    let mut events = h.ctx.subscribe();
    let registration = h.ctx.register(url("/app/"), url("/app/sw.js"), None).await.unwrap();
    let old_version = h
        .ctx
        .version_info(registration.active_version.unwrap())
        .await
        .unwrap()
        .unwrap();

    h.scripts.inner.serve(&url("/app/sw.js"), "// v2");
    let updated = h.ctx.update(url("/app/"), true).await.unwrap();

    assert_eq!(updated.id, registration.id);
    assert_ne!(updated.active_version, registration.active_version);
    assert_ne!(updated.script_id, registration.script_id);

    wait_for_event(&mut events, |e| {
        matches!(e, WorkerEvent::Stopped { instance_id } if *instance_id == old_version.instance_id)
    })
    .await;
    assert_eq!(h.ctx.version_info(old_version.id).await.unwrap(), None);
    assert_eq!(h.store.get(&url("/app/")), Some(updated));
}

#[tokio::test]
async fn recent_check_skips_unforced_update() {
    let config = ContextConfig::builder()
        .update_check_interval(Duration::from_secs(3600))
        .build()
        .unwrap();
    let h = harness_with(config).await;
    let registration = h.ctx.register(url("/app/"), url("/app/sw.js"), None).await.unwrap();

    h.scripts.inner.serve(&url("/app/sw.js"), "// v2");
    let unchanged = h.ctx.update(url("/app/"), false).await.unwrap();
    assert_eq!(unchanged, registration);
    settle().await;
    assert_eq!(h.process.start_count(), 1);
}

#[tokio::test]
async fn update_of_unknown_scope_is_not_found() {
    let h = harness().await;
    let err = h.ctx.update(url("/missing/"), true).await.unwrap_err();
    assert_eq!(err.category(), "not_found");
}

#[tokio::test]
async fn store_failure_leaves_nothing_registered() {
    let h = harness().await;
    h.store.fail_next("disk full");

    let err = h
        .ctx
        .register(url("/app/"), url("/app/sw.js"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceWorkerError::Store { .. }));
    assert!(h.store.is_empty());
    assert_eq!(h.process.start_count(), 0);

    let registration = h.ctx.register(url("/app/"), url("/app/sw.js"), None).await.unwrap();
    assert!(registration.active_version.is_some());
}

#[tokio::test]
async fn network_error_fails_without_an_active_version() {
    let h = harness().await;
    let err = h
        .ctx
        .register(url("/app/"), url("/app/missing.js"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceWorkerError::Network { .. }));
    assert!(err.is_retryable());

    let stored = h.store.get(&url("/app/")).unwrap();
    assert_eq!(stored.active_version, None);
    assert_eq!(h.process.start_count(), 0);
}

#[tokio::test]
async fn failed_process_allocation_discards_the_version() {
    let h = harness().await;
    h.provider.fail_allocations();

    let err = h
        .ctx
        .register(url("/app/"), url("/app/sw.js"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceWorkerError::StartWorkerFailed { .. }));
    assert_eq!(h.store.get(&url("/app/")).unwrap().active_version, None);
}

#[tokio::test]
async fn unregister_stops_the_worker_and_deletes_the_record() {
    let h = harness().await;
    let mut events = h.ctx.subscribe();
    let registration = h.ctx.register(url("/app/"), url("/app/sw.js"), None).await.unwrap();
    let version = h
        .ctx
        .version_info(registration.active_version.unwrap())
        .await
        .unwrap()
        .unwrap();

    h.ctx.unregister(url("/app/")).await.unwrap();
    wait_for_event(&mut events, |e| {
        matches!(e, WorkerEvent::Stopped { instance_id } if *instance_id == version.instance_id)
    })
    .await;
    assert!(h.store.is_empty());

    let err = h.ctx.unregister(url("/app/")).await.unwrap_err();
    assert!(matches!(err, ServiceWorkerError::NotFound { .. }));
}

#[tokio::test]
async fn cross_origin_script_is_rejected() {
    let h = harness().await;
    let err = h
        .ctx
        .register(
            url("/app/"),
            url::Url::parse("https://elsewhere.test/sw.js").unwrap(),
            None,
        )
        .await
        .unwrap_err();
    assert_eq!(err.category(), "invalid_scope");
}

#[tokio::test]
async fn first_process_hint_wins_and_later_hints_are_released() {
    let h = harness().await;
    let second = FakeProcess::attach(&h.ctx, ProcessId(2)).await;
    let _third = FakeProcess::attach(&h.ctx, ProcessId(3)).await;
    h.scripts.close();

    let a = {
        let ctx = h.ctx.clone();
        tokio::spawn(async move {
            ctx.register(url("/app/"), url("/app/sw.js"), Some(ProcessId(2)))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    let b = {
        let ctx = h.ctx.clone();
        tokio::spawn(async move {
            ctx.register(url("/app/"), url("/app/sw.js"), Some(ProcessId(3)))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    h.scripts.open();

    let a = a.await.unwrap().unwrap();
    let b = b.await.unwrap().unwrap();
    assert_eq!(a, b);
    settle().await;
    assert_eq!(second.start_count(), 1);
    assert_eq!(h.process.start_count(), 0);
    assert_eq!(*h.provider.released_hints.lock(), vec![ProcessId(3)]);
}

#[tokio::test]
async fn sled_store_persists_the_active_version() {
    common::init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SledRegistrationStore::open(dir.path()).unwrap());
    let scripts = Arc::new(sworker::InMemoryScriptCache::new());
    scripts.serve(&url("/app/sw.js"), "// v1");

    let ctx = ServiceWorkerContext::builder()
        .store(store.clone())
        .scripts(scripts)
        .process_provider(Arc::new(common::FakeProvider::new(ProcessId(1))))
        .spawn()
        .unwrap();
    let _process = FakeProcess::attach(&ctx, ProcessId(1)).await;

    let registration = ctx.register(url("/app/"), url("/app/sw.js"), None).await.unwrap();
    let stored = store.find_registration(&url("/app/")).await.unwrap().unwrap();
    assert_eq!(stored, registration);
    assert!(stored.active_version.is_some());
    ctx.shutdown().await.unwrap();
}
