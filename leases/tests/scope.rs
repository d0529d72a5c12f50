use chrono::Utc;
use leases::{
    from_context,
    test_utils::{init_tracing, RecordingLeaseService},
    with_lease, Context, DeleteOpt, Error, LeaseId, LeaseOpt, LeaseScope, LeaseService, ScopeConfig,
    ServiceError,
};
use std::{collections::BTreeMap, sync::Arc, time::Duration};

fn setup() -> (Arc<RecordingLeaseService>, LeaseScope) {
    init_tracing();
    let service = Arc::new(RecordingLeaseService::new());
    let scope = LeaseScope::new(service.clone());
    (service, scope)
}

fn seconds_until_expiry(service: &RecordingLeaseService, id: &LeaseId) -> i64 {
    let lease = service.store().get(id).expect("lease should exist");
    lease
        .expires_at()
        .expect("lease should carry an expiry")
        .signed_duration_since(Utc::now())
        .num_seconds()
}

#[tokio::test]
async fn test_fresh_context_creates_one_lease() {
    let (service, scope) = setup();
    let ctx = Context::background();

    let (leased, release) = scope.acquire(&ctx, &[]).await.unwrap();

    assert_eq!(service.create_calls(), 1);
    assert_eq!(service.store().len(), 1);
    assert!(!release.is_noop());

    let id = from_context(&leased).expect("context should carry the lease");
    assert_eq!(release.lease_id(), Some(&id));
    assert!(from_context(&ctx).is_none(), "parent context must stay unannotated");

    // default expiration is a day out
    let remaining = seconds_until_expiry(&service, &id);
    assert!(
        (86_400 - 5..=86_400).contains(&remaining),
        "unexpected expiry: {}s",
        remaining
    );

    // defaults ask for a random id
    assert_eq!(
        service.create_options()[0],
        vec![LeaseOpt::RandomId, LeaseOpt::Expiration(Duration::from_secs(86_400))]
    );

    release.release(&ctx).await.unwrap();
}

#[tokio::test]
async fn test_random_ids_differ_between_scopes() {
    let (_service, scope) = setup();
    let ctx = Context::background();

    let (first_ctx, first) = scope.acquire(&ctx, &[]).await.unwrap();
    let (second_ctx, second) = scope.acquire(&ctx, &[]).await.unwrap();

    assert_ne!(from_context(&first_ctx), from_context(&second_ctx));

    first.release(&ctx).await.unwrap();
    second.release(&ctx).await.unwrap();
}

#[tokio::test]
async fn test_release_deletes_exactly_the_created_lease() {
    let (service, scope) = setup();
    let ctx = Context::background();

    // an unrelated lease that must survive
    let bystander = service
        .create(&ctx, &[LeaseOpt::Id("bystander".to_string())])
        .await
        .unwrap();

    let (leased, release) = scope.acquire(&ctx, &[]).await.unwrap();
    let id = from_context(&leased).unwrap();

    release.release(&ctx).await.unwrap();

    assert_eq!(service.delete_calls(), 1);
    assert_eq!(service.deleted(), vec![id.clone()]);
    assert!(!service.store().contains(&id));
    assert!(service.store().contains(&bystander.id));
}

#[tokio::test]
async fn test_nested_acquire_reuses_outer_lease() {
    let (service, scope) = setup();
    let ctx = Context::background();

    let (outer_ctx, outer) = scope.acquire(&ctx, &[]).await.unwrap();
    let outer_id = from_context(&outer_ctx).unwrap();

    let (inner_ctx, inner) = scope.acquire(&outer_ctx, &[]).await.unwrap();
    assert_eq!(from_context(&inner_ctx), Some(outer_id.clone()));
    assert!(inner.is_noop());
    assert_eq!(inner.lease_id(), Some(&outer_id));
    assert!(inner.lease().is_none());
    assert_eq!(service.create_calls(), 1);

    // releasing the inner handle touches nothing
    inner.release(&inner_ctx).await.unwrap();
    assert_eq!(service.delete_calls(), 0);
    assert!(service.store().contains(&outer_id));

    outer.release(&ctx).await.unwrap();
    assert_eq!(service.delete_calls(), 1);
    assert!(service.store().is_empty());
}

#[tokio::test]
async fn test_existing_annotation_ignores_options() {
    let (service, scope) = setup();
    let ctx = with_lease(&Context::background(), LeaseId::from("from-caller"));

    let (leased, release) = scope
        .acquire(
            &ctx,
            &[
                LeaseOpt::Id("ignored".to_string()),
                LeaseOpt::Expiration(Duration::from_secs(60)),
            ],
        )
        .await
        .unwrap();

    assert_eq!(from_context(&leased), Some(LeaseId::from("from-caller")));
    assert!(release.is_noop());
    assert_eq!(service.create_calls(), 0);

    release.release(&leased).await.unwrap();
    assert_eq!(service.delete_calls(), 0);
}

#[tokio::test]
async fn test_annotation_visible_through_derived_contexts() {
    let (service, scope) = setup();
    let (outer_ctx, outer) = scope.acquire(&Context::background(), &[]).await.unwrap();

    let (derived, _cancel) = outer_ctx
        .with_value("request-metadata")
        .with_timeout(Duration::from_secs(30))
        .with_cancel();

    let (_, inner) = scope.acquire(&derived, &[]).await.unwrap();
    assert!(inner.is_noop());
    assert_eq!(service.create_calls(), 1);

    inner.release(&derived).await.unwrap();
    outer.release(&outer_ctx).await.unwrap();
}

#[tokio::test]
async fn test_creation_failure_passes_through() {
    let (service, scope) = setup();
    let ctx = Context::background();
    service.fail_next_create("store offline");

    let result = scope.acquire(&ctx, &[]).await;

    match result {
        Err(Error::CreationFailed(ServiceError::Unavailable(reason))) => {
            assert_eq!(reason, "store offline");
        }
        other => panic!("Expected CreationFailed, got {:?}", other.map(|(c, _)| c)),
    }

    assert!(from_context(&ctx).is_none());
    assert!(service.store().is_empty());
    assert_eq!(service.delete_calls(), 0);

    // no fallback lease, and the next attempt works normally
    let (leased, release) = scope.acquire(&ctx, &[]).await.unwrap();
    assert!(from_context(&leased).is_some());
    release.release(&ctx).await.unwrap();
}

#[tokio::test]
async fn test_duplicate_explicit_id_fails() {
    let (service, scope) = setup();
    let ctx = Context::background();
    let opts = [LeaseOpt::Id("pull-nginx".to_string())];

    let (_, first) = scope.acquire(&ctx, &opts).await.unwrap();
    let err = scope.acquire(&ctx, &opts).await.unwrap_err();

    assert!(matches!(
        err.service_error(),
        Some(ServiceError::AlreadyExists(id)) if id == "pull-nginx"
    ));
    assert_eq!(service.store().len(), 1);

    first.release(&ctx).await.unwrap();
}

#[tokio::test]
async fn test_custom_options_override_defaults() {
    let (service, scope) = setup();
    let ctx = Context::background();

    let mut labels = BTreeMap::new();
    labels.insert("purpose".to_string(), "unpack".to_string());

    let (leased, release) = scope
        .acquire(
            &ctx,
            &[
                LeaseOpt::Id("x".to_string()),
                LeaseOpt::Expiration(Duration::from_secs(5 * 60)),
                LeaseOpt::Labels(labels),
            ],
        )
        .await
        .unwrap();

    let id = from_context(&leased).unwrap();
    assert_eq!(id, LeaseId::from("x"));

    let remaining = seconds_until_expiry(&service, &id);
    assert!((295..=300).contains(&remaining), "unexpected expiry: {}s", remaining);

    let lease = service.store().get(&id).unwrap();
    assert_eq!(lease.labels.get("purpose").map(String::as_str), Some("unpack"));

    release.release(&ctx).await.unwrap();
}

#[tokio::test]
async fn test_configured_defaults() {
    init_tracing();
    let service = Arc::new(RecordingLeaseService::new());
    let mut config = ScopeConfig::default();
    config.default_expiration_secs = 600;
    config
        .default_labels
        .insert("owner".to_string(), "snapshotter".to_string());
    let scope = LeaseScope::with_config(service.clone(), config);
    let ctx = Context::background();

    let (leased, release) = scope.acquire(&ctx, &[]).await.unwrap();
    let id = from_context(&leased).unwrap();

    let remaining = seconds_until_expiry(&service, &id);
    assert!((595..=600).contains(&remaining), "unexpected expiry: {}s", remaining);
    let lease = release.lease().unwrap();
    assert_eq!(lease.labels.get("owner").map(String::as_str), Some("snapshotter"));

    release.release(&ctx).await.unwrap();
}

#[tokio::test]
async fn test_deletion_failure_surfaces_to_releaser() {
    let (service, scope) = setup();
    let ctx = Context::background();

    let (leased, release) = scope.acquire(&ctx, &[]).await.unwrap();
    let id = from_context(&leased).unwrap();
    service.fail_next_delete("connection reset");

    match release.release(&ctx).await {
        Err(Error::DeletionFailed { id: failed, source }) => {
            assert_eq!(failed, id);
            assert!(matches!(source, ServiceError::Unavailable(_)));
        }
        other => panic!("Expected DeletionFailed, got {:?}", other),
    }

    // nothing was retried and the lease is still there
    assert_eq!(service.delete_calls(), 1);
    assert!(service.store().contains(&id));
}

#[tokio::test]
async fn test_release_of_vanished_lease_reports_not_found() {
    let (service, scope) = setup();
    let ctx = Context::background();

    let (_, release) = scope.acquire(&ctx, &[]).await.unwrap();
    let lease = release.lease().cloned().unwrap();

    // someone else deleted it first
    service.delete(&ctx, &lease, &[]).await.unwrap();

    let err = release.release(&ctx).await.unwrap_err();
    assert!(err.service_error().map_or(false, ServiceError::is_not_found));
}

#[tokio::test]
async fn test_synchronous_release_prunes_expired_leases() {
    let (service, scope) = setup();
    let ctx = Context::background();

    service
        .create(
            &ctx,
            &[
                LeaseOpt::Id("stale".to_string()),
                LeaseOpt::Expiration(Duration::ZERO),
            ],
        )
        .await
        .unwrap();

    let (_, release) = scope.acquire(&ctx, &[]).await.unwrap();
    release
        .release_with(&ctx, &[DeleteOpt::Synchronous])
        .await
        .unwrap();

    assert!(service.store().is_empty());
}

#[tokio::test]
async fn test_cancelled_context_fails_without_creating() {
    let (service, scope) = setup();
    let (ctx, cancel) = Context::background().with_cancel();
    cancel.cancel();

    let err = scope.acquire(&ctx, &[]).await.unwrap_err();
    assert!(matches!(err, Error::CreationFailed(ServiceError::Cancelled)));
    assert_eq!(service.create_calls(), 0);
    assert!(service.store().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_during_creation() {
    let (service, scope) = setup();
    service.set_create_latency(Duration::from_secs(10));
    let (ctx, cancel) = Context::background().with_cancel();

    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
    });

    let err = scope.acquire(&ctx, &[]).await.unwrap_err();
    canceller.await.unwrap();

    assert!(matches!(err, Error::CreationFailed(ServiceError::Cancelled)));
    assert_eq!(service.create_calls(), 1);
    assert!(service.store().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_deadline_during_creation() {
    let (service, scope) = setup();
    service.set_create_latency(Duration::from_secs(10));
    let ctx = Context::background().with_timeout(Duration::from_secs(1));

    let err = scope.acquire(&ctx, &[]).await.unwrap_err();

    assert!(matches!(err, Error::CreationFailed(ServiceError::DeadlineExceeded)));
    assert!(err.service_error().unwrap().is_context_error());
    assert!(service.store().is_empty());
}

#[tokio::test]
async fn test_sibling_contexts_get_separate_leases() {
    let (service, scope) = setup();
    let root = Context::background();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let scope = scope.clone();
        let root = root.clone();
        handles.push(tokio::spawn(async move {
            let (leased, release) = scope.acquire(&root, &[]).await.unwrap();
            let id = from_context(&leased).unwrap();
            release.release(&root).await.unwrap();
            id
        }));
    }

    let ids: Vec<LeaseId> = futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    let mut unique = ids.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), 8);
    assert_eq!(service.create_calls(), 8);
    assert_eq!(service.delete_calls(), 8);
    assert!(service.store().is_empty());
}

#[tokio::test]
async fn test_scoped_releases_after_success() {
    let (service, scope) = setup();
    let ctx = Context::background();

    let seen = scope
        .scoped(&ctx, &[], |leased| async move {
            let id = from_context(&leased).unwrap();
            Ok::<_, Error>(id)
        })
        .await
        .unwrap();

    assert_eq!(service.deleted(), vec![seen]);
    assert!(service.store().is_empty());
}

#[tokio::test]
async fn test_scoped_releases_after_failure() {
    let (service, scope) = setup();
    let ctx = Context::background();

    let result: Result<(), anyhow::Error> = scope
        .scoped(&ctx, &[], |_leased| async move {
            Err(anyhow::anyhow!("unpack failed"))
        })
        .await;

    assert_eq!(result.unwrap_err().to_string(), "unpack failed");
    assert_eq!(service.delete_calls(), 1);
    assert!(service.store().is_empty());
}

#[tokio::test]
async fn test_scoped_reports_release_failure() {
    let (service, scope) = setup();
    let ctx = Context::background();
    service.fail_next_delete("store offline");

    let result = scope
        .scoped(&ctx, &[], |_leased| async move { Ok::<_, Error>(()) })
        .await;

    assert!(matches!(result, Err(Error::DeletionFailed { .. })));
}

#[tokio::test]
async fn test_scoped_inside_existing_lease_keeps_it() {
    let (service, scope) = setup();
    let ctx = Context::background();
    let (outer_ctx, outer) = scope.acquire(&ctx, &[]).await.unwrap();

    scope
        .scoped(&outer_ctx, &[], |_leased| async move { Ok::<_, Error>(()) })
        .await
        .unwrap();

    assert_eq!(service.create_calls(), 1);
    assert_eq!(service.delete_calls(), 0);

    outer.release(&ctx).await.unwrap();
}
