//! Pass-by-pass scenarios for a `Database` pipeline backed by a fake MySQL.
//!
//! Each test drives `Pipeline::reconcile` by hand so the effect of every
//! single pass on the store can be asserted.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use fleet_reconciler::{
    Action, ControllerConfig, Error, FnStep, Pipeline, Reconcile, Resource, StepResult,
};
use fleet_store::{DynamicObject, InMemoryStore, ObjectMeta, ObjectRef, Store};
use serde_json::json;

fn setup() -> (Arc<InMemoryStore>, Arc<FakeMysql>, Pipeline<Database>) {
    let store = InMemoryStore::new_arc();
    let mysql = FakeMysql::new();
    let pipeline = database_pipeline(store.clone(), ControllerConfig::new("mysql"), Arc::clone(&mysql));
    (store, mysql, pipeline)
}

async fn pass(pipeline: &Pipeline<Database>, attempt: u32) -> Action {
    unwrap_result(pipeline.reconcile(&db_key(), attempt).await, "reconcile pass")
}

/// Run passes until the pipeline waits for a change.
async fn converge(pipeline: &Pipeline<Database>) {
    for _ in 0..10 {
        if pass(pipeline, 0).await == Action::AwaitChange {
            return;
        }
    }
    panic!("pipeline did not converge within 10 passes");
}

#[tokio::test]
async fn test_happy_path_initialises_then_converges() {
    // GIVEN: a fresh database
    let (store, mysql, pipeline) = setup();
    create_db(&store, 10).await;

    // WHEN: the first pass runs
    let first = pass(&pipeline, 0).await;

    // THEN: it only inserts the checks and asks to be run again at once
    assert_eq!(first, Action::Requeue(Duration::ZERO));
    let db = get_db(&store).await;
    assert_eq!(db.status.checks.len(), 2);
    assert!(!db.status.is_verified(CREDS_READY, 1));
    assert_eq!(db.status.check_list.len(), 2);
    assert_eq!(mysql.creds_runs(), 0);

    // WHEN: the second pass runs
    let second = pass(&pipeline, 0).await;

    // THEN: every step ran and the resource is ready
    assert_eq!(second, Action::AwaitChange);
    let db = get_db(&store).await;
    assert!(db.status.is_ready);
    assert!(db.status.all_verified(1));
    assert_eq!(db.status.observed_generation, 1);
    assert!(db.metadata.finalizers.contains(&fleet_reconciler::labels::DEFAULT_FINALIZER.to_string()));
    assert_eq!(db.status.resources, vec![ObjectRef::new(&secret_kind(), &creds_key())]);
    assert!(mysql.has_user("db1").await);

    // WHEN: a third pass runs on the converged resource
    let writes = store.writes();
    let third = pass(&pipeline, 0).await;

    // THEN: nothing is written and the verified step is skipped
    assert_eq!(third, Action::AwaitChange);
    assert_eq!(store.writes(), writes);
    assert_eq!(mysql.creds_runs(), 1);
    assert_eq!(mysql.user_calls(), 2);
}

#[tokio::test]
async fn test_engine_writes_leave_spec_and_generation_alone() {
    for spec in [json!({ "size": 1, "charset": "utf8mb4" }), json!({})] {
        // GIVEN: a database whose spec carries fields the typed view does not model
        let (store, _mysql, pipeline) = setup();
        let object = DynamicObject::new(Database::gvk(), ObjectMeta::new("apps", "db1"))
            .with_spec(spec.clone());
        unwrap_result(store.create(object).await, "create db1");

        // WHEN: the engine adds checks, finalizers and status until converged
        converge(&pipeline).await;

        // THEN: the stored spec is untouched and the generation never moved
        let stored = unwrap_result(store.get(&Database::gvk(), &db_key()).await, "get db1");
        assert_eq!(stored.spec, spec);
        assert_eq!(stored.metadata.generation, 1);
        assert!(get_db(&store).await.status.all_verified(1));
    }
}

#[tokio::test]
async fn test_owned_secret_is_stamped_with_owner() {
    let (store, _mysql, pipeline) = setup();
    let db = create_db(&store, 1).await;
    converge(&pipeline).await;

    let secret = unwrap_result(store.get(&secret_kind(), &creds_key()).await, "get secret");
    let owner_uid = unwrap_option(db.metadata.uid, "db uid");
    assert!(secret.metadata.is_owned_by(owner_uid));
    assert_eq!(
        secret.metadata.labels.get(fleet_reconciler::labels::OWNER_NAME).map(String::as_str),
        Some("db1")
    );
    assert_eq!(
        secret.metadata.labels.get(fleet_reconciler::labels::MANAGED_BY).map(String::as_str),
        Some("mysql")
    );
}

#[tokio::test]
async fn test_dependency_outage_keeps_verified_checks() {
    // GIVEN: MySQL is down when the database is first reconciled
    let (store, mysql, pipeline) = setup();
    mysql.set_down(true);
    create_db(&store, 10).await;
    pass(&pipeline, 0).await;

    // WHEN: the user step fails
    let failed = pass(&pipeline, 0).await;

    // THEN: the pass is retried without an error and the failure is recorded
    assert_eq!(failed, Action::Retry(Duration::from_secs(5)));
    let db = get_db(&store).await;
    assert!(!db.status.is_ready);
    assert!(db.status.is_verified(CREDS_READY, 1));
    let user = unwrap_option(db.status.check(USER_READY), "userReady check");
    assert!(!user.status);
    assert!(user.message.contains("dial timeout"));
    let message = unwrap_option(db.status.message.clone(), "status message");
    assert!(message.starts_with("userReady: "));

    // WHEN: the same failure repeats
    let writes = store.writes();
    let again = pass(&pipeline, 1).await;

    // THEN: identical failures are not rewritten and credsReady is not re-run
    assert!(matches!(again, Action::Retry(_)));
    assert_eq!(store.writes(), writes);
    assert_eq!(mysql.creds_runs(), 1);

    // WHEN: MySQL comes back
    mysql.set_down(false);
    let recovered = pass(&pipeline, 2).await;

    // THEN: the resource becomes ready and the failure message is gone
    assert_eq!(recovered, Action::AwaitChange);
    let db = get_db(&store).await;
    assert!(db.status.is_ready);
    assert!(db.status.message.is_none());
    assert_eq!(mysql.creds_runs(), 1);
}

#[tokio::test]
async fn test_spec_change_reverifies_checks() {
    // GIVEN: a converged database at generation 1
    let (store, mysql, pipeline) = setup();
    create_db(&store, 10).await;
    converge(&pipeline).await;
    assert_eq!(mysql.creds_runs(), 1);

    // WHEN: the spec changes
    let mut object = unwrap_result(store.get(&Database::gvk(), &db_key()).await, "get db");
    object.spec = json!({ "size": 20 });
    let updated = unwrap_result(store.update(object).await, "update spec");
    assert_eq!(updated.metadata.generation, 2);
    converge(&pipeline).await;

    // THEN: the until-verified step runs again and all checks carry generation 2
    assert_eq!(mysql.creds_runs(), 2);
    let db = get_db(&store).await;
    assert_eq!(db.spec.size, 20);
    assert!(db.status.all_verified(2));
    assert_eq!(db.status.observed_generation, 2);
    assert!(db.status.is_ready);
}

#[tokio::test]
async fn test_duplicate_concurrent_passes_converge() {
    // GIVEN: two passes for the same key racing each other
    let (store, mysql, pipeline) = setup();
    create_db(&store, 10).await;

    // WHEN: they are repeated until both wait for a change
    let mut converged = false;
    for _ in 0..20 {
        let (key_a, key_b) = (db_key(), db_key());
        let (a, b) = tokio::join!(pipeline.reconcile(&key_a, 0), pipeline.reconcile(&key_b, 0));
        if matches!((&a, &b), (Ok(Action::AwaitChange), Ok(Action::AwaitChange))) {
            converged = true;
            break;
        }
    }

    // THEN: the outcome matches a single sequential run
    assert!(converged);
    let db = get_db(&store).await;
    assert!(db.status.is_ready);
    assert!(db.status.all_verified(1));
    assert_eq!(db.status.resources.len(), 1);
    assert_eq!(db.metadata.finalizers.len(), 1);
    assert!(mysql.has_user("db1").await);
}

#[tokio::test]
async fn test_deletion_waits_for_owned_resources() {
    // GIVEN: a converged database with an owned secret
    let (store, _mysql, pipeline) = setup();
    create_db(&store, 10).await;
    converge(&pipeline).await;

    // WHEN: deletion is requested
    unwrap_result(store.delete(&Database::gvk(), &db_key()).await, "delete db");
    let deleting = get_db(&store).await;
    assert!(deleting.metadata.is_deleting());

    // THEN: the first pass deletes the secret and polls
    let first = pass(&pipeline, 0).await;
    assert_eq!(first, Action::Requeue(Duration::from_secs(5)));
    assert!(store.get(&secret_kind(), &creds_key()).await.is_err());
    assert!(store.get(&Database::gvk(), &db_key()).await.is_ok());

    // THEN: the next pass clears the ledger and releases the finalizer
    let second = pass(&pipeline, 0).await;
    assert_eq!(second, Action::AwaitChange);
    let gone = store.get(&Database::gvk(), &db_key()).await;
    assert!(gone.is_err_and(|e| e.is_not_found()));

    // THEN: a pass for the vanished key is a silent no-op
    assert_eq!(pass(&pipeline, 0).await, Action::AwaitChange);
}

#[tokio::test]
async fn test_deletion_blocked_by_dependent_finalizer() {
    // GIVEN: a converged database whose secret holds a finalizer of its own
    let (store, _mysql, pipeline) = setup();
    create_db(&store, 10).await;
    converge(&pipeline).await;
    let mut secret = unwrap_result(store.get(&secret_kind(), &creds_key()).await, "get secret");
    secret.metadata.finalizers.push("backup.fleet.dev/protect".to_string());
    unwrap_result(store.update(secret).await, "protect secret");

    // WHEN: the database is deleted
    unwrap_result(store.delete(&Database::gvk(), &db_key()).await, "delete db");

    // THEN: passes keep polling while the secret lingers
    for _ in 0..3 {
        assert_eq!(pass(&pipeline, 0).await, Action::Requeue(Duration::from_secs(5)));
    }
    let secret = unwrap_result(store.get(&secret_kind(), &creds_key()).await, "secret lingers");
    assert!(secret.metadata.is_deleting());
    let db = get_db(&store).await;
    assert_eq!(db.status.resources.len(), 1);

    // WHEN: the other controller releases the secret
    let mut secret = secret;
    secret.metadata.finalizers.clear();
    unwrap_result(store.update(secret).await, "release secret");

    // THEN: the database goes away on the next pass
    assert_eq!(pass(&pipeline, 0).await, Action::AwaitChange);
    assert!(store.get(&Database::gvk(), &db_key()).await.is_err());
}

#[tokio::test]
async fn test_deleting_without_our_finalizer_is_left_alone() {
    let (store, _mysql, pipeline) = setup();
    let mut object = create_db(&store, 10).await;
    object.metadata.finalizers.push("someone.else/finalizer".to_string());
    unwrap_result(store.update(object).await, "foreign finalizer");
    unwrap_result(store.delete(&Database::gvk(), &db_key()).await, "delete db");

    let writes = store.writes();
    assert_eq!(pass(&pipeline, 0).await, Action::AwaitChange);
    assert_eq!(store.writes(), writes);
}

#[tokio::test]
async fn test_missing_local_fails_the_check() {
    // GIVEN: a step reading a local nobody wrote
    let store = InMemoryStore::new_arc();
    let pipeline = Pipeline::<Database>::new(store.clone(), ControllerConfig::new("mysql")).step(
        FnStep::new("connect", |req| {
            Box::pin(async move {
                match req.get_local::<String>("conn") {
                    Ok(_) => req.check_succeeded("connected").await,
                    Err(e) => req.check_failed("connected", e.to_string()).await,
                }
            })
        })
        .check("connected"),
    );
    create_db(&store, 1).await;
    pass(&pipeline, 0).await;

    // WHEN: the pass runs
    let action = pass(&pipeline, 0).await;

    // THEN: the check carries the missing key and the pass is retried
    assert!(matches!(action, Action::Retry(_)));
    let db = get_db(&store).await;
    let check = unwrap_option(db.status.check("connected"), "connected check");
    assert!(check.message.contains("not in locals"));
    assert!(!db.status.is_ready);
}

#[tokio::test]
async fn test_missing_local_can_be_propagated() {
    let store = InMemoryStore::new_arc();
    let pipeline = Pipeline::<Database>::new(store.clone(), ControllerConfig::new("mysql")).step(
        FnStep::new("connect", |req| {
            Box::pin(async move {
                match req.get_local::<u16>("port") {
                    Ok(_) => StepResult::next(),
                    Err(e) => StepResult::error(e),
                }
            })
        }),
    );
    create_db(&store, 1).await;

    let result = pipeline.reconcile(&db_key(), 0).await;
    assert!(matches!(result, Err(Error::LocalNotFound { .. })));
}

#[tokio::test]
async fn test_locals_flow_between_steps_of_one_pass() {
    let store = InMemoryStore::new_arc();
    let pipeline = Pipeline::<Database>::new(store.clone(), ControllerConfig::new("mysql"))
        .step(FnStep::new("open", |req| {
            Box::pin(async move {
                req.set_local("conn", "mysql://db1".to_string());
                StepResult::next()
            })
        }))
        .step(
            FnStep::new("use", |req| {
                Box::pin(async move {
                    let conn = match req.get_local::<String>("conn") {
                        Ok(conn) => conn.clone(),
                        Err(e) => return StepResult::error(e),
                    };
                    if conn == "mysql://db1" {
                        req.check_succeeded("connected").await
                    } else {
                        req.check_failed("connected", format!("unexpected {conn}")).await
                    }
                })
            })
            .check("connected"),
        );
    create_db(&store, 1).await;

    converge(&pipeline).await;
    assert!(get_db(&store).await.status.is_verified("connected", 1));
}

#[tokio::test]
async fn test_clear_status_annotation_wipes_checks() {
    // GIVEN: a converged database
    let (store, mysql, pipeline) = setup();
    create_db(&store, 10).await;
    converge(&pipeline).await;

    // WHEN: an operator asks for a status reset
    let mut object = unwrap_result(store.get(&Database::gvk(), &db_key()).await, "get db");
    object.metadata.annotations.insert(
        fleet_reconciler::labels::CLEAR_STATUS_ANNOTATION.to_string(),
        "true".to_string(),
    );
    unwrap_result(store.update(object).await, "annotate");
    let action = pass(&pipeline, 0).await;

    // THEN: checks are gone, the ledger survives and the annotation is removed
    assert_eq!(action, Action::Requeue(Duration::ZERO));
    let db = get_db(&store).await;
    assert!(db.status.checks.is_empty());
    assert!(!db.status.is_ready);
    assert_eq!(db.status.resources.len(), 1);
    assert!(
        !db.metadata
            .annotations
            .contains_key(fleet_reconciler::labels::CLEAR_STATUS_ANNOTATION)
    );

    // THEN: the next passes redo every step
    converge(&pipeline).await;
    assert_eq!(mysql.creds_runs(), 2);
    assert!(get_db(&store).await.status.is_ready);
}

#[tokio::test]
async fn test_opt_in_error_propagation() {
    // GIVEN: a step that records a failure and also propagates it
    let store = InMemoryStore::new_arc();
    let pipeline = Pipeline::<Database>::new(store.clone(), ControllerConfig::new("mysql")).step(
        FnStep::new("grant", |req| {
            Box::pin(async move {
                req.check_failed("granted", "access denied")
                    .await
                    .err(Some(Error::check_failed("granted", "access denied")))
            })
        })
        .check("granted"),
    );
    create_db(&store, 1).await;
    pass(&pipeline, 0).await;

    // WHEN: the step fails
    let result = pipeline.reconcile(&db_key(), 0).await;

    // THEN: the scheduler sees the error and the check is still recorded
    assert!(matches!(result, Err(Error::CheckFailed { .. })));
    let db = get_db(&store).await;
    let check = unwrap_option(db.status.check("granted"), "granted check");
    assert_eq!(check.message, "access denied");
    assert_eq!(db.status.message.as_deref(), Some("granted: access denied"));
}

#[tokio::test]
async fn test_check_failed_requeue_follows_attempts() {
    let store = InMemoryStore::new_arc();
    let config = ControllerConfig::new("mysql").check_failed_requeue(
        fleet_reconciler::RequeuePolicy::exponential(Duration::from_secs(1), Duration::from_secs(60)),
    );
    let pipeline = Pipeline::<Database>::new(store.clone(), config).step(
        FnStep::new("grant", |req| {
            Box::pin(async move { req.check_failed("granted", "access denied").await })
        })
        .check("granted"),
    );
    create_db(&store, 1).await;
    pass(&pipeline, 0).await;

    let early = pass(&pipeline, 0).await;
    let late = pass(&pipeline, 3).await;
    let (Some(early), Some(late)) = (early.delay(), late.delay()) else {
        panic!("failed checks must requeue");
    };
    assert!(late > early);
}
