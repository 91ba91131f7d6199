//! Shared fixtures: a `Database` kind and a fake MySQL server.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use fleet_reconciler::{ControllerConfig, FnStep, Pipeline, Resource, Status, StepResult};
use fleet_store::{DynamicObject, GroupVersionKind, InMemoryStore, ObjectKey, ObjectMeta, Store};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;

/// Test helper: Unwrap a Result or panic with context
pub fn unwrap_result<T, E: std::fmt::Display>(result: Result<T, E>, context: &str) -> T {
    match result {
        Ok(value) => value,
        Err(e) => panic!("{context}: {e}"),
    }
}

/// Test helper: Unwrap an Option or panic with context
pub fn unwrap_option<T>(option: Option<T>, context: &str) -> T {
    match option {
        Some(value) => value,
        None => panic!("{context}"),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatabaseSpec {
    #[serde(default)]
    pub size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Database {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: DatabaseSpec,
    #[serde(default)]
    pub status: Status,
}

impl Resource for Database {
    fn gvk() -> GroupVersionKind {
        GroupVersionKind::new("mysql.fleet.dev", "v1", "Database")
    }

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn status(&self) -> &Status {
        &self.status
    }

    fn status_mut(&mut self) -> &mut Status {
        &mut self.status
    }
}

pub fn secret_kind() -> GroupVersionKind {
    GroupVersionKind::new("", "v1", "Secret")
}

pub fn db_key() -> ObjectKey {
    ObjectKey::new("apps", "db1")
}

pub fn creds_key() -> ObjectKey {
    ObjectKey::new("apps", "db1-creds")
}

pub const CREDS_READY: &str = "credsReady";
pub const USER_READY: &str = "userReady";

/// In-process stand-in for a MySQL server.
#[derive(Default)]
pub struct FakeMysql {
    down: AtomicBool,
    users: Mutex<HashSet<String>>,
    pub creds_runs: AtomicUsize,
    pub user_calls: AtomicUsize,
}

impl FakeMysql {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn creds_runs(&self) -> usize {
        self.creds_runs.load(Ordering::SeqCst)
    }

    pub fn user_calls(&self) -> usize {
        self.user_calls.load(Ordering::SeqCst)
    }

    pub async fn has_user(&self, name: &str) -> bool {
        self.users.lock().await.contains(name)
    }

    /// Idempotent user creation.
    pub async fn ensure_user(&self, name: &str, _password: &str) -> Result<(), String> {
        self.user_calls.fetch_add(1, Ordering::SeqCst);
        if self.down.load(Ordering::SeqCst) {
            return Err("dial timeout".to_string());
        }
        self.users.lock().await.insert(name.to_string());
        Ok(())
    }
}

/// `[credsReady, userReady]` pipeline for `Database`.
///
/// `credsReady` writes an owned secret and only runs until verified;
/// `userReady` reads the secret back and creates the user on every pass.
pub fn database_pipeline(
    store: Arc<dyn Store>,
    config: ControllerConfig,
    mysql: Arc<FakeMysql>,
) -> Pipeline<Database> {
    let creds_mysql = Arc::clone(&mysql);
    let creds = FnStep::new("creds", move |req| {
        let mysql = Arc::clone(&creds_mysql);
        Box::pin(async move {
            mysql.creds_runs.fetch_add(1, Ordering::SeqCst);
            let secret = DynamicObject::new(
                secret_kind(),
                ObjectMeta::new(&req.key().namespace, format!("{}-creds", req.key().name)),
            )
            .with_spec(json!({"username": req.key().name, "password": "s3cret"}));

            match req.apply_owned(secret).await {
                Ok(_) => req.check_succeeded(CREDS_READY).await,
                Err(e) => req.check_failed(CREDS_READY, e.to_string()).await,
            }
        })
    })
    .check(CREDS_READY)
    .until_verified();

    let user = FnStep::new("user", move |req| {
        let mysql = Arc::clone(&mysql);
        Box::pin(async move {
            let key = ObjectKey::new(&req.key().namespace, format!("{}-creds", req.key().name));
            let secret = match req.store().get(&secret_kind(), &key).await {
                Ok(secret) => secret,
                Err(e) => return req.check_failed(USER_READY, e.to_string()).await,
            };
            let username = secret.spec["username"].as_str().unwrap_or_default().to_string();
            let password = secret.spec["password"].as_str().unwrap_or_default().to_string();

            match req
                .with_timeout("create-user", mysql.ensure_user(&username, &password))
                .await
            {
                Ok(()) => req.check_succeeded(USER_READY).await,
                Err(e) => req.check_failed(USER_READY, e.to_string()).await,
            }
        })
    })
    .check(USER_READY);

    Pipeline::new(store, config).step(creds).step(user)
}

/// Create `db1` with the given size.
pub async fn create_db(store: &InMemoryStore, size: u32) -> DynamicObject {
    let object = DynamicObject::new(Database::gvk(), ObjectMeta::new("apps", "db1"))
        .with_spec(json!({ "size": size }));
    unwrap_result(store.create(object).await, "create db1")
}

/// Fetch `db1` as a typed resource.
pub async fn get_db(store: &InMemoryStore) -> Database {
    let object = unwrap_result(store.get(&Database::gvk(), &db_key()).await, "get db1");
    unwrap_result(Database::from_dynamic(object), "decode db1")
}

/// A step that always proceeds, for pipelines that only need a shape.
pub fn noop(name: &'static str) -> FnStep<Database> {
    FnStep::new(name, |_req| Box::pin(async { StepResult::next() }))
}
