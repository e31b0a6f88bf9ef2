#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use rampart_persist::{SqliteStore, Store, StoreExt};
use rampart_pipeline::{
    Deployment, Dispatcher, Entity, Namespace, NetworkPolicy, PersistPipeline, Pipeline, PipelineError,
    ProcessIndicator, Resource, ResourceAction, Secret, SensorEvent,
};
use rampart_reconcile::{IdSnapshot, ObservedSource};
use rustc_hash::FxHashSet;

fn temp_db() -> String {
    let f = format!(
        "rampart-pipeline-test-{}.db",
        std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos()
    );
    std::env::temp_dir().join(f).to_string_lossy().to_string()
}

fn dispatcher(store: Arc<dyn Store>) -> Dispatcher {
    Dispatcher::new(
        Arc::new(PersistPipeline::<Deployment>::new(store.clone())),
        Arc::new(PersistPipeline::<ProcessIndicator>::new(store.clone())),
        Arc::new(PersistPipeline::<NetworkPolicy>::new(store.clone())),
        Arc::new(PersistPipeline::<Namespace>::new(store.clone())),
        Arc::new(PersistPipeline::<Secret>::new(store)),
    )
}

fn deployment(id: &str, replicas: i64) -> Deployment {
    Deployment { id: id.into(), name: format!("web-{}", id), namespace: "default".into(), replicas, ..Default::default() }
}

#[tokio::test]
async fn remove_event_deletes_existing_deployment() {
    let store: Arc<dyn Store> = Arc::new(SqliteStore::open(&temp_db()).unwrap());
    store.upsert(Deployment::KIND, "dep-1", "c1", &deployment("dep-1", 1)).unwrap();

    let ev = SensorEvent::new("c1", ResourceAction::Remove, Resource::Deployment(deployment("dep-1", 1)));
    let out = dispatcher(store.clone()).dispatch(&ev).await.unwrap();
    assert!(out.is_none());
    assert!(store.get_raw(Deployment::KIND, "dep-1").unwrap().is_none());
}

#[tokio::test]
async fn create_then_update_keeps_last_write() {
    let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
    let d = dispatcher(store.clone());
    d.dispatch(&SensorEvent::new("c1", ResourceAction::Create, Resource::Deployment(deployment("dep-1", 1)))).await.unwrap();
    d.dispatch(&SensorEvent::new("c1", ResourceAction::Update, Resource::Deployment(deployment("dep-1", 4)))).await.unwrap();
    let got: Deployment = store.get(Deployment::KIND, "dep-1").unwrap().unwrap();
    assert_eq!(got.replicas, 4);
}

#[tokio::test]
async fn unknown_action_succeeds_without_touching_the_store() {
    let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
    store.upsert(Deployment::KIND, "dep-1", "c1", &deployment("dep-1", 2)).unwrap();

    let ev = SensorEvent::new("c1", ResourceAction::Unknown(42), Resource::Deployment(deployment("dep-1", 9)));
    let out = dispatcher(store.clone()).dispatch(&ev).await.unwrap();
    assert!(out.is_none());
    let got: Deployment = store.get(Deployment::KIND, "dep-1").unwrap().unwrap();
    assert_eq!(got.replicas, 2);

    let fresh = SensorEvent::new("c1", ResourceAction::Unknown(42), Resource::Secret(Secret { id: "s1".into(), ..Default::default() }));
    dispatcher(store.clone()).dispatch(&fresh).await.unwrap();
    assert!(store.get_raw(Secret::KIND, "s1").unwrap().is_none());
}

#[tokio::test]
async fn pipeline_rejects_a_payload_of_another_kind() {
    let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
    let p = PersistPipeline::<Namespace>::new(store);
    let ev = SensorEvent::new("c1", ResourceAction::Create, Resource::Deployment(deployment("dep-1", 1)));
    let err = p.run(&ev).await.unwrap_err();
    assert!(matches!(err, PipelineError::WrongPayload { pipeline: "namespace", got: "deployment" }));
}

#[tokio::test]
async fn reconcile_prunes_only_unobserved_ids_of_that_cluster() {
    let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
    for id in ["a", "b", "c"] {
        let np = NetworkPolicy { id: id.into(), ..Default::default() };
        store.upsert(NetworkPolicy::KIND, id, "c1", &np).unwrap();
    }
    store.upsert(NetworkPolicy::KIND, "z", "c2", &NetworkPolicy { id: "z".into(), ..Default::default() }).unwrap();

    let p = PersistPipeline::<NetworkPolicy>::new(store.clone());
    p.reconcile("c1", Box::new(IdSnapshot::new(["b", "c", "d"]))).await.unwrap();

    assert_eq!(store.ids_for_cluster(NetworkPolicy::KIND, "c1").unwrap(), vec!["b", "c"]);
    assert_eq!(store.ids_for_cluster(NetworkPolicy::KIND, "c2").unwrap(), vec!["z"]);
}

struct Unreadable;

impl Store for Unreadable {
    fn upsert_raw(&self, _: &str, _: &str, _: &str, _: &[u8]) -> anyhow::Result<()> {
        Err(anyhow!("database is locked"))
    }
    fn remove(&self, _: &str, _: &str) -> anyhow::Result<bool> {
        Err(anyhow!("database is locked"))
    }
    fn get_raw(&self, _: &str, _: &str) -> anyhow::Result<Option<Vec<u8>>> {
        Err(anyhow!("database is locked"))
    }
    fn ids_for_cluster(&self, _: &str, _: &str) -> anyhow::Result<Vec<String>> {
        Err(anyhow!("database is locked"))
    }
}

struct Counted(Arc<AtomicUsize>);

impl ObservedSource for Counted {
    fn current_set(&self) -> FxHashSet<String> {
        FxHashSet::default()
    }

    fn close(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn observed_source_is_closed_when_expected_ids_cannot_be_read() {
    let closes = Arc::new(AtomicUsize::new(0));
    let p = PersistPipeline::<Secret>::new(Arc::new(Unreadable));
    let err = p.reconcile("c1", Box::new(Counted(Arc::clone(&closes)))).await.unwrap_err();
    assert!(matches!(err, PipelineError::Store(_)), "{:?}", err);
    assert_eq!(closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn observed_source_is_closed_once_after_a_successful_pass() {
    let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
    store.upsert(Secret::KIND, "s1", "c1", &Secret { id: "s1".into(), ..Default::default() }).unwrap();
    let closes = Arc::new(AtomicUsize::new(0));
    PersistPipeline::<Secret>::new(store.clone()).reconcile("c1", Box::new(Counted(Arc::clone(&closes)))).await.unwrap();
    assert_eq!(closes.load(Ordering::SeqCst), 1);
    assert!(store.ids_for_cluster(Secret::KIND, "c1").unwrap().is_empty());
}
