use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::*;

/// Resource that records when it flushed and can be told to fail.
struct TrackingResource {
    name: String,
    fail: bool,
    dirty: AtomicBool,
    flushes: AtomicUsize,
    aborted: AtomicBool,
    order: Arc<Mutex<Vec<String>>>,
}

impl TrackingResource {
    fn new(name: &str, fail: bool, order: Arc<Mutex<Vec<String>>>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            fail,
            dirty: AtomicBool::new(true),
            flushes: AtomicUsize::new(0),
            aborted: AtomicBool::new(false),
            order,
        })
    }
}

#[async_trait]
impl UowResource for TrackingResource {
    fn id(&self) -> &str {
        &self.name
    }

    async fn requires_flush(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    async fn flush(&self) -> Result<(), FlushError> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(FlushError::resource(&self.name, "induced failure"));
        }
        self.dirty.store(false, Ordering::SeqCst);
        self.order.lock().unwrap().push(self.name.clone());
        Ok(())
    }

    async fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn test_single_threaded_flushes_in_enlistment_order() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let uow = UnitOfWork::new(FlushConcurrency::SingleThreaded);

    let a = TrackingResource::new("a", false, order.clone());
    let b = TrackingResource::new("b", false, order.clone());
    uow.enlist(a).await.unwrap();
    uow.enlist(b).await.unwrap();

    uow.flush().await.unwrap();
    assert_eq!(*order.lock().unwrap(), vec!["a", "b"]);
}

#[tokio::test]
async fn test_single_threaded_failure_stops_subsequent_flushes() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let uow = UnitOfWork::new(FlushConcurrency::SingleThreaded);

    let a = TrackingResource::new("a", false, order.clone());
    let b = TrackingResource::new("b", true, order.clone());
    let c = TrackingResource::new("c", false, order.clone());
    uow.enlist(a.clone()).await.unwrap();
    uow.enlist(b.clone()).await.unwrap();
    uow.enlist(c.clone()).await.unwrap();

    let err = uow.flush().await.unwrap_err();
    assert!(matches!(err, FlushError::Resource { .. }));

    // A flushed, B was attempted, C never ran
    assert_eq!(*order.lock().unwrap(), vec!["a"]);
    assert_eq!(c.flushes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_multi_threaded_flushes_all_despite_failure() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let uow = UnitOfWork::new(FlushConcurrency::MultiThreaded);

    let a = TrackingResource::new("a", false, order.clone());
    let b = TrackingResource::new("b", true, order.clone());
    let c = TrackingResource::new("c", false, order.clone());
    uow.enlist(a.clone()).await.unwrap();
    uow.enlist(b.clone()).await.unwrap();
    uow.enlist(c.clone()).await.unwrap();

    let err = uow.flush().await.unwrap_err();
    match err {
        FlushError::Aggregate {
            attempted,
            failures,
        } => {
            assert_eq!(attempted, 3);
            assert_eq!(failures.len(), 1);
        }
        other => panic!("expected aggregate failure, got {other:?}"),
    }

    // A and C both flushed even though B failed
    let flushed = order.lock().unwrap().clone();
    assert!(flushed.contains(&"a".to_string()));
    assert!(flushed.contains(&"c".to_string()));
}

#[tokio::test]
async fn test_disabled_flushes_synchronously_at_enlistment() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let uow = UnitOfWork::new(FlushConcurrency::Disabled);

    let a = TrackingResource::new("a", false, order.clone());
    uow.enlist(a.clone()).await.unwrap();
    assert_eq!(a.flushes.load(Ordering::SeqCst), 1);

    // Nothing left for operation end
    uow.flush().await.unwrap();
    assert_eq!(a.flushes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_disabled_enlistment_failure_surfaces() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let uow = UnitOfWork::new(FlushConcurrency::Disabled);

    let b = TrackingResource::new("b", true, order);
    assert!(uow.enlist(b).await.is_err());
}

#[tokio::test]
async fn test_enlist_is_idempotent_per_id() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let uow = UnitOfWork::new(FlushConcurrency::SingleThreaded);

    let a = TrackingResource::new("a", false, order.clone());
    uow.enlist(a.clone()).await.unwrap();
    uow.enlist(a.clone()).await.unwrap();

    uow.flush().await.unwrap();
    assert_eq!(a.flushes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_clean_resources_are_not_flushed() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let uow = UnitOfWork::new(FlushConcurrency::SingleThreaded);

    let a = TrackingResource::new("a", false, order.clone());
    a.dirty.store(false, Ordering::SeqCst);
    uow.enlist(a.clone()).await.unwrap();

    uow.flush().await.unwrap();
    assert_eq!(a.flushes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_rollback_reaches_every_resource() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let uow = UnitOfWork::new(FlushConcurrency::SingleThreaded);

    let a = TrackingResource::new("a", false, order.clone());
    let b = TrackingResource::new("b", false, order.clone());
    uow.enlist(a.clone()).await.unwrap();
    uow.enlist(b.clone()).await.unwrap();

    uow.rollback().await;
    assert!(a.aborted.load(Ordering::SeqCst));
    assert!(b.aborted.load(Ordering::SeqCst));
}
