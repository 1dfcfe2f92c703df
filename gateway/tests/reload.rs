//! Backend reloads triggered while the gateway serves

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use common::{descriptors, MockBackend, MockFactory};
use mcp_gateway::handlers::ReloadTask;
use mcp_gateway::pool::{BackendPool, PoolOptions};
use mcp_gateway::session::SessionManager;

async fn connected(factory: &Arc<MockFactory>) -> (Arc<BackendPool>, Arc<SessionManager>) {
    let pool = Arc::new(BackendPool::new(
        descriptors(&["slow"]),
        factory.clone(),
        PoolOptions::default(),
    ));
    pool.connect().await.unwrap();
    let sessions = Arc::new(SessionManager::new(pool.clone(), "reload-test"));
    (pool, sessions)
}

#[tokio::test]
async fn test_stop_waits_for_reload_in_flight() {
    let factory = MockFactory::new(vec![(
        "slow",
        MockBackend::with_tools(&["search"]).start_delay(Duration::from_millis(200)),
    )]);
    let (pool, sessions) = connected(&factory).await;

    let (trigger, triggers) = mpsc::channel(1);
    let reload = ReloadTask::spawn(pool.clone(), sessions, triggers);
    trigger.send(()).await.unwrap();

    // Stop while the reconnect is still starting the backend.
    tokio::time::sleep(Duration::from_millis(50)).await;
    reload.stop().await;

    assert!(pool.is_connected().await);
    assert_eq!(pool.get_tools().await.len(), 1);
    assert_eq!(factory.stats.started(), vec!["slow", "slow"]);

    pool.disconnect().await;
    assert_eq!(factory.stats.closed(), factory.stats.started());
}

#[tokio::test]
async fn test_stop_without_triggers_returns_promptly() {
    let factory = MockFactory::new(vec![("slow", MockBackend::with_tools(&["search"]))]);
    let (pool, sessions) = connected(&factory).await;

    let (_trigger, triggers) = mpsc::channel(1);
    let reload = ReloadTask::spawn(pool.clone(), sessions, triggers);

    tokio::time::timeout(Duration::from_secs(1), reload.stop())
        .await
        .expect("stop in time");
    assert_eq!(factory.stats.started(), vec!["slow"]);
    assert!(factory.stats.closed().is_empty());
}
