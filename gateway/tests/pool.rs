//! Backend pool behaviour against in-memory backends

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use common::{descriptors, result_text, tool, tool_with_schema, MockBackend, MockFactory};
use mcp_gateway::config::{CollisionPolicy, UnknownFields};
use mcp_gateway::error::GatewayError;
use mcp_gateway::pool::{BackendPool, PoolOptions, ToolCall};

fn pool(factory: &Arc<MockFactory>, ids: &[&str], options: PoolOptions) -> BackendPool {
    BackendPool::new(descriptors(ids), factory.clone(), options)
}

fn names(tools: Vec<mcp_gateway::protocol::Tool>) -> Vec<String> {
    let mut names: Vec<String> = tools.into_iter().map(|t| t.name.to_string()).collect();
    names.sort();
    names
}

#[tokio::test]
async fn test_registry_is_union_of_backend_tools() {
    let factory = MockFactory::new(vec![
        ("files", MockBackend::with_tools(&["read", "write"])),
        ("web", MockBackend::with_tools(&["fetch"])),
    ]);
    let pool = pool(&factory, &["files", "web"], PoolOptions::default());

    let report = pool.connect().await.unwrap();
    assert_eq!(report.connected, vec!["files", "web"]);
    assert!(report.failed.is_empty());
    assert_eq!(names(pool.get_tools().await), vec!["fetch", "read", "write"]);
    assert!(pool.is_connected().await);
}

#[tokio::test]
async fn test_calls_route_to_owning_backend() {
    let factory = MockFactory::new(vec![
        ("files", MockBackend::with_tools(&["read"])),
        ("web", MockBackend::with_tools(&["fetch"])),
    ]);
    let pool = pool(&factory, &["files", "web"], PoolOptions::default());
    pool.connect().await.unwrap();

    let result = pool
        .execute_tool("fetch", json!({"url": "http://example.com"}))
        .await
        .unwrap();
    assert_eq!(result_text(&result), "web:fetch");

    let calls = factory.stats.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].backend, "web");
    assert_eq!(calls[0].arguments, json!({"url": "http://example.com"}));
}

#[tokio::test]
async fn test_unknown_tool_never_reaches_a_backend() {
    let factory = MockFactory::new(vec![("files", MockBackend::with_tools(&["read"]))]);
    let pool = pool(&factory, &["files"], PoolOptions::default());
    pool.connect().await.unwrap();

    let err = pool.execute_tool("delete", json!({})).await.unwrap_err();
    assert!(err.is_tool_not_found());
    assert_eq!(err.to_string(), "Tool not found: delete");
    assert!(factory.stats.calls().is_empty());
}

#[tokio::test]
async fn test_backend_errors_keep_their_code() {
    let factory = MockFactory::new(vec![(
        "files",
        MockBackend::with_tools(&["read"]).error_on("read", -32042, "disk on fire"),
    )]);
    let pool = pool(&factory, &["files"], PoolOptions::default());
    pool.connect().await.unwrap();

    match pool.execute_tool("read", json!({})).await {
        Err(GatewayError::BackendCall { code, message, .. }) => {
            assert_eq!(code, -32042);
            assert_eq!(message, "disk on fire");
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
}

#[tokio::test]
async fn test_first_wins_is_stable_across_reconnects() {
    // The first backend finishes connecting last, yet still owns the name.
    let factory = MockFactory::new(vec![
        (
            "slow",
            MockBackend::with_tools(&["search"]).start_delay(Duration::from_millis(80)),
        ),
        ("fast", MockBackend::with_tools(&["search", "other"])),
    ]);
    let pool = pool(&factory, &["slow", "fast"], PoolOptions::default());

    for _ in 0..3 {
        let report = pool.connect().await.unwrap();
        assert_eq!(report.collisions.len(), 1);
        assert_eq!(report.collisions[0].winner, "slow");
        assert_eq!(report.collisions[0].loser, "fast");
        assert_eq!(pool.tool_owner("search").await.as_deref(), Some("slow"));
        pool.disconnect().await;
    }
}

#[tokio::test]
async fn test_last_wins_and_prefix_policies() {
    let factory = MockFactory::new(vec![
        ("a", MockBackend::with_tools(&["search"])),
        ("b", MockBackend::with_tools(&["search", "only_b"])),
    ]);

    let last = pool(
        &factory,
        &["a", "b"],
        PoolOptions {
            collision_policy: CollisionPolicy::LastWins,
            ..Default::default()
        },
    );
    last.connect().await.unwrap();
    assert_eq!(last.tool_owner("search").await.as_deref(), Some("b"));

    let prefixed = pool(
        &factory,
        &["a", "b"],
        PoolOptions {
            collision_policy: CollisionPolicy::Prefix,
            ..Default::default()
        },
    );
    let report = prefixed.connect().await.unwrap();
    assert_eq!(
        names(prefixed.get_tools().await),
        vec!["a__search", "b__search", "only_b"]
    );
    assert_eq!(report.collisions.len(), 1);

    let result = prefixed.execute_tool("b__search", json!({})).await.unwrap();
    assert_eq!(result_text(&result), "b:search");
}

#[tokio::test]
async fn test_failed_backend_is_isolated() {
    let factory = MockFactory::new(vec![
        ("good", MockBackend::with_tools(&["ping"])),
        ("bad", MockBackend::failing()),
    ]);
    let pool = pool(&factory, &["good", "bad"], PoolOptions::default());

    let report = pool.connect().await.unwrap();
    assert_eq!(report.connected, vec!["good"]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].backend, "bad");
    assert!(report.failed[0].error.contains("refused to start"));

    // The failed transport was released right away.
    assert_eq!(factory.stats.closed(), vec!["bad"]);
    assert!(pool.execute_tool("ping", json!({})).await.is_ok());
    assert_eq!(pool.status().await, report);
}

#[tokio::test]
async fn test_slow_backend_hits_startup_timeout() {
    let factory = MockFactory::new(vec![
        ("quick", MockBackend::with_tools(&["a"])),
        (
            "stuck",
            MockBackend::with_tools(&["b"]).start_delay(Duration::from_secs(5)),
        ),
    ]);
    let pool = pool(
        &factory,
        &["quick", "stuck"],
        PoolOptions {
            startup_timeout: Duration::from_millis(100),
            ..Default::default()
        },
    );

    let report = pool.connect().await.unwrap();
    assert_eq!(report.connected, vec!["quick"]);
    assert_eq!(report.failed[0].backend, "stuck");
    assert_eq!(names(pool.get_tools().await), vec!["a"]);
}

#[tokio::test]
async fn test_connect_respects_max_parallel_calls() {
    let ids = ["b1", "b2", "b3", "b4", "b5"];
    let factory = MockFactory::new(
        ids.iter()
            .map(|id| {
                (
                    *id,
                    MockBackend::with_tools(&[]).start_delay(Duration::from_millis(60)),
                )
            })
            .collect(),
    );
    let pool = pool(
        &factory,
        &ids,
        PoolOptions {
            max_parallel_calls: 2,
            ..Default::default()
        },
    );

    let report = pool.connect().await.unwrap();
    assert_eq!(report.connected.len(), 5);
    assert_eq!(factory.stats.max_concurrent_starts(), 2);
}

#[tokio::test]
async fn test_connect_twice_is_rejected() {
    let factory = MockFactory::new(vec![("a", MockBackend::with_tools(&["x"]))]);
    let pool = pool(&factory, &["a"], PoolOptions::default());

    pool.connect().await.unwrap();
    assert!(matches!(
        pool.connect().await,
        Err(GatewayError::AlreadyConnected)
    ));
}

#[tokio::test]
async fn test_disconnect_is_idempotent() {
    let factory = MockFactory::new(vec![
        ("a", MockBackend::with_tools(&["x"])),
        ("b", MockBackend::with_tools(&["y"])),
    ]);
    let pool = pool(&factory, &["a", "b"], PoolOptions::default());

    // Before any connect
    pool.disconnect().await;

    pool.connect().await.unwrap();
    pool.disconnect().await;
    pool.disconnect().await;

    let mut closed = factory.stats.closed();
    closed.sort();
    assert_eq!(closed, vec!["a", "b"]);
    assert!(pool.get_tools().await.is_empty());
    assert!(!pool.is_connected().await);
    assert!(pool.execute_tool("x", json!({})).await.unwrap_err().is_tool_not_found());
}

#[tokio::test]
async fn test_disconnect_closes_each_transport_once_despite_failures() {
    let factory = MockFactory::new(vec![
        ("good", MockBackend::with_tools(&["x"])),
        ("flaky", MockBackend::with_tools(&["y"]).failing_close()),
        ("bad", MockBackend::failing()),
    ]);
    let pool = pool(&factory, &["good", "flaky", "bad"], PoolOptions::default());

    let report = pool.connect().await.unwrap();
    assert_eq!(report.connected, vec!["good", "flaky"]);
    assert_eq!(factory.stats.closed(), vec!["bad"]);

    pool.disconnect().await;
    pool.disconnect().await;

    let mut started = factory.stats.started();
    started.sort();
    assert_eq!(started, vec!["flaky", "good"]);

    let mut closed = factory.stats.closed();
    closed.sort();
    assert_eq!(closed, vec!["bad", "flaky", "good"]);

    assert!(pool.get_tools().await.is_empty());
    assert!(!pool.is_connected().await);
}

#[tokio::test]
async fn test_input_validation_happens_before_routing() {
    let mut backend = MockBackend::with_tools(&[]);
    backend.tools.push(tool_with_schema(
        "greet",
        json!({
            "type": "object",
            "properties": {"name": {"type": "string"}},
            "required": ["name"]
        }),
    ));
    let factory = MockFactory::new(vec![("hello", backend)]);

    let strict = pool(
        &factory,
        &["hello"],
        PoolOptions {
            unknown_fields: UnknownFields::Reject,
            ..Default::default()
        },
    );
    strict.connect().await.unwrap();

    let err = strict.execute_tool("greet", json!({"name": 3})).await.unwrap_err();
    assert!(matches!(err, GatewayError::InvalidParams(_)));
    let err = strict
        .execute_tool("greet", json!({"name": "ada", "extra": true}))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::InvalidParams(_)));
    assert!(factory.stats.calls().is_empty());

    assert!(strict.execute_tool("greet", json!({"name": "ada"})).await.is_ok());
    assert_eq!(factory.stats.calls().len(), 1);
}

#[tokio::test]
async fn test_call_timeout() {
    let factory = MockFactory::new(vec![(
        "slow",
        MockBackend::with_tools(&["wait"]).call_delay(Duration::from_secs(5)),
    )]);
    let pool = pool(
        &factory,
        &["slow"],
        PoolOptions {
            call_timeout: Some(Duration::from_millis(50)),
            ..Default::default()
        },
    );
    pool.connect().await.unwrap();

    assert!(matches!(
        pool.execute_tool("wait", json!({})).await,
        Err(GatewayError::Timeout(50))
    ));
}

#[tokio::test]
async fn test_execute_tools_keeps_each_outcome() {
    let factory = MockFactory::new(vec![
        ("a", MockBackend::with_tools(&["ok"])),
        (
            "b",
            MockBackend::with_tools(&["broken"]).error_on("broken", -32000, "nope"),
        ),
    ]);
    let pool = pool(&factory, &["a", "b"], PoolOptions::default());
    pool.connect().await.unwrap();

    let outcomes = pool
        .execute_tools(vec![
            ToolCall {
                name: "ok".into(),
                arguments: json!({}),
            },
            ToolCall {
                name: "broken".into(),
                arguments: json!({}),
            },
            ToolCall {
                name: "missing".into(),
                arguments: json!({}),
            },
            ToolCall {
                name: "ok".into(),
                arguments: json!({"again": true}),
            },
        ])
        .await;

    assert_eq!(outcomes.len(), 4);
    assert_eq!(outcomes[0].name, "ok");
    assert!(outcomes[0].result.is_ok());
    assert!(matches!(
        outcomes[1].result,
        Err(GatewayError::BackendCall { code: -32000, .. })
    ));
    assert!(outcomes[2].result.as_ref().unwrap_err().is_tool_not_found());
    assert!(outcomes[3].result.is_ok());
}

#[tokio::test]
async fn test_execute_tools_bounds_parallelism_and_keeps_order() {
    let tools = ["t0", "t1", "t2", "t3", "t4"];
    let mut backend = MockBackend::with_tools(&[]).call_delay(Duration::from_millis(100));
    backend.tools = tools.iter().map(|name| tool(name)).collect();
    let factory = MockFactory::new(vec![("a", backend)]);
    let pool = pool(
        &factory,
        &["a"],
        PoolOptions {
            max_parallel_calls: 2,
            ..Default::default()
        },
    );
    pool.connect().await.unwrap();

    let outcomes = pool
        .execute_tools(
            tools
                .iter()
                .map(|name| ToolCall {
                    name: name.to_string(),
                    arguments: json!({}),
                })
                .collect(),
        )
        .await;

    assert_eq!(factory.stats.max_concurrent_calls(), 2);
    assert_eq!(factory.stats.calls().len(), 5);
    let order: Vec<String> = outcomes
        .iter()
        .map(|outcome| result_text(outcome.result.as_ref().unwrap()))
        .collect();
    assert_eq!(order, vec!["a:t0", "a:t1", "a:t2", "a:t3", "a:t4"]);
    let names: Vec<&str> = outcomes.iter().map(|o| o.name.as_str()).collect();
    assert_eq!(names, tools);
}
