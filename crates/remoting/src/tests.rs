use super::*;
use serde_json::json;

fn local_server_config() -> RpcServerConfig {
    RpcServerConfig::new(TransportServerConfig::new("127.0.0.1:0".parse().unwrap()))
}

fn ping_service() -> Arc<dyn Service> {
    Arc::new(MethodRouter::new().method("ping", |_| Ok(json!("pong"))))
}

#[tokio::test]
async fn test_facades_share_pools_by_key() {
    let runtime = Runtime::new();
    let server = runtime
        .register("ping", ping_service(), local_server_config())
        .await
        .unwrap();

    let pooled = RpcClientConfig::pooled(server.local_addr(), 0, 4);
    let first = runtime.facade(pooled.clone());
    let second = runtime.facade(pooled);
    assert!(Arc::ptr_eq(first.pool(), second.pool()));
    assert_eq!(runtime.pool_count(), 1);

    let other_mode = runtime.facade(RpcClientConfig::pooled(server.local_addr(), 0, 2));
    assert!(!Arc::ptr_eq(first.pool(), other_mode.pool()));
    assert_eq!(runtime.pool_count(), 2);

    assert_eq!(first.invoke("ping", vec![]).await.unwrap(), json!("pong"));
    assert_eq!(second.invoke("ping", vec![]).await.unwrap(), json!("pong"));

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_stateful_facade_from_runtime() {
    let runtime = Runtime::new();
    let server = runtime
        .register("ping", ping_service(), local_server_config())
        .await
        .unwrap();

    let facade = runtime.facade(RpcClientConfig::stateful(server.local_addr(), 1));
    assert!(facade.is_stateful());
    assert_eq!(facade.invoke("ping", vec![]).await.unwrap(), json!("pong"));

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_service_name_is_rejected() {
    let runtime = Runtime::new();
    runtime
        .register("ping", ping_service(), local_server_config())
        .await
        .unwrap();

    let err = runtime
        .register("ping", ping_service(), local_server_config())
        .await
        .unwrap_err();
    assert!(matches!(err, RemotingError::InvalidRequest(_)));
    assert_eq!(runtime.server_names(), vec!["ping".to_string()]);

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_clears_registry() {
    let runtime = Runtime::new();
    let server = runtime
        .register("ping", ping_service(), local_server_config())
        .await
        .unwrap();
    runtime
        .register("other", ping_service(), local_server_config())
        .await
        .unwrap();
    runtime.facade(RpcClientConfig::pooled(server.local_addr(), 1, 2));

    assert_eq!(runtime.server_names(), vec!["other".to_string(), "ping".to_string()]);

    runtime.shutdown().await;
    assert!(runtime.server_names().is_empty());
    assert_eq!(runtime.pool_count(), 0);
    assert!(runtime.server("ping").is_none());
    assert!(!server.transport().is_started());
}
