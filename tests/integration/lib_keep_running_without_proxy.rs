use std::{collections::HashMap, time::Duration};

use axum::{Router, routing::get};
use clap::Parser;
use hyper::StatusCode;
use kubehost::{ApplicationConfig, DirectFileAccess, entrypoint_with};
use tempfile::NamedTempFile;
use tokio::{
    net::TcpListener,
    sync::oneshot,
    time::{sleep, timeout},
};

use crate::common::{
    KubehostHandle, LocalTunnelOpener, free_port, http_get, serve_router, wait_for_port,
};

/// This test ensures that kubehost keeps forwarding on local ports when no port is available
/// for the reverse proxy, and still shuts down cleanly.
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn lib_keep_running_without_proxy() {
    // 1. Take the preferred proxy port and the fallback port.
    // With 65535 preferred, the search range holds no other port.
    let _preferred = TcpListener::bind(("127.0.0.1", 65_535)).await;
    let _fallback = TcpListener::bind(("127.0.0.1", 8_080)).await;
    let pod = serve_router(Router::new().route("/", get(|| async { "Hello from web." }))).await;
    let hosts_file = NamedTempFile::new().unwrap();
    std::fs::write(hosts_file.path(), "127.0.0.1 localhost\n").unwrap();
    let local_port = free_port().await;
    let config = ApplicationConfig::parse_from([
        "kubehost".to_string(),
        format!("--forward=kind/default/web:80:{local_port}=web.default.kind"),
        "--proxy-port=65535".into(),
        format!("--hosts-file={}", hosts_file.path().display()),
        "--shutdown-timeout=5s".into(),
    ]);
    let opener = LocalTunnelOpener {
        pods: HashMap::from([("web".into(), pod)]),
    };
    let (tx, rx) = oneshot::channel::<()>();
    let mut handle = KubehostHandle(tokio::spawn(entrypoint_with(
        config,
        opener,
        DirectFileAccess,
        async move {
            let _ = rx.await;
        },
    )));
    wait_for_port(local_port).await;

    // 2. The forward keeps working after the proxy failed to start
    sleep(Duration::from_millis(500)).await;
    assert!(!handle.0.is_finished(), "kubehost should keep running");
    let (status, body) = http_get(local_port, "localhost", "/").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "Hello from web.");

    // 3. Shut down normally
    tx.send(()).unwrap();
    timeout(Duration::from_secs(10), &mut handle.0)
        .await
        .expect("timeout waiting for shutdown")
        .expect("task panicked")
        .expect("shutdown failed");
    TcpListener::bind(("127.0.0.1", local_port))
        .await
        .expect("local port should be released");
}
