use std::{collections::HashMap, time::Duration};

use axum::{Router, routing::get};
use clap::Parser;
use hyper::StatusCode;
use kubehost::{
    ApplicationConfig, DirectFileAccess, SECTION_END, SECTION_START, entrypoint_with,
};
use tempfile::NamedTempFile;
use tokio::{
    net::TcpListener,
    sync::oneshot,
    time::{sleep, timeout},
};

use crate::common::{
    KubehostHandle, LocalTunnelOpener, free_port, http_get, serve_router, wait_for_port,
};

/// This test ensures that kubehost forwards through its reverse proxy while running,
/// and that it stops every listener and empties the hosts file section on shutdown.
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn lib_close_with_signal() {
    // 1. Start a fake pod and a hosts file
    let pod = serve_router(Router::new().route("/", get(|| async { "Hello from web." }))).await;
    let hosts_file = NamedTempFile::new().unwrap();
    std::fs::write(hosts_file.path(), "127.0.0.1 localhost\n").unwrap();
    let proxy_port = free_port().await;
    let local_port = free_port().await;
    let config = ApplicationConfig::parse_from([
        "kubehost".to_string(),
        format!("--forward=kind/default/web:80:{local_port}=web.default.kind"),
        format!("--proxy-port={proxy_port}"),
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
    wait_for_port(proxy_port).await;

    // 2. Reach the pod through the reverse proxy and the local port
    let (status, body) = http_get(proxy_port, "web.default.kind", "/").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "Hello from web.");
    let (status, body) = http_get(local_port, "localhost", "/").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "Hello from web.");
    // The hosts file is written right after the proxy starts.
    let expected = format!(
        "127.0.0.1 localhost\n\n{SECTION_START}\n127.0.0.1\tweb.default.kind\n{SECTION_END}\n"
    );
    if timeout(Duration::from_secs(5), async {
        while std::fs::read_to_string(hosts_file.path()).unwrap() != expected {
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .is_err()
    {
        panic!("Timeout waiting for the hosts file to be updated.")
    };

    // 3. Shut down and check that everything was released
    tx.send(()).unwrap();
    timeout(Duration::from_secs(10), &mut handle.0)
        .await
        .expect("timeout waiting for shutdown")
        .expect("task panicked")
        .expect("shutdown failed");
    let content = std::fs::read_to_string(hosts_file.path()).unwrap();
    assert_eq!(
        content,
        format!("127.0.0.1 localhost\n\n{SECTION_START}\n{SECTION_END}\n")
    );
    TcpListener::bind(("127.0.0.1", proxy_port))
        .await
        .expect("proxy port should be released");
    TcpListener::bind(("127.0.0.1", local_port))
        .await
        .expect("local port should be released");
}
