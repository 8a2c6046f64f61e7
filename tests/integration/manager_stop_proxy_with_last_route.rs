use std::{collections::HashMap, sync::Arc};

use axum::{Router, routing::get};
use hyper::StatusCode;
use kubehost::{
    DirectFileAccess, DomainRouter, ForwardManager, ForwardRequest, HostsFileEditor, ProxyState,
    ReverseProxyServer, SessionKey, SessionRegistry,
};
use tempfile::NamedTempFile;
use tokio::net::TcpListener;

use crate::common::{LocalTunnelOpener, http_get, serve_router};

/// This test ensures that the reverse proxy keeps running while any route is left,
/// and stops (releasing its port) once the last route is gone.
#[test_log::test(tokio::test)]
async fn manager_stop_proxy_with_last_route() {
    let web = serve_router(Router::new().route("/", get(|| async { "web" }))).await;
    let api = serve_router(Router::new().route("/", get(|| async { "api" }))).await;
    let hosts_file = NamedTempFile::new().unwrap();
    let manager = ForwardManager::builder()
        .registry(
            SessionRegistry::builder()
                .opener(Arc::new(LocalTunnelOpener {
                    pods: HashMap::from([("web".into(), web), ("api".into(), api)]),
                }))
                .build(),
        )
        .proxy(
            ReverseProxyServer::builder()
                .router(Arc::new(DomainRouter::new()))
                .build(),
        )
        .hosts(
            HostsFileEditor::builder()
                .path(hosts_file.path())
                .access(DirectFileAccess)
                .build(),
        )
        .proxy_port(0)
        .build();
    let web_key = SessionKey::new("kind", "default", "web", 80);
    let api_key = SessionKey::new("kind", "default", "api", 80);
    for (key, domain) in [
        (web_key.clone(), "web.default.kind"),
        (api_key.clone(), "api.default.kind"),
    ] {
        manager
            .start_forward(ForwardRequest {
                key,
                desired_local_port: 0,
                domain: Some(domain.into()),
            })
            .await
            .unwrap();
    }
    let port = manager
        .commit()
        .await
        .unwrap()
        .proxy_port
        .expect("proxy should be running");
    assert_eq!(http_get(port, "web.default.kind", "/").await.1, "web");
    assert_eq!(http_get(port, "api.default.kind", "/").await.1, "api");

    // Stopping one route keeps the proxy up.
    manager.stop_forward(&web_key).await.unwrap();
    manager.commit().await.unwrap();
    assert_eq!(manager.proxy_state(), ProxyState::Listening(port));
    let (status, body) = http_get(port, "web.default.kind", "/").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body.contains("web.default.kind"));
    assert_eq!(http_get(port, "api.default.kind", "/").await.1, "api");

    // Stopping the last route stops the proxy.
    manager.stop_forward(&api_key).await.unwrap();
    manager.commit().await.unwrap();
    assert_eq!(manager.proxy_state(), ProxyState::Stopped);
    TcpListener::bind(("127.0.0.1", port))
        .await
        .expect("proxy port should be released");
    // Stopping again is a no-op.
    manager.stop_forward(&api_key).await.unwrap();
    manager.shutdown().await.unwrap();
}
