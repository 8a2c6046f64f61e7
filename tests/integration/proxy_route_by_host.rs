use std::{collections::HashMap, sync::Arc};

use axum::{Router, extract::Request, routing::any};
use futures_util::{SinkExt, StreamExt};
use hyper::StatusCode;
use kubehost::{DomainRouter, ProxyState, ReverseProxyServer};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;

use crate::common::{http_get, serve_router};

/// This test ensures that the reverse proxy picks the route by Host and port,
/// and passes WebSocket upgrades through.
#[test_log::test(tokio::test)]
async fn proxy_route_by_host() {
    let echo_host = |name: &'static str| {
        Router::new().route(
            "/{*path}",
            any(move |request: Request| async move {
                format!("{name} {}", request.uri().path())
            }),
        )
    };
    let web = serve_router(echo_host("web")).await;
    let admin = serve_router(echo_host("admin")).await;
    let ws = serve_router(Router::new().route(
        "/ws",
        any(|ws: axum::extract::WebSocketUpgrade| async move {
            ws.on_upgrade(|mut socket| async move {
                while let Some(Ok(message)) = socket.recv().await {
                    if socket.send(message).await.is_err() {
                        break;
                    }
                }
            })
        }),
    ))
    .await;
    let proxy = ReverseProxyServer::builder()
        .router(Arc::new(DomainRouter::new()))
        .build();
    proxy.update_routes(HashMap::from([
        ("web.app.dev".into(), web.port()),
        ("web.app.dev:9000".into(), admin.port()),
        ("ws.app.dev".into(), ws.port()),
    ]));
    assert_eq!(proxy.state(), ProxyState::Stopped);
    let port = proxy.start(0).await.unwrap();

    let (status, body) = http_get(port, "web.app.dev", "/index.html").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "web /index.html");
    assert_eq!(http_get(port, "WEB.app.dev:9000", "/a").await.1, "admin /a");
    assert_eq!(http_get(port, "web.app.dev:9001", "/b").await.1, "web /b");
    let (status, body) = http_get(port, "unknown.dev", "/").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body.contains("unknown.dev"));

    let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let (mut websocket, _) = tokio_tungstenite::client_async("ws://ws.app.dev/ws", stream)
        .await
        .expect("WebSocket handshake failed");
    websocket.send(Message::text("ping")).await.unwrap();
    let message = websocket.next().await.unwrap().unwrap();
    assert_eq!(message.to_text().unwrap(), "ping");
    proxy.stop().await;
}
