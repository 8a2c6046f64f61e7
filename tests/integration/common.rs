use std::{collections::HashMap, net::SocketAddr, time::Duration};

use axum::Router;
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::{Request, StatusCode, body::Incoming, service::service_fn};
use hyper_util::rt::{TokioExecutor, TokioIo};
use kubehost::{SessionKey, TunnelError, TunnelOpener};
use tokio::{
    net::{TcpListener, TcpStream},
    time::{sleep, timeout},
};
use tower::Service;

pub(crate) struct KubehostHandle(pub(crate) tokio::task::JoinHandle<color_eyre::Result<()>>);

impl Drop for KubehostHandle {
    fn drop(&mut self) {
        self.0.abort();
    }
}

// Tunnels to local servers instead of pods, keyed by pod name.
#[derive(Default)]
pub(crate) struct LocalTunnelOpener {
    pub(crate) pods: HashMap<String, SocketAddr>,
}

impl TunnelOpener for LocalTunnelOpener {
    type Stream = TcpStream;

    async fn open_tunnel(&self, key: &SessionKey) -> Result<TcpStream, TunnelError> {
        match self.pods.get(&key.pod) {
            Some(address) => Ok(TcpStream::connect(address).await?),
            None => Err(TunnelError::MissingStream(key.to_string())),
        }
    }
}

// Serve an axum router, standing in for a pod.
pub(crate) async fn serve_router(router: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let router = router.clone();
            let service = service_fn(move |req: Request<Incoming>| router.clone().call(req));
            tokio::spawn(async move {
                let _ = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                    .serve_connection_with_upgrades(TokioIo::new(stream), service)
                    .await;
            });
        }
    });
    address
}

pub(crate) async fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

pub(crate) async fn wait_for_port(port: u16) {
    if timeout(Duration::from_secs(5), async {
        while TcpStream::connect(("127.0.0.1", port)).await.is_err() {
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .is_err()
    {
        panic!("Timeout waiting for port {port}.")
    };
}

pub(crate) async fn http_get(port: u16, host: &str, path: &str) -> (StatusCode, String) {
    let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .unwrap();
    tokio::spawn(conn);
    let request = Request::builder()
        .method("GET")
        .uri(path)
        .header("host", host)
        .body(Empty::<Bytes>::new())
        .unwrap();
    let response = sender.send_request(request).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8_lossy(&body).into_owned())
}
