use std::{
    collections::HashMap,
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{Arc, RwLock},
    time::Duration,
};

use bon::Builder;
use hyper::{Request, body::Incoming, service::service_fn};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto,
};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::Mutex,
    task::JoinSet,
    time::{sleep, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    droppable_handle::DroppableHandle,
    http::{ProxyData, proxy_handler},
    port_allocator::{PortAllocator, PortError, is_port_taken},
    router::DomainRouter,
    session::{DEFAULT_BUFFER_SIZE, DEFAULT_STOP_GRACE},
};

// Port tried when the preferred proxy port can't be bound.
pub const FALLBACK_PROXY_PORT: u16 = 8080;
// Size of the port range scanned when both the preferred and fallback ports are taken.
pub const PROXY_PORT_SEARCH_RANGE: u16 = 100;

#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
    #[error("Error listening on proxy port {port}: {source}")]
    Bind { port: u16, source: io::Error },
    #[error(transparent)]
    Port(#[from] PortError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    Stopped,
    Starting,
    Listening(u16),
}

struct RunningProxy {
    port: u16,
    cancellation_token: CancellationToken,
    handle: DroppableHandle<()>,
}

// HTTP reverse proxy dispatching requests to local session ports by their Host.
#[derive(Builder)]
pub struct ReverseProxyServer {
    // Route table shared with the orchestrator.
    router: Arc<DomainRouter>,
    // Address the proxy listens on.
    #[builder(default = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    listen_address: IpAddr,
    // Address where forwarded sessions listen.
    #[builder(default = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    upstream_address: IpAddr,
    #[builder(default = DEFAULT_BUFFER_SIZE)]
    buffer_size: usize,
    // Optional duration until an outgoing request is canceled.
    http_request_timeout: Option<Duration>,
    // Optional duration until an HTTP connection is closed.
    connection_timeout: Option<Duration>,
    #[builder(skip = Mutex::new(None))]
    running: Mutex<Option<RunningProxy>>,
    #[builder(skip = RwLock::new(ProxyState::Stopped))]
    state: RwLock<ProxyState>,
}

impl ReverseProxyServer {
    pub fn state(&self) -> ProxyState {
        *self.state.read().unwrap()
    }

    // Port the proxy is listening on, if it's running.
    pub fn port(&self) -> Option<u16> {
        match self.state() {
            ProxyState::Listening(port) => Some(port),
            _ => None,
        }
    }

    pub fn router(&self) -> &Arc<DomainRouter> {
        &self.router
    }

    // Replace the routes. This never starts the server.
    pub fn update_routes(&self, routes: HashMap<String, u16>) {
        self.router.set_routes(routes);
    }

    // Start listening, trying the preferred port, then the fallback port, then a bounded range.
    // Returns the port being listened on; starting a running proxy returns its current port.
    pub async fn start(&self, preferred_port: u16) -> Result<u16, ProxyError> {
        let mut running = self.running.lock().await;
        if let Some(running) = running.as_ref() {
            return Ok(running.port);
        }
        *self.state.write().unwrap() = ProxyState::Starting;
        let listener = match self.bind(preferred_port).await {
            Ok(listener) => listener,
            Err(error) => {
                *self.state.write().unwrap() = ProxyState::Stopped;
                return Err(error);
            }
        };
        let port = match listener.local_addr() {
            Ok(address) => address.port(),
            Err(source) => {
                *self.state.write().unwrap() = ProxyState::Stopped;
                return Err(ProxyError::Bind {
                    port: preferred_port,
                    source,
                });
            }
        };
        let proxy_data = Arc::new(
            ProxyData::builder()
                .router(Arc::clone(&self.router))
                .upstream_address(self.upstream_address)
                .listen_port(port)
                .buffer_size(self.buffer_size)
                .maybe_http_request_timeout(self.http_request_timeout)
                .build(),
        );
        let cancellation_token = CancellationToken::new();
        let handle = DroppableHandle(tokio::spawn(accept_loop(
            listener,
            proxy_data,
            self.connection_timeout,
            cancellation_token.clone(),
        )));
        info!(%port, "Reverse proxy listening for HTTP connections.");
        *running = Some(RunningProxy {
            port,
            cancellation_token,
            handle,
        });
        *self.state.write().unwrap() = ProxyState::Listening(port);
        Ok(port)
    }

    // Stop listening and close in-flight connections. Stopping a stopped proxy is a no-op.
    pub async fn stop(&self) {
        let mut running = self.running.lock().await;
        let Some(RunningProxy {
            port,
            cancellation_token,
            handle,
        }) = running.take()
        else {
            return;
        };
        cancellation_token.cancel();
        if let Err(error) = handle.join(DEFAULT_STOP_GRACE).await {
            if !error.is_cancelled() {
                error!(%port, %error, "Reverse proxy task failed.");
            }
        }
        *self.state.write().unwrap() = ProxyState::Stopped;
        info!(%port, "Reverse proxy stopped.");
    }

    async fn bind(&self, preferred_port: u16) -> Result<TcpListener, ProxyError> {
        for port in [preferred_port, FALLBACK_PROXY_PORT] {
            match TcpListener::bind((self.listen_address, port)).await {
                Ok(listener) => return Ok(listener),
                Err(source) if is_port_taken(&source) => {
                    warn!(%port, error = %source, "Proxy port unavailable.");
                }
                Err(source) => return Err(ProxyError::Bind { port, source }),
            }
        }
        let start = preferred_port.max(FALLBACK_PROXY_PORT).saturating_add(1);
        let end = start.saturating_add(PROXY_PORT_SEARCH_RANGE);
        let port = PortAllocator::new(self.listen_address)
            .allocate_within(start..=end, |_| false)
            .await?;
        TcpListener::bind((self.listen_address, port))
            .await
            .map_err(|source| ProxyError::Bind { port, source })
    }
}

async fn accept_loop(
    listener: TcpListener,
    proxy_data: Arc<ProxyData>,
    connection_timeout: Option<Duration>,
    cancellation_token: CancellationToken,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            biased;
            _ = cancellation_token.cancelled() => break,
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            conn = listener.accept() => {
                match conn {
                    Ok((stream, address)) => {
                        connections.spawn(serve_connection(
                            stream,
                            address,
                            Arc::clone(&proxy_data),
                            connection_timeout,
                        ));
                    }
                    Err(error) => {
                        error!(%error, "Unable to accept HTTP connection.");
                        sleep(Duration::from_millis(50)).await;
                    }
                }
            }
        }
    }
    drop(listener);
    connections.shutdown().await;
    debug!("Reverse proxy accept loop finished.");
}

async fn serve_connection(
    stream: TcpStream,
    address: SocketAddr,
    proxy_data: Arc<ProxyData>,
    connection_timeout: Option<Duration>,
) {
    if let Err(error) = stream.set_nodelay(true) {
        warn!(%error, %address, "Error setting nodelay.");
    }
    // Create a Hyper service and serve over the accepted TCP connection.
    let service = service_fn(move |req: Request<Incoming>| {
        proxy_handler(req, address, Arc::clone(&proxy_data))
    });
    let io = TokioIo::new(stream);
    let server = auto::Builder::new(TokioExecutor::new());
    let conn = server.serve_connection_with_upgrades(io, service);
    match connection_timeout {
        Some(duration) => {
            let _ = timeout(duration, conn).await;
        }
        None => {
            let _ = conn.await;
        }
    }
}
