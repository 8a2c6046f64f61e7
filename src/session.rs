use std::{
    fmt::Display,
    io,
    net::{IpAddr, SocketAddr},
    sync::{
        Arc, RwLock,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use bon::Builder;
use tokio::{
    io::copy_bidirectional_with_sizes,
    net::{TcpListener, TcpStream},
    task::{JoinError, JoinSet},
    time::{sleep, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    droppable_handle::DroppableHandle,
    port_allocator::PortError,
    tunnel::{TunnelError, TunnelOpener},
};

pub const DEFAULT_BUFFER_SIZE: usize = 32_768;
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_millis(500);

// Identifies the target of a forwarding session. At most one active session exists per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey {
    pub context: String,
    pub namespace: String,
    pub pod: String,
    pub remote_port: u16,
}

impl SessionKey {
    pub fn new(
        context: impl Into<String>,
        namespace: impl Into<String>,
        pod: impl Into<String>,
        remote_port: u16,
    ) -> Self {
        SessionKey {
            context: context.into(),
            namespace: namespace.into(),
            pod: pod.into(),
            remote_port,
        }
    }
}

impl Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}:{}",
            self.context, self.namespace, self.pod, self.remote_port
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Requesting,
    Listening,
    Active,
    Stopping,
    Closed,
    Failed,
}

impl SessionStatus {
    pub fn is_active(self) -> bool {
        matches!(self, SessionStatus::Listening | SessionStatus::Active)
    }
}

// Point-in-time view of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub key: SessionKey,
    pub local_port: u16,
    pub status: SessionStatus,
    pub open_connections: usize,
}

#[derive(thiserror::Error, Debug)]
pub enum SessionError {
    #[error("Session {0} is already active")]
    SessionAlreadyActive(SessionKey),
    #[error("Port {port} is in use by active session {owner}")]
    PortInUseByAnotherActiveSession { port: u16, owner: SessionKey },
    #[error("Session {0} not found")]
    SessionNotFound(SessionKey),
    #[error("Error binding local port {port}: {source}")]
    Bind { port: u16, source: io::Error },
    #[error(transparent)]
    Port(#[from] PortError),
    #[error("Unable to reach {key}: {source}")]
    TunnelProbe { key: SessionKey, source: TunnelError },
    #[error("Error stopping session {key}: {source}")]
    StopFailed { key: SessionKey, source: JoinError },
}

#[derive(Debug, Clone, Builder)]
pub struct SessionOptions {
    // Buffer size for bidirectional copying.
    #[builder(default = DEFAULT_BUFFER_SIZE)]
    pub(crate) buffer_size: usize,
    // Optional duration to time out forwarded connections.
    pub(crate) connection_timeout: Option<Duration>,
    // How long to wait for the accept loop to finish when stopping.
    #[builder(default = DEFAULT_STOP_GRACE)]
    pub(crate) stop_grace: Duration,
    // Whether to open one tunnel right after binding, failing the session if unreachable.
    #[builder(default)]
    pub(crate) verify_tunnel: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions::builder().build()
    }
}

// One forwarding tunnel: a local listener that opens a new tunnel for every accepted connection.
pub(crate) struct ForwardSession {
    key: SessionKey,
    local_port: u16,
    status: Arc<RwLock<SessionStatus>>,
    open_connections: Arc<AtomicUsize>,
    cancellation_token: CancellationToken,
    join_handle: DroppableHandle<()>,
    stop_grace: Duration,
}

impl ForwardSession {
    // Bind the local listener and start accepting connections.
    pub(crate) async fn bind<T: TunnelOpener>(
        key: SessionKey,
        listen_address: IpAddr,
        port: u16,
        opener: Arc<T>,
        options: &SessionOptions,
    ) -> Result<Self, SessionError> {
        let listener = TcpListener::bind((listen_address, port))
            .await
            .map_err(|source| SessionError::Bind { port, source })?;
        let local_port = listener
            .local_addr()
            .map_err(|source| SessionError::Bind { port, source })?
            .port();
        if options.verify_tunnel {
            // Dropping the listener on failure releases the port right away.
            if let Err(source) = opener.open_tunnel(&key).await {
                warn!(%key, %local_port, %source, "Tunnel probe failed.");
                return Err(SessionError::TunnelProbe { key, source });
            }
        }
        let status = Arc::new(RwLock::new(SessionStatus::Listening));
        let open_connections = Arc::new(AtomicUsize::new(0));
        let cancellation_token = CancellationToken::new();
        let join_handle = DroppableHandle(tokio::spawn(accept_loop(AcceptLoop {
            listener,
            key: Arc::new(key.clone()),
            opener,
            status: Arc::clone(&status),
            open_connections: Arc::clone(&open_connections),
            cancellation_token: cancellation_token.clone(),
            buffer_size: options.buffer_size,
            connection_timeout: options.connection_timeout,
        })));
        info!(%key, %local_port, "Forwarding session listening.");
        Ok(ForwardSession {
            key,
            local_port,
            status,
            open_connections,
            cancellation_token,
            join_handle,
            stop_grace: options.stop_grace,
        })
    }

    pub(crate) fn local_port(&self) -> u16 {
        self.local_port
    }

    pub(crate) fn status(&self) -> SessionStatus {
        *self.status.read().unwrap()
    }

    pub(crate) fn info(&self) -> SessionInfo {
        SessionInfo {
            key: self.key.clone(),
            local_port: self.local_port,
            status: self.status(),
            open_connections: self.open_connections.load(Ordering::Relaxed),
        }
    }

    // Stop accepting connections, drop in-flight ones, and release the local port.
    pub(crate) async fn stop(self) -> Result<(), SessionError> {
        let ForwardSession {
            key,
            local_port,
            status,
            cancellation_token,
            join_handle,
            stop_grace,
            ..
        } = self;
        *status.write().unwrap() = SessionStatus::Stopping;
        cancellation_token.cancel();
        let result = join_handle.join(stop_grace).await;
        *status.write().unwrap() = SessionStatus::Closed;
        match result {
            Ok(()) => {
                info!(%key, %local_port, "Forwarding session closed.");
                Ok(())
            }
            // Aborting drops the listener too.
            Err(error) if error.is_cancelled() => {
                info!(%key, %local_port, "Forwarding session aborted.");
                Ok(())
            }
            Err(source) => Err(SessionError::StopFailed { key, source }),
        }
    }
}

struct AcceptLoop<T> {
    listener: TcpListener,
    key: Arc<SessionKey>,
    opener: Arc<T>,
    status: Arc<RwLock<SessionStatus>>,
    open_connections: Arc<AtomicUsize>,
    cancellation_token: CancellationToken,
    buffer_size: usize,
    connection_timeout: Option<Duration>,
}

async fn accept_loop<T: TunnelOpener>(
    AcceptLoop {
        listener,
        key,
        opener,
        status,
        open_connections,
        cancellation_token,
        buffer_size,
        connection_timeout,
    }: AcceptLoop<T>,
) {
    // Connection tasks are owned by this loop, and aborted along with it.
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            biased;
            _ = cancellation_token.cancelled() => break,
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            accepted = listener.accept() => {
                let (stream, address) = match accepted {
                    Ok(accepted) => accepted,
                    Err(error) => {
                        error!(%key, %error, "Error accepting connection.");
                        sleep(Duration::from_millis(50)).await;
                        continue;
                    }
                };
                if let Err(error) = stream.set_nodelay(true) {
                    warn!(%key, %address, %error, "Error setting nodelay.");
                }
                connections.spawn(forward_connection(ForwardConnection {
                    stream,
                    address,
                    key: Arc::clone(&key),
                    opener: Arc::clone(&opener),
                    status: Arc::clone(&status),
                    open_connections: Arc::clone(&open_connections),
                    buffer_size,
                    connection_timeout,
                }));
            }
        }
    }
    drop(listener);
    connections.shutdown().await;
}

struct ForwardConnection<T> {
    stream: TcpStream,
    address: SocketAddr,
    key: Arc<SessionKey>,
    opener: Arc<T>,
    status: Arc<RwLock<SessionStatus>>,
    open_connections: Arc<AtomicUsize>,
    buffer_size: usize,
    connection_timeout: Option<Duration>,
}

// Decrements the open connection count, even when the task is aborted.
struct ConnectionGuard(Arc<AtomicUsize>);

impl ConnectionGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        ConnectionGuard(counter)
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

async fn forward_connection<T: TunnelOpener>(
    ForwardConnection {
        mut stream,
        address,
        key,
        opener,
        status,
        open_connections,
        buffer_size,
        connection_timeout,
    }: ForwardConnection<T>,
) {
    let _guard = ConnectionGuard::new(open_connections);
    let mut tunnel = match opener.open_tunnel(&key).await {
        Ok(tunnel) => tunnel,
        Err(error) => {
            // Only this connection is affected; the listener keeps accepting.
            warn!(%key, %address, %error, "Failed to open tunnel. Closing connection.");
            return;
        }
    };
    {
        let mut status = status.write().unwrap();
        if *status == SessionStatus::Listening {
            *status = SessionStatus::Active;
        }
    }
    debug!(%key, %address, "Forwarding connection.");
    let copy = copy_bidirectional_with_sizes(&mut stream, &mut tunnel, buffer_size, buffer_size);
    let result = match connection_timeout {
        Some(duration) => match timeout(duration, copy).await {
            Ok(result) => result,
            Err(_) => Err(io::ErrorKind::TimedOut.into()),
        },
        None => copy.await,
    };
    match result {
        Ok((sent, received)) => debug!(%key, %address, %sent, %received, "Connection closed."),
        Err(error) => debug!(%key, %address, %error, "Connection closed with error."),
    }
}
