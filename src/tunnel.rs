use std::{future::Future, io, sync::Arc};

use dashmap::DashMap;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    Api, Client, Config,
    config::{KubeConfigOptions, KubeconfigError},
};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use crate::session::SessionKey;

#[derive(thiserror::Error, Debug)]
pub enum TunnelError {
    #[error("Error loading kubeconfig for context {context:?}: {source}")]
    Kubeconfig {
        context: String,
        source: KubeconfigError,
    },
    #[error("Error creating client for context {context:?}: {source}")]
    Client { context: String, source: kube::Error },
    #[error("Error opening port-forward to {target}: {source}")]
    PortForward { target: String, source: kube::Error },
    #[error("Port-forward to {0} returned no stream")]
    MissingStream(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

// Byte stream to a port inside the cluster.
pub trait TunnelStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> TunnelStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

// Capability for opening a new stream to a pod's port, once per accepted connection.
pub trait TunnelOpener: Send + Sync + 'static {
    type Stream: TunnelStream + 'static;

    fn open_tunnel(
        &self,
        key: &SessionKey,
    ) -> impl Future<Output = Result<Self::Stream, TunnelError>> + Send;
}

impl<T: TunnelOpener> TunnelOpener for Arc<T> {
    type Stream = T::Stream;

    fn open_tunnel(
        &self,
        key: &SessionKey,
    ) -> impl Future<Output = Result<Self::Stream, TunnelError>> + Send {
        self.as_ref().open_tunnel(key)
    }
}

// Opens port-forward streams through the Kubernetes API, with one client per kubeconfig context.
#[derive(Default)]
pub struct KubeTunnelOpener {
    clients: DashMap<String, Client, ahash::RandomState>,
}

impl KubeTunnelOpener {
    pub fn new() -> Self {
        Self::default()
    }

    async fn client(&self, context: &str) -> Result<Client, TunnelError> {
        if let Some(client) = self.clients.get(context) {
            return Ok(client.clone());
        }
        let options = KubeConfigOptions {
            context: Some(context.to_owned()),
            ..Default::default()
        };
        let config = Config::from_kubeconfig(&options)
            .await
            .map_err(|source| TunnelError::Kubeconfig {
                context: context.to_owned(),
                source,
            })?;
        let client = Client::try_from(config).map_err(|source| TunnelError::Client {
            context: context.to_owned(),
            source,
        })?;
        debug!(%context, "Created Kubernetes client.");
        // Another task may have raced us here; either client is fine.
        Ok(self
            .clients
            .entry(context.to_owned())
            .or_insert(client)
            .clone())
    }
}

impl TunnelOpener for KubeTunnelOpener {
    type Stream = Box<dyn TunnelStream>;

    async fn open_tunnel(&self, key: &SessionKey) -> Result<Self::Stream, TunnelError> {
        let client = self.client(&key.context).await?;
        let pods: Api<Pod> = Api::namespaced(client, &key.namespace);
        let mut forwarder = pods
            .portforward(&key.pod, &[key.remote_port])
            .await
            .map_err(|source| TunnelError::PortForward {
                target: key.to_string(),
                source,
            })?;
        let Some(stream) = forwarder.take_stream(key.remote_port) else {
            return Err(TunnelError::MissingStream(key.to_string()));
        };
        let target = key.to_string();
        // The forwarder's background task lives until the stream is closed.
        tokio::spawn(async move {
            if let Err(error) = forwarder.join().await {
                warn!(%target, %error, "Port-forward finished with error.");
            }
        });
        Ok(Box::new(stream))
    }
}

// Test double that "tunnels" to a local address, or fails when unreachable.
#[cfg(test)]
pub(crate) struct MockTunnelOpener {
    target: std::sync::RwLock<Option<std::net::SocketAddr>>,
    calls: std::sync::atomic::AtomicUsize,
    // When set, each tunnel waits for a permit before connecting.
    gate: Option<std::sync::Arc<tokio::sync::Semaphore>>,
}

#[cfg(test)]
impl MockTunnelOpener {
    pub(crate) fn reachable(target: std::net::SocketAddr) -> Self {
        MockTunnelOpener {
            target: std::sync::RwLock::new(Some(target)),
            calls: Default::default(),
            gate: None,
        }
    }

    pub(crate) fn gated(
        target: std::net::SocketAddr,
        gate: std::sync::Arc<tokio::sync::Semaphore>,
    ) -> Self {
        MockTunnelOpener {
            gate: Some(gate),
            ..MockTunnelOpener::reachable(target)
        }
    }

    pub(crate) fn unreachable() -> Self {
        MockTunnelOpener {
            target: std::sync::RwLock::new(None),
            calls: Default::default(),
            gate: None,
        }
    }

    pub(crate) fn set_target(&self, target: Option<std::net::SocketAddr>) {
        *self.target.write().unwrap() = target;
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
impl TunnelOpener for MockTunnelOpener {
    type Stream = tokio::net::TcpStream;

    async fn open_tunnel(&self, key: &SessionKey) -> Result<Self::Stream, TunnelError> {
        self.calls
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let _permit = match self.gate.as_ref() {
            Some(gate) => Some(gate.acquire().await.unwrap()),
            None => None,
        };
        let target = *self.target.read().unwrap();
        match target {
            Some(address) => Ok(tokio::net::TcpStream::connect(address).await?),
            None => Err(TunnelError::MissingStream(key.to_string())),
        }
    }
}

// Spawn a TCP echo server on a random local port.
#[cfg(test)]
pub(crate) async fn spawn_echo_server() -> (std::net::SocketAddr, tokio::task::JoinHandle<()>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    (address, handle)
}
